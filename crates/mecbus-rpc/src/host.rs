//! Service host: the in-process side of a running service.
//!
//! A host owns the class table (factories and method tables), the
//! instance table (integer handles to live objects) and the visitor
//! records tracking which connection touched which instance. Wire
//! requests reach it through the RPC dispatcher; local bindings call
//! straight into the same entry points without any wire traffic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use mecbus_core::{EventLoop, EventKind, Package};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, RpcError};
use crate::proto::{
    DirectoryReply, DirectoryRequest, DirectoryRequestKind, DirectoryStatus, InvokeAction,
    InvokeReply, InvokeReplyType, InvokeRequest, ServiceDescriptor, SingletonType,
    StartServiceReply, StartServiceRequest, SERVER_REPLY, SERVER_REQUEST,
};
use crate::service::{InstanceFactory, MethodHandler, ServiceLifecycle, ServiceObject, ServiceState};

/// Directory registration round trips tolerate a slow server start.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

struct ClassNode {
    factory: InstanceFactory,
    singleton: bool,
    methods: HashMap<Uuid, MethodHandler>,
}

struct InstanceNode {
    class_name: String,
    refcount: u32,
    keep: bool,
    object: Arc<dyn ServiceObject>,
}

#[derive(Default)]
struct InstanceTable {
    next_id: u64,
    by_id: HashMap<u64, InstanceNode>,
    singleton_by_class: HashMap<String, u64>,
}

impl InstanceTable {
    fn allocate(&mut self, class_name: &str, object: Arc<dyn ServiceObject>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.by_id.insert(
            id,
            InstanceNode {
                class_name: class_name.to_string(),
                refcount: 0,
                keep: false,
                object,
            },
        );
        id
    }
}

struct HostInner {
    evloop: EventLoop,
    descriptor: Mutex<ServiceDescriptor>,
    lifecycle: Mutex<Option<Arc<dyn ServiceLifecycle>>>,
    state: Mutex<ServiceState>,
    classes: Mutex<HashMap<String, ClassNode>>,
    instances: Mutex<InstanceTable>,
    /// Instance ids each caller connection has touched.
    visitors: Mutex<HashMap<u64, HashSet<u64>>>,
    /// DeviceOnly policy: the one connection currently holding us.
    bound_conn: Mutex<Option<u64>>,
}

/// Shared handle to one hosted service.
#[derive(Clone)]
pub struct RpcHost {
    inner: Arc<HostInner>,
}

impl RpcHost {
    pub fn new(evloop: EventLoop, descriptor: ServiceDescriptor) -> Self {
        Self {
            inner: Arc::new(HostInner {
                evloop,
                descriptor: Mutex::new(descriptor),
                lifecycle: Mutex::new(None),
                state: Mutex::new(ServiceState::Created),
                classes: Mutex::new(HashMap::new()),
                instances: Mutex::new(InstanceTable::default()),
                visitors: Mutex::new(HashMap::new()),
                bound_conn: Mutex::new(None),
            }),
        }
    }

    pub fn set_lifecycle(&self, lifecycle: Arc<dyn ServiceLifecycle>) {
        *self.inner.lifecycle.lock().expect("lifecycle poisoned") = Some(lifecycle);
    }

    pub fn descriptor(&self) -> ServiceDescriptor {
        self.inner.descriptor.lock().expect("descriptor poisoned").clone()
    }

    pub fn service_id(&self) -> u32 {
        self.descriptor().service_id
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock().expect("state poisoned")
    }

    fn set_state(&self, state: ServiceState) {
        *self.inner.state.lock().expect("state poisoned") = state;
    }

    /// Register a class with its factory. Duplicate class names are
    /// rejected.
    pub fn register_interface(
        &self,
        class_name: &str,
        factory: InstanceFactory,
        singleton: bool,
    ) -> Result<()> {
        let mut classes = self.inner.classes.lock().expect("classes poisoned");
        if classes.contains_key(class_name) {
            return Err(RpcError::AlreadyExists(class_name.to_string()));
        }
        classes.insert(
            class_name.to_string(),
            ClassNode {
                factory,
                singleton,
                methods: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Register a method on a class. Duplicate uuids are rejected.
    pub fn add_method(&self, class_name: &str, method: Uuid, handler: MethodHandler) -> Result<()> {
        let mut classes = self.inner.classes.lock().expect("classes poisoned");
        let node = classes
            .get_mut(class_name)
            .ok_or_else(|| RpcError::NoClass(class_name.to_string()))?;
        if node.methods.contains_key(&method) {
            return Err(RpcError::AlreadyExists(format!("{class_name}::{method}")));
        }
        node.methods.insert(method, handler);
        Ok(())
    }

    /// Bring the service up: lifecycle hooks, then registration with
    /// the directory server. A failure at any step leaves the host in
    /// `Created` so `run` can be retried.
    pub async fn run(&self) -> Result<()> {
        if self.state() != ServiceState::Created {
            return Err(RpcError::AlreadyExists(self.descriptor().service_name));
        }
        self.set_state(ServiceState::Starting);

        let lifecycle = self.inner.lifecycle.lock().expect("lifecycle poisoned").clone();
        if let Some(lc) = &lifecycle {
            if let Err(e) = lc.on_create().await {
                self.set_state(ServiceState::Created);
                return Err(e);
            }
            if let Err(e) = lc.on_start().await {
                self.set_state(ServiceState::Created);
                return Err(e);
            }
        }

        let request = DirectoryRequest {
            request: DirectoryRequestKind::StartService,
            service: self.descriptor(),
        };
        let reply = match self.directory_call(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.set_state(ServiceState::Created);
                return Err(e);
            }
        };
        let Some(service) = reply.service.filter(|_| reply.status == DirectoryStatus::Ok) else {
            self.set_state(ServiceState::Created);
            return Err(RpcError::ServerNotReady);
        };
        *self.inner.descriptor.lock().expect("descriptor poisoned") = service;

        self.set_state(ServiceState::Running);
        let descriptor = self.descriptor();
        info!(
            service = %descriptor.service_name,
            id = descriptor.service_id,
            "service running"
        );
        Ok(())
    }

    /// Withdraw the service: stop hook, best-effort deregistration.
    pub async fn stop(&self) -> Result<()> {
        if self.state() != ServiceState::Running {
            return Err(RpcError::ServiceNotReady);
        }
        self.set_state(ServiceState::Stopping);
        let lifecycle = self.inner.lifecycle.lock().expect("lifecycle poisoned").clone();
        if let Some(lc) = &lifecycle {
            lc.on_stop().await?;
        }
        let request = DirectoryRequest {
            request: DirectoryRequestKind::StopService,
            service: self.descriptor(),
        };
        if let Err(e) = self.directory_call(&request).await {
            debug!("deregistration failed: {e}");
        }
        self.set_state(ServiceState::Terminated);
        Ok(())
    }

    /// One poller-blocked request/reply round trip with the directory
    /// server.
    async fn directory_call(&self, request: &DirectoryRequest) -> Result<DirectoryReply> {
        let server = self.inner.evloop.get_client("", "").await?;
        let pkg = Package::new(SERVER_REQUEST, Bytes::from(serde_json::to_vec(request)?));

        let mut poller = self.inner.evloop.new_poller();
        let event = poller.create_event(EventKind::PackageWithSeqId {
            pkg_id: SERVER_REPLY,
            seq_id: pkg.header.seq_id,
        });
        event.submit().map_err(RpcError::Transport)?;
        server.send(&pkg).await?;
        poller
            .poll(REGISTER_TIMEOUT)
            .await
            .map_err(|_| RpcError::Timeout)?;
        let fired = poller
            .get_triggered_event()
            .ok_or(RpcError::ServerNotReady)?;
        let reply: DirectoryReply =
            serde_json::from_slice(&fired.read_output().unwrap_or_default())?;
        Ok(reply)
    }

    /// Handle a client's start-service handshake: readiness plus the
    /// singleton access policy.
    pub fn handle_start_service(
        &self,
        caller_id: u64,
        _req: &StartServiceRequest,
    ) -> StartServiceReply {
        if self.state() != ServiceState::Running {
            return StartServiceReply {
                status: DirectoryStatus::NotReady,
                service_id: 0,
            };
        }
        let descriptor = self.descriptor();
        match descriptor.singleton {
            // Globally singleton services are never bound directly.
            SingletonType::Globally => {
                return StartServiceReply {
                    status: DirectoryStatus::Rejected,
                    service_id: 0,
                };
            }
            SingletonType::DeviceOnly => {
                let mut bound = self.inner.bound_conn.lock().expect("bound poisoned");
                match *bound {
                    Some(holder) if holder != caller_id => {
                        return StartServiceReply {
                            status: DirectoryStatus::Rejected,
                            service_id: 0,
                        };
                    }
                    _ => *bound = Some(caller_id),
                }
            }
            SingletonType::None => {}
        }
        StartServiceReply {
            status: DirectoryStatus::Ok,
            service_id: descriptor.service_id,
        }
    }

    /// Handle one invoke request on behalf of a caller connection.
    /// Local bindings call this directly with their pseudo caller id.
    pub fn handle_invoke(&self, caller_id: u64, req: &InvokeRequest) -> InvokeReply {
        if self.state() != ServiceState::Running {
            return InvokeReply::failure(
                req.action,
                InvokeReplyType::NoService,
                "service not running".to_string(),
            );
        }
        match req.action {
            InvokeAction::Destroy => self.handle_destroy(caller_id, req),
            InvokeAction::GetInstance | InvokeAction::GetSingleton => {
                match self.resolve_instance(caller_id, req) {
                    Ok((id, _)) => InvokeReply::success(req.action, id, Vec::new()),
                    Err((reply_type, message)) => {
                        InvokeReply::failure(req.action, reply_type, message)
                    }
                }
            }
            InvokeAction::CallMethod => {
                let (instance_id, object) = match self.resolve_instance(caller_id, req) {
                    Ok(found) => found,
                    Err((reply_type, message)) => {
                        return InvokeReply::failure(req.action, reply_type, message)
                    }
                };
                let Some(method) = req.method_uuid else {
                    return InvokeReply::failure(
                        req.action,
                        InvokeReplyType::PackageError,
                        "missing method uuid".to_string(),
                    );
                };
                let handler = {
                    let classes = self.inner.classes.lock().expect("classes poisoned");
                    classes
                        .get(&req.class_name)
                        .and_then(|node| node.methods.get(&method).cloned())
                };
                let Some(handler) = handler else {
                    return InvokeReply::failure(
                        req.action,
                        InvokeReplyType::NoMethod,
                        format!("{}::{}", req.class_name, method),
                    );
                };
                match handler(object, Bytes::from(req.payload.clone())) {
                    Ok(result) => {
                        InvokeReply::success(req.action, instance_id, result.to_vec())
                    }
                    Err(e) => {
                        warn!(class = %req.class_name, "method handler failed: {e}");
                        InvokeReply::failure(req.action, e.reply_type(), e.to_string())
                    }
                }
            }
        }
    }

    /// Resolve (or create) the target instance and record the visit.
    fn resolve_instance(
        &self,
        caller_id: u64,
        req: &InvokeRequest,
    ) -> std::result::Result<(u64, Arc<dyn ServiceObject>), (InvokeReplyType, String)> {
        let (factory, singleton) = {
            let classes = self.inner.classes.lock().expect("classes poisoned");
            let Some(node) = classes.get(&req.class_name) else {
                return Err((InvokeReplyType::NoClass, req.class_name.clone()));
            };
            (node.factory.clone(), node.singleton)
        };
        if req.action == InvokeAction::GetSingleton && !singleton {
            return Err((
                InvokeReplyType::GetInstanceParamError,
                format!("{} is not a singleton class", req.class_name),
            ));
        }

        // Fast path: an explicit live id.
        if req.instance_id != 0 {
            let instances = self.inner.instances.lock().expect("instances poisoned");
            match instances.by_id.get(&req.instance_id) {
                Some(node) if node.class_name == req.class_name => {
                    let found = (req.instance_id, node.object.clone());
                    drop(instances);
                    self.record_visit(caller_id, found.0);
                    return Ok(found);
                }
                Some(_) => {
                    return Err((
                        InvokeReplyType::InvalidInstanceId,
                        format!("instance {} belongs to another class", req.instance_id),
                    ));
                }
                None if !req.renew => {
                    return Err((
                        InvokeReplyType::NoInstance,
                        format!("instance {}", req.instance_id),
                    ));
                }
                // Stale id with renew set: fall through and recreate.
                None => {}
            }
        }

        if singleton {
            let existing = {
                let instances = self.inner.instances.lock().expect("instances poisoned");
                instances
                    .singleton_by_class
                    .get(&req.class_name)
                    .and_then(|id| instances.by_id.get(id).map(|n| (*id, n.object.clone())))
            };
            if let Some(found) = existing {
                self.record_visit(caller_id, found.0);
                return Ok(found);
            }
        }

        // Build a fresh object outside the instance lock.
        let object = factory(&req.payload).map_err(|e| {
            (
                InvokeReplyType::CannotCreateInstance,
                format!("{}: {e}", req.class_name),
            )
        })?;
        let id = {
            let mut instances = self.inner.instances.lock().expect("instances poisoned");
            if singleton {
                // Another caller may have raced us here.
                if let Some(&id) = instances.singleton_by_class.get(&req.class_name) {
                    id
                } else {
                    let id = instances.allocate(&req.class_name, object.clone());
                    instances.singleton_by_class.insert(req.class_name.clone(), id);
                    id
                }
            } else {
                instances.allocate(&req.class_name, object.clone())
            }
        };
        self.record_visit(caller_id, id);
        let object = {
            let instances = self.inner.instances.lock().expect("instances poisoned");
            instances
                .by_id
                .get(&id)
                .map(|n| n.object.clone())
                .unwrap_or(object)
        };
        Ok((id, object))
    }

    fn handle_destroy(&self, caller_id: u64, req: &InvokeRequest) -> InvokeReply {
        if req.instance_id == 0 {
            return InvokeReply::failure(
                req.action,
                InvokeReplyType::InvalidInstanceId,
                "destroy needs an instance id".to_string(),
            );
        }
        let visited = {
            let mut visitors = self.inner.visitors.lock().expect("visitors poisoned");
            visitors
                .get_mut(&caller_id)
                .map(|set| set.remove(&req.instance_id))
                .unwrap_or(false)
        };
        if visited {
            self.release_visit(req.instance_id);
        }
        InvokeReply::success(req.action, req.instance_id, Vec::new())
    }

    /// Record that a caller touched an instance; the first touch per
    /// caller takes one reference.
    fn record_visit(&self, caller_id: u64, instance_id: u64) {
        let first = {
            let mut visitors = self.inner.visitors.lock().expect("visitors poisoned");
            visitors.entry(caller_id).or_default().insert(instance_id)
        };
        if first {
            let mut instances = self.inner.instances.lock().expect("instances poisoned");
            if let Some(node) = instances.by_id.get_mut(&instance_id) {
                node.refcount += 1;
            }
        }
    }

    /// Drop one reference; reclaim the instance when the last visitor
    /// is gone and it is not pinned.
    fn release_visit(&self, instance_id: u64) {
        let mut instances = self.inner.instances.lock().expect("instances poisoned");
        let remove = match instances.by_id.get_mut(&instance_id) {
            Some(node) => {
                node.refcount = node.refcount.saturating_sub(1);
                node.refcount == 0 && !node.keep
            }
            None => false,
        };
        if remove {
            if let Some(node) = instances.by_id.remove(&instance_id) {
                instances.singleton_by_class.retain(|_, id| *id != instance_id);
                debug!(instance = instance_id, class = %node.class_name, "instance reclaimed");
            }
        }
    }

    /// Pin an instance so it survives its last visitor. Only an
    /// explicit [`release_instance`](Self::release_instance) reclaims
    /// a pinned instance.
    pub fn keep_instance(&self, instance_id: u64) -> Result<()> {
        let mut instances = self.inner.instances.lock().expect("instances poisoned");
        let node = instances
            .by_id
            .get_mut(&instance_id)
            .ok_or(RpcError::InvalidInstanceId(instance_id))?;
        node.keep = true;
        Ok(())
    }

    /// Unpin and, with no visitors left, reclaim an instance.
    pub fn release_instance(&self, instance_id: u64) -> Result<()> {
        let mut instances = self.inner.instances.lock().expect("instances poisoned");
        let node = instances
            .by_id
            .get_mut(&instance_id)
            .ok_or(RpcError::InvalidInstanceId(instance_id))?;
        node.keep = false;
        if node.refcount == 0 {
            instances.by_id.remove(&instance_id);
            instances.singleton_by_class.retain(|_, id| *id != instance_id);
        }
        Ok(())
    }

    /// A caller connection went away: unbind every instance it visited,
    /// exactly once each, and release its references.
    pub fn handle_disconnect(&self, caller_id: u64) {
        let visited = {
            let mut visitors = self.inner.visitors.lock().expect("visitors poisoned");
            visitors.remove(&caller_id)
        };
        let Some(visited) = visited else { return };
        for instance_id in visited {
            let object = {
                let instances = self.inner.instances.lock().expect("instances poisoned");
                instances.by_id.get(&instance_id).map(|n| n.object.clone())
            };
            if let Some(object) = object {
                object.on_unbind();
            }
            self.release_visit(instance_id);
        }
        {
            let mut bound = self.inner.bound_conn.lock().expect("bound poisoned");
            if *bound == Some(caller_id) {
                *bound = None;
            }
        }

        let idle = self
            .inner
            .visitors
            .lock()
            .expect("visitors poisoned")
            .is_empty();
        let descriptor = self.descriptor();
        if idle && !descriptor.shared && self.state() == ServiceState::Running {
            // Tell the directory this non-shared service has gone idle.
            let host = self.clone();
            tokio::spawn(async move {
                let request = DirectoryRequest {
                    request: DirectoryRequestKind::StopService,
                    service: host.descriptor(),
                };
                if let Err(e) = host.directory_call(&request).await {
                    debug!("idle notification failed: {e}");
                }
            });
        }
    }

    /// Number of live instances (test and introspection hook).
    pub fn instance_count(&self) -> usize {
        self.inner.instances.lock().expect("instances poisoned").by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mecbus_core::BusConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        value: Mutex<i64>,
        unbinds: AtomicUsize,
    }

    impl ServiceObject for Counter {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn on_unbind(&self) {
            self.unbinds.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_host() -> (tempfile::TempDir, RpcHost) {
        let dir = tempfile::tempdir().unwrap();
        let evloop = EventLoop::new(BusConfig::with_runtime_dir(dir.path()));
        let host = RpcHost::new(evloop, ServiceDescriptor::new("pkg", "svc", ""));
        // Tests exercise the invoke path directly, without directory
        // registration.
        host.set_state(ServiceState::Running);
        (dir, host)
    }

    fn register_counter(host: &RpcHost, singleton: bool) -> Uuid {
        host.register_interface(
            "Counter",
            Arc::new(|_args| {
                Ok(Arc::new(Counter {
                    value: Mutex::new(0),
                    unbinds: AtomicUsize::new(0),
                }) as Arc<dyn ServiceObject>)
            }),
            singleton,
        )
        .unwrap();
        let add = Uuid::new_v4();
        host.add_method(
            "Counter",
            add,
            Arc::new(|object, payload: Bytes| {
                let counter = object
                    .as_any()
                    .downcast_ref::<Counter>()
                    .ok_or_else(|| RpcError::InvalidParam("wrong object".to_string()))?;
                let delta: i64 = serde_json::from_slice(&payload)?;
                let mut value = counter.value.lock().unwrap();
                *value += delta;
                Ok(Bytes::from(serde_json::to_vec(&*value)?))
            }),
        )
        .unwrap();
        add
    }

    fn invoke_req(action: InvokeAction, instance_id: u64) -> InvokeRequest {
        InvokeRequest {
            action,
            service_id: 1,
            class_name: "Counter".to_string(),
            instance_id,
            renew: false,
            method_uuid: None,
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_class_and_method_rejected() {
        let (_dir, host) = test_host();
        let add = register_counter(&host, false);
        assert!(matches!(
            host.register_interface("Counter", Arc::new(|_| unreachable!()), false),
            Err(RpcError::AlreadyExists(_))
        ));
        assert!(matches!(
            host.add_method("Counter", add, Arc::new(|_, _| Ok(Bytes::new()))),
            Err(RpcError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_unknown_class_is_no_class() {
        let (_dir, host) = test_host();
        let mut req = invoke_req(InvokeAction::GetInstance, 0);
        req.class_name = "Nope".to_string();
        let reply = host.handle_invoke(1, &req);
        assert_eq!(reply.reply_type, InvokeReplyType::NoClass);
    }

    #[tokio::test]
    async fn test_get_instance_then_call_method() {
        let (_dir, host) = test_host();
        let add = register_counter(&host, false);

        let reply = host.handle_invoke(1, &invoke_req(InvokeAction::GetInstance, 0));
        assert_eq!(reply.reply_type, InvokeReplyType::Success);
        let id = reply.instance_id;
        assert_ne!(id, 0);

        let mut call = invoke_req(InvokeAction::CallMethod, id);
        call.method_uuid = Some(add);
        call.payload = serde_json::to_vec(&3i64).unwrap();
        let reply = host.handle_invoke(1, &call);
        assert_eq!(reply.reply_type, InvokeReplyType::Success);
        let value: i64 = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(value, 3);

        // Second call on the same instance accumulates.
        let reply = host.handle_invoke(1, &call);
        let value: i64 = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(value, 6);
    }

    #[tokio::test]
    async fn test_stale_instance_id_without_renew_is_no_instance() {
        let (_dir, host) = test_host();
        register_counter(&host, false);
        let reply = host.handle_invoke(1, &invoke_req(InvokeAction::GetInstance, 999));
        assert_eq!(reply.reply_type, InvokeReplyType::NoInstance);

        let mut req = invoke_req(InvokeAction::GetInstance, 999);
        req.renew = true;
        let reply = host.handle_invoke(1, &req);
        assert_eq!(reply.reply_type, InvokeReplyType::Success);
        assert_ne!(reply.instance_id, 999);
    }

    #[tokio::test]
    async fn test_singleton_collapses_across_callers() {
        let (_dir, host) = test_host();
        register_counter(&host, true);

        let a = host.handle_invoke(1, &invoke_req(InvokeAction::GetSingleton, 0));
        let b = host.handle_invoke(2, &invoke_req(InvokeAction::GetSingleton, 0));
        assert_eq!(a.reply_type, InvokeReplyType::Success);
        assert_eq!(a.instance_id, b.instance_id);
        assert_eq!(host.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_get_singleton_on_plain_class_rejected() {
        let (_dir, host) = test_host();
        register_counter(&host, false);
        let reply = host.handle_invoke(1, &invoke_req(InvokeAction::GetSingleton, 0));
        assert_eq!(reply.reply_type, InvokeReplyType::GetInstanceParamError);
    }

    #[tokio::test]
    async fn test_disconnect_unbinds_once_and_reclaims() {
        let (_dir, host) = test_host();
        let add = register_counter(&host, false);

        let reply = host.handle_invoke(7, &invoke_req(InvokeAction::GetInstance, 0));
        let id = reply.instance_id;
        // Touch the instance again; still one visit record.
        let mut call = invoke_req(InvokeAction::CallMethod, id);
        call.method_uuid = Some(add);
        call.payload = serde_json::to_vec(&1i64).unwrap();
        host.handle_invoke(7, &call);

        let object = {
            let instances = host.inner.instances.lock().unwrap();
            instances.by_id.get(&id).unwrap().object.clone()
        };
        host.handle_disconnect(7);
        let counter = object.as_any().downcast_ref::<Counter>().unwrap();
        assert_eq!(counter.unbinds.load(Ordering::Relaxed), 1);
        assert_eq!(host.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_keep_instance_survives_disconnect() {
        let (_dir, host) = test_host();
        register_counter(&host, false);

        let reply = host.handle_invoke(7, &invoke_req(InvokeAction::GetInstance, 0));
        let id = reply.instance_id;
        host.keep_instance(id).unwrap();
        host.handle_disconnect(7);
        assert_eq!(host.instance_count(), 1);

        host.release_instance(id).unwrap();
        assert_eq!(host.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_globally_singleton_rejects_any_direct_bind() {
        let (_dir, host) = test_host();
        {
            let mut descriptor = host.inner.descriptor.lock().unwrap();
            descriptor.singleton = SingletonType::Globally;
            descriptor.service_id = 5;
        }
        let req = StartServiceRequest {
            package_name: "pkg".to_string(),
            service_name: "svc".to_string(),
            instance_name: String::new(),
        };
        for caller in [1u64, 2, 3] {
            let reply = host.handle_start_service(caller, &req);
            assert_eq!(reply.status, DirectoryStatus::Rejected);
            assert_eq!(reply.service_id, 0);
        }
    }

    #[tokio::test]
    async fn test_device_only_rejects_second_connection() {
        let (_dir, host) = test_host();
        {
            let mut descriptor = host.inner.descriptor.lock().unwrap();
            descriptor.singleton = SingletonType::DeviceOnly;
            descriptor.service_id = 5;
        }
        let req = StartServiceRequest {
            package_name: "pkg".to_string(),
            service_name: "svc".to_string(),
            instance_name: String::new(),
        };
        let first = host.handle_start_service(1, &req);
        assert_eq!(first.status, DirectoryStatus::Ok);
        let second = host.handle_start_service(2, &req);
        assert_eq!(second.status, DirectoryStatus::Rejected);

        // The holder going away frees the slot.
        host.handle_disconnect(1);
        let third = host.handle_start_service(2, &req);
        assert_eq!(third.status, DirectoryStatus::Ok);
    }
}
