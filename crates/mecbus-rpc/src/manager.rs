//! RPC manager: the per-process context tying the RPC layer to one
//! event loop.
//!
//! The manager owns the local hosts and bridges, the registered
//! implementation factories, and the dispatcher that routes incoming
//! RPC packages (start-service, invoke, client-stop) to the right host
//! or bridge. There is exactly one manager per loop; it is passed
//! around explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mecbus_core::{
    EvlClient, EventLoop, LoopListener, Package, PackageHeader, PackageListener,
    TriggeredPkgQueue,
};
use tracing::{debug, warn};

use crate::bridge::{BridgeService, RpcBridge};
use crate::client::ServiceBinding;
use crate::error::{Result, RpcError};
use crate::host::RpcHost;
use crate::proto::{
    ClientStopReply, ClientStopRequest, DirectoryReply, DirectoryRequest, DirectoryRequestKind,
    DirectoryStatus, InvokeReply, InvokeReplyType, InvokeRequest, ServiceDescriptor,
    StartServiceReply, StartServiceRequest, CLIENT_STOP_REPLY, CLIENT_STOP_REQUEST, INVOKE_REPLY,
    INVOKE_REQUEST, SERVER_REPLY, SERVER_REQUEST, START_SERVICE_REPLY, START_SERVICE_REQUEST,
};

const DIRECTORY_CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Implementation factory registered for a service, standing in for
/// the executable-loading boundary of a full deployment.
#[derive(Clone)]
pub struct ServiceFactory {
    /// Populates a freshly created host (classes, methods, lifecycle).
    pub create: Arc<dyn Fn(&RpcHost) -> Result<()> + Send + Sync>,
    /// Torn down when the service is stopped or terminated.
    pub destroy: Arc<dyn Fn(&RpcHost) + Send + Sync>,
}

type ServiceKey = (String, String, String);

#[derive(Default)]
struct ManagerState {
    factories: HashMap<(String, String), ServiceFactory>,
    hosts: HashMap<ServiceKey, RpcHost>,
    bridges: HashMap<ServiceKey, RpcBridge>,
}

struct ManagerShared {
    evloop: EventLoop,
    state: Mutex<ManagerState>,
}

impl ManagerShared {
    fn host_by_key(&self, key: &ServiceKey) -> Option<RpcHost> {
        self.state.lock().expect("manager poisoned").hosts.get(key).cloned()
    }

    fn host_by_id(&self, service_id: u32) -> Option<RpcHost> {
        if service_id == 0 {
            return None;
        }
        let state = self.state.lock().expect("manager poisoned");
        state
            .hosts
            .values()
            .find(|h| h.service_id() == service_id)
            .cloned()
    }

    fn bridge_by_key(&self, key: &ServiceKey) -> Option<RpcBridge> {
        self.state.lock().expect("manager poisoned").bridges.get(key).cloned()
    }

    fn bridge_by_id(&self, service_id: u32) -> Option<RpcBridge> {
        if service_id == 0 {
            return None;
        }
        let state = self.state.lock().expect("manager poisoned");
        state
            .bridges
            .values()
            .find(|b| b.service_id() == service_id)
            .cloned()
    }
}

/// The RPC context of one process.
#[derive(Clone)]
pub struct RpcManager {
    shared: Arc<ManagerShared>,
}

impl RpcManager {
    /// Build the manager and hook its dispatcher into the loop.
    pub fn new(evloop: EventLoop) -> Result<Self> {
        let shared = Arc::new(ManagerShared {
            evloop: evloop.clone(),
            state: Mutex::new(ManagerState::default()),
        });
        let dispatcher = Arc::new(RpcDispatcher {
            shared: Arc::downgrade(&shared),
        });
        for pkg_id in [START_SERVICE_REQUEST, INVOKE_REQUEST, CLIENT_STOP_REQUEST] {
            evloop
                .add_package_listener(pkg_id, dispatcher.clone())
                .map_err(RpcError::Transport)?;
        }
        evloop
            .add_listener(
                "rpc-manager",
                Arc::new(ManagerLoopListener {
                    shared: Arc::downgrade(&shared),
                }),
            )
            .map_err(RpcError::Transport)?;
        Ok(Self { shared })
    }

    pub fn evloop(&self) -> &EventLoop {
        &self.shared.evloop
    }

    /// Register the implementation factory for a service.
    pub fn register_service(
        &self,
        package_name: &str,
        service_name: &str,
        factory: ServiceFactory,
    ) -> Result<()> {
        let key = (package_name.to_string(), service_name.to_string());
        let mut state = self.shared.state.lock().expect("manager poisoned");
        if state.factories.contains_key(&key) {
            return Err(RpcError::AlreadyExists(service_name.to_string()));
        }
        state.factories.insert(key, factory);
        Ok(())
    }

    /// Instantiate a host for a service from its registered factory.
    /// The host still needs [`RpcHost::run`] (or
    /// [`start_service`](Self::start_service)) to go live.
    pub fn load_service(&self, descriptor: ServiceDescriptor) -> Result<RpcHost> {
        let factory = {
            let state = self.shared.state.lock().expect("manager poisoned");
            state
                .factories
                .get(&(descriptor.package_name.clone(), descriptor.service_name.clone()))
                .cloned()
                .ok_or_else(|| RpcError::NotFound(descriptor.service_name.clone()))?
        };
        let key = descriptor.name_key();
        let host = RpcHost::new(self.shared.evloop.clone(), descriptor);
        (factory.create)(&host)?;
        let mut state = self.shared.state.lock().expect("manager poisoned");
        if state.hosts.contains_key(&key) {
            return Err(RpcError::AlreadyExists(key.1));
        }
        state.hosts.insert(key, host.clone());
        Ok(host)
    }

    /// Bind to a service: a local host short-circuits, anything else
    /// resolves through the directory server.
    pub async fn get_service(
        &self,
        package_name: &str,
        service_name: &str,
        instance_name: &str,
    ) -> Result<ServiceBinding> {
        let key = (
            package_name.to_string(),
            service_name.to_string(),
            instance_name.to_string(),
        );
        if let Some(host) = self.shared.host_by_key(&key) {
            return Ok(ServiceBinding::local(host));
        }
        ServiceBinding::connect_remote(&self.shared.evloop, package_name, service_name, instance_name)
            .await
    }

    /// Bring a loaded local service live.
    pub async fn start_service(
        &self,
        package_name: &str,
        service_name: &str,
        instance_name: &str,
    ) -> Result<()> {
        let key = (
            package_name.to_string(),
            service_name.to_string(),
            instance_name.to_string(),
        );
        let host = self
            .shared
            .host_by_key(&key)
            .ok_or_else(|| RpcError::NotFound(service_name.to_string()))?;
        host.run().await
    }

    /// Stop a service: the local host when we have one, otherwise an
    /// administrative request to the directory server.
    pub async fn stop_service(
        &self,
        package_name: &str,
        service_name: &str,
        instance_name: &str,
    ) -> Result<()> {
        let key = (
            package_name.to_string(),
            service_name.to_string(),
            instance_name.to_string(),
        );
        if let Some(host) = self.shared.host_by_key(&key) {
            host.stop().await?;
            let factory = {
                let state = self.shared.state.lock().expect("manager poisoned");
                state
                    .factories
                    .get(&(key.0.clone(), key.1.clone()))
                    .cloned()
            };
            if let Some(factory) = factory {
                (factory.destroy)(&host);
            }
            self.shared.state.lock().expect("manager poisoned").hosts.remove(&key);
            return Ok(());
        }
        self.directory_cmd(DirectoryRequestKind::StopService, &key).await
    }

    /// Remove a service record entirely, local or not.
    pub async fn terminate_service(
        &self,
        package_name: &str,
        service_name: &str,
        instance_name: &str,
    ) -> Result<()> {
        let key = (
            package_name.to_string(),
            service_name.to_string(),
            instance_name.to_string(),
        );
        if self.shared.host_by_key(&key).is_some() {
            self.stop_service(package_name, service_name, instance_name)
                .await?;
        }
        self.directory_cmd(DirectoryRequestKind::TerminateService, &key).await
    }

    async fn directory_cmd(&self, request: DirectoryRequestKind, key: &ServiceKey) -> Result<()> {
        let server = self.shared.evloop.get_client("", "").await?;
        let message = DirectoryRequest {
            request,
            service: ServiceDescriptor::new(&key.0, &key.1, &key.2),
        };
        let reply: DirectoryReply = crate::client::round_trip(
            &self.shared.evloop,
            &server,
            SERVER_REQUEST,
            SERVER_REPLY,
            &message,
            DIRECTORY_CMD_TIMEOUT,
        )
        .await?;
        match reply.status {
            DirectoryStatus::Ok => Ok(()),
            DirectoryStatus::NoService => Err(RpcError::NoService),
            _ => Err(RpcError::ServerNotReady),
        }
    }

    /// Instantiate a bridge backed by an external implementation.
    pub fn load_bridge(
        &self,
        descriptor: ServiceDescriptor,
        service: Arc<dyn BridgeService>,
    ) -> Result<RpcBridge> {
        let key = descriptor.name_key();
        let bridge = RpcBridge::new(self.shared.evloop.clone(), descriptor, service);
        let mut state = self.shared.state.lock().expect("manager poisoned");
        if state.bridges.contains_key(&key) {
            return Err(RpcError::AlreadyExists(key.1));
        }
        state.bridges.insert(key, bridge.clone());
        Ok(bridge)
    }

    pub fn get_bridge(
        &self,
        package_name: &str,
        service_name: &str,
        instance_name: &str,
    ) -> Option<RpcBridge> {
        self.shared.bridge_by_key(&(
            package_name.to_string(),
            service_name.to_string(),
            instance_name.to_string(),
        ))
    }
}

/// Routes incoming RPC request packages to hosts and bridges.
struct RpcDispatcher {
    shared: Weak<ManagerShared>,
}

impl RpcDispatcher {
    async fn send_json<T: serde::Serialize>(
        sender: &EvlClient,
        pkg_id: u32,
        seq_id: u32,
        message: &T,
    ) {
        let payload = match serde_json::to_vec(message) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!("cannot encode rpc reply: {e}");
                return;
            }
        };
        let pkg = Package::with_seq_id(pkg_id, seq_id, payload);
        if let Err(e) = sender.send(&pkg).await {
            debug!("cannot send rpc reply: {e}");
        }
    }

    async fn on_start_service(
        &self,
        shared: &ManagerShared,
        sender: EvlClient,
        header: PackageHeader,
        payload: Bytes,
    ) {
        let request: StartServiceRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed start-service request: {e}");
                return;
            }
        };
        let key = (
            request.package_name.clone(),
            request.service_name.clone(),
            request.instance_name.clone(),
        );
        let reply = if let Some(host) = shared.host_by_key(&key) {
            host.handle_start_service(sender.id(), &request)
        } else if let Some(bridge) = shared.bridge_by_key(&key) {
            bridge.handle_start_service(sender.id(), &request)
        } else {
            StartServiceReply {
                status: DirectoryStatus::NoService,
                service_id: 0,
            }
        };
        Self::send_json(&sender, START_SERVICE_REPLY, header.seq_id, &reply).await;
    }

    async fn on_invoke(
        &self,
        shared: &ManagerShared,
        sender: EvlClient,
        header: PackageHeader,
        payload: Bytes,
    ) {
        let request: InvokeRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed invoke request: {e}");
                return;
            }
        };
        if let Some(host) = shared.host_by_id(request.service_id) {
            let reply = host.handle_invoke(sender.id(), &request);
            Self::send_json(&sender, INVOKE_REPLY, header.seq_id, &reply).await;
        } else if let Some(bridge) = shared.bridge_by_id(request.service_id) {
            bridge.handle_invoke(sender, header.seq_id, request).await;
        } else {
            let reply = InvokeReply::failure(
                request.action,
                InvokeReplyType::NoService,
                format!("service id {}", request.service_id),
            );
            Self::send_json(&sender, INVOKE_REPLY, header.seq_id, &reply).await;
        }
    }

    async fn on_client_stop(
        &self,
        shared: &ManagerShared,
        sender: EvlClient,
        header: PackageHeader,
        payload: Bytes,
    ) {
        let request: ClientStopRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed client-stop request: {e}");
                return;
            }
        };
        let status = if let Some(host) = shared.host_by_id(request.service_id) {
            host.handle_disconnect(sender.id());
            DirectoryStatus::Ok
        } else if let Some(bridge) = shared.bridge_by_id(request.service_id) {
            bridge.handle_disconnect(sender.id());
            DirectoryStatus::Ok
        } else {
            DirectoryStatus::NoService
        };
        Self::send_json(&sender, CLIENT_STOP_REPLY, header.seq_id, &ClientStopReply { status })
            .await;
    }
}

#[async_trait]
impl PackageListener for RpcDispatcher {
    async fn on_package(
        &self,
        sender: EvlClient,
        header: PackageHeader,
        payload: Bytes,
        _triggered: &TriggeredPkgQueue,
    ) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        match header.pkg_id {
            START_SERVICE_REQUEST => {
                self.on_start_service(&shared, sender, header, payload).await
            }
            INVOKE_REQUEST => self.on_invoke(&shared, sender, header, payload).await,
            CLIENT_STOP_REQUEST => self.on_client_stop(&shared, sender, header, payload).await,
            _ => return false,
        }
        true
    }
}

/// Propagates connection teardown into every host and bridge.
struct ManagerLoopListener {
    shared: Weak<ManagerShared>,
}

impl LoopListener for ManagerLoopListener {
    fn disconnected(&self, client: EvlClient) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let (hosts, bridges) = {
            let state = shared.state.lock().expect("manager poisoned");
            (
                state.hosts.values().cloned().collect::<Vec<_>>(),
                state.bridges.values().cloned().collect::<Vec<_>>(),
            )
        };
        for host in hosts {
            host.handle_disconnect(client.id());
        }
        for bridge in bridges {
            bridge.handle_disconnect(client.id());
        }
    }
}
