//! Client side of a service: resolving where the service runs and
//! holding the binding every call goes through.
//!
//! A binding is either *local* (the service is hosted in this process;
//! calls short-circuit into the host without wire traffic) or *remote*
//! (calls are serialized, correlated by sequence id through a poller,
//! and sent over the direct connection to the host process).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use mecbus_core::{EvlClient, EventKind, EventLoop, Package};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, RpcError};
use crate::host::RpcHost;
use crate::proto::{
    DirectoryReply, DirectoryRequest, DirectoryRequestKind, DirectoryStatus, InvokeAction,
    InvokeReply, InvokeReplyType, InvokeRequest, ServiceDescriptor, StartServiceReply,
    StartServiceRequest, INVOKE_REPLY, INVOKE_REQUEST, SERVER_REPLY, SERVER_REQUEST,
    START_SERVICE_REPLY, START_SERVICE_REQUEST,
};
use crate::proxy::{ProxyNode, RpcProxy};

const INVOKE_TIMEOUT: Duration = Duration::from_secs(5);
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Local caller ids live far above the connection-entry id range so
/// the two can share the host's visitor table.
static NEXT_LOCAL_CALLER: AtomicU64 = AtomicU64::new(1 << 32);

pub(crate) enum BindingTarget {
    Local {
        host: RpcHost,
        caller_id: u64,
    },
    Remote {
        evloop: EventLoop,
        conn: EvlClient,
        service_id: u32,
    },
}

pub(crate) struct BindingInner {
    target: BindingTarget,
    /// Proxy nodes this binding handed out, keyed by class + instance.
    proxies: Mutex<HashMap<(String, u64), Weak<ProxyNode>>>,
}

impl BindingInner {
    /// One invoke round trip, local or remote.
    async fn invoke_raw(&self, mut req: InvokeRequest) -> Result<InvokeReply> {
        match &self.target {
            BindingTarget::Local { host, caller_id } => Ok(host.handle_invoke(*caller_id, &req)),
            BindingTarget::Remote {
                evloop,
                conn,
                service_id,
            } => {
                req.service_id = *service_id;
                round_trip(evloop, conn, INVOKE_REQUEST, INVOKE_REPLY, &req, INVOKE_TIMEOUT)
                    .await
            }
        }
    }

    /// Invoke and surface error reply codes as typed errors.
    async fn invoke_checked(&self, req: InvokeRequest) -> Result<InvokeReply> {
        let context = req.class_name.clone();
        let reply = self.invoke_raw(req).await?;
        if reply.reply_type != InvokeReplyType::Success {
            let detail = if reply.message.is_empty() {
                context
            } else {
                reply.message.clone()
            };
            return Err(
                RpcError::from_reply_type(reply.reply_type, &detail)
                    .unwrap_or(RpcError::PackageError),
            );
        }
        Ok(reply)
    }

    pub(crate) async fn call_method(
        &self,
        class_name: &str,
        instance_id: u64,
        renew: bool,
        method: Uuid,
        payload: Bytes,
    ) -> Result<Bytes> {
        let reply = self
            .invoke_checked(InvokeRequest {
                action: InvokeAction::CallMethod,
                service_id: 0,
                class_name: class_name.to_string(),
                instance_id,
                renew,
                method_uuid: Some(method),
                payload: payload.to_vec(),
            })
            .await?;
        Ok(Bytes::from(reply.payload))
    }

    /// Best-effort destroy notification when a proxy node drops.
    pub(crate) fn notify_destroy(&self, class_name: &str, instance_id: u64) {
        let req = InvokeRequest {
            action: InvokeAction::Destroy,
            service_id: 0,
            class_name: class_name.to_string(),
            instance_id,
            renew: false,
            method_uuid: None,
            payload: Vec::new(),
        };
        match &self.target {
            BindingTarget::Local { host, caller_id } => {
                let _ = host.handle_invoke(*caller_id, &req);
            }
            BindingTarget::Remote {
                evloop,
                conn,
                service_id,
            } => {
                let mut req = req;
                req.service_id = *service_id;
                let evloop = evloop.clone();
                let conn = conn.clone();
                // Fire-and-forget; outside a runtime the notification
                // is silently skipped.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Ok(payload) = serde_json::to_vec(&req) {
                            let pkg = Package::new(INVOKE_REQUEST, Bytes::from(payload));
                            let _ = evloop.send(&conn, &pkg, INVOKE_TIMEOUT).await;
                        }
                    });
                }
            }
        }
    }
}

/// A resolved binding to one service.
#[derive(Clone)]
pub struct ServiceBinding {
    inner: Arc<BindingInner>,
}

impl std::fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBinding").finish_non_exhaustive()
    }
}

impl ServiceBinding {
    pub(crate) fn local(host: RpcHost) -> Self {
        Self {
            inner: Arc::new(BindingInner {
                target: BindingTarget::Local {
                    host,
                    caller_id: NEXT_LOCAL_CALLER.fetch_add(1, Ordering::Relaxed),
                },
                proxies: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve the service through the directory server and perform
    /// the start-service handshake with its host.
    pub(crate) async fn connect_remote(
        evloop: &EventLoop,
        package_name: &str,
        service_name: &str,
        instance_name: &str,
    ) -> Result<Self> {
        let request = DirectoryRequest {
            request: DirectoryRequestKind::Client,
            service: ServiceDescriptor::new(package_name, service_name, instance_name),
        };
        let server = evloop.get_client("", "").await?;
        let reply: DirectoryReply = round_trip(
            evloop,
            &server,
            SERVER_REQUEST,
            SERVER_REPLY,
            &request,
            RESOLVE_TIMEOUT,
        )
        .await?;
        if reply.status != DirectoryStatus::Ok {
            return Err(RpcError::NoService);
        }
        let (host_name, host_inst) = match (reply.host_client_name, reply.host_instance_name) {
            (Some(name), Some(inst)) => (name, inst),
            _ => return Err(RpcError::NoService),
        };

        let conn = evloop.get_client(&host_name, &host_inst).await?;
        let handshake = StartServiceRequest {
            package_name: package_name.to_string(),
            service_name: service_name.to_string(),
            instance_name: instance_name.to_string(),
        };
        let started: StartServiceReply = round_trip(
            evloop,
            &conn,
            START_SERVICE_REQUEST,
            START_SERVICE_REPLY,
            &handshake,
            RESOLVE_TIMEOUT,
        )
        .await?;
        match started.status {
            DirectoryStatus::Ok => {}
            DirectoryStatus::NotReady => return Err(RpcError::ServiceNotReady),
            _ => return Err(RpcError::NoService),
        }
        debug!(
            service = service_name,
            id = started.service_id,
            host = %host_name,
            "service bound"
        );
        Ok(Self {
            inner: Arc::new(BindingInner {
                target: BindingTarget::Remote {
                    evloop: evloop.clone(),
                    conn,
                    service_id: started.service_id,
                },
                proxies: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self.inner.target, BindingTarget::Local { .. })
    }

    /// Resolve (or create) an instance of `class_name` and return a
    /// proxy for it.
    pub async fn get_instance(&self, class_name: &str, params: &[u8]) -> Result<RpcProxy> {
        let reply = self
            .inner
            .invoke_checked(InvokeRequest {
                action: InvokeAction::GetInstance,
                service_id: 0,
                class_name: class_name.to_string(),
                instance_id: 0,
                renew: false,
                method_uuid: None,
                payload: params.to_vec(),
            })
            .await?;
        Ok(self.proxy_for(class_name, reply.instance_id))
    }

    /// Resolve the singleton instance of `class_name`.
    pub async fn get_singleton(&self, class_name: &str) -> Result<RpcProxy> {
        let reply = self
            .inner
            .invoke_checked(InvokeRequest {
                action: InvokeAction::GetSingleton,
                service_id: 0,
                class_name: class_name.to_string(),
                instance_id: 0,
                renew: false,
                method_uuid: None,
                payload: Vec::new(),
            })
            .await?;
        Ok(self.proxy_for(class_name, reply.instance_id))
    }

    /// Tell the host this client is done with the service binding.
    pub async fn stop(&self) -> Result<()> {
        if let BindingTarget::Remote {
            evloop,
            conn,
            service_id,
        } = &self.inner.target
        {
            let request = crate::proto::ClientStopRequest {
                service_id: *service_id,
            };
            let _: crate::proto::ClientStopReply = round_trip(
                evloop,
                conn,
                crate::proto::CLIENT_STOP_REQUEST,
                crate::proto::CLIENT_STOP_REPLY,
                &request,
                RESOLVE_TIMEOUT,
            )
            .await?;
        }
        Ok(())
    }

    /// Find or create the proxy node for a resolved instance, so
    /// repeated resolves share one node.
    fn proxy_for(&self, class_name: &str, instance_id: u64) -> RpcProxy {
        let key = (class_name.to_string(), instance_id);
        let mut proxies = self.inner.proxies.lock().expect("proxy table poisoned");
        if let Some(node) = proxies.get(&key).and_then(Weak::upgrade) {
            return RpcProxy::from_node(node);
        }
        let node = Arc::new(ProxyNode::new(
            self.inner.clone(),
            class_name.to_string(),
            instance_id,
        ));
        proxies.insert(key, Arc::downgrade(&node));
        RpcProxy::from_node(node)
    }
}

/// Serialize a request, wait for the matching reply package and
/// deserialize it.
pub(crate) async fn round_trip<Req, Reply>(
    evloop: &EventLoop,
    conn: &EvlClient,
    request_pkg: u32,
    reply_pkg: u32,
    request: &Req,
    timeout: Duration,
) -> Result<Reply>
where
    Req: serde::Serialize,
    Reply: serde::de::DeserializeOwned,
{
    let pkg = Package::new(request_pkg, Bytes::from(serde_json::to_vec(request)?));
    let mut poller = evloop.new_poller();
    let event = poller.create_event(EventKind::PackageWithSeqId {
        pkg_id: reply_pkg,
        seq_id: pkg.header.seq_id,
    });
    event.submit().map_err(RpcError::Transport)?;
    conn.send(&pkg).await?;
    poller.poll(timeout).await.map_err(|e| match e {
        mecbus_core::BusError::Timeout(_) => RpcError::Timeout,
        other => RpcError::Transport(other),
    })?;
    let fired = poller
        .get_triggered_event()
        .ok_or(RpcError::PackageError)?;
    let reply = serde_json::from_slice(&fired.read_output().unwrap_or_default())?;
    Ok(reply)
}
