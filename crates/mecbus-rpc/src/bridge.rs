//! Bridge: a wire-facing service whose dispatch is delegated to an
//! external implementation instead of the in-process class table.
//!
//! A bridge speaks the same protocol as a host (start-service
//! handshake, invoke dispatch, directory registration, per-connection
//! instance tracking), but every invoke is handed to a
//! [`BridgeService`] object. The implementation may answer inline or
//! keep the call token and answer later through
//! [`RpcBridge::send_reply`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mecbus_core::{EvlClient, EventLoop, Package};
use tracing::{info, warn};

use crate::client::round_trip;
use crate::error::{Result, RpcError};
use crate::proto::{
    DirectoryReply, DirectoryRequest, DirectoryRequestKind, DirectoryStatus, InvokeReply,
    InvokeReplyType, InvokeRequest, ServiceDescriptor, StartServiceReply, StartServiceRequest,
    INVOKE_REPLY, SERVER_REPLY, SERVER_REQUEST,
};
use crate::service::ServiceState;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Token identifying one in-flight bridged call; needed to answer it
/// later through [`RpcBridge::send_reply`].
pub struct BridgeCall {
    pub caller: EvlClient,
    pub seq_id: u32,
}

/// External implementation a bridge delegates to.
#[async_trait]
pub trait BridgeService: Send + Sync {
    /// Handle one invoke. Return `Some(reply)` to answer inline, or
    /// `None` to keep `call` and answer later via `send_reply`.
    async fn on_invoke(
        &self,
        call: BridgeCall,
        request: InvokeRequest,
    ) -> Result<Option<InvokeReply>>;

    /// A caller connection that had touched this bridge went away.
    fn on_unbind(&self, _caller_id: u64) {}
}

struct BridgeInner {
    evloop: EventLoop,
    descriptor: Mutex<ServiceDescriptor>,
    state: Mutex<ServiceState>,
    service: Arc<dyn BridgeService>,
    /// Instance ids each caller connection has touched.
    visitors: Mutex<HashMap<u64, HashSet<u64>>>,
}

/// Shared handle to one bridged service.
#[derive(Clone)]
pub struct RpcBridge {
    inner: Arc<BridgeInner>,
}

impl RpcBridge {
    pub fn new(
        evloop: EventLoop,
        descriptor: ServiceDescriptor,
        service: Arc<dyn BridgeService>,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                evloop,
                descriptor: Mutex::new(descriptor),
                state: Mutex::new(ServiceState::Created),
                service,
                visitors: Mutex::new(HashMap::new()),
            }),
        }
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

    /// Register with the directory server, same round trip as a host.
    pub async fn run(&self) -> Result<()> {
        if self.state() != ServiceState::Created {
            return Err(RpcError::AlreadyExists(self.descriptor().service_name));
        }
        self.set_state(ServiceState::Starting);
        let request = DirectoryRequest {
            request: DirectoryRequestKind::StartService,
            service: self.descriptor(),
        };
        let server = match self.inner.evloop.get_client("", "").await {
            Ok(server) => server,
            Err(e) => {
                self.set_state(ServiceState::Created);
                return Err(e.into());
            }
        };
        let reply: DirectoryReply = match round_trip(
            &self.inner.evloop,
            &server,
            SERVER_REQUEST,
            SERVER_REPLY,
            &request,
            REGISTER_TIMEOUT,
        )
        .await
        {
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
        info!(service = %self.descriptor().service_name, "bridge running");
        Ok(())
    }

    pub fn handle_start_service(
        &self,
        _caller_id: u64,
        _req: &StartServiceRequest,
    ) -> StartServiceReply {
        if self.state() != ServiceState::Running {
            return StartServiceReply {
                status: DirectoryStatus::NotReady,
                service_id: 0,
            };
        }
        StartServiceReply {
            status: DirectoryStatus::Ok,
            service_id: self.descriptor().service_id,
        }
    }

    /// Dispatch one invoke to the bridged implementation. Inline
    /// replies are sent here; deferred replies are the implementation's
    /// responsibility.
    pub async fn handle_invoke(&self, caller: EvlClient, seq_id: u32, request: InvokeRequest) {
        if request.instance_id != 0 {
            self.record_visit(caller.id(), request.instance_id);
        }
        let action = request.action;
        let call = BridgeCall {
            caller: caller.clone(),
            seq_id,
        };
        match self.inner.service.on_invoke(call, request).await {
            Ok(Some(reply)) => {
                if reply.reply_type == InvokeReplyType::Success && reply.instance_id != 0 {
                    self.record_visit(caller.id(), reply.instance_id);
                }
                self.reply_to(&caller, seq_id, &reply).await;
            }
            Ok(None) => {}
            Err(e) => {
                let reply = InvokeReply::failure(action, e.reply_type(), e.to_string());
                self.reply_to(&caller, seq_id, &reply).await;
            }
        }
    }

    /// Answer a previously recorded call.
    pub async fn send_reply(&self, call: &BridgeCall, reply: &InvokeReply) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(reply)?);
        let pkg = Package::with_seq_id(INVOKE_REPLY, call.seq_id, payload);
        call.caller.send(&pkg).await?;
        Ok(())
    }

    async fn reply_to(&self, caller: &EvlClient, seq_id: u32, reply: &InvokeReply) {
        let payload = match serde_json::to_vec(reply) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!("cannot encode bridge reply: {e}");
                return;
            }
        };
        let pkg = Package::with_seq_id(INVOKE_REPLY, seq_id, payload);
        if let Err(e) = caller.send(&pkg).await {
            warn!("cannot send bridge reply: {e}");
        }
    }

    fn record_visit(&self, caller_id: u64, instance_id: u64) {
        let mut visitors = self.inner.visitors.lock().expect("visitors poisoned");
        visitors.entry(caller_id).or_default().insert(instance_id);
    }

    /// A caller connection went away; tell the implementation once.
    pub fn handle_disconnect(&self, caller_id: u64) {
        let had_visits = {
            let mut visitors = self.inner.visitors.lock().expect("visitors poisoned");
            visitors.remove(&caller_id).is_some()
        };
        if had_visits {
            self.inner.service.on_unbind(caller_id);
        }
    }
}
