//! Directory server: the service registry living in the Server-role
//! loop process.
//!
//! It answers host registrations and client lookups, and nothing else:
//! once a client knows which host runs its service, all RPC traffic
//! flows over the direct connection between them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use mecbus_core::{
    ClientInfo, EvlClient, EventLoop, LoopListener, Package, PackageHeader, PackageListener,
    TriggeredPkgQueue,
};
use tracing::{debug, info, warn};

use crate::error::{Result, RpcError};
use crate::proto::{
    DirectoryReply, DirectoryRequest, DirectoryRequestKind, DirectoryStatus, ServiceDescriptor,
    SERVER_REPLY, SERVER_REQUEST,
};

struct ServiceRecord {
    descriptor: ServiceDescriptor,
    host_client_name: String,
    host_instance_name: String,
    /// False while the descriptor is only pre-registered and no host
    /// has announced itself yet.
    running: bool,
}

struct DirectoryInner {
    services: Mutex<HashMap<(String, String, String), ServiceRecord>>,
    next_service_id: AtomicU32,
}

/// The service directory of one bus.
#[derive(Clone)]
pub struct RpcDirectory {
    inner: Arc<DirectoryInner>,
}

impl RpcDirectory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                services: Mutex::new(HashMap::new()),
                next_service_id: AtomicU32::new(1),
            }),
        }
    }

    /// Hook the directory into a Server-role loop: one package
    /// listener for directory requests, one loop listener to withdraw
    /// services whose host goes away.
    pub fn attach(&self, evloop: &EventLoop) -> Result<()> {
        evloop
            .add_package_listener(
                SERVER_REQUEST,
                Arc::new(DirectoryListener {
                    inner: Arc::downgrade(&self.inner),
                }),
            )
            .map_err(RpcError::Transport)?;
        evloop
            .add_listener(
                "rpc-directory",
                Arc::new(DirectoryLoopListener {
                    inner: Arc::downgrade(&self.inner),
                }),
            )
            .map_err(RpcError::Transport)?;
        Ok(())
    }

    /// Pre-register a service descriptor (normally sourced from
    /// deployment configuration). Clients asking for it before its
    /// host announces get `NotReady` instead of `NoService`.
    pub fn register_service_descriptor(&self, descriptor: ServiceDescriptor) -> Result<()> {
        let key = descriptor.name_key();
        let mut services = self.inner.services.lock().expect("services poisoned");
        if services.contains_key(&key) {
            return Err(RpcError::AlreadyExists(descriptor.service_name));
        }
        services.insert(
            key,
            ServiceRecord {
                descriptor,
                host_client_name: String::new(),
                host_instance_name: String::new(),
                running: false,
            },
        );
        Ok(())
    }

    pub fn service_count(&self) -> usize {
        self.inner.services.lock().expect("services poisoned").len()
    }
}

impl Default for RpcDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryInner {
    fn handle_request(&self, sender: ClientInfo, request: DirectoryRequest) -> DirectoryReply {
        match request.request {
            DirectoryRequestKind::StartService => self.handle_start(sender, request.service),
            DirectoryRequestKind::StopService => self.handle_stop(&request.service),
            DirectoryRequestKind::TerminateService => self.handle_terminate(&request.service),
            DirectoryRequestKind::Client => self.handle_client_lookup(&request.service),
        }
    }

    /// A host announcing its running service. Assigns the service id
    /// on first registration.
    fn handle_start(&self, host: ClientInfo, mut descriptor: ServiceDescriptor) -> DirectoryReply {
        let key = descriptor.name_key();
        let mut services = self.services.lock().expect("services poisoned");
        match services.get_mut(&key) {
            Some(record) => {
                if record.running {
                    return DirectoryReply {
                        status: DirectoryStatus::Rejected,
                        service: None,
                        host_client_name: None,
                        host_instance_name: None,
                    };
                }
                // Keep the pre-registered id stable across restarts.
                if record.descriptor.service_id != 0 {
                    descriptor.service_id = record.descriptor.service_id;
                } else {
                    descriptor.service_id = self.next_service_id.fetch_add(1, Ordering::Relaxed);
                }
                record.descriptor = descriptor.clone();
                record.host_client_name = host.client_name;
                record.host_instance_name = host.instance_name;
                record.running = true;
            }
            None => {
                descriptor.service_id = self.next_service_id.fetch_add(1, Ordering::Relaxed);
                services.insert(
                    key,
                    ServiceRecord {
                        descriptor: descriptor.clone(),
                        host_client_name: host.client_name,
                        host_instance_name: host.instance_name,
                        running: true,
                    },
                );
            }
        }
        info!(
            service = %descriptor.service_name,
            id = descriptor.service_id,
            "service registered"
        );
        DirectoryReply {
            status: DirectoryStatus::Ok,
            service: Some(descriptor),
            host_client_name: None,
            host_instance_name: None,
        }
    }

    fn handle_stop(&self, descriptor: &ServiceDescriptor) -> DirectoryReply {
        let mut services = self.services.lock().expect("services poisoned");
        let status = match services.get_mut(&descriptor.name_key()) {
            Some(record) => {
                record.running = false;
                record.host_client_name.clear();
                record.host_instance_name.clear();
                debug!(service = %descriptor.service_name, "service withdrawn");
                DirectoryStatus::Ok
            }
            None => DirectoryStatus::NoService,
        };
        DirectoryReply {
            status,
            service: None,
            host_client_name: None,
            host_instance_name: None,
        }
    }

    fn handle_terminate(&self, descriptor: &ServiceDescriptor) -> DirectoryReply {
        let mut services = self.services.lock().expect("services poisoned");
        let status = if services.remove(&descriptor.name_key()).is_some() {
            DirectoryStatus::Ok
        } else {
            DirectoryStatus::NoService
        };
        DirectoryReply {
            status,
            service: None,
            host_client_name: None,
            host_instance_name: None,
        }
    }

    fn handle_client_lookup(&self, wanted: &ServiceDescriptor) -> DirectoryReply {
        let services = self.services.lock().expect("services poisoned");
        match services.get(&wanted.name_key()) {
            Some(record) if record.running => DirectoryReply {
                status: DirectoryStatus::Ok,
                service: Some(record.descriptor.clone()),
                host_client_name: Some(record.host_client_name.clone()),
                host_instance_name: Some(record.host_instance_name.clone()),
            },
            Some(_) => DirectoryReply {
                status: DirectoryStatus::NotReady,
                service: None,
                host_client_name: None,
                host_instance_name: None,
            },
            None => DirectoryReply {
                status: DirectoryStatus::NoService,
                service: None,
                host_client_name: None,
                host_instance_name: None,
            },
        }
    }

    /// A host connection went away: withdraw everything it registered.
    fn handle_host_gone(&self, client_name: &str, instance_name: &str) {
        if client_name.is_empty() {
            return;
        }
        let mut services = self.services.lock().expect("services poisoned");
        for record in services.values_mut() {
            if record.running
                && record.host_client_name == client_name
                && record.host_instance_name == instance_name
            {
                record.running = false;
                record.host_client_name.clear();
                record.host_instance_name.clear();
                debug!(service = %record.descriptor.service_name, "host gone, service withdrawn");
            }
        }
    }
}

struct DirectoryListener {
    inner: Weak<DirectoryInner>,
}

#[async_trait]
impl PackageListener for DirectoryListener {
    async fn on_package(
        &self,
        sender: EvlClient,
        header: PackageHeader,
        payload: Bytes,
        _triggered: &TriggeredPkgQueue,
    ) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let request: DirectoryRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed directory request: {e}");
                return false;
            }
        };
        let reply = inner.handle_request(sender.info(), request);
        let payload = match serde_json::to_vec(&reply) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!("cannot encode directory reply: {e}");
                return false;
            }
        };
        let pkg = Package::with_seq_id(SERVER_REPLY, header.seq_id, payload);
        if let Err(e) = sender.send(&pkg).await {
            warn!("cannot send directory reply: {e}");
            return false;
        }
        true
    }
}

struct DirectoryLoopListener {
    inner: Weak<DirectoryInner>,
}

impl LoopListener for DirectoryLoopListener {
    fn disconnected(&self, client: EvlClient) {
        if let Some(inner) = self.inner.upgrade() {
            let info = client.info();
            inner.handle_host_gone(&info.client_name, &info.instance_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mecbus_core::ClientType;

    fn sender_named(name: &str) -> ClientInfo {
        let mut info = ClientInfo::anonymous(ClientType::Client);
        info.client_name = name.to_string();
        info
    }

    #[test]
    fn test_lookup_unknown_service_is_no_service() {
        let directory = RpcDirectory::new();
        let reply = directory
            .inner
            .handle_client_lookup(&ServiceDescriptor::new("pkg", "svc", ""));
        assert_eq!(reply.status, DirectoryStatus::NoService);
    }

    #[test]
    fn test_preregistered_service_is_not_ready_until_host_starts() {
        let directory = RpcDirectory::new();
        let descriptor = ServiceDescriptor::new("pkg", "svc", "");
        directory
            .register_service_descriptor(descriptor.clone())
            .unwrap();

        let reply = directory.inner.handle_client_lookup(&descriptor);
        assert_eq!(reply.status, DirectoryStatus::NotReady);

        let host = sender_named("host-proc");
        let started = directory.inner.handle_start(host, descriptor.clone());
        assert_eq!(started.status, DirectoryStatus::Ok);
        let assigned = started.service.unwrap().service_id;
        assert_ne!(assigned, 0);

        let reply = directory.inner.handle_client_lookup(&descriptor);
        assert_eq!(reply.status, DirectoryStatus::Ok);
        assert_eq!(reply.host_client_name.as_deref(), Some("host-proc"));
        assert_eq!(reply.service.unwrap().service_id, assigned);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let directory = RpcDirectory::new();
        let descriptor = ServiceDescriptor::new("pkg", "svc", "");
        let host = sender_named("a");
        directory.inner.handle_start(host, descriptor.clone());
        let second = directory.inner.handle_start(sender_named("b"), descriptor);
        assert_eq!(second.status, DirectoryStatus::Rejected);
    }

    #[test]
    fn test_host_disconnect_withdraws_services() {
        let directory = RpcDirectory::new();
        let descriptor = ServiceDescriptor::new("pkg", "svc", "");
        let host = sender_named("host-proc");
        directory.inner.handle_start(host, descriptor.clone());

        directory.inner.handle_host_gone("host-proc", "");
        let reply = directory.inner.handle_client_lookup(&descriptor);
        assert_eq!(reply.status, DirectoryStatus::NotReady);
    }
}
