//! RPC wire messages and package ids.
//!
//! All RPC control traffic travels in packages of one dedicated class
//! id, with JSON payloads. Method argument and return payloads are
//! opaque byte blobs carried through untouched; their schema belongs to
//! the service implementation.

use std::net::Ipv4Addr;

use mecbus_core::make_pkg_id;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Class id of the RPC control packages.
pub const CLSID_RPC_CONTROL: u32 = 2;

/// Client or host talking to the directory server.
pub const SERVER_REQUEST: u32 = make_pkg_id(CLSID_RPC_CONTROL, 1);
pub const SERVER_REPLY: u32 = make_pkg_id(CLSID_RPC_CONTROL, 2);

/// Client binding to a service host.
pub const START_SERVICE_REQUEST: u32 = make_pkg_id(CLSID_RPC_CONTROL, 3);
pub const START_SERVICE_REPLY: u32 = make_pkg_id(CLSID_RPC_CONTROL, 4);

/// Method invocation and instance resolution.
pub const INVOKE_REQUEST: u32 = make_pkg_id(CLSID_RPC_CONTROL, 5);
pub const INVOKE_REPLY: u32 = make_pkg_id(CLSID_RPC_CONTROL, 6);

/// Event subscription management.
pub const EVENT_REQUEST: u32 = make_pkg_id(CLSID_RPC_CONTROL, 7);
pub const EVENT_REPLY: u32 = make_pkg_id(CLSID_RPC_CONTROL, 8);

/// Client telling a host it is done with a service binding.
pub const CLIENT_STOP_REQUEST: u32 = make_pkg_id(CLSID_RPC_CONTROL, 9);
pub const CLIENT_STOP_REPLY: u32 = make_pkg_id(CLSID_RPC_CONTROL, 10);

/// Unsolicited event notification, host to subscriber.
pub const EVENT_NOTIFY: u32 = make_pkg_id(CLSID_RPC_CONTROL, 11);

/// Instance sharing policy of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingletonType {
    /// Every binding may create instances freely.
    #[default]
    None,
    /// One global instance; direct binds are rejected, access goes
    /// through the system container.
    Globally,
    /// One instance per device; only one connection may hold it.
    DeviceOnly,
}

/// Identity and placement of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub package_name: String,
    pub service_name: String,
    pub instance_name: String,
    /// Executable or library implementing the service.
    pub executive: String,
    pub ipv4: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub version: u32,
    /// Assigned by the directory server on registration; 0 = unset.
    pub service_id: u32,
    pub accessible: bool,
    pub shared: bool,
    pub singleton: SingletonType,
}

impl ServiceDescriptor {
    pub fn new(package_name: &str, service_name: &str, instance_name: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            service_name: service_name.to_string(),
            instance_name: instance_name.to_string(),
            shared: true,
            accessible: true,
            ..Default::default()
        }
    }

    pub fn name_key(&self) -> (String, String, String) {
        (
            self.package_name.clone(),
            self.service_name.clone(),
            self.instance_name.clone(),
        )
    }
}

/// What a directory request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryRequestKind {
    /// A host registering its running service.
    StartService,
    /// A host or administrator withdrawing a service.
    StopService,
    /// Forcibly terminate a service record.
    TerminateService,
    /// A client resolving where a service runs.
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryRequest {
    pub request: DirectoryRequestKind,
    pub service: ServiceDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryStatus {
    Ok,
    NoService,
    NotReady,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryReply {
    pub status: DirectoryStatus,
    pub service: Option<ServiceDescriptor>,
    /// Loop identity of the host running the service, for the direct
    /// connection the client opens next.
    pub host_client_name: Option<String>,
    pub host_instance_name: Option<String>,
}

/// Client-to-host service binding handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartServiceRequest {
    pub package_name: String,
    pub service_name: String,
    pub instance_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartServiceReply {
    pub status: DirectoryStatus,
    /// Service id to tag on every later invoke package.
    pub service_id: u32,
}

/// What an invoke request does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeAction {
    CallMethod,
    GetInstance,
    GetSingleton,
    Destroy,
}

/// One invoke round trip, client to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub action: InvokeAction,
    pub service_id: u32,
    pub class_name: String,
    /// 0 means "no instance yet": resolve or create one.
    pub instance_id: u64,
    /// Recreate the instance if the id is stale.
    pub renew: bool,
    pub method_uuid: Option<Uuid>,
    pub payload: Vec<u8>,
}

/// Outcome code of an invoke, as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeReplyType {
    Unknown,
    Success,
    CannotCreateInstance,
    NoInstance,
    NoMethod,
    NoClass,
    NoService,
    GetInstanceParamError,
    InvalidInstanceId,
    PackageError,
    OtherError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeReply {
    pub action: InvokeAction,
    pub reply_type: InvokeReplyType,
    pub instance_id: u64,
    pub payload: Vec<u8>,
    /// Human-readable context for error replies.
    pub message: String,
}

impl InvokeReply {
    pub fn success(action: InvokeAction, instance_id: u64, payload: Vec<u8>) -> Self {
        Self {
            action,
            reply_type: InvokeReplyType::Success,
            instance_id,
            payload,
            message: String::new(),
        }
    }

    pub fn failure(action: InvokeAction, reply_type: InvokeReplyType, message: String) -> Self {
        Self {
            action,
            reply_type,
            instance_id: 0,
            payload: Vec::new(),
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStopRequest {
    pub service_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStopReply {
    pub status: DirectoryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventRequestKind {
    Subscribe,
    Unsubscribe,
}

/// Subscription handshake between a peer and an event hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRequest {
    pub kind: EventRequestKind,
    pub event_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReply {
    pub status: DirectoryStatus,
}

/// One fanned-out event; the payload schema belongs to the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventNotice {
    pub event_name: String,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mecbus_core::{pkg_class_id, pkg_local_id};

    #[test]
    fn test_rpc_package_ids_live_in_their_class() {
        for id in [
            SERVER_REQUEST,
            SERVER_REPLY,
            START_SERVICE_REQUEST,
            START_SERVICE_REPLY,
            INVOKE_REQUEST,
            INVOKE_REPLY,
            EVENT_REQUEST,
            EVENT_REPLY,
            CLIENT_STOP_REQUEST,
            CLIENT_STOP_REPLY,
            EVENT_NOTIFY,
        ] {
            assert_eq!(pkg_class_id(id), CLSID_RPC_CONTROL);
        }
        assert_eq!(pkg_local_id(INVOKE_REQUEST), 5);
        assert_eq!(pkg_local_id(CLIENT_STOP_REPLY), 10);
        assert_eq!(pkg_local_id(EVENT_NOTIFY), 11);
    }

    #[test]
    fn test_invoke_request_json_roundtrip() {
        let req = InvokeRequest {
            action: InvokeAction::CallMethod,
            service_id: 3,
            class_name: "Calc".to_string(),
            instance_id: 17,
            renew: true,
            method_uuid: Some(Uuid::new_v4()),
            payload: vec![1, 2, 3],
        };
        let json = serde_json::to_vec(&req).unwrap();
        let back: InvokeRequest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.class_name, "Calc");
        assert_eq!(back.instance_id, 17);
        assert_eq!(back.method_uuid, req.method_uuid);
    }
}
