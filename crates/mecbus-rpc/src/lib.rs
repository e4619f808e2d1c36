//! mecbus-rpc: service-oriented RPC over the mecbus transport.
//!
//! A process hosts services through an [`RpcManager`]: implementations
//! register class factories and method tables on an [`RpcHost`], which
//! announces itself to the directory server ([`RpcDirectory`], running
//! in the Server-role loop process). Clients resolve a service by name
//! into a [`ServiceBinding`] — local bindings call straight into the
//! host, remote ones go over a direct connection — and work with
//! instances through [`RpcProxy`] handles. [`RpcBridge`] exposes the
//! same wire surface for services implemented outside the in-process
//! class table. For traffic in the other direction, hosts push named
//! events through an [`RpcEventHub`] to clients running an
//! [`RpcEventRouter`].

pub mod bridge;
pub mod client;
pub mod error;
pub mod event;
pub mod host;
pub mod manager;
pub mod proto;
pub mod proxy;
pub mod server;
pub mod service;

pub use bridge::{BridgeCall, BridgeService, RpcBridge};
pub use client::ServiceBinding;
pub use error::{Result, RpcError};
pub use event::{EventHandler, RpcEventHub, RpcEventRouter};
pub use host::RpcHost;
pub use manager::{RpcManager, ServiceFactory};
pub use proto::{
    InvokeAction, InvokeReply, InvokeReplyType, InvokeRequest, ServiceDescriptor, SingletonType,
};
pub use proxy::RpcProxy;
pub use server::RpcDirectory;
pub use service::{
    InstanceFactory, MethodHandler, ServiceLifecycle, ServiceObject, ServiceState,
};
