//! mecbus-core: single-host IPC transport.
//!
//! A process constructs one [`EventLoop`], gives it a role (the
//! directory-server process takes [`LoopRole::Server`], everything else
//! [`LoopRole::Client`]) and starts it. The loop owns all sockets,
//! timers and the task queue; incoming bytes are decoded into framed
//! packages and dispatched by package id. Synchronous call-and-reply on
//! top of the asynchronous stream is provided by [`Poller`], which
//! correlates replies by sequence id.
//!
//! Peers find each other by `(client_name, instance_name)` through the
//! directory server, then exchange packages over a direct connection.

pub mod bytequeue;
pub mod client;
pub mod config;
pub mod error;
pub mod evloop;
pub mod package;
pub mod pkglistener;
pub mod poller;
pub mod registry;

pub use client::{ClientFlags, ClientInfo, ClientType, EvlClient};
pub use config::{BusConfig, BusLimits};
pub use error::{BusError, Result};
pub use evloop::{EventLoop, LoopListener, LoopRole, LoopState, LoopTask, TimerHandle};
pub use package::{
    make_pkg_id, next_seq_id, pkg_class_id, pkg_local_id, FrameDecoder, Package, PackageHeader,
};
pub use pkglistener::{PackageListener, PackageListenerRegistry, TriggeredPkgQueue};
pub use poller::{EventKind, Poller, PollerEvent};
pub use registry::ClientRegistry;
