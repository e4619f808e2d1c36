//! The event loop (reactor): owns every socket, timer and task queue of
//! a process, decodes the package stream of each connection and
//! dispatches packages to built-in control handlers or the package
//! listener registry.
//!
//! One `EventLoop` is constructed explicitly at process start and
//! injected wherever it is needed; there is no global instance. The
//! loop's work runs as tokio tasks on the ambient runtime: one accept
//! task per listener, one read task plus one drain task per connection,
//! and one worker for the in-process task queue.
//!
//! Roles: the *server* role is taken by the directory-server process,
//! which listens on the well-known runtime socket; every other process
//! takes the *client* role, connects to the directory server, and
//! additionally listens on its own per-pid socket for direct peer
//! links. The directory server brokers discovery only — after a
//! retrieve-client round trip, peers talk over a direct connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::client::{ClientInfo, ClientType, EvlClient, Socket};
use crate::config::{remove_stale_socket, BusConfig, BusLimits};
use crate::error::{BusError, Result};
use crate::package::{control, Package, PackageHeader};
use crate::pkglistener::{PackageListener, PackageListenerRegistry};
use crate::poller::{EventKind, Poller};
use crate::registry::ClientRegistry;

/// Role of this process's loop; settable once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopRole {
    Unknown,
    Server,
    Client,
}

/// Lifecycle state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Created,
    /// Listening; server role only.
    Ready,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Connection lifecycle notifications for higher layers.
pub trait LoopListener: Send + Sync {
    fn accepted(&self, _client: EvlClient) {}
    fn connected(&self, _client: EvlClient) {}
    fn disconnected(&self, _client: EvlClient) {}
}

/// A unit of deferred work run on the loop's task queue.
pub trait LoopTask: Send {
    fn run(&mut self);
    /// Cleanup hook invoked after `run`.
    fn release(&mut self) {}
}

struct ClosureTask<F: FnMut() + Send>(F);

impl<F: FnMut() + Send> LoopTask for ClosureTask<F> {
    fn run(&mut self) {
        (self.0)();
    }
}

/// Handle to a running timer; cancels on drop.
pub struct TimerHandle {
    client: EvlClient,
    task: tokio::task::JoinHandle<()>,
}

impl TimerHandle {
    pub fn client(&self) -> &EvlClient {
        &self.client
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// Control package payloads. The frame layout around them is bit-exact;
// the payloads themselves are JSON.

#[derive(Debug, Serialize, Deserialize)]
struct ClientInfoMsg {
    info: ClientInfo,
    /// An ack is requested when announcing to the directory server (the
    /// ack carries the server's identity back); peer announces skip it.
    need_reply: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientInfoAck {
    status: i32,
    /// Responder's own identity.
    info: ClientInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetrieveClientMsg {
    client_name: String,
    instance_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetrieveClientAck {
    status: i32,
    info: Option<ClientInfo>,
}

const ACK_OK: i32 = 0;
const ACK_ALREADY_EXISTS: i32 = 1;
const ACK_NOT_FOUND: i32 = 2;

static LOOP_DISCRIMINATOR: AtomicU32 = AtomicU32::new(0);

struct LoopShared {
    config: BusConfig,
    role: Mutex<LoopRole>,
    state: Mutex<LoopState>,
    registry: ClientRegistry,
    pkg_listeners: Arc<PackageListenerRegistry>,
    loop_listeners: Mutex<HashMap<String, Arc<dyn LoopListener>>>,
    /// This process's own announce identity.
    identity: Mutex<ClientInfo>,
    /// Connection to the directory server (client role).
    server_client: Mutex<Option<EvlClient>>,
    tasks_tx: mpsc::UnboundedSender<(String, Box<dyn LoopTask>)>,
    shutdown_tx: watch::Sender<bool>,
}

/// Cheap cloneable handle to the process's reactor.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new(config: BusConfig) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel::<(String, Box<dyn LoopTask>)>();
        let (shutdown_tx, _) = watch::channel(false);
        let evloop = Self {
            shared: Arc::new(LoopShared {
                config,
                role: Mutex::new(LoopRole::Unknown),
                state: Mutex::new(LoopState::Created),
                registry: ClientRegistry::new(),
                pkg_listeners: Arc::new(PackageListenerRegistry::new()),
                loop_listeners: Mutex::new(HashMap::new()),
                identity: Mutex::new(ClientInfo::anonymous(ClientType::Client)),
                server_client: Mutex::new(None),
                tasks_tx,
                shutdown_tx,
            }),
        };
        evloop.spawn_task_worker(tasks_rx);
        evloop
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Set the loop's role; allowed exactly once.
    pub fn set_role(&self, role: LoopRole) -> Result<()> {
        let mut current = self.shared.role.lock().expect("role poisoned");
        if *current != LoopRole::Unknown {
            return Err(BusError::RoleAlreadySet);
        }
        *current = role;
        Ok(())
    }

    pub fn role(&self) -> LoopRole {
        *self.shared.role.lock().expect("role poisoned")
    }

    pub fn state(&self) -> LoopState {
        *self.shared.state.lock().expect("state poisoned")
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), LoopState::Ready | LoopState::Connected)
    }

    fn set_state(&self, state: LoopState) {
        *self.shared.state.lock().expect("state poisoned") = state;
    }

    /// Registry of attached connections.
    pub fn clients(&self) -> &ClientRegistry {
        &self.shared.registry
    }

    /// The package-id dispatch registry (shared with pollers).
    pub fn listener_registry(&self) -> Arc<PackageListenerRegistry> {
        self.shared.pkg_listeners.clone()
    }

    /// Convenience: a poller wired to this loop's dispatch registry.
    pub fn new_poller(&self) -> Poller {
        Poller::new(self.shared.pkg_listeners.clone())
    }

    pub fn add_package_listener(
        &self,
        pkg_id: u32,
        listener: Arc<dyn PackageListener>,
    ) -> Result<()> {
        self.shared.pkg_listeners.add_package_listener(pkg_id, listener)
    }

    pub fn remove_package_listener(&self, pkg_id: u32) {
        self.shared.pkg_listeners.remove_package_listener(pkg_id);
    }

    /// Register a connection lifecycle listener under a unique name.
    pub fn add_listener(&self, name: &str, listener: Arc<dyn LoopListener>) -> Result<()> {
        let mut listeners = self.shared.loop_listeners.lock().expect("listeners poisoned");
        if listeners.contains_key(name) {
            return Err(BusError::Validation {
                field: "listener".to_string(),
                message: format!("listener '{name}' already registered"),
            });
        }
        listeners.insert(name.to_string(), listener);
        Ok(())
    }

    pub fn remove_listener(&self, name: &str) {
        let mut listeners = self.shared.loop_listeners.lock().expect("listeners poisoned");
        listeners.remove(name);
    }

    /// This process's own announce identity.
    pub fn identity(&self) -> ClientInfo {
        self.shared.identity.lock().expect("identity poisoned").clone()
    }

    pub fn name(&self) -> String {
        self.identity().client_name
    }

    pub fn instance_name(&self) -> String {
        self.identity().instance_name
    }

    /// Queue a task to run at the loop's earliest convenience. Tasks
    /// run strictly in submission order.
    pub fn add_task(&self, name: &str, task: Box<dyn LoopTask>) -> Result<()> {
        self.shared
            .tasks_tx
            .send((name.to_string(), task))
            .map_err(|_| BusError::NotRunning)
    }

    /// Start a timer delivered through the task queue, so timer
    /// callbacks observe the same ordering as queued tasks.
    pub fn start_timer(
        &self,
        name: &str,
        period: Duration,
        repeating: bool,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> TimerHandle {
        let client = EvlClient::detached(ClientType::Timer);
        let evloop = self.clone();
        let task_name = name.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let cb = callback.clone();
                let queued = evloop.add_task(
                    &task_name,
                    Box::new(ClosureTask(move || cb())),
                );
                if queued.is_err() || !repeating {
                    break;
                }
            }
        });
        TimerHandle { client, task }
    }

    /// Start the loop according to its role. Completes once the loop is
    /// `Ready` (server) or `Connected` (client).
    pub async fn start(&self) -> Result<()> {
        match self.role() {
            LoopRole::Server => self.start_server().await,
            LoopRole::Client => self.start_client().await,
            LoopRole::Unknown => Err(BusError::Validation {
                field: "role".to_string(),
                message: "role must be set before start".to_string(),
            }),
        }
    }

    /// Shut the loop down: stop accepting, close every connection.
    pub fn stop(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        for client in self.shared.registry.clients() {
            client.mark_closed();
            self.shared.registry.deregister(&client);
        }
        self.set_state(LoopState::Disconnected);
    }

    async fn start_server(&self) -> Result<()> {
        self.shared.config.ensure_runtime_dir()?;
        let path = self.shared.config.server_socket_path();
        remove_stale_socket(&path);
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "directory server listening");

        {
            let mut identity = self.shared.identity.lock().expect("identity poisoned");
            if identity.client_name.is_empty() {
                identity.client_name = "mecbus-server".to_string();
            }
            identity.pid = std::process::id();
            identity.client_type = ClientType::Server;
        }

        self.spawn_unix_accept(listener);
        if let Some(port) = self.shared.config.listen_port {
            let tcp = TcpListener::bind(("0.0.0.0", port)).await?;
            info!(port, "directory server listening on tcp");
            self.spawn_tcp_accept(tcp);
        }
        self.set_state(LoopState::Ready);
        Ok(())
    }

    async fn start_client(&self) -> Result<()> {
        self.shared.config.ensure_runtime_dir()?;
        self.set_state(LoopState::Connecting);

        // Listen for direct peer links on our own socket.
        let peer_path = self.bind_peer_listener()?;
        {
            let mut identity = self.shared.identity.lock().expect("identity poisoned");
            identity.pid = std::process::id();
            identity.peer_path = Some(peer_path);
        }

        let server_path = self.shared.config.server_socket_path();
        let stream = tokio::time::timeout(
            BusLimits::CONNECT_TIMEOUT,
            UnixStream::connect(&server_path),
        )
        .await
        .map_err(|_| BusError::Timeout(BusLimits::CONNECT_TIMEOUT))?
        .map_err(|e| {
            self.set_state(LoopState::Error);
            BusError::Io {
                message: format!(
                    "cannot reach directory server at {}: {e}",
                    server_path.display()
                ),
                source: Some(e),
            }
        })?;

        let server = EvlClient::from_socket(ClientType::Server, Socket::Unix(stream));
        self.shared.registry.register(server.clone());
        self.spawn_connection(server.clone());
        *self.shared.server_client.lock().expect("server client poisoned") = Some(server.clone());

        // Announce our identity if it is already named.
        if self.identity().is_named() {
            self.announce().await?;
        }

        self.set_state(LoopState::Connected);
        for listener in self.loop_listeners() {
            listener.connected(server.clone());
        }
        Ok(())
    }

    fn bind_peer_listener(&self) -> Result<PathBuf> {
        // The sequence number keeps loops within one process apart;
        // stale files can only be leftovers of a dead pid.
        let pid = std::process::id();
        let seq = LOOP_DISCRIMINATOR.fetch_add(1, Ordering::Relaxed);
        let path = self.shared.config.peer_socket_path(pid, seq);
        remove_stale_socket(&path);
        let listener = UnixListener::bind(&path)?;
        self.spawn_unix_accept(listener);
        Ok(path)
    }

    /// Update this process's name pair and broadcast it to the
    /// directory server. On a name conflict the prior identity is
    /// kept and `ClientAlreadyExists` is returned.
    pub async fn update_identity(&self, client_name: &str, instance_name: &str) -> Result<()> {
        let prior = self.identity();
        {
            let mut identity = self.shared.identity.lock().expect("identity poisoned");
            identity.client_name = client_name.to_string();
            identity.instance_name = instance_name.to_string();
        }
        if self.server_client().is_some() {
            if let Err(e) = self.announce().await {
                *self.shared.identity.lock().expect("identity poisoned") = prior;
                return Err(e);
            }
        }
        Ok(())
    }

    fn server_client(&self) -> Option<EvlClient> {
        self.shared
            .server_client
            .lock()
            .expect("server client poisoned")
            .clone()
    }

    /// Send the client-info announce to the directory server and wait
    /// for its ack.
    async fn announce(&self) -> Result<()> {
        let server = self
            .server_client()
            .ok_or_else(|| BusError::NotConnected("directory server".to_string()))?;
        let msg = ClientInfoMsg {
            info: self.identity(),
            need_reply: true,
        };
        let payload = Bytes::from(serde_json::to_vec(&msg)?);
        let pkg = Package::new(control::CLIENT_INFO, payload);

        let mut poller = self.new_poller();
        let event = poller.create_event(EventKind::PackageWithSeqId {
            pkg_id: control::CLIENT_INFO_ACK,
            seq_id: pkg.header.seq_id,
        });
        event.submit()?;

        server
            .send_timeout(&pkg, BusLimits::HANDSHAKE_TIMEOUT)
            .await?;
        poller.poll(BusLimits::HANDSHAKE_TIMEOUT).await?;
        let fired = poller
            .get_triggered_event()
            .ok_or(BusError::EventNotSubmitted)?;
        let ack: ClientInfoAck = serde_json::from_slice(
            &fired.read_output().unwrap_or_default(),
        )?;
        if ack.status != ACK_OK {
            let identity = self.identity();
            return Err(BusError::ClientAlreadyExists {
                client_name: identity.client_name,
                instance_name: identity.instance_name,
            });
        }
        // Name the server entry with the identity it sent back.
        let _ = self.shared.registry.attach_name(&server, ack.info);
        Ok(())
    }

    /// Resolve a named client: registry first, then a retrieve-client
    /// round trip to the directory server followed by a direct
    /// connection to the peer.
    pub async fn get_client(&self, client_name: &str, instance_name: &str) -> Result<EvlClient> {
        // An empty name addresses the directory server itself.
        if client_name.is_empty() {
            return self
                .server_client()
                .ok_or_else(|| BusError::NotConnected("directory server".to_string()));
        }
        if let Some(client) = self.shared.registry.lookup(client_name, instance_name) {
            return Ok(client);
        }

        let server = self
            .server_client()
            .ok_or_else(|| BusError::NotConnected("directory server".to_string()))?;
        let msg = RetrieveClientMsg {
            client_name: client_name.to_string(),
            instance_name: instance_name.to_string(),
        };
        let pkg = Package::new(control::RETRIEVE_CLIENT, Bytes::from(serde_json::to_vec(&msg)?));

        let mut poller = self.new_poller();
        let event = poller.create_event(EventKind::PackageWithSeqId {
            pkg_id: control::RETRIEVE_CLIENT_ACK,
            seq_id: pkg.header.seq_id,
        });
        event.submit()?;
        server
            .send_timeout(&pkg, BusLimits::RETRIEVE_CLIENT_TIMEOUT)
            .await?;
        poller.poll(BusLimits::RETRIEVE_CLIENT_TIMEOUT).await?;
        let fired = poller
            .get_triggered_event()
            .ok_or(BusError::EventNotSubmitted)?;
        let ack: RetrieveClientAck =
            serde_json::from_slice(&fired.read_output().unwrap_or_default())?;
        let info = match (ack.status, ack.info) {
            (ACK_OK, Some(info)) => info,
            _ => {
                return Err(BusError::ClientNotFound {
                    client_name: client_name.to_string(),
                    instance_name: instance_name.to_string(),
                })
            }
        };

        self.connect_peer(info).await
    }

    /// Open a direct connection to a discovered peer and perform the
    /// naming handshake with it.
    async fn connect_peer(&self, info: ClientInfo) -> Result<EvlClient> {
        let socket = if let Some(path) = &info.peer_path {
            let stream = tokio::time::timeout(BusLimits::CONNECT_TIMEOUT, UnixStream::connect(path))
                .await
                .map_err(|_| BusError::Timeout(BusLimits::CONNECT_TIMEOUT))??;
            Socket::Unix(stream)
        } else if let (Some(ip), Some(port)) = (info.ipv4, info.port) {
            let stream =
                tokio::time::timeout(BusLimits::CONNECT_TIMEOUT, TcpStream::connect((ip, port)))
                    .await
                    .map_err(|_| BusError::Timeout(BusLimits::CONNECT_TIMEOUT))??;
            Socket::Tcp(stream)
        } else {
            return Err(BusError::ClientNotFound {
                client_name: info.client_name,
                instance_name: info.instance_name,
            });
        };

        let peer = EvlClient::from_socket(ClientType::Client, socket);
        self.shared.registry.register(peer.clone());
        // A stale discovery can lose the name race against an entry
        // attached meanwhile; back the fresh entry out again.
        if let Err(e) = self.shared.registry.attach_name(&peer, info) {
            self.shared.registry.deregister(&peer);
            return Err(e);
        }
        self.spawn_connection(peer.clone());

        // Identify ourselves; the peer's identity is already known, so
        // no ack is requested.
        let msg = ClientInfoMsg {
            info: self.identity(),
            need_reply: false,
        };
        let pkg = Package::new(control::CLIENT_INFO, Bytes::from(serde_json::to_vec(&msg)?));
        peer.send_timeout(&pkg, BusLimits::HANDSHAKE_TIMEOUT).await?;

        for listener in self.loop_listeners() {
            listener.connected(peer.clone());
        }
        Ok(peer)
    }

    /// Send one package on a connection with an explicit timeout.
    pub async fn send(
        &self,
        client: &EvlClient,
        package: &Package,
        timeout: Duration,
    ) -> Result<()> {
        client.send_timeout(package, timeout).await
    }

    fn loop_listeners(&self) -> Vec<Arc<dyn LoopListener>> {
        self.shared
            .loop_listeners
            .lock()
            .expect("listeners poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn spawn_task_worker(
        &self,
        mut rx: mpsc::UnboundedReceiver<(String, Box<dyn LoopTask>)>,
    ) {
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = rx.recv() => {
                        let Some((name, mut task)) = next else { break };
                        debug!(task = %name, "running loop task");
                        task.run();
                        task.release();
                    }
                }
            }
        });
    }

    fn spawn_unix_accept(&self, listener: UnixListener) {
        let evloop = self.clone();
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            evloop.admit(EvlClient::from_socket(
                                ClientType::Client,
                                Socket::Unix(stream),
                            ));
                        }
                        Err(e) => error!("unix accept error: {e}"),
                    }
                }
            }
        });
    }

    fn spawn_tcp_accept(&self, listener: TcpListener) {
        let evloop = self.clone();
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "tcp connection accepted");
                            evloop.admit(EvlClient::from_socket(
                                ClientType::Client,
                                Socket::Tcp(stream),
                            ));
                        }
                        Err(e) => error!("tcp accept error: {e}"),
                    }
                }
            }
        });
    }

    fn admit(&self, client: EvlClient) {
        self.shared.registry.register(client.clone());
        for listener in self.loop_listeners() {
            listener.accepted(client.clone());
        }
        self.spawn_connection(client);
    }

    /// Spawn the read task and the pending-write drain task for a
    /// connection.
    fn spawn_connection(&self, client: EvlClient) {
        let drain_client = client.clone();
        tokio::spawn(async move { drain_client.run_drain().await });

        let evloop = self.clone();
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let Some(socket) = client.socket() else { return };
            let mut decoder = crate::package::FrameDecoder::new();
            let mut buf = vec![0u8; BusLimits::READ_CHUNK_SIZE];
            'conn: loop {
                tokio::select! {
                    _ = shutdown.changed() => break 'conn,
                    ready = socket.readable() => {
                        if ready.is_err() {
                            break 'conn;
                        }
                    }
                }
                loop {
                    match socket.try_read(&mut buf) {
                        Ok(0) => break 'conn,
                        Ok(n) => {
                            decoder.extend(&buf[..n]);
                            while let Some((header, payload)) = decoder.next_frame() {
                                evloop.dispatch(client.clone(), header, payload).await;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            debug!(client = %client.client_name(), "read error: {e}");
                            break 'conn;
                        }
                    }
                }
            }
            evloop.handle_disconnect(client);
        });
    }

    /// Route one decoded package: built-in control handlers first,
    /// everything else to the listener registry.
    async fn dispatch(&self, sender: EvlClient, header: PackageHeader, payload: Bytes) {
        match header.pkg_id {
            control::CLIENT_INFO => self.handle_client_info(sender, header, payload).await,
            control::RETRIEVE_CLIENT => self.handle_retrieve_client(sender, header, payload).await,
            _ => {
                self.shared
                    .pkg_listeners
                    .handle_package(sender, header, payload)
                    .await;
            }
        }
    }

    async fn handle_client_info(&self, sender: EvlClient, header: PackageHeader, payload: Bytes) {
        let msg: ClientInfoMsg = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("malformed client-info package: {e}");
                return;
            }
        };
        // An anonymous announce only updates the entry, it never
        // claims the empty name pair.
        let status = if msg.info.is_named() {
            match self.shared.registry.attach_name(&sender, msg.info) {
                Ok(()) => ACK_OK,
                Err(BusError::ClientAlreadyExists { client_name, instance_name }) => {
                    warn!(client = %client_name, instance = %instance_name, "rejecting duplicate client name");
                    ACK_ALREADY_EXISTS
                }
                Err(e) => {
                    warn!("client-info handling failed: {e}");
                    ACK_ALREADY_EXISTS
                }
            }
        } else {
            sender.set_info(msg.info);
            ACK_OK
        };
        if msg.need_reply {
            let ack = ClientInfoAck {
                status,
                info: self.identity(),
            };
            let payload = match serde_json::to_vec(&ack) {
                Ok(p) => Bytes::from(p),
                Err(e) => {
                    error!("cannot encode client-info ack: {e}");
                    return;
                }
            };
            let reply = Package::with_seq_id(control::CLIENT_INFO_ACK, header.seq_id, payload);
            if let Err(e) = sender.send(&reply).await {
                warn!("cannot send client-info ack: {e}");
            }
        }
    }

    async fn handle_retrieve_client(
        &self,
        sender: EvlClient,
        header: PackageHeader,
        payload: Bytes,
    ) {
        let msg: RetrieveClientMsg = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("malformed retrieve-client package: {e}");
                return;
            }
        };
        let found = self
            .shared
            .registry
            .lookup(&msg.client_name, &msg.instance_name)
            .map(|client| client.info());
        let ack = match found {
            Some(info) => RetrieveClientAck {
                status: ACK_OK,
                info: Some(info),
            },
            None => RetrieveClientAck {
                status: ACK_NOT_FOUND,
                info: None,
            },
        };
        let payload = match serde_json::to_vec(&ack) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                error!("cannot encode retrieve-client ack: {e}");
                return;
            }
        };
        let reply = Package::with_seq_id(control::RETRIEVE_CLIENT_ACK, header.seq_id, payload);
        if let Err(e) = sender.send(&reply).await {
            warn!("cannot send retrieve-client ack: {e}");
        }
    }

    fn handle_disconnect(&self, client: EvlClient) {
        client.mark_closed();
        let info = client.info();
        self.shared.registry.deregister(&client);
        if info.is_named() {
            info!(client = %info.client_name, instance = %info.instance_name, "client disconnected");
        }
        for listener in self.loop_listeners() {
            listener.disconnected(client.clone());
        }
        // Losing the directory server drops the whole client loop to
        // Disconnected.
        let is_server_conn = self
            .server_client()
            .map(|s| s == client)
            .unwrap_or(false);
        if is_server_conn {
            *self
                .shared
                .server_client
                .lock()
                .expect("server client poisoned") = None;
            self.set_state(LoopState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::pkglistener::TriggeredPkgQueue;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn test_config() -> (tempfile::TempDir, BusConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig::with_runtime_dir(dir.path());
        (dir, config)
    }

    async fn server_and_client(config: &BusConfig) -> (EventLoop, EventLoop) {
        let server = EventLoop::new(config.clone());
        server.set_role(LoopRole::Server).unwrap();
        server.start().await.unwrap();

        let client = EventLoop::new(config.clone());
        client.set_role(LoopRole::Client).unwrap();
        client.start().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_role_set_once() {
        let (_dir, config) = test_config();
        let evloop = EventLoop::new(config);
        evloop.set_role(LoopRole::Client).unwrap();
        assert!(matches!(
            evloop.set_role(LoopRole::Server),
            Err(BusError::RoleAlreadySet)
        ));
    }

    #[tokio::test]
    async fn test_client_connects_and_announces() {
        let (_dir, config) = test_config();
        let (server, client) = server_and_client(&config).await;
        assert_eq!(server.state(), LoopState::Ready);
        assert_eq!(client.state(), LoopState::Connected);

        client.update_identity("vision", "front").await.unwrap();

        // The server now knows the client by name.
        let entry = server.clients().lookup("vision", "front").unwrap();
        assert_eq!(entry.info().client_name, "vision");
        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_second_loses() {
        let (_dir, config) = test_config();
        let (server, first) = server_and_client(&config).await;
        first.update_identity("dup", "a").await.unwrap();

        let second = EventLoop::new(config.clone());
        second.set_role(LoopRole::Client).unwrap();
        second.start().await.unwrap();
        let err = second.update_identity("dup", "a").await.unwrap_err();
        assert!(matches!(err, BusError::ClientAlreadyExists { .. }));
        // The loser's identity is restored.
        assert_eq!(second.name(), "");

        first.stop();
        second.stop();
        server.stop();
    }

    struct EchoListener;

    #[async_trait]
    impl PackageListener for EchoListener {
        async fn on_package(
            &self,
            sender: EvlClient,
            header: PackageHeader,
            payload: Bytes,
            _triggered: &TriggeredPkgQueue,
        ) -> bool {
            let reply = Package::with_seq_id(header.pkg_id + 1, header.seq_id, payload);
            sender.send(&reply).await.is_ok()
        }
    }

    #[tokio::test]
    async fn test_peer_discovery_and_direct_exchange() {
        let (_dir, config) = test_config();
        let (server, alice) = server_and_client(&config).await;
        alice.update_identity("alice", "").await.unwrap();

        let bob = EventLoop::new(config.clone());
        bob.set_role(LoopRole::Client).unwrap();
        bob.start().await.unwrap();
        bob.update_identity("bob", "").await.unwrap();

        const PING: u32 = crate::package::make_pkg_id(3, 100);
        const PONG: u32 = crate::package::make_pkg_id(3, 101);
        bob.add_package_listener(PING, Arc::new(EchoListener)).unwrap();

        // Alice discovers bob through the directory and talks directly.
        let peer = alice.get_client("bob", "").await.unwrap();
        assert_eq!(peer.info().client_name, "bob");

        let request = Package::new(PING, Bytes::from_static(b"direct"));
        let mut poller = alice.new_poller();
        let event = poller.create_event(EventKind::PackageWithSeqId {
            pkg_id: PONG,
            seq_id: request.header.seq_id,
        });
        event.submit().unwrap();
        peer.send(&request).await.unwrap();
        poller.poll(Duration::from_secs(2)).await.unwrap();
        let fired = poller.get_triggered_event().unwrap();
        assert_eq!(fired.read_output().unwrap(), Bytes::from_static(b"direct"));

        // Second lookup hits the registry, no directory round trip.
        let again = alice.get_client("bob", "").await.unwrap();
        assert_eq!(again, peer);

        alice.stop();
        bob.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_lost_name_race_leaves_registry_clean() {
        let (_dir, config) = test_config();
        let (server, alice) = server_and_client(&config).await;
        alice.update_identity("alice", "").await.unwrap();

        let bob = EventLoop::new(config.clone());
        bob.set_role(LoopRole::Client).unwrap();
        bob.start().await.unwrap();
        bob.update_identity("bob", "").await.unwrap();

        let peer = alice.get_client("bob", "").await.unwrap();
        let before = alice.clients().len();

        // A second direct connect for the same identity loses the name
        // race against the live entry and must not leak an entry.
        let err = alice.connect_peer(peer.info()).await.unwrap_err();
        assert!(matches!(err, BusError::ClientAlreadyExists { .. }));
        assert_eq!(alice.clients().len(), before);

        alice.stop();
        bob.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_get_client_unknown_peer_not_found() {
        let (_dir, config) = test_config();
        let (server, client) = server_and_client(&config).await;
        let err = client.get_client("ghost", "").await.unwrap_err();
        assert!(matches!(err, BusError::ClientNotFound { .. }));
        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_task_queue_runs_in_order() {
        let (_dir, config) = test_config();
        let evloop = EventLoop::new(config);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            evloop
                .add_task(
                    &format!("task-{i}"),
                    Box::new(ClosureTask(move || {
                        log.lock().unwrap().push(i);
                    })),
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_timer_fires_repeatedly() {
        let (_dir, config) = test_config();
        let evloop = EventLoop::new(config);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let timer = evloop.start_timer(
            "tick",
            Duration::from_millis(20),
            true,
            Arc::new(move || {
                hits2.fetch_add(1, AtomicOrdering::Relaxed);
            }),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        timer.cancel();
        assert!(hits.load(AtomicOrdering::Relaxed) >= 2);
    }
}
