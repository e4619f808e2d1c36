//! Per-connection client entries.
//!
//! Every multiplexed endpoint the event loop owns — an accepted or
//! outgoing socket, a timer, the in-process task queue — is represented
//! by one [`EvlClient`] entry carrying its identity, type tag and (for
//! sockets) the pending-write byte queue.
//!
//! # Thread Safety
//!
//! `EvlClient` is a cheap `Arc` handle. The write path serializes
//! through the byte queue's writer gate; the read path is owned by the
//! connection's reactor task exclusively.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bytequeue::ByteQueue;
use crate::config::BusLimits;
use crate::error::{BusError, Result};
use crate::package::Package;

/// Type tag of a client entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Unknown,
    /// The directory server endpoint.
    Server,
    /// An ordinary peer connection.
    Client,
    Timer,
    Task,
    Listener,
}

/// Capability flags carried in the naming handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFlags {
    pub service_container: bool,
    pub service_shared: bool,
}

/// Identity of a client. The `(client_name, instance_name)` pair is
/// unique among currently attached, named connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_name: String,
    pub instance_name: String,
    pub pid: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub uuid: Uuid,
    pub client_type: ClientType,
    pub flags: ClientFlags,
    /// Unix socket path this client accepts direct peer links on.
    pub peer_path: Option<std::path::PathBuf>,
}

impl ClientInfo {
    /// A fresh anonymous identity for a just-created connection.
    pub fn anonymous(client_type: ClientType) -> Self {
        Self {
            client_name: String::new(),
            instance_name: String::new(),
            pid: 0,
            ipv4: None,
            port: None,
            uuid: Uuid::new_v4(),
            client_type,
            flags: ClientFlags::default(),
            peer_path: None,
        }
    }

    pub fn is_named(&self) -> bool {
        !self.client_name.is_empty()
    }

    pub fn name_key(&self) -> (String, String) {
        (self.client_name.clone(), self.instance_name.clone())
    }
}

/// A socket of either local transport flavor.
#[derive(Debug)]
pub enum Socket {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Socket {
    pub async fn readable(&self) -> std::io::Result<()> {
        match self {
            Socket::Unix(s) => s.ready(Interest::READABLE).await.map(|_| ()),
            Socket::Tcp(s) => s.ready(Interest::READABLE).await.map(|_| ()),
        }
    }

    pub async fn writable(&self) -> std::io::Result<()> {
        match self {
            Socket::Unix(s) => s.ready(Interest::WRITABLE).await.map(|_| ()),
            Socket::Tcp(s) => s.ready(Interest::WRITABLE).await.map(|_| ()),
        }
    }

    pub fn try_read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Socket::Unix(s) => s.try_read(buf),
            Socket::Tcp(s) => s.try_read(buf),
        }
    }

    pub fn try_write(&self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Socket::Unix(s) => s.try_write(buf),
            Socket::Tcp(s) => s.try_write(buf),
        }
    }
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) struct ClientEntry {
    id: u64,
    client_type: ClientType,
    info: Mutex<ClientInfo>,
    socket: Option<Arc<Socket>>,
    pending: ByteQueue,
    /// Kicks the drain task when bytes are queued.
    drain: Notify,
    closed: AtomicBool,
}

/// Shared handle to one client entry.
#[derive(Debug, Clone)]
pub struct EvlClient {
    inner: Arc<ClientEntry>,
}

impl PartialEq for EvlClient {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for EvlClient {}

impl std::hash::Hash for EvlClient {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl EvlClient {
    pub(crate) fn from_socket(client_type: ClientType, socket: Socket) -> Self {
        Self {
            inner: Arc::new(ClientEntry {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                client_type,
                info: Mutex::new(ClientInfo::anonymous(client_type)),
                socket: Some(Arc::new(socket)),
                pending: ByteQueue::new(),
                drain: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A socketless pseudo-entry (timer, task queue, listener).
    pub(crate) fn detached(client_type: ClientType) -> Self {
        Self {
            inner: Arc::new(ClientEntry {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                client_type,
                info: Mutex::new(ClientInfo::anonymous(client_type)),
                socket: None,
                pending: ByteQueue::new(),
                drain: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Stable entry id, unique within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn client_type(&self) -> ClientType {
        self.inner.client_type
    }

    pub fn info(&self) -> ClientInfo {
        self.inner.info.lock().expect("client info poisoned").clone()
    }

    pub fn client_name(&self) -> String {
        self.info().client_name
    }

    pub fn instance_name(&self) -> String {
        self.info().instance_name
    }

    pub(crate) fn set_info(&self, info: ClientInfo) {
        *self.inner.info.lock().expect("client info poisoned") = info;
    }

    pub(crate) fn socket(&self) -> Option<Arc<Socket>> {
        self.inner.socket.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // Wake the drain task so it can exit.
        self.inner.drain.notify_waiters();
    }

    /// Send one package with the default timeout.
    pub async fn send(&self, package: &Package) -> Result<()> {
        self.send_timeout(package, BusLimits::SEND_DEFAULT_TIMEOUT)
            .await
    }

    /// Send one package, retrying for queue space up to `timeout`.
    ///
    /// A non-blocking write is attempted first; whatever the kernel does
    /// not take is appended to the bounded pending-write queue and
    /// drained when the socket becomes writable again. When the queue is
    /// also full the call retries until the wall-clock deadline and then
    /// fails with [`BusError::Busy`].
    pub async fn send_timeout(&self, package: &Package, timeout: Duration) -> Result<()> {
        if package.payload.len() > BusLimits::MAX_PACKAGE_SIZE {
            return Err(BusError::PackageTooLarge {
                size: package.payload.len(),
                max: BusLimits::MAX_PACKAGE_SIZE,
            });
        }
        let bytes = package.encode();
        self.send_bytes(&bytes, timeout).await
    }

    pub(crate) async fn send_bytes(&self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let socket = self
            .inner
            .socket
            .as_ref()
            .ok_or_else(|| BusError::NotConnected(self.client_name()))?
            .clone();
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_closed() {
                return Err(BusError::NotConnected(self.client_name()));
            }
            {
                let mut writer = self.inner.pending.writer();
                // Only try the direct write when nothing is queued ahead
                // of us (package boundaries must stay intact) and the
                // queue could absorb a partial remainder.
                if writer.is_empty() && writer.available() >= bytes.len() {
                    let mut off = 0usize;
                    loop {
                        match socket.try_write(&bytes[off..]) {
                            Ok(0) => {
                                return Err(BusError::NotConnected(self.client_name()));
                            }
                            Ok(n) => {
                                off += n;
                                if off == bytes.len() {
                                    return Ok(());
                                }
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    // Kernel buffer full: park the remainder.
                    writer.append(&bytes[off..])?;
                    self.inner.drain.notify_one();
                    return Ok(());
                }
                if writer.append(bytes).is_ok() {
                    self.inner.drain.notify_one();
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    client = %self.client_name(),
                    "send: pending-write queue full past deadline"
                );
                return Err(BusError::Busy {
                    client: self.client_name(),
                });
            }
            tokio::time::sleep(BusLimits::SEND_RETRY_INTERVAL).await;
        }
    }

    /// Drain loop flushing the pending-write queue whenever the socket
    /// is writable. Runs as a reactor task for the connection's
    /// lifetime.
    pub(crate) async fn run_drain(&self) {
        let Some(socket) = self.inner.socket.clone() else {
            return;
        };
        loop {
            if self.inner.pending.is_empty() {
                if self.is_closed() {
                    return;
                }
                self.inner.drain.notified().await;
                continue;
            }
            if socket.writable().await.is_err() {
                return;
            }
            let mut writer = self.inner.pending.writer();
            while let Some(front) = writer.front() {
                match socket.try_write(front) {
                    Ok(0) => return,
                    Ok(n) => writer.discard(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(client = %self.client_name(), "drain write failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_anonymous_identity() {
        let info = ClientInfo::anonymous(ClientType::Client);
        assert!(!info.is_named());
        assert_eq!(info.client_type, ClientType::Client);
    }

    #[test]
    fn test_client_equality_is_by_entry_id() {
        let a = EvlClient::detached(ClientType::Timer);
        let b = EvlClient::detached(ClientType::Timer);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[tokio::test]
    async fn test_send_roundtrip_over_unix_pair() {
        let (left, right) = UnixStream::pair().unwrap();
        let client = EvlClient::from_socket(ClientType::Client, Socket::Unix(left));

        let pkg = Package::new(7, Bytes::from_static(b"ping"));
        client.send(&pkg).await.unwrap();

        let mut buf = vec![0u8; 256];
        right.readable().await.unwrap();
        let n = right.try_read(&mut buf).unwrap();

        let mut dec = crate::package::FrameDecoder::new();
        dec.extend(&buf[..n]);
        let (header, payload) = dec.next_frame().expect("one frame");
        assert_eq!(header.pkg_id, 7);
        assert_eq!(payload, Bytes::from_static(b"ping"));
    }

    fn client_with_tiny_queue(socket: Socket) -> EvlClient {
        EvlClient {
            inner: Arc::new(ClientEntry {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                client_type: ClientType::Client,
                info: Mutex::new(ClientInfo::anonymous(ClientType::Client)),
                socket: Some(Arc::new(socket)),
                pending: ByteQueue::with_capacity(32, 8),
                drain: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[tokio::test]
    async fn test_send_fails_busy_when_queue_stays_full() {
        let (left, _right) = UnixStream::pair().unwrap();
        let client = client_with_tiny_queue(Socket::Unix(left));
        // Park bytes so the direct-write path is skipped and the tiny
        // queue cannot absorb another framed package.
        client.inner.pending.writer().append(&[0u8; 24]).unwrap();

        let pkg = Package::new(1, Bytes::from_static(b"overflow me"));
        let start = Instant::now();
        let err = client
            .send_timeout(&pkg, Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Busy { .. }));
        // The retry loop ran against the wall clock before giving up.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_send_to_detached_entry_fails() {
        let client = EvlClient::detached(ClientType::Task);
        let pkg = Package::new(1, Bytes::new());
        let err = client.send(&pkg).await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected(_)));
    }
}
