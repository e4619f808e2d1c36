//! Host-to-client event notification.
//!
//! Method calls always originate at the client; events go the other
//! way. A host attaches an [`RpcEventHub`] to its loop and triggers
//! named events on it, and every peer that subscribed to that name
//! gets the payload pushed over its existing connection. The client
//! side runs an [`RpcEventRouter`] that dispatches incoming notices to
//! registered handlers by event name.
//!
//! Subscription is a plain round trip; notification is fire-and-forget
//! with no acknowledgement. A subscriber that disconnects is pruned,
//! either eagerly through the loop listener or lazily when a push to
//! it fails.

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

use crate::client::round_trip;
use crate::error::{Result, RpcError};
use crate::proto::{
    DirectoryStatus, EventNotice, EventReply, EventRequest, EventRequestKind, EVENT_NOTIFY,
    EVENT_REPLY, EVENT_REQUEST,
};

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Called on the router's loop for every notice of a subscribed event.
pub type EventHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

struct HubInner {
    /// Event name to subscribed connections, keyed by the host-side
    /// connection entry id.
    subscribers: Mutex<HashMap<String, HashMap<u64, EvlClient>>>,
}

impl HubInner {
    fn handle_request(&self, sender: &EvlClient, request: &EventRequest) -> DirectoryStatus {
        let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
        match request.kind {
            EventRequestKind::Subscribe => {
                subscribers
                    .entry(request.event_name.clone())
                    .or_default()
                    .insert(sender.id(), sender.clone());
                debug!(event = %request.event_name, peer = sender.id(), "event subscribed");
                DirectoryStatus::Ok
            }
            EventRequestKind::Unsubscribe => match subscribers.get_mut(&request.event_name) {
                Some(peers) => {
                    if peers.remove(&sender.id()).is_none() {
                        return DirectoryStatus::NoService;
                    }
                    if peers.is_empty() {
                        subscribers.remove(&request.event_name);
                    }
                    DirectoryStatus::Ok
                }
                None => DirectoryStatus::NoService,
            },
        }
    }

    /// A subscriber connection went away: drop every subscription it
    /// held.
    fn handle_gone(&self, client_id: u64) {
        let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
        subscribers.retain(|_, peers| {
            peers.remove(&client_id);
            !peers.is_empty()
        });
    }
}

/// Host-side fan-out point for named events.
#[derive(Clone)]
pub struct RpcEventHub {
    inner: Arc<HubInner>,
}

impl RpcEventHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Hook the hub into a loop: one package listener answering
    /// subscription requests, one loop listener pruning subscribers
    /// whose connection drops.
    pub fn attach(&self, evloop: &EventLoop) -> Result<()> {
        evloop
            .add_package_listener(
                EVENT_REQUEST,
                Arc::new(HubListener {
                    inner: Arc::downgrade(&self.inner),
                }),
            )
            .map_err(RpcError::Transport)?;
        evloop
            .add_listener(
                "rpc-event-hub",
                Arc::new(HubLoopListener {
                    inner: Arc::downgrade(&self.inner),
                }),
            )
            .map_err(RpcError::Transport)?;
        Ok(())
    }

    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("subscribers poisoned")
            .get(event_name)
            .map_or(0, HashMap::len)
    }

    /// Push `payload` to every live subscriber of `event_name` and
    /// return how many were reached. Peers the push fails for are
    /// dropped from the subscription table.
    pub async fn trigger(&self, event_name: &str, payload: Bytes) -> usize {
        let peers: Vec<EvlClient> = {
            let subscribers = self
                .inner
                .subscribers
                .lock()
                .expect("subscribers poisoned");
            match subscribers.get(event_name) {
                Some(peers) => peers.values().cloned().collect(),
                None => return 0,
            }
        };
        let notice = EventNotice {
            event_name: event_name.to_string(),
            payload: payload.to_vec(),
        };
        let encoded = match serde_json::to_vec(&notice) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!(event = event_name, "cannot encode event notice: {e}");
                return 0;
            }
        };
        let mut delivered = 0;
        let mut dead = Vec::new();
        for peer in peers {
            let pkg = Package::new(EVENT_NOTIFY, encoded.clone());
            match peer.send(&pkg).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(event = event_name, peer = peer.id(), "event push failed: {e}");
                    dead.push(peer.id());
                }
            }
        }
        for id in dead {
            self.inner.handle_gone(id);
        }
        delivered
    }
}

impl Default for RpcEventHub {
    fn default() -> Self {
        Self::new()
    }
}

struct HubListener {
    inner: Weak<HubInner>,
}

#[async_trait]
impl PackageListener for HubListener {
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
        let request: EventRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed event request: {e}");
                return false;
            }
        };
        let status = inner.handle_request(&sender, &request);
        let reply = EventReply { status };
        let payload = match serde_json::to_vec(&reply) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!("cannot encode event reply: {e}");
                return false;
            }
        };
        let pkg = Package::with_seq_id(EVENT_REPLY, header.seq_id, payload);
        if let Err(e) = sender.send(&pkg).await {
            warn!("cannot send event reply: {e}");
            return false;
        }
        true
    }
}

struct HubLoopListener {
    inner: Weak<HubInner>,
}

impl LoopListener for HubLoopListener {
    fn disconnected(&self, client: EvlClient) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_gone(client.id());
        }
    }
}

struct RouterInner {
    handlers: Mutex<HashMap<String, EventHandler>>,
}

/// Client-side dispatcher for incoming event notices.
#[derive(Clone)]
pub struct RpcEventRouter {
    evloop: EventLoop,
    inner: Arc<RouterInner>,
}

impl RpcEventRouter {
    /// Create a router and hook it into `evloop` for event notices.
    pub fn new(evloop: &EventLoop) -> Result<Self> {
        let inner = Arc::new(RouterInner {
            handlers: Mutex::new(HashMap::new()),
        });
        evloop
            .add_package_listener(
                EVENT_NOTIFY,
                Arc::new(RouterListener {
                    inner: Arc::downgrade(&inner),
                }),
            )
            .map_err(RpcError::Transport)?;
        Ok(Self {
            evloop: evloop.clone(),
            inner,
        })
    }

    /// Subscribe to `event_name` on the hub behind `conn` and route
    /// its notices to `handler`. One handler per event name; a second
    /// subscribe replaces the previous handler.
    pub async fn subscribe(
        &self,
        conn: &EvlClient,
        event_name: &str,
        handler: EventHandler,
    ) -> Result<()> {
        let request = EventRequest {
            kind: EventRequestKind::Subscribe,
            event_name: event_name.to_string(),
        };
        let reply: EventReply = round_trip(
            &self.evloop,
            conn,
            EVENT_REQUEST,
            EVENT_REPLY,
            &request,
            SUBSCRIBE_TIMEOUT,
        )
        .await?;
        if reply.status != DirectoryStatus::Ok {
            return Err(RpcError::PackageError);
        }
        self.inner
            .handlers
            .lock()
            .expect("handlers poisoned")
            .insert(event_name.to_string(), handler);
        Ok(())
    }

    /// Drop the local handler for `event_name` and tell the hub to
    /// stop pushing it.
    pub async fn unsubscribe(&self, conn: &EvlClient, event_name: &str) -> Result<()> {
        self.inner
            .handlers
            .lock()
            .expect("handlers poisoned")
            .remove(event_name);
        let request = EventRequest {
            kind: EventRequestKind::Unsubscribe,
            event_name: event_name.to_string(),
        };
        let reply: EventReply = round_trip(
            &self.evloop,
            conn,
            EVENT_REQUEST,
            EVENT_REPLY,
            &request,
            SUBSCRIBE_TIMEOUT,
        )
        .await?;
        if reply.status != DirectoryStatus::Ok {
            return Err(RpcError::NotFound(event_name.to_string()));
        }
        Ok(())
    }
}

struct RouterListener {
    inner: Weak<RouterInner>,
}

#[async_trait]
impl PackageListener for RouterListener {
    async fn on_package(
        &self,
        _sender: EvlClient,
        _header: PackageHeader,
        payload: Bytes,
        _triggered: &TriggeredPkgQueue,
    ) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let notice: EventNotice = match serde_json::from_slice(&payload) {
            Ok(notice) => notice,
            Err(e) => {
                warn!("malformed event notice: {e}");
                return false;
            }
        };
        let handler = inner
            .handlers
            .lock()
            .expect("handlers poisoned")
            .get(&notice.event_name)
            .cloned();
        match handler {
            Some(handler) => {
                handler(Bytes::from(notice.payload));
                true
            }
            None => {
                debug!(event = %notice.event_name, "event notice with no handler");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mecbus_core::{BusConfig, LoopRole};
    use tokio::sync::mpsc;

    async fn start_bus(config: &BusConfig) -> EventLoop {
        let server = EventLoop::new(config.clone());
        server.set_role(LoopRole::Server).unwrap();
        server.start().await.unwrap();
        server
    }

    async fn start_peer(config: &BusConfig, name: &str) -> EventLoop {
        let evloop = EventLoop::new(config.clone());
        evloop.set_role(LoopRole::Client).unwrap();
        evloop.start().await.unwrap();
        evloop.update_identity(name, "").await.unwrap();
        evloop
    }

    #[tokio::test]
    async fn test_subscribe_then_trigger_delivers_payload() {
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig::with_runtime_dir(dir.path());
        let server = start_bus(&config).await;

        let host_loop = start_peer(&config, "event-host").await;
        let hub = RpcEventHub::new();
        hub.attach(&host_loop).unwrap();

        let cli_loop = start_peer(&config, "event-client").await;
        let router = RpcEventRouter::new(&cli_loop).unwrap();
        let conn = cli_loop.get_client("event-host", "").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .subscribe(
                &conn,
                "temperature",
                Arc::new(move |payload| {
                    let _ = tx.send(payload);
                }),
            )
            .await
            .unwrap();
        assert_eq!(hub.subscriber_count("temperature"), 1);

        let delivered = hub
            .trigger("temperature", Bytes::from_static(b"21.5"))
            .await;
        assert_eq!(delivered, 1);
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"21.5"));

        cli_loop.stop();
        host_loop.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig::with_runtime_dir(dir.path());
        let server = start_bus(&config).await;

        let host_loop = start_peer(&config, "unsub-host").await;
        let hub = RpcEventHub::new();
        hub.attach(&host_loop).unwrap();

        let cli_loop = start_peer(&config, "unsub-client").await;
        let router = RpcEventRouter::new(&cli_loop).unwrap();
        let conn = cli_loop.get_client("unsub-host", "").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .subscribe(
                &conn,
                "pressure",
                Arc::new(move |payload| {
                    let _ = tx.send(payload);
                }),
            )
            .await
            .unwrap();
        router.unsubscribe(&conn, "pressure").await.unwrap();
        assert_eq!(hub.subscriber_count("pressure"), 0);

        let delivered = hub.trigger("pressure", Bytes::from_static(b"1013")).await;
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());

        // Unsubscribing something never subscribed is reported.
        let err = router.unsubscribe(&conn, "pressure").await.unwrap_err();
        assert!(matches!(err, RpcError::NotFound(_)));

        cli_loop.stop();
        host_loop.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_disconnect_prunes_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig::with_runtime_dir(dir.path());
        let server = start_bus(&config).await;

        let host_loop = start_peer(&config, "prune-host").await;
        let hub = RpcEventHub::new();
        hub.attach(&host_loop).unwrap();

        let cli_loop = start_peer(&config, "prune-client").await;
        let router = RpcEventRouter::new(&cli_loop).unwrap();
        let conn = cli_loop.get_client("prune-host", "").await.unwrap();

        router
            .subscribe(&conn, "heartbeat", Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(hub.subscriber_count("heartbeat"), 1);

        cli_loop.stop();
        drop(conn);
        drop(router);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(hub.subscriber_count("heartbeat"), 0);

        host_loop.stop();
        server.stop();
    }
}
