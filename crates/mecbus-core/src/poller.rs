//! The poller: makes an asynchronous reply look like a blocking call
//! result.
//!
//! A caller creates an event tied to a package id (optionally plus a
//! sequence id), submits it, sends its request, then `poll`s. When the
//! reactor dispatches the matching package it fires the event, and
//! `poll` returns. Every blocking RPC call runs on its own tokio task,
//! so a single wait mechanism (a per-poller channel awaited under
//! `tokio::time::timeout`) covers both "reactor-side" and foreign
//! callers; there is no special-casing of where the call originates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::client::EvlClient;
use crate::error::{BusError, Result};
use crate::pkglistener::PackageListenerRegistry;

/// What a poller event waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Any package of this id.
    Package { pkg_id: u32 },
    /// Only the package of this id carrying this exact sequence id.
    PackageWithSeqId { pkg_id: u32, seq_id: u32 },
}

const STATE_CREATED: u8 = 0;
const STATE_SUBMITTED: u8 = 1;
const STATE_TRIGGERED: u8 = 2;
const STATE_CONSUMED: u8 = 3;

#[derive(Debug)]
struct EventInner {
    kind: EventKind,
    state: AtomicU8,
    input: Mutex<Option<Bytes>>,
    output: Mutex<Option<Bytes>>,
    sender: Mutex<Option<EvlClient>>,
    fire_tx: mpsc::UnboundedSender<PollerEvent>,
    registry: Weak<PackageListenerRegistry>,
}

/// One pending wait, created by and owned by a [`Poller`].
#[derive(Debug, Clone)]
pub struct PollerEvent {
    inner: Arc<EventInner>,
}

impl PartialEq for PollerEvent {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for PollerEvent {}

impl PollerEvent {
    pub fn kind(&self) -> EventKind {
        self.inner.kind
    }

    /// Make the event visible to the dispatcher.
    pub fn submit(&self) -> Result<()> {
        let registry = self
            .inner
            .registry
            .upgrade()
            .ok_or(BusError::NotRunning)?;
        self.inner.state.store(STATE_SUBMITTED, Ordering::Release);
        registry.submit_event(self.clone());
        Ok(())
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= STATE_TRIGGERED
    }

    /// Stash request bytes on the event (available to the notifier).
    pub fn write_input(&self, data: Bytes) {
        *self.inner.input.lock().expect("event input poisoned") = Some(data);
    }

    pub fn read_input(&self) -> Option<Bytes> {
        self.inner.input.lock().expect("event input poisoned").clone()
    }

    /// Overwrite the reply bytes (normally pre-filled by the reactor
    /// with the triggering package's payload).
    pub fn write_output(&self, data: Bytes) {
        *self.inner.output.lock().expect("event output poisoned") = Some(data);
    }

    pub fn read_output(&self) -> Option<Bytes> {
        self.inner.output.lock().expect("event output poisoned").clone()
    }

    /// Connection the triggering package arrived on.
    pub fn sender(&self) -> Option<EvlClient> {
        self.inner.sender.lock().expect("event sender poisoned").clone()
    }

    /// Called by the dispatcher before the notifier runs.
    pub(crate) fn set_trigger(&self, sender: EvlClient, payload: Bytes) {
        *self.inner.sender.lock().expect("event sender poisoned") = Some(sender);
        let mut output = self.inner.output.lock().expect("event output poisoned");
        if output.is_none() {
            *output = Some(payload);
        }
    }

    /// Called by the dispatcher after the notifier ran; wakes `poll`.
    pub(crate) fn fire(&self) {
        self.inner.state.store(STATE_TRIGGERED, Ordering::Release);
        // Receiver gone means the poller was dropped; the late reply is
        // simply discarded.
        let _ = self.inner.fire_tx.send(self.clone());
    }

    fn mark_consumed(&self) {
        self.inner.state.store(STATE_CONSUMED, Ordering::Release);
    }

    fn is_pending(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_SUBMITTED
    }
}

/// Owner of a set of poller events and the wait point for them.
pub struct Poller {
    registry: Arc<PackageListenerRegistry>,
    fire_tx: mpsc::UnboundedSender<PollerEvent>,
    fire_rx: mpsc::UnboundedReceiver<PollerEvent>,
    events: Vec<PollerEvent>,
    triggered: VecDeque<PollerEvent>,
}

impl Poller {
    pub fn new(registry: Arc<PackageListenerRegistry>) -> Self {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            fire_tx,
            fire_rx,
            events: Vec::new(),
            triggered: VecDeque::new(),
        }
    }

    /// Allocate an event owned by this poller. The event is inert until
    /// [`PollerEvent::submit`] is called.
    pub fn create_event(&mut self, kind: EventKind) -> PollerEvent {
        let event = PollerEvent {
            inner: Arc::new(EventInner {
                kind,
                state: AtomicU8::new(STATE_CREATED),
                input: Mutex::new(None),
                output: Mutex::new(None),
                sender: Mutex::new(None),
                fire_tx: self.fire_tx.clone(),
                registry: Arc::downgrade(&self.registry),
            }),
        };
        self.events.push(event.clone());
        event
    }

    /// Drop all previously triggered-but-unconsumed state. Useful
    /// before re-polling in a loop.
    pub fn reset(&mut self) {
        self.triggered.clear();
        while self.fire_rx.try_recv().is_ok() {}
    }

    /// Wait until at least one of this poller's events triggers, or
    /// fail with [`BusError::Timeout`] once `timeout` elapses.
    pub async fn poll(&mut self, timeout: Duration) -> Result<()> {
        if !self.triggered.is_empty() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, self.fire_rx.recv()).await {
            Ok(Some(event)) => {
                self.triggered.push_back(event);
                // Pull anything else already fired without waiting.
                while let Ok(more) = self.fire_rx.try_recv() {
                    self.triggered.push_back(more);
                }
                Ok(())
            }
            Ok(None) => Err(BusError::NotRunning),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Take the next triggered event, in package-arrival order.
    pub fn get_triggered_event(&mut self) -> Option<PollerEvent> {
        while let Ok(more) = self.fire_rx.try_recv() {
            self.triggered.push_back(more);
        }
        let event = self.triggered.pop_front()?;
        event.mark_consumed();
        Some(event)
    }
}

impl Drop for Poller {
    /// Detach every still-pending event so no callback fires after the
    /// poller is gone.
    fn drop(&mut self) {
        for event in &self.events {
            if event.is_pending() {
                self.registry.detach_event(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientType;
    use crate::package::PackageHeader;
    use std::time::Instant;

    fn header(pkg_id: u32, seq_id: u32) -> PackageHeader {
        PackageHeader {
            pkg_id,
            seq_id,
            size: 0,
        }
    }

    #[tokio::test]
    async fn test_poll_times_out_when_nothing_arrives() {
        let registry = Arc::new(PackageListenerRegistry::new());
        let mut poller = Poller::new(registry);
        let event = poller.create_event(EventKind::Package { pkg_id: 1 });
        event.submit().unwrap();

        let start = Instant::now();
        let err = poller.poll(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        // Dropping the poller afterwards must be safe (detaches the
        // pending event, no callback fires later).
        drop(poller);
    }

    #[tokio::test]
    async fn test_generic_event_triggers_on_any_seq() {
        let registry = Arc::new(PackageListenerRegistry::new());
        let mut poller = Poller::new(registry.clone());
        let event = poller.create_event(EventKind::Package { pkg_id: 5 });
        event.submit().unwrap();

        let sender = EvlClient::detached(ClientType::Client);
        registry
            .handle_package(sender, header(5, 1234), Bytes::from_static(b"data"))
            .await;

        poller.poll(Duration::from_secs(1)).await.unwrap();
        let fired = poller.get_triggered_event().unwrap();
        assert!(fired.is_triggered());
        assert_eq!(fired.read_output().unwrap(), Bytes::from_static(b"data"));
        assert!(poller.get_triggered_event().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate_by_seq_id() {
        let registry = Arc::new(PackageListenerRegistry::new());
        const REPLY_PKG: u32 = 66;

        let mut pollers = Vec::new();
        for seq in 1..=8u32 {
            let mut poller = Poller::new(registry.clone());
            let event = poller.create_event(EventKind::PackageWithSeqId {
                pkg_id: REPLY_PKG,
                seq_id: seq,
            });
            event.submit().unwrap();
            pollers.push((seq, poller));
        }

        // Deliver replies out of order.
        let sender = EvlClient::detached(ClientType::Client);
        for seq in [3u32, 1, 8, 5, 2, 7, 4, 6] {
            registry
                .handle_package(
                    sender.clone(),
                    header(REPLY_PKG, seq),
                    Bytes::from(format!("reply-{seq}")),
                )
                .await;
        }

        for (seq, poller) in &mut pollers {
            poller.poll(Duration::from_secs(1)).await.unwrap();
            let fired = poller.get_triggered_event().unwrap();
            assert_eq!(
                fired.read_output().unwrap(),
                Bytes::from(format!("reply-{seq}"))
            );
            // Exactly one event per poller.
            assert!(poller.get_triggered_event().is_none());
        }
    }

    #[tokio::test]
    async fn test_reset_discards_stale_triggers_between_rounds() {
        let registry = Arc::new(PackageListenerRegistry::new());
        let mut poller = Poller::new(registry.clone());
        let first = poller.create_event(EventKind::Package { pkg_id: 21 });
        let second = poller.create_event(EventKind::Package { pkg_id: 22 });
        first.submit().unwrap();
        second.submit().unwrap();

        let sender = EvlClient::detached(ClientType::Client);
        registry
            .handle_package(sender.clone(), header(21, 1), Bytes::from_static(b"a"))
            .await;
        registry
            .handle_package(sender.clone(), header(22, 2), Bytes::from_static(b"b"))
            .await;
        poller.poll(Duration::from_secs(1)).await.unwrap();
        assert!(poller.get_triggered_event().is_some());

        // Start the next round from scratch: the unconsumed trigger
        // from the last round must be gone.
        poller.reset();
        assert!(poller.get_triggered_event().is_none());

        let third = poller.create_event(EventKind::Package { pkg_id: 23 });
        third.submit().unwrap();
        registry
            .handle_package(sender, header(23, 3), Bytes::from_static(b"c"))
            .await;
        poller.poll(Duration::from_secs(1)).await.unwrap();
        let fired = poller.get_triggered_event().unwrap();
        assert_eq!(fired.read_output().unwrap(), Bytes::from_static(b"c"));
    }

    #[tokio::test]
    async fn test_dropped_poller_detaches_pending_events() {
        let registry = Arc::new(PackageListenerRegistry::new());
        {
            let mut poller = Poller::new(registry.clone());
            let event = poller.create_event(EventKind::PackageWithSeqId {
                pkg_id: 9,
                seq_id: 1,
            });
            event.submit().unwrap();
        }
        // Late reply arrives after the poller is gone: delivered and
        // ignored, never a panic.
        let sender = EvlClient::detached(ClientType::Client);
        registry
            .handle_package(sender, header(9, 1), Bytes::new())
            .await;
    }

    #[tokio::test]
    async fn test_event_input_output_buffers() {
        let registry = Arc::new(PackageListenerRegistry::new());
        let mut poller = Poller::new(registry);
        let event = poller.create_event(EventKind::Package { pkg_id: 2 });
        event.write_input(Bytes::from_static(b"request"));
        assert_eq!(event.read_input().unwrap(), Bytes::from_static(b"request"));
        assert!(event.read_output().is_none());
        event.write_output(Bytes::from_static(b"reply"));
        assert_eq!(event.read_output().unwrap(), Bytes::from_static(b"reply"));
    }
}
