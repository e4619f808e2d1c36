//! Package listener registry: routes every fully decoded package to at
//! most one registered notifier and to the poller events waiting for
//! that package id.
//!
//! Dispatch order for one package: pending generic events are dequeued
//! first, then the bucket matching the package's sequence id; the
//! notifier runs once with the scoped triggered queue; finally every
//! dequeued event fires. The sequence-id bucket is double-buffered so
//! an event submitted while a package is being dispatched lands in the
//! next generation and can never be consumed by the package currently
//! in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::client::EvlClient;
use crate::error::{BusError, Result};
use crate::package::PackageHeader;
use crate::poller::{EventKind, PollerEvent};

/// Callback invoked in the reactor's dispatch path whenever a package
/// of the registered id is fully decoded.
#[async_trait]
pub trait PackageListener: Send + Sync {
    /// Returns `true` when the package was handled.
    async fn on_package(
        &self,
        sender: EvlClient,
        header: PackageHeader,
        payload: Bytes,
        triggered: &TriggeredPkgQueue,
    ) -> bool;
}

/// The scoped queue of poller events interested in one exact package,
/// handed to the notifier during dispatch.
pub struct TriggeredPkgQueue {
    events: Mutex<VecDeque<PollerEvent>>,
}

impl TriggeredPkgQueue {
    fn new(events: VecDeque<PollerEvent>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    /// Pop the next triggered event; `None` means no more pending.
    pub fn dequeue(&self) -> Option<PollerEvent> {
        self.events.lock().expect("triggered queue poisoned").pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().expect("triggered queue poisoned").is_empty()
    }
}

#[derive(Default)]
struct PendingSet {
    generic: VecDeque<PollerEvent>,
    by_seq: HashMap<u32, VecDeque<PollerEvent>>,
    /// Next-generation seqid bucket, filled while `dispatching`.
    next_by_seq: HashMap<u32, VecDeque<PollerEvent>>,
    dispatching: bool,
}

impl PendingSet {
    fn is_empty(&self) -> bool {
        self.generic.is_empty() && self.by_seq.is_empty() && self.next_by_seq.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    notifiers: HashMap<u32, Arc<dyn PackageListener>>,
    pending: HashMap<u32, PendingSet>,
}

/// Maps package ids to notifiers and to queues of pending poller
/// events. One notifier per package id.
#[derive(Default)]
pub struct PackageListenerRegistry {
    state: Mutex<RegistryState>,
}

impl PackageListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the notifier for a package id.
    pub fn add_package_listener(
        &self,
        pkg_id: u32,
        listener: Arc<dyn PackageListener>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("listener registry poisoned");
        if state.notifiers.contains_key(&pkg_id) {
            return Err(BusError::ListenerExists(pkg_id));
        }
        state.notifiers.insert(pkg_id, listener);
        Ok(())
    }

    pub fn remove_package_listener(&self, pkg_id: u32) {
        let mut state = self.state.lock().expect("listener registry poisoned");
        state.notifiers.remove(&pkg_id);
    }

    /// Link a submitted poller event into the pending set for its
    /// package id.
    pub(crate) fn submit_event(&self, event: PollerEvent) {
        let mut state = self.state.lock().expect("listener registry poisoned");
        match event.kind() {
            EventKind::Package { pkg_id } => {
                state
                    .pending
                    .entry(pkg_id)
                    .or_default()
                    .generic
                    .push_back(event);
            }
            EventKind::PackageWithSeqId { pkg_id, seq_id } => {
                let set = state.pending.entry(pkg_id).or_default();
                let bucket = if set.dispatching {
                    set.next_by_seq.entry(seq_id).or_default()
                } else {
                    set.by_seq.entry(seq_id).or_default()
                };
                bucket.push_back(event);
            }
        }
    }

    /// Unlink a pending event (poller cancelled before it triggered).
    pub(crate) fn detach_event(&self, event: &PollerEvent) {
        let mut state = self.state.lock().expect("listener registry poisoned");
        let (pkg_id, seq_id) = match event.kind() {
            EventKind::Package { pkg_id } => (pkg_id, None),
            EventKind::PackageWithSeqId { pkg_id, seq_id } => (pkg_id, Some(seq_id)),
        };
        let Some(set) = state.pending.get_mut(&pkg_id) else {
            return;
        };
        match seq_id {
            None => set.generic.retain(|e| e != event),
            Some(sq) => {
                for bucket in [&mut set.by_seq, &mut set.next_by_seq] {
                    if let Some(q) = bucket.get_mut(&sq) {
                        q.retain(|e| e != event);
                        if q.is_empty() {
                            bucket.remove(&sq);
                        }
                    }
                }
            }
        }
        if set.is_empty() {
            state.pending.remove(&pkg_id);
        }
    }

    /// Dispatch one fully decoded package.
    ///
    /// Dispatch to an unknown package id is a no-op rather than an
    /// error, so old peers keep working when the protocol grows.
    pub async fn handle_package(&self, sender: EvlClient, header: PackageHeader, payload: Bytes) {
        let (notifier, dequeued) = {
            let mut state = self.state.lock().expect("listener registry poisoned");
            let notifier = state.notifiers.get(&header.pkg_id).cloned();

            let mut dequeued = VecDeque::new();
            if let Some(set) = state.pending.get_mut(&header.pkg_id) {
                set.dispatching = true;
                dequeued.append(&mut set.generic);
                if let Some(mut specific) = set.by_seq.remove(&header.seq_id) {
                    dequeued.append(&mut specific);
                }
            }
            (notifier, dequeued)
        };

        if notifier.is_none() && dequeued.is_empty() {
            trace!(pkg_id = header.pkg_id, "no listener for package, ignoring");
            self.finish_dispatch(header.pkg_id);
            return;
        }

        // Pre-fill each event with the triggering package before the
        // notifier sees the queue; the notifier may overwrite.
        for event in &dequeued {
            event.set_trigger(sender.clone(), payload.clone());
        }

        let queue = TriggeredPkgQueue::new(dequeued.clone());
        if let Some(notifier) = notifier {
            notifier
                .on_package(sender.clone(), header, payload, &queue)
                .await;
        }

        for event in dequeued {
            event.fire();
        }
        self.finish_dispatch(header.pkg_id);
    }

    /// Rotate the next-generation seqid bucket in after a dispatch.
    fn finish_dispatch(&self, pkg_id: u32) {
        let mut state = self.state.lock().expect("listener registry poisoned");
        if let Some(set) = state.pending.get_mut(&pkg_id) {
            set.dispatching = false;
            let next: Vec<(u32, VecDeque<PollerEvent>)> = set.next_by_seq.drain().collect();
            for (seq, mut queue) in next {
                set.by_seq.entry(seq).or_default().append(&mut queue);
            }
            if set.is_empty() {
                state.pending.remove(&pkg_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientType;
    use crate::poller::Poller;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingListener {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl PackageListener for CountingListener {
        async fn on_package(
            &self,
            _sender: EvlClient,
            _header: PackageHeader,
            _payload: Bytes,
            _triggered: &TriggeredPkgQueue,
        ) -> bool {
            self.hits.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    fn header(pkg_id: u32, seq_id: u32) -> PackageHeader {
        PackageHeader {
            pkg_id,
            seq_id,
            size: 0,
        }
    }

    #[tokio::test]
    async fn test_notifier_invoked_once_per_package() {
        let registry = Arc::new(PackageListenerRegistry::new());
        let listener = Arc::new(CountingListener {
            hits: AtomicUsize::new(0),
        });
        registry.add_package_listener(42, listener.clone()).unwrap();

        let sender = EvlClient::detached(ClientType::Client);
        registry
            .handle_package(sender.clone(), header(42, 1), Bytes::new())
            .await;
        registry
            .handle_package(sender, header(42, 2), Bytes::new())
            .await;
        assert_eq!(listener.hits.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_duplicate_listener_rejected() {
        let registry = PackageListenerRegistry::new();
        let l = Arc::new(CountingListener {
            hits: AtomicUsize::new(0),
        });
        registry.add_package_listener(7, l.clone()).unwrap();
        assert!(matches!(
            registry.add_package_listener(7, l),
            Err(BusError::ListenerExists(7))
        ));
    }

    #[tokio::test]
    async fn test_unknown_package_is_noop() {
        let registry = PackageListenerRegistry::new();
        let sender = EvlClient::detached(ClientType::Client);
        // Must not panic or error.
        registry
            .handle_package(sender, header(999, 5), Bytes::from_static(b"x"))
            .await;
    }

    #[tokio::test]
    async fn test_seq_specific_event_only_matches_its_sequence() {
        let registry = Arc::new(PackageListenerRegistry::new());
        let mut poller = Poller::new(registry.clone());
        let event = poller.create_event(EventKind::PackageWithSeqId {
            pkg_id: 10,
            seq_id: 77,
        });
        event.submit().unwrap();

        let sender = EvlClient::detached(ClientType::Client);
        // Wrong sequence id: event must stay pending.
        registry
            .handle_package(sender.clone(), header(10, 76), Bytes::new())
            .await;
        assert!(matches!(
            poller.poll(Duration::from_millis(20)).await,
            Err(BusError::Timeout(_))
        ));

        registry
            .handle_package(sender, header(10, 77), Bytes::from_static(b"reply"))
            .await;
        poller.poll(Duration::from_millis(100)).await.unwrap();
        let fired = poller.get_triggered_event().unwrap();
        assert_eq!(fired.read_output().unwrap(), Bytes::from_static(b"reply"));
    }
}
