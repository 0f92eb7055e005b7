// Broadcaster registration and fan-out
//
// A broadcaster keeps an ordered list of (weak listener, mask) pairs. Dispatch
// snapshots the live pairs under the registration lock and enqueues outside
// of it, so a slow consumer never holds up Subscribe/Unsubscribe.
//
// Lock order: registration lock, then a listener's registration set.
// Listener handles upgraded under the registration lock are never dropped
// while it is held.

use crate::error::{EventError, EventResult};
use crate::event::{Event, EventPayload, EventTypeMask, WatchpointEventType};
use crate::listener::{Listener, ListenerShared, WeakListener};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcasterId(pub u64);

impl fmt::Display for BroadcasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&Broadcaster> for BroadcasterId {
    fn from(broadcaster: &Broadcaster) -> Self {
        broadcaster.id()
    }
}

struct Subscription {
    listener: Weak<ListenerShared>,
    mask: EventTypeMask,
}

impl Subscription {
    fn is_for(&self, listener: &Listener) -> bool {
        Weak::as_ptr(&self.listener) == Arc::as_ptr(&listener.shared)
    }

    fn is_live(&self) -> bool {
        self.listener.strong_count() > 0
    }
}

pub(crate) struct BroadcasterShared {
    id: BroadcasterId,
    name: String,
    subscriptions: RwLock<Vec<Subscription>>,
    // Serializes fan-out and holds the last sequence number handed out
    dispatch: Mutex<u64>,
    defunct: AtomicBool,
}

impl BroadcasterShared {
    /// Forget subscriptions whose listener is gone
    pub(crate) fn prune_dead(&self) {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(Subscription::is_live);
        let pruned = before - subscriptions.len();
        if pruned > 0 {
            debug!("Broadcaster {} pruned {} dead listener(s)", self.name, pruned);
        }
    }

    fn stale_error(&self) -> EventError {
        EventError::StaleBroadcaster {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

impl Drop for BroadcasterShared {
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().drain(..) {
            if let Some(listener) = subscription.listener.upgrade() {
                listener.note_unsubscribed(self.id);
            }
        }
    }
}

/// Outcome of a single broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub sequence: u64,
    pub delivered: usize,
    pub overflows: Vec<EventError>,
}

impl DispatchReport {
    pub fn dropped(&self) -> usize {
        self.overflows.len()
    }

    /// Treat any dropped delivery as a failure
    pub fn into_result(mut self) -> EventResult<Self> {
        if self.overflows.is_empty() {
            Ok(self)
        } else {
            Err(self.overflows.swap_remove(0))
        }
    }
}

/// Event source owned by a watched entity
///
/// Clones share the same registration list and identity.
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<BroadcasterShared>,
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("listeners", &self.listener_count())
            .field("defunct", &self.is_defunct())
            .finish()
    }
}

impl Broadcaster {
    pub fn new(id: BroadcasterId, name: impl Into<String>) -> Self {
        let name = name.into();
        debug!("Creating broadcaster {} ({})", name, id);
        Self {
            shared: Arc::new(BroadcasterShared {
                id,
                name,
                subscriptions: RwLock::new(Vec::new()),
                dispatch: Mutex::new(0),
                defunct: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> BroadcasterId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_defunct(&self) -> bool {
        self.shared.defunct.load(Ordering::Acquire)
    }

    /// Register `listener` for `mask`, replacing any mask it already had here
    ///
    /// An empty mask removes the subscription. Returns the mask now in effect.
    pub fn subscribe(&self, listener: &Listener, mask: EventTypeMask) -> EventResult<EventTypeMask> {
        self.update_subscription(listener, |_| mask)
            .map(|(_, new)| new)
    }

    pub fn subscribe_weak(
        &self,
        listener: &WeakListener,
        mask: EventTypeMask,
    ) -> EventResult<EventTypeMask> {
        let listener = listener.upgrade().ok_or(EventError::InvalidListener)?;
        self.subscribe(&listener, mask)
    }

    /// Add `mask` to whatever `listener` is already subscribed to
    pub fn add_to_subscription(
        &self,
        listener: &Listener,
        mask: EventTypeMask,
    ) -> EventResult<EventTypeMask> {
        self.update_subscription(listener, |current| current | mask)
            .map(|(_, new)| new)
    }

    /// Remove `listener` entirely. Returns whether it was subscribed.
    pub fn unsubscribe(&self, listener: &Listener) -> bool {
        self.unsubscribe_mask(listener, EventTypeMask::ALL)
    }

    /// Narrow `listener`'s subscription by `mask`. Returns whether it changed.
    pub fn unsubscribe_mask(&self, listener: &Listener, mask: EventTypeMask) -> bool {
        match self.update_subscription(listener, |current| current & !mask) {
            Ok((old, new)) => old != new,
            Err(_) => false,
        }
    }

    pub fn subscription_mask(&self, listener: &Listener) -> Option<EventTypeMask> {
        self.shared
            .subscriptions
            .read()
            .iter()
            .find(|s| s.is_for(listener))
            .map(|s| s.mask)
    }

    /// Whether any live listener would receive an event in `mask`
    pub fn event_type_has_listeners(&self, mask: EventTypeMask) -> bool {
        self.shared
            .subscriptions
            .read()
            .iter()
            .any(|s| s.is_live() && s.mask.intersects(mask))
    }

    pub fn listener_count(&self) -> usize {
        self.shared
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.is_live())
            .count()
    }

    /// Build an event and deliver it to every live subscriber whose mask
    /// includes `event_type`, in registration order
    pub fn broadcast(
        &self,
        event_type: WatchpointEventType,
        payload: Option<EventPayload>,
    ) -> EventResult<DispatchReport> {
        let mut dispatch = self.begin_dispatch().map_err(|e| {
            warn!(
                "Broadcast of {} on destroyed broadcaster {}",
                event_type, self.shared.name
            );
            e
        })?;
        Ok(dispatch.broadcast(event_type, payload))
    }

    /// Take the dispatch lock of a live broadcaster
    ///
    /// `destroy()` cannot complete while the guard is held, so a caller can
    /// commit a state change and announce it without the broadcaster going
    /// stale in between.
    pub fn begin_dispatch(&self) -> EventResult<DispatchGuard<'_>> {
        let sequence = self.shared.dispatch.lock();
        if self.is_defunct() {
            return Err(self.shared.stale_error());
        }
        Ok(DispatchGuard {
            shared: &self.shared,
            sequence,
        })
    }

    /// Tear down the registration list and refuse further use
    ///
    /// Every subscribed listener forgets this broadcaster. Idempotent.
    pub fn destroy(&self) {
        // Wait out an in-flight fan-out before clearing
        let _dispatch = self.shared.dispatch.lock();
        let mut released = Vec::new();
        {
            let mut subscriptions = self.shared.subscriptions.write();
            if self.shared.defunct.swap(true, Ordering::AcqRel) {
                return;
            }
            for subscription in subscriptions.drain(..) {
                if let Some(listener) = subscription.listener.upgrade() {
                    listener.note_unsubscribed(self.shared.id);
                    released.push(listener);
                }
            }
        }
        info!(
            "Broadcaster {} ({}) destroyed, released {} listener(s)",
            self.shared.name,
            self.shared.id,
            released.len()
        );
    }

    // Apply `f` to the current mask under the registration lock.
    // Returns (old, new).
    fn update_subscription(
        &self,
        listener: &Listener,
        f: impl FnOnce(EventTypeMask) -> EventTypeMask,
    ) -> EventResult<(EventTypeMask, EventTypeMask)> {
        let mut subscriptions = self.shared.subscriptions.write();

        if self.is_defunct() {
            warn!(
                "Subscription change for '{}' on destroyed broadcaster {}",
                listener.name(),
                self.shared.name
            );
            return Err(self.shared.stale_error());
        }

        subscriptions.retain(Subscription::is_live);

        let position = subscriptions.iter().position(|s| s.is_for(listener));
        let old = position
            .map(|i| subscriptions[i].mask)
            .unwrap_or(EventTypeMask::NONE);
        let new = f(old) & EventTypeMask::ALL;

        match (position, new.is_empty()) {
            (Some(i), true) => {
                subscriptions.remove(i);
                listener.shared.note_unsubscribed(self.shared.id);
            }
            (Some(i), false) => {
                subscriptions[i].mask = new;
            }
            (None, true) => {}
            (None, false) => {
                subscriptions.push(Subscription {
                    listener: Arc::downgrade(&listener.shared),
                    mask: new,
                });
                listener
                    .shared
                    .note_subscribed(self.shared.id, Arc::downgrade(&self.shared));
            }
        }

        if old != new {
            debug!(
                "Listener '{}' on broadcaster {}: {} -> {}",
                listener.name(),
                self.shared.name,
                old,
                new
            );
        }

        Ok((old, new))
    }
}

/// Dispatch lock on a broadcaster known to be live
pub struct DispatchGuard<'a> {
    shared: &'a BroadcasterShared,
    sequence: MutexGuard<'a, u64>,
}

impl DispatchGuard<'_> {
    pub fn broadcast(
        &mut self,
        event_type: WatchpointEventType,
        payload: Option<EventPayload>,
    ) -> DispatchReport {
        let targets: Vec<Arc<ListenerShared>> = self
            .shared
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.mask.includes(event_type))
            .filter_map(|s| s.listener.upgrade())
            .collect();

        *self.sequence += 1;
        let event = Arc::new(Event::new(
            self.shared.id,
            *self.sequence,
            event_type,
            payload,
        ));

        let mut report = DispatchReport {
            sequence: *self.sequence,
            delivered: 0,
            overflows: Vec::new(),
        };

        for listener in targets {
            match listener.enqueue(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(e) => report.overflows.push(e),
            }
        }

        debug!(
            "Broadcaster {} dispatched {}: delivered={}, dropped={}",
            self.shared.name,
            event,
            report.delivered,
            report.dropped()
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverflowPolicy, QueueConfig};
    use std::time::Duration;

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(BroadcasterId(7), "test-target")
    }

    #[test]
    fn test_resubscribe_overwrites_mask() {
        let b = broadcaster();
        let listener = Listener::new("l");

        b.subscribe(&listener, EventTypeMask::ADDED | EventTypeMask::REMOVED)
            .unwrap();
        let mask = b.subscribe(&listener, EventTypeMask::DISABLED).unwrap();

        assert_eq!(mask, EventTypeMask::DISABLED);
        assert_eq!(b.listener_count(), 1);
        assert_eq!(b.subscription_mask(&listener), Some(EventTypeMask::DISABLED));
    }

    #[test]
    fn test_add_to_subscription_unions() {
        let b = broadcaster();
        let listener = Listener::new("l");

        b.subscribe(&listener, EventTypeMask::ADDED).unwrap();
        let mask = b
            .add_to_subscription(&listener, EventTypeMask::REMOVED)
            .unwrap();

        assert_eq!(mask, EventTypeMask::ADDED | EventTypeMask::REMOVED);
        assert_eq!(b.listener_count(), 1);
    }

    #[test]
    fn test_unsubscribe_is_noop_when_not_subscribed() {
        let b = broadcaster();
        let listener = Listener::new("l");

        assert!(!b.unsubscribe(&listener));
        assert!(!b.unsubscribe_mask(&listener, EventTypeMask::ADDED));
        assert_eq!(b.listener_count(), 0);
    }

    #[test]
    fn test_narrowing_to_empty_removes_entry() {
        let b = broadcaster();
        let listener = Listener::new("l");

        b.subscribe(&listener, EventTypeMask::ADDED | EventTypeMask::REMOVED)
            .unwrap();
        assert!(b.unsubscribe_mask(&listener, EventTypeMask::ADDED));
        assert_eq!(b.subscription_mask(&listener), Some(EventTypeMask::REMOVED));
        assert!(listener.is_listening_to(b.id()));

        assert!(b.unsubscribe_mask(&listener, EventTypeMask::REMOVED));
        assert_eq!(b.subscription_mask(&listener), None);
        assert!(!listener.is_listening_to(b.id()));
    }

    #[test]
    fn test_empty_mask_subscribe_unsubscribes() {
        let b = broadcaster();
        let listener = Listener::new("l");

        b.subscribe(&listener, EventTypeMask::ADDED).unwrap();
        let mask = b.subscribe(&listener, EventTypeMask::NONE).unwrap();

        assert!(mask.is_empty());
        assert_eq!(b.listener_count(), 0);
    }

    #[test]
    fn test_broadcast_filters_by_mask() {
        let b = broadcaster();
        let toggles = Listener::new("toggles");
        let everything = Listener::new("everything");

        b.subscribe(&toggles, EventTypeMask::ENABLED | EventTypeMask::DISABLED)
            .unwrap();
        b.subscribe(&everything, EventTypeMask::ALL).unwrap();

        let report = b
            .broadcast(WatchpointEventType::ConditionChanged, None)
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert!(toggles.is_empty());
        assert_eq!(everything.len(), 1);

        let report = b.broadcast(WatchpointEventType::Disabled, None).unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.sequence, 2);
        assert_eq!(
            toggles.get_next_event().unwrap().event_type(),
            WatchpointEventType::Disabled
        );
    }

    #[test]
    fn test_dead_listener_is_skipped_and_pruned() {
        let b = broadcaster();
        let survivor = Listener::new("survivor");
        {
            let doomed = Listener::new("doomed");
            b.subscribe(&doomed, EventTypeMask::ALL).unwrap();
            b.subscribe(&survivor, EventTypeMask::ALL).unwrap();
            assert_eq!(b.listener_count(), 2);
        }

        assert_eq!(b.listener_count(), 1);
        let report = b.broadcast(WatchpointEventType::Added, None).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(survivor.len(), 1);
    }

    #[test]
    fn test_invalid_weak_listener_rejected() {
        let b = broadcaster();
        let weak = Listener::new("gone").downgrade();

        assert_eq!(
            b.subscribe_weak(&weak, EventTypeMask::ADDED),
            Err(EventError::InvalidListener)
        );
        assert_eq!(b.listener_count(), 0);
    }

    #[test]
    fn test_destroyed_broadcaster_is_stale() {
        let b = broadcaster();
        let listener = Listener::new("l");
        b.subscribe(&listener, EventTypeMask::ALL).unwrap();

        b.destroy();
        b.destroy();

        assert!(b.is_defunct());
        assert!(!listener.is_listening_to(b.id()));
        assert!(matches!(
            b.broadcast(WatchpointEventType::Added, None),
            Err(EventError::StaleBroadcaster { .. })
        ));
        assert!(matches!(
            b.subscribe(&listener, EventTypeMask::ALL),
            Err(EventError::StaleBroadcaster { .. })
        ));
        assert!(!b.unsubscribe(&listener));
        assert!(listener.is_empty());
    }

    #[test]
    fn test_dropping_last_handle_releases_listeners() {
        let listener = Listener::new("l");
        {
            let b = broadcaster();
            b.subscribe(&listener, EventTypeMask::ALL).unwrap();
            assert!(listener.is_listening_to(BroadcasterId(7)));
        }
        assert!(listener.broadcasters().is_empty());
    }

    #[test]
    fn test_overflow_does_not_abort_fanout() {
        let b = broadcaster();
        let tiny = Listener::with_config(
            "tiny",
            QueueConfig {
                capacity: 1,
                overflow: OverflowPolicy::Drop,
                ..QueueConfig::default()
            },
        )
        .unwrap();
        let roomy = Listener::new("roomy");

        b.subscribe(&tiny, EventTypeMask::ALL).unwrap();
        b.subscribe(&roomy, EventTypeMask::ALL).unwrap();

        b.broadcast(WatchpointEventType::Added, None).unwrap();
        let report = b.broadcast(WatchpointEventType::Disabled, None).unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped(), 1);
        assert_eq!(roomy.len(), 2);
        assert_eq!(tiny.len(), 1);
        assert_eq!(tiny.dropped_events(), 1);
        assert!(matches!(
            report.into_result(),
            Err(EventError::QueueOverflow { dropped: 1, .. })
        ));
    }

    #[test]
    fn test_concurrent_registration_and_broadcast() {
        let b = broadcaster();
        let steady = Listener::new("steady");
        b.subscribe(&steady, EventTypeMask::ALL).unwrap();

        let churn = Listener::new("churn");
        let rounds = 500;

        std::thread::scope(|scope| {
            let producer = b.clone();
            scope.spawn(move || {
                for _ in 0..rounds {
                    producer.broadcast(WatchpointEventType::Added, None).unwrap();
                }
            });

            let registrar = b.clone();
            let churn = churn.clone();
            scope.spawn(move || {
                for i in 0..rounds {
                    if i % 2 == 0 {
                        registrar.subscribe(&churn, EventTypeMask::ADDED).unwrap();
                    } else {
                        registrar.unsubscribe(&churn);
                    }
                }
                registrar.subscribe(&churn, EventTypeMask::REMOVED).unwrap();
            });
        });

        // Steady listener saw every broadcast exactly once, in order
        let mut expected = 1;
        while let Some(event) = steady.get_next_event() {
            assert_eq!(event.sequence(), expected);
            expected += 1;
        }
        assert_eq!(expected - 1, rounds as u64);

        // Churned listener saw no duplicates and ends with the last mask applied
        let mut last = 0;
        while let Some(event) = churn.get_next_event() {
            assert!(event.sequence() > last);
            last = event.sequence();
        }
        assert_eq!(b.subscription_mask(&churn), Some(EventTypeMask::REMOVED));
        assert_eq!(b.listener_count(), 2);
    }

    #[test]
    fn test_broadcast_blocks_until_consumer_drains() {
        let b = broadcaster();
        let listener = Listener::with_config(
            "slow",
            QueueConfig {
                capacity: 1,
                overflow: OverflowPolicy::Block,
                block_timeout_ms: 5_000,
            },
        )
        .unwrap();
        b.subscribe(&listener, EventTypeMask::ALL).unwrap();
        b.broadcast(WatchpointEventType::Added, None).unwrap();

        std::thread::scope(|scope| {
            let consumer = listener.clone();
            scope.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                assert!(consumer.get_next_event().is_some());
            });

            let report = b.broadcast(WatchpointEventType::Removed, None).unwrap();
            assert_eq!(report.delivered, 1);
            assert_eq!(report.dropped(), 0);
        });

        assert_eq!(
            listener.get_next_event().unwrap().event_type(),
            WatchpointEventType::Removed
        );
        assert_eq!(listener.dropped_events(), 0);
    }

    #[test]
    fn test_listener_drops_during_broadcasts() {
        let b = broadcaster();
        let rounds = 2_000;

        std::thread::scope(|scope| {
            let producer = b.clone();
            scope.spawn(move || {
                for _ in 0..rounds {
                    producer.broadcast(WatchpointEventType::Added, None).unwrap();
                }
            });

            let registrar = b.clone();
            scope.spawn(move || {
                for i in 0..rounds {
                    let listener = Listener::new(format!("short-lived-{}", i));
                    registrar.subscribe(&listener, EventTypeMask::ALL).unwrap();
                }
            });
        });

        assert_eq!(b.listener_count(), 0);
        assert_eq!(b.broadcast(WatchpointEventType::Added, None).unwrap().delivered, 0);
    }

    #[test]
    fn test_destroy_waits_for_in_flight_dispatch() {
        let b = broadcaster();
        let stalled = Listener::with_config(
            "stalled",
            QueueConfig {
                capacity: 1,
                overflow: OverflowPolicy::Block,
                block_timeout_ms: 200,
            },
        )
        .unwrap();
        let watcher = Listener::new("watcher");
        b.subscribe(&stalled, EventTypeMask::ALL).unwrap();
        b.subscribe(&watcher, EventTypeMask::ALL).unwrap();
        b.broadcast(WatchpointEventType::Added, None).unwrap();

        let report = std::thread::scope(|scope| {
            let destroyer = b.clone();
            scope.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                destroyer.destroy();
            });
            b.broadcast(WatchpointEventType::Removed, None)
        });

        let report = report.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped(), 1);
        assert!(b.is_defunct());
        assert_eq!(b.listener_count(), 0);
        assert_eq!(watcher.len(), 2);
        assert!(watcher.broadcasters().is_empty());
    }
}
