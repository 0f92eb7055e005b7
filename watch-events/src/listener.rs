// Listener queue and wait primitives
//
// Each listener owns a FIFO behind its own monitor. Broadcasters enqueue and
// signal `not_empty` under the queue lock, so a waiter that checked the queue
// and went to sleep cannot miss the wakeup.

use crate::broadcaster::{Broadcaster, BroadcasterId, BroadcasterShared};
use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{EventError, EventResult};
use crate::event::{Event, EventTypeMask};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub(crate) struct ListenerShared {
    name: String,
    config: QueueConfig,
    queue: Mutex<VecDeque<Arc<Event>>>,
    not_empty: Condvar,
    not_full: Condvar,
    broadcasters: Mutex<Vec<(BroadcasterId, Weak<BroadcasterShared>)>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ListenerShared {
    /// Append `event`, honoring the overflow policy
    pub(crate) fn enqueue(&self, event: Arc<Event>) -> EventResult<()> {
        let mut queue = self.queue.lock();

        if queue.len() >= self.config.capacity && self.config.overflow == OverflowPolicy::Block {
            let deadline = Instant::now() + self.config.block_timeout();
            while queue.len() >= self.config.capacity {
                if self.not_full.wait_until(&mut queue, deadline).timed_out() {
                    break;
                }
            }
        }

        if queue.len() >= self.config.capacity {
            drop(queue);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Listener '{}' queue full ({} events), dropped {} (total dropped: {})",
                self.name, self.config.capacity, event, dropped
            );
            return Err(EventError::QueueOverflow {
                listener: self.name.clone(),
                dropped,
            });
        }

        queue.push_back(event);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_all();
        Ok(())
    }

    pub(crate) fn note_subscribed(&self, id: BroadcasterId, broadcaster: Weak<BroadcasterShared>) {
        let mut broadcasters = self.broadcasters.lock();
        if !broadcasters.iter().any(|(existing, _)| *existing == id) {
            broadcasters.push((id, broadcaster));
        }
    }

    pub(crate) fn note_unsubscribed(&self, id: BroadcasterId) {
        self.broadcasters.lock().retain(|(existing, _)| *existing != id);
    }

    // Remove the first event matching `filter`, waking blocked producers
    fn take_first(
        &self,
        queue: &mut VecDeque<Arc<Event>>,
        filter: &impl Fn(&Event) -> bool,
    ) -> Option<Arc<Event>> {
        let position = queue.iter().position(|e| filter(&**e))?;
        let event = queue.remove(position);
        self.not_full.notify_all();
        event
    }
}

impl Drop for ListenerShared {
    fn drop(&mut self) {
        for (_, broadcaster) in self.broadcasters.get_mut().drain(..) {
            if let Some(broadcaster) = broadcaster.upgrade() {
                broadcaster.prune_dead();
            }
        }
        debug!("Listener '{}' destroyed", self.name);
    }
}

/// Consumer endpoint for broadcaster events
///
/// Clones share one queue, so several threads may drain the same listener.
/// Dropping the last clone unregisters it from every broadcaster.
#[derive(Clone)]
pub struct Listener {
    pub(crate) shared: Arc<ListenerShared>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.shared.name)
            .field("queued", &self.len())
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

impl Listener {
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), QueueConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: QueueConfig) -> EventResult<Self> {
        config.validate()?;
        Ok(Self::build(name.into(), config))
    }

    pub(crate) fn build(name: String, config: QueueConfig) -> Self {
        debug!("Creating listener '{}' (capacity={})", name, config.capacity);
        Self {
            shared: Arc::new(ListenerShared {
                name,
                queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(64))),
                config,
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                broadcasters: Mutex::new(Vec::new()),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn downgrade(&self) -> WeakListener {
        WeakListener {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Extend this listener's subscription on `broadcaster` by `mask`
    pub fn start_listening_for_events(
        &self,
        broadcaster: &Broadcaster,
        mask: EventTypeMask,
    ) -> EventResult<EventTypeMask> {
        broadcaster.add_to_subscription(self, mask)
    }

    /// Drop `mask` from this listener's subscription on `broadcaster`
    pub fn stop_listening_for_events(&self, broadcaster: &Broadcaster, mask: EventTypeMask) -> bool {
        broadcaster.unsubscribe_mask(self, mask)
    }

    /// Broadcasters this listener is currently registered with
    pub fn broadcasters(&self) -> Vec<BroadcasterId> {
        self.shared
            .broadcasters
            .lock()
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_listening_to(&self, broadcaster: BroadcasterId) -> bool {
        self.shared
            .broadcasters
            .lock()
            .iter()
            .any(|(id, _)| *id == broadcaster)
    }

    /// Block until an event is queued or `timeout` elapses, then pop it
    pub fn wait_for_event(&self, timeout: Duration) -> Option<Arc<Event>> {
        self.wait_matching(timeout, |_| true)
    }

    /// Like `wait_for_event`, but only for events from `broadcaster` in `mask`
    ///
    /// Non-matching events stay queued in order.
    pub fn wait_for_event_for_broadcaster_with_type(
        &self,
        timeout: Duration,
        broadcaster: impl Into<BroadcasterId>,
        mask: EventTypeMask,
    ) -> Option<Arc<Event>> {
        let broadcaster = broadcaster.into();
        self.wait_matching(timeout, |e| e.matches(broadcaster, mask))
    }

    pub fn get_next_event(&self) -> Option<Arc<Event>> {
        let mut queue = self.shared.queue.lock();
        self.shared.take_first(&mut queue, &|_: &Event| true)
    }

    pub fn get_next_event_for_broadcaster_with_type(
        &self,
        broadcaster: impl Into<BroadcasterId>,
        mask: EventTypeMask,
    ) -> Option<Arc<Event>> {
        let broadcaster = broadcaster.into();
        let mut queue = self.shared.queue.lock();
        self.shared
            .take_first(&mut queue, &|e: &Event| e.matches(broadcaster, mask))
    }

    pub fn peek_at_next_event(&self) -> Option<Arc<Event>> {
        self.shared.queue.lock().front().cloned()
    }

    /// Oldest queued event from `broadcaster` in `mask`, left in place
    pub fn peek_at_next_event_for_broadcaster_with_type(
        &self,
        broadcaster: impl Into<BroadcasterId>,
        mask: EventTypeMask,
    ) -> Option<Arc<Event>> {
        let broadcaster = broadcaster.into();
        self.shared
            .queue
            .lock()
            .iter()
            .find(|e| e.matches(broadcaster, mask))
            .cloned()
    }

    /// Discard everything queued. Returns how many events were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.shared.queue.lock();
        let cleared = queue.len();
        queue.clear();
        self.shared.not_full.notify_all();
        cleared
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }

    pub fn delivered_events(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Events lost to a full queue since this listener was created
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn wait_matching(
        &self,
        timeout: Duration,
        filter: impl Fn(&Event) -> bool,
    ) -> Option<Arc<Event>> {
        // A timeout too large for Instant waits without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let mut queue = self.shared.queue.lock();
        let mut timed_out = false;

        loop {
            if let Some(event) = self.shared.take_first(&mut queue, &filter) {
                return Some(event);
            }
            if timed_out {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    timed_out = self.shared.not_empty.wait_until(&mut queue, deadline).timed_out();
                }
                None => self.shared.not_empty.wait(&mut queue),
            }
        }
    }
}

/// Non-owning listener handle
#[derive(Clone, Default)]
pub struct WeakListener {
    shared: Weak<ListenerShared>,
}

impl WeakListener {
    pub fn upgrade(&self) -> Option<Listener> {
        self.shared.upgrade().map(|shared| Listener { shared })
    }

    pub fn is_valid(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl fmt::Debug for WeakListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakListener")
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WatchpointEventType;

    fn setup() -> (Broadcaster, Listener) {
        let broadcaster = Broadcaster::new(BroadcasterId(1), "target");
        let listener = Listener::new("test-listener");
        broadcaster.subscribe(&listener, EventTypeMask::ALL).unwrap();
        (broadcaster, listener)
    }

    #[test]
    fn test_wait_returns_queued_event_immediately() {
        let (b, listener) = setup();
        b.broadcast(WatchpointEventType::Added, None).unwrap();

        let start = Instant::now();
        let event = listener.wait_for_event(Duration::from_secs(5)).unwrap();
        assert_eq!(event.event_type(), WatchpointEventType::Added);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out_on_idle_broadcaster() {
        let (_b, listener) = setup();

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        assert!(listener.wait_for_event(timeout).is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(2));
    }

    #[test]
    fn test_wait_wakes_for_event_within_window() {
        let (b, listener) = setup();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                b.broadcast(WatchpointEventType::Disabled, None).unwrap();
            });

            let event = listener.wait_for_event(Duration::from_secs(5));
            assert_eq!(event.unwrap().event_type(), WatchpointEventType::Disabled);
        });
    }

    #[test]
    fn test_zero_timeout_acts_as_poll() {
        let (b, listener) = setup();
        assert!(listener.wait_for_event(Duration::ZERO).is_none());

        b.broadcast(WatchpointEventType::Removed, None).unwrap();
        assert!(listener.wait_for_event(Duration::ZERO).is_some());
    }

    #[test]
    fn test_fifo_order() {
        let (b, listener) = setup();
        let order = [
            WatchpointEventType::Added,
            WatchpointEventType::Disabled,
            WatchpointEventType::IgnoreChanged,
            WatchpointEventType::ConditionChanged,
        ];
        for event_type in order {
            b.broadcast(event_type, None).unwrap();
        }

        for event_type in order {
            assert_eq!(listener.get_next_event().unwrap().event_type(), event_type);
        }
        assert!(listener.get_next_event().is_none());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (b, listener) = setup();
        b.broadcast(WatchpointEventType::Added, None).unwrap();
        b.broadcast(WatchpointEventType::ConditionChanged, None).unwrap();

        let peeked = listener
            .peek_at_next_event_for_broadcaster_with_type(&b, EventTypeMask::CONDITION_CHANGED)
            .unwrap();
        assert_eq!(peeked.sequence(), 2);
        assert_eq!(listener.len(), 2);

        assert!(listener
            .peek_at_next_event_for_broadcaster_with_type(&b, EventTypeMask::REMOVED)
            .is_none());
        assert!(listener
            .peek_at_next_event_for_broadcaster_with_type(
                BroadcasterId(99),
                EventTypeMask::ALL
            )
            .is_none());

        assert_eq!(listener.peek_at_next_event().unwrap().sequence(), 1);
        assert_eq!(listener.len(), 2);
    }

    #[test]
    fn test_filtered_wait_leaves_other_events() {
        let (b, listener) = setup();
        let other = Broadcaster::new(BroadcasterId(2), "other");
        other.subscribe(&listener, EventTypeMask::ALL).unwrap();

        other.broadcast(WatchpointEventType::Added, None).unwrap();
        b.broadcast(WatchpointEventType::Removed, None).unwrap();

        let event = listener
            .wait_for_event_for_broadcaster_with_type(
                Duration::from_millis(10),
                &b,
                EventTypeMask::REMOVED,
            )
            .unwrap();
        assert_eq!(event.broadcaster(), b.id());

        let remaining = listener.get_next_event().unwrap();
        assert_eq!(remaining.broadcaster(), other.id());
        assert!(listener.is_empty());
    }

    #[test]
    fn test_get_next_event_for_broadcaster_with_type() {
        let (b, listener) = setup();
        b.broadcast(WatchpointEventType::Added, None).unwrap();
        b.broadcast(WatchpointEventType::Enabled, None).unwrap();

        let event = listener
            .get_next_event_for_broadcaster_with_type(&b, EventTypeMask::ENABLED)
            .unwrap();
        assert_eq!(event.event_type(), WatchpointEventType::Enabled);
        assert_eq!(listener.len(), 1);
    }

    #[test]
    fn test_start_and_stop_listening() {
        let b = Broadcaster::new(BroadcasterId(3), "target");
        let listener = Listener::new("l");

        listener
            .start_listening_for_events(&b, EventTypeMask::ADDED)
            .unwrap();
        let mask = listener
            .start_listening_for_events(&b, EventTypeMask::REMOVED)
            .unwrap();
        assert_eq!(mask, EventTypeMask::ADDED | EventTypeMask::REMOVED);
        assert_eq!(listener.broadcasters(), vec![BroadcasterId(3)]);

        assert!(listener.stop_listening_for_events(&b, EventTypeMask::ALL));
        assert!(listener.broadcasters().is_empty());
    }

    #[test]
    fn test_clear_and_counters() {
        let (b, listener) = setup();
        b.broadcast(WatchpointEventType::Added, None).unwrap();
        b.broadcast(WatchpointEventType::Removed, None).unwrap();

        assert_eq!(listener.delivered_events(), 2);
        assert_eq!(listener.clear(), 2);
        assert!(listener.is_empty());
        assert_eq!(listener.dropped_events(), 0);
    }

    #[test]
    fn test_zero_capacity_config_rejected() {
        let config = QueueConfig {
            capacity: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(
            Listener::with_config("bad", config),
            Err(EventError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_weak_listener_tracks_liveness() {
        let listener = Listener::new("l");
        let weak = listener.downgrade();
        assert!(weak.is_valid());
        assert_eq!(weak.upgrade().unwrap().name(), "l");

        drop(listener);
        assert!(!weak.is_valid());
        assert!(weak.upgrade().is_none());
        assert!(!WeakListener::default().is_valid());
    }

    #[test]
    fn test_two_consumers_each_event_once() {
        let (b, listener) = setup();
        let total = 200;

        let consumed = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let listener = listener.clone();
                    scope.spawn(move || {
                        let mut seen = Vec::new();
                        while let Some(event) = listener.wait_for_event(Duration::from_secs(1)) {
                            seen.push(event.sequence());
                        }
                        seen
                    })
                })
                .collect();

            for _ in 0..total {
                b.broadcast(WatchpointEventType::IgnoreChanged, None).unwrap();
            }

            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect::<Vec<_>>()
        });

        let mut sequences = consumed;
        sequences.sort_unstable();
        let expected: Vec<u64> = (1..=total).collect();
        assert_eq!(sequences, expected);
    }

    #[test]
    fn test_block_policy_drops_after_timeout() {
        let b = Broadcaster::new(BroadcasterId(1), "target");
        let listener = Listener::with_config(
            "stuck",
            QueueConfig {
                capacity: 1,
                overflow: OverflowPolicy::Block,
                block_timeout_ms: 100,
            },
        )
        .unwrap();
        b.subscribe(&listener, EventTypeMask::ALL).unwrap();
        b.broadcast(WatchpointEventType::Added, None).unwrap();

        let start = Instant::now();
        let report = b.broadcast(WatchpointEventType::Removed, None).unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(report.delivered, 0);
        assert_eq!(report.dropped(), 1);
        assert_eq!(listener.dropped_events(), 1);
        assert_eq!(listener.len(), 1);
        assert_eq!(
            listener.get_next_event().unwrap().event_type(),
            WatchpointEventType::Added
        );
    }
}
