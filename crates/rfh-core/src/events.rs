//! Per-session event queue.
//!
//! Platform callbacks fire on arbitrary threads and publish immutable
//! [`EventRecord`]s into their session's [`EventQueue`]; the client drains
//! them in arrival order. Publishing never blocks on a consumer. Draining can
//! wait, either on a plain thread (`*_blocking`, condition variable) or inside
//! the async runtime (`tokio::sync::Notify`). Both forms observe the same
//! records and are woken by [`EventQueue::close`].

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::{unix_millis, Handle};

// ============================================================================
// Event Record
// ============================================================================

/// One asynchronous occurrence, immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    name: String,
    #[serde(rename = "data")]
    payload: Map<String, Value>,
    /// Enqueue time, milliseconds since the Unix epoch
    #[serde(rename = "time")]
    timestamp: u64,
    /// Position in the session's publish order
    seq: u64,
}

impl EventRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Payload field by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Normalise an arbitrary JSON value into an event payload.
///
/// Objects are used as-is, `null` becomes an empty payload, and any other
/// value is wrapped as `{"value": v}`.
pub fn into_payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Event name scoped to one handle, e.g. `GattConnect3onServicesDiscovered`.
pub fn scoped_event_name(prefix: &str, handle: Handle, suffix: &str) -> String {
    format!("{prefix}{handle}{suffix}")
}

// ============================================================================
// Queue configuration and statistics
// ============================================================================

/// What a bounded queue does when a record arrives while it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest pending record
    #[default]
    DropOldest,
    /// Refuse the incoming record
    DropNewest,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" | "oldest" => Ok(OverflowPolicy::DropOldest),
            "drop_newest" | "newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    discarded_after_close: AtomicU64,
    discarded_on_close: AtomicU64,
    cleared: AtomicU64,
}

/// Point-in-time view of a queue's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQueueStats {
    /// Records accepted into the queue
    pub published: u64,
    /// Records handed to a consumer
    pub delivered: u64,
    /// Records lost to the overflow policy
    pub dropped: u64,
    /// Publishes that arrived after the queue was closed
    pub discarded_after_close: u64,
    /// Records still pending when the queue was closed
    pub discarded_on_close: u64,
    /// Records removed by `clear`
    pub cleared: u64,
    /// Records currently pending
    pub pending: u64,
}

// ============================================================================
// Event Queue
// ============================================================================

struct QueueState {
    records: VecDeque<EventRecord>,
    closed: bool,
    next_seq: u64,
}

/// Ordered multi-producer, single-consumer event channel for one session.
pub struct EventQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    notify: Notify,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    counters: QueueCounters,
}

impl EventQueue {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::with_limits(None, OverflowPolicy::default())
    }

    /// Queue holding at most `capacity` pending records.
    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self::with_limits(Some(capacity), overflow)
    }

    /// Queue with an optional bound.
    pub fn with_limits(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                records: VecDeque::new(),
                closed: false,
                next_seq: 0,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
            capacity,
            overflow,
            counters: QueueCounters::default(),
        }
    }

    /// Publish-only handle for facades and platform callbacks.
    pub fn sink(self: &Arc<Self>) -> EventSink {
        EventSink {
            queue: Arc::clone(self),
        }
    }

    /// Append a record stamped with the current time.
    ///
    /// Returns `false` if the record was not queued, either because the queue
    /// is closed (silently discarded) or because a full queue refused it.
    pub fn publish(&self, name: impl Into<String>, payload: Value) -> bool {
        let name = name.into();
        let payload = into_payload(payload);

        {
            let mut state = self.state.lock();
            if state.closed {
                self.counters
                    .discarded_after_close
                    .fetch_add(1, Ordering::Relaxed);
                debug!(event = %name, "publish after close discarded");
                return false;
            }

            if let Some(capacity) = self.capacity {
                if state.records.len() >= capacity {
                    match self.overflow {
                        OverflowPolicy::DropOldest => {
                            if let Some(evicted) = state.records.pop_front() {
                                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    evicted = %evicted.name,
                                    capacity,
                                    "event queue full, dropped oldest record"
                                );
                            }
                            if capacity == 0 {
                                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                                return false;
                            }
                        }
                        OverflowPolicy::DropNewest => {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(event = %name, capacity, "event queue full, dropped new record");
                            return false;
                        }
                    }
                }
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.records.push_back(EventRecord {
                name,
                payload,
                timestamp: unix_millis(),
                seq,
            });
            self.counters.published.fetch_add(1, Ordering::Relaxed);
        }

        self.wake_all();
        true
    }

    /// Remove up to `max` records without waiting. `max == 0` takes all.
    pub fn poll(&self, max: usize) -> Vec<EventRecord> {
        let mut state = self.state.lock();
        self.take_front(&mut *state, max)
    }

    /// Remove up to `max` oldest records, waiting up to `timeout` for the
    /// first one to arrive. Returns as soon as any record is available;
    /// returns empty on timeout or when the queue is closed.
    pub async fn drain(&self, max: usize, timeout: Duration) -> Vec<EventRecord> {
        self.wait_async(timeout, |queue, state| queue.take_nonempty(state, max))
            .await
            .unwrap_or_default()
    }

    /// Blocking form of [`EventQueue::drain`] for plain threads.
    pub fn drain_blocking(&self, max: usize, timeout: Duration) -> Vec<EventRecord> {
        self.wait_blocking(timeout, |queue, state| queue.take_nonempty(state, max))
            .unwrap_or_default()
    }

    /// Remove the oldest record named `name`, waiting up to `timeout`.
    /// Other records keep their positions.
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Option<EventRecord> {
        self.wait_async(timeout, |queue, state| queue.take_named(state, name))
            .await
    }

    /// Blocking form of [`EventQueue::wait_for`].
    pub fn wait_for_blocking(&self, name: &str, timeout: Duration) -> Option<EventRecord> {
        self.wait_blocking(timeout, |queue, state| queue.take_named(state, name))
    }

    /// Discard all pending records and return how many there were.
    pub fn clear(&self) -> usize {
        let count = {
            let mut state = self.state.lock();
            let count = state.records.len();
            state.records.clear();
            count
        };
        self.counters
            .cleared
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Close the queue: discard pending records, reject later publishes and
    /// wake every blocked waiter with an empty result.
    ///
    /// Returns `true` for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        let discarded = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            let discarded = state.records.len();
            state.records.clear();
            discarded
        };

        self.counters
            .discarded_on_close
            .fetch_add(discarded as u64, Ordering::Relaxed);
        debug!(discarded, "event queue closed");
        self.wake_all();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of records waiting to be drained.
    pub fn pending(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn stats(&self) -> EventQueueStats {
        EventQueueStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            discarded_after_close: self.counters.discarded_after_close.load(Ordering::Relaxed),
            discarded_on_close: self.counters.discarded_on_close.load(Ordering::Relaxed),
            cleared: self.counters.cleared.load(Ordering::Relaxed),
            pending: self.pending() as u64,
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn wake_all(&self) {
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    fn take_front(&self, state: &mut QueueState, max: usize) -> Vec<EventRecord> {
        let count = if max == 0 {
            state.records.len()
        } else {
            max.min(state.records.len())
        };
        let taken: Vec<EventRecord> = state.records.drain(..count).collect();
        self.counters
            .delivered
            .fetch_add(taken.len() as u64, Ordering::Relaxed);
        taken
    }

    fn take_nonempty(&self, state: &mut QueueState, max: usize) -> Option<Vec<EventRecord>> {
        if state.records.is_empty() {
            None
        } else {
            Some(self.take_front(state, max))
        }
    }

    fn take_named(&self, state: &mut QueueState, name: &str) -> Option<EventRecord> {
        let position = state.records.iter().position(|r| r.name == name)?;
        let record = state.records.remove(position)?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    fn wait_blocking<R, F>(&self, timeout: Duration, mut take: F) -> Option<R>
    where
        F: FnMut(&Self, &mut QueueState) -> Option<R>,
    {
        // An unrepresentable deadline means wait until woken
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(result) = take(self, &mut *state) {
                return Some(result);
            }
            if state.closed || timeout.is_zero() {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        return take(self, &mut *state);
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    async fn wait_async<R, F>(&self, timeout: Duration, mut take: F) -> Option<R>
    where
        F: FnMut(&Self, &mut QueueState) -> Option<R>,
    {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            // Register interest before checking so a publish between the
            // check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(result) = take(self, &mut *state) {
                    return Some(result);
                }
                if state.closed || timeout.is_zero() {
                    return None;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let mut state = self.state.lock();
                        return take(self, &mut *state);
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("capacity", &self.capacity)
            .field("overflow", &self.overflow)
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// Event Sink
// ============================================================================

/// Publish-only view of a session's queue, handed to facades and captured by
/// platform callbacks.
#[derive(Clone, Debug)]
pub struct EventSink {
    queue: Arc<EventQueue>,
}

impl EventSink {
    pub fn publish(&self, name: impl Into<String>, payload: Value) -> bool {
        self.queue.publish(name, payload)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Whether both sinks feed the same queue.
    pub fn same_queue(&self, other: &EventSink) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(records: &[EventRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name()).collect()
    }

    #[test]
    fn test_poll_returns_fifo_order() {
        let queue = EventQueue::new();
        queue.publish("A", json!({"n": 1}));
        queue.publish("B", json!({"n": 2}));
        queue.publish("C", Value::Null);

        let first = queue.poll(2);
        assert_eq!(names(&first), vec!["A", "B"]);
        assert_eq!(first[0].get("n"), Some(&json!(1)));
        assert!(first[0].seq() < first[1].seq());

        let rest = queue.poll(10);
        assert_eq!(names(&rest), vec!["C"]);
        assert!(rest[0].payload().is_empty());
        assert!(queue.poll(10).is_empty());
    }

    #[test]
    fn test_scalar_payload_is_wrapped() {
        let queue = EventQueue::new();
        queue.publish("level", json!(42));
        let records = queue.poll(0);
        assert_eq!(records[0].get("value"), Some(&json!(42)));
    }

    #[test]
    fn test_record_wire_shape() {
        let queue = EventQueue::new();
        queue.publish("onReady", json!({"status": 0}));
        let record = queue.poll(1).remove(0);
        let wire = serde_json::to_value(&record).unwrap();
        assert_eq!(wire["name"], "onReady");
        assert_eq!(wire["data"]["status"], 0);
        assert!(wire["time"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_zero_timeout_does_not_block() {
        let queue = EventQueue::new();
        let started = Instant::now();
        assert!(queue.drain_blocking(5, Duration::ZERO).is_empty());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_blocking_drain_wakes_on_publish() {
        let queue = Arc::new(EventQueue::new());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            producer.publish("late", json!({}));
        });

        let started = Instant::now();
        let records = queue.drain_blocking(5, Duration::from_secs(5));
        handle.join().unwrap();

        assert_eq!(names(&records), vec!["late"]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_blocking_drain_times_out_empty() {
        let queue = EventQueue::new();
        let started = Instant::now();
        assert!(queue.drain_blocking(1, Duration::from_millis(60)).is_empty());
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_close_unblocks_blocking_drain() {
        let queue = Arc::new(EventQueue::new());
        let closer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            assert!(closer.close());
        });

        let started = Instant::now();
        let records = queue.drain_blocking(5, Duration::from_secs(10));
        handle.join().unwrap();

        assert!(records.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_publish_after_close_is_discarded() {
        let queue = EventQueue::new();
        queue.publish("pending", json!({}));
        assert!(queue.close());
        assert!(!queue.close());

        assert!(!queue.publish("late", json!({})));
        assert!(queue.poll(0).is_empty());

        let stats = queue.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.discarded_on_close, 1);
        assert_eq!(stats.discarded_after_close, 1);
    }

    #[test]
    fn test_wait_for_keeps_other_records_in_order() {
        let queue = EventQueue::new();
        queue.publish("scan1onScanResults", json!({}));
        queue.publish("GattConnect1onConnectionStateChange", json!({"state": 2}));
        queue.publish("scan1onScanResults", json!({}));
        queue.publish("BatteryChanged", json!({}));

        let record = queue
            .wait_for_blocking("GattConnect1onConnectionStateChange", Duration::ZERO)
            .unwrap();
        assert_eq!(record.get("state"), Some(&json!(2)));
        assert!(queue.wait_for_blocking("missing", Duration::ZERO).is_none());

        let rest = queue.poll(0);
        assert_eq!(
            names(&rest),
            vec!["scan1onScanResults", "scan1onScanResults", "BatteryChanged"]
        );
    }

    #[test]
    fn test_bounded_drop_oldest() {
        let queue = EventQueue::bounded(2, OverflowPolicy::DropOldest);
        assert!(queue.publish("a", json!({})));
        assert!(queue.publish("b", json!({})));
        assert!(queue.publish("c", json!({})));

        assert_eq!(names(&queue.poll(0)), vec!["b", "c"]);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_bounded_drop_newest() {
        let queue = EventQueue::bounded(2, OverflowPolicy::DropNewest);
        queue.publish("a", json!({}));
        queue.publish("b", json!({}));
        assert!(!queue.publish("c", json!({})));

        assert_eq!(names(&queue.poll(0)), vec!["a", "b"]);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_clear_counts_records() {
        let queue = EventQueue::new();
        for i in 0..4 {
            queue.publish(format!("e{i}"), json!({}));
        }
        assert_eq!(queue.clear(), 4);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.stats().cleared, 4);
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        let queue = Arc::new(EventQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        queue.publish(format!("p{p}"), json!({ "i": i }));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let records = queue.poll(0);
        assert_eq!(records.len(), 400);
        for p in 0..4 {
            let name = format!("p{p}");
            let seen: Vec<i64> = records
                .iter()
                .filter(|r| r.name() == name)
                .map(|r| r.get("i").and_then(Value::as_i64).unwrap())
                .collect();
            assert_eq!(seen, (0..100).collect::<Vec<_>>());
        }
        assert!(records.windows(2).all(|w| w[0].seq() < w[1].seq()));
    }

    #[test]
    fn test_scoped_event_name() {
        assert_eq!(
            scoped_event_name("GattConnect", Handle::new(3), "onServicesDiscovered"),
            "GattConnect3onServicesDiscovered"
        );
    }

    #[test]
    fn test_overflow_policy_from_str() {
        assert_eq!("drop_oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("Drop_Newest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropNewest));
        assert!("block".parse::<OverflowPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_async_drain_wakes_on_publish() {
        let queue = Arc::new(EventQueue::new());
        let producer = queue.sink();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.publish("onReady", json!({}));
        });

        let records = queue.drain(10, Duration::from_secs(5)).await;
        assert_eq!(names(&records), vec!["onReady"]);
    }

    #[tokio::test]
    async fn test_async_wait_for_skips_other_events() {
        let queue = Arc::new(EventQueue::new());
        let producer = queue.sink();
        tokio::spawn(async move {
            producer.publish("noise", json!({}));
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish("target", json!({"ok": true}));
        });

        let record = queue
            .wait_for("target", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.get("ok"), Some(&json!(true)));
        assert_eq!(names(&queue.poll(0)), vec!["noise"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_drain_unblocks_on_close() {
        let queue = Arc::new(EventQueue::new());
        let closer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closer.close();
        });

        let started = Instant::now();
        let records = queue.drain(5, Duration::from_secs(10)).await;
        assert!(records.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_async_wait_for_times_out() {
        let queue = EventQueue::new();
        assert!(queue
            .wait_for("never", Duration::from_millis(20))
            .await
            .is_none());
    }
}
