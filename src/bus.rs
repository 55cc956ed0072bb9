use crate::event::{Event, EventType};
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 1_000;

/// Idle wait used by the worker between queue polls.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Bus sizing knobs, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    pub max_queue_size: usize,
    /// Budget a subscriber invocation is expected to stay under. Exceeding it
    /// is counted against the subscriber, not enforced by preemption.
    pub handler_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            handler_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of bus events. Implementations must tolerate being called from
/// the dispatch thread; a returned error (or panic) is recorded against the
/// subscriber and never propagates.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Outcome of a cooperative shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The queue fully drained before the deadline.
    Drained,
    /// The deadline passed; this many queued events were discarded unseen.
    TimedOut { discarded: u64 },
}

#[derive(Debug, Default)]
struct SubscriberCounters {
    success: AtomicU64,
    error: AtomicU64,
    timeout: AtomicU64,
    total_micros: AtomicU64,
}

/// One registered handler for one event type.
#[derive(Clone)]
struct Subscription {
    handler: Arc<dyn EventHandler>,
    priority: i32,
    counters: Arc<SubscriberCounters>,
}

/// Per-subscriber slice of [`BusStats`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscriberStats {
    pub name: String,
    pub priority: i32,
    pub success: u64,
    pub error: u64,
    pub timeout: u64,
    pub avg_processing_ms: f64,
}

/// Snapshot returned by [`AsyncEventBus::get_stats`].
#[derive(Debug, Clone, Serialize, Default)]
pub struct BusStats {
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
    pub queue_depth: usize,
    /// Keyed by dotted event-type name, ordered by dispatch priority.
    pub subscribers: BTreeMap<String, Vec<SubscriberStats>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerMode {
    Running = 0,
    Draining = 1,
    Discard = 2,
}

impl WorkerMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerMode::Running,
            1 => WorkerMode::Draining,
            _ => WorkerMode::Discard,
        }
    }
}

struct BusShared {
    queue: ArrayQueue<Event>,
    /// Checked by the worker before every dispatch so a `Discard` request
    /// takes effect mid-drain, not only once the queue is empty.
    mode: AtomicU8,
    worker_exited: Mutex<bool>,
    cv: Condvar,
    registry: Mutex<HashMap<EventType, Vec<Subscription>>>,
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    handler_timeout: Duration,
}

impl BusShared {
    fn dispatch(&self, event: &Event) {
        let subscriptions = {
            let registry = self.registry.lock().expect("bus registry poisoned");
            registry.get(&event.event_type()).cloned()
        };
        let Some(subscriptions) = subscriptions else {
            return;
        };
        // Sequential, priority-descending: a slow high-priority handler only
        // delays lower-priority ones for this event.
        for subscription in &subscriptions {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| subscription.handler.handle(event)));
            let elapsed = started.elapsed();
            subscription
                .counters
                .total_micros
                .fetch_add(elapsed.as_micros().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
            match outcome {
                Ok(Ok(())) => {
                    if elapsed > self.handler_timeout {
                        subscription.counters.timeout.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            handler = subscription.handler.name(),
                            event_type = event.event_type().as_str(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            "subscriber exceeded its processing budget"
                        );
                    } else {
                        subscription.counters.success.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(Err(err)) => {
                    subscription.counters.error.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        handler = subscription.handler.name(),
                        event_type = event.event_type().as_str(),
                        error = %err,
                        "subscriber returned an error"
                    );
                }
                Err(_) => {
                    subscription.counters.error.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        handler = subscription.handler.name(),
                        event_type = event.event_type().as_str(),
                        "subscriber panicked; dispatch continues"
                    );
                }
            }
        }
    }

    fn mode(&self) -> WorkerMode {
        WorkerMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn worker_loop(&self) {
        loop {
            if self.mode() == WorkerMode::Discard {
                let mut discarded = 0u64;
                while self.queue.pop().is_some() {
                    discarded += 1;
                }
                self.dropped.fetch_add(discarded, Ordering::Relaxed);
                break;
            }
            if let Some(event) = self.queue.pop() {
                self.dispatch(&event);
                self.processed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.mode() {
                WorkerMode::Running => {
                    // Timed wait: a publish between our empty poll and this
                    // wait costs at most one idle interval.
                    let guard = self.worker_exited.lock().expect("bus signal poisoned");
                    let _ = self
                        .cv
                        .wait_timeout(guard, WORKER_IDLE_WAIT)
                        .expect("bus signal poisoned");
                }
                WorkerMode::Draining | WorkerMode::Discard => break,
            }
        }
        let mut exited = self.worker_exited.lock().expect("bus signal poisoned");
        *exited = true;
        self.cv.notify_all();
    }
}

/// Bounded, single-consumer event bus decoupling telemetry producers from
/// the trackers.
///
/// Publishers never block: a full queue drops the event and bumps a counter
/// instead. One dedicated worker drains the queue in FIFO order and invokes
/// the subscribers for each event sequentially, priority-descending.
pub struct AsyncEventBus {
    shared: Arc<BusShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AsyncEventBus {
    pub fn new(config: BusConfig) -> Self {
        assert!(config.max_queue_size > 0, "event queue capacity must be > 0");
        Self {
            shared: Arc::new(BusShared {
                queue: ArrayQueue::new(config.max_queue_size),
                mode: AtomicU8::new(WorkerMode::Running as u8),
                worker_exited: Mutex::new(false),
                cv: Condvar::new(),
                registry: Mutex::new(HashMap::new()),
                published: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                handler_timeout: Duration::from_millis(config.handler_timeout_ms),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Registers `handler` for `event_type`. The per-type list stays sorted
    /// by priority descending, stable on ties; repeat and multi-type
    /// subscription are both allowed.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>, priority: i32) {
        let subscription = Subscription {
            handler,
            priority,
            counters: Arc::new(SubscriberCounters::default()),
        };
        let mut registry = self.shared.registry.lock().expect("bus registry poisoned");
        let list = registry.entry(event_type).or_default();
        let position = list
            .iter()
            .position(|existing| existing.priority < priority)
            .unwrap_or(list.len());
        list.insert(position, subscription);
    }

    /// Non-blocking enqueue. A full queue drops the event — the deliberate
    /// backpressure valve, not an error condition.
    pub fn publish(&self, event: Event) {
        match self.shared.queue.push(event) {
            Ok(()) => {
                self.shared.published.fetch_add(1, Ordering::Relaxed);
                self.shared.cv.notify_one();
            }
            Err(dropped) => {
                let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    event_type = dropped.event_type().as_str(),
                    dropped_total = total,
                    "event queue full, dropping event"
                );
            }
        }
    }

    /// Spawns the single worker thread. Idempotent while running.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("bus worker slot poisoned");
        if worker.is_some() {
            return;
        }
        self.shared
            .mode
            .store(WorkerMode::Running as u8, Ordering::Release);
        *self.shared.worker_exited.lock().expect("bus signal poisoned") = false;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("tokentrace_bus".to_string())
            .spawn(move || shared.worker_loop())
            .expect("failed to spawn bus worker");
        *worker = Some(handle);
    }

    /// Requests a cooperative drain-then-exit. Past `timeout`, remaining
    /// queued events are discarded without invoking subscribers and counted
    /// as dropped.
    pub fn stop(&self, timeout: Duration) -> StopOutcome {
        let handle = {
            let mut worker = self.worker.lock().expect("bus worker slot poisoned");
            worker.take()
        };
        let Some(handle) = handle else {
            return StopOutcome::Drained;
        };
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        self.shared
            .mode
            .store(WorkerMode::Draining as u8, Ordering::Release);
        self.shared.cv.notify_all();
        {
            let mut exited = self.shared.worker_exited.lock().expect("bus signal poisoned");
            while !*exited {
                let now = Instant::now();
                if now >= deadline {
                    timed_out = true;
                    break;
                }
                let (next_guard, _) = self
                    .shared
                    .cv
                    .wait_timeout(exited, deadline - now)
                    .expect("bus signal poisoned");
                exited = next_guard;
            }
        }
        if timed_out {
            self.shared
                .mode
                .store(WorkerMode::Discard as u8, Ordering::Release);
            self.shared.cv.notify_all();
        }
        let dropped_before = self.shared.dropped.load(Ordering::Relaxed);
        let _ = handle.join();
        if timed_out {
            let discarded = self.shared.dropped.load(Ordering::Relaxed) - dropped_before;
            StopOutcome::TimedOut { discarded }
        } else {
            StopOutcome::Drained
        }
    }

    pub fn get_stats(&self) -> BusStats {
        let mut subscribers = BTreeMap::new();
        {
            let registry = self.shared.registry.lock().expect("bus registry poisoned");
            for (event_type, list) in registry.iter() {
                let stats: Vec<SubscriberStats> = list
                    .iter()
                    .map(|subscription| {
                        let success = subscription.counters.success.load(Ordering::Relaxed);
                        let error = subscription.counters.error.load(Ordering::Relaxed);
                        let timeout = subscription.counters.timeout.load(Ordering::Relaxed);
                        let invocations = success + error + timeout;
                        let total_micros =
                            subscription.counters.total_micros.load(Ordering::Relaxed);
                        let avg_processing_ms = if invocations > 0 {
                            total_micros as f64 / invocations as f64 / 1_000.0
                        } else {
                            0.0
                        };
                        SubscriberStats {
                            name: subscription.handler.name().to_string(),
                            priority: subscription.priority,
                            success,
                            error,
                            timeout,
                            avg_processing_ms,
                        }
                    })
                    .collect();
                subscribers.insert(event_type.as_str().to_string(), stats);
            }
        }
        BusStats {
            published: self.shared.published.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            queue_depth: self.shared.queue.len(),
            subscribers,
        }
    }

    /// Current number of queued, undelivered events.
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for AsyncEventBus {
    fn drop(&mut self) {
        let running = self
            .worker
            .lock()
            .map(|worker| worker.is_some())
            .unwrap_or(false);
        if running {
            let _ = self.stop(Duration::from_millis(100));
        }
    }
}
