//! Telemetry core for a simulated inference-serving API: an async event bus
//! feeding streaming-latency and error-budget trackers.

pub mod bus;
pub mod clock;
pub mod errors;
pub mod event;
pub mod export;
pub mod factory;
pub mod fingerprint;
pub mod quantile;
pub mod stream;

pub use bus::{
    AsyncEventBus, BusConfig, BusStats, EventHandler, HandlerError, StopOutcome, SubscriberStats,
    DEFAULT_HANDLER_TIMEOUT_MS, DEFAULT_MAX_QUEUE_SIZE,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{
    CountEntry, ErrorConfig, ErrorContext, ErrorMetricsSnapshot, ErrorMetricsTracker, ErrorPattern,
    ErrorRecord, SloStatus, DEFAULT_ERROR_BUDGET_SLO, DEFAULT_MAX_RECENT_ERRORS,
    DEFAULT_PATTERN_THRESHOLD, DEFAULT_WINDOW_SECONDS,
};
pub use event::{Event, EventKind, EventType};
pub use export::{escape_label_value, scrape_metric_names, MetricKind, PromWriter};
pub use factory::{
    EventBusFactory, TelemetryConfig, TelemetryCore, ERROR_PRIORITY, STREAMING_PRIORITY,
};
pub use fingerprint::{fingerprint, normalize_message};
pub use quantile::PercentileSummary;
pub use stream::{
    ModelTotals, StreamDetails, StreamState, StreamingConfig, StreamingError,
    StreamingMetricsTracker, StreamingSnapshot, DEFAULT_AGGREGATION_WINDOW_SECONDS,
    DEFAULT_MAX_ACTIVE_STREAMS, DEFAULT_MAX_COMPLETED_STREAMS,
};
