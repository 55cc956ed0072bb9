use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Stable dotted-namespace event taxonomy shared with collaborators.
///
/// The names form a wire-level contract: dashboards and the API surface
/// subscribe by these strings, so variants are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EventType {
    RequestStarted,
    RequestCompleted,
    RequestFailed,
    StreamStarted,
    StreamTokenGenerated,
    StreamFirstToken,
    StreamCompleted,
    StreamFailed,
    ErrorOccurred,
    CacheLookup,
    CacheSpeedupMeasured,
    PrefillStarted,
    PrefillCompleted,
    DecodeStarted,
    QueueDepthChanged,
    BatchSizeChanged,
    ModelSelected,
    CostCalculated,
}

impl EventType {
    /// Canonical `noun.verb` name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RequestStarted => "request.started",
            EventType::RequestCompleted => "request.completed",
            EventType::RequestFailed => "request.failed",
            EventType::StreamStarted => "stream.started",
            EventType::StreamTokenGenerated => "stream.token_generated",
            EventType::StreamFirstToken => "stream.first_token",
            EventType::StreamCompleted => "stream.completed",
            EventType::StreamFailed => "stream.failed",
            EventType::ErrorOccurred => "error.occurred",
            EventType::CacheLookup => "cache.lookup",
            EventType::CacheSpeedupMeasured => "cache.speedup_measured",
            EventType::PrefillStarted => "prefill.started",
            EventType::PrefillCompleted => "prefill.completed",
            EventType::DecodeStarted => "decode.started",
            EventType::QueueDepthChanged => "queue.depth_changed",
            EventType::BatchSizeChanged => "batch.size_changed",
            EventType::ModelSelected => "model.selected",
            EventType::CostCalculated => "cost.calculated",
        }
    }

    pub const ALL: [EventType; 18] = [
        EventType::RequestStarted,
        EventType::RequestCompleted,
        EventType::RequestFailed,
        EventType::StreamStarted,
        EventType::StreamTokenGenerated,
        EventType::StreamFirstToken,
        EventType::StreamCompleted,
        EventType::StreamFailed,
        EventType::ErrorOccurred,
        EventType::CacheLookup,
        EventType::CacheSpeedupMeasured,
        EventType::PrefillStarted,
        EventType::PrefillCompleted,
        EventType::DecodeStarted,
        EventType::QueueDepthChanged,
        EventType::BatchSizeChanged,
        EventType::ModelSelected,
        EventType::CostCalculated,
    ];
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant-specific payload carried by an [`Event`].
///
/// Every field is a primitive so the envelope stays JSON-flat; anything
/// richer travels in the freeform metadata map.
#[derive(Debug, Clone, Serialize)]
pub enum EventKind {
    RequestStarted {
        endpoint: String,
        model: String,
    },
    RequestCompleted {
        endpoint: String,
        model: String,
        duration_ms: u64,
    },
    RequestFailed {
        endpoint: String,
        status_code: u16,
        error_type: String,
        error_message: String,
        model: Option<String>,
    },
    StreamStarted {
        model: String,
        prompt_tokens: u64,
    },
    StreamTokenGenerated {
        chunk_bytes: u64,
    },
    StreamFirstToken {
        ttft_ms: u64,
    },
    StreamCompleted,
    StreamFailed {
        reason: String,
    },
    ErrorOccurred {
        endpoint: String,
        status_code: u16,
        error_type: String,
        error_message: String,
        model: Option<String>,
    },
    CacheLookup {
        hit: bool,
    },
    CacheSpeedupMeasured {
        speedup_ratio: f64,
    },
    PrefillStarted {
        prompt_tokens: u64,
    },
    PrefillCompleted {
        duration_ms: u64,
    },
    DecodeStarted,
    QueueDepthChanged {
        depth: u64,
    },
    BatchSizeChanged {
        size: u64,
    },
    ModelSelected {
        model: String,
    },
    CostCalculated {
        cost_microcents: u64,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::RequestStarted { .. } => EventType::RequestStarted,
            EventKind::RequestCompleted { .. } => EventType::RequestCompleted,
            EventKind::RequestFailed { .. } => EventType::RequestFailed,
            EventKind::StreamStarted { .. } => EventType::StreamStarted,
            EventKind::StreamTokenGenerated { .. } => EventType::StreamTokenGenerated,
            EventKind::StreamFirstToken { .. } => EventType::StreamFirstToken,
            EventKind::StreamCompleted => EventType::StreamCompleted,
            EventKind::StreamFailed { .. } => EventType::StreamFailed,
            EventKind::ErrorOccurred { .. } => EventType::ErrorOccurred,
            EventKind::CacheLookup { .. } => EventType::CacheLookup,
            EventKind::CacheSpeedupMeasured { .. } => EventType::CacheSpeedupMeasured,
            EventKind::PrefillStarted { .. } => EventType::PrefillStarted,
            EventKind::PrefillCompleted { .. } => EventType::PrefillCompleted,
            EventKind::DecodeStarted => EventType::DecodeStarted,
            EventKind::QueueDepthChanged { .. } => EventType::QueueDepthChanged,
            EventKind::BatchSizeChanged { .. } => EventType::BatchSizeChanged,
            EventKind::ModelSelected { .. } => EventType::ModelSelected,
            EventKind::CostCalculated { .. } => EventType::CostCalculated,
        }
    }
}

/// Immutable record of one lifecycle occurrence.
///
/// Owned by the publisher until enqueued, then by the bus while queued, and
/// discarded after every subscriber for its type has run.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    event_id: String,
    /// Request or stream id correlating this event with its lifecycle peers.
    correlation_id: String,
    timestamp_ms: u64,
    kind: EventKind,
    metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn new(
        event_id: impl Into<String>,
        correlation_id: impl Into<String>,
        timestamp_ms: u64,
        kind: EventKind,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            correlation_id: correlation_id.into(),
            timestamp_ms,
            kind,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}
