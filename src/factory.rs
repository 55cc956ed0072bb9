use crate::bus::{AsyncEventBus, BusConfig, EventHandler, HandlerError, StopOutcome};
use crate::clock::{Clock, SystemClock};
use crate::errors::{ErrorConfig, ErrorContext, ErrorMetricsTracker};
use crate::event::{Event, EventKind, EventType};
use crate::stream::{StreamingConfig, StreamingMetricsTracker};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Streaming lifecycle events carry this dispatch priority so stream state
/// is current before anything downstream reads it.
pub const STREAMING_PRIORITY: i32 = 100;
pub const ERROR_PRIORITY: i32 = 90;

/// Aggregate configuration for one wired telemetry core.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryConfig {
    pub bus: BusConfig,
    pub streaming: StreamingConfig,
    pub errors: ErrorConfig,
}

/// Bridges stream lifecycle events into the streaming tracker. The event's
/// correlation id doubles as the stream id.
struct StreamingEventHandler {
    tracker: Arc<StreamingMetricsTracker>,
}

impl EventHandler for StreamingEventHandler {
    fn name(&self) -> &str {
        "streaming_metrics"
    }

    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let stream_id = event.correlation_id();
        match event.kind() {
            EventKind::StreamStarted {
                model,
                prompt_tokens,
            } => {
                self.tracker.start_stream(stream_id, model, *prompt_tokens)?;
            }
            EventKind::StreamTokenGenerated { chunk_bytes } => {
                self.tracker.record_token(stream_id, *chunk_bytes);
            }
            EventKind::StreamFirstToken { ttft_ms } => {
                self.tracker.record_first_token_time(stream_id, *ttft_ms);
            }
            EventKind::StreamCompleted => {
                self.tracker.complete_stream(stream_id);
            }
            EventKind::StreamFailed { .. } => {
                self.tracker.fail_stream(stream_id);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Bridges error and request-outcome events into the error tracker.
struct ErrorEventHandler {
    tracker: Arc<ErrorMetricsTracker>,
}

impl ErrorEventHandler {
    fn context_for(event: &Event, model: &Option<String>) -> ErrorContext {
        let mut context = ErrorContext::new().with_request_id(event.correlation_id());
        if let Some(model) = model {
            context = context.with_model(model);
        }
        if let Some(user_id) = event.metadata().get("user_id") {
            context = context.with_user_id(user_id);
        }
        if let Some(api_key) = event.metadata().get("api_key") {
            context = context.with_api_key(api_key);
        }
        if let Some(stack_trace) = event.metadata().get("stack_trace") {
            context = context.with_stack_trace(stack_trace);
        }
        context
    }
}

impl EventHandler for ErrorEventHandler {
    fn name(&self) -> &str {
        "error_metrics"
    }

    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        match event.kind() {
            EventKind::ErrorOccurred {
                endpoint,
                status_code,
                error_type,
                error_message,
                model,
            }
            | EventKind::RequestFailed {
                endpoint,
                status_code,
                error_type,
                error_message,
                model,
            } => {
                self.tracker.record_error(
                    endpoint,
                    *status_code,
                    error_type,
                    error_message,
                    Self::context_for(event, model),
                );
            }
            EventKind::RequestCompleted {
                endpoint, model, ..
            } => {
                self.tracker.record_success(endpoint, Some(model.as_str()));
            }
            _ => {}
        }
        Ok(())
    }
}

/// The wired telemetry core: one bus, both trackers, worker already running.
pub struct TelemetryCore {
    bus: Arc<AsyncEventBus>,
    streaming: Arc<StreamingMetricsTracker>,
    errors: Arc<ErrorMetricsTracker>,
}

impl TelemetryCore {
    pub fn bus(&self) -> &Arc<AsyncEventBus> {
        &self.bus
    }

    pub fn streaming(&self) -> &Arc<StreamingMetricsTracker> {
        &self.streaming
    }

    pub fn errors(&self) -> &Arc<ErrorMetricsTracker> {
        &self.errors
    }

    /// Combined exposition text for both trackers.
    pub fn get_prometheus_metrics(&self) -> String {
        let mut out = self.streaming.get_prometheus_metrics();
        out.push_str(&self.errors.get_prometheus_metrics());
        out
    }

    /// Drains the bus and joins the worker; see [`AsyncEventBus::stop`].
    pub fn shutdown(&self, timeout: Duration) -> StopOutcome {
        self.bus.stop(timeout)
    }
}

/// Builds a [`TelemetryCore`] with the canonical subscription table.
pub struct EventBusFactory;

impl EventBusFactory {
    pub fn build(config: TelemetryConfig) -> TelemetryCore {
        Self::build_with_clock(config, Arc::new(SystemClock))
    }

    /// Allows tests to inject a deterministic clock into both trackers.
    pub fn build_with_clock(config: TelemetryConfig, clock: Arc<dyn Clock>) -> TelemetryCore {
        let bus = Arc::new(AsyncEventBus::new(config.bus));
        let streaming = Arc::new(StreamingMetricsTracker::with_clock(
            config.streaming,
            clock.clone(),
        ));
        let errors = Arc::new(ErrorMetricsTracker::with_clock(config.errors, clock));

        let streaming_handler = Arc::new(StreamingEventHandler {
            tracker: streaming.clone(),
        });
        for event_type in [
            EventType::StreamStarted,
            EventType::StreamTokenGenerated,
            EventType::StreamFirstToken,
            EventType::StreamCompleted,
            EventType::StreamFailed,
        ] {
            bus.subscribe(event_type, streaming_handler.clone(), STREAMING_PRIORITY);
        }

        let error_handler = Arc::new(ErrorEventHandler {
            tracker: errors.clone(),
        });
        for event_type in [
            EventType::ErrorOccurred,
            EventType::RequestFailed,
            EventType::RequestCompleted,
        ] {
            bus.subscribe(event_type, error_handler.clone(), ERROR_PRIORITY);
        }

        bus.start();
        info!(
            queue_capacity = config.bus.max_queue_size,
            "telemetry core started"
        );
        TelemetryCore {
            bus,
            streaming,
            errors,
        }
    }
}
