use std::sync::Arc;
use std::time::Duration;
use tokentrace::{
    Event, EventBusFactory, EventKind, ManualClock, StopOutcome, StreamingConfig, TelemetryConfig,
};

fn event(event_id: &str, correlation_id: &str, kind: EventKind) -> Event {
    Event::new(event_id, correlation_id, 1_000, kind)
}

#[test]
fn published_stream_lifecycle_reaches_the_streaming_tracker() {
    let clock = Arc::new(ManualClock::new(1_000));
    let core = EventBusFactory::build_with_clock(TelemetryConfig::default(), clock.clone());

    core.bus().publish(event(
        "evt-1",
        "s-1",
        EventKind::StreamStarted {
            model: "sim-7b".to_string(),
            prompt_tokens: 12,
        },
    ));
    for index in 0..3 {
        core.bus().publish(event(
            &format!("evt-token-{index}"),
            "s-1",
            EventKind::StreamTokenGenerated { chunk_bytes: 8 },
        ));
    }
    core.bus().publish(event(
        "evt-ttft",
        "s-1",
        EventKind::StreamFirstToken { ttft_ms: 42 },
    ));
    core.bus()
        .publish(event("evt-done", "s-1", EventKind::StreamCompleted));
    assert_eq!(core.shutdown(Duration::from_secs(5)), StopOutcome::Drained);

    let metrics = core.streaming().get_metrics();
    assert_eq!(metrics.streams_started, 1);
    assert_eq!(metrics.streams_completed, 1);
    assert_eq!(metrics.tokens_generated, 3);
    assert_eq!(metrics.bytes_sent, 24);
    let details = core.streaming().get_stream_details("s-1").unwrap();
    assert_eq!(details.ttft_ms, Some(42));
}

#[test]
fn request_outcomes_and_errors_reach_the_error_tracker() {
    let clock = Arc::new(ManualClock::new(1_000));
    let core = EventBusFactory::build_with_clock(TelemetryConfig::default(), clock);

    core.bus().publish(event(
        "evt-ok",
        "req-1",
        EventKind::RequestCompleted {
            endpoint: "/v1/chat".to_string(),
            model: "sim-7b".to_string(),
            duration_ms: 120,
        },
    ));
    core.bus().publish(
        event(
            "evt-fail",
            "req-2",
            EventKind::RequestFailed {
                endpoint: "/v1/chat".to_string(),
                status_code: 504,
                error_type: "timeout".to_string(),
                error_message: "upstream timed out after 3000 ms".to_string(),
                model: Some("sim-7b".to_string()),
            },
        )
        .with_metadata("user_id", "user-9"),
    );
    core.bus().publish(event(
        "evt-err",
        "req-3",
        EventKind::ErrorOccurred {
            endpoint: "/v1/embed".to_string(),
            status_code: 500,
            error_type: "internal".to_string(),
            error_message: "exploded".to_string(),
            model: None,
        },
    ));
    assert_eq!(core.shutdown(Duration::from_secs(5)), StopOutcome::Drained);

    let slo = core.errors().get_slo_status();
    assert_eq!(slo.total_requests, 3);
    assert_eq!(slo.successes, 1);
    assert_eq!(slo.failures, 2);

    let recent = core.errors().get_recent_errors(10, None, None);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].endpoint, "/v1/embed");
    assert_eq!(recent[1].request_id.as_deref(), Some("req-2"));
    assert_eq!(recent[1].user_id.as_deref(), Some("user-9"));
    assert_eq!(recent[1].model.as_deref(), Some("sim-7b"));
}

#[test]
fn subscription_table_carries_the_expected_priorities() {
    let core = EventBusFactory::build(TelemetryConfig::default());
    let stats = core.bus().get_stats();
    assert_eq!(stats.subscribers["stream.started"][0].name, "streaming_metrics");
    assert_eq!(stats.subscribers["stream.started"][0].priority, 100);
    assert_eq!(stats.subscribers["request.failed"][0].name, "error_metrics");
    assert_eq!(stats.subscribers["request.failed"][0].priority, 90);
    assert_eq!(stats.subscribers["request.completed"][0].name, "error_metrics");
    assert_eq!(core.shutdown(Duration::from_secs(2)), StopOutcome::Drained);
}

#[test]
fn admission_rejections_are_counted_against_the_subscriber() {
    let config = TelemetryConfig {
        streaming: StreamingConfig {
            max_active_streams: 1,
            ..StreamingConfig::default()
        },
        ..TelemetryConfig::default()
    };
    let core = EventBusFactory::build(config);
    for stream_id in ["s-1", "s-2"] {
        core.bus().publish(event(
            &format!("evt-{stream_id}"),
            stream_id,
            EventKind::StreamStarted {
                model: "sim-7b".to_string(),
                prompt_tokens: 1,
            },
        ));
    }
    assert_eq!(core.shutdown(Duration::from_secs(5)), StopOutcome::Drained);

    assert_eq!(core.streaming().active_stream_count(), 1);
    let stats = core.bus().get_stats();
    let subscriber = &stats.subscribers["stream.started"][0];
    assert_eq!(subscriber.success, 1);
    assert_eq!(subscriber.error, 1);
}
