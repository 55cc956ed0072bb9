use std::sync::Arc;
use std::time::Duration;
use tokentrace::{
    scrape_metric_names, ErrorConfig, ErrorContext, ErrorMetricsTracker, EventBusFactory,
    ManualClock, StopOutcome, StreamingConfig, StreamingMetricsTracker, TelemetryConfig,
};

#[test]
fn streaming_exposition_has_preambles_and_quantile_labels() {
    let clock = Arc::new(ManualClock::new(1_000));
    let tracker = StreamingMetricsTracker::with_clock(StreamingConfig::default(), clock.clone());
    tracker.start_stream("s-1", "sim-7b", 10).unwrap();
    clock.advance_ms(100);
    tracker.record_token("s-1", 8);
    clock.advance_ms(50);
    tracker.record_token("s-1", 8);
    tracker.complete_stream("s-1");

    let text = tracker.get_prometheus_metrics();
    assert!(text.contains("# HELP tokentrace_streams_active"));
    assert!(text.contains("# TYPE tokentrace_streams_active gauge"));
    assert!(text.contains("# TYPE tokentrace_stream_ttft_ms summary"));
    assert!(text.contains("tokentrace_stream_ttft_ms{quantile=\"0.5\"} 100"));
    assert!(text.contains("tokentrace_stream_ttft_ms_count 1"));
    assert!(text.contains("tokentrace_stream_itl_ms{quantile=\"0.99\"} 50"));
    assert!(text.contains("tokentrace_streams_finalized_total{outcome=\"completed\"} 1"));
    assert!(text.contains("tokentrace_model_tokens_total{model=\"sim-7b\"} 2"));
}

#[test]
fn error_exposition_escapes_label_values() {
    let tracker = ErrorMetricsTracker::new(ErrorConfig::default());
    tracker.record_error(
        "/v1/\"chat\"",
        500,
        "internal",
        "exploded",
        ErrorContext::new(),
    );

    let text = tracker.get_prometheus_metrics();
    assert!(text.contains("tokentrace_errors_by_endpoint_total{endpoint=\"/v1/\\\"chat\\\"\"} 1"));
    assert!(text.contains("tokentrace_requests_total{outcome=\"error\"} 1"));
    assert!(text.contains("# TYPE tokentrace_slo_violated gauge"));
}

#[test]
fn every_sample_line_parses_to_a_prefixed_metric_name() {
    let clock = Arc::new(ManualClock::new(1_000));
    let core = EventBusFactory::build_with_clock(TelemetryConfig::default(), clock);
    core.streaming().start_stream("s-1", "sim-7b", 10).unwrap();
    core.streaming().complete_stream("s-1");
    core.errors()
        .record_error("/v1/chat", 504, "timeout", "timed out", ErrorContext::new());
    core.errors().record_success("/v1/chat", None);

    let text = core.get_prometheus_metrics();
    let names = scrape_metric_names(&text);
    assert!(!names.is_empty());
    assert!(names.iter().all(|name| name.starts_with("tokentrace_")));
    // Both trackers contribute families to the combined text.
    assert!(names.iter().any(|name| name == "tokentrace_streams_active"));
    assert!(names
        .iter()
        .any(|name| name == "tokentrace_slo_success_rate"));
    assert_eq!(core.shutdown(Duration::from_secs(2)), StopOutcome::Drained);
}
