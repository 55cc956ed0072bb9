use std::sync::Arc;
use tokentrace::{ErrorConfig, ErrorContext, ErrorMetricsTracker, ManualClock};

fn tracker_at(start_ms: u64, config: ErrorConfig) -> (ErrorMetricsTracker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start_ms));
    let tracker = ErrorMetricsTracker::with_clock(config, clock.clone());
    (tracker, clock)
}

#[test]
fn variable_data_collapses_into_one_pattern() {
    let (tracker, _clock) = tracker_at(1_000, ErrorConfig::default());
    tracker.record_error(
        "/v1/chat",
        504,
        "timeout",
        "upstream timed out after 3000 ms",
        ErrorContext::new()
            .with_model("sim-7b")
            .with_request_id("req-a1")
            .with_user_id("user-1"),
    );
    tracker.record_error(
        "/v1/chat",
        504,
        "timeout",
        "upstream timed out after 9000 ms",
        ErrorContext::new()
            .with_model("sim-70b")
            .with_request_id("req-b2")
            .with_user_id("user-2"),
    );

    let patterns = tracker.get_error_patterns(1, false);
    assert_eq!(patterns.len(), 1);
    let pattern = &patterns[0];
    assert_eq!(pattern.count, 2);
    assert_eq!(pattern.error_type, "timeout");
    assert_eq!(pattern.endpoint, "/v1/chat");
    assert_eq!(pattern.normalized_message, "upstream timed out after <NUM> ms");
    assert_eq!(pattern.affected_models.len(), 2);
    assert_eq!(pattern.affected_users.len(), 2);
    assert_eq!(pattern.example_request_ids, vec!["req-a1", "req-b2"]);
}

#[test]
fn different_type_or_endpoint_forms_distinct_patterns() {
    let (tracker, _clock) = tracker_at(1_000, ErrorConfig::default());
    tracker.record_error("/v1/chat", 504, "timeout", "timed out", ErrorContext::new());
    tracker.record_error("/v1/embed", 504, "timeout", "timed out", ErrorContext::new());
    tracker.record_error("/v1/chat", 429, "overload", "timed out", ErrorContext::new());
    assert_eq!(tracker.get_error_patterns(1, false).len(), 3);
}

#[test]
fn pattern_query_filters_by_count_and_sorts_descending() {
    let (tracker, _clock) = tracker_at(1_000, ErrorConfig::default());
    for _ in 0..3 {
        tracker.record_error("/v1/chat", 504, "timeout", "timed out", ErrorContext::new());
    }
    tracker.record_error("/v1/chat", 500, "internal", "exploded", ErrorContext::new());

    let all = tracker.get_error_patterns(1, false);
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].count, 3);
    assert_eq!(all[1].count, 1);

    let frequent = tracker.get_error_patterns(2, false);
    assert_eq!(frequent.len(), 1);
    assert_eq!(frequent[0].error_type, "timeout");
}

#[test]
fn recent_only_hides_patterns_outside_the_window() {
    let (tracker, clock) = tracker_at(
        1_000,
        ErrorConfig {
            window_seconds: 60,
            ..ErrorConfig::default()
        },
    );
    tracker.record_error("/v1/chat", 504, "timeout", "stale", ErrorContext::new());
    clock.advance_ms(120_000);
    tracker.record_error("/v1/chat", 500, "internal", "fresh", ErrorContext::new());

    assert_eq!(tracker.get_error_patterns(1, false).len(), 2);
    let recent = tracker.get_error_patterns(1, true);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].error_type, "internal");
}

#[test]
fn cleanup_removes_only_aged_out_patterns() {
    let (tracker, clock) = tracker_at(1_000, ErrorConfig::default());
    tracker.record_error("/v1/chat", 504, "timeout", "stale", ErrorContext::new());
    clock.advance_ms(3_600_000);
    tracker.record_error("/v1/chat", 500, "internal", "fresh", ErrorContext::new());

    let removed = tracker.cleanup_old_patterns(600);
    assert_eq!(removed, 1);
    let survivors = tracker.get_error_patterns(1, false);
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].error_type, "internal");
}

#[test]
fn recent_ring_is_bounded_and_newest_first() {
    let (tracker, _clock) = tracker_at(
        1_000,
        ErrorConfig {
            max_recent_errors: 3,
            ..ErrorConfig::default()
        },
    );
    for index in 1..=5 {
        tracker.record_error(
            "/v1/chat",
            500,
            "internal",
            format!("failure {index}"),
            ErrorContext::new(),
        );
    }
    let recent = tracker.get_recent_errors(10, None, None);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].error_message, "failure 5");
    assert_eq!(recent[2].error_message, "failure 3");
}

#[test]
fn recent_errors_honor_endpoint_and_type_filters() {
    let (tracker, _clock) = tracker_at(1_000, ErrorConfig::default());
    tracker.record_error("/v1/chat", 504, "timeout", "a", ErrorContext::new());
    tracker.record_error("/v1/embed", 504, "timeout", "b", ErrorContext::new());
    tracker.record_error("/v1/chat", 500, "internal", "c", ErrorContext::new());

    let chat = tracker.get_recent_errors(10, Some("/v1/chat"), None);
    assert_eq!(chat.len(), 2);
    let chat_timeouts = tracker.get_recent_errors(10, Some("/v1/chat"), Some("timeout"));
    assert_eq!(chat_timeouts.len(), 1);
    assert_eq!(chat_timeouts[0].error_message, "a");
    let limited = tracker.get_recent_errors(1, None, None);
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].error_message, "c");
}

#[test]
fn example_request_ids_are_capped() {
    let (tracker, _clock) = tracker_at(1_000, ErrorConfig::default());
    for index in 0..15 {
        tracker.record_error(
            "/v1/chat",
            504,
            "timeout",
            "timed out",
            ErrorContext::new().with_request_id(format!("req-{index}")),
        );
    }
    let patterns = tracker.get_error_patterns(1, false);
    assert_eq!(patterns[0].count, 15);
    assert_eq!(patterns[0].example_request_ids.len(), 10);
}

#[test]
fn successes_do_not_create_model_error_series() {
    let (tracker, _clock) = tracker_at(1_000, ErrorConfig::default());
    tracker.record_success("/v1/chat", Some("sim-7b"));
    tracker.record_error(
        "/v1/chat",
        504,
        "timeout",
        "timed out",
        ErrorContext::new().with_model("sim-70b"),
    );

    let metrics = tracker.get_metrics();
    assert!(!metrics.errors_by_model.contains_key("sim-7b"));
    assert_eq!(metrics.errors_by_model["sim-70b"], 1);
}

#[test]
fn reset_clears_every_series() {
    let (tracker, _clock) = tracker_at(1_000, ErrorConfig::default());
    tracker.record_error("/v1/chat", 504, "timeout", "timed out", ErrorContext::new());
    tracker.record_success("/v1/chat", Some("sim-7b"));
    tracker.reset();

    let metrics = tracker.get_metrics();
    assert_eq!(metrics.total_requests, 0);
    assert_eq!(metrics.failures, 0);
    assert_eq!(metrics.pattern_count, 0);
    assert!(tracker.get_recent_errors(10, None, None).is_empty());
    assert_eq!(metrics.slo.success_rate, 1.0);
}
