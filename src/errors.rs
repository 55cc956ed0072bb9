use crate::clock::{Clock, SystemClock};
use crate::export::{MetricKind, PromWriter};
use crate::fingerprint::{fingerprint, normalize_message};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const DEFAULT_MAX_RECENT_ERRORS: usize = 1_000;
pub const DEFAULT_ERROR_BUDGET_SLO: f64 = 0.999;
pub const DEFAULT_WINDOW_SECONDS: u64 = 300;
pub const DEFAULT_PATTERN_THRESHOLD: u64 = 5;

/// At most this many example request ids are kept per pattern.
const MAX_PATTERN_EXAMPLES: usize = 10;
/// Breadth of the top-N breakdowns in [`ErrorMetricsSnapshot`].
const TOP_N: usize = 5;

/// Sizing, windowing, and SLO knobs for the error tracker.
#[derive(Debug, Clone, Copy)]
pub struct ErrorConfig {
    pub max_recent_errors: usize,
    /// Target success rate, e.g. 0.999 allows one failure per thousand.
    pub error_budget_slo: f64,
    /// Rolling window for "recent" pattern queries and windowed counts.
    pub window_seconds: u64,
    /// A pattern is reported as hot once its count reaches this threshold.
    pub pattern_threshold: u64,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            max_recent_errors: DEFAULT_MAX_RECENT_ERRORS,
            error_budget_slo: DEFAULT_ERROR_BUDGET_SLO,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            pattern_threshold: DEFAULT_PATTERN_THRESHOLD,
        }
    }
}

/// Optional attribution attached to a recorded error.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    model: Option<String>,
    api_key: Option<String>,
    request_id: Option<String>,
    user_id: Option<String>,
    stack_trace: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }
}

/// Immutable record of one error occurrence, held in the bounded ring.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp_ms: u64,
    pub endpoint: String,
    pub status_code: u16,
    pub error_type: String,
    pub error_message: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub stack_trace: Option<String>,
    pub fingerprint: String,
}

/// Accumulated view of one error shape, keyed by fingerprint. Created lazily
/// on first occurrence and removed only by explicit age-based cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPattern {
    pub fingerprint: String,
    pub error_type: String,
    pub endpoint: String,
    pub normalized_message: String,
    pub count: u64,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub affected_models: BTreeSet<String>,
    pub affected_users: BTreeSet<String>,
    pub example_request_ids: Vec<String>,
}

/// SLO compliance derived on demand from running counters. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SloStatus {
    pub target_success_rate: f64,
    pub window_seconds: u64,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub error_budget_total: u64,
    pub error_budget_consumed: u64,
    /// Signed and unclamped: negative once the budget is overspent.
    pub error_budget_remaining: i64,
    pub slo_violated: bool,
    pub burn_rate: f64,
    pub endpoint_error_rates: BTreeMap<String, f64>,
}

/// One row of a top-N breakdown.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CountEntry {
    pub name: String,
    pub count: u64,
}

/// Read-side export of [`ErrorMetricsTracker::get_metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorMetricsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    /// Errors observed within the rolling window (vs. `failures` for total).
    pub windowed_errors: u64,
    pub top_error_types: Vec<CountEntry>,
    pub top_endpoints: Vec<CountEntry>,
    pub top_status_codes: Vec<CountEntry>,
    pub errors_by_model: BTreeMap<String, u64>,
    pub pattern_count: usize,
    /// Patterns whose count reached the configured threshold.
    pub hot_pattern_count: usize,
    pub slo: SloStatus,
}

#[derive(Debug, Clone, Default)]
struct EndpointCounters {
    requests: u64,
    errors: u64,
}

#[derive(Default)]
struct ErrorInner {
    recent: VecDeque<ErrorRecord>,
    patterns: HashMap<String, ErrorPattern>,
    successes: u64,
    failures: u64,
    by_endpoint: BTreeMap<String, EndpointCounters>,
    by_model: BTreeMap<String, u64>,
    by_type: BTreeMap<String, u64>,
    by_status: BTreeMap<u16, u64>,
}

/// Tracks error occurrences, recurring error shapes, and SLO compliance.
///
/// Every operation is O(1) or O(bounded ring); nothing here ever surfaces an
/// error to the caller — degraded telemetry beats a failed request.
pub struct ErrorMetricsTracker {
    config: ErrorConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<ErrorInner>,
}

impl ErrorMetricsTracker {
    pub fn new(config: ErrorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Allows tests to inject a deterministic clock.
    pub fn with_clock(config: ErrorConfig, clock: Arc<dyn Clock>) -> Self {
        assert!(config.max_recent_errors > 0, "recent error capacity must be > 0");
        assert!(
            (0.0..=1.0).contains(&config.error_budget_slo),
            "SLO target must be within [0, 1]"
        );
        Self {
            config,
            clock,
            inner: Mutex::new(ErrorInner::default()),
        }
    }

    pub fn record_error(
        &self,
        endpoint: impl Into<String>,
        status_code: u16,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        context: ErrorContext,
    ) {
        let now = self.clock.now_ms();
        let endpoint = endpoint.into();
        let error_type = error_type.into();
        let error_message = error_message.into();
        let print = fingerprint(&error_type, &endpoint, &error_message);
        let record = ErrorRecord {
            timestamp_ms: now,
            endpoint: endpoint.clone(),
            status_code,
            error_type: error_type.clone(),
            error_message: error_message.clone(),
            model: context.model.clone(),
            api_key: context.api_key,
            request_id: context.request_id.clone(),
            user_id: context.user_id.clone(),
            stack_trace: context.stack_trace,
            fingerprint: print.clone(),
        };

        let mut inner = self.lock();
        while inner.recent.len() >= self.config.max_recent_errors {
            inner.recent.pop_front();
        }
        inner.recent.push_back(record);
        inner.failures += 1;
        {
            let endpoint_counters = inner.by_endpoint.entry(endpoint.clone()).or_default();
            endpoint_counters.requests += 1;
            endpoint_counters.errors += 1;
        }
        if let Some(model) = &context.model {
            *inner.by_model.entry(model.clone()).or_insert(0) += 1;
        }
        *inner.by_type.entry(error_type.clone()).or_insert(0) += 1;
        *inner.by_status.entry(status_code).or_insert(0) += 1;

        let pattern = inner
            .patterns
            .entry(print.clone())
            .or_insert_with(|| ErrorPattern {
                fingerprint: print,
                error_type,
                endpoint,
                normalized_message: normalize_message(&error_message),
                count: 0,
                first_seen_ms: now,
                last_seen_ms: now,
                affected_models: BTreeSet::new(),
                affected_users: BTreeSet::new(),
                example_request_ids: Vec::new(),
            });
        pattern.count += 1;
        pattern.last_seen_ms = now;
        if let Some(model) = context.model {
            pattern.affected_models.insert(model);
        }
        if let Some(user_id) = context.user_id {
            pattern.affected_users.insert(user_id);
        }
        if let Some(request_id) = context.request_id {
            if pattern.example_request_ids.len() < MAX_PATTERN_EXAMPLES {
                pattern.example_request_ids.push(request_id);
            }
        }
    }

    /// O(1) success accounting: feeds the SLO denominator, stores nothing.
    /// The model is accepted for call-site symmetry but `errors_by_model`
    /// only tracks errors, so successes leave it untouched.
    pub fn record_success(&self, endpoint: impl Into<String>, _model: Option<&str>) {
        let mut inner = self.lock();
        inner.successes += 1;
        inner.by_endpoint.entry(endpoint.into()).or_default().requests += 1;
    }

    /// Most-recent-first slice of the error ring, optionally filtered.
    pub fn get_recent_errors(
        &self,
        limit: usize,
        endpoint: Option<&str>,
        error_type: Option<&str>,
    ) -> Vec<ErrorRecord> {
        let inner = self.lock();
        inner
            .recent
            .iter()
            .rev()
            .filter(|record| endpoint.map_or(true, |wanted| record.endpoint == wanted))
            .filter(|record| error_type.map_or(true, |wanted| record.error_type == wanted))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Patterns with at least `min_count` occurrences, count-descending.
    /// `recent_only` keeps patterns last seen inside the rolling window.
    pub fn get_error_patterns(&self, min_count: u64, recent_only: bool) -> Vec<ErrorPattern> {
        let cutoff_ms = self
            .clock
            .now_ms()
            .saturating_sub(self.config.window_seconds.saturating_mul(1_000));
        let inner = self.lock();
        let mut patterns: Vec<ErrorPattern> = inner
            .patterns
            .values()
            .filter(|pattern| pattern.count >= min_count)
            .filter(|pattern| !recent_only || pattern.last_seen_ms >= cutoff_ms)
            .cloned()
            .collect();
        patterns.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        patterns
    }

    /// Recomputes SLO compliance from running counters. O(1) aside from the
    /// per-endpoint rate map.
    pub fn get_slo_status(&self) -> SloStatus {
        let inner = self.lock();
        self.slo_status_locked(&inner)
    }

    pub fn get_metrics(&self) -> ErrorMetricsSnapshot {
        let cutoff_ms = self
            .clock
            .now_ms()
            .saturating_sub(self.config.window_seconds.saturating_mul(1_000));
        let inner = self.lock();
        let slo = self.slo_status_locked(&inner);
        let windowed_errors = inner
            .recent
            .iter()
            .rev()
            .take_while(|record| record.timestamp_ms >= cutoff_ms)
            .count() as u64;
        let hot_pattern_count = inner
            .patterns
            .values()
            .filter(|pattern| pattern.count >= self.config.pattern_threshold)
            .count();
        ErrorMetricsSnapshot {
            total_requests: slo.total_requests,
            successes: inner.successes,
            failures: inner.failures,
            success_rate: slo.success_rate,
            error_rate: slo.error_rate,
            windowed_errors,
            top_error_types: top_n(inner.by_type.iter().map(|(k, v)| (k.clone(), *v))),
            top_endpoints: top_n(
                inner
                    .by_endpoint
                    .iter()
                    .map(|(k, counters)| (k.clone(), counters.errors)),
            ),
            top_status_codes: top_n(
                inner.by_status.iter().map(|(k, v)| (k.to_string(), *v)),
            ),
            errors_by_model: inner.by_model.clone(),
            pattern_count: inner.patterns.len(),
            hot_pattern_count,
            slo,
        }
    }

    pub fn get_prometheus_metrics(&self) -> String {
        let snapshot = self.get_metrics();
        let mut writer = PromWriter::new();
        writer.family(
            "tokentrace_requests_total",
            "Requests observed, by outcome.",
            MetricKind::Counter,
        );
        writer.sample(
            "tokentrace_requests_total",
            &[("outcome", "success")],
            snapshot.successes as f64,
        );
        writer.sample(
            "tokentrace_requests_total",
            &[("outcome", "error")],
            snapshot.failures as f64,
        );
        writer.family(
            "tokentrace_errors_by_type_total",
            "Errors by type.",
            MetricKind::Counter,
        );
        for entry in &snapshot.top_error_types {
            writer.sample(
                "tokentrace_errors_by_type_total",
                &[("error_type", &entry.name)],
                entry.count as f64,
            );
        }
        writer.family(
            "tokentrace_errors_by_endpoint_total",
            "Errors by endpoint.",
            MetricKind::Counter,
        );
        for entry in &snapshot.top_endpoints {
            writer.sample(
                "tokentrace_errors_by_endpoint_total",
                &[("endpoint", &entry.name)],
                entry.count as f64,
            );
        }
        writer.family(
            "tokentrace_errors_by_status_total",
            "Errors by HTTP status code.",
            MetricKind::Counter,
        );
        for entry in &snapshot.top_status_codes {
            writer.sample(
                "tokentrace_errors_by_status_total",
                &[("status", &entry.name)],
                entry.count as f64,
            );
        }
        writer.family(
            "tokentrace_error_patterns",
            "Distinct error shapes currently tracked.",
            MetricKind::Gauge,
        );
        writer.sample(
            "tokentrace_error_patterns",
            &[],
            snapshot.pattern_count as f64,
        );
        writer.family(
            "tokentrace_slo_success_rate",
            "Observed success rate.",
            MetricKind::Gauge,
        );
        writer.sample("tokentrace_slo_success_rate", &[], snapshot.slo.success_rate);
        writer.family(
            "tokentrace_slo_target",
            "Configured target success rate.",
            MetricKind::Gauge,
        );
        writer.sample(
            "tokentrace_slo_target",
            &[],
            snapshot.slo.target_success_rate,
        );
        writer.family(
            "tokentrace_slo_burn_rate",
            "Error rate relative to the allowed error rate.",
            MetricKind::Gauge,
        );
        writer.sample("tokentrace_slo_burn_rate", &[], snapshot.slo.burn_rate);
        writer.family(
            "tokentrace_error_budget_remaining",
            "Error budget left in the current population (signed).",
            MetricKind::Gauge,
        );
        writer.sample(
            "tokentrace_error_budget_remaining",
            &[],
            snapshot.slo.error_budget_remaining as f64,
        );
        writer.family(
            "tokentrace_slo_violated",
            "Whether the current error rate exceeds the SLO allowance.",
            MetricKind::Gauge,
        );
        writer.sample(
            "tokentrace_slo_violated",
            &[],
            if snapshot.slo.slo_violated { 1.0 } else { 0.0 },
        );
        writer.finish()
    }

    /// Drops patterns not seen within `age_seconds`; returns how many were
    /// removed. Intended for periodic external invocation — the pattern map
    /// is otherwise unbounded.
    pub fn cleanup_old_patterns(&self, age_seconds: u64) -> usize {
        let cutoff_ms = self
            .clock
            .now_ms()
            .saturating_sub(age_seconds.saturating_mul(1_000));
        let mut inner = self.lock();
        let before = inner.patterns.len();
        inner
            .patterns
            .retain(|_, pattern| pattern.last_seen_ms >= cutoff_ms);
        before - inner.patterns.len()
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = ErrorInner::default();
    }

    fn slo_status_locked(&self, inner: &ErrorInner) -> SloStatus {
        let target = self.config.error_budget_slo;
        let total = inner.successes + inner.failures;
        let (success_rate, error_rate) = if total == 0 {
            (1.0, 0.0)
        } else {
            let success_rate = inner.successes as f64 / total as f64;
            (success_rate, 1.0 - success_rate)
        };
        let allowed_error_rate = 1.0 - target;
        let error_budget_total = (total as f64 * allowed_error_rate).floor() as u64;
        let error_budget_consumed = inner.failures;
        let burn_rate = if allowed_error_rate > 0.0 {
            error_rate / allowed_error_rate
        } else if error_rate > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let endpoint_error_rates = inner
            .by_endpoint
            .iter()
            .map(|(endpoint, counters)| {
                let rate = if counters.requests > 0 {
                    counters.errors as f64 / counters.requests as f64
                } else {
                    0.0
                };
                (endpoint.clone(), rate)
            })
            .collect();
        SloStatus {
            target_success_rate: target,
            window_seconds: self.config.window_seconds,
            total_requests: total,
            successes: inner.successes,
            failures: inner.failures,
            success_rate,
            error_rate,
            error_budget_total,
            error_budget_consumed,
            error_budget_remaining: error_budget_total as i64 - error_budget_consumed as i64,
            slo_violated: error_rate > allowed_error_rate,
            burn_rate,
            endpoint_error_rates,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ErrorInner> {
        self.inner.lock().expect("error tracker state poisoned")
    }
}

fn top_n(entries: impl Iterator<Item = (String, u64)>) -> Vec<CountEntry> {
    let mut rows: Vec<CountEntry> = entries
        .map(|(name, count)| CountEntry { name, count })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    rows.truncate(TOP_N);
    rows
}
