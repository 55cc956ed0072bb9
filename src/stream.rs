use crate::clock::{Clock, SystemClock};
use crate::export::{MetricKind, PromWriter};
use crate::quantile::PercentileSummary;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const DEFAULT_MAX_ACTIVE_STREAMS: usize = 1_000;
pub const DEFAULT_MAX_COMPLETED_STREAMS: usize = 10_000;
pub const DEFAULT_AGGREGATION_WINDOW_SECONDS: u64 = 300;

/// Sizing and windowing knobs for the streaming tracker.
#[derive(Debug, Clone, Copy)]
pub struct StreamingConfig {
    pub max_active_streams: usize,
    pub max_completed_streams: usize,
    /// Horizon for aggregate percentiles: only streams finalized within this
    /// many seconds of the snapshot contribute samples.
    pub aggregation_window_seconds: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_active_streams: DEFAULT_MAX_ACTIVE_STREAMS,
            max_completed_streams: DEFAULT_MAX_COMPLETED_STREAMS,
            aggregation_window_seconds: DEFAULT_AGGREGATION_WINDOW_SECONDS,
        }
    }
}

/// The one tracker error a caller must react to: the active-stream map is at
/// capacity and the request should be rejected upstream.
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("active stream limit {limit} reached; rejecting stream '{stream_id}'")]
    ActiveStreamLimit { stream_id: String, limit: usize },
}

/// Mutable lifecycle record for one token stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub stream_id: String,
    pub model: String,
    pub start_time_ms: u64,
    pub prompt_tokens: u64,
    pub tokens_generated: u64,
    pub total_bytes_sent: u64,
    token_timestamps_ms: Vec<u64>,
    pub first_token_ms: Option<u64>,
    pub completion_ms: Option<u64>,
    pub completed: bool,
    pub failed: bool,
    pub backpressure_count: u64,
}

impl StreamState {
    fn new(stream_id: String, model: String, prompt_tokens: u64, start_time_ms: u64) -> Self {
        Self {
            stream_id,
            model,
            start_time_ms,
            prompt_tokens,
            tokens_generated: 0,
            total_bytes_sent: 0,
            token_timestamps_ms: Vec::new(),
            first_token_ms: None,
            completion_ms: None,
            completed: false,
            failed: false,
            backpressure_count: 0,
        }
    }

    pub fn ttft_ms(&self) -> Option<u64> {
        self.first_token_ms
            .map(|first| first.saturating_sub(self.start_time_ms))
    }

    /// Gaps between consecutive token timestamps. Empty with one token or
    /// fewer, so the ITL sample count is always `tokens_generated - 1` for
    /// multi-token streams.
    pub fn itl_samples_ms(&self) -> Vec<f64> {
        self.token_timestamps_ms
            .windows(2)
            .map(|pair| pair[1].saturating_sub(pair[0]) as f64)
            .collect()
    }

    /// Wall time covered by the stream: finalized streams use their
    /// completion timestamp, active streams the caller-supplied `now`.
    pub fn duration_ms(&self, now_ms: u64) -> u64 {
        self.completion_ms
            .unwrap_or(now_ms)
            .saturating_sub(self.start_time_ms)
    }

    pub fn tokens_per_second(&self, now_ms: u64) -> f64 {
        if self.tokens_generated == 0 {
            return 0.0;
        }
        let duration_secs = self.duration_ms(now_ms) as f64 / 1_000.0;
        if duration_secs > 0.0 {
            self.tokens_generated as f64 / duration_secs
        } else {
            0.0
        }
    }

    fn details(&self, now_ms: u64, active: bool) -> StreamDetails {
        StreamDetails {
            stream_id: self.stream_id.clone(),
            model: self.model.clone(),
            active,
            completed: self.completed,
            failed: self.failed,
            start_time_ms: self.start_time_ms,
            completion_ms: self.completion_ms,
            prompt_tokens: self.prompt_tokens,
            tokens_generated: self.tokens_generated,
            total_bytes_sent: self.total_bytes_sent,
            backpressure_count: self.backpressure_count,
            ttft_ms: self.ttft_ms(),
            duration_ms: self.duration_ms(now_ms),
            tokens_per_second: self.tokens_per_second(now_ms),
        }
    }
}

/// Point-lookup view of a single stream, active or finalized.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamDetails {
    pub stream_id: String,
    pub model: String,
    pub active: bool,
    pub completed: bool,
    pub failed: bool,
    pub start_time_ms: u64,
    pub completion_ms: Option<u64>,
    pub prompt_tokens: u64,
    pub tokens_generated: u64,
    pub total_bytes_sent: u64,
    pub backpressure_count: u64,
    pub ttft_ms: Option<u64>,
    pub duration_ms: u64,
    pub tokens_per_second: f64,
}

/// Running totals per model; never recomputed from the population.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ModelTotals {
    pub streams_completed: u64,
    pub streams_failed: u64,
    pub tokens_generated: u64,
}

/// Cached aggregate view returned by [`StreamingMetricsTracker::get_metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct StreamingSnapshot {
    pub active_streams: usize,
    pub completed_streams: usize,
    pub streams_started: u64,
    pub streams_completed: u64,
    pub streams_failed: u64,
    pub tokens_generated: u64,
    pub bytes_sent: u64,
    pub backpressure_signals: u64,
    pub window_seconds: u64,
    /// Finalized streams that contributed samples to the summaries below.
    pub window_sample_count: usize,
    pub ttft_ms: PercentileSummary,
    pub itl_ms: PercentileSummary,
    pub tokens_per_second: PercentileSummary,
    pub duration_ms: PercentileSummary,
    pub per_model: BTreeMap<String, ModelTotals>,
}

#[derive(Debug, Default)]
struct StreamTotals {
    streams_started: u64,
    streams_completed: u64,
    streams_failed: u64,
    tokens_generated: u64,
    bytes_sent: u64,
    backpressure_signals: u64,
}

#[derive(Default)]
struct StreamingInner {
    active: HashMap<String, StreamState>,
    completed: VecDeque<StreamState>,
    per_model: BTreeMap<String, ModelTotals>,
    totals: StreamTotals,
    cache: Option<StreamingSnapshot>,
    /// Bumped on every finalization; guards against caching a snapshot that
    /// raced a concurrent completion.
    generation: u64,
}

/// Bounded tracker for per-stream token timing, with cached percentile
/// aggregates over the finalized population.
///
/// The internal mutex only covers field mutation and the population copy;
/// percentile math always runs with the lock released.
pub struct StreamingMetricsTracker {
    config: StreamingConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<StreamingInner>,
}

impl StreamingMetricsTracker {
    pub fn new(config: StreamingConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Allows tests to inject a deterministic clock.
    pub fn with_clock(config: StreamingConfig, clock: Arc<dyn Clock>) -> Self {
        assert!(config.max_active_streams > 0, "active stream capacity must be > 0");
        assert!(
            config.max_completed_streams > 0,
            "completed stream capacity must be > 0"
        );
        Self {
            config,
            clock,
            inner: Mutex::new(StreamingInner::default()),
        }
    }

    /// Admits a new stream. Fails at capacity; a duplicate id is a silent
    /// idempotent no-op.
    pub fn start_stream(
        &self,
        stream_id: impl Into<String>,
        model: impl Into<String>,
        prompt_tokens: u64,
    ) -> Result<(), StreamingError> {
        let stream_id = stream_id.into();
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        if inner.active.contains_key(&stream_id) {
            return Ok(());
        }
        if inner.active.len() >= self.config.max_active_streams {
            return Err(StreamingError::ActiveStreamLimit {
                stream_id,
                limit: self.config.max_active_streams,
            });
        }
        let state = StreamState::new(stream_id.clone(), model.into(), prompt_tokens, now);
        inner.active.insert(stream_id, state);
        inner.totals.streams_started += 1;
        Ok(())
    }

    /// Records one generated token chunk. Unknown ids are ignored — expected
    /// under shutdown races, never an error on the hot path.
    pub fn record_token(&self, stream_id: &str, chunk_bytes: u64) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let Some(state) = inner.active.get_mut(stream_id) else {
            return;
        };
        state.token_timestamps_ms.push(now);
        state.tokens_generated += 1;
        state.total_bytes_sent += chunk_bytes;
        if state.first_token_ms.is_none() {
            state.first_token_ms = Some(now);
        }
        inner.totals.tokens_generated += 1;
        inner.totals.bytes_sent += chunk_bytes;
    }

    /// Explicit override for out-of-band TTFT measurement.
    pub fn record_first_token_time(&self, stream_id: &str, ttft_ms: u64) {
        let mut inner = self.lock();
        let Some(state) = inner.active.get_mut(stream_id) else {
            return;
        };
        state.first_token_ms = Some(state.start_time_ms + ttft_ms);
    }

    pub fn record_backpressure(&self, stream_id: &str) {
        let mut inner = self.lock();
        let Some(state) = inner.active.get_mut(stream_id) else {
            return;
        };
        state.backpressure_count += 1;
        inner.totals.backpressure_signals += 1;
    }

    pub fn complete_stream(&self, stream_id: &str) {
        self.finalize(stream_id, false);
    }

    pub fn fail_stream(&self, stream_id: &str) {
        self.finalize(stream_id, true);
    }

    fn finalize(&self, stream_id: &str, failed: bool) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let Some(mut state) = inner.active.remove(stream_id) else {
            return;
        };
        state.completion_ms = Some(now);
        state.completed = !failed;
        state.failed = failed;
        if failed {
            inner.totals.streams_failed += 1;
        } else {
            inner.totals.streams_completed += 1;
        }
        let model_totals = inner.per_model.entry(state.model.clone()).or_default();
        if failed {
            model_totals.streams_failed += 1;
        } else {
            model_totals.streams_completed += 1;
        }
        model_totals.tokens_generated += state.tokens_generated;
        while inner.completed.len() >= self.config.max_completed_streams {
            inner.completed.pop_front();
        }
        inner.completed.push_back(state);
        inner.cache = None;
        inner.generation += 1;
    }

    /// Aggregate snapshot, cached until the next completion or failure.
    /// Active-stream mutations intentionally leave a cached snapshot stale.
    pub fn get_metrics(&self) -> StreamingSnapshot {
        let now = self.clock.now_ms();
        let window_ms = self.config.aggregation_window_seconds.saturating_mul(1_000);
        let cutoff_ms = now.saturating_sub(window_ms);

        // Copy the bounded population under the lock; crunch it outside.
        let (generation, samples, base) = {
            let inner = self.lock();
            if let Some(cached) = &inner.cache {
                return cached.clone();
            }
            let mut samples = PopulationSamples::default();
            for state in &inner.completed {
                let completion = state.completion_ms.unwrap_or(state.start_time_ms);
                if completion < cutoff_ms {
                    continue;
                }
                samples.streams += 1;
                if let Some(ttft) = state.ttft_ms() {
                    samples.ttft_ms.push(ttft as f64);
                }
                samples.itl_ms.extend(state.itl_samples_ms());
                samples.tokens_per_second.push(state.tokens_per_second(now));
                samples.duration_ms.push(state.duration_ms(now) as f64);
            }
            let base = StreamingSnapshot {
                active_streams: inner.active.len(),
                completed_streams: inner.completed.len(),
                streams_started: inner.totals.streams_started,
                streams_completed: inner.totals.streams_completed,
                streams_failed: inner.totals.streams_failed,
                tokens_generated: inner.totals.tokens_generated,
                bytes_sent: inner.totals.bytes_sent,
                backpressure_signals: inner.totals.backpressure_signals,
                window_seconds: self.config.aggregation_window_seconds,
                window_sample_count: 0,
                ttft_ms: PercentileSummary::default(),
                itl_ms: PercentileSummary::default(),
                tokens_per_second: PercentileSummary::default(),
                duration_ms: PercentileSummary::default(),
                per_model: inner.per_model.clone(),
            };
            (inner.generation, samples, base)
        };

        let mut snapshot = base;
        snapshot.window_sample_count = samples.streams;
        snapshot.ttft_ms = PercentileSummary::from_samples(&samples.ttft_ms);
        snapshot.itl_ms = PercentileSummary::from_samples(&samples.itl_ms);
        snapshot.tokens_per_second = PercentileSummary::from_samples(&samples.tokens_per_second);
        snapshot.duration_ms = PercentileSummary::from_samples(&samples.duration_ms);

        let mut inner = self.lock();
        if inner.generation == generation {
            inner.cache = Some(snapshot.clone());
        }
        snapshot
    }

    /// Point lookup: active map first, then the completed ring.
    pub fn get_stream_details(&self, stream_id: &str) -> Option<StreamDetails> {
        let now = self.clock.now_ms();
        let inner = self.lock();
        if let Some(state) = inner.active.get(stream_id) {
            return Some(state.details(now, true));
        }
        inner
            .completed
            .iter()
            .rev()
            .find(|state| state.stream_id == stream_id)
            .map(|state| state.details(now, false))
    }

    pub fn get_prometheus_metrics(&self) -> String {
        let snapshot = self.get_metrics();
        let mut writer = PromWriter::new();
        writer.family(
            "tokentrace_streams_active",
            "Streams currently generating tokens.",
            MetricKind::Gauge,
        );
        writer.sample("tokentrace_streams_active", &[], snapshot.active_streams as f64);
        writer.family(
            "tokentrace_streams_started_total",
            "Streams admitted since startup.",
            MetricKind::Counter,
        );
        writer.sample(
            "tokentrace_streams_started_total",
            &[],
            snapshot.streams_started as f64,
        );
        writer.family(
            "tokentrace_streams_finalized_total",
            "Streams finalized since startup, by outcome.",
            MetricKind::Counter,
        );
        writer.sample(
            "tokentrace_streams_finalized_total",
            &[("outcome", "completed")],
            snapshot.streams_completed as f64,
        );
        writer.sample(
            "tokentrace_streams_finalized_total",
            &[("outcome", "failed")],
            snapshot.streams_failed as f64,
        );
        writer.family(
            "tokentrace_stream_tokens_total",
            "Tokens generated across all streams.",
            MetricKind::Counter,
        );
        writer.sample(
            "tokentrace_stream_tokens_total",
            &[],
            snapshot.tokens_generated as f64,
        );
        writer.family(
            "tokentrace_stream_bytes_sent_total",
            "Bytes sent across all streams.",
            MetricKind::Counter,
        );
        writer.sample(
            "tokentrace_stream_bytes_sent_total",
            &[],
            snapshot.bytes_sent as f64,
        );
        writer.family(
            "tokentrace_stream_backpressure_total",
            "Backpressure signals observed on streams.",
            MetricKind::Counter,
        );
        writer.sample(
            "tokentrace_stream_backpressure_total",
            &[],
            snapshot.backpressure_signals as f64,
        );
        writer.family(
            "tokentrace_stream_ttft_ms",
            "Time to first token over the aggregation window.",
            MetricKind::Summary,
        );
        writer.summary("tokentrace_stream_ttft_ms", &[], &snapshot.ttft_ms);
        writer.family(
            "tokentrace_stream_itl_ms",
            "Inter-token latency over the aggregation window.",
            MetricKind::Summary,
        );
        writer.summary("tokentrace_stream_itl_ms", &[], &snapshot.itl_ms);
        writer.family(
            "tokentrace_stream_tokens_per_second",
            "Per-stream throughput over the aggregation window.",
            MetricKind::Summary,
        );
        writer.summary(
            "tokentrace_stream_tokens_per_second",
            &[],
            &snapshot.tokens_per_second,
        );
        writer.family(
            "tokentrace_stream_duration_ms",
            "Stream duration over the aggregation window.",
            MetricKind::Summary,
        );
        writer.summary("tokentrace_stream_duration_ms", &[], &snapshot.duration_ms);
        writer.family(
            "tokentrace_model_streams_total",
            "Finalized streams per model, by outcome.",
            MetricKind::Counter,
        );
        for (model, totals) in &snapshot.per_model {
            writer.sample(
                "tokentrace_model_streams_total",
                &[("model", model), ("outcome", "completed")],
                totals.streams_completed as f64,
            );
            writer.sample(
                "tokentrace_model_streams_total",
                &[("model", model), ("outcome", "failed")],
                totals.streams_failed as f64,
            );
        }
        writer.family(
            "tokentrace_model_tokens_total",
            "Tokens generated per model.",
            MetricKind::Counter,
        );
        for (model, totals) in &snapshot.per_model {
            writer.sample(
                "tokentrace_model_tokens_total",
                &[("model", model)],
                totals.tokens_generated as f64,
            );
        }
        writer.finish()
    }

    pub fn active_stream_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn completed_stream_count(&self) -> usize {
        self.lock().completed.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamingInner> {
        self.inner.lock().expect("streaming tracker state poisoned")
    }
}

#[derive(Default)]
struct PopulationSamples {
    streams: usize,
    ttft_ms: Vec<f64>,
    itl_ms: Vec<f64>,
    tokens_per_second: Vec<f64>,
    duration_ms: Vec<f64>,
}
