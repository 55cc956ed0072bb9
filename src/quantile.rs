use serde::Serialize;
use std::cmp::Ordering;

/// Aggregate statistics for one latency/throughput dimension.
///
/// p95 and p99 deliberately fall back to `max` when the population is too
/// small for their quantile split (fewer than 20 and 100 samples
/// respectively). Small-sample tails are reported pessimistically rather
/// than interpolated from noise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PercentileSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PercentileSummary {
    /// Computes the summary over an unordered sample set.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let count = sorted.len();
        let min = sorted[0];
        let max = sorted[count - 1];
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let p50 = median(&sorted);
        let p95 = if count >= 20 {
            quantiles(&sorted, 20)[18]
        } else {
            max
        };
        let p99 = if count >= 100 {
            quantiles(&sorted, 100)[98]
        } else {
            max
        };
        Self {
            count,
            min,
            max,
            mean,
            p50,
            p95,
            p99,
        }
    }
}

/// Median of a sorted, non-empty slice (midpoint average for even lengths).
pub fn median(sorted: &[f64]) -> f64 {
    let len = sorted.len();
    if len % 2 == 1 {
        sorted[len / 2]
    } else {
        (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
    }
}

/// Returns the `n - 1` equal-width quantile boundaries of a sorted slice.
///
/// Exclusive method with linear interpolation: boundary `i` sits at position
/// `i * (m + 1) / n` in the 1-based sample order, the same cut points a
/// monitoring stack computes for summary quantiles.
pub fn quantiles(sorted: &[f64], n: usize) -> Vec<f64> {
    let m = sorted.len();
    assert!(n >= 2, "quantile split must be at least 2");
    assert!(m >= 2, "need at least two samples for quantile boundaries");
    let mut boundaries = Vec::with_capacity(n - 1);
    for i in 1..n {
        let pos = (i as f64) * ((m + 1) as f64) / (n as f64);
        let j = (pos.floor() as usize).clamp(1, m - 1);
        let gamma = pos - j as f64;
        boundaries.push(sorted[j - 1] + gamma * (sorted[j] - sorted[j - 1]));
    }
    boundaries
}
