use crate::quantile::PercentileSummary;
use std::fmt::Write as _;

/// Prometheus metric families emitted by the trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Summary,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Summary => "summary",
        }
    }
}

/// Incremental Prometheus exposition-format writer.
///
/// Every family gets a `# HELP`/`# TYPE` preamble and every label value is
/// escaped, so the output stays parseable regardless of what ends up inside
/// error messages or endpoint paths.
#[derive(Debug, Default)]
pub struct PromWriter {
    out: String,
}

impl PromWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the `# HELP` / `# TYPE` preamble for a metric family.
    pub fn family(&mut self, name: &str, help: &str, kind: MetricKind) {
        let _ = writeln!(self.out, "# HELP {name} {help}");
        let _ = writeln!(self.out, "# TYPE {name} {}", kind.as_str());
    }

    /// Writes one sample line with an optional label set.
    pub fn sample(&mut self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.out.push_str(name);
        self.write_labels(labels);
        let _ = writeln!(self.out, " {value}");
    }

    /// Writes a summary family body: quantile samples plus `_sum`/`_count`.
    pub fn summary(&mut self, name: &str, labels: &[(&str, &str)], summary: &PercentileSummary) {
        for (quantile, value) in [
            ("0.5", summary.p50),
            ("0.95", summary.p95),
            ("0.99", summary.p99),
        ] {
            self.out.push_str(name);
            let mut with_quantile: Vec<(&str, &str)> = labels.to_vec();
            with_quantile.push(("quantile", quantile));
            self.write_labels(&with_quantile);
            let _ = writeln!(self.out, " {value}");
        }
        let sum = summary.mean * summary.count as f64;
        self.out.push_str(name);
        self.out.push_str("_sum");
        self.write_labels(labels);
        let _ = writeln!(self.out, " {sum}");
        self.out.push_str(name);
        self.out.push_str("_count");
        self.write_labels(labels);
        let _ = writeln!(self.out, " {}", summary.count);
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn write_labels(&mut self, labels: &[(&str, &str)]) {
        if labels.is_empty() {
            return;
        }
        self.out.push('{');
        for (index, (key, value)) in labels.iter().enumerate() {
            if index > 0 {
                self.out.push(',');
            }
            let _ = write!(self.out, "{key}=\"{}\"", escape_label_value(value));
        }
        self.out.push('}');
    }
}

/// Escapes backslashes, double quotes, and newlines in label values.
pub fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Extracts metric names (without labels) from exposition text.
///
/// Used by tests to assert the output structure parses cleanly.
pub fn scrape_metric_names(exposition: &str) -> Vec<String> {
    exposition
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let mut parts = trimmed.split(|c: char| c == '{' || c.is_whitespace());
            parts
                .next()
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string())
        })
        .collect()
}
