//! Inference timing by operator
//!
//! A [`Profiler`] accumulates call counts and wall-clock time per operator
//! name. Module trees record one entry per leaf layer and scripted models one
//! per program op, so the same table compares both.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Span covering one whole measured evaluation
pub const INFERENCE_SPAN: &str = "model_inference";
/// Rows kept in a profile table
pub const TABLE_ROWS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct OpStats {
    calls: u64,
    total: Duration,
}

/// Per-operator timing accumulator
#[derive(Debug, Clone, Default)]
pub struct Profiler {
    ops: BTreeMap<&'static str, OpStats>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &'static str, elapsed: Duration) {
        let stats = self.ops.entry(name).or_default();
        stats.calls += 1;
        stats.total += elapsed;
    }

    /// Run `f` and record its duration under `name`
    pub fn time<T>(&mut self, name: &'static str, f: impl FnOnce(&mut Self) -> T) -> T {
        let start = Instant::now();
        let out = f(self);
        self.record(name, start.elapsed());
        out
    }

    pub fn calls(&self, name: &str) -> u64 {
        self.ops.get(name).map_or(0, |s| s.calls)
    }

    pub fn total(&self, name: &str) -> Duration {
        self.ops.get(name).map_or(Duration::ZERO, |s| s.total)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operators by descending total time, at most `limit` rows
    pub fn top(&self, limit: usize) -> Vec<OpTiming> {
        let mut rows: Vec<(&&'static str, &OpStats)> = self.ops.iter().collect();
        rows.sort_by(|a, b| b.1.total.cmp(&a.1.total).then(a.0.cmp(b.0)));
        rows.into_iter()
            .take(limit)
            .map(|(name, stats)| OpTiming {
                name: (*name).to_string(),
                calls: stats.calls,
                total_ms: millis(stats.total),
            })
            .collect()
    }

    /// Time of [`INFERENCE_SPAN`] plus the `limit` slowest operators
    pub fn summary(&self, limit: usize) -> InferenceProfile {
        InferenceProfile {
            total_ms: millis(self.total(INFERENCE_SPAN)),
            ops: self.top(limit),
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1e3
}

/// One row of a profile table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpTiming {
    pub name: String,
    pub calls: u64,
    pub total_ms: f64,
}

impl OpTiming {
    /// Mean time per call in microseconds
    pub fn avg_us(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_ms * 1e3 / self.calls as f64
        }
    }
}

/// Timing of one measured evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceProfile {
    /// Wall-clock time of the whole evaluation
    pub total_ms: f64,
    /// Slowest operators first
    pub ops: Vec<OpTiming>,
}

impl InferenceProfile {
    /// Header, one line per operator, and the total
    pub fn table(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{:<24}{:>8}{:>16}{:>14}",
            "Name", "Calls", "CPU total (ms)", "CPU avg (us)"
        )];
        lines.extend(self.ops.iter().map(|op| {
            format!(
                "{:<24}{:>8}{:>16.3}{:>14.1}",
                op.name,
                op.calls,
                op.total_ms,
                op.avg_us()
            )
        }));
        lines.push(format!("Inference time total: {:.3} ms", self.total_ms));
        lines
    }
}
