use hdrhistogram::Histogram;
use serde::Serialize;

/// Percentile breakdown of flush latency in microseconds.
/// Serialized as-is into `/api/stats` and every SSE tick.
///
/// Values come from an HdrHistogram, so each one is accurate to the
/// histogram's significant figures rather than exact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentileSet {
    /// Fastest recorded flush
    pub min: u64,
    /// Slowest recorded flush
    pub max: u64,
    pub mean: f64,
    /// Median
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    /// One flush in a thousand is slower than this
    pub p999: u64,
    /// Number of successful flushes observed
    pub count: u64,
}

impl PercentileSet {
    /// Extract the full set from an HdrHistogram.
    /// Returns zeroed values if the histogram is empty.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.len() == 0 {
            return Self::empty();
        }

        Self {
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p999: hist.value_at_quantile(0.999),
            count: hist.len(),
        }
    }

    /// All-zero placeholder used before the first successful flush.
    pub fn empty() -> Self {
        Self {
            min: 0,
            max: 0,
            mean: 0.0,
            p50: 0,
            p95: 0,
            p99: 0,
            p999: 0,
            count: 0,
        }
    }
}
