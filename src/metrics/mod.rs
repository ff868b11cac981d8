pub mod collector;
pub mod percentiles;
pub mod stream;

pub use collector::{StatsCollector, StatsSnapshot};

/// Outcome of one flush, pushed into the collector by the aggregator.
#[derive(Debug, Clone)]
pub struct FlushSample {
    /// Increments the backend confirmed (resent ones included)
    pub increments: usize,
    /// Increments the backend refused for good and that were dropped
    pub rejected: usize,
    /// Wall time of the backend round trip in microseconds
    pub duration_us: u64,
    /// false when the batch outcome is unknown and it will be resent
    pub success: bool,
}

/// Tally of one `ingest` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSample {
    pub rows: u64,
    pub records: u64,
    pub malformed_rows: u64,
    pub malformed_records: u64,
    pub rejected_timers: u64,
    /// Records whose delta, or whose running sum, left the finite range
    pub out_of_range: u64,
}
