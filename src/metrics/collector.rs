use std::time::Instant;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use super::percentiles::PercentileSet;
use super::{FlushSample, IngestSample};

// ─── Configuration ───────────────────────────────────────────────

/// HdrHistogram range: 1 μs → 60 s, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 60_000_000;
const HIST_SIGFIG: u8 = 3;

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe self-observation for the server.
/// The aggregator calls `record_*`, the HTTP surface calls `snapshot()`.
pub struct StatsCollector {
    inner: Mutex<Inner>,
}

/// Point-in-time view served by `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub datagrams: u64,
    pub rows: u64,
    pub records: u64,
    pub malformed_rows: u64,
    pub malformed_records: u64,
    pub rejected_timers: u64,
    pub out_of_range: u64,

    pub flushes_ok: u64,
    pub flushes_failed: u64,
    pub increments_flushed: u64,
    pub increments_rejected: u64,
    pub flush_latency_us: PercentileSet,
    pub last_flush_at: Option<DateTime<Utc>>,

    pub uptime_secs: f64,
    pub datagrams_per_sec: f64,
}

// ─── Internal state ──────────────────────────────────────────────

struct Inner {
    flush_hist: Histogram<u64>,

    datagrams: u64,
    ingest: IngestSample,

    flushes_ok: u64,
    flushes_failed: u64,
    increments_flushed: u64,
    increments_rejected: u64,
    last_flush_at: Option<DateTime<Utc>>,

    start_time: Instant,
}

// ─── StatsCollector impl ─────────────────────────────────────────

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn record_ingest(&self, sample: IngestSample) {
        let mut inner = self.inner.lock();
        inner.datagrams += 1;
        inner.ingest.rows += sample.rows;
        inner.ingest.records += sample.records;
        inner.ingest.malformed_rows += sample.malformed_rows;
        inner.ingest.malformed_records += sample.malformed_records;
        inner.ingest.rejected_timers += sample.rejected_timers;
        inner.ingest.out_of_range += sample.out_of_range;
    }

    pub fn record_flush(&self, sample: FlushSample) {
        self.inner.lock().record_flush(sample);
    }

    pub fn reset(&self) {
        *self.inner.lock() = Inner::new();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().snapshot()
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Inner impl ──────────────────────────────────────────────────

impl Inner {
    fn new() -> Self {
        Self {
            flush_hist: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                .expect("static histogram bounds are valid"),
            datagrams: 0,
            ingest: IngestSample::default(),
            flushes_ok: 0,
            flushes_failed: 0,
            increments_flushed: 0,
            increments_rejected: 0,
            last_flush_at: None,
            start_time: Instant::now(),
        }
    }

    fn record_flush(&mut self, sample: FlushSample) {
        if !sample.success {
            self.flushes_failed += 1;
            return;
        }

        self.flushes_ok += 1;
        self.increments_flushed += sample.increments as u64;
        self.increments_rejected += sample.rejected as u64;
        self.last_flush_at = Some(Utc::now());

        // Clamp into the histogram's range
        let us = sample.duration_us.clamp(HIST_LOW, HIST_HIGH);
        let _ = self.flush_hist.record(us);
    }

    fn snapshot(&self) -> StatsSnapshot {
        let uptime_secs = self.start_time.elapsed().as_secs_f64();
        let datagrams_per_sec = if uptime_secs > 0.0 {
            self.datagrams as f64 / uptime_secs
        } else {
            0.0
        };

        StatsSnapshot {
            datagrams: self.datagrams,
            rows: self.ingest.rows,
            records: self.ingest.records,
            malformed_rows: self.ingest.malformed_rows,
            malformed_records: self.ingest.malformed_records,
            rejected_timers: self.ingest.rejected_timers,
            out_of_range: self.ingest.out_of_range,
            flushes_ok: self.flushes_ok,
            flushes_failed: self.flushes_failed,
            increments_flushed: self.increments_flushed,
            increments_rejected: self.increments_rejected,
            flush_latency_us: PercentileSet::from_histogram(&self.flush_hist),
            last_flush_at: self.last_flush_at,
            uptime_secs,
            datagrams_per_sec,
        }
    }
}
