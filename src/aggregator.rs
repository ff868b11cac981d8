//! In-memory aggregation of counter datagrams and the flush protocol that
//! hands accumulated deltas to a [`Backend`].

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;

use crate::backend::{ApplyOutcome, Backend, BackendError, Batch, Increment};
use crate::metrics::{FlushSample, IngestSample, StatsCollector};
use crate::protocol::{self, ProtocolError};

#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The store's answer never arrived; the batch is parked and resent
    /// verbatim by the next flush.
    #[error("flush of {increments} increments to {backend} failed: {source}")]
    Flush {
        increments: usize,
        backend: &'static str,
        #[source]
        source: BackendError,
    },
}

/// Result of a successful flush.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    /// Increments drained from the table by this flush
    pub increments: usize,
    /// Increments of an earlier, unconfirmed batch sent again first
    pub resent: usize,
    /// Increments the store refused for good; they are dropped
    pub rejected: usize,
    pub backend: &'static str,
    pub duration_us: u64,
}

/// Owns the live counter table.
///
/// Shared by the UDP listener (`ingest`), the periodic flusher and the admin
/// endpoints. `flush` swaps the table out under the lock, so an ingest that
/// races a flush lands in the next generation instead of being cleared.
///
/// A drained batch whose fate is unknown (the store errored, or the flush
/// future was dropped mid-call) is parked in `in_doubt`. The next flush
/// sends that exact batch, id included, before draining anything new, so
/// the store can tell a resend from fresh data.
pub struct Aggregator {
    counters: Mutex<HashMap<String, f64>>,
    in_doubt: Mutex<Option<Batch>>,
    backend: RwLock<Arc<dyn Backend>>,
    verbosity: AtomicU8,
    stats: Arc<StatsCollector>,
    /// Keeps a manual flush and a timer flush from overlapping.
    flushing: tokio::sync::Mutex<()>,
}

impl Aggregator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            in_doubt: Mutex::new(None),
            backend: RwLock::new(backend),
            verbosity: AtomicU8::new(0),
            stats: Arc::new(StatsCollector::new()),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    // ─── Configuration ───────────────────────────────────────────

    /// Swap the store used by subsequent flushes.
    pub fn configure_backend(&self, backend: Arc<dyn Backend>) {
        tracing::info!(backend = backend.name(), "backend configured");
        *self.backend.write() = backend;
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.read().clone()
    }

    /// 0 = quiet, 1 = one line per flush, 2 = one line per increment.
    pub fn set_verbosity(&self, level: u8) {
        self.verbosity.store(level, Ordering::Relaxed);
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    // ─── Ingest ──────────────────────────────────────────────────

    /// Parse one datagram and fold its counters into the table.
    /// Bad rows and records are logged and skipped; nothing is returned to
    /// the sender.
    pub fn ingest(&self, msg: &str) -> IngestSample {
        let mut tally = IngestSample::default();
        let mut accepted: Vec<(String, f64)> = Vec::new();

        for row in protocol::parse_datagram(msg) {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    tracing::error!(%err, "skipping row");
                    tally.malformed_rows += 1;
                    continue;
                }
            };
            tally.rows += 1;

            for record in row.records {
                match record {
                    Ok(record) => {
                        tally.records += 1;
                        accepted.push((row.key.clone(), record.delta()));
                    }
                    Err(err @ ProtocolError::UnsupportedMetricType { .. }) => {
                        tracing::warn!(%err, "timer updates not supported");
                        tally.rejected_timers += 1;
                    }
                    Err(err @ ProtocolError::OutOfRange { .. }) => {
                        tracing::warn!(%err, "skipping record");
                        tally.out_of_range += 1;
                    }
                    Err(err) => {
                        tracing::error!(%err, "skipping record");
                        tally.malformed_records += 1;
                    }
                }
            }
        }

        if !accepted.is_empty() {
            let mut counters = self.counters.lock();
            for (key, delta) in accepted {
                let slot = counters.entry(key).or_insert(0.0);
                let sum = *slot + delta;
                // The table only ever holds finite values.
                if sum.is_finite() {
                    *slot = sum;
                } else {
                    tracing::warn!(delta, current = *slot, "counter would overflow; delta skipped");
                    tally.out_of_range += 1;
                }
            }
        }

        self.stats.record_ingest(tally);
        tally
    }

    // ─── Flush ───────────────────────────────────────────────────

    /// Resend the batch in doubt, if any, then drain the table into a new
    /// batch and hand it to the backend.
    ///
    /// Nothing is lost when this future is dropped: whichever batch was in
    /// flight is parked for the next call. Increments the store refuses
    /// outright are logged and dropped; their siblings are never resent.
    pub async fn flush(&self) -> Result<FlushReport, AggregatorError> {
        let _turn = self.flushing.lock().await;

        let backend = self.backend();
        let verbosity = self.verbosity();
        let start = Instant::now();

        let result = self.flush_batches(backend.as_ref(), verbosity).await;
        let duration_us = start.elapsed().as_micros() as u64;

        match result {
            Ok(mut report) => {
                report.duration_us = duration_us;
                self.stats.record_flush(FlushSample {
                    increments: report.resent + report.increments - report.rejected,
                    rejected: report.rejected,
                    duration_us,
                    success: true,
                });
                Ok(report)
            }
            Err(err) => {
                self.stats.record_flush(FlushSample {
                    increments: 0,
                    rejected: 0,
                    duration_us,
                    success: false,
                });
                Err(err)
            }
        }
    }

    async fn flush_batches(&self, backend: &dyn Backend, verbosity: u8) -> Result<FlushReport, AggregatorError> {
        let mut report = FlushReport {
            backend: backend.name(),
            ..FlushReport::default()
        };

        let parked = self.in_doubt.lock().take();
        if let Some(batch) = parked {
            tracing::warn!(batch = %batch.id, increments = batch.len(), "resending unconfirmed batch");
            report.resent = batch.len();
            let outcome = self.submit(backend, batch).await?;
            report.rejected += outcome.rejected.len();
        }

        let drained = mem::take(&mut *self.counters.lock());
        let batch = Batch::new(build_batch(&drained, verbosity));
        if verbosity >= 1 {
            tracing::info!(batch = %batch.id, increments = batch.len(), backend = backend.name(), "flushing");
        }
        report.increments = batch.len();
        let outcome = self.submit(backend, batch).await?;
        report.rejected += outcome.rejected.len();

        Ok(report)
    }

    /// Apply one batch; it stays parked unless the store gives an answer.
    async fn submit(&self, backend: &dyn Backend, batch: Batch) -> Result<ApplyOutcome, AggregatorError> {
        let mut in_flight = InFlight {
            slot: &self.in_doubt,
            batch,
            settled: false,
        };

        let result = backend.apply(&in_flight.batch).await;
        match result {
            Ok(outcome) => {
                in_flight.settled = true;
                if outcome.replayed {
                    tracing::info!(batch = %in_flight.batch.id, "store had already applied batch");
                }
                for inc in &outcome.rejected {
                    tracing::error!(
                        group = %inc.group,
                        member = %inc.member,
                        delta = inc.delta,
                        "store refused increment; dropping it"
                    );
                }
                Ok(outcome)
            }
            Err(source) => Err(AggregatorError::Flush {
                increments: in_flight.batch.len(),
                backend: backend.name(),
                source,
            }),
        }
    }

    // ─── Inspection ──────────────────────────────────────────────

    /// Number of keys waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.counters.lock().len()
    }

    /// Increments parked after an unconfirmed flush.
    pub fn in_doubt(&self) -> usize {
        self.in_doubt.lock().as_ref().map_or(0, Batch::len)
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.counters.lock().get(key).copied()
    }

    /// Pending `(raw key, delta)` pairs sorted by key.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut pairs: Vec<_> = self
            .counters
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

/// A batch handed to the store. Parks itself in `slot` when dropped before
/// the store answered, whether by an error or by the flush being cancelled.
struct InFlight<'a> {
    slot: &'a Mutex<Option<Batch>>,
    batch: Batch,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            *self.slot.lock() = Some(mem::take(&mut self.batch));
        }
    }
}

/// Turn raw keys into `(group, member, delta)` increments, ordered by raw
/// key so batches are reproducible.
fn build_batch(drained: &HashMap<String, f64>, verbosity: u8) -> Vec<Increment> {
    let mut keys: Vec<&String> = drained.keys().collect();
    keys.sort();

    keys.into_iter()
        .map(|raw| {
            let delta = drained[raw];
            let (group, member) = protocol::split_key(raw);
            if verbosity >= 2 {
                tracing::info!(raw = %raw, %group, %member, delta, "increment");
            }
            Increment {
                group,
                member,
                delta,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    fn aggregator() -> (Aggregator, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        (Aggregator::new(backend.clone()), backend)
    }

    fn lost_connection() -> BackendError {
        BackendError::UnexpectedReply("connection reset".into())
    }

    /// Records every batch it accepts; fails while `fail` is set.
    #[derive(Default)]
    struct RecordingBackend {
        batches: Mutex<Vec<Batch>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn retrieve_counts(&self, _group: &str) -> Result<Vec<(String, f64)>, BackendError> {
            Ok(Vec::new())
        }

        async fn apply(&self, batch: &Batch) -> Result<ApplyOutcome, BackendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(lost_connection());
            }
            self.batches.lock().push(batch.clone());
            Ok(ApplyOutcome::default())
        }
    }

    /// Writes through to memory, then loses the reply for the first
    /// `lost_replies` calls.
    struct LossyBackend {
        store: InMemoryBackend,
        lost_replies: AtomicUsize,
    }

    #[async_trait]
    impl Backend for LossyBackend {
        fn name(&self) -> &'static str {
            "lossy"
        }

        async fn retrieve_counts(&self, group: &str) -> Result<Vec<(String, f64)>, BackendError> {
            self.store.retrieve_counts(group).await
        }

        async fn apply(&self, batch: &Batch) -> Result<ApplyOutcome, BackendError> {
            let outcome = self.store.apply(batch).await?;
            let lose = self
                .lost_replies
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lose {
                Err(lost_connection())
            } else {
                Ok(outcome)
            }
        }
    }

    /// Sleeps before writing, long enough for callers to give up.
    struct SlowBackend {
        store: InMemoryBackend,
        slow: AtomicBool,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn retrieve_counts(&self, group: &str) -> Result<Vec<(String, f64)>, BackendError> {
            self.store.retrieve_counts(group).await
        }

        async fn apply(&self, batch: &Batch) -> Result<ApplyOutcome, BackendError> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.store.apply(batch).await
        }
    }

    /// Refuses every increment for the `locked` group and stores the rest.
    #[derive(Default)]
    struct PickyBackend {
        store: InMemoryBackend,
    }

    #[async_trait]
    impl Backend for PickyBackend {
        fn name(&self) -> &'static str {
            "picky"
        }

        async fn retrieve_counts(&self, group: &str) -> Result<Vec<(String, f64)>, BackendError> {
            self.store.retrieve_counts(group).await
        }

        async fn apply(&self, batch: &Batch) -> Result<ApplyOutcome, BackendError> {
            let (rejected, kept): (Vec<_>, Vec<_>) = batch
                .increments
                .iter()
                .cloned()
                .partition(|inc| inc.group == "locked");
            let stored = self
                .store
                .apply(&Batch {
                    id: batch.id,
                    increments: kept,
                })
                .await?;
            Ok(ApplyOutcome {
                rejected,
                replayed: stored.replayed,
            })
        }
    }

    #[test]
    fn repeated_ingest_accumulates() {
        let (agg, _) = aggregator();
        for _ in 0..7 {
            agg.ingest("k:5|c");
        }
        assert_eq!(agg.get("k"), Some(35.0));
    }

    #[test]
    fn sample_rate_is_corrected() {
        let (agg, _) = aggregator();
        agg.ingest("k:1|c|@0.1");
        assert!((agg.get("k").unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn timers_leave_table_untouched() {
        let (agg, _) = aggregator();
        let tally = agg.ingest("k:5|ms");
        assert_eq!(agg.get("k"), None);
        assert_eq!(tally.rejected_timers, 1);
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn multiple_records_share_a_key() {
        let (agg, _) = aggregator();
        agg.ingest("k:1|c:2|c|@0.5:3|ms");
        assert_eq!(agg.get("k"), Some(5.0));
    }

    #[test]
    fn malformed_rows_do_not_stop_later_rows() {
        let (agg, _) = aggregator();
        let tally = agg.ingest("nokey\nk:bad\n k2:5|c");
        assert_eq!(agg.get("k2"), Some(5.0));
        assert_eq!(agg.get("k"), None);
        assert_eq!(tally.malformed_rows, 1);
        assert_eq!(tally.malformed_records, 1);
        assert_eq!(tally.records, 1);
    }

    #[test]
    fn subnormal_rate_keeps_table_finite() {
        let (agg, _) = aggregator();
        let rate = format!("@0.{}1", "0".repeat(319));
        agg.ingest(&format!("k:1|c|{rate}"));
        agg.ingest(&format!("k:-1|c|{rate}"));
        assert_eq!(agg.get("k"), Some(0.0));
    }

    #[test]
    fn overflowing_sum_is_skipped() {
        let (agg, _) = aggregator();
        // Each record adds 1e307; f64 tops out near 1.8e308.
        let msg = format!("k:10000000|c|@0.{}1", "0".repeat(299));
        let skipped: u64 = (0..20).map(|_| agg.ingest(&msg).out_of_range).sum();

        assert!(skipped > 0);
        assert!(agg.get("k").unwrap().is_finite());
        assert_eq!(agg.stats().snapshot().out_of_range, skipped);
    }

    #[tokio::test]
    async fn end_to_end_against_memory_backend() {
        let (agg, backend) = aggregator();
        agg.ingest("gauge.x:3|c\ngauge.x:2|c");
        let report = agg.flush().await.unwrap();
        assert_eq!(report.increments, 1);
        assert_eq!(report.resent, 0);
        assert_eq!(agg.pending(), 0);

        let counts = backend.retrieve_counts("gauge").await.unwrap();
        assert_eq!(counts, vec![("x".to_string(), 5.0)]);
    }

    #[tokio::test]
    async fn flush_splits_and_unescapes_keys() {
        let backend = Arc::new(RecordingBackend::default());
        let agg = Aggregator::new(backend.clone());
        agg.ingest("pages.home:1|c\nhome:2|c\na;PERIOD;b.c:3|c");
        agg.flush().await.unwrap();

        let batches = backend.batches.lock();
        let mut got: Vec<_> = batches[0]
            .increments
            .iter()
            .map(|i| (i.group.as_str(), i.member.as_str(), i.delta))
            .collect();
        got.sort_by(|a, b| a.0.cmp(b.0));
        assert_eq!(
            got,
            vec![("a.b", "c", 3.0), ("c", "home", 2.0), ("pages", "home", 1.0)]
        );
    }

    #[tokio::test]
    async fn second_flush_is_an_empty_batch() {
        let backend = Arc::new(RecordingBackend::default());
        let agg = Aggregator::new(backend.clone());
        agg.ingest("k:1|c");
        agg.flush().await.unwrap();
        let report = agg.flush().await.unwrap();

        assert_eq!(report.increments, 0);
        let batches = backend.batches.lock();
        assert_eq!(batches.len(), 2);
        assert!(batches[1].is_empty());
        assert_ne!(batches[0].id, batches[1].id);
    }

    #[tokio::test]
    async fn failed_flush_parks_batch_for_resend() {
        let backend = Arc::new(RecordingBackend::default());
        backend.fail.store(true, Ordering::SeqCst);
        let agg = Aggregator::new(backend.clone());

        agg.ingest("k:4|c");
        let err = agg.flush().await.unwrap_err();
        assert!(matches!(err, AggregatorError::Flush { increments: 1, .. }));
        assert_eq!(agg.get("k"), None);
        assert_eq!(agg.in_doubt(), 1);

        // Arrivals in between travel in their own batch.
        agg.ingest("k:1|c");
        backend.fail.store(false, Ordering::SeqCst);
        let report = agg.flush().await.unwrap();
        assert_eq!((report.resent, report.increments), (1, 1));
        assert_eq!(agg.in_doubt(), 0);

        let batches = backend.batches.lock();
        let deltas: Vec<_> = batches.iter().map(|b| b.increments[0].delta).collect();
        assert_eq!(deltas, vec![4.0, 1.0]);
        assert_eq!(agg.stats().snapshot().flushes_failed, 1);
    }

    #[tokio::test]
    async fn failed_resend_leaves_table_alone() {
        let backend = Arc::new(RecordingBackend::default());
        backend.fail.store(true, Ordering::SeqCst);
        let agg = Aggregator::new(backend.clone());

        agg.ingest("k:4|c");
        agg.flush().await.unwrap_err();
        agg.ingest("j:2|c");
        agg.flush().await.unwrap_err();

        assert_eq!(agg.in_doubt(), 1);
        assert_eq!(agg.get("j"), Some(2.0));
    }

    #[tokio::test]
    async fn lost_reply_is_not_applied_twice() {
        let backend = Arc::new(LossyBackend {
            store: InMemoryBackend::new(),
            lost_replies: AtomicUsize::new(1),
        });
        let agg = Aggregator::new(backend.clone());

        agg.ingest("g.a:1|c\ng.b:2|c");
        assert!(agg.flush().await.is_err());
        let report = agg.flush().await.unwrap();
        assert_eq!(report.resent, 2);
        agg.flush().await.unwrap();

        assert_eq!(
            backend.retrieve_counts("g").await.unwrap(),
            vec![("a".to_string(), 1.0), ("b".to_string(), 2.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_flush_is_resent_not_lost() {
        let backend = Arc::new(SlowBackend {
            store: InMemoryBackend::new(),
            slow: AtomicBool::new(true),
        });
        let agg = Aggregator::new(backend.clone());

        agg.ingest("g.m:3|c");
        let timed_out = tokio::time::timeout(Duration::from_millis(10), agg.flush()).await;
        assert!(timed_out.is_err());
        assert_eq!(agg.pending(), 0);
        assert_eq!(agg.in_doubt(), 1);
        assert!(backend.retrieve_counts("g").await.unwrap().is_empty());

        backend.slow.store(false, Ordering::SeqCst);
        agg.flush().await.unwrap();
        agg.flush().await.unwrap();
        assert_eq!(backend.retrieve_counts("g").await.unwrap()[0].1, 3.0);
        assert_eq!(agg.in_doubt(), 0);
    }

    #[tokio::test]
    async fn refused_increment_is_dropped_and_siblings_kept() {
        let backend = Arc::new(PickyBackend::default());
        let agg = Aggregator::new(backend.clone());

        agg.ingest("locked.x:5|c\nopen.y:2|c");
        let report = agg.flush().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(agg.in_doubt(), 0);

        agg.flush().await.unwrap();
        assert_eq!(backend.retrieve_counts("open").await.unwrap()[0].1, 2.0);
        assert!(backend.retrieve_counts("locked").await.unwrap().is_empty());

        let stats = agg.stats().snapshot();
        assert_eq!(stats.increments_rejected, 1);
        assert_eq!(stats.increments_flushed, 1);
    }

    #[tokio::test]
    async fn configure_backend_redirects_flushes() {
        let (agg, first) = aggregator();
        let second = Arc::new(InMemoryBackend::new());
        agg.configure_backend(second.clone());

        agg.ingest("g.m:2|c");
        agg.flush().await.unwrap();

        assert!(first.retrieve_counts("g").await.unwrap().is_empty());
        assert_eq!(second.retrieve_counts("g").await.unwrap()[0].1, 2.0);
    }

    #[test]
    fn verbosity_round_trips() {
        let (agg, _) = aggregator();
        assert_eq!(agg.verbosity(), 0);
        agg.set_verbosity(2);
        assert_eq!(agg.verbosity(), 2);
    }

    #[test]
    fn snapshot_is_sorted() {
        let (agg, _) = aggregator();
        agg.ingest("b:1|c\na:2|c");
        assert_eq!(
            agg.snapshot(),
            vec![("a".to_string(), 2.0), ("b".to_string(), 1.0)]
        );
    }
}
