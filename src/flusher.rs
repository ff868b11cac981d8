use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::aggregator::Aggregator;

/// Flush on a fixed period until `shutdown` flips, then flush once more so
/// nothing accumulated since the last tick is left behind.
pub async fn run(aggregator: Arc<Aggregator>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; there is nothing to flush yet.
    interval.tick().await;

    let mut ticks = IntervalStream::new(interval);

    loop {
        tokio::select! {
            Some(_) = ticks.next() => flush_once(&aggregator).await,
            changed = shutdown.changed() => {
                // A dropped sender also means shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!(pending = aggregator.pending(), "final flush");
    flush_once(&aggregator).await;
}

async fn flush_once(aggregator: &Aggregator) {
    match aggregator.flush().await {
        Ok(report) => tracing::debug!(
            increments = report.increments,
            resent = report.resent,
            rejected = report.rejected,
            duration_us = report.duration_us,
            "flushed"
        ),
        Err(err) => tracing::error!(%err, "flush failed; batch parked for next interval"),
    }
}
