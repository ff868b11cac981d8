use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::AppState;

use super::AppError;

// ─── Request / response types ────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LoadgenConfig {
    /// Number of concurrent Tokio tasks sending datagrams
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// How long the run lasts (seconds)
    #[serde(default = "default_duration")]
    pub duration_secs: u64,

    /// Client-side sample rate in (0, 1]; also written into each record
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_concurrency() -> u32 {
    4
}
fn default_duration() -> u64 {
    10
}
fn default_sample_rate() -> f64 {
    1.0
}

#[derive(Debug, Serialize)]
pub struct LoadgenStatus {
    pub running: bool,
    pub datagrams_sent: u64,
    pub message: String,
}

impl LoadgenConfig {
    fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 || self.concurrency > 500 {
            return Err(AppError::BadRequest(
                "concurrency must be between 1 and 500".into(),
            ));
        }
        if self.duration_secs == 0 || self.duration_secs > 300 {
            return Err(AppError::BadRequest(
                "duration_secs must be between 1 and 300".into(),
            ));
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err(AppError::BadRequest(
                "sample_rate must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

// ─── POST /api/loadgen/start ─────────────────────────────────────

pub async fn start_loadgen(
    State(state): State<Arc<AppState>>,
    Json(config): Json<LoadgenConfig>,
) -> Result<Json<LoadgenStatus>, AppError> {
    config.validate()?;

    // Only one run at a time; claim the flag before spawning so workers see it
    if state
        .load_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(AppError::AlreadyRunning);
    }

    state.load_sent.store(0, Ordering::SeqCst);
    // Each run starts from clean throughput and latency figures
    state.aggregator.stats().reset();

    let run_id = uuid::Uuid::new_v4();
    let msg = format!(
        "Run {run_id}: {} workers × {}s at sample rate {} → {}",
        config.concurrency, config.duration_secs, config.sample_rate, state.udp_addr,
    );
    tracing::info!(%run_id, concurrency = config.concurrency, "load generator started");

    let running = state.load_running.clone();
    let sent = state.load_sent.clone();
    let target = state.udp_addr;

    let handle = tokio::spawn(async move {
        crate::load_generator::run(
            running,
            sent,
            target,
            config.concurrency,
            config.duration_secs,
            config.sample_rate,
        )
        .await;
    });

    // Stash the handle so `stop` can await clean shutdown
    *state.load_handle.lock().await = Some(handle);

    Ok(Json(LoadgenStatus {
        running: true,
        datagrams_sent: 0,
        message: msg,
    }))
}

// ─── POST /api/loadgen/stop ──────────────────────────────────────

pub async fn stop_loadgen(State(state): State<Arc<AppState>>) -> Json<LoadgenStatus> {
    if !state.load_running.load(Ordering::SeqCst) {
        return Json(LoadgenStatus {
            running: false,
            datagrams_sent: state.load_sent.load(Ordering::Relaxed),
            message: "No load generator is running".into(),
        });
    }

    state.load_running.store(false, Ordering::SeqCst);

    // Await the task so we know every worker has stopped sending
    if let Some(handle) = state.load_handle.lock().await.take() {
        // The task may have already finished
        let _ = handle.await;
    }

    Json(LoadgenStatus {
        running: false,
        datagrams_sent: state.load_sent.load(Ordering::Relaxed),
        message: "Load generator stopped".into(),
    })
}

// ─── GET /api/loadgen/status ─────────────────────────────────────

pub async fn loadgen_status(State(state): State<Arc<AppState>>) -> Json<LoadgenStatus> {
    let running = state.load_running.load(Ordering::SeqCst);
    Json(LoadgenStatus {
        running,
        datagrams_sent: state.load_sent.load(Ordering::Relaxed),
        message: if running {
            "Load generator in progress".into()
        } else {
            "Idle".into()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::backend::InMemoryBackend;
    use tokio::net::UdpSocket;

    fn config(concurrency: u32, duration_secs: u64, sample_rate: f64) -> LoadgenConfig {
        LoadgenConfig {
            concurrency,
            duration_secs,
            sample_rate,
        }
    }

    #[test]
    fn validation_bounds() {
        assert!(config(4, 10, 1.0).validate().is_ok());
        assert!(config(4, 10, 0.01).validate().is_ok());
        assert!(config(0, 10, 1.0).validate().is_err());
        assert!(config(501, 10, 1.0).validate().is_err());
        assert!(config(4, 0, 1.0).validate().is_err());
        assert!(config(4, 301, 1.0).validate().is_err());
        assert!(config(4, 10, 0.0).validate().is_err());
        assert!(config(4, 10, 1.5).validate().is_err());
        assert!(config(4, 10, f64::NAN).validate().is_err());
    }

    #[tokio::test]
    async fn only_one_run_at_a_time() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let aggregator = Arc::new(Aggregator::new(Arc::new(InMemoryBackend::new())));
        aggregator.ingest("k:1|c");
        let state = Arc::new(AppState::new(aggregator, sink.local_addr().unwrap()));

        let Json(first) = start_loadgen(State(state.clone()), Json(config(1, 5, 1.0)))
            .await
            .unwrap();
        assert!(first.running);
        assert_eq!(state.aggregator.stats().snapshot().datagrams, 0);

        let second = start_loadgen(State(state.clone()), Json(config(1, 5, 1.0))).await;
        assert!(matches!(second, Err(AppError::AlreadyRunning)));

        let Json(stopped) = stop_loadgen(State(state.clone())).await;
        assert!(!stopped.running);
        assert!(!state.load_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn invalid_config_does_not_claim_the_slot() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let aggregator = Arc::new(Aggregator::new(Arc::new(InMemoryBackend::new())));
        let state = Arc::new(AppState::new(aggregator, sink.local_addr().unwrap()));

        let err = start_loadgen(State(state.clone()), Json(config(0, 5, 1.0))).await;
        assert!(matches!(err, Err(AppError::BadRequest(_))));
        assert!(!state.load_running.load(Ordering::SeqCst));
    }
}
