//! UDP counter aggregation server.
//!
//! Clients fire `key:value|type[|@rate]` datagrams at the listener; the
//! [`aggregator::Aggregator`] sums them in memory and a periodic flush pushes
//! the deltas into a pluggable [`backend::Backend`] (Redis sorted sets or an
//! in-memory store).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

pub mod aggregator;
pub mod backend;
pub mod config;
pub mod flusher;
pub mod handlers;
pub mod listener;
pub mod load_generator;
pub mod metrics;
pub mod middleware;
pub mod protocol;
pub mod server;

/// Shared state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Counter table, flush protocol and the active backend.
    pub aggregator: Arc<aggregator::Aggregator>,

    /// Where the load generator aims its datagrams.
    pub udp_addr: SocketAddr,

    /// Flag checked by every load-generator worker on each iteration.
    pub load_running: Arc<AtomicBool>,

    /// Datagrams sent by the current (or last) load-generator run.
    pub load_sent: Arc<AtomicU64>,

    /// Handle to the spawned load-generator task so we can await clean shutdown.
    pub load_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AppState {
    pub fn new(aggregator: Arc<aggregator::Aggregator>, udp_addr: SocketAddr) -> Self {
        Self {
            aggregator,
            udp_addr,
            load_running: Arc::new(AtomicBool::new(false)),
            load_sent: Arc::new(AtomicU64::new(0)),
            load_handle: tokio::sync::Mutex::new(None),
        }
    }
}
