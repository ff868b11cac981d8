pub mod memory;
pub mod sorted_set;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use self::memory::InMemoryBackend;
pub use self::sorted_set::{connect, RedisBackend};

/// One unit of work sent to a store during a flush.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Increment {
    pub group: String,
    pub member: String,
    pub delta: f64,
}

/// Everything drained by one flush, tagged so a resend can be recognised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub id: Uuid,
    pub increments: Vec<Increment>,
}

impl Batch {
    pub fn new(increments: Vec<Increment>) -> Self {
        Self {
            id: Uuid::new_v4(),
            increments,
        }
    }

    pub fn len(&self) -> usize {
        self.increments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.increments.is_empty()
    }
}

/// What a store did with a batch it accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// Increments the store refused for good (e.g. the group key holds a
    /// non sorted-set value). Everything else in the batch was applied.
    pub rejected: Vec<Increment>,
    /// The batch id had already been applied; nothing was written this time.
    pub replayed: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unexpected reply from store: {0}")]
    UnexpectedReply(String),
}

/// Contract every counting store satisfies.
///
/// `Ok` from `apply` means every increment outside `rejected` is stored.
/// `Err` means the outcome is unknown: the caller resends the very same
/// batch (same id) later, so a store must apply a given batch id at most
/// once.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs and the stats endpoint.
    fn name(&self) -> &'static str;

    /// Accumulated `(member, count)` pairs for `group`, in the store's
    /// natural order.
    async fn retrieve_counts(&self, group: &str) -> Result<Vec<(String, f64)>, BackendError>;

    async fn apply(&self, batch: &Batch) -> Result<ApplyOutcome, BackendError>;
}
