use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{ApplyOutcome, Backend, BackendError, Batch};

/// Store kept entirely in process memory. Useful for tests and for running
/// without Redis; counts are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    groups: HashMap<String, BTreeMap<String, f64>>,
    /// Only the newest batch can ever be resent, so one id is enough.
    last_batch: Option<Uuid>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    /// Members come back sorted by name.
    async fn retrieve_counts(&self, group: &str) -> Result<Vec<(String, f64)>, BackendError> {
        let inner = self.inner.lock();
        Ok(inner
            .groups
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .map(|(member, count)| (member.clone(), *count))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply(&self, batch: &Batch) -> Result<ApplyOutcome, BackendError> {
        let mut inner = self.inner.lock();
        if inner.last_batch == Some(batch.id) {
            return Ok(ApplyOutcome {
                replayed: true,
                ..ApplyOutcome::default()
            });
        }

        for inc in &batch.increments {
            *inner
                .groups
                .entry(inc.group.clone())
                .or_default()
                .entry(inc.member.clone())
                .or_insert(0.0) += inc.delta;
        }
        inner.last_batch = Some(batch.id);
        Ok(ApplyOutcome::default())
    }
}
