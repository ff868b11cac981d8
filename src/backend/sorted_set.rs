use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{ApplyOutcome, Backend, BackendError, Batch};

/// Marker keys remember which batches were applied, so a resend after a
/// lost reply is not counted twice.
const BATCH_MARKER_PREFIX: &str = "counter-server:batch:";
const BATCH_MARKER_TTL_SECS: u64 = 24 * 60 * 60;

/// KEYS[1] = batch marker, KEYS[2..] = group per increment.
/// ARGV[1] = marker ttl, then (delta, member) per increment.
/// Replies `{replayed, "i,j,..."}` where i, j are 0-based indices of the
/// increments Redis refused (e.g. WRONGTYPE).
const APPLY_BATCH_LUA: &str = r#"
local done = redis.call('GET', KEYS[1])
if done then
  return {1, done}
end
local rejected = {}
for i = 2, #KEYS do
  local ok = pcall(redis.call, 'ZINCRBY', KEYS[i], ARGV[2 * i - 2], ARGV[2 * i - 1])
  if not ok then
    rejected[#rejected + 1] = i - 2
  end
end
local summary = table.concat(rejected, ',')
redis.call('SET', KEYS[1], summary, 'EX', ARGV[1])
return {0, summary}
"#;

/// Opens a `ConnectionManager` that auto-reconnects on failure.
///
/// `ConnectionManager` is cheaply cloneable and every clone shares the same
/// multiplexed TCP connection, so the flusher and the HTTP handlers can all
/// talk to Redis through one socket.
pub async fn connect(url: &str) -> Result<ConnectionManager, BackendError> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client).await?;
    Ok(conn)
}

/// Each group is a Redis sorted set; members are scored by their count.
///
/// A batch is applied by one server-side script: a single round trip, run
/// atomically, and keyed by the batch id so it takes effect at most once.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    apply_script: Script,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            apply_script: Script::new(APPLY_BATCH_LUA),
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    /// Highest count first.
    async fn retrieve_counts(&self, group: &str) -> Result<Vec<(String, f64)>, BackendError> {
        let mut conn = self.conn.clone();
        let ascending: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(group, "-inf", "+inf")
            .await?;
        Ok(descending(ascending))
    }

    async fn apply(&self, batch: &Batch) -> Result<ApplyOutcome, BackendError> {
        let Some(encoded) = encode_batch(batch) else {
            return Ok(ApplyOutcome::default());
        };

        let mut invocation = self.apply_script.prepare_invoke();
        for key in &encoded.keys {
            invocation.key(key);
        }
        for arg in &encoded.args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let reply: (i64, String) = invocation.invoke_async(&mut conn).await?;
        let outcome = decode_reply(batch, reply)?;

        tracing::debug!(
            batch = %batch.id,
            increments = batch.len(),
            rejected = outcome.rejected.len(),
            replayed = outcome.replayed,
            "redis batch applied"
        );
        Ok(outcome)
    }
}

// ─── Script encoding ─────────────────────────────────────────────

/// Arguments for one script call.
#[derive(Debug, PartialEq)]
struct EncodedBatch {
    keys: Vec<String>,
    args: Vec<String>,
}

/// `None` for an empty batch: there is nothing worth a round trip.
fn encode_batch(batch: &Batch) -> Option<EncodedBatch> {
    if batch.is_empty() {
        return None;
    }

    let mut keys = Vec::with_capacity(batch.len() + 1);
    let mut args = Vec::with_capacity(batch.len() * 2 + 1);
    keys.push(marker_key(batch.id));
    args.push(BATCH_MARKER_TTL_SECS.to_string());

    for inc in &batch.increments {
        keys.push(inc.group.clone());
        args.push(inc.delta.to_string());
        args.push(inc.member.clone());
    }

    Some(EncodedBatch { keys, args })
}

fn marker_key(id: Uuid) -> String {
    format!("{BATCH_MARKER_PREFIX}{id}")
}

fn decode_reply(batch: &Batch, (replayed, summary): (i64, String)) -> Result<ApplyOutcome, BackendError> {
    let mut rejected = Vec::new();
    for index in summary.split(',').filter(|s| !s.is_empty()) {
        let inc = index
            .parse::<usize>()
            .ok()
            .and_then(|i| batch.increments.get(i))
            .ok_or_else(|| BackendError::UnexpectedReply(format!("bad rejected index {index:?}")))?;
        rejected.push(inc.clone());
    }

    Ok(ApplyOutcome {
        rejected,
        replayed: replayed == 1,
    })
}

/// ZRANGEBYSCORE gives lowest first; callers want the top counts first.
fn descending(mut ascending: Vec<(String, f64)>) -> Vec<(String, f64)> {
    ascending.reverse();
    ascending
}
