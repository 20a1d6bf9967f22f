use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppError;

use super::types::task::TaskEnvelope;

/// Shared work queue feeding the worker pool. Delivery is at-least-once: a
/// claimed envelope stays leased until acknowledged, and leases that outlive
/// their window are handed out again.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, envelope: TaskEnvelope) -> Result<(), AppError>;

    /// Claim the oldest envelope whose `not_before` has passed.
    async fn pop(&self) -> Result<Option<TaskEnvelope>, AppError>;

    /// Release a claim once its envelope has been settled. `lease_id` is the
    /// claimed envelope's `TaskEnvelope::lease_id`.
    async fn ack(&self, lease_id: &str) -> Result<(), AppError>;

    /// Return envelopes claimed longer than `lease` ago to the ready queue.
    async fn requeue_expired(&self, lease: Duration) -> Result<usize, AppError>;

    /// Park an envelope that exhausted its attempts.
    async fn dead_letter(&self, envelope: TaskEnvelope) -> Result<(), AppError>;

    async fn len(&self) -> Result<usize, AppError>;

    async fn in_flight(&self) -> Result<usize, AppError>;

    async fn dead_letters(&self) -> Result<Vec<TaskEnvelope>, AppError>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskEnvelope>,
    claimed: Vec<(TaskEnvelope, Instant)>,
    dead: Vec<TaskEnvelope>,
}

#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<QueueState>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn push(&self, envelope: TaskEnvelope) -> Result<(), AppError> {
        self.state.lock().await.ready.push_back(envelope);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<TaskEnvelope>, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let position = state.ready.iter().position(|env| env.is_ready(now));
        let claimed = position.and_then(|idx| state.ready.remove(idx));
        if let Some(envelope) = &claimed {
            state.claimed.push((envelope.clone(), Instant::now()));
        }
        Ok(claimed)
    }

    async fn ack(&self, lease_id: &str) -> Result<(), AppError> {
        self.state
            .lock()
            .await
            .claimed
            .retain(|(envelope, _)| envelope.lease_id() != lease_id);
        Ok(())
    }

    async fn requeue_expired(&self, lease: Duration) -> Result<usize, AppError> {
        let mut state = self.state.lock().await;
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.claimed)
            .into_iter()
            .partition(|(_, claimed_at)| claimed_at.elapsed() >= lease);
        state.claimed = live;
        let count = expired.len();
        // Abandoned work goes ahead of anything queued since.
        for (envelope, _) in expired.into_iter().rev() {
            state.ready.push_front(envelope);
        }
        Ok(count)
    }

    async fn dead_letter(&self, envelope: TaskEnvelope) -> Result<(), AppError> {
        self.state.lock().await.dead.push(envelope);
        Ok(())
    }

    async fn len(&self) -> Result<usize, AppError> {
        Ok(self.state.lock().await.ready.len())
    }

    async fn in_flight(&self) -> Result<usize, AppError> {
        Ok(self.state.lock().await.claimed.len())
    }

    async fn dead_letters(&self) -> Result<Vec<TaskEnvelope>, AppError> {
        Ok(self.state.lock().await.dead.clone())
    }
}

/// Pop the next ready envelope and record it as leased, in one step.
const CLAIM_SCRIPT: &str = r#"
local raw = redis.call("RPOP", KEYS[1])
if not raw then
    return false
end
local envelope = cjson.decode(raw)
local lease = envelope["id"] .. ":" .. string.format("%d", envelope["attempts"] or 0)
redis.call("HSET", KEYS[2], lease, raw)
redis.call("ZADD", KEYS[3], ARGV[1], lease)
return raw
"#;

/// Move a leased envelope back to the consuming end of the ready list.
const REQUEUE_SCRIPT: &str = r#"
local raw = redis.call("HGET", KEYS[2], ARGV[1])
redis.call("HDEL", KEYS[2], ARGV[1])
redis.call("ZREM", KEYS[3], ARGV[1])
if raw then
    redis.call("RPUSH", KEYS[1], raw)
    return 1
end
return 0
"#;

/// Redis list for ready work, a sorted set of delayed retries, and a lease
/// table (hash of claimed envelopes plus a sorted set of claim times).
#[derive(Clone)]
pub struct RedisTaskQueue {
    connection: MultiplexedConnection,
    ready_key: String,
    delayed_key: String,
    claimed_key: String,
    leases_key: String,
    dead_key: String,
}

impl RedisTaskQueue {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            connection,
            ready_key: format!("{key_prefix}:queue:ready"),
            delayed_key: format!("{key_prefix}:queue:delayed"),
            claimed_key: format!("{key_prefix}:queue:claimed"),
            leases_key: format!("{key_prefix}:queue:leases"),
            dead_key: format!("{key_prefix}:queue:dead"),
        })
    }

    /// Move delayed envelopes whose time has come onto the ready list.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), AppError> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(&self.delayed_key, i64::MIN, now)
            .await?;
        for raw in due {
            let removed: i64 = conn.zrem(&self.delayed_key, &raw).await?;
            if removed > 0 {
                let _: i64 = conn.lpush(&self.ready_key, &raw).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, envelope: TaskEnvelope) -> Result<(), AppError> {
        let mut conn = self.connection.clone();
        let raw = serde_json::to_string(&envelope)?;
        match envelope.not_before {
            Some(at) if at > Utc::now() => {
                let _: i64 = conn
                    .zadd(&self.delayed_key, raw, at.timestamp_millis())
                    .await?;
            }
            _ => {
                let _: i64 = conn.lpush(&self.ready_key, raw).await?;
            }
        }
        Ok(())
    }

    async fn pop(&self) -> Result<Option<TaskEnvelope>, AppError> {
        let mut conn = self.connection.clone();
        self.promote_due(&mut conn).await?;
        let raw: Option<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(&self.ready_key)
            .key(&self.claimed_key)
            .key(&self.leases_key)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(AppError::from))
            .transpose()
    }

    async fn ack(&self, lease_id: &str) -> Result<(), AppError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.hdel(&self.claimed_key, lease_id).await?;
        let _: i64 = conn.zrem(&self.leases_key, lease_id).await?;
        Ok(())
    }

    async fn requeue_expired(&self, lease: Duration) -> Result<usize, AppError> {
        let mut conn = self.connection.clone();
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(lease_ms);
        let expired: Vec<String> = conn
            .zrangebyscore(&self.leases_key, i64::MIN, cutoff)
            .await?;

        let mut requeued = 0usize;
        for lease in expired {
            let moved: i64 = redis::Script::new(REQUEUE_SCRIPT)
                .key(&self.ready_key)
                .key(&self.claimed_key)
                .key(&self.leases_key)
                .arg(&lease)
                .invoke_async(&mut conn)
                .await?;
            if moved > 0 {
                debug!(%lease, "requeued envelope with expired lease");
                requeued = requeued.saturating_add(1);
            }
        }
        Ok(requeued)
    }

    async fn dead_letter(&self, envelope: TaskEnvelope) -> Result<(), AppError> {
        let mut conn = self.connection.clone();
        let raw = serde_json::to_string(&envelope)?;
        let _: i64 = conn.lpush(&self.dead_key, raw).await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, AppError> {
        let mut conn = self.connection.clone();
        let ready: usize = conn.llen(&self.ready_key).await?;
        let delayed: usize = conn.zcard(&self.delayed_key).await?;
        Ok(ready.saturating_add(delayed))
    }

    async fn in_flight(&self) -> Result<usize, AppError> {
        let mut conn = self.connection.clone();
        let claimed: usize = conn.hlen(&self.claimed_key).await?;
        Ok(claimed)
    }

    async fn dead_letters(&self) -> Result<Vec<TaskEnvelope>, AppError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn.lrange(&self.dead_key, 0, -1).await?;
        raw.iter()
            .map(|item| serde_json::from_str(item).map_err(AppError::from))
            .collect()
    }
}
