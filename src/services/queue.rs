use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::ProcessingJob;

const QUEUE_KEY: &str = "parking:jobs";
const JOB_PREFIX: &str = "parking:job:";
const LEASE_PREFIX: &str = "parking:lease:";
const CANCEL_PREFIX: &str = "parking:cancel:";

/// How long a stop request stays on record.
const CANCEL_TTL_SECS: u64 = 24 * 60 * 60;

/// Durable job queue with per-video leases.
///
/// Jobs are keyed by video id, so a video has at most one job. A job is
/// eligible once its `next_eligible_at` has passed and no unexpired lease is
/// held on it; among eligible jobs the earliest eligibility time wins.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a job for `video_id`, clearing any earlier stop request.
    /// Returns `false` if a job already exists.
    async fn enqueue(&self, video_id: Uuid) -> Result<bool, QueueError>;

    /// Lease the earliest eligible job for `worker_id`, bumping its attempts.
    async fn acquire(&self, worker_id: &str, lease_ttl: Duration) -> Result<Option<ProcessingJob>, QueueError>;

    /// Extend a held lease. `false` means the lease was lost.
    async fn renew(&self, video_id: Uuid, worker_id: &str, lease_ttl: Duration) -> Result<bool, QueueError>;

    /// Give the job back for a retry at `eligible_at`, dropping the lease.
    async fn reschedule(
        &self,
        video_id: Uuid,
        worker_id: &str,
        eligible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, QueueError>;

    /// Give the job back immediately and refund the current attempt.
    async fn release(&self, video_id: Uuid, worker_id: &str) -> Result<bool, QueueError>;

    /// Remove a job that reached a terminal state.
    async fn finish(&self, video_id: Uuid, worker_id: &str) -> Result<bool, QueueError>;

    async fn request_cancel(&self, video_id: Uuid) -> Result<(), QueueError>;

    async fn is_cancel_requested(&self, video_id: Uuid) -> Result<bool, QueueError>;

    async fn get(&self, video_id: Uuid) -> Result<Option<ProcessingJob>, QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

// KEYS[1] queue zset, KEYS[2] job hash, KEYS[3] cancel flag. ARGV: now_ms, video id.
// A new job starts without a stale stop request.
const ENQUEUE_SCRIPT: &str = r"
if redis.call('HSETNX', KEYS[2], 'attempts', 0) == 1 then
  redis.call('HSET', KEYS[2], 'enqueued_ms', ARGV[1], 'next_eligible_ms', ARGV[1])
  redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
  redis.call('DEL', KEYS[3])
  return 1
end
return 0
";

// KEYS[1] queue zset. ARGV: now_ms, worker, ttl_ms, lease prefix, job prefix.
// The score is pushed to the lease expiry so an abandoned job resurfaces.
const ACQUIRE_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 32)
for _, id in ipairs(ids) do
  if redis.call('SET', ARGV[4] .. id, ARGV[2], 'NX', 'PX', ARGV[3]) then
    local expires = tonumber(ARGV[1]) + tonumber(ARGV[3])
    redis.call('ZADD', KEYS[1], expires, id)
    redis.call('HINCRBY', ARGV[5] .. id, 'attempts', 1)
    return {id, tostring(expires)}
  end
end
return false
";

// KEYS[1] queue, KEYS[2] lease. ARGV: worker, ttl_ms, now_ms, video id.
const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[2]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[2], ARGV[2])
  redis.call('ZADD', KEYS[1], 'XX', tonumber(ARGV[3]) + tonumber(ARGV[2]), ARGV[4])
  return 1
end
return 0
";

// KEYS[1] queue, KEYS[2] lease, KEYS[3] job. ARGV: worker, eligible_ms, error, video id.
const RESCHEDULE_SCRIPT: &str = r"
if redis.call('GET', KEYS[2]) == ARGV[1] then
  redis.call('DEL', KEYS[2])
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[4])
  redis.call('HSET', KEYS[3], 'last_error', ARGV[3], 'next_eligible_ms', ARGV[2])
  return 1
end
return 0
";

// KEYS[1] queue, KEYS[2] lease, KEYS[3] job. ARGV: worker, now_ms, video id.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[2]) == ARGV[1] then
  redis.call('DEL', KEYS[2])
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
  redis.call('HINCRBY', KEYS[3], 'attempts', -1)
  return 1
end
return 0
";

// KEYS[1] queue, KEYS[2] lease, KEYS[3] job, KEYS[4] cancel flag. ARGV: worker, video id.
const FINISH_SCRIPT: &str = r"
local owner = redis.call('GET', KEYS[2])
if owner == ARGV[1] or not owner then
  redis.call('ZREM', KEYS[1], ARGV[2])
  redis.call('DEL', KEYS[2], KEYS[3], KEYS[4])
  return 1
end
return 0
";

/// Redis-backed job queue: a sorted set scored by eligibility time, a hash
/// per job and a `SET NX PX` lease per video.
pub struct RedisJobQueue {
    client: redis::Client,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        video_id: Uuid,
    ) -> Result<Option<ProcessingJob>, QueueError> {
        let fields: HashMap<String, String> = conn.hgetall(job_key(video_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let owner: Option<String> = conn.get(lease_key(video_id)).await?;
        let ttl_ms: i64 = conn.pttl(lease_key(video_id)).await?;

        let attempts = fields
            .get("attempts")
            .and_then(|a| a.parse::<i64>().ok())
            .unwrap_or(0);
        let enqueued_at = fields
            .get("enqueued_ms")
            .and_then(|v| v.parse::<i64>().ok())
            .map_or_else(Utc::now, from_millis);
        let next_eligible_at = fields
            .get("next_eligible_ms")
            .and_then(|v| v.parse::<i64>().ok())
            .map_or(enqueued_at, from_millis);

        let lease_expires_at = owner
            .as_ref()
            .filter(|_| ttl_ms > 0)
            .map(|_| Utc::now() + chrono::Duration::milliseconds(ttl_ms));

        Ok(Some(ProcessingJob {
            video_id,
            attempts: u32::try_from(attempts.max(0)).unwrap_or(u32::MAX),
            enqueued_at,
            next_eligible_at,
            lease_owner: owner,
            lease_expires_at,
            last_error: fields.get("last_error").cloned().filter(|e| !e.is_empty()),
        }))
    }
}

fn job_key(video_id: Uuid) -> String {
    format!("{JOB_PREFIX}{video_id}")
}

fn lease_key(video_id: Uuid) -> String {
    format!("{LEASE_PREFIX}{video_id}")
}

fn cancel_key(video_id: Uuid) -> String {
    format!("{CANCEL_PREFIX}{video_id}")
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, video_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let created: i32 = Script::new(ENQUEUE_SCRIPT)
            .key(QUEUE_KEY)
            .key(job_key(video_id))
            .key(cancel_key(video_id))
            .arg(Utc::now().timestamp_millis())
            .arg(video_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn acquire(&self, worker_id: &str, lease_ttl: Duration) -> Result<Option<ProcessingJob>, QueueError> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();

        let acquired: Option<(String, String)> = Script::new(ACQUIRE_SCRIPT)
            .key(QUEUE_KEY)
            .arg(now_ms)
            .arg(worker_id)
            .arg(ttl_millis(lease_ttl))
            .arg(LEASE_PREFIX)
            .arg(JOB_PREFIX)
            .invoke_async(&mut conn)
            .await?;

        let Some((id, _expires)) = acquired else {
            return Ok(None);
        };
        let video_id = Uuid::parse_str(&id).map_err(|e| QueueError::Corrupt(e.to_string()))?;
        self.load(&mut conn, video_id).await
    }

    async fn renew(&self, video_id: Uuid, worker_id: &str, lease_ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let renewed: i32 = Script::new(RENEW_SCRIPT)
            .key(QUEUE_KEY)
            .key(lease_key(video_id))
            .arg(worker_id)
            .arg(ttl_millis(lease_ttl))
            .arg(Utc::now().timestamp_millis())
            .arg(video_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn reschedule(
        &self,
        video_id: Uuid,
        worker_id: &str,
        eligible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let done: i32 = Script::new(RESCHEDULE_SCRIPT)
            .key(QUEUE_KEY)
            .key(lease_key(video_id))
            .key(job_key(video_id))
            .arg(worker_id)
            .arg(eligible_at.timestamp_millis())
            .arg(error)
            .arg(video_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(done == 1)
    }

    async fn release(&self, video_id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let done: i32 = Script::new(RELEASE_SCRIPT)
            .key(QUEUE_KEY)
            .key(lease_key(video_id))
            .key(job_key(video_id))
            .arg(worker_id)
            .arg(Utc::now().timestamp_millis())
            .arg(video_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(done == 1)
    }

    async fn finish(&self, video_id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let done: i32 = Script::new(FINISH_SCRIPT)
            .key(QUEUE_KEY)
            .key(lease_key(video_id))
            .key(job_key(video_id))
            .key(cancel_key(video_id))
            .arg(worker_id)
            .arg(video_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(done == 1)
    }

    async fn request_cancel(&self, video_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(cancel_key(video_id), 1, CANCEL_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, video_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(cancel_key(video_id)).await?;
        Ok(exists)
    }

    async fn get(&self, video_id: Uuid) -> Result<Option<ProcessingJob>, QueueError> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, video_id).await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let depth: u64 = conn.zcard(QUEUE_KEY).await?;
        Ok(depth)
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt queue entry: {0}")]
    Corrupt(String),
}
