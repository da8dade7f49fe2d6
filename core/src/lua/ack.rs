use lazy_static::lazy_static;

use crate::error::Result;
use taskloom_store::RedisPool;

// Release a job's slot after it completes successfully: remove it from
// the in-progress list and give back its concurrency slot. Uniqueness
// locks are released earlier, right after dequeue (`crate::worker`'s
// `release_unique_lock`), matching the invariant that
// releasing a unique job's lock is the worker's responsibility once it
// has been dequeued, not once it finishes.
//
// KEYS:
//  1. in-progress list
//  2. lock counter
//  3. lock_info hash
// ARGV:
//  1. raw job payload, to remove from the in-progress list by value
//  2. pool ID (lock_info field)
const ACK_SUCCESS_SCRIPT: &str = r##"
    redis.call("LREM", KEYS[1], 1, ARGV[1])

    local lock = redis.call("DECR", KEYS[2])
    if lock < 0 then
        redis.call("SET", KEYS[2], 0)
    end

    local count = redis.call("HINCRBY", KEYS[3], ARGV[2], -1)
    if count <= 0 then
        redis.call("HDEL", KEYS[3], ARGV[2])
    end

    return true
"##;

// Release a job's slot after it fails, routing it to the shared retry
// set (to run again after a backoff), the shared dead set (exhausted its
// retries), or nowhere at all (exhausted its retries on a `skip_dead` job
// type, the "Dead-skipped" outcome).
//
// KEYS:
//  1. in-progress list
//  2. lock counter
//  3. lock_info hash
//  4. retry set
//  5. dead set
// ARGV:
//  1. raw job payload as it was dequeued, to remove from in-progress
//  2. updated job payload (fails/last_err/failed_at already bumped), to
//     store in whichever set it's routed to (ignored on "discard")
//  3. pool ID (lock_info field)
//  4. destination: "retry", "dead", or "discard"
//  5. score to file the updated payload under (the retry time, or "now"
//     for the dead set, which is ordered by when the job died; ignored
//     on "discard")
const ACK_FAILURE_SCRIPT: &str = r##"
    redis.call("LREM", KEYS[1], 1, ARGV[1])

    local lock = redis.call("DECR", KEYS[2])
    if lock < 0 then
        redis.call("SET", KEYS[2], 0)
    end

    local count = redis.call("HINCRBY", KEYS[3], ARGV[3], -1)
    if count <= 0 then
        redis.call("HDEL", KEYS[3], ARGV[3])
    end

    if ARGV[4] == "dead" then
        redis.call("ZADD", KEYS[5], ARGV[5], ARGV[2])
    elseif ARGV[4] == "retry" then
        redis.call("ZADD", KEYS[4], ARGV[5], ARGV[2])
    end

    return true
"##;

lazy_static! {
    static ref SUCCESS_SCRIPT: redis::Script = redis::Script::new(ACK_SUCCESS_SCRIPT);
    static ref FAILURE_SCRIPT: redis::Script = redis::Script::new(ACK_FAILURE_SCRIPT);
}

pub struct AckSuccessScript(&'static redis::Script);

impl AckSuccessScript {
    pub fn new() -> Self {
        AckSuccessScript(&SUCCESS_SCRIPT)
    }

    pub async fn run(&self, pool: &RedisPool, in_progress: &str, lock: &str, lock_info: &str, raw_payload: &[u8], pool_id: &str) -> Result<()> {
        let mut conn = pool.get().await?;
        let _: bool = self
            .0
            .key(in_progress)
            .key(lock)
            .key(lock_info)
            .arg(raw_payload)
            .arg(pool_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

impl Default for AckSuccessScript {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a failed job goes once its in-progress slot is released, per
/// the Retry / Dead / Dead-skipped outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFailureDestination {
    Retry,
    Dead,
    /// `skip_dead` and retries exhausted: the job is simply dropped.
    Discard,
}

impl AckFailureDestination {
    fn as_arg(self) -> &'static str {
        match self {
            AckFailureDestination::Retry => "retry",
            AckFailureDestination::Dead => "dead",
            AckFailureDestination::Discard => "discard",
        }
    }
}

pub struct AckFailureScript(&'static redis::Script);

impl AckFailureScript {
    pub fn new() -> Self {
        AckFailureScript(&FAILURE_SCRIPT)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        pool: &RedisPool,
        in_progress: &str,
        lock: &str,
        lock_info: &str,
        retry_set: &str,
        dead_set: &str,
        raw_payload: &[u8],
        updated_payload: &[u8],
        pool_id: &str,
        destination: AckFailureDestination,
        score: i64,
    ) -> Result<()> {
        let mut conn = pool.get().await?;
        let _: bool = self
            .0
            .key(in_progress)
            .key(lock)
            .key(lock_info)
            .key(retry_set)
            .key(dead_set)
            .arg(raw_payload)
            .arg(updated_payload)
            .arg(pool_id)
            .arg(destination.as_arg())
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

impl Default for AckFailureScript {
    fn default() -> Self {
        Self::new()
    }
}
