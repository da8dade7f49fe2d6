use lazy_static::lazy_static;

use crate::error::Result;
use taskloom_store::RedisPool;

// Enqueue a job onto its job type's ready list, registering the job name
// in the known-jobs set and, if the job is unique, claiming its
// uniqueness lock first. The unique key's value is the job's own payload
// (`unique:<fingerprint>` holds either the payload or "1"), so a
// duplicate enqueue that loses the claim still overwrites it with its own
// (newer) args before reporting "already queued" — the already-queued
// list entry itself is immutable once pushed, but the next caller to
// inspect the unique key, or to reuse it once the job type starts storing
// payload-addressed state, sees the newest args.
//
// KEYS:
//  1. unique key (ignored when ARGV[3] is "0")
//  2. ready list
//  3. known_jobs set
// ARGV:
//  1. job ID (unused by this script; kept for parity with the scheduled
//     variant and for callers constructing args positionally)
//  2. payload
//  3. "1" if unique, "0" otherwise
//  4. job name (known_jobs member)
const ENQUEUE_SCRIPT: &str = r##"
    if ARGV[3] == "1" then
        local claimed = redis.call("SET", KEYS[1], ARGV[2], "NX")
        if not claimed then
            redis.call("SET", KEYS[1], ARGV[2])
            return false
        end
    end

    redis.call("RPUSH", KEYS[2], ARGV[2])
    redis.call("SADD", KEYS[3], ARGV[4])
    return true
"##;

// Same claim-then-store logic as ENQUEUE_SCRIPT, but for a job scheduled
// to run in the future: it goes into the shared scheduled set instead of
// a ready list, ordered by run time.
//
// KEYS:
//  1. unique key
//  2. scheduled set
//  3. known_jobs set
// ARGV:
//  1. job ID (unused; see ENQUEUE_SCRIPT)
//  2. payload
//  3. "1" if unique, "0" otherwise
//  4. job name
//  5. run-at score (epoch seconds)
const ENQUEUE_SCHEDULED_SCRIPT: &str = r##"
    if ARGV[3] == "1" then
        local claimed = redis.call("SET", KEYS[1], ARGV[2], "NX")
        if not claimed then
            redis.call("SET", KEYS[1], ARGV[2])
            return false
        end
    end

    redis.call("ZADD", KEYS[2], ARGV[5], ARGV[2])
    redis.call("SADD", KEYS[3], ARGV[4])
    return true
"##;

// Same as ENQUEUE_SCRIPT minus the SADD into known_jobs. The Enqueuer
// calls this once it has already seen a job name registered this
// process's lifetime (see `enqueue::Enqueuer`'s name cache), to skip a
// redundant — if idempotent — write on every single enqueue.
const ENQUEUE_SCRIPT_NO_REGISTER: &str = r##"
    if ARGV[3] == "1" then
        local claimed = redis.call("SET", KEYS[1], ARGV[2], "NX")
        if not claimed then
            redis.call("SET", KEYS[1], ARGV[2])
            return false
        end
    end

    redis.call("RPUSH", KEYS[2], ARGV[2])
    return true
"##;

lazy_static! {
    static ref IMMEDIATE_SCRIPT: redis::Script = redis::Script::new(ENQUEUE_SCRIPT);
    static ref IMMEDIATE_SCRIPT_NO_REGISTER: redis::Script = redis::Script::new(ENQUEUE_SCRIPT_NO_REGISTER);
    static ref SCHEDULED_SCRIPT: redis::Script = redis::Script::new(ENQUEUE_SCHEDULED_SCRIPT);
}

pub struct EnqueueScript(&'static redis::Script);

impl EnqueueScript {
    pub fn new() -> Self {
        EnqueueScript(&IMMEDIATE_SCRIPT)
    }

    pub async fn run(
        &self,
        pool: &RedisPool,
        unique_key: &str,
        ready: &str,
        known_jobs: &str,
        job_id: &str,
        payload: &[u8],
        unique: bool,
        job_name: &str,
        register_name: bool,
    ) -> Result<bool> {
        let mut conn = pool.get().await?;
        let script: &redis::Script = if register_name { self.0 } else { &IMMEDIATE_SCRIPT_NO_REGISTER };
        let accepted: bool = script
            .key(unique_key)
            .key(ready)
            .key(known_jobs)
            .arg(job_id)
            .arg(payload)
            .arg(if unique { "1" } else { "0" })
            .arg(job_name)
            .invoke_async(&mut conn)
            .await?;
        Ok(accepted)
    }
}

impl Default for EnqueueScript {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EnqueueScheduledScript(&'static redis::Script);

impl EnqueueScheduledScript {
    pub fn new() -> Self {
        EnqueueScheduledScript(&SCHEDULED_SCRIPT)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        pool: &RedisPool,
        unique_key: &str,
        scheduled: &str,
        known_jobs: &str,
        job_id: &str,
        payload: &[u8],
        unique: bool,
        job_name: &str,
        run_at: i64,
    ) -> Result<bool> {
        let mut conn = pool.get().await?;
        let accepted: bool = self
            .0
            .key(unique_key)
            .key(scheduled)
            .key(known_jobs)
            .arg(job_id)
            .arg(payload)
            .arg(if unique { "1" } else { "0" })
            .arg(job_name)
            .arg(run_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(accepted)
    }
}

impl Default for EnqueueScheduledScript {
    fn default() -> Self {
        Self::new()
    }
}
