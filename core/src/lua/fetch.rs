use lazy_static::lazy_static;

use crate::error::Result;
use taskloom_store::RedisPool;

// Fetch the next ready job for a single job type, honoring pause and
// per-type concurrency cap. Returns false when there's nothing to take
// (empty list, paused, or at the concurrency cap) rather than an error —
// the fetcher just moves on to the next sampled job type.
//
// KEYS:
//  1. ready list        (jobs:<name>)
//  2. paused flag       (jobs:<name>:paused)
//  3. lock counter       (jobs:<name>:lock)
//  4. lock_info hash     (jobs:<name>:lock_info)
//  5. max_concurrency    (jobs:<name>:max_concurrency)
//  6. in-progress list   (jobs:<name>:<poolID>:inprogress)
// ARGV:
//  1. pool ID (lock_info field)
const FETCH_SCRIPT: &str = r##"
    if redis.call("EXISTS", KEYS[2]) == 1 then
        return false
    end

    local max_concurrency = tonumber(redis.call("GET", KEYS[5]))
    if max_concurrency and max_concurrency > 0 then
        local lock = tonumber(redis.call("GET", KEYS[3])) or 0
        if lock >= max_concurrency then
            return false
        end
    end

    local job = redis.call("LPOP", KEYS[1])
    if job == false then
        return false
    end

    redis.call("INCR", KEYS[3])
    redis.call("HINCRBY", KEYS[4], ARGV[1], 1)
    redis.call("LPUSH", KEYS[6], job)
    return job
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(FETCH_SCRIPT);
}

pub struct FetchScript(&'static redis::Script);

impl FetchScript {
    pub fn new() -> Self {
        FetchScript(&SCRIPT)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        pool: &RedisPool,
        ready: &str,
        paused: &str,
        lock: &str,
        lock_info: &str,
        max_concurrency: &str,
        in_progress: &str,
        pool_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        let mut conn = pool.get().await?;
        let job: Option<Vec<u8>> = self
            .0
            .key(ready)
            .key(paused)
            .key(lock)
            .key(lock_info)
            .key(max_concurrency)
            .key(in_progress)
            .arg(pool_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(job)
    }
}

impl Default for FetchScript {
    fn default() -> Self {
        Self::new()
    }
}
