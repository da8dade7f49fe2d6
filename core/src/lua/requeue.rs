use lazy_static::lazy_static;

use crate::error::Result;
use taskloom_store::RedisPool;

/// How many due items a single requeue pass moves at once. Keeps one
/// script invocation from blocking Redis for too long when a large batch
/// comes due simultaneously (e.g. after an outage).
pub const REQUEUE_BATCH_SIZE: isize = 100;

// Move every item due to run (score <= now) out of a shared retry or
// scheduled set and onto its job type's ready list. The set holds jobs of
// every type, ordered by run time, so this reads each due payload's own
// `name` field to know which ready list to push it onto.
//
// A due entry is only moved if its job name appears in
// the caller's allow-list (the job names the owning pool actually knows
// how to run); everything else is left in the source set for a peer pool
// to pick up, or to accumulate if no pool in the fleet knows it (an open
// question this design leaves open rather than resolves — see DESIGN.md).
//
// KEYS:
//  1. source set (retry set or scheduled set)
// ARGV:
//  1. now (epoch seconds)
//  2. ready-list key prefix (e.g. "ns:jobs:" — job name is appended)
//  3. batch size
//  4. comma-joined allow-list of known job names
const REQUEUE_SCRIPT: &str = r##"
    local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, ARGV[3])
    local allowed = {}
    for name in string.gmatch(ARGV[4], "([^,]+)") do
        allowed[name] = true
    end

    local moved = 0
    local unknown = {}
    for _, payload in ipairs(due) do
        local ok, job = pcall(cjson.decode, payload)
        if ok and job ~= nil and job["name"] ~= nil then
            if allowed[job["name"]] then
                redis.call("ZREM", KEYS[1], payload)
                redis.call("RPUSH", ARGV[2] .. job["name"], payload)
                moved = moved + 1
            else
                unknown[job["name"]] = true
            end
        end
    end

    local unknown_names = {}
    for name, _ in pairs(unknown) do
        table.insert(unknown_names, name)
    end
    return {moved, unknown_names}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(REQUEUE_SCRIPT);
}

pub struct RequeueScript(&'static redis::Script);

impl RequeueScript {
    pub fn new() -> Self {
        RequeueScript(&SCRIPT)
    }

    /// Moves every due entry whose job name is in `allowed_names`. Returns
    /// the number moved plus the distinct set of due job names that were
    /// left in place because they weren't in the allow-list.
    pub async fn run(
        &self,
        pool: &RedisPool,
        source_set: &str,
        ready_prefix: &str,
        now: i64,
        allowed_names: &[String],
    ) -> Result<(u32, Vec<String>)> {
        let mut conn = pool.get().await?;
        let (moved, unknown): (u32, Vec<String>) = self
            .0
            .key(source_set)
            .arg(now)
            .arg(ready_prefix)
            .arg(REQUEUE_BATCH_SIZE)
            .arg(allowed_names.join(","))
            .invoke_async(&mut conn)
            .await?;
        Ok((moved, unknown))
    }
}

impl Default for RequeueScript {
    fn default() -> Self {
        Self::new()
    }
}
