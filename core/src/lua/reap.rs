use lazy_static::lazy_static;

use crate::error::Result;
use taskloom_store::RedisPool;

// Rescue every payload orphaned in a crashed pool's in-progress list for
// one job name: move them back onto the ready list,
// decrement the shared lock by however many were moved, and clear this
// pool's lock_info entry.
//
// The in-progress list is built by repeated LPUSH during fetch (see
// `crate::lua::fetch`), so its head-to-tail order is newest-to-oldest
// dequeued. Replaying that same order with LPUSH onto the ready list
// pushes the newest-dequeued orphan first and the oldest-dequeued orphan
// last, landing the oldest — the one that's waited longest — at the very
// head of the ready list: it's the next thing any worker fetches. This is
// "recovered jobs run sooner" guarantee, applied within the recovered
// cohort too.
//
// KEYS:
//  1. in-progress list (jobs:<name>:<deadPoolID>:inprogress)
//  2. ready list        (jobs:<name>)
//  3. lock counter      (jobs:<name>:lock)
//  4. lock_info hash    (jobs:<name>:lock_info)
// ARGV:
//  1. dead pool ID (lock_info field to clear)
const REAP_SCRIPT: &str = r##"
    local items = redis.call("LRANGE", KEYS[1], 0, -1)
    local moved = #items
    if moved == 0 then
        return 0
    end

    for i = 1, #items do
        redis.call("LPUSH", KEYS[2], items[i])
    end
    redis.call("DEL", KEYS[1])

    local lock = redis.call("DECRBY", KEYS[3], moved)
    if lock < 0 then
        redis.call("SET", KEYS[3], 0)
    end
    redis.call("HDEL", KEYS[4], ARGV[1])

    return moved
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(REAP_SCRIPT);
}

pub struct ReapScript(&'static redis::Script);

impl ReapScript {
    pub fn new() -> Self {
        ReapScript(&SCRIPT)
    }

    /// Returns the number of orphaned payloads moved back to the ready
    /// list.
    pub async fn run(&self, pool: &RedisPool, in_progress: &str, ready: &str, lock: &str, lock_info: &str, dead_pool_id: &str) -> Result<u32> {
        let mut conn = pool.get().await?;
        let moved: u32 = self
            .0
            .key(in_progress)
            .key(ready)
            .key(lock)
            .key(lock_info)
            .arg(dead_pool_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }
}

impl Default for ReapScript {
    fn default() -> Self {
        Self::new()
    }
}
