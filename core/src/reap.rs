//! Dead-pool crash recovery.
//!
//! Every pool in a namespace runs one of these. On each tick, any one of
//! them finding a pool whose heartbeat has gone stale (or vanished
//! outright) rescues that pool's orphaned in-progress jobs back onto
//! their ready lists and removes the dead pool's bookkeeping. Several
//! pools racing to reap the same dead pool is harmless: the second to
//! try finds empty in-progress lists and an already-absent heartbeat hash,
//! so its script calls are no-ops.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taskloom_shutdown::GracefulShutdownConsumer;
use taskloom_store::RedisPool;

use crate::keys;
use crate::lua::reap::ReapScript;
use crate::time::now_epoch_seconds;

/// 2x the heartbeat period.
pub const DEAD_TIME_SECONDS: i64 = 10;
pub const REAP_PERIOD: Duration = Duration::from_secs(10 * 60);
const REAP_JITTER_SECONDS_MAX: u64 = 30;

#[derive(Debug, Clone)]
struct DeadPool {
    pool_id: String,
    job_names: Vec<String>,
}

pub struct DeadPoolReaper {
    pool: RedisPool,
    namespace: String,
    /// This reaper's own registered job names, used as a best-effort job
    /// name list when a dead pool's heartbeat hash is missing entirely.
    own_job_names: Vec<String>,
    script: ReapScript,
}

impl DeadPoolReaper {
    pub fn new(pool: RedisPool, namespace: impl Into<String>, own_job_names: Vec<String>) -> DeadPoolReaper {
        DeadPoolReaper {
            pool,
            namespace: namespace.into(),
            own_job_names,
            script: ReapScript::new(),
        }
    }

    async fn find_dead_pools(&self) -> taskloom_store::Result<Vec<DeadPool>> {
        let worker_pools_key = keys::worker_pools(&self.namespace);
        let mut conn = self.pool.get().await?;
        let pool_ids: Vec<String> = redis::cmd("SMEMBERS").arg(&worker_pools_key).query_async(&mut conn).await?;

        let now = now_epoch_seconds();
        let mut dead = Vec::new();
        for pool_id in pool_ids {
            let heartbeat_key = keys::worker_pool_heartbeat(&self.namespace, &pool_id);
            let fields: HashMap<String, String> = redis::cmd("HGETALL").arg(&heartbeat_key).query_async(&mut conn).await?;

            if fields.is_empty() {
                dead.push(DeadPool {
                    pool_id,
                    job_names: self.own_job_names.clone(),
                });
                continue;
            }

            let heartbeat_at: i64 = fields.get("heartbeat_at").and_then(|v| v.parse().ok()).unwrap_or(0);
            if heartbeat_at + DEAD_TIME_SECONDS < now {
                let job_names = fields
                    .get("job_names")
                    .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
                    .unwrap_or_default();
                dead.push(DeadPool { pool_id, job_names });
            }
        }
        Ok(dead)
    }

    async fn reap(&self, dead_pools: Vec<DeadPool>) {
        for dead in dead_pools {
            let mut total_moved = 0u32;
            for name in &dead.job_names {
                let in_progress = keys::jobs_in_progress(&self.namespace, name, &dead.pool_id);
                let ready = keys::jobs(&self.namespace, name);
                let lock = keys::jobs_lock(&self.namespace, name);
                let lock_info = keys::jobs_lock_info(&self.namespace, name);

                match self.script.run(&self.pool, &in_progress, &ready, &lock, &lock_info, &dead.pool_id).await {
                    Ok(moved) => total_moved += moved,
                    Err(err) => warn!(error = %err, pool_id = %dead.pool_id, job_name = %name, "failed to reap in-progress jobs"),
                }
            }

            if let Err(err) = self.deregister(&dead.pool_id).await {
                warn!(error = %err, pool_id = %dead.pool_id, "failed to deregister dead pool");
            }

            if total_moved > 0 || !dead.job_names.is_empty() {
                info!(pool_id = %dead.pool_id, jobs_recovered = total_moved, "reaped dead worker pool");
            }
        }
    }

    #[cfg(test)]
    async fn find_dead_pools_for_test(&self) -> taskloom_store::Result<Vec<(String, Vec<String>)>> {
        let mut dead = self.find_dead_pools().await?;
        dead.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        Ok(dead.into_iter().map(|d| (d.pool_id, d.job_names)).collect())
    }

    #[cfg(test)]
    async fn reap_for_test(&self) {
        let dead = self.find_dead_pools().await.expect("scanning for dead pools");
        self.reap(dead).await;
    }

    async fn deregister(&self, pool_id: &str) -> taskloom_store::Result<()> {
        let worker_pools_key = keys::worker_pools(&self.namespace);
        let heartbeat_key = keys::worker_pool_heartbeat(&self.namespace, pool_id);
        let mut conn = self.pool.get().await?;
        redis::pipe()
            .atomic()
            .srem(&worker_pools_key, pool_id)
            .del(&heartbeat_key)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn tick(&self) {
        match self.find_dead_pools().await {
            Ok(dead) if dead.is_empty() => {}
            Ok(dead) => self.reap(dead).await,
            Err(err) => warn!(error = %err, "failed to scan for dead worker pools, retrying next tick"),
        }
    }

    /// Spawns the reap tick loop: every `REAP_PERIOD` plus 0..30s of
    /// jitter, so many pools sharing a namespace don't all scan at once.
    pub fn start(self, mut shutdown: GracefulShutdownConsumer) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            loop {
                let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..REAP_JITTER_SECONDS_MAX));
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(REAP_PERIOD + jitter) => {}
                }
                self.tick().await;
            }
        });
        (stop_tx, handle)
    }
}

#[cfg(all(test, feature = "test-redis"))]
mod redis_tests {
    use super::*;

    async fn test_pool() -> (RedisPool, String) {
        dotenv::dotenv().ok();
        let namespace = format!("taskloom-reap-test-{}", uuid::Uuid::new_v4());
        let pool = RedisPool::new(None, None).expect("creating connection pool");
        (pool, namespace)
    }

    async fn cleanup(pool: &RedisPool, namespace: &str) {
        let mut conn = pool.get().await.expect("cleanup: acquiring connection");
        let mut cmd = redis::cmd("SCAN");
        let mut iter: redis::AsyncIter<String> = cmd
            .cursor_arg(0)
            .arg("MATCH")
            .arg(format!("{}:*", namespace))
            .clone()
            .iter_async(&mut *conn)
            .await
            .expect("cleanup: scanning keyspace");
        let mut del_cmd = redis::cmd("DEL");
        let mut any = false;
        while let Some(key) = iter.next_item().await {
            any = true;
            del_cmd.arg(key);
        }
        if any {
            del_cmd.query_async::<_, ()>(&mut conn).await.expect("cleanup: deleting keys");
        }
    }

    /// Mirrors the reference dead-pool-reaper test: three pools register a
    /// heartbeat, two of them stale by an hour; the reaper should see those
    /// two as dead and, once an orphaned in-progress job exists, move it
    /// back onto the ready list and clear the dead pool's bookkeeping.
    #[tokio::test]
    async fn finds_and_reaps_dead_pools() {
        let (pool, namespace) = test_pool().await;
        let now = now_epoch_seconds();

        let worker_pools_key = keys::worker_pools(&namespace);
        let mut conn = pool.get().await.unwrap();
        redis::cmd("SADD").arg(&worker_pools_key).arg("1").arg("2").arg("3").query_async::<_, ()>(&mut conn).await.unwrap();

        for (pool_id, heartbeat_at) in [("1", now), ("2", now - 3600), ("3", now - 3600)] {
            let heartbeat_key = keys::worker_pool_heartbeat(&namespace, pool_id);
            redis::pipe()
                .atomic()
                .hset(&heartbeat_key, "heartbeat_at", heartbeat_at)
                .hset(&heartbeat_key, "job_names", "type1,type2")
                .query_async::<_, ()>(&mut conn)
                .await
                .unwrap();
        }

        let reaper = DeadPoolReaper::new(pool.clone(), namespace.clone(), vec![]);
        let mut dead = reaper.find_dead_pools_for_test().await.unwrap();
        dead.sort();
        assert_eq!(
            dead,
            vec![
                ("2".to_string(), vec!["type1".to_string(), "type2".to_string()]),
                ("3".to_string(), vec!["type1".to_string(), "type2".to_string()]),
            ]
        );

        let in_progress = keys::jobs_in_progress(&namespace, "type1", "2");
        let ready = keys::jobs(&namespace, "type1");
        let lock = keys::jobs_lock(&namespace, "type1");
        let lock_info = keys::jobs_lock_info(&namespace, "type1");
        redis::cmd("LPUSH").arg(&in_progress).arg("foo").query_async::<_, ()>(&mut conn).await.unwrap();
        redis::cmd("INCR").arg(&lock).query_async::<_, ()>(&mut conn).await.unwrap();
        redis::cmd("HINCRBY").arg(&lock_info).arg("2").arg(1).query_async::<_, ()>(&mut conn).await.unwrap();

        let ready_len: i64 = redis::cmd("LLEN").arg(&ready).query_async(&mut conn).await.unwrap();
        assert_eq!(ready_len, 0);
        let in_progress_len: i64 = redis::cmd("LLEN").arg(&in_progress).query_async(&mut conn).await.unwrap();
        assert_eq!(in_progress_len, 1);

        reaper.reap_for_test().await;

        let ready_len: i64 = redis::cmd("LLEN").arg(&ready).query_async(&mut conn).await.unwrap();
        assert_eq!(ready_len, 1);
        let in_progress_len: i64 = redis::cmd("LLEN").arg(&in_progress).query_async(&mut conn).await.unwrap();
        assert_eq!(in_progress_len, 0);
        let lock_val: i64 = redis::cmd("GET").arg(&lock).query_async(&mut conn).await.unwrap();
        assert_eq!(lock_val, 0);

        let still_registered: bool = redis::cmd("SISMEMBER").arg(&worker_pools_key).arg("2").query_async(&mut conn).await.unwrap();
        assert!(!still_registered, "reaped pool should be removed from worker_pools");

        cleanup(&pool, &namespace).await;
    }
}
