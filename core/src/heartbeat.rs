//! Worker-pool liveness broadcast.
//!
//! Every pool, once started, adds itself to the shared `worker_pools` set
//! and writes a heartbeat hash every 5 seconds so the dead-pool reaper
//! (`crate::reap`) and `crate::client`'s monitoring queries can tell it's
//! alive. `job_names` and `worker_ids` are stored as comma-joined, sorted
//! strings so `crate::client`'s parser has a stable format to split on.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use taskloom_shutdown::GracefulShutdownConsumer;
use taskloom_store::RedisPool;

use crate::keys;
use crate::time::now_epoch_seconds;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// The fixed, never-changing fields of a pool's heartbeat. Captured once
/// at construction; only `heartbeat_at` changes from tick to tick.
#[derive(Debug, Clone)]
pub struct HeartbeatInfo {
    pub pool_id: String,
    pub started_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: usize,
    pub worker_ids: Vec<String>,
}

pub struct Heartbeater {
    pool: RedisPool,
    namespace: String,
    info: HeartbeatInfo,
    host: String,
    pid: u32,
}

impl Heartbeater {
    pub fn new(pool: RedisPool, namespace: impl Into<String>, info: HeartbeatInfo) -> Heartbeater {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Heartbeater {
            pool,
            namespace: namespace.into(),
            info,
            host,
            pid: std::process::id(),
        }
    }

    async fn beat(&self) -> taskloom_store::Result<()> {
        let mut job_names = self.info.job_names.clone();
        job_names.sort();
        let mut worker_ids = self.info.worker_ids.clone();
        worker_ids.sort();

        let heartbeat_key = keys::worker_pool_heartbeat(&self.namespace, &self.info.pool_id);
        let worker_pools_key = keys::worker_pools(&self.namespace);

        let mut conn = self.pool.get().await?;
        redis::pipe()
            .atomic()
            .sadd(&worker_pools_key, &self.info.pool_id)
            .hset(&heartbeat_key, "started_at", self.info.started_at)
            .hset(&heartbeat_key, "heartbeat_at", now_epoch_seconds())
            .hset(&heartbeat_key, "job_names", job_names.join(","))
            .hset(&heartbeat_key, "concurrency", self.info.concurrency as i64)
            .hset(&heartbeat_key, "host", self.host.as_str())
            .hset(&heartbeat_key, "pid", self.pid as i64)
            .hset(&heartbeat_key, "worker_ids", worker_ids.join(","))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn deregister(&self) {
        let heartbeat_key = keys::worker_pool_heartbeat(&self.namespace, &self.info.pool_id);
        let worker_pools_key = keys::worker_pools(&self.namespace);
        let conn = self.pool.get().await;
        let mut conn = match conn {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, pool_id = %self.info.pool_id, "could not get a connection to deregister heartbeat");
                return;
            }
        };
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .srem(&worker_pools_key, &self.info.pool_id)
            .del(&heartbeat_key)
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            error!(error = %err, pool_id = %self.info.pool_id, "failed to deregister heartbeat on stop");
        }
    }

    /// Spawns the 5s heartbeat tick. On stop, removes this pool's
    /// membership and heartbeat hash so the reaper and client don't see a
    /// pool that cleanly shut down as crashed.
    pub fn start(self, mut shutdown: GracefulShutdownConsumer) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            info!(pool_id = %self.info.pool_id, "heartbeater starting");
            if let Err(err) = self.beat().await {
                warn!(error = %err, "initial heartbeat write failed");
            }

            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // first tick fires immediately; already beat above

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.beat().await {
                            warn!(error = %err, "heartbeat write failed, retrying next tick");
                        }
                    }
                }
            }

            self.deregister().await;
            info!(pool_id = %self.info.pool_id, "heartbeater stopped");
        });
        (stop_tx, handle)
    }
}
