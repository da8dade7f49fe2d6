//! Scheduled→ready and retry→ready movers.
//!
//! The same component shape runs both jobs: construct one `Requeuer` over
//! the scheduled set and another over the retry set, each scoped to the
//! job names the owning pool actually knows how to run (the allow-list —
//! see `crate::lua::requeue`). A background task ticks roughly once a
//! second, draining everything due each tick before sleeping again.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use taskloom_shutdown::GracefulShutdownConsumer;
use taskloom_store::RedisPool;

use crate::keys;
use crate::lua::requeue::RequeueScript;
use crate::time::now_epoch_seconds;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const JITTER_MILLIS_MAX: u64 = 250;

/// Moves due entries from one shared sorted set (scheduled or retry) onto
/// their job types' ready lists, once per tick, until nothing is due.
pub struct Requeuer {
    pool: RedisPool,
    namespace: String,
    source_set: String,
    allowed_names: Vec<String>,
    script: RequeueScript,
    /// Job names seen due but not in the allow-list, logged once each
    /// rather than every tick. Reported, but never moved.
    warned_unknown: Mutex<HashSet<String>>,
}

impl Requeuer {
    /// `source_set` is a full key (scheduled or retry), built by the
    /// caller from `crate::keys`. `allowed_names` is the set of job names
    /// the owning pool has registered handlers for.
    pub fn new(pool: RedisPool, namespace: impl Into<String>, source_set: String, allowed_names: Vec<String>) -> Requeuer {
        Requeuer {
            pool,
            namespace: namespace.into(),
            source_set,
            allowed_names,
            script: RequeueScript::new(),
            warned_unknown: Mutex::new(HashSet::new()),
        }
    }

    async fn run_once_to_drain(&self) {
        let ready_prefix = keys::jobs_prefix(&self.namespace);
        loop {
            let now = now_epoch_seconds();
            match self.script.run(&self.pool, &self.source_set, &ready_prefix, now, &self.allowed_names).await {
                Ok((moved, unknown)) => {
                    if moved > 0 {
                        debug!(moved, source = %self.source_set, "requeued due jobs");
                    }
                    self.warn_unknown_once(unknown);
                    if moved == 0 {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, source = %self.source_set, "requeue tick failed, retrying next tick");
                    break;
                }
            }
        }
    }

    fn warn_unknown_once(&self, unknown: Vec<String>) {
        if unknown.is_empty() {
            return;
        }
        let mut warned = self.warned_unknown.lock().unwrap();
        for name in unknown {
            if warned.insert(name.clone()) {
                warn!(job_name = %name, source = %self.source_set, "due job has a name no pool in this process recognizes; leaving it in place");
            }
        }
    }

    /// Spawns the tick loop. Returns a stop signal and its `JoinHandle`,
    /// in the same shape as every other background task this crate owns.
    pub fn start(self, mut shutdown: GracefulShutdownConsumer) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            // A small random jitter on each tick keeps many pools sharing
            // a namespace from hammering Redis in lockstep.
            loop {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MILLIS_MAX));
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(TICK_INTERVAL + jitter) => {}
                }
                self.run_once_to_drain().await;
            }
        });
        (stop_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_unknown_once_only_warns_each_name_a_single_time() {
        let warned = Mutex::new(HashSet::new());
        assert!(warned.lock().unwrap().insert("a".to_string()));
        assert!(!warned.lock().unwrap().insert("a".to_string()));
    }
}
