//! Coalescing worker observation.
//!
//! Every worker slot publishes what it's currently doing — which job,
//! since when, and the last free-form check-in string the handler
//! reported — to a single Redis key so an operator can inspect live
//! workers without touching the job's own bookkeeping. Handlers can call
//! [`crate::job::Job::checkin`] arbitrarily often; this module coalesces
//! that into infrequent writes rather than one Redis write per call.
//!
//! A single background task owns a bounded channel shared by every worker
//! slot in a pool. Each slot's latest state is tracked in memory and
//! stamped with a version; the task only writes a slot's key to Redis when
//! its version has moved since the last write, whenever the channel drains
//! (so a checkin shows up promptly) or, failing that, on a fixed tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::keys;
use crate::time::now_epoch_seconds;
use taskloom_store::RedisPool;

const CHANNEL_CAPACITY: usize = 1024;
const PERSIST_INTERVAL: Duration = Duration::from_secs(5);
const OBSERVATION_TTL_SECONDS: usize = 24 * 60 * 60;

#[derive(Debug, Clone)]
struct Observation {
    job_id: String,
    job_name: String,
    args: Map<String, Value>,
    started_at: i64,
    checkin: Option<String>,
    checkin_at: Option<i64>,
}

enum Event {
    Start {
        worker_id: String,
        job_id: String,
        job_name: String,
        args: Map<String, Value>,
    },
    Checkin {
        worker_id: String,
        message: String,
    },
    Finish {
        worker_id: String,
    },
}

/// A handle to a single in-flight job's slot in the observation queue.
/// Cheap to clone; sends never block the caller.
#[derive(Clone)]
pub struct ObserverHandle {
    sender: mpsc::Sender<Event>,
    worker_id: String,
    version: Arc<AtomicU64>,
}

impl ObserverHandle {
    pub fn checkin(&self, message: String) {
        self.version.fetch_add(1, Ordering::Relaxed);
        if self
            .sender
            .try_send(Event::Checkin {
                worker_id: self.worker_id.clone(),
                message,
            })
            .is_err()
        {
            debug!(worker_id = %self.worker_id, "observation queue full, dropping checkin");
        }
    }

    fn finish(&self) {
        let _ = self.sender.try_send(Event::Finish {
            worker_id: self.worker_id.clone(),
        });
    }
}

/// Owns the sending half of the observation queue and hands out
/// per-job [`ObserverHandle`]s. One of these exists per worker pool.
#[derive(Clone)]
pub struct Observer {
    sender: mpsc::Sender<Event>,
}

impl Observer {
    /// Spawns the persisting background task and returns a handle to feed
    /// it. `namespace` and `pool` are used to build the per-worker Redis
    /// key and to write to it.
    pub fn spawn(namespace: String, pool: RedisPool) -> Observer {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_persist_loop(namespace, pool, rx));
        Observer { sender: tx }
    }

    /// Registers the start of a job on `worker_id` and returns a handle
    /// the worker attaches to the [`crate::job::Job`] for its duration.
    /// The handle's owner is responsible for calling [`Observer::finish`]
    /// once the job completes.
    pub fn start(&self, worker_id: impl Into<String>, job_id: &str, job_name: &str, args: &Map<String, Value>) -> ObserverHandle {
        let worker_id = worker_id.into();
        let _ = self.sender.try_send(Event::Start {
            worker_id: worker_id.clone(),
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            args: args.clone(),
        });
        ObserverHandle {
            sender: self.sender.clone(),
            worker_id,
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Clears a worker's observation once its job has been acked.
    pub fn finish(&self, handle: &ObserverHandle) {
        handle.finish();
    }
}

async fn run_persist_loop(namespace: String, pool: RedisPool, mut rx: mpsc::Receiver<Event>) {
    let mut state: HashMap<String, Observation> = HashMap::new();
    let mut version: HashMap<String, u64> = HashMap::new();
    let mut written_version: HashMap<String, u64> = HashMap::new();
    let mut ticker = tokio::time::interval(PERSIST_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        apply(&mut state, &mut version, event);
                        // Drain whatever else is already queued up so a burst
                        // of events (e.g. a `Start` immediately followed by
                        // a `Checkin`) coalesces into the state before we
                        // flush, rather than writing once per event.
                        while let Ok(event) = rx.try_recv() {
                            apply(&mut state, &mut version, event);
                        }
                        persist_dirty(&namespace, &pool, &mut state, &version, &mut written_version).await;
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                persist_dirty(&namespace, &pool, &mut state, &version, &mut written_version).await;
            }
        }
    }
    persist_dirty(&namespace, &pool, &mut state, &version, &mut written_version).await;
}

fn apply(state: &mut HashMap<String, Observation>, version: &mut HashMap<String, u64>, event: Event) {
    match event {
        Event::Start { worker_id, job_id, job_name, args } => {
            state.insert(
                worker_id.clone(),
                Observation {
                    job_id,
                    job_name,
                    args,
                    started_at: now_epoch_seconds(),
                    checkin: None,
                    checkin_at: None,
                },
            );
            *version.entry(worker_id).or_insert(0) += 1;
        }
        Event::Checkin { worker_id, message } => {
            if let Some(obs) = state.get_mut(&worker_id) {
                obs.checkin = Some(message);
                obs.checkin_at = Some(now_epoch_seconds());
                *version.entry(worker_id).or_insert(0) += 1;
            }
        }
        Event::Finish { worker_id } => {
            state.remove(&worker_id);
            *version.entry(worker_id).or_insert(0) += 1;
        }
    }
}

async fn persist_dirty(
    namespace: &str,
    pool: &RedisPool,
    state: &mut HashMap<String, Observation>,
    version: &HashMap<String, u64>,
    written_version: &mut HashMap<String, u64>,
) {
    let mut conn = match pool.get().await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(error = %err, "could not get a connection to persist worker observations");
            return;
        }
    };

    let dirty_workers: Vec<String> = version
        .iter()
        .filter(|(worker_id, v)| written_version.get(*worker_id) != Some(*v))
        .map(|(worker_id, _)| worker_id.clone())
        .collect();

    for worker_id in dirty_workers {
        let key = keys::worker_observation(namespace, &worker_id);
        // Stored as a hash (job_name, job_id, started_at, args, checkin,
        // checkin_at) rather than a single JSON blob, so it lines up with
        // the `HGETALL`-based reader in `crate::client`.
        let result: redis::RedisResult<()> = match state.get(&worker_id) {
            Some(obs) => match serde_json::to_string(&obs.args) {
                Ok(args_json) => {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .hset(&key, "job_name", &obs.job_name)
                        .hset(&key, "job_id", &obs.job_id)
                        .hset(&key, "started_at", obs.started_at)
                        .hset(&key, "args", args_json);
                    if let Some(checkin) = &obs.checkin {
                        pipe.hset(&key, "checkin", checkin);
                    }
                    if let Some(checkin_at) = obs.checkin_at {
                        pipe.hset(&key, "checkin_at", checkin_at);
                    }
                    pipe.expire(&key, OBSERVATION_TTL_SECONDS as i64).query_async(&mut conn).await
                }
                Err(err) => {
                    warn!(error = %err, "could not serialize worker observation args");
                    continue;
                }
            },
            None => redis::cmd("DEL").arg(&key).query_async(&mut conn).await,
        };

        match result {
            Ok(()) => {
                if let Some(v) = version.get(&worker_id) {
                    written_version.insert(worker_id, *v);
                }
            }
            Err(err) => warn!(error = %err, worker_id, "failed to persist worker observation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_start_then_checkin_bumps_version_each_time() {
        let mut state = HashMap::new();
        let mut version = HashMap::new();
        apply(
            &mut state,
            &mut version,
            Event::Start {
                worker_id: "w1".into(),
                job_id: "j1".into(),
                job_name: "send_email".into(),
                args: Map::new(),
            },
        );
        assert_eq!(version["w1"], 1);
        assert_eq!(state["w1"].job_name, "send_email");

        apply(
            &mut state,
            &mut version,
            Event::Checkin {
                worker_id: "w1".into(),
                message: "halfway".into(),
            },
        );
        assert_eq!(version["w1"], 2);
        assert_eq!(state["w1"].checkin.as_deref(), Some("halfway"));
    }

    #[test]
    fn apply_finish_removes_state_but_still_bumps_version() {
        let mut state = HashMap::new();
        let mut version = HashMap::new();
        apply(
            &mut state,
            &mut version,
            Event::Start {
                worker_id: "w1".into(),
                job_id: "j1".into(),
                job_name: "send_email".into(),
                args: Map::new(),
            },
        );
        apply(&mut state, &mut version, Event::Finish { worker_id: "w1".into() });
        assert!(!state.contains_key("w1"));
        assert_eq!(version["w1"], 2);
    }

    #[test]
    fn checkin_on_unknown_worker_is_ignored() {
        let mut state = HashMap::new();
        let mut version = HashMap::new();
        apply(
            &mut state,
            &mut version,
            Event::Checkin {
                worker_id: "ghost".into(),
                message: "hi".into(),
            },
        );
        assert!(state.is_empty());
        assert!(version.is_empty());
    }
}
