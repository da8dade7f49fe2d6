//! The producer side of the system: turning a job name and arguments into
//! a durable, fetchable job.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::job::{Job, JobId};
use crate::keys;
use crate::lua::enqueue::{EnqueueScheduledScript, EnqueueScript};
use crate::time::now_epoch_seconds;
use taskloom_store::RedisPool;

/// Per-call overrides for [`Enqueuer::enqueue_with_options`]. The common
/// case (`Enqueuer::enqueue`) needs none of these.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Suppress this enqueue if a job with the same fingerprint (job name
    /// + args, or job name + `unique_key` if given) is already pending,
    /// scheduled, or in progress.
    pub unique: bool,
    /// Overrides the fingerprint used for `unique`; lets two enqueues with
    /// different args still be treated as duplicates of each other.
    pub unique_key: Option<String>,
    /// Run no earlier than this epoch-second timestamp, instead of as soon
    /// as a worker is free.
    pub run_at: Option<i64>,
}

/// How long this process trusts its own record of a job name's known_jobs
/// membership before re-asserting it.
const KNOWN_JOBS_REFRESH_SECONDS: i64 = 300;

/// Tracks which job names this process has recently confirmed are present
/// in the namespace's known_jobs set, so repeat enqueues of the same job
/// type skip the redundant registration write — except every 300s, when
/// the entry is treated as stale and re-asserted once more.
#[derive(Default)]
struct NameCache(RwLock<HashMap<String, i64>>);

impl NameCache {
    /// Returns true if `name` needs (re-)registering: first sighting ever,
    /// or last registered more than [`KNOWN_JOBS_REFRESH_SECONDS`] ago.
    fn needs_registration(&self, name: &str, now: i64) -> bool {
        match self.0.read().unwrap().get(name) {
            Some(next_refresh) => now >= *next_refresh,
            None => true,
        }
    }

    fn mark_registered(&self, name: &str, now: i64) {
        self.0.write().unwrap().insert(name.to_string(), now + KNOWN_JOBS_REFRESH_SECONDS);
    }
}

/// Enqueues jobs into a namespace's shared Redis keyspace. Cheap to
/// clone; every clone shares the same connection pool and job-name cache.
#[derive(Clone)]
pub struct Enqueuer {
    pool: RedisPool,
    namespace: String,
    known_names: std::sync::Arc<NameCache>,
    immediate: std::sync::Arc<EnqueueScript>,
    scheduled: std::sync::Arc<EnqueueScheduledScript>,
}

impl Enqueuer {
    pub fn new(pool: RedisPool, namespace: impl Into<String>) -> Enqueuer {
        Enqueuer {
            pool,
            namespace: namespace.into(),
            known_names: std::sync::Arc::new(NameCache::default()),
            immediate: std::sync::Arc::new(EnqueueScript::new()),
            scheduled: std::sync::Arc::new(EnqueueScheduledScript::new()),
        }
    }

    /// Enqueue `name` with `args` to run as soon as a worker is free.
    /// Returns the constructed [`Job`] (with `unique` duplicate-suppressed
    /// enqueues returning `None` rather than an error).
    pub async fn enqueue(&self, name: impl Into<String>, args: Map<String, Value>) -> Result<Option<Job>> {
        self.enqueue_with_options(name, args, EnqueueOptions::default()).await
    }

    /// Enqueue `name` to run no earlier than `delay_seconds` from now.
    pub async fn enqueue_in(&self, name: impl Into<String>, delay_seconds: i64, args: Map<String, Value>) -> Result<Option<Job>> {
        let options = EnqueueOptions {
            run_at: Some(now_epoch_seconds() + delay_seconds),
            ..Default::default()
        };
        self.enqueue_with_options(name, args, options).await
    }

    /// Enqueue `name` immediately, suppressed if a job with the same
    /// `(name, args)` fingerprint is already pending.
    pub async fn enqueue_unique(&self, name: impl Into<String>, args: Map<String, Value>) -> Result<Option<Job>> {
        let options = EnqueueOptions {
            unique: true,
            ..Default::default()
        };
        self.enqueue_with_options(name, args, options).await
    }

    /// The delayed counterpart to [`Enqueuer::enqueue_unique`].
    pub async fn enqueue_unique_in(&self, name: impl Into<String>, delay_seconds: i64, args: Map<String, Value>) -> Result<Option<Job>> {
        let options = EnqueueOptions {
            unique: true,
            run_at: Some(now_epoch_seconds() + delay_seconds),
            ..Default::default()
        };
        self.enqueue_with_options(name, args, options).await
    }

    pub async fn enqueue_with_options(
        &self,
        name: impl Into<String>,
        args: Map<String, Value>,
        options: EnqueueOptions,
    ) -> Result<Option<Job>> {
        let name = name.into();
        let mut job = Job::new(&name, args, now_epoch_seconds());
        job.unique = options.unique;
        job.unique_key = options.unique_key.clone();

        let payload = job.serialize()?;
        let now = now_epoch_seconds();
        let register_name = self.known_names.needs_registration(&name, now);
        let known_jobs_key = keys::known_jobs(&self.namespace);

        let accepted = match options.run_at {
            None => {
                let unique_key = if options.unique {
                    keys::unique(&self.namespace, &fingerprint(&name, &job.args, options.unique_key.as_deref()))
                } else {
                    String::new()
                };
                let ready = keys::jobs(&self.namespace, &name);
                self.immediate
                    .run(&self.pool, &unique_key, &ready, &known_jobs_key, &job.id, &payload, options.unique, &name, register_name)
                    .await?
            }
            Some(run_at) => {
                let unique_key = if options.unique {
                    keys::unique(&self.namespace, &fingerprint(&name, &job.args, options.unique_key.as_deref()))
                } else {
                    String::new()
                };
                let scheduled = keys::scheduled(&self.namespace);
                self.scheduled
                    .run(&self.pool, &unique_key, &scheduled, &known_jobs_key, &job.id, &payload, options.unique, &name, run_at)
                    .await?
            }
        };

        if accepted {
            // The script only reaches its SADD into known_jobs on this same
            // path (a claimed unique key, or an unconditional non-unique
            // enqueue), so this is the only outcome allowed to mark the
            // name as registered.
            if register_name {
                self.known_names.mark_registered(&name, now);
            }
            debug!(job = %job, "enqueued");
            Ok(Some(job))
        } else {
            debug!(job_name = %name, "suppressed duplicate unique enqueue");
            Ok(None)
        }
    }
}
