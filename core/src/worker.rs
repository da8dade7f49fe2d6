//! The consumer side: a pool of worker slots pulling jobs across every
//! registered job type, dispatching them through middleware to handlers,
//! and acking the result.
//!
//! The fetch/backoff/shutdown plumbing below is grounded on
//! `queues/dequeuer_loop.rs`'s `dequeuer_loop` shape: a
//! `FuturesUnordered` of in-flight job tasks bounded by concurrency, a
//! `Backoff` consulted only when a tick finds nothing to do, and a
//! `tokio::select!` that races shutdown against both backoff sleep and
//! in-flight task completion. What changed is what happens when a tick
//! *does* find work: instead of one named queue, each tick samples across
//! every registered job type by priority (`crate::sampler`).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use backoff::backoff::Backoff;
use futures::future::ready;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use taskloom_shutdown::GracefulShutdownConsumer;
use taskloom_store::RedisPool;

use crate::error::{Error, Result};
use crate::job::Job;
use crate::keys::{self, JobNameKeys};
use crate::lua::ack::{AckFailureDestination, AckFailureScript, AckSuccessScript};
use crate::lua::fetch::FetchScript;
use crate::observer::Observer;
use crate::registration::{Chain, JobHandler, JobOptions};
use crate::sampler::weighted_order;
use crate::time::now_epoch_seconds;

struct RegisteredType<Ctx> {
    keys: JobNameKeys,
    options: JobOptions,
    handler: JobHandler<Ctx>,
}

struct Inner<Ctx> {
    pool: RedisPool,
    namespace: String,
    pool_id: String,
    concurrency: usize,
    worker_ids: Vec<String>,
    /// Free list of this pool's stable worker-slot IDs
    /// (`WorkerPoolHeartbeat.worker_ids`). Popped when a slot picks up a
    /// job, pushed back when it finishes, so the observation hash a job
    /// writes to (`crate::observer`) is keyed by a stable slot identity
    /// rather than the job's own ID: `worker_ids` names long-lived worker
    /// slots, not transient jobs.
    idle_worker_ids: Mutex<Vec<String>>,
    ctx: Ctx,
    job_types: RwLock<HashMap<String, RegisteredType<Ctx>>>,
    middleware: RwLock<Chain<Ctx>>,
    observer: Observer,
    fetch_script: FetchScript,
    ack_success: AckSuccessScript,
    ack_failure: AckFailureScript,
}

impl<Ctx> Inner<Ctx> {
    /// Always succeeds as long as callers only call this after confirming
    /// fewer than `concurrency` jobs are in flight (the run loop's own
    /// invariant), since there are exactly `concurrency` IDs in the list.
    fn acquire_worker_id(&self) -> String {
        self.idle_worker_ids
            .lock()
            .unwrap()
            .pop()
            .expect("acquire_worker_id called with no in-flight budget remaining")
    }

    fn release_worker_id(&self, id: String) {
        self.idle_worker_ids.lock().unwrap().push(id);
    }
}

/// The fetch-run-ack engine for one worker pool: `concurrency` worker
/// slots sharing one Redis connection pool, one set of registered job
/// types, and one context value cloned per job. Cloning a `Worker` shares
/// all of that with the clone. `crate::pool::WorkerPool` wraps this with
/// the registration surface and background tasks that keep a namespace's
/// scheduled, retried, and crashed jobs moving; most callers should reach
/// for that instead of constructing a `Worker` directly.
#[derive(Clone)]
pub struct Worker<Ctx> {
    inner: Arc<Inner<Ctx>>,
}

impl<Ctx> Worker<Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    pub fn new(pool: RedisPool, namespace: impl Into<String>, pool_id: impl Into<String>, concurrency: usize, ctx: Ctx) -> Worker<Ctx> {
        let namespace = namespace.into();
        let pool_id = pool_id.into();
        let concurrency = concurrency.max(1);
        let worker_ids: Vec<String> = (0..concurrency).map(|i| format!("{}-{}", pool_id, i)).collect();
        Worker {
            inner: Arc::new(Inner {
                observer: Observer::spawn(namespace.clone(), pool.clone()),
                pool,
                namespace,
                pool_id,
                concurrency,
                idle_worker_ids: Mutex::new(worker_ids.clone()),
                worker_ids,
                ctx,
                job_types: RwLock::new(HashMap::new()),
                middleware: RwLock::new(Chain::default()),
                fetch_script: FetchScript::new(),
                ack_success: AckSuccessScript::new(),
                ack_failure: AckFailureScript::new(),
            }),
        }
    }

    /// This pool's stable worker-slot IDs, for the heartbeater to publish.
    pub fn worker_ids(&self) -> Vec<String> {
        self.inner.worker_ids.clone()
    }

    /// The names of every job type currently registered, for the
    /// heartbeater and the dead-pool reaper's allow-lists.
    pub fn job_names(&self) -> Vec<String> {
        self.inner.job_types.read().unwrap().keys().cloned().collect()
    }

    /// Registers a job type. Replaces any prior registration under the
    /// same name (re-registering is how a long-lived process changes a
    /// job type's options without restarting).
    pub fn register(&self, name: impl Into<String>, handler: JobHandler<Ctx>, options: JobOptions) -> Result<()> {
        options.validate()?;
        let name = name.into();
        let keys = JobNameKeys::new(&self.inner.namespace, &name);
        self.inner.job_types.write().unwrap().insert(
            name,
            RegisteredType {
                keys,
                options,
                handler,
            },
        );
        Ok(())
    }

    /// Adds a middleware layer, run around every job of every type on
    /// this pool. Layers run in the order they were added; see
    /// [`crate::registration::Chain`].
    pub fn use_middleware(&self, mw: Arc<dyn crate::registration::Middleware<Ctx>>) {
        self.inner.middleware.write().unwrap().push(mw);
    }

    /// Starts the pool's fetch loop. Each of `concurrency` worker slots
    /// shares one `FuturesUnordered`-bounded task pool rather than running
    /// its own independent loop, matching the single
    /// `dequeuer_loop`-per-queue shape this is grounded on.
    pub fn start(&self, shutdown: GracefulShutdownConsumer) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (closer_tx, closer_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let handle = tokio::spawn(run(inner, shutdown, closer_rx));
        (closer_tx, handle)
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn pool_id(&self) -> &str {
        &self.inner.pool_id
    }
}

fn default_backoff() -> Box<dyn Backoff + Send> {
    // Fixed fetch-empty backoff staircase: 0, 10, 100,
    // 1000, 5000ms, holding at 5s thereafter rather than giving up.
    Box::new(FixedStaircaseBackoff::new(&[0, 10, 100, 1000, 5000]))
}

struct FixedStaircaseBackoff {
    steps_ms: Vec<u64>,
    idx: usize,
}

impl FixedStaircaseBackoff {
    fn new(steps_ms: &[u64]) -> Self {
        FixedStaircaseBackoff {
            steps_ms: steps_ms.to_vec(),
            idx: 0,
        }
    }
}

impl Backoff for FixedStaircaseBackoff {
    fn reset(&mut self) {
        self.idx = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let step = self.steps_ms[self.idx.min(self.steps_ms.len() - 1)];
        if self.idx < self.steps_ms.len() - 1 {
            self.idx += 1;
        }
        Some(Duration::from_millis(step))
    }
}

/// Writes every registered job type's `max_concurrency` option into its
/// `jobs:<name>:max_concurrency` key before the first fetch, so the fetch
/// script's `GET` of that key (which it only enforces when the value is
/// present and `> 0`) actually sees the configured cap instead of nil.
/// Also clears the key for types registered with no cap, so a restart that
/// drops a job type's `max_concurrency` doesn't leave a stale cap behind.
async fn write_concurrency_controls<Ctx>(inner: &Inner<Ctx>) {
    let entries: Vec<(String, u32)> = {
        let job_types = inner.job_types.read().unwrap();
        job_types.values().map(|t| (t.keys.max_concurrency.clone(), t.options.max_concurrency)).collect()
    };
    if entries.is_empty() {
        return;
    }

    let mut conn = match inner.pool.get().await {
        Ok(conn) => conn,
        Err(err) => {
            error!(error = %err, "could not get a connection to write job concurrency controls");
            return;
        }
    };

    let mut pipe = redis::pipe();
    pipe.atomic();
    for (key, max_concurrency) in &entries {
        if *max_concurrency > 0 {
            pipe.set(key, *max_concurrency);
        } else {
            pipe.del(key);
        }
    }
    let result: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
    if let Err(err) = result {
        error!(error = %err, "failed to write job concurrency controls");
    }
}

async fn run<Ctx>(inner: Arc<Inner<Ctx>>, mut shutdown: GracefulShutdownConsumer, closer_rx: oneshot::Receiver<()>)
where
    Ctx: Clone + Send + Sync + 'static,
{
    write_concurrency_controls(&inner).await;

    let shutdown_fut = shutdown.wait_for_shutdown();
    tokio::pin!(shutdown_fut);
    tokio::pin!(closer_rx);

    let mut active_tasks = FuturesUnordered::<JoinHandle<()>>::new();
    let mut backoff = default_backoff();
    let mut sleep_time = Duration::default();

    loop {
        let wait_for_task = active_tasks.len() >= inner.concurrency;
        let do_backoff = sleep_time > Duration::default();
        if wait_for_task || do_backoff {
            tokio::select! {
                biased;

                _ = &mut shutdown_fut => break,
                _ = &mut closer_rx => break,
                res = active_tasks.select_next_some(), if wait_for_task => {
                    if let Err(e) = res {
                        error!(error = %e, "job task panicked");
                    }
                },
                _ = tokio::time::sleep(sleep_time), if do_backoff => {},
            };
        }

        match fetch_one(&inner).await {
            Ok(Some(job)) => {
                backoff.reset();
                sleep_time = Duration::default();
                // Safe: `wait_for_task` above guarantees fewer than
                // `concurrency` tasks are currently in flight, and there
                // are exactly `concurrency` worker IDs.
                let worker_id = inner.acquire_worker_id();
                active_tasks.push(tokio::spawn(run_job(inner.clone(), job, worker_id)));
            }
            Ok(None) => {
                sleep_time = backoff.next_backoff().unwrap_or(Duration::from_secs(5));
            }
            Err(e) => {
                error!(error = %e, "error fetching job");
                sleep_time = backoff.next_backoff().unwrap_or(Duration::from_secs(5));
            }
        }

        tokio::select! {
            biased;
            r = active_tasks.next() => {
                if let Some(Err(e)) = r {
                    error!(error = %e, "job task panicked");
                }
            }
            _ = ready(()) => {}
        };
    }

    while active_tasks.next().await.is_some() {}
}

async fn fetch_one<Ctx>(inner: &Inner<Ctx>) -> Result<Option<Job>>
where
    Ctx: Clone + Send + Sync + 'static,
{
    let candidates: Vec<(String, u32)> = {
        let job_types = inner.job_types.read().unwrap();
        job_types.iter().map(|(name, t)| (name.clone(), t.options.priority)).collect()
    };
    if candidates.is_empty() {
        return Ok(None);
    }

    for name in weighted_order(candidates) {
        let keys = {
            let job_types = inner.job_types.read().unwrap();
            match job_types.get(&name) {
                Some(t) => t.keys.clone(),
                None => continue,
            }
        };
        let in_progress = keys.in_progress(&inner.pool_id);
        let raw = inner
            .fetch_script
            .run(
                &inner.pool,
                &keys.ready,
                &keys.paused,
                &keys.lock,
                &keys.lock_info,
                &keys.max_concurrency,
                &in_progress,
                &inner.pool_id,
            )
            .await?;

        if let Some(raw) = raw {
            let mut job = Job::from_payload(raw, keys.ready.clone(), in_progress, keys.lock.clone(), keys.lock_info.clone())?;
            if job.unique {
                release_unique_lock(inner, &mut job).await;
            }
            return Ok(Some(job));
        }
    }

    Ok(None)
}

/// Right after a unique job is dequeued, atomically read
/// and delete its uniqueness lock — releasing it is the worker's job, not
/// the eventual success/failure ack's. If the lock's value is a newer
/// payload (a duplicate `EnqueueUnique` call overwrote it with fresher args
/// before this job was picked up), that payload's args win over the ones
/// this job was dequeued with; the bare placeholder `"1"` some producers
/// still write is left as-is.
async fn release_unique_lock<Ctx>(inner: &Inner<Ctx>, job: &mut Job) {
    let unique_key = keys::unique(&inner.namespace, &crate::fingerprint::fingerprint(&job.name, &job.args, job.unique_key.as_deref()));
    let mut conn = match inner.pool.get().await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(job = %job, error = %err, "could not get a connection to release unique lock");
            return;
        }
    };
    let stored: Option<Vec<u8>> = match redis::cmd("GETDEL").arg(&unique_key).query_async(&mut conn).await {
        Ok(stored) => stored,
        Err(err) => {
            warn!(job = %job, error = %err, "failed to release unique lock");
            return;
        }
    };
    let Some(stored) = stored else { return };
    if stored == b"1" {
        return;
    }
    match serde_json::from_slice::<Job>(&stored) {
        Ok(newer) => job.args = newer.args,
        Err(err) => debug!(job = %job, error = %err, "stored unique payload was not a job; keeping dequeued args"),
    }
}

async fn run_job<Ctx>(inner: Arc<Inner<Ctx>>, mut job: Job, worker_id: String)
where
    Ctx: Clone + Send + Sync + 'static,
{
    let handle = inner.observer.start(worker_id.clone(), &job.id, &job.name, &job.args);
    job.attach_observer(handle);

    let (options, handler) = {
        let job_types = inner.job_types.read().unwrap();
        match job_types.get(&job.name) {
            Some(t) => (t.options.clone(), t.handler.clone()),
            None => {
                warn!(job = %job, "fetched a job for a type that is no longer registered");
                inner.observer.finish(job.observer_handle().expect("observer handle attached above"));
                inner.release_worker_id(worker_id);
                return;
            }
        }
    };

    let ctx = inner.ctx.clone();
    let middleware = inner.middleware.read().unwrap().clone();
    let raw_payload = job.raw.clone();

    let outcome = AssertUnwindSafe(middleware.run(ctx, &mut job, &handler)).catch_unwind().await;

    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            warn!(job = %job, panic = %message, "job handler panicked");
            Err(Error::HandlerPanicked(message))
        }
    };

    match result {
        Ok(()) => ack_success(&inner, &job, &raw_payload).await,
        Err(err) => ack_failure(&inner, &mut job, &raw_payload, &options, err).await,
    }

    if let Some(handle) = job.observer_handle() {
        inner.observer.finish(handle);
    }
    inner.release_worker_id(worker_id);
}

async fn ack_success<Ctx>(inner: &Inner<Ctx>, job: &Job, raw_payload: &[u8]) {
    let result = inner
        .ack_success
        .run(&inner.pool, &job.in_progress_list, &job.lock_key, &job.lock_info_key, raw_payload, &inner.pool_id)
        .await;
    if let Err(e) = result {
        error!(job = %job, error = %e, "failed to ack successful job");
    } else {
        debug!(job = %job, "job completed");
    }
}

async fn ack_failure<Ctx>(inner: &Inner<Ctx>, job: &mut Job, raw_payload: &[u8], options: &JobOptions, err: Error) {
    let now = now_epoch_seconds();
    job.mark_failed(&err.to_string(), now);

    let exhausted = job.fails >= options.max_fails;
    let destination = if !exhausted {
        AckFailureDestination::Retry
    } else if options.skip_dead {
        AckFailureDestination::Discard
    } else {
        AckFailureDestination::Dead
    };
    let score = if exhausted { now } else { now + (options.backoff)(job) as i64 };

    let updated_payload = match job.serialize() {
        Ok(payload) => payload,
        Err(e) => {
            error!(job = %job, error = %e, "failed to serialize job for ack");
            return;
        }
    };

    let result = inner
        .ack_failure
        .run(
            &inner.pool,
            &job.in_progress_list,
            &job.lock_key,
            &job.lock_info_key,
            &keys::retry(&inner.namespace),
            &keys::dead(&inner.namespace),
            raw_payload,
            &updated_payload,
            &inner.pool_id,
            destination,
            score,
        )
        .await;
    if let Err(e) = result {
        error!(job = %job, error = %e, "failed to ack failed job");
    } else {
        warn!(job = %job, fails = job.fails, destination = ?destination, "job failed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
