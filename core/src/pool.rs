//! The top-level aggregate: registration surface plus the lifecycle that
//! wires a [`crate::worker::Worker`] together with the four background
//! tasks (heartbeater, scheduled/retry requeuers, dead-pool reaper,
//! periodic enqueuer) that make a standalone worker share a namespace
//! with its peers.
//!
//! One `(oneshot::Sender<()>, JoinHandle<()>)` pair per background task,
//! joined on stop — five children plus the worker loop itself, started and
//! stopped in order: register → start children → workers; stop workers →
//! stop children → deregister (the heartbeater's own stop handler does the
//! deregistration).

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use taskloom_shutdown::GracefulShutdownConsumer;
use taskloom_store::RedisPool;

use crate::enqueue::Enqueuer;
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatInfo, Heartbeater};
use crate::job::{Job, JobId};
use crate::keys;
use crate::reap::DeadPoolReaper;
use crate::periodic::{PeriodicEnqueuer, PeriodicJob};
use crate::registration::{HandlerResult, JobHandler, JobOptions, Middleware};
use crate::requeue::Requeuer;
use crate::time::now_epoch_seconds;
use crate::worker::Worker;

type TaskHandle = (oneshot::Sender<()>, JoinHandle<()>);

struct PoolTasks {
    /// `None` once [`WorkerPool::drain`] has taken it without a full stop.
    worker: Option<TaskHandle>,
    heartbeat: TaskHandle,
    scheduled_requeue: TaskHandle,
    retry_requeue: TaskHandle,
    reaper: TaskHandle,
    periodic: TaskHandle,
}

struct Inner<Ctx> {
    pool: RedisPool,
    namespace: String,
    pool_id: String,
    concurrency: usize,
    started_at: i64,
    worker: Worker<Ctx>,
    enqueuer: Enqueuer,
    periodic_jobs: Mutex<Vec<PeriodicJob>>,
    tasks: Mutex<Option<PoolTasks>>,
}

/// A process-local aggregate of `concurrency` workers sharing one
/// namespace, pool id, handler registry, and set of background tasks.
/// Cloning a `WorkerPool` shares all of that with the clone; `start`,
/// `stop`, and `drain` may be called through any clone.
pub struct WorkerPool<Ctx> {
    inner: Arc<Inner<Ctx>>,
}

impl<Ctx> Clone for WorkerPool<Ctx> {
    fn clone(&self) -> Self {
        WorkerPool {
            inner: self.inner.clone(),
        }
    }
}

impl<Ctx> WorkerPool<Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    /// Builds a pool with a freshly generated 24-hex pool id, not yet
    /// started. `ctx` is the value every context-bound job type's handler
    /// receives.
    pub fn new(pool: RedisPool, namespace: impl Into<String>, concurrency: usize, ctx: Ctx) -> WorkerPool<Ctx> {
        let namespace = namespace.into();
        let pool_id = JobId::generate();
        let worker = Worker::new(pool.clone(), namespace.clone(), pool_id.clone(), concurrency, ctx);
        let enqueuer = Enqueuer::new(pool.clone(), namespace.clone());

        WorkerPool {
            inner: Arc::new(Inner {
                pool,
                namespace,
                pool_id,
                concurrency: concurrency.max(1),
                started_at: now_epoch_seconds(),
                worker,
                enqueuer,
                periodic_jobs: Mutex::new(Vec::new()),
                tasks: Mutex::new(None),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn pool_id(&self) -> &str {
        &self.inner.pool_id
    }

    /// The enqueuer sharing this pool's connection pool and namespace, for
    /// producers embedded in the same process as their consumers.
    pub fn enqueuer(&self) -> &Enqueuer {
        &self.inner.enqueuer
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.inner.tasks.lock().unwrap().is_some() {
            Err(Error::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    /// Registers a context-free job type at default [`JobOptions`]. Valid
    /// only before [`WorkerPool::start`].
    pub fn job<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&mut Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.job_with_options(name, JobOptions::default(), handler)
    }

    /// As [`WorkerPool::job`], with explicit [`JobOptions`].
    pub fn job_with_options<F, Fut>(&self, name: impl Into<String>, options: JobOptions, handler: F) -> Result<()>
    where
        F: Fn(&mut Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.ensure_not_started()?;
        self.inner
            .worker
            .register(name, JobHandler::Generic(Arc::new(handler)), options)
    }

    /// Registers a job type whose handler receives this pool's context
    /// value. Valid only before [`WorkerPool::start`].
    pub fn job_with_context<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Ctx, &mut Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.job_with_context_and_options(name, JobOptions::default(), handler)
    }

    /// As [`WorkerPool::job_with_context`], with explicit [`JobOptions`].
    pub fn job_with_context_and_options<F, Fut>(&self, name: impl Into<String>, options: JobOptions, handler: F) -> Result<()>
    where
        F: Fn(Ctx, &mut Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.ensure_not_started()?;
        self.inner
            .worker
            .register(name, JobHandler::WithContext(Arc::new(handler)), options)
    }

    /// Appends a middleware layer run around every job of every type on
    /// this pool, in the order added. Valid only before
    /// [`WorkerPool::start`] in spirit, though nothing currently prevents
    /// a late call from racing a job already in flight; callers should
    /// treat this as pre-start-only.
    pub fn middleware(&self, mw: Arc<dyn Middleware<Ctx>>) {
        self.inner.worker.use_middleware(mw);
    }

    /// Accumulates a `(cron_spec, job_name)` pair, parsed immediately so a
    /// malformed spec fails at registration time rather than silently
    /// doing nothing once the pool starts. Valid only before
    /// [`WorkerPool::start`].
    pub fn periodically_enqueue(&self, cron_spec: impl Into<String>, job_name: impl Into<String>) -> Result<()> {
        self.ensure_not_started()?;
        let job = PeriodicJob::parse(cron_spec, job_name)?;
        self.inner.periodic_jobs.lock().unwrap().push(job);
        Ok(())
    }

    /// Starts every background task, then the worker fetch loop. Returns
    /// [`Error::AlreadyStarted`] if already running.
    pub fn start(&self, shutdown: GracefulShutdownConsumer) -> Result<()> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        if tasks.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let job_names = self.inner.worker.job_names();

        let heartbeat_info = HeartbeatInfo {
            pool_id: self.inner.pool_id.clone(),
            started_at: self.inner.started_at,
            job_names: job_names.clone(),
            concurrency: self.inner.concurrency,
            worker_ids: self.inner.worker.worker_ids(),
        };
        let heartbeater = Heartbeater::new(self.inner.pool.clone(), self.inner.namespace.clone(), heartbeat_info);

        let scheduled_requeuer = Requeuer::new(
            self.inner.pool.clone(),
            self.inner.namespace.clone(),
            keys::scheduled(&self.inner.namespace),
            job_names.clone(),
        );
        let retry_requeuer = Requeuer::new(
            self.inner.pool.clone(),
            self.inner.namespace.clone(),
            keys::retry(&self.inner.namespace),
            job_names.clone(),
        );
        let reaper = DeadPoolReaper::new(self.inner.pool.clone(), self.inner.namespace.clone(), job_names.clone());

        let periodic_jobs = std::mem::take(&mut *self.inner.periodic_jobs.lock().unwrap());
        let periodic_enqueuer = PeriodicEnqueuer::new(
            self.inner.pool.clone(),
            self.inner.namespace.clone(),
            self.inner.enqueuer.clone(),
            periodic_jobs,
        );

        let heartbeat = heartbeater.start(shutdown.clone());
        let scheduled_requeue = scheduled_requeuer.start(shutdown.clone());
        let retry_requeue = retry_requeuer.start(shutdown.clone());
        let reaper_task = reaper.start(shutdown.clone());
        let periodic = periodic_enqueuer.start(shutdown.clone());
        let worker = self.inner.worker.start(shutdown);

        *tasks = Some(PoolTasks {
            worker: Some(worker),
            heartbeat,
            scheduled_requeue,
            retry_requeue,
            reaper: reaper_task,
            periodic,
        });

        info!(
            pool_id = %self.inner.pool_id,
            namespace = %self.inner.namespace,
            job_types = job_names.len(),
            "worker pool started"
        );
        Ok(())
    }

    /// Stops fetching new work and waits until every in-flight job this
    /// pool's workers picked up has been acked, without touching the
    /// background tasks. A drained pool cannot resume fetching; it must
    /// be recreated to run again. A no-op if the pool was never started
    /// or has already been stopped/drained.
    pub async fn drain(&self) {
        let worker_task = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            match tasks.as_mut() {
                Some(tasks) => tasks.worker.take(),
                None => None,
            }
        };
        if let Some((closer, handle)) = worker_task {
            let _ = closer.send(());
            let _ = handle.await;
        }
    }

    /// Stops the worker loop (draining in-flight jobs first, same as
    /// [`WorkerPool::drain`]), then every background task in turn, then
    /// returns. The heartbeater's own stop handler removes this pool from
    /// `worker_pools` and deletes its heartbeat hash, so a cleanly stopped
    /// pool is never mistaken for a crashed one. A no-op if the pool was
    /// never started or has already been stopped.
    pub async fn stop(&self) {
        let tasks = self.inner.tasks.lock().unwrap().take();
        let Some(tasks) = tasks else { return };

        if let Some((closer, handle)) = tasks.worker {
            let _ = closer.send(());
            let _ = handle.await;
        }

        for (closer, handle) in [tasks.heartbeat, tasks.scheduled_requeue, tasks.retry_requeue, tasks.reaper, tasks.periodic] {
            let _ = closer.send(());
            let _ = handle.await;
        }

        info!(pool_id = %self.inner.pool_id, "worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[derive(Clone, Default)]
    struct Ctx;

    fn test_pool() -> WorkerPool<Ctx> {
        let pool = RedisPool::new(Some("redis://127.0.0.1:0/0".into()), None).expect("pool construction is lazy");
        WorkerPool::new(pool, "pooltest", 2, Ctx)
    }

    #[test]
    fn registration_before_start_succeeds() {
        let pool = test_pool();
        pool.job("a", |_job: &mut Job| async { Ok(()) }).unwrap();
        pool.job_with_context("b", |_ctx: Ctx, _job: &mut Job| async { Ok(()) }).unwrap();
        pool.periodically_enqueue("0 0 * * * *", "a").unwrap();
    }

    #[tokio::test]
    async fn rejects_registration_after_start_is_simulated() {
        let pool = test_pool();
        // Simulate a started pool without actually spawning tasks, by
        // directly occupying the tasks slot the way `start` would.
        *pool.inner.tasks.lock().unwrap() = Some(PoolTasks {
            worker: None,
            heartbeat: dummy_task(),
            scheduled_requeue: dummy_task(),
            retry_requeue: dummy_task(),
            reaper: dummy_task(),
            periodic: dummy_task(),
        });

        let err = pool.job("a", |_job: &mut Job| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));

        let err = pool.periodically_enqueue("0 0 * * * *", "a").unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
    }

    fn dummy_task() -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _ = rx.await;
        });
        (tx, handle)
    }

    #[test]
    fn job_without_args_compiles_with_default_options() {
        let pool = test_pool();
        let opts = JobOptions {
            priority: 50,
            max_fails: 2,
            ..Default::default()
        };
        pool.job_with_options("c", opts, |job: &mut Job| async move {
            let _ = &job.args;
            Ok::<(), anyhow::Error>(())
        })
        .unwrap();
    }

    #[test]
    fn known_jobs_are_empty_before_registration() {
        let pool = test_pool();
        assert!(pool.inner.worker.job_names().is_empty());
        let _ = Map::<String, serde_json::Value>::new();
    }
}
