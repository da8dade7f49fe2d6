//! Job-type registration and handler/middleware dispatch.
//!
//! Reflection-based context binding (inspecting an arbitrary user type at
//! registration time to decide how to call a handler) is a convenience, not
//! a core requirement, so this crate uses a compile-time tagged variant
//! instead. `JobHandler<Ctx>` is that variant: a job type is either
//! context-free (`Generic`) or bound to the pool's context type
//! (`WithContext`), chosen at registration time, with no runtime type
//! inspection anywhere.

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use rand::Rng;

use crate::{error::Result, job::Job};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler or middleware layer returns. Deliberately `anyhow`
/// rather than this crate's own `Error`: handler bodies live in the
/// application, not here, and shouldn't need to construct one of our
/// variants just to fail. [`crate::worker`] wraps whatever comes back in
/// `Error::HandlerReturned` before deciding retry-or-dead.
pub type HandlerResult = anyhow::Result<()>;

#[async_trait]
pub trait GenericHandler: Send + Sync {
    async fn call(&self, job: &mut Job) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> GenericHandler for F
where
    F: Fn(&mut Job) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, job: &mut Job) -> HandlerResult {
        self(job).await
    }
}

#[async_trait]
pub trait ContextHandler<Ctx>: Send + Sync {
    async fn call(&self, ctx: Ctx, job: &mut Job) -> HandlerResult;
}

#[async_trait]
impl<Ctx, F, Fut> ContextHandler<Ctx> for F
where
    Ctx: Send + 'static,
    F: Fn(Ctx, &mut Job) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, ctx: Ctx, job: &mut Job) -> HandlerResult {
        self(ctx, job).await
    }
}

/// A registered job's handler, tagged by whether it needs the pool's
/// context value. Constructed once at registration and never inspected at
/// runtime beyond this match.
#[derive(Clone)]
pub enum JobHandler<Ctx> {
    Generic(Arc<dyn GenericHandler>),
    WithContext(Arc<dyn ContextHandler<Ctx>>),
}

impl<Ctx: Send + 'static> JobHandler<Ctx> {
    pub(crate) async fn invoke(&self, ctx: Ctx, job: &mut Job) -> HandlerResult {
        match self {
            JobHandler::Generic(h) => h.call(job).await,
            JobHandler::WithContext(h) => h.call(ctx, job).await,
        }
    }
}

/// Computes seconds-to-wait before retrying a failed job, from its
/// (post-increment) fail count: a fast-growing curve with jitter so that
/// many simultaneously-failing jobs don't retry in lockstep.
pub fn default_backoff(job: &Job) -> u64 {
    let fails = job.fails as u64;
    let jitter = rand::thread_rng().gen_range(0..30) * (fails + 1);
    fails.pow(4) + 15 + jitter
}

pub type BackoffFn = Arc<dyn Fn(&Job) -> u64 + Send + Sync>;

/// Per-job-type configuration.
#[derive(Clone)]
pub struct JobOptions {
    pub priority: u32,
    pub max_fails: u32,
    pub skip_dead: bool,
    pub max_concurrency: u32,
    pub backoff: BackoffFn,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            priority: 1,
            max_fails: 4,
            skip_dead: false,
            max_concurrency: 0,
            backoff: Arc::new(default_backoff),
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=100_000).contains(&self.priority) {
            return Err(crate::error::Error::InvalidJobType(format!(
                "priority must be in 1..=100000, got {}",
                self.priority
            )));
        }
        Ok(())
    }
}

/// Continuation passed to a middleware layer. Calling it runs the remaining
/// middleware and, eventually, the job's handler.
pub struct Next<'a, Ctx> {
    chain: &'a [Arc<dyn Middleware<Ctx>>],
    handler: &'a JobHandler<Ctx>,
}

impl<'a, Ctx: Clone + Send + 'static> Next<'a, Ctx> {
    pub fn call(self, ctx: Ctx, job: &'a mut Job) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((mw, rest)) => {
                    mw.call(
                        ctx.clone(),
                        job,
                        Next {
                            chain: rest,
                            handler: self.handler,
                        },
                    )
                    .await
                }
                None => self.handler.invoke(ctx, job).await,
            }
        })
    }
}

#[async_trait]
pub trait Middleware<Ctx>: Send + Sync {
    async fn call(&self, ctx: Ctx, job: &mut Job, next: Next<'_, Ctx>) -> HandlerResult;
}

/// An ordered list of middleware, run around every job of every type
/// registered on a pool. `Chain::run` invokes middleware[0], which chooses
/// whether to call `next` and thereby continue the chain.
#[derive(Clone)]
pub struct Chain<Ctx> {
    middleware: Vec<Arc<dyn Middleware<Ctx>>>,
}

impl<Ctx> Default for Chain<Ctx> {
    fn default() -> Self {
        Chain {
            middleware: Vec::new(),
        }
    }
}

impl<Ctx: Clone + Send + 'static> Chain<Ctx> {
    pub fn push(&mut self, mw: Arc<dyn Middleware<Ctx>>) {
        self.middleware.push(mw);
    }

    pub async fn run(&self, ctx: Ctx, job: &mut Job, handler: &JobHandler<Ctx>) -> Result<()> {
        let next = Next {
            chain: &self.middleware,
            handler,
        };
        next.call(ctx, job).await.map_err(crate::error::Error::HandlerReturned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Ctx;

    struct CountingMiddleware(Arc<AtomicUsize>);

    #[async_trait]
    impl Middleware<Ctx> for CountingMiddleware {
        async fn call(&self, ctx: Ctx, job: &mut Job, next: Next<'_, Ctx>) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.call(ctx, job).await
        }
    }

    struct ShortCircuitMiddleware;

    #[async_trait]
    impl Middleware<Ctx> for ShortCircuitMiddleware {
        async fn call(&self, _ctx: Ctx, _job: &mut Job, _next: Next<'_, Ctx>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn chain_runs_middleware_then_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain: Chain<Ctx> = Chain::default();
        chain.push(Arc::new(CountingMiddleware(calls.clone())));
        chain.push(Arc::new(CountingMiddleware(calls.clone())));

        let handler_calls = Arc::new(AtomicUsize::new(0));
        let hc = handler_calls.clone();
        let handler = JobHandler::Generic(Arc::new(move |_job: &mut Job| {
            let hc = hc.clone();
            async move {
                hc.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        let mut job = Job::new("t", Map::new(), 0);
        chain.run(Ctx, &mut job, &handler).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain: Chain<Ctx> = Chain::default();
        chain.push(Arc::new(ShortCircuitMiddleware));
        chain.push(Arc::new(CountingMiddleware(calls.clone())));

        let handler = JobHandler::Generic(Arc::new(|_job: &mut Job| async { Ok(()) }));
        let mut job = Job::new("t", Map::new(), 0);
        chain.run(Ctx, &mut job, &handler).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0, "short-circuited middleware should not run later layers");
    }

    #[test]
    fn default_backoff_grows_with_fails() {
        let mut job = Job::new("t", Map::new(), 0);
        job.fails = 0;
        let b0 = default_backoff(&job);
        job.fails = 3;
        let b3 = default_backoff(&job);
        assert!(b3 > b0);
    }

    #[test]
    fn options_validate_rejects_out_of_range_priority() {
        let mut opts = JobOptions {
            priority: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
        opts.priority = 100_001;
        assert!(opts.validate().is_err());
        opts.priority = 1;
        assert!(opts.validate().is_ok());
    }
}
