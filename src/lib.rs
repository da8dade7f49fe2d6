//! Facade crate: re-exports the pieces most callers need so that an
//! embedding application can depend on `taskloom` alone rather than reaching
//! into the individual workspace crates directly.

pub mod tracing_config;

pub use taskloom_core as core;
pub use taskloom_core::{
    client, enqueue, job, pool, Enqueuer, Error, Job, JobId, JobOptions, Result, WorkerPool,
};
pub use taskloom_shutdown as shutdown;
pub use taskloom_shutdown::{GracefulShutdown, GracefulShutdownConsumer};
pub use taskloom_store as store;
pub use taskloom_store::RedisPool;
