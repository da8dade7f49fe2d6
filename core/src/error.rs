use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] taskloom_store::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] cron::error::Error),

    /// A handler returned an error. Never surfaced to producers; the worker
    /// translates this into a retry-or-dead transition.
    #[error("job handler returned an error: {0}")]
    HandlerReturned(anyhow::Error),

    /// A handler panicked. Never surfaced to producers, and never tears down
    /// the worker that caught it.
    #[error("job handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("invalid job type configuration: {0}")]
    InvalidJobType(String),

    /// Registration (`job`, `middleware`, `periodically_enqueue`) happens
    /// only before `WorkerPool::start`, which treats it as a
    /// "pre-start only" surface.
    #[error("worker pool is already started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, Error>;
