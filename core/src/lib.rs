//! The job-processing engine: producers, workers, and the background
//! tasks that keep scheduled, retried, and crashed jobs moving. The thin
//! facade `taskloom` crate wraps this and re-exports what embedders need.

pub mod client;
pub mod enqueue;
pub mod error;
pub mod fingerprint;
pub mod heartbeat;
pub mod job;
pub mod keys;
mod lua;
pub mod observer;
pub mod periodic;
pub mod pool;
pub mod reap;
pub mod registration;
pub mod requeue;
pub mod sampler;
pub mod time;
pub mod worker;

pub use client::Client;
pub use enqueue::{EnqueueOptions, Enqueuer};
pub use error::{Error, Result};
pub use job::{ArgError, Job, JobId};
pub use pool::WorkerPool;
pub use registration::{GenericHandler, HandlerResult, JobHandler, JobOptions, Middleware};
