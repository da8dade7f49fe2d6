//! Atomic multi-key Redis operations, one script per logical operation —
//! the same layout `queues/*.rs` uses for its own scripts.
//! Every script here is re-entrant and idempotent with respect to its own
//! preconditions: callers that race on the same key either both no-op or
//! serialize cleanly through Redis's single-threaded script execution.

pub mod ack;
pub mod enqueue;
pub mod fetch;
pub mod reap;
pub mod requeue;
