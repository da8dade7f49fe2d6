//! Cron-driven job materialization.
//!
//! Each `(cron_spec, job_name)` pair registered via
//! `crate::pool::WorkerPool::periodically_enqueue` is parsed into a
//! `cron::Schedule` once, at pool construction (grounded on `tasks/periodic.rs`'s
//! `cron::Schedule::from_str(...).upcoming(Utc)` usage — the ecosystem
//! crate the pack reaches for, standing in for the reference
//! implementation's `robfig/cron`). Every 2 minutes, after checking that no
//! other pool in the namespace has already done so this window, every
//! firing due in `[now, now + 2h]` is materialized with a deterministic
//! per-firing unique fingerprint so that concurrent pools converge on the
//! same set without duplicating entries.

use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use cron::Schedule;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taskloom_shutdown::GracefulShutdownConsumer;
use taskloom_store::RedisPool;

use crate::enqueue::{EnqueueOptions, Enqueuer};
use crate::error::Result;
use crate::keys;
use crate::time::now_epoch_seconds;

const TICK_INTERVAL: Duration = Duration::from_secs(2 * 60);
const STARTUP_JITTER_SECONDS_MAX: u64 = 10;
/// The window a single pass materializes fires into, and also the guard
/// window checked against `last_periodic_enqueue`.
const GUARD_WINDOW_SECONDS: i64 = 2 * 60;
const MATERIALIZE_WINDOW_SECONDS: i64 = 2 * 60 * 60;

/// One `(spec, job_name)` pair, parsed once.
pub struct PeriodicJob {
    spec: String,
    job_name: String,
    schedule: Schedule,
}

impl PeriodicJob {
    pub fn parse(spec: impl Into<String>, job_name: impl Into<String>) -> Result<PeriodicJob> {
        let spec = spec.into();
        let schedule = Schedule::from_str(&spec)?;
        Ok(PeriodicJob {
            spec,
            job_name: job_name.into(),
            schedule,
        })
    }
}

pub struct PeriodicEnqueuer {
    pool: RedisPool,
    namespace: String,
    enqueuer: Enqueuer,
    jobs: Vec<PeriodicJob>,
}

impl PeriodicEnqueuer {
    pub fn new(pool: RedisPool, namespace: impl Into<String>, enqueuer: Enqueuer, jobs: Vec<PeriodicJob>) -> PeriodicEnqueuer {
        PeriodicEnqueuer {
            pool,
            namespace: namespace.into(),
            enqueuer,
            jobs,
        }
    }

    /// Returns whether this pool should proceed: true if no pool has
    /// enqueued within the guard window (or the key has never been set).
    /// Not a lock — a pool whose wall clock has drifted past the window
    /// can race with another and both pass; the deterministic per-firing
    /// fingerprint keeps that race harmless rather than duplicative.
    async fn should_enqueue(&self) -> taskloom_store::Result<bool> {
        let key = keys::last_periodic_enqueue(&self.namespace);
        let mut conn = self.pool.get().await?;
        let last: Option<i64> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        match last {
            Some(last) => Ok(now_epoch_seconds() - last >= GUARD_WINDOW_SECONDS),
            None => Ok(true),
        }
    }

    async fn mark_enqueued(&self) -> taskloom_store::Result<()> {
        let key = keys::last_periodic_enqueue(&self.namespace);
        let mut conn = self.pool.get().await?;
        redis::cmd("SET").arg(&key).arg(now_epoch_seconds()).query_async(&mut conn).await?;
        Ok(())
    }

    async fn materialize_due_firings(&self) {
        if !matches!(self.should_enqueue().await, Ok(true)) {
            return;
        }

        let now = now_epoch_seconds();
        let window_end = now + MATERIALIZE_WINDOW_SECONDS;
        let now_dt = match Utc.timestamp_opt(now, 0).single() {
            Some(dt) => dt,
            None => return,
        };

        let mut materialized = 0usize;
        for job in &self.jobs {
            for fire_at in job.schedule.after(&now_dt) {
                let fire_epoch = fire_at.timestamp();
                if fire_epoch > window_end {
                    break;
                }

                let options = EnqueueOptions {
                    unique: true,
                    unique_key: Some(format!("periodic:{}:{}", job.job_name, fire_epoch)),
                    run_at: Some(fire_epoch),
                };
                match self.enqueuer.enqueue_with_options(&job.job_name, serde_json::Map::new(), options).await {
                    Ok(Some(_)) => materialized += 1,
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, job_name = %job.job_name, spec = %job.spec, "failed to materialize a periodic firing"),
                }
            }
        }

        if let Err(err) = self.mark_enqueued().await {
            warn!(error = %err, "failed to update last_periodic_enqueue");
        }

        if materialized > 0 {
            info!(count = materialized, "materialized periodic job firings");
        }
    }

    /// Spawns the 2-minute tick loop, with a small jitter before the
    /// first tick so many pools starting simultaneously don't all check
    /// the guard at once.
    pub fn start(self, mut shutdown: GracefulShutdownConsumer) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            if self.jobs.is_empty() {
                // Nothing registered; still honor shutdown so `stop()` has
                // a task to join.
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => {},
                    _ = &mut stop_rx => {},
                }
                return;
            }

            let startup_jitter = Duration::from_secs(rand::thread_rng().gen_range(0..STARTUP_JITTER_SECONDS_MAX));
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => return,
                _ = &mut stop_rx => return,
                _ = tokio::time::sleep(startup_jitter) => {}
            }

            loop {
                self.materialize_due_firings().await;
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(TICK_INTERVAL) => {}
                }
            }
        });
        (stop_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_five_field_cron_with_seconds_field() {
        // The `cron` crate requires a leading seconds field.
        let job = PeriodicJob::parse("0 0 * * * *", "hourly_report").unwrap();
        assert_eq!(job.job_name, "hourly_report");
    }

    #[test]
    fn rejects_invalid_cron_spec() {
        assert!(PeriodicJob::parse("not a cron spec", "x").is_err());
    }
}
