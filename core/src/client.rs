//! Read-only inspection API over the same key layout the rest of the
//! crate writes, plus the two dead-job write operations an operator needs
//! to act on what they see. No UI ships here, but monitoring is a
//! first-class consumer of a job queue, so the read side has to exist for
//! the rest of this crate to be useful at all.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::job::Job;
use crate::keys;
use taskloom_store::RedisPool;

#[derive(Debug, Clone, Default)]
pub struct WorkerPoolHeartbeat {
    pub pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: u32,
    pub host: String,
    pub pid: u32,
    pub worker_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerObservation {
    pub worker_id: String,
    pub is_busy: bool,
    pub job_name: String,
    pub job_id: String,
    pub started_at: i64,
    pub args: Map<String, Value>,
    pub checkin: Option<String>,
    pub checkin_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub run_at: i64,
    pub job: Job,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RetryJob {
    pub retry_at: i64,
    pub job: Job,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeadJob {
    pub died_at: i64,
    pub job: Job,
    pub payload: Vec<u8>,
}

/// A read-mostly client over a namespace's keyspace. Cheap to construct;
/// holds nothing but a pool handle and the namespace string.
#[derive(Clone)]
pub struct Client {
    pool: RedisPool,
    namespace: String,
}

impl Client {
    pub fn new(pool: RedisPool, namespace: impl Into<String>) -> Client {
        Client {
            pool,
            namespace: namespace.into(),
        }
    }

    /// One heartbeat per pool ID currently in `worker_pools`, including
    /// pools whose heartbeat hash has already expired or been removed
    /// (those come back with every field at its zero value) — deliberately
    /// not filtered out: an empty heartbeat next to a live `worker_pools`
    /// membership is itself a signal worth seeing.
    pub async fn worker_pool_heartbeats(&self) -> Result<Vec<WorkerPoolHeartbeat>> {
        let mut conn = self.pool.get().await?;
        let worker_pools_key = keys::worker_pools(&self.namespace);
        let mut pool_ids: Vec<String> = redis::cmd("SMEMBERS").arg(&worker_pools_key).query_async(&mut conn).await?;
        pool_ids.sort();

        let mut heartbeats = Vec::with_capacity(pool_ids.len());
        for pool_id in pool_ids {
            let heartbeat_key = keys::worker_pool_heartbeat(&self.namespace, &pool_id);
            let fields: HashMap<String, String> = redis::cmd("HGETALL").arg(&heartbeat_key).query_async(&mut conn).await?;

            let mut job_names: Vec<String> = fields
                .get("job_names")
                .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default();
            job_names.sort();
            let mut worker_ids: Vec<String> = fields
                .get("worker_ids")
                .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default();
            worker_ids.sort();

            heartbeats.push(WorkerPoolHeartbeat {
                pool_id,
                started_at: fields.get("started_at").and_then(|v| v.parse().ok()).unwrap_or(0),
                heartbeat_at: fields.get("heartbeat_at").and_then(|v| v.parse().ok()).unwrap_or(0),
                job_names,
                concurrency: fields.get("concurrency").and_then(|v| v.parse().ok()).unwrap_or(0),
                host: fields.get("host").cloned().unwrap_or_default(),
                pid: fields.get("pid").and_then(|v| v.parse().ok()).unwrap_or(0),
                worker_ids,
            });
        }
        Ok(heartbeats)
    }

    /// One observation per worker ID across every heartbeat returned by
    /// [`Client::worker_pool_heartbeats`]. A worker with no observation
    /// hash (idle, or its job already acked) comes back with `is_busy:
    /// false` and every other field blank.
    pub async fn worker_observations(&self) -> Result<Vec<WorkerObservation>> {
        let heartbeats = self.worker_pool_heartbeats().await?;
        let mut conn = self.pool.get().await?;

        let mut observations = Vec::new();
        for heartbeat in &heartbeats {
            for worker_id in &heartbeat.worker_ids {
                let key = keys::worker_observation(&self.namespace, worker_id);
                let fields: HashMap<String, String> = redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?;

                let is_busy = !fields.is_empty();
                let args = fields
                    .get("args")
                    .and_then(|v| serde_json::from_str::<Map<String, Value>>(v).ok())
                    .unwrap_or_default();

                observations.push(WorkerObservation {
                    worker_id: worker_id.clone(),
                    is_busy,
                    job_name: fields.get("job_name").cloned().unwrap_or_default(),
                    job_id: fields.get("job_id").cloned().unwrap_or_default(),
                    started_at: fields.get("started_at").and_then(|v| v.parse().ok()).unwrap_or(0),
                    args,
                    checkin: fields.get("checkin").cloned(),
                    checkin_at: fields.get("checkin_at").and_then(|v| v.parse().ok()),
                });
            }
        }
        Ok(observations)
    }

    /// Every job name that has ever been enqueued in this namespace,
    /// sorted for stable display.
    pub async fn queue_names(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let key = keys::known_jobs(&self.namespace);
        let mut names: Vec<String> = redis::cmd("SMEMBERS").arg(&key).query_async(&mut conn).await?;
        names.sort();
        Ok(names)
    }

    /// The number of ready (not yet dequeued) jobs of one job name.
    pub async fn queue_size(&self, job_name: &str) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let key = keys::jobs(&self.namespace, job_name);
        let len: i64 = redis::cmd("LLEN").arg(&key).query_async(&mut conn).await?;
        Ok(len)
    }

    pub async fn scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let key = keys::scheduled(&self.namespace);
        let scored = self.zrange_with_scores(&key).await?;
        scored
            .into_iter()
            .map(|(payload, score)| {
                let job = Job::from_payload(payload.clone(), String::new(), String::new(), String::new(), String::new())?;
                Ok(ScheduledJob { run_at: score, job, payload })
            })
            .collect()
    }

    pub async fn retry_jobs(&self) -> Result<Vec<RetryJob>> {
        let key = keys::retry(&self.namespace);
        let scored = self.zrange_with_scores(&key).await?;
        scored
            .into_iter()
            .map(|(payload, score)| {
                let job = Job::from_payload(payload.clone(), String::new(), String::new(), String::new(), String::new())?;
                Ok(RetryJob { retry_at: score, job, payload })
            })
            .collect()
    }

    pub async fn dead_jobs(&self) -> Result<Vec<DeadJob>> {
        let key = keys::dead(&self.namespace);
        let scored = self.zrange_with_scores(&key).await?;
        scored
            .into_iter()
            .map(|(payload, score)| {
                let job = Job::from_payload(payload.clone(), String::new(), String::new(), String::new(), String::new())?;
                Ok(DeadJob { died_at: score, job, payload })
            })
            .collect()
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(Vec<u8>, i64)>> {
        let mut conn = self.pool.get().await?;
        let raw: Vec<(Vec<u8>, i64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(raw)
    }

    /// Moves a dead job back onto its job type's ready list, at the head
    /// — an operator retrying it gets first priority, the same as a
    /// crash-recovered job. `payload` must be the exact bytes returned by
    /// [`Client::dead_jobs`]; the pipeline removes it from the dead set by
    /// value.
    pub async fn requeue_dead_job(&self, payload: &[u8]) -> Result<bool> {
        let job: Job = serde_json::from_slice(payload)?;
        let dead_key = keys::dead(&self.namespace);
        let ready_key = keys::jobs(&self.namespace, &job.name);

        let mut conn = self.pool.get().await?;
        let existed: bool = redis::cmd("ZREM")
            .arg(&dead_key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map(|n: i64| n > 0)?;
        if existed {
            redis::cmd("LPUSH").arg(&ready_key).arg(payload).query_async(&mut conn).await?;
        }
        Ok(existed)
    }

    /// Permanently discards a dead job. `payload` must be the exact bytes
    /// returned by [`Client::dead_jobs`].
    pub async fn delete_dead_job(&self, payload: &[u8]) -> Result<bool> {
        let dead_key = keys::dead(&self.namespace);
        let mut conn = self.pool.get().await?;
        let removed: i64 = redis::cmd("ZREM").arg(&dead_key).arg(payload).query_async(&mut conn).await?;
        Ok(removed > 0)
    }
}
