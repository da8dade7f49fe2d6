use std::{env, ops::Deref, sync::Arc};

use crate::error::{Error, Result};

/// A cloneable handle to a Redis connection pool, shared by every worker
/// pool, enqueuer, and background task that talks to the store.
#[derive(Clone)]
pub struct RedisPool(Arc<RedisPoolInner>);

struct RedisPoolInner {
    pool: deadpool_redis::Pool,
    key_prefix: Option<String>,
}

impl Deref for RedisPool {
    type Target = deadpool_redis::Pool;

    fn deref(&self) -> &Self::Target {
        &self.0.pool
    }
}

impl RedisPool {
    /// Build a pool from an explicit connection string, or from `REDIS_URL`
    /// when `connection` is `None`. `key_prefix` is carried alongside the
    /// pool for callers that want to namespace keys below the crate's own
    /// `<namespace>:` prefix (e.g. to share one Redis instance among several
    /// unrelated namespaces).
    pub fn new(connection: Option<String>, key_prefix: Option<String>) -> Result<RedisPool> {
        let redis_url = connection
            .or_else(|| env::var("REDIS_URL").ok())
            .ok_or_else(|| Error::Config("REDIS_URL is required".into()))?;

        let pool = deadpool_redis::Config {
            url: Some(redis_url),
            connection: None,
            pool: None,
        }
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

        Ok(RedisPool(Arc::new(RedisPoolInner { pool, key_prefix })))
    }

    pub fn pool(&self) -> &deadpool_redis::Pool {
        &self.0.pool
    }

    pub fn key_prefix(&self) -> Option<&str> {
        self.0.key_prefix.as_deref()
    }

    pub async fn get(&self) -> Result<deadpool_redis::Connection> {
        self.0.pool.get().await.map_err(Error::from)
    }
}
