#![cfg(feature = "test-redis")]

//! End-to-end tests against a real Redis instance (`REDIS_URL`, default
//! `redis://127.0.0.1/`). Each test gets its own randomly-named namespace
//! and cleans up every key it touched afterward, the same shape as the
//! crate's own `run_queue_test` harness used to test a single queue.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};

use taskloom_core::job::Job;
use taskloom_core::pool::WorkerPool;
use taskloom_core::registration::JobOptions;
use taskloom_core::Client;
use taskloom_shutdown::GracefulShutdown;
use taskloom_store::RedisPool;

#[derive(Clone, Default)]
struct Ctx;

async fn run_pool_test<T, Fut>(test: T)
where
    T: FnOnce(RedisPool, String) -> Fut,
    Fut: Future<Output = ()>,
{
    dotenv::dotenv().ok();
    let namespace = format!("taskloom-test-{}", uuid::Uuid::new_v4());
    let pool = RedisPool::new(None, None).expect("creating connection pool");

    test(pool.clone(), namespace.clone()).await;

    let mut conn = pool.get().await.expect("cleanup: acquiring connection");
    let key_pattern = format!("{}:*", namespace);
    let mut cmd = redis::cmd("SCAN");
    let mut iter: redis::AsyncIter<String> = cmd
        .cursor_arg(0)
        .arg("MATCH")
        .arg(&key_pattern)
        .arg("COUNT")
        .arg(100)
        .clone()
        .iter_async(&mut *conn)
        .await
        .expect("cleanup: scanning keyspace");

    let mut del_cmd = redis::cmd("DEL");
    let mut any = false;
    while let Some(key) = iter.next_item().await {
        any = true;
        del_cmd.arg(key);
    }
    if any {
        del_cmd
            .query_async::<_, ()>(&mut conn)
            .await
            .expect("cleanup: deleting keys");
    }
}

/// Spawns `pool`, waits for `condition` to become true (polling every
/// 20ms, up to `timeout`), then stops the pool. Panics if the condition
/// never holds in time.
async fn start_wait_stop<Ctx, F, Fut>(pool: &WorkerPool<Ctx>, shutdown: &GracefulShutdown, timeout: Duration, mut condition: F)
where
    Ctx: Clone + Send + Sync + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    pool.start(shutdown.consumer()).expect("starting pool");

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            pool.stop().await;
            panic!("condition did not become true within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pool.stop().await;
}

#[tokio::test]
async fn enqueue_and_run_to_success() {
    run_pool_test(|redis_pool, namespace| async move {
        let pool: WorkerPool<Ctx> = WorkerPool::new(redis_pool, namespace, 2, Ctx);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        pool.job("greet", move |job: &mut Job| {
            let ran = ran_clone.clone();
            async move {
                assert_eq!(job.args.get("name").and_then(|v| v.as_str()), Some("ada"));
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        let mut args = Map::new();
        args.insert("name".into(), json!("ada"));
        pool.enqueuer().enqueue("greet", args).await.unwrap();

        let shutdown = GracefulShutdown::new();
        start_wait_stop(&pool, &shutdown, Duration::from_secs(5), || {
            let ran = ran.clone();
            async move { ran.load(Ordering::SeqCst) == 1 }
        })
        .await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    })
    .await;
}

#[tokio::test]
async fn failing_job_retries_then_succeeds() {
    run_pool_test(|redis_pool, namespace| async move {
        let pool: WorkerPool<Ctx> = WorkerPool::new(redis_pool, namespace, 1, Ctx);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let options = JobOptions {
            max_fails: 4,
            backoff: Arc::new(|_job| 0),
            ..Default::default()
        };
        pool.job_with_options("flaky", options, move |_job: &mut Job| {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("not yet");
                }
                Ok(())
            }
        })
        .unwrap();

        pool.enqueuer().enqueue("flaky", Map::new()).await.unwrap();

        let shutdown = GracefulShutdown::new();
        start_wait_stop(&pool, &shutdown, Duration::from_secs(10), || {
            let attempts = attempts.clone();
            async move { attempts.load(Ordering::SeqCst) >= 2 }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2, "should have failed once, then succeeded on retry");
    })
    .await;
}

#[tokio::test]
async fn exhausted_retries_land_in_dead_set() {
    run_pool_test(|redis_pool, namespace| async move {
        let pool: WorkerPool<Ctx> = WorkerPool::new(redis_pool.clone(), namespace.clone(), 1, Ctx);
        let options = JobOptions {
            max_fails: 1,
            backoff: Arc::new(|_job| 0),
            ..Default::default()
        };
        pool.job_with_options("always_fails", options, |_job: &mut Job| async { anyhow::bail!("nope") }).unwrap();

        pool.enqueuer().enqueue("always_fails", Map::new()).await.unwrap();

        let client = Client::new(redis_pool, namespace);
        let shutdown = GracefulShutdown::new();
        start_wait_stop(&pool, &shutdown, Duration::from_secs(5), || {
            let client = client.clone();
            async move { client.dead_jobs().await.map(|d| !d.is_empty()).unwrap_or(false) }
        })
        .await;

        let dead = client.dead_jobs().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.name, "always_fails");
        assert_eq!(dead[0].job.fails, 1);

        let requeued = client.requeue_dead_job(&dead[0].payload).await.unwrap();
        assert!(requeued);
        assert!(client.dead_jobs().await.unwrap().is_empty());
        assert_eq!(client.queue_size("always_fails").await.unwrap(), 1);
    })
    .await;
}

#[tokio::test]
async fn duplicate_unique_enqueue_is_suppressed() {
    run_pool_test(|redis_pool, namespace| async move {
        let enqueuer = taskloom_core::Enqueuer::new(redis_pool, namespace);

        let mut args = Map::new();
        args.insert("id".into(), json!(42));
        let first = enqueuer.enqueue_unique("dedup_me", args.clone()).await.unwrap();
        assert!(first.is_some());

        let second = enqueuer.enqueue_unique("dedup_me", args).await.unwrap();
        assert!(second.is_none(), "second unique enqueue with the same args should be suppressed");
    })
    .await;
}

#[tokio::test]
async fn delayed_job_graduates_to_ready_and_runs() {
    run_pool_test(|redis_pool, namespace| async move {
        let pool: WorkerPool<Ctx> = WorkerPool::new(redis_pool, namespace, 1, Ctx);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        pool.job("later", move |_job: &mut Job| {
            let ran = ran_clone.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        pool.enqueuer().enqueue_in("later", 1, Map::new()).await.unwrap();

        let shutdown = GracefulShutdown::new();
        // The requeuer ticks roughly once a second; give it a few ticks of
        // headroom alongside the 1s delay itself.
        start_wait_stop(&pool, &shutdown, Duration::from_secs(8), || {
            let ran = ran.clone();
            async move { ran.load(Ordering::SeqCst) == 1 }
        })
        .await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    })
    .await;
}

#[tokio::test]
async fn max_concurrency_caps_in_flight_jobs_across_the_pool() {
    run_pool_test(|redis_pool, namespace| async move {
        let pool: WorkerPool<Ctx> = WorkerPool::new(redis_pool, namespace, 4, Ctx);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let options = JobOptions {
            max_concurrency: 1,
            ..Default::default()
        };
        let in_flight_clone = in_flight.clone();
        let max_seen_clone = max_seen.clone();
        let completed_clone = completed.clone();
        pool.job_with_options("limited", options, move |_job: &mut Job| {
            let in_flight = in_flight_clone.clone();
            let max_seen = max_seen_clone.clone();
            let completed = completed_clone.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        for _ in 0..5 {
            pool.enqueuer().enqueue("limited", Map::new()).await.unwrap();
        }

        let shutdown = GracefulShutdown::new();
        start_wait_stop(&pool, &shutdown, Duration::from_secs(10), || {
            let completed = completed.clone();
            async move { completed.load(Ordering::SeqCst) == 5 }
        })
        .await;

        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "max_concurrency = 1 should never let two of this job type run at once");
    })
    .await;
}

#[tokio::test]
async fn checkin_is_visible_before_the_job_completes() {
    run_pool_test(|redis_pool, namespace| async move {
        let pool: WorkerPool<Ctx> = WorkerPool::new(redis_pool.clone(), namespace.clone(), 1, Ctx);
        pool.job("slow_checkin", |job: &mut Job| async move {
            job.checkin("progress 50%".to_string());
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .unwrap();

        pool.enqueuer().enqueue("slow_checkin", Map::new()).await.unwrap();

        let shutdown = GracefulShutdown::new();
        pool.start(shutdown.consumer()).unwrap();

        let client = Client::new(redis_pool, namespace);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut saw_checkin = false;
        loop {
            let observations = client.worker_observations().await.unwrap();
            if observations.iter().any(|o| o.job_name == "slow_checkin" && o.checkin.as_deref() == Some("progress 50%")) {
                saw_checkin = true;
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.stop().await;
        assert!(saw_checkin, "checkin should be visible in the worker observation hash before the 100ms job finishes");
    })
    .await;
}

#[tokio::test]
async fn client_reports_heartbeats_for_running_pool() {
    run_pool_test(|redis_pool, namespace| async move {
        let pool: WorkerPool<Ctx> = WorkerPool::new(redis_pool.clone(), namespace.clone(), 2, Ctx);
        pool.job("noop", |_job: &mut Job| async { Ok(()) }).unwrap();

        let shutdown = GracefulShutdown::new();
        pool.start(shutdown.consumer()).unwrap();

        let client = Client::new(redis_pool, namespace);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let heartbeats = client.worker_pool_heartbeats().await.unwrap();
            if heartbeats.iter().any(|h| h.pool_id == pool.pool_id() && h.job_names == vec!["noop".to_string()]) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                pool.stop().await;
                panic!("never saw this pool's heartbeat");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        pool.stop().await;

        // A cleanly stopped pool deregisters itself.
        let heartbeats = client.worker_pool_heartbeats().await.unwrap();
        assert!(!heartbeats.iter().any(|h| h.pool_id == pool.pool_id()));
    })
    .await;
}
