//! End-to-end scenarios driving a real [`Pool`] against the in-memory
//! [`FakeJobQueue`], exercising the reservation/retry/recurrence machinery
//! the unit tests in `src/` don't reach.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use wharf_core::{JobQueue, JobStatus, JsonEncoder, Pool, PoolConfig, TypeRegistry};
use wharf_testing::FakeJobQueue;

async fn wait_until<F: Fn() -> bool>(timeout: Duration, poll: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

#[tokio::test]
async fn s1_happy_path() {
    let queue = Arc::new(FakeJobQueue::new());
    let registry = Arc::new(TypeRegistry::new());
    let received = Arc::new(Mutex::new(None));
    let received_clone = Arc::clone(&received);

    let handle = registry
        .register::<String, _, _, _>(
            "hello",
            0,
            JsonEncoder,
            move |payload: String| {
                let received = Arc::clone(&received_clone);
                async move {
                    *received.lock().unwrap() = Some(payload);
                    Ok(())
                }
            },
            Arc::clone(&queue),
        )
        .unwrap();

    let now = wharf_core::now_ns();
    let job = handle.schedule(0, now, &"world".to_string()).await.unwrap();

    let mut pool = Pool::new(Arc::clone(&queue), registry, PoolConfig::new());
    pool.start().unwrap();

    let settled = wait_until(Duration::from_secs(2), Duration::from_millis(10), || {
        matches!(
            queue.find_by_id(&job.id).now_or_never(),
            Some(Ok(Some(j))) if j.status == JobStatus::Finished
        )
    })
    .await;

    pool.close();
    pool.wait().await.unwrap();

    assert!(settled, "job did not reach finished within 2s");
    assert_eq!(received.lock().unwrap().as_deref(), Some("world"));
}

#[tokio::test]
async fn s2_retry_then_succeed() {
    let queue = Arc::new(FakeJobQueue::new());
    let registry = Arc::new(TypeRegistry::new());
    let call_count = Arc::new(AtomicUsize::new(0));
    let call_count_clone = Arc::clone(&call_count);

    let handle = registry
        .register::<String, _, _, _>(
            "flaky",
            3,
            JsonEncoder,
            move |_payload: String| {
                let call_count = Arc::clone(&call_count_clone);
                async move {
                    let attempt = call_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        Err("not yet".to_string())
                    } else {
                        Ok(())
                    }
                }
            },
            Arc::clone(&queue),
        )
        .unwrap();

    let now = wharf_core::now_ns();
    let job = handle.schedule(0, now, &"x".to_string()).await.unwrap();

    let mut pool = Pool::new(Arc::clone(&queue), registry, PoolConfig::new().with_min_wait(Duration::from_millis(20)));
    pool.start().unwrap();

    let settled = wait_until(Duration::from_secs(2), Duration::from_millis(10), || {
        matches!(
            queue.find_by_id(&job.id).now_or_never(),
            Some(Ok(Some(j))) if j.status.is_terminal()
        )
    })
    .await;

    pool.close();
    pool.wait().await.unwrap();

    assert!(settled);
    let final_job = queue.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Finished);
    assert_eq!(final_job.retries, 0);
    assert_eq!(call_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn s3_retry_then_fail() {
    let queue = Arc::new(FakeJobQueue::new());
    let registry = Arc::new(TypeRegistry::new());
    let call_count = Arc::new(AtomicUsize::new(0));
    let call_count_clone = Arc::clone(&call_count);

    let handle = registry
        .register::<String, _, _, _>(
            "always-panics",
            2,
            JsonEncoder,
            move |_payload: String| {
                let call_count = Arc::clone(&call_count_clone);
                async move {
                    call_count.fetch_add(1, Ordering::SeqCst);
                    panic!("boom");
                }
            },
            Arc::clone(&queue),
        )
        .unwrap();

    let now = wharf_core::now_ns();
    let job = handle.schedule(0, now, &"x".to_string()).await.unwrap();

    let mut pool = Pool::new(Arc::clone(&queue), registry, PoolConfig::new().with_min_wait(Duration::from_millis(20)));
    pool.start().unwrap();

    let settled = wait_until(Duration::from_secs(2), Duration::from_millis(10), || {
        matches!(
            queue.find_by_id(&job.id).now_or_never(),
            Some(Ok(Some(j))) if j.status.is_terminal()
        )
    })
    .await;

    pool.close();
    pool.wait().await.unwrap();

    assert!(settled);
    let final_job = queue.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Failed);
    assert!(final_job.error.contains("boom"));
    assert_eq!(call_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn s4_priority_order() {
    let queue = Arc::new(FakeJobQueue::new());
    let registry = Arc::new(TypeRegistry::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_clone = Arc::clone(&order);

    let handle = registry
        .register::<String, _, _, _>(
            "record-order",
            0,
            JsonEncoder,
            move |payload: String| {
                let order = Arc::clone(&order_clone);
                async move {
                    order.lock().unwrap().push(payload);
                    Ok(())
                }
            },
            Arc::clone(&queue),
        )
        .unwrap();

    let now = wharf_core::now_ns();
    handle.schedule(0, now, &"A".to_string()).await.unwrap();
    handle.schedule(100, now, &"B".to_string()).await.unwrap();
    handle.schedule(50, now, &"C".to_string()).await.unwrap();

    let mut pool = Pool::new(
        Arc::clone(&queue),
        registry,
        PoolConfig::new().with_num_workers(1).with_batch_size(10),
    );
    pool.start().unwrap();

    wait_until(Duration::from_secs(2), Duration::from_millis(10), || {
        order.lock().unwrap().len() == 3
    })
    .await;

    pool.close();
    pool.wait().await.unwrap();

    assert_eq!(&*order.lock().unwrap(), &["B".to_string(), "C".to_string(), "A".to_string()]);
}

#[tokio::test]
async fn s5_exactly_once_under_two_pools() {
    let queue = Arc::new(FakeJobQueue::new());
    let registry = Arc::new(TypeRegistry::new());
    let executed = Arc::new(Mutex::new(HashSet::new()));
    let executed_clone = Arc::clone(&executed);

    let handle = registry
        .register::<String, _, _, _>(
            "count-once",
            0,
            JsonEncoder,
            move |payload: String| {
                let executed = Arc::clone(&executed_clone);
                async move {
                    let mut set = executed.lock().unwrap();
                    assert!(set.insert(payload.clone()), "job {payload} executed twice");
                    Ok(())
                }
            },
            Arc::clone(&queue),
        )
        .unwrap();

    let now = wharf_core::now_ns();
    for i in 0..100 {
        handle.schedule(0, now, &i.to_string()).await.unwrap();
    }

    let config = PoolConfig::new().with_num_workers(4).with_batch_size(8).with_min_wait(Duration::from_millis(10));
    let mut pool_a = Pool::new(Arc::clone(&queue), Arc::clone(&registry), config.clone());
    let mut pool_b = Pool::new(Arc::clone(&queue), registry, config);
    pool_a.start().unwrap();
    pool_b.start().unwrap();

    wait_until(Duration::from_secs(5), Duration::from_millis(20), || {
        executed.lock().unwrap().len() == 100
    })
    .await;

    pool_a.close();
    pool_b.close();
    pool_a.wait().await.unwrap();
    pool_b.wait().await.unwrap();

    assert_eq!(executed.lock().unwrap().len(), 100);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.finished, 100);
}

#[tokio::test]
async fn s6_crash_recovery() {
    let queue = Arc::new(FakeJobQueue::new());
    let registry = Arc::new(TypeRegistry::new());
    let executed = Arc::new(AtomicUsize::new(0));
    let executed_clone = Arc::clone(&executed);

    let handle = registry
        .register::<String, _, _, _>(
            "long-running",
            0,
            JsonEncoder,
            move |_payload: String| {
                let executed = Arc::clone(&executed_clone);
                async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Arc::clone(&queue),
        )
        .unwrap();

    let now = wharf_core::now_ns();
    let job = handle.schedule(0, now, &"x".to_string()).await.unwrap();

    // Simulate pool P1 crashing mid-job: claim the job and heartbeat once,
    // then never heartbeat or retry again — no clean `close`/`wait`.
    queue.pop_next_jobs(1, "p1-crashed", now).await.unwrap();
    queue.heartbeat("p1-crashed", now).await.unwrap();

    let mut pool_p2 = Pool::new(
        Arc::clone(&queue),
        registry,
        PoolConfig::new()
            .with_num_workers(1)
            .with_min_wait(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_stale_timeout(Duration::from_millis(30)),
    );
    pool_p2.start().unwrap();

    let recovered = wait_until(Duration::from_secs(2), Duration::from_millis(10), || {
        executed.load(Ordering::SeqCst) == 1
    })
    .await;

    pool_p2.close();
    pool_p2.wait().await.unwrap();

    assert!(recovered, "P2 never picked up the orphaned job");
    let final_job = queue.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Finished);
}
