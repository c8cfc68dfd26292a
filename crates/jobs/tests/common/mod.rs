#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use taskmill_core::{Backoff, Job, JobId, JobState, RetryPolicy};
use taskmill_infra::InMemoryJobStore;
use taskmill_jobs::{DispatcherConfig, HandlerRegistry, PoolConfig, QueueConfig, QueueManager};

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Three attempts, a few milliseconds apart.
pub fn fast_retry() -> QueueConfig {
    QueueConfig::default().with_retry(
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Backoff::new(ms(5), ms(20))),
    )
}

pub fn fast_pool() -> PoolConfig {
    PoolConfig::default()
        .with_lease(Duration::from_secs(5))
        .with_reclaim_interval(ms(50))
        .with_dispatcher(DispatcherConfig::default().with_poll_interval(ms(5), ms(20)))
}

pub fn in_memory_queue(registry: HandlerRegistry) -> QueueManager {
    QueueManager::new(InMemoryJobStore::arc(), Arc::new(registry)).with_config(fast_retry())
}

/// Poll `check` until it returns true, panicking after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(ms(5)).await;
    }
}

pub async fn wait_for_state(queue: &QueueManager, id: JobId, state: JobState) -> Job {
    eventually(Duration::from_secs(10), move || async move {
        matches!(queue.get(id).await, Ok(Some(job)) if job.state == state)
    })
    .await;
    queue.get(id).await.unwrap().unwrap()
}
