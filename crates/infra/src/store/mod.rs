//! Durable store boundary for the job table.
//!
//! Every mutating method is a single atomic step with respect to concurrent
//! callers, in this process or any other sharing the same backing store.
//! State changes go through the transition methods on [`taskmill_core::Job`],
//! so both implementations agree on the state machine.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskmill_core::{Backoff, Job, JobId, JobStats, QueueResult, WorkerId};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Parameters of a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Job types the claimant can run. Empty claims nothing.
    pub types: Vec<String>,
    /// Maximum number of jobs to claim.
    pub limit: usize,
    /// How long the claim stays valid without renewal.
    pub lease: Duration,
}

impl ClaimRequest {
    pub fn new(types: Vec<String>, limit: usize, lease: Duration) -> Self {
        Self { types, limit, lease }
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() || self.limit == 0
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: Job) -> QueueResult<JobId>;

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Atomically claim up to `request.limit` claimable jobs of `request.types`
    /// whose `not_before` has passed, ordered by priority desc, not_before asc,
    /// created_at asc. Returned jobs are `active` and owned by `worker`.
    async fn claim(&self, worker: WorkerId, request: &ClaimRequest) -> QueueResult<Vec<Job>>;

    /// Extend a claim held by `worker`; returns the new deadline.
    async fn renew(&self, id: JobId, worker: WorkerId, lease: Duration)
    -> QueueResult<DateTime<Utc>>;

    /// `active → completed`. `ClaimLost` unless `worker` holds the claim.
    async fn complete(&self, id: JobId, worker: WorkerId) -> QueueResult<Job>;

    /// `active → retrying | failed`. `ClaimLost` unless `worker` holds the claim.
    async fn fail(
        &self,
        id: JobId,
        worker: WorkerId,
        reason: &str,
        retryable: bool,
        backoff: &Backoff,
    ) -> QueueResult<Job>;

    /// Fail a waiting job as cancelled. `None` when the job is active or terminal.
    async fn cancel(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Recover every active job whose lease ran out. Returns the updated jobs.
    async fn reclaim_expired(&self, backoff: &Backoff) -> QueueResult<Vec<Job>>;

    async fn stats(&self) -> QueueResult<JobStats>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: Job) -> QueueResult<JobId> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        (**self).get(id).await
    }

    async fn claim(&self, worker: WorkerId, request: &ClaimRequest) -> QueueResult<Vec<Job>> {
        (**self).claim(worker, request).await
    }

    async fn renew(
        &self,
        id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        (**self).renew(id, worker, lease).await
    }

    async fn complete(&self, id: JobId, worker: WorkerId) -> QueueResult<Job> {
        (**self).complete(id, worker).await
    }

    async fn fail(
        &self,
        id: JobId,
        worker: WorkerId,
        reason: &str,
        retryable: bool,
        backoff: &Backoff,
    ) -> QueueResult<Job> {
        (**self).fail(id, worker, reason, retryable, backoff).await
    }

    async fn cancel(&self, id: JobId) -> QueueResult<Option<Job>> {
        (**self).cancel(id).await
    }

    async fn reclaim_expired(&self, backoff: &Backoff) -> QueueResult<Vec<Job>> {
        (**self).reclaim_expired(backoff).await
    }

    async fn stats(&self) -> QueueResult<JobStats> {
        (**self).stats().await
    }
}
