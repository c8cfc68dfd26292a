//! Queue manager: the submission API and the single place job outcomes are
//! recorded and announced.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use taskmill_core::{
    Clock, EnqueueOptions, Job, JobId, JobState, JobStats, Outcome, QueueError, QueueResult,
    RetryPolicy, SystemClock, WorkerId,
};
use taskmill_events::{EventBus, InMemoryEventBus, JobEvent, JobEventKind, Subscription};
use taskmill_infra::{ClaimRequest, JobStore};

use crate::registry::{HandlerRegistry, validate_job_type};
use crate::retry::{StoreRetry, with_store_retry};

/// Attempt counters are stored as signed 32-bit integers.
const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

/// Queue-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QueueConfig {
    /// Default attempts and the backoff between them
    pub retry: RetryPolicy,
    /// Retrying of transient store failures
    pub store_retry: StoreRetry,
}

impl QueueConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store_retry(mut self, store_retry: StoreRetry) -> Self {
        self.store_retry = store_retry;
        self
    }
}

/// Front door of the queue.
///
/// Cheap to clone; clones share the store, registry, event bus and the local
/// wake-up signal used by dispatchers in this process.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    events: Arc<dyn EventBus<JobEvent>>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    wakeup: Arc<Notify>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            events: Arc::new(InMemoryEventBus::new()),
            clock: Arc::new(SystemClock),
            config: QueueConfig::default(),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<dyn EventBus<JobEvent>>) -> Self {
        self.events = events;
        self
    }

    /// Clock used to stamp new jobs; share it with the store in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Receive every lifecycle event published from now on.
    ///
    /// With the default [`InMemoryEventBus`] each subscription buffers up to
    /// [`taskmill_events::DEFAULT_SUBSCRIBER_CAPACITY`] events; once full, newer events are
    /// dropped for that subscriber until it catches up.
    pub fn subscribe(&self) -> Subscription<JobEvent> {
        self.events.subscribe()
    }

    pub(crate) fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    /// Persist a new job of a registered type. The job only runs later, on
    /// some worker; this returns once the store has accepted it.
    pub async fn enqueue<P>(
        &self,
        job_type: &str,
        payload: &P,
        options: EnqueueOptions,
    ) -> QueueResult<JobId>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::invalid_payload(e.to_string()))?;
        self.enqueue_json(job_type, payload, options).await
    }

    /// [`enqueue`](Self::enqueue) for an already serialized payload.
    #[instrument(skip(self, payload, options), err)]
    pub async fn enqueue_json(
        &self,
        job_type: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        validate_job_type(job_type)?;
        if !self.registry.contains(job_type) {
            return Err(QueueError::validation(format!(
                "no handler registered for job type '{job_type}'"
            )));
        }
        match options.max_attempts {
            Some(0) => return Err(QueueError::validation("max_attempts must be at least 1")),
            Some(n) if n > MAX_ATTEMPTS_LIMIT => {
                return Err(QueueError::validation(format!(
                    "max_attempts must be at most {MAX_ATTEMPTS_LIMIT}"
                )));
            }
            _ => {}
        }

        let job = Job::new(
            job_type,
            payload,
            &options,
            self.config.retry.max_attempts,
            self.clock.now(),
        );
        let store = &self.store;
        let candidate = &job;
        let calls = AtomicU32::new(0);
        let calls = &calls;
        // A transient error may hide a committed insert; a replay first looks
        // for the row it may already have written.
        let id = with_store_retry(&self.config.store_retry, "insert", move || {
            let replay = calls.fetch_add(1, Ordering::Relaxed) > 0;
            async move {
                if replay {
                    if let Some(stored) = store.get(candidate.id).await? {
                        if stored.job_type != candidate.job_type {
                            return Err(QueueError::storage(format!(
                                "job id {} already used by type '{}'",
                                candidate.id, stored.job_type
                            )));
                        }
                        debug!(job_id = %candidate.id, "insert was committed before the error");
                        return Ok(stored.id);
                    }
                }
                store.insert(candidate.clone()).await
            }
        })
        .await?;

        debug!(
            job_id = %id,
            job_type,
            priority = job.priority,
            not_before = %job.not_before,
            "job enqueued"
        );
        self.emit(JobEventKind::Created, &job);
        self.wakeup.notify_one();
        Ok(id)
    }

    /// Cancel a job that is not running. `false` if it is active or already
    /// finished.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: JobId) -> QueueResult<bool> {
        let store = &self.store;
        let cancelled =
            with_store_retry(&self.config.store_retry, "cancel", move || store.cancel(id)).await?;

        match cancelled {
            Some(job) => {
                info!(job_id = %id, job_type = %job.job_type, "job cancelled");
                self.emit(JobEventKind::Failed, &job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let store = &self.store;
        with_store_retry(&self.config.store_retry, "get", move || store.get(id)).await
    }

    pub async fn stats(&self) -> QueueResult<JobStats> {
        let store = &self.store;
        with_store_retry(&self.config.store_retry, "stats", move || store.stats()).await
    }

    /// Claim work for `worker`. Not retried: the dispatcher has its own
    /// poll backoff.
    pub async fn claim(&self, worker: WorkerId, request: &ClaimRequest) -> QueueResult<Vec<Job>> {
        self.store.claim(worker, request).await
    }

    /// Heartbeat: extend `worker`'s claim on `id` by `lease`.
    pub async fn renew(
        &self,
        id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let store = &self.store;
        with_store_retry(&self.config.store_retry, "renew", move || {
            store.renew(id, worker, lease)
        })
        .await
    }

    /// Announce that `job` (as claimed) has begun executing.
    pub fn job_started(&self, job: &Job) {
        self.emit(JobEventKind::Started, job);
    }

    /// Record the outcome of an execution and return the job's new state.
    ///
    /// `ClaimLost` means the claim was reclaimed or already settled; the
    /// caller must drop the result.
    #[instrument(
        skip(self, job, outcome),
        fields(job_id = %job.id, job_type = %job.job_type),
        err
    )]
    pub async fn on_completion(
        &self,
        job: &Job,
        worker: WorkerId,
        outcome: &Outcome,
    ) -> QueueResult<JobState> {
        let updated = self.settle(job, worker, outcome).await?;

        match updated.state {
            JobState::Completed => {
                info!(attempts = updated.attempts, "job completed");
                self.emit(JobEventKind::Completed, &updated);
            }
            JobState::Retrying => {
                warn!(
                    attempts = updated.attempts,
                    max_attempts = updated.max_attempts,
                    retry_at = %updated.not_before,
                    reason = outcome.reason().unwrap_or_default(),
                    "job failed, will retry"
                );
                self.emit(JobEventKind::Retrying, &updated);
            }
            _ => {
                warn!(
                    attempts = updated.attempts,
                    reason = outcome.reason().unwrap_or_default(),
                    "job failed permanently"
                );
                self.emit(JobEventKind::Failed, &updated);
            }
        }
        Ok(updated.state)
    }

    /// Write `outcome` for `job` to the store.
    ///
    /// When a retried write reports `ClaimLost`, an earlier try may have
    /// committed before its acknowledgement was lost. The stored row is
    /// accepted if it is exactly what this outcome produces for this attempt.
    async fn settle(&self, job: &Job, worker: WorkerId, outcome: &Outcome) -> QueueResult<Job> {
        let store = &self.store;
        let backoff = &self.config.retry.backoff;
        let id = job.id;
        let operation = match outcome {
            Outcome::Success => "complete",
            _ => "fail",
        };
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let result = with_store_retry(&self.config.store_retry, operation, move || {
            calls_ref.fetch_add(1, Ordering::Relaxed);
            async move {
                match outcome {
                    Outcome::Success => store.complete(id, worker).await,
                    Outcome::RetryableFailure(reason) => {
                        store.fail(id, worker, reason, true, backoff).await
                    }
                    Outcome::FatalFailure(reason) => {
                        store.fail(id, worker, reason, false, backoff).await
                    }
                }
            }
        })
        .await;

        match result {
            Err(QueueError::ClaimLost(lost)) if calls.load(Ordering::Relaxed) > 1 => {
                match self.get(id).await? {
                    Some(stored) if settled_by(job, outcome, &stored) => {
                        debug!(job_id = %id, "outcome was committed before the error");
                        Ok(stored)
                    }
                    _ => Err(QueueError::ClaimLost(lost)),
                }
            }
            other => other,
        }
    }

    /// Sweep jobs whose claim lapsed. Returns how many were recovered.
    pub async fn reclaim_expired(&self) -> QueueResult<usize> {
        let store = &self.store;
        let backoff = &self.config.retry.backoff;
        let reclaimed = with_store_retry(&self.config.store_retry, "reclaim_expired", move || {
            store.reclaim_expired(backoff)
        })
        .await?;

        for job in &reclaimed {
            let kind = if job.state == JobState::Expired {
                JobEventKind::Expired
            } else {
                JobEventKind::Retrying
            };
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                state = %job.state,
                "claim expired, job reclaimed"
            );
            self.emit(kind, job);
        }
        if !reclaimed.is_empty() {
            self.wakeup.notify_one();
        }
        Ok(reclaimed.len())
    }

    fn emit(&self, kind: JobEventKind, job: &Job) {
        let event = JobEvent::from_job(kind, job);
        debug!(
            event = event.name(),
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "job event"
        );
        if let Err(e) = self.events.publish(event) {
            warn!(event = kind.name(), job_id = %job.id, error = %e, "failed to publish job event");
        }
    }
}

/// Whether `stored` is the row `outcome` leaves behind for the attempt `claimed`.
fn settled_by(claimed: &Job, outcome: &Outcome, stored: &Job) -> bool {
    if stored.attempts != claimed.attempts || stored.claimed_by.is_some() {
        return false;
    }
    match outcome {
        Outcome::Success => stored.state == JobState::Completed,
        Outcome::RetryableFailure(reason) => {
            matches!(stored.state, JobState::Retrying | JobState::Failed)
                && stored.last_error.as_deref() == Some(reason.as_str())
        }
        Outcome::FatalFailure(reason) => {
            stored.state == JobState::Failed
                && stored.last_error.as_deref() == Some(reason.as_str())
        }
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
