//! In-memory job store for tests, benchmarks and single-process use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use taskmill_core::{
    Backoff, Clock, Job, JobId, JobStats, QueueError, QueueResult, SystemClock, WorkerId,
};

use super::{ClaimRequest, JobStore};

/// Job table behind a single `RwLock`.
///
/// Every operation takes the write lock for its whole read-modify-write, which
/// makes each one atomic with respect to concurrent callers in this process.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> QueueResult<RwLockReadGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .read()
            .map_err(|_| QueueError::unavailable("in-memory job table lock poisoned"))
    }

    fn write(&self) -> QueueResult<RwLockWriteGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .write()
            .map_err(|_| QueueError::unavailable("in-memory job table lock poisoned"))
    }

    /// Apply `f` to the stored job under the write lock.
    ///
    /// The mutation happens on a copy and is only written back on success, so a
    /// rejected transition leaves the row untouched.
    fn update<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job, DateTime<Utc>) -> QueueResult<T>,
    ) -> QueueResult<(Job, T)> {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let mut job = stored.clone();
        let out = f(&mut job, self.clock.now())?;
        *stored = job.clone();
        Ok((job, out))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> QueueResult<JobId> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::storage(format!("job already exists: {}", job.id)));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn claim(&self, worker: WorkerId, request: &ClaimRequest) -> QueueResult<Vec<Job>> {
        if request.is_empty() {
            return Ok(Vec::new());
        }

        let mut jobs = self.write()?;
        let now = self.clock.now();

        let mut candidates: Vec<&Job> = jobs
            .values()
            .filter(|j| j.is_claimable_at(now) && request.types.iter().any(|t| *t == j.job_type))
            .collect();
        candidates.sort_by(|a, b| Job::claim_order(a, b));
        let ids: Vec<JobId> = candidates
            .into_iter()
            .take(request.limit)
            .map(|j| j.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.claim(worker, request.lease, now)?;
                claimed.push(job.clone());
            }
        }

        debug!(worker = %worker, claimed = claimed.len(), "claimed jobs");
        Ok(claimed)
    }

    async fn renew(
        &self,
        id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let (_, expires) = self.update(id, |job, now| job.renew(worker, lease, now))?;
        Ok(expires)
    }

    async fn complete(&self, id: JobId, worker: WorkerId) -> QueueResult<Job> {
        let (job, ()) = self.update(id, |job, now| job.complete(worker, now))?;
        Ok(job)
    }

    async fn fail(
        &self,
        id: JobId,
        worker: WorkerId,
        reason: &str,
        retryable: bool,
        backoff: &Backoff,
    ) -> QueueResult<Job> {
        let (job, ()) =
            self.update(id, |job, now| job.fail(worker, reason, retryable, backoff, now))?;
        Ok(job)
    }

    async fn cancel(&self, id: JobId) -> QueueResult<Option<Job>> {
        let (job, cancelled) = self.update(id, |job, now| Ok(job.cancel(now)))?;
        Ok(cancelled.then_some(job))
    }

    async fn reclaim_expired(&self, backoff: &Backoff) -> QueueResult<Vec<Job>> {
        let mut jobs = self.write()?;
        let now = self.clock.now();

        let mut reclaimed = Vec::new();
        for job in jobs.values_mut().filter(|j| j.claim_lapsed_at(now)) {
            job.reclaim(backoff, now)?;
            reclaimed.push(job.clone());
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> QueueResult<JobStats> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.add(job.state, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use taskmill_core::{EnqueueOptions, JobState, ManualClock};

    const LEASE: Duration = Duration::from_secs(30);

    fn store() -> (Arc<ManualClock>, InMemoryJobStore) {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryJobStore::with_clock(clock.clone());
        (clock, store)
    }

    fn new_job(clock: &ManualClock, job_type: &str, options: EnqueueOptions) -> Job {
        Job::new(job_type, serde_json::json!({}), &options, 3, clock.now())
    }

    fn request(types: &[&str], limit: usize) -> ClaimRequest {
        ClaimRequest::new(types.iter().map(|t| t.to_string()).collect(), limit, LEASE)
    }

    #[tokio::test]
    async fn insert_and_claim() {
        let (clock, store) = store();
        let id = store.insert(new_job(&clock, "email", EnqueueOptions::new())).await.unwrap();

        let worker = WorkerId::new();
        let claimed = store.claim(worker, &request(&["email"], 10)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].state, JobState::Active);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].claimed_by, Some(worker));

        assert!(store.claim(worker, &request(&["email"], 10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_filters_by_type_and_delay() {
        let (clock, store) = store();
        store.insert(new_job(&clock, "sms", EnqueueOptions::new())).await.unwrap();
        let delayed = store
            .insert(new_job(
                &clock,
                "email",
                EnqueueOptions::new().with_delay(Duration::from_secs(60)),
            ))
            .await
            .unwrap();

        let worker = WorkerId::new();
        assert!(store.claim(worker, &request(&["email"], 10)).await.unwrap().is_empty());
        assert!(store.claim(worker, &request(&[], 10)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(60));
        let claimed = store.claim(worker, &request(&["email"], 10)).await.unwrap();
        assert_eq!(claimed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![delayed]);
    }

    #[tokio::test]
    async fn single_slot_claim_prefers_higher_priority() {
        let (clock, store) = store();
        let a = store
            .insert(new_job(&clock, "t", EnqueueOptions::new().with_priority(1)))
            .await
            .unwrap();
        let b = store
            .insert(new_job(&clock, "t", EnqueueOptions::new().with_priority(5)))
            .await
            .unwrap();

        let worker = WorkerId::new();
        let first = store.claim(worker, &request(&["t"], 1)).await.unwrap();
        assert_eq!(first[0].id, b);
        let second = store.claim(worker, &request(&["t"], 1)).await.unwrap();
        assert_eq!(second[0].id, a);
    }

    #[tokio::test]
    async fn complete_twice_is_claim_lost() {
        let (clock, store) = store();
        let id = store.insert(new_job(&clock, "t", EnqueueOptions::new())).await.unwrap();
        let worker = WorkerId::new();
        store.claim(worker, &request(&["t"], 1)).await.unwrap();

        let done = store.complete(id, worker).await.unwrap();
        assert_eq!(done.state, JobState::Completed);

        let err = store.complete(id, worker).await.unwrap_err();
        assert_eq!(err, QueueError::ClaimLost(id));
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (_, store) = store();
        let id = JobId::new();
        assert_eq!(
            store.complete(id, WorkerId::new()).await.unwrap_err(),
            QueueError::NotFound(id)
        );
        assert_eq!(store.cancel(id).await.unwrap_err(), QueueError::NotFound(id));
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimed_only_after_lease() {
        let (clock, store) = store();
        let id = store.insert(new_job(&clock, "t", EnqueueOptions::new())).await.unwrap();
        let crashed = WorkerId::new();
        let rescuer = WorkerId::new();
        store.claim(crashed, &request(&["t"], 1)).await.unwrap();

        clock.advance(LEASE - Duration::from_secs(1));
        assert!(store.reclaim_expired(&Backoff::immediate()).await.unwrap().is_empty());
        assert!(store.claim(rescuer, &request(&["t"], 1)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        let reclaimed = store.reclaim_expired(&Backoff::immediate()).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].state, JobState::Retrying);

        let claimed = store.claim(rescuer, &request(&["t"], 1)).await.unwrap();
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].claimed_by, Some(rescuer));
        assert_eq!(claimed[0].attempts, 2);

        // The crashed worker's late report is rejected.
        assert_eq!(
            store.complete(id, crashed).await.unwrap_err(),
            QueueError::ClaimLost(id)
        );
    }

    #[tokio::test]
    async fn renew_pushes_the_deadline() {
        let (clock, store) = store();
        let id = store.insert(new_job(&clock, "t", EnqueueOptions::new())).await.unwrap();
        let worker = WorkerId::new();
        store.claim(worker, &request(&["t"], 1)).await.unwrap();

        clock.advance(Duration::from_secs(20));
        store.renew(id, worker, LEASE).await.unwrap();
        clock.advance(Duration::from_secs(20));
        assert!(store.reclaim_expired(&Backoff::immediate()).await.unwrap().is_empty());

        assert_eq!(
            store.renew(id, WorkerId::new(), LEASE).await.unwrap_err(),
            QueueError::ClaimLost(id)
        );
    }

    #[tokio::test]
    async fn cancel_waiting_job_only() {
        let (clock, store) = store();
        let waiting = store.insert(new_job(&clock, "t", EnqueueOptions::new())).await.unwrap();
        let cancelled = store.cancel(waiting).await.unwrap().unwrap();
        assert_eq!(cancelled.state, JobState::Failed);

        let running = store.insert(new_job(&clock, "t", EnqueueOptions::new())).await.unwrap();
        store.claim(WorkerId::new(), &request(&["t"], 1)).await.unwrap();
        assert!(store.cancel(running).await.unwrap().is_none());
        assert_eq!(store.get(running).await.unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let (clock, store) = store();
        for _ in 0..5 {
            store.insert(new_job(&clock, "t", EnqueueOptions::new())).await.unwrap();
        }
        store.claim(WorkerId::new(), &request(&["t"], 2)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.created, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn concurrent_claims_never_share_a_job() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(8)
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = Arc::new(InMemoryJobStore::new());
            let now = Utc::now();
            for _ in 0..500 {
                store
                    .insert(Job::new("t", serde_json::json!({}), &EnqueueOptions::new(), 1, now))
                    .await
                    .unwrap();
            }

            let mut tasks = Vec::new();
            for _ in 0..16 {
                let store = store.clone();
                tasks.push(tokio::spawn(async move {
                    let worker = WorkerId::new();
                    let mut mine = Vec::new();
                    loop {
                        let batch = store
                            .claim(worker, &ClaimRequest::new(vec!["t".into()], 3, LEASE))
                            .await
                            .unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        mine.extend(batch.into_iter().map(|j| j.id));
                        tokio::task::yield_now().await;
                    }
                    mine
                }));
            }

            let mut seen = HashSet::new();
            let mut total = 0;
            for task in tasks {
                for id in task.await.unwrap() {
                    total += 1;
                    assert!(seen.insert(id), "job {id} claimed twice");
                }
            }
            assert_eq!(total, 500);
        });
    }
}
