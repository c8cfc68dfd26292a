//! The job record and its state machine.

use core::fmt;
use core::str::FromStr;
use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::id::{JobId, WorkerId};
use crate::retry::Backoff;

/// Reason recorded on jobs removed by [`Job::cancel`].
pub const CANCELLED_REASON: &str = "cancelled";

/// Reason recorded on jobs recovered by [`Job::reclaim`].
pub const CLAIM_EXPIRED_REASON: &str = "claim expired";

/// Lifecycle state of a job.
///
/// ```text
/// created ──► active ──► completed
///    │          ├──────► failed
///    │          ├──────► expired
///    │          └──────► retrying ──► active
///    └─(cancel)─► failed ◄─(cancel)─┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Persisted, waiting for its first claim
    Created,
    /// Claimed by a worker
    Active,
    /// Handler succeeded
    Completed,
    /// Failed permanently (fatal error, retries exhausted, or cancelled)
    Failed,
    /// Failed and waiting for its next attempt
    Retrying,
    /// Claim lapsed with no attempts left
    Expired,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Created,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Retrying,
        JobState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Expired
        )
    }

    /// States a claim may pick up.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Created | JobState::Retrying)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Retrying, Active)
                | (Active, Completed)
                | (Active, Retrying)
                | (Active, Failed)
                | (Active, Expired)
                | (Created, Failed)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| QueueError::storage(format!("unknown job state '{s}'")))
    }
}

/// Options accepted by enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Retry ceiling; the queue default applies when `None`
    pub max_attempts: Option<u32>,
    /// Run no earlier than `now + delay`
    pub delay: Option<Duration>,
    /// Run no earlier than this instant (ignored when `delay` is set)
    pub run_at: Option<DateTime<Utc>>,
    /// Higher runs first
    pub priority: i32,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Earliest claim time for a job enqueued at `now`.
    pub fn not_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.delay, self.run_at) {
            (Some(delay), _) => add_std(now, delay),
            (None, Some(at)) => at,
            (None, None) => now,
        }
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Execution attempts so far (incremented on claim)
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    /// Earliest time the job may be claimed
    pub not_before: DateTime<Utc>,
    pub claimed_by: Option<WorkerId>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Reason of the most recent failure
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `created` job.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: &EnqueueOptions,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            state: JobState::Created,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(default_max_attempts),
            priority: options.priority,
            not_before: options.not_before(now),
            claimed_by: None,
            claim_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.not_before <= now
    }

    pub fn holds_claim(&self, worker: WorkerId) -> bool {
        self.state == JobState::Active && self.claimed_by == Some(worker)
    }

    /// Whether this job is active with a lease that ran out at or before `now`.
    pub fn claim_lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.claim_expires_at.is_some_and(|at| at <= now)
    }

    /// Order in which claims pick jobs: priority desc, not_before asc, created_at asc.
    pub fn claim_order(a: &Job, b: &Job) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.not_before.cmp(&b.not_before))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    }

    /// `created|retrying → active`.
    pub fn claim(
        &mut self,
        worker: WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.transition(JobState::Active, now)?;
        self.attempts += 1;
        self.claimed_by = Some(worker);
        self.claim_expires_at = Some(add_std(now, lease));
        Ok(())
    }

    /// Extend a live claim; returns the new deadline.
    pub fn renew(
        &mut self,
        worker: WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<DateTime<Utc>> {
        self.ensure_owner(worker)?;
        let expires = add_std(now, lease);
        self.claim_expires_at = Some(expires);
        self.updated_at = now;
        Ok(expires)
    }

    /// `active → completed`.
    pub fn complete(&mut self, worker: WorkerId, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure_owner(worker)?;
        self.transition(JobState::Completed, now)?;
        self.release_claim();
        Ok(())
    }

    /// `active → retrying | failed`.
    ///
    /// Retries only when `retryable` and attempts remain; the next attempt is
    /// delayed by `backoff`.
    pub fn fail(
        &mut self,
        worker: WorkerId,
        reason: impl Into<String>,
        retryable: bool,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.ensure_owner(worker)?;
        if retryable && self.attempts < self.max_attempts {
            self.transition(JobState::Retrying, now)?;
            self.not_before = backoff.next_attempt_time(self.attempts, now);
        } else {
            self.transition(JobState::Failed, now)?;
        }
        self.last_error = Some(reason.into());
        self.release_claim();
        Ok(())
    }

    /// `created|retrying → failed`. Returns `false` for active or terminal jobs.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.is_claimable() {
            return false;
        }
        self.state = JobState::Failed;
        self.updated_at = now;
        self.last_error = Some(CANCELLED_REASON.to_string());
        true
    }

    /// Recover a job whose claim lapsed: back to `retrying` with backoff, or
    /// `expired` once no attempts are left.
    pub fn reclaim(&mut self, backoff: &Backoff, now: DateTime<Utc>) -> QueueResult<()> {
        if !self.claim_lapsed_at(now) {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: JobState::Retrying,
            });
        }
        if self.attempts < self.max_attempts {
            self.transition(JobState::Retrying, now)?;
            self.not_before = backoff.next_attempt_time(self.attempts, now);
        } else {
            self.transition(JobState::Expired, now)?;
        }
        self.last_error = Some(CLAIM_EXPIRED_REASON.to_string());
        self.release_claim();
        Ok(())
    }

    fn ensure_owner(&self, worker: WorkerId) -> QueueResult<()> {
        if self.holds_claim(worker) {
            Ok(())
        } else {
            Err(QueueError::ClaimLost(self.id))
        }
    }

    fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> QueueResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    fn release_claim(&mut self) {
        self.claimed_by = None;
        self.claim_expires_at = None;
    }
}

/// Per-state job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub created: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
    pub expired: u64,
}

impl JobStats {
    pub fn add(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Created => &mut self.created,
            JobState::Active => &mut self.active,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Retrying => &mut self.retrying,
            JobState::Expired => &mut self.expired,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.created + self.active + self.completed + self.failed + self.retrying + self.expired
    }
}

fn add_std(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let d = chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX);
    at.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
