//! Dispatcher loop: decides when to claim, how much, and of which type.
//!
//! One dispatcher runs per pool. It owns the pool's executor tasks, so it is
//! also the one that drains them on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use taskmill_core::{Job, QueueResult, WorkerId};
use taskmill_infra::ClaimRequest;

use crate::pool::Executor;
use crate::queue::QueueManager;
use crate::retry::jittered;

/// Claim scheduling settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Types this pool runs; empty means every registered type
    pub types: Vec<String>,
    /// Idle poll delay after a claim found nothing
    pub poll_interval: Duration,
    /// Cap for the doubling idle delay
    pub max_poll_interval: Duration,
    /// Random spread applied to each idle delay, as a fraction
    pub jitter: f64,
    /// Maximum in-flight jobs per type
    pub type_limits: HashMap<String, usize>,
    /// Cap for types missing from `type_limits`; `None` is unbounded
    pub default_type_limit: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(5),
            jitter: 0.2,
            type_limits: HashMap::new(),
            default_type_limit: None,
        }
    }
}

impl DispatcherConfig {
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration, max: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_poll_interval = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_type_limit(mut self, job_type: impl Into<String>, limit: usize) -> Self {
        self.type_limits.insert(job_type.into(), limit);
        self
    }

    pub fn with_default_type_limit(mut self, limit: usize) -> Self {
        self.default_type_limit = Some(limit);
        self
    }

    pub fn limits(&self) -> TypeLimits {
        TypeLimits::new(self.type_limits.clone(), self.default_type_limit)
    }
}

/// Per-type in-flight caps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeLimits {
    limits: HashMap<String, usize>,
    default_limit: Option<usize>,
}

impl TypeLimits {
    pub fn new(limits: HashMap<String, usize>, default_limit: Option<usize>) -> Self {
        Self {
            limits,
            default_limit,
        }
    }

    pub fn limit(&self, job_type: &str) -> Option<usize> {
        self.limits.get(job_type).copied().or(self.default_limit)
    }

    /// How many more jobs of `job_type` may start while `in_flight` are running.
    pub fn room(&self, job_type: &str, in_flight: usize) -> usize {
        self.limit(job_type)
            .map_or(usize::MAX, |limit| limit.saturating_sub(in_flight))
    }
}

/// Rotating visit order over job types.
///
/// Every cycle starts one type further along, so the type that got first pick
/// of the free slots changes each time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRobin {
    types: Vec<String>,
    start: usize,
}

impl RoundRobin {
    pub fn new(types: Vec<String>) -> Self {
        Self { types, start: 0 }
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn next_cycle(&mut self) -> Vec<String> {
        if self.types.is_empty() {
            return Vec::new();
        }
        let start = self.start % self.types.len();
        self.start = (start + 1) % self.types.len();

        let mut order = Vec::with_capacity(self.types.len());
        order.extend_from_slice(&self.types[start..]);
        order.extend_from_slice(&self.types[..start]);
        order
    }
}

/// Jittered exponential delay between idle polls.
#[derive(Debug, Clone, PartialEq)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            jitter,
            current: base,
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(config.poll_interval, config.max_poll_interval, config.jitter)
    }

    /// Delay to sleep now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current, self.jitter);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Process-local count of running jobs per type.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl InFlight {
    pub(crate) fn count(&self, job_type: &str) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(job_type).copied().unwrap_or(0)
    }

    pub(crate) fn total(&self) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.values().sum()
    }

    pub(crate) fn acquire(&self, job_type: &str) -> InFlightGuard {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(job_type.to_string()).or_default() += 1;
        InFlightGuard {
            counts: Arc::clone(&self.counts),
            job_type: job_type.to_string(),
        }
    }
}

/// Releases one in-flight slot of its type when dropped, including when the
/// execution task is aborted.
pub(crate) struct InFlightGuard {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    job_type: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&self.job_type) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.job_type);
            }
        }
    }
}

/// Shutdown signal: `Some(drain_timeout)` once stopping was requested.
pub(crate) type ShutdownSignal = watch::Receiver<Option<Duration>>;

pub(crate) struct Dispatcher {
    pub(crate) name: String,
    pub(crate) queue: QueueManager,
    pub(crate) worker: WorkerId,
    pub(crate) executor: Arc<Executor>,
    pub(crate) concurrency: usize,
    pub(crate) lease: Duration,
    pub(crate) rotation: RoundRobin,
    pub(crate) limits: TypeLimits,
    pub(crate) in_flight: InFlight,
    pub(crate) backoff: PollBackoff,
    /// Used when the pool handle is dropped without an explicit shutdown
    pub(crate) default_drain: Duration,
    pub(crate) tasks: JoinSet<()>,
}

impl Dispatcher {
    pub(crate) async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!(
            pool = %self.name,
            worker = %self.worker,
            types = ?self.rotation.types(),
            concurrency = self.concurrency,
            "dispatcher started"
        );
        let wakeup = self.queue.wakeup();

        let drain = loop {
            if let Some(drain) = *shutdown.borrow() {
                break drain;
            }
            self.reap();

            let free = self.concurrency.saturating_sub(self.tasks.len());
            if free == 0 {
                tokio::select! {
                    Some(exit) = self.tasks.join_next() => log_task_exit(exit),
                    changed = shutdown.changed() => if changed.is_err() {
                        break self.default_drain;
                    },
                }
                continue;
            }

            let delay = match self.claim_round(free).await {
                Ok(0) => self.backoff.next_delay(),
                Ok(claimed) => {
                    debug!(pool = %self.name, claimed, "claim round");
                    self.backoff.reset();
                    continue;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        pool = %self.name,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "failed to claim jobs"
                    );
                    delay
                }
            };

            // Idle: a local enqueue, a finished execution or the timer ends the wait.
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wakeup.notified() => self.backoff.reset(),
                Some(exit) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_task_exit(exit);
                    self.backoff.reset();
                }
                changed = shutdown.changed() => if changed.is_err() {
                    break self.default_drain;
                },
            }
        };

        self.drain(drain).await;
    }

    /// Claim up to `free` jobs, visiting types in rotation and respecting caps.
    async fn claim_round(&mut self, free: usize) -> QueueResult<usize> {
        let mut remaining = free;
        let mut claimed = 0;

        for job_type in self.rotation.next_cycle() {
            if remaining == 0 {
                break;
            }
            let room = self
                .limits
                .room(&job_type, self.in_flight.count(&job_type))
                .min(remaining);
            if room == 0 {
                continue;
            }

            let request = ClaimRequest::new(vec![job_type], room, self.lease);
            for job in self.queue.claim(self.worker, &request).await? {
                remaining = remaining.saturating_sub(1);
                claimed += 1;
                self.spawn(job);
            }
        }
        Ok(claimed)
    }

    fn spawn(&mut self, job: Job) {
        debug!(
            pool = %self.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "claimed job"
        );
        let guard = self.in_flight.acquire(&job.job_type);
        let executor = Arc::clone(&self.executor);
        self.tasks.spawn(async move {
            let _guard = guard;
            executor.run(job).await;
        });
    }

    fn reap(&mut self) {
        while let Some(exit) = self.tasks.try_join_next() {
            log_task_exit(exit);
        }
    }

    /// Wait up to `timeout` for running executions, then abort the rest.
    /// Aborted jobs stay `active` until the reclaim sweep recovers them.
    async fn drain(&mut self, timeout: Duration) {
        info!(
            pool = %self.name,
            in_flight = self.tasks.len(),
            timeout_ms = timeout.as_millis() as u64,
            "dispatcher stopping, draining in-flight jobs"
        );

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(exit) = tasks.join_next().await {
                log_task_exit(exit);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                pool = %self.name,
                abandoned = self.tasks.len(),
                "drain timed out, aborting executions; their jobs will be reclaimed after the lease"
            );
            self.tasks.shutdown().await;
        }
        info!(pool = %self.name, "dispatcher stopped");
    }
}

fn log_task_exit(exit: Result<(), JoinError>) {
    if let Err(e) = exit {
        if e.is_panic() {
            error!(error = %e, "execution task panicked");
        }
    }
}
