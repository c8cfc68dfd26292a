//! Worker pool: executor slots, claim heartbeats and the reclaim sweeper.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};

use taskmill_core::{Job, JobId, JobState, Outcome, QueueError, QueueResult, WorkerId};

use crate::dispatcher::{
    Dispatcher, DispatcherConfig, InFlight, PollBackoff, RoundRobin, ShutdownSignal,
};
use crate::queue::QueueManager;
use crate::registry::{JobContext, JobHandler};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Name for logging
    pub name: String,
    /// Executor slots; at most this many jobs run at once
    pub concurrency: usize,
    /// How long a claim stays valid without renewal
    pub lease: Duration,
    /// Abort handlers running longer than this
    pub job_timeout: Option<Duration>,
    /// Renew claims every `lease / 3` while a handler runs
    pub renew_claims: bool,
    /// How often the sweeper recovers lapsed claims
    pub reclaim_interval: Duration,
    /// Drain budget used when the handle is dropped without `shutdown`
    pub drain_timeout: Duration,
    pub dispatcher: DispatcherConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "taskmill-worker".to_string(),
            concurrency: 4,
            lease: Duration::from_secs(30),
            job_timeout: Some(Duration::from_secs(300)),
            renew_claims: true,
            reclaim_interval: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(30),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_renew_claims(mut self, renew: bool) -> Self {
        self.renew_claims = renew;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::configuration("pool concurrency must be at least 1"));
        }
        if self.lease.is_zero() {
            return Err(QueueError::configuration("claim lease must be positive"));
        }
        if self.reclaim_interval.is_zero() {
            return Err(QueueError::configuration("reclaim interval must be positive"));
        }
        if self.dispatcher.poll_interval.is_zero() {
            return Err(QueueError::configuration("poll interval must be positive"));
        }
        Ok(())
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Executions whose outcome was recorded
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    /// Executions whose result was dropped because the claim was lost
    pub discarded: u64,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn record(&self, state: JobState) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match state {
            JobState::Completed => &self.succeeded,
            JobState::Retrying => &self.retried,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, in_flight: usize) -> PoolStats {
        PoolStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

/// A set of executor slots claiming under one worker identity.
///
/// ```ignore
/// let pool = WorkerPool::new(queue.clone(), PoolConfig::default()).spawn()?;
/// tokio::signal::ctrl_c().await?;
/// pool.shutdown(Duration::from_secs(30)).await;
/// ```
#[derive(Debug)]
pub struct WorkerPool {
    queue: QueueManager,
    config: PoolConfig,
    worker: WorkerId,
}

impl WorkerPool {
    pub fn new(queue: QueueManager, config: PoolConfig) -> Self {
        Self {
            queue,
            config,
            worker: WorkerId::new(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Start the dispatcher and sweeper tasks. Must be called inside a tokio
    /// runtime.
    pub fn spawn(self) -> QueueResult<PoolHandle> {
        self.config.validate()?;
        let types = self.resolve_types()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let counters = Arc::new(Counters::default());
        let in_flight = InFlight::default();

        let executor = Arc::new(Executor {
            queue: self.queue.clone(),
            worker: self.worker,
            lease: self.config.lease,
            job_timeout: self.config.job_timeout,
            renew_claims: self.config.renew_claims,
            counters: Arc::clone(&counters),
        });
        let dispatcher = Dispatcher {
            name: self.config.name.clone(),
            queue: self.queue.clone(),
            worker: self.worker,
            executor,
            concurrency: self.config.concurrency,
            lease: self.config.lease,
            rotation: RoundRobin::new(types),
            limits: self.config.dispatcher.limits(),
            in_flight: in_flight.clone(),
            backoff: PollBackoff::from_config(&self.config.dispatcher),
            default_drain: self.config.drain_timeout,
            tasks: JoinSet::new(),
        };

        let dispatcher = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
        let sweeper = tokio::spawn(run_sweeper(
            self.config.name.clone(),
            self.queue.clone(),
            self.config.reclaim_interval,
            shutdown_rx,
        ));

        Ok(PoolHandle {
            name: self.config.name,
            worker: self.worker,
            shutdown: shutdown_tx,
            dispatcher,
            sweeper,
            counters,
            in_flight,
        })
    }

    /// Registered types this pool should run, in a stable order.
    fn resolve_types(&self) -> QueueResult<Vec<String>> {
        let registry = self.queue.registry();
        let types = if self.config.dispatcher.types.is_empty() {
            registry.types()
        } else {
            let mut types = Vec::new();
            for job_type in &self.config.dispatcher.types {
                if !registry.contains(job_type) {
                    warn!(
                        pool = %self.config.name,
                        job_type = %job_type,
                        "no handler registered, type ignored"
                    );
                } else if !types.contains(job_type) {
                    types.push(job_type.clone());
                }
            }
            types
        };

        if types.is_empty() {
            return Err(QueueError::configuration(format!(
                "pool '{}' has no registered job types to run",
                self.config.name
            )));
        }
        Ok(types)
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    name: String,
    worker: WorkerId,
    shutdown: watch::Sender<Option<Duration>>,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    counters: Arc<Counters>,
    in_flight: InFlight,
}

impl PoolHandle {
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.in_flight.total())
    }

    /// Stop claiming, wait up to `drain_timeout` for running jobs, then abort
    /// the rest. Returns once every pool task has exited.
    pub async fn shutdown(self, drain_timeout: Duration) -> PoolStats {
        info!(pool = %self.name, "worker pool shutting down");
        // Both receivers live as long as their tasks; a send error means they already exited.
        let _ = self.shutdown.send(Some(drain_timeout));

        for (task, join) in [("dispatcher", self.dispatcher), ("sweeper", self.sweeper)] {
            if let Err(e) = join.await {
                error!(pool = %self.name, task, error = %e, "pool task ended abnormally");
            }
        }

        let stats = self.counters.snapshot(self.in_flight.total());
        info!(
            pool = %self.name,
            processed = stats.processed,
            succeeded = stats.succeeded,
            retried = stats.retried,
            failed = stats.failed,
            discarded = stats.discarded,
            "worker pool stopped"
        );
        stats
    }
}

async fn run_sweeper(
    name: String,
    queue: QueueManager,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if shutdown.borrow().is_some() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => match queue.reclaim_expired().await {
                Ok(0) => {}
                Ok(reclaimed) => {
                    info!(pool = %name, reclaimed, "recovered jobs with lapsed claims")
                }
                Err(e) => warn!(pool = %name, error = %e, "reclaim sweep failed"),
            },
            changed = shutdown.changed() => if changed.is_err() {
                break;
            },
        }
    }
    debug!(pool = %name, "sweeper stopped");
}

enum Execution {
    Finished(Outcome),
    ClaimLost,
}

/// Runs one claimed job in its slot.
pub(crate) struct Executor {
    queue: QueueManager,
    worker: WorkerId,
    lease: Duration,
    job_timeout: Option<Duration>,
    renew_claims: bool,
    counters: Arc<Counters>,
}

impl Executor {
    pub(crate) async fn run(&self, job: Job) {
        let span = info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts
        );
        self.execute(job).instrument(span).await
    }

    async fn execute(&self, job: Job) {
        self.queue.job_started(&job);
        let started = Instant::now();

        let execution = match self.queue.registry().get(&job.job_type) {
            Some(handler) => self.invoke(&job, handler).await,
            None => {
                warn!("no handler registered for job type");
                Execution::Finished(Outcome::FatalFailure(format!(
                    "no handler registered for job type '{}'",
                    job.job_type
                )))
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match execution {
            Execution::Finished(outcome) => outcome,
            Execution::ClaimLost => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                warn!(elapsed_ms, "claim lost during execution, result discarded");
                return;
            }
        };

        match self.queue.on_completion(&job, self.worker, &outcome).await {
            Ok(state) => {
                self.counters.record(state);
                debug!(state = %state, elapsed_ms, "execution recorded");
            }
            Err(QueueError::ClaimLost(_)) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                warn!(elapsed_ms, "claim lost before the outcome was recorded, result discarded");
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to record job outcome, job will be reclaimed after its lease"
                );
            }
        }
    }

    async fn invoke(&self, job: &Job, handler: Arc<dyn JobHandler>) -> Execution {
        let ctx = JobContext::from_job(job);
        let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(ctx).await }));

        let joined = tokio::select! {
            joined = wait_for(&mut task.0, self.job_timeout) => joined,
            () = self.hold_claim(job.id) => return Execution::ClaimLost,
        };

        let outcome = match joined {
            Some(Ok(result)) => Outcome::from(result),
            Some(Err(e)) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(panic = %message, "handler panicked");
                Outcome::RetryableFailure(format!("handler panicked: {message}"))
            }
            Some(Err(_)) => Outcome::RetryableFailure("handler cancelled".to_string()),
            None => {
                let limit = self.job_timeout.unwrap_or_default();
                warn!(timeout_ms = limit.as_millis() as u64, "handler timed out, aborting");
                Outcome::RetryableFailure(format!("timed out after {limit:?}"))
            }
        };
        Execution::Finished(outcome)
    }

    /// Renew the claim every `lease / 3`; returns only once the claim is lost.
    async fn hold_claim(&self, id: JobId) {
        if !self.renew_claims {
            return std::future::pending().await;
        }
        let every = (self.lease / 3).max(Duration::from_millis(10));
        let mut ticker = time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.queue.renew(id, self.worker, self.lease).await {
                Ok(expires) => debug!(%expires, "claim renewed"),
                Err(QueueError::ClaimLost(_)) | Err(QueueError::NotFound(_)) => {
                    warn!("claim lost while handler was running");
                    return;
                }
                Err(e) => warn!(error = %e, "claim renewal failed"),
            }
        }
    }
}

/// Aborts the handler task if the execution is dropped or gives up on it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn wait_for<T>(
    task: &mut JoinHandle<T>,
    limit: Option<Duration>,
) -> Option<Result<T, JoinError>> {
    match limit {
        Some(limit) => time::timeout(limit, task).await.ok(),
        None => Some(task.await),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmill_core::HandlerError;
    use taskmill_infra::InMemoryJobStore;

    use crate::registry::{HandlerRegistry, handler_fn};

    fn queue(types: &[&str]) -> QueueManager {
        let mut registry = HandlerRegistry::new();
        for job_type in types {
            registry
                .register(*job_type, handler_fn(|_ctx| async { Ok::<(), HandlerError>(()) }))
                .unwrap();
        }
        QueueManager::new(InMemoryJobStore::arc(), Arc::new(registry))
    }

    #[test]
    fn invalid_configs_are_rejected() {
        for config in [
            PoolConfig::default().with_concurrency(0),
            PoolConfig::default().with_lease(Duration::ZERO),
            PoolConfig::default().with_reclaim_interval(Duration::ZERO),
        ] {
            assert!(matches!(config.validate(), Err(QueueError::Configuration(_))));
        }
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn resolves_registered_types_only() {
        let pool = WorkerPool::new(
            queue(&["email.send", "report"]),
            PoolConfig::default().with_dispatcher(
                DispatcherConfig::default().with_types(["report", "sms.send", "report"]),
            ),
        );
        assert_eq!(pool.resolve_types().unwrap(), vec!["report".to_string()]);

        let all = WorkerPool::new(queue(&["report", "email.send"]), PoolConfig::default());
        assert_eq!(
            all.resolve_types().unwrap(),
            vec!["email.send".to_string(), "report".to_string()]
        );

        let none = WorkerPool::new(
            queue(&["report"]),
            PoolConfig::default()
                .with_dispatcher(DispatcherConfig::default().with_types(["sms.send"])),
        );
        assert!(matches!(none.resolve_types(), Err(QueueError::Configuration(_))));
    }

    #[test]
    fn panic_messages_are_extracted() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42u8)), "non-string panic payload");
    }

    #[tokio::test]
    async fn idle_pool_shuts_down_promptly() {
        let handle = WorkerPool::new(queue(&["report"]), PoolConfig::default()).spawn().unwrap();

        let stats = time::timeout(Duration::from_secs(5), handle.shutdown(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(stats, PoolStats::default());
    }
}
