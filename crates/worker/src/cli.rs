//! Command line arguments.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use taskmill_core::JobId;
use taskmill_jobs::{DispatcherConfig, PoolConfig};
use taskmill_observability::LogFormat;

/// Durable job queue worker
#[derive(Parser, Debug)]
#[command(name = "taskmill-worker", version)]
pub struct Cli {
    /// Job store URI: postgres://… or memory://
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Job types served by the built-in `log` handler (comma separated)
    #[arg(
        long,
        env = "TASKMILL_QUEUE_TYPES",
        value_delimiter = ',',
        default_value = "log",
        global = true
    )]
    pub queue_types: Vec<String>,

    /// Maximum database connections
    #[arg(long, env = "TASKMILL_MAX_CONNECTIONS", default_value_t = 10, global = true)]
    pub max_connections: u32,

    /// Log output: json or pretty
    #[arg(long, env = "TASKMILL_LOG_FORMAT", default_value = "json", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the job table and indexes if missing
    Migrate,
    /// Run a worker pool until Ctrl-C, then drain
    Run(RunArgs),
    /// Submit a job
    Enqueue(EnqueueArgs),
    /// Cancel a job that is not running
    Cancel {
        /// Job id
        id: JobId,
    },
    /// Print job counts per state as JSON
    Stats,
    /// Recover jobs whose claim lapsed
    Reclaim,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Executor slots
    #[arg(long, env = "TASKMILL_CONCURRENCY", default_value_t = 4)]
    pub concurrency: usize,

    /// Claim lease in seconds; renewed every third while a job runs
    #[arg(long, env = "TASKMILL_LEASE_SECS", default_value_t = 30)]
    pub lease_secs: u64,

    /// Idle poll interval in milliseconds
    #[arg(long, env = "TASKMILL_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Upper bound for the idle poll backoff in milliseconds
    #[arg(long, env = "TASKMILL_MAX_POLL_INTERVAL_MS", default_value_t = 5000)]
    pub max_poll_interval_ms: u64,

    /// Seconds between reclaim sweeps
    #[arg(long, env = "TASKMILL_RECLAIM_INTERVAL_SECS", default_value_t = 15)]
    pub reclaim_interval_secs: u64,

    /// Abort a handler after this many seconds (0 disables)
    #[arg(long, env = "TASKMILL_JOB_TIMEOUT_SECS", default_value_t = 300)]
    pub job_timeout_secs: u64,

    /// Seconds to wait for running jobs on shutdown
    #[arg(long, env = "TASKMILL_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Per-type in-flight cap, as TYPE=N (repeatable)
    #[arg(long = "type-limit", value_parser = parse_type_limit)]
    pub type_limits: Vec<(String, usize)>,
}

impl RunArgs {
    pub fn pool_config(&self, types: &[String]) -> PoolConfig {
        let mut dispatcher = DispatcherConfig::default()
            .with_types(types.iter().cloned())
            .with_poll_interval(
                Duration::from_millis(self.poll_interval_ms),
                Duration::from_millis(self.max_poll_interval_ms),
            );
        for (job_type, limit) in &self.type_limits {
            dispatcher = dispatcher.with_type_limit(job_type.clone(), *limit);
        }

        PoolConfig::default()
            .with_concurrency(self.concurrency)
            .with_lease(Duration::from_secs(self.lease_secs))
            .with_reclaim_interval(Duration::from_secs(self.reclaim_interval_secs))
            .with_job_timeout(
                (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs)),
            )
            .with_drain_timeout(self.drain_timeout())
            .with_dispatcher(dispatcher)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Args, Debug, Clone)]
pub struct EnqueueArgs {
    /// Job type
    pub job_type: String,

    /// JSON payload
    #[arg(default_value = "{}")]
    pub payload: String,

    /// Higher runs first
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i32,

    /// Do not run before this many seconds from now
    #[arg(long)]
    pub delay_secs: Option<u64>,

    /// Attempts before the job fails for good
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

fn parse_type_limit(s: &str) -> Result<(String, usize), String> {
    let (job_type, limit) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TYPE=N, got '{s}'"))?;
    let job_type = job_type.trim();
    if job_type.is_empty() {
        return Err(format!("missing job type in '{s}'"));
    }
    let limit = limit
        .trim()
        .parse()
        .map_err(|e| format!("invalid limit in '{s}': {e}"))?;
    Ok((job_type.to_string(), limit))
}
