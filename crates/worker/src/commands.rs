//! Subcommand implementations.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{info, warn};

use taskmill_core::EnqueueOptions;
use taskmill_infra::{DATABASE_URL_ENV, PostgresJobStore, StoreConfig, connect};
use taskmill_jobs::{QueueManager, WorkerPool};

use crate::cli::{Cli, Command, EnqueueArgs, RunArgs};
use crate::handlers;

/// Run the parsed command line, writing command output to `out`.
pub async fn execute<W: Write>(cli: Cli, out: &mut W) -> anyhow::Result<()> {
    let store_config = store_config(&cli)?;

    if let Command::Migrate = cli.command {
        return migrate(&store_config, out).await;
    }

    let store = connect(&store_config)
        .await
        .with_context(|| format!("connecting to {} job store", store_config.kind()))?;
    let registry = handlers::registry(&cli.queue_types).context("invalid --queue-types")?;
    let queue = QueueManager::new(store, Arc::new(registry));

    match cli.command {
        Command::Migrate => Ok(()),
        Command::Run(args) => run(queue, &cli.queue_types, &args).await,
        Command::Enqueue(args) => enqueue(&queue, &args, out).await,
        Command::Cancel { id } => {
            let cancelled = queue.cancel(id).await.context("cancelling job")?;
            if cancelled {
                writeln!(out, "cancelled {id}")?;
            } else {
                writeln!(out, "{id} is running or already finished; not cancelled")?;
            }
            Ok(())
        }
        Command::Stats => {
            let stats = queue.stats().await.context("reading job stats")?;
            writeln!(out, "{}", serde_json::to_string_pretty(&stats)?)?;
            Ok(())
        }
        Command::Reclaim => {
            let reclaimed = queue.reclaim_expired().await.context("reclaiming lapsed claims")?;
            writeln!(out, "reclaimed {reclaimed} job(s)")?;
            Ok(())
        }
    }
}

fn store_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let Some(url) = cli.database_url.as_deref() else {
        bail!("no job store configured: pass --database-url or set {DATABASE_URL_ENV}");
    };
    let config = StoreConfig::from_url(url).context("invalid database url")?;
    Ok(config.with_max_connections(cli.max_connections))
}

async fn migrate<W: Write>(config: &StoreConfig, out: &mut W) -> anyhow::Result<()> {
    match config {
        StoreConfig::Memory => {
            warn!("memory:// store has no schema to migrate");
        }
        StoreConfig::Postgres(pg) => {
            let store = PostgresJobStore::connect(pg)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("creating job schema")?;
        }
    }
    writeln!(out, "schema ready ({})", config.kind())?;
    Ok(())
}

async fn run(queue: QueueManager, types: &[String], args: &RunArgs) -> anyhow::Result<()> {
    let pool = WorkerPool::new(queue, args.pool_config(types))
        .spawn()
        .context("starting worker pool")?;
    info!(worker = %pool.worker_id(), types = ?types, "worker running; Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;

    let drain = args.drain_timeout();
    info!(drain_timeout_secs = drain.as_secs(), "shutdown requested, draining");
    pool.shutdown(drain).await;
    Ok(())
}

async fn enqueue<W: Write>(
    queue: &QueueManager,
    args: &EnqueueArgs,
    out: &mut W,
) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;

    let mut options = EnqueueOptions::new().with_priority(args.priority);
    if let Some(secs) = args.delay_secs {
        options = options.with_delay(Duration::from_secs(secs));
    }
    if let Some(max_attempts) = args.max_attempts {
        options = options.with_max_attempts(max_attempts);
    }

    let id = queue
        .enqueue_json(&args.job_type, payload, options)
        .await
        .with_context(|| format!("enqueueing '{}' job", args.job_type))?;
    writeln!(out, "{id}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    async fn run_cli(args: &[&str]) -> anyhow::Result<String> {
        let argv = std::iter::once("taskmill-worker").chain(args.iter().copied());
        let cli = Cli::try_parse_from(argv)?;
        let mut out = Vec::new();
        execute(cli, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    #[tokio::test]
    async fn enqueue_prints_the_job_id() {
        let out = run_cli(&["--database-url", "memory://", "enqueue", "log", r#"{"n":1}"#])
            .await
            .unwrap();

        assert!(out.trim().parse::<taskmill_core::JobId>().is_ok(), "{out}");
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_types_and_bad_json() {
        let unknown = run_cli(&["--database-url", "memory://", "enqueue", "invoice", "{}"]).await;
        assert!(unknown.is_err());

        let bad_json = run_cli(&["--database-url", "memory://", "enqueue", "log", "{nope"]).await;
        assert!(format!("{:#}", bad_json.unwrap_err()).contains("not valid JSON"));
    }

    #[tokio::test]
    async fn stats_prints_json_counts() {
        let out = run_cli(&["--database-url", "memory://", "stats"]).await.unwrap();
        let stats: serde_json::Value = serde_json::from_str(&out).unwrap();

        assert_eq!(stats["created"], 0);
        assert_eq!(stats["expired"], 0);
    }

    #[tokio::test]
    async fn misconfigured_store_is_an_error() {
        let bad = run_cli(&["--database-url", "mysql://localhost/jobs", "stats"]).await;
        assert!(format!("{:#}", bad.unwrap_err()).contains("unsupported database scheme"));

        let memory = run_cli(&["--database-url", "memory://", "migrate"]).await.unwrap();
        assert_eq!(memory.trim(), "schema ready (memory)");
    }
}
