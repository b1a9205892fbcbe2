//! surfq - FreeSurfer job orchestrator
//!
//! `serve` runs the orchestrator (startup reconciliation, then the monitor
//! loops). Every other command works on the same state file without
//! launching anything, so jobs submitted here are picked up by `serve`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use surfq_core::app::{Orchestrator, OrchestratorBuilder, ReconcileMode};
use surfq_core::config::Settings;
use surfq_core::domain::{AnomalySubject, JobFilter, JobId, JobInput, JobStatus, JobView};
use surfq_core::impls::{FileJobStore, ProcessWorker};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "surfq")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `store.path`
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator until Ctrl-C
    Serve,

    /// Queue a new job
    Submit {
        /// Input artifact (e.g. a T1 NIfTI file)
        input: PathBuf,

        /// Patient metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// List jobs, oldest first
    #[command(alias = "ls")]
    List {
        /// Only jobs in these statuses (repeatable)
        #[arg(long = "status")]
        statuses: Vec<JobStatus>,

        #[arg(long)]
        limit: Option<usize>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one job as JSON
    Show { id: JobId },

    /// Fail a PENDING or RUNNING job
    ForceFail { id: JobId, reason: String },

    /// Resubmit a FAILED job's input as a new job
    Requeue { id: JobId },

    /// Check RUNNING jobs against the runtime (uses the probe command)
    Reconcile,

    /// List tracked anomalies
    Anomalies,

    /// Approve cleanup of an anomaly (`job-<ulid>` or a process reference)
    Approve { subject: AnomalySubject },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("surfq=info,surfq_core=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(store) = cli.store {
        settings.store.path = store;
    }

    match cli.command {
        Commands::Serve => serve(settings).await,
        Commands::Submit { input, metadata } => {
            let orchestrator = build(&settings, true).await?;
            let mut job = JobInput::new(input);
            if let Some(raw) = metadata {
                let value: serde_json::Value =
                    serde_json::from_str(&raw).context("--metadata must be valid JSON")?;
                job = job.with_metadata(value);
            }
            let id = orchestrator.submit_job(job).await?;
            println!("{id}");
            Ok(())
        }
        Commands::List {
            statuses,
            limit,
            json,
        } => {
            let orchestrator = build(&settings, true).await?;
            let filter = JobFilter { statuses, limit };
            let jobs = orchestrator.list_jobs(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_table(&jobs);
            }
            Ok(())
        }
        Commands::Show { id } => {
            let orchestrator = build(&settings, true).await?;
            let Some(job) = orchestrator.get_job(id).await? else {
                bail!("job {id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Commands::ForceFail { id, reason } => {
            let orchestrator = build(&settings, true).await?;
            let job = orchestrator.force_fail(id, &reason).await?;
            println!("{} {}", job.id, job.status);
            Ok(())
        }
        Commands::Requeue { id } => {
            let orchestrator = build(&settings, true).await?;
            let new_id = orchestrator.requeue(id).await?;
            println!("{new_id}");
            Ok(())
        }
        Commands::Reconcile => {
            if settings.worker.probe.is_none() {
                bail!("reconcile outside `serve` needs worker.probe to confirm liveness");
            }
            let orchestrator = build(&settings, true).await?;
            let report = orchestrator.reconcile(ReconcileMode::Startup).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Anomalies => {
            let orchestrator = build(&settings, true).await?;
            let anomalies = orchestrator.anomalies().await?;
            println!("{}", serde_json::to_string_pretty(&anomalies)?);
            Ok(())
        }
        Commands::Approve { subject } => {
            let orchestrator = build(&settings, true).await?;
            orchestrator.approve_cleanup(&subject).await?;
            println!("approved {subject}");
            Ok(())
        }
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn build(settings: &Settings, passive: bool) -> Result<Arc<Orchestrator>> {
    let store = FileJobStore::open(&settings.store.path)
        .await
        .with_context(|| format!("opening job store {}", settings.store.path.display()))?;
    let mut builder = OrchestratorBuilder::new()
        .store(Arc::new(store))
        .worker(Arc::new(ProcessWorker::new(settings.worker.clone())))
        .config(settings.orchestrator.clone());
    if passive {
        builder = builder.passive();
    }
    Ok(builder.build()?)
}

async fn serve(settings: Settings) -> Result<()> {
    let orchestrator = build(&settings, false).await?;
    info!(
        store = %settings.store.path.display(),
        concurrency_limit = settings.orchestrator.concurrency_limit,
        queue_depth_limit = settings.orchestrator.queue_depth_limit,
        "surfq starting"
    );

    orchestrator
        .reconcile(ReconcileMode::Startup)
        .await
        .context("startup reconciliation")?;
    let monitors = orchestrator.spawn_monitors();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested; running units keep going and are reconciled on next start");
    monitors.shutdown_and_join().await;
    Ok(())
}

fn print_table(jobs: &[JobView]) {
    println!(
        "{:<32} {:<10} {:>4}  {:<28} {}",
        "ID", "STATUS", "PCT", "STEP", "ERROR"
    );
    for job in jobs {
        println!(
            "{:<32} {:<10} {:>3}%  {:<28} {}",
            job.id.to_string(),
            job.status.as_str(),
            job.progress,
            job.current_step.as_deref().unwrap_or("-"),
            job.error_message.as_deref().unwrap_or("")
        );
    }
}
