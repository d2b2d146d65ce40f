use std::sync::Arc;

use clap::Parser;

use factura_core::broker;
use factura_core::startup::ReadinessPolicy;
use factura_core::store::MemoryStore;
use factura_core::{App, Config, JobEvent, Settings};

#[derive(Parser, Debug)]
#[command(name = "factura")]
#[command(about = "Asynchronous invoice extraction pipeline")]
struct Args {
    /// Override the number of parallel job workers
    #[arg(long)]
    workers: Option<usize>,
    /// Abort startup if the broker stays unreachable
    #[arg(long)]
    fail_fast: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("factura=info".parse()?)
                .add_directive("factura_core=info".parse()?),
        )
        .init();

    tracing::info!("Starting factura daemon");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::load_or_default();
    config.ensure_dirs()?;
    tracing::info!("Data directory: {:?}", config.data_dir);

    let mut settings = Settings::load(&config.settings_file);
    if let Some(workers) = args.workers {
        settings.worker_concurrency = workers;
    }
    if args.fail_fast {
        settings.readiness_policy = ReadinessPolicy::FailFast;
    }

    let broker = broker::in_memory();
    let store = Arc::new(MemoryStore::new(config.spool_dir.clone()));

    let (app, mut events) = App::start(settings, broker, store).await?;

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Enqueued {
                    job_id,
                    document_id,
                } => tracing::info!(%job_id, %document_id, "Job enqueued"),
                JobEvent::Started { job_id, attempt } => {
                    tracing::info!(%job_id, attempt, "Job attempt started")
                }
                JobEvent::Retrying {
                    job_id,
                    attempt,
                    delay,
                } => tracing::warn!(%job_id, attempt, delay_ms = delay.as_millis() as u64, "Job retrying"),
                JobEvent::Completed {
                    job_id,
                    needs_human_review,
                } => tracing::info!(%job_id, needs_human_review, "Job completed"),
                JobEvent::Failed {
                    job_id,
                    attempts,
                    error,
                } => tracing::error!(%job_id, attempts, %error, "Job failed"),
            }
        }
    });

    tracing::info!("Pipeline running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    app.shutdown().await;
    event_log.abort();
    Ok(())
}
