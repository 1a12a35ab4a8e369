//! binsyncd: the replication daemon.
//!
//! Loads a YAML configuration, wires the engine, the worker pool and the
//! checkpoint store together, and runs until a termination signal or a
//! fatal replication error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser as ClapParser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use binsync::checkpoint::{open_store, PointStore};
use binsync::pipeline::Pipeline;
use binsync::slave::{ReplicationPoint, Slave};
use binsync::worker::{DispatchPolicy, WorkerManager};
use binsync::AppConfig;

#[derive(Debug, ClapParser)]
#[command(name = "binsyncd", version, about = "MySQL replication slave emulator and stream processor")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Cancel the root token on SIGHUP/SIGINT/SIGTERM/SIGQUIT.
fn spawn_signal_task(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGHUP handler: {e}");
                return;
            }
        };
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGINT handler: {e}");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGQUIT handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = hangup.recv() => info!("got SIGHUP"),
            _ = interrupt.recv() => info!("got SIGINT"),
            _ = terminate.recv() => info!("got SIGTERM"),
            _ = quit.recv() => info!("got SIGQUIT"),
        }
        cancel.cancel();
    });
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config: AppConfig =
        serde_yaml::from_str(&raw).context("parsing config file")?;

    init_logging(&config.log.level);

    // Rule conflicts surface here, before anything connects.
    let rule = Arc::new(
        config
            .sync_rule
            .build()
            .context("building sync rules")?,
    );

    let store = open_store(&config.storage_source)
        .await
        .context("opening checkpoint store")?;
    let points = PointStore::new(store);
    let start_point = points
        .read_point()
        .await
        .context("reading persisted replication point")?
        .unwrap_or_else(|| {
            info!("no persisted replication point, starting from the primary's current file");
            ReplicationPoint::default()
        });

    let policy = DispatchPolicy::try_from(config.dispatch_policy)?;
    let manager = WorkerManager::new(&config.worker)
        .await
        .context("starting worker pool")?;

    let metadata_source = config
        .data_sources
        .first()
        .cloned()
        .context("data-sources must not be empty")?;

    let mut slave = Slave::new(
        config.data_sources.clone(),
        config.replication.clone(),
        rule,
    );
    slave
        .start(start_point)
        .await
        .context("starting replication")?;

    let cancel = CancellationToken::new();
    spawn_signal_task(cancel.clone());

    let pipeline = Pipeline::new(slave, manager, points, policy, &metadata_source, cancel);
    pipeline.run().await.context("replication pipeline failed")?;

    info!("clean shutdown");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be initialized if config parsing failed.
        eprintln!("binsyncd: {e:#}");
        std::process::exit(1);
    }
}
