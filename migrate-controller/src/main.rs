use anyhow::{bail, Context, Result};
use clap::Parser;
use migrate::sim::Simulation;
use migrate::{Engine, EngineConfig, MigrationSpec, PhaseChangeEvent, WorkerNodeSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "migrate-controller")]
#[command(about = "Stellaris Migrate controller")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "migrate.toml")]
    config: PathBuf,

    /// YAML manifest of migrations and workers to create at startup
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Run against in-memory platforms instead of real ones
    #[arg(long, env = "MIGRATE_SIMULATE")]
    simulate: bool,
}

/// Records seeded at startup
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    workers: Vec<NamedWorker>,

    #[serde(default)]
    migrations: Vec<NamedMigration>,

    /// Source VMs to create in simulation mode
    #[serde(default)]
    source_vms: Vec<SimulatedVm>,
}

#[derive(Debug, Deserialize)]
struct NamedWorker {
    name: String,
    #[serde(default)]
    spec: WorkerNodeSpec,
}

#[derive(Debug, Deserialize)]
struct NamedMigration {
    name: String,
    spec: MigrationSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulatedVm {
    name: String,
    #[serde(default)]
    disks: Vec<SimulatedDisk>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulatedDisk {
    name: String,
    size_bytes: u64,
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing manifest {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,migrate=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting migrate controller");
    tracing::info!("Config file: {}", args.config.display());

    let config = EngineConfig::load_or_default(&args.config)?;
    if let Some(dir) = &config.state_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
    }

    let manifest = match &args.manifest {
        Some(path) => load_manifest(path)?,
        None => Manifest::default(),
    };

    if !args.simulate {
        bail!("no platform drivers are compiled into this build; run with --simulate");
    }

    let sim = Simulation::new();
    for vm in &manifest.source_vms {
        let disks: Vec<(&str, u64)> = vm
            .disks
            .iter()
            .map(|d| (d.name.as_str(), d.size_bytes))
            .collect();
        sim.source.add_vm(&vm.name, &disks);
    }
    tracing::info!(
        "Simulation mode: {} source VMs registered",
        manifest.source_vms.len()
    );

    let engine = Engine::new(config, sim.collaborators())?;

    for worker in manifest.workers {
        if engine.worker(&worker.name).is_some() {
            tracing::debug!("Worker {} already exists", worker.name);
            continue;
        }
        engine.add_worker(&worker.name, worker.spec)?;
        tracing::info!("Added worker {}", worker.name);
    }
    for migration in manifest.migrations {
        if engine.migration(&migration.name).is_some() {
            tracing::debug!("Migration {} already exists", migration.name);
            continue;
        }
        engine.submit_migration(&migration.name, migration.spec)?;
        tracing::info!("Submitted migration {}", migration.name);
    }

    tokio::spawn(log_phase_changes(engine.subscribe()));

    engine.start();
    tracing::info!("Controller running in namespace {}", engine.namespace());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    engine.shutdown().await;

    let summary = engine.summary();
    tracing::info!(
        "Migrations by phase: {:?}; workers by phase: {:?}; busy workers: {}",
        summary.migrations,
        summary.workers,
        summary.busy_workers
    );

    Ok(())
}

/// Log every phase change until the engine goes away. Returns how many were logged.
async fn log_phase_changes(mut phases: broadcast::Receiver<PhaseChangeEvent>) -> usize {
    let mut logged = 0;
    loop {
        match phases.recv().await {
            Ok(event) => {
                tracing::info!(
                    "Migration {}: {} -> {} ({})",
                    event.migration,
                    event.from,
                    event.to,
                    event.reason.as_deref().unwrap_or("-")
                );
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Phase logger fell behind, skipped {} events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
    }
}
