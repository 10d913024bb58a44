//! Cycle Coordination demonstration harness
//!
//! Wires the coordinator, evolution scheduler and scripted in-process
//! workers together and runs a number of improvement cycles.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cycle_coordination::config::{CoordinatorConfig, StorageBackend};
use cycle_coordination::telemetry::init_tracing;
use cycle_coordination::{
    Capability, CoordinatorError, EventBus, EvolutionEngine, EvolutionScheduler, MemoryStore,
    MessageChannel, Proposal, ResourceSet, SessionCoordinator, SharedPersistence, TaskSpec,
    ThresholdEvolutionPolicy, Worker, WorkerHandle, WorkerMessage, WorkerRegistry,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (environment variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// RocksDB state directory (implies the rocks backend)
    #[arg(long)]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scripted improvement cycles against in-process workers
    Simulate {
        /// Number of sessions to run
        #[arg(long, default_value_t = 10)]
        sessions: usize,

        /// Initial workers per capability
        #[arg(long, default_value_t = 3)]
        workers_per_capability: usize,

        /// Tasks per capability in each session
        #[arg(long, default_value_t = 2)]
        tasks_per_capability: usize,

        /// Collection deadline in milliseconds (overrides the config)
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Resolve without marking decisions as applicable
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

fn load_config(args: &Args) -> Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };
    config.apply_env().context("Invalid COORDINATOR_* environment")?;

    if let Some(path) = &args.state_path {
        config.persistence.backend = StorageBackend::Rocks;
        config.persistence.path = path.clone();
    }
    let Command::Simulate {
        deadline_ms,
        dry_run,
        ..
    } = &args.command;
    if let Some(ms) = deadline_ms {
        config.session.task_deadline_ms = *ms;
    }
    if *dry_run {
        config.session.dry_run = true;
    }
    config.validate()?;
    Ok(config)
}

fn open_store(config: &CoordinatorConfig) -> Result<SharedPersistence> {
    match config.persistence.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "heavy-state")]
        StorageBackend::Rocks => {
            let store = cycle_coordination::state::RocksStore::open(&config.persistence.path)
                .with_context(|| {
                    format!("Failed to open state at {}", config.persistence.path.display())
                })?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "heavy-state"))]
        StorageBackend::Rocks => {
            anyhow::bail!("the rocks backend requires building with --features heavy-state")
        }
    }
}

/// Deterministic per-worker quality in [0.2, 1.0), derived from the id
fn worker_quality(worker_id: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    worker_id.hash(&mut hasher);
    0.2 + (hasher.finish() % 800) as f64 / 1000.0
}

/// Scripted worker: answers each assignment with a proposal whose
/// confidence is its fixed quality; low-quality workers also touch a
/// shared file, so they collide with each other.
fn spawn_scripted_worker(mut handle: WorkerHandle) {
    let quality = worker_quality(handle.worker_id());
    tokio::spawn(async move {
        while let Some(envelope) = handle.recv().await {
            handle.ack(envelope.seq);
            let WorkerMessage::AssignTask(task) = envelope.message else {
                continue;
            };
            let mut resources = ResourceSet::new();
            resources.insert(task.scope.clone());
            if quality < 0.5 {
                resources.insert("shared/common.rs");
            }
            let proposal = Proposal::new(
                handle.worker_id(),
                task.session_id,
                task.task_id,
                resources,
                format!("patch for {}", task.scope).into_bytes(),
                quality,
            )
            .with_description(format!("{} change to {}", task.capability, task.scope));
            if handle.submit(proposal).await.is_err() {
                break;
            }
        }
    });
}

/// Attach scripted behavior to active workers that have no connection yet,
/// such as replacements spawned by evolution
async fn connect_new_workers(
    registry: &WorkerRegistry,
    channel: &MessageChannel,
    connected: &mut HashSet<String>,
) -> Result<()> {
    for load in registry.snapshot()? {
        if load.worker.is_active() && connected.insert(load.worker.id.clone()) {
            info!(worker_id = %load.worker.id, generation = load.worker.generation, "Connecting spawned worker");
            spawn_scripted_worker(channel.connect(&load.worker.id).await);
        }
    }
    Ok(())
}

async fn simulate(
    config: CoordinatorConfig,
    sessions: usize,
    workers_per_capability: usize,
    tasks_per_capability: usize,
) -> Result<()> {
    let capabilities = [Capability::Code, Capability::Test, Capability::Doc];

    let store = open_store(&config)?;
    let registry = Arc::new(WorkerRegistry::new());
    let (channel, submissions) = MessageChannel::new(config.channel.clone());
    let channel = channel.shared();
    let events = EventBus::new().shared();

    let coordinator = SessionCoordinator::new(
        &config,
        Arc::clone(&registry),
        Arc::clone(&channel),
        submissions,
        Arc::clone(&store),
        Arc::clone(&events),
    );

    let engine = Arc::new(EvolutionEngine::new(
        config.evolution.clone(),
        config.persistence.retry.clone(),
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&events),
        Arc::new(ThresholdEvolutionPolicy::from_config(&config.evolution)),
    ));
    let scheduler =
        EvolutionScheduler::spawn(Arc::clone(&engine), &events, config.evolution.sessions_per_pass);

    let mut connected = HashSet::new();
    for capability in capabilities {
        for _ in 0..workers_per_capability {
            let worker = Worker::new(capability);
            connected.insert(worker.id.clone());
            spawn_scripted_worker(coordinator.enroll_worker(worker).await?);
        }
    }

    let specs: Vec<TaskSpec> = capabilities
        .iter()
        .flat_map(|capability| {
            (0..tasks_per_capability)
                .map(move |i| TaskSpec::new(*capability, format!("src/{capability}/{i}.rs")))
        })
        .collect();

    for cycle in 1..=sessions {
        connect_new_workers(&registry, &channel, &mut connected).await?;

        let mut active = match coordinator.create_session(&specs).await {
            Ok(active) => active,
            Err(CoordinatorError::CapacityExceeded(caps)) => {
                warn!(cycle, %caps, "No workers available, stopping");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        coordinator.assign(&mut active).await?;
        coordinator.collect(&mut active).await?;

        let mut attempts = 0;
        let decision = loop {
            match coordinator.resolve(&mut active).await {
                Ok(decision) => break decision,
                Err(CoordinatorError::PersistenceUnavailable(msg)) if attempts < 5 => {
                    attempts += 1;
                    warn!(cycle, attempts, error = %msg, "Decision not durable yet, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!(
            cycle,
            session_id = %active.id(),
            accepted = decision.accepted.len(),
            rejected = decision.rejected.len(),
            timed_out = decision.timed_out.len(),
            "Cycle complete"
        );

        // Give the scheduler a moment to run a due pass before the next cycle
        tokio::task::yield_now().await;
    }

    let late = coordinator.drain_late_submissions().await?;
    if !late.is_empty() {
        info!(count = late.len(), "Late proposals rejected");
    }

    let passes = scheduler.shutdown().await;
    let metrics = coordinator.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    println!(
        "acceptance rate: {:.2}, evolution passes: {}, workers: {}",
        metrics.acceptance_rate(),
        passes,
        registry.snapshot()?.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing("cycle_coordination=info");

    let config = load_config(&args)?;
    match args.command {
        Command::Simulate {
            sessions,
            workers_per_capability,
            tasks_per_capability,
            ..
        } => {
            info!(
                sessions,
                workers_per_capability,
                backend = ?config.persistence.backend,
                "Starting simulation"
            );
            simulate(config, sessions, workers_per_capability, tasks_per_capability).await
        }
    }
}
