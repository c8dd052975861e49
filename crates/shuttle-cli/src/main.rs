mod executor;

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use shuttle_core::app::{BackgroundLoops, CoordinatorContext, Node, NodeBuilder};
use shuttle_core::config::CoordinationConfig;
use shuttle_core::domain::{StoreError, TaskId, WorkspaceSlot};
use shuttle_core::ports::{Backlog, TaskExecutor};
use tokio::sync::watch;
use tracing::{Instrument, info, warn};
use tracing_subscriber::EnvFilter;

use crate::executor::{CommandExecutor, SimulatedExecutor};

#[derive(Debug, Parser)]
#[command(
    name = "shuttle",
    version,
    about = "Lease and claim coordination for agents sharing a task backlog"
)]
struct Cli {
    /// TOML config file; `SHUTTLE_*` variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Claim and run tasks until interrupted or the list is done
    Worker {
        /// Candidate task ids, in preference order
        #[arg(long = "task", required = true)]
        tasks: Vec<String>,
        /// Agent name within this instance
        #[arg(long, default_value = "agent")]
        agent: String,
        /// Shell command run for each task (SHUTTLE_TASK_ID / SHUTTLE_SLOT_ID are set)
        #[arg(long)]
        exec: Option<String>,
        /// Without --exec, pretend each task takes this long
        #[arg(long, default_value_t = 5)]
        work_secs: u64,
    },
    /// Show the lease record and tags of one task
    Inspect { task: String },
    /// Count leases by state
    Status,
    /// Run one stale sweep now
    Sweep {
        /// Sweep even if this instance is not the elected coordinator
        #[arg(long)]
        force: bool,
    },
    /// Mark a task as never to be auto-claimed
    Ignore {
        task: String,
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
    /// Zero a task's retry count and make it claimable again
    Reset { task: String },
    /// List workspace slots on this host
    Slots,
    /// Show live instances and the elected coordinator
    Coordinator,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Worker { .. } => "worker",
            Self::Inspect { .. } => "inspect",
            Self::Status => "status",
            Self::Sweep { .. } => "sweep",
            Self::Ignore { .. } => "ignore",
            Self::Reset { .. } => "reset",
            Self::Slots => "slots",
            Self::Coordinator => "coordinator",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let span = tracing::info_span!("command", name = cli.command.name());

    match run(cli).instrument(span).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CoordinationConfig::load(cli.config.as_deref()).context("loading config")?;
    let node = NodeBuilder::new(config)
        .file_backed()
        .await
        .context("opening data dir")?
        .build()
        .context("building node")?;

    match cli.command {
        Commands::Worker {
            tasks,
            agent,
            exec,
            work_secs,
        } => {
            let executor: Arc<dyn TaskExecutor> = match exec {
                Some(command) => Arc::new(CommandExecutor::new(command)),
                None => Arc::new(SimulatedExecutor::new(Duration::from_secs(work_secs))),
            };
            run_worker(&node, &agent, tasks, executor).await
        }
        Commands::Inspect { task } => {
            let inspection = node.leases().inspect(&TaskId::new(task)).await?;
            print_json(&inspection)
        }
        Commands::Status => print_json(&node.leases().counts().await?),
        Commands::Sweep { force } => {
            let ctx = if force {
                CoordinatorContext::assume(node.instance_id().clone(), node.leases().now())
            } else {
                node.presence().heartbeat().await?;
                node.presence().coordinator_context().await?
            };
            let report = node.sweeper().sweep(&ctx).await?;
            if report.was_skipped() {
                warn!(
                    coordinator = ?ctx.coordinator(),
                    "not the coordinator; use --force to sweep anyway"
                );
            }
            print_json(&report)
        }
        Commands::Ignore { task, reason } => {
            let record = node
                .leases()
                .mark_ignored(&TaskId::new(task), &node.owner("operator"), &reason)
                .await?;
            print_json(&record)
        }
        Commands::Reset { task } => {
            let task_id = TaskId::new(task);
            match node.leases().reset(&task_id).await? {
                Some(record) => print_json(&record),
                None => bail!("no lease record for {task_id}"),
            }
        }
        Commands::Slots => print_json(&node.allocator().slots().await?),
        Commands::Coordinator => {
            let ctx = node.presence().coordinator_context().await?;
            print_json(&ctx)
        }
    }
}

async fn run_worker(
    node: &Node,
    agent: &str,
    tasks: Vec<String>,
    executor: Arc<dyn TaskExecutor>,
) -> anyhow::Result<()> {
    let background = node.spawn_background();
    let (done_tx, done_rx) = watch::channel(false);
    let backlog = PendingTasks::new(tasks.into_iter().map(TaskId::new), done_tx);
    let stop = merged_shutdown(&background, done_rx);
    let worker = node.worker(agent, stop);

    let executor = TrackingExecutor {
        inner: executor,
        backlog: &backlog,
    };
    let summary = worker.run(&backlog, &executor).await;

    background.shutdown_and_join().await;
    print_json(&summary)
}

/// Fires on ctrl-c, when the background loops stop, or when the task list is done.
fn merged_shutdown(
    background: &BackgroundLoops,
    mut done: watch::Receiver<bool>,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let mut loops = background.subscribe();

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("ctrl-c received, shutting down"),
                Err(err) => warn!(error = %err, "ctrl-c handler unavailable"),
            },
            _ = loops.wait_for(|stop| *stop) => {}
            _ = done.wait_for(|stop| *stop) => info!("all tasks finished"),
        }
        let _ = tx.send(true);
    });
    rx
}

/// The `--task` list, minus tasks this process finished successfully.
struct PendingTasks {
    pending: Mutex<Vec<TaskId>>,
    done: watch::Sender<bool>,
}

impl PendingTasks {
    fn new(tasks: impl IntoIterator<Item = TaskId>, done: watch::Sender<bool>) -> Self {
        let mut seen = HashSet::new();
        let tasks = tasks.into_iter().filter(|t| seen.insert(t.clone())).collect();
        Self {
            pending: Mutex::new(tasks),
            done,
        }
    }

    fn finish(&self, task_id: &TaskId) {
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.retain(|t| t != task_id);
        if pending.is_empty() {
            let _ = self.done.send(true);
        }
    }
}

#[async_trait]
impl Backlog for PendingTasks {
    async fn candidates(&self) -> Result<Vec<TaskId>, StoreError> {
        let pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(pending.clone())
    }
}

struct TrackingExecutor<'a> {
    inner: Arc<dyn TaskExecutor>,
    backlog: &'a PendingTasks,
}

#[async_trait]
impl TaskExecutor for TrackingExecutor<'_> {
    async fn execute(&self, task_id: &TaskId, slot: &WorkspaceSlot) -> Result<(), String> {
        self.inner.execute(task_id, slot).await?;
        self.backlog.finish(task_id);
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("rendering output")?;
    println!("{rendered}");
    Ok(())
}
