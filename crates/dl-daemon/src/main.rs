//! devloop: drive coding agents through a gated development loop.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dl_core::cancel::CancelSignal;
use dl_core::config::Config;
use dl_core::types::{Task, WorkCategory};
use dl_daemon::engine::Engine;
use dl_daemon::operations::{OperationKind, OperationRegistry};
use dl_telemetry::logging::{self, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "devloop", version, about)]
struct Cli {
    /// Repository the loop works on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Config file (default: <repo>/.devloop/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the development loop.
    Run {
        /// Stop after N cycles (0 = until stopped).
        #[arg(long)]
        cycles: Option<u32>,
        /// Do not wait for input at the end of each cycle.
        #[arg(long)]
        autonomous: bool,
        /// Stop the whole run on the first failed task.
        #[arg(long)]
        stop_on_failure: bool,
    },

    /// Show queue counts and the last cycle (default).
    Status,

    /// Queue a task.
    Enqueue {
        name: String,
        #[arg(long, default_value = "coding")]
        category: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        description: Option<String>,
        /// Declared output for documentation tasks.
        #[arg(long)]
        output_path: Option<String>,
    },

    /// List operation definitions, or approve/reject a pending override.
    Operations {
        #[arg(long, conflicts_with = "reject")]
        approve: Option<String>,
        #[arg(long)]
        reject: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo = cli
        .repo
        .canonicalize()
        .with_context(|| format!("repository {} not found", cli.repo.display()))?;
    let mut config = load_config(&repo, cli.config.as_deref())?;

    let format = LogFormat::from_json_flag(cli.json_logs || config.general.json_logs);
    logging::init("devloop", &config.general.log_level, format);

    match cli.command {
        None | Some(Commands::Status) => {
            let engine = Engine::open(&repo, config).await?;
            print!("{}", engine.status().await?);
        }
        Some(Commands::Run {
            cycles,
            autonomous,
            stop_on_failure,
        }) => {
            if let Some(n) = cycles {
                config.controller.max_cycles = n;
            }
            if autonomous {
                config.controller.guided = false;
            }
            config.controller.stop_on_failure |= stop_on_failure;
            config.validate().context("invalid configuration")?;

            let engine = Engine::open(&repo, config).await?;
            let cancel = CancelSignal::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                    return;
                }
                info!("ctrl-c received, stopping after the current step");
                on_signal.cancel();
            });

            let outcome = engine.run(&cancel).await?;
            println!("Stopped after {} cycle(s): {}", outcome.cycles, outcome.stop);
        }
        Some(Commands::Enqueue {
            name,
            category,
            priority,
            description,
            output_path,
        }) => {
            let Some(category) = WorkCategory::parse(&category) else {
                bail!("unknown category {category:?} (documentation, coding, operations, planning)");
            };
            let mut task = Task::new(name, category).with_priority(priority);
            task.properties.description = description;
            task.properties.output_path = output_path;
            let engine = Engine::open(&repo, config).await?;
            engine.enqueue(&task).await?;
            println!("{}", task.id);
        }
        Some(Commands::Operations { approve, reject }) => {
            let dir = Config::resolve(&repo, &config.controller.operations_dir);
            let mut registry = OperationRegistry::load_from_dir(&dir)
                .with_context(|| format!("failed to load operations from {}", dir.display()))?;
            if let Some(kind) = approve {
                let kind = OperationKind::parse(&kind)?;
                registry.approve_in_dir(&dir, kind)?;
                println!("approved {kind}");
            } else if let Some(kind) = reject {
                let kind = OperationKind::parse(&kind)?;
                registry.reject_in_dir(&dir, kind)?;
                println!("rejected {kind}");
            }
            for entry in registry.entries() {
                let pending = entry
                    .pending_version
                    .map(|v| format!("  (pending v{v})"))
                    .unwrap_or_default();
                println!(
                    "{:<10} v{:<3} {:?}{pending}",
                    entry.kind.as_str(),
                    entry.active_version,
                    entry.source
                );
            }
        }
    }

    Ok(())
}

fn load_config(repo: &Path, explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load(repo).context("failed to load config"),
    }
}
