//! convoy - dependency-ordered bootstrap of platform resources
//!
//! Usage:
//!   convoy graph -f bootstrap.yaml                 # show order and inclusion
//!   convoy plan -f bootstrap.yaml --flag enterprise=true
//!   convoy apply -f bootstrap.yaml --mock          # rehearse without a platform
//!   convoy destroy -f bootstrap.yaml --target postgres
//!   convoy status                                  # last persisted run

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use convoy::cli::{effective_flags, load_config, load_graph, operator_for, store_for};
use convoy::render::{render_graph, render_plan, render_result};
use convoy_core::{EngineConfig, Mode, RunStatus};
use convoy_exec::{ChangePlan, Executor, RunEvent, RunResult, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "convoy", about = "Bring up platform resources in dependency order", version)]
struct Cli {
    /// Engine config (TOML). Defaults to ./convoy.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the graph in execution order with inclusion decisions
    Graph(GraphArgs),
    /// Preview what apply (or destroy) would do
    Plan {
        #[command(flatten)]
        graph: GraphArgs,
        #[arg(long)]
        state: Option<PathBuf>,
        /// Preview a destroy instead of an apply
        #[arg(long, default_value_t = false)]
        destroy: bool,
        #[arg(long = "target")]
        targets: Vec<String>,
    },
    /// Converge the platform on the declared graph
    Apply {
        #[command(flatten)]
        graph: GraphArgs,
        #[arg(long)]
        state: Option<PathBuf>,
        #[arg(long)]
        max_in_flight: Option<usize>,
        /// Rehearse against a mock operator
        #[arg(long, default_value_t = false)]
        mock: bool,
    },
    /// Tear resources down, dependents first
    Destroy {
        #[command(flatten)]
        graph: GraphArgs,
        /// Destroy only these nodes and what depends on them
        #[arg(long = "target")]
        targets: Vec<String>,
        #[arg(long)]
        state: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        mock: bool,
    },
    /// Print the last persisted run
    Status {
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[derive(Args)]
struct GraphArgs {
    /// Declarations file (YAML)
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Inclusion flag, name=value. Repeatable.
    #[arg(long = "flag")]
    flags: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = init_tracing(cli.log_file.as_ref())?;
    let config = load_config(cli.config.as_deref())?;

    let status = match cli.command {
        Commands::Graph(args) => {
            let flags = effective_flags(&config, &args.flags)?;
            let graph = load_graph(&args.file, &flags)?;
            print!("{}", render_graph(&graph));
            None
        }
        Commands::Plan {
            graph: args,
            state,
            destroy,
            targets,
        } => {
            let flags = effective_flags(&config, &args.flags)?;
            let graph = load_graph(&args.file, &flags)?;
            let prior = store_for(&config, state.as_deref()).load().await?;
            let plan = if destroy {
                let indices = targets
                    .iter()
                    .map(|t| graph.index_of(t).with_context(|| format!("unknown target '{}'", t)))
                    .collect::<Result<Vec<usize>>>()?;
                ChangePlan::destroy(&graph, prior.as_ref(), &indices)
            } else {
                ChangePlan::apply(&graph, prior.as_ref())
            };
            print!("{}", render_plan(&plan));
            None
        }
        Commands::Apply {
            graph: args,
            state,
            max_in_flight,
            mock,
        } => {
            let mut config = config;
            if let Some(n) = max_in_flight {
                config.max_in_flight = n;
            }
            let run = Run {
                config: &config,
                args: &args,
                state,
                mock,
            };
            Some(run.execute(Mode::Apply, Vec::new()).await?)
        }
        Commands::Destroy {
            graph: args,
            targets,
            state,
            mock,
        } => {
            let run = Run {
                config: &config,
                args: &args,
                state,
                mock,
            };
            Some(run.execute(Mode::Destroy, targets).await?)
        }
        Commands::Status { state } => {
            let store = store_for(&config, state.as_deref());
            match store.load().await? {
                Some(result) => print!("{}", render_result(&result)),
                None => println!("No runs recorded at {}", store.location()),
            }
            None
        }
    };

    let code = match status {
        Some(RunStatus::Failed) => 1,
        Some(RunStatus::Cancelled) => 130,
        _ => 0,
    };
    // Flush the file writer before exiting.
    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// One apply or destroy, persisted through the configured store.
struct Run<'a> {
    config: &'a EngineConfig,
    args: &'a GraphArgs,
    state: Option<PathBuf>,
    mock: bool,
}

impl Run<'_> {
    async fn execute(self, mode: Mode, targets: Vec<String>) -> Result<RunStatus> {
        let flags = effective_flags(self.config, &self.args.flags)?;
        let graph = load_graph(&self.args.file, &flags)?;
        let store = Arc::new(store_for(self.config, self.state.as_deref()));
        let prior = store.load().await?;
        let operator = operator_for(self.config, self.mock, &graph)?;
        tracing::info!(operator = operator.name(), state = %store.location(), "starting {}", mode);

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\nInterrupted: finishing in-flight operations...");
                    interrupt.cancel();
                }
                _ = interrupt.cancelled() => {}
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();
        let sink = store.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.append_event(&event).await {
                    tracing::warn!("event log write failed: {}", e);
                }
            }
        });

        let executor = Executor::new(operator)
            .with_config(self.config)
            .with_cancel(cancel.clone())
            .with_events(tx);
        let result: RunResult = match mode {
            Mode::Apply => executor.apply(&graph, prior.as_ref()).await?,
            Mode::Destroy => {
                let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
                executor.destroy(&graph, prior.as_ref(), &targets).await?
            }
        };
        drop(executor);
        cancel.cancel();
        if let Err(e) = forwarder.await {
            tracing::warn!("event forwarder stopped: {}", e);
        }

        store.save(&result).await?;
        store.append_run_log(&result).await?;
        print!("{}", render_result(&result));
        Ok(result.status)
    }
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "convoy=info,convoy_exec=info,convoy_graph=info".into());
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(filter).with(console).init();
        return Ok(None);
    };
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("--log-file {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}
