use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evoflow_core::config::AppConfig;
use evoflow_core::graph::WorkflowGraph;
use evoflow_core::trace::RunTrace;
use evoflow_core::traits::{ModelClient, RecordStore};
use evoflow_engine::{load_tasks, EvolutionEngine, EvolutionLogger, Executor, GraphValidator, RateController, RunBudgets};
use evoflow_store::SqliteRecordStore;
use evoflow_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "evoflow", version, about = "Agentic workflow executor with evolutionary graph search")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "evoflow.toml", env = "EVOFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow graph for well-formedness
    Validate {
        /// Graph JSON file
        graph: PathBuf,
    },
    /// Run a workflow graph once and print the trace summary
    Run {
        /// Graph JSON file
        graph: PathBuf,
        /// Task input (read from stdin when omitted)
        #[arg(short, long)]
        input: Option<String>,
        /// Print the full trace instead of the summary
        #[arg(long)]
        full: bool,
    },
    /// Evolve workflow graphs against a task dataset
    Evolve {
        /// Tasks file (JSON array or JSONL)
        #[arg(short, long)]
        tasks: PathBuf,
        /// Seed every first-generation candidate from this graph
        #[arg(short, long)]
        seed: Option<PathBuf>,
        /// Override the configured generation count
        #[arg(long)]
        generations: Option<u32>,
        /// Override the configured population size
        #[arg(long)]
        population: Option<usize>,
        /// Write the best graph to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evoflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "evoflow", &mut io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        AppConfig::from_env()?
    };

    match cli.command {
        Commands::Validate { graph } => {
            let graph = WorkflowGraph::from_file(&graph)?;
            let validated = GraphValidator::from_budget(&config.budget).validate(&graph)?;
            println!(
                "OK: {} nodes, entry '{}', order {}",
                validated.len(),
                validated.entry(),
                validated.topological_order().join(" -> ")
            );
        }
        Commands::Run { graph, input, full } => {
            let graph = WorkflowGraph::from_file(&graph)?;
            let input = match input {
                Some(text) => text,
                None => read_stdin()?,
            };
            if input.trim().is_empty() {
                anyhow::bail!("no input given; pass --input or pipe text on stdin");
            }

            let model = model_client(&config);
            let tools = Arc::new(ToolRegistry::with_builtins());
            let rate = RateController::from_budget(&config.budget);
            let executor = Executor::new(model, tools, rate)
                .with_validator(GraphValidator::from_budget(&config.budget))
                .with_max_tool_rounds(config.evolution.max_tool_rounds);

            let cancel = cancel_on_ctrl_c();
            let trace = executor
                .run_with_cancel(&graph, &input, &RunBudgets::from(&config.budget), cancel)
                .await?;
            if full {
                println!("{}", serde_json::to_string_pretty(&trace)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&TraceSummary::from(&trace))?);
            }
        }
        Commands::Evolve {
            tasks,
            seed,
            generations,
            population,
            output,
        } => {
            let mut config = config;
            if let Some(g) = generations {
                config.budget.generations = g;
            }
            if let Some(p) = population {
                config.budget.population_size = p;
            }
            config.budget.validate()?;

            let tasks = load_tasks(&tasks)?;
            info!(tasks = tasks.len(), "Loaded evaluation tasks");

            let mut engine = EvolutionEngine::new(
                &config,
                model_client(&config),
                Arc::new(ToolRegistry::with_builtins()),
            );
            if let Some(path) = &seed {
                engine = engine.with_seed_graph(WorkflowGraph::from_file(path)?);
            }
            if let Some(store) = open_store(&config) {
                engine = engine.with_store(store);
            }

            let cancel = cancel_on_ctrl_c();
            let logger = match &config.log {
                Some(log) if log.enabled => {
                    let logger = EvolutionLogger::new(config.log_dir(), log.level);
                    info!("EvolutionLogger started (level {})", log.level);
                    Some(logger.spawn(
                        &engine.event_bus(),
                        engine.evolution_id().to_string(),
                        cancel.child_token(),
                    ))
                }
                _ => None,
            };

            let outcome = engine.run_with_cancel(&tasks, cancel).await?;
            if let Some(handle) = logger {
                handle.await.ok();
            }

            if let Some(path) = &output {
                std::fs::write(path, outcome.best.graph.to_json_pretty()?)?;
                info!(path = %path.display(), "Best graph written");
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Compact view of a run for the `run` command.
#[derive(Serialize)]
struct TraceSummary<'a> {
    run_id: String,
    termination: &'a evoflow_core::trace::TerminationReason,
    total_invocations: u32,
    total_cost_usd: f64,
    total_time_seconds: f64,
    failed_nodes: Vec<&'a str>,
    final_output: Option<&'a str>,
}

impl<'a> From<&'a RunTrace> for TraceSummary<'a> {
    fn from(trace: &'a RunTrace) -> Self {
        Self {
            run_id: trace.run_id.to_string(),
            termination: &trace.termination,
            total_invocations: trace.total_invocations,
            total_cost_usd: trace.total_cost_usd(),
            total_time_seconds: trace.total_time_seconds(),
            failed_nodes: trace.failed_nodes(),
            final_output: trace.final_output.as_deref(),
        }
    }
}

fn model_client(config: &AppConfig) -> Arc<dyn ModelClient> {
    Arc::from(evoflow_llm::create_client(&config.gateway))
}

/// Open the SQLite record store. Evolution still runs without one.
fn open_store(config: &AppConfig) -> Option<Arc<dyn RecordStore>> {
    let path = config.store_path();
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "Cannot create store directory, records will not be kept");
            return None;
        }
    }
    match SqliteRecordStore::open(Path::new(&path)) {
        Ok(store) => {
            info!(path = %path.display(), "Record store opened");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open record store, records will not be kept");
            None
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            token.cancel();
        }
    });
    cancel
}

fn read_stdin() -> io::Result<String> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    Ok(input)
}
