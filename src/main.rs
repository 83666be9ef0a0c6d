use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strata_core::config::EngineConfig;
use strata_core::event::{EngineEvent, EventPayload};
use strata_core::types::{Routine, RunId, SwarmId, VarMap};
use strata_engine::{RunRequest, SqliteStore, SwarmExecutionService, SwarmRequest};

#[derive(Parser)]
#[command(name = "strata", version, about = "Multi-tier workflow run engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strata.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a routine and wait for it to finish
    Run {
        /// Routine definition (JSON)
        routine: PathBuf,
        /// Owning user
        #[arg(short, long, env = "STRATA_USER")]
        user: String,
        /// Input variable as KEY=VALUE; VALUE is parsed as JSON when possible
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Run as a child of this swarm
        #[arg(long)]
        swarm: Option<String>,
        /// Print every event, not just steps and state changes
        #[arg(long)]
        verbose: bool,
    },
    /// Start a swarm, optionally with initial routines
    Swarm {
        /// Swarm goal
        goal: String,
        #[arg(short, long, env = "STRATA_USER")]
        user: String,
        /// Credit budget
        #[arg(long, default_value = "1000")]
        credits: u64,
        /// Routines to start as child runs
        #[arg(short, long = "routine")]
        routines: Vec<PathBuf>,
    },
    /// Show a persisted run
    Status {
        run_id: String,
    },
    /// Show a swarm's budget and run counts
    SwarmStatus {
        swarm_id: String,
    },
    /// List a user's runs, newest first
    History {
        #[arg(short, long, env = "STRATA_USER")]
        user: String,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// List registered tools
    Tools,
    /// Show current configuration
    Config,
    /// Manage users
    Users {
        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Register a user
    Add { user_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.storage.resolved_path();
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening store at {}", db_path.display()))?,
    );

    if let Commands::Users {
        action: UserAction::Add { user_id },
    } = &cli.command
    {
        if store.add_user(user_id)? {
            println!("Added user {}", user_id);
        } else {
            println!("User {} already exists", user_id);
        }
        return Ok(());
    }

    let service = SwarmExecutionService::builder()
        .config(config)
        .store(store)
        .build()?;

    let outcome = dispatch(&service, cli.command).await;
    service.shutdown().await;
    outcome
}

async fn dispatch(service: &SwarmExecutionService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            routine,
            user,
            inputs,
            swarm,
            verbose,
        } => {
            let routine = load_routine(&routine)?;
            let mut request = RunRequest::new(routine, user).with_inputs(parse_inputs(&inputs)?);
            if let Some(swarm) = swarm {
                request = request.in_swarm(SwarmId::from(swarm));
            }

            let mut events = service.subscribe("*");
            let printer = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    print_event(&event, verbose);
                }
            });

            let run_id = service.start_run(request).await?;
            info!(run_id = %run_id, "Waiting for run");
            let view = service.wait_for_run(&run_id).await;
            printer.abort();

            match view {
                Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
                None => anyhow::bail!("run {} was never registered", run_id),
            }
        }
        Commands::Swarm {
            goal,
            user,
            credits,
            routines,
        } => {
            let mut request = SwarmRequest::new(user.clone(), goal, credits);
            for path in &routines {
                request = request.with_run(RunRequest::new(load_routine(path)?, user.clone()));
            }
            let swarm_id = service.start_swarm(request).await?;
            println!("Started swarm {}", swarm_id);
            for run_id in service.swarm_runs(&swarm_id) {
                if let Some(view) = service.wait_for_run(&run_id).await {
                    println!("{}  {}", run_id, view.status.as_str());
                }
            }

            let status = service.get_swarm_status(&swarm_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Status { run_id } => {
            let view = service.get_run_status(&RunId::from(run_id)).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::SwarmStatus { swarm_id } => {
            let status = service.get_swarm_status(&SwarmId::from(swarm_id)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::History {
            user,
            limit,
            offset,
        } => {
            let runs = service.get_user_run_history(&user, limit, offset).await?;
            if runs.is_empty() {
                println!("No runs for {}", user);
            }
            for run in runs {
                println!(
                    "{}  {:<10}  {}  {}",
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.status.as_str(),
                    run.run_id,
                    run.routine_id
                );
            }
        }
        Commands::Tools => {
            let tools = service.tools();
            let registry = tools.read().await;
            for name in registry.list() {
                println!("{}", name);
            }
        }
        Commands::Config | Commands::Users { .. } => {}
    }
    Ok(())
}

/// Config from the given path, then `~/.strata/config.toml`, then defaults.
fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        return Ok(EngineConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".strata").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(EngineConfig::load(&home_config)?);
        }
    }
    Ok(EngineConfig::default())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn load_routine(path: &Path) -> anyhow::Result<Routine> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading routine {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing routine {}", path.display()))
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<VarMap> {
    let mut inputs = VarMap::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("input '{}' is not KEY=VALUE", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

fn print_event(event: &EngineEvent, verbose: bool) {
    match &event.payload {
        EventPayload::Business { entity_id, data } => match event.event_type.as_str() {
            "run.state_changed" => eprintln!(
                "[run] {} -> {}",
                data["from"].as_str().unwrap_or("?"),
                data["to"].as_str().unwrap_or("?")
            ),
            "step.started" => eprintln!("[step: {}] started", entity_id),
            "step.completed" => eprintln!("[step: {}] ok", entity_id),
            "step.failed" => eprintln!(
                "[step: {}] ERROR {}",
                entity_id,
                data["error"].as_str().unwrap_or("")
            ),
            "branch.failed" => eprintln!("[branch: {}] ERROR {}", entity_id, data),
            _ if verbose => eprintln!("[{}] {}", event.event_type, entity_id),
            _ => {}
        },
        EventPayload::Safety { reason, .. } => eprintln!("[{}] {}", event.event_type, reason),
        _ if verbose => eprintln!("[{}] {}", event.event_type, event.source),
        _ => {}
    }
}
