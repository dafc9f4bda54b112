use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use think_tank::{
    agents::{InMemoryKnowledgeBase, KnowledgeBase, NoKnowledge},
    config::{Config, LogFormat},
    langbase::LangbaseClient,
    orchestrator::{Orchestrator, RunSummary},
    scheduler::TurnScheduler,
    storage::{SqliteStorage, Storage},
};

/// Multi-agent think tank: runs persona agents through a staged workflow
/// until a decision converges.
#[derive(Parser)]
#[command(name = "think-tank", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the workflow for a problem statement and print the outcome as JSON
    Run {
        /// The problem statement
        problem: String,
        /// Skip creating/updating the persona pipes before the run
        #[arg(long)]
        no_ensure_pipes: bool,
    },
    /// Show a persisted run
    Show {
        /// Run id printed by `run`
        run_id: String,
    },
    /// List recent persisted runs
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "Think tank starting...");

    match cli.command {
        Command::Run {
            problem,
            no_ensure_pipes,
        } => run(config, problem, !no_ensure_pipes).await,
        Command::Show { run_id } => show(&config, &run_id).await,
        Command::List { limit } => list(&config, limit).await,
    }
}

async fn run(config: Config, problem: String, ensure_pipes: bool) -> anyhow::Result<()> {
    let storage = match &config.database {
        Some(database) => {
            let storage = SqliteStorage::new(database).await.map_err(|e| {
                error!(error = %e, "Failed to initialize database");
                e
            })?;
            info!(path = %database.path.display(), "Database initialized");
            Some(Arc::new(storage) as Arc<dyn Storage>)
        }
        None => None,
    };

    let langbase = LangbaseClient::new(&config.langbase, config.request.clone()).map_err(|e| {
        error!(error = %e, "Failed to initialize Langbase client");
        e
    })?;
    info!(base_url = %config.langbase.base_url, "Langbase client initialized");

    let catalog = config.personas.catalog();
    if ensure_pipes {
        info!("Ensuring persona pipes exist...");
        langbase.ensure_persona_pipes(&catalog).await.map_err(|e| {
            error!(error = %e, "Failed to ensure persona pipes");
            e
        })?;
    }

    let knowledge: Arc<dyn KnowledgeBase> = match &config.knowledge_base_path {
        Some(path) => {
            let kb = InMemoryKnowledgeBase::from_file(path)?;
            info!(path = %path.display(), "Knowledge base loaded");
            Arc::new(kb)
        }
        None => Arc::new(NoKnowledge),
    };

    let orchestration = config.orchestration.clone();
    let scheduler = TurnScheduler::model_backed(
        &catalog,
        Arc::new(langbase),
        knowledge,
        &config.request,
        Duration::from_millis(orchestration.round_timeout_ms),
        orchestration.max_concurrent_agents,
    );

    let mut orchestrator = Orchestrator::new(orchestration, scheduler);
    if let Some(storage) = storage {
        orchestrator = orchestrator.with_storage(storage);
    }

    let run = orchestrator.run(problem).await?;
    println!("{}", serde_json::to_string_pretty(&run.summary())?);
    Ok(())
}

async fn open_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let database = config
        .database
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_PATH is not set; persistence is disabled"))?;
    Ok(SqliteStorage::new(database).await?)
}

async fn show(config: &Config, run_id: &str) -> anyhow::Result<()> {
    let storage = open_storage(config).await?;

    let record = storage
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))?;
    let graph = storage.load_graph(run_id).await?;
    let rounds = storage.get_rounds(run_id).await?;
    let audit = storage.get_audit_log(run_id).await?;

    let output = serde_json::json!({
        "summary": RunSummary::new(&record, &graph),
        "rounds": rounds,
        "audit_entries": audit.len(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn list(config: &Config, limit: u32) -> anyhow::Result<()> {
    let storage = open_storage(config).await?;
    let runs = storage.list_runs(limit).await?;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
