//! rlforge: agent rollouts with trajectory storage
//!
//! Provides subcommands:
//!
//! - `rollout`  -- Run the configured strategy over environment task indices
//! - `list`     -- List stored trajectories
//! - `show`     -- Print one stored trajectory as JSON
//! - `migrate`  -- Copy every stored trajectory into another backend

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rlforge::agent::Agent;
use rlforge::config::RolloutConfig;
use rlforge::controller::{RolloutController, RolloutRequest, Task};
use rlforge::env::{HttpEnvClient, ScriptedEnvClient};
use rlforge::model::{ByteTokenizer, CompletionClient, Generator, ScriptedGenerator};
use rlforge::storage::{self, Metadata, SortOrder, TrajectoryQuery, TrajectoryStorage};
use rlforge::strategy::RolloutStrategy;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// rlforge: agent rollouts with trajectory storage
#[derive(Parser)]
#[command(name = "rlforge", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the scripted environment and generator instead of live servers.
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run rollouts and store the resulting trajectories.
    Rollout {
        /// Comma-separated task indices (default: every index).
        #[arg(long, value_delimiter = ',')]
        indices: Option<Vec<usize>>,

        /// Round limit per rollout (overrides the config).
        #[arg(long)]
        max_rounds: Option<usize>,

        /// Strategy name: StandardReAct, ToT or MCTS (overrides the config).
        #[arg(long)]
        strategy: Option<String>,

        /// Do not persist the trajectories.
        #[arg(long)]
        no_save: bool,

        /// Run rollouts one at a time in index order.
        #[arg(long)]
        sequential: bool,

        /// Indices per batch in parallel mode (overrides the config).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Metadata attached to every saved trajectory, as key=value.
        #[arg(long = "metadata", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// List stored trajectories.
    List {
        /// Only trajectories of this environment.
        #[arg(long)]
        env: Option<String>,

        /// Only trajectories of this task index.
        #[arg(long)]
        task_id: Option<i64>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// id, env_name, task_id or timestamp.
        #[arg(long, default_value = "timestamp")]
        sort_by: String,

        /// asc or desc.
        #[arg(long, default_value = "desc")]
        order: String,
    },

    /// Print one stored trajectory as JSON.
    Show {
        /// Trajectory id.
        id: String,
    },

    /// Copy every stored trajectory into another backend.
    Migrate {
        /// Target backend: file or document.
        #[arg(long)]
        to_backend: String,

        /// Target directory (file) or database file (document).
        #[arg(long)]
        to_path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Rollout {
            indices,
            max_rounds,
            strategy,
            no_save,
            sequential,
            batch_size,
            metadata,
        } => {
            let mut config = config;
            if let Some(name) = strategy {
                config.strategy.name = name;
            }
            if let Some(rounds) = max_rounds {
                config.controller.max_rounds = Some(rounds);
            }
            if let Some(size) = batch_size {
                config.controller.batch_size = size;
            }
            if sequential {
                config.controller.parallel = false;
            }
            let metadata = parse_metadata(&metadata)?;
            cmd_rollout(&config, cli.mock, indices, !no_save, metadata).await
        }
        Commands::List {
            env,
            task_id,
            limit,
            offset,
            sort_by,
            order,
        } => {
            let mut query = TrajectoryQuery::default()
                .page(limit, offset)
                .sorted_by(&sort_by, order.parse::<SortOrder>()?)?;
            query.env_name = env;
            query.task_id = task_id;
            cmd_list(&config, &query).await
        }
        Commands::Show { id } => cmd_show(&config, &id).await,
        Commands::Migrate {
            to_backend,
            to_path,
        } => cmd_migrate(&config, &to_backend, &to_path).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<RolloutConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<RolloutConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => RolloutConfig::default(),
    };

    // Fill in the API key from the environment when not set in the config file.
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if config.model.api_key.is_empty() {
            config.model.api_key = key;
        }
    }
    Ok(config)
}

/// Parse `key=value` pairs. Values that are valid JSON keep their type.
fn parse_metadata(pairs: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("metadata must be key=value, got {pair:?}");
        };
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        metadata.insert(key.trim().to_string(), value);
    }
    Ok(metadata)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_rollout(
    config: &RolloutConfig,
    mock: bool,
    indices: Option<Vec<usize>>,
    save: bool,
    metadata: Metadata,
) -> Result<()> {
    let strategy =
        RolloutStrategy::from_config(&config.strategy).context("Invalid strategy configuration")?;
    let task = create_task(config, mock)?;
    let agent = create_agent(config, mock)?;

    let mut controller = RolloutController::new(agent, vec![task])
        .with_strategy(strategy)
        .with_max_workers(config.controller.max_workers);
    if save {
        let storage = storage::from_config(&config.storage)
            .await
            .context("Failed to open trajectory storage")?;
        controller.set_storage(storage);
    }

    let request = RolloutRequest {
        task: 0,
        max_rounds: config.controller.max_rounds,
        task_indices: indices,
        save,
        parallel: config.controller.parallel,
        batch_size: config.controller.batch_size,
        metadata,
    };
    let report = controller.rollout(request).await?;

    println!("Strategy:     {}", controller.strategy().name());
    println!("Experiences:  {}", report.experiences.len());
    println!("Mean reward:  {:.3}", report.mean_reward());
    println!("Saved:        {}", report.saved_ids.len());
    if !report.failures.is_empty() {
        println!("Failed rollouts:");
        for failure in &report.failures {
            println!("  [{}] {}", failure.task_index, failure.error);
        }
    }
    if !report.save_failures.is_empty() {
        println!("Unsaved rollouts:");
        for failure in &report.save_failures {
            println!("  [{}] {}", failure.task_index, failure.error);
        }
    }
    Ok(())
}

async fn cmd_list(config: &RolloutConfig, query: &TrajectoryQuery) -> Result<()> {
    let storage = storage::from_config(&config.storage).await?;
    let records = storage.list(query).await?;

    for record in &records {
        let turns = record.trajectory.conversation.len();
        println!(
            "{id}  {env:<12} task={task:<5} reward={reward:<6.3} turns={turns:<3} {ts}",
            id = record.id,
            env = record.env_name,
            task = record.task_id,
            reward = record.trajectory.reward,
            ts = storage::timestamp::format(&record.timestamp),
        );
    }
    println!("{} trajectories", records.len());
    Ok(())
}

async fn cmd_show(config: &RolloutConfig, id: &str) -> Result<()> {
    let storage = storage::from_config(&config.storage).await?;
    match storage.get(id).await? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("no trajectory with id {id}"),
    }
}

async fn cmd_migrate(config: &RolloutConfig, to_backend: &str, to_path: &Path) -> Result<()> {
    let source = storage::from_config(&config.storage).await?;
    let target = storage::open(to_backend.parse()?, to_path)
        .await
        .with_context(|| format!("Failed to open target storage at {}", to_path.display()))?;

    let copied = migrate(source.as_ref(), target.as_ref()).await?;
    tracing::info!(
        copied,
        from = source.backend().as_str(),
        to = target.backend().as_str(),
        "Migration finished"
    );
    println!("Copied {copied} trajectories to {}", to_path.display());
    Ok(())
}

/// Page through `source` in id order and import everything into `target`.
async fn migrate(source: &dyn TrajectoryStorage, target: &dyn TrajectoryStorage) -> Result<usize> {
    const PAGE: usize = 500;
    let mut copied = 0;
    let mut offset = 0;
    loop {
        let query = TrajectoryQuery::default()
            .page(PAGE, offset)
            .sorted_by("id", SortOrder::Asc)?;
        let records = source.list(&query).await?;
        if records.is_empty() {
            break;
        }
        offset += records.len();
        copied += target.import(records).await?;
    }
    Ok(copied)
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

fn create_task(config: &RolloutConfig, mock: bool) -> Result<Task> {
    if mock {
        tracing::info!("Using scripted shopping environment");
        return Ok(Task::new(config.env.name.clone(), ScriptedEnvClient::shopping()));
    }

    let base_url = config.env.base_url();
    tracing::info!(url = %base_url, data_len = config.env.data_len, "Using HTTP environment");
    let client = HttpEnvClient::new(&base_url, config.env.timeout(), config.env.data_len)?;
    Ok(Task::new(config.env.name.clone(), client))
}

fn create_agent(config: &RolloutConfig, mock: bool) -> Result<Agent> {
    let generator: Arc<dyn Generator> = if mock {
        tracing::info!("Using scripted generator");
        Arc::new(ScriptedGenerator::by_turn([
            "Thought: I should search first.\nAction: search[item]",
            "Action: click[item 1]",
            "Action: buy",
        ]))
    } else {
        Arc::new(CompletionClient::new(
            &config.model.api_base,
            &config.model.api_key,
            &config.model.model_id,
            config.model.timeout(),
        )?)
    };

    Ok(Agent::new(generator, Arc::new(ByteTokenizer))
        .with_sampling(config.model.sampling.clone())
        .with_exploration_temperature(config.model.exploration_temperature)
        .with_timeout(config.model.timeout()))
}
