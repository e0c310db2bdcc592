//! Mantis - ADMM Consensus Optimizer Sessions
//!
//! Maintenance CLI driving session managers against the configured
//! document store.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use mantis_core::{
    registry::Record, Context, Entity, EntityId, MantisConfig, SessionManager, SparseVector,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mantis")]
#[command(about = "ADMM consensus optimizer sessions", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "MANTIS_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured one
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ModelArgs {
    /// Model name
    #[arg(long)]
    name: String,

    /// Creator owning the mantis record
    #[arg(long)]
    creator: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a model and its mantis record
    Init {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Print the mantis record and model as stored
    Show {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Register a new user
    AddUser {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        user: String,
    },

    /// Add a labeled entity to a user's training data
    AddData {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        user: String,

        /// Features as `key:value` pairs separated by commas
        #[arg(long)]
        features: String,

        #[arg(long, allow_hyphen_values = true)]
        label: f64,

        #[arg(long, default_value_t = 1.0)]
        weight: f64,

        /// Reuse an existing entity id
        #[arg(long)]
        entity: Option<String>,
    },

    /// Run one local step for a user and commit the consensus state
    Train {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        user: String,

        /// Check out the consensus vector of this creator's model
        #[arg(long)]
        leader: Option<String>,

        /// Also store the user's fitted weights on their model copy
        #[arg(long)]
        publish: bool,
    },

    /// Merge a follower's update into the consensus vector
    Merge {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        follower: String,

        /// Followers already merged in this round
        #[arg(long, default_value_t = 0)]
        merged: usize,
    },

    /// Zero the consensus state
    Reset {
        #[command(flatten)]
        model: ModelArgs,
    },
}

fn parse_features(raw: &str) -> anyhow::Result<SparseVector> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("Invalid feature '{}', expected key:value", pair))?;
            Ok((key.trim().parse::<u64>()?, value.trim().parse::<f64>()?))
        })
        .collect()
}

async fn open(ctx: Context, model: &ModelArgs) -> anyhow::Result<Arc<SessionManager>> {
    SessionManager::open_for(ctx, &model.name, &model.creator)
        .await
        .with_context(|| format!("Opening model {} of {}", model.name, model.creator))
}

/// Make `user` live, loading stored data when there is any
async fn ensure_live(manager: &SessionManager, user: &str) -> anyhow::Result<()> {
    if manager.has_user(user).await {
        return Ok(());
    }
    if manager.has_user_in_store(user).await? {
        manager.load_one(user).await?;
    } else {
        manager.add_one(user).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MantisConfig::from_file(path)
            .with_context(|| format!("Loading configuration from {}", path.display()))?,
        None => MantisConfig::default(),
    };

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Mantis v{} starting...", env!("CARGO_PKG_VERSION"));
    let ctx = Context::from_config(config).await?;

    match cli.command {
        Commands::Init { model } => {
            let manager = SessionManager::create(ctx, &model.name, &model.creator).await?;
            println!("{}", manager.id());
        }
        Commands::Show { model } => {
            let manager = open(ctx, &model).await?;
            let record = manager.record().await;
            let snapshot = manager.model_snapshot().await;
            let out = serde_json::json!({
                "mantis": record.to_tagged_document(),
                "model": snapshot.to_tagged_document(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::AddUser { model, user } => {
            let manager = open(ctx, &model).await?;
            manager.add_one(&user).await?;
            info!("User {} added to {}", user, model.name);
        }
        Commands::AddData {
            model,
            user,
            features,
            label,
            weight,
            entity,
        } => {
            let features = parse_features(&features)?;
            let id = match entity {
                Some(raw) => EntityId::from_string(&raw)?,
                None => EntityId::new(),
            };
            let entity = Entity { id, features };

            let store = ctx.store.clone();
            let entities = ctx.entities().to_string();
            let manager = open(ctx, &model).await?;
            if store.load_by_id(&entities, &id.to_string()).await?.is_none() {
                store
                    .insert(&entities, &id.to_string(), serde_json::to_value(&entity)?)
                    .await?;
            }

            ensure_live(&manager, &user).await?;
            let slot = manager.add_data(&user, &entity, label, weight).await?;
            manager.save_one(&user).await?;
            println!("{} -> slot {}", entity.id, slot);
        }
        Commands::Train {
            model,
            user,
            leader,
            publish,
        } => {
            let manager = open(ctx, &model).await?;
            ensure_live(&manager, &user).await?;
            let passes = manager.train(&user, leader.as_deref()).await?;
            manager.commit().await?;
            if publish {
                manager.publish_weights(&user).await?;
            }
            info!("Trained {} on {} in {} passes", user, model.name, passes);
        }
        Commands::Merge {
            model,
            follower,
            merged,
        } => {
            let manager = open(ctx, &model).await?;
            manager.merge(&follower, merged).await?;
        }
        Commands::Reset { model } => {
            let manager = open(ctx, &model).await?;
            manager.reset().await?;
        }
    }

    Ok(())
}
