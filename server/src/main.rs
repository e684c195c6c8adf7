//! Semantic Memory Server Entry Point
//!
//! Opens the memory store and runs one operator command. `serve` keeps the
//! embedding worker running until Ctrl-C; every other command runs once,
//! drains the queue and exits. Results are printed as JSON on stdout.

use clap::{Parser, Subcommand};
use semantic_memory::{
    Edge, MemoryConfig, MemoryError, MigrationState, Node, NodeId, NodeQuery, NodeUpdate,
};
use semantic_memory_server::{MemoryManager, ServerError, ServerResult};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "semantic-memory-server")]
#[command(about = "Persistent semantic memory graph")]
#[command(version)]
struct Args {
    /// JSON config file; missing keys use defaults
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Embedding dimension (overrides the config file)
    #[arg(long, global = true)]
    dimension: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the embedding worker until Ctrl-C
    Serve,

    /// Create a node and embed it
    Ingest {
        /// Node id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "type", default_value = "note")]
        node_type: String,
        #[arg(long)]
        content: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// key=value, value parsed as JSON when possible
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, serde_json::Value)>,
    },

    /// Update a node's content, tags or metadata
    Update {
        id: String,
        #[arg(long)]
        content: Option<String>,
        /// Replaces the tag set
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, serde_json::Value)>,
    },

    /// Connect two nodes with a labeled edge
    Link {
        source: String,
        target: String,
        label: String,
        #[arg(long, default_value_t = 1.0)]
        weight: f32,
    },

    /// Semantic search over node content
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long = "type")]
        node_type: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        min_similarity: f32,
    },

    /// Filter nodes by type, tags and content
    Query {
        #[arg(long = "type")]
        node_type: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        contains: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Nodes connected to a node in either direction
    Neighbors { id: String },

    /// Move legacy embeddings into the vector index
    Migrate,

    /// Store a node's embedding in the legacy backend
    ImportLegacy { id: String },

    /// Queue every node that has no embedding
    Reembed,

    /// Store statistics
    Stats,
}

fn parse_key_val(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_json<T: Serialize>(value: &T) -> ServerResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(args: &Args) -> ServerResult<MemoryConfig> {
    let mut config = match &args.config {
        Some(path) => MemoryConfig::from_file(path).map_err(|source| ServerError::Config {
            path: path.clone(),
            source,
        })?,
        None => MemoryConfig::default(),
    };
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(dimension) = args.dimension {
        config.dimension = dimension;
    }
    Ok(config)
}

async fn run(args: Args) -> ServerResult<()> {
    let config = load_config(&args)?;
    let manager = MemoryManager::open(config).await?;

    let outcome = execute(&manager, args.command).await;
    // Drain queued embeddings even when the command failed
    let shutdown = manager.shutdown().await;
    outcome.and(shutdown)
}

async fn execute(manager: &MemoryManager, command: Command) -> ServerResult<()> {
    match command {
        Command::Serve => {
            manager.reembed_pending().await;
            tracing::info!("Embedding worker running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("Interrupt received");
            Ok(())
        }
        Command::Ingest {
            id,
            node_type,
            content,
            tags,
            meta,
        } => {
            let mut builder = Node::builder()
                .node_type(node_type)
                .content(content)
                .tags(tags);
            if let Some(id) = id {
                builder = builder.id(id);
            }
            for (key, value) in meta {
                builder = builder.meta(key, value);
            }
            let id = manager.create_node(builder.build()?).await?;
            print_json(&serde_json::json!({ "id": id }))
        }
        Command::Update {
            id,
            content,
            tags,
            meta,
        } => {
            let mut update = NodeUpdate::new();
            if let Some(content) = content {
                update = update.content(content);
            }
            if !tags.is_empty() {
                update = update.tags(tags);
            }
            for (key, value) in meta {
                update = update.meta(key, value);
            }
            if update.is_empty() {
                return Err(ServerError::InvalidArgument(
                    "nothing to update: pass --content, --tag or --meta".to_string(),
                ));
            }

            let id = NodeId::from(id);
            if !manager.update_node(&id, update).await? {
                return Err(ServerError::NodeNotFound(id.to_string()));
            }
            print_json(&manager.get_node(&id).await)
        }
        Command::Link {
            source,
            target,
            label,
            weight,
        } => {
            let edge = Edge::new(source, target, label).with_weight(weight);
            let edge_id = edge.id.clone();
            let created = manager.create_edge(edge).await?;
            print_json(&serde_json::json!({ "id": edge_id, "created": created }))
        }
        Command::Search {
            query,
            limit,
            node_type,
            min_similarity,
        } => {
            let results = manager
                .search(&query, limit, node_type.as_deref(), min_similarity)
                .await?;
            print_json(&results)
        }
        Command::Query {
            node_type,
            tags,
            contains,
            limit,
            offset,
        } => {
            let query = NodeQuery {
                node_type,
                tags,
                contains,
                limit,
                offset,
                ..Default::default()
            };
            print_json(&manager.query(&query).await)
        }
        Command::Neighbors { id } => print_json(&manager.neighbors(&NodeId::from(id)).await?),
        Command::Migrate => {
            let report = manager.migrate().await?;
            print_json(&report)?;
            if report.state == MigrationState::Failed {
                return Err(MemoryError::other(report.message).into());
            }
            Ok(())
        }
        Command::ImportLegacy { id } => {
            let id = NodeId::from(id);
            manager.import_legacy(&id).await?;
            print_json(&serde_json::json!({ "id": id, "imported": true }))
        }
        Command::Reembed => {
            let queued = manager.reembed_pending().await;
            print_json(&serde_json::json!({ "queued": queued }))
        }
        Command::Stats => print_json(&manager.stats().await),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "semantic_memory=info,semantic_memory_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(args).await {
        tracing::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
