//! costwised: the Costwise operator binary.
//!
//! Three entry points into the core:
//! - `serve` exposes the HTTP read API backed by Postgres
//! - `allocate` creates a computation run over a date window and drives the
//!   allocation engine to a terminal state
//! - `graph validate` builds the dependency graph for a date and reports
//!   cycles and dangling references, either against the database or against
//!   a JSON fixture (`--offline`)

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Deserialize;
use uuid::Uuid;

use costwise_common::model::{CostNode, DependencyEdge, EdgeStrategyOverride, NodeType};
use costwise_daemon::{
    config::{DATABASE_URL_ENV, DEFAULT_MAX_DB_CONNECTIONS, DEFAULT_RPC_BIND_ADDRESS},
    core::{
        engine::{AllocationEngine, RunRequest},
        error::AllocationError,
        graph::build_graph,
        storage::{MemoryStorage, PgStorage, Storage},
    },
    rpc,
};

#[derive(Parser)]
#[command(name = "costwised")]
#[command(version, about = "Costwise cost attribution daemon")]
#[command(styles = costwise_common::get_cli_styles())]
struct CliArgs {
    /// Postgres connection string
    #[clap(long, env = DATABASE_URL_ENV)]
    database_url: Option<String>,

    /// Log level filter (error, warn, info, debug, trace)
    #[clap(long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP read API
    Serve {
        /// Bind address for the read API
        #[clap(long, default_value = DEFAULT_RPC_BIND_ADDRESS)]
        rpc_bind_address: String,
    },
    /// Run the allocation engine over a date window
    Allocate {
        /// First day of the window (inclusive)
        #[clap(long)]
        from: NaiveDate,
        /// Last day of the window (inclusive)
        #[clap(long)]
        to: NaiveDate,
        /// Restrict the run to these dimensions (comma separated); default
        /// discovers the dimensions present in each day's cost records
        #[clap(long, value_delimiter = ',')]
        dimensions: Option<Vec<String>>,
        /// Free-form note stored on the run row
        #[clap(long)]
        notes: Option<String>,
    },
    /// Dependency graph tooling
    Graph {
        #[clap(subcommand)]
        command: GraphCommand,
    },
}

#[derive(Subcommand)]
enum GraphCommand {
    /// Build the graph for a date and report cycles and dangling references
    Validate {
        /// Date to validate; defaults to today
        #[clap(long)]
        date: Option<NaiveDate>,
        /// Validate a JSON graph fixture instead of the database
        #[clap(long)]
        offline: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&args.log_level),
    )
    .init();

    match args.command {
        Command::Serve { rpc_bind_address } => {
            let storage = connect(args.database_url.as_deref()).await?;
            rpc::run_rpc_server(storage, &rpc_bind_address).await
        }
        Command::Allocate {
            from,
            to,
            dimensions,
            notes,
        } => {
            let storage = connect(args.database_url.as_deref()).await?;
            allocate(storage, from, to, dimensions, notes).await
        }
        Command::Graph {
            command: GraphCommand::Validate { date, offline },
        } => {
            let date = date.unwrap_or_else(costwise_common::time::today);
            match offline {
                Some(path) => {
                    let storage = load_fixture(&path).await?;
                    validate_graph(&storage, date).await
                }
                None => {
                    let storage = connect(args.database_url.as_deref()).await?;
                    validate_graph(storage.as_ref(), date).await
                }
            }
        }
    }
}

async fn connect(database_url: Option<&str>) -> Result<Arc<PgStorage>> {
    let url = database_url.with_context(|| {
        format!("--database-url (or {}) is required", DATABASE_URL_ENV)
    })?;
    let storage = PgStorage::connect(url, DEFAULT_MAX_DB_CONNECTIONS).await?;
    Ok(Arc::new(storage))
}

async fn allocate(
    storage: Arc<PgStorage>,
    from: NaiveDate,
    to: NaiveDate,
    dimensions: Option<Vec<String>>,
    notes: Option<String>,
) -> Result<()> {
    let engine = AllocationEngine::new(storage);

    // Ctrl-C aborts at the next repository boundary; the partial run is
    // marked failed and stays invisible to readers.
    let cancellation = engine.cancellation_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested, stopping at the next repository boundary");
            cancellation.cancel();
        }
    });

    let outcome = engine
        .execute(RunRequest {
            window_start: from,
            window_end: to,
            dimensions,
            notes,
        })
        .await?;

    info!("run {} finished as {}", outcome.run.id, outcome.run.status);
    info!(
        "  graph hash: {}",
        outcome.run.graph_hash.as_deref().unwrap_or("-")
    );
    info!("  allocation rows: {}", outcome.allocation_rows);
    info!("  contribution rows: {}", outcome.contribution_rows);
    if outcome.invariant_violations > 0 {
        warn!(
            "  invariant violations: {} (see the warnings above)",
            outcome.invariant_violations
        );
    }
    Ok(())
}

async fn validate_graph<S: Storage>(storage: &S, date: NaiveDate) -> Result<()> {
    match build_graph(storage, date).await {
        Ok(graph) => {
            println!("graph for {}", date);
            println!("  nodes: {}", graph.node_count());
            println!("  edges: {}", graph.edge_count());
            println!("  hash: {}", graph.hash());
            println!(
                "  final cost centres: {}",
                graph.get_final_cost_centres().len()
            );
            if graph.dangling_edges().is_empty() {
                println!("  dangling references: none");
                Ok(())
            } else {
                for dangling in graph.dangling_edges() {
                    println!(
                        "  dangling: edge {} references missing node {}",
                        dangling.edge_id, dangling.missing_node
                    );
                }
                anyhow::bail!(
                    "{} dangling reference(s) found",
                    graph.dangling_edges().len()
                )
            }
        }
        Err(AllocationError::CycleDetected(cycle)) => {
            anyhow::bail!("cycle detected: {}", cycle)
        }
        Err(other) => Err(other.into()),
    }
}

// Offline fixtures carry only the structural fields; bookkeeping timestamps
// are filled with the load time.
#[derive(Deserialize)]
struct GraphFixture {
    nodes: Vec<FixtureNode>,
    #[serde(default)]
    edges: Vec<DependencyEdge>,
    #[serde(default)]
    overrides: Vec<EdgeStrategyOverride>,
}

#[derive(Deserialize)]
struct FixtureNode {
    id: Uuid,
    name: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    is_platform: bool,
}

async fn load_fixture(path: &PathBuf) -> Result<MemoryStorage> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read graph fixture {}", path.display()))?;
    let fixture: GraphFixture = serde_json::from_str(&raw)
        .with_context(|| format!("malformed graph fixture {}", path.display()))?;

    let now = Utc::now();
    let nodes = fixture
        .nodes
        .into_iter()
        .map(|node| CostNode {
            id: node.id,
            name: node.name,
            node_type: node.node_type,
            is_platform: node.is_platform,
            cost_labels: indexmap::IndexMap::new(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            archived_at: None,
        })
        .collect();

    let storage = MemoryStorage::new();
    storage
        .seed_graph(nodes, fixture.edges, fixture.overrides)
        .await;
    Ok(storage)
}
