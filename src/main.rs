//! coldb node binary
//!
//! Starts a node backed by an in-process coordination store and reads one
//! statement per line from stdin, printing results as tab-separated rows.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use coldb::coordination::InMemoryStore;
use coldb::merge::SchedulerConfig;
use coldb::node::{Node, NodeConfig};

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a coldb node reading statements from stdin")]
struct Cli {
    /// Node name, also the `{replica}` macro
    #[arg(long, default_value = "node1", env = "COLDB_NODE_NAME")]
    name: String,

    /// Root reported in part paths
    #[arg(long, default_value = "/var/lib/clickhouse", env = "COLDB_DATA_ROOT")]
    data_root: String,

    /// Directory for persisted replica state
    #[arg(long, env = "COLDB_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Merge worker tasks
    #[arg(long, default_value_t = 2, env = "COLDB_MERGE_WORKERS")]
    workers: usize,

    /// Seconds between background merge selection passes
    #[arg(long, default_value_t = 5, env = "COLDB_MERGE_INTERVAL")]
    merge_interval: u64,

    /// Wait for mutations to finish before returning
    #[arg(long, env = "COLDB_MUTATIONS_SYNC")]
    mutations_sync: bool,

    /// Extra macros as name=value
    #[arg(long = "macro", value_parser = parse_macro)]
    macros: Vec<(String, String)>,
}

fn parse_macro(text: &str) -> Result<(String, String), String> {
    text.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", text))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let scheduler = SchedulerConfig::default()
        .with_workers(cli.workers)
        .with_check_interval(Duration::from_secs(cli.merge_interval))
        .with_data_root(cli.data_root.clone());
    let mut config = NodeConfig::new(cli.name.clone())
        .with_scheduler(scheduler)
        .with_mutations_sync(cli.mutations_sync);
    if let Some(dir) = &cli.state_dir {
        config = config.with_state_dir(dir);
    }
    for (name, value) in cli.macros {
        config = config.with_macro(name, value);
    }

    tracing::info!(
        node = %cli.name,
        data_root = %cli.data_root,
        state_dir = ?cli.state_dir,
        "Starting coldb"
    );

    let node = Node::start(config, Arc::new(InMemoryStore::new()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sql = line.trim();
        if sql.is_empty() || sql.starts_with("--") {
            continue;
        }
        match node.query(sql).await {
            Ok(result) => print!("{}", result.to_tsv()),
            Err(e) => eprintln!("ERROR: {}", e),
        }
    }

    node.shutdown().await;
    Ok(())
}
