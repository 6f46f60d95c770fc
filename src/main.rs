use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trace_chain::config::NodeConfig;
use trace_chain::errors::ChainResult;
use trace_chain::node::Node;

#[derive(Parser)]
#[command(author, version, about = "Agricultural traceability ledger node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the ledger and seal pending stage events on a timer
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Rebuild the persisted ledger and verify every block
    Verify {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Print ledger statistics as JSON
    Stats {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_node(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Verify { config } => verify_ledger(&config)?,
        Commands::Stats { config } => print_stats(&config)?,
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<NodeConfig> {
    if path.exists() {
        Ok(NodeConfig::load(path)?)
    } else {
        Ok(NodeConfig::default())
    }
}

async fn start_node(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        let config = NodeConfig::default();
        config.save(&config_path)?;
        config
    };

    let node = Node::open(config)?;
    let node_task = tokio::spawn(async move { node.start().await });

    tokio::select! {
        res = node_task => handle_join(res),
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn verify_ledger(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    if !config.db_path().exists() {
        return Err(anyhow!(
            "no ledger found at {}",
            config.db_path().display()
        ));
    }
    // Opening rebuilds and verifies the persisted chain.
    let node = Node::open(config)?;
    let verdict = node.handle().verify_chain();
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if !verdict.is_valid() {
        return Err(anyhow!("ledger failed verification"));
    }
    Ok(())
}

fn print_stats(config_path: &Path) -> Result<()> {
    let node = Node::open(load_config(config_path)?)?;
    let stats = node.handle().network_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn handle_join(result: Result<ChainResult<()>, JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(err) => Err(anyhow!(err)),
    }
}
