// src/main.rs
//! Safe confirmation reconciler entry point.
use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use ethers::types::{Address, H256};
use safe_reconciler::blockchain::{ChainOracle, EthereumClient};
use safe_reconciler::core::config::AppConfig;
use safe_reconciler::scheduler::{Completion, RetryScheduler};
use safe_reconciler::storage::SqliteConfirmationStore;
use safe_reconciler::{ConfirmationKey, Reconciler};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "safe_reconciler")]
#[command(about = "Reconcile Safe multisig confirmations with on-chain state")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the TOML configuration (defaults to CONFIG_PATH or ./config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a single confirmation, retrying while it is undetermined
    Check(CheckArgs),
    /// Check every pending confirmation in the database
    Sweep,
    /// Create the database schema and exit
    InitDb,
}

#[derive(ClapArgs)]
struct CheckArgs {
    #[arg(long, value_parser = parse_address)]
    safe: Address,
    /// Safe transaction hash the owner approved
    #[arg(long, value_parser = parse_hash)]
    contract_tx_hash: H256,
    /// Hash of the on-chain approveHash transaction
    #[arg(long, value_parser = parse_hash)]
    tx_hash: H256,
    #[arg(long, value_parser = parse_address)]
    owner: Address,
    /// Run a single attempt without rescheduling
    #[arg(long)]
    no_retry: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging()?;

    info!("Starting safe_reconciler v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(args.config.as_deref())?;

    let store = Arc::new(
        SqliteConfirmationStore::new_with_url(
            &config.storage.database_url,
            config.storage.max_connections,
        )
        .await?,
    );

    match args.command {
        Commands::InitDb if store.is_in_memory() => {
            warn!("In-memory database, the schema is discarded on exit")
        }
        Commands::InitDb => info!("Database schema ready"),
        Commands::Check(check) => {
            let scheduler = build_scheduler(&config, store).await?;
            let key = ConfirmationKey {
                safe: check.safe,
                contract_transaction_hash: check.contract_tx_hash,
                transaction_hash: check.tx_hash,
                owner: check.owner,
            };
            match scheduler.run(key, !check.no_retry).await? {
                Completion::Finished { outcome, attempts } => {
                    info!(%key, %outcome, attempts, "Check finished");
                    println!("{}", outcome);
                }
                Completion::Skipped => println!("skipped"),
            }
        }
        Commands::Sweep => {
            let scheduler = build_scheduler(&config, store.clone()).await?;
            let summary = scheduler.sweep(store.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?);
            if summary.failed > 0 {
                anyhow::bail!("{} confirmations failed to reconcile", summary.failed);
            }
        }
    }

    Ok(())
}

async fn build_scheduler(
    config: &AppConfig,
    store: Arc<SqliteConfirmationStore>,
) -> Result<RetryScheduler> {
    let client = EthereumClient::new(
        &config.network.rpc_url,
        Duration::from_secs(config.network.request_timeout_secs),
    )
    .await?;
    if let Some(expected) = config.network.chain_id {
        if client.chain_id() != expected {
            anyhow::bail!(
                "RPC node serves chain {} but configuration expects {}",
                client.chain_id(),
                expected
            );
        }
    }
    let network = client.network_name().to_string();

    let reconciler = Arc::new(Reconciler::from_config(Arc::new(client), store, &config.reconciler));
    let scheduler = RetryScheduler::from_config(reconciler.clone(), &config.reconciler, &config.worker);
    let policy = scheduler.policy();
    info!(
        %network,
        reorg_blocks = reconciler.reorg_blocks(),
        max_retries = policy.max_retries,
        retry_delay = ?policy.delay,
        "Reconciler ready"
    );
    Ok(scheduler)
}

const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn,hyper=info";

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing::subscriber::set_global_default(log_subscriber(filter))?;
    Ok(())
}

fn log_subscriber(filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync {
    FmtSubscriber::builder().with_env_filter(filter).finish()
}

fn parse_address(value: &str) -> Result<Address, String> {
    Address::from_str(value.trim()).map_err(|e| format!("invalid address '{}': {}", value, e))
}

fn parse_hash(value: &str) -> Result<H256, String> {
    H256::from_str(value.trim()).map_err(|e| format!("invalid hash '{}': {}", value, e))
}

fn summary_json(summary: &safe_reconciler::scheduler::SweepSummary) -> serde_json::Value {
    let outcomes: serde_json::Map<String, serde_json::Value> = summary
        .outcomes
        .iter()
        .map(|(outcome, count)| (outcome.to_string(), serde_json::json!(count)))
        .collect();
    serde_json::json!({
        "outcomes": outcomes,
        "skipped": summary.skipped,
        "failed": summary.failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn default_filter_quiets_dependencies() {
        let subscriber = log_subscriber(EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing::subscriber::with_default(subscriber, || {
            assert!(!tracing::enabled!(target: "sqlx::query", Level::DEBUG));
            assert!(tracing::enabled!(target: "sqlx::query", Level::WARN));
            assert!(tracing::enabled!(target: "safe_reconciler::reconciler", Level::INFO));
            assert!(!tracing::enabled!(target: "safe_reconciler::reconciler", Level::DEBUG));
        });
    }

    #[test]
    fn env_filter_directives_are_honoured() {
        let subscriber = log_subscriber(EnvFilter::new("warn,safe_reconciler=debug"));
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(target: "safe_reconciler::scheduler", Level::DEBUG));
            assert!(!tracing::enabled!(target: "hyper::client", Level::INFO));
        });
    }

    #[test]
    fn parses_cli_hashes() {
        assert!(parse_hash("0x1234").is_err());
        assert_eq!(parse_address(" 0x5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a "), Ok(Address::repeat_byte(0x5a)));
    }
}
