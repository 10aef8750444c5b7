//! Ledger keeper
//!
//! Sends administrative transactions from one account and keeps every one of
//! them moving until the ledger settles it.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────────┐
//!                    │                      LEDGER KEEPER                        │
//!                    │                                                           │
//!   send_value       │  ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌─────────┐  │
//!   send_contract ───┼─▶│ service  │──▶│  nonce  │──▶│  wallet  │──▶│  store  │  │
//!                    │  └──────────┘   └─────────┘   └──────────┘   └────┬────┘  │
//!                    │                                                   │       │
//!                    │                                                   ▼       │
//!                    │  ┌──────────────┐          ┌────────────┐   ┌──────────┐  │
//!   ledger node ◀────┼──│ connection   │◀─────────│ dispatcher │◀──│reconciler│  │
//!   (websocket) ─────┼─▶│ manager      │─────────▶│  watcher   │──▶│ (sweep,  │  │
//!                    │  └──────────────┘  logs    └─────┬──────┘   │  boost)  │  │
//!                    │                                  │          └────┬─────┘  │
//!                    │                                  ▼               ▼        │
//!                    │                          checkpoint store   event bus ────┼──▶ subscribers
//!                    └──────────────────────────────────────────────────────────┘
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use alloy::primitives::{Address, TxHash};
use clap::{Parser, Subcommand};

use ledger_keeper::blockchain::secret::LocalSecretAccess;
use ledger_keeper::blockchain::transaction::{from_base_units, NATIVE_DECIMALS};
use ledger_keeper::blockchain::WsConnector;
use ledger_keeper::config::load_config;
use ledger_keeper::events::{BroadcastBus, LedgerEvent, MemoryCheckpointStore};
use ledger_keeper::lifecycle::signals::wait_for_signal;
use ledger_keeper::observability::{logging, metrics};
use ledger_keeper::transactions::MemoryTransactionStore;
use ledger_keeper::{KeeperConfig, KeeperDeps, LedgerKeeper, Shutdown};

#[derive(Parser)]
#[command(name = "ledger-keeper")]
#[command(about = "Administrative transaction keeper for an EVM ledger", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "ledger-keeper.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the keeper until SIGINT/SIGTERM
    Run,
    /// Print the native balance of an address
    Balance { address: String },
    /// Print the token balance of an address
    TokenBalance { address: String },
    /// Print the next nonce an address would be assigned
    Nonce { address: String },
    /// Re-read one transaction from the ledger and print its record
    Refresh { hash: String },
    /// Validate the config file and exit
    Check,
}

struct Runtime {
    keeper: LedgerKeeper,
    store: Arc<MemoryTransactionStore>,
    checkpoints: Arc<MemoryCheckpointStore>,
    bus: Arc<BroadcastBus>,
}

impl Runtime {
    fn build(config: &KeeperConfig) -> Result<Self, Box<dyn Error>> {
        let bus = Arc::new(BroadcastBus::default());
        let store = match &config.storage.records_path {
            Some(path) => MemoryTransactionStore::load_from_file(path)?,
            None => MemoryTransactionStore::new(None),
        };
        let store = Arc::new(store.with_bus(bus.clone()));
        let checkpoints = Arc::new(match &config.storage.checkpoint_path {
            Some(path) => MemoryCheckpointStore::load_from_file(path)?,
            None => MemoryCheckpointStore::new(None),
        });

        let connector = Arc::new(WsConnector::new(std::time::Duration::from_secs(
            config.ledger.rpc_timeout_secs,
        )));
        let keeper = LedgerKeeper::new(
            config.clone(),
            KeeperDeps {
                connector,
                secrets: Arc::new(LocalSecretAccess),
                store: store.clone(),
                checkpoints: checkpoints.clone(),
                bus: bus.clone(),
            },
        )?;

        Ok(Self {
            keeper,
            store,
            checkpoints,
            bus,
        })
    }

    fn save_snapshots(&self) {
        if let Err(e) = self.store.save_to_file() {
            tracing::error!(error = %e, "Failed to save transaction records");
        }
        if let Err(e) = self.checkpoints.save_to_file() {
            tracing::error!(error = %e, "Failed to save watch checkpoints");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    logging::init_logging(&config.observability.log_level);

    tracing::info!(
        config = %cli.config.display(),
        network_id = config.ledger.network_id,
        websocket_url = %config.ledger.websocket_url,
        "ledger-keeper v0.1.0 starting"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Check => {
            println!("{} is valid", cli.config.display());
            Ok(())
        }
        Commands::Balance { address } => {
            let runtime = Runtime::build(&config)?;
            let balance = runtime.keeper.get_balance(parse_address(&address)?).await?;
            println!("{}", from_base_units(balance, NATIVE_DECIMALS)?);
            runtime.keeper.connection().close().await;
            Ok(())
        }
        Commands::TokenBalance { address } => {
            let runtime = Runtime::build(&config)?;
            let balance = runtime
                .keeper
                .get_token_balance(parse_address(&address)?)
                .await?;
            println!("{}", from_base_units(balance, config.ledger.contract_decimals)?);
            runtime.keeper.connection().close().await;
            Ok(())
        }
        Commands::Nonce { address } => {
            let runtime = Runtime::build(&config)?;
            let nonce = runtime.keeper.get_nonce_for(parse_address(&address)?).await?;
            println!("{}", nonce);
            runtime.keeper.connection().close().await;
            Ok(())
        }
        Commands::Refresh { hash } => {
            let runtime = Runtime::build(&config)?;
            let hash: TxHash = hash
                .parse()
                .map_err(|e| format!("invalid transaction hash '{}': {}", hash, e))?;
            let record = runtime.keeper.refresh_from_ledger(hash).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            runtime.keeper.connection().close().await;
            runtime.save_snapshots();
            Ok(())
        }
    }
}

async fn run(config: KeeperConfig) -> Result<(), Box<dyn Error>> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let runtime = Runtime::build(&config)?;
    match runtime.keeper.unlock() {
        Ok(address) => tracing::info!(admin = %address, "Signing key loaded"),
        Err(e) => tracing::error!(error = %e, "Signing key unavailable, administrative sends are halted"),
    }

    if let Err(e) = runtime
        .keeper
        .connection()
        .ensure_connected(config.ledger.connect_attempts)
        .await
    {
        tracing::warn!(error = %e, "Ledger not reachable yet, health check will keep trying");
    }

    let shutdown = Shutdown::new();
    tokio::spawn(log_events(runtime.bus.clone(), shutdown.subscribe()));
    runtime.keeper.start(&shutdown);

    wait_for_signal().await;
    tracing::info!("Shutting down");
    runtime.keeper.stop(&shutdown).await;
    runtime.save_snapshots();

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn log_events(bus: Arc<BroadcastBus>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let mut events = bus.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LedgerEvent::ContractLogObserved(_)) => {}
                Ok(event) => tracing::info!(event = ?event, "Ledger event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Event log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}

fn parse_address(raw: &str) -> Result<Address, Box<dyn Error>> {
    raw.parse::<Address>()
        .map_err(|e| format!("invalid address '{}': {}", raw, e).into())
}
