use aidledger::config::{LedgerConfig, VALIDATOR_PASSWORD_ENV};
use aidledger::crypto;
use aidledger::ledger::Blockchain;
use aidledger::runtime::LedgerRuntime;
use aidledger::storage::{FileStorage, Storage};
use aidledger::types::TransactionType;
use aidledger::validators::{InMemoryValidatorRegistry, Validator};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aidledger", about = "Proof-of-authority ledger for humanitarian aid shipments")]
struct Cli {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(long, short, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `aidledger=debug`.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a validator key pair sealed under the validator password.
    Keygen {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long, env = VALIDATOR_PASSWORD_ENV, hide_env_values = true)]
        password: String,
        /// Write the validator record here instead of stdout.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Run the ledger node with an interactive console.
    Run {
        #[arg(long, env = VALIDATOR_PASSWORD_ENV, hide_env_values = true)]
        password: String,
        /// Validator record produced by `keygen`. Repeatable.
        #[arg(long = "validator", value_name = "FILE")]
        validators: Vec<PathBuf>,
    },
    /// Load a snapshot and validate the chain it contains.
    Verify {
        /// Snapshot file. Defaults to the configured persistence path.
        #[arg(value_name = "FILE")]
        snapshot: Option<PathBuf>,
    },
    /// Write the default configuration to a file.
    InitConfig {
        #[arg(default_value = "aidledger.toml", value_name = "PATH")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };

    match cli.command {
        Command::Keygen {
            name,
            priority,
            password,
            out,
        } => keygen(&name, priority, &password, out.as_deref()),
        Command::Run {
            password,
            validators,
        } => run(config, &password, &validators).await,
        Command::Verify { snapshot } => verify(config, snapshot),
        Command::InitConfig { path } => {
            std::fs::write(&path, config.to_toml_string()?)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "Configuration written");
            Ok(())
        }
    }
}

fn keygen(name: &str, priority: i32, password: &str, out: Option<&Path>) -> Result<()> {
    let key = crypto::generate_signing_key();
    let validator = Validator::new(
        name,
        crypto::public_key_hex(&key),
        crypto::encrypt_private_key(&key, password)?,
        priority,
    );
    let json = serde_json::to_string_pretty(&validator)?;
    match out {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!(
                name,
                public_key = %validator.public_key,
                path = %path.display(),
                "Validator key generated"
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn verify(config: LedgerConfig, snapshot: Option<PathBuf>) -> Result<()> {
    let mut options = config.storage_options();
    if let Some(path) = snapshot {
        options.path = path;
    }
    let storage = FileStorage::new(options);
    let Some(snapshot) = storage.load()? else {
        bail!("no snapshot found at {}", storage.path().display());
    };
    let chain = Blockchain::from_parts(
        snapshot.chain,
        snapshot.pending_transactions,
        config.chain_settings(),
    )?;
    println!(
        "Chain valid: {} blocks, {} pending transactions, tip {}",
        chain.chain_length(),
        chain.pending_count(),
        chain.latest_block().hash
    );
    Ok(())
}

async fn run(config: LedgerConfig, password: &str, validator_files: &[PathBuf]) -> Result<()> {
    let registry = Arc::new(InMemoryValidatorRegistry::new(
        config.consensus.selection_strategy,
    ));
    for path in validator_files {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let validator: Validator = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        registry.register(validator)?;
    }
    if validator_files.is_empty() {
        warn!("No validators registered; blocks cannot be produced");
    }

    let automated = config.consensus.automated_block_creation;
    let runtime = LedgerRuntime::open(config, registry, password)?;
    if automated {
        runtime.start()?;
    }

    // Transactions typed at the console are signed with a session key.
    let console_key = crypto::generate_signing_key();
    info!(
        public_key = %crypto::public_key_hex(&console_key),
        "Node is running. Type 'help' for commands."
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let mut parts = line.trim().splitn(3, ' ');

        match parts.next().unwrap_or("") {
            "" => {}
            "exit" => break,
            "status" => {
                let tip = runtime.latest_block();
                println!(
                    "length={} pending={} tip=#{} {} producer={}",
                    runtime.query_chain_length(),
                    runtime.pending_count(),
                    tip.index,
                    tip.hash,
                    if runtime.is_running() { "running" } else { "stopped" }
                );
            }
            "mine" => match runtime.produce_block().await {
                Ok(block) => println!("Block #{} ({}) produced.", block.index, block.hash),
                Err(e) => error!(error = %e, "Failed to produce block"),
            },
            "validate" => println!("Chain valid: {}", runtime.query_chain_validity()),
            "save" => match runtime.save_snapshot() {
                Ok(()) => println!("Snapshot saved."),
                Err(e) => error!(error = %e, "Failed to save snapshot"),
            },
            "tx" => {
                let (Some(kind), Some(payload)) = (parts.next(), parts.next()) else {
                    println!("usage: tx <type> <json payload>");
                    continue;
                };
                let tx_type: TransactionType = match kind.parse() {
                    Ok(t) => t,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                match runtime.submit_signed(tx_type, &console_key, payload) {
                    Ok(tx) => println!("Transaction {} queued.", tx.id),
                    Err(e) => error!(error = %e, "Transaction rejected"),
                }
            }
            "help" => println!("Available commands: status, tx, mine, validate, save, exit, help"),
            other => println!("Unknown command: {}", other),
        }
    }

    if runtime.is_running() {
        runtime.stop().await?;
    } else if runtime.config().persistence.auto_save {
        runtime.save_snapshot()?;
    }
    info!("Exiting ledger node.");
    Ok(())
}
