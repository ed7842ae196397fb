//! shmvault operator CLI
//!
//! Manages a named vault region from the shell:
//! - Region lifecycle (init, stats, destroy)
//! - Key management (add, delete, lookup, list, clear)
//! - Effective configuration and metrics
//!
//! # Examples
//!
//! ```bash
//! # Create the region with a 2 MiB budget
//! shmvault --max-size 2097152 init
//!
//! # Store a key read from stdin
//! head -c 32 /dev/urandom | shmvault add db-master --comment "primary database"
//!
//! # List ids and lengths, never secrets
//! shmvault list --json
//! ```

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use shmvault::metrics;
use shmvault::{Vault, VaultConfig};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeroize::Zeroizing;

/// shmvault - shared-memory key vault
#[derive(Parser, Debug)]
#[command(name = "shmvault")]
#[command(version = shmvault::VERSION)]
#[command(about = "Shared-memory key vault", long_about = None)]
#[command(author = "Anton Feldmann <afeldman@lynqtech.com>")]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "SHMVAULT_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    region: RegionArgs,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "SHMVAULT_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

/// Overrides applied on top of the loaded configuration
#[derive(Args, Debug)]
struct RegionArgs {
    /// Region name shared by every process of the group
    #[arg(long, global = true)]
    region_name: Option<String>,

    /// Directory holding the region and lock files
    #[arg(long, global = true)]
    shm_dir: Option<PathBuf>,

    /// Region byte budget, used only when the region is created
    #[arg(long, global = true)]
    max_size: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the region, or attach to it if it exists
    Init,

    /// Store a new key
    Add {
        /// Unique key id
        id: String,

        /// Secret as base64; read raw from stdin when omitted
        #[arg(long)]
        secret_base64: Option<String>,

        /// Free-form comment
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Remove a key
    Delete {
        id: String,
    },

    /// Print a key as base64
    Lookup {
        id: String,
    },

    /// List key ids, secret lengths and comments
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove every key
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Show region occupancy
    Stats {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Erase the region and remove its files
    Destroy {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Print Prometheus metrics of this invocation
    Metrics,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;
    metrics::init_metrics();

    let config = effective_config(&cli)?;

    match cli.command {
        Commands::Init => init_command(&config),
        Commands::Add {
            id,
            secret_base64,
            comment,
        } => add_command(&config, &id, secret_base64, comment),
        Commands::Delete { id } => delete_command(&config, &id),
        Commands::Lookup { id } => lookup_command(&config, &id),
        Commands::List { json } => list_command(&config, json),
        Commands::Clear { force } => clear_command(&config, force),
        Commands::Stats { json } => stats_command(&config, json),
        Commands::Destroy { force } => destroy_command(&config, force),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Metrics => {
            let vault = Vault::attach(&config)?;
            let stats = vault.stats()?;
            metrics::observe_occupancy(&stats.name, stats.count, stats.capacity);
            print!("{}", metrics::export_metrics());
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "shmvault.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    // Console output goes to stderr; stdout carries command results.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Configuration file and environment, then command-line overrides
fn effective_config(cli: &Cli) -> anyhow::Result<VaultConfig> {
    let mut config = VaultConfig::load(cli.config.as_deref())?;

    if let Some(name) = &cli.region.region_name {
        config.region_name = name.clone();
    }
    if let Some(dir) = &cli.region.shm_dir {
        config.shm_dir = dir.clone();
    }
    if let Some(max_size) = cli.region.max_size {
        config.max_size = max_size;
    }

    config.validate()?;
    Ok(config)
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} (yes/no): ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase() == "yes")
}

/// Init command - create or attach the configured region
fn init_command(config: &VaultConfig) -> anyhow::Result<()> {
    let vault = Vault::open(config)?;
    let stats = vault.stats()?;
    info!(name = %stats.name, capacity = stats.capacity, "Vault region ready");
    println!(
        "✅ Region '{}' ready: {} of {} slots used",
        stats.name, stats.count, stats.capacity
    );
    Ok(())
}

/// Add command
fn add_command(
    config: &VaultConfig,
    id: &str,
    secret_base64: Option<String>,
    comment: Option<String>,
) -> anyhow::Result<()> {
    let secret = match secret_base64 {
        Some(encoded) => Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .context("--secret-base64 is not valid base64")?,
        ),
        None => read_secret_from_stdin()?,
    };

    let vault = Vault::open(config)?;
    vault.add(id, &secret, comment.as_deref())?;
    println!("✅ Added key '{}' ({} bytes)", id, secret.len());
    Ok(())
}

/// Raw secret bytes from stdin, without one trailing newline
fn read_secret_from_stdin() -> anyhow::Result<Zeroizing<Vec<u8>>> {
    let mut secret = Zeroizing::new(Vec::new());
    io::stdin()
        .read_to_end(&mut secret)
        .context("Failed to read the secret from stdin")?;

    if secret.last() == Some(&b'\n') {
        secret.pop();
        if secret.last() == Some(&b'\r') {
            secret.pop();
        }
    }
    Ok(secret)
}

/// Delete command
fn delete_command(config: &VaultConfig, id: &str) -> anyhow::Result<()> {
    let vault = Vault::attach(config)?;
    if vault.delete(id)? {
        println!("✅ Deleted key '{}'", id);
    } else {
        println!("Key '{}' not found", id);
    }
    Ok(())
}

/// Lookup command
fn lookup_command(config: &VaultConfig, id: &str) -> anyhow::Result<()> {
    let vault = Vault::attach(config)?;
    let encoded = vault
        .with_secret(id, |secret| Zeroizing::new(STANDARD.encode(secret)))?
        .with_context(|| format!("Key '{}' not found", id))?;
    println!("{}", encoded.as_str());
    Ok(())
}

/// List command
fn list_command(config: &VaultConfig, json: bool) -> anyhow::Result<()> {
    let vault = Vault::attach(config)?;
    let listing = vault.list_metadata()?;

    if json {
        let entries: Vec<_> = listing.collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if listing.len() == 0 {
        println!("No keys.");
        return Ok(());
    }
    println!("{:<64} {:>6}  COMMENT", "ID", "BYTES");
    for entry in listing {
        println!(
            "{:<64} {:>6}  {}",
            entry.id,
            entry.secret_len,
            entry.comment.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Clear command
fn clear_command(config: &VaultConfig, force: bool) -> anyhow::Result<()> {
    let vault = Vault::attach(config)?;
    if !force && !confirm(&format!("Remove every key from '{}'?", config.region_name))? {
        println!("Aborted.");
        return Ok(());
    }
    vault.clear_all()?;
    println!("✅ Cleared region '{}'", config.region_name);
    Ok(())
}

/// Stats command
fn stats_command(config: &VaultConfig, json: bool) -> anyhow::Result<()> {
    let vault = Vault::attach(config)?;
    let stats = vault.stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Region: {}", stats.name);
        println!("Entries: {} / {}", stats.count, stats.capacity);
        println!("Slot size: {} B", stats.slot_size);
        println!("Budget: {} B", stats.budget);
        println!("Shared: {}", stats.shared);
    }
    Ok(())
}

/// Destroy command
fn destroy_command(config: &VaultConfig, force: bool) -> anyhow::Result<()> {
    let vault = Vault::attach(config)?;
    if !force
        && !confirm(&format!(
            "Destroy region '{}' and every key in it?",
            config.region_name
        ))?
    {
        println!("Aborted.");
        return Ok(());
    }
    vault.destroy()?;
    warn!(name = %config.region_name, "Vault region destroyed from the CLI");
    println!("✅ Destroyed region '{}'", config.region_name);
    Ok(())
}
