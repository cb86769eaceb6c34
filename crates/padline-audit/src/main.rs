//! Padline audit binary.
//!
//! # Usage
//!
//! ```bash
//! # List conversations and how much key material each has left
//! padline-audit --db keys.redb list
//!
//! # Print one conversation's audit trail
//! padline-audit --db keys.redb show conversation-42
//!
//! # Replay every ledger (non-zero exit if any is corrupt)
//! padline-audit --db keys.redb verify
//! ```

use std::path::PathBuf;

use clap::Parser;
use padline_audit::{AuditConfig, Command};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Padline key history auditor
#[derive(Parser, Debug)]
#[command(name = "padline-audit")]
#[command(about = "Inspect and verify persisted one-time-pad key histories")]
#[command(version)]
struct Args {
    /// Path to the key history database
    #[arg(short, long, default_value = "padline.redb")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = AuditConfig { db_path: args.db, log_level: args.log_level };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Reports go to stdout, logs to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    tracing::info!(
        db = %config.db_path.display(),
        command = ?args.command,
        "Auditing key histories"
    );

    let storage = config.open_storage()?;
    let mut out = std::io::stdout().lock();

    padline_audit::run(&storage, &args.command, &mut out)?;

    Ok(())
}
