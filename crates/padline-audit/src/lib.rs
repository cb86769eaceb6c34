//! Audit commands over persisted key histories.
//!
//! Read-only inspection of the ledgers in a `padline-store` database: list
//! the conversations, print one conversation's audit trail, or replay every
//! ledger to detect corruption. Output is written to any [`Write`] so the
//! commands can be tested without a terminal.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::{io::Write, path::PathBuf};

use clap::Subcommand;
use padline_core::ConversationId;
use padline_store::{RedbStorage, Storage, StorageError};
use thiserror::Error;

/// Audit tool configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Path to the redb key history database
    pub db_path: PathBuf,
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { db_path: PathBuf::from("padline.redb"), log_level: "info".to_string() }
    }
}

impl AuditConfig {
    /// Open the configured database.
    ///
    /// Refuses to create a database that does not exist yet.
    pub fn open_storage(&self) -> Result<RedbStorage, AuditError> {
        if !self.db_path.exists() {
            return Err(AuditError::MissingDatabase(self.db_path.clone()));
        }

        Ok(RedbStorage::open(&self.db_path)?)
    }
}

/// Audit subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List conversations with their operation count and available bytes
    List,
    /// Print the audit trail of one conversation
    Show {
        /// Conversation identifier
        conversation: String,
    },
    /// Replay every ledger and report which are corrupt
    Verify,
}

/// Errors from audit commands
#[derive(Error, Debug)]
pub enum AuditError {
    /// Database file does not exist
    #[error("database not found: {}", .0.display())]
    MissingDatabase(PathBuf),

    /// Storage failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// `verify` found corrupt ledgers
    #[error("{corrupt} of {total} key histories are corrupt")]
    Corrupt {
        /// Number of corrupt ledgers
        corrupt: usize,
        /// Number of ledgers checked
        total: usize,
    },

    /// Could not write command output
    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

/// Run `command` against `storage`, writing its report to `out`.
///
/// # Errors
///
/// - `AuditError::Storage` with `StorageError::NotFound` if `show` names an
///   unknown conversation
/// - `AuditError::Corrupt` if `verify` found any corrupt ledger (the report
///   is still written in full)
pub fn run(
    storage: &impl Storage,
    command: &Command,
    out: &mut impl Write,
) -> Result<(), AuditError> {
    match command {
        Command::List => list(storage, out),
        Command::Show { conversation } => {
            show(storage, &ConversationId::new(conversation.as_str()), out)
        },
        Command::Verify => verify(storage, out),
    }
}

fn sorted_conversations(storage: &impl Storage) -> Result<Vec<ConversationId>, AuditError> {
    let mut conversations = storage.list_conversations()?;
    conversations.sort();
    Ok(conversations)
}

fn list(storage: &impl Storage, out: &mut impl Write) -> Result<(), AuditError> {
    for conversation_id in sorted_conversations(storage)? {
        let operations = storage.operation_count(&conversation_id)?;

        match storage.load_history(&conversation_id) {
            Ok(Some(history)) => writeln!(
                out,
                "{conversation_id} operations={operations} available={}",
                history.available()
            )?,
            Ok(None) => {},
            Err(StorageError::Corrupt { .. }) => {
                writeln!(out, "{conversation_id} operations={operations} corrupt")?;
            },
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn show(
    storage: &impl Storage,
    conversation_id: &ConversationId,
    out: &mut impl Write,
) -> Result<(), AuditError> {
    let history = storage
        .load_history(conversation_id)?
        .ok_or_else(|| StorageError::NotFound { conversation_id: conversation_id.clone() })?;

    writeln!(out, "{history}")?;

    Ok(())
}

fn verify(storage: &impl Storage, out: &mut impl Write) -> Result<(), AuditError> {
    let conversations = sorted_conversations(storage)?;
    let mut corrupt = 0;

    for conversation_id in &conversations {
        match storage.load_history(conversation_id) {
            Ok(Some(history)) => {
                writeln!(out, "ok {conversation_id} {}", history.current_state())?;
            },
            Ok(None) => {},
            Err(StorageError::Corrupt { source, .. }) => {
                corrupt += 1;
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %source,
                    "Corrupt key history"
                );
                writeln!(out, "corrupt {conversation_id} {source}")?;
            },
            Err(e) => return Err(e.into()),
        }
    }

    if corrupt > 0 {
        return Err(AuditError::Corrupt { corrupt, total: conversations.len() });
    }

    tracing::info!(checked = conversations.len(), "All key histories verified");

    Ok(())
}
