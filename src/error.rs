//! Error types for tally
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, missing repo, validation failures)
//! - 3: Blocked by policy (responsibility held by someone else)
//! - 4: Operation failed (I/O, git error, sync exhausted)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the tally CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const POLICY_BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for tally operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Not a git repository: {0}")]
    NotARepo(PathBuf),

    #[error("Repository not found from {0}")]
    RepoNotFound(PathBuf),

    #[error("tally is not initialized in {0}")]
    NotInitialized(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Malformed event filename '{name}': {reason}")]
    InvalidEventName { name: String, reason: String },

    #[error("Dependency {from} -> {to} would create a cycle")]
    DependencyCycle { from: String, to: String },

    #[error("Status transition not allowed: {from} -> {to}")]
    StatusTransition { from: String, to: String },

    // Policy blocks (exit code 3)
    #[error("Item {item} is taken by {holder}")]
    TakeConflict { item: String, holder: String },

    // Operation failures (exit code 4)
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("git {command} failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Merge conflict while syncing: {0}")]
    MergeConflict(String),

    #[error("Push failed after {attempts} attempts: {reason}")]
    SyncExhausted { attempts: usize, reason: String },

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::NotARepo(_)
            | Error::RepoNotFound(_)
            | Error::NotInitialized(_)
            | Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::ItemNotFound(_)
            | Error::InvalidEventName { .. }
            | Error::DependencyCycle { .. }
            | Error::StatusTransition { .. } => exit_codes::USER_ERROR,

            // Policy blocks
            Error::TakeConflict { .. } => exit_codes::POLICY_BLOCKED,

            // Operation failures
            Error::Git(_)
            | Error::GitCommand { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::MergeConflict(_)
            | Error::SyncExhausted { .. }
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured fields for `--json` error output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::InvalidEventName { name, reason } => {
                Some(serde_json::json!({ "name": name, "reason": reason }))
            }
            Error::DependencyCycle { from, to } => {
                Some(serde_json::json!({ "from": from, "to": to }))
            }
            Error::StatusTransition { from, to } => {
                Some(serde_json::json!({ "from": from, "to": to }))
            }
            Error::TakeConflict { item, holder } => {
                Some(serde_json::json!({ "item": item, "holder": holder }))
            }
            Error::SyncExhausted { attempts, reason } => {
                Some(serde_json::json!({ "attempts": attempts, "reason": reason }))
            }
            Error::GitCommand { command, stderr } => {
                Some(serde_json::json!({ "command": command, "stderr": stderr }))
            }
            _ => None,
        }
    }
}

/// Result type alias for tally operations
pub type Result<T> = std::result::Result<T, Error>;
