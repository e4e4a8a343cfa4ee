//! Azedarach: orchestrator for parallel coding-agent sessions
//!
//! Each issue ("bead") in the beads tracker gets an isolated git worktree
//! and a tmux session running a coding agent. Azedarach watches agent state
//! through tmux session options and pane output, and merges finished
//! branches back to the base branch with conflict resolution delegated to
//! the agent itself.

pub mod cli;
pub mod config;
pub mod detect;
pub mod git;
pub mod hooks;
pub mod lock;
pub mod merge;
pub mod multiplexer;
pub mod session;
pub mod telemetry;
pub mod tracker;
pub mod worktree;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AzedarachError {
    #[error("Git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("git {command} failed: {stderr}")]
    Vcs { command: String, stderr: String },

    #[error("Not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Telemetry database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tracker command failed: {0}")]
    Tracker(String),

    #[error("Issue not found: {0}")]
    NotFound(String),

    #[error("Failed to parse tracker output: {0}")]
    Parse(String),

    #[error("Tracker database out of sync; run 'bd sync --import-only'")]
    SyncRequired,

    #[error("No worktree for bead: {0}")]
    WorktreeNotFound(String),

    #[error("Multiplexer error: {0}")]
    Multiplexer(String),

    #[error("Multiplexer session not found: {0}")]
    SessionNotFound(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Lock conflict on {0}")]
    LockConflict(String),

    #[error("Merge conflicts for {bead_id}: {message}")]
    MergeConflict {
        bead_id: String,
        files: Vec<String>,
        message: String,
    },

    #[error("Post-merge validation failed: {0}")]
    TypeCheck(String),

    #[error("Operation needs network but environment is offline: {0}")]
    Offline(String),
}

pub type Result<T> = std::result::Result<T, AzedarachError>;

/// Check whether a string is a well-formed bead id (`<prefix>-<suffix>`,
/// lowercase alpha prefix, lowercase alphanumeric suffix).
///
/// Bead ids double as branch names, worktree path suffixes, and tmux
/// session names, so everything downstream relies on this shape.
pub fn is_bead_id(s: &str) -> bool {
    let Some((prefix, suffix)) = s.split_once('-') else {
        return false;
    };
    !prefix.is_empty()
        && !suffix.is_empty()
        && prefix.bytes().all(|b| b.is_ascii_lowercase())
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bead_id_shapes() {
        assert!(is_bead_id("az-bqzy"));
        assert!(is_bead_id("az-1"));
        assert!(is_bead_id("beads-0af3"));
        assert!(!is_bead_id("random"));
        assert!(!is_bead_id("az-"));
        assert!(!is_bead_id("-bqzy"));
        assert!(!is_bead_id("AZ-BQZY"));
    }

    #[test]
    fn test_bead_id_multi_dash_suffix() {
        // Only the first dash splits prefix from suffix; later dashes are
        // not valid suffix characters.
        assert!(!is_bead_id("az-bq-zy"));
    }
}
