//! Runtime configuration consumed by the orchestration core.
//!
//! Loading these from disk is the front-end's job; the core only consumes
//! the structs.

use serde::Deserialize;
use std::collections::HashMap;

/// Commands run inside a fresh worktree before the agent starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Shell commands executed in the new worktree (e.g. `direnv allow`,
    /// `npm install`).
    pub init_commands: Vec<String>,
    /// Extra environment for init commands.
    pub env: HashMap<String, String>,
    /// Keep going when an init command exits non-zero.
    pub continue_on_failure: bool,
    /// Run init commands concurrently instead of sequentially.
    pub parallel: bool,
    /// Untracked paths copied from the source checkout into the worktree.
    /// Missing paths are skipped silently.
    pub copy_untracked: Vec<String>,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            init_commands: Vec::new(),
            env: HashMap::new(),
            continue_on_failure: true,
            parallel: false,
            copy_untracked: vec![".direnv".to_string()],
        }
    }
}

/// How agent sessions are spawned inside tmux.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// The assistant invocation (e.g. "claude").
    pub command: String,
    /// Shell wrapping the assistant so the window survives agent exit.
    pub shell: String,
    /// Prefix distinguishing agent sessions from the user's own tmux
    /// sessions.
    pub tmux_prefix: String,
    /// Passed through verbatim to the assistant when set.
    pub dangerously_skip_permissions: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            shell: "zsh".to_string(),
            tmux_prefix: String::new(),
            dangerously_skip_permissions: false,
        }
    }
}

/// Post-merge validation and auto-fix behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Commands run sequentially in the project root after a merge;
    /// empty disables validation.
    pub validate_commands: Vec<String>,
    /// Command run when validation fails (e.g. a formatter).
    pub fix_command: Option<String>,
    /// How many fix-then-revalidate rounds to attempt.
    pub max_fix_attempts: u32,
    /// Spawn an agent session on the merged branch when validation still
    /// fails after all fix attempts.
    pub start_claude_on_failure: bool,
    /// Push the base branch to origin after a successful merge.
    pub push_to_origin: bool,
    /// Stage and commit dirty worktree changes before merging instead of
    /// refusing.
    pub commit_dirty: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            validate_commands: Vec::new(),
            fix_command: None,
            max_fix_attempts: 2,
            start_claude_on_failure: false,
            push_to_origin: false,
            commit_dirty: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Integration branch beads merge back into. `None` means "whatever
    /// branch the project is currently on".
    pub base_branch: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self { base_branch: None }
    }
}

/// Top-level configuration handed to the orchestration core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worktree: WorktreeConfig,
    pub session: SessionConfig,
    pub merge: MergeConfig,
    pub git: GitConfig,
}
