//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "azedarach")]
#[command(about = "Parallel coding-agent sessions over a beads tracker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the project repository (defaults to current directory)
    #[arg(short = 'C', long, global = true)]
    pub project: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an agent session for a bead
    Start {
        /// Bead id (e.g. az-bqzy)
        bead: String,

        /// Base branch for a fresh worktree
        #[arg(short, long)]
        branch: Option<String>,

        /// Initial prompt sent to the agent
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Stop a session (syncs the tracker, kills the tmux session)
    Stop {
        bead: String,
    },

    /// Interrupt the agent and checkpoint its worktree
    Pause {
        bead: String,
    },

    /// Mark a paused session busy again (reattach tmux yourself)
    Resume {
        bead: String,
    },

    /// List active sessions, reconciled against tmux
    List {
        /// Show worktree paths and start times
        #[arg(short, long)]
        verbose: bool,
    },

    /// Merge a bead's branch back into the base branch
    Merge {
        bead: String,

        /// Base branch override
        #[arg(long)]
        base: Option<String>,

        /// Push the base branch to origin after merging
        #[arg(long)]
        push: bool,

        /// Only predict conflicts; change nothing
        #[arg(long)]
        check: bool,
    },

    /// Bring the base branch into a bead's worktree
    Update {
        bead: String,

        /// Base branch override
        #[arg(long)]
        base: Option<String>,

        /// Auto-stash uncommitted worktree changes around the merge
        #[arg(long)]
        stash: bool,
    },

    /// Abort an in-progress merge inside a bead's worktree
    AbortMerge {
        bead: String,
    },

    /// Inferred state and phase per session, from hooks and pane output
    Status {
        /// Restrict to one bead
        bead: Option<String>,
    },

    /// Follow hook-driven state changes until interrupted
    Watch,

    /// List ready issues from the tracker
    Ready,
}
