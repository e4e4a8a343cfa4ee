//! Agent session lifecycle.
//!
//! The registry maps bead ids to live sessions; tmux is the source of
//! truth and `list_active` reconciles against it, so a restarted
//! orchestrator self-heals by adopting whatever agent sessions it finds.

use crate::config::{AppConfig, SessionConfig, WorktreeConfig};
use crate::detect::SessionState;
use crate::hooks::{HookStatus, PROJECT_OPTION, SessionStateUpdate, WORKTREE_OPTION};
use crate::lock::FileLockManager;
use crate::multiplexer::{Multiplexer, parse_session_name};
use crate::telemetry::Telemetry;
use crate::tracker::{IssueStatus, IssueTracker, UpdateIssue};
use crate::worktree::{CreateWorktreeOptions, WorktreeManager};
use crate::{AzedarachError, Result, git};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Settle time between interrupting an agent and committing its worktree.
const PAUSE_SETTLE: Duration = Duration::from_millis(500);

/// A live (or paused) agent session.
#[derive(Debug, Clone)]
pub struct Session {
    pub bead_id: String,
    pub worktree_path: PathBuf,
    pub multiplexer_session_name: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub project_path: PathBuf,
}

/// Published on every registry state transition, in apply order per bead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub bead_id: String,
    pub old_state: SessionState,
    pub new_state: SessionState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StartSessionOptions {
    pub bead_id: String,
    pub project_path: PathBuf,
    pub base_branch: Option<String>,
    /// Sent to the assistant as its opening prompt.
    pub initial_prompt: Option<String>,
}

impl StartSessionOptions {
    pub fn new(bead_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            bead_id: bead_id.into(),
            project_path: project_path.into(),
            base_branch: None,
            initial_prompt: None,
        }
    }
}

/// Orchestrates agent sessions: worktree, tmux session, tracker status,
/// and the state-change broadcast hub.
pub struct SessionManager {
    registry: Mutex<HashMap<String, Session>>,
    events: broadcast::Sender<StateChange>,
    worktrees: Arc<WorktreeManager>,
    tracker: Arc<dyn IssueTracker>,
    multiplexer: Arc<dyn Multiplexer>,
    locks: FileLockManager,
    telemetry: Option<Arc<Telemetry>>,
    session_config: SessionConfig,
    worktree_config: WorktreeConfig,
}

impl SessionManager {
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        tracker: Arc<dyn IssueTracker>,
        multiplexer: Arc<dyn Multiplexer>,
        locks: FileLockManager,
        telemetry: Option<Arc<Telemetry>>,
        config: &AppConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry: Mutex::new(HashMap::new()),
            events,
            worktrees,
            tracker,
            multiplexer,
            locks,
            telemetry,
            session_config: config.session.clone(),
            worktree_config: config.worktree.clone(),
        }
    }

    /// Subscribe to state changes. Late subscribers see future events only.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Start an agent session for a bead. Idempotent: a bead that already
    /// has a session gets the existing one back.
    pub async fn start(&self, options: &StartSessionOptions) -> Result<Session> {
        if let Some(existing) = self.get(&options.bead_id) {
            return Ok(existing);
        }

        self.mark_in_progress(&options.bead_id, &options.project_path)
            .await;

        let worktree = self
            .worktrees
            .create(&CreateWorktreeOptions {
                bead_id: options.bead_id.clone(),
                project_path: options.project_path.clone(),
                base_branch: options.base_branch.clone(),
                source_worktree_path: None,
                copy_untracked: self.worktree_config.copy_untracked.clone(),
            })
            .await?;

        self.run_init_commands(&worktree.path).await?;

        let session_name = self.session_name(&options.bead_id);
        let mut created_here = false;
        if !self.multiplexer.has_session(&session_name).await? {
            let command =
                self.build_inner_command(&worktree.path, options.initial_prompt.as_deref());
            self.multiplexer
                .new_session(&session_name, &worktree.path, &command)
                .await?;
            created_here = true;
        }

        let seeded = self
            .seed_session_options(&session_name, &worktree.path, &options.project_path)
            .await;
        if let Err(e) = seeded {
            // Don't leave a half-configured session behind.
            if created_here {
                let _ = self.multiplexer.kill_session(&session_name).await;
            }
            return Err(e);
        }

        let session = Session {
            bead_id: options.bead_id.clone(),
            worktree_path: worktree.path.clone(),
            multiplexer_session_name: session_name,
            state: SessionState::Busy,
            started_at: Utc::now(),
            project_path: options.project_path.clone(),
        };
        self.lock_registry()
            .insert(options.bead_id.clone(), session.clone());
        self.publish(&options.bead_id, SessionState::Idle, SessionState::Busy);
        Ok(session)
    }

    /// Stop a session: persist tracker mutations, kill tmux, drop from the
    /// registry.
    pub async fn stop(&self, bead_id: &str) -> Result<()> {
        let session = self
            .get(bead_id)
            .ok_or_else(|| AzedarachError::SessionNotFound(bead_id.to_string()))?;

        self.sync_tracker_best_effort(&session.worktree_path).await;

        if let Err(e) = self
            .multiplexer
            .kill_session(&session.multiplexer_session_name)
            .await
        {
            tracing::debug!("kill-session {}: {}", session.multiplexer_session_name, e);
        }

        self.lock_registry().remove(bead_id);
        self.publish(bead_id, session.state, SessionState::Idle);
        Ok(())
    }

    /// Interrupt the agent and checkpoint its worktree as a WIP commit.
    pub async fn pause(&self, bead_id: &str) -> Result<()> {
        let session = self
            .get(bead_id)
            .ok_or_else(|| AzedarachError::SessionNotFound(bead_id.to_string()))?;

        self.multiplexer
            .send_keys(&session.multiplexer_session_name, "C-c")
            .await?;
        tokio::time::sleep(PAUSE_SETTLE).await;

        self.sync_tracker_best_effort(&session.worktree_path).await;
        git::commit_if_changed(&session.worktree_path, "WIP: Paused session").await?;

        self.set_state(bead_id, SessionState::Paused)?;
        Ok(())
    }

    /// Resume a paused session. The user reattaches tmux themselves.
    pub async fn resume(&self, bead_id: &str) -> Result<()> {
        let session = self
            .get(bead_id)
            .ok_or_else(|| AzedarachError::SessionNotFound(bead_id.to_string()))?;
        if session.state != SessionState::Paused {
            return Err(AzedarachError::InvalidState(format!(
                "cannot resume {bead_id} from {}",
                session.state
            )));
        }
        self.set_state(bead_id, SessionState::Busy)?;
        Ok(())
    }

    pub fn get(&self, bead_id: &str) -> Option<Session> {
        self.lock_registry().get(bead_id).cloned()
    }

    pub fn get_state(&self, bead_id: &str) -> Option<SessionState> {
        self.lock_registry().get(bead_id).map(|s| s.state)
    }

    /// Snapshot of live sessions, reconciled against tmux: registry entries
    /// whose session vanished are dropped, and bead-named tmux sessions
    /// nobody remembers are adopted as busy orphans of the current project.
    pub async fn list_active(&self, project_path: &Path) -> Result<Vec<Session>> {
        let live = self.multiplexer.list_sessions().await?;
        let live_beads: HashMap<String, String> = live
            .iter()
            .filter_map(|session| {
                parse_session_name(&self.session_config.tmux_prefix, &session.name)
                    .map(|bead_id| (bead_id, session.name.clone()))
            })
            .collect();

        let mut registry = self.lock_registry();
        registry.retain(|bead_id, _| {
            let alive = live_beads.contains_key(bead_id);
            if !alive {
                tracing::debug!("session for {} vanished; dropping from registry", bead_id);
            }
            alive
        });

        for (bead_id, session_name) in &live_beads {
            if registry.contains_key(bead_id) {
                continue;
            }
            registry.insert(
                bead_id.clone(),
                Session {
                    bead_id: bead_id.clone(),
                    worktree_path: WorktreeManager::worktree_path_for(project_path, bead_id),
                    multiplexer_session_name: session_name.clone(),
                    state: SessionState::Busy,
                    started_at: Utc::now(),
                    project_path: project_path.to_path_buf(),
                },
            );
        }

        let mut sessions: Vec<Session> = registry.values().cloned().collect();
        sessions.sort_by(|a, b| a.bead_id.cmp(&b.bead_id));
        Ok(sessions)
    }

    /// Externally drive a session's state (hook receiver, front-end).
    pub fn update_state(&self, bead_id: &str, new_state: SessionState) -> Result<()> {
        self.set_state(bead_id, new_state)
    }

    /// Fold a hook-receiver update into the registry. Unknown beads are
    /// ignored; `list_active` adopts them on its next reconciliation.
    pub fn apply_hook_update(&self, update: &SessionStateUpdate) {
        let state = match update.status {
            HookStatus::Busy => SessionState::Busy,
            HookStatus::Waiting => SessionState::Waiting,
            HookStatus::Idle => SessionState::Idle,
        };
        if self.get_state(&update.bead_id).is_some() {
            let _ = self.set_state(&update.bead_id, state);
        }
    }

    fn set_state(&self, bead_id: &str, new_state: SessionState) -> Result<()> {
        let old_state = {
            let mut registry = self.lock_registry();
            let session = registry
                .get_mut(bead_id)
                .ok_or_else(|| AzedarachError::SessionNotFound(bead_id.to_string()))?;
            let old = session.state;
            session.state = new_state;
            old
        };
        if old_state != new_state {
            self.publish(bead_id, old_state, new_state);
        }
        Ok(())
    }

    fn publish(&self, bead_id: &str, old_state: SessionState, new_state: SessionState) {
        let change = StateChange {
            bead_id: bead_id.to_string(),
            old_state,
            new_state,
            timestamp: Utc::now(),
        };
        let _ = self.events.send(change);
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.record_event(
                Some(bead_id),
                "state_change",
                &format!("{old_state} -> {new_state}"),
            );
        }
    }

    async fn mark_in_progress(&self, bead_id: &str, project_path: &Path) {
        match self.tracker.show(bead_id, Some(project_path)).await {
            Ok(issue) if issue.status != IssueStatus::InProgress => {
                if let Err(e) = self
                    .tracker
                    .update(
                        bead_id,
                        &UpdateIssue::status(IssueStatus::InProgress),
                        Some(project_path),
                    )
                    .await
                {
                    tracing::warn!("could not mark {} in_progress: {}", bead_id, e);
                }
            }
            Ok(_) => {}
            Err(AzedarachError::NotFound(_)) => {
                tracing::debug!("no tracker issue for {}", bead_id);
            }
            Err(e) => tracing::warn!("tracker lookup for {} failed: {}", bead_id, e),
        }
    }

    async fn run_init_commands(&self, worktree: &Path) -> Result<()> {
        let commands = &self.worktree_config.init_commands;
        if commands.is_empty() {
            return Ok(());
        }

        if self.worktree_config.parallel {
            // Spawn every child first so they actually run concurrently,
            // then collect outcomes.
            let mut children = Vec::with_capacity(commands.len());
            for command in commands {
                children.push((command.clone(), self.init_command(worktree, command).spawn()));
            }
            for (command, child) in children {
                let output = match child {
                    Ok(child) => child.wait_with_output().await,
                    Err(e) => Err(e),
                };
                self.check_init_result((command, output))?;
            }
        } else {
            for command in commands {
                let output = self.init_command(worktree, command).output().await;
                self.check_init_result((command.clone(), output))?;
            }
        }
        Ok(())
    }

    fn init_command(&self, worktree: &Path, command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(&self.worktree_config.env)
            .current_dir(worktree)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        cmd
    }

    fn check_init_result(
        &self,
        (command, output): (String, std::io::Result<std::process::Output>),
    ) -> Result<()> {
        let failed = match &output {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            Err(e) => e.to_string(),
        };
        tracing::warn!("init command '{}' failed: {}", command, failed);
        if self.worktree_config.continue_on_failure {
            Ok(())
        } else {
            Err(AzedarachError::Session(format!(
                "init command '{command}' failed: {failed}"
            )))
        }
    }

    async fn seed_session_options(
        &self,
        session_name: &str,
        worktree: &Path,
        project: &Path,
    ) -> Result<()> {
        self.multiplexer
            .set_option(session_name, WORKTREE_OPTION, &worktree.to_string_lossy())
            .await?;
        self.multiplexer
            .set_option(session_name, PROJECT_OPTION, &project.to_string_lossy())
            .await?;
        Ok(())
    }

    pub(crate) fn session_name(&self, bead_id: &str) -> String {
        format!("{}{}", self.session_config.tmux_prefix, bead_id)
    }

    /// `<shell> -c '<agent invocation>; exec <shell>'`; the trailing exec
    /// keeps the tmux window alive after the agent exits.
    fn build_inner_command(&self, worktree: &Path, initial_prompt: Option<&str>) -> String {
        let mut command = self.session_config.command.clone();
        if self.session_config.dangerously_skip_permissions {
            command.push_str(" --dangerously-skip-permissions");
        }
        if worktree.join(".envrc").exists() {
            command = format!("direnv exec . {command}");
        }
        if let Some(prompt) = initial_prompt {
            command = format!("{command} \"{}\"", escape_prompt(prompt));
        }
        let shell = &self.session_config.shell;
        format!("{shell} -c '{command}; exec {shell}'")
    }

    /// Best-effort tracker sync under the beads-sync lock. Failure to take
    /// the lock just means no sync this time.
    async fn sync_tracker_best_effort(&self, worktree: &Path) {
        match self.locks.acquire_beads_sync().await {
            Ok(lock) => {
                if let Err(e) = self.tracker.sync(Some(worktree)).await {
                    tracing::warn!("tracker sync in {} failed: {}", worktree.display(), e);
                }
                self.locks.release(&lock);
            }
            Err(e) => tracing::debug!("skipping tracker sync: {}", e),
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Backslash-escape `\`, `"`, and `$` so a prompt survives double quoting
/// inside the session's inner shell command.
pub(crate) fn escape_prompt(prompt: &str) -> String {
    let mut escaped = String::with_capacity(prompt.len());
    for ch in prompt.chars() {
        if matches!(ch, '\\' | '"' | '$') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
