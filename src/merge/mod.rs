//! Conflict-safe merging of bead branches back into the base branch.
//!
//! Conflicts are predicted with `git merge-tree` (in-memory, never touching
//! the working tree). Real conflicts are handed to the agent itself: the
//! engine starts an in-worktree merge, spawns an agent session primed with
//! the conflicting paths, and fails the operation so the caller retries
//! once the agent has resolved and committed.
//!
//! The beads database under `.beads/` is append-only JSONL whose line
//! order is not semantic, so textual conflicts there are spurious. The
//! engine excludes `.beads/` from prediction, favors the base branch
//! during the textual merge, and reconciles the tracker semantically
//! afterwards (import, tombstone recovery, full sync) under the host-wide
//! beads-sync lock.

use crate::config::{AppConfig, GitConfig, MergeConfig};
use crate::git::{self, MergeTreePrediction};
use crate::lock::FileLockManager;
use crate::multiplexer::Multiplexer;
use crate::session::{SessionManager, StartSessionOptions};
use crate::telemetry::Telemetry;
use crate::tracker::IssueTracker;
use crate::worktree::{RemoveWorktreeOptions, Worktree, WorktreeManager};
use crate::{AzedarachError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of conflict prediction.
#[derive(Debug, Clone, Default)]
pub struct MergePrediction {
    /// Conflicting paths, `.beads/` excluded.
    pub conflicts: Vec<String>,
    /// Files changed on the base side since the merge base (informational).
    pub base_changed: usize,
    /// Files changed on the bead side since the merge base (informational).
    pub branch_changed: usize,
    /// merge-tree gave an unclassifiable exit; the real merge decides.
    pub unknown: bool,
}

impl MergePrediction {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Outcome of a completed `merge_to_main`.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub pushed: bool,
    /// Push failed but the local merge is intact; retry hint for the user.
    pub push_error: Option<String>,
    /// Auto-fix rounds the validation loop used.
    pub fix_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct MergeToMainOptions {
    pub bead_id: String,
    pub project_path: PathBuf,
    pub base_branch: Option<String>,
    /// Overrides `merge.push_to_origin` when set.
    pub push_to_origin: Option<bool>,
}

impl MergeToMainOptions {
    pub fn new(bead_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            bead_id: bead_id.into(),
            project_path: project_path.into(),
            base_branch: None,
            push_to_origin: None,
        }
    }
}

pub struct MergeEngine {
    worktrees: Arc<WorktreeManager>,
    sessions: Arc<SessionManager>,
    tracker: Arc<dyn IssueTracker>,
    multiplexer: Arc<dyn Multiplexer>,
    locks: FileLockManager,
    telemetry: Option<Arc<Telemetry>>,
    merge_config: MergeConfig,
    git_config: GitConfig,
}

impl MergeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        sessions: Arc<SessionManager>,
        tracker: Arc<dyn IssueTracker>,
        multiplexer: Arc<dyn Multiplexer>,
        locks: FileLockManager,
        telemetry: Option<Arc<Telemetry>>,
        config: &AppConfig,
    ) -> Self {
        Self {
            worktrees,
            sessions,
            tracker,
            multiplexer,
            locks,
            telemetry,
            merge_config: config.merge.clone(),
            git_config: config.git.clone(),
        }
    }

    /// Predict conflicts between the base branch and a bead branch without
    /// mutating any git state.
    pub async fn check_merge_conflicts(
        &self,
        bead_id: &str,
        project_path: &Path,
        base_branch: Option<&str>,
    ) -> Result<MergePrediction> {
        let base = self.resolve_base(project_path, base_branch).await?;
        self.predict(project_path, &base, bead_id).await
    }

    /// Merge a bead's branch into the base branch, then clean up the
    /// worktree, branch, and tracker issue.
    pub async fn merge_to_main(&self, options: &MergeToMainOptions) -> Result<MergeOutcome> {
        let bead_id = &options.bead_id;
        let project = &options.project_path;
        let base = self
            .resolve_base(project, options.base_branch.as_deref())
            .await?;

        let issue = match self.tracker.show(bead_id, Some(project)).await {
            Ok(issue) => Some(issue),
            Err(AzedarachError::NotFound(_)) => None,
            Err(e) => {
                tracing::warn!("tracker lookup for {} failed: {}", bead_id, e);
                None
            }
        };
        let title = issue.as_ref().map(|issue| issue.title.as_str());

        let worktree = self
            .worktrees
            .get(bead_id, project)
            .await?
            .ok_or_else(|| AzedarachError::WorktreeNotFound(bead_id.to_string()))?;

        // The agent must not keep mutating the branch mid-merge.
        if self.sessions.get(bead_id).is_some() {
            if let Err(e) = self.sessions.stop(bead_id).await {
                tracing::warn!("could not stop session for {}: {}", bead_id, e);
            }
        }
        let session_name = self.sessions.session_name(bead_id);
        if let Err(e) = self.multiplexer.kill_session(&session_name).await {
            tracing::debug!("kill-session {}: {}", session_name, e);
        }

        let dirty = git::status_porcelain(&worktree.path).await?;
        if !dirty.is_empty() {
            if !self.merge_config.commit_dirty {
                return Err(AzedarachError::InvalidState(format!(
                    "worktree for {bead_id} has {} uncommitted change(s)",
                    dirty.len()
                )));
            }
            git::commit_if_changed(&worktree.path, &complete_message(bead_id, title)).await?;
        }

        let prediction = self.predict(project, &base, bead_id).await?;
        if prediction.unknown {
            tracing::warn!(
                "merge-tree could not classify {} vs {}; relying on the real merge",
                base,
                bead_id
            );
        }
        if prediction.has_conflicts() {
            return Err(self
                .delegate_conflicts_to_agent(bead_id, project, &worktree, &base, prediction.conflicts)
                .await);
        }

        git::checkout(project, &base).await?;
        let message = merge_message(bead_id, title);
        if let Err(e) = git::merge(
            project,
            bead_id,
            git::MergeOptions {
                no_ff: true,
                message: Some(&message),
                strategy_ours: true,
                no_edit: false,
            },
        )
        .await
        {
            // `-X ours` cannot resolve modify/delete and similar; those
            // surface as CONFLICT on stderr.
            if let AzedarachError::Vcs { stderr, .. } = &e {
                if stderr.contains("CONFLICT") {
                    return Err(AzedarachError::MergeConflict {
                        bead_id: bead_id.clone(),
                        files: Vec::new(),
                        message: "the merge reported conflicts; resolve them manually in the \
                                  project root, then retry"
                            .to_string(),
                    });
                }
            }
            return Err(e);
        }

        self.reconcile_tracker(project).await;

        let fix_attempts = self.run_post_merge_validation(bead_id, project).await?;

        self.worktrees
            .merge_claude_local_settings(&worktree.path, project);

        self.cleanup_merged_bead(bead_id, project, &worktree).await;

        let mut outcome = MergeOutcome {
            fix_attempts,
            ..MergeOutcome::default()
        };
        let push = options
            .push_to_origin
            .unwrap_or(self.merge_config.push_to_origin);
        if push && push_enabled() {
            match git::push(project, "origin", &base, false).await {
                Ok(()) => outcome.pushed = true,
                Err(e) => {
                    outcome.push_error = Some(format!(
                        "{e}; the merge is complete locally, retry with `git push origin {base}`"
                    ));
                }
            }
        }

        self.record_merge(bead_id, "merged to base");
        Ok(outcome)
    }

    /// Bring the base branch into a bead's worktree.
    pub async fn update_from_base(
        &self,
        bead_id: &str,
        project_path: &Path,
        base_branch: Option<&str>,
    ) -> Result<()> {
        let base = self.resolve_base(project_path, base_branch).await?;
        let worktree = self
            .worktrees
            .get(bead_id, project_path)
            .await?
            .ok_or_else(|| AzedarachError::WorktreeNotFound(bead_id.to_string()))?;

        // Fast-forward the local base from origin; offline is tolerated.
        let refspec = format!("{base}:{base}");
        if let Err(e) = git::fetch(project_path, "origin", Some(&refspec)).await {
            tracing::warn!("fetch origin {} failed: {}", refspec, e);
        }

        let prediction = self.predict(&worktree.path, bead_id, &base).await?;
        if prediction.has_conflicts() {
            return Err(self
                .delegate_conflicts_to_agent(
                    bead_id,
                    project_path,
                    &worktree,
                    &base,
                    prediction.conflicts,
                )
                .await);
        }

        git::merge(
            &worktree.path,
            &base,
            git::MergeOptions {
                no_edit: true,
                ..git::MergeOptions::default()
            },
        )
        .await?;

        self.with_beads_sync_lock(|| async {
            if let Err(e) = self.tracker.sync(Some(&worktree.path)).await {
                tracing::warn!("tracker sync after update failed: {}", e);
            }
        })
        .await;

        Ok(())
    }

    /// Like [`update_from_base`], but auto-stashes uncommitted worktree
    /// changes and pops the stash on clean completion.
    pub async fn merge_main_into_branch(
        &self,
        bead_id: &str,
        project_path: &Path,
        base_branch: Option<&str>,
    ) -> Result<()> {
        let worktree = self
            .worktrees
            .get(bead_id, project_path)
            .await?
            .ok_or_else(|| AzedarachError::WorktreeNotFound(bead_id.to_string()))?;

        let stashed = if git::status_porcelain(&worktree.path).await?.is_empty() {
            false
        } else {
            git::stash_push(&worktree.path, "azedarach: auto-stash before merge").await?;
            true
        };

        let result = self
            .update_from_base(bead_id, project_path, base_branch)
            .await;

        // The stash is only popped on a clean merge; a conflicted tree
        // keeps the stash for the agent (or user) to restore afterwards.
        if result.is_ok() && stashed {
            git::stash_pop(&worktree.path).await?;
        }
        result
    }

    /// Abort an in-progress merge inside a bead's worktree.
    pub async fn abort_merge(&self, bead_id: &str, project_path: &Path) -> Result<()> {
        let worktree = self
            .worktrees
            .get(bead_id, project_path)
            .await?
            .ok_or_else(|| AzedarachError::WorktreeNotFound(bead_id.to_string()))?;
        git::merge_abort(&worktree.path).await
    }

    /// Changed paths in a bead's worktree.
    pub async fn check_uncommitted_changes(
        &self,
        bead_id: &str,
        project_path: &Path,
    ) -> Result<Vec<String>> {
        let worktree = self
            .worktrees
            .get(bead_id, project_path)
            .await?
            .ok_or_else(|| AzedarachError::WorktreeNotFound(bead_id.to_string()))?;
        git::status_porcelain(&worktree.path).await
    }

    /// In-memory prediction of merging `theirs` into `ours` in `cwd`,
    /// with `.beads/` filtered out and side counts attached.
    async fn predict(&self, cwd: &Path, ours: &str, theirs: &str) -> Result<MergePrediction> {
        let mut prediction = MergePrediction::default();
        match git::merge_tree(cwd, ours, theirs).await? {
            MergeTreePrediction::Clean => {}
            MergeTreePrediction::Conflicts(files) => {
                prediction.conflicts = filter_beads_paths(files);
            }
            MergeTreePrediction::Unknown => prediction.unknown = true,
        }

        if let Ok(merge_base) = git::merge_base(cwd, ours, theirs).await {
            prediction.base_changed = git::changed_files(cwd, &merge_base, ours)
                .await
                .map(|files| files.len())
                .unwrap_or(0);
            prediction.branch_changed = git::changed_files(cwd, &merge_base, theirs)
                .await
                .map(|files| files.len())
                .unwrap_or(0);
        }
        Ok(prediction)
    }

    /// Start the real merge inside the worktree (leaving it conflicted),
    /// spawn an agent session primed to resolve, and hand back the error
    /// the caller must surface.
    async fn delegate_conflicts_to_agent(
        &self,
        bead_id: &str,
        project_path: &Path,
        worktree: &Worktree,
        base: &str,
        files: Vec<String>,
    ) -> AzedarachError {
        // Expected to exit non-zero: it puts the worktree into the
        // conflict state the agent will resolve.
        if let Err(e) = git::merge(&worktree.path, base, git::MergeOptions::default()).await {
            tracing::debug!("conflict-producing merge in worktree: {}", e);
        }

        let mut options = StartSessionOptions::new(bead_id, project_path);
        options.initial_prompt = Some(conflict_prompt(base, &files));
        if let Err(e) = self.sessions.start(&options).await {
            tracing::warn!("could not start resolution session for {}: {}", bead_id, e);
        }

        self.record_merge(bead_id, "conflicts delegated to agent");
        AzedarachError::MergeConflict {
            bead_id: bead_id.to_string(),
            files,
            message: "an agent session is resolving the conflicts; retry the merge after it \
                      commits the resolution"
                .to_string(),
        }
    }

    /// Semantic reconciliation of the beads database after a textual
    /// merge: import the JSONL, restore tombstoned issues, full sync. All
    /// best-effort, all under the beads-sync lock.
    async fn reconcile_tracker(&self, project: &Path) {
        self.with_beads_sync_lock(|| async {
            if let Err(e) = self.tracker.sync_import_only(Some(project)).await {
                tracing::warn!("sync --import-only failed: {}", e);
            }
            match self.tracker.recover_tombstones(Some(project)).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("recovered {} tombstoned issue(s)", n),
                Err(e) => tracing::warn!("recover-tombstones failed: {}", e),
            }
            if let Err(e) = self.tracker.sync(Some(project)).await {
                tracing::warn!("tracker sync failed: {}", e);
            }
        })
        .await;
    }

    /// Run validate commands, auto-fixing up to `max_fix_attempts` times.
    /// Returns the number of fix rounds used.
    async fn run_post_merge_validation(&self, bead_id: &str, project: &Path) -> Result<u32> {
        if self.merge_config.validate_commands.is_empty() {
            return Ok(0);
        }

        let mut attempts = 0;
        loop {
            let Some((command, output)) = self.first_validation_failure(project).await? else {
                return Ok(attempts);
            };

            if attempts < self.merge_config.max_fix_attempts {
                if let Some(fix) = &self.merge_config.fix_command {
                    attempts += 1;
                    tracing::info!(
                        "validation '{}' failed; running fix '{}' (attempt {})",
                        command,
                        fix,
                        attempts
                    );
                    let fix_output = run_shell(project, fix).await?;
                    if !fix_output.status.success() {
                        tracing::warn!(
                            "fix command failed: {}",
                            String::from_utf8_lossy(&fix_output.stderr).trim()
                        );
                    }
                    git::commit_if_changed(
                        project,
                        &format!("fix: auto-fix after merging {bead_id}"),
                    )
                    .await?;
                    continue;
                }
            }

            if self.merge_config.start_claude_on_failure {
                let mut options = StartSessionOptions::new(bead_id, project);
                options.initial_prompt = Some(validation_prompt(&command, &output));
                if let Err(e) = self.sessions.start(&options).await {
                    tracing::warn!("could not start fix session for {}: {}", bead_id, e);
                }
            }

            // Keep whatever partial progress the fix rounds made.
            git::commit_if_changed(project, &format!("wip: partial fix after merging {bead_id}"))
                .await?;
            self.record_merge(bead_id, "post-merge validation failed");
            return Err(AzedarachError::TypeCheck(format!(
                "'{command}' still failing after {attempts} fix attempt(s)"
            )));
        }
    }

    /// First failing validate command, with its combined output.
    async fn first_validation_failure(
        &self,
        project: &Path,
    ) -> Result<Option<(String, String)>> {
        for command in &self.merge_config.validate_commands {
            let output = run_shell(project, command).await?;
            if !output.status.success() {
                let combined = format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                return Ok(Some((command.clone(), combined.trim().to_string())));
            }
        }
        Ok(None)
    }

    /// Post-merge cleanup: worktree, branch, issue. Best-effort with
    /// warnings; the merge itself already landed.
    async fn cleanup_merged_bead(&self, bead_id: &str, project: &Path, worktree: &Worktree) {
        if let Err(e) = self
            .worktrees
            .remove(&RemoveWorktreeOptions {
                bead_id: bead_id.to_string(),
                project_path: project.to_path_buf(),
            })
            .await
        {
            tracing::warn!("could not remove worktree {}: {}", worktree.path.display(), e);
        }

        if let Err(e) = git::delete_branch(project, bead_id, false).await {
            tracing::debug!("branch -d {} failed ({}); forcing", bead_id, e);
            if let Err(e) = git::delete_branch(project, bead_id, true).await {
                tracing::warn!("could not delete branch {}: {}", bead_id, e);
            }
        }

        if let Err(e) = self.tracker.close(bead_id, None, Some(project)).await {
            tracing::warn!("could not close issue {}: {}", bead_id, e);
        }
        self.with_beads_sync_lock(|| async {
            if let Err(e) = self.tracker.sync(Some(project)).await {
                tracing::warn!("tracker sync after close failed: {}", e);
            }
        })
        .await;
    }

    async fn resolve_base(&self, project: &Path, explicit: Option<&str>) -> Result<String> {
        if let Some(base) = explicit {
            return Ok(base.to_string());
        }
        if let Some(base) = &self.git_config.base_branch {
            return Ok(base.clone());
        }
        git::current_branch(project).await
    }

    /// Run `body` while holding the beads-sync lock. Failing to take the
    /// lock degrades to skipping the sync entirely.
    async fn with_beads_sync_lock<F, Fut>(&self, body: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        match self.locks.acquire_beads_sync().await {
            Ok(lock) => {
                body().await;
                self.locks.release(&lock);
            }
            Err(e) => tracing::debug!("beads-sync lock unavailable, skipping sync: {}", e),
        }
    }

    fn record_merge(&self, bead_id: &str, message: &str) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.record_event(Some(bead_id), "merge", message);
        }
    }
}

/// `.beads/` conflicts are spurious (append-only JSONL); drop them.
pub(crate) fn filter_beads_paths(files: Vec<String>) -> Vec<String> {
    files
        .into_iter()
        .filter(|path| path != ".beads" && !path.starts_with(".beads/"))
        .collect()
}

fn push_enabled() -> bool {
    std::env::var_os("AZEDARACH_OFFLINE").is_none()
}

fn merge_message(bead_id: &str, title: Option<&str>) -> String {
    match title {
        Some(title) => format!("Merge {bead_id}: {title}"),
        None => format!("Merge {bead_id}"),
    }
}

fn complete_message(bead_id: &str, title: Option<&str>) -> String {
    match title {
        Some(title) => format!("Complete {bead_id}: {title}"),
        None => format!("Complete {bead_id}"),
    }
}

fn conflict_prompt(base: &str, files: &[String]) -> String {
    let mut prompt = format!(
        "Merging `{base}` into this worktree produced conflicts in:\n"
    );
    for file in files {
        prompt.push_str(&format!("- {file}\n"));
    }
    prompt.push_str(
        "\nResolve each conflict, then stage and commit the resolution \
         (`git add -A && git commit`). The merge will be retried once you \
         are done.",
    );
    prompt
}

fn validation_prompt(command: &str, output: &str) -> String {
    format!(
        "Post-merge validation is failing.\n\nCommand: `{command}`\n\nOutput:\n{output}\n\n\
         Fix the failures and commit the result."
    )
}

async fn run_shell(cwd: &Path, command: &str) -> Result<std::process::Output> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .await?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::git::testing::{init_repo, supports_merge_tree, write_and_commit};
    use crate::multiplexer::testing::FakeMultiplexer;
    use crate::tracker::testing::{MockTracker, make_issue};
    use crate::tracker::IssueStatus;
    use crate::worktree::CreateWorktreeOptions;
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        project: PathBuf,
        tmux: Arc<FakeMultiplexer>,
        tracker: Arc<MockTracker>,
        worktrees: Arc<WorktreeManager>,
        sessions: Arc<SessionManager>,
        engine: MergeEngine,
    }

    fn fixture_with_config(config: AppConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");
        std::fs::create_dir_all(&project).unwrap();
        init_repo(&project);

        let tmux = Arc::new(FakeMultiplexer::new());
        let tracker = Arc::new(MockTracker::default());
        let worktrees = Arc::new(WorktreeManager::new());
        let locks = FileLockManager::new();
        let sessions = Arc::new(SessionManager::new(
            worktrees.clone(),
            tracker.clone(),
            tmux.clone(),
            locks.clone(),
            None,
            &config,
        ));
        let engine = MergeEngine::new(
            worktrees.clone(),
            sessions.clone(),
            tracker.clone(),
            tmux.clone(),
            locks,
            None,
            &config,
        );
        Fixture {
            _dir: dir,
            project,
            tmux,
            tracker,
            worktrees,
            sessions,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_config(AppConfig::default())
    }

    async fn create_worktree(fixture: &Fixture, bead_id: &str) -> Worktree {
        fixture
            .worktrees
            .create(&CreateWorktreeOptions::new(bead_id, &fixture.project))
            .await
            .unwrap()
    }

    fn head_subject(cwd: &Path) -> String {
        let output = std::process::Command::new("git")
            .args(["log", "-1", "--format=%s"])
            .current_dir(cwd)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn rev(cwd: &Path, reference: &str) -> String {
        let output = std::process::Command::new("git")
            .args(["rev-parse", reference])
            .current_dir(cwd)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    #[test]
    fn test_filter_beads_paths() {
        let files = vec![
            ".beads/issues.jsonl".to_string(),
            "src/a.ts".to_string(),
            ".beads".to_string(),
            ".beadsy/file".to_string(),
        ];
        assert_eq!(filter_beads_paths(files), vec!["src/a.ts", ".beadsy/file"]);
    }

    #[test]
    fn test_messages() {
        assert_eq!(merge_message("az-1", Some("Fix auth")), "Merge az-1: Fix auth");
        assert_eq!(merge_message("az-1", None), "Merge az-1");
        assert_eq!(
            complete_message("az-1", Some("Fix auth")),
            "Complete az-1: Fix auth"
        );
    }

    #[test]
    fn test_conflict_prompt_lists_files() {
        let prompt = conflict_prompt("main", &["a.ts".to_string(), "b.ts".to_string()]);
        assert!(prompt.contains("- a.ts"));
        assert!(prompt.contains("- b.ts"));
        assert!(prompt.contains("`main`"));
    }

    #[tokio::test]
    async fn test_check_merge_conflicts_is_pure() {
        let fixture = fixture();
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        let worktree = create_worktree(&fixture, "az-1").await;

        // conflicting edits to the same file on both sides
        write_and_commit(&worktree.path, "README.md", "# bead side\n", "bead edit");
        write_and_commit(&fixture.project, "README.md", "# base side\n", "base edit");

        let main_before = rev(&fixture.project, "main");
        let bead_before = rev(&fixture.project, "az-1");

        let prediction = fixture
            .engine
            .check_merge_conflicts("az-1", &fixture.project, None)
            .await
            .unwrap();
        assert!(prediction.has_conflicts());
        assert_eq!(prediction.conflicts, vec!["README.md"]);
        assert_eq!(prediction.base_changed, 1);
        assert_eq!(prediction.branch_changed, 1);

        // prediction never mutates refs or working trees
        assert_eq!(rev(&fixture.project, "main"), main_before);
        assert_eq!(rev(&fixture.project, "az-1"), bead_before);
        assert!(git::status_porcelain(&fixture.project).await.unwrap().is_empty());
        assert!(git::status_porcelain(&worktree.path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_to_main_without_conflicts() {
        let fixture = fixture();
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        fixture.tracker.issues.lock().unwrap().insert(
            "az-3".to_string(),
            make_issue("az-3", IssueStatus::InProgress),
        );
        let worktree = create_worktree(&fixture, "az-3").await;
        write_and_commit(&worktree.path, "feature.rs", "pub fn f() {}\n", "add feature");
        // leave an uncommitted change too; the engine commits it
        std::fs::write(worktree.path.join("notes.md"), "done\n").unwrap();

        let outcome = fixture
            .engine
            .merge_to_main(&MergeToMainOptions::new("az-3", &fixture.project))
            .await
            .unwrap();

        assert!(!outcome.pushed);
        assert_eq!(outcome.fix_attempts, 0);
        assert!(head_subject(&fixture.project).starts_with("Merge az-3:"));
        assert!(fixture.project.join("feature.rs").exists());
        assert!(fixture.project.join("notes.md").exists());

        // worktree and branch are gone
        assert!(!worktree.path.exists());
        assert!(!git::branch_exists(&fixture.project, "az-3").await.unwrap());

        // issue closed and synced under the lock
        assert_eq!(fixture.tracker.status_of("az-3"), Some(IssueStatus::Closed));
        assert!(fixture.tracker.import_only_calls.load(Ordering::SeqCst) >= 1);
        assert!(fixture.tracker.recover_calls.load(Ordering::SeqCst) >= 1);
        assert!(fixture.tracker.sync_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_merge_to_main_with_conflicts_delegates_to_agent() {
        let fixture = fixture();
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        fixture.tracker.issues.lock().unwrap().insert(
            "az-4".to_string(),
            make_issue("az-4", IssueStatus::InProgress),
        );
        let worktree = create_worktree(&fixture, "az-4").await;
        write_and_commit(&worktree.path, "README.md", "# bead\n", "bead edit");
        write_and_commit(&fixture.project, "README.md", "# base\n", "base edit");

        let main_before = rev(&fixture.project, "main");
        let err = fixture
            .engine
            .merge_to_main(&MergeToMainOptions::new("az-4", &fixture.project))
            .await
            .unwrap_err();

        let AzedarachError::MergeConflict { files, .. } = err else {
            panic!("expected MergeConflict, got {err:?}");
        };
        assert_eq!(files, vec!["README.md"]);

        // main untouched; the worktree is mid-merge for the agent
        assert_eq!(rev(&fixture.project, "main"), main_before);
        assert!(!git::status_porcelain(&worktree.path).await.unwrap().is_empty());

        // an agent session was started with the conflict prompt
        let sessions = fixture.tmux.sessions.lock().unwrap();
        let session = sessions.get("az-4").expect("resolution session");
        assert!(session.command.contains("README.md"));
        drop(sessions);
        assert!(fixture.sessions.get("az-4").is_some());
    }

    #[tokio::test]
    async fn test_post_merge_autofix_loop() {
        let mut config = AppConfig::default();
        config.merge.validate_commands = vec!["test -f fixed.marker".to_string()];
        config.merge.fix_command = Some("touch fixed.marker".to_string());
        config.merge.max_fix_attempts = 2;
        let fixture = fixture_with_config(config);
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        fixture.tracker.issues.lock().unwrap().insert(
            "az-5".to_string(),
            make_issue("az-5", IssueStatus::InProgress),
        );
        let worktree = create_worktree(&fixture, "az-5").await;
        write_and_commit(&worktree.path, "feature.rs", "pub fn f() {}\n", "add feature");

        let outcome = fixture
            .engine
            .merge_to_main(&MergeToMainOptions::new("az-5", &fixture.project))
            .await
            .unwrap();

        assert_eq!(outcome.fix_attempts, 1);
        assert!(fixture.project.join("fixed.marker").exists());
        assert_eq!(
            head_subject(&fixture.project),
            "fix: auto-fix after merging az-5"
        );
        assert_eq!(fixture.tracker.status_of("az-5"), Some(IssueStatus::Closed));
    }

    #[tokio::test]
    async fn test_post_merge_validation_exhausts_attempts() {
        let mut config = AppConfig::default();
        config.merge.validate_commands = vec!["false".to_string()];
        config.merge.fix_command = Some("true".to_string());
        config.merge.max_fix_attempts = 2;
        let fixture = fixture_with_config(config);
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        let worktree = create_worktree(&fixture, "az-6").await;
        write_and_commit(&worktree.path, "feature.rs", "pub fn f() {}\n", "add feature");

        let err = fixture
            .engine
            .merge_to_main(&MergeToMainOptions::new("az-6", &fixture.project))
            .await
            .unwrap_err();
        assert!(matches!(err, AzedarachError::TypeCheck(_)));
        // the textual merge itself is kept
        let log = std::process::Command::new("git")
            .args(["log", "--format=%s"])
            .current_dir(&fixture.project)
            .output()
            .unwrap();
        let log = String::from_utf8_lossy(&log.stdout);
        assert!(log.contains("Merge az-6"));
    }

    #[tokio::test]
    async fn test_update_from_base_clean() {
        let fixture = fixture();
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        let worktree = create_worktree(&fixture, "az-7").await;
        write_and_commit(&fixture.project, "base.rs", "pub fn b() {}\n", "base work");

        fixture
            .engine
            .update_from_base("az-7", &fixture.project, None)
            .await
            .unwrap();
        assert!(worktree.path.join("base.rs").exists());
    }

    #[tokio::test]
    async fn test_merge_main_into_branch_auto_stash() {
        let fixture = fixture();
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        let worktree = create_worktree(&fixture, "az-8").await;
        write_and_commit(&fixture.project, "base.rs", "pub fn b() {}\n", "base work");
        // uncommitted local edit that must survive the merge
        std::fs::write(worktree.path.join("scratch.txt"), "draft\n").unwrap();

        fixture
            .engine
            .merge_main_into_branch("az-8", &fixture.project, None)
            .await
            .unwrap();

        assert!(worktree.path.join("base.rs").exists());
        assert_eq!(
            std::fs::read_to_string(worktree.path.join("scratch.txt")).unwrap(),
            "draft\n"
        );
    }

    #[tokio::test]
    async fn test_abort_merge_and_uncommitted_changes() {
        let fixture = fixture();
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        let worktree = create_worktree(&fixture, "az-9").await;
        write_and_commit(&worktree.path, "README.md", "# bead\n", "bead edit");
        write_and_commit(&fixture.project, "README.md", "# base\n", "base edit");

        // enter the conflict state, then abort
        let _ = git::merge(&worktree.path, "main", git::MergeOptions::default()).await;
        assert!(
            !fixture
                .engine
                .check_uncommitted_changes("az-9", &fixture.project)
                .await
                .unwrap()
                .is_empty()
        );

        fixture
            .engine
            .abort_merge("az-9", &fixture.project)
            .await
            .unwrap();
        assert!(
            fixture
                .engine
                .check_uncommitted_changes("az-9", &fixture.project)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_merge_refuses_dirty_worktree_when_toggled() {
        let mut config = AppConfig::default();
        config.merge.commit_dirty = false;
        let fixture = fixture_with_config(config);
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        let worktree = create_worktree(&fixture, "az-10").await;
        std::fs::write(worktree.path.join("dirty.txt"), "x\n").unwrap();

        let err = fixture
            .engine
            .merge_to_main(&MergeToMainOptions::new("az-10", &fixture.project))
            .await
            .unwrap_err();
        assert!(matches!(err, AzedarachError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_missing_worktree_is_an_error() {
        let fixture = fixture();
        let err = fixture
            .engine
            .merge_to_main(&MergeToMainOptions::new("az-11", &fixture.project))
            .await
            .unwrap_err();
        assert!(matches!(err, AzedarachError::WorktreeNotFound(_)));
    }

    #[tokio::test]
    async fn test_beads_conflicts_are_ignored_by_prediction() {
        let fixture = fixture();
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        // seed a .beads database on main before branching
        std::fs::create_dir_all(fixture.project.join(".beads")).unwrap();
        write_and_commit(
            &fixture.project,
            ".beads/issues.jsonl",
            "{\"id\":\"az-1\"}\n",
            "seed beads",
        );
        let worktree = create_worktree(&fixture, "az-12").await;
        write_and_commit(
            &worktree.path,
            ".beads/issues.jsonl",
            "{\"id\":\"az-1\"}\n{\"id\":\"az-12\"}\n",
            "bead appends",
        );
        write_and_commit(
            &fixture.project,
            ".beads/issues.jsonl",
            "{\"id\":\"az-1\"}\n{\"id\":\"az-99\"}\n",
            "base appends",
        );

        let prediction = fixture
            .engine
            .check_merge_conflicts("az-12", &fixture.project, None)
            .await
            .unwrap();
        assert!(
            !prediction.has_conflicts(),
            "jsonl conflicts must be filtered: {:?}",
            prediction.conflicts
        );
    }

    #[tokio::test]
    async fn test_merge_stops_running_session_first() {
        let fixture = fixture();
        if !supports_merge_tree(&fixture.project) {
            return;
        }
        fixture.tracker.issues.lock().unwrap().insert(
            "az-13".to_string(),
            make_issue("az-13", IssueStatus::Open),
        );
        // a live agent session for the bead
        fixture
            .sessions
            .start(&StartSessionOptions::new("az-13", &fixture.project))
            .await
            .unwrap();
        let worktree = fixture
            .worktrees
            .get("az-13", &fixture.project)
            .await
            .unwrap()
            .unwrap();
        write_and_commit(&worktree.path, "feature.rs", "pub fn f() {}\n", "add feature");

        fixture
            .engine
            .merge_to_main(&MergeToMainOptions::new("az-13", &fixture.project))
            .await
            .unwrap();

        assert!(fixture.sessions.get("az-13").is_none());
        assert!(!fixture.tmux.session_names().contains(&"az-13".to_string()));
    }
}
