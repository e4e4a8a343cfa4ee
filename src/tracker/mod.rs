//! Beads issue-tracker integration via the `bd` CLI.
//!
//! Every command runs with `--json` appended and an explicit working
//! directory. The daemon behind `bd` can report a stale database on exit 0
//! with an empty stdout, so sync-required classification runs before any
//! JSON parsing.

mod types;

pub use types::{
    CreateIssue, DependencyRef, DependencyType, Issue, IssueStatus, IssueType, ListFilter,
    SyncResult, UpdateIssue,
};

use crate::{AzedarachError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;

/// Phrases the tracker prints when its local database lags the JSONL.
const SYNC_FINGERPRINTS: [&str; 3] = [
    "Database out of sync",
    "Run 'bd sync --import-only'",
    "bd sync --import-only",
];

/// Typed facade over the issue tracker.
///
/// The `bd` subprocess implementation is [`TrackerClient`]; tests swap in
/// an in-memory fake. Every operation accepts an optional working
/// directory overriding the client's default project path.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn list(&self, filter: &ListFilter, cwd: Option<&Path>) -> Result<Vec<Issue>>;
    async fn ready(&self, cwd: Option<&Path>) -> Result<Vec<Issue>>;
    async fn search(&self, query: &str, cwd: Option<&Path>) -> Result<Vec<Issue>>;
    async fn show(&self, id: &str, cwd: Option<&Path>) -> Result<Issue>;
    async fn show_multiple(&self, ids: &[String], cwd: Option<&Path>) -> Result<Vec<Issue>>;
    async fn create(&self, fields: &CreateIssue, cwd: Option<&Path>) -> Result<Issue>;
    async fn update(&self, id: &str, fields: &UpdateIssue, cwd: Option<&Path>) -> Result<()>;
    async fn close(&self, id: &str, reason: Option<&str>, cwd: Option<&Path>) -> Result<()>;
    async fn delete(&self, id: &str, cwd: Option<&Path>) -> Result<()>;
    async fn sync(&self, cwd: Option<&Path>) -> Result<SyncResult>;
    async fn sync_import_only(&self, cwd: Option<&Path>) -> Result<()>;
    /// Run the user-supplied `.beads/recover-tombstones.sh` and return how
    /// many issues it recovered.
    async fn recover_tombstones(&self, cwd: Option<&Path>) -> Result<u64>;
    async fn add_dependency(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        dep_type: Option<DependencyType>,
        cwd: Option<&Path>,
    ) -> Result<()>;

    /// Children of an epic: dependents linked with a `parent-child` edge.
    async fn get_epic_children(&self, epic_id: &str, cwd: Option<&Path>) -> Result<Vec<Issue>> {
        let epic = self.show(epic_id, cwd).await?;
        let child_ids: Vec<String> = epic
            .dependents
            .unwrap_or_default()
            .into_iter()
            .filter(|dep| dep.dependency_type == DependencyType::ParentChild)
            .map(|dep| dep.id)
            .collect();
        if child_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.show_multiple(&child_ids, cwd).await
    }

    async fn get_epic_with_children(
        &self,
        epic_id: &str,
        cwd: Option<&Path>,
    ) -> Result<(Issue, Vec<Issue>)> {
        let epic = self.show(epic_id, cwd).await?;
        let children = self.get_epic_children(epic_id, cwd).await?;
        Ok((epic, children))
    }

    /// The epic an issue belongs to, if any.
    async fn get_parent_epic(&self, issue_id: &str, cwd: Option<&Path>) -> Result<Option<Issue>> {
        let issue = self.show(issue_id, cwd).await?;
        let parent = issue
            .dependencies
            .unwrap_or_default()
            .into_iter()
            .find(|dep| {
                dep.dependency_type == DependencyType::ParentChild
                    && dep.issue_type == Some(IssueType::Epic)
            });
        match parent {
            Some(dep) => Ok(Some(self.show(&dep.id, cwd).await?)),
            None => Ok(None),
        }
    }
}

/// `bd` subprocess implementation of [`IssueTracker`].
pub struct TrackerClient {
    project_path: PathBuf,
}

impl TrackerClient {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
        }
    }

    /// Run `bd <args> --json` and return parsed stdout.
    ///
    /// Returns `Value::Null` for empty stdout. Sync-required fingerprints in
    /// either stream win over every other classification.
    async fn run_bd(&self, cwd: Option<&Path>, args: &[String]) -> Result<Value> {
        let cwd = cwd.unwrap_or(&self.project_path);
        let output = Command::new("bd")
            .args(args)
            .arg("--json")
            .current_dir(cwd)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if needs_sync(&stdout) || needs_sync(&stderr) {
            return Err(AzedarachError::SyncRequired);
        }
        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(AzedarachError::Tracker(format!(
                "bd {}: {detail}",
                args.first().map(String::as_str).unwrap_or("")
            )));
        }

        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(trimmed).map_err(|e| {
            tracing::warn!("unparseable bd output: {}", trimmed);
            AzedarachError::Parse(format!("bd {}: {e}", args.join(" ")))
        })
    }
}

#[async_trait]
impl IssueTracker for TrackerClient {
    async fn list(&self, filter: &ListFilter, cwd: Option<&Path>) -> Result<Vec<Issue>> {
        let value = self.run_bd(cwd, &list_args(filter)).await?;
        Ok(strip_tombstones(issues_from(value)?))
    }

    async fn ready(&self, cwd: Option<&Path>) -> Result<Vec<Issue>> {
        let value = self.run_bd(cwd, &[String::from("ready")]).await?;
        Ok(strip_tombstones(issues_from(value)?))
    }

    async fn search(&self, query: &str, cwd: Option<&Path>) -> Result<Vec<Issue>> {
        let args = vec![String::from("search"), query.to_string()];
        let value = self.run_bd(cwd, &args).await?;
        Ok(strip_tombstones(issues_from(value)?))
    }

    async fn show(&self, id: &str, cwd: Option<&Path>) -> Result<Issue> {
        let args = vec![String::from("show"), id.to_string()];
        let value = self.run_bd(cwd, &args).await?;
        let issue = match issues_from(value)?.into_iter().next() {
            Some(issue) => issue,
            None => return Err(AzedarachError::NotFound(id.to_string())),
        };
        if issue.status == IssueStatus::Tombstone {
            return Err(AzedarachError::NotFound(id.to_string()));
        }
        Ok(issue)
    }

    async fn show_multiple(&self, ids: &[String], cwd: Option<&Path>) -> Result<Vec<Issue>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec![String::from("show")];
        args.extend(ids.iter().cloned());
        let value = self.run_bd(cwd, &args).await?;
        Ok(strip_tombstones(issues_from(value)?))
    }

    async fn create(&self, fields: &CreateIssue, cwd: Option<&Path>) -> Result<Issue> {
        let value = self.run_bd(cwd, &create_args(fields)).await?;
        issues_from(value)?
            .into_iter()
            .next()
            .ok_or_else(|| AzedarachError::Parse("bd create returned no issue".to_string()))
    }

    async fn update(&self, id: &str, fields: &UpdateIssue, cwd: Option<&Path>) -> Result<()> {
        self.run_bd(cwd, &update_args(id, fields)).await?;
        Ok(())
    }

    async fn close(&self, id: &str, reason: Option<&str>, cwd: Option<&Path>) -> Result<()> {
        let mut args = vec![String::from("close"), id.to_string()];
        if let Some(reason) = reason {
            args.push("--reason".to_string());
            args.push(reason.to_string());
        }
        self.run_bd(cwd, &args).await?;
        Ok(())
    }

    async fn delete(&self, id: &str, cwd: Option<&Path>) -> Result<()> {
        // Bypasses the daemon so a wedged daemon can't block deletion.
        let args = vec![
            String::from("delete"),
            id.to_string(),
            String::from("--no-daemon"),
            String::from("--force"),
        ];
        self.run_bd(cwd, &args).await?;
        Ok(())
    }

    async fn sync(&self, cwd: Option<&Path>) -> Result<SyncResult> {
        let value = self.run_bd(cwd, &[String::from("sync")]).await?;
        if value.is_null() {
            return Ok(SyncResult::default());
        }
        serde_json::from_value(value)
            .map_err(|e| AzedarachError::Parse(format!("bd sync: {e}")))
    }

    async fn sync_import_only(&self, cwd: Option<&Path>) -> Result<()> {
        self.run_bd(cwd, &[String::from("sync"), String::from("--import-only")])
            .await?;
        Ok(())
    }

    async fn recover_tombstones(&self, cwd: Option<&Path>) -> Result<u64> {
        let cwd = cwd.unwrap_or(&self.project_path);
        let script = cwd.join(".beads").join("recover-tombstones.sh");
        if !script.exists() {
            tracing::debug!("no recover-tombstones script at {}", script.display());
            return Ok(0);
        }
        let output = Command::new("sh")
            .arg(&script)
            .current_dir(cwd)
            .output()
            .await?;
        if !output.status.success() {
            return Err(AzedarachError::Tracker(format!(
                "recover-tombstones: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_recovered_count(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn add_dependency(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        dep_type: Option<DependencyType>,
        cwd: Option<&Path>,
    ) -> Result<()> {
        let mut args = vec![
            String::from("dep"),
            String::from("add"),
            issue_id.to_string(),
            depends_on_id.to_string(),
        ];
        if let Some(dep_type) = dep_type {
            args.push("--type".to_string());
            args.push(dep_type.as_str().to_string());
        }
        self.run_bd(cwd, &args).await?;
        Ok(())
    }
}

pub(crate) fn needs_sync(text: &str) -> bool {
    SYNC_FINGERPRINTS.iter().any(|phrase| text.contains(phrase))
}

fn strip_tombstones(issues: Vec<Issue>) -> Vec<Issue> {
    issues
        .into_iter()
        .filter(|issue| issue.status != IssueStatus::Tombstone)
        .collect()
}

fn issues_from(value: Value) -> Result<Vec<Issue>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(value)
            .map_err(|e| AzedarachError::Parse(format!("issue list: {e}"))),
        Value::Object(_) => {
            let issue = serde_json::from_value(value)
                .map_err(|e| AzedarachError::Parse(format!("issue: {e}")))?;
            Ok(vec![issue])
        }
        other => Err(AzedarachError::Parse(format!(
            "expected issue JSON, got: {other}"
        ))),
    }
}

fn parse_recovered_count(stdout: &str) -> u64 {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"Recovered (\d+) issues").expect("valid regex"));
    re.captures(stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn list_args(filter: &ListFilter) -> Vec<String> {
    let mut args = vec![String::from("list")];
    if let Some(status) = filter.status {
        args.push("--status".to_string());
        args.push(status.as_str().to_string());
    }
    if let Some(priority) = filter.priority {
        args.push("--priority".to_string());
        args.push(priority.to_string());
    }
    if let Some(issue_type) = filter.issue_type {
        args.push("--type".to_string());
        args.push(issue_type.as_str().to_string());
    }
    args
}

fn create_args(fields: &CreateIssue) -> Vec<String> {
    let mut args = vec![String::from("create"), fields.title.clone()];
    let mut push_opt = |flag: &str, value: &Option<String>| {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    };
    push_opt("--description", &fields.description);
    push_opt("--design", &fields.design);
    push_opt("--acceptance", &fields.acceptance);
    push_opt("--notes", &fields.notes);
    push_opt("--assignee", &fields.assignee);
    if let Some(issue_type) = fields.issue_type {
        args.push("--type".to_string());
        args.push(issue_type.as_str().to_string());
    }
    if let Some(priority) = fields.priority {
        args.push("--priority".to_string());
        args.push(priority.to_string());
    }
    // On create, labels travel as one comma-joined flag.
    if !fields.labels.is_empty() {
        args.push("--labels".to_string());
        args.push(fields.labels.join(","));
    }
    args
}

fn update_args(id: &str, fields: &UpdateIssue) -> Vec<String> {
    let mut args = vec![String::from("update"), id.to_string()];
    let mut push_opt = |flag: &str, value: &Option<String>| {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    };
    push_opt("--title", &fields.title);
    push_opt("--description", &fields.description);
    push_opt("--design", &fields.design);
    push_opt("--acceptance", &fields.acceptance);
    push_opt("--notes", &fields.notes);
    push_opt("--assignee", &fields.assignee);
    if let Some(status) = fields.status {
        args.push("--status".to_string());
        args.push(status.as_str().to_string());
    }
    if let Some(issue_type) = fields.issue_type {
        args.push("--type".to_string());
        args.push(issue_type.as_str().to_string());
    }
    if let Some(priority) = fields.priority {
        args.push("--priority".to_string());
        args.push(priority.to_string());
    }
    // On update, each label is its own --set-labels flag.
    if let Some(labels) = &fields.labels {
        for label in labels {
            args.push("--set-labels".to_string());
            args.push(label.clone());
        }
    }
    args
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory tracker for session and merge tests.

    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub fn make_issue(id: &str, status: IssueStatus) -> Issue {
        Issue {
            id: id.to_string(),
            title: format!("Issue {id}"),
            status,
            priority: 2,
            issue_type: IssueType::Task,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            description: None,
            design: None,
            notes: None,
            acceptance: None,
            estimate: None,
            assignee: None,
            labels: None,
            dependents: None,
            dependencies: None,
        }
    }

    #[derive(Default)]
    pub struct MockTracker {
        pub issues: Mutex<HashMap<String, Issue>>,
        pub sync_calls: AtomicUsize,
        pub import_only_calls: AtomicUsize,
        pub recover_calls: AtomicUsize,
    }

    impl MockTracker {
        pub fn with_issue(issue: Issue) -> Self {
            let tracker = Self::default();
            tracker
                .issues
                .lock()
                .unwrap()
                .insert(issue.id.clone(), issue);
            tracker
        }

        pub fn status_of(&self, id: &str) -> Option<IssueStatus> {
            self.issues.lock().unwrap().get(id).map(|issue| issue.status)
        }
    }

    #[async_trait]
    impl IssueTracker for MockTracker {
        async fn list(&self, _filter: &ListFilter, _cwd: Option<&Path>) -> Result<Vec<Issue>> {
            Ok(self.issues.lock().unwrap().values().cloned().collect())
        }

        async fn ready(&self, _cwd: Option<&Path>) -> Result<Vec<Issue>> {
            self.list(&ListFilter::default(), None).await
        }

        async fn search(&self, _query: &str, _cwd: Option<&Path>) -> Result<Vec<Issue>> {
            self.list(&ListFilter::default(), None).await
        }

        async fn show(&self, id: &str, _cwd: Option<&Path>) -> Result<Issue> {
            match self.issues.lock().unwrap().get(id) {
                Some(issue) if issue.status != IssueStatus::Tombstone => Ok(issue.clone()),
                _ => Err(AzedarachError::NotFound(id.to_string())),
            }
        }

        async fn show_multiple(&self, ids: &[String], _cwd: Option<&Path>) -> Result<Vec<Issue>> {
            let issues = self.issues.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| issues.get(id))
                .filter(|issue| issue.status != IssueStatus::Tombstone)
                .cloned()
                .collect())
        }

        async fn create(&self, fields: &CreateIssue, _cwd: Option<&Path>) -> Result<Issue> {
            let issue = Issue {
                title: fields.title.clone(),
                ..make_issue("az-new", IssueStatus::Open)
            };
            self.issues
                .lock()
                .unwrap()
                .insert(issue.id.clone(), issue.clone());
            Ok(issue)
        }

        async fn update(&self, id: &str, fields: &UpdateIssue, _cwd: Option<&Path>) -> Result<()> {
            let mut issues = self.issues.lock().unwrap();
            let issue = issues
                .get_mut(id)
                .ok_or_else(|| AzedarachError::NotFound(id.to_string()))?;
            if let Some(status) = fields.status {
                issue.status = status;
            }
            if let Some(title) = &fields.title {
                issue.title = title.clone();
            }
            Ok(())
        }

        async fn close(&self, id: &str, _reason: Option<&str>, _cwd: Option<&Path>) -> Result<()> {
            self.update(id, &UpdateIssue::status(IssueStatus::Closed), None)
                .await
        }

        async fn delete(&self, id: &str, _cwd: Option<&Path>) -> Result<()> {
            self.issues.lock().unwrap().remove(id);
            Ok(())
        }

        async fn sync(&self, _cwd: Option<&Path>) -> Result<SyncResult> {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SyncResult::default())
        }

        async fn sync_import_only(&self, _cwd: Option<&Path>) -> Result<()> {
            self.import_only_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn recover_tombstones(&self, _cwd: Option<&Path>) -> Result<u64> {
            self.recover_calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        async fn add_dependency(
            &self,
            _issue_id: &str,
            _depends_on_id: &str,
            _dep_type: Option<DependencyType>,
            _cwd: Option<&Path>,
        ) -> Result<()> {
            Ok(())
        }
    }
}
