//! Git worktree management
//!
//! Creates and manages isolated worktrees for each bead. Every bead's
//! worktree lives as a sibling of the project (`<parent>/<project>-<bead>`)
//! on a branch named after the bead. Git is the source of truth; the
//! in-memory index is a short-lived cache over `git worktree list`.

mod settings;

use crate::{AzedarachError, Result, git, is_bead_id};
use git2::Repository;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

const INDEX_TTL: Duration = Duration::from_secs(2);

/// Worktree directories can lag on some filesystems right after
/// `git worktree add`; retry the index lookup a few times.
const CREATE_RETRIES: u32 = 5;
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// An isolated checkout for one bead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub bead_id: String,
    pub branch: String,
    pub head: String,
    pub is_locked: bool,
}

#[derive(Debug, Clone)]
pub struct CreateWorktreeOptions {
    pub bead_id: String,
    pub project_path: PathBuf,
    /// Branch the new bead branch starts from; defaults to the project's
    /// current branch.
    pub base_branch: Option<String>,
    /// Checkout whose assistant settings and untracked paths seed the new
    /// worktree; defaults to the project itself.
    pub source_worktree_path: Option<PathBuf>,
    /// Untracked paths copied from the source (missing ones skipped).
    pub copy_untracked: Vec<String>,
}

impl CreateWorktreeOptions {
    pub fn new(bead_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            bead_id: bead_id.into(),
            project_path: project_path.into(),
            base_branch: None,
            source_worktree_path: None,
            copy_untracked: vec![".direnv".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoveWorktreeOptions {
    pub bead_id: String,
    pub project_path: PathBuf,
}

struct ProjectIndex {
    worktrees: HashMap<String, Worktree>,
    refreshed_at: Instant,
}

/// Manages bead worktrees across projects.
#[derive(Default)]
pub struct WorktreeManager {
    index: Mutex<HashMap<PathBuf, ProjectIndex>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<parent>/<projectName>-<beadId>`, always a sibling of the project.
    pub fn worktree_path_for(project_path: &Path, bead_id: &str) -> PathBuf {
        let name = project_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        let parent = project_path.parent().unwrap_or(project_path);
        parent.join(format!("{name}-{bead_id}"))
    }

    /// Create (or return the existing) worktree for a bead.
    pub async fn create(&self, options: &CreateWorktreeOptions) -> Result<Worktree> {
        let project = &options.project_path;
        let repo = Repository::open(project)
            .map_err(|_| AzedarachError::NotAGitRepo(project.clone()))?;

        if let Some(existing) = self.refresh(project, true).await?.remove(&options.bead_id) {
            return Ok(existing);
        }

        let worktree_path = Self::worktree_path_for(project, &options.bead_id);
        let branch = &options.bead_id;

        // Reuse a leftover branch from a previous run; otherwise branch off
        // the requested base (or whatever the project has checked out).
        let branch_exists = repo
            .find_branch(branch, git2::BranchType::Local)
            .is_ok();
        if branch_exists {
            git::worktree_add(project, &worktree_path, branch, false, None).await?;
        } else {
            let start = match &options.base_branch {
                Some(base) => base.clone(),
                None => current_branch(&repo)?,
            };
            git::worktree_add(project, &worktree_path, branch, true, Some(&start)).await?;
        }

        let source = options
            .source_worktree_path
            .as_deref()
            .unwrap_or(project.as_path());
        if let Err(e) =
            settings::install_bead_settings(source, &worktree_path, project, &options.bead_id)
        {
            tracing::warn!("failed to install assistant settings for {}: {}", options.bead_id, e);
        }
        self.copy_untracked(source, &worktree_path, &options.copy_untracked);

        for attempt in 0..CREATE_RETRIES {
            if let Some(worktree) = self.refresh(project, true).await?.remove(&options.bead_id) {
                return Ok(worktree);
            }
            tracing::debug!(
                "worktree for {} not indexed yet (attempt {})",
                options.bead_id,
                attempt + 1
            );
            tokio::time::sleep(CREATE_RETRY_DELAY).await;
        }
        Err(AzedarachError::Vcs {
            command: "worktree add".to_string(),
            stderr: format!(
                "worktree for {} missing from `git worktree list` after creation",
                options.bead_id
            ),
        })
    }

    /// Remove a bead's worktree. Missing worktrees are a no-op.
    pub async fn remove(&self, options: &RemoveWorktreeOptions) -> Result<()> {
        let project = &options.project_path;
        let Some(worktree) = self.refresh(project, true).await?.remove(&options.bead_id) else {
            return Ok(());
        };
        git::worktree_remove(project, &worktree.path).await?;
        self.refresh(project, true).await?;
        Ok(())
    }

    pub async fn list(&self, project_path: &Path) -> Result<Vec<Worktree>> {
        let map = self.refresh(project_path, false).await?;
        let mut worktrees: Vec<Worktree> = map.into_values().collect();
        worktrees.sort_by(|a, b| a.bead_id.cmp(&b.bead_id));
        Ok(worktrees)
    }

    pub async fn exists(&self, bead_id: &str, project_path: &Path) -> Result<bool> {
        Ok(self.refresh(project_path, false).await?.contains_key(bead_id))
    }

    pub async fn get(&self, bead_id: &str, project_path: &Path) -> Result<Option<Worktree>> {
        Ok(self.refresh(project_path, false).await?.remove(bead_id))
    }

    /// Union the agent's permission-like local settings back into the
    /// project after its branch has merged. Best-effort.
    pub fn merge_claude_local_settings(&self, worktree_path: &Path, project_path: &Path) {
        if let Err(e) = settings::merge_settings_back(worktree_path, project_path) {
            tracing::warn!(
                "failed to merge local settings from {} back into project: {}",
                worktree_path.display(),
                e
            );
        }
    }

    /// Return the project's worktree map, re-scanning git when the cache is
    /// stale (2 s TTL) or `force` is set.
    async fn refresh(&self, project_path: &Path, force: bool) -> Result<HashMap<String, Worktree>> {
        if !force {
            let index = self.lock_index();
            if let Some(cached) = index.get(project_path) {
                if cached.refreshed_at.elapsed() < INDEX_TTL {
                    return Ok(cached.worktrees.clone());
                }
            }
        }

        let porcelain = git::worktree_list_porcelain(project_path).await?;
        let worktrees = parse_worktree_list(&porcelain, project_path);
        let map: HashMap<String, Worktree> = worktrees
            .into_iter()
            .map(|worktree| (worktree.bead_id.clone(), worktree))
            .collect();

        self.lock_index().insert(
            project_path.to_path_buf(),
            ProjectIndex {
                worktrees: map.clone(),
                refreshed_at: Instant::now(),
            },
        );
        Ok(map)
    }

    fn copy_untracked(&self, source: &Path, worktree: &Path, paths: &[String]) {
        for rel in paths {
            let from = source.join(rel);
            if !from.exists() {
                continue;
            }
            let to = worktree.join(rel);
            if let Err(e) = copy_recursive(&from, &to) {
                tracing::warn!("failed to copy {} into worktree: {}", from.display(), e);
            }
        }
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, ProjectIndex>> {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn current_branch(repo: &Repository) -> Result<String> {
    let head = repo.head()?;
    head.shorthand()
        .map(str::to_string)
        .ok_or_else(|| AzedarachError::Vcs {
            command: "rev-parse --abbrev-ref HEAD".to_string(),
            stderr: "HEAD is not a branch".to_string(),
        })
}

/// Parse `git worktree list --porcelain`: blank-line-separated stanzas of
/// `worktree <path>` / `HEAD <sha>` / `branch refs/heads/<name>` /
/// optional `locked`. The project root itself is excluded, as is any entry
/// with no recognizable bead id.
pub fn parse_worktree_list(porcelain: &str, project_root: &Path) -> Vec<Worktree> {
    let root = resolve(project_root);
    let mut worktrees = Vec::new();

    for stanza in porcelain.split("\n\n") {
        let mut path: Option<PathBuf> = None;
        let mut head = String::new();
        let mut branch: Option<String> = None;
        let mut is_locked = false;

        for line in stanza.lines() {
            if let Some(rest) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(rest));
            } else if let Some(rest) = line.strip_prefix("HEAD ") {
                head = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("branch ") {
                branch = rest.strip_prefix("refs/heads/").map(str::to_string);
            } else if line == "locked" || line.starts_with("locked ") {
                is_locked = true;
            }
        }

        let Some(path) = path else { continue };
        if resolve(&path) == root {
            continue;
        }

        let bead_id = match &branch {
            Some(name) if is_bead_id(name) => Some(name.clone()),
            _ => bead_id_from_path(&path),
        };
        let Some(bead_id) = bead_id else { continue };

        let branch = branch.unwrap_or_else(|| bead_id.clone());
        worktrees.push(Worktree {
            path,
            bead_id,
            branch,
            head,
            is_locked,
        });
    }

    worktrees
}

/// Extract a bead id from a worktree directory suffix
/// (`…/project-az-bqzy` → `az-bqzy`).
fn bead_id_from_path(path: &Path) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"-([a-z]+-[a-z0-9]+)$").expect("valid regex"));
    let name = path.file_name()?.to_string_lossy();
    re.captures(&name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn resolve(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
    }
    Ok(())
}
