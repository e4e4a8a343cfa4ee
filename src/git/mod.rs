//! Subprocess git plumbing.
//!
//! Worktree lifecycle, merges, and conflict prediction all shell out to the
//! `git` binary; in-process repository discovery (is-repo, branch lookup)
//! lives in the worktree module on top of libgit2.

use crate::{AzedarachError, Result};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;

/// Run `git <args>` in `cwd` and return the raw output.
pub async fn run(cwd: &Path, args: &[&str]) -> Result<Output> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;
    Ok(output)
}

/// Run `git <args>` and fail with the command's stderr on non-zero exit.
///
/// Returns trimmed stdout.
pub async fn checked(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = run(cwd, args).await?;
    if !output.status.success() {
        return Err(AzedarachError::Vcs {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Name of the branch currently checked out in `cwd`.
pub async fn current_branch(cwd: &Path) -> Result<String> {
    checked(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await
}

/// Whether `refs/heads/<branch>` exists.
pub async fn branch_exists(cwd: &Path, branch: &str) -> Result<bool> {
    let refname = format!("refs/heads/{branch}");
    let output = run(cwd, &["rev-parse", "--verify", "--quiet", &refname]).await?;
    Ok(output.status.success())
}

pub async fn checkout(cwd: &Path, branch: &str) -> Result<()> {
    checked(cwd, &["checkout", branch]).await?;
    Ok(())
}

/// Delete a local branch. `force` uses `-D`.
pub async fn delete_branch(cwd: &Path, branch: &str, force: bool) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    checked(cwd, &["branch", flag, branch]).await?;
    Ok(())
}

/// Stage everything and commit. Returns false (without committing) when the
/// working tree is clean.
pub async fn commit_if_changed(cwd: &Path, message: &str) -> Result<bool> {
    if status_porcelain(cwd).await?.is_empty() {
        return Ok(false);
    }
    checked(cwd, &["add", "-A"]).await?;
    checked(cwd, &["commit", "-m", message]).await?;
    Ok(true)
}

/// Changed paths from `git status --porcelain`.
pub async fn status_porcelain(cwd: &Path) -> Result<Vec<String>> {
    let stdout = checked(cwd, &["status", "--porcelain"]).await?;
    Ok(parse_status_porcelain(&stdout))
}

pub(crate) fn parse_status_porcelain(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = line[3..].trim();
            // renames are reported as "old -> new"; keep the new path
            match path.rsplit_once(" -> ") {
                Some((_, new)) => new.to_string(),
                None => path.to_string(),
            }
        })
        .collect()
}

/// Options for a real textual merge.
#[derive(Debug, Default, Clone)]
pub struct MergeOptions<'a> {
    pub no_ff: bool,
    pub message: Option<&'a str>,
    /// `-X ours`: favor the current branch on content conflicts.
    pub strategy_ours: bool,
    pub no_edit: bool,
}

/// Run `git merge <branch>` in `cwd`.
///
/// A conflicting merge exits non-zero and leaves the tree in the conflict
/// state; the error carries stderr so callers can recognize "CONFLICT".
pub async fn merge<'a>(cwd: &Path, branch: &str, opts: MergeOptions<'a>) -> Result<()> {
    let mut args = vec!["merge", branch];
    if opts.no_ff {
        args.push("--no-ff");
    }
    if let Some(message) = opts.message {
        args.push("-m");
        args.push(message);
    }
    if opts.strategy_ours {
        args.push("-X");
        args.push("ours");
    }
    if opts.no_edit {
        args.push("--no-edit");
    }
    checked(cwd, &args).await?;
    Ok(())
}

pub async fn merge_abort(cwd: &Path) -> Result<()> {
    checked(cwd, &["merge", "--abort"]).await?;
    Ok(())
}

/// Outcome of an in-memory 3-way merge (`git merge-tree --write-tree`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeTreePrediction {
    Clean,
    Conflicts(Vec<String>),
    /// merge-tree exited with something other than 0 or 1.
    Unknown,
}

/// Predict whether merging `theirs` into `ours` would conflict, without
/// touching the working tree or any ref.
pub async fn merge_tree(cwd: &Path, ours: &str, theirs: &str) -> Result<MergeTreePrediction> {
    let output = run(cwd, &["merge-tree", "--write-tree", ours, theirs]).await?;
    match output.status.code() {
        Some(0) => Ok(MergeTreePrediction::Clean),
        Some(1) => {
            // Re-run asking only for conflicted file names.
            let output = run(
                cwd,
                &[
                    "merge-tree",
                    "--write-tree",
                    "--name-only",
                    "--no-messages",
                    ours,
                    theirs,
                ],
            )
            .await?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(MergeTreePrediction::Conflicts(parse_merge_tree_names(
                &stdout,
            )))
        }
        _ => Ok(MergeTreePrediction::Unknown),
    }
}

/// Parse `merge-tree --write-tree --name-only` output: the first line is the
/// result tree OID, the remaining non-empty lines are conflicted paths.
pub(crate) fn parse_merge_tree_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn merge_base(cwd: &Path, a: &str, b: &str) -> Result<String> {
    checked(cwd, &["merge-base", a, b]).await
}

/// Paths changed between two commits (`git diff --name-only a..b`).
pub async fn changed_files(cwd: &Path, from: &str, to: &str) -> Result<Vec<String>> {
    let range = format!("{from}..{to}");
    let stdout = checked(cwd, &["diff", "--name-only", &range]).await?;
    Ok(stdout.lines().map(str::to_string).collect())
}

/// Number of commits in `from..to`.
pub async fn commit_count(cwd: &Path, from: &str, to: &str) -> Result<u64> {
    let range = format!("{from}..{to}");
    let stdout = checked(cwd, &["rev-list", "--count", &range]).await?;
    stdout
        .parse()
        .map_err(|_| AzedarachError::Parse(format!("rev-list --count returned '{stdout}'")))
}

pub async fn fetch(cwd: &Path, remote: &str, refspec: Option<&str>) -> Result<()> {
    let mut args = vec!["fetch", remote];
    if let Some(refspec) = refspec {
        args.push(refspec);
    }
    checked(cwd, &args).await?;
    Ok(())
}

pub async fn push(cwd: &Path, remote: &str, branch: &str, set_upstream: bool) -> Result<()> {
    let mut args = vec!["push"];
    if set_upstream {
        args.push("-u");
    }
    args.push(remote);
    args.push(branch);
    checked(cwd, &args).await?;
    Ok(())
}

pub async fn push_delete(cwd: &Path, remote: &str, branch: &str) -> Result<()> {
    checked(cwd, &["push", remote, "--delete", branch]).await?;
    Ok(())
}

pub async fn stash_push(cwd: &Path, message: &str) -> Result<()> {
    checked(cwd, &["stash", "push", "-m", message]).await?;
    Ok(())
}

pub async fn stash_pop(cwd: &Path) -> Result<()> {
    checked(cwd, &["stash", "pop"]).await?;
    Ok(())
}

/// `git worktree list --porcelain` raw output; the worktree module owns the
/// parsing.
pub async fn worktree_list_porcelain(cwd: &Path) -> Result<String> {
    checked(cwd, &["worktree", "list", "--porcelain"]).await
}

/// Add a worktree at `path`.
///
/// With `new_branch` set, creates `branch` starting from `start`; otherwise
/// checks out the existing `branch`.
pub async fn worktree_add(
    cwd: &Path,
    path: &Path,
    branch: &str,
    new_branch: bool,
    start: Option<&str>,
) -> Result<()> {
    let path_str = path.to_string_lossy();
    let mut args: Vec<&str> = vec!["worktree", "add"];
    if new_branch {
        args.push("-b");
        args.push(branch);
        args.push(&path_str);
        if let Some(start) = start {
            args.push(start);
        }
    } else {
        args.push(&path_str);
        args.push(branch);
    }
    checked(cwd, &args).await?;
    Ok(())
}

pub async fn worktree_remove(cwd: &Path, path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    checked(cwd, &["worktree", "remove", &path_str, "--force"]).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scratch-repository helpers shared by worktree, session, and merge
    //! tests.

    use std::path::Path;
    use std::process::Command;

    pub fn git_sync(cwd: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("git runs");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Initialize a repo on `main` with one commit.
    pub fn init_repo(dir: &Path) {
        git_sync(dir, &["init", "-b", "main"]);
        git_sync(dir, &["config", "user.email", "test@example.com"]);
        git_sync(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "# scratch\n").unwrap();
        git_sync(dir, &["add", "-A"]);
        git_sync(dir, &["commit", "-m", "initial"]);
    }

    pub fn write_and_commit(cwd: &Path, file: &str, content: &str, message: &str) {
        std::fs::write(cwd.join(file), content).unwrap();
        git_sync(cwd, &["add", "-A"]);
        git_sync(cwd, &["commit", "-m", message]);
    }

    /// `merge-tree --write-tree` needs git >= 2.38; probe so older hosts
    /// skip prediction tests instead of failing them.
    pub fn supports_merge_tree(cwd: &Path) -> bool {
        Command::new("git")
            .args(["merge-tree", "--write-tree", "HEAD", "HEAD"])
            .current_dir(cwd)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_porcelain() {
        let out = " M src/lib.rs\n?? notes.md\nR  old.rs -> new.rs\n";
        assert_eq!(
            parse_status_porcelain(out),
            vec!["src/lib.rs", "notes.md", "new.rs"]
        );
        assert!(parse_status_porcelain("").is_empty());
    }

    #[test]
    fn test_parse_merge_tree_names() {
        let out = "3f2a9d1c5e7b8a0f4d6c2e9b1a3f5d7c9e0b2a4f\nsrc/a.ts\nsrc/b.ts\n";
        assert_eq!(parse_merge_tree_names(out), vec!["src/a.ts", "src/b.ts"]);
    }

    #[test]
    fn test_parse_merge_tree_names_oid_only() {
        // A clean merge re-run would print just the tree OID.
        let out = "3f2a9d1c5e7b8a0f4d6c2e9b1a3f5d7c9e0b2a4f\n";
        assert!(parse_merge_tree_names(out).is_empty());
    }

    #[tokio::test]
    async fn test_branch_queries_against_real_repo() {
        let dir = tempfile::tempdir().unwrap();
        testing::init_repo(dir.path());

        assert_eq!(current_branch(dir.path()).await.unwrap(), "main");
        assert!(branch_exists(dir.path(), "main").await.unwrap());
        assert!(!branch_exists(dir.path(), "az-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_if_changed() {
        let dir = tempfile::tempdir().unwrap();
        testing::init_repo(dir.path());

        // clean tree: no commit
        assert!(!commit_if_changed(dir.path(), "noop").await.unwrap());

        std::fs::write(dir.path().join("new.txt"), "x\n").unwrap();
        assert!(commit_if_changed(dir.path(), "add new.txt").await.unwrap());
        assert!(status_porcelain(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_tree_clean_prediction() {
        let dir = tempfile::tempdir().unwrap();
        testing::init_repo(dir.path());
        if !testing::supports_merge_tree(dir.path()) {
            return;
        }

        testing::git_sync(dir.path(), &["branch", "side"]);
        testing::write_and_commit(dir.path(), "main.txt", "m\n", "main work");

        let prediction = merge_tree(dir.path(), "main", "side").await.unwrap();
        assert_eq!(prediction, MergeTreePrediction::Clean);
    }

    #[tokio::test]
    async fn test_checked_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        testing::init_repo(dir.path());

        let err = checked(dir.path(), &["checkout", "does-not-exist"])
            .await
            .unwrap_err();
        let AzedarachError::Vcs { command, stderr } = err else {
            panic!("expected Vcs error");
        };
        assert!(command.starts_with("checkout"));
        assert!(!stderr.is_empty());
    }
}
