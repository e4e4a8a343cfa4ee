//! Terminal multiplexer adapter.
//!
//! Agent sessions live inside tmux; the orchestrator drives them through
//! the minimal surface below and reads agent hook output back out of
//! session-scoped options (`@az_*`). Session options are the IPC channel:
//! the agent's hooks write them, the core only reads.

use crate::{AzedarachError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use tokio::process::Command;

/// One live multiplexer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerSession {
    pub name: String,
    /// Unix seconds.
    pub created_at: i64,
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Create a detached session running `command` in `cwd`.
    async fn new_session(&self, name: &str, cwd: &Path, command: &str) -> Result<()>;
    async fn has_session(&self, name: &str) -> Result<bool>;
    async fn kill_session(&self, name: &str) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<MultiplexerSession>>;
    async fn rename_session(&self, old: &str, new: &str) -> Result<()>;
    async fn list_windows(&self, session: &str) -> Result<Vec<String>>;
    async fn rename_window(&self, target: &str, name: &str) -> Result<()>;
    /// Mirror a window from one session into another.
    async fn link_window(&self, src: &str, dst: &str) -> Result<()>;
    async fn send_keys(&self, session: &str, keys: &str) -> Result<()>;
    /// Read a session-scoped option; `None` when unset.
    async fn get_option(&self, session: &str, key: &str) -> Result<Option<String>>;
    async fn set_option(&self, session: &str, key: &str, value: &str) -> Result<()>;
    /// Wake everyone blocked on `channel`.
    async fn signal_channel(&self, channel: &str) -> Result<()>;
    /// Block until `channel` is signaled.
    async fn wait_channel(&self, channel: &str) -> Result<()>;
    /// Creation timestamp of one session (unix seconds).
    async fn session_created(&self, name: &str) -> Result<i64>;
    /// Last `lines` lines of pane output, ANSI sequences included.
    async fn capture_pane(&self, session: &str, lines: u32) -> Result<String>;
}

/// If `name` is an agent session (`<prefix><bead-id>`), return the bead id.
pub fn parse_session_name(prefix: &str, name: &str) -> Option<String> {
    let stripped = name.strip_prefix(prefix)?;
    if crate::is_bead_id(stripped) {
        Some(stripped.to_string())
    } else {
        None
    }
}

/// Subprocess tmux implementation.
#[derive(Debug, Clone, Default)]
pub struct TmuxMultiplexer;

impl TmuxMultiplexer {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("tmux").args(args).output().await?;
        Ok(output)
    }

    async fn checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(AzedarachError::Multiplexer(format!(
                "tmux {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn new_session(&self, name: &str, cwd: &Path, command: &str) -> Result<()> {
        let cwd = cwd.to_string_lossy();
        self.checked(&["new-session", "-d", "-s", name, "-c", &cwd, command])
            .await?;
        Ok(())
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        let output = self.run(&["has-session", "-t", name]).await?;
        Ok(output.status.success())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        self.checked(&["kill-session", "-t", name]).await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<MultiplexerSession>> {
        let output = self
            .run(&["list-sessions", "-F", "#{session_name}|#{session_created}"])
            .await?;
        // tmux exits non-zero when no server is running; that just means
        // no sessions.
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(parse_session_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn rename_session(&self, old: &str, new: &str) -> Result<()> {
        self.checked(&["rename-session", "-t", old, new]).await?;
        Ok(())
    }

    async fn list_windows(&self, session: &str) -> Result<Vec<String>> {
        let stdout = self
            .checked(&["list-windows", "-t", session, "-F", "#{window_name}"])
            .await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn rename_window(&self, target: &str, name: &str) -> Result<()> {
        self.checked(&["rename-window", "-t", target, name]).await?;
        Ok(())
    }

    async fn link_window(&self, src: &str, dst: &str) -> Result<()> {
        self.checked(&["link-window", "-s", src, "-t", dst]).await?;
        Ok(())
    }

    async fn send_keys(&self, session: &str, keys: &str) -> Result<()> {
        self.checked(&["send-keys", "-t", session, keys]).await?;
        Ok(())
    }

    async fn get_option(&self, session: &str, key: &str) -> Result<Option<String>> {
        let output = self.run(&["show-option", "-t", session, "-v", key]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    async fn set_option(&self, session: &str, key: &str, value: &str) -> Result<()> {
        self.checked(&["set-option", "-t", session, key, value])
            .await?;
        Ok(())
    }

    async fn signal_channel(&self, channel: &str) -> Result<()> {
        self.checked(&["wait-for", "-S", channel]).await?;
        Ok(())
    }

    async fn wait_channel(&self, channel: &str) -> Result<()> {
        self.checked(&["wait-for", channel]).await?;
        Ok(())
    }

    async fn session_created(&self, name: &str) -> Result<i64> {
        let stdout = self
            .checked(&["display", "-t", name, "-p", "#{session_created}"])
            .await?;
        stdout.trim().parse().map_err(|_| {
            AzedarachError::Multiplexer(format!("bad session_created for {name}: '{stdout}'"))
        })
    }

    async fn capture_pane(&self, session: &str, lines: u32) -> Result<String> {
        let start = format!("-{lines}");
        let output = self
            .run(&["capture-pane", "-t", session, "-p", "-S", &start])
            .await?;
        if !output.status.success() {
            return Err(AzedarachError::SessionNotFound(session.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn parse_session_list(stdout: &str) -> Vec<MultiplexerSession> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, created) = line.split_once('|')?;
            Some(MultiplexerSession {
                name: name.to_string(),
                created_at: created.trim().parse().unwrap_or(0),
            })
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_list() {
        let out = "az-bqzy|1730500000\nmain|1730400000\n";
        let sessions = parse_session_list(out);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "az-bqzy");
        assert_eq!(sessions[0].created_at, 1730500000);
    }

    #[test]
    fn test_parse_session_list_empty() {
        assert!(parse_session_list("").is_empty());
    }

    #[test]
    fn test_parse_session_name() {
        assert_eq!(
            parse_session_name("", "az-bqzy"),
            Some("az-bqzy".to_string())
        );
        assert_eq!(parse_session_name("", "random"), None);
        assert_eq!(
            parse_session_name("agent_", "agent_az-bqzy"),
            Some("az-bqzy".to_string())
        );
        assert_eq!(parse_session_name("agent_", "az-bqzy"), None);
    }
}
