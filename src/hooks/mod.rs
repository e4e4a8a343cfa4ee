//! Hook-driven (authoritative) agent state inference.
//!
//! The agent's lifecycle hooks write `@az_status` into its tmux session
//! options; this poller diffs those options every 500 ms and emits an
//! update per observed change. Hook state always outranks the heuristic
//! pane-output detector.

use crate::multiplexer::{Multiplexer, parse_session_name};
use crate::telemetry::Telemetry;
use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const STATUS_OPTION: &str = "@az_status";
pub const WORKTREE_OPTION: &str = "@az_worktree";
pub const PROJECT_OPTION: &str = "@az_project";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEARTBEAT_COMPONENT: &str = "hook-receiver";

/// The three statuses an agent's hooks report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Busy,
    Waiting,
    Idle,
}

impl HookStatus {
    /// Anything outside the vocabulary is ignored by the poller.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "busy" => Some(HookStatus::Busy),
            "waiting" => Some(HookStatus::Waiting),
            "idle" => Some(HookStatus::Idle),
            _ => None,
        }
    }
}

/// One observed hook-status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateUpdate {
    pub bead_id: String,
    pub status: HookStatus,
    pub session_name: String,
    /// Unix seconds; 0 for synthetic disappearance updates.
    pub created_at: i64,
    pub worktree_path: Option<PathBuf>,
    pub project_path: Option<PathBuf>,
}

/// Polls tmux session options and emits [`SessionStateUpdate`]s.
pub struct HookReceiver {
    multiplexer: Arc<dyn Multiplexer>,
    session_prefix: String,
    telemetry: Option<Arc<Telemetry>>,
    last_seen: HashMap<String, HookStatus>,
}

impl HookReceiver {
    pub fn new(
        multiplexer: Arc<dyn Multiplexer>,
        session_prefix: impl Into<String>,
        telemetry: Option<Arc<Telemetry>>,
    ) -> Self {
        Self {
            multiplexer,
            session_prefix: session_prefix.into(),
            telemetry,
            last_seen: HashMap::new(),
        }
    }

    /// One poll cycle: read options for every agent session, diff against
    /// the previous cycle, synthesize idle updates for vanished beads.
    pub async fn poll_once(&mut self) -> Result<Vec<SessionStateUpdate>> {
        let sessions = self.multiplexer.list_sessions().await?;
        let mut current: HashMap<String, HookStatus> = HashMap::new();
        let mut updates = Vec::new();

        for session in sessions {
            let Some(bead_id) = parse_session_name(&self.session_prefix, &session.name) else {
                continue;
            };
            let Some(raw) = self
                .multiplexer
                .get_option(&session.name, STATUS_OPTION)
                .await?
            else {
                continue;
            };
            let Some(status) = HookStatus::parse(&raw) else {
                continue;
            };

            current.insert(bead_id.clone(), status);
            if self.last_seen.get(&bead_id) == Some(&status) {
                continue;
            }

            let worktree_path = self
                .multiplexer
                .get_option(&session.name, WORKTREE_OPTION)
                .await
                .ok()
                .flatten()
                .map(PathBuf::from);
            let project_path = self
                .multiplexer
                .get_option(&session.name, PROJECT_OPTION)
                .await
                .ok()
                .flatten()
                .map(PathBuf::from);

            updates.push(SessionStateUpdate {
                bead_id,
                status,
                session_name: session.name.clone(),
                created_at: session.created_at,
                worktree_path,
                project_path,
            });
        }

        // Beads gone since the previous cycle report idle.
        for (bead_id, _) in self
            .last_seen
            .iter()
            .filter(|(bead_id, _)| !current.contains_key(*bead_id))
        {
            updates.push(SessionStateUpdate {
                bead_id: bead_id.clone(),
                status: HookStatus::Idle,
                session_name: format!("{}{}", self.session_prefix, bead_id),
                created_at: 0,
                worktree_path: None,
                project_path: None,
            });
        }

        self.last_seen = current;
        Ok(updates)
    }

    /// Run the poll loop as a long-lived task.
    ///
    /// Errors are logged and the loop keeps polling; the task exits only
    /// when the receiving side is dropped.
    pub fn spawn(mut self) -> (JoinHandle<()>, mpsc::UnboundedReceiver<SessionStateUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.poll_once().await {
                    Ok(updates) => {
                        for update in updates {
                            if tx.send(update).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("hook poll failed: {}", e);
                    }
                }
                if let Some(telemetry) = &self.telemetry {
                    if let Err(e) = telemetry.touch_heartbeat(HEARTBEAT_COMPONENT, None) {
                        tracing::warn!("hook heartbeat failed: {}", e);
                    }
                }
            }
        });
        (handle, rx)
    }
}
