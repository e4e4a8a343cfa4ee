//! Heuristic agent-state detection from captured pane output.
//!
//! Pattern matching is the fallback signal when an agent's hooks are not
//! installed; hook-driven state (see `hooks`) always wins when present.
//! Matching is pure; the stateful wrappers add stickiness and debouncing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Observable lifecycle state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Busy,
    Waiting,
    Done,
    Error,
    Paused,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Busy => "busy",
            SessionState::Waiting => "waiting",
            SessionState::Done => "done",
            SessionState::Error => "error",
            SessionState::Paused => "paused",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the agent appears to be doing, orthogonal to [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Planning,
    Action,
    Verification,
    PlanMode,
}

impl AgentPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Idle => "idle",
            AgentPhase::Planning => "planning",
            AgentPhase::Action => "action",
            AgentPhase::Verification => "verification",
            AgentPhase::PlanMode => "plan_mode",
        }
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const BUSY_DEBOUNCE: Duration = Duration::from_millis(100);
const PHASE_DEBOUNCE: Duration = Duration::from_millis(500);

struct StatePattern {
    state: SessionState,
    regex: Regex,
}

struct PhasePattern {
    phase: AgentPhase,
    regex: Regex,
}

/// State patterns, highest priority first (waiting=100, error=90, done=80).
fn state_patterns() -> &'static [StatePattern] {
    static PATTERNS: OnceLock<Vec<StatePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let entry = |state, pattern: &str| StatePattern {
            state,
            regex: Regex::new(pattern).expect("valid state pattern"),
        };
        vec![
            // waiting: the agent is blocked on a human answer
            entry(SessionState::Waiting, r"(?i)\(y(es)?/n(o)?\)|\[y/n\]"),
            entry(SessionState::Waiting, r"Do you want to"),
            entry(SessionState::Waiting, r"(?i)press enter"),
            entry(SessionState::Waiting, r"Continue\?"),
            entry(SessionState::Waiting, r"\d+\.\s+Other"),
            entry(
                SessionState::Waiting,
                r"(?i)\b(select|choose|enter)\b.{0,24}\boption\b",
            ),
            // error
            entry(SessionState::Error, r"Error:"),
            entry(SessionState::Error, r"Exception:"),
            entry(SessionState::Error, r"Failed:"),
            entry(SessionState::Error, r"\b(ENOENT|EACCES)\b"),
            entry(SessionState::Error, r"command not found"),
            entry(SessionState::Error, r"(?i)permission denied"),
            // done
            entry(SessionState::Done, r"(?i)task completed"),
            entry(SessionState::Done, r"Successfully"),
            entry(SessionState::Done, r"Done\."),
            entry(SessionState::Done, r"(?i)\bfinished\b"),
            entry(SessionState::Done, r"(?i)all tasks complete"),
        ]
    })
}

/// Phase patterns, highest priority first (planMode=110, verification=100,
/// action=80, planning=60).
fn phase_patterns() -> &'static [PhasePattern] {
    static PATTERNS: OnceLock<Vec<PhasePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let entry = |phase, pattern: &str| PhasePattern {
            phase,
            regex: Regex::new(pattern).expect("valid phase pattern"),
        };
        vec![
            // plan mode
            entry(AgentPhase::PlanMode, r"(?i)plan mode"),
            entry(AgentPhase::PlanMode, r"ExitPlanMode"),
            entry(AgentPhase::PlanMode, r"(?i)read-only mode"),
            entry(AgentPhase::PlanMode, r"\[plan\]"),
            // verification: tests, type checks, builds, linters
            entry(
                AgentPhase::Verification,
                r"\b(jest|vitest|pytest|go test|cargo test|npm test|bun test)\b",
            ),
            entry(
                AgentPhase::Verification,
                r"\b(tsc|mypy|cargo check|cargo clippy|eslint|ruff)\b",
            ),
            entry(AgentPhase::Verification, r"\b(npm run build|cargo build|make)\b"),
            entry(AgentPhase::Verification, r"(?i)\b(verifying|validating)\b"),
            entry(AgentPhase::Verification, r"(?i)tests? pass"),
            // action: tool use, file edits, shell activity
            entry(AgentPhase::Action, r"\b(Edit|Write|Bash|Read)\("),
            entry(
                AgentPhase::Action,
                r"(?i)\b(writing to|creating file|editing file)\b",
            ),
            entry(AgentPhase::Action, r"(?m)^```"),
            entry(AgentPhase::Action, r"(?m)^\$ "),
            // planning: first-person intent and analysis vocabulary
            entry(AgentPhase::Planning, r"\b(I'll|Let me|I will|Next I)\b"),
            entry(
                AgentPhase::Planning,
                r"(?i)\b(looking at|analyzing|searching)\b",
            ),
            entry(AgentPhase::Planning, r"(?i)\bplanning\b"),
        ]
    })
}

/// Detect a session state in one output chunk.
///
/// Any non-empty chunk yields a state; `busy` is the fallback when no
/// specific pattern matches. Whitespace-only chunks yield nothing.
pub fn detect_state(chunk: &str) -> Option<SessionState> {
    if chunk.trim().is_empty() {
        return None;
    }
    for pattern in state_patterns() {
        if pattern.regex.is_match(chunk) {
            return Some(pattern.state);
        }
    }
    Some(SessionState::Busy)
}

/// Detect an agent phase in one output chunk. No fallback.
pub fn detect_phase(chunk: &str) -> Option<AgentPhase> {
    for pattern in phase_patterns() {
        if pattern.regex.is_match(chunk) {
            return Some(pattern.phase);
        }
    }
    None
}

/// Strip ANSI escape sequences from raw pane bytes.
pub fn clean_chunk(raw: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&stripped).to_string()
}

/// Per-session state detector with stickiness and debouncing.
///
/// `done` and `error` are sticky until a fresh detector is built;
/// `waiting`/`error`/`done` report on first match; `busy` is debounced
/// with a 100 ms quiet window.
#[derive(Debug, Default)]
pub struct StatefulDetector {
    terminal: Option<SessionState>,
    last_reported: Option<SessionState>,
    last_busy_report: Option<Instant>,
}

impl StatefulDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; `Some` means "report this state now".
    pub fn detect(&mut self, chunk: &str) -> Option<SessionState> {
        if let Some(terminal) = self.terminal {
            return Some(terminal);
        }
        let state = detect_state(chunk)?;
        match state {
            SessionState::Done | SessionState::Error => {
                self.terminal = Some(state);
                self.last_reported = Some(state);
                Some(state)
            }
            SessionState::Busy => {
                let now = Instant::now();
                if self.last_reported == Some(SessionState::Busy)
                    && self
                        .last_busy_report
                        .is_some_and(|at| now.duration_since(at) < BUSY_DEBOUNCE)
                {
                    return None;
                }
                self.last_busy_report = Some(now);
                self.last_reported = Some(SessionState::Busy);
                Some(SessionState::Busy)
            }
            other => {
                self.last_reported = Some(other);
                Some(other)
            }
        }
    }
}

/// A combined state + phase report for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub state: Option<SessionState>,
    pub phase: Option<AgentPhase>,
}

/// State and phase detection over one stream, with the phase debounced on
/// a longer window than the state.
#[derive(Debug, Default)]
pub struct CombinedDetector {
    state: StatefulDetector,
    last_phase: Option<AgentPhase>,
    last_phase_report: Option<Instant>,
}

impl CombinedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detect(&mut self, chunk: &str) -> Detection {
        let state = self.state.detect(chunk);
        let phase = detect_phase(chunk).and_then(|phase| {
            let now = Instant::now();
            let changed = self.last_phase != Some(phase);
            let window_elapsed = self
                .last_phase_report
                .is_none_or(|at| now.duration_since(at) >= PHASE_DEBOUNCE);
            if changed || window_elapsed {
                self.last_phase = Some(phase);
                self.last_phase_report = Some(now);
                Some(phase)
            } else {
                None
            }
        });
        Detection { state, phase }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chunk_detects_nothing() {
        assert_eq!(detect_state(""), None);
        assert_eq!(detect_state("   \n\t"), None);
    }

    #[test]
    fn test_busy_is_the_fallback() {
        assert_eq!(detect_state("compiling azedarach v0.1.0"), Some(SessionState::Busy));
    }

    #[test]
    fn test_waiting_beats_busy_and_error() {
        // Both a waiting prompt and an error marker in the same chunk:
        // the higher-priority waiting wins.
        let chunk = "Error: tests failed\nDo you want to retry? (y/n)";
        assert_eq!(detect_state(chunk), Some(SessionState::Waiting));
    }

    #[test]
    fn test_error_and_done_signals() {
        assert_eq!(detect_state("Exception: boom"), Some(SessionState::Error));
        assert_eq!(detect_state("zsh: command not found: bd"), Some(SessionState::Error));
        assert_eq!(detect_state("All tasks complete."), Some(SessionState::Done));
        assert_eq!(detect_state("Task completed without issues"), Some(SessionState::Done));
    }

    #[test]
    fn test_phase_priorities() {
        assert_eq!(detect_phase("entering plan mode"), Some(AgentPhase::PlanMode));
        // plan mode beats verification when both appear
        assert_eq!(
            detect_phase("[plan] running cargo test"),
            Some(AgentPhase::PlanMode)
        );
        assert_eq!(detect_phase("running cargo test"), Some(AgentPhase::Verification));
        assert_eq!(detect_phase("Edit(src/lib.rs)"), Some(AgentPhase::Action));
        assert_eq!(detect_phase("Let me check the config"), Some(AgentPhase::Planning));
        assert_eq!(detect_phase("plain output"), None);
    }

    #[test]
    fn test_sticky_done() {
        let mut detector = StatefulDetector::new();
        assert_eq!(detector.detect("Task completed"), Some(SessionState::Done));
        assert_eq!(detector.detect("Error: oops"), Some(SessionState::Done));
        assert_eq!(detector.detect("anything"), Some(SessionState::Done));

        // a fresh detector resets
        let mut fresh = StatefulDetector::new();
        assert_eq!(fresh.detect("Error: oops"), Some(SessionState::Error));
        assert_eq!(fresh.detect("Task completed"), Some(SessionState::Error));
    }

    #[test]
    fn test_busy_debounce() {
        let mut detector = StatefulDetector::new();
        assert_eq!(detector.detect("chunk one"), Some(SessionState::Busy));
        assert_eq!(detector.detect("chunk two"), None, "inside quiet window");
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(detector.detect("chunk three"), Some(SessionState::Busy));
    }

    #[test]
    fn test_waiting_reports_immediately_after_busy() {
        let mut detector = StatefulDetector::new();
        assert_eq!(detector.detect("working"), Some(SessionState::Busy));
        // no quiet window for waiting
        assert_eq!(detector.detect("Continue? (y/n)"), Some(SessionState::Waiting));
    }

    #[test]
    fn test_combined_phase_debounce() {
        let mut detector = CombinedDetector::new();
        let first = detector.detect("Let me look at the failing test");
        assert_eq!(first.phase, Some(AgentPhase::Planning));

        // same phase inside the window: suppressed
        let second = detector.detect("Let me check one more thing");
        assert_eq!(second.phase, None);

        // a different phase reports immediately
        let third = detector.detect("running cargo test");
        assert_eq!(third.phase, Some(AgentPhase::Verification));
    }

    #[test]
    fn test_clean_chunk_strips_ansi() {
        let raw = b"\x1b[31mError:\x1b[0m boom";
        assert_eq!(clean_chunk(raw), "Error: boom");
    }
}
