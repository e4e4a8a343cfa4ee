//! Assistant settings plumbing for worktrees.
//!
//! Each worktree gets the source checkout's `.claude/settings.local.json`
//! deep-merged with a generated per-bead hook configuration, plus a context
//! skill file naming the bead. When a branch merges back, permission grants
//! the agent accumulated in its worktree are unioned into the project
//! settings (hooks stay bead-specific and are never carried back).

use crate::Result;
use serde_json::{Map, Value, json};
use std::path::Path;

const SETTINGS_REL: &str = ".claude/settings.local.json";
const SKILL_REL: &str = ".claude/skills/local/worktree-context.skill.md";

/// Keys that only make sense inside one bead's worktree.
const BEAD_SPECIFIC_KEYS: [&str; 1] = ["hooks"];

/// Install per-bead assistant settings into a fresh worktree.
pub(crate) fn install_bead_settings(
    source: &Path,
    worktree: &Path,
    project: &Path,
    bead_id: &str,
) -> Result<()> {
    let base = read_settings(&source.join(SETTINGS_REL));
    let merged = deep_merge(base, bead_hooks(bead_id, worktree, project));

    let target = worktree.join(SETTINGS_REL);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, serde_json::to_string_pretty(&merged)? + "\n")?;

    write_context_skill(worktree, bead_id)?;
    Ok(())
}

/// Union the agent's accumulated permission-like settings back into the
/// project. Arrays are unioned (deduplicated by full JSON equality),
/// missing fields are filled in, existing scalars are left untouched, and
/// bead-specific keys never travel.
pub(crate) fn merge_settings_back(worktree: &Path, project: &Path) -> Result<()> {
    let worktree_settings = read_settings(&worktree.join(SETTINGS_REL));
    let Value::Object(from) = worktree_settings else {
        return Ok(());
    };

    let project_file = project.join(SETTINGS_REL);
    let mut into = read_settings(&project_file);
    let Value::Object(ref mut into_map) = into else {
        return Ok(());
    };

    for (key, value) in from {
        if BEAD_SPECIFIC_KEYS.contains(&key.as_str()) {
            continue;
        }
        union_into(into_map, key, value);
    }

    if let Some(parent) = project_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&project_file, serde_json::to_string_pretty(&into)? + "\n")?;
    Ok(())
}

fn read_settings(path: &Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| json!({}))
}

/// Merge `overlay` onto `base`: objects recurse, everything else is
/// replaced by the overlay.
pub(crate) fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

fn union_into(into: &mut Map<String, Value>, key: String, value: Value) {
    match (into.get_mut(&key), value) {
        (Some(Value::Array(existing)), Value::Array(incoming)) => {
            for item in incoming {
                if !existing.contains(&item) {
                    existing.push(item);
                }
            }
        }
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (nested_key, nested_value) in incoming {
                union_into(existing, nested_key, nested_value);
            }
        }
        (Some(_), _) => {} // existing scalar wins
        (None, value) => {
            into.insert(key, value);
        }
    }
}

/// Hook configuration that reports agent lifecycle into tmux session
/// options, keyed by the bead's session name.
fn bead_hooks(bead_id: &str, worktree: &Path, project: &Path) -> Value {
    let set = |key: &str, value: &str| {
        format!("tmux set-option -t {bead_id} {key} {value} 2>/dev/null || true")
    };
    let command_hook = |command: String| {
        json!([{ "hooks": [{ "type": "command", "command": command }] }])
    };

    json!({
        "hooks": {
            "SessionStart": command_hook(format!(
                "{}; {}",
                set("@az_worktree", &shell_quote(&worktree.to_string_lossy())),
                set("@az_project", &shell_quote(&project.to_string_lossy())),
            )),
            "UserPromptSubmit": command_hook(set("@az_status", "busy")),
            "PreToolUse": command_hook(set("@az_status", "busy")),
            "Notification": command_hook(set("@az_status", "waiting")),
            "Stop": command_hook(set("@az_status", "idle")),
        }
    })
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn write_context_skill(worktree: &Path, bead_id: &str) -> Result<()> {
    let path = worktree.join(SKILL_REL);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = format!(
        "---\nname: worktree-context\ndescription: Context for this isolated worktree\n---\n\n\
         This checkout is an isolated worktree for bead `{bead_id}`.\n\n\
         - The branch name is `{bead_id}`; do not switch branches.\n\
         - Track progress with `bd update {bead_id}` and close with `bd close {bead_id}`.\n\
         - The orchestrator merges this branch back when the work is done.\n"
    );
    std::fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_deep_merge_recurses_objects() {
        let base = json!({"permissions": {"allow": ["Bash(ls)"]}, "model": "sonnet"});
        let overlay = json!({"permissions": {"deny": ["Bash(rm)"]}, "hooks": {"Stop": []}});
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["permissions"]["allow"], json!(["Bash(ls)"]));
        assert_eq!(merged["permissions"]["deny"], json!(["Bash(rm)"]));
        assert_eq!(merged["model"], "sonnet");
        assert!(merged["hooks"].is_object());
    }

    #[test]
    fn test_deep_merge_overlay_wins_on_scalars() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": 2}));
        assert_eq!(merged["a"], 2);
    }

    #[test]
    fn test_bead_hooks_name_the_session() {
        let hooks = bead_hooks("az-1", &PathBuf::from("/w"), &PathBuf::from("/p"));
        let text = hooks.to_string();
        assert!(text.contains("-t az-1 @az_status busy"));
        assert!(text.contains("@az_worktree"));
        assert!(text.contains("@az_project"));
    }

    #[test]
    fn test_settings_round_trip_and_merge_back() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("project");
        let worktree = dir.path().join("project-az-1");
        std::fs::create_dir_all(source.join(".claude")).unwrap();
        std::fs::write(
            source.join(SETTINGS_REL),
            r#"{"permissions": {"allow": ["Bash(ls)"]}}"#,
        )
        .unwrap();

        install_bead_settings(&source, &worktree, &source, "az-1").unwrap();

        let installed: Value = serde_json::from_str(
            &std::fs::read_to_string(worktree.join(SETTINGS_REL)).unwrap(),
        )
        .unwrap();
        assert_eq!(installed["permissions"]["allow"], json!(["Bash(ls)"]));
        assert!(installed["hooks"].is_object());
        assert!(worktree.join(SKILL_REL).exists());
        let skill = std::fs::read_to_string(worktree.join(SKILL_REL)).unwrap();
        assert!(skill.contains("az-1"));

        // the agent accrues a permission in its worktree
        let mut grown = installed;
        grown["permissions"]["allow"]
            .as_array_mut()
            .unwrap()
            .push(json!("Bash(cargo test)"));
        std::fs::write(
            worktree.join(SETTINGS_REL),
            serde_json::to_string(&grown).unwrap(),
        )
        .unwrap();

        merge_settings_back(&worktree, &source).unwrap();

        let project: Value = serde_json::from_str(
            &std::fs::read_to_string(source.join(SETTINGS_REL)).unwrap(),
        )
        .unwrap();
        let allow = project["permissions"]["allow"].as_array().unwrap();
        assert!(allow.contains(&json!("Bash(ls)")));
        assert!(allow.contains(&json!("Bash(cargo test)")));
        // no duplicates and no hooks carried back
        assert_eq!(
            allow.iter().filter(|v| **v == json!("Bash(ls)")).count(),
            1
        );
        assert!(project.get("hooks").is_none());
    }
}
