use anyhow::Result;
use azedarach::cli::{Cli, Commands};
use azedarach::config::AppConfig;
use azedarach::detect::{CombinedDetector, clean_chunk};
use azedarach::hooks::HookReceiver;
use azedarach::lock::FileLockManager;
use azedarach::merge::{MergeEngine, MergeToMainOptions};
use azedarach::multiplexer::{Multiplexer, TmuxMultiplexer};
use azedarach::session::{SessionManager, StartSessionOptions};
use azedarach::telemetry::Telemetry;
use azedarach::tracker::{IssueTracker, TrackerClient};
use azedarach::worktree::WorktreeManager;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("azedarach=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let project = cli
        .project
        .unwrap_or_else(|| PathBuf::from("."))
        .canonicalize()?;
    let config = AppConfig::default();

    let worktrees = Arc::new(WorktreeManager::new());
    let tracker: Arc<dyn IssueTracker> = Arc::new(TrackerClient::new(&project));
    let multiplexer: Arc<dyn Multiplexer> = Arc::new(TmuxMultiplexer::new());
    let locks = FileLockManager::new();
    let telemetry = match Telemetry::open(&project) {
        Ok(telemetry) => Some(Arc::new(telemetry)),
        Err(e) => {
            tracing::warn!("telemetry disabled: {}", e);
            None
        }
    };
    let sessions = Arc::new(SessionManager::new(
        worktrees.clone(),
        tracker.clone(),
        multiplexer.clone(),
        locks.clone(),
        telemetry.clone(),
        &config,
    ));
    let engine = MergeEngine::new(
        worktrees.clone(),
        sessions.clone(),
        tracker.clone(),
        multiplexer.clone(),
        locks,
        telemetry.clone(),
        &config,
    );

    match cli.command {
        Commands::Start { bead, branch, prompt } => {
            let mut options = StartSessionOptions::new(&bead, &project);
            options.base_branch = branch;
            options.initial_prompt = prompt;
            let session = sessions.start(&options).await?;
            println!("Started {bead}");
            println!("  Worktree: {}", session.worktree_path.display());
            println!("  Session:  {}", session.multiplexer_session_name);
            println!(
                "Attach with: tmux attach -t {}",
                session.multiplexer_session_name
            );
        }

        Commands::Stop { bead } => {
            sessions.stop(&bead).await?;
            println!("Stopped {bead}");
        }

        Commands::Pause { bead } => {
            sessions.pause(&bead).await?;
            println!("Paused {bead} (worktree checkpointed)");
        }

        Commands::Resume { bead } => {
            sessions.resume(&bead).await?;
            println!("Resumed {bead}. Reattach with: tmux attach -t {bead}");
        }

        Commands::List { verbose } => {
            let active = sessions.list_active(&project).await?;
            if active.is_empty() {
                println!("No active agent sessions");
            } else {
                println!("Active agent sessions:");
                for session in &active {
                    if verbose {
                        println!(
                            "  {} [{}] {} (started {})",
                            session.bead_id,
                            session.state,
                            session.worktree_path.display(),
                            session.started_at.format("%H:%M:%S")
                        );
                    } else {
                        println!("  {} [{}]", session.bead_id, session.state);
                    }
                }
            }
        }

        Commands::Merge { bead, base, push, check } => {
            if check {
                let prediction = engine
                    .check_merge_conflicts(&bead, &project, base.as_deref())
                    .await?;
                if prediction.has_conflicts() {
                    println!("Conflicts predicted for {bead}:");
                    for file in &prediction.conflicts {
                        println!("  {file}");
                    }
                } else {
                    println!(
                        "No conflicts predicted for {bead} ({} base-side, {} branch-side changes)",
                        prediction.base_changed, prediction.branch_changed
                    );
                }
                return Ok(());
            }

            let mut options = MergeToMainOptions::new(&bead, &project);
            options.base_branch = base;
            if push {
                options.push_to_origin = Some(true);
            }
            let outcome = engine.merge_to_main(&options).await?;
            println!("Merged {bead}");
            if outcome.fix_attempts > 0 {
                println!("  ({} auto-fix round(s) applied)", outcome.fix_attempts);
            }
            if outcome.pushed {
                println!("  Pushed to origin");
            }
            if let Some(push_error) = outcome.push_error {
                println!("  Push failed: {push_error}");
            }
        }

        Commands::Update { bead, base, stash } => {
            if stash {
                engine
                    .merge_main_into_branch(&bead, &project, base.as_deref())
                    .await?;
            } else {
                engine
                    .update_from_base(&bead, &project, base.as_deref())
                    .await?;
            }
            println!("Updated {bead} from base");
        }

        Commands::AbortMerge { bead } => {
            engine.abort_merge(&bead, &project).await?;
            println!("Aborted merge in {bead}");
        }

        Commands::Status { bead } => {
            let active = sessions.list_active(&project).await?;
            let mut shown = false;
            for session in active {
                if bead.as_deref().is_some_and(|b| b != session.bead_id) {
                    continue;
                }
                shown = true;
                let pane = multiplexer
                    .capture_pane(&session.multiplexer_session_name, 40)
                    .await;
                match pane {
                    Ok(raw) => {
                        let chunk = clean_chunk(raw.as_bytes());
                        let mut detector = CombinedDetector::new();
                        let detection = detector.detect(&chunk);
                        let inferred = detection
                            .state
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        let phase = detection
                            .phase
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{} [{}] inferred={} phase={}",
                            session.bead_id, session.state, inferred, phase
                        );
                    }
                    Err(e) => {
                        println!("{} [{}] (no pane: {e})", session.bead_id, session.state);
                    }
                }
            }
            if !shown {
                println!("No matching sessions");
            }
        }

        Commands::Watch => {
            let receiver = HookReceiver::new(multiplexer.clone(), "", telemetry.clone());
            let (poller, mut updates) = receiver.spawn();
            println!("Watching hook updates (Ctrl-C to stop)...");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    update = updates.recv() => {
                        let Some(update) = update else { break };
                        sessions.apply_hook_update(&update);
                        println!(
                            "{} -> {:?} (session {})",
                            update.bead_id, update.status, update.session_name
                        );
                    }
                }
            }
            poller.abort();
        }

        Commands::Ready => {
            let issues = tracker.ready(None).await?;
            if issues.is_empty() {
                println!("No ready issues");
            } else {
                for issue in issues {
                    println!(
                        "  {} [p{}] {} ({})",
                        issue.id,
                        issue.priority,
                        issue.title,
                        issue.status.as_str()
                    );
                }
            }
        }
    }

    Ok(())
}
