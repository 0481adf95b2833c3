//! Command-line interface.
//!
//! `run` drives a full pipeline and the interactive judgment loop;
//! `status`, `history`, `abort`, and `purge` operate on the store.
//! Exit code 0 means the command dispatched; non-zero is reserved for
//! startup failures.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::domain::models::{
    Decision, EventSender, IntentStatus, Judgment, ManifestConfig, PipelineEvent, Survivor,
};
use crate::domain::ports::Store;
use crate::infrastructure::ai::{AiGateway, HttpCompletionClient};
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::sqlite::{
    all_embedded_migrations, DatabaseConnection, Migrator, SqliteStore,
};
use crate::infrastructure::workspace::WorkspaceManager;
use crate::services::{
    ChangeApplier, CodebaseScanner, GenerationSwarm, IntentCompiler, JudgmentOutcome,
    Orchestrator, RankingEngine, RunOutcome, ScanFilters, VerificationHarness,
};

#[derive(Parser)]
#[command(name = "manifest", about = "Compile intent into verified code changes")]
pub struct Cli {
    /// Data directory (database, workspaces, logs, config.yaml).
    #[arg(long, default_value = ".manifest")]
    pub data_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline for a feature request.
    Run {
        /// The feature request, in plain language.
        message: String,
        /// Session to attach this intent to.
        #[arg(long)]
        session: Option<Uuid>,
    },
    /// Show the current phase and counters of unfinished intents.
    Status,
    /// List past intents.
    History {
        #[arg(long)]
        session: Option<Uuid>,
    },
    /// Cancel an unfinished intent.
    Abort {
        /// Intent to abort; defaults to the most recent unfinished one.
        #[arg(long)]
        intent: Option<Uuid>,
    },
    /// Delete a session's entire lineage from the store.
    Purge { session: Uuid },
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = ConfigLoader::load(&cli.data_dir)?;
    config.data_dir = cli.data_dir.clone();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir))?;
    let _log_guard = crate::infrastructure::logging::init(&config.logging, &config.logs_dir())?;

    let db = DatabaseConnection::new(
        &format!("sqlite://{}", config.database_path()),
        config.database.max_connections,
    )
    .await?;
    db.check_integrity().await?;
    Migrator::new(db.pool().clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await
        .context("schema migration failed")?;
    let store = Arc::new(SqliteStore::new(db.pool().clone()));

    match cli.command {
        Commands::Run { message, session } => {
            let session_id = session.unwrap_or_else(Uuid::new_v4);
            run_pipeline(store, config, message, session_id).await
        }
        Commands::Status => show_status(store.as_ref()).await,
        Commands::History { session } => show_history(store.as_ref(), session).await,
        Commands::Abort { intent } => abort_command(store, intent).await,
        Commands::Purge { session } => {
            let deleted = store.purge_session(session).await?;
            println!("Purged {deleted} intent(s) from session {session}");
            Ok(())
        }
    }
}

async fn build_orchestrator(
    store: Arc<SqliteStore>,
    config: ManifestConfig,
    events: EventSender,
) -> Result<Orchestrator<SqliteStore>> {
    let api_key = std::env::var("MANIFEST_API_KEY")
        .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
        .context("set MANIFEST_API_KEY or ANTHROPIC_API_KEY")?;

    let call_deadline = std::time::Duration::from_secs(config.ai.call_deadline_secs);
    let client = Arc::new(
        HttpCompletionClient::new(
            api_key,
            config.ai.base_url.clone(),
            config.ai.model.clone(),
            call_deadline,
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let gateway = Arc::new(AiGateway::new(
        client,
        &config.ai,
        config.generation.estimated_call_cost_usd,
    ));

    let project_root = std::env::current_dir()?;
    let scanner = CodebaseScanner::new(
        project_root.clone(),
        ScanFilters {
            exclude_dirs: config.workspace.exclude.clone(),
            max_file_bytes: config.workspace.max_file_bytes,
        },
    );
    let workspaces = Arc::new(
        WorkspaceManager::new(
            project_root.clone(),
            config.workspaces_dir(),
            config.workspace.clone(),
        )
        .await?,
    );
    workspaces.sweep_orphans().await?;

    let compiler = IntentCompiler::new(gateway.clone(), scanner, call_deadline);
    let swarm = GenerationSwarm::new(gateway.clone(), config.generation.clone(), call_deadline);
    let harness = Arc::new(VerificationHarness::new(
        workspaces.clone(),
        config.verification.clone(),
    ));
    let ranking =
        RankingEngine::new(config.ranking.clone()).with_gateway(gateway.clone(), call_deadline);
    let applier = ChangeApplier::new(project_root);

    Ok(Orchestrator::new(
        store, compiler, swarm, harness, ranking, applier, workspaces, config, events,
    ))
}

async fn run_pipeline(
    store: Arc<SqliteStore>,
    config: ManifestConfig,
    message: String,
    session_id: Uuid,
) -> Result<()> {
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    let orchestrator =
        build_orchestrator(store.clone(), config, EventSender::new(events_tx)).await?;
    orchestrator.resume_all().await?;

    let mut outcome = orchestrator.submit(message, session_id).await?;

    loop {
        match outcome {
            RunOutcome::Clarification {
                intent_id,
                questions,
            } => {
                println!("\n{}", "Clarification needed:".yellow().bold());
                for (i, q) in questions.iter().enumerate() {
                    println!("  {}. {q}", i + 1);
                }
                let mut answers = Vec::new();
                for q in &questions {
                    println!("{} {q}", ">".cyan());
                    answers.push(read_line().await?);
                }
                outcome = orchestrator.supply_clarifications(intent_id, answers).await?;
            }
            RunOutcome::AwaitingJudgment {
                intent_id,
                ref survivors,
            } => {
                let report = orchestrator.report(intent_id).await?;
                println!("\n{}", report.render().green());
                match prompt_judgment(intent_id, &survivors).await? {
                    Some(judgment) => {
                        match orchestrator.handle_judgment(judgment).await? {
                            JudgmentOutcome::Applied { .. } => {
                                println!("{}", "Accepted and applied.".green().bold());
                                break;
                            }
                            JudgmentOutcome::Continued(next) => outcome = next,
                            JudgmentOutcome::Redirected { outcome: next, .. } => outcome = next,
                            JudgmentOutcome::Aborted { .. } => {
                                println!("{}", "Aborted.".red());
                                break;
                            }
                        }
                    }
                    None => continue,
                }
            }
            RunOutcome::NoSurvivors { ref report, intent_id } => {
                let summary = orchestrator.report(intent_id).await?;
                println!("\n{}", summary.render().yellow());
                println!("{}", report.suggestion.yellow());
                println!("refine <text> to try again, or abort:");
                match prompt_judgment(intent_id, &[]).await? {
                    Some(judgment) => match orchestrator.handle_judgment(judgment).await? {
                        JudgmentOutcome::Continued(next) => outcome = next,
                        _ => break,
                    },
                    None => continue,
                }
            }
            RunOutcome::Failed {
                phase, reason, ..
            } => {
                println!(
                    "\n{} phase {}: {}",
                    "Pipeline failed in".red().bold(),
                    phase.to_string().bold(),
                    reason
                );
                break;
            }
            RunOutcome::Aborted { .. } => {
                println!("{}", "Aborted.".red());
                break;
            }
        }
    }

    printer.abort();
    Ok(())
}

async fn prompt_judgment(intent_id: Uuid, survivors: &[Survivor]) -> Result<Option<Judgment>> {
    println!(
        "\n{} accept <rank> | refine <text> | redirect <text> | abort",
        "Judgment:".bold()
    );
    let line = read_line().await?;
    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line.as_str(), ""),
    };

    let judgment = match Decision::from_str(verb) {
        Some(Decision::Accept) => {
            let rank: u32 = rest.parse().unwrap_or(1);
            match survivors.iter().find(|s| s.rank == rank) {
                Some(survivor) => Judgment::accept(intent_id, survivor.id),
                None => {
                    println!("no survivor with rank {rank}");
                    return Ok(None);
                }
            }
        }
        Some(Decision::Refine) if !rest.is_empty() => Judgment::refine(intent_id, rest),
        Some(Decision::Redirect) if !rest.is_empty() => Judgment::redirect(intent_id, rest),
        Some(Decision::Abort) => Judgment::abort(intent_id),
        _ => {
            println!("unrecognized judgment");
            return Ok(None);
        }
    };
    Ok(Some(judgment))
}

async fn show_status(store: &dyn Store) -> Result<()> {
    let unfinished = store.list_unfinished_intents().await?;
    if unfinished.is_empty() {
        println!("No unfinished intents.");
        return Ok(());
    }
    for intent in unfinished {
        println!(
            "{}  {}  refinements: {}  {}",
            intent.id,
            intent.status.to_string().yellow(),
            intent.refinement_count,
            first_line(&intent.raw_message),
        );
    }
    Ok(())
}

async fn show_history(store: &dyn Store, session: Option<Uuid>) -> Result<()> {
    let intents = match session {
        Some(session_id) => store.list_intents_by_session(session_id).await?,
        None => {
            let mut all = store.list_unfinished_intents().await?;
            all.sort_by_key(|i| i.created_at);
            all
        }
    };
    if intents.is_empty() {
        println!("No intents found.");
        return Ok(());
    }
    for intent in intents {
        println!(
            "{}  {}  {}  {}",
            intent.created_at.format("%Y-%m-%d %H:%M"),
            intent.id,
            intent.status,
            first_line(&intent.raw_message),
        );
    }
    Ok(())
}

async fn abort_command(store: Arc<SqliteStore>, intent: Option<Uuid>) -> Result<()> {
    let target = match intent {
        Some(id) => id,
        None => {
            let unfinished = store.list_unfinished_intents().await?;
            match unfinished.last() {
                Some(intent) => intent.id,
                None => bail!("no unfinished intent to abort"),
            }
        }
    };

    let mut intent = store
        .get_intent(target)
        .await?
        .with_context(|| format!("no intent {target}"))?;
    if intent.status.is_terminal() {
        bail!("intent {target} is already {}", intent.status);
    }
    intent.status = IntentStatus::Aborted;
    store.update_intent(&intent).await?;
    println!("Aborted {target}");
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::PhaseStarted { phase, .. } => {
            println!("{} {phase}", "phase".dimmed());
        }
        PipelineEvent::AttemptGenerated { strategy, .. } => {
            println!("{} attempt generated ({strategy})", "  +".green());
        }
        PipelineEvent::AttemptDiscarded { strategy, reason } => {
            println!("{} attempt discarded ({strategy}): {reason}", "  -".red());
        }
        PipelineEvent::VerificationFinished {
            passed,
            first_failure,
            ..
        } => {
            if *passed {
                println!("{} verification passed", "  ✓".green());
            } else {
                println!(
                    "{} verification failed: {}",
                    "  ✗".red(),
                    first_failure.as_deref().unwrap_or("unknown")
                );
            }
        }
        PipelineEvent::CostCeilingReached { spent_usd, .. } => {
            println!(
                "{} cost ceiling reached (${spent_usd:.2}); draining",
                "  !".yellow()
            );
        }
        PipelineEvent::SurvivorsRanked { count, .. } => {
            println!("{} {count} survivor(s) ranked", "  »".cyan());
        }
        PipelineEvent::LowDiversity { .. } => {
            println!(
                "{} all attempts converged to identical content",
                "  !".yellow()
            );
        }
        PipelineEvent::RefinementLoopWarning { count, .. } => {
            println!(
                "{} {count} refinements on this intent; consider redirecting",
                "  !".yellow()
            );
        }
        _ => {}
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

async fn read_line() -> Result<String> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_command_takes_message() {
        let cli = Cli::parse_from(["manifest", "run", "add auth"]);
        match cli.command {
            Commands::Run { message, session } => {
                assert_eq!(message, "add auth");
                assert!(session.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn first_line_truncates() {
        assert_eq!(first_line("one\ntwo"), "one");
    }
}
