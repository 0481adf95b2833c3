//! End-to-end pipeline scenarios with a scripted completion client,
//! real workspaces, and shell-stub checkers.

mod common;

use std::sync::Arc;

use tempfile::tempdir;
use uuid::Uuid;

use common::{
    analyze_response, body_of_lines, fixture, generation, implement_response, parse_response,
    passing_stages, sh, spec_response, MockCompletionClient,
};
use manifest::domain::models::{
    Attempt, AttemptStatus, FileAction, FileChange, Intent, IntentStatus, Judgment, Strategy,
};
use manifest::domain::ports::{Purpose, Store};
use manifest::services::{JudgmentOutcome, RunOutcome};

fn queue_compile(client: &MockCompletionClient, core: &str, assertions: usize) {
    client.queue(
        Purpose::Parse,
        parse_response(core, &["register works", "login works", "bcrypt used"], &[]),
    );
    client.queue(Purpose::Analyze, analyze_response());
    client.queue(Purpose::Spec, spec_response(assertions));
}

#[tokio::test]
async fn full_run_ranks_survivors_and_applies_the_accepted_one() {
    let project = tempdir().unwrap();
    let data = tempdir().unwrap();
    let client = Arc::new(MockCompletionClient::new());

    // Scenario: N=4 as {vanilla:2, minimal:1, defensive:1}; 3 attempts
    // pass every stage, one fails lint.
    queue_compile(&client, "add email/password authentication", 3);
    client.queue(
        Purpose::Implement,
        implement_response(&body_of_lines(2, "tiny"), "fewest lines possible", 0.5),
    );
    client.queue(
        Purpose::Implement,
        implement_response(&body_of_lines(10, "plain"), "straightforward", 0.5),
    );
    client.queue(
        Purpose::Implement,
        implement_response(&body_of_lines(30, "armored"), "validates everything", 0.5),
    );
    client.queue(
        Purpose::Implement,
        implement_response(
            &format!("{}// LINT_FAIL\n", body_of_lines(5, "sloppy")),
            "cut corners",
            0.5,
        ),
    );

    let fx = fixture(
        project.path(),
        data.path(),
        client,
        generation(&[("vanilla", 2), ("minimal", 1), ("defensive", 1)], 100.0, 0.10),
        passing_stages(),
    )
    .await;

    let outcome = fx
        .orchestrator
        .submit("add email/password authentication", Uuid::new_v4())
        .await
        .unwrap();

    let (intent_id, survivors) = match outcome {
        RunOutcome::AwaitingJudgment {
            intent_id,
            survivors,
        } => (intent_id, survivors),
        other => panic!("expected survivors, got {other:?}"),
    };

    // Three survivors with ranks forming 1..=3, all presented.
    assert_eq!(survivors.len(), 3);
    let mut ranks: Vec<u32> = survivors.iter().map(|s| s.rank).collect();
    ranks.sort();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert!(survivors.iter().all(|s| s.presented));
    assert!(survivors.iter().all(|s| s.score.in_unit_range()));

    // The smallest attempt outranks the defensive one at equal
    // assertion scores.
    let rank1 = survivors.iter().find(|s| s.rank == 1).unwrap();
    let winner = fx.store.get_attempt(rank1.attempt_id).await.unwrap().unwrap();
    assert_eq!(winner.changed_lines(), 3, "two fn lines plus marker");

    // The lint-failing attempt is recorded as failed, with lint named
    // in its first-failure summary.
    let spec = fx.store.latest_spec_for_intent(intent_id).await.unwrap().unwrap();
    let attempts = fx.store.list_attempts_for_spec(&spec.id, 1).await.unwrap();
    assert_eq!(attempts.len(), 4);
    let failed: Vec<_> = attempts
        .iter()
        .filter(|a| a.status == AttemptStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    let verification = fx
        .store
        .latest_verification_for_attempt(failed[0].id)
        .await
        .unwrap()
        .unwrap();
    assert!(verification.first_failure.as_deref().unwrap().starts_with("lint"));

    // Every workspace is gone once verification finished.
    let leftovers = std::fs::read_dir(&fx.workspaces_root).unwrap().count();
    assert_eq!(leftovers, 0);

    // The run summary covers assertions, per-strategy tallies, the
    // survivor table, and the aggregated failure.
    let summary = fx.orchestrator.report(intent_id).await.unwrap();
    assert_eq!(summary.spec_version, 1);
    assert_eq!(summary.assertions.len(), 3);
    let generated: usize = summary.attempts.values().map(|t| t.generated).sum();
    let passed: usize = summary.attempts.values().map(|t| t.passed).sum();
    let failed_count: usize = summary.attempts.values().map(|t| t.failed).sum();
    assert_eq!((generated, passed, failed_count), (4, 3, 1));
    assert_eq!(summary.survivors.len(), 3);
    assert_eq!(summary.survivors[0].rank, 1);
    assert_eq!(summary.failures.len(), 1);
    let rendered = summary.render();
    assert!(rendered.contains("Survivors: 3"));
    assert!(rendered.contains("Assertions: 3"));
    assert!(rendered.contains("lint"));

    // Accept the winner: changes land in the real tree, intent completes.
    let result = fx
        .orchestrator
        .handle_judgment(Judgment::accept(intent_id, rank1.id))
        .await
        .unwrap();
    assert!(matches!(result, JudgmentOutcome::Applied { .. }));
    let applied = std::fs::read_to_string(project.path().join("src/auth.rs")).unwrap();
    assert!(applied.contains("tiny"));

    let intent = fx.store.get_intent(intent_id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Complete);

    // Re-applying an accept on a completed intent is refused.
    let err = fx
        .orchestrator
        .handle_judgment(Judgment::accept(intent_id, rank1.id))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already complete"));
}

#[tokio::test]
async fn vague_intent_waits_for_clarification_then_continues() {
    let project = tempdir().unwrap();
    let data = tempdir().unwrap();
    let client = Arc::new(MockCompletionClient::new());

    // Scenario: "Make it better" parses into two open questions.
    client.queue(
        Purpose::Parse,
        parse_response(
            "make it better",
            &[],
            &["better in what way?", "which part of the system?"],
        ),
    );

    let fx = fixture(
        project.path(),
        data.path(),
        client.clone(),
        generation(&[("vanilla", 1)], 100.0, 0.10),
        passing_stages(),
    )
    .await;

    let outcome = fx
        .orchestrator
        .submit("Make it better", Uuid::new_v4())
        .await
        .unwrap();

    let (intent_id, questions) = match outcome {
        RunOutcome::Clarification {
            intent_id,
            questions,
        } => (intent_id, questions),
        other => panic!("expected clarification, got {other:?}"),
    };
    assert_eq!(questions.len(), 2);

    // The pipeline waited: clarifying status, no specification created.
    let intent = fx.store.get_intent(intent_id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Clarifying);
    assert!(fx
        .store
        .latest_spec_for_intent(intent_id)
        .await
        .unwrap()
        .is_none());

    // Supplying answers re-enters parsing and runs to judgment.
    queue_compile(&client, "speed up the search endpoint", 3);
    client.queue(
        Purpose::Implement,
        implement_response(&body_of_lines(4, "fix"), "cache results", 0.7),
    );

    let outcome = fx
        .orchestrator
        .supply_clarifications(
            intent_id,
            vec!["faster".into(), "the search endpoint".into()],
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::AwaitingJudgment { .. }));
}

#[tokio::test]
async fn contradictory_spec_yields_no_survivors_with_aggregated_reasons() {
    let project = tempdir().unwrap();
    let data = tempdir().unwrap();
    let client = Arc::new(MockCompletionClient::new());

    // Scenario: spec tests always fail; N=10.
    queue_compile(&client, "mutually impossible requirements", 3);
    for i in 0..10 {
        client.queue(
            Purpose::Implement,
            implement_response(&body_of_lines(3 + i, "doomed"), "try anyway", 0.5),
        );
    }

    let mut stages = passing_stages();
    stages.spec_tests = sh("echo 'error: requirements are contradictory' >&2; exit 1");

    let fx = fixture(
        project.path(),
        data.path(),
        client,
        generation(&[("vanilla", 10)], 100.0, 0.10),
        stages,
    )
    .await;

    let outcome = fx
        .orchestrator
        .submit("mutually impossible requirements", Uuid::new_v4())
        .await
        .unwrap();

    let report = match outcome {
        RunOutcome::NoSurvivors { report, .. } => report,
        other => panic!("expected no survivors, got {other:?}"),
    };

    // A first-class outcome, not an error: reasons aggregated (top 3 at
    // most) and an actionable suggestion present.
    assert!(!report.reasons.is_empty());
    assert!(report.reasons.len() <= 3);
    assert_eq!(report.reasons[0].1, 10, "all ten attempts share the reason");
    assert!(report.reasons[0].0.contains("contradictory"));
    assert!(!report.suggestion.is_empty());
}

#[tokio::test]
async fn cost_ceiling_caps_generation_mid_batch() {
    let project = tempdir().unwrap();
    let data = tempdir().unwrap();
    let client = Arc::new(MockCompletionClient::new());

    // Compilation takes 3 calls at $0.30; a $1.90 ceiling leaves head
    // room for at most 3 of the 10 requested implementation calls.
    queue_compile(&client, "add pagination", 3);
    for i in 0..10 {
        client.queue(
            Purpose::Implement,
            implement_response(&body_of_lines(2 + i, "paged"), "page it", 0.5),
        );
    }

    let fx = fixture(
        project.path(),
        data.path(),
        client,
        generation(&[("vanilla", 10)], 1.90, 0.30),
        passing_stages(),
    )
    .await;

    let outcome = fx
        .orchestrator
        .submit("add pagination", Uuid::new_v4())
        .await
        .unwrap();

    // The run still completes on the subset that fit under the ceiling.
    let (intent_id, survivors) = match outcome {
        RunOutcome::AwaitingJudgment {
            intent_id,
            survivors,
        } => (intent_id, survivors),
        other => panic!("expected survivors, got {other:?}"),
    };
    assert!(!survivors.is_empty());

    let spec = fx.store.latest_spec_for_intent(intent_id).await.unwrap().unwrap();
    let attempts = fx.store.list_attempts_for_spec(&spec.id, 1).await.unwrap();
    assert!(
        (1..=3).contains(&attempts.len()),
        "expected at most 3 attempts, got {}",
        attempts.len()
    );
}

#[tokio::test]
async fn refine_increments_spec_version_and_preserves_old_survivors() {
    let project = tempdir().unwrap();
    let data = tempdir().unwrap();
    let client = Arc::new(MockCompletionClient::new());

    // First cycle.
    queue_compile(&client, "add rate limiting to the API", 3);
    client.queue(
        Purpose::Implement,
        implement_response(&body_of_lines(5, "cycle-one"), "token bucket", 0.6),
    );

    let fx = fixture(
        project.path(),
        data.path(),
        client.clone(),
        generation(&[("vanilla", 1)], 100.0, 0.10),
        passing_stages(),
    )
    .await;

    let outcome = fx
        .orchestrator
        .submit("add rate limiting to the API", Uuid::new_v4())
        .await
        .unwrap();
    let intent_id = match outcome {
        RunOutcome::AwaitingJudgment { intent_id, .. } => intent_id,
        other => panic!("expected survivors, got {other:?}"),
    };

    let first_survivors = fx.store.list_survivors_for_intent(intent_id).await.unwrap();
    assert_eq!(first_survivors.len(), 1);
    assert!(first_survivors[0].presented);

    // Refinement: a new compile/generate/verify cycle at version 2.
    client.queue(Purpose::Analyze, analyze_response());
    client.queue(Purpose::Spec, spec_response(3));
    client.queue(
        Purpose::Implement,
        implement_response(&body_of_lines(6, "cycle-two"), "sliding window", 0.6),
    );

    let result = fx
        .orchestrator
        .handle_judgment(Judgment::refine(intent_id, "per-user limits, not global"))
        .await
        .unwrap();

    let survivors = match result {
        JudgmentOutcome::Continued(RunOutcome::AwaitingJudgment { survivors, .. }) => survivors,
        other => panic!("expected a new judgment round, got {other:?}"),
    };

    let spec = fx.store.latest_spec_for_intent(intent_id).await.unwrap().unwrap();
    assert_eq!(spec.version, 2, "refinement must increment the version");

    // The new round presents only version-2 attempts; the old survivor
    // stays in the store, presented but not reused.
    for survivor in &survivors {
        let attempt = fx.store.get_attempt(survivor.attempt_id).await.unwrap().unwrap();
        assert_eq!(attempt.spec_version, 2);
    }
    let all = fx.store.list_survivors_for_intent(intent_id).await.unwrap();
    assert_eq!(all.len(), 2, "both cycles' survivors persist");

    let intent = fx.store.get_intent(intent_id).await.unwrap().unwrap();
    assert_eq!(intent.refinement_count, 1);
    assert!(intent.raw_message.contains("per-user limits"));
}

#[tokio::test]
async fn restart_resumes_verifying_intent_and_sweeps_workspaces() {
    let project = tempdir().unwrap();
    let data = tempdir().unwrap();
    let client = Arc::new(MockCompletionClient::new());

    let fx = fixture(
        project.path(),
        data.path(),
        client,
        generation(&[("vanilla", 1)], 100.0, 0.10),
        passing_stages(),
    )
    .await;

    // Simulate the persisted state of a crash mid-verification: an
    // intent at `verifying`, its spec and pending attempts saved, and a
    // leftover workspace directory on disk.
    let mut intent = Intent::new(Uuid::new_v4(), "add exports");
    intent.status = IntentStatus::Verifying;
    fx.store.save_intent(&intent).await.unwrap();

    let spec = manifest::domain::models::Specification::new(
        "recovered-spec".into(),
        intent.id,
        1,
        vec![manifest::domain::models::Assertion::new(
            "exports work",
            "assert exports()",
            5,
        )],
        "// suite".into(),
        "fn export();".into(),
        ["src".to_string()].into(),
        Default::default(),
        vec![],
    )
    .unwrap();
    fx.store.save_spec(&spec).await.unwrap();

    for i in 0..2 {
        let attempt = Attempt::new(
            spec.id.clone(),
            1,
            Strategy::Vanilla,
            vec![FileChange {
                path: format!("src/export_{i}.rs"),
                action: FileAction::Create,
                content: Some(format!("fn export_{i}() {{}}")),
            }],
            "recovered",
            0.5,
        );
        fx.store.save_attempt(&attempt).await.unwrap();
    }

    std::fs::create_dir_all(fx.workspaces_root.join("attempt-stale")).unwrap();
    std::fs::write(fx.workspaces_root.join("attempt-stale/file"), "x").unwrap();

    // Restart: recovery re-runs the phase from its persisted inputs.
    let outcomes = fx.orchestrator.resume_all().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], RunOutcome::AwaitingJudgment { .. }));

    assert!(
        !fx.workspaces_root.join("attempt-stale").exists(),
        "orphan workspaces must be swept on restart"
    );
    let attempts = fx.store.list_attempts_for_spec(&spec.id, 1).await.unwrap();
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Passed));
}

#[tokio::test]
async fn abort_marks_the_intent_terminal() {
    let project = tempdir().unwrap();
    let data = tempdir().unwrap();
    let client = Arc::new(MockCompletionClient::new());
    client.queue(
        Purpose::Parse,
        parse_response("do something", &[], &["what exactly?"]),
    );

    let fx = fixture(
        project.path(),
        data.path(),
        client,
        generation(&[("vanilla", 1)], 100.0, 0.10),
        passing_stages(),
    )
    .await;

    let outcome = fx
        .orchestrator
        .submit("do something", Uuid::new_v4())
        .await
        .unwrap();
    let intent_id = match outcome {
        RunOutcome::Clarification { intent_id, .. } => intent_id,
        other => panic!("expected clarification, got {other:?}"),
    };

    fx.orchestrator.abort_intent(intent_id).await.unwrap();
    let intent = fx.store.get_intent(intent_id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Aborted);
    assert!(fx.orchestrator.unfinished().await.unwrap().is_empty());
}

#[tokio::test]
async fn redirect_aborts_current_and_starts_fresh_intent() {
    let project = tempdir().unwrap();
    let data = tempdir().unwrap();
    let client = Arc::new(MockCompletionClient::new());

    queue_compile(&client, "add csv export", 3);
    client.queue(
        Purpose::Implement,
        implement_response(&body_of_lines(4, "csv"), "serialize rows", 0.5),
    );

    let fx = fixture(
        project.path(),
        data.path(),
        client.clone(),
        generation(&[("vanilla", 1)], 100.0, 0.10),
        passing_stages(),
    )
    .await;

    let session_id = Uuid::new_v4();
    let outcome = fx.orchestrator.submit("add csv export", session_id).await.unwrap();
    let intent_id = match outcome {
        RunOutcome::AwaitingJudgment { intent_id, .. } => intent_id,
        other => panic!("expected survivors, got {other:?}"),
    };

    // Redirect: fresh intent in the same session, current one aborted.
    queue_compile(&client, "add json export instead", 3);
    client.queue(
        Purpose::Implement,
        implement_response(&body_of_lines(4, "json"), "serde to the rescue", 0.5),
    );

    let result = fx
        .orchestrator
        .handle_judgment(Judgment::redirect(intent_id, "add json export instead"))
        .await
        .unwrap();

    let new_intent_id = match result {
        JudgmentOutcome::Redirected { new_intent_id, .. } => new_intent_id,
        other => panic!("expected redirect, got {other:?}"),
    };
    assert_ne!(new_intent_id, intent_id);

    let old = fx.store.get_intent(intent_id).await.unwrap().unwrap();
    assert_eq!(old.status, IntentStatus::Aborted);

    let new = fx.store.get_intent(new_intent_id).await.unwrap().unwrap();
    assert_eq!(new.session_id, session_id);
    assert_eq!(new.status, IntentStatus::Judging);
}
