// Integration tests for the implementation loop: success, stuck, feedback and cancel paths

mod common;

use autopilot_lib::commands::{
    get_implementation_feedback, get_implementation_file_operations,
    get_implementation_iterations, get_task_activity, submit_implementation_feedback,
};
use autopilot_lib::file_storage::ImplementationStore;
use autopilot_lib::implementation::{
    ImplementationRunner, SubmitFeedbackRequest, FEEDBACK_TIMEOUT_REASON,
    MALFORMED_RESPONSE_REASON, MAX_ITERATIONS_REASON,
};
use autopilot_lib::models::{
    ActivityAction, FeedbackType, FileOperationKind, SessionStage, SessionStatus,
};
use common::*;
use serde_json::json;
use std::sync::atomic::Ordering;

fn feedback(session_id: &str, feedback_type: FeedbackType, content: &str) -> SubmitFeedbackRequest {
    SubmitFeedbackRequest {
        session_id: session_id.to_string(),
        feedback_type,
        content: content.to_string(),
        created_by: "bob".to_string(),
        iteration_id: None,
    }
}

#[tokio::test]
async fn test_succeeds_on_fourth_iteration_and_opens_pr() {
    let h = Harness::new();
    for _ in 0..3 {
        h.llm.push_text(partial_response());
    }
    h.llm.push_text(passing_response(0.85));

    let started = h.start(10).await;
    assert_eq!(started.status, SessionStatus::Initializing);
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Succeeded);
    assert_eq!(session.stage, SessionStage::Completed);
    assert_eq!(session.current_iteration, 4);
    assert_eq!(session.total_files_changed, 4);
    assert_eq!(session.pr_number, Some(42));
    assert!(session.error_message.is_none());
    assert!(session.completed_at.is_some());
    assert!(h.host.has_branch(&session.implementation_branch));

    let iterations = get_implementation_iterations(started.id.clone(), &h.manager).unwrap();
    let numbers: Vec<u32> = iterations.iter().map(|i| i.iteration_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(iterations[0].criteria_total, 3);
    assert_eq!(iterations[0].criteria_passed, 2);
    let last = iterations[3].verification_results.as_ref().unwrap();
    assert!(last.all_passed);
    assert!((last.confidence - 0.85).abs() < f64::EPSILON);
    assert!(iterations.iter().all(|i| i.completed_at.is_some()));
    assert!(iterations.iter().all(|i| i.commit_sha.is_some()));

    let prs = h.host.pull_requests();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].title, "[AI] Add health endpoint");
    assert_eq!(prs[0].head, session.implementation_branch);
    assert_eq!(prs[0].base, "main");
    assert!(prs[0].draft);
    assert!(prs[0].body.contains("- [x] GET /health returns 200"));
    assert_eq!(h.host.commits().len(), 4);

    let actions: Vec<ActivityAction> = get_task_activity(TASK_ID.to_string(), &h.manager)
        .unwrap()
        .into_iter()
        .map(|a| a.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            ActivityAction::ImplementationStarted,
            ActivityAction::ImplementationCompleted
        ]
    );
}

#[tokio::test]
async fn test_previous_attempts_are_shown_to_the_model() {
    let h = Harness::new();
    h.llm.push_text(partial_response());
    h.llm.push_text(passing_response(0.9));

    let started = h.start(5).await;
    h.wait_idle(&started.id).await;

    let prompts = h.llm.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains(CRITERIA[2]));
    assert!(prompts[1].contains("Endpoint has a unit test"));
    assert!(prompts[1].contains("README.md"));
}

#[tokio::test]
async fn test_malformed_first_response_gets_stuck() {
    let h = Harness::new();
    h.llm
        .push_text("I think we should start by reading the router.".to_string());
    h.llm.push_text(passing_response(0.95));

    let started = h.start(10).await;
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Stuck);
    assert!(session
        .stuck_reason
        .as_deref()
        .unwrap()
        .contains("not in expected format"));
    assert_eq!(h.llm.calls(), 1);

    let iterations = h.store.list_iterations(&started.id).unwrap();
    assert_eq!(iterations.len(), 1);
    assert!(iterations[0]
        .blocked_reason
        .as_deref()
        .unwrap()
        .starts_with(MALFORMED_RESPONSE_REASON));
    assert!(iterations[0].response_received.is_some());
    assert!(h.host.commits().is_empty());
}

#[tokio::test]
async fn test_low_confidence_runs_out_of_iterations() {
    let h = Harness::new();
    h.llm.push_text(passing_response(0.7));
    h.llm.push_text(passing_response(0.79));

    let started = h.start(2).await;
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Stuck);
    assert_eq!(session.stuck_reason.as_deref(), Some(MAX_ITERATIONS_REASON));
    assert_eq!(session.current_iteration, 2);
    assert!(session.current_iteration <= session.max_iterations);
    assert!(h.host.pull_requests().is_empty());
}

#[tokio::test]
async fn test_guidance_resumes_waiting_session() {
    let h = Harness::new();
    h.llm
        .push_text(needs_input_response("Which port should the endpoint use?"));
    h.llm.push_text(passing_response(0.9));

    let started = h.start(10).await;
    h.wait_for_status(&started.id, SessionStatus::WaitingFeedback)
        .await;
    let waiting = h.session(&started.id);
    assert_eq!(
        waiting.stuck_reason.as_deref(),
        Some("Which port should the endpoint use?")
    );
    assert_eq!(waiting.stage, SessionStage::WaitingFeedback);

    submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Guidance, "Use port 8080"),
        &h.manager,
    )
    .await
    .unwrap();
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Succeeded);
    assert_eq!(session.current_iteration, 2);

    let iterations = h.store.list_iterations(&started.id).unwrap();
    assert!(iterations[0].needs_human_input);
    assert!(iterations[0].commit_sha.is_none());
    assert!(h.llm.prompts()[1].contains("Use port 8080"));
}

#[tokio::test]
async fn test_feedback_wait_times_out_to_stuck() {
    let mut config = fast_config();
    config.loop_settings.feedback_timeout_secs = 0;
    let h = Harness::with_config(config);
    h.llm.push_text(needs_input_response("Need the API key name"));

    let started = h.start(10).await;
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Stuck);
    assert_eq!(session.stuck_reason.as_deref(), Some(FEEDBACK_TIMEOUT_REASON));
    assert!(FEEDBACK_TIMEOUT_REASON.contains("timed out"));
    assert_eq!(h.llm.calls(), 1);

    let activity = h.store.list_activity(TASK_ID).unwrap();
    assert_eq!(
        activity.last().map(|a| a.action),
        Some(ActivityAction::ImplementationStuck)
    );
}

#[tokio::test]
async fn test_abort_while_waiting_cancels() {
    let h = Harness::new();
    h.llm.push_text(needs_input_response("Unclear requirement"));
    h.llm.push_text(passing_response(0.9));

    let started = h.start(10).await;
    h.wait_for_status(&started.id, SessionStatus::WaitingFeedback)
        .await;

    submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Abort, "not needed anymore"),
        &h.manager,
    )
    .await
    .unwrap();
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(session.current_iteration, 1);
    assert_eq!(h.store.list_iterations(&started.id).unwrap().len(), 1);
    assert_eq!(h.llm.calls(), 1);

    let stored = get_implementation_feedback(started.id.clone(), &h.manager).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].feedback_type, FeedbackType::Abort);
}

#[tokio::test]
async fn test_approval_while_stuck_opens_pr() {
    let h = Harness::new();
    h.llm.push_text("no json here".to_string());

    let started = h.start(10).await;
    h.wait_idle(&started.id).await;
    assert_eq!(h.session(&started.id).status, SessionStatus::Stuck);

    submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Approval, "good enough"),
        &h.manager,
    )
    .await
    .unwrap();
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Succeeded);
    assert_eq!(session.stage, SessionStage::Completed);
    assert!(session.pr_url.is_some());
    let prs = h.host.pull_requests();
    assert_eq!(prs.len(), 1);
    assert!(prs[0].body.contains("approved"));
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test]
async fn test_pr_failure_keeps_success() {
    let h = Harness::new();
    h.host.fail_pull_requests.store(true, Ordering::SeqCst);
    h.llm.push_text(passing_response(0.9));

    let started = h.start(10).await;
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Succeeded);
    assert!(session.pr_number.is_none());
    assert!(session
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Pull request creation failed"));
}

#[tokio::test]
async fn test_stalled_llm_call_gets_stuck() {
    let mut config = fast_config();
    config.llm.timeout_secs = 1;
    let h = Harness::with_config(config);
    h.llm
        .push(Scripted::Stall(std::time::Duration::from_secs(10)));

    let started = h.start(10).await;
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Stuck);
    assert!(session
        .stuck_reason
        .as_deref()
        .unwrap()
        .starts_with("stalled call"));
}

#[tokio::test]
async fn test_llm_error_fails_session() {
    let h = Harness::new();
    h.llm.push(Scripted::Fail);

    let started = h.start(10).await;
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.error_message.as_deref().unwrap().contains("overloaded"));

    let iterations = h.store.list_iterations(&started.id).unwrap();
    assert_eq!(iterations.len(), 1);
    assert!(iterations[0].completed_at.is_some());

    let activity = h.store.list_activity(TASK_ID).unwrap();
    assert_eq!(
        activity.last().map(|a| a.action),
        Some(ActivityAction::ImplementationFailed)
    );
}

#[tokio::test]
async fn test_missing_task_fails_session() {
    let h = Harness::new();
    let started = autopilot_lib::commands::start_implementation(
        autopilot_lib::commands::StartImplementationRequest {
            task_id: "task-missing".to_string(),
            repository_id: REPO_ID.to_string(),
            started_by: "alice".to_string(),
            max_iterations: None,
            source_branch: Some("develop".to_string()),
        },
        &h.manager,
    )
    .await
    .unwrap();
    assert_eq!(started.source_branch, "develop");
    assert_eq!(started.max_iterations, 10);
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session
        .error_message
        .as_deref()
        .unwrap()
        .contains("Task not found"));
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn test_terminal_session_is_idempotent() {
    let h = Harness::new();
    h.llm.push_text(passing_response(0.9));
    h.llm.push_text(passing_response(0.9));

    let started = h.start(10).await;
    h.wait_idle(&started.id).await;
    assert_eq!(h.session(&started.id).status, SessionStatus::Succeeded);

    let runner = ImplementationRunner::new(
        h.store.clone(),
        h.host.clone(),
        h.llm.clone(),
        fast_config(),
    );
    runner.run(&started.id).await;

    assert_eq!(h.store.list_iterations(&started.id).unwrap().len(), 1);
    assert_eq!(h.llm.calls(), 1);
    assert_eq!(h.host.pull_requests().len(), 1);

    let err = submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Guidance, "one more thing"),
        &h.manager,
    )
    .await
    .unwrap_err();
    assert!(err.contains("not accepting feedback"));
}

#[tokio::test]
async fn test_changes_are_snapshotted_and_committed_together() {
    let host = FakeHost::with_files(&[
        ("README.md", "# Widgets\n"),
        ("src/old.rs", "pub fn old() {}\n"),
    ]);
    let h = Harness::with_host(fast_config(), host);
    let response = json!({
        "changes": [
            { "path": "src/health.rs", "operation": "create", "content": "pub fn health() {}\n" },
            { "path": "README.md", "operation": "update", "content": "# Widgets\n\nHas /health\n" },
            { "path": "src/new.rs", "operation": "rename", "previousPath": "src/old.rs" }
        ],
        "commitMessage": "Add health endpoint and move old module",
        "selfCheck": { "criteria": [], "allPassed": true, "confidence": 0.9 }
    });
    h.llm.push_text(format!("```json\n{}\n```", response));

    let started = h.start(3).await;
    h.wait_idle(&started.id).await;
    assert_eq!(h.session(&started.id).total_files_changed, 3);

    let commits = h.host.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].message, "Add health endpoint and move old module");
    assert_eq!(commits[0].files.len(), 4);
    assert_eq!(h.host.file("src/new.rs").as_deref(), Some("pub fn old() {}\n"));
    assert!(h.host.file("src/old.rs").is_none());

    let operations = get_implementation_file_operations(started.id.clone(), &h.manager).unwrap();
    assert_eq!(operations.len(), 3);
    let create = operations.iter().find(|o| o.file_path == "src/health.rs").unwrap();
    assert_eq!(create.operation, FileOperationKind::Create);
    assert!(create.before_content.is_none());
    let update = operations.iter().find(|o| o.file_path == "README.md").unwrap();
    assert_eq!(update.before_content.as_deref(), Some("# Widgets\n"));
    let rename = operations.iter().find(|o| o.file_path == "src/new.rs").unwrap();
    assert_eq!(rename.previous_path.as_deref(), Some("src/old.rs"));
    assert_eq!(rename.before_content.as_deref(), Some("pub fn old() {}\n"));

    let iteration = &h.store.list_iterations(&started.id).unwrap()[0];
    assert_eq!(iteration.changes_made.len(), 3);
    assert_eq!(iteration.commit_sha.as_deref(), Some("sha-1"));
}

#[tokio::test]
async fn test_only_one_runner_per_session() {
    let h = Harness::new();
    h.llm.push_text(needs_input_response("Pick a framework"));

    let started = h.start(10).await;
    h.wait_for_status(&started.id, SessionStatus::WaitingFeedback)
        .await;
    assert!(h.manager.is_active(&started.id));
    assert_eq!(h.manager.active_session_ids(), vec![started.id.clone()]);

    // Guidance on a live waiting runner must not spawn a second one
    h.llm.push_text(passing_response(0.9));
    submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Rejection, "Use axum, not actix"),
        &h.manager,
    )
    .await
    .unwrap();
    h.wait_idle(&started.id).await;

    assert_eq!(h.session(&started.id).status, SessionStatus::Succeeded);
    assert_eq!(h.llm.calls(), 2);
}

#[tokio::test]
async fn test_abort_while_stuck_cancels() {
    let h = Harness::new();
    h.llm.push_text(partial_response());

    let started = h.start(1).await;
    h.wait_idle(&started.id).await;
    let stuck = h.session(&started.id);
    assert_eq!(stuck.status, SessionStatus::Stuck);
    assert_eq!(stuck.stuck_reason.as_deref(), Some(MAX_ITERATIONS_REASON));

    submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Abort, "dropping this task"),
        &h.manager,
    )
    .await
    .unwrap();
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(session.completed_at.is_some());
    assert!(h.host.pull_requests().is_empty());
    assert_eq!(h.llm.calls(), 1);

    let activity = get_task_activity(TASK_ID.to_string(), &h.manager).unwrap();
    assert!(activity
        .iter()
        .any(|a| a.action == ActivityAction::ImplementationCancelled));
}

#[tokio::test]
async fn test_abort_during_in_flight_iteration_cancels_without_commit() {
    let h = Harness::new();
    h.llm.push(Scripted::Held(passing_response(0.95)));
    h.llm.push_text(passing_response(0.95));

    let started = h.start(5).await;
    h.llm.wait_until_held().await;
    assert_eq!(h.session(&started.id).status, SessionStatus::Running);

    submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Abort, "wrong task"),
        &h.manager,
    )
    .await
    .unwrap();
    assert_eq!(h.session(&started.id).status, SessionStatus::Cancelled);

    h.llm.release();
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(session.pr_number.is_none());
    assert_eq!(h.llm.calls(), 1);

    let iterations = h.store.list_iterations(&started.id).unwrap();
    assert_eq!(iterations.len(), 1);
    assert!(iterations[0].completed_at.is_some());
    assert!(iterations[0].commit_sha.is_none());
    assert!(h.host.commits().is_empty());
    assert!(h.host.pull_requests().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_guidance_while_stuck_runner_winds_down_is_not_lost() {
    let h = Harness::new();
    h.llm.push_text("not a structured answer".to_string());
    h.llm.push_text(passing_response(0.9));
    let release = h.gate.hold_activity(ActivityAction::ImplementationStuck);

    let started = h.start(3).await;
    // The runner has written STUCK and is still registered
    h.gate.wait_until_parked().await;
    assert_eq!(h.session(&started.id).status, SessionStatus::Stuck);
    assert!(h.manager.is_active(&started.id));

    submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Guidance, "Answer in the JSON format"),
        &h.manager,
    )
    .await
    .unwrap();
    release.send(()).unwrap();
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Succeeded);
    assert_eq!(session.current_iteration, 2);
    assert_eq!(h.llm.calls(), 2);
    assert_eq!(h.host.pull_requests().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_approval_while_stuck_runner_winds_down_opens_pr() {
    let h = Harness::new();
    h.llm.push_text(partial_response());
    let release = h.gate.hold_activity(ActivityAction::ImplementationStuck);

    let started = h.start(1).await;
    h.gate.wait_until_parked().await;
    assert!(h.manager.is_active(&started.id));

    submit_implementation_feedback(
        feedback(&started.id, FeedbackType::Approval, "ship it"),
        &h.manager,
    )
    .await
    .unwrap();
    release.send(()).unwrap();
    h.wait_idle(&started.id).await;

    let session = h.session(&started.id);
    assert_eq!(session.status, SessionStatus::Succeeded);
    assert_eq!(session.stage, SessionStage::Completed);
    assert!(session.pr_url.is_some());
    assert_eq!(h.host.pull_requests().len(), 1);
}

#[tokio::test]
async fn test_skipped_rename_is_not_counted_as_changed() {
    let h = Harness::new();
    let response = json!({
        "changes": [
            { "path": "src/health.rs", "operation": "create", "content": "pub fn health() {}\n" },
            { "path": "src/renamed.rs", "operation": "rename", "previousPath": "src/missing.rs" }
        ],
        "selfCheck": { "criteria": [], "allPassed": true, "confidence": 0.9 }
    });
    h.llm.push_text(format!("```json\n{}\n```", response));

    let started = h.start(3).await;
    h.wait_idle(&started.id).await;

    assert_eq!(h.session(&started.id).total_files_changed, 1);
    let commits = h.host.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].files.len(), 1);
    // The skipped rename is still on record
    assert_eq!(h.store.list_file_operations(&started.id).unwrap().len(), 2);
}
