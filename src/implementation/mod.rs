//! Autonomous task implementation
//!
//! An `ImplementationRunner` drives one `ExecutionSession` from branch creation to a
//! pull request. Each pass runs one iteration: build the repository context, ask
//! the model for changes, commit them, and read the model's self-check. The
//! session ends when the self-check passes, the iteration budget runs out, the
//! model needs a human, or a human aborts.
//!
//! Session status in the store is the only coordination channel: the feedback
//! gateway and rollback write it, the runner re-reads it at the top of every
//! pass and while waiting for feedback.

pub mod config;
pub mod context_builder;
pub mod criteria;
pub mod feedback;
pub mod iteration_engine;
pub mod prompt_builder;
pub mod response_parser;
pub mod rollback;

pub use config::{ConfigManager, ImplementationConfig};
pub use feedback::{submit_feedback, FeedbackError, SubmitFeedbackRequest};
pub use iteration_engine::{IterationOutcome, MALFORMED_RESPONSE_REASON};
pub use rollback::{rollback_session, RollbackError, RollbackOutcome, RollbackRequest};

use crate::file_storage::{FileResult, ImplementationStore};
use crate::github::{CreatePRRequest, GitHost, GitHostError, TimeoutHost};
use crate::llm::{LlmClient, LlmError};
use crate::models::state_machine::{transition_state, StateTransitionError};
use crate::models::{
    ActivityAction, ActivityEntry, ExecutionSession, Feedback, FeedbackType, Iteration,
    Repository, SessionStage, SessionStatus, Task,
};
use crate::utils::short_id;
use chrono::{DateTime, Utc};
use criteria::extract_acceptance_criteria;
use iteration_engine::{IterationEngine, IterationRequest};
use serde_json::json;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MAX_ITERATIONS_REASON: &str = "max iterations reached";
pub const FEEDBACK_TIMEOUT_REASON: &str = "timed out waiting for human feedback";

#[derive(Debug, Error)]
pub enum ImplementationError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Git host error: {0}")]
    GitHost(#[from] GitHostError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Transition(#[from] StateTransitionError),
}

/// How a runner invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Succeeded,
    Failed,
    Stuck,
    Cancelled,
    /// Left in WAITING_FEEDBACK with nothing new to act on
    AwaitingFeedback,
    /// The session was moved underneath the runner (rollback or a concurrent writer)
    Interrupted,
}

impl SessionExit {
    fn for_status(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Succeeded => SessionExit::Succeeded,
            SessionStatus::Failed => SessionExit::Failed,
            SessionStatus::Stuck => SessionExit::Stuck,
            SessionStatus::Cancelled => SessionExit::Cancelled,
            SessionStatus::WaitingFeedback => SessionExit::AwaitingFeedback,
            SessionStatus::Initializing | SessionStatus::Running => SessionExit::Interrupted,
        }
    }
}

/// Remote branch owned by one session
pub fn implementation_branch_name(task_id: &str, session_id: &str) -> String {
    format!("ai/task-{}-{}", short_id(task_id), short_id(session_id))
}

/// Persist a stage change unless the session has already ended
pub(crate) fn persist_stage(
    store: &dyn ImplementationStore,
    session_id: &str,
    stage: SessionStage,
) -> Result<(), ImplementationError> {
    store
        .update_session(session_id, &mut |session| {
            if !session.is_terminal() {
                session.stage = stage;
            }
            Ok(())
        })
        .map(|_| ())
        .map_err(ImplementationError::Storage)
}

/// Close every in-flight iteration of a session with `reason`.
///
/// Returns the highest iteration number that was closed.
pub fn close_in_flight_iterations(
    store: &dyn ImplementationStore,
    session_id: &str,
    reason: &str,
) -> FileResult<Option<u32>> {
    let mut highest = None;
    for mut iteration in store
        .list_iterations(session_id)?
        .into_iter()
        .filter(Iteration::is_in_flight)
    {
        iteration.completed_at = Some(Utc::now());
        if iteration.blocked_reason.is_none() {
            iteration.blocked_reason = Some(reason.to_string());
        }
        if store.update_iteration(&iteration)? {
            highest = highest.max(Some(iteration.iteration_number));
        }
    }
    Ok(highest)
}

pub(crate) fn record_activity(
    store: &dyn ImplementationStore,
    session: &ExecutionSession,
    action: ActivityAction,
    actor: &str,
    details: serde_json::Value,
) {
    let entry = ActivityEntry::new(&session.task_id, action, actor, details);
    if let Err(e) = store.append_activity(&entry) {
        log::warn!(
            "[Implementation] Failed to record activity for task {}: {}",
            session.task_id,
            e
        );
    }
}

enum Entry {
    Start,
    Reattach,
}

enum WaitResult {
    Resumed,
    Approved,
    Cancelled,
    TimedOut,
    Stopped(SessionStatus),
}

#[derive(Debug, Clone, Copy)]
enum PassCommit {
    Committed,
    /// A rollback rewound the session past this iteration
    Superseded,
    Terminal(SessionStatus),
}

/// Drives sessions through the implementation loop
pub struct ImplementationRunner {
    store: Arc<dyn ImplementationStore>,
    host: Arc<dyn GitHost>,
    llm: Arc<dyn LlmClient>,
    config: ImplementationConfig,
}

impl ImplementationRunner {
    /// Every host call made by the runner is bounded by `git_host.timeout_secs`
    pub fn new(
        store: Arc<dyn ImplementationStore>,
        host: Arc<dyn GitHost>,
        llm: Arc<dyn LlmClient>,
        config: ImplementationConfig,
    ) -> Self {
        let host: Arc<dyn GitHost> = Arc::new(TimeoutHost::new(
            host,
            Duration::from_secs(config.git_host.timeout_secs),
        ));
        Self {
            store,
            host,
            llm,
            config,
        }
    }

    pub fn config(&self) -> &ImplementationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ImplementationStore> {
        &self.store
    }

    /// The time-bounded host the runner uses
    pub fn host(&self) -> &Arc<dyn GitHost> {
        &self.host
    }

    /// Run a session until it succeeds, gets stuck, is cancelled or fails.
    ///
    /// Never returns an error: anything escaping the loop marks the session FAILED.
    pub async fn run(&self, session_id: &str) -> SessionExit {
        let result = self.drive(session_id, Entry::Start).await;
        self.settle(session_id, result)
    }

    /// Resume the feedback wait of a session left in WAITING_FEEDBACK by a restart
    pub async fn reattach(&self, session_id: &str) -> SessionExit {
        let result = self.drive(session_id, Entry::Reattach).await;
        self.settle(session_id, result)
    }

    /// Create the pull request for a session a human approved with no runner attached
    pub async fn finalize_approved(&self, session_id: &str) -> SessionExit {
        let result = async {
            let session = self.load_session(session_id)?;
            let (task, repo) = self.load_rows(&session)?;
            self.finalize_success(session_id, &task, &repo).await
        }
        .await;
        self.settle(session_id, result)
    }

    fn settle(
        &self,
        session_id: &str,
        result: Result<SessionExit, ImplementationError>,
    ) -> SessionExit {
        match result {
            Ok(exit) => exit,
            Err(e) => {
                log::error!(
                    "[Implementation] EXIT REASON: error in session {}: {}",
                    session_id,
                    e
                );
                self.fail_session(session_id, &e.to_string());
                SessionExit::Failed
            }
        }
    }

    async fn drive(&self, session_id: &str, entry: Entry) -> Result<SessionExit, ImplementationError> {
        let session = self.load_session(session_id)?;
        if session.is_terminal() {
            log::debug!(
                "[Implementation] Session {} already {}, nothing to run",
                session_id,
                session.status
            );
            return Ok(SessionExit::for_status(session.status));
        }

        let (task, repo) = self.load_rows(&session)?;
        let criteria = extract_acceptance_criteria(&task.description, &task.title);
        log::info!(
            "[Implementation] Session {} for task '{}' on {} ({} acceptance criteria)",
            session_id,
            task.title,
            repo.full_name(),
            criteria.len()
        );

        if session.status == SessionStatus::Initializing {
            if let Some(exit) = self.start_session(&session, &repo).await? {
                return Ok(exit);
            }
        }

        if matches!(entry, Entry::Reattach) && session.status == SessionStatus::WaitingFeedback {
            let since = self.waiting_since(session_id)?;
            log::info!("[Implementation] Re-attaching to waiting session {}", session_id);
            let wait = self.wait_for_feedback(session_id, since).await?;
            if let Some(exit) = self.after_wait(&session, wait, &task, &repo).await? {
                return Ok(exit);
            }
        }

        self.run_loop(session_id, &task, &repo, &criteria).await
    }

    /// Prepare the branch and move INITIALIZING to RUNNING
    async fn start_session(
        &self,
        session: &ExecutionSession,
        repo: &Repository,
    ) -> Result<Option<SessionExit>, ImplementationError> {
        persist_stage(self.store.as_ref(), &session.id, SessionStage::PreparingBranch)?;

        let branch = &session.implementation_branch;
        if self.host.branch_exists(repo, branch).await? {
            log::info!("[Implementation] Reusing existing branch {}", branch);
        } else {
            match self
                .host
                .create_branch(repo, branch, &session.source_branch)
                .await
            {
                Ok(()) => log::info!(
                    "[Implementation] Created branch {} from {}",
                    branch,
                    session.source_branch
                ),
                Err(e) if e.is_already_exists() => {
                    log::info!("[Implementation] Branch {} already exists", branch)
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.transition(&session.id, SessionStatus::Running, |s| {
            s.stage = SessionStage::AnalyzingRepository;
        }) {
            Ok(started) => {
                record_activity(
                    self.store.as_ref(),
                    &started,
                    ActivityAction::ImplementationStarted,
                    &started.started_by,
                    json!({
                        "sessionId": started.id,
                        "branch": started.implementation_branch,
                        "maxIterations": started.max_iterations,
                    }),
                );
                Ok(None)
            }
            Err(ImplementationError::Transition(_)) => Ok(Some(self.current_exit(&session.id)?)),
            Err(e) => Err(e),
        }
    }

    async fn run_loop(
        &self,
        session_id: &str,
        task: &Task,
        repo: &Repository,
        criteria: &[String],
    ) -> Result<SessionExit, ImplementationError> {
        let engine = IterationEngine::new(
            self.store.as_ref(),
            self.host.as_ref(),
            self.llm.as_ref(),
            &self.config,
        );

        loop {
            let session = self.load_session(session_id)?;
            match session.status {
                SessionStatus::Cancelled => {
                    log::warn!(
                        "[Implementation] EXIT REASON: Session {} cancelled at iteration {}",
                        session_id,
                        session.current_iteration
                    );
                    return Ok(SessionExit::Cancelled);
                }
                SessionStatus::Succeeded | SessionStatus::Failed => {
                    return Ok(SessionExit::for_status(session.status));
                }
                SessionStatus::Stuck => {
                    log::info!(
                        "[Implementation] Session {} is stuck, waiting for a human",
                        session_id
                    );
                    return Ok(SessionExit::Stuck);
                }
                SessionStatus::WaitingFeedback => {
                    let since = self.waiting_since(session_id)?;
                    match self.feedback_since(session_id, since)? {
                        Some(feedback) if feedback.feedback_type != FeedbackType::Abort => {
                            log::info!(
                                "[Implementation] Resuming session {} on {:?} feedback",
                                session_id,
                                feedback.feedback_type
                            );
                            match self.transition(session_id, SessionStatus::Running, |s| {
                                s.stuck_reason = None;
                            }) {
                                Ok(_) => {}
                                Err(ImplementationError::Transition(_)) => continue,
                                Err(e) => return Err(e),
                            }
                        }
                        _ => return Ok(SessionExit::AwaitingFeedback),
                    }
                }
                SessionStatus::Initializing | SessionStatus::Running => {}
            }

            if session.current_iteration >= session.max_iterations {
                return self.mark_stuck(session_id, MAX_ITERATIONS_REASON);
            }

            let number = session.current_iteration + 1;
            log::info!(
                "[Implementation] ======== Iteration {} of {} starting (session {}) ========",
                number,
                session.max_iterations,
                session_id
            );

            let previous: Vec<Iteration> = self
                .store
                .list_iterations(session_id)
                .map_err(ImplementationError::Storage)?
                .into_iter()
                .filter(|i| i.iteration_number < number)
                .collect();
            let human_feedback = self
                .store
                .list_feedback(session_id)
                .map_err(ImplementationError::Storage)?
                .into_iter()
                .rev()
                .find(|f| f.feedback_type.is_guidance_like());

            let mut iteration = Iteration::new(session_id, number, criteria.len() as u32);
            self.store
                .create_iteration(&iteration)
                .map_err(ImplementationError::Storage)?;

            let outcome = engine
                .run(
                    &IterationRequest {
                        session: &session,
                        task,
                        repository: repo,
                        criteria,
                        previous_iterations: &previous,
                        human_feedback: human_feedback.as_ref(),
                    },
                    &mut iteration,
                )
                .await?;

            iteration.completed_at = Some(Utc::now());
            match outcome {
                IterationOutcome::Superseded => {
                    log::info!(
                        "[Implementation] Iteration {} of session {} was rolled back while running",
                        number,
                        session_id
                    );
                    continue;
                }
                IterationOutcome::NeedsHumanInput { reason } => {
                    iteration.needs_human_input = true;
                    iteration.blocked_reason = Some(reason.clone());
                    match self.commit_pass(&iteration, 0)? {
                        PassCommit::Committed => {}
                        PassCommit::Superseded => continue,
                        PassCommit::Terminal(status) => return Ok(SessionExit::for_status(status)),
                    }

                    match self.transition(session_id, SessionStatus::WaitingFeedback, |s| {
                        s.stage = SessionStage::WaitingFeedback;
                        s.stuck_reason = Some(reason.clone());
                    }) {
                        Ok(_) => {}
                        Err(ImplementationError::Transition(_)) => {
                            return self.current_exit(session_id)
                        }
                        Err(e) => return Err(e),
                    }
                    log::info!(
                        "[Implementation] Session {} waiting for feedback: {}",
                        session_id,
                        reason
                    );

                    let since = iteration.completed_at.unwrap_or_else(Utc::now);
                    let wait = self.wait_for_feedback(session_id, since).await?;
                    if let Some(exit) = self.after_wait(&session, wait, task, repo).await? {
                        return Ok(exit);
                    }
                }
                IterationOutcome::Stuck { reason } => {
                    if iteration.blocked_reason.is_none() {
                        iteration.blocked_reason = Some(reason.clone());
                    }
                    match self.commit_pass(&iteration, 0)? {
                        PassCommit::Committed => {}
                        PassCommit::Superseded => continue,
                        PassCommit::Terminal(status) => return Ok(SessionExit::for_status(status)),
                    }
                    return self.mark_stuck(session_id, &reason);
                }
                IterationOutcome::Applied {
                    verification,
                    files_changed,
                } => {
                    match self.commit_pass(&iteration, files_changed)? {
                        PassCommit::Committed => {}
                        PassCommit::Superseded => continue,
                        PassCommit::Terminal(status) => return Ok(SessionExit::for_status(status)),
                    }

                    if verification
                        .meets_threshold(self.config.loop_settings.success_confidence_threshold)
                    {
                        log::warn!(
                            "[Implementation] EXIT REASON: All criteria pass with confidence {:.2} at iteration {}",
                            verification.confidence,
                            number
                        );
                        return self.finalize_success(session_id, task, repo).await;
                    }

                    if number >= session.max_iterations {
                        return self.mark_stuck(session_id, MAX_ITERATIONS_REASON);
                    }

                    log::info!("[Implementation] Continuing to iteration {}", number + 1);
                    tokio::time::sleep(self.config.loop_settings.inter_iteration_delay()).await;
                }
            }
        }
    }

    /// Advance the session rollup to a finished iteration and persist the iteration.
    ///
    /// The session is left untouched when it ended meanwhile. An iteration that a
    /// rollback rewound past is discarded rather than written back.
    fn commit_pass(
        &self,
        iteration: &Iteration,
        files_changed: u32,
    ) -> Result<PassCommit, ImplementationError> {
        let number = iteration.iteration_number;
        let mut outcome = PassCommit::Committed;
        let kept = self
            .store
            .commit_iteration(iteration, &mut |session| {
                if session.is_terminal() {
                    outcome = PassCommit::Terminal(session.status);
                    return Ok(true);
                }
                if session.current_iteration + 1 != number {
                    return Ok(false);
                }
                session.current_iteration = number;
                session.total_files_changed += files_changed;
                outcome = PassCommit::Committed;
                Ok(true)
            })
            .map_err(ImplementationError::Storage)?;

        if !kept {
            log::info!(
                "[Implementation] Iteration {} of session {} discarded by rollback",
                number,
                iteration.session_id
            );
            return Ok(PassCommit::Superseded);
        }
        Ok(outcome)
    }

    /// Poll the session status until a human acts or the feedback timeout elapses
    async fn wait_for_feedback(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<WaitResult, ImplementationError> {
        let settings = &self.config.loop_settings;
        let elapsed = (Utc::now() - since).to_std().unwrap_or_default();
        let remaining = settings.feedback_timeout().saturating_sub(elapsed);
        let deadline = tokio::time::Instant::now() + remaining;
        let poll_interval = settings.feedback_poll_interval();

        loop {
            let session = self.load_session(session_id)?;
            match session.status {
                SessionStatus::WaitingFeedback => {}
                SessionStatus::Running => return Ok(WaitResult::Resumed),
                SessionStatus::Succeeded => return Ok(WaitResult::Approved),
                SessionStatus::Cancelled => return Ok(WaitResult::Cancelled),
                other => return Ok(WaitResult::Stopped(other)),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                if self.expire_wait(session_id)? {
                    return Ok(WaitResult::TimedOut);
                }
                // Status changed between the read and the write; re-evaluate
                continue;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// WAITING_FEEDBACK to STUCK, only if nobody answered in the meantime
    fn expire_wait(&self, session_id: &str) -> Result<bool, ImplementationError> {
        let mut expired = false;
        self.store
            .update_session(session_id, &mut |session| {
                if session.status == SessionStatus::WaitingFeedback {
                    session.status = transition_state(session.status, SessionStatus::Stuck)
                        .map_err(|e| e.to_string())?;
                    session.stage = SessionStage::Stuck;
                    session.stuck_reason = Some(FEEDBACK_TIMEOUT_REASON.to_string());
                    session.completed_at = Some(Utc::now());
                    expired = true;
                }
                Ok(())
            })
            .map_err(ImplementationError::Storage)?;
        Ok(expired)
    }

    /// Act on the result of a feedback wait. `None` means keep looping.
    async fn after_wait(
        &self,
        session: &ExecutionSession,
        wait: WaitResult,
        task: &Task,
        repo: &Repository,
    ) -> Result<Option<SessionExit>, ImplementationError> {
        match wait {
            WaitResult::Resumed => Ok(None),
            WaitResult::Approved => {
                log::warn!(
                    "[Implementation] EXIT REASON: Approved by a reviewer while waiting (session {})",
                    session.id
                );
                Ok(Some(self.finalize_success(&session.id, task, repo).await?))
            }
            WaitResult::Cancelled => {
                log::warn!(
                    "[Implementation] EXIT REASON: Session {} aborted while waiting for feedback",
                    session.id
                );
                Ok(Some(SessionExit::Cancelled))
            }
            WaitResult::TimedOut => {
                log::warn!(
                    "[Implementation] EXIT REASON: {} (session {})",
                    FEEDBACK_TIMEOUT_REASON,
                    session.id
                );
                record_activity(
                    self.store.as_ref(),
                    session,
                    ActivityAction::ImplementationStuck,
                    &session.started_by,
                    json!({ "sessionId": session.id, "reason": FEEDBACK_TIMEOUT_REASON }),
                );
                Ok(Some(SessionExit::Stuck))
            }
            WaitResult::Stopped(status) => Ok(Some(SessionExit::for_status(status))),
        }
    }

    /// Move the session to SUCCEEDED (if it is not already) and open the pull request.
    ///
    /// A failed pull request is recorded in `error_message` without undoing the success.
    async fn finalize_success(
        &self,
        session_id: &str,
        task: &Task,
        repo: &Repository,
    ) -> Result<SessionExit, ImplementationError> {
        let session = self.load_session(session_id)?;
        let approved = match session.status {
            SessionStatus::Succeeded if session.stage == SessionStage::Completed => {
                return Ok(SessionExit::Succeeded)
            }
            SessionStatus::Succeeded => true,
            SessionStatus::Failed | SessionStatus::Cancelled => {
                return Ok(SessionExit::for_status(session.status))
            }
            _ => {
                match self.transition(session_id, SessionStatus::Succeeded, |s| {
                    s.stuck_reason = None;
                }) {
                    Ok(_) => false,
                    Err(ImplementationError::Transition(_)) => {
                        return self.current_exit(session_id)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let session = self
            .store
            .update_session(session_id, &mut |s| {
                s.stage = SessionStage::CreatingPr;
                Ok(())
            })
            .map_err(ImplementationError::Storage)?;

        let iterations = self
            .store
            .list_iterations(session_id)
            .map_err(ImplementationError::Storage)?;
        let request = CreatePRRequest {
            title: format!("[AI] {}", task.title),
            body: self.pull_request_body(task, &session, &iterations, approved),
            head: session.implementation_branch.clone(),
            base: session.source_branch.clone(),
            draft: self.config.loop_settings.draft_prs,
        };
        let pr_result = self.host.create_pull_request(repo, request).await;

        let session = self
            .store
            .update_session(session_id, &mut |s| {
                match &pr_result {
                    Ok(pr) => {
                        s.pr_number = Some(pr.number);
                        s.pr_url = Some(pr.html_url.clone());
                    }
                    Err(e) => {
                        s.error_message = Some(format!("Pull request creation failed: {}", e));
                    }
                }
                s.stage = SessionStage::Completed;
                s.completed_at = Some(Utc::now());
                Ok(())
            })
            .map_err(ImplementationError::Storage)?;

        match &pr_result {
            Ok(pr) => log::info!(
                "[Implementation] Opened pull request #{} for session {}: {}",
                pr.number,
                session_id,
                pr.html_url
            ),
            Err(e) => log::warn!(
                "[Implementation] Session {} succeeded but the pull request failed: {}",
                session_id,
                e
            ),
        }

        record_activity(
            self.store.as_ref(),
            &session,
            ActivityAction::ImplementationCompleted,
            &session.started_by,
            json!({
                "sessionId": session.id,
                "iterations": session.current_iteration,
                "filesChanged": session.total_files_changed,
                "approved": approved,
                "prNumber": session.pr_number,
                "prUrl": session.pr_url,
            }),
        );
        Ok(SessionExit::Succeeded)
    }

    fn pull_request_body(
        &self,
        task: &Task,
        session: &ExecutionSession,
        iterations: &[Iteration],
        approved: bool,
    ) -> String {
        let mut body = String::new();
        let _ = writeln!(body, "## Summary\n");
        let _ = writeln!(
            body,
            "Automated implementation of **{}** (task `{}`).\n",
            task.title, task.id
        );
        if approved {
            let _ = writeln!(
                body,
                "> A reviewer approved this branch before every acceptance criterion passed.\n"
            );
        }

        let last_check = iterations
            .iter()
            .rev()
            .find_map(|i| i.verification_results.as_ref());
        if let Some(check) = last_check {
            let _ = writeln!(body, "## Acceptance Criteria\n");
            for criterion in &check.criteria {
                let mark = if criterion.passed { "x" } else { " " };
                let _ = writeln!(body, "- [{}] {}", mark, criterion.criterion);
            }
            let _ = writeln!(body, "\nSelf-reported confidence: {:.2}\n", check.confidence);
        }

        let _ = writeln!(body, "## Details\n");
        let _ = writeln!(body, "- Session: `{}`", session.id);
        let _ = writeln!(
            body,
            "- Iterations: {} of {}",
            session.current_iteration, session.max_iterations
        );
        let _ = writeln!(body, "- Files changed: {}", session.total_files_changed);
        let _ = writeln!(
            body,
            "- Model: {}/{}",
            self.llm.provider_name(),
            self.llm.model_name()
        );
        body
    }

    fn mark_stuck(&self, session_id: &str, reason: &str) -> Result<SessionExit, ImplementationError> {
        match self.transition(session_id, SessionStatus::Stuck, |s| {
            s.stage = SessionStage::Stuck;
            s.stuck_reason = Some(reason.to_string());
            s.completed_at = Some(Utc::now());
        }) {
            Ok(session) => {
                log::warn!(
                    "[Implementation] EXIT REASON: Session {} stuck at iteration {}: {}",
                    session_id,
                    session.current_iteration,
                    reason
                );
                record_activity(
                    self.store.as_ref(),
                    &session,
                    ActivityAction::ImplementationStuck,
                    &session.started_by,
                    json!({
                        "sessionId": session.id,
                        "reason": reason,
                        "iteration": session.current_iteration,
                    }),
                );
                Ok(SessionExit::Stuck)
            }
            Err(ImplementationError::Transition(_)) => self.current_exit(session_id),
            Err(e) => Err(e),
        }
    }

    /// Mark a session FAILED. Errors here are logged, never propagated.
    fn fail_session(&self, session_id: &str, message: &str) {
        let closed = match close_in_flight_iterations(self.store.as_ref(), session_id, message) {
            Ok(closed) => closed,
            Err(e) => {
                log::error!(
                    "[Implementation] Failed to close iterations of session {}: {}",
                    session_id,
                    e
                );
                None
            }
        };

        let mut already_ended = false;
        let result = self.store.update_session(session_id, &mut |session| {
            if session.is_terminal() {
                already_ended = true;
                return Ok(());
            }
            session.status = transition_state(session.status, SessionStatus::Failed)
                .map_err(|e| e.to_string())?;
            session.stage = SessionStage::Failed;
            session.error_message = Some(message.to_string());
            session.completed_at = Some(Utc::now());
            if let Some(number) = closed {
                session.current_iteration = session.current_iteration.max(number);
            }
            Ok(())
        });

        match result {
            Ok(session) if !already_ended => record_activity(
                self.store.as_ref(),
                &session,
                ActivityAction::ImplementationFailed,
                &session.started_by,
                json!({ "sessionId": session.id, "error": message }),
            ),
            Ok(_) => {}
            Err(e) => log::error!(
                "[Implementation] Failed to mark session {} as failed: {}",
                session_id,
                e
            ),
        }
    }

    /// Apply a status transition plus extra field updates in one write
    fn transition(
        &self,
        session_id: &str,
        target: SessionStatus,
        mut apply: impl FnMut(&mut ExecutionSession),
    ) -> Result<ExecutionSession, ImplementationError> {
        let mut rejected: Option<StateTransitionError> = None;
        let result = self.store.update_session(session_id, &mut |session| {
            match transition_state(session.status, target) {
                Ok(status) => {
                    session.status = status;
                    apply(session);
                    Ok(())
                }
                Err(e) => {
                    let message = e.to_string();
                    rejected = Some(e);
                    Err(message)
                }
            }
        });

        match (result, rejected) {
            (_, Some(e)) => {
                log::debug!("[Implementation] Session {}: {}", session_id, e);
                Err(ImplementationError::Transition(e))
            }
            (Ok(session), None) => Ok(session),
            (Err(e), None) => Err(ImplementationError::Storage(e)),
        }
    }

    fn current_exit(&self, session_id: &str) -> Result<SessionExit, ImplementationError> {
        Ok(SessionExit::for_status(self.load_session(session_id)?.status))
    }

    fn load_session(&self, session_id: &str) -> Result<ExecutionSession, ImplementationError> {
        self.store
            .get_session(session_id)
            .map_err(ImplementationError::Storage)?
            .ok_or_else(|| ImplementationError::SessionNotFound(session_id.to_string()))
    }

    fn load_rows(&self, session: &ExecutionSession) -> Result<(Task, Repository), ImplementationError> {
        let task = self
            .store
            .get_task(&session.task_id)
            .map_err(ImplementationError::Storage)?
            .ok_or_else(|| ImplementationError::TaskNotFound(session.task_id.clone()))?;
        let repo = self
            .store
            .get_repository(&session.repository_id)
            .map_err(ImplementationError::Storage)?
            .ok_or_else(|| ImplementationError::RepositoryNotFound(session.repository_id.clone()))?;
        Ok((task, repo))
    }

    /// When the session started waiting: completion of its latest blocking iteration
    fn waiting_since(&self, session_id: &str) -> Result<DateTime<Utc>, ImplementationError> {
        Ok(self
            .store
            .list_iterations(session_id)
            .map_err(ImplementationError::Storage)?
            .iter()
            .rev()
            .find(|i| i.needs_human_input)
            .and_then(|i| i.completed_at)
            .unwrap_or_else(Utc::now))
    }

    fn feedback_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Feedback>, ImplementationError> {
        Ok(self
            .store
            .list_feedback(session_id)
            .map_err(ImplementationError::Storage)?
            .into_iter()
            .filter(|f| f.created_at >= since)
            .last())
    }
}
