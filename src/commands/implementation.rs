//! Backend commands for autonomous task implementation
//!
//! Commands start sessions, accept human feedback, roll sessions back and
//! expose the stored session history. Each session runs on its own spawned
//! tokio task; the registry here guarantees at most one live runner per session.

use crate::file_storage::ImplementationStore;
use crate::github::GitHost;
use crate::implementation::{
    feedback::FeedbackOutcome, implementation_branch_name, rollback_session, submit_feedback,
    ImplementationConfig, ImplementationRunner, RollbackOutcome, RollbackRequest,
    SubmitFeedbackRequest,
};
use crate::llm::LlmClient;
use crate::models::{
    ActivityEntry, ExecutionSession, Feedback, FileOperation, Iteration, Repository,
    SessionStage, SessionStatus, Task,
};
use crate::session::{RecoveryAction, RecoveryResult, SessionRecovery};
use crate::utils::{lock_mutex_recover, ResultExt};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Request Types
// ============================================================================

/// Request to start implementing a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartImplementationRequest {
    pub task_id: String,
    pub repository_id: String,
    /// User who started the session
    pub started_by: String,
    /// Iteration budget (default: `loop.max_iterations` from config)
    pub max_iterations: Option<u32>,
    /// Branch to fork from and open the PR against (default: repository default branch)
    pub source_branch: Option<String>,
}

// ============================================================================
// Manager State
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum RunnerMode {
    Run,
    Reattach,
    FinalizeApproval,
}

/// Live runners, plus the sessions whose state changed while their runner was live
#[derive(Default)]
struct RunnerRegistry {
    live: HashSet<String>,
    rerun_requested: HashSet<String>,
}

/// State for managing implementation sessions (Application state)
pub struct ImplementationManagerState {
    runner: Arc<ImplementationRunner>,
    registry: Arc<Mutex<RunnerRegistry>>,
}

/// Removes a session from the registry if its runner task panics
struct ActiveRunnerGuard {
    registry: Arc<Mutex<RunnerRegistry>>,
    session_id: String,
    released: bool,
}

impl ActiveRunnerGuard {
    /// Deregister the runner, unless a rerun was requested while it was live.
    ///
    /// Returns true when the runner must go round again. Checking the request and
    /// deregistering happen under one lock so no request is lost in between.
    fn release_or_rerun(&mut self) -> bool {
        let mut registry = lock_mutex_recover(&self.registry);
        if registry.rerun_requested.remove(&self.session_id) {
            return true;
        }
        registry.live.remove(&self.session_id);
        self.released = true;
        false
    }
}

impl Drop for ActiveRunnerGuard {
    fn drop(&mut self) {
        if !self.released {
            let mut registry = lock_mutex_recover(&self.registry);
            registry.live.remove(&self.session_id);
            registry.rerun_requested.remove(&self.session_id);
        }
    }
}

/// What a runner should do next for a session, judged from its stored status
fn follow_up_mode(store: &dyn ImplementationStore, session_id: &str) -> Option<RunnerMode> {
    let session = match store.get_session(session_id) {
        Ok(Some(session)) => session,
        Ok(None) => return None,
        Err(e) => {
            log::warn!(
                "[Implementation] Could not re-read session {}: {}",
                session_id,
                e
            );
            return None;
        }
    };
    match session.status {
        SessionStatus::Initializing | SessionStatus::Running => Some(RunnerMode::Run),
        SessionStatus::Succeeded if session.stage != SessionStage::Completed => {
            Some(RunnerMode::FinalizeApproval)
        }
        _ => None,
    }
}

impl ImplementationManagerState {
    pub fn new(
        store: Arc<dyn ImplementationStore>,
        host: Arc<dyn GitHost>,
        llm: Arc<dyn LlmClient>,
        config: ImplementationConfig,
    ) -> Self {
        Self {
            runner: Arc::new(ImplementationRunner::new(store, host, llm, config)),
            registry: Arc::new(Mutex::new(RunnerRegistry::default())),
        }
    }

    pub fn store(&self) -> &Arc<dyn ImplementationStore> {
        self.runner.store()
    }

    pub fn config(&self) -> &ImplementationConfig {
        self.runner.config()
    }

    /// Whether a runner task is live for the session
    pub fn is_active(&self, session_id: &str) -> bool {
        lock_mutex_recover(&self.registry).live.contains(session_id)
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_mutex_recover(&self.registry)
            .live
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Wait until the session has no live runner. Returns false on timeout.
    pub async fn wait_until_idle(&self, session_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_active(session_id) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Spawn a runner unless one is already live. Returns whether a runner was spawned.
    ///
    /// When one is live it is asked to re-check the session once it finishes, so a
    /// change that lands while it is winding down still gets a runner.
    fn spawn_runner(&self, session_id: &str, mode: RunnerMode) -> bool {
        {
            let mut registry = lock_mutex_recover(&self.registry);
            if !registry.live.insert(session_id.to_string()) {
                registry.rerun_requested.insert(session_id.to_string());
                log::debug!(
                    "[Implementation] Runner already live for session {}, requested a re-check instead of {:?}",
                    session_id,
                    mode
                );
                return false;
            }
        }

        let mut guard = ActiveRunnerGuard {
            registry: self.registry.clone(),
            session_id: session_id.to_string(),
            released: false,
        };
        let runner = self.runner.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut next = Some(mode);
            while let Some(mode) = next.take() {
                let exit = match mode {
                    RunnerMode::Run => runner.run(&session_id).await,
                    RunnerMode::Reattach => runner.reattach(&session_id).await,
                    RunnerMode::FinalizeApproval => runner.finalize_approved(&session_id).await,
                };
                log::info!(
                    "[Implementation] Runner for session {} finished: {:?}",
                    session_id,
                    exit
                );

                // Each pending request re-checks the stored status once
                while guard.release_or_rerun() {
                    if let Some(follow_up) = follow_up_mode(runner.store().as_ref(), &session_id) {
                        log::info!(
                            "[Implementation] Session {} changed while its runner was finishing, continuing with {:?}",
                            session_id,
                            follow_up
                        );
                        next = Some(follow_up);
                        break;
                    }
                }
            }
        });
        true
    }

    /// Reconcile sessions left live by a previous process and restart their runners
    pub fn recover_sessions(&self) -> Result<Vec<RecoveryResult>, String> {
        let results = SessionRecovery::new(self.store().clone())
            .recover_all()
            .map_err(|e| format!("Failed to recover sessions: {}", e))?;

        for result in &results {
            match result.action {
                RecoveryAction::MarkedStuck => log::info!(
                    "[Recovery] Session {} marked stuck (interrupted iteration: {:?})",
                    result.session_id,
                    result.interrupted_iteration
                ),
                RecoveryAction::Restart => {
                    log::info!("[Recovery] Restarting session {}", result.session_id);
                    self.spawn_runner(&result.session_id, RunnerMode::Run);
                }
                RecoveryAction::Reattach => {
                    log::info!(
                        "[Recovery] Re-attaching to waiting session {}",
                        result.session_id
                    );
                    self.spawn_runner(&result.session_id, RunnerMode::Reattach);
                }
            }
        }
        Ok(results)
    }
}

// ============================================================================
// Session Operations
// ============================================================================

/// Create a session for a task and start its runner. Returns the new session.
pub async fn start_implementation(
    request: StartImplementationRequest,
    state: &ImplementationManagerState,
) -> Result<ExecutionSession, String> {
    let max_iterations = request
        .max_iterations
        .unwrap_or(state.config().loop_settings.max_iterations);
    if max_iterations == 0 {
        return Err("maxIterations must be at least 1".to_string());
    }

    let store = state.store();
    // Missing rows fail the session inside the runner; the branch only needs a default
    let repository = store.get_repository(&request.repository_id)?;
    let source_branch = request
        .source_branch
        .clone()
        .or_else(|| repository.map(|r| r.default_branch))
        .unwrap_or_else(|| "main".to_string());

    let session_id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let session = ExecutionSession {
        id: session_id.clone(),
        task_id: request.task_id.clone(),
        repository_id: request.repository_id.clone(),
        started_by: request.started_by.clone(),
        status: SessionStatus::Initializing,
        stage: SessionStage::Initializing,
        current_iteration: 0,
        max_iterations,
        implementation_branch: implementation_branch_name(&request.task_id, &session_id),
        source_branch,
        total_files_changed: 0,
        stuck_reason: None,
        error_message: None,
        pr_number: None,
        pr_url: None,
        started_at: now,
        completed_at: None,
        updated_at: now,
    };
    store
        .create_session(&session)
        .with_context("Failed to create session")?;

    log::info!(
        "[Implementation] Started session {} for task {} by {} (max {} iterations)",
        session.id,
        session.task_id,
        session.started_by,
        max_iterations
    );
    state.spawn_runner(&session.id, RunnerMode::Run);
    Ok(session)
}

/// Submit human feedback and restart the loop when it revives a suspended session
pub async fn submit_implementation_feedback(
    request: SubmitFeedbackRequest,
    state: &ImplementationManagerState,
) -> Result<Feedback, String> {
    let outcome: FeedbackOutcome =
        submit_feedback(state.store().as_ref(), request).map_err(|e| e.to_string())?;
    let session_id = outcome.feedback.session_id.clone();

    // A live runner either picks the change up itself or re-checks when it ends
    if outcome.resumed() {
        state.spawn_runner(&session_id, RunnerMode::Run);
    } else if outcome.approved() {
        state.spawn_runner(&session_id, RunnerMode::FinalizeApproval);
    }

    Ok(outcome.feedback)
}

/// Roll a session back, resuming the loop after a partial rollback
pub async fn rollback_implementation(
    request: RollbackRequest,
    state: &ImplementationManagerState,
) -> Result<RollbackOutcome, String> {
    let session_id = request.session_id.clone();
    let outcome = rollback_session(
        state.store().as_ref(),
        state.runner.host().as_ref(),
        &state.config().rollback,
        request,
    )
    .await
    .map_err(|e| e.to_string())?;

    if outcome.rolled_back_to.is_some() {
        state.spawn_runner(&session_id, RunnerMode::Run);
    }
    Ok(outcome)
}

// ============================================================================
// Read Models
// ============================================================================

pub fn get_implementation_session(
    session_id: String,
    state: &ImplementationManagerState,
) -> Result<ExecutionSession, String> {
    state
        .store()
        .get_session(&session_id)?
        .ok_or_else(|| format!("Session not found: {}", session_id))
}

pub fn list_implementation_sessions(
    task_id: Option<String>,
    state: &ImplementationManagerState,
) -> Result<Vec<ExecutionSession>, String> {
    state.store().list_sessions(task_id.as_deref())
}

pub fn get_implementation_iterations(
    session_id: String,
    state: &ImplementationManagerState,
) -> Result<Vec<Iteration>, String> {
    state.store().list_iterations(&session_id)
}

pub fn get_implementation_feedback(
    session_id: String,
    state: &ImplementationManagerState,
) -> Result<Vec<Feedback>, String> {
    state.store().list_feedback(&session_id)
}

pub fn get_implementation_file_operations(
    session_id: String,
    state: &ImplementationManagerState,
) -> Result<Vec<FileOperation>, String> {
    state.store().list_file_operations(&session_id)
}

pub fn get_task_activity(
    task_id: String,
    state: &ImplementationManagerState,
) -> Result<Vec<ActivityEntry>, String> {
    state.store().list_activity(&task_id)
}

pub fn get_implementation_config(
    state: &ImplementationManagerState,
) -> Result<ImplementationConfig, String> {
    Ok(state.config().clone())
}

// ============================================================================
// External Rows
// ============================================================================

/// Register or update a task so sessions can reference it
pub fn register_task(task: Task, state: &ImplementationManagerState) -> Result<Task, String> {
    if task.title.trim().is_empty() {
        return Err("Task title cannot be empty".to_string());
    }
    state.store().save_task(&task)?;
    Ok(task)
}

/// Register or update a repository so sessions can reference it
pub fn register_repository(
    repository: Repository,
    state: &ImplementationManagerState,
) -> Result<Repository, String> {
    if repository.owner.trim().is_empty() || repository.name.trim().is_empty() {
        return Err("Repository owner and name are required".to_string());
    }
    state.store().save_repository(&repository)?;
    Ok(repository)
}
