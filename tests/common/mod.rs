// Shared fakes and fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use autopilot_lib::commands::{
    start_implementation, ImplementationManagerState, StartImplementationRequest,
};
use autopilot_lib::file_storage::{FileResult, FileStore, ImplementationStore};
use autopilot_lib::github::{
    CommitFile, CreatePRRequest, FileContent, GitHost, GitHostError, PullRequest, TreeEntry,
};
use autopilot_lib::implementation::ImplementationConfig;
use autopilot_lib::llm::{LlmClient, LlmError};
use autopilot_lib::models::{
    ActivityAction, ActivityEntry, ExecutionSession, Feedback, FileOperation, Iteration,
    Repository, SessionStatus, Task,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const TASK_ID: &str = "task-0001";
pub const REPO_ID: &str = "repo-0001";

pub const CRITERIA: [&str; 3] = [
    "GET /health returns 200",
    "Response body is OK",
    "Endpoint has a unit test",
];

// ============================================================================
// Scripted LLM
// ============================================================================

pub enum Scripted {
    Text(String),
    /// Stays in flight until `ScriptedLlm::release`, then answers
    Held(String),
    Stall(Duration),
    Fail,
}

/// Answers completions from a queue and records every prompt it saw
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Scripted>>,
    prompts: Mutex<Vec<String>>,
    held: AtomicBool,
    release: Notify,
}

impl ScriptedLlm {
    pub fn push(&self, response: Scripted) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_text(&self, text: String) {
        self.push(Scripted::Text(text));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Let the held call answer
    pub fn release(&self) {
        self.release.notify_one();
    }

    pub async fn wait_until_held(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while !self.held.load(Ordering::SeqCst) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no LLM call was held"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(user_prompt.to_string());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Held(text)) => {
                self.held.store(true, Ordering::SeqCst);
                self.release.notified().await;
                self.held.store(false, Ordering::SeqCst);
                Ok(text)
            }
            Some(Scripted::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Err(LlmError::EmptyResponse)
            }
            Some(Scripted::Fail) => Err(LlmError::Api {
                status: 529,
                message: "overloaded".to_string(),
            }),
            None => Err(LlmError::Transport("script exhausted".to_string())),
        }
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    fn provider_name(&self) -> &str {
        "Scripted"
    }
}

// ============================================================================
// In-memory git host
// ============================================================================

#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub branch: String,
    pub message: String,
    pub files: Vec<CommitFile>,
    pub sha: String,
}

/// Single-tree git host: every branch sees the same files
#[derive(Default)]
pub struct FakeHost {
    files: Mutex<BTreeMap<String, String>>,
    branches: Mutex<HashSet<String>>,
    commits: Mutex<Vec<RecordedCommit>>,
    pull_requests: Mutex<Vec<CreatePRRequest>>,
    deleted_branches: Mutex<Vec<String>>,
    resets: Mutex<Vec<(String, String)>>,
    pub fail_pull_requests: AtomicBool,
    pub fail_delete_branch: AtomicBool,
}

impl FakeHost {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let host = Self::default();
        {
            let mut stored = host.files.lock().unwrap();
            for (path, content) in files {
                stored.insert(path.to_string(), content.to_string());
            }
        }
        host
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.commits.lock().unwrap().clone()
    }

    pub fn pull_requests(&self) -> Vec<CreatePRRequest> {
        self.pull_requests.lock().unwrap().clone()
    }

    pub fn deleted_branches(&self) -> Vec<String> {
        self.deleted_branches.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<(String, String)> {
        self.resets.lock().unwrap().clone()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.lock().unwrap().contains(branch)
    }
}

#[async_trait]
impl GitHost for FakeHost {
    async fn branch_exists(&self, _repo: &Repository, branch: &str) -> Result<bool, GitHostError> {
        Ok(self.has_branch(branch))
    }

    async fn create_branch(
        &self,
        _repo: &Repository,
        branch: &str,
        _from_ref: &str,
    ) -> Result<(), GitHostError> {
        if !self.branches.lock().unwrap().insert(branch.to_string()) {
            return Err(GitHostError::AlreadyExists(branch.to_string()));
        }
        Ok(())
    }

    async fn get_tree(
        &self,
        _repo: &Repository,
        _git_ref: &str,
    ) -> Result<Vec<TreeEntry>, GitHostError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(path, content)| TreeEntry {
                path: path.clone(),
                entry_type: "blob".to_string(),
                sha: format!("blob-{}", path),
                size: Some(content.len() as u64),
            })
            .collect())
    }

    async fn get_file_content(
        &self,
        _repo: &Repository,
        path: &str,
        _git_ref: &str,
    ) -> Result<FileContent, GitHostError> {
        match self.file(path) {
            Some(content) => Ok(FileContent {
                path: path.to_string(),
                content,
                sha: format!("blob-{}", path),
                encoding: "base64".to_string(),
            }),
            None => Err(GitHostError::NotFound(path.to_string())),
        }
    }

    async fn create_commit(
        &self,
        _repo: &Repository,
        branch: &str,
        message: &str,
        files: &[CommitFile],
    ) -> Result<String, GitHostError> {
        {
            let mut stored = self.files.lock().unwrap();
            for file in files {
                match &file.content {
                    Some(content) => stored.insert(file.path.clone(), content.clone()),
                    None => stored.remove(&file.path),
                };
            }
        }
        let mut commits = self.commits.lock().unwrap();
        let sha = format!("sha-{}", commits.len() + 1);
        commits.push(RecordedCommit {
            branch: branch.to_string(),
            message: message.to_string(),
            files: files.to_vec(),
            sha: sha.clone(),
        });
        Ok(sha)
    }

    async fn create_pull_request(
        &self,
        _repo: &Repository,
        request: CreatePRRequest,
    ) -> Result<PullRequest, GitHostError> {
        if self.fail_pull_requests.load(Ordering::SeqCst) {
            return Err(GitHostError::Api {
                status: 422,
                message: "Validation Failed".to_string(),
            });
        }
        let mut prs = self.pull_requests.lock().unwrap();
        prs.push(request.clone());
        let number = 41 + prs.len() as u64;
        Ok(PullRequest {
            number,
            title: request.title,
            state: "open".to_string(),
            html_url: format!("https://github.com/acme/widgets/pull/{}", number),
            head_branch: request.head,
            base_branch: request.base,
            draft: request.draft,
        })
    }

    async fn delete_branch(&self, _repo: &Repository, branch: &str) -> Result<(), GitHostError> {
        if self.fail_delete_branch.load(Ordering::SeqCst) {
            return Err(GitHostError::Transport("connection reset".to_string()));
        }
        self.branches.lock().unwrap().remove(branch);
        self.deleted_branches.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn reset_branch(
        &self,
        _repo: &Repository,
        branch: &str,
        sha: &str,
    ) -> Result<(), GitHostError> {
        self.resets
            .lock()
            .unwrap()
            .push((branch.to_string(), sha.to_string()));
        Ok(())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// A response that updates `src/health.rs` and self-checks the three criteria
pub fn applied_response(passed: [bool; 3], all_passed: bool, confidence: f64) -> String {
    let criteria: Vec<_> = CRITERIA
        .iter()
        .zip(passed)
        .map(|(criterion, passed)| json!({ "criterion": criterion, "passed": passed }))
        .collect();
    let body = json!({
        "changes": [{
            "path": "src/health.rs",
            "operation": "create",
            "content": format!("// confidence {}\npub fn health() -> &'static str {{ \"OK\" }}\n", confidence),
            "summary": "health handler"
        }],
        "commitMessage": "Add health endpoint",
        "selfCheck": {
            "criteria": criteria,
            "allPassed": all_passed,
            "confidence": confidence
        }
    });
    format!("Here is the change.\n\n```json\n{}\n```\n", body)
}

pub fn partial_response() -> String {
    applied_response([true, true, false], false, 0.6)
}

pub fn passing_response(confidence: f64) -> String {
    applied_response([true, true, true], true, confidence)
}

pub fn needs_input_response(reason: &str) -> String {
    format!(
        "```json\n{}\n```",
        json!({ "needsHumanInput": true, "humanInputReason": reason })
    )
}

// ============================================================================
// Store with a parking point
// ============================================================================

/// `FileStore` that can park the caller inside one activity write until released
pub struct GatedStore {
    inner: Arc<FileStore>,
    gate: Mutex<Option<(ActivityAction, mpsc::Receiver<()>)>>,
    parked: AtomicBool,
}

impl GatedStore {
    pub fn new(inner: Arc<FileStore>) -> Self {
        Self {
            inner,
            gate: Mutex::new(None),
            parked: AtomicBool::new(false),
        }
    }

    /// Park the next `action` activity write; sending on the returned channel lets it finish
    pub fn hold_activity(&self, action: ActivityAction) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some((action, rx));
        tx
    }

    pub async fn wait_until_parked(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while !self.parked.load(Ordering::SeqCst) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no activity write was parked"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl ImplementationStore for GatedStore {
    fn get_task(&self, task_id: &str) -> FileResult<Option<Task>> {
        self.inner.get_task(task_id)
    }

    fn save_task(&self, task: &Task) -> FileResult<()> {
        self.inner.save_task(task)
    }

    fn get_repository(&self, repository_id: &str) -> FileResult<Option<Repository>> {
        self.inner.get_repository(repository_id)
    }

    fn save_repository(&self, repository: &Repository) -> FileResult<()> {
        self.inner.save_repository(repository)
    }

    fn create_session(&self, session: &ExecutionSession) -> FileResult<()> {
        self.inner.create_session(session)
    }

    fn get_session(&self, session_id: &str) -> FileResult<Option<ExecutionSession>> {
        self.inner.get_session(session_id)
    }

    fn list_sessions(&self, task_id: Option<&str>) -> FileResult<Vec<ExecutionSession>> {
        self.inner.list_sessions(task_id)
    }

    fn update_session(
        &self,
        session_id: &str,
        updater: &mut dyn FnMut(&mut ExecutionSession) -> FileResult<()>,
    ) -> FileResult<ExecutionSession> {
        self.inner.update_session(session_id, updater)
    }

    fn create_iteration(&self, iteration: &Iteration) -> FileResult<()> {
        self.inner.create_iteration(iteration)
    }

    fn update_iteration(&self, iteration: &Iteration) -> FileResult<bool> {
        self.inner.update_iteration(iteration)
    }

    fn commit_iteration(
        &self,
        iteration: &Iteration,
        updater: &mut dyn FnMut(&mut ExecutionSession) -> FileResult<bool>,
    ) -> FileResult<bool> {
        self.inner.commit_iteration(iteration, updater)
    }

    fn list_iterations(&self, session_id: &str) -> FileResult<Vec<Iteration>> {
        self.inner.list_iterations(session_id)
    }

    fn delete_iterations_after(
        &self,
        session_id: &str,
        iteration_number: u32,
    ) -> FileResult<Vec<Iteration>> {
        self.inner.delete_iterations_after(session_id, iteration_number)
    }

    fn record_file_operation(&self, operation: &FileOperation) -> FileResult<bool> {
        self.inner.record_file_operation(operation)
    }

    fn list_file_operations(&self, session_id: &str) -> FileResult<Vec<FileOperation>> {
        self.inner.list_file_operations(session_id)
    }

    fn delete_file_operations_after(
        &self,
        session_id: &str,
        iteration_number: u32,
    ) -> FileResult<usize> {
        self.inner
            .delete_file_operations_after(session_id, iteration_number)
    }

    fn create_feedback(&self, feedback: &Feedback) -> FileResult<()> {
        self.inner.create_feedback(feedback)
    }

    fn list_feedback(&self, session_id: &str) -> FileResult<Vec<Feedback>> {
        self.inner.list_feedback(session_id)
    }

    fn delete_feedback_for_iterations(
        &self,
        session_id: &str,
        iteration_ids: &[String],
    ) -> FileResult<usize> {
        self.inner
            .delete_feedback_for_iterations(session_id, iteration_ids)
    }

    fn append_activity(&self, entry: &ActivityEntry) -> FileResult<()> {
        let held = {
            let mut gate = self.gate.lock().unwrap();
            match gate.take() {
                Some((action, rx)) if action == entry.action => Some(rx),
                other => {
                    *gate = other;
                    None
                }
            }
        };
        if let Some(rx) = held {
            self.parked.store(true, Ordering::SeqCst);
            let _ = rx.recv_timeout(Duration::from_secs(20));
            self.parked.store(false, Ordering::SeqCst);
        }
        self.inner.append_activity(entry)
    }

    fn list_activity(&self, task_id: &str) -> FileResult<Vec<ActivityEntry>> {
        self.inner.list_activity(task_id)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn fast_config() -> ImplementationConfig {
    let mut config = ImplementationConfig::default();
    config.loop_settings.inter_iteration_delay_ms = 1;
    config.loop_settings.feedback_poll_interval_ms = 10;
    config.loop_settings.feedback_timeout_secs = 30;
    config.llm.timeout_secs = 5;
    config.git_host.timeout_secs = 5;
    config
}

pub struct Harness {
    _temp: TempDir,
    pub store: Arc<FileStore>,
    /// The store the manager writes through
    pub gate: Arc<GatedStore>,
    pub host: Arc<FakeHost>,
    pub llm: Arc<ScriptedLlm>,
    pub manager: ImplementationManagerState,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: ImplementationConfig) -> Self {
        Self::with_host(config, FakeHost::with_files(&[("README.md", "# Widgets\n")]))
    }

    pub fn with_host(config: ImplementationConfig, host: FakeHost) -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(temp.path()).unwrap());
        store
            .save_task(&Task {
                id: TASK_ID.to_string(),
                project_id: "proj-1".to_string(),
                title: "Add health endpoint".to_string(),
                description: format!(
                    "Expose a health check.\n\n## Acceptance Criteria\n\n- {}\n- {}\n- {}\n",
                    CRITERIA[0], CRITERIA[1], CRITERIA[2]
                ),
            })
            .unwrap();
        store
            .save_repository(&Repository {
                id: REPO_ID.to_string(),
                owner: "acme".to_string(),
                name: "widgets".to_string(),
                default_branch: "main".to_string(),
            })
            .unwrap();

        let host = Arc::new(host);
        let llm = Arc::new(ScriptedLlm::default());
        let gate = Arc::new(GatedStore::new(store.clone()));
        let manager =
            ImplementationManagerState::new(gate.clone(), host.clone(), llm.clone(), config);

        Self {
            _temp: temp,
            store,
            gate,
            host,
            llm,
            manager,
        }
    }

    pub async fn start(&self, max_iterations: u32) -> ExecutionSession {
        start_implementation(
            StartImplementationRequest {
                task_id: TASK_ID.to_string(),
                repository_id: REPO_ID.to_string(),
                started_by: "alice".to_string(),
                max_iterations: Some(max_iterations),
                source_branch: None,
            },
            &self.manager,
        )
        .await
        .unwrap()
    }

    pub fn session(&self, session_id: &str) -> ExecutionSession {
        self.store.get_session(session_id).unwrap().unwrap()
    }

    pub async fn wait_idle(&self, session_id: &str) {
        assert!(
            self.manager
                .wait_until_idle(session_id, Duration::from_secs(20))
                .await,
            "runner for {} did not finish",
            session_id
        );
    }

    /// Poll until the session reaches `status`
    pub async fn wait_for_status(&self, session_id: &str, status: SessionStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            if self.session(session_id).status == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {} never reached {}, still {}",
                session_id,
                status,
                self.session(session_id).status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
