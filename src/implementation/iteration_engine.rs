//! Iteration Engine - one LLM call turned into one commit
//!
//! An iteration snapshots the branch, renders the prompt, calls the model once,
//! parses the structured answer and applies the declared changes as a single
//! multi-file commit. The self-check in the answer is taken as the verification
//! result; nothing is re-run against the repository.

use super::config::ImplementationConfig;
use super::context_builder::build_context;
use super::prompt_builder::{build_iteration_prompt, PromptInput, SYSTEM_PROMPT};
use super::response_parser::{parse_implementation_response, FileChange, ImplementationResult};
use super::ImplementationError;
use crate::file_storage::ImplementationStore;
use crate::github::{CommitFile, GitHost};
use crate::llm::LlmClient;
use crate::models::{
    ChangeSummary, ExecutionSession, Feedback, FileOperation, FileOperationKind, Iteration,
    Repository, SessionStage, Task, VerificationResults,
};
use chrono::Utc;

/// Stuck reason for a response that could not be parsed
pub const MALFORMED_RESPONSE_REASON: &str = "AI response was not in expected format";

/// Result of one iteration as seen by the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// The model asked for a human decision; nothing was applied
    NeedsHumanInput { reason: String },
    /// Changes were applied (or the commit failed and was tolerated)
    Applied {
        verification: VerificationResults,
        files_changed: u32,
    },
    /// The iteration cannot continue without a human
    Stuck { reason: String },
    /// A rollback removed this iteration while it ran; nothing was committed
    Superseded,
}

/// Everything one iteration works from
pub struct IterationRequest<'a> {
    pub session: &'a ExecutionSession,
    pub task: &'a Task,
    pub repository: &'a Repository,
    pub criteria: &'a [String],
    pub previous_iterations: &'a [Iteration],
    pub human_feedback: Option<&'a Feedback>,
}

pub struct IterationEngine<'a> {
    store: &'a dyn ImplementationStore,
    host: &'a dyn GitHost,
    llm: &'a dyn LlmClient,
    config: &'a ImplementationConfig,
}

impl<'a> IterationEngine<'a> {
    pub fn new(
        store: &'a dyn ImplementationStore,
        host: &'a dyn GitHost,
        llm: &'a dyn LlmClient,
        config: &'a ImplementationConfig,
    ) -> Self {
        Self {
            store,
            host,
            llm,
            config,
        }
    }

    /// Run one iteration, filling in `iteration` as it goes.
    ///
    /// The iteration record is persisted after the prompt is built and again after
    /// the response arrives; completing it is left to the caller.
    pub async fn run(
        &self,
        request: &IterationRequest<'_>,
        iteration: &mut Iteration,
    ) -> Result<IterationOutcome, ImplementationError> {
        let session = request.session;
        let branch = session.implementation_branch.as_str();

        self.set_stage(&session.id, SessionStage::AnalyzingRepository)?;
        let context = build_context(
            self.host,
            request.repository,
            branch,
            request.task,
            request.criteria,
            &self.config.context,
        )
        .await?;

        let prompt = build_iteration_prompt(&PromptInput {
            task: request.task,
            repository: request.repository,
            branch,
            criteria: request.criteria,
            iteration_number: iteration.iteration_number,
            max_iterations: session.max_iterations,
            context: &context,
            previous_iterations: request.previous_iterations,
            human_feedback: request.human_feedback,
        });
        iteration.prompt_sent = Some(prompt.clone());
        if !self.save(iteration)? {
            return Ok(IterationOutcome::Superseded);
        }

        self.set_stage(&session.id, SessionStage::GeneratingCode)?;
        log::info!(
            "[IterationEngine] Calling {} ({}) for iteration {} of session {}",
            self.llm.provider_name(),
            self.llm.model_name(),
            iteration.iteration_number,
            session.id
        );
        let llm_timeout = self.config.llm.timeout();
        let raw = match tokio::time::timeout(llm_timeout, self.llm.complete(SYSTEM_PROMPT, &prompt))
            .await
        {
            Ok(response) => response?,
            Err(_) => {
                let reason = format!(
                    "stalled call: LLM did not respond within {}s",
                    llm_timeout.as_secs()
                );
                iteration.blocked_reason = Some(reason.clone());
                return Ok(IterationOutcome::Stuck { reason });
            }
        };
        iteration.response_received = Some(raw.clone());
        if !self.save(iteration)? {
            return Ok(IterationOutcome::Superseded);
        }

        let result = match parse_implementation_response(&raw) {
            Ok(result) => result,
            Err(e) => {
                log::warn!(
                    "[IterationEngine] Unparseable response in iteration {}: {}",
                    iteration.iteration_number,
                    e
                );
                iteration.blocked_reason = Some(format!("{}: {}", MALFORMED_RESPONSE_REASON, e));
                return Ok(IterationOutcome::Stuck {
                    reason: MALFORMED_RESPONSE_REASON.to_string(),
                });
            }
        };

        if result.needs_human_input {
            let reason = result
                .human_input_reason
                .clone()
                .unwrap_or_else(|| "human input requested".to_string());
            log::info!(
                "[IterationEngine] Iteration {} needs human input: {}",
                iteration.iteration_number,
                reason
            );
            return Ok(IterationOutcome::NeedsHumanInput { reason });
        }

        self.set_stage(&session.id, SessionStage::ApplyingChanges)?;
        let Some(files_changed) = self
            .apply_changes(request.repository, branch, &result, iteration)
            .await?
        else {
            return Ok(IterationOutcome::Superseded);
        };

        self.set_stage(&session.id, SessionStage::Verifying)?;
        // The parser guarantees a self-check whenever no human input is requested
        let verification = result.verification().unwrap_or(VerificationResults {
            score: 0.0,
            all_passed: false,
            confidence: 0.0,
            criteria: Vec::new(),
        });
        iteration.criteria_passed = verification.passed_count().min(iteration.criteria_total);
        iteration.verification_results = Some(verification.clone());

        log::info!(
            "[IterationEngine] Iteration {}: {}/{} criteria passed, allPassed={}, confidence={:.2}",
            iteration.iteration_number,
            iteration.criteria_passed,
            iteration.criteria_total,
            verification.all_passed,
            verification.confidence
        );

        Ok(IterationOutcome::Applied {
            verification,
            files_changed,
        })
    }

    /// Snapshot, record and commit every change.
    ///
    /// Returns the number of changes the commit carried (a rename counts once), or
    /// `None` when the iteration was rolled back before its commit.
    async fn apply_changes(
        &self,
        repo: &Repository,
        branch: &str,
        result: &ImplementationResult,
        iteration: &mut Iteration,
    ) -> Result<Option<u32>, ImplementationError> {
        if result.changes.is_empty() {
            return Ok(Some(0));
        }

        let mut commit_files = Vec::with_capacity(result.changes.len());
        let mut applied = 0u32;
        for change in &result.changes {
            let snapshot = self.snapshot(repo, branch, change).await;
            let operation = FileOperation {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: iteration.session_id.clone(),
                iteration_id: iteration.id.clone(),
                iteration_number: iteration.iteration_number,
                file_path: change.path.clone(),
                operation: change.operation,
                previous_path: change.previous_path.clone(),
                before_sha: snapshot.as_ref().map(|(sha, _)| sha.clone()),
                before_content: snapshot.as_ref().map(|(_, content)| content.clone()),
                created_at: Utc::now(),
            };
            let recorded = self
                .store
                .record_file_operation(&operation)
                .map_err(ImplementationError::Storage)?;
            if !recorded {
                log::info!(
                    "[IterationEngine] Iteration {} was rolled back, dropping its changes",
                    iteration.iteration_number
                );
                return Ok(None);
            }

            match change.operation {
                FileOperationKind::Create | FileOperationKind::Update => {
                    commit_files.push(CommitFile::write(
                        change.path.clone(),
                        change.content.clone().unwrap_or_default(),
                    ));
                    applied += 1;
                }
                FileOperationKind::Delete => {
                    commit_files.push(CommitFile::delete(change.path.clone()));
                    applied += 1;
                }
                FileOperationKind::Rename => {
                    let content = change
                        .content
                        .clone()
                        .or_else(|| snapshot.map(|(_, content)| content));
                    match (content, change.previous_path.as_deref()) {
                        (Some(content), Some(previous)) => {
                            commit_files.push(CommitFile::write(change.path.clone(), content));
                            commit_files.push(CommitFile::delete(previous));
                            applied += 1;
                        }
                        _ => log::warn!(
                            "[IterationEngine] Skipping rename to {}: no content for the source file",
                            change.path
                        ),
                    }
                }
            }

            iteration.changes_made.push(ChangeSummary {
                file: change.path.clone(),
                operation: change.operation,
                summary: change.summary.clone(),
            });
        }

        let message = result
            .commit_message
            .clone()
            .unwrap_or_else(|| format!("Iteration {}", iteration.iteration_number));
        iteration.commit_message = Some(message.clone());

        if commit_files.is_empty() {
            return Ok(Some(0));
        }
        // Last check before the branch moves
        if !self.save(iteration)? {
            return Ok(None);
        }
        if self.session_ended(&iteration.session_id)? {
            log::info!(
                "[IterationEngine] Session {} ended during iteration {}, not committing",
                iteration.session_id,
                iteration.iteration_number
            );
            return Ok(Some(0));
        }

        match self
            .host
            .create_commit(repo, branch, &message, &commit_files)
            .await
        {
            Ok(sha) => {
                log::info!(
                    "[IterationEngine] Committed {} files to {} as {}",
                    commit_files.len(),
                    branch,
                    sha
                );
                iteration.commit_sha = Some(sha);
                Ok(Some(applied))
            }
            Err(e) => {
                log::warn!(
                    "[IterationEngine] Commit failed for iteration {}, continuing: {}",
                    iteration.iteration_number,
                    e
                );
                Ok(Some(0))
            }
        }
    }

    /// Pre-change `(sha, content)` of the file a change touches, if it exists
    async fn snapshot(
        &self,
        repo: &Repository,
        branch: &str,
        change: &FileChange,
    ) -> Option<(String, String)> {
        let path = match change.operation {
            FileOperationKind::Create => return None,
            FileOperationKind::Update | FileOperationKind::Delete => change.path.as_str(),
            FileOperationKind::Rename => change.previous_path.as_deref()?,
        };

        match self.host.get_file_content(repo, path, branch).await {
            Ok(file) => Some((file.sha, file.content)),
            Err(e) if e.is_not_found() => {
                log::debug!("[IterationEngine] No existing file at {}", path);
                None
            }
            Err(e) => {
                log::warn!("[IterationEngine] Could not snapshot {}: {}", path, e);
                None
            }
        }
    }

    fn session_ended(&self, session_id: &str) -> Result<bool, ImplementationError> {
        Ok(self
            .store
            .get_session(session_id)
            .map_err(ImplementationError::Storage)?
            .map_or(true, |s| s.is_terminal()))
    }

    /// Persist the iteration row; `false` once a rollback has removed it
    fn save(&self, iteration: &Iteration) -> Result<bool, ImplementationError> {
        self.store
            .update_iteration(iteration)
            .map_err(ImplementationError::Storage)
    }

    fn set_stage(&self, session_id: &str, stage: SessionStage) -> Result<(), ImplementationError> {
        super::persist_stage(self.store, session_id, stage)
    }
}
