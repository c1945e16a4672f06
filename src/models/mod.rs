// Data models shared by the implementation loop, storage and the command API

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// External rows (owned by the wider application)
// =============================================================================

/// A project task that an implementation session works on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    /// Free-text description, usually markdown, holding the acceptance criteria
    #[serde(default)]
    pub description: String,
}

/// A remote repository on the git host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub owner: String,
    pub name: String,
    #[serde(default = "default_branch_name")]
    pub default_branch: String,
}

fn default_branch_name() -> String {
    "main".to_string()
}

impl Repository {
    /// `owner/name` form used in logs and PR bodies
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Role of the acting user within the task's project, resolved by the caller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRole {
    Viewer,
    Member,
    Maintainer,
    Owner,
    Admin,
}

impl ProjectRole {
    /// Destructive history operations are restricted to elevated roles
    pub fn can_rollback(&self) -> bool {
        matches!(
            self,
            ProjectRole::Maintainer | ProjectRole::Owner | ProjectRole::Admin
        )
    }
}

// =============================================================================
// Execution session
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Running,
    WaitingFeedback,
    Succeeded,
    Failed,
    Stuck,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::WaitingFeedback => "waiting_feedback",
            SessionStatus::Succeeded => "succeeded",
            SessionStatus::Failed => "failed",
            SessionStatus::Stuck => "stuck",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fine-grained progress marker, persisted on every change so pollers see it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    Initializing,
    PreparingBranch,
    AnalyzingRepository,
    GeneratingCode,
    ApplyingChanges,
    Verifying,
    WaitingFeedback,
    CreatingPr,
    Completed,
    Failed,
    Stuck,
    Cancelled,
}

/// One end-to-end autonomous attempt to implement a task on its own branch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSession {
    pub id: String,
    pub task_id: String,
    pub repository_id: String,
    pub started_by: String,
    pub status: SessionStatus,
    pub stage: SessionStage,
    /// Number of the most recently completed iteration
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub implementation_branch: String,
    pub source_branch: String,
    /// Sum over committed iterations of the changes each commit carried; a path
    /// edited in several iterations counts once per iteration
    #[serde(default)]
    pub total_files_changed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionSession {
    pub fn is_terminal(&self) -> bool {
        state_machine::is_terminal_state(self.status)
    }
}

// =============================================================================
// Iterations and file operations
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationKind {
    Create,
    Update,
    Delete,
    Rename,
}

impl FileOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperationKind::Create => "create",
            FileOperationKind::Update => "update",
            FileOperationKind::Delete => "delete",
            FileOperationKind::Rename => "rename",
        }
    }
}

/// Short description of one change applied in an iteration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub file: String,
    pub operation: FileOperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Self-check outcome for a single acceptance criterion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Verification recorded for an iteration, taken from the model's self-check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResults {
    /// Fraction of criteria reported as passed
    pub score: f64,
    pub all_passed: bool,
    pub confidence: f64,
    #[serde(default)]
    pub criteria: Vec<CriterionResult>,
}

impl VerificationResults {
    /// Whether this verification is good enough to finish the session
    pub fn meets_threshold(&self, min_confidence: f64) -> bool {
        self.all_passed && self.confidence >= min_confidence
    }

    pub fn passed_count(&self) -> u32 {
        self.criteria.iter().filter(|c| c.passed).count() as u32
    }
}

/// One LLM-driven attempt within a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    pub id: String,
    pub session_id: String,
    /// 1-based, gapless within a session
    pub iteration_number: u32,
    #[serde(default)]
    pub criteria_total: u32,
    #[serde(default)]
    pub criteria_passed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_sent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_received: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub changes_made: Vec<ChangeSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_results: Option<VerificationResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub needs_human_input: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Iteration {
    pub fn new(session_id: &str, iteration_number: u32, criteria_total: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            iteration_number,
            criteria_total,
            criteria_passed: 0,
            prompt_sent: None,
            response_received: None,
            commit_sha: None,
            commit_message: None,
            changes_made: Vec::new(),
            verification_results: None,
            blocked_reason: None,
            needs_human_input: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// A file-level change attempted within an iteration, recorded before the commit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperation {
    pub id: String,
    pub session_id: String,
    pub iteration_id: String,
    pub iteration_number: u32,
    pub file_path: String,
    pub operation: FileOperationKind,
    /// Source path of a rename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_content: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Human feedback
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Guidance,
    Approval,
    Rejection,
    Abort,
}

impl FeedbackType {
    /// Feedback whose content should be shown to the model on the next iteration
    pub fn is_guidance_like(&self) -> bool {
        matches!(self, FeedbackType::Guidance | FeedbackType::Rejection)
    }
}

impl std::str::FromStr for FeedbackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "guidance" => Ok(FeedbackType::Guidance),
            "approval" => Ok(FeedbackType::Approval),
            "rejection" => Ok(FeedbackType::Rejection),
            "abort" => Ok(FeedbackType::Abort),
            _ => Err(format!(
                "Unknown feedback type: '{}'. Expected one of: guidance, approval, rejection, abort",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_id: Option<String>,
    pub feedback_type: FeedbackType,
    pub content: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Feedback {
    pub fn new(
        session_id: &str,
        feedback_type: FeedbackType,
        content: impl Into<String>,
        created_by: impl Into<String>,
        iteration_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            iteration_id,
            feedback_type,
            content: content.into(),
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Task activity log
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    ImplementationStarted,
    ImplementationCompleted,
    ImplementationFailed,
    ImplementationStuck,
    ImplementationCancelled,
    ImplementationRolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub task_id: String,
    pub action: ActivityAction,
    pub actor: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        task_id: &str,
        action: ActivityAction,
        actor: &str,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            action,
            actor: actor.to_string(),
            details,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::WaitingFeedback).unwrap();
        assert_eq!(json, "\"waiting_feedback\"");
        let parsed: SessionStatus = serde_json::from_str("\"stuck\"").unwrap();
        assert_eq!(parsed, SessionStatus::Stuck);
    }

    #[test]
    fn test_meets_threshold_requires_both() {
        let mut v = VerificationResults {
            score: 1.0,
            all_passed: true,
            confidence: 0.8,
            criteria: vec![],
        };
        assert!(v.meets_threshold(0.8));

        v.confidence = 0.79;
        assert!(!v.meets_threshold(0.8));

        v.confidence = 0.95;
        v.all_passed = false;
        assert!(!v.meets_threshold(0.8));
    }

    #[test]
    fn test_rollback_roles() {
        assert!(ProjectRole::Maintainer.can_rollback());
        assert!(ProjectRole::Owner.can_rollback());
        assert!(ProjectRole::Admin.can_rollback());
        assert!(!ProjectRole::Member.can_rollback());
        assert!(!ProjectRole::Viewer.can_rollback());
    }

    #[test]
    fn test_feedback_type_from_str() {
        assert_eq!("Abort".parse::<FeedbackType>().unwrap(), FeedbackType::Abort);
        assert!("later".parse::<FeedbackType>().is_err());
        assert!(FeedbackType::Rejection.is_guidance_like());
        assert!(!FeedbackType::Approval.is_guidance_like());
    }

    #[test]
    fn test_iteration_camel_case() {
        let iteration = Iteration::new("s1", 3, 4);
        let value = serde_json::to_value(&iteration).unwrap();
        assert_eq!(value["iterationNumber"], 3);
        assert_eq!(value["criteriaTotal"], 4);
        assert!(value.get("completedAt").is_none());
        assert!(iteration.is_in_flight());
    }
}
