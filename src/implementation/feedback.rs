// Feedback gateway: human input into a running or suspended session

use super::record_activity;
use crate::file_storage::ImplementationStore;
use crate::models::state_machine::{transition_state, FEEDBACK_ACCEPTING_STATES};
use crate::models::{
    ActivityAction, Feedback, FeedbackType, SessionStage, SessionStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session not accepting feedback: status is {status}, accepted states are {accepted}")]
    NotAccepting {
        status: SessionStatus,
        accepted: String,
    },

    #[error("Iteration {0} does not belong to this session")]
    UnknownIteration(String),

    #[error("Feedback content cannot be empty for {0:?}")]
    EmptyContent(FeedbackType),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitFeedbackRequest {
    pub session_id: String,
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub content: String,
    pub created_by: String,
    #[serde(default)]
    pub iteration_id: Option<String>,
}

/// What the gateway did, so the caller can decide whether a runner is needed
#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub feedback: Feedback,
    pub previous_status: SessionStatus,
    pub status: SessionStatus,
}

impl FeedbackOutcome {
    /// Guidance revived a suspended session; its loop has to run again
    pub fn resumed(&self) -> bool {
        self.status == SessionStatus::Running && self.previous_status != SessionStatus::Running
    }

    /// An approval finished the session; its pull request is still to be opened
    pub fn approved(&self) -> bool {
        self.status == SessionStatus::Succeeded && self.previous_status != SessionStatus::Succeeded
    }
}

fn accepted_states() -> String {
    FEEDBACK_ACCEPTING_STATES
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Persist feedback and apply its effect on the session status.
///
/// - `abort` cancels the session
/// - `approval` finishes a waiting or stuck session as SUCCEEDED
/// - `guidance` / `rejection` move a waiting or stuck session back to RUNNING
///
/// Feedback on a RUNNING session is stored for the next iteration without a transition.
pub fn submit_feedback(
    store: &dyn ImplementationStore,
    request: SubmitFeedbackRequest,
) -> Result<FeedbackOutcome, FeedbackError> {
    let session = store
        .get_session(&request.session_id)
        .map_err(FeedbackError::Storage)?
        .ok_or_else(|| FeedbackError::SessionNotFound(request.session_id.clone()))?;

    if !FEEDBACK_ACCEPTING_STATES.contains(&session.status) {
        return Err(FeedbackError::NotAccepting {
            status: session.status,
            accepted: accepted_states(),
        });
    }

    if request.feedback_type.is_guidance_like() && request.content.trim().is_empty() {
        return Err(FeedbackError::EmptyContent(request.feedback_type));
    }

    if let Some(iteration_id) = &request.iteration_id {
        let belongs = store
            .list_iterations(&session.id)
            .map_err(FeedbackError::Storage)?
            .iter()
            .any(|i| &i.id == iteration_id);
        if !belongs {
            return Err(FeedbackError::UnknownIteration(iteration_id.clone()));
        }
    }

    // Stored before the status flips so a resuming runner sees it in its prompt
    let feedback = Feedback::new(
        &session.id,
        request.feedback_type,
        request.content.trim(),
        request.created_by.clone(),
        request.iteration_id.clone(),
    );
    store
        .create_feedback(&feedback)
        .map_err(FeedbackError::Storage)?;

    log::info!(
        "[Feedback] {:?} from {} on session {} ({})",
        feedback.feedback_type,
        feedback.created_by,
        session.id,
        session.status
    );

    let mut previous_status = session.status;
    let mut rejected: Option<SessionStatus> = None;
    let updated = store
        .update_session(&session.id, &mut |s| {
            previous_status = s.status;
            if !FEEDBACK_ACCEPTING_STATES.contains(&s.status) {
                rejected = Some(s.status);
                return Err(format!("session is {}", s.status));
            }

            let suspended = matches!(
                s.status,
                SessionStatus::WaitingFeedback | SessionStatus::Stuck
            );
            match feedback.feedback_type {
                FeedbackType::Abort => {
                    s.status = transition_state(s.status, SessionStatus::Cancelled)
                        .map_err(|e| e.to_string())?;
                    s.stage = SessionStage::Cancelled;
                    s.completed_at = Some(Utc::now());
                }
                FeedbackType::Approval if suspended => {
                    s.status = transition_state(s.status, SessionStatus::Succeeded)
                        .map_err(|e| e.to_string())?;
                    s.stuck_reason = None;
                    s.completed_at = None;
                }
                FeedbackType::Guidance | FeedbackType::Rejection if suspended => {
                    s.status = transition_state(s.status, SessionStatus::Running)
                        .map_err(|e| e.to_string())?;
                    s.stuck_reason = None;
                    s.completed_at = None;
                }
                _ => {}
            }
            Ok(())
        });

    let updated = match (updated, rejected) {
        (_, Some(status)) => {
            // The feedback row stays; the session ended between the check and the write
            log::warn!(
                "[Feedback] Session {} became {} before feedback could be applied",
                session.id,
                status
            );
            return Err(FeedbackError::NotAccepting {
                status,
                accepted: accepted_states(),
            });
        }
        (Ok(updated), None) => updated,
        (Err(e), None) => return Err(FeedbackError::Storage(e)),
    };

    if updated.status == SessionStatus::Cancelled && previous_status != SessionStatus::Cancelled {
        log::warn!("[Feedback] Session {} aborted by {}", updated.id, feedback.created_by);
        record_activity(
            store,
            &updated,
            ActivityAction::ImplementationCancelled,
            &feedback.created_by,
            json!({
                "sessionId": updated.id,
                "reason": feedback.content,
                "iteration": updated.current_iteration,
            }),
        );
    }

    Ok(FeedbackOutcome {
        feedback,
        previous_status,
        status: updated.status,
    })
}
