//! Rollback Manager - rewind or abandon an implementation session
//!
//! A partial rollback drops every iteration above a target number together with
//! its file operations and feedback, then hands the session back to the loop.
//! Commits made by the dropped iterations stay on the branch unless
//! `rollback.reset_branch` is enabled.
//!
//! A full rollback deletes the implementation branch and cancels the session.

use super::config::RollbackSettings;
use super::record_activity;
use crate::file_storage::ImplementationStore;
use crate::github::GitHost;
use crate::models::state_machine::{transition_state, ROLLBACK_ACCEPTING_STATES};
use crate::models::{
    ActivityAction, ExecutionSession, Feedback, FeedbackType, ProjectRole, SessionStage,
    SessionStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Insufficient permissions: rollback requires maintainer, owner or admin role")]
    Forbidden,

    #[error("Session cannot be rolled back while {0}")]
    InvalidState(SessionStatus),

    #[error("Cannot roll back to iteration {target}: session is at iteration {current}")]
    InvalidTarget { target: u32, current: u32 },

    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub session_id: String,
    pub reason: String,
    pub requested_by: String,
    pub role: ProjectRole,
    /// Keep iterations up to this number; `None` abandons the whole session
    #[serde(default)]
    pub to_iteration_number: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub branch_deleted: bool,
    pub session_cancelled: bool,
    pub rolled_back_to: Option<u32>,
    pub iterations_removed: usize,
    /// Branch ref moved back to the target iteration's commit
    #[serde(default)]
    pub branch_reset: bool,
}

pub async fn rollback_session(
    store: &dyn ImplementationStore,
    host: &dyn GitHost,
    settings: &RollbackSettings,
    request: RollbackRequest,
) -> Result<RollbackOutcome, RollbackError> {
    if !request.role.can_rollback() {
        log::warn!(
            "[Rollback] {} ({:?}) denied rollback of session {}",
            request.requested_by,
            request.role,
            request.session_id
        );
        return Err(RollbackError::Forbidden);
    }

    let session = store
        .get_session(&request.session_id)
        .map_err(RollbackError::Storage)?
        .ok_or_else(|| RollbackError::SessionNotFound(request.session_id.clone()))?;

    if !ROLLBACK_ACCEPTING_STATES.contains(&session.status) {
        return Err(RollbackError::InvalidState(session.status));
    }

    match request.to_iteration_number {
        Some(target) => partial_rollback(store, host, settings, &session, &request, target).await,
        None => full_rollback(store, host, &session, &request).await,
    }
}

async fn partial_rollback(
    store: &dyn ImplementationStore,
    host: &dyn GitHost,
    settings: &RollbackSettings,
    session: &ExecutionSession,
    request: &RollbackRequest,
    target: u32,
) -> Result<RollbackOutcome, RollbackError> {
    if target > session.current_iteration {
        return Err(RollbackError::InvalidTarget {
            target,
            current: session.current_iteration,
        });
    }

    let removed = store
        .delete_iterations_after(&session.id, target)
        .map_err(RollbackError::Storage)?;
    let removed_ids: Vec<String> = removed.iter().map(|i| i.id.clone()).collect();
    let operations_removed = store
        .delete_file_operations_after(&session.id, target)
        .map_err(RollbackError::Storage)?;
    let feedback_removed = store
        .delete_feedback_for_iterations(&session.id, &removed_ids)
        .map_err(RollbackError::Storage)?;

    log::info!(
        "[Rollback] Session {} rewound to iteration {}: {} iterations, {} file operations, {} feedback removed",
        session.id,
        target,
        removed.len(),
        operations_removed,
        feedback_removed
    );

    let branch_reset = if settings.reset_branch {
        reset_branch_to(store, host, session, target).await?
    } else {
        false
    };

    let updated = store
        .update_session(&session.id, &mut |s| {
            s.status = transition_state(s.status, SessionStatus::Running).map_err(|e| e.to_string())?;
            s.stage = SessionStage::AnalyzingRepository;
            s.current_iteration = target;
            s.stuck_reason = None;
            s.error_message = None;
            s.completed_at = None;
            Ok(())
        })
        .map_err(RollbackError::Storage)?;

    let feedback = Feedback::new(
        &session.id,
        FeedbackType::Guidance,
        format!("Rolled back to iteration {}: {}", target, request.reason),
        request.requested_by.clone(),
        None,
    );
    store
        .create_feedback(&feedback)
        .map_err(RollbackError::Storage)?;

    record_activity(
        store,
        &updated,
        ActivityAction::ImplementationRolledBack,
        &request.requested_by,
        json!({
            "sessionId": session.id,
            "mode": "partial",
            "toIteration": target,
            "iterationsRemoved": removed.len(),
            "branchReset": branch_reset,
            "reason": request.reason,
        }),
    );

    Ok(RollbackOutcome {
        branch_deleted: false,
        session_cancelled: false,
        rolled_back_to: Some(target),
        iterations_removed: removed.len(),
        branch_reset,
    })
}

/// Force the branch back to the newest commit recorded at or below `target`
async fn reset_branch_to(
    store: &dyn ImplementationStore,
    host: &dyn GitHost,
    session: &ExecutionSession,
    target: u32,
) -> Result<bool, RollbackError> {
    let commit = store
        .list_iterations(&session.id)
        .map_err(RollbackError::Storage)?
        .into_iter()
        .rev()
        .find_map(|i| i.commit_sha);
    let Some(sha) = commit else {
        log::info!(
            "[Rollback] No commit recorded up to iteration {}, branch left as is",
            target
        );
        return Ok(false);
    };

    let repo = match store
        .get_repository(&session.repository_id)
        .map_err(RollbackError::Storage)?
    {
        Some(repo) => repo,
        None => {
            log::warn!(
                "[Rollback] Repository {} not found, branch not reset",
                session.repository_id
            );
            return Ok(false);
        }
    };

    match host
        .reset_branch(&repo, &session.implementation_branch, &sha)
        .await
    {
        Ok(()) => {
            log::info!(
                "[Rollback] Reset {} to {}",
                session.implementation_branch,
                sha
            );
            Ok(true)
        }
        Err(e) => {
            log::warn!(
                "[Rollback] Failed to reset {}: {}",
                session.implementation_branch,
                e
            );
            Ok(false)
        }
    }
}

async fn full_rollback(
    store: &dyn ImplementationStore,
    host: &dyn GitHost,
    session: &ExecutionSession,
    request: &RollbackRequest,
) -> Result<RollbackOutcome, RollbackError> {
    let repo = store
        .get_repository(&session.repository_id)
        .map_err(RollbackError::Storage)?;

    let branch_deleted = match repo {
        Some(repo) => match host
            .delete_branch(&repo, &session.implementation_branch)
            .await
        {
            Ok(()) => {
                log::info!(
                    "[Rollback] Deleted branch {} on {}",
                    session.implementation_branch,
                    repo.full_name()
                );
                true
            }
            Err(e) => {
                log::warn!(
                    "[Rollback] Could not delete branch {}, cancelling anyway: {}",
                    session.implementation_branch,
                    e
                );
                false
            }
        },
        None => {
            log::warn!(
                "[Rollback] Repository {} not found, branch not deleted",
                session.repository_id
            );
            false
        }
    };

    let updated = store
        .update_session(&session.id, &mut |s| {
            s.status =
                transition_state(s.status, SessionStatus::Cancelled).map_err(|e| e.to_string())?;
            s.stage = SessionStage::Cancelled;
            s.error_message = Some(request.reason.clone());
            s.completed_at = Some(Utc::now());
            Ok(())
        })
        .map_err(RollbackError::Storage)?;

    let feedback = Feedback::new(
        &session.id,
        FeedbackType::Abort,
        request.reason.clone(),
        request.requested_by.clone(),
        None,
    );
    store
        .create_feedback(&feedback)
        .map_err(RollbackError::Storage)?;

    record_activity(
        store,
        &updated,
        ActivityAction::ImplementationRolledBack,
        &request.requested_by,
        json!({
            "sessionId": session.id,
            "mode": "full",
            "branch": session.implementation_branch,
            "branchDeleted": branch_deleted,
            "reason": request.reason,
        }),
    );
    log::warn!(
        "[Rollback] Session {} cancelled by {}: {}",
        session.id,
        request.requested_by,
        request.reason
    );

    Ok(RollbackOutcome {
        branch_deleted,
        session_cancelled: true,
        rolled_back_to: None,
        iterations_removed: 0,
        branch_reset: false,
    })
}
