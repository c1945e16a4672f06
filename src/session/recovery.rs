// Startup recovery for sessions interrupted by a server restart

use crate::file_storage::ImplementationStore;
use crate::implementation::{close_in_flight_iterations, record_activity};
use crate::models::state_machine::transition_state;
use crate::models::{ActivityAction, SessionStage, SessionStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Reason recorded on sessions and iterations cut off by a restart
pub const INTERRUPTED_REASON: &str = "interrupted by server restart";

/// What startup recovery decided for a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// RUNNING session moved to STUCK
    MarkedStuck,
    /// INITIALIZING session whose startup should run again
    Restart,
    /// WAITING_FEEDBACK session whose feedback wait should resume
    Reattach,
}

/// Recovery result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub session_id: String,
    pub previous_status: SessionStatus,
    pub new_status: SessionStatus,
    pub action: RecoveryAction,
    /// Iteration closed as interrupted, if one was in flight
    pub interrupted_iteration: Option<u32>,
    pub recovered_at: DateTime<Utc>,
}

/// Session recovery manager
pub struct SessionRecovery {
    store: Arc<dyn ImplementationStore>,
}

impl SessionRecovery {
    pub fn new(store: Arc<dyn ImplementationStore>) -> Self {
        Self { store }
    }

    /// Reconcile one session with the fact that no runner survived the restart
    pub fn recover_session(&self, session_id: &str) -> Result<RecoveryResult> {
        let session = self
            .store
            .get_session(session_id)
            .map_err(|e| anyhow!("Failed to read session: {}", e))?
            .ok_or_else(|| anyhow!("Session not found: {}", session_id))?;
        let previous_status = session.status;

        let (action, interrupted_iteration) = match previous_status {
            SessionStatus::Running => {
                let closed =
                    close_in_flight_iterations(self.store.as_ref(), session_id, INTERRUPTED_REASON)
                        .map_err(|e| anyhow!("Failed to close iterations: {}", e))?;

                let updated = self
                    .store
                    .update_session(session_id, &mut |s| {
                        s.status = transition_state(s.status, SessionStatus::Stuck)
                            .map_err(|e| e.to_string())?;
                        s.stage = SessionStage::Stuck;
                        s.stuck_reason = Some(INTERRUPTED_REASON.to_string());
                        s.completed_at = Some(Utc::now());
                        if let Some(number) = closed {
                            s.current_iteration = s.current_iteration.max(number);
                        }
                        Ok(())
                    })
                    .map_err(|e| anyhow!("Failed to update session status: {}", e))?;

                record_activity(
                    self.store.as_ref(),
                    &updated,
                    ActivityAction::ImplementationStuck,
                    "system",
                    json!({
                        "sessionId": session_id,
                        "reason": INTERRUPTED_REASON,
                        "iteration": updated.current_iteration,
                    }),
                );
                (RecoveryAction::MarkedStuck, closed)
            }
            SessionStatus::Initializing => (RecoveryAction::Restart, None),
            SessionStatus::WaitingFeedback => (RecoveryAction::Reattach, None),
            other => {
                return Err(anyhow!(
                    "Session {} is {}, nothing to recover",
                    session_id,
                    other
                ))
            }
        };

        let new_status = match action {
            RecoveryAction::MarkedStuck => SessionStatus::Stuck,
            _ => previous_status,
        };

        Ok(RecoveryResult {
            session_id: session_id.to_string(),
            previous_status,
            new_status,
            action,
            interrupted_iteration,
            recovered_at: Utc::now(),
        })
    }

    /// Recover every session that was live when the server stopped
    pub fn recover_all(&self) -> Result<Vec<RecoveryResult>> {
        let sessions = self
            .store
            .list_sessions(None)
            .map_err(|e| anyhow!("Failed to list sessions: {}", e))?;

        let mut results = Vec::new();
        for session in sessions.into_iter().filter(|s| {
            matches!(
                s.status,
                SessionStatus::Initializing | SessionStatus::Running | SessionStatus::WaitingFeedback
            )
        }) {
            match self.recover_session(&session.id) {
                Ok(result) => results.push(result),
                Err(e) => {
                    log::warn!("[Recovery] Failed to recover session {}: {}", session.id, e);
                }
            }
        }
        Ok(results)
    }
}
