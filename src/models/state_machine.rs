// Implementation session state machine with validation

use super::SessionStatus;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Session already in terminal state: {0}")]
    AlreadyTerminal(SessionStatus),
}

/// Validates if a session can transition from one status to another
pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;

    match (from, to) {
        // Terminal states never move
        (Succeeded | Failed | Cancelled, _) => false,

        // From Initializing
        (Initializing, Running) => true,
        (Initializing, Failed) => true, // Missing task/repository rows
        (Initializing, Cancelled) => true,

        // From Running
        (Running, Running) => true,
        (Running, WaitingFeedback) => true,
        (Running, Succeeded) => true,
        (Running, Failed) => true,
        (Running, Stuck) => true,
        (Running, Cancelled) => true,

        // From WaitingFeedback
        (WaitingFeedback, Running) => true, // Guidance or rejection
        (WaitingFeedback, Succeeded) => true, // Approval
        (WaitingFeedback, Stuck) => true, // Feedback wait timed out
        (WaitingFeedback, Failed) => true,
        (WaitingFeedback, Cancelled) => true,

        // Stuck only moves through the feedback gateway or rollback
        (Stuck, Running) => true,
        (Stuck, Succeeded) => true,
        (Stuck, Failed) => true,
        (Stuck, Cancelled) => true,

        _ => false,
    }
}

/// Validates and performs a state transition
pub fn transition_state(
    current: SessionStatus,
    target: SessionStatus,
) -> Result<SessionStatus, StateTransitionError> {
    if is_terminal_state(current) {
        return Err(StateTransitionError::AlreadyTerminal(current));
    }

    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a status is a terminal state
pub fn is_terminal_state(status: SessionStatus) -> bool {
    matches!(
        status,
        SessionStatus::Succeeded | SessionStatus::Failed | SessionStatus::Cancelled
    )
}

/// Statuses in which the feedback gateway accepts input
pub const FEEDBACK_ACCEPTING_STATES: [SessionStatus; 3] = [
    SessionStatus::WaitingFeedback,
    SessionStatus::Stuck,
    SessionStatus::Running,
];

/// Statuses from which a rollback may be requested
pub const ROLLBACK_ACCEPTING_STATES: [SessionStatus; 3] = [
    SessionStatus::Running,
    SessionStatus::WaitingFeedback,
    SessionStatus::Stuck,
];

/// Check if a status indicates a suspended session that needs a human
pub fn is_waiting_state(status: SessionStatus) -> bool {
    matches!(status, SessionStatus::WaitingFeedback | SessionStatus::Stuck)
}

/// Get all valid next states from current state
pub fn valid_next_states(current: SessionStatus) -> Vec<SessionStatus> {
    let all_states = vec![
        SessionStatus::Initializing,
        SessionStatus::Running,
        SessionStatus::WaitingFeedback,
        SessionStatus::Succeeded,
        SessionStatus::Failed,
        SessionStatus::Stuck,
        SessionStatus::Cancelled,
    ];

    all_states
        .into_iter()
        .filter(|&state| can_transition(current, state))
        .collect()
}
