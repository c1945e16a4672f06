//! Implementation session command routing
//!
//! Session lifecycle (start, feedback, rollback), history read models and
//! registration of the task and repository rows sessions refer to.

use crate::commands::implementation as commands;
use crate::implementation::{RollbackRequest, SubmitFeedbackRequest};
use crate::models::{Repository, Task};
use serde_json::Value;

use super::{get_arg, get_opt_arg, route_async, route_sync, ServerAppState};

/// Route implementation session commands
pub async fn route_implementation_command(
    cmd: &str,
    args: Value,
    state: &ServerAppState,
) -> Result<Value, String> {
    let manager = state.implementation_state.as_ref();

    match cmd {
        "start_implementation" => {
            let request: commands::StartImplementationRequest = get_arg(&args, "request")?;
            route_async!(cmd, commands::start_implementation(request, manager))
        }

        "submit_implementation_feedback" => {
            let request: SubmitFeedbackRequest = get_arg(&args, "request")?;
            route_async!(cmd, commands::submit_implementation_feedback(request, manager))
        }

        "rollback_implementation" => {
            let request: RollbackRequest = get_arg(&args, "request")?;
            route_async!(cmd, commands::rollback_implementation(request, manager))
        }

        "get_implementation_session" => {
            let session_id: String = get_arg(&args, "sessionId")?;
            route_sync!(commands::get_implementation_session(session_id, manager))
        }

        "list_implementation_sessions" => {
            let task_id: Option<String> = get_opt_arg(&args, "taskId")?;
            route_sync!(commands::list_implementation_sessions(task_id, manager))
        }

        "list_active_implementation_sessions" => {
            serde_json::to_value(manager.active_session_ids()).map_err(|e| e.to_string())
        }

        "get_implementation_iterations" => {
            let session_id: String = get_arg(&args, "sessionId")?;
            route_sync!(commands::get_implementation_iterations(session_id, manager))
        }

        "get_implementation_feedback" => {
            let session_id: String = get_arg(&args, "sessionId")?;
            route_sync!(commands::get_implementation_feedback(session_id, manager))
        }

        "get_implementation_file_operations" => {
            let session_id: String = get_arg(&args, "sessionId")?;
            route_sync!(commands::get_implementation_file_operations(
                session_id, manager
            ))
        }

        "get_task_activity" => {
            let task_id: String = get_arg(&args, "taskId")?;
            route_sync!(commands::get_task_activity(task_id, manager))
        }

        "get_implementation_config" => {
            route_sync!(commands::get_implementation_config(manager))
        }

        "register_task" => {
            let task: Task = get_arg(&args, "task")?;
            route_sync!(commands::register_task(task, manager))
        }

        "register_repository" => {
            let repository: Repository = get_arg(&args, "repository")?;
            route_sync!(commands::register_repository(repository, manager))
        }

        _ => Err(format!("Unknown implementation command: {}", cmd)),
    }
}

/// Check if a command is an implementation command
pub fn is_implementation_command(cmd: &str) -> bool {
    cmd.ends_with("_implementation")
        || cmd.starts_with("get_implementation_")
        || cmd.starts_with("list_implementation_")
        || cmd.starts_with("list_active_implementation_")
        || matches!(
            cmd,
            "submit_implementation_feedback"
                | "get_task_activity"
                | "register_task"
                | "register_repository"
        )
}
