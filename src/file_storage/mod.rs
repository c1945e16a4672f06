//! File-based storage for implementation sessions
//!
//! All state lives under a single data directory:
//! - `tasks/{id}.json` - Task rows registered by the wider application
//! - `repositories/{id}.json` - Repository rows
//! - `sessions/{id}.json` - Session with embedded iterations, file operations and feedback
//! - `activity/{task_id}.json` - Task-level activity log
//!
//! The rest of the crate only sees the [`ImplementationStore`] trait, so a
//! relational backend can replace [`FileStore`] without touching the loop.

pub mod activity;
pub mod records;
pub mod sessions;
mod store;

pub use store::FileStore;

use crate::models::{
    ActivityEntry, ExecutionSession, Feedback, FileOperation, Iteration, Repository, Task,
};
use std::fs;
use std::path::Path;

/// Common file operations result type
pub type FileResult<T> = Result<T, String>;

/// Persistence boundary for the implementation loop.
///
/// `update_session` runs the closure against the freshest stored copy while
/// holding the store's write lock; returning `Err` from the closure aborts the
/// write and is passed back to the caller.
pub trait ImplementationStore: Send + Sync {
    // Tasks and repositories
    fn get_task(&self, task_id: &str) -> FileResult<Option<Task>>;
    fn save_task(&self, task: &Task) -> FileResult<()>;
    fn get_repository(&self, repository_id: &str) -> FileResult<Option<Repository>>;
    fn save_repository(&self, repository: &Repository) -> FileResult<()>;

    // Sessions
    fn create_session(&self, session: &ExecutionSession) -> FileResult<()>;
    fn get_session(&self, session_id: &str) -> FileResult<Option<ExecutionSession>>;
    fn list_sessions(&self, task_id: Option<&str>) -> FileResult<Vec<ExecutionSession>>;
    fn update_session(
        &self,
        session_id: &str,
        updater: &mut dyn FnMut(&mut ExecutionSession) -> FileResult<()>,
    ) -> FileResult<ExecutionSession>;

    // Iterations
    fn create_iteration(&self, iteration: &Iteration) -> FileResult<()>;
    /// Replace an iteration row. `false` when the row is gone (removed by a rollback).
    fn update_iteration(&self, iteration: &Iteration) -> FileResult<bool>;
    /// Persist a finished iteration and the session rollup in one write.
    ///
    /// `updater` returns `false` to discard the iteration instead: its row and file
    /// operations are removed and the session is left as it was. Returns whether the
    /// iteration was kept; a row that no longer exists is never re-created.
    fn commit_iteration(
        &self,
        iteration: &Iteration,
        updater: &mut dyn FnMut(&mut ExecutionSession) -> FileResult<bool>,
    ) -> FileResult<bool>;
    /// Iterations of a session ordered by iteration number
    fn list_iterations(&self, session_id: &str) -> FileResult<Vec<Iteration>>;
    /// Remove every iteration numbered above `iteration_number`, returning the removed rows
    fn delete_iterations_after(
        &self,
        session_id: &str,
        iteration_number: u32,
    ) -> FileResult<Vec<Iteration>>;

    // File operations
    /// Record an operation. `false`, with nothing written, when its iteration row is gone.
    fn record_file_operation(&self, operation: &FileOperation) -> FileResult<bool>;
    fn list_file_operations(&self, session_id: &str) -> FileResult<Vec<FileOperation>>;
    fn delete_file_operations_after(
        &self,
        session_id: &str,
        iteration_number: u32,
    ) -> FileResult<usize>;

    // Feedback
    fn create_feedback(&self, feedback: &Feedback) -> FileResult<()>;
    /// Feedback of a session in submission order
    fn list_feedback(&self, session_id: &str) -> FileResult<Vec<Feedback>>;
    fn delete_feedback_for_iterations(
        &self,
        session_id: &str,
        iteration_ids: &[String],
    ) -> FileResult<usize>;

    /// Most recently submitted feedback, if any
    fn latest_feedback(&self, session_id: &str) -> FileResult<Option<Feedback>> {
        Ok(self.list_feedback(session_id)?.pop())
    }

    // Activity log
    fn append_activity(&self, entry: &ActivityEntry) -> FileResult<()>;
    fn list_activity(&self, task_id: &str) -> FileResult<Vec<ActivityEntry>>;
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> FileResult<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| format!("Failed to create directory {:?}: {}", path, e))?;
    }
    Ok(())
}

/// Write data to a file atomically (temp file + rename)
pub fn atomic_write(path: &Path, content: &str) -> FileResult<()> {
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    fs::write(&temp_path, content)
        .map_err(|e| format!("Failed to write temp file {:?}: {}", temp_path, e))?;

    fs::rename(&temp_path, path)
        .map_err(|e| format!("Failed to rename {:?} to {:?}: {}", temp_path, path, e))?;

    Ok(())
}

/// Read a JSON file and deserialize it
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read file {:?}: {}", path, e))?;

    serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse JSON from {:?}: {}", path, e))
}

/// Read a JSON file if it exists
pub fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

/// Write data as pretty-printed JSON atomically
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> FileResult<()> {
    let content = serde_json::to_string_pretty(data)
        .map_err(|e| format!("Failed to serialize to JSON: {}", e))?;

    atomic_write(path, &content)
}

/// Reject ids that would escape their storage directory
pub fn validate_id(id: &str) -> FileResult<()> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.starts_with('.')
    {
        return Err(format!("Invalid identifier: '{}'", id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("a").join("b").join("c");

        assert!(!nested_path.exists());
        ensure_dir(&nested_path).unwrap();
        assert!(nested_path.exists());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("nested").join("data.json");

        atomic_write(&file_path, "{}").unwrap();

        assert_eq!(fs::read_to_string(&file_path).unwrap(), "{}");
        assert!(!file_path.with_extension("tmp").exists());
    }

    #[test]
    fn test_read_json_opt_missing() {
        let temp_dir = TempDir::new().unwrap();
        let missing: Option<serde_json::Value> =
            read_json_opt(&temp_dir.path().join("nope.json")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("3f2c9a1e-77d0").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
    }
}
