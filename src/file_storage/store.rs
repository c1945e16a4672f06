// JSON-file implementation of ImplementationStore

use super::sessions::{
    load_session_file, read_all_session_files, read_session_file, save_session_file, SessionFile,
};
use super::{activity, ensure_dir, records, FileResult, ImplementationStore};
use crate::models::{
    ActivityEntry, ExecutionSession, Feedback, FileOperation, Iteration, Repository, Task,
};
use crate::utils::lock_mutex_recover;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File-backed store rooted at a data directory.
///
/// Every read-modify-write cycle runs under one process-wide lock; the files
/// themselves are replaced atomically so unlocked readers never see partial JSON.
pub struct FileStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> FileResult<Self> {
        let data_dir = data_dir.into();
        ensure_dir(&data_dir)?;
        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Load a session file, apply `f`, and save it back under the write lock
    fn modify_session_file<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionFile) -> FileResult<T>,
    ) -> FileResult<T> {
        let _guard = lock_mutex_recover(&self.write_lock);
        let mut file = load_session_file(&self.data_dir, session_id)?;
        let result = f(&mut file)?;
        save_session_file(&self.data_dir, &mut file)?;
        Ok(result)
    }
}

impl ImplementationStore for FileStore {
    fn get_task(&self, task_id: &str) -> FileResult<Option<Task>> {
        records::read_task(&self.data_dir, task_id)
    }

    fn save_task(&self, task: &Task) -> FileResult<()> {
        let _guard = lock_mutex_recover(&self.write_lock);
        records::write_task(&self.data_dir, task)
    }

    fn get_repository(&self, repository_id: &str) -> FileResult<Option<Repository>> {
        records::read_repository(&self.data_dir, repository_id)
    }

    fn save_repository(&self, repository: &Repository) -> FileResult<()> {
        let _guard = lock_mutex_recover(&self.write_lock);
        records::write_repository(&self.data_dir, repository)
    }

    fn create_session(&self, session: &ExecutionSession) -> FileResult<()> {
        let _guard = lock_mutex_recover(&self.write_lock);
        if read_session_file(&self.data_dir, &session.id)?.is_some() {
            return Err(format!("Session {} already exists", session.id));
        }
        save_session_file(&self.data_dir, &mut SessionFile::new(session.clone()))
    }

    fn get_session(&self, session_id: &str) -> FileResult<Option<ExecutionSession>> {
        Ok(read_session_file(&self.data_dir, session_id)?.map(|f| f.session))
    }

    fn list_sessions(&self, task_id: Option<&str>) -> FileResult<Vec<ExecutionSession>> {
        Ok(read_all_session_files(&self.data_dir)?
            .into_iter()
            .map(|f| f.session)
            .filter(|s| task_id.map_or(true, |t| s.task_id == t))
            .collect())
    }

    fn update_session(
        &self,
        session_id: &str,
        updater: &mut dyn FnMut(&mut ExecutionSession) -> FileResult<()>,
    ) -> FileResult<ExecutionSession> {
        self.modify_session_file(session_id, |file| {
            updater(&mut file.session)?;
            file.session.updated_at = Utc::now();
            Ok(file.session.clone())
        })
    }

    fn create_iteration(&self, iteration: &Iteration) -> FileResult<()> {
        self.modify_session_file(&iteration.session_id, |file| {
            if file
                .iterations
                .iter()
                .any(|i| i.iteration_number == iteration.iteration_number)
            {
                return Err(format!(
                    "Iteration {} already exists for session {}",
                    iteration.iteration_number, iteration.session_id
                ));
            }
            file.iterations.push(iteration.clone());
            file.iterations.sort_by_key(|i| i.iteration_number);
            Ok(())
        })
    }

    fn update_iteration(&self, iteration: &Iteration) -> FileResult<bool> {
        self.modify_session_file(&iteration.session_id, |file| {
            match file.iterations.iter_mut().find(|i| i.id == iteration.id) {
                Some(existing) => {
                    *existing = iteration.clone();
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn commit_iteration(
        &self,
        iteration: &Iteration,
        updater: &mut dyn FnMut(&mut ExecutionSession) -> FileResult<bool>,
    ) -> FileResult<bool> {
        self.modify_session_file(&iteration.session_id, |file| {
            let Some(index) = file.iterations.iter().position(|i| i.id == iteration.id) else {
                return Ok(false);
            };
            if !updater(&mut file.session)? {
                file.iterations.remove(index);
                file.file_operations
                    .retain(|op| op.iteration_id != iteration.id);
                return Ok(false);
            }
            file.iterations[index] = iteration.clone();
            file.session.updated_at = Utc::now();
            Ok(true)
        })
    }

    fn list_iterations(&self, session_id: &str) -> FileResult<Vec<Iteration>> {
        Ok(read_session_file(&self.data_dir, session_id)?
            .map(|f| f.iterations)
            .unwrap_or_default())
    }

    fn delete_iterations_after(
        &self,
        session_id: &str,
        iteration_number: u32,
    ) -> FileResult<Vec<Iteration>> {
        self.modify_session_file(session_id, |file| {
            let (kept, removed): (Vec<_>, Vec<_>) = file
                .iterations
                .drain(..)
                .partition(|i| i.iteration_number <= iteration_number);
            file.iterations = kept;
            Ok(removed)
        })
    }

    fn record_file_operation(&self, operation: &FileOperation) -> FileResult<bool> {
        self.modify_session_file(&operation.session_id, |file| {
            if !file.iterations.iter().any(|i| i.id == operation.iteration_id) {
                return Ok(false);
            }
            file.file_operations.push(operation.clone());
            Ok(true)
        })
    }

    fn list_file_operations(&self, session_id: &str) -> FileResult<Vec<FileOperation>> {
        Ok(read_session_file(&self.data_dir, session_id)?
            .map(|f| f.file_operations)
            .unwrap_or_default())
    }

    fn delete_file_operations_after(
        &self,
        session_id: &str,
        iteration_number: u32,
    ) -> FileResult<usize> {
        self.modify_session_file(session_id, |file| {
            let before = file.file_operations.len();
            file.file_operations
                .retain(|op| op.iteration_number <= iteration_number);
            Ok(before - file.file_operations.len())
        })
    }

    fn create_feedback(&self, feedback: &Feedback) -> FileResult<()> {
        self.modify_session_file(&feedback.session_id, |file| {
            file.feedback.push(feedback.clone());
            Ok(())
        })
    }

    fn list_feedback(&self, session_id: &str) -> FileResult<Vec<Feedback>> {
        Ok(read_session_file(&self.data_dir, session_id)?
            .map(|f| f.feedback)
            .unwrap_or_default())
    }

    fn delete_feedback_for_iterations(
        &self,
        session_id: &str,
        iteration_ids: &[String],
    ) -> FileResult<usize> {
        if iteration_ids.is_empty() {
            return Ok(0);
        }
        self.modify_session_file(session_id, |file| {
            let before = file.feedback.len();
            file.feedback.retain(|fb| match &fb.iteration_id {
                Some(id) => !iteration_ids.contains(id),
                None => true,
            });
            Ok(before - file.feedback.len())
        })
    }

    fn append_activity(&self, entry: &ActivityEntry) -> FileResult<()> {
        let _guard = lock_mutex_recover(&self.write_lock);
        activity::append_activity(&self.data_dir, entry)
    }

    fn list_activity(&self, task_id: &str) -> FileResult<Vec<ActivityEntry>> {
        activity::read_activity(&self.data_dir, task_id)
    }
}
