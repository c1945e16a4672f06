//! Task and repository rows
//!
//! These rows belong to the wider application; the server keeps a local copy
//! in `tasks/{id}.json` and `repositories/{id}.json` so sessions can resolve them.

use super::{read_json_opt, validate_id, write_json, FileResult};
use crate::models::{Repository, Task};
use std::path::{Path, PathBuf};

pub fn get_task_path(data_dir: &Path, task_id: &str) -> PathBuf {
    data_dir.join("tasks").join(format!("{}.json", task_id))
}

pub fn get_repository_path(data_dir: &Path, repository_id: &str) -> PathBuf {
    data_dir
        .join("repositories")
        .join(format!("{}.json", repository_id))
}

pub fn read_task(data_dir: &Path, task_id: &str) -> FileResult<Option<Task>> {
    validate_id(task_id)?;
    read_json_opt(&get_task_path(data_dir, task_id))
}

pub fn write_task(data_dir: &Path, task: &Task) -> FileResult<()> {
    validate_id(&task.id)?;
    write_json(&get_task_path(data_dir, &task.id), task)
}

pub fn read_repository(data_dir: &Path, repository_id: &str) -> FileResult<Option<Repository>> {
    validate_id(repository_id)?;
    read_json_opt(&get_repository_path(data_dir, repository_id))
}

pub fn write_repository(data_dir: &Path, repository: &Repository) -> FileResult<()> {
    validate_id(&repository.id)?;
    write_json(&get_repository_path(data_dir, &repository.id), repository)
}
