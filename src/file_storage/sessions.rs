//! Session file storage
//!
//! Stores each implementation session with its embedded history in
//! `sessions/{id}.json`. Iterations, file operations and feedback live in the
//! same file so a rollback rewrites one record.

use super::{ensure_dir, read_json, read_json_opt, validate_id, write_json, FileResult};
use crate::models::{ExecutionSession, Feedback, FileOperation, Iteration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Version of the session file format
const SESSION_FILE_VERSION: u32 = 1;

/// Session file structure with embedded history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFile {
    /// File format version
    pub version: u32,
    /// When this file was last written
    pub updated_at: DateTime<Utc>,
    pub session: ExecutionSession,
    #[serde(default)]
    pub iterations: Vec<Iteration>,
    #[serde(default)]
    pub file_operations: Vec<FileOperation>,
    #[serde(default)]
    pub feedback: Vec<Feedback>,
}

impl SessionFile {
    pub fn new(session: ExecutionSession) -> Self {
        Self {
            version: SESSION_FILE_VERSION,
            updated_at: Utc::now(),
            session,
            iterations: Vec::new(),
            file_operations: Vec::new(),
            feedback: Vec::new(),
        }
    }
}

/// Get the sessions directory
pub fn get_sessions_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("sessions")
}

/// Get the file path for a session
pub fn get_session_file_path(data_dir: &Path, session_id: &str) -> PathBuf {
    get_sessions_dir(data_dir).join(format!("{}.json", session_id))
}

/// Read a session file, `None` when the session does not exist
pub fn read_session_file(data_dir: &Path, session_id: &str) -> FileResult<Option<SessionFile>> {
    validate_id(session_id)?;
    read_json_opt(&get_session_file_path(data_dir, session_id))
}

/// Read a session file that must exist
pub fn load_session_file(data_dir: &Path, session_id: &str) -> FileResult<SessionFile> {
    read_session_file(data_dir, session_id)?
        .ok_or_else(|| format!("Session not found: {}", session_id))
}

/// Save a session file, stamping `updated_at`
pub fn save_session_file(data_dir: &Path, file: &mut SessionFile) -> FileResult<()> {
    validate_id(&file.session.id)?;
    ensure_dir(&get_sessions_dir(data_dir))?;

    file.updated_at = Utc::now();
    write_json(&get_session_file_path(data_dir, &file.session.id), file)
}

/// Read every session file in the data directory
pub fn read_all_session_files(data_dir: &Path) -> FileResult<Vec<SessionFile>> {
    let dir = get_sessions_dir(data_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let entries =
        fs::read_dir(&dir).map_err(|e| format!("Failed to read sessions directory: {}", e))?;

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json::<SessionFile>(&path) {
            Ok(file) => files.push(file),
            Err(e) => log::warn!("Skipping unreadable session file {:?}: {}", path, e),
        }
    }

    files.sort_by(|a, b| a.session.started_at.cmp(&b.session.started_at));
    Ok(files)
}
