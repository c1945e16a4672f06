//! Task activity log
//!
//! Append-only log per task in `activity/{task_id}.json`.

use super::{read_json_opt, validate_id, write_json, FileResult};
use crate::models::ActivityEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ACTIVITY_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFile {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<ActivityEntry>,
}

impl Default for ActivityFile {
    fn default() -> Self {
        Self {
            version: ACTIVITY_FILE_VERSION,
            updated_at: Utc::now(),
            entries: Vec::new(),
        }
    }
}

pub fn get_activity_path(data_dir: &Path, task_id: &str) -> PathBuf {
    data_dir.join("activity").join(format!("{}.json", task_id))
}

pub fn read_activity(data_dir: &Path, task_id: &str) -> FileResult<Vec<ActivityEntry>> {
    validate_id(task_id)?;
    let file: Option<ActivityFile> = read_json_opt(&get_activity_path(data_dir, task_id))?;
    Ok(file.map(|f| f.entries).unwrap_or_default())
}

/// Append an entry; callers serialize concurrent appends
pub fn append_activity(data_dir: &Path, entry: &ActivityEntry) -> FileResult<()> {
    validate_id(&entry.task_id)?;
    let path = get_activity_path(data_dir, &entry.task_id);
    let mut file: ActivityFile = read_json_opt(&path)?.unwrap_or_default();
    file.entries.push(entry.clone());
    file.updated_at = Utc::now();
    write_json(&path, &file)
}
