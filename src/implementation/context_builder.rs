//! Context Builder - selects the repository files shown to the model
//!
//! The prompt carries a bounded listing of every file path on the branch plus
//! the content of a small set of key files: configured priority files first,
//! then files whose paths share keywords with the task.

use super::config::ContextSettings;
use crate::github::{GitHost, GitHostError, TreeEntry};
use crate::models::{Repository, Task};
use crate::utils::truncate_chars;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Files larger than this are never embedded
const MAX_KEY_FILE_BYTES: u64 = 200_000;

const IGNORED_DIRS: &[&str] = &[
    "node_modules/",
    "vendor/",
    "dist/",
    "build/",
    "target/",
    ".git/",
    ".next/",
    "__pycache__/",
    "coverage/",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "svg", "webp", "pdf", "zip", "gz", "tar", "woff", "woff2",
    "ttf", "eot", "mp4", "mp3", "lock", "jar", "exe", "dll", "so", "dylib", "bin",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "should", "must", "when", "then",
    "are", "was", "will", "can", "not", "all", "any", "add", "new", "use", "using", "make", "have",
    "has", "task", "user", "users", "able", "implement", "implemented", "described", "page",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyFile {
    pub path: String,
    pub content: String,
}

/// Repository snapshot handed to the iteration engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryContext {
    /// File paths on the branch, bounded by `max_tree_entries`
    pub file_paths: Vec<String>,
    /// Number of files before the bound was applied
    pub total_files: usize,
    pub key_files: Vec<KeyFile>,
}

impl RepositoryContext {
    pub fn contains(&self, path: &str) -> bool {
        self.file_paths.iter().any(|p| p == path)
    }
}

/// Snapshot the branch and load key files. Individual file fetch failures are skipped.
pub async fn build_context(
    host: &dyn GitHost,
    repo: &Repository,
    branch: &str,
    task: &Task,
    criteria: &[String],
    settings: &ContextSettings,
) -> Result<RepositoryContext, GitHostError> {
    let tree = host.get_tree(repo, branch).await?;
    let files = candidate_files(&tree);
    let total_files = files.len();

    let selected = select_key_files(&files, task, criteria, settings);
    let mut key_files = Vec::with_capacity(selected.len());
    for path in selected {
        match host.get_file_content(repo, &path, branch).await {
            Ok(file) => key_files.push(KeyFile {
                path,
                content: truncate_chars(&file.content, settings.max_file_chars),
            }),
            Err(e) => {
                log::warn!("[ContextBuilder] Skipping key file {}: {}", path, e);
            }
        }
    }

    let file_paths = files
        .iter()
        .take(settings.max_tree_entries)
        .map(|entry| entry.path.clone())
        .collect();

    log::debug!(
        "[ContextBuilder] {} files on {}, {} key files loaded",
        total_files,
        branch,
        key_files.len()
    );

    Ok(RepositoryContext {
        file_paths,
        total_files,
        key_files,
    })
}

/// Text files outside vendored/generated directories, sorted by path
fn candidate_files(tree: &[TreeEntry]) -> Vec<&TreeEntry> {
    let mut files: Vec<&TreeEntry> = tree
        .iter()
        .filter(|entry| entry.is_file())
        .filter(|entry| !is_ignored_path(&entry.path))
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

fn is_ignored_path(path: &str) -> bool {
    if IGNORED_DIRS
        .iter()
        .any(|dir| path.starts_with(dir) || path.contains(&format!("/{}", dir)))
    {
        return true;
    }
    let lower = path.to_lowercase();
    if lower.ends_with(".min.js") {
        return true;
    }
    match lower.rsplit_once('.') {
        Some((_, ext)) => BINARY_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// Lowercase keywords from the task title, description and criteria
pub fn extract_keywords(task: &Task, criteria: &[String]) -> Vec<String> {
    let mut text = format!("{} {}", task.title, task.description);
    for criterion in criteria {
        text.push(' ');
        text.push_str(criterion);
    }

    let mut seen = HashSet::new();
    let mut keywords = Vec::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
    {
        if seen.insert(word.clone()) {
            keywords.push(word);
        }
    }
    keywords
}

fn path_score(path: &str, keywords: &[String]) -> usize {
    let lower = path.to_lowercase();
    let components: Vec<&str> = lower
        .split(|c: char| c == '/' || c == '.' || c == '_' || c == '-')
        .filter(|c| !c.is_empty())
        .collect();

    keywords
        .iter()
        .map(|keyword| {
            if components.iter().any(|c| c == keyword) {
                2
            } else if lower.contains(keyword.as_str()) {
                1
            } else {
                0
            }
        })
        .sum()
}

/// Choose up to `max_key_files` paths: priority files, then best keyword matches
fn select_key_files(
    files: &[&TreeEntry],
    task: &Task,
    criteria: &[String],
    settings: &ContextSettings,
) -> Vec<String> {
    let embeddable: Vec<&TreeEntry> = files
        .iter()
        .copied()
        .filter(|entry| entry.size.map_or(true, |size| size <= MAX_KEY_FILE_BYTES))
        .collect();

    let mut selected: Vec<String> = Vec::new();
    for priority in &settings.priority_files {
        if selected.len() >= settings.max_key_files {
            return selected;
        }
        if embeddable.iter().any(|entry| &entry.path == priority) {
            selected.push(priority.clone());
        }
    }

    let keywords = extract_keywords(task, criteria);
    let mut scored: Vec<(usize, &str)> = embeddable
        .iter()
        .filter(|entry| !selected.contains(&entry.path))
        .map(|entry| (path_score(&entry.path, &keywords), entry.path.as_str()))
        .filter(|(score, _)| *score > 0)
        .collect();
    // Highest score first, ties broken by path for stable output
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    for (_, path) in scored {
        if selected.len() >= settings.max_key_files {
            break;
        }
        selected.push(path.to_string());
    }
    selected
}
