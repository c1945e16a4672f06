// Git host integration: branches, trees, commits and pull requests

mod client;
mod timeout;

pub use client::{GitHubClient, DEFAULT_API_BASE_URL};
pub use timeout::TimeoutHost;

use crate::models::Repository;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHostError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("GitHub API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),
}

impl GitHostError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GitHostError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, GitHostError::AlreadyExists(_))
    }
}

/// Entry of a recursive repository tree listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub path: String,
    /// "blob" for files, "tree" for directories
    pub entry_type: String,
    pub sha: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl TreeEntry {
    pub fn is_file(&self) -> bool {
        self.entry_type == "blob"
    }
}

/// Current content of a file on a branch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    /// Decoded text when the host sent base64, otherwise the raw payload
    pub content: String,
    pub sha: String,
    pub encoding: String,
}

/// One path in a multi-file commit. `content: None` deletes the path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommitFile {
    pub path: String,
    pub content: Option<String>,
}

impl CommitFile {
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: None,
        }
    }
}

/// PR creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePRRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
}

/// Pull request as returned by the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub html_url: String,
    pub head_branch: String,
    pub base_branch: String,
    pub draft: bool,
}

/// Remote git operations used by the implementation loop
#[async_trait]
pub trait GitHost: Send + Sync {
    async fn branch_exists(&self, repo: &Repository, branch: &str) -> Result<bool, GitHostError>;

    /// Create `branch` pointing at the head of `from_ref`
    async fn create_branch(
        &self,
        repo: &Repository,
        branch: &str,
        from_ref: &str,
    ) -> Result<(), GitHostError>;

    /// Recursive listing of every path on `git_ref`
    async fn get_tree(&self, repo: &Repository, git_ref: &str)
        -> Result<Vec<TreeEntry>, GitHostError>;

    async fn get_file_content(
        &self,
        repo: &Repository,
        path: &str,
        git_ref: &str,
    ) -> Result<FileContent, GitHostError>;

    /// Apply every file change as a single commit on `branch`, returning its sha
    async fn create_commit(
        &self,
        repo: &Repository,
        branch: &str,
        message: &str,
        files: &[CommitFile],
    ) -> Result<String, GitHostError>;

    async fn create_pull_request(
        &self,
        repo: &Repository,
        request: CreatePRRequest,
    ) -> Result<PullRequest, GitHostError>;

    async fn delete_branch(&self, repo: &Repository, branch: &str) -> Result<(), GitHostError>;

    /// Force-move `branch` to `sha`
    async fn reset_branch(
        &self,
        repo: &Repository,
        branch: &str,
        sha: &str,
    ) -> Result<(), GitHostError>;
}
