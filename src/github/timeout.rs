// Per-call time bound around any GitHost

use super::{CommitFile, CreatePRRequest, FileContent, GitHost, GitHostError, PullRequest, TreeEntry};
use crate::models::Repository;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Wraps a host so that every call fails with `GitHostError::Timeout` once the bound elapses
pub struct TimeoutHost {
    inner: Arc<dyn GitHost>,
    timeout: Duration,
}

impl TimeoutHost {
    pub fn new(inner: Arc<dyn GitHost>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, GitHostError>>,
    ) -> Result<T, GitHostError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GitHostError::Timeout(self.timeout.as_secs())),
        }
    }
}

#[async_trait]
impl GitHost for TimeoutHost {
    async fn branch_exists(&self, repo: &Repository, branch: &str) -> Result<bool, GitHostError> {
        self.bounded(self.inner.branch_exists(repo, branch)).await
    }

    async fn create_branch(
        &self,
        repo: &Repository,
        branch: &str,
        from_ref: &str,
    ) -> Result<(), GitHostError> {
        self.bounded(self.inner.create_branch(repo, branch, from_ref))
            .await
    }

    async fn get_tree(
        &self,
        repo: &Repository,
        git_ref: &str,
    ) -> Result<Vec<TreeEntry>, GitHostError> {
        self.bounded(self.inner.get_tree(repo, git_ref)).await
    }

    async fn get_file_content(
        &self,
        repo: &Repository,
        path: &str,
        git_ref: &str,
    ) -> Result<FileContent, GitHostError> {
        self.bounded(self.inner.get_file_content(repo, path, git_ref))
            .await
    }

    async fn create_commit(
        &self,
        repo: &Repository,
        branch: &str,
        message: &str,
        files: &[CommitFile],
    ) -> Result<String, GitHostError> {
        self.bounded(self.inner.create_commit(repo, branch, message, files))
            .await
    }

    async fn create_pull_request(
        &self,
        repo: &Repository,
        request: CreatePRRequest,
    ) -> Result<PullRequest, GitHostError> {
        self.bounded(self.inner.create_pull_request(repo, request))
            .await
    }

    async fn delete_branch(&self, repo: &Repository, branch: &str) -> Result<(), GitHostError> {
        self.bounded(self.inner.delete_branch(repo, branch)).await
    }

    async fn reset_branch(
        &self,
        repo: &Repository,
        branch: &str,
        sha: &str,
    ) -> Result<(), GitHostError> {
        self.bounded(self.inner.reset_branch(repo, branch, sha)).await
    }
}
