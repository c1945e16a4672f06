// GitHub REST v3 client

use super::{
    CommitFile, CreatePRRequest, FileContent, GitHost, GitHostError, PullRequest, TreeEntry,
};
use crate::models::Repository;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

/// Regular file mode for blobs written through the git data API
const BLOB_MODE: &str = "100644";

/// GitHub API client
pub struct GitHubClient {
    token: String,
    api_base_url: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl GitHubClient {
    /// Create a new GitHub client against the public API
    pub fn new(token: String, timeout_secs: u64) -> Result<Self, GitHostError> {
        Self::with_base_url(token, DEFAULT_API_BASE_URL.to_string(), timeout_secs)
    }

    /// Create a client for GitHub Enterprise or a test server
    pub fn with_base_url(
        token: String,
        api_base_url: String,
        timeout_secs: u64,
    ) -> Result<Self, GitHostError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GitHostError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            token,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            client,
        })
    }

    fn repo_url(&self, repo: &Repository, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base_url, repo.owner, repo.name, path
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", "task-autopilot")
    }

    async fn send(&self, builder: RequestBuilder, context: &str) -> Result<Response, GitHostError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GitHostError::Timeout(self.timeout_secs)
            } else {
                GitHostError::Transport(format!("{}: {}", context, e))
            }
        })
    }

    async fn json(response: Response) -> Result<Value, GitHostError> {
        response
            .json()
            .await
            .map_err(|e| GitHostError::Decode(e.to_string()))
    }

    async fn head_sha(&self, repo: &Repository, branch: &str) -> Result<String, GitHostError> {
        let url = self.repo_url(repo, &format!("git/ref/heads/{}", branch));
        let response = self
            .send(self.request(Method::GET, &url), "Failed to get branch")
            .await?;
        let response = check_status(response, &format!("branch {}", branch)).await?;
        let data = Self::json(response).await?;

        data["object"]["sha"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| GitHostError::Decode("ref response missing object.sha".to_string()))
    }

    async fn patch_ref(
        &self,
        repo: &Repository,
        branch: &str,
        sha: &str,
        force: bool,
    ) -> Result<(), GitHostError> {
        let url = self.repo_url(repo, &format!("git/refs/heads/{}", branch));
        let response = self
            .send(
                self.request(Method::PATCH, &url)
                    .json(&json!({ "sha": sha, "force": force })),
                "Failed to update branch",
            )
            .await?;
        check_status(response, &format!("branch {}", branch)).await?;
        Ok(())
    }
}

#[async_trait]
impl GitHost for GitHubClient {
    async fn branch_exists(&self, repo: &Repository, branch: &str) -> Result<bool, GitHostError> {
        match self.head_sha(repo, branch).await {
            Ok(_) => Ok(true),
            Err(GitHostError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_branch(
        &self,
        repo: &Repository,
        branch: &str,
        from_ref: &str,
    ) -> Result<(), GitHostError> {
        let sha = self.head_sha(repo, from_ref).await?;
        let url = self.repo_url(repo, "git/refs");
        let response = self
            .send(
                self.request(Method::POST, &url).json(&json!({
                    "ref": format!("refs/heads/{}", branch),
                    "sha": sha,
                })),
                "Failed to create branch",
            )
            .await?;
        check_status(response, &format!("branch {}", branch)).await?;

        log::info!(
            "[GitHub] Created branch {} from {} in {}",
            branch,
            from_ref,
            repo.full_name()
        );
        Ok(())
    }

    async fn get_tree(
        &self,
        repo: &Repository,
        git_ref: &str,
    ) -> Result<Vec<TreeEntry>, GitHostError> {
        let url = self.repo_url(repo, &format!("git/trees/{}?recursive=1", git_ref));
        let response = self
            .send(self.request(Method::GET, &url), "Failed to get tree")
            .await?;
        let response = check_status(response, &format!("tree {}", git_ref)).await?;
        let data = Self::json(response).await?;

        if data["truncated"].as_bool().unwrap_or(false) {
            log::warn!(
                "[GitHub] Tree listing for {}@{} was truncated by the API",
                repo.full_name(),
                git_ref
            );
        }

        Ok(parse_tree_entries(&data))
    }

    async fn get_file_content(
        &self,
        repo: &Repository,
        path: &str,
        git_ref: &str,
    ) -> Result<FileContent, GitHostError> {
        let url = self.repo_url(repo, &format!("contents/{}?ref={}", path, git_ref));
        let response = self
            .send(self.request(Method::GET, &url), "Failed to get file")
            .await?;
        let response = check_status(response, path).await?;
        let data = Self::json(response).await?;

        let encoding = data["encoding"].as_str().unwrap_or("").to_string();
        let raw = data["content"].as_str().unwrap_or("");
        let content = if encoding == "base64" {
            decode_base64_content(raw)?
        } else {
            raw.to_string()
        };

        Ok(FileContent {
            path: path.to_string(),
            content,
            sha: data["sha"].as_str().unwrap_or("").to_string(),
            encoding,
        })
    }

    async fn create_commit(
        &self,
        repo: &Repository,
        branch: &str,
        message: &str,
        files: &[CommitFile],
    ) -> Result<String, GitHostError> {
        let parent_sha = self.head_sha(repo, branch).await?;

        // Base tree of the parent commit
        let url = self.repo_url(repo, &format!("git/commits/{}", parent_sha));
        let response = self
            .send(self.request(Method::GET, &url), "Failed to get commit")
            .await?;
        let response = check_status(response, &parent_sha).await?;
        let parent = Self::json(response).await?;
        let base_tree = parent["tree"]["sha"]
            .as_str()
            .ok_or_else(|| GitHostError::Decode("commit response missing tree.sha".to_string()))?
            .to_string();

        let url = self.repo_url(repo, "git/trees");
        let response = self
            .send(
                self.request(Method::POST, &url).json(&json!({
                    "base_tree": base_tree,
                    "tree": build_tree_payload(files),
                })),
                "Failed to create tree",
            )
            .await?;
        let response = check_status(response, "tree").await?;
        let tree = Self::json(response).await?;
        let tree_sha = tree["sha"]
            .as_str()
            .ok_or_else(|| GitHostError::Decode("tree response missing sha".to_string()))?
            .to_string();

        let url = self.repo_url(repo, "git/commits");
        let response = self
            .send(
                self.request(Method::POST, &url).json(&json!({
                    "message": message,
                    "tree": tree_sha,
                    "parents": [parent_sha],
                })),
                "Failed to create commit",
            )
            .await?;
        let response = check_status(response, "commit").await?;
        let commit = Self::json(response).await?;
        let commit_sha = commit["sha"]
            .as_str()
            .ok_or_else(|| GitHostError::Decode("commit response missing sha".to_string()))?
            .to_string();

        self.patch_ref(repo, branch, &commit_sha, false).await?;

        log::debug!(
            "[GitHub] Committed {} file(s) to {} as {}",
            files.len(),
            branch,
            commit_sha
        );
        Ok(commit_sha)
    }

    async fn create_pull_request(
        &self,
        repo: &Repository,
        request: CreatePRRequest,
    ) -> Result<PullRequest, GitHostError> {
        let url = self.repo_url(repo, "pulls");
        let response = self
            .send(
                self.request(Method::POST, &url).json(&json!({
                    "title": request.title,
                    "body": request.body,
                    "head": request.head,
                    "base": request.base,
                    "draft": request.draft,
                })),
                "Failed to create PR",
            )
            .await?;
        let response = check_status(response, "pull request").await?;
        let pr_data = Self::json(response).await?;

        Ok(parse_pull_request(&pr_data))
    }

    async fn delete_branch(&self, repo: &Repository, branch: &str) -> Result<(), GitHostError> {
        let url = self.repo_url(repo, &format!("git/refs/heads/{}", branch));
        let response = self
            .send(self.request(Method::DELETE, &url), "Failed to delete branch")
            .await?;

        // GitHub answers 422 "Reference does not exist" for missing refs
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(GitHostError::NotFound(format!("branch {}", branch)));
        }
        check_status(response, &format!("branch {}", branch)).await?;

        log::info!("[GitHub] Deleted branch {} in {}", branch, repo.full_name());
        Ok(())
    }

    async fn reset_branch(
        &self,
        repo: &Repository,
        branch: &str,
        sha: &str,
    ) -> Result<(), GitHostError> {
        self.patch_ref(repo, branch, sha, true).await?;
        log::info!("[GitHub] Reset branch {} to {}", branch, sha);
        Ok(())
    }
}

/// Map non-success statuses onto GitHostError
async fn check_status(response: Response, what: &str) -> Result<Response, GitHostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    Err(classify_error(status.as_u16(), what, text))
}

fn classify_error(status: u16, what: &str, message: String) -> GitHostError {
    match status {
        404 => GitHostError::NotFound(what.to_string()),
        422 if message.contains("already exists") => GitHostError::AlreadyExists(what.to_string()),
        _ => GitHostError::Api { status, message },
    }
}

/// Decode the base64 payload of the contents API, which wraps lines at 60 chars
fn decode_base64_content(raw: &str) -> Result<String, GitHostError> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .map_err(|e| GitHostError::Decode(format!("Invalid base64 content: {}", e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn build_tree_payload(files: &[CommitFile]) -> Vec<Value> {
    files
        .iter()
        .map(|file| match &file.content {
            Some(content) => json!({
                "path": file.path,
                "mode": BLOB_MODE,
                "type": "blob",
                "content": content,
            }),
            None => json!({
                "path": file.path,
                "mode": BLOB_MODE,
                "type": "blob",
                "sha": Value::Null,
            }),
        })
        .collect()
}

fn parse_tree_entries(data: &Value) -> Vec<TreeEntry> {
    data["tree"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|entry| TreeEntry {
                    path: entry["path"].as_str().unwrap_or("").to_string(),
                    entry_type: entry["type"].as_str().unwrap_or("").to_string(),
                    sha: entry["sha"].as_str().unwrap_or("").to_string(),
                    size: entry["size"].as_u64(),
                })
                .filter(|entry| !entry.path.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_pull_request(pr_data: &Value) -> PullRequest {
    PullRequest {
        number: pr_data["number"].as_u64().unwrap_or(0),
        title: pr_data["title"].as_str().unwrap_or("").to_string(),
        state: pr_data["state"].as_str().unwrap_or("").to_string(),
        html_url: pr_data["html_url"].as_str().unwrap_or("").to_string(),
        head_branch: pr_data["head"]["ref"].as_str().unwrap_or("").to_string(),
        base_branch: pr_data["base"]["ref"].as_str().unwrap_or("").to_string(),
        draft: pr_data["draft"].as_bool().unwrap_or(false),
    }
}
