//! GitHub REST implementation of [`RemoteRepo`].

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use reqwest::{header, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::{debug, info};

use crate::{
    error::RemoteApiError,
    remote::RemoteRepo,
    types::{Conclusion, MergeMethod, PullRequest, RunState, TestPrRequest},
};

const MAX_ERROR_BODY: usize = 800;

pub struct GitHubClient {
    http: Client,
    api_base: String,
    git_base: String,
    token: String,
}

impl GitHubClient {
    pub fn new(
        token: &str,
        api_base: &str,
        git_base: &str,
        request_timeout_s: u64,
    ) -> Result<Self, RemoteApiError> {
        let token = token.trim().to_string();
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static("outline"));
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            header::HeaderValue::from_static("2022-11-28"),
        );
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| RemoteApiError::InvalidToken)?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(request_timeout_s.max(1)))
            .build()
            .map_err(|source| RemoteApiError::Http {
                operation: "build client".into(),
                source,
            })?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            git_base: git_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn repo_url(&self, owner: &str, repo: &str, path: &str) -> String {
        format!("{}/repos/{owner}/{repo}{path}", self.api_base)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, RemoteApiError> {
        let response = request.send().await.map_err(|source| RemoteApiError::Http {
            operation: operation.to_string(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteApiError::Status {
                operation: operation.to_string(),
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteApiError::Decode {
                operation: operation.to_string(),
                message: e.to_string(),
            })
    }

    /// Current contents of `path` on `git_ref`, or `None` when the file is absent.
    async fn file_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<(String, String)>, RemoteApiError> {
        let request = self
            .http
            .get(self.repo_url(owner, repo, &format!("/contents/{path}")))
            .query(&[("ref", git_ref)]);
        let content: GhContent = match self.send_json("get file contents", request).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if content.kind != "file" {
            return Err(RemoteApiError::Decode {
                operation: "get file contents".into(),
                message: format!("{path} is a {}, not a file", content.kind),
            });
        }
        let text = decode_content(content.content.as_deref().unwrap_or("")).map_err(|message| {
            RemoteApiError::Decode {
                operation: "get file contents".into(),
                message,
            }
        })?;
        Ok(Some((text, content.sha)))
    }
}

// ── Wire types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Deserialize)]
struct GhHead {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
}

#[derive(Deserialize)]
struct GhPull {
    number: u64,
    title: String,
    state: String,
    html_url: String,
    head: GhHead,
    user: Option<GhUser>,
}

impl From<GhPull> for PullRequest {
    fn from(p: GhPull) -> Self {
        Self {
            number: p.number,
            title: p.title,
            head_branch: p.head.branch,
            head_sha: p.head.sha,
            author: p.user.map(|u| u.login).unwrap_or_default(),
            html_url: p.html_url,
            state: p.state,
        }
    }
}

#[derive(Deserialize)]
struct GhMergeResult {
    merged: bool,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct GhWorkflowRun {
    status: Option<String>,
    conclusion: Option<String>,
}

#[derive(Deserialize)]
struct GhObject {
    sha: String,
}

#[derive(Deserialize)]
struct GhRef {
    object: GhObject,
}

#[derive(Deserialize)]
struct GhContent {
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    content: Option<String>,
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Map a remote workflow run's status/conclusion pair onto the local lifecycle.
pub fn map_workflow_state(status: &str, conclusion: Option<&str>) -> Result<RunState, String> {
    match status {
        "queued" | "requested" | "waiting" | "pending" => Ok(RunState::Queued),
        "in_progress" => Ok(RunState::Running),
        "completed" => match conclusion {
            Some("success") | Some("neutral") | Some("skipped") => {
                Ok(RunState::Completed(Conclusion::Success))
            }
            Some(_) => Ok(RunState::Completed(Conclusion::Failure)),
            None => Err("completed run has no conclusion".to_string()),
        },
        other => Err(format!("unknown workflow status '{other}'")),
    }
}

/// Decode the base64 body GitHub returns for file contents (line-wrapped).
fn decode_content(encoded: &str) -> Result<String, String> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64.decode(compact).map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

fn append_test_line(existing: &str, stamp: &str) -> String {
    if existing.is_empty() {
        format!("{stamp} - Outline test\n")
    } else {
        format!("{}\n{stamp} - Outline test\n", existing.trim_end_matches('\n'))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ── RemoteRepo ────────────────────────────────────────────────────────────

#[async_trait]
impl RemoteRepo for GitHubClient {
    async fn current_user(&self) -> Result<String, RemoteApiError> {
        let request = self.http.get(format!("{}/user", self.api_base));
        let user: GhUser = self.send_json("get authenticated user", request).await?;
        Ok(user.login)
    }

    async fn list_pull_requests(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<PullRequest>, RemoteApiError> {
        let request = self
            .http
            .get(self.repo_url(owner, repo, "/pulls"))
            .query(&[("state", "open"), ("per_page", "100")]);
        let pulls: Vec<GhPull> = self.send_json("list pull requests", request).await?;
        Ok(pulls.into_iter().map(PullRequest::from).collect())
    }

    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequest, RemoteApiError> {
        let request = self
            .http
            .get(self.repo_url(owner, repo, &format!("/pulls/{number}")));
        let pull: GhPull = self.send_json("get pull request", request).await?;
        Ok(pull.into())
    }

    async fn merge_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        method: MergeMethod,
    ) -> Result<(), RemoteApiError> {
        let request = self
            .http
            .put(self.repo_url(owner, repo, &format!("/pulls/{number}/merge")))
            .json(&json!({ "merge_method": method.as_str() }));
        let result: GhMergeResult = self.send_json("merge pull request", request).await?;
        if !result.merged {
            return Err(RemoteApiError::Rejected {
                operation: "merge pull request".into(),
                message: result.message,
            });
        }
        info!(owner, repo, pr = number, method = method.as_str(), "pull request merged");
        Ok(())
    }

    async fn workflow_run_state(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<RunState, RemoteApiError> {
        let request = self
            .http
            .get(self.repo_url(owner, repo, &format!("/actions/runs/{run_id}")));
        let run: GhWorkflowRun = self.send_json("get workflow run", request).await?;
        map_workflow_state(run.status.as_deref().unwrap_or(""), run.conclusion.as_deref())
            .map_err(|message| RemoteApiError::Decode {
                operation: "get workflow run".into(),
                message,
            })
    }

    async fn create_test_pull_request(
        &self,
        owner: &str,
        repo: &str,
        request: &TestPrRequest,
    ) -> Result<PullRequest, RemoteApiError> {
        let now = Utc::now();
        let branch = format!("outline-test-{}", now.timestamp_millis());
        let stamp = now.format("%Y-%m-%d %H.%M.%S UTC").to_string();

        let base_ref: GhRef = self
            .send_json(
                "get base ref",
                self.http.get(self.repo_url(
                    owner,
                    repo,
                    &format!("/git/ref/heads/{}", request.base),
                )),
            )
            .await?;
        debug!(owner, repo, base = %request.base, sha = %base_ref.object.sha, "resolved base ref");

        let _: serde_json::Value = self
            .send_json(
                "create branch",
                self.http
                    .post(self.repo_url(owner, repo, "/git/refs"))
                    .json(&json!({
                        "ref": format!("refs/heads/{branch}"),
                        "sha": base_ref.object.sha,
                    })),
            )
            .await?;

        let existing = self
            .file_contents(owner, repo, &request.file_path, &request.base)
            .await?;
        let (text, sha) = match existing {
            Some((text, sha)) => (text, Some(sha)),
            None => (String::new(), None),
        };

        let mut body = json!({
            "message": format!("Outline test update at {stamp}"),
            "content": BASE64.encode(append_test_line(&text, &stamp)),
            "branch": branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }
        let _: serde_json::Value = self
            .send_json(
                "commit test file",
                self.http
                    .put(self.repo_url(owner, repo, &format!("/contents/{}", request.file_path)))
                    .json(&body),
            )
            .await?;

        let pull: GhPull = self
            .send_json(
                "create pull request",
                self.http
                    .post(self.repo_url(owner, repo, "/pulls"))
                    .json(&json!({
                        "title": format!("Outline Test PR - {stamp}"),
                        "body": "Automated test PR for Outline pipeline",
                        "head": branch,
                        "base": request.base,
                    })),
            )
            .await?;
        info!(owner, repo, pr = pull.number, url = %pull.html_url, "test pull request created");
        Ok(pull.into())
    }

    fn clone_url(&self, owner: &str, repo: &str) -> String {
        match self.git_base.strip_prefix("https://") {
            Some(host) if !self.token.is_empty() => format!(
                "https://x-access-token:{}@{host}/{owner}/{repo}.git",
                self.token
            ),
            _ => format!("{}/{owner}/{repo}.git", self.git_base),
        }
    }
}
