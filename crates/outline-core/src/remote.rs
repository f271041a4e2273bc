use async_trait::async_trait;

use crate::{
    error::RemoteApiError,
    types::{MergeMethod, PullRequest, RunState, TestPrRequest},
};

/// Capabilities consumed from the hosted repository service.
#[async_trait]
pub trait RemoteRepo: Send + Sync {
    /// Login of the account the credential belongs to.
    async fn current_user(&self) -> Result<String, RemoteApiError>;

    async fn list_pull_requests(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<PullRequest>, RemoteApiError>;

    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequest, RemoteApiError>;

    async fn merge_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        method: MergeMethod,
    ) -> Result<(), RemoteApiError>;

    /// Authoritative state of a workflow run, mapped onto the local lifecycle.
    async fn workflow_run_state(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<RunState, RemoteApiError>;

    /// Open a throwaway pull request that touches a single file.
    async fn create_test_pull_request(
        &self,
        owner: &str,
        repo: &str,
        request: &TestPrRequest,
    ) -> Result<PullRequest, RemoteApiError>;

    /// URL `git clone` should use, credentials included where needed.
    fn clone_url(&self, owner: &str, repo: &str) -> String;
}
