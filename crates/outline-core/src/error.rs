use thiserror::Error;

use crate::types::RunStatus;

/// Failure of a call against the remote repository API.
#[derive(Debug, Error)]
pub enum RemoteApiError {
    #[error("{operation} request failed: {source}")]
    Http {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation} returned an unexpected payload: {message}")]
    Decode { operation: String, message: String },

    #[error("{operation} was rejected: {message}")]
    Rejected { operation: String, message: String },

    #[error("bearer token is not a valid header value")]
    InvalidToken,
}

impl RemoteApiError {
    /// True when the remote answered 404 for the requested object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// Why a pipeline run ended in failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to prepare working directory: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("clone of {repo} failed: {message}")]
    Clone { repo: String, message: String },

    #[error("checkout of branch '{branch}' failed: {message}")]
    Checkout { branch: String, message: String },

    #[error("invalid stage name '{stage}': {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("stage '{stage}' could not be started: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage '{stage}' exited with code {exit_code}")]
    StageFailure { stage: String, exit_code: i32 },

    #[error("stage '{stage}' timed out after {timeout_s}s")]
    StageTimeout { stage: String, timeout_s: u64 },

    #[error("merge of pull request #{pr_number} failed: {source}")]
    Merge {
        pr_number: u64,
        #[source]
        source: RemoteApiError,
    },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("run {0} not found")]
    NotFound(u64),

    #[error("no run found for {owner}/{repo}#{pr_number}")]
    SubjectNotFound {
        owner: String,
        repo: String,
        pr_number: u64,
    },

    #[error("run {0} already exists")]
    Duplicate(u64),

    #[error("run {run_id} cannot move from {} to {}", from.as_str(), to.as_str())]
    InvalidTransition {
        run_id: u64,
        from: RunStatus,
        to: RunStatus,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no authenticated session")]
    NotAuthenticated,

    #[error("invalid stage name '{stage}': {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("pipeline has no stages")]
    EmptyPipeline,

    #[error(transparent)]
    Remote(#[from] RemoteApiError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("pipeline task for run {0} was aborted")]
    Aborted(u64),
}
