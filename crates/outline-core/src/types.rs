use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Run lifecycle ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Success,
    Failure,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Status and conclusion of a run in one value, so a conclusion can only
/// exist on a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StateParts", try_from = "StateParts")]
pub enum RunState {
    Queued,
    Running,
    Completed(Conclusion),
}

impl RunState {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Queued => RunStatus::Queued,
            Self::Running => RunStatus::Running,
            Self::Completed(_) => RunStatus::Completed,
        }
    }

    pub fn conclusion(&self) -> Option<Conclusion> {
        match self {
            Self::Completed(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Rebuild a state from its wire parts. Returns `None` when the parts
    /// disagree (a conclusion without completion, or completion without one).
    pub fn from_parts(status: RunStatus, conclusion: Option<Conclusion>) -> Option<Self> {
        match (status, conclusion) {
            (RunStatus::Queued, None) => Some(Self::Queued),
            (RunStatus::Running, None) => Some(Self::Running),
            (RunStatus::Completed, Some(c)) => Some(Self::Completed(c)),
            _ => None,
        }
    }

    /// Forward-only lifecycle: queued → running → completed, with queued →
    /// completed allowed for runs that finish before they are observed running.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Completed(_))
                | (Self::Running, Self::Completed(_))
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct StateParts {
    status: RunStatus,
    #[serde(default)]
    conclusion: Option<Conclusion>,
}

impl From<RunState> for StateParts {
    fn from(state: RunState) -> Self {
        Self {
            status: state.status(),
            conclusion: state.conclusion(),
        }
    }
}

impl TryFrom<StateParts> for RunState {
    type Error = String;

    fn try_from(parts: StateParts) -> Result<Self, Self::Error> {
        RunState::from_parts(parts.status, parts.conclusion).ok_or_else(|| {
            format!(
                "conclusion {:?} is not valid for status '{}'",
                parts.conclusion,
                parts.status.as_str()
            )
        })
    }
}

/// Who drives a run's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOrigin {
    /// Executed locally by the pipeline runner.
    Dispatch,
    /// Executed remotely; kept in sync by the reconciliation poller.
    Workflow,
}

// ── Run ──────────────────────────────────────────────────────────────────

/// One tracked execution for a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: u64,
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    #[serde(flatten)]
    pub state: RunState,
    pub origin: RunOrigin,
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        run_id: u64,
        owner: impl Into<String>,
        repo: impl Into<String>,
        pr_number: u64,
        origin: RunOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            owner: owner.into(),
            repo: repo.into(),
            pr_number,
            state: RunState::Queued,
            origin,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    pub fn conclusion(&self) -> Option<Conclusion> {
        self.state.conclusion()
    }

    pub fn is_for(&self, owner: &str, repo: &str, pr_number: u64) -> bool {
        self.pr_number == pr_number && self.owner == owner && self.repo == repo
    }
}

/// Registry change notifications, in mutation order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Created {
        run_id: u64,
        owner: String,
        repo: String,
        pr_number: u64,
    },
    Status {
        run_id: u64,
        status: RunStatus,
        conclusion: Option<Conclusion>,
    },
    Log {
        run_id: u64,
        line: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> u64 {
        match self {
            Self::Created { run_id, .. } | Self::Status { run_id, .. } | Self::Log { run_id, .. } => {
                *run_id
            }
        }
    }
}

// ── Remote repository ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub head_branch: String,
    pub head_sha: String,
    pub author: String,
    pub html_url: String,
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Squash,
    Merge,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Squash => "squash",
            Self::Merge => "merge",
            Self::Rebase => "rebase",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "squash" => Some(Self::Squash),
            "merge" => Some(Self::Merge),
            "rebase" => Some(Self::Rebase),
            _ => None,
        }
    }
}

/// Parameters for opening a throwaway pull request against a repository.
#[derive(Debug, Clone)]
pub struct TestPrRequest {
    pub base: String,
    pub file_path: String,
}
