//! Pull request pipeline: clone, checkout, ordered stages, merge.
//!
//! Each run gets its own working directory. The first failing step ends the
//! run; remaining stages are skipped and no merge is attempted. Every run,
//! successful or not, ends with a `[pipeline] completed: ...` log line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::PipelineError,
    executor::{StageCommand, StageExecutor},
    git::{redact_credentials, SourceControl},
    remote::RemoteRepo,
    sink::{format_line, LogSink},
    types::{Conclusion, MergeMethod},
    workspace::WorkDir,
};

const PIPELINE_STEP: &str = "pipeline";

/// One pipeline invocation for a pull request.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub run_id: u64,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub pr_number: u64,
    pub stages: Vec<String>,
}

impl PipelineJob {
    pub fn subject(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.pr_number)
    }
}

/// Position in the per-run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    Cloning,
    CheckingOut,
    RunningStage(usize),
    Merging,
    Done(Conclusion),
}

impl PipelineStep {
    fn describe(&self, job: &PipelineJob) -> String {
        match self {
            Self::Cloning => format!("cloning {}/{}", job.owner, job.repo),
            Self::CheckingOut => format!("checking out {}", job.branch),
            Self::RunningStage(i) => format!(
                "stage {}/{}: {}",
                i + 1,
                job.stages.len(),
                job.stages.get(*i).map(String::as_str).unwrap_or("?")
            ),
            Self::Merging => format!("merging pull request #{}", job.pr_number),
            Self::Done(c) => format!("completed: {}", c.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_root: PathBuf,
    pub keep_workdirs: bool,
    /// Directory, relative to the repository root, holding `<stage>.sh`.
    pub stage_dir: String,
    pub interpreter: String,
    pub stage_timeout_s: u64,
    pub merge_method: MergeMethod,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_root: PathBuf::from(&config.work_dir),
            keep_workdirs: config.keep_workdirs,
            stage_dir: config.stage_dir.clone(),
            interpreter: config.stage_interpreter.clone(),
            stage_timeout_s: config.stage_timeout_s,
            merge_method: config.merge_method,
        }
    }
}

pub struct PipelineRunner {
    source: Arc<dyn SourceControl>,
    settings: PipelineSettings,
    executor: StageExecutor,
}

impl PipelineRunner {
    pub fn new(source: Arc<dyn SourceControl>, settings: PipelineSettings) -> Self {
        let executor = StageExecutor::new(settings.stage_timeout_s);
        Self {
            source,
            settings,
            executor,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run the whole pipeline for `job`, writing progress and stage output
    /// to `sink`. Returns the first failure; the final log line is written
    /// either way.
    pub async fn run(
        &self,
        job: &PipelineJob,
        remote: &dyn RemoteRepo,
        sink: &dyn LogSink,
    ) -> Result<(), PipelineError> {
        info!(run_id = job.run_id, subject = %job.subject(), branch = %job.branch, "pipeline started");
        let result = self.drive(job, remote, sink).await;
        match &result {
            Ok(()) => {
                self.enter(PipelineStep::Done(Conclusion::Success), job, sink);
                info!(run_id = job.run_id, subject = %job.subject(), "pipeline succeeded");
            }
            Err(e) => {
                sink.append(format_line(
                    PIPELINE_STEP,
                    &format!("{} ({e})", PipelineStep::Done(Conclusion::Failure).describe(job)),
                ));
                warn!(run_id = job.run_id, subject = %job.subject(), "pipeline failed: {e}");
            }
        }
        result
    }

    fn enter(&self, step: PipelineStep, job: &PipelineJob, sink: &dyn LogSink) {
        debug!(run_id = job.run_id, ?step, "pipeline step");
        sink.append(format_line(PIPELINE_STEP, &step.describe(job)));
    }

    async fn drive(
        &self,
        job: &PipelineJob,
        remote: &dyn RemoteRepo,
        sink: &dyn LogSink,
    ) -> Result<(), PipelineError> {
        for stage in &job.stages {
            validate_stage_name(stage).map_err(|e| PipelineError::InvalidStage {
                stage: stage.clone(),
                reason: e.to_string(),
            })?;
        }

        let workdir = WorkDir::create(&self.settings.work_root, &job.repo, self.settings.keep_workdirs)
            .map_err(PipelineError::Workspace)?;
        let dir = workdir.path();

        self.enter(PipelineStep::Cloning, job, sink);
        let url = remote.clone_url(&job.owner, &job.repo);
        self.source
            .clone_repo(&url, dir, sink)
            .await
            .map_err(|e| PipelineError::Clone {
                repo: format!("{}/{}", job.owner, job.repo),
                message: redact_credentials(&format!("{e:#}")),
            })?;

        self.enter(PipelineStep::CheckingOut, job, sink);
        self.source
            .checkout(dir, &job.branch, job.pr_number, sink)
            .await
            .map_err(|e| PipelineError::Checkout {
                branch: job.branch.clone(),
                message: format!("{e:#}"),
            })?;

        for (index, stage) in job.stages.iter().enumerate() {
            self.enter(PipelineStep::RunningStage(index), job, sink);
            self.run_stage(job, stage, dir, sink).await?;
        }

        self.enter(PipelineStep::Merging, job, sink);
        remote
            .merge_pull_request(&job.owner, &job.repo, job.pr_number, self.settings.merge_method)
            .await
            .map_err(|source| PipelineError::Merge {
                pr_number: job.pr_number,
                source,
            })?;
        sink.append(format_line(
            PIPELINE_STEP,
            &format!(
                "merged pull request #{} ({})",
                job.pr_number,
                self.settings.merge_method.as_str()
            ),
        ));
        Ok(())
    }

    async fn run_stage(
        &self,
        job: &PipelineJob,
        stage: &str,
        dir: &Path,
        sink: &dyn LogSink,
    ) -> Result<(), PipelineError> {
        let script = Path::new(&self.settings.stage_dir).join(format!("{stage}.sh"));
        let cmd = StageCommand::script(&self.settings.interpreter, script)
            .env("OUTLINE_RUN_ID", job.run_id.to_string())
            .env("OUTLINE_STAGE", stage)
            .env("OUTLINE_PR_NUMBER", job.pr_number.to_string())
            .env("OUTLINE_BRANCH", job.branch.as_str());
        debug!(run_id = job.run_id, stage, command = %cmd.display(), "starting stage");

        let outcome = self
            .executor
            .execute(&cmd, dir, &mut |_, line| sink.append(format_line(stage, line)))
            .await
            .map_err(|source| PipelineError::Spawn {
                stage: stage.to_string(),
                source,
            })?;

        if outcome.timed_out {
            sink.append(format_line(
                stage,
                &format!("timed out after {}s, process killed", self.executor.timeout_s()),
            ));
            return Err(PipelineError::StageTimeout {
                stage: stage.to_string(),
                timeout_s: self.executor.timeout_s(),
            });
        }
        if !outcome.success() {
            return Err(PipelineError::StageFailure {
                stage: stage.to_string(),
                exit_code: outcome.exit_code,
            });
        }
        info!(
            run_id = job.run_id,
            stage,
            duration_ms = outcome.duration_ms,
            "stage passed"
        );
        Ok(())
    }
}

/// Stage names become `<stage_dir>/<name>.sh`, so they must be a plain
/// file-name component.
pub fn validate_stage_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        anyhow::bail!("empty stage name");
    }
    if name.contains("..") || name.starts_with('.') {
        anyhow::bail!("path traversal not allowed: {name}");
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        anyhow::bail!("character {c:?} not allowed in stage name {name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PipelineJob {
        PipelineJob {
            run_id: 1,
            owner: "acme".into(),
            repo: "widgets".into(),
            branch: "feature-x".into(),
            pr_number: 7,
            stages: vec!["build".into(), "test".into()],
        }
    }

    #[test]
    fn stage_names() {
        assert!(validate_stage_name("build").is_ok());
        assert!(validate_stage_name("e2e_tests-v2.1").is_ok());
        assert!(validate_stage_name("").is_err());
        assert!(validate_stage_name("../etc/passwd").is_err());
        assert!(validate_stage_name("a/b").is_err());
        assert!(validate_stage_name(".hidden").is_err());
        assert!(validate_stage_name("rm -rf").is_err());
    }

    #[test]
    fn step_descriptions() {
        let job = job();
        assert_eq!(PipelineStep::Cloning.describe(&job), "cloning acme/widgets");
        assert_eq!(PipelineStep::RunningStage(1).describe(&job), "stage 2/2: test");
        assert_eq!(
            PipelineStep::Done(Conclusion::Failure).describe(&job),
            "completed: failure"
        );
        assert_eq!(job.subject(), "acme/widgets#7");
    }

    #[test]
    fn settings_follow_config() {
        let mut config = crate::config::Config::default();
        config.stage_timeout_s = 12;
        config.merge_method = MergeMethod::Rebase;
        let settings = PipelineSettings::from_config(&config);
        assert_eq!(settings.stage_timeout_s, 12);
        assert_eq!(settings.merge_method, MergeMethod::Rebase);
        assert_eq!(settings.stage_dir, ".outline");
    }
}
