//! Dispatch coordinator: turns a pull request reference into a tracked run
//! and executes its pipeline on a bounded worker pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    error::DispatchError,
    pipeline::{validate_stage_name, PipelineJob, PipelineRunner},
    registry::{RegistrySink, RunStore},
    remote::RemoteRepo,
    session::SessionHandle,
    sink::{format_line, LogSink},
    types::{Conclusion, Run, RunOrigin, RunState},
};

/// Time-derived run ids, strictly increasing within the process.
#[derive(Debug, Default)]
pub struct RunIdGenerator {
    last: AtomicU64,
}

impl RunIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn RunStore>,
    session: SessionHandle,
    runner: Arc<PipelineRunner>,
    stages: Vec<String>,
    permits: Arc<Semaphore>,
    ids: RunIdGenerator,
}

struct Started {
    run_id: u64,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RunStore>,
        session: SessionHandle,
        runner: Arc<PipelineRunner>,
        stages: Vec<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            session,
            runner,
            stages,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            ids: RunIdGenerator::new(),
        }
    }

    pub fn default_stages(&self) -> &[String] {
        &self.stages
    }

    /// Register a queued run for the pull request and start its pipeline in
    /// the background. `stages` overrides the default stage list.
    pub async fn dispatch(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
        stages: Option<Vec<String>>,
    ) -> Result<u64, DispatchError> {
        Ok(self.start(owner, repo, pr_number, stages).await?.run_id)
    }

    /// Like [`dispatch`](Self::dispatch), but waits for the pipeline to
    /// finish and returns the completed run.
    pub async fn dispatch_and_wait(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
        stages: Option<Vec<String>>,
    ) -> Result<Run, DispatchError> {
        let started = self.start(owner, repo, pr_number, stages).await?;
        started
            .task
            .await
            .map_err(|_| DispatchError::Aborted(started.run_id))?;
        Ok(self.store.get(started.run_id)?)
    }

    async fn start(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
        stages: Option<Vec<String>>,
    ) -> Result<Started, DispatchError> {
        let session = self
            .session
            .current()
            .ok_or(DispatchError::NotAuthenticated)?;

        let stages = stages.unwrap_or_else(|| self.stages.clone());
        if stages.is_empty() {
            return Err(DispatchError::EmptyPipeline);
        }
        for stage in &stages {
            validate_stage_name(stage).map_err(|e| DispatchError::InvalidStage {
                stage: stage.clone(),
                reason: e.to_string(),
            })?;
        }

        let remote = Arc::clone(session.remote());
        let pr = remote.get_pull_request(owner, repo, pr_number).await?;

        let run_id = self.ids.next_id();
        self.store
            .insert(Run::new(run_id, owner, repo, pr_number, RunOrigin::Dispatch))?;
        info!(
            run_id,
            owner,
            repo,
            pr = pr_number,
            branch = %pr.head_branch,
            stages = %stages.join(","),
            "run dispatched"
        );

        let job = PipelineJob {
            run_id,
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: pr.head_branch,
            pr_number,
            stages,
        };
        let task = tokio::spawn(execute(
            Arc::clone(&self.store),
            Arc::clone(&self.runner),
            Arc::clone(&self.permits),
            remote,
            job,
        ));
        Ok(Started { run_id, task })
    }
}

/// Worker body for one dispatched run: wait for a permit, run the pipeline,
/// record the conclusion. The pipeline itself runs in a nested task so a
/// panic still ends with a completed run.
async fn execute(
    store: Arc<dyn RunStore>,
    runner: Arc<PipelineRunner>,
    permits: Arc<Semaphore>,
    remote: Arc<dyn RemoteRepo>,
    job: PipelineJob,
) {
    let run_id = job.run_id;
    let sink = RegistrySink::new(Arc::clone(&store), run_id);

    if permits.available_permits() == 0 {
        debug!(run_id, "waiting for a pipeline worker");
    }
    let _permit = match permits.acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            sink.append(format_line("pipeline", "completed: failure (worker pool closed)"));
            finish(store.as_ref(), run_id, Conclusion::Failure);
            return;
        }
    };

    if let Err(e) = store.update_status(run_id, RunState::Running) {
        warn!(run_id, "could not mark run as running: {e}");
    }

    let pipeline_sink = RegistrySink::new(Arc::clone(&store), run_id);
    let outcome = tokio::spawn(async move {
        runner
            .run(&job, remote.as_ref(), &pipeline_sink)
            .await
            .is_ok()
    })
    .await;

    let conclusion = match outcome {
        Ok(true) => Conclusion::Success,
        Ok(false) => Conclusion::Failure,
        Err(e) => {
            error!(run_id, "pipeline task aborted: {e}");
            sink.append(format_line("pipeline", "completed: failure (pipeline task aborted)"));
            Conclusion::Failure
        }
    };
    finish(store.as_ref(), run_id, conclusion);
}

fn finish(store: &dyn RunStore, run_id: u64, conclusion: Conclusion) {
    if let Err(e) = store.update_status(run_id, RunState::Completed(conclusion)) {
        warn!(run_id, "could not record run conclusion: {e}");
    }
}
