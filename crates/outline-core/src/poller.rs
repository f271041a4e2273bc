//! Reconciliation loop: keeps remotely executed workflow runs in sync with
//! the remote's authoritative status.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::RegistryError,
    registry::RunStore,
    remote::RemoteRepo,
    session::SessionHandle,
    types::RunOrigin,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<dyn RunStore>,
    session: SessionHandle,
    interval: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RunStore>, session: SessionHandle, interval: Duration) -> Self {
        Self {
            store,
            session,
            interval,
        }
    }

    /// Query every non-completed workflow run once. A failure for one run
    /// is logged and counted; the rest of the tick carries on.
    pub async fn tick(&self, remote: &dyn RemoteRepo) -> TickReport {
        let mut report = TickReport::default();
        for run in self.store.list_pending(RunOrigin::Workflow) {
            report.checked += 1;
            let state = match remote
                .workflow_run_state(&run.owner, &run.repo, run.run_id)
                .await
            {
                Ok(state) => state,
                Err(e) => {
                    warn!(run_id = run.run_id, owner = %run.owner, repo = %run.repo, "status query failed: {e}");
                    report.failed += 1;
                    continue;
                }
            };
            match self.store.update_status(run.run_id, state) {
                Ok(true) => {
                    info!(
                        run_id = run.run_id,
                        status = state.status().as_str(),
                        conclusion = state.conclusion().map(|c| c.as_str()).unwrap_or(""),
                        "workflow run updated"
                    );
                    report.updated += 1;
                }
                Ok(false) => {}
                // Remote re-queued a run we already saw running.
                Err(RegistryError::InvalidTransition { .. }) => {
                    debug!(run_id = run.run_id, "ignoring backwards remote status {}", state.status().as_str());
                }
                Err(e) => {
                    warn!(run_id = run.run_id, "failed to apply remote status: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Tick every `interval` until `cancel` fires. Ticks are skipped while
    /// no session is installed.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_s = self.interval.as_secs(), "reconciliation poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(session) = self.session.current() else {
                continue;
            };
            let report = self.tick(session.remote().as_ref()).await;
            if report.checked > 0 {
                debug!(
                    checked = report.checked,
                    updated = report.updated,
                    failed = report.failed,
                    "reconciliation tick"
                );
            }
        }
        info!("reconciliation poller stopped");
    }
}
