//! Run registry: the canonical, concurrent-safe store of run records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    error::RegistryError,
    sink::LogSink,
    types::{Run, RunEvent, RunOrigin, RunState},
};

const EVENT_CAPACITY: usize = 1024;

/// Storage for run records. Every mutation is atomic with respect to the
/// others, and reads return consistent snapshots.
pub trait RunStore: Send + Sync {
    /// Add a new run; fails if the id is already taken.
    fn insert(&self, run: Run) -> Result<(), RegistryError>;

    fn get(&self, run_id: u64) -> Result<Run, RegistryError>;

    /// Most recent run for a pull request (highest `run_id`).
    fn find_by_subject(&self, owner: &str, repo: &str, pr_number: u64)
        -> Result<Run, RegistryError>;

    /// All runs, in insertion order.
    fn list_all(&self) -> Vec<Run>;

    /// Move a run to `state`. Returns `Ok(false)` without changing anything
    /// when the run is already completed or already in `state`.
    fn update_status(&self, run_id: u64, state: RunState) -> Result<bool, RegistryError>;

    fn append_log(&self, run_id: u64, line: String) -> Result<(), RegistryError>;

    fn subscribe(&self) -> broadcast::Receiver<RunEvent>;

    /// Snapshot of one run plus a receiver for every event after it.
    fn watch(&self, run_id: u64) -> Result<(Run, broadcast::Receiver<RunEvent>), RegistryError>;

    /// Non-completed runs with the given origin.
    fn list_pending(&self, origin: RunOrigin) -> Vec<Run> {
        self.list_all()
            .into_iter()
            .filter(|r| r.origin == origin && !r.state.is_terminal())
            .collect()
    }
}

#[derive(Default)]
struct Runs {
    ordered: Vec<Run>,
    by_id: HashMap<u64, usize>,
}

impl Runs {
    fn get_mut(&mut self, run_id: u64) -> Result<&mut Run, RegistryError> {
        let idx = *self
            .by_id
            .get(&run_id)
            .ok_or(RegistryError::NotFound(run_id))?;
        Ok(&mut self.ordered[idx])
    }
}

/// Process-local store behind a single mutex. Events are sent while the
/// lock is held so subscribers see them in mutation order.
pub struct InMemoryRunStore {
    runs: Mutex<Runs>,
    events: broadcast::Sender<RunEvent>,
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            runs: Mutex::new(Runs::default()),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Runs> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl RunStore for InMemoryRunStore {
    fn insert(&self, run: Run) -> Result<(), RegistryError> {
        let mut runs = self.lock();
        if runs.by_id.contains_key(&run.run_id) {
            return Err(RegistryError::Duplicate(run.run_id));
        }
        let event = RunEvent::Created {
            run_id: run.run_id,
            owner: run.owner.clone(),
            repo: run.repo.clone(),
            pr_number: run.pr_number,
        };
        debug!(run_id = run.run_id, owner = %run.owner, repo = %run.repo, pr = run.pr_number, "run registered");
        let idx = runs.ordered.len();
        runs.by_id.insert(run.run_id, idx);
        runs.ordered.push(run);
        self.emit(event);
        Ok(())
    }

    fn get(&self, run_id: u64) -> Result<Run, RegistryError> {
        let runs = self.lock();
        runs.by_id
            .get(&run_id)
            .map(|&idx| runs.ordered[idx].clone())
            .ok_or(RegistryError::NotFound(run_id))
    }

    fn find_by_subject(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Run, RegistryError> {
        self.lock()
            .ordered
            .iter()
            .filter(|r| r.is_for(owner, repo, pr_number))
            .max_by_key(|r| r.run_id)
            .cloned()
            .ok_or_else(|| RegistryError::SubjectNotFound {
                owner: owner.to_string(),
                repo: repo.to_string(),
                pr_number,
            })
    }

    fn list_all(&self) -> Vec<Run> {
        self.lock().ordered.clone()
    }

    fn update_status(&self, run_id: u64, state: RunState) -> Result<bool, RegistryError> {
        let mut runs = self.lock();
        let run = runs.get_mut(run_id)?;
        if run.state.is_terminal() || run.state == state {
            return Ok(false);
        }
        if !run.state.can_advance_to(state) {
            return Err(RegistryError::InvalidTransition {
                run_id,
                from: run.status(),
                to: state.status(),
            });
        }
        run.state = state;
        run.updated_at = Utc::now();
        debug!(run_id, status = state.status().as_str(), "run status updated");
        self.emit(RunEvent::Status {
            run_id,
            status: state.status(),
            conclusion: state.conclusion(),
        });
        Ok(true)
    }

    fn append_log(&self, run_id: u64, line: String) -> Result<(), RegistryError> {
        let mut runs = self.lock();
        let run = runs.get_mut(run_id)?;
        run.logs.push(line.clone());
        run.updated_at = Utc::now();
        self.emit(RunEvent::Log { run_id, line });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    fn watch(&self, run_id: u64) -> Result<(Run, broadcast::Receiver<RunEvent>), RegistryError> {
        let runs = self.lock();
        let idx = *runs
            .by_id
            .get(&run_id)
            .ok_or(RegistryError::NotFound(run_id))?;
        Ok((runs.ordered[idx].clone(), self.events.subscribe()))
    }
}

/// Routes a pipeline's log lines into a registered run.
pub struct RegistrySink {
    store: Arc<dyn RunStore>,
    run_id: u64,
}

impl RegistrySink {
    pub fn new(store: Arc<dyn RunStore>, run_id: u64) -> Self {
        Self { store, run_id }
    }
}

impl LogSink for RegistrySink {
    fn append(&self, line: String) {
        if let Err(e) = self.store.append_log(self.run_id, line) {
            warn!(run_id = self.run_id, "dropping log line: {e}");
        }
    }
}
