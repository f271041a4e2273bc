mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{runner, stages, FakeRemote, FakeSource};
use outline_core::{
    error::DispatchError,
    registry::{InMemoryRunStore, RunStore},
    session::{Session, SessionHandle},
    types::{Conclusion, RunEvent, RunOrigin, RunStatus},
    Dispatcher,
};
use tempfile::TempDir;

const BUILD_OK: &str = "echo building widgets\n";
const TEST_FAILS: &str = "echo 1 test failed\nexit 1\n";
const TEST_OK: &str = "echo all passed\n";

struct Harness {
    _work: TempDir,
    store: Arc<dyn RunStore>,
    remote: Arc<FakeRemote>,
    dispatcher: Dispatcher,
}

async fn harness(scripts: &[(&str, &str)], max_concurrent: usize) -> Harness {
    let work = tempfile::tempdir().unwrap();
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let remote = FakeRemote::new()
        .with_pull("acme", "widgets", 7, "feature-x")
        .with_pull("acme", "widgets", 8, "feature-y");
    let session = SessionHandle::new();
    session.install(Session::establish(remote.clone()).await.unwrap());
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        session,
        Arc::new(runner(FakeSource::new(scripts), work.path())),
        stages(&["build", "test"]),
        max_concurrent,
    );
    Harness {
        _work: work,
        store,
        remote,
        dispatcher,
    }
}

async fn wait_for_completion(store: &Arc<dyn RunStore>, run_id: u64) {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if store.get(run_id).unwrap().state.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("run did not complete in time");
}

// =============================================================================
// Blocking dispatch
// =============================================================================

#[tokio::test]
async fn failing_stage_records_failed_run_without_merge() {
    let h = harness(&[("build", BUILD_OK), ("test", TEST_FAILS)], 2).await;

    let run = h
        .dispatcher
        .dispatch_and_wait("acme", "widgets", 7, None)
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.conclusion(), Some(Conclusion::Failure));
    assert_eq!(run.origin, RunOrigin::Dispatch);
    assert!(run.logs.contains(&"[build] building widgets".to_string()));
    assert!(run.logs.contains(&"[test] 1 test failed".to_string()));
    assert!(h.remote.merges().is_empty());
}

#[tokio::test]
async fn passing_stages_record_successful_run_with_one_merge() {
    let h = harness(&[("build", BUILD_OK), ("test", TEST_OK)], 2).await;

    let run = h
        .dispatcher
        .dispatch_and_wait("acme", "widgets", 7, None)
        .await
        .unwrap();

    assert_eq!(run.conclusion(), Some(Conclusion::Success));
    assert_eq!(h.remote.merges().len(), 1);
    assert_eq!(run.logs.last().unwrap(), "[pipeline] completed: success");
    assert_eq!(h.store.get(run.run_id).unwrap().conclusion(), Some(Conclusion::Success));
}

#[tokio::test]
async fn stage_override_replaces_default_list() {
    let h = harness(&[("build", BUILD_OK), ("lint", "echo linted\n")], 2).await;

    let run = h
        .dispatcher
        .dispatch_and_wait("acme", "widgets", 7, Some(stages(&["lint"])))
        .await
        .unwrap();

    assert_eq!(run.conclusion(), Some(Conclusion::Success));
    assert!(run.logs.contains(&"[lint] linted".to_string()));
    assert!(!run.logs.iter().any(|l| l.starts_with("[build]")));
}

// =============================================================================
// Rejected dispatches
// =============================================================================

#[tokio::test]
async fn dispatch_requires_a_session() {
    let work = tempfile::tempdir().unwrap();
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        SessionHandle::new(),
        Arc::new(runner(FakeSource::new(&[]), work.path())),
        stages(&["build"]),
        1,
    );

    let err = dispatcher.dispatch("acme", "widgets", 7, None).await.unwrap_err();
    assert!(matches!(err, DispatchError::NotAuthenticated));
    assert!(store.list_all().is_empty());
}

#[tokio::test]
async fn unknown_pull_request_is_a_remote_error() {
    let h = harness(&[("build", BUILD_OK)], 1).await;

    let err = h.dispatcher.dispatch("acme", "widgets", 99, None).await.unwrap_err();
    assert!(matches!(err, DispatchError::Remote(ref e) if e.is_not_found()));
    assert!(h.store.list_all().is_empty());
}

#[tokio::test]
async fn bad_stage_lists_are_rejected() {
    let h = harness(&[("build", BUILD_OK)], 1).await;

    assert!(matches!(
        h.dispatcher.dispatch("acme", "widgets", 7, Some(vec![])).await,
        Err(DispatchError::EmptyPipeline)
    ));
    assert!(matches!(
        h.dispatcher
            .dispatch("acme", "widgets", 7, Some(stages(&["../x"])))
            .await,
        Err(DispatchError::InvalidStage { .. })
    ));
    assert!(h.store.list_all().is_empty());
}

// =============================================================================
// Background dispatch
// =============================================================================

#[tokio::test]
async fn dispatch_returns_before_the_pipeline_finishes() {
    let h = harness(&[("build", "sleep 1\necho slow build\n"), ("test", TEST_OK)], 1).await;

    let run_id = h.dispatcher.dispatch("acme", "widgets", 7, None).await.unwrap();
    let early = h.store.get(run_id).unwrap();
    assert!(!early.state.is_terminal());
    assert_eq!(early.conclusion(), None);

    wait_for_completion(&h.store, run_id).await;
    let done = h.store.get(run_id).unwrap();
    assert_eq!(done.conclusion(), Some(Conclusion::Success));
    assert!(done.logs.contains(&"[build] slow build".to_string()));
}

#[tokio::test]
async fn status_moves_through_queued_running_completed() {
    let h = harness(&[("build", BUILD_OK), ("test", TEST_OK)], 1).await;
    let mut events = h.store.subscribe();

    let run_id = h.dispatcher.dispatch("acme", "widgets", 7, None).await.unwrap();
    wait_for_completion(&h.store, run_id).await;

    let mut statuses = Vec::new();
    let mut created = false;
    while let Ok(evt) = events.try_recv() {
        match evt {
            RunEvent::Created { run_id: id, .. } if id == run_id => created = true,
            RunEvent::Status { run_id: id, status, .. } if id == run_id => statuses.push(status),
            _ => {}
        }
    }
    assert!(created);
    assert_eq!(statuses, vec![RunStatus::Running, RunStatus::Completed]);
}

#[tokio::test]
async fn redispatch_is_found_by_subject() {
    let h = harness(&[("build", BUILD_OK), ("test", TEST_OK)], 2).await;

    let first = h
        .dispatcher
        .dispatch_and_wait("acme", "widgets", 7, None)
        .await
        .unwrap();
    let second = h
        .dispatcher
        .dispatch_and_wait("acme", "widgets", 7, None)
        .await
        .unwrap();

    assert!(second.run_id > first.run_id);
    assert_eq!(
        h.store.find_by_subject("acme", "widgets", 7).unwrap().run_id,
        second.run_id
    );
    assert_eq!(h.store.list_all().len(), 2);
}

#[tokio::test]
async fn worker_pool_bounds_concurrent_pipelines() {
    let h = harness(&[("build", "sleep 0.3\n"), ("test", TEST_OK)], 1).await;
    let mut events = h.store.subscribe();

    let a = h.dispatcher.dispatch("acme", "widgets", 7, None).await.unwrap();
    let b = h.dispatcher.dispatch("acme", "widgets", 8, None).await.unwrap();
    wait_for_completion(&h.store, a).await;
    wait_for_completion(&h.store, b).await;

    let mut running = HashSet::new();
    let mut max_running = 0;
    while let Ok(evt) = events.try_recv() {
        if let RunEvent::Status { run_id, status, .. } = evt {
            match status {
                RunStatus::Running => {
                    running.insert(run_id);
                }
                RunStatus::Completed => {
                    running.remove(&run_id);
                }
                RunStatus::Queued => {}
            }
            max_running = max_running.max(running.len());
        }
    }
    assert_eq!(max_running, 1);
    assert_eq!(h.remote.merges().len(), 2);
}

#[tokio::test]
async fn external_log_lines_merge_into_the_run() {
    let h = harness(&[("build", "sleep 0.5\necho built\n"), ("test", TEST_OK)], 1).await;

    let run_id = h.dispatcher.dispatch("acme", "widgets", 7, None).await.unwrap();
    h.store
        .append_log(run_id, "[webhook] external note".into())
        .unwrap();
    wait_for_completion(&h.store, run_id).await;

    let logs = h.store.get(run_id).unwrap().logs;
    assert!(logs.contains(&"[webhook] external note".to_string()));
    assert!(logs.contains(&"[build] built".to_string()));
    assert_eq!(logs.last().unwrap(), "[pipeline] completed: success");
}
