use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use outline_core::{
    error::{DispatchError, RegistryError, RemoteApiError},
    session::Session,
    sink::format_line,
    types::{Conclusion, PullRequest, Run, RunEvent, RunOrigin, RunStatus, TestPrRequest},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::AppState;

type SharedState = State<Arc<AppState>>;

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn registry_status(e: RegistryError) -> StatusCode {
    match e {
        RegistryError::NotFound(_) | RegistryError::SubjectNotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::Duplicate(_) | RegistryError::InvalidTransition { .. } => {
            warn!("registry conflict: {e}");
            StatusCode::CONFLICT
        }
    }
}

fn remote_status(e: RemoteApiError) -> StatusCode {
    warn!("remote call failed: {e}");
    match e {
        RemoteApiError::Status { status: 404, .. } => StatusCode::NOT_FOUND,
        RemoteApiError::InvalidToken => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn dispatch_status(e: DispatchError) -> StatusCode {
    match e {
        DispatchError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        DispatchError::InvalidStage { .. } | DispatchError::EmptyPipeline => {
            warn!("rejected dispatch: {e}");
            StatusCode::BAD_REQUEST
        }
        DispatchError::Remote(e) => remote_status(e),
        DispatchError::Registry(e) => registry_status(e),
        DispatchError::Aborted(_) => internal(e),
    }
}

fn current_session(state: &AppState) -> Result<Arc<Session>, StatusCode> {
    state.session.current().ok_or(StatusCode::UNAUTHORIZED)
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct SessionBody {
    pub token: String,
}

#[derive(Deserialize, Default)]
pub(crate) struct DispatchQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Deserialize, Default)]
pub(crate) struct DispatchBody {
    pub stages: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
pub(crate) struct TestPrBody {
    pub base: Option<String>,
    pub file_path: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct TrackBody {
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    pub run_id: u64,
}

#[derive(Deserialize)]
pub(crate) struct LogBody {
    pub step: String,
    pub message: String,
}

// ── Serializable wrappers ─────────────────────────────────────────────────

#[derive(Serialize)]
pub(crate) struct RunSummaryJson {
    run_id: u64,
    owner: String,
    repo: String,
    pr_number: u64,
    status: RunStatus,
    conclusion: Option<Conclusion>,
    origin: RunOrigin,
    log_lines: usize,
    created_at: String,
    updated_at: String,
}

impl From<Run> for RunSummaryJson {
    fn from(r: Run) -> Self {
        Self {
            run_id: r.run_id,
            status: r.status(),
            conclusion: r.conclusion(),
            origin: r.origin,
            log_lines: r.logs.len(),
            created_at: r.created_at.to_rfc3339(),
            updated_at: r.updated_at.to_rfc3339(),
            owner: r.owner,
            repo: r.repo,
            pr_number: r.pr_number,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct PullJson {
    number: u64,
    title: String,
    branch: String,
    author: String,
    url: String,
}

impl From<PullRequest> for PullJson {
    fn from(p: PullRequest) -> Self {
        Self {
            number: p.number,
            title: p.title,
            branch: p.head_branch,
            author: p.author,
            url: p.html_url,
        }
    }
}

fn session_json(session: Option<&Session>) -> Value {
    match session {
        Some(s) => json!({
            "authenticated": true,
            "login": s.login(),
            "since": s.started_at().to_rfc3339(),
        }),
        None => json!({ "authenticated": false, "login": null }),
    }
}

// ── Router ────────────────────────────────────────────────────────────────

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Session
        .route(
            "/api/session",
            get(get_session).post(create_session).delete(delete_session),
        )
        // Pull requests
        .route("/api/repos/:owner/:repo/pulls", get(list_pulls))
        .route("/api/repos/:owner/:repo/pulls/:number/dispatch", post(dispatch_run))
        .route("/api/repos/:owner/:repo/pulls/:number/run", get(run_for_pull))
        .route("/api/repos/:owner/:repo/test-pr", post(create_test_pr))
        // Runs
        .route("/api/runs", get(list_runs))
        .route("/api/runs/track", post(track_run))
        .route("/api/runs/:id", get(get_run))
        .route("/api/runs/:id/logs", post(append_run_log))
        .route("/api/runs/:id/events", get(run_events))
        // SSE logs
        .route("/api/logs", get(sse_logs))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): SharedState) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
        "authenticated": state.session.current().is_some(),
    }))
}

// Session

pub(crate) async fn get_session(State(state): SharedState) -> Json<Value> {
    Json(session_json(state.session.current().as_deref()))
}

pub(crate) async fn create_session(
    State(state): SharedState,
    Json(body): Json<SessionBody>,
) -> Result<Json<Value>, StatusCode> {
    let token = body.token.trim();
    if token.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let remote = (state.connector)(token).map_err(remote_status)?;
    let session = Session::establish(remote).await.map_err(|e| match e {
        RemoteApiError::Status {
            status: 401 | 403, ..
        } => {
            warn!("credential rejected by remote");
            StatusCode::UNAUTHORIZED
        }
        other => remote_status(other),
    })?;
    state.token_file.save(token).map_err(internal)?;
    let session = state.session.install(session);
    Ok(Json(session_json(Some(session.as_ref()))))
}

pub(crate) async fn delete_session(State(state): SharedState) -> Result<Json<Value>, StatusCode> {
    state.session.invalidate();
    state.token_file.remove().map_err(internal)?;
    Ok(Json(session_json(None)))
}

// Pull requests

pub(crate) async fn list_pulls(
    State(state): SharedState,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Json<Vec<PullJson>>, StatusCode> {
    let session = current_session(&state)?;
    let pulls = session
        .remote()
        .list_pull_requests(&owner, &repo)
        .await
        .map_err(remote_status)?;
    Ok(Json(pulls.into_iter().map(PullJson::from).collect()))
}

pub(crate) async fn dispatch_run(
    State(state): SharedState,
    Path((owner, repo, number)): Path<(String, String, u64)>,
    Query(query): Query<DispatchQuery>,
    body: Option<Json<DispatchBody>>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let stages = body.and_then(|Json(b)| b.stages);
    if query.wait {
        let run = state
            .dispatcher
            .dispatch_and_wait(&owner, &repo, number, stages)
            .await
            .map_err(dispatch_status)?;
        return Ok((StatusCode::OK, Json(json!(run))));
    }
    let run_id = state
        .dispatcher
        .dispatch(&owner, &repo, number, stages)
        .await
        .map_err(dispatch_status)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run_id, "status": RunStatus::Queued })),
    ))
}

pub(crate) async fn run_for_pull(
    State(state): SharedState,
    Path((owner, repo, number)): Path<(String, String, u64)>,
) -> Result<Json<Run>, StatusCode> {
    state
        .store
        .find_by_subject(&owner, &repo, number)
        .map(Json)
        .map_err(registry_status)
}

pub(crate) async fn create_test_pr(
    State(state): SharedState,
    Path((owner, repo)): Path<(String, String)>,
    body: Option<Json<TestPrBody>>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let session = current_session(&state)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let request = TestPrRequest {
        base: body.base.unwrap_or_else(|| state.config.test_pr_base.clone()),
        file_path: body
            .file_path
            .unwrap_or_else(|| state.config.test_pr_file.clone()),
    };
    let pr = session
        .remote()
        .create_test_pull_request(&owner, &repo, &request)
        .await
        .map_err(remote_status)?;
    info!(owner = %owner, repo = %repo, pr = pr.number, "test pull request opened");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "number": pr.number, "url": pr.html_url, "branch": pr.head_branch })),
    ))
}

// Runs

pub(crate) async fn list_runs(State(state): SharedState) -> Json<Vec<RunSummaryJson>> {
    Json(
        state
            .store
            .list_all()
            .into_iter()
            .map(RunSummaryJson::from)
            .collect(),
    )
}

pub(crate) async fn track_run(
    State(state): SharedState,
    Json(body): Json<TrackBody>,
) -> Result<(StatusCode, Json<RunSummaryJson>), StatusCode> {
    let run = Run::new(
        body.run_id,
        body.owner,
        body.repo,
        body.pr_number,
        RunOrigin::Workflow,
    );
    state.store.insert(run.clone()).map_err(registry_status)?;
    info!(run_id = run.run_id, owner = %run.owner, repo = %run.repo, "tracking workflow run");
    Ok((StatusCode::CREATED, Json(run.into())))
}

pub(crate) async fn get_run(
    State(state): SharedState,
    Path(id): Path<u64>,
) -> Result<Json<Run>, StatusCode> {
    state.store.get(id).map(Json).map_err(registry_status)
}

pub(crate) async fn append_run_log(
    State(state): SharedState,
    Path(id): Path<u64>,
    Json(body): Json<LogBody>,
) -> Result<Json<Value>, StatusCode> {
    let step = body.step.trim();
    if step.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    // A message always contributes at least one line, even when empty.
    let mut lines: Vec<&str> = body.message.lines().collect();
    if lines.is_empty() {
        lines.push("");
    }
    for line in &lines {
        state
            .store
            .append_log(id, format_line(step, line))
            .map_err(registry_status)?;
    }
    Ok(Json(json!({ "appended": lines.len() })))
}

fn run_event(evt: &RunEvent) -> Event {
    let name = match evt {
        RunEvent::Created { .. } => "created",
        RunEvent::Status { .. } => "status",
        RunEvent::Log { .. } => "log",
    };
    Event::default()
        .event(name)
        .data(serde_json::to_string(evt).unwrap_or_default())
}

/// Replay a run's log, then stream its live events until it completes.
pub(crate) async fn run_events(
    State(state): SharedState,
    Path(id): Path<u64>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let (run, mut rx) = state.store.watch(id).map_err(registry_status)?;
    let (tx, out) = mpsc::unbounded_channel::<Event>();

    for line in &run.logs {
        let _ = tx.send(run_event(&RunEvent::Log {
            run_id: id,
            line: line.clone(),
        }));
    }
    let _ = tx.send(run_event(&RunEvent::Status {
        run_id: id,
        status: run.status(),
        conclusion: run.conclusion(),
    }));

    if !run.state.is_terminal() {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(evt) if evt.run_id() == id => {
                        let done = matches!(
                            evt,
                            RunEvent::Status {
                                status: RunStatus::Completed,
                                ..
                            }
                        );
                        if tx.send(run_event(&evt)).is_err() || done {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(run_id = id, "event stream lagged, {n} events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let stream = UnboundedReceiverStream::new(out).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    ))
}

// SSE logs

pub(crate) async fn sse_logs(
    State(state): SharedState,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .map(|ring| ring.iter().cloned().collect())
        .unwrap_or_default();
    let live = BroadcastStream::new(rx).filter_map(|msg| msg.ok());
    let stream = tokio_stream::iter(history)
        .chain(live)
        .map(|data| Ok::<_, Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
