mod logging;
mod routes;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use outline_core::{
    config::Config,
    dispatch::Dispatcher,
    git::GitCli,
    github::GitHubClient,
    pipeline::{PipelineRunner, PipelineSettings},
    poller::Reconciler,
    registry::{InMemoryRunStore, RunStore},
    remote::RemoteRepo,
    session::{Session, SessionHandle, TokenFile},
    RemoteApiError,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::logging::{BroadcastLayer, LOG_RING_CAPACITY};

// ── AppState ──────────────────────────────────────────────────────────────

/// Builds a remote client for a bearer token.
pub type Connector =
    Arc<dyn Fn(&str) -> Result<Arc<dyn RemoteRepo>, RemoteApiError> + Send + Sync>;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RunStore>,
    pub session: SessionHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub connector: Connector,
    pub token_file: TokenFile,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<Mutex<VecDeque<String>>>,
}

fn github_connector(config: &Config) -> Connector {
    let api_url = config.github_api_url.clone();
    let git_base = config.git_base_url.clone();
    let timeout_s = config.request_timeout_s;
    Arc::new(move |token: &str| -> Result<Arc<dyn RemoteRepo>, RemoteApiError> {
        let client = GitHubClient::new(token, &api_url, &git_base, timeout_s)?;
        Ok(Arc::new(client) as Arc<dyn RemoteRepo>)
    })
}

/// Install a session from `GITHUB_TOKEN` or the token file, if either holds
/// a credential the remote accepts.
async fn restore_session(
    config: &Config,
    connector: &Connector,
    token_file: &TokenFile,
    session: &SessionHandle,
) {
    let token = if !config.github_token.is_empty() {
        Some(config.github_token.clone())
    } else {
        token_file.load().unwrap_or_else(|e| {
            warn!("could not read token file: {e:#}");
            None
        })
    };
    let Some(token) = token else {
        info!("no stored credential, waiting for POST /api/session");
        return;
    };
    let remote = match connector(&token) {
        Ok(r) => r,
        Err(e) => {
            warn!("stored credential unusable: {e}");
            return;
        }
    };
    match Session::establish(remote).await {
        Ok(s) => {
            session.install(s);
        }
        Err(e) => warn!("stored credential rejected: {e}"),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                warn!("failed to listen for ctrl-c: {e}");
            }
            info!("shutdown requested");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _) = broadcast::channel::<String>(1024);
    let log_ring = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "outline_server=info,outline_core=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Arc::new(Config::from_env()?);
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.work_dir)?;

    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let session = SessionHandle::new();
    let connector = github_connector(&config);
    let token_file = TokenFile::new(config.token_path());
    restore_session(&config, &connector, &token_file, &session).await;

    let runner = Arc::new(PipelineRunner::new(
        Arc::new(GitCli::new(config.stage_timeout_s)),
        PipelineSettings::from_config(&config),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        session.clone(),
        runner,
        config.pipeline_stages.clone(),
        config.pipeline_max_concurrent,
    ));

    let cancel = CancellationToken::new();
    let poller = Arc::new(Reconciler::new(
        Arc::clone(&store),
        session.clone(),
        Duration::from_secs(config.poll_interval_s),
    ));
    let poller_task = tokio::spawn(poller.run(cancel.clone()));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        session,
        dispatcher,
        connector,
        token_file,
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!(
        stages = %config.pipeline_stages.join(","),
        max_concurrent = config.pipeline_max_concurrent,
        "listening on {addr}"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    if let Err(e) = poller_task.await {
        warn!("poller task ended abnormally: {e}");
    }
    info!("outline-server stopped");
    Ok(())
}
