use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use futures::future::{self, Either};
use pulse_core::SnapshotStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::{task_tracker::TrackedFuture, TaskTracker};

use crate::error::UpgradeError;
use crate::session::{ConnectionSession, SessionConfig};

const DASHBOARD_HTML: &str = include_str!("../assets/index.html");

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    store: SnapshotStore,
    session: SessionConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(store: SnapshotStore, session: SessionConfig, shutdown: CancellationToken) -> Self {
        Self {
            store,
            session,
            shutdown,
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Tracker holding every running session task.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Number of sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enter_session(&self) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.active.clone())
    }
}

/// Decrements the live-session gauge when a session ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build the HTTP routes: the dashboard at `/` and the upgrade endpoint at
/// `/echo`.
///
/// Handlers read the peer address, so the router must be served with
/// `into_make_service_with_connect_info::<SocketAddr>()` (see [`serve`]).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/echo", get(upgrade))
        .with_state(state)
}

/// Serve `router(state)` on `listener` until the state's shutdown token is
/// cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("http server failed")
}

async fn dashboard(ConnectInfo(peer): ConnectInfo<SocketAddr>) -> Html<&'static str> {
    tracing::info!(%peer, "dashboard requested");
    Html(DASHBOARD_HTML)
}

async fn upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let status = rejection.status();
            let err = UpgradeError::from(rejection);
            tracing::warn!(%peer, error = %err, "websocket upgrade rejected");
            return (status, err.to_string()).into_response();
        }
    };

    let id = state.next_session_id();
    let config = state.session;
    let session_state = state.clone();

    ws.max_message_size(config.max_frame_bytes)
        .max_frame_size(config.max_frame_bytes)
        .on_failed_upgrade(move |err| {
            let err = UpgradeError::Failed(err);
            tracing::warn!(%peer, error = %err, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| {
            let state = session_state;
            let session =
                ConnectionSession::new(id, state.store.clone(), config, &state.shutdown);
            let gauge = state.clone();
            let run = async move {
                let guard = gauge.enter_session();
                tracing::info!(%peer, session = id, "websocket connection established");
                let report = session.run_socket(socket).await;
                drop(guard);
                tracing::debug!(session = report.id, "session released");
            };

            match admit_session(&state, run) {
                Some(tracked) => Either::Left(tracked),
                None => {
                    tracing::debug!(%peer, session = id, "server shutting down, dropping upgraded connection");
                    Either::Right(future::ready(()))
                }
            }
        })
}

/// Put a session on the tracker, or refuse it once shutdown has begun.
///
/// After shutdown the tracker may already be closed and drained, so a
/// late session would run unjoined.
fn admit_session<F>(state: &AppState, session: F) -> Option<TrackedFuture<F>>
where
    F: Future<Output = ()>,
{
    if state.shutdown.is_cancelled() {
        return None;
    }
    Some(state.tracker.track_future(session))
}
