//! Application lifecycle: one object owning the listener, the sampler task
//! and every session, all stopped by a single cancellation token.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use pulse_config::PulseConfig;
use pulse_core::{MetricsSampler, SnapshotStore};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::server::{serve, AppState};
use crate::session::SessionConfig;

/// Dropping an `App` cancels its shutdown token, which stops the sampler
/// even if [`App::run`] was never called.
pub struct App {
    listener: TcpListener,
    state: AppState,
    sampler: JoinHandle<()>,
    shutdown_guard: DropGuard,
}

impl App {
    /// Bind the listener and start the sampler.
    pub async fn bind(config: PulseConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        let store = SnapshotStore::new();
        let shutdown = CancellationToken::new();
        let sampler =
            MetricsSampler::new(store.clone(), config.sampler_period()).spawn(shutdown.clone());
        let shutdown_guard = shutdown.clone().drop_guard();
        let state = AppState::new(store, SessionConfig::from(&config), shutdown);

        Ok(Self {
            listener,
            state,
            sampler,
            shutdown_guard,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn store(&self) -> &SnapshotStore {
        self.state.store()
    }

    /// Token that stops the server, the sampler and every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown_token().clone()
    }

    /// Serve until `signal` resolves or the shutdown token is cancelled,
    /// then wait for the sampler and all sessions to finish.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            state,
            sampler,
            shutdown_guard: _shutdown_guard,
        } = self;
        let shutdown = state.shutdown_token().clone();

        let server = async {
            let served = serve(listener, state.clone()).await;
            shutdown.cancel();
            served
        };
        let trigger = async {
            tokio::select! {
                _ = signal => {
                    tracing::info!("shutdown requested");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        };
        let (served, ()) = tokio::join!(server, trigger);

        let tracker = state.tracker();
        tracker.close();
        tracing::debug!(sessions = tracker.len(), "waiting for sessions to close");
        tracker.wait().await;

        if let Err(err) = sampler.await {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }

        tracing::info!("shutdown complete");
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_config() -> PulseConfig {
        let mut config = PulseConfig::default();
        config.server.addr = "127.0.0.1:0".into();
        config.sampler.period_ms = 50;
        config
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let mut config = local_config();
        config.session.max_frame_bytes = 0;
        assert!(App::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn sampler_runs_after_bind() {
        let app = App::bind(local_config()).await.unwrap();
        assert_ne!(app.local_addr().unwrap().port(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(app.store().read().timestamp > chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);

        let token = app.shutdown_token();
        token.cancel();
        app.run(std::future::pending()).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_app_stops_the_sampler() {
        let mut config = local_config();
        config.sampler.period_ms = 20;
        let app = App::bind(config).await.unwrap();
        let store = app.store().clone();
        let token = app.shutdown_token();

        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(app);
        assert!(token.is_cancelled());

        // Let the sampler observe the cancellation before comparing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = store.read().timestamp;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.read().timestamp, before, "sampler kept publishing");
    }

    #[tokio::test]
    async fn signal_stops_the_app() {
        let app = App::bind(local_config()).await.unwrap();
        let token = app.shutdown_token();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(app.run(async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("app should stop")
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }
}
