//! Per-connection session protocol.
//!
//! A session runs two tasks over one connection: the send loop pushes the
//! current snapshot on every send tick and a ping on every heartbeat tick,
//! and the receive loop drains inbound frames to notice a closed or silent
//! peer. Both share one termination signal. Whichever loop ends first raises
//! it; the session then joins both tasks and closes the connection before
//! [`ConnectionSession::run`] returns.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use pulse_config::PulseConfig;
use pulse_core::SnapshotStore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::SessionError;

/// Timing and size limits for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Period between data frames.
    pub send_interval: Duration,
    /// Period between ping frames. Must not exceed `idle_timeout`.
    pub heartbeat_interval: Duration,
    /// Longest silence tolerated from the peer.
    pub idle_timeout: Duration,
    /// Deadline for a single outbound write.
    pub write_timeout: Duration,
    /// Largest inbound data frame accepted.
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let idle_timeout = Duration::from_secs(60);
        Self {
            send_interval: Duration::from_secs(1),
            heartbeat_interval: idle_timeout * 9 / 10,
            idle_timeout,
            write_timeout: Duration::from_secs(10),
            max_frame_bytes: 512,
        }
    }
}

impl From<&PulseConfig> for SessionConfig {
    fn from(config: &PulseConfig) -> Self {
        Self {
            send_interval: config.send_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
            write_timeout: config.write_timeout(),
            max_frame_bytes: config.max_frame_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// The server is shutting down.
    Shutdown,
    Failed(SessionError),
}

/// Summary returned once a session is fully torn down.
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub state: SessionState,
    pub reason: CloseReason,
    pub data_frames: u64,
    pub heartbeats: u64,
}

/// Live protocol state for one connected viewer.
pub struct ConnectionSession {
    id: u64,
    store: SnapshotStore,
    config: SessionConfig,
    termination: CancellationToken,
    state: SessionState,
}

impl ConnectionSession {
    /// Create a session whose termination signal is a child of `shutdown`.
    pub fn new(
        id: u64,
        store: SnapshotStore,
        config: SessionConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            config,
            termination: shutdown.child_token(),
            state: SessionState::Active,
        }
    }

    /// Run the session over an upgraded axum websocket.
    pub async fn run_socket(self, socket: WebSocket) -> SessionReport {
        let (writer, reader) = socket.split();
        self.run(writer, reader).await
    }

    /// Run the session until either side ends it, then tear it down.
    ///
    /// Returns only after both loops have exited and the connection has been
    /// closed.
    pub async fn run<W, R, E>(self, writer: W, reader: R) -> SessionReport
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: std::error::Error + Send + Sync + 'static,
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let span = tracing::debug_span!("session", id = self.id);
        self.drive(writer, reader).instrument(span).await
    }

    async fn drive<W, R, E>(mut self, writer: W, reader: R) -> SessionReport
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: std::error::Error + Send + Sync + 'static,
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        tracing::debug!(state = ?self.state, "session started");

        let sender = tokio::spawn(
            send_loop(
                writer,
                self.store.clone(),
                self.config,
                self.termination.clone(),
            )
            .in_current_span(),
        );
        let receiver = tokio::spawn(
            receive_loop(reader, self.config, self.termination.clone()).in_current_span(),
        );

        self.termination.cancelled().await;
        self.transition(SessionState::Closing);

        let received = join_loop(receiver).await;
        let SendOutcome {
            mut writer,
            data_frames,
            heartbeats,
            result: sent,
        } = join_loop(sender).await;

        match timeout(self.config.write_timeout, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(error = %err, "connection close failed"),
            Err(_) => tracing::debug!("connection close timed out"),
        }
        drop(writer);
        self.transition(SessionState::Closed);

        let reason = close_reason(received, sent);
        match &reason {
            CloseReason::Failed(err) => {
                tracing::info!(error = %err, data_frames, heartbeats, "websocket connection closed")
            }
            other => {
                tracing::info!(reason = ?other, data_frames, heartbeats, "websocket connection closed")
            }
        }

        SessionReport {
            id: self.id,
            state: self.state,
            reason,
            data_frames,
            heartbeats,
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = ?self.state, to = ?next, "session state changed");
        self.state = next;
    }
}

/// Await a session loop, re-raising a panic from inside it.
async fn join_loop<T>(handle: JoinHandle<T>) -> T {
    match handle.await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("session loop aborted: {err}"),
    }
}

fn close_reason(
    received: Result<ReceiveEnd, SessionError>,
    sent: Result<(), SessionError>,
) -> CloseReason {
    match (received, sent) {
        (Err(err), _) => CloseReason::Failed(err),
        (Ok(ReceiveEnd::PeerClosed), _) => CloseReason::PeerClosed,
        (Ok(ReceiveEnd::Terminated), Err(err)) => CloseReason::Failed(err),
        (Ok(ReceiveEnd::Terminated), Ok(())) => CloseReason::Shutdown,
    }
}

struct SendOutcome<W> {
    writer: W,
    data_frames: u64,
    heartbeats: u64,
    result: Result<(), SessionError>,
}

async fn send_loop<W>(
    mut writer: W,
    store: SnapshotStore,
    config: SessionConfig,
    termination: CancellationToken,
) -> SendOutcome<W>
where
    W: Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    let _raise = termination.clone().drop_guard();

    let start = Instant::now();
    let mut send_timer = interval_at(start + config.send_interval, config.send_interval);
    send_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat_timer =
        interval_at(start + config.heartbeat_interval, config.heartbeat_interval);
    heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut data_frames = 0;
    let mut heartbeats = 0;

    let result = loop {
        tokio::select! {
            biased;
            _ = termination.cancelled() => break Ok(()),
            _ = send_timer.tick() => {
                let frame = match store.read().to_frame() {
                    Ok(frame) => frame,
                    Err(err) => break Err(SessionError::from(err)),
                };
                if let Err(err) = write_frame(&mut writer, Message::Text(frame.into()), config.write_timeout).await {
                    break Err(err);
                }
                data_frames += 1;
            }
            _ = heartbeat_timer.tick() => {
                if let Err(err) = write_frame(&mut writer, Message::Ping(Bytes::new()), config.write_timeout).await {
                    break Err(err);
                }
                heartbeats += 1;
                tracing::trace!("heartbeat sent");
            }
        }
    };

    // Timers are released before the connection, send timer first.
    drop(send_timer);
    drop(heartbeat_timer);

    if let Err(err) = &result {
        tracing::debug!(error = %err, "send loop failed");
    }

    SendOutcome {
        writer,
        data_frames,
        heartbeats,
        result,
    }
}

async fn write_frame<W>(
    writer: &mut W,
    message: Message,
    deadline: Duration,
) -> Result<(), SessionError>
where
    W: Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    match timeout(deadline, writer.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(SessionError::write(err)),
        Err(_) => Err(SessionError::WriteTimeout(deadline)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveEnd {
    PeerClosed,
    Terminated,
}

async fn receive_loop<R, E>(
    mut reader: R,
    config: SessionConfig,
    termination: CancellationToken,
) -> Result<ReceiveEnd, SessionError>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let _raise = termination.clone().drop_guard();

    loop {
        // Every inbound frame restarts the idle deadline.
        let next = tokio::select! {
            biased;
            _ = termination.cancelled() => return Ok(ReceiveEnd::Terminated),
            next = timeout(config.idle_timeout, reader.next()) => next,
        };

        let message = match next {
            Err(_) => return Err(SessionError::IdleTimeout(config.idle_timeout)),
            Ok(None) => return Ok(ReceiveEnd::PeerClosed),
            Ok(Some(Err(err))) => return Err(SessionError::read(err)),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Close(frame) => {
                tracing::debug!(?frame, "peer sent close");
                return Ok(ReceiveEnd::PeerClosed);
            }
            Message::Pong(_) => tracing::trace!("heartbeat acknowledged"),
            Message::Ping(_) => tracing::trace!("ping from peer"),
            Message::Text(text) => check_frame_size(text.len(), config.max_frame_bytes)?,
            Message::Binary(data) => check_frame_size(data.len(), config.max_frame_bytes)?,
        }
    }
}

fn check_frame_size(size: usize, limit: usize) -> Result<(), SessionError> {
    if size > limit {
        return Err(SessionError::FrameTooLarge { size, limit });
    }
    Ok(())
}
