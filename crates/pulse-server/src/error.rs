use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures that end one connection session.
///
/// None of these reach the sampler or any other session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("write failed: {0}")]
    Write(#[source] BoxError),
    #[error("read failed: {0}")]
    Read(#[source] BoxError),
    #[error("no inbound frame within {0:?}")]
    IdleTimeout(Duration),
    #[error("inbound frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    pub(crate) fn write<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Write(Box::new(err))
    }

    pub(crate) fn read<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Read(Box::new(err))
    }
}

/// The inbound request could not be turned into a websocket session.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("request is not a valid websocket upgrade: {0}")]
    Rejected(#[from] WebSocketUpgradeRejection),
    #[error("websocket upgrade failed: {0}")]
    Failed(#[source] axum::Error),
}
