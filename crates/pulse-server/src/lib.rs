//! HTTP and websocket surface for pulse.
//!
//! [`server::router`] serves the dashboard page and the websocket upgrade
//! endpoint; every upgraded connection runs a
//! [`ConnectionSession`](session::ConnectionSession). [`app::App`] ties the
//! listener, the sampler and the sessions to one shutdown signal.

pub mod app;
pub mod error;
pub mod server;
pub mod session;

pub use app::App;
pub use error::{SessionError, UpgradeError};
pub use server::{router, serve, AppState};
pub use session::{CloseReason, ConnectionSession, SessionConfig, SessionReport, SessionState};
