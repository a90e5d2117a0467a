//! Core telemetry pipeline for pulse.
//!
//! This crate provides the pieces shared by the server and the command-line
//! entry point: the [`Snapshot`](snapshot::Snapshot) value and its
//! concurrent store, the metric sources, the background sampler, and the
//! logging subsystem.

pub mod logging;
pub mod sampler;
pub mod snapshot;
pub mod source;

pub use sampler::MetricsSampler;
pub use snapshot::{Snapshot, SnapshotStore};
pub use source::{MetricSource, MetricSourceError};
