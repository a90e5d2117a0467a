//! Configuration types and loaders for pulse.
//!
//! This crate owns the on-disk configuration schema so the server and the
//! command-line entry point share a single source of truth.

pub mod settings;

pub use settings::{normalize_addr, PulseConfig, SamplerConfig, ServerConfig, SessionSettings};
