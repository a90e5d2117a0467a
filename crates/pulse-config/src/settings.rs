use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ADDR: &str = ":8080";
const DEFAULT_PERIOD_MS: u64 = 1000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 512;

/// Top-level configuration loaded from `pulse.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PulseConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub session: SessionSettings,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address. A host-less `:port` binds every interface.
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

/// Background sampler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplerConfig {
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
        }
    }
}

/// Per-connection timing and limits.
///
/// `send_interval_ms` falls back to the sampler period and
/// `heartbeat_interval_ms` to nine tenths of the idle timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default)]
    pub send_interval_ms: Option<u64>,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            send_interval_ms: None,
            idle_timeout_ms: default_idle_timeout_ms(),
            heartbeat_interval_ms: None,
            write_timeout_ms: default_write_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_period_ms() -> u64 {
    DEFAULT_PERIOD_MS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl PulseConfig {
    /// Parse and validate configuration TOML.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse pulse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read pulse config at {}", path.display()))?;

        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid pulse config at {}", path.display()))
    }

    /// Validate durations, limits and the listen address.
    pub fn validate(&self) -> Result<()> {
        validate_nonzero("sampler.period_ms", self.sampler.period_ms)?;
        validate_nonzero("session.idle_timeout_ms", self.session.idle_timeout_ms)?;
        validate_nonzero("session.write_timeout_ms", self.session.write_timeout_ms)?;
        if let Some(send) = self.session.send_interval_ms {
            validate_nonzero("session.send_interval_ms", send)?;
        }
        if let Some(heartbeat) = self.session.heartbeat_interval_ms {
            validate_nonzero("session.heartbeat_interval_ms", heartbeat)?;
            if heartbeat > self.session.idle_timeout_ms {
                bail!(
                    "session.heartbeat_interval_ms ({heartbeat}) must not exceed session.idle_timeout_ms ({})",
                    self.session.idle_timeout_ms
                );
            }
        }
        if self.session.max_frame_bytes == 0 {
            bail!("session.max_frame_bytes must be greater than zero");
        }

        self.listen_addr()?;
        Ok(())
    }

    /// Resolved socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let normalized = normalize_addr(&self.server.addr);
        normalized
            .parse()
            .with_context(|| format!("server.addr is not a valid socket address: {}", self.server.addr))
    }

    pub fn sampler_period(&self) -> Duration {
        Duration::from_millis(self.sampler.period_ms)
    }

    pub fn send_interval(&self) -> Duration {
        self.session
            .send_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.sampler_period())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session.idle_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        match self.session.heartbeat_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.idle_timeout() * 9 / 10,
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.session.write_timeout_ms)
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.session.max_frame_bytes
    }
}

/// Expand a host-less `:port` address to bind every IPv4 interface.
pub fn normalize_addr(addr: &str) -> String {
    let trimmed = addr.trim();
    if trimmed.starts_with(':') {
        format!("0.0.0.0{trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn validate_nonzero(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        bail!("{field} must be greater than zero");
    }
    Ok(())
}
