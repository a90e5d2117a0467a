use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use pulse_config::PulseConfig;
use pulse_core::logging;
use pulse_server::App;

/// Stream live host telemetry to browser dashboards over websockets.
#[derive(Debug, Parser)]
#[command(name = "pulse", version)]
struct Cli {
    /// HTTP service address, e.g. `:8080` or `127.0.0.1:8080`.
    #[arg(long)]
    addr: Option<String>,

    /// Sampling and push period, e.g. `1000ms` or `2s`.
    #[arg(long, value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// TOML configuration file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Merge defaults, the optional config file and flags, in that order.
    fn resolve_config(&self) -> Result<PulseConfig> {
        let mut config = match &self.config {
            Some(path) => PulseConfig::from_path(path)?,
            None => PulseConfig::default(),
        };

        if let Some(addr) = &self.addr {
            config.server.addr = addr.clone();
        }
        if let Some(period) = self.period {
            config.sampler.period_ms =
                u64::try_from(period.as_millis()).context("--period is too large")?;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init()?;
    tracing::info!("pulse starting up");

    let config = cli.resolve_config()?;
    let app = App::bind(config).await?;
    tracing::info!(addr = %app.local_addr()?, "dashboard available");

    app.run(shutdown_signal()).await
}
