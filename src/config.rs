//! Configuration management.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bond::BondConfig;
use crate::error::{Error, Result};
use crate::link::LinkConfig;
use crate::metrics::MetricsConfig;
use crate::proxy::ProxyConfig;
use crate::tun::TunConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Accept incoming links on this UDP port. The listening endpoint is
    /// the "master" side of a deployment.
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// `host:port` peers to dial directly.
    #[serde(default)]
    pub targets: Vec<String>,

    /// `host:port` SOCKS5 proxies to dial through.
    #[serde(default)]
    pub proxies: Vec<String>,

    /// `host:port` the proxies should relay to.
    #[serde(default)]
    pub proxy_target: Option<String>,

    /// Multiplexer tuning.
    #[serde(default)]
    pub bond: BondConfig,

    /// Link registry and socket tuning.
    #[serde(default)]
    pub link: LinkConfig,

    /// Proxy transport tuning.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// TUN device settings.
    #[serde(default)]
    pub tun: TunConfig,

    /// Metrics settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config: {e}")))?;
        Ok(())
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.listen_port.is_none() && self.targets.is_empty() && self.proxies.is_empty() {
            return Err(Error::Config(
                "nothing to do: no listen port, targets, or proxies configured".into(),
            ));
        }
        if !self.proxies.is_empty() && self.proxy_target.is_none() {
            return Err(Error::Config(
                "proxies configured without a proxy target".into(),
            ));
        }
        if self.bond.max_draws == 0 {
            return Err(Error::Config("bond.max_draws must be at least 1".into()));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level (`error`, `warn`, `info`, `debug`, `trace`),
    /// overridable via `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors in text output.
    #[serde(default = "default_log_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_log_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_log_color(),
        }
    }
}

/// Initialize the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;
    }

    Ok(())
}
