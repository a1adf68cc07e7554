//! File-based configuration.
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```toml
//! name = "main"
//! debug = false
//!
//! [http]
//! bind_addr = "0.0.0.0:3000"
//! shutdown_timeout = "10s"
//!
//! [logging]
//! format = "default"   # default | compact | pretty | json
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::app::DEFAULT_BIND_ADDR;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Instance name; the controller id is `bough@<name>`.
    pub name: String,
    pub debug: bool,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "main".to_owned(),
            debug: false,
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("name must not be empty".to_owned()));
        }
        self.http.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub bind_addr: String,

    /// How long in-flight requests get to finish once shutdown starts.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_owned(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpConfig {
    fn validate(&self) -> Result<()> {
        self.bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| Error::Config(format!("http.bind_addr `{}`: {e}", self.bind_addr)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,

    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `bough=debug,info`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { format: LogFormat::Default, level: "info".to_owned() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Default,
    Compact,
    Pretty,
    Json,
}
