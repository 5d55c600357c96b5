//! Client configuration.
//!
//! Configuration can be loaded from:
//! - A TOML configuration file
//! - Environment variables (`COURIER_URI`, `COURIER_DOMAIN`)
//! - Defaults
//!
//! Environment variables take precedence over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Domain used when the identifier does not name one.
pub const DEFAULT_DOMAIN: &str = "msging.net";

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hub address handed to the transport.
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Domain of the client node.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Instance of the client node.
    #[serde(default = "default_instance")]
    pub instance: String,

    /// How long `send_command` waits for a response, in milliseconds.
    /// Zero waits forever.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Log every envelope the transport sends and receives.
    #[serde(default)]
    pub trace: bool,
}

const URI_VAR: &str = "COURIER_URI";
const DOMAIN_VAR: &str = "COURIER_DOMAIN";

fn default_uri() -> String {
    std::env::var(URI_VAR).unwrap_or_else(|_| "net.tcp://msging.net:55321".to_string())
}

fn default_domain() -> String {
    std::env::var(DOMAIN_VAR).unwrap_or_else(|_| DEFAULT_DOMAIN.to_string())
}

fn default_instance() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("courier-{}", &uuid[..8])
}

fn default_command_timeout() -> u64 {
    30_000 // 30 seconds
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            domain: default_domain(),
            instance: default_instance(),
            command_timeout_ms: default_command_timeout(),
            trace: false,
        }
    }
}

impl ClientConfig {
    /// Defaults for the hub at `uri`.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = ["courier.toml", "~/.config/courier/courier.toml"];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config.with_env_overrides())
    }

    /// Apply `COURIER_URI` and `COURIER_DOMAIN` when they are set.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(std::env::var(URI_VAR).ok(), std::env::var(DOMAIN_VAR).ok())
    }

    /// Replace the uri and domain with whichever of the given values are set.
    #[must_use]
    pub fn with_overrides(mut self, uri: Option<String>, domain: Option<String>) -> Self {
        if let Some(uri) = uri {
            self.uri = uri;
        }
        if let Some(domain) = domain {
            self.domain = domain;
        }
        self
    }

    /// The command response timeout, if any.
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_ms > 0).then(|| Duration::from_millis(self.command_timeout_ms))
    }
}
