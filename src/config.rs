//! Client configuration.
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables:
//!
//! | Variable              | Effect                                   |
//! |-----------------------|------------------------------------------|
//! | `ATOMATA_CONFIG`      | path of the TOML file                    |
//! | `ATOMATA_CONNECT`     | agent address as `host:port`             |
//! | `ATOMATA_PASSWORD`    | pre-shared password for the agent        |
//! | `ATOMATA_NO_FALLBACK` | `1`/`true`/`yes` disables the demo data  |
//!
//! All fields have defaults, so a partial file such as
//!
//! ```toml
//! connect = "192.168.1.20:36330"
//! password = "hunter2"
//! ```
//!
//! is complete.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ipc::{Endpoint, DEFAULT_MAX_FRAME_BYTES};

/// Settings for one retrieval session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Agent command-server address.
    pub connect: Endpoint,
    /// Password sent with `auth` before any other command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Whether the bundled dataset may stand in for the agent.
    pub allow_fallback: bool,
    /// Replacement for the embedded fallback dataset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_path: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    /// Budget for the whole remote exchange; unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_ms: Option<u64>,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: Endpoint::default(),
            password: None,
            allow_fallback: true,
            fallback_path: None,
            connect_timeout_ms: 5_000,
            receive_timeout_ms: 10_000,
            session_timeout_ms: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Resolve the default configuration file path.
///
/// `$XDG_CONFIG_HOME/atomata/config.toml` on Linux,
/// `~/Library/Application Support/atomata/config.toml` on macOS.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("atomata").join("config.toml"))
}

impl ClientConfig {
    /// Load settings from a TOML file. Missing fields use defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Resolve configuration from the process environment.
    ///
    /// Resolution order:
    /// 1. The file named by `ATOMATA_CONFIG` (must exist)
    /// 2. The default config path, if the file exists
    /// 3. Built-in defaults
    ///
    /// Environment overrides are applied last.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var_os("ATOMATA_CONFIG") {
            Some(path) => Self::load(Path::new(&path))?,
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::load(&path)?,
                _ => Self::default(),
            },
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `ATOMATA_*` overrides looked up through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(connect) = lookup("ATOMATA_CONNECT") {
            self.connect = connect
                .parse()
                .with_context(|| format!("Invalid ATOMATA_CONNECT value: {}", connect))?;
        }
        if let Some(password) = lookup("ATOMATA_PASSWORD") {
            self.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(flag) = lookup("ATOMATA_NO_FALLBACK") {
            if matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                self.allow_fallback = false;
            }
        }
        Ok(self)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }
}
