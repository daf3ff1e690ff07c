// Linkwatch — Server Configuration
//
// Load order, later wins:
//   1. TOML file (--config / LINKWATCH_CONFIG, else the per-user config dir)
//   2. environment overrides (PORT, BIND_ADDRESS, SESSIONS_DIR, ...)
//   3. CLI flags, applied by main
//
// Blank environment values are treated as unset.

use anyhow::{Context, Result};
use linkwatch_core::EngineSettings;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_address: String,
    pub port: u16,
    /// Directory holding one credential file per tenant.
    pub sessions_dir: PathBuf,
    pub engine: EngineSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            sessions_dir: default_sessions_dir(),
            engine: EngineSettings::default(),
        }
    }
}

fn default_sessions_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("linkwatch").join("sessions"))
        .unwrap_or_else(|| PathBuf::from("./sessions"))
}

/// `~/.config/linkwatch/config.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("linkwatch").join("config.toml"))
}

impl AppConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid config TOML")
    }

    /// Read the config file. An explicit path must exist; the default path
    /// is optional and falls back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match default_config_path().filter(|p| p.exists()) {
                Some(p) => p,
                None => {
                    debug!("[config] No config file, using defaults");
                    return Ok(AppConfig::default());
                }
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!("[config] Loaded {}", path.display());
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in the
    /// binary and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("PORT") {
            self.port = v.parse().with_context(|| format!("PORT is not a valid port: {}", v))?;
        }
        if let Some(v) = get("BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = get("SESSIONS_DIR") {
            self.sessions_dir = PathBuf::from(v);
        }
        if let Some(v) = get("WEBHOOK_SECRET") {
            self.engine.webhook_secret = Some(v);
        }
        if let Some(v) = get("CALLBACK_SECRET") {
            self.engine.callback_secret = Some(v);
        }
        if let Some(v) = get("CONNECT_TIMEOUT_SECS") {
            self.engine.connect_timeout_secs = v
                .parse()
                .with_context(|| format!("CONNECT_TIMEOUT_SECS is not a number: {}", v))?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
