//! Process-wide configuration for Lotkeeper.
//!
//! Defaults live here; the daemon binary layers CLI arguments and
//! environment variables on top via `clap`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Complete Lotkeeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections take their
    /// defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::Config(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Daemon networking and storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the gateway protocol listener.
    pub gateway_port: u16,
    /// Bind address for the full-scan listener.
    pub scan_port: u16,
    pub database_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            gateway_port: 9410,
            scan_port: 9411,
            database_path: None,
            log_level: "info".to_string(),
        }
    }
}

/// Camera verification behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Seconds to wait for a gateway reply before falling back.
    pub request_timeout_secs: u64,
    /// Seconds between heartbeat probes to connected gateways.
    pub heartbeat_interval_secs: u64,
    /// Master switch; when off, every verification goes straight to the
    /// fallback path.
    pub camera_verification_enabled: bool,
    /// Webhook endpoint for push notification dispatch, if any.
    pub notify_webhook: Option<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            camera_verification_enabled: true,
            notify_webhook: None,
        }
    }
}
