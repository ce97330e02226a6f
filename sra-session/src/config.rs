//! Client configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `sra.yaml` but can be specified via the `-f` flag or the `SRA_CONFIG` environment
//! variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `sra.yaml`)
//! 2. **Environment variables** - Variables prefixed with `SRA_` override YAML values
//!
//! For nested values use double underscores, e.g. `SRA_GATEWAY__BASE_URL=https://sra.internal`
//! sets `gateway.base_url`.
//!
//! ## Configuration Structure
//!
//! - **Gateway**: `gateway.base_url`, `gateway.request_timeout`, endpoint paths
//! - **Session**: `session.refresh_interval`, `session.expiry_warning_after`,
//!   `session.expiry_after`, `session.sign_in_route`
//! - **Storage**: `storage.backend`, `storage.namespace`, `storage.obfuscation_key`
//!
//! ```yaml
//! gateway:
//!   base_url: https://sra.example.com
//!   request_timeout: 15s
//! session:
//!   refresh_interval: 20m
//!   expiry_warning_after: 25m
//!   expiry_after: 30m
//! storage:
//!   backend:
//!     type: file
//!     path: ~/.local/state/sra/session.json
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// CLI args for the session client binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SRA_CONFIG", default_value = "sra.yaml")]
    pub config: String,

    /// Validate configuration and exit.
    #[arg(long)]
    pub validate: bool,

    /// Sign in as this user if no session is restored
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password for `--username`
    #[arg(long, env = "SRA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Second-factor code, if the account requires one
    #[arg(long)]
    pub mfa_code: Option<String>,

    /// End the current session and exit
    #[arg(long)]
    pub logout: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Remote authentication service
    pub gateway: GatewayConfig,
    /// Session lifetime and renewal timers
    pub session: SessionConfig,
    /// Local persistence of identity and credentials
    pub storage: StorageConfig,
}

/// Where the remote authentication service lives and how long to wait for it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub base_url: Url,
    /// Upper bound on any single gateway or intercepted request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub login_path: String,
    pub logout_path: String,
    pub validate_path: String,
    pub refresh_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".parse().expect("Failed to parse default gateway URL"),
            request_timeout: Duration::from_secs(30),
            login_path: "/api/auth/login".to_string(),
            logout_path: "/api/auth/logout".to_string(),
            validate_path: "/api/auth/validate".to_string(),
            refresh_path: "/api/auth/refresh".to_string(),
        }
    }
}

/// Timer policy for an authenticated session.
///
/// The warning and expiry clocks start at sign-in (or restore) and model a maximum
/// session lifetime. The refresh clock restarts after every successful refresh.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub expiry_warning_after: Duration,
    #[serde(with = "humantime_serde")]
    pub expiry_after: Duration,
    /// Route the UI is sent to when a session ends involuntarily
    pub sign_in_route: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(20 * 60),
            expiry_warning_after: Duration::from_secs(25 * 60),
            expiry_after: Duration::from_secs(30 * 60),
            sign_in_route: "/login".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackendConfig,
    /// Prefix applied to every stored key
    pub namespace: String,
    /// Key for the obfuscation transform. Not a secret: it only deters casual inspection.
    pub obfuscation_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendConfig::Memory,
            namespace: "sra_".to_string(),
            obfuscation_key: "sra-dashboard".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageBackendConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("SRA_").ignore(&["CONFIG", "PASSWORD"]).split("__"))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let session = &self.session;
        if session.refresh_interval.is_zero() {
            return Err(Error::Internal {
                operation: "validate config: session.refresh_interval must be greater than zero".to_string(),
            });
        }
        if session.expiry_after.is_zero() {
            return Err(Error::Internal {
                operation: "validate config: session.expiry_after must be greater than zero".to_string(),
            });
        }
        if session.expiry_warning_after >= session.expiry_after {
            return Err(Error::Internal {
                operation: format!(
                    "validate config: session.expiry_warning_after ({}) must be before session.expiry_after ({})",
                    humantime::format_duration(session.expiry_warning_after),
                    humantime::format_duration(session.expiry_after)
                ),
            });
        }
        if self.storage.namespace.is_empty() {
            return Err(Error::Internal {
                operation: "validate config: storage.namespace must not be empty".to_string(),
            });
        }
        if self.gateway.request_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "validate config: gateway.request_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
