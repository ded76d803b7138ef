//! Configuration file parsing and merging
//!
//! This module handles parsing of `rollout.toml` and `rollout.local.toml`
//! files. Secrets are never read from these files; they are injected from
//! the process environment at run time (see [`Secrets`]).

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::remote::{Credential, DeploymentTarget};
use crate::{Error, Result};

/// Environment variable holding the SSH password
pub const ENV_SSH_PASSWORD: &str = "ROLLOUT_SSH_PASSWORD";
/// Environment variable holding the private key passphrase
pub const ENV_SSH_PASSPHRASE: &str = "ROLLOUT_SSH_PASSPHRASE";
/// Environment variable holding the database connection string
pub const ENV_DATABASE_URL: &str = "ROLLOUT_DATABASE_URL";

/// Main configuration structure for rollout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote host settings
    pub target: TargetConfig,

    /// Local artifact settings
    pub artifact: ArtifactConfig,

    /// Deployed service settings
    pub service: ServiceConfig,

    /// Extra lines for the remote `.env` file
    pub environment: EnvironmentConfig,

    /// Command deadlines and delays
    pub timing: TimingConfig,
}

/// Remote host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Host name or address
    pub host: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Login user (default: "root")
    pub username: String,

    /// Private key file; password authentication is used when unset
    pub key_file: Option<Utf8PathBuf>,

    /// TCP connect deadline in seconds (default: 30)
    pub connect_timeout_secs: u64,

    /// SSH handshake and authentication deadline in seconds (default: 30)
    pub auth_timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "root".to_string(),
            key_file: None,
            connect_timeout_secs: 30,
            auth_timeout_secs: 30,
        }
    }
}

/// Release artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Locally built archive (default: "helix-deploy.tar.gz")
    pub local_path: Utf8PathBuf,

    /// Upload location on the remote host (default: "/tmp/helix-deploy.tar.gz")
    pub staging_path: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            local_path: Utf8PathBuf::from("helix-deploy.tar.gz"),
            staging_path: "/tmp/helix-deploy.tar.gz".to_string(),
        }
    }
}

/// Deployed service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Process manager name of the service (default: "helix")
    pub name: String,

    /// Deployment directory on the remote host (default: "/opt/helix")
    pub remote_dir: String,

    /// Script started by the process manager (default: "dist/index.js")
    pub entrypoint: String,

    /// Port the service listens on (default: 5000)
    pub port: u16,

    /// Environment tag passed to the process manager (default: "production")
    pub env_tag: String,

    /// Health endpoint path (default: "/health")
    pub health_path: String,

    /// Import trigger endpoint path (default: "/api/source-import/trigger")
    pub trigger_path: String,

    /// Number of log lines shown after start (default: 15)
    pub log_lines: u32,

    /// Public host used in the dashboard address (default: target host)
    pub dashboard_host: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "helix".to_string(),
            remote_dir: "/opt/helix".to_string(),
            entrypoint: "dist/index.js".to_string(),
            port: 5000,
            env_tag: "production".to_string(),
            health_path: "/health".to_string(),
            trigger_path: "/api/source-import/trigger".to_string(),
            log_lines: 15,
            dashboard_host: None,
        }
    }
}

/// Extra environment lines, written in document order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub vars: IndexMap<String, String>,
}

/// Timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Completion deadline as a multiple of a step's expected wait (default: 10)
    pub wait_multiplier: u32,

    /// Lower bound for any command deadline in seconds (default: 60)
    pub min_command_timeout_secs: u64,

    /// Delay before firing the import trigger in seconds (default: 3)
    pub trigger_settle_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            wait_multiplier: 10,
            min_command_timeout_secs: 60,
            trigger_settle_secs: 3,
        }
    }
}

impl TimingConfig {
    /// Completion deadline for a command expected to take `expected`
    pub fn deadline_for(&self, expected: Duration) -> Duration {
        let scaled = expected.saturating_mul(self.wait_multiplier.max(1));
        scaled.max(Duration::from_secs(self.min_command_timeout_secs))
    }

    /// Settle delay before the trigger step
    pub fn trigger_settle(&self) -> Duration {
        Duration::from_secs(self.trigger_settle_secs)
    }
}

/// Secrets injected at run time
#[derive(Clone, Default)]
pub struct Secrets {
    /// SSH password
    pub ssh_password: Option<String>,
    /// Passphrase for `target.key_file`
    pub ssh_passphrase: Option<String>,
    /// Database connection string written to the remote `.env`
    pub database_url: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |value: &Option<String>| value.as_ref().map(|_| "****");
        f.debug_struct("Secrets")
            .field("ssh_password", &mask(&self.ssh_password))
            .field("ssh_passphrase", &mask(&self.ssh_passphrase))
            .field("database_url", &mask(&self.database_url))
            .finish()
    }
}

impl Secrets {
    /// Read secrets from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read secrets through an arbitrary lookup (for testing)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            ssh_password: non_empty(ENV_SSH_PASSWORD),
            ssh_passphrase: non_empty(ENV_SSH_PASSPHRASE),
            database_url: non_empty(ENV_DATABASE_URL),
        }
    }
}

impl Config {
    /// Load configuration from a directory.
    ///
    /// This loads `rollout.toml` and optionally merges `rollout.local.toml` if it exists.
    pub fn load(config_dir: &Utf8Path) -> Result<Self> {
        let config_path = config_dir.join("rollout.toml");
        let local_config_path = config_dir.join("rollout.local.toml");

        let base_config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str::<toml::Value>(&content)?
        } else {
            toml::Value::Table(toml::map::Map::new())
        };

        let local_config = if local_config_path.exists() {
            let content = std::fs::read_to_string(&local_config_path)?;
            Some(toml::from_str::<toml::Value>(&content)?)
        } else {
            None
        };

        let merged = if let Some(local) = local_config {
            merge_toml_values(base_config, local)
        } else {
            base_config
        };

        let config: Config = merged.try_into()?;

        tracing::debug!(
            base = %config_path,
            local = %local_config_path,
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Load configuration from a string (for testing)
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Check the configuration before any network activity
    pub fn validate(&self, secrets: &Secrets) -> Result<()> {
        if self.target.host.trim().is_empty() {
            return Err(Error::config(
                "No target host configured",
                "Set [target] host in rollout.toml",
            ));
        }

        if self.target.port == 0 {
            return Err(Error::config(
                "Target port must be non-zero",
                "Set [target] port in rollout.toml (usually 22)",
            ));
        }

        if self.target.username.trim().is_empty() {
            return Err(Error::config(
                "No login user configured",
                "Set [target] username in rollout.toml",
            ));
        }

        // The recipe runs `rm -rf` inside this directory
        let remote_dir = self.service.remote_dir.trim_end_matches('/');
        if !remote_dir.starts_with('/') || remote_dir.is_empty() {
            return Err(Error::config(
                format!(
                    "Remote directory '{}' must be an absolute path below /",
                    self.service.remote_dir
                ),
                "Set [service] remote_dir to a dedicated directory such as /opt/helix",
            ));
        }

        if !is_process_name(&self.service.name) {
            return Err(Error::config(
                format!("Invalid service name '{}'", self.service.name),
                "Use only letters, digits, '-', '_' and '.' in [service] name",
            ));
        }

        if self.target.key_file.is_none() && secrets.ssh_password.is_none() {
            return Err(Error::config(
                "No SSH credential available",
                format!(
                    "Export {} or set [target] key_file in rollout.toml",
                    ENV_SSH_PASSWORD
                ),
            ));
        }

        if secrets.database_url.is_none() {
            return Err(Error::config(
                "No database connection string available",
                format!("Export {} before deploying", ENV_DATABASE_URL),
            ));
        }

        Ok(())
    }

    /// Build the immutable deployment target
    pub fn deployment_target(&self, secrets: &Secrets) -> Result<DeploymentTarget> {
        let credential = match (&self.target.key_file, &secrets.ssh_password) {
            (Some(key_file), _) => Credential::KeyFile {
                path: key_file.clone(),
                passphrase: secrets.ssh_passphrase.clone(),
            },
            (None, Some(password)) => Credential::Password(password.clone()),
            (None, None) => {
                return Err(Error::config(
                    "No SSH credential available",
                    format!(
                        "Export {} or set [target] key_file in rollout.toml",
                        ENV_SSH_PASSWORD
                    ),
                ));
            }
        };

        Ok(DeploymentTarget {
            host: self.target.host.clone(),
            port: self.target.port,
            username: self.target.username.clone(),
            credential,
            connect_timeout: Duration::from_secs(self.target.connect_timeout_secs),
            auth_timeout: Duration::from_secs(self.target.auth_timeout_secs),
        })
    }

    /// Address shown in the success banner
    pub fn dashboard_url(&self) -> String {
        let host = self
            .service
            .dashboard_host
            .as_deref()
            .unwrap_or(&self.target.host);
        format!("http://{}:{}/", host, self.service.port)
    }
}

fn is_process_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Merge two TOML values:
/// - Tables: recursively merged
/// - Arrays: local replaces base (not merged)
/// - Primitives: local overrides base
fn merge_toml_values(base: toml::Value, local: toml::Value) -> toml::Value {
    match (base, local) {
        (toml::Value::Table(mut base_table), toml::Value::Table(local_table)) => {
            for (key, local_value) in local_table {
                if let Some(base_value) = base_table.remove(&key) {
                    base_table.insert(key, merge_toml_values(base_value, local_value));
                } else {
                    base_table.insert(key, local_value);
                }
            }
            toml::Value::Table(base_table)
        }
        (_, local) => local,
    }
}
