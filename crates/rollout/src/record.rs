//! Local deploy record
//!
//! Each run that reached the remote host leaves a `last_deploy.json` under
//! `.rollout/deploy/<host>/` describing what was attempted and how it ended.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::DeploymentOutcome;
use crate::{Error, Result};

/// Directory holding rollout's local state
pub const STATE_DIR: &str = ".rollout";

/// Summary of the last deployment to a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    /// When the run finished
    pub timestamp: DateTime<Utc>,
    /// Target host
    pub host: String,
    /// Artifact that was deployed
    pub artifact: Utf8PathBuf,
    /// Steps dispatched before the run ended
    pub steps_executed: usize,
    pub success: bool,
    /// Final message of the run
    pub message: String,
}

impl DeployRecord {
    /// Create a record for a finished run
    pub fn new(host: &str, artifact: &Utf8Path, outcome: &DeploymentOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            host: host.to_string(),
            artifact: artifact.to_owned(),
            steps_executed: outcome.steps_executed,
            success: outcome.success,
            message: outcome.message.clone(),
        }
    }

    /// Record location for `host` below `base_dir`
    pub fn path_for(base_dir: &Utf8Path, host: &str) -> Utf8PathBuf {
        base_dir
            .join(STATE_DIR)
            .join("deploy")
            .join(sanitize_host(host))
            .join("last_deploy.json")
    }

    /// Load a record from a file
    pub fn load(path: &Utf8Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)?;
        let record: Self = serde_json::from_str(&content).map_err(|e| {
            Error::record(
                format!("Failed to parse deploy record: {}", e),
                "The deploy record may be corrupted. Try deleting it.",
            )
        })?;

        Ok(Some(record))
    }

    /// Save the record to a file
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::record(
                format!("Failed to serialize deploy record: {}", e),
                "This is likely a bug in rollout",
            )
        })?;

        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Keep host names usable as a single path component
fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_deploy_record_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let base = Utf8Path::from_path(temp_dir.path()).unwrap();
        let path = DeployRecord::path_for(base, "203.0.113.7");

        let outcome = DeploymentOutcome::succeeded(12, "http://203.0.113.7:5000/");
        let record =
            DeployRecord::new("203.0.113.7", Utf8Path::new("helix-deploy.tar.gz"), &outcome);
        record.save(&path).unwrap();

        let loaded = DeployRecord::load(&path).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(path.ends_with(".rollout/deploy/203.0.113.7/last_deploy.json"));
    }

    #[test]
    fn test_deploy_record_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = Utf8Path::from_path(temp_dir.path())
            .unwrap()
            .join("nonexistent.json");

        assert!(DeployRecord::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_deploy_record_failed_outcome() {
        let outcome = DeploymentOutcome::failed(&Error::connect("refused", "check host"), 0);
        let record = DeployRecord::new("[2001:db8::1]", Utf8Path::new("a.tar.gz"), &outcome);

        assert!(!record.success);
        assert!(record.message.contains("refused"));
        assert_eq!(sanitize_host("[2001:db8::1]"), "_2001_db8__1_");
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = Utf8Path::from_path(temp_dir.path())
            .unwrap()
            .join("last_deploy.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            DeployRecord::load(&path),
            Err(Error::Record { .. })
        ));
    }
}
