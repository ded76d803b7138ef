//! Remote `.env` payload
//!
//! The payload is opaque `KEY=value` text. Values are never parsed or
//! validated; secret values are only masked when the payload is rendered
//! for logs.

use crate::config::{Config, Secrets, ENV_DATABASE_URL};
use crate::{Error, Result};

const HEREDOC_DELIMITER: &str = "EOFENV";
const REDACTED: &str = "****";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    key: String,
    value: String,
    secret: bool,
}

/// Ordered `KEY=value` lines written verbatim to the remote host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentPayload {
    entries: Vec<Entry>,
}

impl EnvironmentPayload {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the payload for a deployment: `DATABASE_URL`, `PORT`,
    /// `NODE_ENV`, then `[environment.vars]` in document order
    pub fn from_config(config: &Config, secrets: &Secrets) -> Result<Self> {
        let database_url = secrets.database_url.as_deref().ok_or_else(|| {
            Error::config(
                "No database connection string available",
                format!("Export {} before deploying", ENV_DATABASE_URL),
            )
        })?;

        let mut payload = Self::new();
        payload.set_secret("DATABASE_URL", database_url);
        payload.set("PORT", config.service.port.to_string());
        payload.set("NODE_ENV", &config.service.env_tag);
        for (key, value) in &config.environment.vars {
            payload.set(key, value);
        }
        Ok(payload)
    }

    /// Set a plain value, replacing an existing key in place
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.upsert(key.into(), value.into(), false);
    }

    /// Set a value that must never appear in logs
    pub fn set_secret(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.upsert(key.into(), value.into(), true);
    }

    fn upsert(&mut self, key: String, value: String, secret: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.value = value;
            entry.secret |= secret;
        } else {
            self.entries.push(Entry { key, value, secret });
        }
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the payload has no lines
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// File contents, one `KEY=value` per line
    pub fn render(&self) -> String {
        self.render_with(|entry| entry.value.as_str())
    }

    /// File contents with secret values masked
    pub fn render_redacted(&self) -> String {
        self.render_with(|entry| {
            if entry.secret {
                REDACTED
            } else {
                entry.value.as_str()
            }
        })
    }

    fn render_with<'a>(&'a self, value: impl Fn(&'a Entry) -> &'a str) -> String {
        self.entries
            .iter()
            .map(|entry| format!("{}={}", entry.key, value(entry)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Shell command that overwrites `quoted_path` with the payload, and the
    /// same command with secrets masked
    pub fn write_command(&self, quoted_path: &str) -> (String, String) {
        let delimiter = self.delimiter();
        let command = format!(
            "cat > {} << '{}'\n{}\n{}",
            quoted_path,
            delimiter,
            self.render(),
            delimiter
        );
        let display = format!(
            "cat > {} << '{}'\n{}\n{}",
            quoted_path,
            delimiter,
            self.render_redacted(),
            delimiter
        );
        (command, display)
    }

    /// A heredoc delimiter that no payload line collides with
    fn delimiter(&self) -> String {
        let body = self.render();
        let collides = |candidate: &str| body.lines().any(|line| line == candidate);

        let mut delimiter = HEREDOC_DELIMITER.to_string();
        let mut n = 1;
        while collides(&delimiter) {
            delimiter = format!("{}_{}", HEREDOC_DELIMITER, n);
            n += 1;
        }
        delimiter
    }
}
