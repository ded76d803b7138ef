//! Error types for rollout

// This warning is a false positive from thiserror macro expansion
#![allow(unused_assignments)]

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for rollout operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for rollout
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[help]
        help: String,
    },

    /// The remote host rejected the credential
    #[error("Authentication failed: {message}")]
    Auth {
        message: String,
        #[help]
        help: String,
    },

    /// The remote host could not be reached
    #[error("Connection failed: {message}")]
    Connect {
        message: String,
        #[help]
        help: String,
    },

    /// A connect, handshake or command deadline elapsed
    #[error("Timed out: {message}")]
    Timeout {
        message: String,
        #[help]
        help: String,
    },

    /// The local release artifact does not exist
    #[error("Artifact not found: {path}")]
    #[diagnostic(help("Build the release artifact first (npm run build), then re-run rollout"))]
    ArtifactNotFound {
        /// Path that was checked
        path: Utf8PathBuf,
    },

    /// The artifact upload failed
    #[error("Transfer failed: {message}")]
    Transfer {
        message: String,
        #[help]
        help: String,
    },

    /// The session failed after it was established
    #[error("Remote channel error: {message}")]
    Channel {
        message: String,
        #[help]
        help: String,
    },

    /// A step flagged fatal-on-stderr produced error output
    #[error("Step '{step}' reported an error: {stderr}")]
    #[diagnostic(help(
        "The remote host was left in the state this step produced; inspect it before re-running"
    ))]
    StepFailed {
        /// Label of the failed step
        step: String,
        /// Captured error text
        stderr: String,
    },

    /// Local deploy record error
    #[error("Deploy record error: {message}")]
    Record {
        message: String,
        #[help]
        help: String,
    },
}

/// Failure category used for operator guidance and exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Credential rejected
    Authentication,
    /// Host unreachable
    Network,
    /// Deadline exceeded
    Timeout,
    /// Local artifact missing
    MissingArtifact,
    /// Artifact upload failed
    Transfer,
    /// Session broke mid-run
    Channel,
    /// Remote command reported a fatal error
    StepFailed,
    /// Invalid configuration
    Config,
    /// Anything else
    Unclassified,
}

impl ErrorCategory {
    /// Short human-readable name of the category
    pub fn label(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication failure",
            Self::Network => "network failure",
            Self::Timeout => "timeout",
            Self::MissingArtifact => "missing artifact",
            Self::Transfer => "transfer failure",
            Self::Channel => "remote channel failure",
            Self::StepFailed => "remote step failure",
            Self::Config => "configuration error",
            Self::Unclassified => "unexpected error",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a connection error
    pub fn connect(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create an artifact-not-found error
    pub fn artifact_not_found(path: impl Into<Utf8PathBuf>) -> Self {
        Self::ArtifactNotFound { path: path.into() }
    }

    /// Create a transfer error
    pub fn transfer(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a remote channel error
    pub fn channel(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a step failure
    pub fn step_failed(step: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a deploy record error
    pub fn record(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Record {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Classify this error for reporting and exit status
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth { .. } => ErrorCategory::Authentication,
            Self::Connect { .. } => ErrorCategory::Network,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::ArtifactNotFound { .. } => ErrorCategory::MissingArtifact,
            Self::Transfer { .. } => ErrorCategory::Transfer,
            Self::Channel { .. } => ErrorCategory::Channel,
            Self::StepFailed { .. } => ErrorCategory::StepFailed,
            Self::Config { .. } | Self::TomlParse(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Record { .. } => ErrorCategory::Unclassified,
        }
    }

    /// Remediation text, if the error carries one
    pub fn help_text(&self) -> Option<String> {
        self.help().map(|help| help.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_and_network_are_distinct() {
        let auth = Error::auth("password rejected", "check credential");
        let net = Error::connect("connection refused", "check host");

        assert_eq!(auth.category(), ErrorCategory::Authentication);
        assert_eq!(net.category(), ErrorCategory::Network);
        assert_ne!(auth.category(), net.category());
    }

    #[test]
    fn test_artifact_not_found_has_build_hint() {
        let err = Error::artifact_not_found("dist/release.tar.gz");

        assert_eq!(err.category(), ErrorCategory::MissingArtifact);
        assert!(err.to_string().contains("dist/release.tar.gz"));
        assert!(err.help_text().unwrap().contains("Build the release artifact"));
    }

    #[test]
    fn test_help_text_from_field() {
        let err = Error::timeout("handshake took longer than 30s", "Check the SSH port");
        assert_eq!(err.help_text().as_deref(), Some("Check the SSH port"));
    }

    #[test]
    fn test_io_is_unclassified() {
        let err: Error = std::io::Error::other("boom").into();
        assert_eq!(err.category(), ErrorCategory::Unclassified);
        assert!(err.help_text().is_none());
    }
}
