//! Remote command and file transfer channels
//!
//! This module provides:
//! - [`Connector`]: opens one authenticated session to a [`DeploymentTarget`]
//! - [`RemoteChannel`]: runs commands and uploads files over that session
//! - [`ssh`]: the SSH implementation backed by libssh2
//! - [`transfer`]: artifact pre-flight checks and upload

pub mod ssh;
pub mod transfer;

use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;

use crate::Result;

/// Case-insensitive marker that makes stderr text informational
pub const ADVISORY_MARKER: &str = "warn";

/// SSH credential
#[derive(Clone)]
pub enum Credential {
    /// Password authentication
    Password(String),
    /// Public key authentication from a private key file
    KeyFile {
        path: Utf8PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(****)"),
            Self::KeyFile { path, .. } => f.debug_struct("KeyFile").field("path", path).finish(),
        }
    }
}

/// Host a run deploys to. Never mutated during a run.
#[derive(Debug, Clone)]
pub struct DeploymentTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    /// TCP connect deadline
    pub connect_timeout: Duration,
    /// Handshake and authentication deadline
    pub auth_timeout: Duration,
}

impl DeploymentTarget {
    /// `user@host:port`, for log lines
    pub fn display_address(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// How long to wait for a dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Typical duration of the command
    pub expected: Duration,
    /// Completion deadline; exceeding it is a timeout
    pub deadline: Duration,
}

impl WaitPolicy {
    /// Whether a command that ran for `elapsed` took longer than usual
    pub fn overran(&self, elapsed: Duration) -> bool {
        elapsed > self.expected
    }
}

/// Captured output of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepResult {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// Exit status reported by the server, if any. Recorded, never judged.
    pub exit_status: Option<i32>,
}

/// Classification of captured stderr text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrKind {
    /// Nothing but whitespace
    Empty,
    /// Contains the advisory marker
    Advisory,
    /// Anything else
    Error,
}

/// Classify stderr text against [`ADVISORY_MARKER`]
pub fn classify_stderr(stderr: &str) -> StderrKind {
    if stderr.trim().is_empty() {
        StderrKind::Empty
    } else if stderr.to_lowercase().contains(ADVISORY_MARKER) {
        StderrKind::Advisory
    } else {
        StderrKind::Error
    }
}

impl StepResult {
    /// Classification of this result's stderr
    pub fn stderr_kind(&self) -> StderrKind {
        classify_stderr(&self.stderr)
    }
}

/// An open, authenticated session to one host
pub trait RemoteChannel {
    /// Run a shell command in a pseudo-terminal and wait for it to finish.
    ///
    /// Only connection-level failures are errors; the remote exit status is
    /// returned in the result, not judged.
    fn execute(&mut self, command: &str, wait: WaitPolicy) -> Result<StepResult>;

    /// Stream a local file to `remote_path`, returning the bytes written
    fn upload(&mut self, local_path: &Utf8Path, remote_path: &str) -> Result<u64>;

    /// Release the session
    fn close(&mut self) -> Result<()>;
}

/// Opens sessions to deployment targets
pub trait Connector {
    type Channel: RemoteChannel;

    /// Connect and authenticate
    fn open(&self, target: &DeploymentTarget) -> Result<Self::Channel>;
}
