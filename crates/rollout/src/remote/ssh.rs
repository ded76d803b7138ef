//! SSH session backed by libssh2
//!
//! Host keys are not pinned: the server's SHA-256 fingerprint is logged on
//! every connect so operators can verify it out of band.

use camino::Utf8Path;
use ssh2::{DisconnectCode, ErrorCode, HashType, Session};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use super::{Connector, Credential, DeploymentTarget, RemoteChannel, StepResult, WaitPolicy};
use crate::{Error, Result};

// libssh2 error codes (see libssh2.h)
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_PASSWORD_EXPIRED: i32 = -15;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

const PTY_TERM: &str = "xterm";
const PTY_SIZE: (u32, u32, u32, u32) = (200, 50, 0, 0);

/// Opens [`SshSession`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    type Channel = SshSession;

    fn open(&self, target: &DeploymentTarget) -> Result<SshSession> {
        SshSession::open(target)
    }
}

/// One authenticated SSH session
pub struct SshSession {
    session: Session,
    address: String,
}

impl SshSession {
    /// Connect, handshake and authenticate
    pub fn open(target: &DeploymentTarget) -> Result<Self> {
        let address = target.display_address();
        let tcp = connect_tcp(target)?;

        let mut session = Session::new().map_err(|e| {
            Error::connect(
                format!("Failed to create SSH session: {}", e),
                "libssh2 could not be initialised on this machine",
            )
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_ms(target.auth_timeout));

        session.handshake().map_err(|e| {
            if is_timeout(&e) {
                Error::timeout(
                    format!(
                        "SSH handshake with {} exceeded {}s",
                        address,
                        target.auth_timeout.as_secs()
                    ),
                    "Check that an SSH server is listening on the configured port",
                )
            } else {
                Error::connect(
                    format!("SSH handshake with {} failed: {}", address, e),
                    "Check that an SSH server is listening on the configured port",
                )
            }
        })?;

        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            tracing::info!(host = %target.host, fingerprint = %hex(hash), "Accepted host key");
        }

        authenticate(&session, target)?;

        if !session.authenticated() {
            return Err(Error::auth(
                format!("{} did not accept the credential", address),
                "Check the SSH user and credential",
            ));
        }

        tracing::info!("SSH session established with {}", address);
        Ok(Self { session, address })
    }
}

impl RemoteChannel for SshSession {
    fn execute(&mut self, command: &str, wait: WaitPolicy) -> Result<StepResult> {
        let started = Instant::now();
        self.session.set_timeout(timeout_ms(wait.deadline));

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| command_error(&self.address, "open a channel", e, wait))?;
        channel
            .request_pty(PTY_TERM, None, Some(PTY_SIZE))
            .map_err(|e| command_error(&self.address, "allocate a pty", e, wait))?;
        channel
            .exec(command)
            .map_err(|e| command_error(&self.address, "dispatch the command", e, wait))?;

        let session = &self.session;
        let arm = |left: Duration| session.set_timeout(timeout_ms(left));
        let stdout = read_until_eof(&mut channel, started, wait.deadline, arm)
            .map_err(|e| read_error(&self.address, e, wait))?;
        let stderr = read_until_eof(&mut channel.stderr(), started, wait.deadline, arm)
            .map_err(|e| read_error(&self.address, e, wait))?;

        let left = remaining(started, wait.deadline)
            .ok_or_else(|| deadline_error(&self.address, wait))?;
        arm(left);
        channel
            .wait_close()
            .map_err(|e| command_error(&self.address, "await completion", e, wait))?;
        let exit_status = channel.exit_status().ok();
        let elapsed = started.elapsed();

        if wait.overran(elapsed) {
            tracing::info!(
                expected_secs = wait.expected.as_secs(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Command took longer than expected"
            );
        }
        tracing::debug!(
            exit_status = ?exit_status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Command finished"
        );

        Ok(StepResult {
            stdout,
            stderr,
            elapsed,
            exit_status,
        })
    }

    fn upload(&mut self, local_path: &Utf8Path, remote_path: &str) -> Result<u64> {
        let mut local = std::fs::File::open(local_path).map_err(|e| {
            Error::transfer(
                format!("Failed to open {}: {}", local_path, e),
                "Check the artifact file permissions",
            )
        })?;

        // Uploads are atomic-or-failed with no deadline
        self.session.set_timeout(0);

        let sftp = self.session.sftp().map_err(|e| {
            Error::transfer(
                format!("Failed to start SFTP on {}: {}", self.address, e),
                "Check that the SFTP subsystem is enabled on the server",
            )
        })?;
        let mut remote = sftp.create(Path::new(remote_path)).map_err(|e| {
            Error::transfer(
                format!("Failed to create {} on {}: {}", remote_path, self.address, e),
                "Check that the staging directory exists and is writable",
            )
        })?;

        let bytes = std::io::copy(&mut local, &mut remote).map_err(|e| {
            Error::transfer(
                format!("Upload to {} failed: {}", remote_path, e),
                "Re-run the deployment; partial uploads are overwritten",
            )
        })?;
        drop(remote);

        Ok(bytes)
    }

    fn close(&mut self) -> Result<()> {
        self.session
            .disconnect(
                Some(DisconnectCode::ByApplication),
                "deployment finished",
                None,
            )
            .map_err(|e| {
                Error::channel(
                    format!("Failed to close session with {}: {}", self.address, e),
                    "The session is dropped regardless",
                )
            })?;
        tracing::debug!("SSH session with {} closed", self.address);
        Ok(())
    }
}

fn connect_tcp(target: &DeploymentTarget) -> Result<TcpStream> {
    let addrs = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| {
            Error::connect(
                format!("Failed to resolve {}: {}", target.host, e),
                "Check [target] host in rollout.toml",
            )
        })?;

    let mut last_error = None;
    for addr in addrs {
        tracing::debug!(%addr, "Connecting");
        match TcpStream::connect_timeout(&addr, target.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) if e.kind() == std::io::ErrorKind::TimedOut => Error::timeout(
            format!(
                "Connecting to {}:{} exceeded {}s",
                target.host,
                target.port,
                target.connect_timeout.as_secs()
            ),
            "Check that the host is up and the port is not filtered",
        ),
        Some(e) => Error::connect(
            format!("Failed to connect to {}:{}: {}", target.host, target.port, e),
            "Check that the host is reachable and the SSH port is open",
        ),
        None => Error::connect(
            format!("{} resolved to no addresses", target.host),
            "Check [target] host in rollout.toml",
        ),
    })
}

fn authenticate(session: &Session, target: &DeploymentTarget) -> Result<()> {
    let result = match &target.credential {
        Credential::Password(password) => session.userauth_password(&target.username, password),
        Credential::KeyFile { path, passphrase } => session.userauth_pubkey_file(
            &target.username,
            None,
            path.as_std_path(),
            passphrase.as_deref(),
        ),
    };

    result.map_err(|e| auth_error(session_code(&e), e.message(), target))
}

/// Classify a failed authentication by its libssh2 error code
fn auth_error(code: Option<i32>, detail: &str, target: &DeploymentTarget) -> Error {
    let address = target.display_address();
    match code {
        Some(LIBSSH2_ERROR_TIMEOUT) => Error::timeout(
            format!(
                "Authentication with {} exceeded {}s",
                address,
                target.auth_timeout.as_secs()
            ),
            "Check the server's load and [target] auth_timeout_secs",
        ),
        Some(LIBSSH2_ERROR_FILE) => Error::auth(
            format!("Could not read the private key for {}: {}", address, detail),
            "Check [target] key_file and ROLLOUT_SSH_PASSPHRASE",
        ),
        Some(
            LIBSSH2_ERROR_AUTHENTICATION_FAILED
            | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
            | LIBSSH2_ERROR_PASSWORD_EXPIRED,
        ) => Error::auth(
            format!("{} rejected the credential: {}", address, detail),
            "Check the SSH user and ROLLOUT_SSH_PASSWORD (or key_file)",
        ),
        _ => Error::connect(
            format!("Connection to {} failed during authentication: {}", address, detail),
            "Check network stability between this machine and the host",
        ),
    }
}

/// Read a stream to EOF, failing once `deadline` has elapsed since `started`.
///
/// `arm` is called with the time left before every read so a single blocking
/// read cannot outlive the deadline.
fn read_until_eof(
    reader: &mut impl Read,
    started: Instant,
    deadline: Duration,
    mut arm: impl FnMut(Duration),
) -> std::io::Result<String> {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let left = remaining(started, deadline).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "command did not complete before its deadline",
            )
        })?;
        arm(left);

        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&chunk[..n]);
    }

    Ok(String::from_utf8_lossy(&captured).into_owned())
}

/// Time left before `deadline`, or `None` once it has passed
fn remaining(started: Instant, deadline: Duration) -> Option<Duration> {
    deadline
        .checked_sub(started.elapsed())
        .filter(|left| !left.is_zero())
}

fn command_error(address: &str, action: &str, e: ssh2::Error, wait: WaitPolicy) -> Error {
    if is_timeout(&e) {
        deadline_error(address, wait)
    } else {
        Error::channel(
            format!("Failed to {} on {}: {}", action, address, e),
            "The SSH session was lost; re-run the deployment",
        )
    }
}

fn read_error(address: &str, e: std::io::Error, wait: WaitPolicy) -> Error {
    if e.kind() == std::io::ErrorKind::TimedOut {
        deadline_error(address, wait)
    } else {
        Error::channel(
            format!("Failed to read command output from {}: {}", address, e),
            "The SSH session was lost; re-run the deployment",
        )
    }
}

fn deadline_error(address: &str, wait: WaitPolicy) -> Error {
    Error::timeout(
        format!(
            "Command on {} did not finish within {}s",
            address,
            wait.deadline.as_secs()
        ),
        "Raise [timing] wait_multiplier if the host is slow",
    )
}

fn session_code(e: &ssh2::Error) -> Option<i32> {
    match e.code() {
        ErrorCode::Session(code) => Some(code),
        _ => None,
    }
}

fn is_timeout(e: &ssh2::Error) -> bool {
    session_code(e) == Some(LIBSSH2_ERROR_TIMEOUT)
}

/// libssh2 treats 0 as "no timeout"
fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::io::Cursor;

    #[test]
    fn test_read_until_eof_collects_lossy_utf8() {
        let mut reader = Cursor::new(b"pm2 saved\n\xff".to_vec());
        let text =
            read_until_eof(&mut reader, Instant::now(), Duration::from_secs(5), |_| {}).unwrap();
        assert!(text.starts_with("pm2 saved\n"));
    }

    #[test]
    fn test_read_until_eof_respects_deadline() {
        let mut reader = Cursor::new(vec![b'x'; 16]);
        let started = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        let err =
            read_until_eof(&mut reader, started, Duration::from_millis(1), |_| {}).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_read_until_eof_arms_remaining_time() {
        // Two reads: the data, then EOF
        let mut reader = Cursor::new(b"saved".to_vec());
        let mut armed = Vec::new();

        read_until_eof(&mut reader, Instant::now(), Duration::from_secs(60), |left| {
            armed.push(left)
        })
        .unwrap();

        assert_eq!(armed.len(), 2);
        assert!(armed.iter().all(|left| *left <= Duration::from_secs(60)));
        assert!(armed[1] <= armed[0]);
    }

    fn target(port: u16) -> DeploymentTarget {
        DeploymentTarget {
            host: "127.0.0.1".to_string(),
            port,
            username: "root".to_string(),
            credential: Credential::Password("pw".to_string()),
            connect_timeout: Duration::from_secs(2),
            auth_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_open_refused_port_is_network_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = SshSession::open(&target(port)).err().unwrap();
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_open_silent_server_times_out() {
        // Connections complete in the backlog but no banner is ever sent
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let started = Instant::now();
        let err = SshSession::open(&target(port)).err().unwrap();

        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(listener);
    }

    #[test]
    fn test_auth_error_classification() {
        let target = target(22);
        let category = |code| auth_error(code, "detail", &target).category();

        assert_eq!(
            category(Some(LIBSSH2_ERROR_AUTHENTICATION_FAILED)),
            ErrorCategory::Authentication
        );
        assert_eq!(
            category(Some(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED)),
            ErrorCategory::Authentication
        );
        assert_eq!(
            category(Some(LIBSSH2_ERROR_PASSWORD_EXPIRED)),
            ErrorCategory::Authentication
        );
        assert_eq!(category(Some(LIBSSH2_ERROR_FILE)), ErrorCategory::Authentication);
        assert_eq!(category(Some(LIBSSH2_ERROR_TIMEOUT)), ErrorCategory::Timeout);
        assert_eq!(category(Some(-7)), ErrorCategory::Network);
        assert_eq!(category(None), ErrorCategory::Network);
    }

    #[test]
    fn test_remaining() {
        let started = Instant::now();
        assert!(remaining(started, Duration::from_secs(60)).is_some());
        assert!(remaining(started, Duration::ZERO).is_none());
    }

    #[test]
    fn test_timeout_ms_never_disables_deadline() {
        assert_eq!(timeout_ms(Duration::ZERO), 1);
        assert_eq!(timeout_ms(Duration::from_secs(30)), 30_000);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn test_read_error_maps_timeouts() {
        let wait = WaitPolicy {
            expected: Duration::from_secs(2),
            deadline: Duration::from_secs(60),
        };
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone");

        assert!(matches!(
            read_error("root@host:22", timeout, wait),
            Error::Timeout { .. }
        ));
        assert!(matches!(
            read_error("root@host:22", reset, wait),
            Error::Channel { .. }
        ));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
