//! Remote listener clearing
//!
//! A crashed or half-closed session can leave its listener bound on the
//! remote side, which makes any relaunch fail. The reaper connects to the
//! remote endpoint and kills whatever occupies the guarded ports before the
//! launcher runs. Clearing is best-effort: ports that cannot be freed are
//! recorded, not fatal.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::spec::TunnelSpec;

/// Exit status the ssh client uses for connection/authentication failure
const SSH_CONNECTION_FAILED: i32 = 255;

/// Reaper errors
#[derive(Debug, Error)]
pub enum ReapError {
    #[error("remote {destination} unreachable: {reason}")]
    Unreachable { destination: String, reason: String },

    /// Some but not all guarded ports were freed; launch is still attempted
    #[error("remote ports not cleared: {ports:?}")]
    PartialClear { ports: Vec<u16> },
}

/// Clears stale listeners from the tunnel's remote ports
#[async_trait]
pub trait RemoteReaper: Send + Sync {
    /// Kill any process bound to each guarded remote port.
    ///
    /// Idempotent: a port with nothing bound is a successful no-op.
    async fn reap(&self, spec: &TunnelSpec) -> Result<(), ReapError>;
}

/// Reaper that shells out to the system ssh client
pub struct SshReaper {
    connect_timeout: Duration,
    command_timeout: Duration,
}

enum KillFailure {
    /// The ssh connection itself failed (exit 255, spawn error, timeout)
    ConnectionFailed(String),
    /// Connected, but the kill command failed on the remote side
    CommandFailed(String),
}

impl SshReaper {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound on one full kill round trip, including connection setup
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn kill_command(&self, spec: &TunnelSpec, port: u16) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        if let Some(identity) = &spec.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(spec.destination())
            .arg(format!("fuser -k {}/tcp", port));
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn kill_port(&self, spec: &TunnelSpec, port: u16) -> Result<(), KillFailure> {
        let mut cmd = self.kill_command(spec, port);

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Err(_) => {
                return Err(KillFailure::ConnectionFailed(format!(
                    "reap command timed out after {:?}",
                    self.command_timeout
                )))
            }
            Ok(Err(e)) => {
                return Err(KillFailure::ConnectionFailed(format!(
                    "failed to spawn ssh: {}",
                    e
                )))
            }
            Ok(Ok(output)) => output,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        classify_kill_status(output.status.code(), stderr.trim())
    }
}

impl Default for SshReaper {
    fn default() -> Self {
        Self::new()
    }
}

/// `fuser` exits 1 when nothing is bound to the port, which is the
/// successful no-op case that makes reap idempotent.
fn classify_kill_status(code: Option<i32>, stderr: &str) -> Result<(), KillFailure> {
    match code {
        Some(0) | Some(1) => Ok(()),
        Some(SSH_CONNECTION_FAILED) => Err(KillFailure::ConnectionFailed(if stderr.is_empty() {
            "ssh connection failed".to_string()
        } else {
            stderr.to_string()
        })),
        Some(n) => Err(KillFailure::CommandFailed(format!(
            "kill command exited with status {}: {}",
            n, stderr
        ))),
        None => Err(KillFailure::CommandFailed(
            "kill command terminated by signal".to_string(),
        )),
    }
}

#[async_trait]
impl RemoteReaper for SshReaper {
    async fn reap(&self, spec: &TunnelSpec) -> Result<(), ReapError> {
        let mut uncleared = Vec::new();

        for (idx, port) in spec.remote_ports.iter().copied().enumerate() {
            match self.kill_port(spec, port).await {
                Ok(()) => {
                    debug!(tunnel = %spec.id(), port, "remote port cleared");
                }
                Err(KillFailure::ConnectionFailed(reason)) if idx == 0 => {
                    // First connection never came up: the remote is down,
                    // clearing the rest (and launching) is pointless.
                    return Err(ReapError::Unreachable {
                        destination: spec.destination(),
                        reason,
                    });
                }
                Err(KillFailure::ConnectionFailed(reason))
                | Err(KillFailure::CommandFailed(reason)) => {
                    warn!(tunnel = %spec.id(), port, reason = %reason, "remote port not cleared");
                    uncleared.push(port);
                }
            }
        }

        if uncleared.is_empty() {
            Ok(())
        } else {
            Err(ReapError::PartialClear { ports: uncleared })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Direction;
    use std::path::PathBuf;

    fn spec() -> TunnelSpec {
        TunnelSpec {
            name: Some("test".to_string()),
            local_port: 8080,
            remote_host: "relay.example.com".to_string(),
            remote_user: "deploy".to_string(),
            remote_ports: vec![9090, 9091],
            identity_file: Some(PathBuf::from("/home/deploy/.ssh/id_ed25519")),
            direction: Direction::Reverse,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_kill_command_arguments() {
        let reaper = SshReaper::new().with_connect_timeout(Duration::from_secs(5));
        let cmd = reaper.kill_command(&spec(), 9090);
        let args = args_of(&cmd);

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/home/deploy/.ssh/id_ed25519".to_string()));
        assert!(args.contains(&"deploy@relay.example.com".to_string()));
        assert_eq!(args.last().unwrap(), "fuser -k 9090/tcp");
    }

    #[test]
    fn test_kill_command_without_identity() {
        let mut spec = spec();
        spec.identity_file = None;
        let cmd = SshReaper::new().kill_command(&spec, 9090);
        assert!(!args_of(&cmd).contains(&"-i".to_string()));
    }

    #[test]
    fn test_nothing_bound_is_success() {
        // fuser exit 1: no process on the port. Must not be an error, twice
        // in a row included.
        assert!(classify_kill_status(Some(1), "").is_ok());
        assert!(classify_kill_status(Some(1), "").is_ok());
        assert!(classify_kill_status(Some(0), "").is_ok());
    }

    #[test]
    fn test_exit_255_is_connection_failure() {
        match classify_kill_status(Some(255), "ssh: connect to host relay port 22: refused") {
            Err(KillFailure::ConnectionFailed(reason)) => assert!(reason.contains("refused")),
            _ => panic!("expected connection failure"),
        }
    }

    #[test]
    fn test_other_exit_is_command_failure() {
        match classify_kill_status(Some(127), "fuser: not found") {
            Err(KillFailure::CommandFailed(reason)) => assert!(reason.contains("127")),
            _ => panic!("expected command failure"),
        }
    }

    #[test]
    fn test_signal_termination_is_command_failure() {
        assert!(matches!(
            classify_kill_status(None, ""),
            Err(KillFailure::CommandFailed(_))
        ));
    }
}
