//! Tunnel session launching
//!
//! Starts a backgrounded `ssh -N` session for a tunnel spec. The session is
//! configured to look after itself: keepalive probing with a bounded missed
//! count (a dead path makes it exit instead of lingering silently) and
//! `ExitOnForwardFailure` so a forward that cannot bind kills the session
//! immediately. The child is watched for an early-exit window; surviving it
//! counts as backgrounded, and the supervisor's verify step covers the rest.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::debug;

use crate::spec::{Direction, TunnelSpec};

/// Identifier of a launched tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub pid: u32,
}

/// Launch errors
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The local or remote port is already occupied by an unrelated session.
    /// Retrying without operator action will repeat this.
    #[error("port already bound: {0}")]
    BindConflict(String),

    /// Credential negotiation failed; does not self-heal
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// No confirmation of establishment within the bounded window
    #[error("establishment timed out: {0}")]
    Timeout(String),

    #[error("failed to spawn ssh: {0}")]
    Spawn(#[from] std::io::Error),

    /// Session exited during establishment for a reason outside the taxonomy
    #[error("tunnel session exited during establishment: {0}")]
    SessionExited(String),
}

/// Starts a backgrounded tunnel session
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch(&self, spec: &TunnelSpec) -> Result<SessionHandle, LaunchError>;
}

/// Launcher that spawns the system ssh client
pub struct SshLauncher {
    keepalive_interval: Duration,
    keepalive_max_missed: u32,
    connect_timeout: Duration,
    establish_window: Duration,
}

impl SshLauncher {
    pub fn new() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            keepalive_max_missed: 3,
            connect_timeout: Duration::from_secs(10),
            establish_window: Duration::from_secs(15),
        }
    }

    /// Keepalive probe interval and how many misses the session survives
    pub fn with_keepalive(mut self, interval: Duration, max_missed: u32) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_max_missed = max_missed;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long to watch the child for an early exit before declaring it
    /// backgrounded; must exceed the connect timeout so connection failures
    /// land inside the window.
    pub fn with_establish_window(mut self, window: Duration) -> Self {
        self.establish_window = window;
        self
    }

    fn session_command(&self, spec: &TunnelSpec) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-N")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg(format!(
                "ServerAliveInterval={}",
                self.keepalive_interval.as_secs()
            ))
            .arg("-o")
            .arg(format!("ServerAliveCountMax={}", self.keepalive_max_missed))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));

        if let Some(identity) = &spec.identity_file {
            cmd.arg("-i").arg(identity);
        }

        let (flag, mapping) = match spec.direction {
            Direction::Forward => (
                "-L",
                format!("{}:localhost:{}", spec.local_port, spec.mapped_remote_port()),
            ),
            Direction::Reverse => (
                "-R",
                format!("{}:localhost:{}", spec.mapped_remote_port(), spec.local_port),
            ),
        };
        cmd.arg(flag).arg(mapping).arg(spec.destination());

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Default for SshLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelLauncher for SshLauncher {
    async fn launch(&self, spec: &TunnelSpec) -> Result<SessionHandle, LaunchError> {
        let mut child = self.session_command(spec).spawn()?;
        let stderr = child.stderr.take();

        let early_exit = tokio::time::timeout(self.establish_window, child.wait()).await;
        match early_exit {
            // Exited inside the window: establishment failed
            Ok(Ok(status)) => Err(classify_failure(
                exit_detail(status.code(), &read_stderr(stderr).await),
            )),
            Ok(Err(e)) => Err(LaunchError::Spawn(e)),
            // Still running: the session is backgrounded
            Err(_) => match child.id() {
                Some(pid) => {
                    if let Some(stderr) = stderr {
                        drain_stderr(stderr, spec.id());
                    }
                    Ok(SessionHandle { pid })
                }
                // Lost the race with an exit right at the window edge
                None => {
                    let status = child.wait().await.map_err(LaunchError::Spawn)?;
                    Err(classify_failure(exit_detail(
                        status.code(),
                        &read_stderr(stderr).await,
                    )))
                }
            },
        }
    }
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_string(&mut text).await;
    }
    text
}

/// Keep the session's stderr drained so it never blocks on the pipe
fn drain_stderr(stderr: ChildStderr, tunnel: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(tunnel = %tunnel, "ssh: {}", line);
        }
    });
}

fn exit_detail(code: Option<i32>, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        match code {
            Some(code) => format!("ssh exited with status {}", code),
            None => "ssh terminated by signal".to_string(),
        }
    } else {
        stderr.to_string()
    }
}

/// Map the ssh client's failure text onto the launch error taxonomy
fn classify_failure(detail: String) -> LaunchError {
    let lower = detail.to_lowercase();

    if lower.contains("address already in use")
        || lower.contains("port forwarding failed")
        || lower.contains("cannot listen to port")
    {
        LaunchError::BindConflict(detail)
    } else if lower.contains("permission denied")
        || lower.contains("authentication")
        || lower.contains("host key verification")
    {
        LaunchError::AuthFailure(detail)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LaunchError::Timeout(detail)
    } else {
        LaunchError::SessionExited(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(direction: Direction) -> TunnelSpec {
        TunnelSpec {
            name: Some("test".to_string()),
            local_port: 8080,
            remote_host: "relay.example.com".to_string(),
            remote_user: "deploy".to_string(),
            remote_ports: vec![9090],
            identity_file: None,
            direction,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_forward_mapping_arguments() {
        let args = args_of(&SshLauncher::new().session_command(&spec(Direction::Forward)));
        let flag_pos = args.iter().position(|a| a == "-L").unwrap();
        assert_eq!(args[flag_pos + 1], "8080:localhost:9090");
        assert!(!args.contains(&"-R".to_string()));
    }

    #[test]
    fn test_reverse_mapping_arguments() {
        let args = args_of(&SshLauncher::new().session_command(&spec(Direction::Reverse)));
        let flag_pos = args.iter().position(|a| a == "-R").unwrap();
        assert_eq!(args[flag_pos + 1], "9090:localhost:8080");
    }

    #[test]
    fn test_session_self_management_options() {
        let launcher = SshLauncher::new().with_keepalive(Duration::from_secs(20), 4);
        let args = args_of(&launcher.session_command(&spec(Direction::Reverse)));

        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert!(args.contains(&"ServerAliveInterval=20".to_string()));
        assert!(args.contains(&"ServerAliveCountMax=4".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"-N".to_string()));
        assert_eq!(args.last().unwrap(), "deploy@relay.example.com");
    }

    #[test]
    fn test_classify_bind_conflict() {
        assert!(matches!(
            classify_failure("Error: remote port forwarding failed for listen port 9090".into()),
            LaunchError::BindConflict(_)
        ));
        assert!(matches!(
            classify_failure("bind [127.0.0.1]:8080: Address already in use".into()),
            LaunchError::BindConflict(_)
        ));
    }

    #[test]
    fn test_classify_auth_failure() {
        assert!(matches!(
            classify_failure("deploy@relay.example.com: Permission denied (publickey).".into()),
            LaunchError::AuthFailure(_)
        ));
        assert!(matches!(
            classify_failure("Host key verification failed.".into()),
            LaunchError::AuthFailure(_)
        ));
    }

    #[test]
    fn test_classify_timeout() {
        assert!(matches!(
            classify_failure(
                "ssh: connect to host relay.example.com port 22: Connection timed out".into()
            ),
            LaunchError::Timeout(_)
        ));
    }

    #[test]
    fn test_classify_unrecognized_exit() {
        assert!(matches!(
            classify_failure(exit_detail(Some(1), "")),
            LaunchError::SessionExited(_)
        ));
    }
}
