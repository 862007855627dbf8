//! Cycle outcome reporting
//!
//! One structured record per supervision cycle, for the exit-code layer and
//! for whatever log collector sits downstream.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::launcher::SessionHandle;
use crate::probe::ProbeResult;
use crate::spec::TunnelSpec;

/// Terminal outcome of one supervision cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Tunnel was already up; no intervention
    Healthy,
    /// Recovery ran and the re-probe confirmed the tunnel is back
    Recovered,
    /// Launch reported success but the re-probe disagreed, or recovery was
    /// otherwise unable to bring the tunnel up
    StillDown,
    /// Remote unreachable; recovery aborted before launching
    ReapFailed,
    /// The launch step failed
    LaunchFailed,
    /// Cycle stopped between steps by a shutdown request
    Aborted,
}

impl CycleOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, CycleOutcome::Healthy | CycleOutcome::Recovered)
    }

    /// Exit code for one-shot invocations
    pub fn exit_code(self) -> i32 {
        match self {
            CycleOutcome::Healthy | CycleOutcome::Recovered => 0,
            CycleOutcome::StillDown | CycleOutcome::Aborted => 1,
            CycleOutcome::ReapFailed => 2,
            CycleOutcome::LaunchFailed => 3,
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CycleOutcome::Healthy => "healthy",
            CycleOutcome::Recovered => "recovered",
            CycleOutcome::StillDown => "still_down",
            CycleOutcome::ReapFailed => "reap_failed",
            CycleOutcome::LaunchFailed => "launch_failed",
            CycleOutcome::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Structured record for one supervision cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub timestamp: DateTime<Utc>,
    pub tunnel: String,
    pub probe_before: ProbeResult,
    pub outcome: CycleOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uncleared_ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_pid: Option<u32>,
}

impl CycleReport {
    pub fn new(spec: &TunnelSpec, probe_before: ProbeResult, outcome: CycleOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            tunnel: spec.id(),
            probe_before,
            outcome,
            uncleared_ports: Vec::new(),
            error: None,
            session_pid: None,
        }
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_uncleared(mut self, ports: Vec<u16>) -> Self {
        self.uncleared_ports = ports;
        self
    }

    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session_pid = Some(session.pid);
        self
    }

    /// One JSON line, for the report stream
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"tunnel\":\"{}\",\"error\":\"{}\"}}", self.tunnel, e))
    }

    /// Emit the record at a level matching its severity
    pub fn log(&self) {
        match self.outcome {
            CycleOutcome::Healthy | CycleOutcome::Recovered => {
                info!(
                    tunnel = %self.tunnel,
                    outcome = %self.outcome,
                    probe_before = %self.probe_before,
                    session_pid = self.session_pid,
                    "cycle complete"
                );
            }
            CycleOutcome::Aborted => {
                warn!(tunnel = %self.tunnel, outcome = %self.outcome, "cycle aborted");
            }
            _ => {
                error!(
                    tunnel = %self.tunnel,
                    outcome = %self.outcome,
                    probe_before = %self.probe_before,
                    error = self.error.as_deref(),
                    uncleared_ports = ?self.uncleared_ports,
                    "cycle failed"
                );
            }
        }
    }
}
