//! Tunnel health supervision core
//!
//! Watches SSH port-forwarding tunnels and repairs them when they die:
//! probe local connection state, clear stale listeners on the remote side,
//! relaunch a backgrounded session, then re-probe to confirm recovery.

pub mod launcher;
pub mod probe;
pub mod reaper;
pub mod report;
pub mod spec;
pub mod supervisor;

pub use launcher::{LaunchError, SessionHandle, SshLauncher, TunnelLauncher};
pub use probe::{ConnectionProbe, ProbeResult, ProcNetProbe};
pub use reaper::{ReapError, RemoteReaper, SshReaper};
pub use report::{CycleOutcome, CycleReport};
pub use spec::{Direction, TunnelSpec};
pub use supervisor::Supervisor;
