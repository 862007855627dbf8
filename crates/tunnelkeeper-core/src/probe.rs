//! Tunnel liveness probing
//!
//! Reads the local connection table to decide whether a tunnel session is
//! currently established. Pure local-state read, bounded by a short timeout.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::spec::{Direction, TunnelSpec};

const TCP_ESTABLISHED: u8 = 0x01;
const TCP_LISTEN: u8 = 0x0A;

/// Result of one liveness probe, produced fresh on every cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// A session matching the tunnel's local port is up
    Established,
    /// No matching session found
    Absent,
    /// The local state could not be read; carries the reason
    Unknown(String),
}

impl std::fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeResult::Established => write!(f, "established"),
            ProbeResult::Absent => write!(f, "absent"),
            ProbeResult::Unknown(reason) => write!(f, "unknown ({})", reason),
        }
    }
}

/// Determines whether a tunnel is currently established
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    /// Probe local connection state for the given tunnel.
    ///
    /// Infallible by design: read failures fold into [`ProbeResult::Unknown`]
    /// so a broken probe can never wedge a supervision cycle.
    async fn probe(&self, spec: &TunnelSpec) -> ProbeResult;
}

/// Probe backed by `/proc/net/tcp` and `/proc/net/tcp6`
pub struct ProcNetProbe {
    timeout: Duration,
}

impl ProcNetProbe {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }

    /// Set the bound on how long a table read may take
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ProcNetProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionProbe for ProcNetProbe {
    async fn probe(&self, spec: &TunnelSpec) -> ProbeResult {
        match tokio::time::timeout(self.timeout, read_connection_tables()).await {
            Err(_) => ProbeResult::Unknown(format!(
                "connection table read timed out after {:?}",
                self.timeout
            )),
            Ok(Err(e)) => ProbeResult::Unknown(format!("failed to read connection table: {}", e)),
            Ok(Ok(table)) => {
                let result = scan_table(&table, spec);
                debug!(tunnel = %spec.id(), result = %result, "connection table scanned");
                result
            }
        }
    }
}

/// Read both IPv4 and IPv6 tables; the v6 table is optional
async fn read_connection_tables() -> std::io::Result<String> {
    let mut table = tokio::fs::read_to_string("/proc/net/tcp").await?;
    if let Ok(v6) = tokio::fs::read_to_string("/proc/net/tcp6").await {
        table.push_str(&v6);
    }
    Ok(table)
}

struct SockEntry {
    local_port: u16,
    state: u8,
}

/// Parse one `/proc/net/tcp` row; header lines yield `None`
fn parse_line(line: &str) -> Option<SockEntry> {
    let mut fields = line.split_whitespace();
    let slot = fields.next()?;
    if !slot.ends_with(':') {
        return None;
    }
    let local = fields.next()?;
    // Remote endpoint is skipped: any process may hold an outbound
    // connection whose peer uses the tunnel's port number.
    fields.next()?;
    let state = fields.next()?;

    Some(SockEntry {
        local_port: hex_port(local)?,
        state: u8::from_str_radix(state, 16).ok()?,
    })
}

/// Extract the port from a `HEXADDR:HEXPORT` field
fn hex_port(addr: &str) -> Option<u16> {
    let (_, port) = addr.rsplit_once(':')?;
    u16::from_str_radix(port, 16).ok()
}

/// Decide liveness from a connection table snapshot.
///
/// An ESTABLISHED entry whose local endpoint is the tunnel's local port
/// means the session is up. Loopback connections show both sides in the
/// table, so tunnel traffic in either direction produces such an entry.
/// A forward tunnel holds only a LISTEN socket on the local port until
/// traffic flows, so for forward specs the listener alone counts as alive.
fn scan_table(table: &str, spec: &TunnelSpec) -> ProbeResult {
    let mut listener_present = false;

    for entry in table.lines().filter_map(parse_line) {
        if entry.state == TCP_ESTABLISHED && entry.local_port == spec.local_port {
            return ProbeResult::Established;
        }
        if entry.state == TCP_LISTEN && entry.local_port == spec.local_port {
            listener_present = true;
        }
    }

    if listener_present && spec.direction == Direction::Forward {
        ProbeResult::Established
    } else {
        ProbeResult::Absent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    // 0x1F90 = 8080, 0xC350 = 50000
    const LISTEN_8080: &str =
        "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0";
    const ESTABLISHED_8080: &str =
        "   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 20 4 30 10 -1";
    // Outbound connection from an unrelated process to some host's port 8080
    const OUTBOUND_PEER_8080: &str =
        "   2: 0100007F:C350 5DB8D822:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 12347 1 0000000000000000 20 4 30 10 -1";

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

    #[test]
    fn test_header_line_is_skipped() {
        assert!(parse_line(HEADER).is_none());
    }

    #[test]
    fn test_parse_data_line() {
        let entry = parse_line(ESTABLISHED_8080).unwrap();
        assert_eq!(entry.local_port, 8080);
        assert_eq!(entry.state, TCP_ESTABLISHED);
    }

    #[test]
    fn test_established_local_endpoint_is_alive() {
        let table = format!("{}\n{}", HEADER, ESTABLISHED_8080);
        assert_eq!(
            scan_table(&table, &spec(Direction::Reverse)),
            ProbeResult::Established
        );
    }

    #[test]
    fn test_outbound_connection_to_peer_port_is_not_established() {
        // A local process talking to 34.216.184.93:8080 has nothing to do
        // with a tunnel on local port 8080.
        let table = format!("{}\n{}", HEADER, OUTBOUND_PEER_8080);
        assert_eq!(
            scan_table(&table, &spec(Direction::Reverse)),
            ProbeResult::Absent
        );
        assert_eq!(
            scan_table(&table, &spec(Direction::Forward)),
            ProbeResult::Absent
        );
    }

    #[test]
    fn test_listener_counts_for_forward_tunnels() {
        let table = format!("{}\n{}", HEADER, LISTEN_8080);
        assert_eq!(
            scan_table(&table, &spec(Direction::Forward)),
            ProbeResult::Established
        );
    }

    #[test]
    fn test_listener_does_not_count_for_reverse_tunnels() {
        let table = format!("{}\n{}", HEADER, LISTEN_8080);
        assert_eq!(
            scan_table(&table, &spec(Direction::Reverse)),
            ProbeResult::Absent
        );
    }

    #[test]
    fn test_empty_table_is_absent() {
        assert_eq!(
            scan_table(HEADER, &spec(Direction::Forward)),
            ProbeResult::Absent
        );
    }
}
