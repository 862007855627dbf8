//! Tunnel specification
//!
//! An immutable description of one supervised tunnel, created from
//! configuration at process start and passed by reference through every
//! supervision step.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Direction of the port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local side listens, traffic forwarded to the remote service (`ssh -L`)
    Forward,
    /// Remote side listens, traffic forwarded back to the local service (`ssh -R`)
    Reverse,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// Specification for one supervised tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Human-readable tunnel identifier (derived from ports/host if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Local port of the mapping
    pub local_port: u16,

    /// Remote endpoint hostname or address
    pub remote_host: String,

    /// User to authenticate as on the remote endpoint
    pub remote_user: String,

    /// Remote ports guarded by the reaper; the first entry is the mapped port
    #[serde(alias = "remote_port", deserialize_with = "one_or_many")]
    pub remote_ports: Vec<u16>,

    /// SSH identity file to authenticate with (credential reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    /// Direction of the port mapping
    pub direction: Direction,
}

impl TunnelSpec {
    /// Stable identifier for this tunnel, used for locking and reporting
    pub fn id(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!(
                "{}@{}:{}-{}",
                self.remote_user,
                self.remote_host,
                self.local_port,
                self.mapped_remote_port()
            ),
        }
    }

    /// The remote port the tunnel maps to/from
    pub fn mapped_remote_port(&self) -> u16 {
        self.remote_ports.first().copied().unwrap_or(self.local_port)
    }

    /// `user@host` destination string for the ssh client
    pub fn destination(&self) -> String {
        format!("{}@{}", self.remote_user, self.remote_host)
    }
}

/// Accept either a single `remote_port` or a `remote_ports` list
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u16),
        Many(Vec<u16>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(port) => vec![port],
        OneOrMany::Many(ports) => ports,
    })
}
