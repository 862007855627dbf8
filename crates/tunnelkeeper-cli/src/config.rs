//! Tunnel configuration loading
//!
//! Reads the tunnels file (YAML by default, JSON by extension) into the
//! immutable specs the supervisor works with, plus the supervision settings.
//!
//! ```yaml
//! settings:
//!   interval_secs: 60
//! tunnels:
//!   - name: db
//!     local_port: 5432
//!     remote_host: bastion.example.com
//!     remote_user: deploy
//!     remote_port: 15432
//!     direction: forward
//!     identity_file: /home/deploy/.ssh/id_ed25519
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tunnelkeeper_core::TunnelSpec;

/// Top-level tunnels file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelsConfig {
    #[serde(default)]
    pub settings: Settings,
    pub tunnels: Vec<TunnelSpec>,
}

/// Supervision settings with sensible defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds between supervision cycles in watch mode
    pub interval_secs: u64,
    /// Seconds to wait after a launch before the verify probe
    pub settle_delay_secs: u64,
    /// Connection timeout for remote-facing ssh operations
    pub connect_timeout_secs: u64,
    /// Bound on one local connection-table read
    pub probe_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            settle_delay_secs: 3,
            connect_timeout_secs: 10,
            probe_timeout_secs: 2,
        }
    }
}

/// Default config file location
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".tunnelkeeper").join("tunnels.yaml"))
}

/// Load and validate the tunnels file
pub fn load(path: &Path) -> Result<TunnelsConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let is_json = path
        .extension()
        .map(|ext| ext == "json")
        .unwrap_or(false);

    let config: TunnelsConfig = if is_json {
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &TunnelsConfig) -> Result<()> {
    if config.tunnels.is_empty() {
        bail!("No tunnels configured");
    }

    for spec in &config.tunnels {
        if spec.remote_host.is_empty() {
            bail!("Tunnel '{}': remote_host cannot be empty", spec.id());
        }
        if spec.remote_user.is_empty() {
            bail!("Tunnel '{}': remote_user cannot be empty", spec.id());
        }
        if spec.local_port == 0 {
            bail!("Tunnel '{}': local_port cannot be 0", spec.id());
        }
        if spec.remote_ports.is_empty() || spec.remote_ports.contains(&0) {
            bail!(
                "Tunnel '{}': at least one non-zero remote port is required",
                spec.id()
            );
        }
    }

    let mut ids: Vec<String> = config.tunnels.iter().map(|spec| spec.id()).collect();
    ids.sort();
    let before = ids.len();
    ids.dedup();
    if ids.len() != before {
        bail!("Duplicate tunnel identifiers in configuration");
    }

    Ok(())
}
