//! tunnelkeeper - SSH tunnel health supervisor CLI
//!
//! One-shot (`check`) and continuous (`watch`) supervision of the tunnels
//! described in the configuration file. One-shot invocations report through
//! the exit code; watch mode logs one record per cycle and keeps looping.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tunnelkeeper_core::{ProcNetProbe, SshLauncher, SshReaper, Supervisor, TunnelSpec};

mod config;

use config::{Settings, TunnelsConfig};

type SshSupervisor = Supervisor<ProcNetProbe, SshReaper, SshLauncher>;

/// Supervise SSH tunnel health: probe, clear stale remote listeners, relaunch
#[derive(Parser, Debug)]
#[command(name = "tunnelkeeper")]
#[command(about = "Supervise SSH tunnel health: probe, clear stale remote listeners, relaunch")]
#[command(version)]
struct Cli {
    /// Path to the tunnels configuration file
    #[arg(long, short = 'c', env = "TUNNELKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one supervision cycle and exit with the outcome
    Check {
        /// Tunnel name (all configured tunnels if omitted)
        name: Option<String>,
    },
    /// Supervise continuously on a fixed interval
    Watch {
        /// Tunnel name (all configured tunnels if omitted)
        name: Option<String>,

        /// Seconds between cycles (overrides the config file)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List configured tunnels
    List,
}

/// Logs go to stderr; stdout carries the per-cycle report stream
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

fn select_tunnels(config: &TunnelsConfig, name: Option<&str>) -> Result<Vec<TunnelSpec>> {
    match name {
        Some(name) => config
            .tunnels
            .iter()
            .find(|spec| spec.id() == name)
            .cloned()
            .map(|spec| vec![spec])
            .with_context(|| format!("No tunnel named '{}' in configuration", name)),
        None => Ok(config.tunnels.clone()),
    }
}

fn build_supervisor(settings: &Settings, shutdown: watch::Receiver<bool>) -> SshSupervisor {
    let probe =
        ProcNetProbe::new().with_timeout(Duration::from_secs(settings.probe_timeout_secs));
    let reaper =
        SshReaper::new().with_connect_timeout(Duration::from_secs(settings.connect_timeout_secs));
    // Establish window must exceed the connect timeout so connection
    // failures exit inside it.
    let launcher = SshLauncher::new()
        .with_connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .with_establish_window(Duration::from_secs(settings.connect_timeout_secs + 5));

    Supervisor::new(probe, reaper, launcher)
        .with_settle_delay(Duration::from_secs(settings.settle_delay_secs))
        .with_shutdown(shutdown)
}

/// One cycle per tunnel; exit code is the worst outcome across them
async fn run_check(supervisor: SshSupervisor, specs: Vec<TunnelSpec>) -> i32 {
    let reports = supervisor.run_all(&specs).await;

    let mut worst = 0;
    for report in &reports {
        println!("{}", report.to_json());
        report.log();
        worst = worst.max(report.outcome.exit_code());
    }
    worst
}

async fn run_watch(
    supervisor: Arc<SshSupervisor>,
    specs: Vec<TunnelSpec>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    info!(
        "Supervising {} tunnel(s) every {}s",
        specs.len(),
        interval.as_secs()
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut cycles: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for spec in &specs {
                    let supervisor = supervisor.clone();
                    let spec = spec.clone();
                    cycles.spawn(async move {
                        match supervisor.try_run_cycle(&spec).await {
                            Some(report) => report.log(),
                            None => {
                                debug!(tunnel = %spec.id(), "previous cycle still in flight, skipping tick");
                            }
                        }
                    });
                }
            }
            // Keep the set drained so it does not grow across ticks
            Some(_) = cycles.join_next(), if !cycles.is_empty() => {}
            _ = &mut shutdown => {
                info!("Termination signal received, finishing in-flight cycles...");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    let drain = async {
        while cycles.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(60), drain).await.is_err() {
        warn!("Timed out waiting for in-flight cycles, exiting anyway");
    }

    info!("Supervisor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };
    let config = config::load(&config_path)?;

    match cli.command {
        Commands::List => {
            for spec in &config.tunnels {
                println!(
                    "{:<24} {:<8} local:{:<6} {} remote:{:?}",
                    spec.id(),
                    spec.direction,
                    spec.local_port,
                    spec.destination(),
                    spec.remote_ports,
                );
            }
            Ok(())
        }
        Commands::Check { name } => {
            let specs = select_tunnels(&config, name.as_deref())?;
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let supervisor = build_supervisor(&config.settings, shutdown_rx);

            let code = run_check(supervisor, specs).await;
            std::process::exit(code);
        }
        Commands::Watch { name, interval } => {
            let specs = select_tunnels(&config, name.as_deref())?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let supervisor = Arc::new(build_supervisor(&config.settings, shutdown_rx));
            let interval =
                Duration::from_secs(interval.unwrap_or(config.settings.interval_secs));

            run_watch(supervisor, specs, interval, shutdown_tx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelkeeper_core::Direction;

    fn config_with(names: &[&str]) -> TunnelsConfig {
        TunnelsConfig {
            settings: Settings::default(),
            tunnels: names
                .iter()
                .enumerate()
                .map(|(i, name)| TunnelSpec {
                    name: Some(name.to_string()),
                    local_port: 8080 + i as u16,
                    remote_host: "relay.example.com".to_string(),
                    remote_user: "deploy".to_string(),
                    remote_ports: vec![9090 + i as u16],
                    identity_file: None,
                    direction: Direction::Reverse,
                })
                .collect(),
        }
    }

    #[test]
    fn test_select_all_tunnels() {
        let config = config_with(&["db", "web"]);
        let specs = select_tunnels(&config, None).unwrap();
        assert_eq!(specs.len(), 2);
    }

    #[test]
    fn test_select_by_name() {
        let config = config_with(&["db", "web"]);
        let specs = select_tunnels(&config, Some("web")).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id(), "web");
    }

    #[test]
    fn test_select_unknown_name_fails() {
        let config = config_with(&["db"]);
        let err = select_tunnels(&config, Some("nope")).unwrap_err();
        assert!(err.to_string().contains("No tunnel named 'nope'"));
    }
}
