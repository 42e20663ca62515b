use std::{fs, path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;

use crate::{
    client::{
        ClientConfig, DEFAULT_DEVICE_URL, DEFAULT_MAX_RECONNECT_ATTEMPTS,
        DEFAULT_RECONNECT_INTERVAL,
    },
    simulator::{SimulationConfig, DEFAULT_SIMULATION_INTERVAL},
};

#[derive(Parser, Debug, Default)]
#[command(
    name = "campus-bus-tracker",
    version,
    about = "Campus bus telemetry client with a local WebSocket relay for dashboards"
)]
pub struct Cli {
    /// WebSocket endpoint of the tracking device (ws://host:port)
    #[arg(long, env = "CAMPUS_BUS_DEVICE_URL", value_name = "URL")]
    pub device_url: Option<String>,

    /// Failed connection attempts before switching to synthetic telemetry
    #[arg(long, value_name = "N")]
    pub max_reconnect_attempts: Option<u32>,

    /// Fixed delay between reconnect attempts, in milliseconds
    #[arg(long, value_name = "MS")]
    pub reconnect_interval_ms: Option<u64>,

    /// Period of synthetic reports once the device is given up on, in milliseconds
    #[arg(long, value_name = "MS")]
    pub simulation_interval_ms: Option<u64>,

    /// Vehicle id stamped on synthetic reports
    #[arg(long, value_name = "ID")]
    pub vehicle_id: Option<u32>,

    /// Host interface the relay binds to
    #[arg(long)]
    pub host: Option<String>,

    /// Port the relay listens on
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to a TOML config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    device_url: Option<String>,
    max_reconnect_attempts: Option<u32>,
    reconnect_interval_ms: Option<u64>,
    simulation_interval_ms: Option<u64>,
    vehicle_id: Option<u32>,
    host: Option<String>,
    port: Option<u16>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let mut file_cfg = if let Some(path) = cli.config.as_ref() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file at {}", path.display()))?;
            toml::from_str::<FileConfig>(&raw)
                .with_context(|| format!("failed to parse config file at {}", path.display()))?
        } else {
            FileConfig::default()
        };

        if let Some(device_url) = cli.device_url {
            file_cfg.device_url = Some(device_url);
        }
        if let Some(max) = cli.max_reconnect_attempts {
            file_cfg.max_reconnect_attempts = Some(max);
        }
        if let Some(ms) = cli.reconnect_interval_ms {
            file_cfg.reconnect_interval_ms = Some(ms);
        }
        if let Some(ms) = cli.simulation_interval_ms {
            file_cfg.simulation_interval_ms = Some(ms);
        }
        if let Some(vehicle_id) = cli.vehicle_id {
            file_cfg.vehicle_id = Some(vehicle_id);
        }
        if let Some(host) = cli.host {
            file_cfg.host = Some(host);
        }
        if let Some(port) = cli.port {
            file_cfg.port = Some(port);
        }

        let endpoint = file_cfg
            .device_url
            .unwrap_or_else(|| DEFAULT_DEVICE_URL.to_string());
        // the device firmware only speaks plain websocket
        if !endpoint.starts_with("ws://") {
            bail!("device_url must use the ws:// scheme, got '{endpoint}'");
        }

        let reconnect_interval = positive_millis(
            "reconnect_interval_ms",
            file_cfg.reconnect_interval_ms,
            DEFAULT_RECONNECT_INTERVAL,
        )?;
        let simulation_interval = positive_millis(
            "simulation_interval_ms",
            file_cfg.simulation_interval_ms,
            DEFAULT_SIMULATION_INTERVAL,
        )?;

        let defaults = SimulationConfig::default();
        Ok(Config {
            host: file_cfg.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: file_cfg.port.unwrap_or(8080),
            client: ClientConfig {
                endpoint,
                max_reconnect_attempts: file_cfg
                    .max_reconnect_attempts
                    .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS)
                    .max(1),
                reconnect_interval,
                simulation: SimulationConfig {
                    interval: simulation_interval,
                    vehicle_id: file_cfg.vehicle_id.unwrap_or(defaults.vehicle_id),
                    ..defaults
                },
            },
        })
    }
}

fn positive_millis(key: &str, value: Option<u64>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(0) => bail!("{key} must be greater than zero"),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}
