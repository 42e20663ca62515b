use campus_bus_tracker::{
    config::{Cli, Config},
    server,
};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        device = %config.client.endpoint,
        reconnect_interval_ms = config.client.reconnect_interval.as_millis() as u64,
        simulation_interval_ms = config.client.simulation.interval.as_millis() as u64,
        "starting campus-bus-tracker"
    );
    match server::run_server(config).await {
        Ok(()) => {
            tracing::info!("campus-bus-tracker stopped");
            Ok(())
        }
        Err(err) => {
            tracing::error!(?err, "campus-bus-tracker exited with error");
            Err(err)
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,campus_bus_tracker=debug".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
