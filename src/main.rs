use hashbench::config::{Config, RoleConfig};
use hashbench::{client, server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        payload_size = config.tuning.payload_size,
        digest_width = config.tuning.digest_width,
        "Starting hashbench"
    );

    match config.role {
        RoleConfig::Server(server_config) => {
            info!(
                port = server_config.port,
                workers = server_config.workers,
                batch_size = server_config.max_batch_size,
                batch_latency_ms = server_config.max_batch_latency.as_millis() as u64,
                "Server role"
            );
            server::run(server_config, config.tuning)?;
        }
        RoleConfig::Client(client_config) => {
            info!(
                host = %client_config.host,
                port = client_config.port,
                rate = client_config.rate,
                "Client role"
            );
            client::run(client_config, config.tuning)?;
        }
    }

    Ok(())
}
