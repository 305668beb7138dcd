//! Scopekeeper - session and scope lifecycle server
//!
#![doc = "Main entry point for the Scopekeeper server."]

use anyhow::Result;

use scopekeeper::cli::{Cli, Commands};
use scopekeeper::config::Config;
use scopekeeper::logging::{bootstrap_subscriber, init_logging};
use scopekeeper::server;
use scopekeeper::session::metrics::init_metrics_exporter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load and validate configuration; warnings go to stderr until the
    // configured subscriber is installed
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = tracing::subscriber::with_default(bootstrap_subscriber(cli.verbose), || {
        let config = Config::load(config_path, &cli)?;
        config.validate()?;
        Ok::<_, anyhow::Error>(config)
    })?;

    match cli.command {
        Commands::Serve { .. } => {
            init_logging(&config.logging)?;
            init_metrics_exporter();
            tracing::info!("Starting Scopekeeper server");
            server::serve(config).await
        }
        Commands::CheckConfig { json } => {
            let rendered = if json {
                serde_json::to_string_pretty(&config)?
            } else {
                serde_yaml::to_string(&config)?
            };
            println!("{}", rendered);
            Ok(())
        }
    }
}
