//! Command-line interface definition for Scopekeeper
//!
//! This module defines the CLI structure using clap's derive API, providing
//! commands to run the server and to validate configuration.

use clap::{Parser, Subcommand};

/// Scopekeeper - session and scope lifecycle server
///
/// Binds every request to a reference-counted session, runs order fan-outs
/// under isolated scopes, and sweeps expired sessions in the background.
#[derive(Parser, Debug, Clone)]
#[command(name = "scopekeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Scopekeeper
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP server and expiration sweeper
    Serve {
        /// Override the bind address from config (host:port)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Load and validate configuration, then print it
    CheckConfig {
        /// Print the resolved configuration as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            command: Commands::Serve { bind: None },
        }
    }
}
