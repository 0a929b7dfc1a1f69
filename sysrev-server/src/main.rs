//! sysrev collaboration server.
//!
//! Serves the WebSocket relay used by the review UI for live document
//! editing and direct chat. Configuration comes from an optional TOML file,
//! with command-line overrides on top.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};
use sysrev_collab::server::{CollabServer, ConfigError, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time collaboration relay for sysrev", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:9090
    #[arg(short, long)]
    bind: Option<String>,

    /// WebSocket ping interval in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    heartbeat_secs: Option<u64>,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(secs) = self.heartbeat_secs {
            config.heartbeat_interval_secs = secs;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.server_config()?;
    info!("Starting sysrev collaboration server on {}", config.bind_addr);

    let server = CollabServer::new(config);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Server stopped");
    Ok(())
}
