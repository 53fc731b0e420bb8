use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod config;
mod dispatcher;
mod drain;
mod host;
mod http_objects;
mod lifecycle;
mod metrics_publisher;
mod routes;
mod service;
mod standby;
mod tracing;
use tracing::setup_tracing;
mod workers;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => config::ServerConfig::from_path(&path.to_string_lossy()),
        None => config::ServerConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            setup_tracing(&config::ServerConfig::default());
            error!("Error loading config: {:?}", err);
            std::process::exit(1);
        }
    };

    setup_tracing(&config);

    let root_span = info_span!(
        "funchost",
        env = config.env,
        "funchost-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    let service = Service::new(config);
    if let Err(err) = service {
        error!("Error creating service: {:?}", err);
        return;
    }
    if let Ok(mut service) = service {
        if let Err(err) = service.start().await {
            error!("Error starting service: {:?}", err);
        }
    }
}
