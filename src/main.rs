use anyhow::Context;
use clap::Parser;
use std::process;
use tracing::{error, info};

use stargate_deploy::cli::{Cli, CliHandler, Commands};
use stargate_deploy::logging;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = CliHandler::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    logging::init(&config.logging).context("Failed to initialize logging")?;

    let handler = CliHandler::new(config.clone()).context("Failed to build deployment")?;

    match cli.command {
        Commands::Status => {
            print!("{}", handler.status()?);
        }
        Commands::Check => {
            let results = handler.check().await?;
            for health in &results {
                println!(
                    "{:<12} {:<12} {:<6} {}",
                    health.datacenter,
                    health.node,
                    if health.alive { "alive" } else { "dead" },
                    health.endpoint
                );
            }
            if results.iter().any(|h| !h.alive) {
                process::exit(2);
            }
        }
        Commands::Call { method, path, data, headers } => {
            let monitor = config
                .health_monitor(handler.executor().deployment().clone())?
                .map(|m| m.spawn());

            let response = handler.call(&method, &path, data, &headers).await?;
            info!("{} answered from {}/{}", response.status, response.datacenter, response.node);
            println!("{}", response.body);

            if let Some(monitor) = monitor {
                monitor.abort();
            }
        }
    }
    Ok(())
}
