// Live vehicle map server
// Polls the journeys API and serves the reconciled map state over HTTP

use clap::Parser;
use tracing::{error, info};

use nysse_live_map::{logger, server, CliArgs};

fn main() -> std::io::Result<()> {
    let args = CliArgs::parse();
    logger::init_logger();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    info!("🚀 Starting live vehicle map (lines: {}, operators: {})",
        config.filters.lines, config.filters.operators);

    actix_web::rt::System::new().block_on(server::run_server(config))
}
