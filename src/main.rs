//! peercam - Main entry point
//!
//! Logs in to a chat relay and runs the webcam client, taking commands on stdin.

use clap::Parser;
use log::{error, info, warn};
use peercam::args::Args;
use peercam::client::{Client, HELP};
use peercam::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match args.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config {:?}: {}, using defaults", args.config, e);
            let mut cfg = Config::default();
            args.apply_overrides(&mut cfg);
            cfg
        }
    };

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { config.logging.level.as_str() };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("PEERCAM_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("peercam v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }
    if config.preferences.path.is_none() {
        warn!("No preferences path configured; webcam settings will not persist");
    }

    info!("Logging in to {} as {}", config.relay.url, config.relay.username);
    info!("{}", HELP);

    let client = Client::new(&config);
    client.run(config, args.camera).await?;

    info!("peercam stopped");
    Ok(())
}
