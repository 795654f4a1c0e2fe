use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "peercam")]
#[command(version)]
#[command(about = "Multi-peer webcam client for chat relays", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "peercam.toml")]
    pub config: PathBuf,

    /// Relay WebSocket URL
    #[arg(long)]
    pub url: Option<String>,

    /// Username to log in as
    #[arg(short, long)]
    pub username: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Start broadcasting the camera at launch
    #[arg(long, action)]
    pub camera: bool,
}

impl Args {
    /// Load the config file and apply command line overrides
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        let mut config = config::Config::load(&self.config)?;
        self.apply_overrides(&mut config);
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref url) = self.url {
            config.relay.url = url.clone();
        }
        if let Some(ref username) = self.username {
            config.relay.username = username.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let args = Args::parse_from([
            "peercam",
            "--config",
            "/nonexistent/peercam.toml",
            "--url",
            "wss://chat.example.com/ws",
            "-u",
            "alice",
            "--camera",
        ]);
        assert!(args.camera);
        let config = args.load_config().unwrap();
        assert_eq!(config.relay.url, "wss://chat.example.com/ws");
        assert_eq!(config.relay.username, "alice");
        assert!(config.validate().is_ok());
    }
}
