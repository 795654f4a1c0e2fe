//! Configuration management for peercam

use crate::signaling::health::HealthTimings;
use crate::signaling::SignalingConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chat relay connection
    #[serde(default)]
    pub relay: RelayConfig,

    /// Peer connection settings
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Signaling timers and account capabilities
    #[serde(default)]
    pub signaling: SignalingSettings,

    /// Boot rate limit
    #[serde(default)]
    pub boot_limit: BootLimitConfig,

    #[serde(default)]
    pub preferences: PreferencesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// WebSocket URL of the chat relay
    pub url: String,

    /// Username to log in as
    #[serde(default)]
    pub username: String,

    /// Signed login token, when the relay requires one
    #[serde(default)]
    pub jwt: Option<String>,

    /// Do not disturb
    #[serde(default)]
    pub dnd: bool,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Consecutive failed reconnects before giving up
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9000/ws".to_string(),
            username: String::new(),
            jwt: None,
            dnd: false,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnects: default_max_reconnects(),
        }
    }
}

impl RelayConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// A STUN or TURN server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// RTP gap after which an inbound track counts as muted
    #[serde(default = "default_track_silence_ms")]
    pub track_silence_ms: u64,

    /// UDP address receiving VP8 RTP for the camera track
    #[serde(default)]
    pub video_rtp_listen: Option<String>,

    /// UDP address receiving Opus RTP for the microphone track
    #[serde(default)]
    pub audio_rtp_listen: Option<String>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            track_silence_ms: default_track_silence_ms(),
            video_rtp_listen: None,
            audio_rtp_listen: None,
        }
    }
}

/// Timers and account capabilities for the signaling core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingSettings {
    /// Watchdog for an opened camera that never produces a stream
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_open_debounce_ms")]
    pub open_debounce_ms: u64,

    /// How long a muted video may stay muted before it is reported frozen
    #[serde(default = "default_freeze_grace_ms")]
    pub freeze_grace_ms: u64,

    #[serde(default = "default_freeze_poll_ms")]
    pub freeze_poll_ms: u64,

    /// Relay allows explicit cameras
    #[serde(default = "default_permit_nsfw")]
    pub permit_nsfw: bool,

    #[serde(default)]
    pub is_vip: bool,

    #[serde(default)]
    pub is_operator: bool,

    /// Moderation rule forbidding us from opening cameras
    #[serde(default)]
    pub no_video: bool,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            open_debounce_ms: default_open_debounce_ms(),
            freeze_grace_ms: default_freeze_grace_ms(),
            freeze_poll_ms: default_freeze_poll_ms(),
            permit_nsfw: default_permit_nsfw(),
            is_vip: false,
            is_operator: false,
            no_video: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootLimitConfig {
    /// Pre-emptive boots allowed before the cooldown applies
    #[serde(default = "default_max_free_boots")]
    pub max_free_boots: u32,

    #[serde(default = "default_boot_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BootLimitConfig {
    fn default() -> Self {
        Self {
            max_free_boots: default_max_free_boots(),
            cooldown_secs: default_boot_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferencesConfig {
    /// JSON file holding webcam preferences; kept in memory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !(self.relay.url.starts_with("ws://") || self.relay.url.starts_with("wss://")) {
            return Err("Relay url must use ws:// or wss://".into());
        }

        if self.relay.username.trim().is_empty() {
            return Err("Relay username must be set".into());
        }

        if self.relay.reconnect_delay_secs == 0 {
            return Err("Relay reconnect delay must be non-zero".into());
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entries need at least one url".into());
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
                    return Err(format!("Unsupported ICE server url: {}", url).into());
                }
            }
        }

        if self.webrtc.track_silence_ms == 0 {
            return Err("WebRTC track silence threshold must be non-zero".into());
        }

        for addr in [&self.webrtc.video_rtp_listen, &self.webrtc.audio_rtp_listen].into_iter().flatten() {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid RTP listen address: {}", addr).into());
            }
        }

        let s = &self.signaling;
        if s.open_timeout_ms == 0 || s.freeze_grace_ms == 0 || s.freeze_poll_ms == 0 {
            return Err("Signaling timers must be non-zero".into());
        }

        if s.freeze_poll_ms > s.freeze_grace_ms {
            return Err("Freeze poll interval cannot exceed the freeze grace period".into());
        }

        Ok(())
    }

    /// Signaling core tunables derived from this configuration
    pub fn signaling_config(&self) -> SignalingConfig {
        let s = &self.signaling;
        SignalingConfig {
            username: self.relay.username.clone(),
            status: "online".to_string(),
            dnd: self.relay.dnd,
            open_timeout: Duration::from_millis(s.open_timeout_ms),
            open_debounce: Duration::from_millis(s.open_debounce_ms),
            health: HealthTimings {
                grace: Duration::from_millis(s.freeze_grace_ms),
                poll: Duration::from_millis(s.freeze_poll_ms),
            },
            permit_nsfw: s.permit_nsfw,
            is_vip: s.is_vip,
            is_operator: s.is_operator,
            no_video: s.no_video,
            max_free_boots: self.boot_limit.max_free_boots,
            boot_cooldown: Duration::from_secs(self.boot_limit.cooldown_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.relay.username = "alice".to_string();
        cfg
    }

    #[test]
    fn defaults_validate_once_username_is_set() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_relay_url() {
        let mut cfg = valid();
        cfg.relay.url = "http://chat.example.com/ws".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_ice_url() {
        let mut cfg = valid();
        cfg.webrtc.ice_servers.push(IceServerConfig {
            urls: vec!["http://turn.example.com".to_string()],
            username: None,
            credential: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_rtp_listen_address() {
        let mut cfg = valid();
        cfg.webrtc.video_rtp_listen = Some("127.0.0.1:5004".to_string());
        assert!(cfg.validate().is_ok());
        cfg.webrtc.audio_rtp_listen = Some("localhost".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_poll_longer_than_grace() {
        let mut cfg = valid();
        cfg.signaling.freeze_poll_ms = 10_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [relay]
            url = "wss://chat.example.com/ws"
            username = "bob"

            [boot_limit]
            max_free_boots = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.relay.max_reconnects, 3);
        assert_eq!(cfg.relay.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(cfg.boot_limit.max_free_boots, 3);
        assert_eq!(cfg.boot_limit.cooldown_secs, 60);
        assert_eq!(cfg.webrtc.track_silence_ms, 1000);

        let core = cfg.signaling_config();
        assert_eq!(core.username, "bob");
        assert_eq!(core.open_timeout, Duration::from_secs(10));
        assert_eq!(core.health.grace, Duration::from_millis(7500));
        assert!(core.permit_nsfw);
    }

    #[test]
    fn relay_dnd_reaches_signaling() {
        let mut cfg = valid();
        assert!(!cfg.signaling_config().dnd);
        cfg.relay.dnd = true;
        assert!(cfg.signaling_config().dnd);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = PathBuf::from("/nonexistent/peercam.toml");
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.relay.max_reconnects, 3);
    }
}

fn default_reconnect_delay_secs() -> u64 { 5 }
fn default_max_reconnects() -> u32 { 3 }
fn default_track_silence_ms() -> u64 { 1000 }
fn default_open_timeout_ms() -> u64 { 10_000 }
fn default_open_debounce_ms() -> u64 { 5_000 }
fn default_freeze_grace_ms() -> u64 { 7_500 }
fn default_freeze_poll_ms() -> u64 { 3_000 }
fn default_permit_nsfw() -> bool { true }
fn default_max_free_boots() -> u32 { 10 }
fn default_boot_cooldown_secs() -> u64 { 60 }

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}
