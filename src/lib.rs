//! peercam - multi-peer webcam signaling
//!
//! Opens and closes WebRTC camera connections between chat users, with SDP
//! and ICE relayed through the chat server's WebSocket.

pub mod args;
pub mod client;
pub mod config;
pub mod prefs;
pub mod signaling;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use client::Client;
pub use config::{Config, WebRTCConfig};
pub use prefs::{Preference, PreferenceStore};
pub use signaling::{Command, Signaling, SignalingConfig};
pub use transport::{RelayClient, RelayEvent};
pub use crate::webrtc::RtcEngine;
