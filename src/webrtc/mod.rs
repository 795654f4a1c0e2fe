//! WebRTC engine
//!
//! Executes the signaling core's engine commands with webrtc-rs:
//! - Peer connection construction and SDP/ICE plumbing
//! - Local camera tracks shared by every answering connection
//! - Inbound track silence detection

pub mod engine;
pub mod media_track;
pub mod peer_connection;

pub use engine::RtcEngine;
pub use media_track::LocalMedia;
pub use peer_connection::PeerConnectionFactory;

use crate::signaling::PeerState;
use std::error::Error;
use std::fmt;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Media track error
    MediaError(String),
    /// No worker for the connection
    SessionNotFound(String),
    /// Command arrived for a connection in the wrong state
    InvalidState(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
            WebRTCError::SessionNotFound(msg) => write!(f, "Session not found: {}", msg),
            WebRTCError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for WebRTCError {}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}
