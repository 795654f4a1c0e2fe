//! Webcam signaling core
//!
//! Decides when peer connections are opened and closed, routes SDP and
//! ICE through the relay, and keeps viewing policy consistent. The core is
//! sans-IO: [`Signaling`] consumes [`Input`]s and produces [`Output`]s,
//! and a driver performs the actual relay and engine work.

pub mod camera;
pub mod flags;
pub mod health;
pub mod machine;
pub mod message;
pub mod policy;
pub mod rate_limit;
pub mod registry;

pub use camera::{LocalCamera, LocalStreamId};
pub use flags::VideoFlags;
pub use machine::{
    Command, EngineCommand, EngineEvent, Input, MediaPlan, Notice, Output, PeerState, Signaling,
    SignalingConfig, TrackKind,
};
pub use message::{IceCandidate, RelayMessage, SdpType, SessionDescription, WhoEntry};
pub use registry::{ConnId, PeerRegistry, PeerSession, Relationship, Role, RoleState};

use std::error::Error;
use std::fmt;

/// Signaling-related errors
#[derive(Debug)]
pub enum SignalingError {
    /// Inbound frame could not be understood
    Protocol(String),
    /// Outbound frame could not be produced
    Encode(String),
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SignalingError::Encode(msg) => write!(f, "Encode error: {}", msg),
        }
    }
}

impl Error for SignalingError {}
