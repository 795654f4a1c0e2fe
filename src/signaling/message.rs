//! Relay control messages
//!
//! Every frame exchanged with the chat relay is a JSON object carrying an
//! `action` field. SDP and ICE payloads travel as strings holding
//! re-serialized JSON so the relay never reorders their keys.

use super::flags::VideoFlags;
use super::SignalingError;
use serde::{Deserialize, Serialize};

/// Control message exchanged with the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum RelayMessage {
    /// Identify ourselves after connecting
    Login {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jwt: Option<String>,
        #[serde(default)]
        dnd: bool,
    },

    /// Ask to view `username`'s camera; echoed back by some relays
    Open { username: String },

    /// `username` asks to view our camera
    Ring { username: String },

    /// Trickled ICE candidate
    Candidate { username: String, candidate: String },

    /// Offer or answer
    Sdp { username: String, description: String },

    /// Viewer started displaying a stream
    Watch { username: String },

    /// Viewer stopped displaying a stream
    Unwatch { username: String },

    Boot { username: String },

    Unboot { username: String },

    #[serde(rename = "video-invite")]
    VideoInvite { usernames: Vec<String> },

    /// Publish our own camera state
    Me {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default)]
        video: VideoFlags,
        #[serde(default)]
        status: String,
        /// Direct messages closed
        #[serde(default)]
        dnd: bool,
    },

    /// Full presence refresh pushed by the relay
    Who {
        #[serde(rename = "whoList", default)]
        who_list: Vec<WhoEntry>,
    },

    /// Keepalive from the relay
    Ping,

    Error {
        #[serde(default)]
        message: String,
    },

    /// Relay asks us to go away and not reconnect
    Disconnect {
        #[serde(default)]
        message: String,
    },
}

/// One row of the relay's presence list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhoEntry {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub video: VideoFlags,
    #[serde(default)]
    pub dnd: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_at: Option<i64>,
    #[serde(default)]
    pub op: bool,
    #[serde(default)]
    pub vip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(rename = "profileURL", default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

/// SDP kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as produced by the peer-connection engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Trickled ICE candidate in its browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl SessionDescription {
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json)
            .map_err(|e| SignalingError::Protocol(format!("Invalid session description: {}", e)))
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

impl IceCandidate {
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json)
            .map_err(|e| SignalingError::Protocol(format!("Invalid ICE candidate: {}", e)))
    }
}

impl RelayMessage {
    /// Parse a relay frame
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json)
            .map_err(|e| SignalingError::Protocol(format!("Invalid relay message: {}", e)))
    }

    /// Serialize for the wire
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self)
            .map_err(|e| SignalingError::Encode(format!("Failed to serialize message: {}", e)))
    }

    /// Build an `sdp` action, string-encoding the description
    pub fn sdp(username: &str, description: &SessionDescription) -> Result<Self, SignalingError> {
        let description = serde_json::to_string(description)
            .map_err(|e| SignalingError::Encode(format!("Failed to encode description: {}", e)))?;
        Ok(RelayMessage::Sdp {
            username: username.to_string(),
            description,
        })
    }

    /// Build a `candidate` action, string-encoding the candidate
    pub fn candidate(username: &str, candidate: &IceCandidate) -> Result<Self, SignalingError> {
        let candidate = serde_json::to_string(candidate)
            .map_err(|e| SignalingError::Encode(format!("Failed to encode candidate: {}", e)))?;
        Ok(RelayMessage::Candidate {
            username: username.to_string(),
            candidate,
        })
    }

    pub fn open(username: &str) -> Self {
        RelayMessage::Open { username: username.to_string() }
    }

    pub fn watch(username: &str) -> Self {
        RelayMessage::Watch { username: username.to_string() }
    }

    pub fn unwatch(username: &str) -> Self {
        RelayMessage::Unwatch { username: username.to_string() }
    }

    pub fn me(video: VideoFlags, status: &str, dnd: bool) -> Self {
        RelayMessage::Me {
            username: None,
            video,
            status: status.to_string(),
            dnd,
        }
    }

    /// Name of the action, for logging
    pub fn action(&self) -> &'static str {
        match self {
            RelayMessage::Login { .. } => "login",
            RelayMessage::Open { .. } => "open",
            RelayMessage::Ring { .. } => "ring",
            RelayMessage::Candidate { .. } => "candidate",
            RelayMessage::Sdp { .. } => "sdp",
            RelayMessage::Watch { .. } => "watch",
            RelayMessage::Unwatch { .. } => "unwatch",
            RelayMessage::Boot { .. } => "boot",
            RelayMessage::Unboot { .. } => "unboot",
            RelayMessage::VideoInvite { .. } => "video-invite",
            RelayMessage::Me { .. } => "me",
            RelayMessage::Who { .. } => "who",
            RelayMessage::Ping => "ping",
            RelayMessage::Error { .. } => "error",
            RelayMessage::Disconnect { .. } => "disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ring() {
        let msg = RelayMessage::from_json(r#"{"action":"ring","username":"alice"}"#).unwrap();
        assert_eq!(msg, RelayMessage::Ring { username: "alice".into() });
    }

    #[test]
    fn test_sdp_payload_is_string_encoded() {
        let desc = SessionDescription { sdp_type: SdpType::Offer, sdp: "v=0\r\n".into() };
        let msg = RelayMessage::sdp("bob", &desc).unwrap();
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["action"], "sdp");
        let inner = value["description"].as_str().unwrap();
        assert_eq!(inner, r#"{"type":"offer","sdp":"v=0\r\n"}"#);
        assert_eq!(SessionDescription::from_json(inner).unwrap(), desc);
    }

    #[test]
    fn test_candidate_keeps_browser_key_order() {
        let cand = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let RelayMessage::Candidate { candidate, .. } = RelayMessage::candidate("bob", &cand).unwrap() else {
            panic!("Expected Candidate");
        };
        assert!(candidate.starts_with(r#"{"candidate":"#));
        assert!(candidate.contains(r#""sdpMid":"0","sdpMLineIndex":0"#));
    }

    #[test]
    fn test_video_invite_action_name() {
        let msg = RelayMessage::VideoInvite { usernames: vec!["carol".into()] };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""action":"video-invite""#));
        assert_eq!(msg.action(), "video-invite");
    }

    #[test]
    fn test_who_list_rows() {
        let json = r#"{"action":"who","whoList":[
            {"username":"alice","status":"online","video":17,"op":true,"loginAt":1700000000,"profileURL":"/u/alice"},
            {"username":"bob"}
        ]}"#;
        let RelayMessage::Who { who_list } = RelayMessage::from_json(json).unwrap() else {
            panic!("Expected Who");
        };
        assert_eq!(who_list.len(), 2);
        assert!(who_list[0].video.active);
        assert!(who_list[0].video.mutual_required);
        assert!(who_list[0].op);
        assert_eq!(who_list[0].profile_url.as_deref(), Some("/u/alice"));
        assert!(who_list[1].video.is_empty());
    }

    #[test]
    fn test_me_keeps_dnd() {
        let json = RelayMessage::me(VideoFlags::from_bits(1), "away", true).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["action"], "me");
        assert_eq!(value["video"], 1);
        assert_eq!(value["status"], "away");
        assert_eq!(value["dnd"], true);
        assert!(value.get("username").is_none());
    }

    #[test]
    fn test_ping_ignores_extra_fields() {
        let msg = RelayMessage::from_json(r#"{"action":"ping","message":"keepalive"}"#).unwrap();
        assert_eq!(msg, RelayMessage::Ping);
    }

    #[test]
    fn test_unknown_action_is_error() {
        assert!(RelayMessage::from_json(r#"{"action":"react","message":"x"}"#).is_err());
    }
}
