//! WebRTC PeerConnection construction
//!
//! Builds RTCPeerConnection instances and wraps the SDP and ICE calls the
//! engine workers need, converting between webrtc-rs types and the relay's
//! JSON shapes.

use super::media_track::LocalMedia;
use super::WebRTCError;
use crate::config::{IceServerConfig, WebRTCConfig};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use log::debug;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

/// Creates peer connections with the configured ICE servers
pub struct PeerConnectionFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl PeerConnectionFactory {
    pub fn new(config: &WebRTCConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }

    /// Create a new PeerConnection
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&self.ice_servers),
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    /// Attach the local camera tracks and drain RTCP on their senders
    pub async fn attach_local(
        peer_connection: &Arc<RTCPeerConnection>,
        media: &LocalMedia,
    ) -> Result<(), WebRTCError> {
        for track in media.tracks() {
            let sender = peer_connection
                .add_track(track)
                .await
                .map_err(|e| WebRTCError::MediaError(format!("Failed to add local track: {}", e)))?;

            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    /// Declare receive-only video and audio
    pub async fn add_receive_only(peer_connection: &Arc<RTCPeerConnection>) -> Result<(), WebRTCError> {
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await
                .map_err(|e| WebRTCError::MediaError(format!("Failed to add {} transceiver: {}", kind, e)))?;
        }
        Ok(())
    }

    /// Swap every sending track for the matching track of `media`
    pub async fn replace_tracks(
        peer_connection: &Arc<RTCPeerConnection>,
        media: &LocalMedia,
    ) -> Result<usize, WebRTCError> {
        let mut replaced = 0;
        for sender in peer_connection.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            let replacement: Arc<dyn TrackLocal + Send + Sync> = match current.kind() {
                RTPCodecType::Video => media.video(),
                RTPCodecType::Audio => media.audio(),
                _ => continue,
            };
            sender
                .replace_track(Some(replacement))
                .await
                .map_err(|e| WebRTCError::MediaError(format!("Failed to replace track: {}", e)))?;
            replaced += 1;
        }
        Ok(replaced)
    }

    /// Create an SDP offer and set it as the local description
    pub async fn create_offer(
        peer_connection: &Arc<RTCPeerConnection>,
    ) -> Result<SessionDescription, WebRTCError> {
        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = peer_connection.local_description().await.unwrap_or(offer);
        to_session_description(&local)
    }

    /// Create an SDP answer and set it as the local description
    pub async fn create_answer(
        peer_connection: &Arc<RTCPeerConnection>,
    ) -> Result<SessionDescription, WebRTCError> {
        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

        peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = peer_connection.local_description().await.unwrap_or(answer);
        to_session_description(&local)
    }

    pub async fn set_remote_description(
        peer_connection: &Arc<RTCPeerConnection>,
        description: &SessionDescription,
    ) -> Result<(), WebRTCError> {
        let remote = to_rtc_description(description)?;
        peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    /// Add a trickled ICE candidate
    pub async fn add_ice_candidate(
        peer_connection: &Arc<RTCPeerConnection>,
        candidate: &IceCandidate,
    ) -> Result<(), WebRTCError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))
    }

    /// Close a peer connection
    pub async fn close(peer_connection: &Arc<RTCPeerConnection>) -> Result<(), WebRTCError> {
        peer_connection
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }
}

fn rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

pub fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, WebRTCError> {
    let sdp = description.sdp.clone();
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(WebRTCError::SdpError("Rollback descriptions are not supported".to_string()))
        }
    };
    parsed.map_err(|e| WebRTCError::SdpError(format!("Invalid SDP {:?}: {}", description.sdp_type, e)))
}

pub fn to_session_description(description: &RTCSessionDescription) -> Result<SessionDescription, WebRTCError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            debug!("Unusable local description type {}", other);
            return Err(WebRTCError::SdpError(format!("Unexpected SDP type {}", other)));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}
