//! Camera tracks and inbound track supervision
//!
//! The local camera is a pair of static RTP tracks fed by an external
//! packetiser. Inbound tracks have no mute events in webrtc-rs, so a reader
//! task turns RTP gaps into [`EngineEvent::TrackMuted`] and
//! [`EngineEvent::TrackUnmuted`].

use super::WebRTCError;
use crate::signaling::{ConnId, EngineEvent, LocalStreamId, TrackKind};
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Local camera and microphone tracks
pub struct LocalMedia {
    stream_id: LocalStreamId,
    video: Arc<TrackLocalStaticRTP>,
    audio: Arc<TrackLocalStaticRTP>,
    microphone: AtomicBool,
}

impl LocalMedia {
    /// Fresh tracks under a new stream id
    pub fn new(microphone: bool) -> Self {
        let stream_id = format!("peercam-{}", uuid::Uuid::new_v4());

        let video = TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", uuid::Uuid::new_v4()),
            stream_id.clone(),
        );

        let audio = TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", uuid::Uuid::new_v4()),
            stream_id.clone(),
        );

        Self {
            stream_id: LocalStreamId(stream_id),
            video: Arc::new(video),
            audio: Arc::new(audio),
            microphone: AtomicBool::new(microphone),
        }
    }

    pub fn stream_id(&self) -> &LocalStreamId {
        &self.stream_id
    }

    pub fn video(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.video.clone()
    }

    pub fn audio(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.audio.clone()
    }

    pub fn tracks(&self) -> [Arc<dyn TrackLocal + Send + Sync>; 2] {
        [self.video(), self.audio()]
    }

    pub fn set_microphone(&self, enabled: bool) {
        self.microphone.store(enabled, Ordering::Relaxed);
    }

    pub fn microphone_enabled(&self) -> bool {
        self.microphone.load(Ordering::Relaxed)
    }

    /// Write one packetised VP8 RTP packet to every attached connection
    pub async fn write_video_rtp(&self, packet: &[u8]) -> Result<(), WebRTCError> {
        self.video
            .write(packet)
            .await
            .map(|_| ())
            .map_err(|e| WebRTCError::MediaError(format!("Failed to write video RTP: {}", e)))
    }

    /// Write one Opus RTP packet; dropped while the microphone is off
    pub async fn write_audio_rtp(&self, packet: &[u8]) -> Result<(), WebRTCError> {
        if !self.microphone_enabled() {
            return Ok(());
        }
        self.audio
            .write(packet)
            .await
            .map(|_| ())
            .map_err(|e| WebRTCError::MediaError(format!("Failed to write audio RTP: {}", e)))
    }
}

pub fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Audio => Some(TrackKind::Audio),
        _ => None,
    }
}

/// Edge detector for RTP flow on one inbound track
#[derive(Debug, Default)]
pub struct SilenceDetector {
    muted: bool,
}

impl SilenceDetector {
    /// A packet arrived; returns true when the track resumes
    pub fn on_packet(&mut self) -> bool {
        std::mem::replace(&mut self.muted, false)
    }

    /// No packet within the threshold; returns true on the first gap
    pub fn on_gap(&mut self) -> bool {
        !std::mem::replace(&mut self.muted, true)
    }
}

/// Read an inbound track until it ends, reporting mute edges for video
pub async fn watch_remote_track(
    conn: ConnId,
    track: Arc<TrackRemote>,
    silence: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let report = track.kind() == RTPCodecType::Video;
    let mut detector = SilenceDetector::default();

    loop {
        match tokio::time::timeout(silence, track.read_rtp()).await {
            Ok(Ok(_)) => {
                if detector.on_packet() && report {
                    trace!("{} video resumed", conn);
                    if events.send(EngineEvent::TrackUnmuted { conn }).is_err() {
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("{} inbound {} track ended: {}", conn, track.kind(), e);
                break;
            }
            Err(_) => {
                if detector.on_gap() && report {
                    trace!("{} video silent for {:?}", conn, silence);
                    if events.send(EngineEvent::TrackMuted { conn }).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_detector_reports_edges_once() {
        let mut detector = SilenceDetector::default();
        assert!(!detector.on_packet());
        assert!(detector.on_gap());
        assert!(!detector.on_gap());
        assert!(detector.on_packet());
        assert!(!detector.on_packet());
    }

    #[test]
    fn local_media_shares_one_stream_id() {
        let media = LocalMedia::new(true);
        let [video, audio] = media.tracks();
        assert_eq!(video.stream_id(), media.stream_id().0);
        assert_eq!(audio.stream_id(), media.stream_id().0);
        assert_eq!(video.kind(), RTPCodecType::Video);
        assert_eq!(audio.kind(), RTPCodecType::Audio);
        assert_ne!(LocalMedia::new(true).stream_id(), media.stream_id());
    }

    #[tokio::test]
    async fn muted_microphone_drops_audio() {
        let media = LocalMedia::new(false);
        assert!(!media.microphone_enabled());
        media.write_audio_rtp(&[0x80, 0x6f, 0, 1]).await.unwrap();
        media.set_microphone(true);
        assert!(media.microphone_enabled());
    }

    #[test]
    fn codec_types_map_to_track_kinds() {
        assert_eq!(track_kind(RTPCodecType::Video), Some(TrackKind::Video));
        assert_eq!(track_kind(RTPCodecType::Unspecified), None);
    }
}
