//! Engine command executor
//!
//! Each connection gets a worker task that runs its commands strictly in
//! order and reports completions as [`EngineEvent`]s. Camera commands are
//! handled inline since they only touch the shared [`LocalMedia`].
//!
//! Camera media comes from an external packetiser (ffmpeg, gstreamer)
//! sending RTP over UDP to the sockets opened by [`RtcEngine::listen_rtp`].

use super::media_track::{track_kind, watch_remote_track, LocalMedia};
use super::peer_connection::PeerConnectionFactory;
use super::WebRTCError;
use crate::config::WebRTCConfig;
use crate::signaling::{ConnId, EngineCommand, EngineEvent, IceCandidate, MediaPlan, TrackKind};
use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

type SharedMedia = Arc<RwLock<Option<Arc<LocalMedia>>>>;

/// Runs engine commands against webrtc-rs peer connections
pub struct RtcEngine {
    factory: Arc<PeerConnectionFactory>,
    local: SharedMedia,
    workers: HashMap<ConnId, mpsc::UnboundedSender<EngineCommand>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    track_silence: Duration,
}

impl RtcEngine {
    pub fn new(config: &WebRTCConfig, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            factory: Arc::new(PeerConnectionFactory::new(config)),
            local: Arc::new(RwLock::new(None)),
            workers: HashMap::new(),
            events,
            track_silence: Duration::from_millis(config.track_silence_ms),
        }
    }

    /// Tracks the media source should write into
    pub fn local_media(&self) -> Option<Arc<LocalMedia>> {
        self.local.read().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.workers.len()
    }

    /// Forward RTP datagrams received on `addr` into the camera track of
    /// `kind`. Packets arriving while the camera is off are dropped.
    pub async fn listen_rtp(&self, addr: &str, kind: TrackKind) -> Result<SocketAddr, WebRTCError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to bind RTP socket {}: {}", addr, e)))?;
        let bound = socket
            .local_addr()
            .map_err(|e| WebRTCError::MediaError(format!("Failed to read RTP socket address: {}", e)))?;
        info!("Listening for {:?} RTP on {}", kind, bound);
        tokio::spawn(forward_rtp(socket, kind, self.local.clone()));
        Ok(bound)
    }

    pub fn dispatch(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::AcquireCamera => {
                let microphone = self.local_media().map(|m| m.microphone_enabled()).unwrap_or(true);
                let media = Arc::new(LocalMedia::new(microphone));
                let stream = media.stream_id().clone();
                *self.local.write() = Some(media);
                info!("Local camera ready as {}", stream.0);
                let _ = self.events.send(EngineEvent::CameraReady { stream });
            }
            EngineCommand::ReleaseCamera => {
                if let Some(media) = self.local.write().take() {
                    info!("Released local camera {}", media.stream_id().0);
                }
            }
            EngineCommand::SetMicrophone { enabled } => match self.local_media() {
                Some(media) => media.set_microphone(enabled),
                None => debug!("Microphone toggled without a camera"),
            },
            EngineCommand::Create { conn, username, role, media } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = ConnectionWorker {
                    conn,
                    username: username.clone(),
                    factory: self.factory.clone(),
                    local: self.local.clone(),
                    events: self.events.clone(),
                    track_silence: self.track_silence,
                    peer_connection: None,
                };
                let _ = tx.send(EngineCommand::Create { conn, username, role, media });
                self.workers.insert(conn, tx);
                tokio::spawn(worker.run(rx));
            }
            other => {
                let Some(conn) = target(&other) else { return };
                let closing = matches!(other, EngineCommand::Close { .. });
                let delivered = match self.workers.get(&conn) {
                    Some(worker) => worker.send(other).is_ok(),
                    None => false,
                };
                if !delivered {
                    debug!("{}", WebRTCError::SessionNotFound(conn.to_string()));
                }
                if closing || !delivered {
                    self.workers.remove(&conn);
                }
            }
        }
    }

    /// Close every connection and release the camera
    pub fn shutdown(&mut self) {
        for (conn, worker) in self.workers.drain() {
            let _ = worker.send(EngineCommand::Close { conn });
        }
        self.local.write().take();
    }
}

async fn forward_rtp(socket: UdpSocket, kind: TrackKind, local: SharedMedia) {
    let mut buf = vec![0u8; 1500];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("{:?} RTP ingest stopped: {}", kind, e);
                return;
            }
        };
        let current = local.read().clone();
        let Some(media) = current else { continue };
        let written = match kind {
            TrackKind::Video => media.write_video_rtp(&buf[..n]).await,
            TrackKind::Audio => media.write_audio_rtp(&buf[..n]).await,
        };
        if let Err(e) = written {
            trace!("{}", e);
        }
    }
}

fn target(command: &EngineCommand) -> Option<ConnId> {
    match command {
        EngineCommand::Create { conn, .. }
        | EngineCommand::CreateOffer { conn }
        | EngineCommand::SetRemoteDescription { conn, .. }
        | EngineCommand::CreateAnswer { conn }
        | EngineCommand::AddIceCandidate { conn, .. }
        | EngineCommand::ReplaceTracks { conn }
        | EngineCommand::Close { conn } => Some(*conn),
        EngineCommand::AcquireCamera | EngineCommand::ReleaseCamera | EngineCommand::SetMicrophone { .. } => None,
    }
}

struct ConnectionWorker {
    conn: ConnId,
    username: String,
    factory: Arc<PeerConnectionFactory>,
    local: SharedMedia,
    events: mpsc::UnboundedSender<EngineEvent>,
    track_silence: Duration,
    peer_connection: Option<Arc<RTCPeerConnection>>,
}

impl ConnectionWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = commands.recv().await {
            let closing = matches!(command, EngineCommand::Close { .. });
            if let Err(e) = self.execute(command).await {
                warn!("{} with {}: {}", self.conn, self.username, e);
                let _ = self.events.send(EngineEvent::Failed {
                    conn: self.conn,
                    error: e.to_string(),
                });
            }
            if closing {
                break;
            }
        }

        if let Some(pc) = self.peer_connection.take() {
            if let Err(e) = PeerConnectionFactory::close(&pc).await {
                debug!("{}: {}", self.conn, e);
            }
        }
        debug!("{} worker for {} finished", self.conn, self.username);
    }

    async fn execute(&mut self, command: EngineCommand) -> Result<(), WebRTCError> {
        let conn = self.conn;
        match command {
            EngineCommand::Create { media, role, .. } => {
                if self.peer_connection.is_some() {
                    return Err(WebRTCError::InvalidState(format!("{} already created", conn)));
                }
                let pc = self.factory.create_peer_connection().await?;
                self.install_callbacks(&pc);
                self.peer_connection = Some(pc.clone());
                debug!("{} created as {:?} for {} with {:?}", conn, role, self.username, media);

                match media {
                    MediaPlan::SendLocal => {
                        let local = self.local.read().clone();
                        let media = local.ok_or_else(|| WebRTCError::MediaError("Camera is not running".to_string()))?;
                        PeerConnectionFactory::attach_local(&pc, &media).await?;
                    }
                    MediaPlan::ReceiveOnly => PeerConnectionFactory::add_receive_only(&pc).await?,
                    MediaPlan::None => {}
                }
            }
            EngineCommand::CreateOffer { .. } => {
                let description = PeerConnectionFactory::create_offer(self.connection()?).await?;
                let _ = self.events.send(EngineEvent::LocalDescription { conn, description });
            }
            EngineCommand::CreateAnswer { .. } => {
                let description = PeerConnectionFactory::create_answer(self.connection()?).await?;
                let _ = self.events.send(EngineEvent::LocalDescription { conn, description });
            }
            EngineCommand::SetRemoteDescription { description, .. } => {
                PeerConnectionFactory::set_remote_description(self.connection()?, &description).await?;
                let _ = self.events.send(EngineEvent::RemoteDescriptionApplied {
                    conn,
                    is_offer: description.is_offer(),
                });
            }
            EngineCommand::AddIceCandidate { candidate, .. } => {
                PeerConnectionFactory::add_ice_candidate(self.connection()?, &candidate).await?;
            }
            EngineCommand::ReplaceTracks { .. } => {
                let local = self.local.read().clone();
                let media = local.ok_or_else(|| WebRTCError::MediaError("Camera is not running".to_string()))?;
                let replaced = PeerConnectionFactory::replace_tracks(self.connection()?, &media).await?;
                debug!("{} switched {} tracks to {}", conn, replaced, media.stream_id().0);
            }
            EngineCommand::Close { .. } => {
                if let Some(pc) = self.peer_connection.take() {
                    PeerConnectionFactory::close(&pc).await?;
                }
            }
            EngineCommand::AcquireCamera | EngineCommand::ReleaseCamera | EngineCommand::SetMicrophone { .. } => {
                return Err(WebRTCError::InvalidState("camera command routed to a connection".to_string()));
            }
        }
        Ok(())
    }

    fn connection(&self) -> Result<&Arc<RTCPeerConnection>, WebRTCError> {
        self.peer_connection
            .as_ref()
            .ok_or_else(|| WebRTCError::InvalidState(format!("{} has no peer connection", self.conn)))
    }

    fn install_callbacks(&self, pc: &Arc<RTCPeerConnection>) {
        let conn = self.conn;

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(EngineEvent::IceCandidate {
                            conn,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        });
                    }
                    Err(e) => warn!("{}: failed to serialize ICE candidate: {}", conn, e),
                }
            })
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                debug!("{} connection state {}", conn, state);
                let _ = events.send(EngineEvent::ConnectionState {
                    conn,
                    state: state.into(),
                });
            })
        }));

        let events = self.events.clone();
        let silence = self.track_silence;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                let Some(kind) = track_kind(track.kind()) else { return };
                let _ = events.send(EngineEvent::Track {
                    conn,
                    stream_id: track.stream_id().to_string(),
                    kind,
                });
                tokio::spawn(watch_remote_track(conn, track, silence, events));
            })
        }));
    }
}
