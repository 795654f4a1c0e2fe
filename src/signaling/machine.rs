//! Signaling state machine
//!
//! Sans-IO: the driver feeds inputs stamped with the current time and
//! drains outputs until [`Signaling::poll_output`] returns `None`. Work
//! that suspends (camera access, SDP generation, applying descriptions) is
//! requested as an [`EngineCommand`]; its completion comes back as an
//! [`EngineEvent`] tagged with the [`ConnId`] it was launched for, and is
//! dropped if that connection is no longer current.

use super::camera::{LocalCamera, LocalStreamId, ViewerPrefs};
use super::flags::VideoFlags;
use super::health::{HealthEvent, HealthTimings};
use super::message::{IceCandidate, RelayMessage, SessionDescription, WhoEntry};
use super::policy::{self, Denial, Target, Viewer};
use super::rate_limit::BootRateLimiter;
use super::registry::{ConnId, Effect, PeerRegistry, RemoteStream, Role, RoleState};
use crate::prefs::Preference;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Tunables for the state machine
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Our own username on the relay
    pub username: String,
    /// Presence status published with `me`
    pub status: String,
    /// Do-not-disturb flag republished with `me`
    pub dnd: bool,
    pub open_timeout: Duration,
    pub open_debounce: Duration,
    pub health: HealthTimings,
    /// Relay allows explicit cameras
    pub permit_nsfw: bool,
    pub is_vip: bool,
    pub is_operator: bool,
    /// Moderation rule: may not open cameras
    pub no_video: bool,
    pub max_free_boots: u32,
    pub boot_cooldown: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            status: "online".to_string(),
            dnd: false,
            open_timeout: Duration::from_secs(10),
            open_debounce: Duration::from_secs(5),
            health: HealthTimings::default(),
            permit_nsfw: true,
            is_vip: false,
            is_operator: false,
            no_video: false,
            max_free_boots: 10,
            boot_cooldown: Duration::from_secs(60),
        }
    }
}

/// Local user actions
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenVideo { username: String },
    /// Close a viewed camera on purpose; remembered against auto-reopen
    CloseVideo { username: String },
    CloseOpenVideos,
    Boot { username: String },
    Unboot { username: String },
    SetUserMuted { username: String, muted: bool },
    InviteVideo { username: String },
    StartCamera,
    ChangeCamera,
    StopCamera,
    ToggleMicrophone,
    SetPreference { pref: Preference, value: bool },
    /// Toggle a viewed peer's audio locally
    ToggleMuteVideo { username: String },
    MuteAllVideos,
    TogglePopOut { username: String },
    Sweep,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Relay(RelayMessage),
    Engine(EngineEvent),
    RelayConnected,
    RelayDisconnected,
    Timeout,
}

/// What the connection should carry when created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaPlan {
    /// Attach the local camera tracks
    SendLocal,
    /// Declare receive-only audio and video
    ReceiveOnly,
    None,
}

/// Work for the peer-connection engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Create { conn: ConnId, username: String, role: Role, media: MediaPlan },
    CreateOffer { conn: ConnId },
    SetRemoteDescription { conn: ConnId, description: SessionDescription },
    CreateAnswer { conn: ConnId },
    AddIceCandidate { conn: ConnId, candidate: IceCandidate },
    /// Swap the local camera tracks on an existing connection
    ReplaceTracks { conn: ConnId },
    Close { conn: ConnId },
    AcquireCamera,
    ReleaseCamera,
    SetMicrophone { enabled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Coarse connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Completions and callbacks from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalDescription { conn: ConnId, description: SessionDescription },
    RemoteDescriptionApplied { conn: ConnId, is_offer: bool },
    IceCandidate { conn: ConnId, candidate: IceCandidate },
    Track { conn: ConnId, stream_id: String, kind: TrackKind },
    TrackMuted { conn: ConnId },
    TrackUnmuted { conn: ConnId },
    ConnectionState { conn: ConnId, state: PeerState },
    Failed { conn: ConnId, error: String },
    CameraReady { stream: LocalStreamId },
    CameraFailed { error: String },
}

/// User-facing reports
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    CannotOpenSelf,
    OpenDenied { username: String, reason: Denial },
    OpenDebounced { username: String },
    OpenTimedOut { username: String },
    StreamStarted { username: String },
    StreamFrozen { username: String },
    ViewerJoined { username: String },
    ViewerLeft { username: String },
    NegotiationFailed { username: String, error: String },
    BootRateLimited { username: String, wait: Duration },
    Booted { username: String },
    Unbooted { username: String },
    CameraStarted,
    CameraStopped,
    CameraFailed { error: String },
    RelayError { message: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::CannotOpenSelf => write!(f, "You can't open your own webcam"),
            Notice::OpenDenied { username, reason } => write!(f, "Can't open {}'s camera: {}", username, reason),
            Notice::OpenDebounced { username } => {
                write!(f, "Already opening {}'s camera, please wait a moment", username)
            }
            Notice::OpenTimedOut { username } => write!(f, "There was an error opening {}'s camera.", username),
            Notice::StreamStarted { username } => write!(f, "Now watching {}", username),
            Notice::StreamFrozen { username } => write!(f, "{}'s video appears to be frozen", username),
            Notice::ViewerJoined { username } => write!(f, "{} is now watching your camera", username),
            Notice::ViewerLeft { username } => write!(f, "{} stopped watching your camera", username),
            Notice::NegotiationFailed { username, error } => {
                write!(f, "WebRTC negotiation with {} failed: {}", username, error)
            }
            Notice::BootRateLimited { username, wait } => write!(
                f,
                "You can boot {} from your camera again in {} seconds",
                username,
                wait.as_secs().max(1)
            ),
            Notice::Booted { username } => write!(f, "{} can no longer watch your camera", username),
            Notice::Unbooted { username } => write!(f, "{} may watch your camera again", username),
            Notice::CameraStarted => write!(f, "Your camera is now live"),
            Notice::CameraStopped => write!(f, "Your camera is off"),
            Notice::CameraFailed { error } => write!(f, "Couldn't start your camera: {}", error),
            Notice::RelayError { message } => write!(f, "Relay error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Send(RelayMessage),
    Engine(EngineCommand),
    Notice(Notice),
    /// Persist a preference change
    StorePreference(Preference, bool),
}

pub struct Signaling {
    config: SignalingConfig,
    registry: PeerRegistry,
    camera: LocalCamera,
    prefs: ViewerPrefs,
    directory: HashMap<String, WhoEntry>,
    boot_limiter: BootRateLimiter,
    camera_pending: bool,
    /// Time of the latest input
    last_now: Instant,
    outputs: VecDeque<Output>,
}

impl Signaling {
    pub fn new(config: SignalingConfig) -> Self {
        let boot_limiter = BootRateLimiter::new(config.max_free_boots, config.boot_cooldown);
        Self {
            config,
            registry: PeerRegistry::new(),
            camera: LocalCamera::default(),
            prefs: ViewerPrefs::default(),
            directory: HashMap::new(),
            boot_limiter,
            camera_pending: false,
            last_now: Instant::now(),
            outputs: VecDeque::new(),
        }
    }

    /// Seed stored preferences before the first input.
    pub fn load_preferences(&mut self, stored: impl IntoIterator<Item = (Preference, bool)>) {
        for (pref, value) in stored {
            if !self.camera.apply(pref, value) {
                self.prefs.apply(pref, value);
            }
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn camera(&self) -> &LocalCamera {
        &self.camera
    }

    pub fn directory(&self) -> &HashMap<String, WhoEntry> {
        &self.directory
    }

    pub fn is_frozen(&self, username: &str) -> bool {
        self.registry
            .get(username)
            .is_some_and(|s| s.health.is_frozen())
    }

    /// Flags we publish in `me`
    pub fn my_video_flags(&self) -> VideoFlags {
        self.camera.video_flags(self.config.permit_nsfw, self.config.is_vip)
    }

    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// Earliest instant at which [`Input::Timeout`] has work to do
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.registry.poll_timeout()
    }

    pub fn handle_input(&mut self, now: Instant, input: Input) {
        self.last_now = now;
        match input {
            Input::Command(command) => self.handle_command(now, command),
            Input::Relay(message) => self.handle_relay(now, message),
            Input::Engine(event) => self.handle_engine(now, event),
            Input::RelayConnected => self.on_relay_connected(),
            Input::RelayDisconnected => self.on_relay_disconnected(),
            Input::Timeout => self.handle_timeout(now),
        }
    }

    fn handle_command(&mut self, now: Instant, command: Command) {
        match command {
            Command::OpenVideo { username } => self.open_video(now, &username),
            Command::CloseVideo { username } => {
                self.registry.relationship_mut(&username).expressly_closed = true;
                self.close_viewing(&username);
                self.sweep();
            }
            Command::CloseOpenVideos => {
                let open: Vec<String> = self.registry.open_streams().into_iter().map(String::from).collect();
                for username in open {
                    self.close_viewing(&username);
                }
                self.sweep();
            }
            Command::Boot { username } => self.boot(now, &username),
            Command::Unboot { username } => {
                let rel = self.registry.relationship_mut(&username);
                if rel.booted {
                    rel.booted = false;
                    self.send(RelayMessage::Unboot { username: username.clone() });
                    self.notice(Notice::Unbooted { username });
                }
            }
            Command::SetUserMuted { username, muted } => {
                self.registry.relationship_mut(&username).muted = muted;
                if muted {
                    let effects = self.registry.close_all(&username);
                    self.apply(effects);
                }
            }
            Command::InviteVideo { username } => {
                self.registry.relationship_mut(&username).invited = true;
                self.send(RelayMessage::VideoInvite { usernames: vec![username] });
            }
            Command::StartCamera => {
                if self.camera.active || self.camera_pending {
                    debug!("Camera already live or starting");
                    return;
                }
                self.camera_pending = true;
                self.engine(EngineCommand::AcquireCamera);
            }
            Command::ChangeCamera => {
                if !self.camera.active || self.camera_pending {
                    return;
                }
                self.camera_pending = true;
                self.engine(EngineCommand::AcquireCamera);
            }
            Command::StopCamera => self.stop_camera(),
            Command::ToggleMicrophone => {
                if !self.camera.active {
                    return;
                }
                self.camera.muted = !self.camera.muted;
                self.engine(EngineCommand::SetMicrophone { enabled: !self.camera.muted });
                self.send_me();
            }
            Command::SetPreference { pref, value } => self.set_preference(pref, value),
            Command::ToggleMuteVideo { username } => {
                if let Some(session) = self.registry.get_mut(&username) {
                    if session.remote_stream.is_some() {
                        session.muted_locally = !session.muted_locally;
                    }
                }
            }
            Command::MuteAllVideos => {
                for session in self.registry.sessions_mut() {
                    if session.remote_stream.is_some() {
                        session.muted_locally = true;
                    }
                }
            }
            Command::TogglePopOut { username } => {
                if let Some(session) = self.registry.get_mut(&username) {
                    session.popped_out = !session.popped_out;
                }
            }
            Command::Sweep => self.sweep(),
        }
    }

    fn open_video(&mut self, now: Instant, username: &str) {
        if username == self.config.username {
            self.notice(Notice::CannotOpenSelf);
            return;
        }

        let target = self.target(username);
        let rel = self.registry.relationship(username);
        let verdict = if self.config.no_video {
            Err(Denial::NoVideoRule)
        } else if self.config.is_operator {
            policy::check_content(&self.camera, target.flags)
        } else {
            policy::check_viewing(self.viewer(), target, &rel)
        };
        if let Err(reason) = verdict {
            info!("Not opening {}'s camera: {}", username, reason);
            self.notice(Notice::OpenDenied { username: username.to_string(), reason });
            return;
        }

        self.registry.relationship_mut(username).expressly_closed = false;

        let session = self.registry.get_or_create(username);
        if session.open_debounce_until.is_some_and(|until| now < until) {
            self.notice(Notice::OpenDebounced { username: username.to_string() });
            return;
        }
        session.open_debounce_until = Some(now + self.config.open_debounce);
        let reopening = session.offerer.is_some();

        if reopening {
            let effects = self.registry.close_role(username, Role::Offerer, false);
            self.apply(effects);
        }

        self.send(RelayMessage::open(username));
        self.start_offerer(username);
        if let Some(session) = self.registry.get_mut(username) {
            session.open_deadline = Some(now + self.config.open_timeout);
        }
    }

    fn start_offerer(&mut self, username: &str) {
        let flags = self.target(username).flags;
        let rel = self.registry.relationship(username);
        let media = if self.camera.stream.is_some() && policy::should_offer_video_on_create(flags, &self.camera, &rel) {
            MediaPlan::SendLocal
        } else {
            MediaPlan::ReceiveOnly
        };

        let conn = self.registry.start_role(username, Role::Offerer, self.last_now);
        info!("Opening {}'s camera on {} ({:?})", username, conn, media);
        self.engine(EngineCommand::Create {
            conn,
            username: username.to_string(),
            role: Role::Offerer,
            media,
        });
        self.engine(EngineCommand::CreateOffer { conn });
        if let Some(c) = self.registry.get_mut(username).and_then(|s| s.connection_mut(conn)) {
            c.state = RoleState::Negotiating;
        }
    }

    fn start_answerer(&mut self, username: &str) {
        if self.registry.get(username).is_some_and(|s| s.answerer.is_some()) {
            let effects = self.registry.close_role(username, Role::Answerer, false);
            self.apply(effects);
        }

        let media = if self.camera.active && self.camera.stream.is_some() {
            MediaPlan::SendLocal
        } else {
            MediaPlan::None
        };
        let conn = self.registry.start_role(username, Role::Answerer, self.last_now);
        info!("{} asked to watch our camera, answering on {}", username, conn);
        self.engine(EngineCommand::Create {
            conn,
            username: username.to_string(),
            role: Role::Answerer,
            media,
        });
    }

    fn boot(&mut self, now: Instant, username: &str) {
        if self.registry.relationship(username).booted {
            debug!("{} is already booted", username);
            return;
        }
        let watching = self.registry.get(username).is_some_and(|s| s.watching_me);
        if let Err(wait) = self.boot_limiter.try_boot(now, watching) {
            self.notice(Notice::BootRateLimited { username: username.to_string(), wait });
            return;
        }

        self.send(RelayMessage::Boot { username: username.to_string() });
        self.registry.relationship_mut(username).booted = true;
        let effects = self.registry.close_all(username);
        self.apply(effects);
        self.notice(Notice::Booted { username: username.to_string() });
    }

    fn stop_camera(&mut self) {
        if !self.camera.active {
            if self.camera_pending {
                debug!("Camera stopped while starting, cancelling");
                self.camera_pending = false;
                self.engine(EngineCommand::ReleaseCamera);
            }
            return;
        }
        let answering: Vec<String> = self
            .registry
            .sessions()
            .filter(|s| s.answerer.is_some())
            .map(|s| s.username.clone())
            .collect();
        for username in answering {
            let effects = self.registry.close_role(&username, Role::Answerer, false);
            self.apply(effects);
        }

        self.camera.stop();
        self.camera_pending = false;
        self.engine(EngineCommand::ReleaseCamera);
        self.un_mutual_video();
        self.send_me();
        self.sweep();
        self.notice(Notice::CameraStopped);
    }

    fn set_preference(&mut self, pref: Preference, value: bool) {
        let was_explicit = self.camera.nsfw;
        if !self.camera.apply(pref, value) {
            if self.prefs.apply(pref, value) {
                self.outputs.push_back(Output::StorePreference(pref, value));
            }
            return;
        }
        self.outputs.push_back(Output::StorePreference(pref, value));
        if pref == Preference::NonExplicit && value && was_explicit {
            self.outputs.push_back(Output::StorePreference(Preference::Explicit, false));
        }

        if self.camera.active {
            self.send_me();
        }
        match pref {
            Preference::Explicit | Preference::NonExplicit => self.un_watch_non_explicit(),
            Preference::VipOnly => self.close_disallowed_peers(),
            _ => {}
        }
    }

    fn handle_relay(&mut self, now: Instant, message: RelayMessage) {
        match message {
            RelayMessage::Ring { username } => self.start_answerer(&username),
            RelayMessage::Open { username } => {
                if self.registry.get(&username).is_some_and(|s| s.offerer.is_some()) {
                    debug!("Open echo for {}, offer already under way", username);
                } else {
                    self.start_offerer(&username);
                }
            }
            RelayMessage::Sdp { username, description } => self.on_sdp(&username, &description),
            RelayMessage::Candidate { username, candidate } => self.on_candidate(&username, &candidate),
            RelayMessage::Watch { username } => {
                if self.is_booted_admin(&username) {
                    debug!("Ignoring watch from booted admin {}", username);
                    return;
                }
                let session = self.registry.get_or_create(&username);
                if !session.watching_me {
                    session.watching_me = true;
                    self.notice(Notice::ViewerJoined { username });
                }
            }
            RelayMessage::Unwatch { username } => {
                if let Some(session) = self.registry.get_mut(&username) {
                    if session.watching_me {
                        session.watching_me = false;
                        self.notice(Notice::ViewerLeft { username });
                    }
                }
                self.sweep();
            }
            RelayMessage::Who { who_list } => self.on_who(now, who_list),
            RelayMessage::Error { message } => self.notice(Notice::RelayError { message }),
            other => debug!("Ignoring relay action {}", other.action()),
        }
    }

    fn on_sdp(&mut self, username: &str, description: &str) {
        let Some(conn) = self.registry.get_mut(username).and_then(|s| s.connecting_mut()) else {
            debug!("Dropping SDP from {}: no connection in progress", username);
            return;
        };
        let description = match SessionDescription::from_json(description) {
            Ok(d) => d,
            Err(e) => {
                warn!("Bad SDP from {}: {}", username, e);
                return;
            }
        };
        if conn.state == RoleState::Connecting {
            conn.state = RoleState::Negotiating;
        }
        let conn = conn.id;
        self.engine(EngineCommand::SetRemoteDescription { conn, description });
    }

    fn on_candidate(&mut self, username: &str, candidate: &str) {
        let Some(conn) = self.registry.get_mut(username).and_then(|s| s.connecting_mut()) else {
            debug!("Dropping ICE candidate from {}: no connection in progress", username);
            return;
        };
        let candidate = match IceCandidate::from_json(candidate) {
            Ok(c) => c,
            Err(e) => {
                warn!("Bad ICE candidate from {}: {}", username, e);
                return;
            }
        };
        if conn.remote_description_set {
            let conn = conn.id;
            self.engine(EngineCommand::AddIceCandidate { conn, candidate });
        } else {
            conn.pending_candidates.push(candidate);
        }
    }

    fn on_who(&mut self, _now: Instant, who_list: Vec<WhoEntry>) {
        let previous: HashSet<String> = self.directory.keys().cloned().collect();
        self.directory = who_list
            .into_iter()
            .map(|entry| (entry.username.clone(), entry))
            .collect();

        for username in self.registry.usernames() {
            match self.directory.get(&username) {
                None if previous.contains(&username) => {
                    info!("{} left, closing their connections", username);
                    let effects = self.registry.close_all(&username);
                    self.apply(effects);
                }
                Some(entry) if !entry.video.active => {
                    if self.registry.get(&username).is_some_and(|s| s.remote_stream.is_some()) {
                        self.close_viewing(&username);
                    }
                }
                _ => {}
            }
        }

        self.un_mutual_video();

        if self.camera.active {
            let forgotten = self
                .directory
                .get(&self.config.username)
                .is_some_and(|me| !me.video.active);
            if forgotten {
                debug!("Relay lost our camera state, re-sending");
                self.send_me();
            }
        }
        self.sweep();
    }

    fn handle_engine(&mut self, now: Instant, event: EngineEvent) {
        match event {
            EngineEvent::CameraReady { stream } => self.on_camera_ready(stream),
            EngineEvent::CameraFailed { error } => {
                self.camera_pending = false;
                warn!("Camera acquisition failed: {}", error);
                self.notice(Notice::CameraFailed { error });
            }
            EngineEvent::LocalDescription { conn, description } => {
                let Some(username) = self.current(conn) else { return };
                match RelayMessage::sdp(&username, &description) {
                    Ok(msg) => self.send(msg),
                    Err(e) => warn!("Failed to encode SDP for {}: {}", username, e),
                }
            }
            EngineEvent::IceCandidate { conn, candidate } => {
                let Some(username) = self.current(conn) else { return };
                match RelayMessage::candidate(&username, &candidate) {
                    Ok(msg) => self.send(msg),
                    Err(e) => warn!("Failed to encode ICE candidate for {}: {}", username, e),
                }
            }
            EngineEvent::RemoteDescriptionApplied { conn, is_offer } => {
                let Some(username) = self.current(conn) else { return };
                let Some(c) = self.registry.get_mut(&username).and_then(|s| s.connection_mut(conn)) else {
                    return;
                };
                c.remote_description_set = true;
                let pending = std::mem::take(&mut c.pending_candidates);
                for candidate in pending {
                    self.engine(EngineCommand::AddIceCandidate { conn, candidate });
                }
                if is_offer {
                    self.engine(EngineCommand::CreateAnswer { conn });
                }
            }
            EngineEvent::Track { conn, stream_id, kind } => self.on_track(now, conn, stream_id, kind),
            EngineEvent::TrackMuted { conn } => {
                let timings = self.config.health;
                if let Some(session) = self.stream_session(conn) {
                    session.health.on_mute(now, timings);
                }
            }
            EngineEvent::TrackUnmuted { conn } => {
                if let Some(session) = self.stream_session(conn) {
                    session.health.on_unmute();
                }
            }
            EngineEvent::ConnectionState { conn, state } => {
                let Some(username) = self.current(conn) else { return };
                let Some(c) = self.registry.get_mut(&username).and_then(|s| s.connection_mut(conn)) else {
                    return;
                };
                match state {
                    PeerState::Connected if c.state.is_handshaking() => c.state = RoleState::Connected,
                    PeerState::Failed | PeerState::Closed => {
                        c.state = RoleState::Closed;
                        if state == PeerState::Failed {
                            self.notice(Notice::NegotiationFailed {
                                username,
                                error: "connection failed".to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            EngineEvent::Failed { conn, error } => {
                let Some(username) = self.current(conn) else { return };
                warn!("WebRTC error with {} on {}: {}", username, conn, error);
                self.notice(Notice::NegotiationFailed { username, error });
            }
        }
    }

    fn on_camera_ready(&mut self, stream: LocalStreamId) {
        if !self.camera_pending {
            debug!("Camera became ready after it was cancelled, releasing");
            self.engine(EngineCommand::ReleaseCamera);
            return;
        }
        self.camera_pending = false;
        let switching = self.camera.active;
        self.camera.start(stream);

        if switching {
            let answering: Vec<ConnId> = self
                .registry
                .sessions()
                .filter_map(|s| s.answerer.as_ref().map(|c| c.id))
                .collect();
            for conn in answering {
                self.engine(EngineCommand::ReplaceTracks { conn });
            }
            return;
        }

        self.notice(Notice::CameraStarted);
        self.send_me();
        self.un_watch_non_explicit();
    }

    fn on_track(&mut self, now: Instant, conn: ConnId, stream_id: String, kind: TrackKind) {
        let Some(username) = self.current(conn) else { return };
        let rel = self.registry.relationship(&username);
        let booted_admin = self.is_booted_admin(&username);
        let Some(role) = self.registry.find_connection(conn).map(|(_, role)| role) else {
            return;
        };

        let accept = policy::should_accept_incoming_track(
            role == Role::Offerer,
            self.camera.mutual_open,
            rel.expressly_closed,
            self.prefs.remember_expressly_closed,
            booted_admin,
        );
        if !accept {
            debug!("Ignoring {:?} track from {} on {}", kind, username, conn);
            return;
        }

        let auto_mute = self.prefs.auto_mute;
        let timings = self.config.health;
        let Some(session) = self.registry.get_mut(&username) else { return };
        let first = session.remote_stream.as_ref().map_or(true, |s| s.via != conn);
        if first {
            session.open_deadline = None;
            session.remote_stream = Some(RemoteStream { stream_id, via: conn });
            session.muted_locally = auto_mute;
            if let Some(c) = session.connection_mut(conn) {
                c.state = RoleState::Connected;
            }
        }
        if kind == TrackKind::Video {
            session.health.start(now, timings);
        }

        if first {
            self.send(RelayMessage::watch(&username));
            self.notice(Notice::StreamStarted { username });
        }
    }

    fn handle_timeout(&mut self, now: Instant) {
        let timings = self.config.health;
        let mut notices = Vec::new();
        for session in self.registry.sessions_mut() {
            if session.open_deadline.is_some_and(|d| d <= now) {
                session.open_deadline = None;
                notices.push(Notice::OpenTimedOut { username: session.username.clone() });
            }
            if session.health.handle_timeout(now, timings) == Some(HealthEvent::Frozen) {
                notices.push(Notice::StreamFrozen { username: session.username.clone() });
            }
        }
        for notice in notices {
            self.notice(notice);
        }
    }

    fn on_relay_connected(&mut self) {
        let invited = self.registry.invited();
        if !invited.is_empty() {
            self.send(RelayMessage::VideoInvite { usernames: invited });
        }
        if self.camera.active {
            self.send_me();
        }
    }

    fn on_relay_disconnected(&mut self) {
        info!("Relay connection lost, dropping {} peer sessions", self.registry.len());
        let effects = self.registry.clear();
        for effect in effects {
            if let Effect::CloseConnection(conn) = effect {
                self.engine(EngineCommand::Close { conn });
            }
        }
        self.directory.clear();
    }

    /// Close mutual-required peers we may no longer see with our camera off.
    fn un_mutual_video(&mut self) {
        if self.camera.active {
            return;
        }
        let blocked: Vec<String> = self
            .registry
            .usernames()
            .into_iter()
            .filter(|u| {
                self.directory
                    .get(u)
                    .is_some_and(|e| e.video.mutual_required && !(e.video.active && e.video.invited))
            })
            .collect();
        for username in blocked {
            let effects = self.registry.close_all(&username);
            self.apply(effects);
        }
    }

    /// Stop viewing streams whose explicitness now clashes with ours.
    fn un_watch_non_explicit(&mut self) {
        let clashing: Vec<String> = self
            .registry
            .open_streams()
            .into_iter()
            .filter(|u| policy::check_content(&self.camera, self.target(u).flags).is_err())
            .map(String::from)
            .collect();
        for username in clashing {
            self.close_viewing(&username);
        }
        self.sweep();
    }

    /// Hang up on listed peers the viewing policy no longer allows, such as
    /// mutual-required cameras that cannot see our VIP-only camera.
    fn close_disallowed_peers(&mut self) {
        let denied: Vec<String> = self
            .registry
            .usernames()
            .into_iter()
            .filter(|u| {
                self.directory.contains_key(u)
                    && policy::check_viewing(self.viewer(), self.target(u), &self.registry.relationship(u)).is_err()
            })
            .collect();
        for username in denied {
            info!("Closing {}: viewing no longer allowed", username);
            let effects = self.registry.close_all(&username);
            self.apply(effects);
        }
        self.sweep();
    }

    fn close_viewing(&mut self, username: &str) {
        let effects = self.registry.close_role(username, Role::Offerer, self.camera.mutual_open);
        self.apply(effects);
    }

    fn sweep(&mut self) {
        let admins: HashSet<String> = self
            .registry
            .usernames()
            .into_iter()
            .filter(|u| self.is_booted_admin(u))
            .collect();
        let effects = self
            .registry
            .sweep(self.last_now, self.config.open_timeout, |u| admins.contains(u));
        self.apply(effects);
    }

    /// Username owning `conn`, or `None` if the continuation is stale.
    fn current(&self, conn: ConnId) -> Option<String> {
        match self.registry.find_connection(conn) {
            Some((username, _)) => Some(username.to_string()),
            None => {
                debug!("Dropping event for stale connection {}", conn);
                None
            }
        }
    }

    fn stream_session(&mut self, conn: ConnId) -> Option<&mut super::registry::PeerSession> {
        self.registry
            .sessions_mut()
            .find(|s| s.remote_stream.as_ref().is_some_and(|r| r.via == conn))
    }

    fn is_booted_admin(&self, username: &str) -> bool {
        let op = self.directory.get(username).is_some_and(|e| e.op);
        policy::is_booted_admin(&self.registry.relationship(username), op)
    }

    fn target(&self, username: &str) -> Target {
        self.directory
            .get(username)
            .map(|e| Target { flags: e.video, vip: e.vip })
            .unwrap_or_default()
    }

    fn viewer(&self) -> Viewer<'_> {
        Viewer {
            camera: &self.camera,
            vip: self.config.is_vip,
            no_video: self.config.no_video,
        }
    }

    fn send_me(&mut self) {
        let flags = self.my_video_flags();
        self.send(RelayMessage::me(flags, &self.config.status, self.config.dnd));
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::CloseConnection(conn) => self.engine(EngineCommand::Close { conn }),
                Effect::SendUnwatch(username) => self.send(RelayMessage::unwatch(&username)),
            }
        }
    }

    fn send(&mut self, message: RelayMessage) {
        self.outputs.push_back(Output::Send(message));
    }

    fn engine(&mut self, command: EngineCommand) {
        self.outputs.push_back(Output::Engine(command));
    }

    fn notice(&mut self, notice: Notice) {
        self.outputs.push_back(Output::Notice(notice));
    }
}
