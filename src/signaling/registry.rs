//! Peer session registry
//!
//! One [`PeerSession`] per remote username holds both directional
//! connections and all per-peer bookkeeping. Relationship decisions
//! (booted, invited, muted, expressly closed) outlive connections and are
//! kept in a separate per-username record.
//!
//! The registry never talks to the engine or the relay itself; closing
//! operations return [`Effect`]s for the state machine to carry out.

use super::health::StreamHealth;
use super::message::IceCandidate;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Identifies one underlying peer connection for its whole life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc#{}", self.0)
    }
}

/// Which direction a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We opened their camera
    Offerer,
    /// They opened ours
    Answerer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

/// Lifecycle of one role. A role with no connection is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Connecting,
    Negotiating,
    Connected,
    Closed,
}

impl RoleState {
    pub fn is_handshaking(&self) -> bool {
        matches!(self, RoleState::Connecting | RoleState::Negotiating)
    }
}

/// Bookkeeping for one underlying peer connection
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub id: ConnId,
    pub role: Role,
    pub state: RoleState,
    pub remote_description_set: bool,
    /// Candidates that arrived before the remote description
    pub pending_candidates: Vec<IceCandidate>,
    pub started_at: Instant,
}

impl PeerConnection {
    fn new(id: ConnId, role: Role, now: Instant) -> Self {
        Self {
            id,
            role,
            state: RoleState::Connecting,
            started_at: now,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }
}

/// Inbound media being displayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    /// Connection carrying it
    pub via: ConnId,
}

#[derive(Debug, Clone)]
pub struct PeerSession {
    pub username: String,
    pub offerer: Option<PeerConnection>,
    pub answerer: Option<PeerConnection>,
    /// Connection currently mid-handshake; candidates and SDP go here
    pub connecting: Option<ConnId>,
    pub remote_stream: Option<RemoteStream>,
    pub muted_locally: bool,
    pub watching_me: bool,
    pub popped_out: bool,
    pub health: StreamHealth,
    /// Watchdog for a pending open
    pub open_deadline: Option<Instant>,
    pub open_debounce_until: Option<Instant>,
}

impl PeerSession {
    fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            offerer: None,
            answerer: None,
            connecting: None,
            remote_stream: None,
            muted_locally: false,
            watching_me: false,
            popped_out: false,
            health: StreamHealth::default(),
            open_deadline: None,
            open_debounce_until: None,
        }
    }

    pub fn role(&self, role: Role) -> Option<&PeerConnection> {
        match role {
            Role::Offerer => self.offerer.as_ref(),
            Role::Answerer => self.answerer.as_ref(),
        }
    }

    pub fn role_mut(&mut self, role: Role) -> &mut Option<PeerConnection> {
        match role {
            Role::Offerer => &mut self.offerer,
            Role::Answerer => &mut self.answerer,
        }
    }

    /// Look up a connection by id, whichever role it holds.
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut PeerConnection> {
        if self.offerer.as_ref().is_some_and(|c| c.id == id) {
            return self.offerer.as_mut();
        }
        if self.answerer.as_ref().is_some_and(|c| c.id == id) {
            return self.answerer.as_mut();
        }
        None
    }

    pub fn connecting_mut(&mut self) -> Option<&mut PeerConnection> {
        let id = self.connecting?;
        self.connection_mut(id)
    }

    pub fn has_connection(&self) -> bool {
        self.offerer.is_some() || self.answerer.is_some()
    }

    /// A connection is still handshaking and has not outlived `grace`.
    fn handshake_pending(&self, now: Instant, grace: Duration) -> bool {
        [&self.offerer, &self.answerer]
            .into_iter()
            .flatten()
            .any(|c| c.state.is_handshaking() && now < c.started_at + grace)
    }

    /// Take a role's connection out, clearing everything that pointed at it.
    fn take_role(&mut self, role: Role) -> Option<ConnId> {
        let conn = self.role_mut(role).take()?;
        if self.connecting == Some(conn.id) {
            self.connecting = None;
        }
        if self.remote_stream.as_ref().is_some_and(|s| s.via == conn.id) {
            self.remote_stream = None;
            self.health.stop();
        }
        Some(conn.id)
    }
}

/// Per-username decisions that outlive connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Relationship {
    /// On our chat mute list
    pub muted: bool,
    /// Revoked from viewing our camera
    pub booted: bool,
    /// Allowed past our mutual-sharing requirement
    pub invited: bool,
    /// We closed their camera ourselves
    pub expressly_closed: bool,
}

/// Side effects requested by registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CloseConnection(ConnId),
    SendUnwatch(String),
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    sessions: HashMap<String, PeerSession>,
    relationships: HashMap<String, Relationship>,
    next_conn: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, username: &str) -> Option<&PeerSession> {
        self.sessions.get(username)
    }

    pub fn get_mut(&mut self, username: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(username)
    }

    pub fn get_or_create(&mut self, username: &str) -> &mut PeerSession {
        self.sessions
            .entry(username.to_string())
            .or_insert_with(|| PeerSession::new(username))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Install a fresh connection in `role`, which must be idle, and mark
    /// it as the one mid-handshake.
    pub fn start_role(&mut self, username: &str, role: Role, now: Instant) -> ConnId {
        self.next_conn += 1;
        let id = ConnId(self.next_conn);
        let session = self.get_or_create(username);
        debug_assert!(session.role(role).is_none(), "role re-entry without close");
        *session.role_mut(role) = Some(PeerConnection::new(id, role, now));
        session.connecting = Some(id);
        id
    }

    /// Find the owner of a connection id. `None` means the connection is stale.
    pub fn find_connection(&self, id: ConnId) -> Option<(&str, Role)> {
        self.sessions.values().find_map(|s| {
            [&s.offerer, &s.answerer]
                .into_iter()
                .flatten()
                .find(|c| c.id == id)
                .map(|c| (s.username.as_str(), c.role))
        })
    }

    pub fn relationship(&self, username: &str) -> Relationship {
        self.relationships.get(username).copied().unwrap_or_default()
    }

    pub fn relationship_mut(&mut self, username: &str) -> &mut Relationship {
        self.relationships.entry(username.to_string()).or_default()
    }

    pub fn invited(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .relationships
            .iter()
            .filter(|(_, r)| r.invited)
            .map(|(u, _)| u.clone())
            .collect();
        names.sort();
        names
    }

    /// Usernames whose streams we are displaying
    pub fn open_streams(&self) -> Vec<&str> {
        self.sessions
            .values()
            .filter(|s| s.remote_stream.is_some())
            .map(|s| s.username.as_str())
            .collect()
    }

    /// Usernames currently watching our camera
    pub fn viewers(&self) -> Vec<&str> {
        self.sessions
            .values()
            .filter(|s| s.watching_me)
            .map(|s| s.username.as_str())
            .collect()
    }

    /// Close one role of a peer.
    ///
    /// Closing the offerer always clears the displayed stream and tells the
    /// relay we stopped watching. With `keep_if_watched` set and the peer
    /// still watching us, the underlying connection stays up and only local
    /// bookkeeping is cleared.
    pub fn close_role(&mut self, username: &str, role: Role, keep_if_watched: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(session) = self.sessions.get_mut(username) else {
            return effects;
        };

        if role == Role::Offerer {
            session.remote_stream = None;
            session.health.stop();
            session.muted_locally = false;
            session.popped_out = false;
            session.open_deadline = None;
        }

        if session.role(role).is_some() {
            if keep_if_watched && session.watching_me {
                debug!("Keeping {} connection with {} open, they still watch us", role, username);
            } else if let Some(id) = session.take_role(role) {
                effects.push(Effect::CloseConnection(id));
            }
        }

        if role == Role::Offerer {
            effects.push(Effect::SendUnwatch(username.to_string()));
        }
        effects
    }

    /// Tear down everything with a peer and drop its entry.
    pub fn close_all(&mut self, username: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(mut session) = self.sessions.remove(username) else {
            return effects;
        };
        for role in [Role::Offerer, Role::Answerer] {
            if let Some(id) = session.take_role(role) {
                effects.push(Effect::CloseConnection(id));
            }
        }
        effects.push(Effect::SendUnwatch(username.to_string()));
        effects
    }

    /// Drop entries that no longer serve anyone.
    ///
    /// A peer is kept while we display its stream, while it watches us,
    /// while it is a booted admin, or while one of its connections started
    /// handshaking less than `handshake_grace` ago. Handshakes older than
    /// that are treated as stuck.
    pub fn sweep(
        &mut self,
        now: Instant,
        handshake_grace: Duration,
        is_booted_admin: impl Fn(&str) -> bool,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let idle: Vec<String> = self
            .sessions
            .values()
            .filter(|s| {
                s.remote_stream.is_none()
                    && !s.watching_me
                    && !s.handshake_pending(now, handshake_grace)
                    && !is_booted_admin(&s.username)
            })
            .map(|s| s.username.clone())
            .collect();

        for username in idle {
            if let Some(mut session) = self.sessions.remove(&username) {
                for role in [Role::Offerer, Role::Answerer] {
                    if let Some(id) = session.take_role(role) {
                        debug!("Sweeping leftover {} connection {} with {}", role, id, username);
                        effects.push(Effect::CloseConnection(id));
                    }
                }
            }
        }
        effects
    }

    /// Forget every session; the signaling channel they relied on is gone.
    pub fn clear(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        for (_, mut session) in self.sessions.drain() {
            for role in [Role::Offerer, Role::Answerer] {
                if let Some(id) = session.take_role(role) {
                    effects.push(Effect::CloseConnection(id));
                }
            }
        }
        effects
    }

    /// Earliest watchdog or health deadline across all peers
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.sessions
            .values()
            .flat_map(|s| [s.open_deadline, s.health.poll_timeout()])
            .flatten()
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(10);

    fn connected(registry: &mut PeerRegistry, username: &str, role: Role) -> ConnId {
        let id = registry.start_role(username, role, Instant::now());
        let session = registry.get_mut(username).unwrap();
        session.connecting = None;
        session.connection_mut(id).unwrap().state = RoleState::Connected;
        id
    }

    #[test]
    fn start_role_tracks_connecting() {
        let mut registry = PeerRegistry::new();
        let id = registry.start_role("alice", Role::Offerer, Instant::now());
        let session = registry.get("alice").unwrap();
        assert_eq!(session.connecting, Some(id));
        assert_eq!(registry.find_connection(id), Some(("alice", Role::Offerer)));
    }

    #[test]
    fn close_offerer_clears_stream_and_unwatches() {
        let mut registry = PeerRegistry::new();
        let id = connected(&mut registry, "alice", Role::Offerer);
        registry.get_mut("alice").unwrap().remote_stream = Some(RemoteStream { stream_id: "s".into(), via: id });

        let effects = registry.close_role("alice", Role::Offerer, false);
        assert_eq!(effects, vec![Effect::CloseConnection(id), Effect::SendUnwatch("alice".into())]);
        let session = registry.get("alice").unwrap();
        assert!(session.offerer.is_none());
        assert!(session.remote_stream.is_none());
        assert!(registry.find_connection(id).is_none());
    }

    #[test]
    fn mutual_open_keeps_connection_while_watched() {
        let mut registry = PeerRegistry::new();
        let id = connected(&mut registry, "bob", Role::Offerer);
        let session = registry.get_mut("bob").unwrap();
        session.watching_me = true;
        session.remote_stream = Some(RemoteStream { stream_id: "s".into(), via: id });

        let effects = registry.close_role("bob", Role::Offerer, true);
        assert_eq!(effects, vec![Effect::SendUnwatch("bob".into())]);
        let session = registry.get("bob").unwrap();
        assert!(session.offerer.is_some());
        assert!(session.remote_stream.is_none());
    }

    #[test]
    fn closing_answerer_drops_stream_it_carried() {
        let mut registry = PeerRegistry::new();
        let id = connected(&mut registry, "carol", Role::Answerer);
        registry.get_mut("carol").unwrap().remote_stream = Some(RemoteStream { stream_id: "s".into(), via: id });

        let effects = registry.close_role("carol", Role::Answerer, false);
        assert_eq!(effects, vec![Effect::CloseConnection(id)]);
        assert!(registry.get("carol").unwrap().remote_stream.is_none());
    }

    #[test]
    fn close_all_removes_entry() {
        let mut registry = PeerRegistry::new();
        let a = connected(&mut registry, "dave", Role::Offerer);
        let b = connected(&mut registry, "dave", Role::Answerer);
        let effects = registry.close_all("dave");
        assert_eq!(
            effects,
            vec![Effect::CloseConnection(a), Effect::CloseConnection(b), Effect::SendUnwatch("dave".into())]
        );
        assert!(registry.get("dave").is_none());
        assert!(registry.close_all("dave").is_empty());
    }

    #[test]
    fn sweep_collects_idle_peers_only() {
        let now = Instant::now();
        let mut registry = PeerRegistry::new();
        let stale = connected(&mut registry, "idle", Role::Answerer);
        connected(&mut registry, "viewer", Role::Answerer);
        registry.get_mut("viewer").unwrap().watching_me = true;
        registry.start_role("pending", Role::Offerer, now);
        connected(&mut registry, "admin", Role::Answerer);

        let effects = registry.sweep(now, GRACE, |u| u == "admin");
        assert_eq!(effects, vec![Effect::CloseConnection(stale)]);
        assert!(registry.get("idle").is_none());
        assert!(registry.get("viewer").is_some());
        assert!(registry.get("pending").is_some());
        assert!(registry.get("admin").is_some());
    }

    #[test]
    fn sweep_collects_stuck_handshakes() {
        let t0 = Instant::now();
        let mut registry = PeerRegistry::new();
        let offer = registry.start_role("bob", Role::Offerer, t0);
        registry.get_mut("bob").unwrap().offerer.as_mut().unwrap().state = RoleState::Negotiating;
        let answer = registry.start_role("alice", Role::Answerer, t0);

        assert!(registry.sweep(t0 + GRACE / 2, GRACE, |_| false).is_empty());
        assert_eq!(registry.len(), 2);

        let mut effects = registry.sweep(t0 + GRACE, GRACE, |_| false);
        effects.sort_by_key(|e| match e {
            Effect::CloseConnection(id) => id.0,
            Effect::SendUnwatch(_) => u64::MAX,
        });
        assert_eq!(effects, vec![Effect::CloseConnection(offer), Effect::CloseConnection(answer)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn relationships_survive_session_removal() {
        let mut registry = PeerRegistry::new();
        connected(&mut registry, "erin", Role::Offerer);
        registry.relationship_mut("erin").booted = true;
        registry.close_all("erin");
        assert!(registry.relationship("erin").booted);
        assert_eq!(registry.relationship("nobody"), Relationship::default());
    }

    #[test]
    fn clear_closes_everything_without_unwatch() {
        let mut registry = PeerRegistry::new();
        let a = connected(&mut registry, "a", Role::Offerer);
        let effects = registry.clear();
        assert_eq!(effects, vec![Effect::CloseConnection(a)]);
        assert!(registry.is_empty());
    }
}
