//! Mesh Session
//!
//! The single context object a process holds for the match it takes part
//! in. It ties the room directory, negotiator, channel protocol,
//! reconciliation engine and liveness tracker together and exposes the
//! consumer-facing API.
//!
//! Links form a star: the host links to every joiner and forwards each
//! joiner's entity traffic to the others, so every participant sees every
//! entity.
//!
//! Nothing here blocks. Transports report into queues and [`MeshSession::tick`]
//! drains them once per simulation tick:
//!
//! 1. signaling envelopes
//! 2. link events (open, frames, closures)
//! 3. due re-negotiations
//! 4. pings and timeouts
//! 5. remote smoothing

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::core::ids::{EntityId, PeerId, RoomCode};
use crate::game::entity::{EntitySnapshot, MAX_FUEL, MAX_HEALTH};
use crate::game::events::{Projectile, SequenceCounter};
use crate::game::map::{MapCatalog, MapDefinition, DEFAULT_MAP_ID};
use crate::game::reconcile::{DamageOutcome, JoinOutcome, Reconciler, ScoreLine};
use crate::game::validate::{IngestLimits, Rejection};
use crate::network::liveness::{Liveness, NetworkStats};
use crate::network::negotiator::{LinkState, NegotiationEffect, Negotiator};
use crate::network::protocol::{ChannelMessage, MAX_CHAT_LEN};
use crate::network::room::{MatchConfig, Profile, Role, RoomDirectory, RoomError};
use crate::network::signaling::{
    Envelope, SignalInbox, SignalKind, SignalPayload, SignalingTransport,
};
use crate::network::transport::{DescriptionKind, DirectTransport};

/// Errors surfaced to the caller of a session operation. Network trouble
/// is never one of them; it arrives as a [`Notice`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Profile, match config or room code rejected.
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// Connectivity notification for the UI.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// The host of the room we are joining announced itself.
    HostReady(PeerId),
    /// A link opened.
    PeerConnected(PeerId),
    /// A peer left the room on purpose.
    PeerLeft(PeerId),
    /// A link dropped; a re-negotiation is scheduled.
    LinkLost {
        /// Peer.
        peer: PeerId,
        /// Cause.
        reason: String,
    },
    /// Re-negotiating with a peer.
    Reconnecting(PeerId),
    /// The signaling medium refused an envelope.
    SignalingUnavailable(String),
}

#[derive(Default)]
struct Listeners {
    peer_joined: Option<Box<dyn FnMut(&EntitySnapshot) + Send>>,
    peer_left: Option<Box<dyn FnMut(&PeerId) + Send>>,
    match_config: Option<Box<dyn FnMut(&MatchConfig) + Send>>,
    chat: Option<Box<dyn FnMut(&str, &str) + Send>>,
    notice: Option<Box<dyn FnMut(&Notice) + Send>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// SESSION
// =============================================================================

/// One process's view of a match.
pub struct MeshSession {
    config: MeshConfig,
    local_id: PeerId,
    signaling: Arc<dyn SignalingTransport>,
    inbox: Option<SignalInbox>,
    negotiator: Negotiator,
    directory: RoomDirectory,
    reconciler: Reconciler,
    catalog: MapCatalog,
    map: MapDefinition,
    host_id: Option<PeerId>,
    match_running: bool,
    liveness: Liveness,
    projectile_seq: SequenceCounter,
    damage_seq: SequenceCounter,
    inbound_projectiles: Vec<Projectile>,
    listeners: Listeners,
}

impl fmt::Debug for MeshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshSession")
            .field("local_id", &self.local_id)
            .field("room", &self.directory.current())
            .field("negotiator", &self.negotiator)
            .field("match_running", &self.match_running)
            .finish_non_exhaustive()
    }
}

impl MeshSession {
    /// Create a session with a fresh local id and the built-in maps.
    pub fn new(
        config: MeshConfig,
        signaling: Arc<dyn SignalingTransport>,
        transport: Arc<dyn DirectTransport>,
    ) -> Self {
        Self::with_catalog(config, signaling, transport, MapCatalog::builtin())
    }

    /// Create a session loading maps from `catalog`.
    pub fn with_catalog(
        config: MeshConfig,
        signaling: Arc<dyn SignalingTransport>,
        transport: Arc<dyn DirectTransport>,
        catalog: MapCatalog,
    ) -> Self {
        let local_id = PeerId::generate();
        let map = catalog.get(DEFAULT_MAP_ID).clone();
        let limits = IngestLimits {
            bounds: map.bounds,
            max_entity_speed: config.max_entity_speed,
            max_projectile_speed: config.max_projectile_speed,
        };
        info!(peer = %local_id.short(), "session created");

        Self {
            negotiator: Negotiator::new(local_id.clone(), transport, &config),
            reconciler: Reconciler::new(limits, config.smoothing, config.stale_after),
            liveness: Liveness::new(config.ping_interval),
            config,
            local_id,
            signaling,
            inbox: None,
            directory: RoomDirectory::new(),
            catalog,
            map,
            host_id: None,
            match_running: false,
            projectile_seq: SequenceCounter::default(),
            damage_seq: SequenceCounter::default(),
            inbound_projectiles: Vec::new(),
            listeners: Listeners::default(),
        }
    }

    // =========================================================================
    // ROOM DIRECTORY
    // =========================================================================

    /// Create a room as host and start the match right away.
    pub fn create_room(
        &mut self,
        profile: &Profile,
        match_config: MatchConfig,
    ) -> Result<RoomCode, SessionError> {
        profile.validate()?;
        match_config.validate()?;
        self.disconnect();

        let match_config = match_config.started_at(now_ms());
        let code = self
            .directory
            .create(profile, match_config.clone(), &mut rand::thread_rng())?
            .code
            .clone();
        info!(room = %code, map = %match_config.map_id, "room created");

        self.inbox = Some(self.signaling.subscribe());
        self.publish(Envelope::broadcast(SignalKind::HostReady, code.clone(), self.local_id.clone()));
        self.start_match(match_config);
        Ok(code)
    }

    /// Join an existing room. The match starts once the host's settings
    /// arrive.
    pub fn join_room(&mut self, code: &str, profile: &Profile) -> Result<(), SessionError> {
        RoomCode::parse(code).map_err(RoomError::from)?;
        profile.validate()?;
        self.disconnect();
        let room_code = self.directory.join(code, profile)?.code.clone();
        info!(room = %room_code, "joining room");

        self.inbox = Some(self.signaling.subscribe());
        self.publish(Envelope::broadcast(SignalKind::JoinRequest, room_code, self.local_id.clone()));
        Ok(())
    }

    /// Leave the room: close every link, announce the departure and drop all
    /// session state.
    pub fn disconnect(&mut self) {
        let Some(code) = self.directory.code().cloned() else {
            return;
        };
        info!(room = %code, "leaving room");
        self.publish(Envelope::broadcast(SignalKind::LeaveRoom, code, self.local_id.clone()));
        self.negotiator.teardown();

        for view in self.reconciler.remote_views() {
            self.emit_peer_left(&view.id);
        }
        self.reconciler.reset();
        self.liveness.reset();
        self.directory.leave();
        self.inbox = None;
        self.host_id = None;
        self.match_running = false;
        self.inbound_projectiles.clear();
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Process everything that arrived since the last tick.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// [`tick`](Self::tick) with an explicit clock.
    pub fn tick_at(&mut self, now: Instant) {
        let envelopes: Vec<Envelope> = match self.inbox.as_mut() {
            Some(inbox) => std::iter::from_fn(|| inbox.try_next()).collect(),
            None => Vec::new(),
        };
        for envelope in envelopes {
            self.handle_envelope(envelope, now);
        }

        while let Some(event) = self.negotiator.poll_event() {
            let effects = self.negotiator.handle_event(event, now);
            self.apply_effects(effects, now);
        }

        for peer in self.negotiator.due_retries(now) {
            self.renegotiate(&peer, now);
        }

        if !self.negotiator.open_peers().is_empty() {
            if let Some(timestamp) = self.liveness.due(now) {
                self.broadcast(&ChannelMessage::Ping { timestamp });
            }
        }

        let expired = self.negotiator.expire(now);
        self.apply_effects(expired, now);

        self.reconciler.step(now);
    }

    fn handle_envelope(&mut self, envelope: Envelope, now: Instant) {
        let Some(room) = self.directory.current() else {
            return;
        };
        if !envelope.is_for(&self.local_id, &room.code) {
            return;
        }
        let role = room.role;
        let from = envelope.from_id.clone();
        debug!(from = %from.short(), kind = ?envelope.kind, "signal");

        match envelope.kind {
            SignalKind::HostReady => {
                if role == Role::Joiner {
                    self.emit_notice(Notice::HostReady(from));
                }
            }
            SignalKind::JoinRequest => {
                if role == Role::Host {
                    let effects = self.negotiator.offer_to(&from, now);
                    self.apply_effects(effects, now);
                }
            }
            SignalKind::Offer => {
                let Some(offer) = envelope.description() else {
                    return;
                };
                if role == Role::Joiner && offer.kind == DescriptionKind::Offer {
                    self.host_id = Some(from.clone());
                    let effects = self.negotiator.accept_offer(&from, offer, now);
                    self.apply_effects(effects, now);
                }
            }
            SignalKind::Answer => {
                if let Some(answer) = envelope.description() {
                    if role == Role::Host && answer.kind == DescriptionKind::Answer {
                        self.negotiator.accept_answer(&from, answer, now);
                    }
                }
            }
            SignalKind::IceCandidate => {
                if let Some(candidate) = envelope.candidate() {
                    self.negotiator.add_candidate(&from, candidate.clone(), now);
                }
            }
            SignalKind::LeaveRoom => self.drop_peer(&from),
        }
    }

    fn apply_effects(&mut self, effects: Vec<NegotiationEffect>, now: Instant) {
        for effect in effects {
            match effect {
                NegotiationEffect::SendOffer { peer, offer } => {
                    self.publish_directed(SignalKind::Offer, peer, SignalPayload::Description(offer));
                }
                NegotiationEffect::SendAnswer { peer, answer } => {
                    self.publish_directed(SignalKind::Answer, peer, SignalPayload::Description(answer));
                }
                NegotiationEffect::SendCandidate { peer, candidate } => {
                    self.publish_directed(SignalKind::IceCandidate, peer, SignalPayload::Candidate(candidate));
                }
                NegotiationEffect::Opened { peer } => self.on_link_open(&peer),
                NegotiationEffect::Inbound { peer, text } => self.handle_channel(&peer, &text, now),
                NegotiationEffect::Lost { peer, reason, .. } => {
                    self.remove_entities_via(&peer);
                    self.emit_notice(Notice::LinkLost { peer, reason });
                }
            }
        }
    }

    fn renegotiate(&mut self, peer: &PeerId, now: Instant) {
        let Some(room) = self.directory.current() else {
            return;
        };
        let (role, code) = (room.role, room.code.clone());
        info!(peer = %peer.short(), "re-negotiating");
        self.emit_notice(Notice::Reconnecting(peer.clone()));
        match role {
            Role::Host => {
                let effects = self.negotiator.offer_to(peer, now);
                self.apply_effects(effects, now);
            }
            Role::Joiner => {
                self.publish(Envelope::broadcast(SignalKind::JoinRequest, code, self.local_id.clone()));
            }
        }
    }

    /// A peer announced it is leaving: remove it for good.
    fn drop_peer(&mut self, peer: &PeerId) {
        let had_link = self.negotiator.remove(peer);
        let had_entity = self.remove_entities_via(peer);
        if had_link || had_entity {
            info!(peer = %peer.short(), "peer left");
            self.emit_notice(Notice::PeerLeft(peer.clone()));
        }
    }

    /// Drop the entities that reached us over `peer`'s link. For a joiner
    /// that is every remote entity once the host is gone.
    fn remove_entities_via(&mut self, peer: &PeerId) -> bool {
        if self.host_id.as_ref() != Some(peer) {
            return self.remove_entity(peer);
        }
        let mut removed = false;
        for view in self.reconciler.remote_views() {
            removed |= self.remove_entity(&view.id);
        }
        removed
    }

    fn remove_entity(&mut self, peer: &PeerId) -> bool {
        self.liveness.forget(peer);
        if self.reconciler.remove(peer).is_none() {
            return false;
        }
        self.emit_peer_left(peer);
        if self.directory.role() == Some(Role::Host) {
            self.broadcast(&ChannelMessage::PlayerLeave { player_id: peer.clone() });
        }
        true
    }

    // =========================================================================
    // CHANNEL PROTOCOL
    // =========================================================================

    fn on_link_open(&mut self, peer: &PeerId) {
        let settings = match self.directory.current() {
            Some(room) if room.role == Role::Host => room.match_config.clone(),
            _ => None,
        };
        if let Some(settings) = settings {
            self.send_to(peer, &ChannelMessage::MatchSettings { settings });
        }
        self.send_to(peer, &ChannelMessage::RequestPlayerSync);
        self.announce_to(peer);
        if self.directory.role() == Some(Role::Host) {
            // Seed the newcomer with the joiners already here.
            for player in self.reconciler.remote_snapshots() {
                if &player.id != peer {
                    let origin = player.id.clone();
                    let relay = ChannelMessage::Relay {
                        origin,
                        message: Box::new(ChannelMessage::PlayerJoin { player }),
                    };
                    self.send_to(peer, &relay);
                }
            }
        }
        self.emit_notice(Notice::PeerConnected(peer.clone()));
    }

    fn handle_channel(&mut self, peer: &PeerId, text: &str, now: Instant) {
        self.liveness.record_received();
        let message = match ChannelMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %peer.short(), "dropping malformed frame: {}", e);
                return;
            }
        };

        let forward = (self.directory.role() == Some(Role::Host) && message.is_relayable())
            .then(|| message.clone());
        if self.handle_message(peer, peer, message, now) {
            if let Some(message) = forward {
                self.forward(peer, message);
            }
        }
    }

    /// Apply one message. `link` is the peer the frame arrived from and
    /// `origin` the peer that wrote it; they differ only for relayed
    /// messages. Returns whether the message was accepted.
    fn handle_message(
        &mut self,
        link: &PeerId,
        origin: &PeerId,
        message: ChannelMessage,
        now: Instant,
    ) -> bool {
        match message {
            ChannelMessage::PlayerJoin { player } => {
                let id = player.id.clone();
                match self.reconciler.apply_join(player, now) {
                    Ok(JoinOutcome::Created) => {
                        info!(entity = %id.short(), "remote entity joined");
                        let view = self.reconciler.remote(&id).map(|r| r.view.clone());
                        if let (Some(view), Some(cb)) = (view, self.listeners.peer_joined.as_mut()) {
                            cb(&view);
                        }
                        true
                    }
                    Ok(JoinOutcome::Refreshed) => true,
                    Err(rejection) => {
                        debug!(peer = %origin.short(), "playerJoin dropped: {}", rejection);
                        false
                    }
                }
            }
            ChannelMessage::PlayerState { state } => match self.reconciler.apply_state(&state, now) {
                Ok(()) => true,
                Err(rejection) => {
                    debug!(peer = %origin.short(), "playerState dropped: {}", rejection);
                    false
                }
            },
            ChannelMessage::Bullet { bullet } => match self.reconciler.admit_projectile(&bullet) {
                Ok(()) => {
                    self.inbound_projectiles.push(bullet);
                    true
                }
                Err(rejection) => {
                    debug!(peer = %origin.short(), "bullet dropped: {}", rejection);
                    false
                }
            },
            ChannelMessage::Damage { player_id, damage, attacker_id, seq } => {
                match self.reconciler.apply_remote_damage(origin, &player_id, damage, &attacker_id, seq) {
                    Ok(outcome) => {
                        if outcome.defeated_now {
                            info!(entity = %player_id.short(), attacker = %attacker_id.short(), "entity defeated");
                        }
                        true
                    }
                    // Our own entity is spared, the others still need to hear it.
                    Err(Rejection::LocalEntity) => true,
                    Err(rejection) => {
                        debug!(peer = %origin.short(), "damage dropped: {}", rejection);
                        false
                    }
                }
            }
            ChannelMessage::MatchSettings { settings } => {
                self.adopt_match_settings(origin, settings);
                true
            }
            ChannelMessage::RequestPlayerSync => {
                self.announce_to(link);
                true
            }
            ChannelMessage::Ping { timestamp } => self.send_to(link, &ChannelMessage::Pong { timestamp }),
            ChannelMessage::Pong { timestamp } => {
                if let Some(rtt) = self.liveness.record_pong(link, timestamp, now) {
                    debug!(peer = %link.short(), ?rtt, "pong");
                }
                true
            }
            ChannelMessage::Chat { sender, text } => {
                let text: String = text.chars().take(MAX_CHAT_LEN).collect();
                if let Some(cb) = self.listeners.chat.as_mut() {
                    cb(&sender, &text);
                }
                true
            }
            ChannelMessage::Relay { origin: writer, message } => {
                if !self.accepts_relay(link, &writer, &message) {
                    debug!(peer = %link.short(), kind = message.kind(), "relay refused");
                    return false;
                }
                self.handle_message(link, &writer, *message, now)
            }
            ChannelMessage::PlayerLeave { player_id } => {
                if self.host_id.as_ref() != Some(link) || player_id == self.local_id || &player_id == link {
                    debug!(peer = %link.short(), "ignoring playerLeave");
                    return false;
                }
                self.remove_entity(&player_id)
            }
        }
    }

    /// Joiners take relayed entity traffic from their host only, and never
    /// about themselves or the host.
    fn accepts_relay(&self, link: &PeerId, writer: &PeerId, message: &ChannelMessage) -> bool {
        self.directory.role() == Some(Role::Joiner)
            && self.host_id.as_ref() == Some(link)
            && writer != link
            && writer != &self.local_id
            && message.is_relayable()
    }

    /// Host side: pass a joiner's message on to every other open link.
    fn forward(&mut self, origin: &PeerId, message: ChannelMessage) {
        let relay = ChannelMessage::Relay { origin: origin.clone(), message: Box::new(message) };
        let text = match relay.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode relay: {}", e);
                return;
            }
        };
        for peer in self.negotiator.open_peers() {
            if &peer == origin {
                continue;
            }
            match self.negotiator.send(&peer, &text) {
                Ok(()) => self.liveness.record_sent(1),
                Err(e) => debug!(peer = %peer.short(), "relay not sent: {}", e),
            }
        }
    }

    fn adopt_match_settings(&mut self, from: &PeerId, settings: MatchConfig) {
        let is_joiner = self.directory.role() == Some(Role::Joiner);
        if !is_joiner || self.host_id.as_ref() != Some(from) {
            debug!(peer = %from.short(), "ignoring matchSettings from non-host");
            return;
        }

        if self.match_running && self.reconciler.local().is_some() {
            info!(map = %settings.map_id, "match running, reloading map");
            self.load_map(&settings.map_id);
            if let Some(room) = self.directory.current_mut() {
                room.match_config = Some(settings.clone());
            }
            self.emit_match_config(&settings);
        } else {
            let settings = settings.started_at(now_ms());
            if let Some(room) = self.directory.current_mut() {
                room.match_config = Some(settings.clone());
            }
            self.start_match(settings);
        }
    }

    /// Load the map, spawn the local entity and tell every open peer.
    fn start_match(&mut self, settings: MatchConfig) {
        let Some(profile) = self.directory.current().map(|r| r.profile.clone()) else {
            return;
        };
        self.load_map(&settings.map_id);
        let spawn = self.map.random_spawn(&mut rand::thread_rng());
        self.reconciler.set_local(EntitySnapshot::spawn(
            self.local_id.clone(),
            profile.name,
            profile.avatar_id,
            spawn,
        ));
        self.match_running = true;
        info!(map = %self.map.id, duration = settings.duration_secs, "match started");

        self.announce_all();
        self.emit_match_config(&settings);
    }

    fn load_map(&mut self, map_id: &str) {
        if !self.catalog.contains(map_id) {
            warn!(map = %map_id, "unknown map, using default");
        }
        self.map = self.catalog.get(map_id).clone();
        self.reconciler.set_bounds(self.map.bounds);
    }

    fn announce_to(&mut self, peer: &PeerId) {
        if let Some(player) = self.reconciler.local().cloned() {
            self.send_to(peer, &ChannelMessage::PlayerJoin { player });
        }
    }

    fn announce_all(&mut self) {
        if let Some(player) = self.reconciler.local().cloned() {
            self.broadcast(&ChannelMessage::PlayerJoin { player });
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    fn publish(&mut self, envelope: Envelope) {
        if let Err(e) = self.signaling.publish(&envelope) {
            warn!(kind = ?envelope.kind, "signaling publish failed: {}", e);
            self.emit_notice(Notice::SignalingUnavailable(e.to_string()));
        }
    }

    fn publish_directed(&mut self, kind: SignalKind, to: PeerId, payload: SignalPayload) {
        let Some(code) = self.directory.code().cloned() else {
            return;
        };
        self.publish(Envelope::directed(kind, code, self.local_id.clone(), to, payload));
    }

    fn send_to(&mut self, peer: &PeerId, message: &ChannelMessage) -> bool {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode {}: {}", message.kind(), e);
                return false;
            }
        };
        match self.negotiator.send(peer, &text) {
            Ok(()) => {
                self.liveness.record_sent(1);
                true
            }
            Err(e) => {
                debug!(peer = %peer.short(), "{} not sent: {}", message.kind(), e);
                false
            }
        }
    }

    fn broadcast(&mut self, message: &ChannelMessage) -> usize {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode {}: {}", message.kind(), e);
                return 0;
            }
        };
        let sent = self.negotiator.broadcast(&text);
        self.liveness.record_sent(sent);
        sent
    }

    // =========================================================================
    // CONSUMER API
    // =========================================================================

    /// The local entity, once the match has started.
    pub fn local_entity(&self) -> Option<&EntitySnapshot> {
        self.reconciler.local()
    }

    /// Rendered views of every remote entity.
    pub fn remote_entities(&self) -> Vec<EntitySnapshot> {
        self.reconciler.remote_views()
    }

    /// Replace the local entity with the simulation's latest state and
    /// broadcast it as `playerState`. Call once per simulation tick.
    pub fn send_local_snapshot(&mut self, mut snapshot: EntitySnapshot) -> usize {
        snapshot.id = self.local_id.clone();
        let state = snapshot.to_patch();
        self.reconciler.set_local(snapshot);
        self.broadcast(&ChannelMessage::PlayerState { state })
    }

    /// Broadcast a projectile fired by the local entity. Returns it as sent.
    pub fn spawn_projectile(&mut self, mut projectile: Projectile) -> Projectile {
        projectile.owner_id = self.local_id.clone();
        projectile.seq = Some(self.projectile_seq.next_seq());
        self.broadcast(&ChannelMessage::Bullet { bullet: projectile.clone() });
        projectile
    }

    /// Apply a hit detected by the local simulation and broadcast it.
    pub fn report_damage(
        &mut self,
        target: &EntityId,
        amount: f32,
        attacker: &EntityId,
    ) -> Result<DamageOutcome, Rejection> {
        let outcome = self.reconciler.apply_reported_damage(target, amount, attacker)?;
        if outcome.defeated_now {
            info!(entity = %target.short(), attacker = %attacker.short(), "entity defeated");
        }
        let seq = Some(self.damage_seq.next_seq());
        self.broadcast(&ChannelMessage::Damage {
            player_id: target.clone(),
            damage: amount,
            attacker_id: attacker.clone(),
            seq,
        });
        Ok(outcome)
    }

    /// Restore the local entity at a random spawn point and broadcast it.
    pub fn respawn_local(&mut self) -> Option<EntitySnapshot> {
        let spawn = self.map.random_spawn(&mut rand::thread_rng());
        let local = self.reconciler.local_mut()?;
        local.x = spawn.x;
        local.y = spawn.y;
        local.vx = 0.0;
        local.vy = 0.0;
        local.health = MAX_HEALTH;
        local.fuel = MAX_FUEL;
        local.defeated = false;
        let respawned = local.clone();
        self.broadcast(&ChannelMessage::PlayerState { state: respawned.to_patch() });
        Some(respawned)
    }

    /// Send a chat line to every peer. Empty lines are not sent.
    pub fn send_chat(&mut self, text: &str) -> usize {
        let text: String = text.trim().chars().take(MAX_CHAT_LEN).collect();
        let Some(sender) = self.directory.current().map(|r| r.profile.name.clone()) else {
            return 0;
        };
        if text.is_empty() {
            return 0;
        }
        self.broadcast(&ChannelMessage::Chat { sender, text })
    }

    /// Projectiles fired by peers since the last call.
    pub fn take_projectiles(&mut self) -> Vec<Projectile> {
        std::mem::take(&mut self.inbound_projectiles)
    }

    /// Everyone, best first.
    pub fn scoreboard(&self) -> Vec<ScoreLine> {
        self.reconciler.scoreboard()
    }

    /// Current match configuration.
    pub fn match_config(&self) -> Option<&MatchConfig> {
        self.directory.current().and_then(|r| r.match_config.as_ref())
    }

    /// Whether the local match is running.
    pub fn match_running(&self) -> bool {
        self.match_running
    }

    /// Time left in the match.
    pub fn match_remaining(&self) -> Option<Duration> {
        self.match_config()?.remaining(now_ms())
    }

    /// The loaded map.
    pub fn map(&self) -> &MapDefinition {
        &self.map
    }

    /// Network health.
    pub fn stats(&self) -> NetworkStats {
        self.liveness.stats(self.negotiator.open_peers().len())
    }

    /// Negotiation state of the link to `peer`.
    pub fn link_state(&self, peer: &PeerId) -> Option<LinkState> {
        self.negotiator.state(peer)
    }

    /// Peers with an open link.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.negotiator.open_peers()
    }

    /// Scheduled re-negotiations.
    pub fn pending_retries(&self) -> usize {
        self.negotiator.pending_retries()
    }

    /// Local peer id (also the local entity id).
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Current room code.
    pub fn room_code(&self) -> Option<&RoomCode> {
        self.directory.code()
    }

    /// Local role in the room.
    pub fn role(&self) -> Option<Role> {
        self.directory.role()
    }

    /// Session tunables.
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    // =========================================================================
    // LISTENERS
    // =========================================================================

    /// Called when a remote entity appears.
    pub fn on_peer_joined(&mut self, f: impl FnMut(&EntitySnapshot) + Send + 'static) {
        self.listeners.peer_joined = Some(Box::new(f));
    }

    /// Called when a remote entity is removed.
    pub fn on_peer_left(&mut self, f: impl FnMut(&PeerId) + Send + 'static) {
        self.listeners.peer_left = Some(Box::new(f));
    }

    /// Called when the match configuration is adopted or changes.
    pub fn on_match_config_changed(&mut self, f: impl FnMut(&MatchConfig) + Send + 'static) {
        self.listeners.match_config = Some(Box::new(f));
    }

    /// Called for each chat line with `(sender, text)`.
    pub fn on_chat(&mut self, f: impl FnMut(&str, &str) + Send + 'static) {
        self.listeners.chat = Some(Box::new(f));
    }

    /// Called for connectivity notifications.
    pub fn on_notice(&mut self, f: impl FnMut(&Notice) + Send + 'static) {
        self.listeners.notice = Some(Box::new(f));
    }

    fn emit_peer_left(&mut self, peer: &PeerId) {
        if let Some(cb) = self.listeners.peer_left.as_mut() {
            cb(peer);
        }
    }

    fn emit_match_config(&mut self, settings: &MatchConfig) {
        if let Some(cb) = self.listeners.match_config.as_mut() {
            cb(settings);
        }
    }

    fn emit_notice(&mut self, notice: Notice) {
        if let Some(cb) = self.listeners.notice.as_mut() {
            cb(&notice);
        }
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{EntityPatch, Weapon};
    use crate::network::memory::MemoryNetwork;
    use crate::network::signaling::LocalBus;
    use crate::network::websocket::WsTransport;
    use std::sync::Mutex;

    struct Mesh {
        bus: LocalBus,
        net: MemoryNetwork,
    }

    impl Mesh {
        fn new() -> Self {
            Self { bus: LocalBus::default(), net: MemoryNetwork::new() }
        }

        fn session(&self) -> MeshSession {
            MeshSession::new(
                MeshConfig::default(),
                Arc::new(self.bus.clone()),
                Arc::new(self.net.clone()),
            )
        }
    }

    fn settle(sessions: &mut [&mut MeshSession]) {
        for _ in 0..16 {
            for session in sessions.iter_mut() {
                session.tick();
            }
        }
    }

    fn connected(mesh: &Mesh, map_id: &str) -> (MeshSession, MeshSession) {
        let mut host = mesh.session();
        let mut joiner = mesh.session();
        let code = host
            .create_room(&Profile::new("Host", "flame"), MatchConfig::new(300, map_id))
            .unwrap();
        joiner.join_room(code.as_str(), &Profile::new("Joiner", "bolt")).unwrap();
        settle(&mut [&mut host, &mut joiner]);
        (host, joiner)
    }

    fn bullet(owner: &PeerId) -> Projectile {
        Projectile {
            x: 300.0,
            y: 300.0,
            vx: 12.0,
            vy: 0.0,
            owner_id: owner.clone(),
            weapon_type: Weapon::Rifle,
            seq: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_then_join_opens_both_sides() {
        let mesh = Mesh::new();
        let (host, joiner) = connected(&mesh, "ember");

        assert_eq!(host.link_state(joiner.local_id()), Some(LinkState::Open));
        assert_eq!(joiner.link_state(host.local_id()), Some(LinkState::Open));
        assert_eq!(host.role(), Some(Role::Host));
        assert_eq!(joiner.role(), Some(Role::Joiner));
        assert_eq!(host.room_code(), joiner.room_code());

        let host_sees: Vec<_> = host.remote_entities().into_iter().map(|e| e.id).collect();
        let joiner_sees: Vec<_> = joiner.remote_entities().into_iter().map(|e| e.id).collect();
        assert_eq!(host_sees, vec![joiner.local_id().clone()]);
        assert_eq!(joiner_sees, vec![host.local_id().clone()]);
        assert_eq!(host.stats().peers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_adopts_host_match_settings() {
        let mesh = Mesh::new();
        let mut host = mesh.session();
        let mut joiner = mesh.session();
        let adopted = Arc::new(Mutex::new(Vec::new()));
        let sink = adopted.clone();
        joiner.on_match_config_changed(move |cfg| sink.lock().unwrap().push(cfg.clone()));

        let code = host
            .create_room(&Profile::new("Host", "flame"), MatchConfig::new(300, "ember"))
            .unwrap();
        joiner.join_room(code.as_str(), &Profile::new("Joiner", "bolt")).unwrap();
        assert!(joiner.match_config().is_none());
        assert!(joiner.local_entity().is_none());

        settle(&mut [&mut host, &mut joiner]);

        let adopted = adopted.lock().unwrap();
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].map_id, "ember");
        assert_eq!(adopted[0].duration_secs, 300);
        assert_eq!(adopted[0].start_time_ms, host.match_config().unwrap().start_time_ms);
        assert!(joiner.match_running());
        assert_eq!(joiner.map().id, "ember");
        assert!(joiner.local_entity().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_loads_map_before_spawning() {
        let mesh = Mesh::new();
        let (_host, joiner) = connected(&mesh, "vault");
        assert_eq!(joiner.map().id, "vault");

        let local = joiner.local_entity().unwrap();
        let catalog = MapCatalog::builtin();
        let spawns = &catalog.get("vault").spawn_points;
        assert!(spawns.iter().any(|s| s.x == local.x && s.y == local.y));
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_bullets_ignored_peer_bullets_spawned() {
        let mesh = Mesh::new();
        let (mut a, mut b) = connected(&mesh, "ember");
        let a_id = a.local_id().clone();
        let b_id = b.local_id().clone();
        let now = Instant::now();

        let frame = ChannelMessage::Bullet { bullet: bullet(&a_id) }.to_json().unwrap();
        a.handle_channel(&b_id, &frame, now);
        a.handle_channel(&b_id, &frame, now);
        assert!(a.take_projectiles().is_empty());

        b.handle_channel(&a_id, &frame, now);
        b.handle_channel(&a_id, &frame, now);
        assert_eq!(b.take_projectiles().len(), 2);

        // Over the real link, with sequence numbers.
        let first = a.spawn_projectile(bullet(&b_id));
        let second = a.spawn_projectile(bullet(&b_id));
        assert_eq!(first.owner_id, a_id);
        assert_eq!((first.seq, second.seq), (Some(1), Some(2)));
        settle(&mut [&mut a, &mut b]);
        assert_eq!(b.take_projectiles(), vec![first, second]);
        assert!(a.take_projectiles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_link_retries_once_and_reconnects() {
        let mesh = Mesh::new();
        let (mut host, mut joiner) = connected(&mesh, "ember");
        let joiner_id = joiner.local_id().clone();
        let left = Arc::new(Mutex::new(Vec::new()));
        let sink = left.clone();
        host.on_peer_left(move |peer| sink.lock().unwrap().push(peer.clone()));

        assert_eq!(mesh.net.fail_links(&joiner_id), 1);
        host.tick();
        joiner.tick();

        assert_eq!(host.pending_retries(), 1);
        assert_eq!(joiner.pending_retries(), 1);
        assert!(host.remote_entities().is_empty());
        assert!(joiner.remote_entities().is_empty());
        assert_eq!(left.lock().unwrap().as_slice(), &[joiner_id.clone()]);

        settle(&mut [&mut host, &mut joiner]);
        assert_eq!(host.pending_retries(), 1, "no retry storm before the backoff elapses");
        assert!(host.link_state(&joiner_id).is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        settle(&mut [&mut host, &mut joiner]);

        assert_eq!(host.link_state(&joiner_id), Some(LinkState::Open));
        assert_eq!(host.pending_retries(), 0);
        assert_eq!(joiner.pending_retries(), 0);
        assert_eq!(host.remote_entities().len(), 1);
        assert_eq!(joiner.remote_entities().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_state_never_overwrites_local() {
        let mesh = Mesh::new();
        let (mut host, joiner) = connected(&mesh, "ember");
        let host_id = host.local_id().clone();
        let joiner_id = joiner.local_id().clone();
        let now = Instant::now();
        let before = host.local_entity().cloned();

        let hijack = EntityPatch::new(host_id.clone()).with_position(10.0, 10.0).with_health(1.0);
        let frame = ChannelMessage::PlayerState { state: hijack }.to_json().unwrap();
        host.handle_channel(&joiner_id, &frame, now);
        assert_eq!(host.local_entity().cloned(), before);

        let remote_before = host.remote_entities();
        let oob = EntityPatch::new(joiner_id.clone()).with_position(-5.0, 100.0);
        let frame = ChannelMessage::PlayerState { state: oob }.to_json().unwrap();
        host.handle_channel(&joiner_id, &frame, now);
        assert_eq!(host.remote_entities(), remote_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_snapshot_reaches_peer() {
        let mesh = Mesh::new();
        let (mut host, mut joiner) = connected(&mesh, "ember");
        let mut snapshot = host.local_entity().cloned().unwrap();
        snapshot.x = 640.0;
        snapshot.y = 480.0;
        snapshot.health = 70.0;
        assert_eq!(host.send_local_snapshot(snapshot), 1);
        settle(&mut [&mut host, &mut joiner]);
        for _ in 0..60 {
            joiner.tick();
        }

        let view = joiner.remote_entities().pop().unwrap();
        assert_eq!(view.health, 70.0);
        // Smoothing converges on the target.
        assert!((view.x - 640.0).abs() < 1.0);
        assert!((view.y - 480.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_damage_scores_locally_and_spares_victim() {
        let mesh = Mesh::new();
        let (mut host, mut joiner) = connected(&mesh, "ember");
        let host_id = host.local_id().clone();
        let joiner_id = joiner.local_id().clone();

        let outcome = host.report_damage(&joiner_id, 100.0, &host_id).unwrap();
        assert!(outcome.defeated_now);
        let board = host.scoreboard();
        assert_eq!((board[0].id.clone(), board[0].kills), (host_id.clone(), 1));

        settle(&mut [&mut host, &mut joiner]);
        // Inbound damage never touches the local entity.
        assert_eq!(joiner.local_entity().unwrap().health, MAX_HEALTH);

        // The victim's own simulation reports the hit on itself.
        let outcome = joiner.report_damage(&joiner_id, 100.0, &host_id).unwrap();
        assert!(outcome.defeated_now);
        assert!(joiner.local_entity().unwrap().defeated);

        let respawned = joiner.respawn_local().unwrap();
        assert!(!respawned.defeated);
        assert_eq!(respawned.health, MAX_HEALTH);
        assert_eq!(respawned.deaths, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_room_removes_peer_without_retry() {
        let mesh = Mesh::new();
        let (mut host, mut joiner) = connected(&mesh, "ember");
        let joiner_id = joiner.local_id().clone();
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        host.on_notice(move |n| sink.lock().unwrap().push(n.clone()));

        joiner.disconnect();
        assert!(joiner.room_code().is_none());
        assert!(joiner.local_entity().is_none());

        settle(&mut [&mut host]);
        assert!(host.remote_entities().is_empty());
        assert_eq!(host.pending_retries(), 0);
        assert!(host.link_state(&joiner_id).is_none());
        assert!(notices.lock().unwrap().contains(&Notice::PeerLeft(joiner_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_and_ping() {
        let mesh = Mesh::new();
        let (mut host, mut joiner) = connected(&mesh, "ember");
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        joiner.on_chat(move |sender, text| sink.lock().unwrap().push((sender.to_string(), text.to_string())));

        assert_eq!(host.send_chat("  gg  "), 1);
        assert_eq!(host.send_chat("   "), 0);
        settle(&mut [&mut host, &mut joiner]);
        assert_eq!(lines.lock().unwrap().as_slice(), &[("Host".to_string(), "gg".to_string())]);

        let stats = host.stats();
        assert!(stats.latency.is_some());
        assert!(stats.messages_sent > 0 && stats.messages_received > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_times_out() {
        let mesh = Mesh::new();
        let (mut host, joiner) = connected(&mesh, "ember");
        let joiner_id = joiner.local_id().clone();

        // Only the host keeps ticking, so nothing answers its pings.
        tokio::time::advance(Duration::from_secs(6)).await;
        host.tick();
        assert!(host.link_state(&joiner_id).is_none());
        assert_eq!(host.pending_retries(), 1);
        assert!(host.remote_entities().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_happens_before_network() {
        let mesh = Mesh::new();
        let mut inbox = mesh.bus.subscribe();
        let mut session = mesh.session();

        assert_eq!(
            session.create_room(&Profile::new("Al", "a"), MatchConfig::default()),
            Err(SessionError::Room(RoomError::InvalidName(2)))
        );
        assert_eq!(
            session.create_room(&Profile::new("Alice", "a"), MatchConfig::new(0, "ember")),
            Err(SessionError::Room(RoomError::InvalidDuration))
        );
        assert!(matches!(
            session.join_room("AB!", &Profile::new("Alice", "a")),
            Err(SessionError::Room(RoomError::InvalidRoomCode(_)))
        ));
        assert!(inbox.try_next().is_none());
        assert!(session.room_code().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_rooms_ignored() {
        let mesh = Mesh::new();
        let mut host = mesh.session();
        let mut stranger = mesh.session();
        host.create_room(&Profile::new("Host", "a"), MatchConfig::default()).unwrap();
        stranger.join_room("ZZZ999", &Profile::new("Stranger", "b")).unwrap();
        settle(&mut [&mut host, &mut stranger]);
        assert!(host.connected_peers().is_empty());
        assert!(stranger.link_state(host.local_id()).is_none());
    }

    fn trio(mesh: &Mesh) -> (MeshSession, MeshSession, MeshSession) {
        let mut host = mesh.session();
        let mut a = mesh.session();
        let mut b = mesh.session();
        let code = host
            .create_room(&Profile::new("Host", "flame"), MatchConfig::new(300, "ember"))
            .unwrap();
        a.join_room(code.as_str(), &Profile::new("Alpha", "bolt")).unwrap();
        b.join_room(code.as_str(), &Profile::new("Bravo", "frost")).unwrap();
        settle(&mut [&mut host, &mut a, &mut b]);
        (host, a, b)
    }

    fn ids(session: &MeshSession) -> Vec<PeerId> {
        let mut ids: Vec<_> = session.remote_entities().into_iter().map(|e| e.id).collect();
        ids.sort();
        ids
    }

    fn sorted(mut ids: Vec<PeerId>) -> Vec<PeerId> {
        ids.sort();
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_peers_see_each_other_through_host() {
        let mesh = Mesh::new();
        let (mut host, mut a, mut b) = trio(&mesh);
        let (host_id, a_id, b_id) = (host.local_id().clone(), a.local_id().clone(), b.local_id().clone());

        assert_eq!(host.connected_peers().len(), 2);
        assert_eq!(ids(&host), sorted(vec![a_id.clone(), b_id.clone()]));
        assert_eq!(ids(&a), sorted(vec![host_id.clone(), b_id.clone()]));
        assert_eq!(ids(&b), sorted(vec![host_id.clone(), a_id.clone()]));

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        b.on_chat(move |sender, text| sink.lock().unwrap().push(format!("{sender}: {text}")));

        let mut snapshot = a.local_entity().cloned().unwrap();
        snapshot.health = 70.0;
        assert_eq!(a.send_local_snapshot(snapshot), 1);
        let shot = a.spawn_projectile(bullet(&b_id));
        a.send_chat("hello");
        settle(&mut [&mut host, &mut a, &mut b]);

        let seen = |s: &MeshSession| s.remote_entities().into_iter().find(|e| e.id == a_id).unwrap();
        assert_eq!(seen(&host).health, 70.0);
        assert_eq!(seen(&b).health, 70.0);
        assert_eq!(b.take_projectiles(), vec![shot.clone()]);
        assert_eq!(host.take_projectiles(), vec![shot]);
        assert!(a.take_projectiles().is_empty());
        assert_eq!(lines.lock().unwrap().as_slice(), &["Alpha: hello".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_joiner_removed_from_other_joiners() {
        let mesh = Mesh::new();
        let (mut host, a, mut b) = trio(&mesh);
        let host_id = host.local_id().clone();
        let a_id = a.local_id().clone();
        let left = Arc::new(Mutex::new(Vec::new()));
        let sink = left.clone();
        b.on_peer_left(move |peer| sink.lock().unwrap().push(peer.clone()));

        assert_eq!(mesh.net.fail_links(&a_id), 1);
        settle(&mut [&mut host, &mut b]);

        assert_eq!(ids(&host), vec![b.local_id().clone()]);
        assert_eq!(ids(&b), vec![host_id.clone()]);
        assert_eq!(left.lock().unwrap().as_slice(), &[a_id]);

        // A forged departure for the host itself is ignored.
        let frame = ChannelMessage::PlayerLeave { player_id: host_id.clone() }.to_json().unwrap();
        b.handle_channel(&host_id, &frame, Instant::now());
        assert_eq!(ids(&b), vec![host_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_drops_relayed_entities_with_host_link() {
        let mesh = Mesh::new();
        let (host, _a, mut b) = trio(&mesh);
        assert_eq!(b.remote_entities().len(), 2);

        assert_eq!(mesh.net.fail_links(host.local_id()), 2);
        b.tick();
        assert!(b.remote_entities().is_empty());
        assert_eq!(b.pending_retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_only_trusted_from_host() {
        let mesh = Mesh::new();
        let (host, a, mut b) = trio(&mesh);
        let (host_id, a_id, b_id) = (host.local_id().clone(), a.local_id().clone(), b.local_id().clone());
        let now = Instant::now();
        let before = b.remote_entities();

        let patch = EntityPatch::new(a_id.clone()).with_health(5.0);
        let relay = |origin: &PeerId| {
            ChannelMessage::Relay {
                origin: origin.clone(),
                message: Box::new(ChannelMessage::PlayerState { state: patch.clone() }),
            }
            .to_json()
            .unwrap()
        };
        // Not from the host link.
        b.handle_channel(&a_id, &relay(&a_id), now);
        // Claims to be from ourselves.
        b.handle_channel(&host_id, &relay(&b_id), now);
        assert_eq!(b.remote_entities(), before);

        b.handle_channel(&host_id, &relay(&a_id), now);
        let view = b.remote_entities().into_iter().find(|e| e.id == a_id).unwrap();
        assert_eq!(view.health, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_coordinates_never_applied() {
        let mesh = Mesh::new();
        let (mut host, joiner) = connected(&mesh, "ember");
        let joiner_id = joiner.local_id().clone();
        let before = host.remote_entities();

        let frame = format!(
            r#"{{"type":"playerState","state":{{"id":"{joiner_id}","x":null,"y":null,"health":1}}}}"#
        );
        host.handle_channel(&joiner_id, &frame, Instant::now());
        assert_eq!(host.remote_entities(), before);
        assert_eq!(host.remote_entities()[0].health, MAX_HEALTH);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_match_settings_only_reload_map() {
        let mesh = Mesh::new();
        let mut host = mesh.session();
        let mut joiner = mesh.session();
        let adopted = Arc::new(Mutex::new(Vec::new()));
        let sink = adopted.clone();
        joiner.on_match_config_changed(move |cfg| sink.lock().unwrap().push(cfg.map_id.clone()));
        let code = host
            .create_room(&Profile::new("Host", "flame"), MatchConfig::new(300, "ember"))
            .unwrap();
        joiner.join_room(code.as_str(), &Profile::new("Joiner", "bolt")).unwrap();
        settle(&mut [&mut host, &mut joiner]);
        let local = joiner.local_entity().cloned();
        assert!(local.is_some());

        let frame = ChannelMessage::MatchSettings { settings: MatchConfig::new(300, "frost") }
            .to_json()
            .unwrap();
        joiner.handle_channel(host.local_id(), &frame, Instant::now());

        assert_eq!(joiner.map().id, "frost");
        assert_eq!(joiner.match_config().unwrap().map_id, "frost");
        assert!(joiner.match_running());
        // No respawn.
        assert_eq!(joiner.local_entity().cloned(), local);
        assert_eq!(adopted.lock().unwrap().as_slice(), &["ember".to_string(), "frost".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_settings_from_non_host_ignored() {
        let mesh = Mesh::new();
        let (mut host, mut joiner) = connected(&mesh, "ember");
        let joiner_id = joiner.local_id().clone();
        let adopted = Arc::new(Mutex::new(0));
        let sink = adopted.clone();
        joiner.on_match_config_changed(move |_| *sink.lock().unwrap() += 1);
        let before = joiner.match_config().cloned();
        let frame = ChannelMessage::MatchSettings { settings: MatchConfig::new(120, "vault") }
            .to_json()
            .unwrap();

        joiner.handle_channel(&PeerId::new("stranger"), &frame, Instant::now());
        assert_eq!(joiner.map().id, "ember");
        assert_eq!(joiner.match_config().cloned(), before);
        assert_eq!(*adopted.lock().unwrap(), 0);

        // Hosts never take settings from anyone.
        host.handle_channel(&joiner_id, &frame, Instant::now());
        assert_eq!(host.map().id, "ember");
        assert_eq!(host.match_config().unwrap().map_id, "ember");
    }

    #[tokio::test]
    async fn test_websocket_session_loopback() {
        let bus = LocalBus::default();
        let session = || {
            MeshSession::new(
                MeshConfig::default(),
                Arc::new(bus.clone()),
                Arc::new(WsTransport::default()),
            )
        };
        let mut host = session();
        let mut joiner = session();
        let code = host.create_room(&Profile::new("Host", "a"), MatchConfig::default()).unwrap();
        joiner.join_room(code.as_str(), &Profile::new("Joiner", "b")).unwrap();

        for _ in 0..500 {
            host.tick();
            joiner.tick();
            if host.remote_entities().len() == 1 && joiner.remote_entities().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(host.link_state(joiner.local_id()), Some(LinkState::Open));
        assert_eq!(joiner.remote_entities()[0].id, *host.local_id());
    }
}
