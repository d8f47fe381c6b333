//! Connection Negotiator
//!
//! Per-peer handshake state machine. Owns every [`PeerLink`] and is the only
//! component that adds or removes them.
//!
//! ```text
//! Idle ─► OfferSent ─────────────────┐
//!   └───► OfferReceived ─► AnswerExchanged ─► CandidatesExchanging ─► Open
//!                                                              │
//!                                          Closed / Failed ◄───┘
//! ```
//!
//! Re-negotiation never patches a link in place: the old instance is closed
//! and a new one with a fresh [`LinkId`] replaces it, so events still in
//! flight for the old instance are recognised as stale and dropped.
//!
//! Methods return [`NegotiationEffect`]s for the session to act on instead
//! of calling back into it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{MeshConfig, RetryPolicy};
use crate::core::ids::PeerId;
use crate::network::transport::{
    Connection, DirectTransport, IceCandidate, LinkContext, LinkEvent, LinkId, LinkSignal,
    SessionDescription, TransportError,
};

// =============================================================================
// PEER LINK
// =============================================================================

/// Negotiation state of one link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing exchanged.
    Idle,
    /// Local offer published, waiting for the answer.
    OfferSent,
    /// Remote offer received, answer not yet created.
    OfferReceived,
    /// Answer created and published.
    AnswerExchanged,
    /// Descriptions settled, candidates flowing.
    CandidatesExchanging,
    /// Channel open in both directions.
    Open,
    /// Closed by either side.
    Closed,
    /// Transport failure or timeout.
    Failed,
}

impl LinkState {
    /// Whether the channel is usable.
    pub fn is_open(self) -> bool {
        self == LinkState::Open
    }

    /// Whether the link is finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One remote participant's connection.
pub struct PeerLink {
    /// Remote peer.
    pub peer: PeerId,
    /// Instance id.
    pub id: LinkId,
    /// Negotiation state.
    pub state: LinkState,
    connection: Box<dyn Connection>,
    /// When this instance was created.
    pub created_at: Instant,
    /// Last inbound traffic or state change.
    pub last_activity: Instant,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer)
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    fn transition(&mut self, to: LinkState, now: Instant) {
        debug!(peer = %self.peer.short(), link = %self.id, from = %self.state, to = %to, "link state");
        self.state = to;
        self.last_activity = now;
    }
}

/// What the session should do after a negotiator call.
#[derive(Clone, Debug, PartialEq)]
pub enum NegotiationEffect {
    /// Publish an offer to `peer`.
    SendOffer {
        /// Addressee.
        peer: PeerId,
        /// Offer.
        offer: SessionDescription,
    },
    /// Publish an answer to `peer`.
    SendAnswer {
        /// Addressee.
        peer: PeerId,
        /// Answer.
        answer: SessionDescription,
    },
    /// Publish a local candidate to `peer`.
    SendCandidate {
        /// Addressee.
        peer: PeerId,
        /// Candidate.
        candidate: IceCandidate,
    },
    /// The link to `peer` just opened.
    Opened {
        /// Peer.
        peer: PeerId,
    },
    /// A channel frame from `peer`.
    Inbound {
        /// Sender.
        peer: PeerId,
        /// Raw frame.
        text: String,
    },
    /// The link to `peer` is gone and its entity must be removed.
    Lost {
        /// Peer.
        peer: PeerId,
        /// Terminal state the link ended in.
        state: LinkState,
        /// Human-readable cause.
        reason: String,
    },
}

#[derive(Clone, Copy, Debug)]
struct PendingRetry {
    due: Instant,
    attempt: u32,
}

/// Candidates that arrived before any link to their sender existed.
#[derive(Debug)]
struct EarlyCandidates {
    since: Instant,
    queue: VecDeque<IceCandidate>,
}

/// Consecutive failures for one peer.
#[derive(Clone, Copy, Debug)]
struct FailureCount {
    count: u32,
    last: Instant,
}

/// Most distinct senders whose early candidates are buffered at once.
pub const MAX_BUFFERED_PEERS: usize = 32;

// =============================================================================
// NEGOTIATOR
// =============================================================================

/// Owns the peer map.
pub struct Negotiator {
    local: PeerId,
    transport: Arc<dyn DirectTransport>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    links: BTreeMap<PeerId, PeerLink>,
    early_candidates: BTreeMap<PeerId, EarlyCandidates>,
    retries: BTreeMap<PeerId, PendingRetry>,
    failures: BTreeMap<PeerId, FailureCount>,
    next_link: u64,
    policy: RetryPolicy,
    handshake_timeout: Duration,
    link_timeout: Duration,
    max_early_candidates: usize,
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("local", &self.local)
            .field("links", &self.links)
            .field("pending_retries", &self.retries.len())
            .finish_non_exhaustive()
    }
}

impl Negotiator {
    /// Create a negotiator for `local` using `transport`.
    pub fn new(local: PeerId, transport: Arc<dyn DirectTransport>, config: &MeshConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            local,
            transport,
            events_tx,
            events_rx,
            links: BTreeMap::new(),
            early_candidates: BTreeMap::new(),
            retries: BTreeMap::new(),
            failures: BTreeMap::new(),
            next_link: 0,
            policy: config.retry.clone(),
            handshake_timeout: config.handshake_timeout,
            link_timeout: config.link_timeout,
            max_early_candidates: config.max_early_candidates,
        }
    }

    fn context(&mut self, peer: &PeerId) -> LinkContext {
        self.next_link += 1;
        LinkContext::new(
            self.local.clone(),
            peer.clone(),
            LinkId(self.next_link),
            self.events_tx.clone(),
        )
    }

    /// Close and forget any existing link to `peer` without side effects.
    fn discard(&mut self, peer: &PeerId) {
        if let Some(mut old) = self.links.remove(peer) {
            debug!(peer = %peer.short(), link = %old.id, "discarding superseded link");
            old.connection.close();
        }
    }

    fn install(&mut self, ctx: &LinkContext, connection: Box<dyn Connection>, state: LinkState, now: Instant) {
        self.retries.remove(&ctx.peer);
        self.links.insert(ctx.peer.clone(), PeerLink {
            peer: ctx.peer.clone(),
            id: ctx.link,
            state,
            connection,
            created_at: now,
            last_activity: now,
        });
    }

    /// Apply buffered candidates to a freshly installed link.
    fn flush_early_candidates(&mut self, peer: &PeerId, now: Instant) {
        let Some(buffered) = self.early_candidates.remove(peer) else {
            return;
        };
        for candidate in buffered.queue {
            self.apply_candidate(peer, &candidate, now);
        }
    }

    /// Host side: start a fresh negotiation with `peer`.
    pub fn offer_to(&mut self, peer: &PeerId, now: Instant) -> Vec<NegotiationEffect> {
        self.discard(peer);
        let ctx = self.context(peer);
        match self.transport.create_offer(ctx.clone()) {
            Ok((connection, offer)) => {
                info!(peer = %peer.short(), link = %ctx.link, "offering link");
                self.install(&ctx, connection, LinkState::Idle, now);
                if let Some(link) = self.links.get_mut(peer) {
                    link.transition(LinkState::OfferSent, now);
                }
                self.flush_early_candidates(peer, now);
                vec![NegotiationEffect::SendOffer { peer: peer.clone(), offer }]
            }
            Err(e) => {
                warn!(peer = %peer.short(), "failed to create offer: {}", e);
                self.schedule_retry(peer, now);
                Vec::new()
            }
        }
    }

    /// Joiner side: answer an offer from `peer`.
    pub fn accept_offer(
        &mut self,
        peer: &PeerId,
        offer: &SessionDescription,
        now: Instant,
    ) -> Vec<NegotiationEffect> {
        self.discard(peer);
        let ctx = self.context(peer);
        match self.transport.create_answer(ctx.clone(), offer) {
            Ok((connection, answer)) => {
                info!(peer = %peer.short(), link = %ctx.link, "answering offer");
                self.install(&ctx, connection, LinkState::OfferReceived, now);
                if let Some(link) = self.links.get_mut(peer) {
                    link.transition(LinkState::AnswerExchanged, now);
                }
                self.flush_early_candidates(peer, now);
                vec![NegotiationEffect::SendAnswer { peer: peer.clone(), answer }]
            }
            Err(e) => {
                warn!(peer = %peer.short(), "failed to answer offer: {}", e);
                self.schedule_retry(peer, now);
                Vec::new()
            }
        }
    }

    /// Host side: apply the answer from `peer`. Answers that do not match
    /// the current offer are stale and ignored.
    pub fn accept_answer(&mut self, peer: &PeerId, answer: &SessionDescription, now: Instant) {
        let Some(link) = self.links.get_mut(peer) else {
            debug!(peer = %peer.short(), "answer without link");
            return;
        };
        if link.state != LinkState::OfferSent {
            debug!(peer = %peer.short(), state = %link.state, "unexpected answer");
            return;
        }
        match link.connection.apply_answer(answer) {
            Ok(()) => link.transition(LinkState::CandidatesExchanging, now),
            Err(e) => debug!(peer = %peer.short(), "ignoring stale answer: {}", e),
        }
    }

    /// Apply a remote candidate, or buffer it until a link exists.
    pub fn add_candidate(&mut self, peer: &PeerId, candidate: IceCandidate, now: Instant) {
        if self.links.contains_key(peer) {
            self.apply_candidate(peer, &candidate, now);
            return;
        }
        if !self.early_candidates.contains_key(peer) && self.early_candidates.len() >= MAX_BUFFERED_PEERS {
            let oldest = self
                .early_candidates
                .iter()
                .min_by_key(|(_, early)| early.since)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                debug!(peer = %oldest.short(), "evicting early candidates");
                self.early_candidates.remove(&oldest);
            }
        }
        let early = self
            .early_candidates
            .entry(peer.clone())
            .or_insert_with(|| EarlyCandidates { since: now, queue: VecDeque::new() });
        if early.queue.len() >= self.max_early_candidates {
            early.queue.pop_front();
        }
        early.queue.push_back(candidate);
    }

    fn apply_candidate(&mut self, peer: &PeerId, candidate: &IceCandidate, now: Instant) {
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        if link.state.is_terminal() {
            return;
        }
        match link.connection.add_remote_candidate(candidate) {
            Ok(()) => {
                if link.state == LinkState::AnswerExchanged {
                    link.transition(LinkState::CandidatesExchanging, now);
                }
            }
            Err(e) => debug!(peer = %peer.short(), "candidate rejected: {}", e),
        }
    }

    /// Next queued transport event, if any.
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Apply a transport event. Events for superseded link instances are
    /// dropped.
    pub fn handle_event(&mut self, event: LinkEvent, now: Instant) -> Vec<NegotiationEffect> {
        let Some(link) = self.links.get_mut(&event.peer) else {
            debug!(peer = %event.peer.short(), link = %event.link, "event for unknown link");
            return Vec::new();
        };
        if link.id != event.link {
            debug!(peer = %event.peer.short(), link = %event.link, "stale link event");
            return Vec::new();
        }

        match event.signal {
            LinkSignal::LocalCandidate(candidate) => {
                vec![NegotiationEffect::SendCandidate { peer: event.peer, candidate }]
            }
            LinkSignal::Open => {
                if link.state.is_open() {
                    return Vec::new();
                }
                info!(peer = %event.peer.short(), link = %link.id, "link open");
                link.transition(LinkState::Open, now);
                self.failures.remove(&event.peer);
                vec![NegotiationEffect::Opened { peer: event.peer }]
            }
            LinkSignal::Message(text) => {
                link.last_activity = now;
                if !link.state.is_open() {
                    debug!(peer = %event.peer.short(), "frame before open");
                    return Vec::new();
                }
                vec![NegotiationEffect::Inbound { peer: event.peer, text }]
            }
            LinkSignal::Closed => {
                self.mark_lost(&event.peer, LinkState::Closed, "channel closed", now)
            }
            LinkSignal::Failed(reason) => self.mark_lost(&event.peer, LinkState::Failed, &reason, now),
        }
    }

    /// Tear down a link after a close or failure and schedule one
    /// re-negotiation. The single removal path for lost links.
    pub fn mark_lost(
        &mut self,
        peer: &PeerId,
        state: LinkState,
        reason: &str,
        now: Instant,
    ) -> Vec<NegotiationEffect> {
        let Some(mut link) = self.links.remove(peer) else {
            return Vec::new();
        };
        link.transition(state, now);
        link.connection.close();
        warn!(peer = %peer.short(), link = %link.id, state = %state, "link lost: {}", reason);
        self.schedule_retry(peer, now);
        vec![NegotiationEffect::Lost { peer: peer.clone(), state, reason: reason.to_string() }]
    }

    /// Remove a peer for good: no retry is scheduled.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.retries.remove(peer);
        self.failures.remove(peer);
        self.early_candidates.remove(peer);
        match self.links.remove(peer) {
            Some(mut link) => {
                info!(peer = %peer.short(), link = %link.id, "link removed");
                link.connection.close();
                true
            }
            None => false,
        }
    }

    /// Close every link and forget all pending work.
    pub fn teardown(&mut self) {
        for (_, mut link) in std::mem::take(&mut self.links) {
            link.connection.close();
        }
        self.retries.clear();
        self.failures.clear();
        self.early_candidates.clear();
        while self.events_rx.try_recv().is_ok() {}
    }

    fn schedule_retry(&mut self, peer: &PeerId, now: Instant) {
        if self.retries.contains_key(peer) {
            return;
        }
        let attempt = {
            let failures = self.failures.entry(peer.clone()).or_insert(FailureCount { count: 0, last: now });
            failures.count += 1;
            failures.last = now;
            failures.count
        };
        if !self.policy.allows(attempt) {
            warn!(peer = %peer.short(), attempt, "retry budget exhausted");
            return;
        }
        let delay = self.policy.delay_for(attempt);
        debug!(peer = %peer.short(), attempt, ?delay, "re-negotiation scheduled");
        self.retries.insert(peer.clone(), PendingRetry { due: now + delay, attempt });
    }

    /// Take the retries that are due. Each is handed out once.
    pub fn due_retries(&mut self, now: Instant) -> Vec<PeerId> {
        let due: Vec<PeerId> = self
            .retries
            .iter()
            .filter(|(_, r)| r.due <= now)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &due {
            if let Some(retry) = self.retries.remove(peer) {
                debug!(peer = %peer.short(), attempt = retry.attempt, "retry due");
            }
        }
        due
    }

    /// Fail links stuck in handshake or silent for too long, and drop
    /// bookkeeping for peers that never came back.
    pub fn expire(&mut self, now: Instant) -> Vec<NegotiationEffect> {
        let window = self.handshake_timeout;
        self.early_candidates
            .retain(|_, early| now.saturating_duration_since(early.since) <= window);
        let (links, retries) = (&self.links, &self.retries);
        self.failures.retain(|peer, failures| {
            links.contains_key(peer)
                || retries.contains_key(peer)
                || now.saturating_duration_since(failures.last) <= window
        });

        let expired: Vec<(PeerId, &'static str)> = self
            .links
            .values()
            .filter_map(|link| {
                if link.state.is_open() {
                    (now.saturating_duration_since(link.last_activity) > self.link_timeout)
                        .then(|| (link.peer.clone(), "link silent"))
                } else {
                    (now.saturating_duration_since(link.created_at) > self.handshake_timeout)
                        .then(|| (link.peer.clone(), "handshake timed out"))
                }
            })
            .collect();

        expired
            .into_iter()
            .flat_map(|(peer, reason)| self.mark_lost(&peer, LinkState::Failed, reason, now))
            .collect()
    }

    /// Send a frame over an open link.
    pub fn send(&mut self, peer: &PeerId, text: &str) -> Result<(), TransportError> {
        let link = self.links.get_mut(peer).ok_or(TransportError::Closed)?;
        if !link.state.is_open() {
            return Err(TransportError::InvalidState("link not open"));
        }
        link.connection.send(text)
    }

    /// Send a frame over every open link. Returns how many accepted it.
    pub fn broadcast(&mut self, text: &str) -> usize {
        let mut sent = 0;
        for link in self.links.values_mut().filter(|l| l.state.is_open()) {
            match link.connection.send(text) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %link.peer.short(), "send failed: {}", e),
            }
        }
        sent
    }

    /// Peers with an open link, ordered by id.
    pub fn open_peers(&self) -> Vec<PeerId> {
        self.links.values().filter(|l| l.state.is_open()).map(|l| l.peer.clone()).collect()
    }

    /// State of the link to `peer`.
    pub fn state(&self, peer: &PeerId) -> Option<LinkState> {
        self.links.get(peer).map(|l| l.state)
    }

    /// The link to `peer`.
    pub fn link(&self, peer: &PeerId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    /// Whether any link (open or negotiating) exists for `peer`.
    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    /// Number of scheduled re-negotiations.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// When the retry for `peer` is due.
    pub fn retry_due(&self, peer: &PeerId) -> Option<Instant> {
        self.retries.get(peer).map(|r| r.due)
    }

    /// Number of links in any state.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Peers with buffered early candidates.
    pub fn buffered_peers(&self) -> usize {
        self.early_candidates.len()
    }

    /// Peers with a failure count on record.
    pub fn tracked_failures(&self) -> usize {
        self.failures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;

    struct Pair {
        net: MemoryNetwork,
        host: Negotiator,
        joiner: Negotiator,
        host_id: PeerId,
        joiner_id: PeerId,
    }

    fn pair() -> Pair {
        let net = MemoryNetwork::new();
        let config = MeshConfig::default();
        let host_id = PeerId::new("host");
        let joiner_id = PeerId::new("joiner");
        Pair {
            host: Negotiator::new(host_id.clone(), Arc::new(net.clone()), &config),
            joiner: Negotiator::new(joiner_id.clone(), Arc::new(net.clone()), &config),
            net,
            host_id,
            joiner_id,
        }
    }

    /// Route effects between the two negotiators until both go quiet.
    /// Returns the effects that are not signaling.
    fn pump(p: &mut Pair, mut pending: Vec<(bool, NegotiationEffect)>, now: Instant) -> Vec<(bool, NegotiationEffect)> {
        let mut surfaced = Vec::new();
        loop {
            while let Some(ev) = p.host.poll_event() {
                pending.extend(p.host.handle_event(ev, now).into_iter().map(|e| (true, e)));
            }
            while let Some(ev) = p.joiner.poll_event() {
                pending.extend(p.joiner.handle_event(ev, now).into_iter().map(|e| (false, e)));
            }
            if pending.is_empty() {
                return surfaced;
            }
            for (from_host, effect) in std::mem::take(&mut pending) {
                let (from, to) = if from_host {
                    (p.host_id.clone(), &mut p.joiner)
                } else {
                    (p.joiner_id.clone(), &mut p.host)
                };
                match effect {
                    NegotiationEffect::SendOffer { offer, .. } => {
                        let out = to.accept_offer(&from, &offer, now);
                        pending.extend(out.into_iter().map(|e| (!from_host, e)));
                    }
                    NegotiationEffect::SendAnswer { answer, .. } => to.accept_answer(&from, &answer, now),
                    NegotiationEffect::SendCandidate { candidate, .. } => to.add_candidate(&from, candidate, now),
                    other => surfaced.push((from_host, other)),
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_reaches_open() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        let offer = p.host.offer_to(&joiner_id, now);
        assert_eq!(p.host.state(&joiner_id), Some(LinkState::OfferSent));

        let surfaced = pump(&mut p, offer.into_iter().map(|e| (true, e)).collect(), now);
        let opened: Vec<_> = surfaced
            .iter()
            .filter(|(_, e)| matches!(e, NegotiationEffect::Opened { .. }))
            .collect();
        assert_eq!(opened.len(), 2);
        assert_eq!(p.host.state(&p.joiner_id), Some(LinkState::Open));
        assert_eq!(p.joiner.state(&p.host_id), Some(LinkState::Open));
        assert_eq!(p.net.open_link_count(), 1);

        p.host.send(&p.joiner_id, "hi").unwrap();
        let surfaced = pump(&mut p, Vec::new(), now);
        assert_eq!(
            surfaced,
            vec![(false, NegotiationEffect::Inbound { peer: p.host_id.clone(), text: "hi".into() })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reoffer_replaces_link() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        p.host.offer_to(&joiner_id, now);
        let first = p.host.link(&joiner_id).unwrap().id;
        p.host.offer_to(&joiner_id, now);
        let second = p.host.link(&joiner_id).unwrap().id;
        assert_ne!(first, second);
        assert_eq!(p.host.link_count(), 1);

        // The first instance's candidate is still queued and must be ignored.
        let mut effects = Vec::new();
        while let Some(ev) = p.host.poll_event() {
            effects.extend(p.host.handle_event(ev, now));
        }
        assert_eq!(effects.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_candidates_are_buffered() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        let host_id = p.host_id.clone();
        let offer = match p.host.offer_to(&joiner_id, now).pop() {
            Some(NegotiationEffect::SendOffer { offer, .. }) => offer,
            other => panic!("expected offer, got {other:?}"),
        };
        let candidate = match p.host.poll_event().map(|ev| ev.signal) {
            Some(LinkSignal::LocalCandidate(c)) => c,
            other => panic!("expected candidate, got {other:?}"),
        };

        // Candidate overtakes the offer.
        p.joiner.add_candidate(&host_id, candidate, now);
        assert!(!p.joiner.has_link(&host_id));
        let answer = p.joiner.accept_offer(&host_id, &offer, now);
        assert_eq!(p.joiner.state(&host_id), Some(LinkState::CandidatesExchanging));

        let surfaced = pump(&mut p, answer.into_iter().map(|e| (false, e)).collect(), now);
        assert!(surfaced.iter().any(|(h, e)| *h && matches!(e, NegotiationEffect::Opened { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_schedules_exactly_one_retry() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        let offer = p.host.offer_to(&joiner_id, now);
        pump(&mut p, offer.into_iter().map(|e| (true, e)).collect(), now);

        p.net.fail_links(&joiner_id);
        let lost = pump(&mut p, Vec::new(), now);
        assert!(lost.iter().any(|(h, e)| *h
            && matches!(e, NegotiationEffect::Lost { state: LinkState::Failed, .. })));
        assert_eq!(p.host.pending_retries(), 1);
        assert_eq!(p.joiner.pending_retries(), 1);
        assert!(!p.host.has_link(&joiner_id));

        // A second loss report for the same peer does not add another retry.
        p.host.mark_lost(&joiner_id, LinkState::Failed, "again", now);
        assert_eq!(p.host.pending_retries(), 1);

        assert!(p.host.due_retries(now + Duration::from_millis(1999)).is_empty());
        assert_eq!(p.host.due_retries(now + Duration::from_secs(2)), vec![joiner_id.clone()]);
        assert!(p.host.due_retries(now + Duration::from_secs(10)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_link_cancels_pending_retry() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        p.host.offer_to(&joiner_id, now);
        p.host.mark_lost(&joiner_id, LinkState::Closed, "closed", now);
        assert_eq!(p.host.pending_retries(), 1);
        p.host.offer_to(&joiner_id, now);
        assert_eq!(p.host.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_does_not_retry() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        p.host.offer_to(&joiner_id, now);
        assert!(p.host.remove(&joiner_id));
        assert_eq!(p.host.pending_retries(), 0);
        assert!(!p.host.remove(&joiner_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        p.host.offer_to(&joiner_id, now);
        assert!(p.host.expire(now + Duration::from_secs(5)).is_empty());
        let effects = p.host.expire(now + Duration::from_secs(11));
        assert!(matches!(
            effects.as_slice(),
            [NegotiationEffect::Lost { state: LinkState::Failed, .. }]
        ));
        assert_eq!(p.host.pending_retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_in_wrong_state_ignored() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        p.host.offer_to(&joiner_id, now);
        let stale = SessionDescription::answer("ember-memory/1 token=stale");
        p.host.accept_answer(&joiner_id, &stale, now);
        assert_eq!(p.host.state(&joiner_id), Some(LinkState::OfferSent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_senders_do_not_accumulate() {
        let mut p = pair();
        let now = Instant::now();
        let candidate = IceCandidate::new("127.0.0.1:1");

        for i in 0..(MAX_BUFFERED_PEERS + 10) {
            p.joiner.add_candidate(&PeerId::new(format!("ghost-{i}")), candidate.clone(), now);
        }
        assert_eq!(p.joiner.buffered_peers(), MAX_BUFFERED_PEERS);

        // Buffers outlive the handshake window only while a link could still use them.
        assert!(p.joiner.expire(now + Duration::from_secs(5)).is_empty());
        assert_eq!(p.joiner.buffered_peers(), MAX_BUFFERED_PEERS);
        p.joiner.expire(now + Duration::from_secs(11));
        assert_eq!(p.joiner.buffered_peers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counts_expire_with_the_peer() {
        let mut p = pair();
        let now = Instant::now();
        let joiner_id = p.joiner_id.clone();
        p.host.offer_to(&joiner_id, now);
        p.host.mark_lost(&joiner_id, LinkState::Failed, "x", now);
        assert_eq!(p.host.tracked_failures(), 1);

        // Still pending: kept.
        p.host.expire(now + Duration::from_secs(60));
        assert_eq!(p.host.tracked_failures(), 1);

        // Retry handed out, the peer never answers.
        p.host.due_retries(now + Duration::from_secs(2));
        p.host.expire(now + Duration::from_secs(5));
        assert_eq!(p.host.tracked_failures(), 1);
        p.host.expire(now + Duration::from_secs(11));
        assert_eq!(p.host.tracked_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget() {
        let net = MemoryNetwork::new();
        let config = MeshConfig {
            retry: RetryPolicy { max_attempts: Some(1), ..RetryPolicy::default() },
            ..MeshConfig::default()
        };
        let peer = PeerId::new("p");
        let mut n = Negotiator::new(PeerId::new("me"), Arc::new(net), &config);
        let now = Instant::now();

        n.offer_to(&peer, now);
        n.mark_lost(&peer, LinkState::Failed, "x", now);
        assert_eq!(n.due_retries(now + Duration::from_secs(2)).len(), 1);

        n.offer_to(&peer, now);
        n.mark_lost(&peer, LinkState::Failed, "x", now);
        assert_eq!(n.pending_retries(), 0);
    }
}
