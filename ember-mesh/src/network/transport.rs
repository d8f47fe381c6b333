//! Direct Transport
//!
//! The seam between the negotiator and whatever carries the reliable,
//! ordered channel between two peers. Implementations never call back into
//! the negotiator directly: every asynchronous outcome is reported as a
//! [`LinkEvent`] tagged with the link instance it belongs to, and the
//! session drains those events on its tick.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::ids::PeerId;

// =============================================================================
// SESSION DESCRIPTIONS
// =============================================================================

/// Offer or answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    /// Initiator's description.
    Offer,
    /// Responder's description.
    Answer,
}

/// An opaque session description carried over signaling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    /// Transport-specific body.
    pub sdp: String,
}

impl SessionDescription {
    /// An offer.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: DescriptionKind::Offer, sdp: sdp.into() }
    }

    /// An answer.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: DescriptionKind::Answer, sdp: sdp.into() }
    }
}

/// One connectivity candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Transport-specific candidate line.
    pub candidate: String,
    /// Media stream tag, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl IceCandidate {
    /// A candidate without a stream tag.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self { candidate: candidate.into(), sdp_mid: None }
    }
}

// =============================================================================
// LINK EVENTS
// =============================================================================

/// Identifies one link instance. A re-negotiation always gets a fresh id,
/// so events from a superseded instance can be recognised and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Something a connection observed.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkSignal {
    /// A local candidate to publish to the peer.
    LocalCandidate(IceCandidate),
    /// The channel is open in both directions.
    Open,
    /// A text frame from the peer.
    Message(String),
    /// The peer or the transport closed the channel.
    Closed,
    /// The underlying connection failed.
    Failed(String),
}

/// A signal tagged with the link it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkEvent {
    /// Remote peer.
    pub peer: PeerId,
    /// Link instance.
    pub link: LinkId,
    /// What happened.
    pub signal: LinkSignal,
}

/// Handed to the transport when a connection is created.
#[derive(Clone, Debug)]
pub struct LinkContext {
    /// Local peer id.
    pub local: PeerId,
    /// Remote peer id.
    pub peer: PeerId,
    /// Link instance.
    pub link: LinkId,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkContext {
    /// Create a context reporting into `events`.
    pub fn new(
        local: PeerId,
        peer: PeerId,
        link: LinkId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self { local, peer, link, events }
    }

    /// Report a signal. Dropped silently once the session is gone.
    pub fn emit(&self, signal: LinkSignal) {
        let _ = self.events.send(LinkEvent {
            peer: self.peer.clone(),
            link: self.link,
            signal,
        });
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Description could not be understood.
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Candidate could not be understood.
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Operation not valid in the connection's current phase.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Channel already closed.
    #[error("Channel closed")]
    Closed,

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates connections.
pub trait DirectTransport: Send + Sync {
    /// Start a connection as the initiator.
    fn create_offer(
        &self,
        ctx: LinkContext,
    ) -> Result<(Box<dyn Connection>, SessionDescription), TransportError>;

    /// Answer a remote offer.
    fn create_answer(
        &self,
        ctx: LinkContext,
        offer: &SessionDescription,
    ) -> Result<(Box<dyn Connection>, SessionDescription), TransportError>;
}

/// One side of a direct link.
pub trait Connection: Send {
    /// Apply the responder's answer (initiator only).
    fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError>;

    /// Apply a remote candidate. May be called before or after the answer.
    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Queue a text frame. Never blocks.
    fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close the link and release its resources. Idempotent.
    fn close(&mut self);
}
