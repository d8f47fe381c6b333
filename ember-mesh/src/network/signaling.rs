//! Signaling Transport
//!
//! Best-effort broadcast medium used only to bootstrap direct links. No
//! ordering or delivery guarantees: receivers filter their own envelopes and
//! envelopes for other rooms, and tolerate duplicates.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::ids::{PeerId, RoomCode};
use crate::network::transport::{IceCandidate, SessionDescription};

/// Envelope type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Host created the room.
    HostReady,
    /// Joiner asks the host for an offer.
    JoinRequest,
    /// Session description from the initiator.
    Offer,
    /// Session description from the responder.
    Answer,
    /// Connectivity candidate.
    IceCandidate,
    /// Sender is leaving the room.
    LeaveRoom,
}

/// Envelope body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    /// Offer or answer.
    Description(SessionDescription),
    /// Candidate.
    Candidate(IceCandidate),
}

/// Control message on the signaling medium.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Envelope type.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Room the envelope belongs to.
    pub room_code: RoomCode,
    /// Sender.
    pub from_id: PeerId,
    /// Addressee, for directed envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<PeerId>,
    /// Body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SignalPayload>,
}

impl Envelope {
    /// A room-wide envelope without a body.
    pub fn broadcast(kind: SignalKind, room_code: RoomCode, from_id: PeerId) -> Self {
        Self { kind, room_code, from_id, to_id: None, payload: None }
    }

    /// An envelope addressed to one peer.
    pub fn directed(
        kind: SignalKind,
        room_code: RoomCode,
        from_id: PeerId,
        to_id: PeerId,
        payload: SignalPayload,
    ) -> Self {
        Self { kind, room_code, from_id, to_id: Some(to_id), payload: Some(payload) }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Whether `local` in room `room` should act on this envelope.
    pub fn is_for(&self, local: &PeerId, room: &RoomCode) -> bool {
        self.from_id != *local
            && self.room_code == *room
            && self.to_id.as_ref().map_or(true, |to| to == local)
    }

    /// The session description, if this envelope carries one.
    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            Some(SignalPayload::Description(d)) => Some(d),
            _ => None,
        }
    }

    /// The candidate, if this envelope carries one.
    pub fn candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            Some(SignalPayload::Candidate(c)) => Some(c),
            _ => None,
        }
    }
}

/// Signaling errors.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// Envelope could not be encoded.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Could not reach the relay.
    #[error("Relay connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// The medium is gone.
    #[error("Signaling medium unavailable")]
    Unavailable,
}

/// A broadcast medium for envelopes.
pub trait SignalingTransport: Send + Sync {
    /// Publish an envelope to every other listener. Implementations may
    /// echo it back to the publisher.
    fn publish(&self, envelope: &Envelope) -> Result<(), SignalError>;

    /// Start receiving envelopes published from now on.
    fn subscribe(&self) -> SignalInbox;
}

/// Receiving end of a signaling subscription.
#[derive(Debug)]
pub struct SignalInbox {
    rx: broadcast::Receiver<String>,
}

impl SignalInbox {
    /// Wrap a raw frame receiver.
    pub fn new(rx: broadcast::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next envelope, without waiting. Malformed frames are dropped.
    pub fn try_next(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => match Envelope::from_json(&frame) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => debug!("Dropping malformed signal: {}", e),
                },
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Signaling inbox lagged, {} envelopes lost", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Wait for the next envelope. `None` once the medium is closed.
    pub async fn next(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => match Envelope::from_json(&frame) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => debug!("Dropping malformed signal: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Signaling inbox lagged, {} envelopes lost", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process signaling bus shared by every session in the process.
#[derive(Clone, Debug)]
pub struct LocalBus {
    tx: broadcast::Sender<String>,
}

impl LocalBus {
    /// Create a bus buffering up to `capacity` frames per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a raw frame, bypassing envelope encoding.
    pub fn publish_raw(&self, frame: impl Into<String>) {
        let _ = self.tx.send(frame.into());
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SignalingTransport for LocalBus {
    fn publish(&self, envelope: &Envelope) -> Result<(), SignalError> {
        // No subscribers is not an error: nobody is listening yet.
        let _ = self.tx.send(envelope.to_json()?);
        Ok(())
    }

    fn subscribe(&self) -> SignalInbox {
        SignalInbox::new(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomCode {
        RoomCode::parse("ABC123").unwrap()
    }

    #[test]
    fn test_envelope_wire_format() {
        let env = Envelope::directed(
            SignalKind::IceCandidate,
            room(),
            PeerId::new("a"),
            PeerId::new("b"),
            SignalPayload::Candidate(IceCandidate::new("127.0.0.1:1")),
        );
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["roomCode"], "ABC123");
        assert_eq!(json["fromId"], "a");
        assert_eq!(json["toId"], "b");
        assert_eq!(json["payload"]["candidate"], "127.0.0.1:1");

        let back = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(back.candidate().map(|c| c.candidate.as_str()), Some("127.0.0.1:1"));
        assert!(back.description().is_none());
    }

    #[test]
    fn test_description_payload_parses() {
        let raw = r#"{"type":"offer","roomCode":"ABC123","fromId":"h","toId":"j",
                      "payload":{"type":"offer","sdp":"x"}}"#;
        let env = Envelope::from_json(raw).unwrap();
        assert_eq!(env.description(), Some(&SessionDescription::offer("x")));
    }

    #[test]
    fn test_filtering() {
        let me = PeerId::new("me");
        let env = Envelope::broadcast(SignalKind::HostReady, room(), me.clone());
        assert!(!env.is_for(&me, &room()), "own envelopes are ignored");

        let other = Envelope::broadcast(SignalKind::JoinRequest, room(), PeerId::new("x"));
        assert!(other.is_for(&me, &room()));
        assert!(!other.is_for(&me, &RoomCode::parse("ZZZ999").unwrap()));

        let mut directed = other.clone();
        directed.to_id = Some(PeerId::new("someone-else"));
        assert!(!directed.is_for(&me, &room()));
    }

    #[test]
    fn test_bad_room_code_rejected() {
        let raw = r#"{"type":"host-ready","roomCode":"abc","fromId":"h"}"#;
        assert!(Envelope::from_json(raw).is_err());
    }

    #[test]
    fn test_bus_drops_malformed_frames() {
        let bus = LocalBus::default();
        let mut inbox = bus.subscribe();
        bus.publish_raw("{not json");
        bus.publish(&Envelope::broadcast(SignalKind::HostReady, room(), PeerId::new("h")))
            .unwrap();
        let env = inbox.try_next().unwrap();
        assert_eq!(env.kind, SignalKind::HostReady);
        assert!(inbox.try_next().is_none());
    }
}
