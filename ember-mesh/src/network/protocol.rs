//! Channel Protocol
//!
//! Typed messages exchanged over an open direct link. Every message is a
//! JSON object tagged by `type`. Delivery within one link is reliable and
//! ordered; there is no ordering across links.
//!
//! Links form a star around the host. The host forwards what one joiner
//! writes to every other joiner inside a `relay` wrapper naming the
//! original writer, and tells them with `playerLeave` when a joiner is gone.

use serde::{Deserialize, Serialize};

use crate::core::ids::{EntityId, PeerId};
use crate::game::entity::{EntityPatch, EntitySnapshot};
use crate::game::events::Projectile;
use crate::network::room::MatchConfig;

/// Longest chat line forwarded, in characters.
pub const MAX_CHAT_LEN: usize = 200;

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelMessage {
    /// Full snapshot of the sender's entity. Upsert.
    PlayerJoin {
        /// Snapshot.
        player: EntitySnapshot,
    },

    /// Periodic partial state of the sender's entity.
    PlayerState {
        /// Patch keyed by entity id.
        state: EntityPatch,
    },

    /// Projectile spawn.
    Bullet {
        /// Projectile.
        bullet: Projectile,
    },

    /// Damage detected by the sender.
    #[serde(rename_all = "camelCase")]
    Damage {
        /// Entity hit.
        player_id: EntityId,
        /// Health removed.
        damage: f32,
        /// Entity credited with the hit.
        attacker_id: EntityId,
        /// Per-sender sequence number.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    /// Match configuration. Only honored from the host.
    MatchSettings {
        /// Configuration.
        settings: MatchConfig,
    },

    /// Ask the receiver to re-announce its own `playerJoin`.
    RequestPlayerSync,

    /// Liveness ping.
    Ping {
        /// Sender's clock, milliseconds.
        timestamp: u64,
    },

    /// Echo of a ping.
    Pong {
        /// The ping timestamp, unchanged.
        timestamp: u64,
    },

    /// Chat line. No state effect.
    Chat {
        /// Sender display name.
        sender: String,
        /// Text.
        text: String,
    },

    /// A message written by `origin`, forwarded by the host.
    Relay {
        /// Peer that wrote the message.
        origin: PeerId,
        /// The message as written.
        message: Box<ChannelMessage>,
    },

    /// The host removed this entity.
    #[serde(rename_all = "camelCase")]
    PlayerLeave {
        /// Entity gone.
        player_id: EntityId,
    },
}

impl ChannelMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::PlayerJoin { .. } => "playerJoin",
            ChannelMessage::PlayerState { .. } => "playerState",
            ChannelMessage::Bullet { .. } => "bullet",
            ChannelMessage::Damage { .. } => "damage",
            ChannelMessage::MatchSettings { .. } => "matchSettings",
            ChannelMessage::RequestPlayerSync => "requestPlayerSync",
            ChannelMessage::Ping { .. } => "ping",
            ChannelMessage::Pong { .. } => "pong",
            ChannelMessage::Chat { .. } => "chat",
            ChannelMessage::Relay { .. } => "relay",
            ChannelMessage::PlayerLeave { .. } => "playerLeave",
        }
    }

    /// Whether the host forwards this message to the other joiners. Link
    /// housekeeping and host-only messages stay on their link.
    pub fn is_relayable(&self) -> bool {
        matches!(
            self,
            ChannelMessage::PlayerJoin { .. }
                | ChannelMessage::PlayerState { .. }
                | ChannelMessage::Bullet { .. }
                | ChannelMessage::Damage { .. }
                | ChannelMessage::Chat { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Weapon;

    #[test]
    fn test_tags_and_field_names() {
        let msg = ChannelMessage::Damage {
            player_id: PeerId::new("b"),
            damage: 25.0,
            attacker_id: PeerId::new("a"),
            seq: None,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "damage");
        assert_eq!(json["playerId"], "b");
        assert_eq!(json["attackerId"], "a");
        assert!(json.get("seq").is_none());

        let sync = ChannelMessage::RequestPlayerSync.to_json().unwrap();
        assert_eq!(sync, r#"{"type":"requestPlayerSync"}"#);
    }

    #[test]
    fn test_parse_peer_bullet() {
        let raw = r#"{"type":"bullet","bullet":{"x":10,"y":20,"vx":12,"vy":0,
                      "ownerId":"A","weaponType":"shotgun","seq":4}}"#;
        match ChannelMessage::from_json(raw).unwrap() {
            ChannelMessage::Bullet { bullet } => {
                assert_eq!(bullet.weapon_type, Weapon::Shotgun);
                assert_eq!(bullet.seq, Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_match_settings() {
        let raw = r#"{"type":"matchSettings","settings":{"duration":300,"mapId":"ember","startTime":5}}"#;
        let msg = ChannelMessage::from_json(raw).unwrap();
        assert_eq!(
            msg,
            ChannelMessage::MatchSettings {
                settings: MatchConfig::new(300, "ember").started_at(5),
            }
        );
        assert_eq!(msg.kind(), "matchSettings");
    }

    #[test]
    fn test_relay_wraps_original_writer() {
        let raw = r#"{"type":"relay","origin":"A",
                      "message":{"type":"chat","sender":"Ava","text":"hi"}}"#;
        let msg = ChannelMessage::from_json(raw).unwrap();
        match &msg {
            ChannelMessage::Relay { origin, message } => {
                assert_eq!(origin.as_str(), "A");
                assert!(message.is_relayable());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!msg.is_relayable());
        assert!(!ChannelMessage::RequestPlayerSync.is_relayable());
        assert!(!ChannelMessage::Ping { timestamp: 1 }.is_relayable());

        let leave = ChannelMessage::PlayerLeave { player_id: PeerId::new("A") }.to_json().unwrap();
        assert_eq!(leave, r#"{"type":"playerLeave","playerId":"A"}"#);
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(ChannelMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ChannelMessage::from_json(r#"{"type":"playerState","state":{"x":1}}"#).is_err());
        assert!(ChannelMessage::from_json(
            r#"{"type":"playerState","state":{"id":"b","x":"left"}}"#
        )
        .is_err());
    }
}
