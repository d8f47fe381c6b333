//! Transient Events
//!
//! One-shot occurrences carried over the channel: projectile spawns and
//! damage. Delivery is at-least-once, so receivers de-duplicate by
//! `(origin, seq)` when the sender supplies a sequence number.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::ids::PeerId;
use crate::game::entity::Weapon;

/// A projectile spawn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projectile {
    /// Spawn x.
    pub x: f32,
    /// Spawn y.
    pub y: f32,
    /// Velocity x.
    pub vx: f32,
    /// Velocity y.
    pub vy: f32,
    /// Entity that fired it.
    pub owner_id: PeerId,
    /// Weapon that fired it.
    pub weapon_type: Weapon,
    /// Per-owner sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Projectile {
    /// Damage dealt on hit.
    pub fn damage(&self) -> f32 {
        self.weapon_type.damage()
    }
}

/// Kind of transient event, tracked separately in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// `bullet`
    Projectile,
    /// `damage`
    Damage,
}

/// Highest sequence number seen per `(kind, origin)`.
#[derive(Clone, Debug, Default)]
pub struct EventLedger {
    seen: BTreeMap<(EventKind, PeerId), u64>,
}

impl EventLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event and report whether it should be applied.
    ///
    /// Events without a sequence number are always admitted.
    pub fn admit(&mut self, kind: EventKind, origin: &PeerId, seq: Option<u64>) -> bool {
        let Some(seq) = seq else {
            return true;
        };
        match self.seen.get_mut(&(kind, origin.clone())) {
            Some(last) if seq <= *last => false,
            Some(last) => {
                *last = seq;
                true
            }
            None => {
                self.seen.insert((kind, origin.clone()), seq);
                true
            }
        }
    }

    /// Forget an origin, e.g. after it left. A restarted peer starts its
    /// sequence over.
    pub fn forget(&mut self, origin: &PeerId) {
        self.seen.retain(|(_, id), _| id != origin);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Issues sequence numbers for locally originated events.
#[derive(Clone, Debug, Default)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    /// Take the next number. Starts at 1.
    pub fn next_seq(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}
