//! Entity Snapshots
//!
//! Serializable state of one simulated participant, plus the partial form
//! carried by periodic `playerState` updates.

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::ids::EntityId;
use crate::game::map::SpawnPoint;

/// Health of a freshly spawned entity.
pub const MAX_HEALTH: f32 = 100.0;

/// Fuel gauge of a freshly spawned entity.
pub const MAX_FUEL: f32 = 100.0;

// =============================================================================
// WEAPON
// =============================================================================

/// Equipped weapon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weapon {
    /// Default sidearm.
    #[default]
    Pistol,
    /// Fast, low damage.
    Rifle,
    /// Five-pellet spread.
    Shotgun,
}

impl Weapon {
    /// Damage dealt by one projectile.
    pub fn damage(self) -> f32 {
        match self {
            Weapon::Pistol => 25.0,
            Weapon::Rifle => 15.0,
            Weapon::Shotgun => 10.0,
        }
    }
}

// =============================================================================
// FACING
// =============================================================================

/// Horizontal facing. On the wire: `1` (right) or `-1` (left).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Facing {
    /// Facing left.
    Left,
    /// Facing right.
    #[default]
    Right,
}

impl TryFrom<i8> for Facing {
    type Error = String;

    fn try_from(sign: i8) -> Result<Self, Self::Error> {
        match sign {
            1 => Ok(Facing::Right),
            -1 => Ok(Facing::Left),
            other => Err(format!("facing must be 1 or -1, got {other}")),
        }
    }
}

impl From<Facing> for i8 {
    fn from(facing: Facing) -> Self {
        match facing {
            Facing::Right => 1,
            Facing::Left => -1,
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Full state of one entity.
///
/// For the local entity this is authoritative; for remote entities it is
/// the last value received from the owning peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    /// Entity id (the owning peer's id).
    pub id: EntityId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Position x.
    pub x: f32,
    /// Position y.
    pub y: f32,
    /// Velocity x.
    #[serde(default)]
    pub vx: f32,
    /// Velocity y.
    #[serde(default)]
    pub vy: f32,
    /// Remaining health.
    pub health: f32,
    /// Jetpack fuel gauge.
    #[serde(rename = "jetpackFuel", default = "full_fuel")]
    pub fuel: f32,
    /// Equipped weapon.
    #[serde(default)]
    pub weapon: Weapon,
    /// Facing sign.
    #[serde(default)]
    pub facing: Facing,
    /// Jetpack thrust active while airborne.
    #[serde(rename = "isUsingJetpack", default)]
    pub thrusting: bool,
    /// Standing on a surface.
    #[serde(rename = "isOnGround", default)]
    pub grounded: bool,
    /// Defeated and waiting to respawn.
    #[serde(rename = "isDead", default)]
    pub defeated: bool,
    /// Kill counter.
    #[serde(default)]
    pub kills: u32,
    /// Death counter.
    #[serde(default)]
    pub deaths: u32,
    /// Avatar identifier.
    #[serde(default)]
    pub avatar_id: String,
}

fn full_fuel() -> f32 {
    MAX_FUEL
}

impl EntitySnapshot {
    /// A freshly spawned entity at `spawn`.
    pub fn spawn(
        id: EntityId,
        name: impl Into<String>,
        avatar_id: impl Into<String>,
        spawn: SpawnPoint,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            x: spawn.x,
            y: spawn.y,
            vx: 0.0,
            vy: 0.0,
            health: MAX_HEALTH,
            fuel: MAX_FUEL,
            weapon: Weapon::Pistol,
            facing: Facing::Right,
            thrusting: false,
            grounded: false,
            defeated: false,
            kills: 0,
            deaths: 0,
            avatar_id: avatar_id.into(),
        }
    }

    /// Velocity magnitude.
    pub fn speed(&self) -> f32 {
        self.vx.hypot(self.vy)
    }

    /// Every field as a patch, for the periodic `playerState` broadcast.
    pub fn to_patch(&self) -> EntityPatch {
        EntityPatch {
            id: self.id.clone(),
            name: Some(self.name.clone()),
            x: Some(self.x),
            y: Some(self.y),
            vx: Some(self.vx),
            vy: Some(self.vy),
            health: Some(self.health),
            fuel: Some(self.fuel),
            weapon: Some(self.weapon),
            facing: Some(self.facing),
            thrusting: Some(self.thrusting),
            grounded: Some(self.grounded),
            defeated: Some(self.defeated),
            kills: Some(self.kills),
            deaths: Some(self.deaths),
            avatar_id: Some(self.avatar_id.clone()),
        }
    }

    /// Overwrite the fields present in `patch`. The id is never changed.
    pub fn merge(&mut self, patch: &EntityPatch) {
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(vx) = patch.vx {
            self.vx = vx;
        }
        if let Some(vy) = patch.vy {
            self.vy = vy;
        }
        self.merge_discrete(patch);
    }

    /// Overwrite only the discrete fields present in `patch`: everything
    /// except position.
    pub fn merge_discrete(&mut self, patch: &EntityPatch) {
        if let Some(health) = patch.health {
            self.health = health;
        }
        if let Some(fuel) = patch.fuel {
            self.fuel = fuel;
        }
        if let Some(weapon) = patch.weapon {
            self.weapon = weapon;
        }
        if let Some(facing) = patch.facing {
            self.facing = facing;
        }
        if let Some(thrusting) = patch.thrusting {
            self.thrusting = thrusting;
        }
        if let Some(grounded) = patch.grounded {
            self.grounded = grounded;
        }
        if let Some(defeated) = patch.defeated {
            self.defeated = defeated;
        }
        if let Some(kills) = patch.kills {
            self.kills = kills;
        }
        if let Some(deaths) = patch.deaths {
            self.deaths = deaths;
        }
        if let Some(avatar_id) = &patch.avatar_id {
            self.avatar_id.clone_from(avatar_id);
        }
    }
}

// =============================================================================
// PATCH
// =============================================================================

/// Partial snapshot keyed by id. Absent fields keep their last value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    /// Target entity id.
    pub id: EntityId,
    /// Display name.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Position x.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub x: Option<f32>,
    /// Position y.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub y: Option<f32>,
    /// Velocity x.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub vx: Option<f32>,
    /// Velocity y.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub vy: Option<f32>,
    /// Remaining health.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub health: Option<f32>,
    /// Jetpack fuel gauge.
    #[serde(rename = "jetpackFuel", default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub fuel: Option<f32>,
    /// Equipped weapon.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub weapon: Option<Weapon>,
    /// Facing sign.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub facing: Option<Facing>,
    /// Jetpack thrust.
    #[serde(rename = "isUsingJetpack", default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub thrusting: Option<bool>,
    /// Grounded flag.
    #[serde(rename = "isOnGround", default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub grounded: Option<bool>,
    /// Defeated flag.
    #[serde(rename = "isDead", default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub defeated: Option<bool>,
    /// Kill counter.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub kills: Option<u32>,
    /// Death counter.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub deaths: Option<u32>,
    /// Avatar identifier.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<String>,
}

/// A patch field may be absent, but when present it must hold a value:
/// `"x": null` fails the whole payload instead of reading as "unchanged".
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl EntityPatch {
    /// An empty patch for `id`.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            name: None,
            x: None,
            y: None,
            vx: None,
            vy: None,
            health: None,
            fuel: None,
            weapon: None,
            facing: None,
            thrusting: None,
            grounded: None,
            defeated: None,
            kills: None,
            deaths: None,
            avatar_id: None,
        }
    }

    /// Set the position.
    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    /// Set the velocity.
    pub fn with_velocity(mut self, vx: f32, vy: f32) -> Self {
        self.vx = Some(vx);
        self.vy = Some(vy);
        self
    }

    /// Set the health.
    pub fn with_health(mut self, health: f32) -> Self {
        self.health = Some(health);
        self
    }

    /// Set the defeated flag.
    pub fn with_defeated(mut self, defeated: bool) -> Self {
        self.defeated = Some(defeated);
        self
    }
}
