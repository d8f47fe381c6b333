//! Ingestion Checks
//!
//! Best-effort sanity checks applied to inbound payloads. Out-of-range
//! values are rejected, never clamped. This is anti-corruption, not
//! anti-cheat.

use crate::game::entity::{EntityPatch, EntitySnapshot};
use crate::game::events::Projectile;
use crate::game::map::MapBounds;

/// Why an inbound payload was dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    /// NaN or infinite numeric field.
    #[error("non-finite value in field {0}")]
    NonFinite(&'static str),

    /// Position outside the map.
    #[error("{axis} = {value} outside map bounds")]
    OutOfBounds {
        /// Offending axis.
        axis: &'static str,
        /// Offending value.
        value: f32,
    },

    /// Velocity magnitude above the ceiling.
    #[error("speed {speed} exceeds ceiling {ceiling}")]
    TooFast {
        /// Observed speed.
        speed: f32,
        /// Configured ceiling.
        ceiling: f32,
    },

    /// Update targeting the locally simulated entity.
    #[error("payload targets the local entity")]
    LocalEntity,

    /// Update for an entity that was never announced.
    #[error("unknown entity")]
    UnknownEntity,

    /// Projectile fired by the local entity.
    #[error("projectile owned by the local entity")]
    OwnProjectile,

    /// Event already applied.
    #[error("duplicate event")]
    Duplicate,

    /// Negative or non-finite damage amount.
    #[error("invalid damage amount {0}")]
    InvalidAmount(f32),
}

/// Limits consulted at ingestion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IngestLimits {
    /// Current map bounds.
    pub bounds: MapBounds,
    /// Entity velocity ceiling.
    pub max_entity_speed: f32,
    /// Projectile velocity ceiling.
    pub max_projectile_speed: f32,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            bounds: MapBounds::default(),
            max_entity_speed: 40.0,
            max_projectile_speed: 30.0,
        }
    }
}

fn finite(field: &'static str, value: f32) -> Result<f32, Rejection> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Rejection::NonFinite(field))
    }
}

impl IngestLimits {
    fn check_position(&self, x: Option<f32>, y: Option<f32>) -> Result<(), Rejection> {
        if let Some(x) = x {
            let x = finite("x", x)?;
            if !self.bounds.contains_x(x) {
                return Err(Rejection::OutOfBounds { axis: "x", value: x });
            }
        }
        if let Some(y) = y {
            let y = finite("y", y)?;
            if !self.bounds.contains_y(y) {
                return Err(Rejection::OutOfBounds { axis: "y", value: y });
            }
        }
        Ok(())
    }

    fn check_velocity(vx: f32, vy: f32, ceiling: f32) -> Result<(), Rejection> {
        let vx = finite("vx", vx)?;
        let vy = finite("vy", vy)?;
        let speed = vx.hypot(vy);
        if speed > ceiling {
            return Err(Rejection::TooFast { speed, ceiling });
        }
        Ok(())
    }

    /// Validate a full snapshot (`playerJoin`).
    pub fn check_snapshot(&self, snapshot: &EntitySnapshot) -> Result<(), Rejection> {
        self.check_position(Some(snapshot.x), Some(snapshot.y))?;
        Self::check_velocity(snapshot.vx, snapshot.vy, self.max_entity_speed)?;
        finite("health", snapshot.health)?;
        finite("jetpackFuel", snapshot.fuel)?;
        Ok(())
    }

    /// Validate a partial update (`playerState`) against the state it will
    /// be merged into. The speed ceiling applies to the merged velocity, so
    /// a missing component keeps `current`'s value.
    pub fn check_patch(&self, patch: &EntityPatch, current: &EntitySnapshot) -> Result<(), Rejection> {
        self.check_position(patch.x, patch.y)?;
        if patch.vx.is_some() || patch.vy.is_some() {
            Self::check_velocity(
                patch.vx.unwrap_or(current.vx),
                patch.vy.unwrap_or(current.vy),
                self.max_entity_speed,
            )?;
        }
        if let Some(health) = patch.health {
            finite("health", health)?;
        }
        if let Some(fuel) = patch.fuel {
            finite("jetpackFuel", fuel)?;
        }
        Ok(())
    }

    /// Validate a projectile spawn (`bullet`).
    pub fn check_projectile(&self, projectile: &Projectile) -> Result<(), Rejection> {
        self.check_position(Some(projectile.x), Some(projectile.y))?;
        Self::check_velocity(projectile.vx, projectile.vy, self.max_projectile_speed)
    }

    /// Validate a damage amount.
    pub fn check_damage(amount: f32) -> Result<f32, Rejection> {
        if amount.is_finite() && amount >= 0.0 {
            Ok(amount)
        } else {
            Err(Rejection::InvalidAmount(amount))
        }
    }
}
