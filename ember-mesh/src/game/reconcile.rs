//! Reconciliation Engine
//!
//! Merges the authoritative local entity with best-effort remote state into
//! the view that rendering and physics read.
//!
//! ## Rules
//!
//! - The local entity is only ever written by the local tick owner.
//! - Remote updates are last-write-wins by receipt order.
//! - Continuous motion is smoothed toward the network target; discrete
//!   fields snap immediately.
//! - A remote entity not heard from within the staleness threshold freezes.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::core::ids::{EntityId, PeerId};
use crate::game::entity::{EntityPatch, EntitySnapshot};
use crate::game::events::{EventKind, EventLedger, Projectile};
use crate::game::map::MapBounds;
use crate::game::validate::{IngestLimits, Rejection};

/// A remote entity as seen locally.
#[derive(Clone, Debug)]
pub struct RemoteEntity {
    /// What rendering reads: smoothed position, latest discrete fields.
    pub view: EntitySnapshot,
    /// Latest state received from the owner.
    pub target: EntitySnapshot,
    /// When `target` was last written.
    pub received_at: Instant,
}

impl RemoteEntity {
    fn new(snapshot: EntitySnapshot, now: Instant) -> Self {
        Self { view: snapshot.clone(), target: snapshot, received_at: now }
    }

    /// Whether the entity has gone quiet.
    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.received_at) > stale_after
    }
}

/// Result of applying damage.
#[derive(Clone, Debug, PartialEq)]
pub struct DamageOutcome {
    /// Entity that took the damage.
    pub target: EntityId,
    /// Health after the hit.
    pub health: f32,
    /// This hit took the entity from alive to defeated.
    pub defeated_now: bool,
}

/// Whether a `playerJoin` created or refreshed an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First announcement.
    Created,
    /// Full overwrite of a known entity.
    Refreshed,
}

/// One row of the scoreboard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoreLine {
    /// Entity id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Kills.
    pub kills: u32,
    /// Deaths.
    pub deaths: u32,
    /// Whether this is the local entity.
    pub local: bool,
}

/// Owns the entity table.
#[derive(Debug)]
pub struct Reconciler {
    local: Option<EntitySnapshot>,
    remotes: BTreeMap<EntityId, RemoteEntity>,
    limits: IngestLimits,
    smoothing: f32,
    stale_after: Duration,
    ledger: EventLedger,
}

impl Reconciler {
    /// Create an empty table.
    pub fn new(limits: IngestLimits, smoothing: f32, stale_after: Duration) -> Self {
        Self {
            local: None,
            remotes: BTreeMap::new(),
            limits,
            smoothing: smoothing.clamp(0.0, 1.0),
            stale_after,
            ledger: EventLedger::new(),
        }
    }

    // =========================================================================
    // LOCAL ENTITY
    // =========================================================================

    /// Replace the local entity. Any remote entry under the same id is
    /// dropped.
    pub fn set_local(&mut self, snapshot: EntitySnapshot) {
        self.remotes.remove(&snapshot.id);
        self.local = Some(snapshot);
    }

    /// The local entity, if spawned.
    pub fn local(&self) -> Option<&EntitySnapshot> {
        self.local.as_ref()
    }

    /// Mutable access for the local tick owner.
    pub fn local_mut(&mut self) -> Option<&mut EntitySnapshot> {
        self.local.as_mut()
    }

    fn is_local(&self, id: &EntityId) -> bool {
        self.local.as_ref().is_some_and(|l| &l.id == id)
    }

    // =========================================================================
    // INBOUND STATE
    // =========================================================================

    /// Apply a `playerJoin`: create the remote entity or overwrite it fully.
    pub fn apply_join(
        &mut self,
        snapshot: EntitySnapshot,
        now: Instant,
    ) -> Result<JoinOutcome, Rejection> {
        if self.is_local(&snapshot.id) {
            return Err(Rejection::LocalEntity);
        }
        self.limits.check_snapshot(&snapshot)?;

        match self.remotes.get_mut(&snapshot.id) {
            Some(remote) => {
                *remote = RemoteEntity::new(snapshot, now);
                Ok(JoinOutcome::Refreshed)
            }
            None => {
                debug!(entity = %snapshot.id.short(), "remote entity created");
                self.remotes.insert(snapshot.id.clone(), RemoteEntity::new(snapshot, now));
                Ok(JoinOutcome::Created)
            }
        }
    }

    /// Apply a `playerState` patch to a known remote entity.
    pub fn apply_state(
        &mut self,
        patch: &EntityPatch,
        now: Instant,
    ) -> Result<(), Rejection> {
        if self.is_local(&patch.id) {
            return Err(Rejection::LocalEntity);
        }
        let limits = self.limits;
        let remote = self.remotes.get_mut(&patch.id).ok_or(Rejection::UnknownEntity)?;
        limits.check_patch(patch, &remote.target)?;

        remote.target.merge(patch);
        remote.view.merge_discrete(patch);
        if let Some(name) = &patch.name {
            remote.view.name.clone_from(name);
        }
        if let Some(vx) = patch.vx {
            remote.view.vx = vx;
        }
        if let Some(vy) = patch.vy {
            remote.view.vy = vy;
        }
        remote.received_at = now;
        Ok(())
    }

    /// Advance smoothing by one tick.
    pub fn step(&mut self, now: Instant) {
        let alpha = self.smoothing;
        for remote in self.remotes.values_mut() {
            if remote.is_stale(now, self.stale_after) {
                continue;
            }
            remote.view.x += (remote.target.x - remote.view.x) * alpha;
            remote.view.y += (remote.target.y - remote.view.y) * alpha;
        }
    }

    // =========================================================================
    // TRANSIENT EVENTS
    // =========================================================================

    /// Decide whether an inbound projectile should be spawned.
    pub fn admit_projectile(&mut self, projectile: &Projectile) -> Result<(), Rejection> {
        if self.is_local(&projectile.owner_id) {
            return Err(Rejection::OwnProjectile);
        }
        self.limits.check_projectile(projectile)?;
        if !self.ledger.admit(EventKind::Projectile, &projectile.owner_id, projectile.seq) {
            return Err(Rejection::Duplicate);
        }
        Ok(())
    }

    /// Apply an inbound `damage` event. Never touches the local entity.
    pub fn apply_remote_damage(
        &mut self,
        origin: &PeerId,
        target: &EntityId,
        amount: f32,
        attacker: &EntityId,
        seq: Option<u64>,
    ) -> Result<DamageOutcome, Rejection> {
        if self.is_local(target) {
            return Err(Rejection::LocalEntity);
        }
        let amount = IngestLimits::check_damage(amount)?;
        if !self.remotes.contains_key(target) {
            return Err(Rejection::UnknownEntity);
        }
        if !self.ledger.admit(EventKind::Damage, origin, seq) {
            return Err(Rejection::Duplicate);
        }
        self.damage(target, amount, attacker, false).ok_or(Rejection::UnknownEntity)
    }

    /// Apply damage detected by the local simulation. May target the local
    /// entity.
    pub fn apply_reported_damage(
        &mut self,
        target: &EntityId,
        amount: f32,
        attacker: &EntityId,
    ) -> Result<DamageOutcome, Rejection> {
        let amount = IngestLimits::check_damage(amount)?;
        self.damage(target, amount, attacker, true).ok_or(Rejection::UnknownEntity)
    }

    fn damage(
        &mut self,
        target: &EntityId,
        amount: f32,
        attacker: &EntityId,
        may_touch_local: bool,
    ) -> Option<DamageOutcome> {
        let entity = self.entity_mut(target)?;
        let was_defeated = entity.defeated;
        entity.health = (entity.health - amount).max(0.0);
        let health = entity.health;
        let defeated_now = health <= 0.0 && !was_defeated;
        if defeated_now {
            entity.defeated = true;
            entity.deaths += 1;
        }
        if let Some(remote) = self.remotes.get_mut(target) {
            remote.target.health = health;
            remote.target.defeated = remote.view.defeated;
            remote.target.deaths = remote.view.deaths;
        }

        if defeated_now && attacker != target && (may_touch_local || !self.is_local(attacker)) {
            if let Some(scorer) = self.entity_mut(attacker) {
                scorer.kills += 1;
            }
            if let Some(remote) = self.remotes.get_mut(attacker) {
                remote.target.kills = remote.view.kills;
            }
        }

        Some(DamageOutcome { target: target.clone(), health, defeated_now })
    }

    fn entity_mut(&mut self, id: &EntityId) -> Option<&mut EntitySnapshot> {
        match self.local.as_mut() {
            Some(local) if &local.id == id => Some(local),
            _ => self.remotes.get_mut(id).map(|r| &mut r.view),
        }
    }

    // =========================================================================
    // TABLE
    // =========================================================================

    /// Remove a remote entity and forget its event history.
    pub fn remove(&mut self, id: &EntityId) -> Option<EntitySnapshot> {
        self.ledger.forget(id);
        self.remotes.remove(id).map(|r| r.view)
    }

    /// Drop everything, including the local entity.
    pub fn reset(&mut self) {
        self.local = None;
        self.remotes.clear();
        self.ledger.clear();
    }

    /// Switch to a new map's bounds.
    pub fn set_bounds(&mut self, bounds: MapBounds) {
        self.limits.bounds = bounds;
    }

    /// Current ingestion limits.
    pub fn limits(&self) -> &IngestLimits {
        &self.limits
    }

    /// A remote entity by id.
    pub fn remote(&self, id: &EntityId) -> Option<&RemoteEntity> {
        self.remotes.get(id)
    }

    /// Rendered views of all remote entities, ordered by id.
    pub fn remote_views(&self) -> Vec<EntitySnapshot> {
        self.remotes.values().map(|r| r.view.clone()).collect()
    }

    /// Latest received state of every remote entity, ordered by id.
    pub fn remote_snapshots(&self) -> Vec<EntitySnapshot> {
        self.remotes.values().map(|r| r.target.clone()).collect()
    }

    /// Number of remote entities.
    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// Everyone, sorted by kills descending then deaths ascending.
    pub fn scoreboard(&self) -> Vec<ScoreLine> {
        let mut lines: Vec<ScoreLine> = self
            .local
            .iter()
            .map(|e| (e, true))
            .chain(self.remotes.values().map(|r| (&r.view, false)))
            .map(|(e, local)| ScoreLine {
                id: e.id.clone(),
                name: e.name.clone(),
                kills: e.kills,
                deaths: e.deaths,
                local,
            })
            .collect();
        lines.sort_by(|a, b| b.kills.cmp(&a.kills).then(a.deaths.cmp(&b.deaths)));
        lines
    }
}
