//! Simulation State Module
//!
//! Entity snapshots and the engine that reconciles them.
//!
//! ## Module Structure
//!
//! - `entity`: Entity snapshots, partial updates, weapons
//! - `events`: Transient events and their de-duplication ledger
//! - `map`: Map catalog, bounds and spawn points
//! - `validate`: Ingestion checks for inbound payloads
//! - `reconcile`: Local/remote merge, smoothing, damage, scoring

pub mod entity;
pub mod events;
pub mod map;
pub mod validate;
pub mod reconcile;

// Re-export key types
pub use entity::{EntityPatch, EntitySnapshot, Facing, Weapon};
pub use events::{EventLedger, Projectile};
pub use map::{MapBounds, MapCatalog, MapDefinition, SpawnPoint};
pub use reconcile::{DamageOutcome, Reconciler, RemoteEntity, ScoreLine};
pub use validate::{IngestLimits, Rejection};
