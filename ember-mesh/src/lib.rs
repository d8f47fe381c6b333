//! # Ember Mesh
//!
//! Peer-to-peer session layer for small real-time matches: room codes over a
//! best-effort signaling medium, direct links negotiated per peer, and a
//! reconciliation engine that merges authoritative local state with
//! best-effort remote state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EMBER MESH                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Identifiers                              │
//! │  └── ids.rs       - Peer ids, room codes                     │
//! │                                                              │
//! │  game/            - Reconciliation engine                    │
//! │  ├── entity.rs    - Snapshots, patches, weapons              │
//! │  ├── events.rs    - Projectiles, event de-duplication        │
//! │  ├── map.rs       - Map catalog and bounds                   │
//! │  ├── validate.rs  - Ingestion checks                         │
//! │  └── reconcile.rs - Entity table, smoothing, damage          │
//! │                                                              │
//! │  network/         - Signaling, links, protocol               │
//! │  ├── signaling.rs - Envelopes, in-process bus                │
//! │  ├── relay.rs     - WebSocket relay hub and client           │
//! │  ├── transport.rs - Direct link traits                       │
//! │  ├── memory.rs    - In-process links                         │
//! │  ├── websocket.rs - WebSocket links                          │
//! │  ├── room.rs      - Room directory, match config             │
//! │  ├── negotiator.rs- Per-peer handshake state machine         │
//! │  ├── protocol.rs  - Channel messages                         │
//! │  ├── liveness.rs  - Ping, RTT, counters                      │
//! │  └── session.rs   - MeshSession context object               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! A [`MeshSession`] is driven from one task by calling
//! [`MeshSession::tick`] once per simulation tick. Transports run their I/O
//! on Tokio tasks and report back through queues, so the session needs no
//! locks and never waits on the network.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{MeshConfig, RetryPolicy};
pub use core::ids::{PeerId, RoomCode};
pub use game::entity::{EntityPatch, EntitySnapshot};
pub use game::events::Projectile;
pub use network::room::{MatchConfig, Profile, Role, RoomError};
pub use network::session::{MeshSession, Notice, SessionError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default simulation tick rate (Hz)
pub const TICK_RATE: u32 = 60;
