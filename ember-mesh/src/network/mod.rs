//! Network Layer
//!
//! Everything that crosses a process boundary: the signaling medium, direct
//! links, the channel protocol and the session that drives them.
//! Nothing in here blocks the simulation tick.

pub mod transport;
pub mod memory;
pub mod websocket;
pub mod signaling;
pub mod relay;
pub mod room;
pub mod protocol;
pub mod negotiator;
pub mod liveness;
pub mod session;

pub use transport::{
    Connection, DirectTransport, IceCandidate, LinkEvent, LinkId, LinkSignal,
    SessionDescription, TransportError,
};
pub use memory::MemoryNetwork;
pub use websocket::{WsTransport, WsTransportConfig};
pub use signaling::{Envelope, LocalBus, SignalError, SignalKind, SignalingTransport};
pub use relay::{HubConfig, HubError, RelaySignaling, SignalHub};
pub use room::{MatchConfig, Profile, Role, RoomDirectory, RoomError};
pub use protocol::ChannelMessage;
pub use negotiator::{LinkState, Negotiator};
pub use liveness::NetworkStats;
pub use session::{MeshSession, Notice, SessionError};
