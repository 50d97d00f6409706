//! eca-core: Shared protocol library for the ECA gateway.
//!
//! Provides the 12-byte node identifier, Engine.IO v4 and Socket.IO v5 text
//! packet codecs, and the error taxonomy used across the gateway.

pub mod engineio;
pub mod error;
pub mod node_id;
pub mod socketio;

// Re-export commonly used items at crate root.
pub use engineio::{EnginePacket, OpenPayload};
pub use error::{EcaError, EcaResult};
pub use node_id::NodeId;
pub use socketio::{Packet, PacketKind};
