//! Roomdrop Core - Shared types, wire frames, and transport capabilities
//!
//! This crate provides the building blocks for the roomdrop room-based
//! peer-to-peer file transfer system: the transfer data model, the
//! direct-channel wire framing, and the capability traits for the direct
//! peer channel and the signaling bus.

pub mod channel;
pub mod error;
pub mod frame;
pub mod signal;
pub mod types;

pub use channel::{
    Channel, Connection, ConnectionState, Connector, IceCandidate, SdpKind, SessionDescription,
};
pub use error::{Error, Result};
pub use frame::{ControlFrame, Frame, Message};
pub use signal::{SignalEvent, SignalingBus};
pub use types::*;

/// Default chunk size: 128 KiB
pub const DEFAULT_CHUNK_SIZE: u32 = 128 * 1024;

/// Suspend sending once a channel buffers more than this many unsent bytes
pub const BUFFER_HIGH_WATER: usize = 64 * 1024;

/// Resume sending once the channel has drained to this many unsent bytes
pub const BUFFER_LOW_WATER: usize = 16 * 1024;
