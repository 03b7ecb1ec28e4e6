//! Tunnel layer - virtual circuits over a datagram transport
//!
//! Provides:
//! - Control frame encoding/decoding
//! - Fixed-capacity circuit table with generation-checked handles
//! - Reliable-session adapter and local socket bridge per circuit
//! - The single-task scheduler and peer liveness tracking

mod bridge;
mod buffer;
mod circuit;
mod frame;
mod liveness;
mod multiplexer;
mod session;
mod table;

pub use bridge::{LocalBridge, LocalEvent, LocalEventKind};
pub use buffer::BackpressureBuffer;
pub use circuit::{Circuit, CircuitState};
pub use frame::{Command, ControlFrame};
pub use liveness::LivenessMonitor;
pub use multiplexer::{Endpoint, Multiplexer};
pub use session::SessionAdapter;
pub use table::{CircuitTable, SlotHandle};

use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

/// Notifications for the application running the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A circuit was allocated
    CircuitOpened { conv: u32 },
    /// A circuit was released
    CircuitClosed { conv: u32 },
    /// A local connection was refused because every slot is in use
    ConnectionRejected,
    /// No heartbeat from the peer for longer than the threshold
    PeerUnreachable { silent_for: Duration },
    /// Heartbeats resumed after the peer was flagged
    PeerRecovered,
}
