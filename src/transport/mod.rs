//! Datagram transport implementations
//!
//! Provides the channel that carries control units between peers:
//! - UDP with a conv/sequence envelope
//! - In-process memory link with deterministic fault injection (testing)

mod memory;
mod udp;

pub use memory::{FaultConfig, MemoryTransport};
pub use udp::{random_source_port, UdpTransport, ENVELOPE_LEN};

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("No remote address known yet")]
    NoRemote,

    #[error("Malformed datagram: {0} bytes")]
    Malformed(usize),

    #[error("Transport closed")]
    Closed,
}

/// One unit received from the peer
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Where the unit came from
    pub source: SocketAddr,
    /// Conv id carried out of band by the transport
    pub conv: u32,
    /// Control header and body
    pub payload: Bytes,
}

/// Trait for datagram transport implementations
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Emit one unit tagged with `conv`
    async fn send(&self, conv: u32, payload: Bytes) -> Result<(), TransportError>;

    /// Wait for the next unit. Must be cancel safe.
    async fn recv(&self) -> Result<Inbound, TransportError>;

    /// Point outbound traffic at a peer learned from inbound traffic
    fn set_remote(&self, addr: SocketAddr);
}
