//! # Circuit Tunnel
//!
//! Carries many local TCP connections as virtual circuits over a single
//! unreliable datagram channel between two peers.
//!
//! ## Features
//!
//! - **Fixed circuit pool** with generation-checked slot handles
//! - **Reliable sessions** per circuit (selective-repeat ARQ)
//! - **Back-pressure** from local sockets through the session windows
//! - **Heartbeat liveness** reported to the application
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Local TCP sockets                   │
//! │         (accepted by client, dialed by server)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexer                         │
//! │      (circuit table, control frames, liveness)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Reliable session                    │
//! │          (ordering, retransmission, windows)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │            (UDP envelope, in-memory link)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod arq;
pub mod config;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] arq::ArqError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
