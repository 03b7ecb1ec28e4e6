//! Protocol definitions and constants

use thiserror::Error;

/// Control header errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Header too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    #[error("PUSH without session data")]
    EmptyPush,
}

/// Magic bytes at the start of every control header ("VC")
pub const MAGIC: [u8; 2] = [0x56, 0x43];

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Control header size in bytes
pub const HEADER_LEN: usize = 8;

/// Default capacity of the virtual-circuit table
pub const MAX_CONNECTIONS: usize = 128;

/// Session tick period in milliseconds
pub const TICK_INTERVAL_MS: u64 = 3;

/// Heartbeat period in milliseconds
pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;

/// Silence after which the peer is considered unreachable, in milliseconds
pub const DEAD_PEER_THRESHOLD_MS: u64 = 10_000;
