//! Control frame encoding/decoding
//!
//! Every unit on the datagram channel starts with this header:
//! ```text
//! +--------+--------+--------+--------+
//! |   'V'  |   'C'  | Version| Command|
//! +--------+--------+--------+--------+
//! |        Generation (4B, BE)        |
//! +--------+--------+--------+--------+
//! |     Session data (PUSH only)      |
//! +--------+--------+--------+--------+
//! ```
//! The conv id is not part of the header; the transport carries it.

use crate::protocol::{ProtocolError, HEADER_LEN, MAGIC, PROTOCOL_VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// Control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Announce (or acknowledge) a new virtual circuit
    Connect = 0x01,
    /// Reliable-session data for a circuit
    Push = 0x02,
    /// Immediate teardown of a circuit
    Close = 0x03,
    /// Liveness probe, independent of any circuit
    Heartbeat = 0x04,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Push),
            0x03 => Ok(Command::Close),
            0x04 => Ok(Command::Heartbeat),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// A decoded control unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// Command code
    pub command: Command,
    /// Circuit incarnation (0 for heartbeats)
    pub generation: u32,
    /// Bytes following the header; reliable-session data for PUSH
    pub body: Bytes,
}

impl ControlFrame {
    /// Create a CONNECT frame
    pub fn connect(generation: u32) -> Self {
        Self {
            command: Command::Connect,
            generation,
            body: Bytes::new(),
        }
    }

    /// Create a PUSH frame carrying session data
    pub fn push(generation: u32, body: Bytes) -> Self {
        Self {
            command: Command::Push,
            generation,
            body,
        }
    }

    /// Create a CLOSE frame
    pub fn close(generation: u32) -> Self {
        Self {
            command: Command::Close,
            generation,
            body: Bytes::new(),
        }
    }

    /// Create a HEARTBEAT frame
    pub fn heartbeat() -> Self {
        Self {
            command: Command::Heartbeat,
            generation: 0,
            body: Bytes::new(),
        }
    }

    /// Encode header and body into one payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.command as u8);
        buf.put_u32(self.generation);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode a payload received from the transport.
    ///
    /// The header is validated before anything else; only the physical
    /// length of `payload` bounds the body.
    pub fn decode(payload: &Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort(payload.len()));
        }
        if payload[..2] != MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }
        if payload[2] != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: payload[2],
            });
        }

        let command = Command::try_from(payload[3])?;
        let generation = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let body = payload.slice(HEADER_LEN..);

        if command == Command::Push && body.is_empty() {
            return Err(ProtocolError::EmptyPush);
        }

        Ok(Self {
            command,
            generation,
            body,
        })
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}
