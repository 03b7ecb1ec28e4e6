//! Reliable-session engine
//!
//! Provides ordered, lossless byte streams over an unreliable datagram
//! channel:
//! - Segment framing
//! - Selective-repeat retransmission with RTO and fast resend
//! - Window-based flow control and optional congestion control

mod engine;
mod segment;

pub use engine::Arq;
pub use segment::{Segment, SegmentKind, SEGMENT_HEADER_LEN};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Reliable-session errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArqError {
    #[error("Truncated segment: claims {claimed} bytes, {available} available")]
    Truncated { claimed: usize, available: usize },

    #[error("Conv mismatch: expected {expected}, got {actual}")]
    ConvMismatch { expected: u32, actual: u32 },

    #[error("Unknown segment command: {0}")]
    UnknownSegment(u8),
}

/// Interface of a reliable session bound to one conv id.
///
/// Time is a wrapping millisecond counter supplied by the caller.
pub trait ReliableSession {
    /// Conv id the session was created for
    fn conv(&self) -> u32;

    /// Feed one datagram of session-framed bytes received from the peer
    fn input(&mut self, datagram: &Bytes) -> Result<(), ArqError>;

    /// Queue application bytes; returns how many were accepted
    fn send(&mut self, data: &[u8]) -> usize;

    /// Append up to `limit` in-order application bytes to `out`
    fn recv(&mut self, out: &mut BytesMut, limit: usize) -> usize;

    /// Advance timers and flush whatever is due
    fn update(&mut self, now: u32);

    /// Datagrams produced by the last updates
    fn take_output(&mut self) -> Vec<Bytes>;

    /// Segments queued or in flight
    fn waiting_to_send(&self) -> usize;

    /// True once a segment exceeded the retransmission limit
    fn is_dead(&self) -> bool;
}
