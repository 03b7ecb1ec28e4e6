//! Reliable-session adapter
//!
//! Binds one reliable session to one circuit: PUSH bodies go in, decoded
//! bytes come out, and every outbound session datagram leaves wrapped in a
//! PUSH frame stamped with the circuit's generation.

use super::frame::ControlFrame;
use crate::arq::{Arq, ArqError, ReliableSession};
use crate::config::ReliableSessionConfig;
use bytes::{Bytes, BytesMut};

/// One reliable session owned by a circuit
pub struct SessionAdapter<S = Arq> {
    session: S,
    generation: u32,
}

impl SessionAdapter<Arq> {
    /// Create a fresh session for a circuit
    pub fn create(conv: u32, generation: u32, config: &ReliableSessionConfig) -> Self {
        Self::with_session(Arq::new(conv, config), generation)
    }
}

impl<S: ReliableSession> SessionAdapter<S> {
    /// Wrap an existing session
    pub fn with_session(session: S, generation: u32) -> Self {
        Self {
            session,
            generation,
        }
    }

    /// Feed the body of a PUSH frame into the session
    pub fn feed_inbound(&mut self, body: &Bytes) -> Result<(), ArqError> {
        self.session.input(body)
    }

    /// Take up to `limit` in-order bytes; empty when nothing is ready
    pub fn drain_decoded(&mut self, limit: usize) -> Bytes {
        let mut out = BytesMut::new();
        self.session.recv(&mut out, limit);
        out.freeze()
    }

    /// Offer application bytes; returns how many the send window took
    pub fn submit_outbound(&mut self, data: &[u8]) -> usize {
        self.session.send(data)
    }

    /// Drive the session clock and collect PUSH payloads ready for the transport
    pub fn tick(&mut self, now: u32) -> Vec<Bytes> {
        self.session.update(now);
        self.session
            .take_output()
            .into_iter()
            .map(|datagram| ControlFrame::push(self.generation, datagram).encode())
            .collect()
    }

    /// Segments not yet acknowledged by the peer
    pub fn unacknowledged(&self) -> usize {
        self.session.waiting_to_send()
    }

    /// True once the session gave up on the peer
    pub fn is_dead(&self) -> bool {
        self.session.is_dead()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::frame::Command;

    #[test]
    fn test_tick_wraps_output_in_push_frames() {
        let config = ReliableSessionConfig::default();
        let mut adapter = SessionAdapter::create(3, 42, &config);

        assert_eq!(adapter.submit_outbound(b"ping"), 4);
        let frames = adapter.tick(0);
        assert_eq!(frames.len(), 1);

        let frame = ControlFrame::decode(&frames[0]).unwrap();
        assert_eq!(frame.command, Command::Push);
        assert_eq!(frame.generation, 42);
        assert!(!frame.body.is_empty());
    }

    #[test]
    fn test_two_adapters_exchange_bytes() {
        let config = ReliableSessionConfig::default();
        let mut a = SessionAdapter::create(1, 7, &config);
        let mut b = SessionAdapter::create(1, 7, &config);

        a.submit_outbound(b"pong");
        for raw in a.tick(0) {
            let frame = ControlFrame::decode(&raw).unwrap();
            b.feed_inbound(&frame.body).unwrap();
        }

        assert_eq!(&b.drain_decoded(1024)[..], b"pong");
        assert!(b.drain_decoded(1024).is_empty());

        for raw in b.tick(0) {
            let frame = ControlFrame::decode(&raw).unwrap();
            a.feed_inbound(&frame.body).unwrap();
        }
        assert_eq!(a.unacknowledged(), 0);
    }

    #[test]
    fn test_garbage_body_is_an_error() {
        let config = ReliableSessionConfig::default();
        let mut adapter = SessionAdapter::create(1, 1, &config);
        assert!(adapter
            .feed_inbound(&Bytes::from_static(b"not a segment"))
            .is_err());
    }
}
