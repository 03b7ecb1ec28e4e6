//! Per-slot circuit state

use super::bridge::LocalBridge;
use super::buffer::BackpressureBuffer;
use super::session::SessionAdapter;
use super::table::SlotHandle;
use crate::config::{ReliableSessionConfig, TunnelConfig};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// Largest chunk moved from the session to the local writer at once
const MAX_DECODED_CHUNK: usize = 64 * 1024;

/// Lifecycle of a circuit slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Session exists, local socket not yet attached (server connecting)
    Allocating,
    /// Moving bytes both ways
    Active,
    /// Local side finished sending; waiting for the peer to acknowledge
    Closing { since: Instant },
}

/// Outcome of an announce retry check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announce {
    /// Nothing to do
    Idle,
    /// Send CONNECT again
    Resend,
    /// Peer never answered
    GaveUp,
}

#[derive(Debug)]
struct Unconfirmed {
    attempts: u32,
    next_at: Instant,
}

/// One live circuit: its session, local socket and buffers
pub struct Circuit {
    wire_generation: u32,
    state: CircuitState,
    session: SessionAdapter,
    bridge: Option<LocalBridge>,
    to_session: BackpressureBuffer,
    to_local: BackpressureBuffer,
    unconfirmed: Option<Unconfirmed>,
}

impl Circuit {
    /// Create circuit state with a fresh session.
    ///
    /// `wire_generation` is the generation stamped on every frame of this
    /// circuit; the client uses its own slot generation, the server adopts
    /// the one carried by CONNECT.
    pub fn new(
        handle: SlotHandle,
        wire_generation: u32,
        state: CircuitState,
        session: &ReliableSessionConfig,
        tunnel: &TunnelConfig,
    ) -> Self {
        Self {
            wire_generation,
            state,
            session: SessionAdapter::create(handle.conv(), wire_generation, session),
            bridge: None,
            to_session: BackpressureBuffer::new(tunnel.read_chunk_size.max(1)),
            to_local: BackpressureBuffer::new(tunnel.buffer_limit.max(1)),
            unconfirmed: None,
        }
    }

    pub fn wire_generation(&self) -> u32 {
        self.wire_generation
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Attach the local socket and start moving bytes
    pub fn attach(&mut self, bridge: LocalBridge) {
        self.bridge = Some(bridge);
        if self.state == CircuitState::Allocating {
            self.state = CircuitState::Active;
        }
        self.pump_inbound();
    }

    /// Track CONNECT retries until the peer acknowledges
    pub fn await_confirmation(&mut self, now: Instant, retry: Duration) {
        self.unconfirmed = Some(Unconfirmed {
            attempts: 1,
            next_at: now + retry,
        });
    }

    /// Peer acknowledged the circuit
    pub fn confirm(&mut self) {
        self.unconfirmed = None;
    }

    pub fn is_confirmed(&self) -> bool {
        self.unconfirmed.is_none()
    }

    /// Decide whether CONNECT must be sent again
    pub fn poll_announce(&mut self, now: Instant, retry: Duration, max_attempts: u32) -> Announce {
        let Some(pending) = self.unconfirmed.as_mut() else {
            return Announce::Idle;
        };
        if now < pending.next_at {
            return Announce::Idle;
        }
        if pending.attempts >= max_attempts {
            return Announce::GaveUp;
        }
        pending.attempts += 1;
        pending.next_at = now + retry;
        Announce::Resend
    }

    /// Bytes read from the local socket
    pub fn accept_local(&mut self, data: Bytes) {
        self.to_session.push(data);
        self.pump_outbound();
    }

    /// Local socket reached EOF
    pub fn begin_closing(&mut self, now: Instant) {
        if !matches!(self.state, CircuitState::Closing { .. }) {
            self.state = CircuitState::Closing { since: now };
        }
    }

    /// Feed a PUSH body into the session and forward what it decodes
    pub fn accept_remote(&mut self, body: &Bytes) -> Result<(), crate::arq::ArqError> {
        self.session.feed_inbound(body)?;
        self.pump_inbound();
        Ok(())
    }

    /// Move buffered local bytes into the session send window and gate
    /// socket reads on whether anything is left over.
    fn pump_outbound(&mut self) {
        let session = &mut self.session;
        self.to_session
            .drain_into(|chunk| session.submit_outbound(chunk));

        if let Some(bridge) = &self.bridge {
            if self.to_session.is_empty() {
                if bridge.reads_paused() {
                    bridge.resume_reads();
                }
            } else if !bridge.reads_paused() {
                bridge.pause_reads();
            }
        }
    }

    /// Move decoded bytes toward the local writer while there is room
    fn pump_inbound(&mut self) {
        while self.to_local.has_room() {
            let limit = self.to_local.room().min(MAX_DECODED_CHUNK);
            let chunk = self.session.drain_decoded(limit);
            if chunk.is_empty() {
                break;
            }
            self.to_local.push(chunk);
        }

        if let Some(bridge) = &self.bridge {
            self.to_local.drain_into(|chunk| bridge.try_write(chunk));
        }
    }

    /// One scheduler tick: retry stalled buffers and drive the session.
    /// Returns encoded PUSH frames ready for the transport.
    pub fn tick(&mut self, now_ms: u32) -> Vec<Bytes> {
        self.pump_outbound();
        let frames = self.session.tick(now_ms);
        self.pump_inbound();
        frames
    }

    /// True when a closing circuit has nothing left to deliver, or the
    /// linger ran out
    pub fn close_due(&self, now: Instant, linger: Duration) -> bool {
        match self.state {
            CircuitState::Closing { since } => {
                let drained = self.to_session.is_empty()
                    && self.session.unacknowledged() == 0
                    && self.pending_local() == 0;
                drained || now.saturating_duration_since(since) >= linger
            }
            _ => false,
        }
    }

    pub fn session_dead(&self) -> bool {
        self.session.is_dead()
    }

    /// Bytes still waiting for the local writer queue
    fn pending_local(&self) -> usize {
        self.to_local.len()
    }

    /// Release local resources. With `flush`, bytes already decoded are
    /// handed to the writer, which finishes them before closing the socket.
    pub fn shutdown(mut self, flush: bool) {
        if flush {
            self.pump_inbound();
        }
        if let Some(bridge) = self.bridge.take() {
            if flush {
                drop(bridge);
            } else {
                bridge.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::table::CircuitTable;

    fn circuit(state: CircuitState) -> Circuit {
        let mut table = CircuitTable::new(1);
        let handle = table.allocate(|_| ()).unwrap();
        Circuit::new(
            handle,
            handle.generation(),
            state,
            &ReliableSessionConfig::default(),
            &TunnelConfig::default(),
        )
    }

    #[test]
    fn test_announce_retries_then_gives_up() {
        let mut c = circuit(CircuitState::Active);
        let start = Instant::now();
        let retry = Duration::from_secs(1);

        assert_eq!(c.poll_announce(start, retry, 2), Announce::Idle);
        c.await_confirmation(start, retry);
        assert!(!c.is_confirmed());

        assert_eq!(c.poll_announce(start, retry, 2), Announce::Idle);
        assert_eq!(c.poll_announce(start + retry, retry, 2), Announce::Resend);
        assert_eq!(c.poll_announce(start + retry * 2, retry, 2), Announce::GaveUp);

        c.confirm();
        assert_eq!(c.poll_announce(start + retry * 3, retry, 2), Announce::Idle);
    }

    #[test]
    fn test_closing_waits_for_acknowledgement() {
        let mut c = circuit(CircuitState::Active);
        let start = Instant::now();
        let linger = Duration::from_secs(3);

        c.accept_local(Bytes::from_static(b"tail"));
        assert!(!c.tick(0).is_empty());

        c.begin_closing(start);
        assert!(!c.close_due(start, linger));
        assert!(c.close_due(start + linger, linger));
    }

    #[test]
    fn test_idle_closing_is_due_immediately() {
        let mut c = circuit(CircuitState::Active);
        let start = Instant::now();
        c.begin_closing(start);
        assert!(c.close_due(start, Duration::from_secs(3)));
    }

    #[test]
    fn test_closing_waits_for_local_delivery() {
        let config = ReliableSessionConfig::default();
        let mut peer = SessionAdapter::create(0, 1, &config);
        let mut c = circuit(CircuitState::Active);
        let start = Instant::now();
        let linger = Duration::from_secs(3);

        peer.submit_outbound(b"reply");
        for raw in peer.tick(0) {
            let frame = crate::tunnel::frame::ControlFrame::decode(&raw).unwrap();
            c.accept_remote(&frame.body).unwrap();
        }

        c.begin_closing(start);
        assert!(!c.close_due(start, linger));
        assert!(c.close_due(start + linger, linger));
    }

    #[test]
    fn test_decoded_bytes_wait_without_socket() {
        let config = ReliableSessionConfig::default();
        let mut peer = SessionAdapter::create(0, 1, &config);
        let mut c = circuit(CircuitState::Allocating);

        peer.submit_outbound(b"early");
        for raw in peer.tick(0) {
            let frame = crate::tunnel::frame::ControlFrame::decode(&raw).unwrap();
            c.accept_remote(&frame.body).unwrap();
        }
        assert_eq!(c.pending_local(), 5);
        assert_eq!(c.state(), CircuitState::Allocating);
    }
}
