//! In-process datagram link for deterministic testing.
//!
//! Real networks drop and duplicate packets. [`MemoryTransport::pair`]
//! returns two connected endpoints whose sends pass through a counter-based
//! fault model, so runs are reproducible:
//!
//! | Fault       | Description                                  |
//! |-------------|----------------------------------------------|
//! | Loss        | Every `drop_every`-th datagram is discarded  |
//! | Duplication | Every `duplicate_every`-th datagram is sent twice |

use super::{DatagramTransport, Inbound, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};

/// Fault model applied to each direction independently
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultConfig {
    /// Drop every Nth datagram (0 = never)
    pub drop_every: u64,
    /// Duplicate every Nth datagram (0 = never)
    pub duplicate_every: u64,
}

impl FaultConfig {
    /// A perfect link
    pub fn lossless() -> Self {
        Self::default()
    }
}

/// One end of an in-process link
pub struct MemoryTransport {
    local: SocketAddr,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    faults: FaultConfig,
    sent: AtomicU64,
}

impl MemoryTransport {
    /// Create two connected endpoints
    pub fn pair(faults: FaultConfig) -> (Self, Self) {
        let a_addr: SocketAddr = ([127, 0, 0, 1], 10001).into();
        let b_addr: SocketAddr = ([127, 0, 0, 1], 10002).into();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = Self {
            local: a_addr,
            peer: b_addr,
            tx: a_tx,
            rx: Mutex::new(a_rx),
            faults,
            sent: AtomicU64::new(0),
        };
        let b = Self {
            local: b_addr,
            peer: a_addr,
            tx: b_tx,
            rx: Mutex::new(b_rx),
            faults,
            sent: AtomicU64::new(0),
        };
        (a, b)
    }

    /// Address this end reports as the source of its datagrams
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Address of the other end
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Datagrams handed to `send` so far, including dropped ones
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

fn hits(count: u64, every: u64) -> bool {
    every != 0 && count % every == 0
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn send(&self, conv: u32, payload: Bytes) -> Result<(), TransportError> {
        let count = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if hits(count, self.faults.drop_every) {
            return Ok(());
        }

        let inbound = Inbound {
            source: self.local,
            conv,
            payload,
        };
        if hits(count, self.faults.duplicate_every) {
            self.tx
                .send(inbound.clone())
                .map_err(|_| TransportError::Closed)?;
        }
        self.tx.send(inbound).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Inbound, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn set_remote(&self, _addr: SocketAddr) {}
}
