//! UDP transport
//!
//! Each datagram is `conv (u32 BE) | sequence (u32 BE) | payload`.

use super::{DatagramTransport, Inbound, TransportError};
use crate::config::{Role, TransportEndpointConfig};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::net::UdpSocket;
use tracing::trace;

/// Envelope size in bytes
pub const ENVELOPE_LEN: usize = 8;

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 65535;

/// Pick a client source port in 30000..40000
pub fn random_source_port() -> u16 {
    let mut buf = [0u8; 2];
    if SystemRandom::new().fill(&mut buf).is_err() {
        return 30000;
    }
    30000 + u16::from_le_bytes(buf) % 10000
}

/// UDP transport
pub struct UdpTransport {
    socket: UdpSocket,
    recv_buf: tokio::sync::Mutex<Vec<u8>>,
    remote: Mutex<Option<SocketAddr>>,
    sequence: AtomicU32,
    disable_sequence: bool,
    role: Role,
}

impl UdpTransport {
    /// Bind according to the endpoint configuration
    pub async fn bind(config: &TransportEndpointConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.local).await?;
        Ok(Self {
            socket,
            recv_buf: tokio::sync::Mutex::new(vec![0u8; MAX_DATAGRAM]),
            remote: Mutex::new(config.remote),
            sequence: AtomicU32::new(0),
            disable_sequence: config.disable_sequence,
            role: config.role,
        })
    }

    /// Bound local address
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_sequence(&self) -> u32 {
        if self.disable_sequence {
            0
        } else {
            self.sequence.fetch_add(1, Ordering::Relaxed)
        }
    }
}

/// Split an envelope into conv and payload
fn open_envelope(datagram: Bytes) -> Result<(u32, Bytes), TransportError> {
    if datagram.len() < ENVELOPE_LEN {
        return Err(TransportError::Malformed(datagram.len()));
    }
    let conv = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    Ok((conv, datagram.slice(ENVELOPE_LEN..)))
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, conv: u32, payload: Bytes) -> Result<(), TransportError> {
        let remote = self.remote().ok_or(TransportError::NoRemote)?;

        let mut buf = BytesMut::with_capacity(ENVELOPE_LEN + payload.len());
        buf.put_u32(conv);
        buf.put_u32(self.next_sequence());
        buf.put_slice(&payload);

        self.socket.send_to(&buf, remote).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Inbound, TransportError> {
        let mut buf = self.recv_buf.lock().await;
        loop {
            let (n, source) = self.socket.recv_from(&mut buf[..]).await?;

            // Copy out so buffered segments do not pin the receive buffer
            match open_envelope(Bytes::copy_from_slice(&buf[..n])) {
                Ok((conv, payload)) => {
                    return Ok(Inbound {
                        source,
                        conv,
                        payload,
                    })
                }
                Err(e) => trace!("Dropping datagram from {}: {}", source, e),
            }
        }
    }

    fn set_remote(&self, addr: SocketAddr) {
        if self.role == Role::Server {
            *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        }
    }
}
