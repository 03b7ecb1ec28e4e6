//! Local TCP side of a circuit
//!
//! Each accepted (client) or connected (server) socket is split into a
//! reader task and a writer task. The tasks only move bytes; every
//! decision about them is made by the scheduler, which receives
//! [`LocalEvent`]s and hands chunks back through a bounded queue.

use super::table::SlotHandle;
use crate::config::TunnelConfig;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::trace;

/// Chunks a writer may hold before `try_write` refuses more
const WRITE_QUEUE_DEPTH: usize = 64;

/// What happened on a circuit's local socket
#[derive(Debug)]
pub enum LocalEventKind {
    /// Bytes read from the socket
    Data(Bytes),
    /// Peer of the local socket finished sending
    Eof,
    /// Reading failed
    ReadFailed(io::Error),
    /// Writing failed or timed out
    WriteFailed(io::Error),
    /// Outbound connection to the target completed (server)
    Connected(TcpStream),
    /// Outbound connection to the target failed (server)
    ConnectFailed(io::Error),
}

/// Local socket event tagged with the circuit it belongs to
#[derive(Debug)]
pub struct LocalEvent {
    pub handle: SlotHandle,
    pub kind: LocalEventKind,
}

/// Reader/writer task pair for one local socket
pub struct LocalBridge {
    read_gate: watch::Sender<bool>,
    write_tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LocalBridge {
    /// Split `stream` and start its tasks
    pub fn spawn(
        handle: SlotHandle,
        stream: TcpStream,
        events: mpsc::Sender<LocalEvent>,
        config: &TunnelConfig,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (read_gate, gate_rx) = watch::channel(true);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let reader = tokio::spawn(read_loop(
            handle,
            read_half,
            gate_rx,
            events.clone(),
            config.read_chunk_size.max(1),
        ));
        let writer = tokio::spawn(write_loop(
            handle,
            write_half,
            write_rx,
            events,
            config.write_timeout(),
        ));

        Self {
            read_gate,
            write_tx,
            reader,
            writer,
        }
    }

    /// Stop reading until [`resume_reads`](Self::resume_reads)
    pub fn pause_reads(&self) {
        self.read_gate.send_replace(false);
    }

    pub fn resume_reads(&self) {
        self.read_gate.send_replace(true);
    }

    pub fn reads_paused(&self) -> bool {
        !*self.read_gate.borrow()
    }

    /// Queue a chunk for the writer. Returns its length if taken, 0 if the
    /// queue is full or the writer is gone.
    pub fn try_write(&self, chunk: &Bytes) -> usize {
        match self.write_tx.try_send(chunk.clone()) {
            Ok(()) => chunk.len(),
            Err(_) => 0,
        }
    }

    /// Tear down both tasks without flushing queued writes
    pub fn abort(self) {
        self.writer.abort();
    }
}

impl Drop for LocalBridge {
    /// Stops reading; the writer drains what it already holds, then shuts
    /// the socket down.
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    handle: SlotHandle,
    mut reader: OwnedReadHalf,
    mut gate: watch::Receiver<bool>,
    events: mpsc::Sender<LocalEvent>,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        if gate.wait_for(|open| *open).await.is_err() {
            return;
        }

        let kind = match reader.read(&mut buf).await {
            Ok(0) => LocalEventKind::Eof,
            Ok(n) => LocalEventKind::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => LocalEventKind::ReadFailed(e),
        };
        let last = !matches!(kind, LocalEventKind::Data(_));

        if events.send(LocalEvent { handle, kind }).await.is_err() || last {
            return;
        }
    }
}

async fn write_loop(
    handle: SlotHandle,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<LocalEvent>,
    timeout: Duration,
) {
    while let Some(chunk) = queue.recv().await {
        let result = match tokio::time::timeout(timeout, writer.write_all(&chunk)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "local write timed out",
            )),
        };

        if let Err(e) = result {
            let kind = LocalEventKind::WriteFailed(e);
            let _ = events.send(LocalEvent { handle, kind }).await;
            return;
        }
    }

    trace!("Writer for {} drained, shutting down", handle);
    let _ = writer.shutdown().await;
}

/// Connect to `target` in the background and report the outcome
pub fn spawn_connect(handle: SlotHandle, target: SocketAddr, events: mpsc::Sender<LocalEvent>) {
    tokio::spawn(async move {
        let kind = match TcpStream::connect(target).await {
            Ok(stream) => LocalEventKind::Connected(stream),
            Err(e) => LocalEventKind::ConnectFailed(e),
        };
        let _ = events.send(LocalEvent { handle, kind }).await;
    });
}
