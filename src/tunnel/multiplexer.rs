//! Circuit multiplexer
//!
//! Runs every circuit of one endpoint on a single task. A `select!` loop
//! drives local accepts, inbound transport units, local socket events, the
//! session tick timer and the heartbeat timer. Only this task touches the
//! circuit table; socket tasks report back through channels.

use super::bridge::{spawn_connect, LocalBridge, LocalEvent, LocalEventKind};
use super::circuit::{Announce, Circuit, CircuitState};
use super::frame::{Command, ControlFrame};
use super::liveness::LivenessMonitor;
use super::table::{CircuitTable, SlotHandle};
use super::{TunnelError, TunnelEvent};
use crate::config::{ReliableSessionConfig, Role, TunnelConfig};
use crate::transport::{DatagramTransport, Inbound, TransportError};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Capacity of the channel carrying local socket events to the scheduler
const LOCAL_EVENT_QUEUE: usize = 1024;

/// Where circuits come from
pub enum Endpoint {
    /// Accept local TCP connections and announce a circuit for each
    Client(TcpListener),
    /// Open a TCP connection to `target` for each announced circuit
    Server { target: SocketAddr },
}

impl Endpoint {
    pub fn role(&self) -> Role {
        match self {
            Endpoint::Client(_) => Role::Client,
            Endpoint::Server { .. } => Role::Server,
        }
    }
}

/// Circuit multiplexer for one tunnel endpoint
pub struct Multiplexer<T> {
    config: TunnelConfig,
    session_config: ReliableSessionConfig,
    endpoint: Endpoint,
    transport: T,
    table: CircuitTable<Circuit>,
    liveness: LivenessMonitor,
    clock: Instant,
    local_tx: mpsc::Sender<LocalEvent>,
    local_rx: mpsc::Receiver<LocalEvent>,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl<T: DatagramTransport> Multiplexer<T> {
    /// Create a multiplexer and the receiver for its policy events
    pub fn new(
        config: TunnelConfig,
        session_config: ReliableSessionConfig,
        endpoint: Endpoint,
        transport: T,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TunnelEvent>), TunnelError> {
        session_config
            .validate()
            .map_err(|e| TunnelError::InvalidConfig(e.to_string()))?;
        if config.max_connections == 0 {
            return Err(TunnelError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }

        let (local_tx, local_rx) = mpsc::channel(LOCAL_EVENT_QUEUE);
        let (events, events_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let mux = Self {
            table: CircuitTable::new(config.max_connections),
            liveness: LivenessMonitor::new(now.into_std(), config.dead_peer_threshold()),
            clock: now,
            config,
            session_config,
            endpoint,
            transport,
            local_tx,
            local_rx,
            events,
        };
        Ok((mux, events_rx))
    }

    pub fn role(&self) -> Role {
        self.endpoint.role()
    }

    /// Run until `shutdown` resolves or the transport closes.
    ///
    /// Every open circuit is sent a CLOSE on the way out.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), TunnelError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut tick = interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.liveness.record(Instant::now().into_std());
        info!(
            "Multiplexer running as {:?} with {} circuit slots",
            self.role(),
            self.table.capacity()
        );

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down multiplexer");
                    break Ok(());
                }
                accepted = accept_local(&self.endpoint) => {
                    self.handle_accept(accepted).await;
                }
                inbound = self.transport.recv() => match inbound {
                    Ok(inbound) => self.handle_inbound(inbound).await,
                    Err(TransportError::Closed) => break Err(TunnelError::Transport(TransportError::Closed)),
                    Err(e) => debug!("Transport receive error: {}", e),
                },
                Some(event) = self.local_rx.recv() => {
                    self.handle_local(event).await;
                }
                _ = tick.tick() => {
                    self.handle_tick().await;
                }
                _ = heartbeat.tick() => {
                    self.handle_heartbeat().await;
                }
            }
        };

        for handle in self.table.handles() {
            self.close_circuit(handle, true, false).await;
        }
        result
    }

    fn now_ms(&self) -> u32 {
        self.clock.elapsed().as_millis() as u32
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    async fn send_frame(&self, conv: u32, frame: ControlFrame) {
        if let Err(e) = self.transport.send(conv, frame.encode()).await {
            trace!("Failed to send {:?} for conv {}: {}", frame.command, conv, e);
        }
    }

    /// Handle of the circuit on `conv` if its incarnation matches `generation`
    fn resolve(&self, conv: u32, generation: u32) -> Option<SlotHandle> {
        let (handle, circuit) = self.table.lookup(conv)?;
        (circuit.wire_generation() == generation).then_some(handle)
    }

    async fn handle_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("Local accept failed: {}", e);
                return;
            }
        };

        let session_config = &self.session_config;
        let config = &self.config;
        let allocated = self.table.allocate(|handle| {
            Circuit::new(
                handle,
                handle.generation(),
                CircuitState::Active,
                session_config,
                config,
            )
        });

        let Some(handle) = allocated else {
            warn!(
                "All {} circuits in use, rejecting connection from {}",
                self.table.capacity(),
                peer
            );
            drop(stream);
            self.emit(TunnelEvent::ConnectionRejected);
            return;
        };

        let now = Instant::now();
        let retry = Duration::from_millis(self.config.connect_retry_ms);
        let bridge = LocalBridge::spawn(handle, stream, self.local_tx.clone(), &self.config);
        if let Some(circuit) = self.table.get_mut(handle) {
            circuit.attach(bridge);
            circuit.await_confirmation(now, retry);
        }

        self.send_frame(handle.conv(), ControlFrame::connect(handle.generation()))
            .await;
        info!("New connection from {} on conv {}", peer, handle);
        self.emit(TunnelEvent::CircuitOpened { conv: handle.conv() });
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            source,
            conv,
            payload,
        } = inbound;

        let frame = match ControlFrame::decode(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("Dropping unit from {} for conv {}: {}", source, conv, e);
                return;
            }
        };

        match frame.command {
            Command::Heartbeat => {
                self.learn_remote(source);
                if self.liveness.record(Instant::now().into_std()) {
                    info!("Peer heartbeat resumed");
                    self.emit(TunnelEvent::PeerRecovered);
                }
            }
            Command::Connect => self.handle_connect(source, conv, frame.generation).await,
            Command::Push => {
                if self.handle_push(conv, frame) {
                    self.learn_remote(source);
                }
            }
            Command::Close => {
                if self.handle_close(conv, frame.generation).await {
                    self.learn_remote(source);
                }
            }
        }
    }

    /// The server replies to wherever accepted traffic last came from.
    /// Units that match no circuit never move it.
    fn learn_remote(&self, source: SocketAddr) {
        if self.role() == Role::Server {
            self.transport.set_remote(source);
        }
    }

    async fn handle_connect(&mut self, source: SocketAddr, conv: u32, generation: u32) {
        let target = match &self.endpoint {
            Endpoint::Server { target } => *target,
            Endpoint::Client(_) => {
                match self.resolve(conv, generation) {
                    Some(handle) => {
                        if let Some(circuit) = self.table.get_mut(handle) {
                            if !circuit.is_confirmed() {
                                debug!("Peer acknowledged conv {}", handle);
                                circuit.confirm();
                            }
                        }
                    }
                    None => trace!("Dropping CONNECT echo for conv {}", conv),
                }
                return;
            }
        };

        if let Some((handle, circuit)) = self.table.lookup(conv) {
            if circuit.wire_generation() == generation {
                trace!("Duplicate CONNECT for conv {}", handle);
                self.learn_remote(source);
                self.send_frame(conv, ControlFrame::connect(generation)).await;
                return;
            }
            info!("Conv {} reopened by peer, replacing previous circuit", conv);
            self.close_circuit(handle, false, false).await;
        }

        let session_config = &self.session_config;
        let config = &self.config;
        let allocated = self.table.allocate_at(conv, |handle| {
            Circuit::new(
                handle,
                generation,
                CircuitState::Allocating,
                session_config,
                config,
            )
        });
        let Some(handle) = allocated else {
            trace!("Dropping CONNECT for out-of-range conv {}", conv);
            return;
        };

        self.learn_remote(source);
        spawn_connect(handle, target, self.local_tx.clone());
        self.send_frame(conv, ControlFrame::connect(generation)).await;
        info!("New circuit on conv {}, connecting to {}", conv, target);
        self.emit(TunnelEvent::CircuitOpened { conv });
    }

    fn handle_push(&mut self, conv: u32, frame: ControlFrame) -> bool {
        let Some(handle) = self.resolve(conv, frame.generation) else {
            trace!("Dropping PUSH for inactive conv {}", conv);
            return false;
        };
        let Some(circuit) = self.table.get_mut(handle) else {
            return false;
        };

        if let Err(e) = circuit.accept_remote(&frame.body) {
            trace!("Dropping PUSH for conv {}: {}", handle, e);
            return false;
        }
        // Data from the peer proves it knows the circuit
        circuit.confirm();
        true
    }

    async fn handle_close(&mut self, conv: u32, generation: u32) -> bool {
        let Some(handle) = self.resolve(conv, generation) else {
            trace!("Dropping CLOSE for inactive conv {}", conv);
            return false;
        };
        info!("Peer closed conv {}", handle);
        self.close_circuit(handle, false, true).await;
        true
    }

    async fn handle_local(&mut self, event: LocalEvent) {
        let LocalEvent { handle, kind } = event;
        let Some(circuit) = self.table.get_mut(handle) else {
            trace!("Ignoring local event for released circuit {}", handle);
            return;
        };

        match kind {
            LocalEventKind::Data(data) => circuit.accept_local(data),
            LocalEventKind::Eof => {
                debug!("Local side of conv {} finished sending", handle);
                circuit.begin_closing(Instant::now());
            }
            LocalEventKind::ReadFailed(e) | LocalEventKind::WriteFailed(e) => {
                debug!("Local I/O error on conv {}: {}", handle, e);
                self.close_circuit(handle, true, false).await;
            }
            LocalEventKind::Connected(stream) => {
                debug!("Target connected for conv {}", handle);
                let bridge = LocalBridge::spawn(handle, stream, self.local_tx.clone(), &self.config);
                circuit.attach(bridge);
            }
            LocalEventKind::ConnectFailed(e) => {
                warn!("Failed to connect target for conv {}: {}", handle, e);
                self.close_circuit(handle, true, false).await;
            }
        }
    }

    async fn handle_tick(&mut self) {
        let now = Instant::now();
        let now_ms = self.now_ms();
        let retry = Duration::from_millis(self.config.connect_retry_ms);
        let linger = self.config.close_linger();
        let attempts = self.config.connect_attempts;

        let mut outbound = Vec::new();
        let mut announce = Vec::new();
        // (circuit, flush local writer)
        let mut finished = Vec::new();

        for handle in self.table.handles() {
            let Some(circuit) = self.table.get_mut(handle) else {
                continue;
            };

            for payload in circuit.tick(now_ms) {
                outbound.push((handle.conv(), payload));
            }

            if circuit.session_dead() {
                warn!("Session on conv {} stopped getting acknowledgements", handle);
                finished.push((handle, false));
                continue;
            }

            match circuit.poll_announce(now, retry, attempts) {
                Announce::Idle => {}
                Announce::Resend => announce.push(handle),
                Announce::GaveUp => {
                    warn!("Peer never acknowledged conv {}", handle);
                    finished.push((handle, false));
                    continue;
                }
            }

            if circuit.close_due(now, linger) {
                debug!("Conv {} drained, closing", handle);
                finished.push((handle, true));
            }
        }

        for (conv, payload) in outbound {
            if let Err(e) = self.transport.send(conv, payload).await {
                trace!("Failed to send PUSH for conv {}: {}", conv, e);
            }
        }
        for handle in announce {
            debug!("Re-sending CONNECT for conv {}", handle);
            self.send_frame(handle.conv(), ControlFrame::connect(handle.generation()))
                .await;
        }
        for (handle, flush) in finished {
            self.close_circuit(handle, true, flush).await;
        }
    }

    async fn handle_heartbeat(&mut self) {
        self.send_frame(0, ControlFrame::heartbeat()).await;

        if let Some(silent_for) = self.liveness.check(Instant::now().into_std()) {
            warn!("No heartbeat from peer for {:?}", silent_for);
            self.emit(TunnelEvent::PeerUnreachable { silent_for });
        }
    }

    /// Release a circuit. `notify_peer` sends CLOSE first; `flush` lets the
    /// local writer finish bytes already decoded.
    async fn close_circuit(&mut self, handle: SlotHandle, notify_peer: bool, flush: bool) {
        let Some(circuit) = self.table.release(handle) else {
            return;
        };

        if notify_peer {
            self.send_frame(handle.conv(), ControlFrame::close(circuit.wire_generation()))
                .await;
        }
        circuit.shutdown(flush);

        info!("Closed conv {}", handle);
        self.emit(TunnelEvent::CircuitClosed { conv: handle.conv() });
    }
}

async fn accept_local(endpoint: &Endpoint) -> io::Result<(TcpStream, SocketAddr)> {
    match endpoint {
        Endpoint::Client(listener) => listener.accept().await,
        Endpoint::Server { .. } => std::future::pending().await,
    }
}
