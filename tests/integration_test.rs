//! Integration tests for Circuit Tunnel
//!
//! Drives whole multiplexers over in-memory and UDP links with real
//! loopback TCP sockets on both ends:
//! - Byte stream round trips, with and without datagram loss
//! - Circuit announcement order and pool exhaustion
//! - CLOSE handling and stale traffic

use circuit_tunnel::config::{
    Mode, ReliableSessionConfig, Role, TransportEndpointConfig, TunnelConfig,
};
use circuit_tunnel::transport::{DatagramTransport, FaultConfig, MemoryTransport, UdpTransport};
use circuit_tunnel::tunnel::{
    Command, ControlFrame, Endpoint, Multiplexer, SessionAdapter, TunnelEvent,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> TunnelConfig {
    TunnelConfig {
        connect_retry_ms: 100,
        close_linger_ms: 500,
        ..TunnelConfig::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + seed as usize) % 251) as u8)
        .collect()
}

/// Echo every connection back to itself
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

fn spawn_mux<T: DatagramTransport + 'static>(
    config: TunnelConfig,
    endpoint: Endpoint,
    transport: T,
) -> (JoinHandle<()>, UnboundedReceiver<TunnelEvent>) {
    spawn_mux_with(config, ReliableSessionConfig::default(), endpoint, transport)
}

fn spawn_mux_with<T: DatagramTransport + 'static>(
    config: TunnelConfig,
    session: ReliableSessionConfig,
    endpoint: Endpoint,
    transport: T,
) -> (JoinHandle<()>, UnboundedReceiver<TunnelEvent>) {
    let (mux, events) = Multiplexer::new(config, session, endpoint, transport).unwrap();
    let task = tokio::spawn(async move {
        let _ = mux.run(std::future::pending()).await;
    });
    (task, events)
}

/// Client and server multiplexers joined by a memory link. Returns the
/// client's listen address.
async fn memory_tunnel(faults: FaultConfig, target: SocketAddr) -> (SocketAddr, Vec<JoinHandle<()>>) {
    let (client_link, server_link) = MemoryTransport::pair(faults);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen = listener.local_addr().unwrap();

    let (client, _) = spawn_mux(test_config(), Endpoint::Client(listener), client_link);
    let (server, _) = spawn_mux(test_config(), Endpoint::Server { target }, server_link);
    (listen, vec![client, server])
}

/// Write `data` through the tunnel and read the echo back
async fn echo_through(listen: SocketAddr, data: Vec<u8>) {
    let stream = TcpStream::connect(listen).await.unwrap();
    let (mut read, mut write) = stream.into_split();

    let expected = data.clone();
    let writer = tokio::spawn(async move {
        write.write_all(&data).await.unwrap();
        write
    });

    let mut received = vec![0u8; expected.len()];
    timeout(WAIT, read.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(received, expected);

    let _write = writer.await.unwrap();
}

async fn next_event(events: &mut UnboundedReceiver<TunnelEvent>) -> TunnelEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no tunnel event")
        .expect("event channel closed")
}

/// Next non-heartbeat unit seen by a scripted peer
async fn next_frame(link: &MemoryTransport) -> (u32, ControlFrame) {
    loop {
        let inbound = timeout(WAIT, link.recv())
            .await
            .expect("no unit from multiplexer")
            .unwrap();
        let frame = ControlFrame::decode(&inbound.payload).unwrap();
        if frame.command != Command::Heartbeat {
            return (inbound.conv, frame);
        }
    }
}

/// Send `data` to the multiplexer as session traffic for a circuit
async fn push(link: &MemoryTransport, conv: u32, generation: u32, data: &[u8]) {
    let mut session = SessionAdapter::create(conv, generation, &ReliableSessionConfig::default());
    session.submit_outbound(data);
    for unit in session.tick(0) {
        link.send(conv, unit).await.unwrap();
    }
}

#[tokio::test]
async fn test_round_trip_lossless() {
    let echo = spawn_echo().await;
    let (listen, tasks) = memory_tunnel(FaultConfig::lossless(), echo).await;

    echo_through(listen, pattern(128 * 1024, 1)).await;

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn test_round_trip_with_loss_and_duplication() {
    let echo = spawn_echo().await;
    let faults = FaultConfig {
        drop_every: 9,
        duplicate_every: 4,
    };
    let (listen, tasks) = memory_tunnel(faults, echo).await;

    echo_through(listen, pattern(48 * 1024, 7)).await;

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn test_concurrent_circuits_stay_separate() {
    let echo = spawn_echo().await;
    let (listen, tasks) = memory_tunnel(FaultConfig::lossless(), echo).await;

    let clients: Vec<_> = (0..4u8)
        .map(|seed| tokio::spawn(echo_through(listen, pattern(24 * 1024, seed))))
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn test_round_trip_over_udp() {
    let echo = spawn_echo().await;

    let server_link = UdpTransport::bind(&TransportEndpointConfig {
        local: "127.0.0.1:0".parse().unwrap(),
        remote: None,
        role: Role::Server,
        disable_sequence: false,
    })
    .await
    .unwrap();
    let server_addr = server_link.local_addr().unwrap();

    let client_link = UdpTransport::bind(&TransportEndpointConfig {
        local: "127.0.0.1:0".parse().unwrap(),
        remote: Some(server_addr),
        role: Role::Client,
        disable_sequence: true,
    })
    .await
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen = listener.local_addr().unwrap();
    let (client, _) = spawn_mux(test_config(), Endpoint::Client(listener), client_link);
    let (server, _) = spawn_mux(test_config(), Endpoint::Server { target: echo }, server_link);

    echo_through(listen, pattern(32 * 1024, 3)).await;

    client.abort();
    server.abort();
}

#[tokio::test]
async fn test_connect_precedes_push_and_reply_reaches_socket() {
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen = listener.local_addr().unwrap();
    let (task, _events) = spawn_mux(test_config(), Endpoint::Client(listener), link);

    let mut local = TcpStream::connect(listen).await.unwrap();
    local.write_all(b"ping").await.unwrap();

    let (conv, connect) = next_frame(&peer).await;
    assert_eq!(connect.command, Command::Connect);
    let generation = connect.generation;
    peer.send(conv, ControlFrame::connect(generation).encode())
        .await
        .unwrap();

    let mut session = SessionAdapter::create(conv, generation, &ReliableSessionConfig::default());
    let mut received = Vec::new();
    while received.len() < 4 {
        let (unit_conv, frame) = next_frame(&peer).await;
        if frame.command != Command::Push {
            continue;
        }
        assert_eq!(unit_conv, conv);
        assert_eq!(frame.generation, generation);
        session.feed_inbound(&frame.body).unwrap();
        received.extend_from_slice(&session.drain_decoded(1024));
    }
    assert_eq!(received, b"ping");

    let start = Instant::now();
    session.submit_outbound(b"pong");
    for unit in session.tick(start.elapsed().as_millis() as u32) {
        peer.send(conv, unit).await.unwrap();
    }

    let mut reply = [0u8; 4];
    timeout(WAIT, local.read_exact(&mut reply))
        .await
        .expect("reply timed out")
        .unwrap();
    assert_eq!(&reply, b"pong");

    task.abort();
}

#[tokio::test]
async fn test_reply_decoded_at_graceful_close_reaches_socket() {
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen = listener.local_addr().unwrap();
    let (task, _events) = spawn_mux(test_config(), Endpoint::Client(listener), link);

    let mut local = TcpStream::connect(listen).await.unwrap();
    local.write_all(b"ping").await.unwrap();
    local.shutdown().await.unwrap();

    let (conv, connect) = next_frame(&peer).await;
    assert_eq!(connect.command, Command::Connect);
    let generation = connect.generation;
    peer.send(conv, ControlFrame::connect(generation).encode())
        .await
        .unwrap();

    let mut session = SessionAdapter::create(conv, generation, &ReliableSessionConfig::default());
    let mut received = Vec::new();
    while received.len() < 4 {
        let (_, frame) = next_frame(&peer).await;
        if frame.command == Command::Push {
            session.feed_inbound(&frame.body).unwrap();
            received.extend_from_slice(&session.drain_decoded(1024));
        }
    }
    assert_eq!(received, b"ping");

    // One unit acknowledges "ping" and carries the reply, so the circuit
    // drains on the same tick that decodes the reply
    session.submit_outbound(b"pong");
    for unit in session.tick(0) {
        peer.send(conv, unit).await.unwrap();
    }

    loop {
        let (unit_conv, frame) = next_frame(&peer).await;
        if frame.command == Command::Close {
            assert_eq!(unit_conv, conv);
            assert_eq!(frame.generation, generation);
            break;
        }
    }

    let mut reply = Vec::new();
    timeout(WAIT, local.read_to_end(&mut reply))
        .await
        .expect("socket never closed")
        .unwrap();
    assert_eq!(reply, b"pong");

    task.abort();
}

#[tokio::test]
async fn test_unacknowledged_session_releases_circuit() {
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen = listener.local_addr().unwrap();
    let session = ReliableSessionConfig {
        dead_link: 3,
        ..ReliableSessionConfig::for_mode(Mode::Fast3)
    };
    let (task, mut events) =
        spawn_mux_with(test_config(), session, Endpoint::Client(listener), link);

    let mut local = TcpStream::connect(listen).await.unwrap();
    local.write_all(b"into the void").await.unwrap();

    let (conv, connect) = next_frame(&peer).await;
    assert_eq!(connect.command, Command::Connect);
    assert_eq!(next_event(&mut events).await, TunnelEvent::CircuitOpened { conv });
    peer.send(conv, ControlFrame::connect(connect.generation).encode())
        .await
        .unwrap();

    // Never acknowledge; retransmissions run out
    loop {
        let (_, frame) = next_frame(&peer).await;
        if frame.command == Command::Close {
            assert_eq!(frame.generation, connect.generation);
            break;
        }
    }
    assert_eq!(next_event(&mut events).await, TunnelEvent::CircuitClosed { conv });

    let mut buf = [0u8; 1];
    let closed = timeout(WAIT, local.read(&mut buf)).await.expect("not closed");
    assert!(matches!(closed, Ok(0) | Err(_)));

    task.abort();
}

#[tokio::test]
async fn test_connect_with_new_generation_replaces_circuit() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let endpoint = Endpoint::Server {
        target: target.local_addr().unwrap(),
    };
    let (task, mut events) = spawn_mux(test_config(), endpoint, link);

    peer.send(4, ControlFrame::connect(1).encode()).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        TunnelEvent::CircuitOpened { conv: 4 }
    );
    let (mut old, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();

    peer.send(4, ControlFrame::connect(2).encode()).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        TunnelEvent::CircuitClosed { conv: 4 }
    );
    assert_eq!(
        next_event(&mut events).await,
        TunnelEvent::CircuitOpened { conv: 4 }
    );

    let mut buf = [0u8; 5];
    let closed = timeout(WAIT, old.read(&mut buf)).await.expect("old socket open");
    assert!(matches!(closed, Ok(0) | Err(_)));

    let (mut new, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
    push(&peer, 4, 2, b"fresh").await;
    timeout(WAIT, new.read_exact(&mut buf))
        .await
        .expect("new circuit silent")
        .unwrap();
    assert_eq!(&buf, b"fresh");

    task.abort();
}

#[tokio::test]
async fn test_pool_exhaustion_rejects_one_connection() {
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen = listener.local_addr().unwrap();
    let config = TunnelConfig {
        max_connections: 2,
        connect_attempts: 100,
        ..test_config()
    };
    let (task, mut events) = spawn_mux(config, Endpoint::Client(listener), link);

    let mut first = TcpStream::connect(listen).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        TunnelEvent::CircuitOpened { .. }
    ));
    let _second = TcpStream::connect(listen).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        TunnelEvent::CircuitOpened { .. }
    ));

    let mut third = TcpStream::connect(listen).await.unwrap();
    assert_eq!(next_event(&mut events).await, TunnelEvent::ConnectionRejected);

    let mut buf = [0u8; 1];
    let rejected = timeout(WAIT, third.read(&mut buf)).await.expect("not closed");
    assert!(matches!(rejected, Ok(0) | Err(_)));

    // Survivors stay open
    assert!(timeout(Duration::from_millis(200), first.read(&mut buf))
        .await
        .is_err());

    let mut announced = HashSet::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Ok(Ok(inbound)) = tokio::time::timeout_at(deadline, peer.recv()).await {
        let frame = ControlFrame::decode(&inbound.payload).unwrap();
        if frame.command == Command::Connect {
            announced.insert(inbound.conv);
        }
    }
    assert_eq!(announced.len(), 2);

    task.abort();
}

#[tokio::test]
async fn test_duplicate_close_releases_once() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let endpoint = Endpoint::Server {
        target: target.local_addr().unwrap(),
    };
    let (task, mut events) = spawn_mux(test_config(), endpoint, link);

    peer.send(0, ControlFrame::connect(1).encode()).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        TunnelEvent::CircuitOpened { conv: 0 }
    );
    let (mut accepted, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();

    peer.send(0, ControlFrame::close(1).encode()).await.unwrap();
    peer.send(0, ControlFrame::close(1).encode()).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TunnelEvent::CircuitClosed { conv: 0 }
    );
    assert!(timeout(Duration::from_millis(300), events.recv())
        .await
        .is_err());

    let mut buf = [0u8; 1];
    let closed = timeout(WAIT, accepted.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));

    task.abort();
}

#[tokio::test]
async fn test_stale_generation_is_dropped() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let endpoint = Endpoint::Server {
        target: target.local_addr().unwrap(),
    };
    let (task, mut events) = spawn_mux(test_config(), endpoint, link);

    peer.send(1, ControlFrame::connect(5).encode()).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        TunnelEvent::CircuitOpened { conv: 1 }
    );
    let (mut accepted, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();

    push(&peer, 1, 4, b"stale").await;
    peer.send(1, ControlFrame::close(4).encode()).await.unwrap();

    let mut buf = [0u8; 5];
    assert!(timeout(Duration::from_millis(300), accepted.read(&mut buf))
        .await
        .is_err());
    assert!(events.try_recv().is_err());

    push(&peer, 1, 5, b"fresh").await;
    timeout(WAIT, accepted.read_exact(&mut buf))
        .await
        .expect("fresh data timed out")
        .unwrap();
    assert_eq!(&buf, b"fresh");

    task.abort();
}

#[tokio::test]
async fn test_push_for_inactive_conv_allocates_nothing() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let endpoint = Endpoint::Server {
        target: target.local_addr().unwrap(),
    };
    let (task, mut events) = spawn_mux(test_config(), endpoint, link);

    push(&peer, 3, 1, b"nobody home").await;
    peer.send(3, ControlFrame::close(1).encode()).await.unwrap();
    peer.send(999, ControlFrame::connect(1).encode())
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(300), target.accept())
        .await
        .is_err());
    assert!(events.try_recv().is_err());

    task.abort();
}

#[tokio::test]
async fn test_silent_peer_is_flagged_once_then_recovers() {
    let (link, peer) = MemoryTransport::pair(FaultConfig::lossless());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = TunnelConfig {
        heartbeat_interval_ms: 50,
        dead_peer_threshold_ms: 200,
        ..test_config()
    };
    let (task, mut events) = spawn_mux(config, Endpoint::Client(listener), link);

    assert!(matches!(
        next_event(&mut events).await,
        TunnelEvent::PeerUnreachable { .. }
    ));
    assert!(timeout(Duration::from_millis(300), events.recv())
        .await
        .is_err());

    peer.send(0, ControlFrame::heartbeat().encode())
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, TunnelEvent::PeerRecovered);

    task.abort();
}
