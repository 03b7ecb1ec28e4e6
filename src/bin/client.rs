//! Circuit Tunnel Client
//!
//! The initiating peer:
//! - Listens for local TCP connections
//! - Announces a virtual circuit for each one
//! - Relays its bytes over the datagram channel to the server

use anyhow::{Context, Result};
use circuit_tunnel::{
    config::{Config, DeadPeerAction, LoggingConfig, Mode, Role, TransportEndpointConfig},
    transport::{random_source_port, UdpTransport},
    tunnel::{Endpoint, Multiplexer, TunnelEvent},
};
use clap::{error::ErrorKind, CommandFactory, Parser};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when the peer is declared unreachable
const EXIT_PEER_UNREACHABLE: i32 = 2;

/// Circuit Tunnel Client - relays local TCP connections over one datagram channel
#[derive(Parser, Debug)]
#[command(name = "circuit-client")]
#[command(about = "Circuit Tunnel Client - relays local TCP connections over one datagram channel")]
#[command(version)]
struct Args {
    /// Server address
    remote_ip: IpAddr,

    /// Server port
    remote_port: u16,

    /// Local address to bind
    local_ip: IpAddr,

    /// Local TCP port to accept connections on
    listen_port: u16,

    /// Session mode (normal, fast, fast2, fast3) and/or `noseq`
    #[arg(value_name = "MODE|noseq")]
    extra: Vec<String>,

    /// Disable the transport sequence counter
    #[arg(long)]
    noseq: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Parse arguments; usage errors exit with status 1
fn parse_args() -> (Args, Option<Mode>, bool) {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let mut mode = None;
    let mut noseq = args.noseq;
    for word in &args.extra {
        if word.eq_ignore_ascii_case("noseq") {
            noseq = true;
            continue;
        }
        match word.parse::<Mode>() {
            Ok(parsed) if mode.is_none() => mode = Some(parsed),
            _ => {
                let _ = Args::command()
                    .error(ErrorKind::InvalidValue, format!("unexpected argument '{}'", word))
                    .print();
                std::process::exit(1);
            }
        }
    }
    (args, mode, noseq)
}

#[tokio::main]
async fn main() -> Result<()> {
    let (args, mode, noseq) = parse_args();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging);

    let session = match mode {
        Some(mode) => config.session.clone().with_mode(mode),
        None => config.session.clone(),
    };

    let remote = SocketAddr::new(args.remote_ip, args.remote_port);
    let endpoint_config = TransportEndpointConfig {
        local: SocketAddr::new(args.local_ip, random_source_port()),
        remote: Some(remote),
        role: Role::Client,
        disable_sequence: noseq,
    };
    let transport = UdpTransport::bind(&endpoint_config)
        .await
        .context("Failed to bind datagram socket")?;

    let listen = SocketAddr::new(args.local_ip, args.listen_port);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    info!(
        "Listening on {}, tunnelling to {} from {}",
        listen,
        remote,
        transport.local_addr()?
    );

    let dead_peer = config
        .tunnel
        .dead_peer_action
        .unwrap_or(DeadPeerAction::Exit);
    let (mux, mut events) = Multiplexer::new(
        config.tunnel.clone(),
        session,
        Endpoint::Client(listener),
        transport,
    )
    .context("Failed to start multiplexer")?;

    let mut tunnel = tokio::spawn(mux.run(async {
        let _ = tokio::signal::ctrl_c().await;
    }));

    loop {
        tokio::select! {
            result = &mut tunnel => {
                result
                    .context("Multiplexer task failed")?
                    .context("Tunnel stopped")?;
                break;
            }
            Some(event) = events.recv() => {
                if apply_policy(event, dead_peer) {
                    std::process::exit(EXIT_PEER_UNREACHABLE);
                }
            }
        }
    }

    info!("Client stopped");
    Ok(())
}

/// React to a tunnel event. Returns true when the process should exit.
fn apply_policy(event: TunnelEvent, dead_peer: DeadPeerAction) -> bool {
    match event {
        TunnelEvent::PeerUnreachable { silent_for } => match dead_peer {
            DeadPeerAction::Exit => {
                error!("Server unreachable for {:?}, exiting", silent_for);
                true
            }
            DeadPeerAction::Warn => {
                warn!("Server unreachable for {:?}", silent_for);
                false
            }
        },
        TunnelEvent::PeerRecovered => {
            info!("Server reachable again");
            false
        }
        other => {
            debug!("Tunnel event: {:?}", other);
            false
        }
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
}
