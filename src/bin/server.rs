//! Circuit Tunnel Server
//!
//! The accepting peer:
//! - Receives circuit announcements over the datagram channel
//! - Opens a TCP connection to the target for each circuit
//! - Relays bytes back to the client

use anyhow::{Context, Result};
use circuit_tunnel::{
    config::{Config, DeadPeerAction, LoggingConfig, Mode, Role, TransportEndpointConfig},
    transport::UdpTransport,
    tunnel::{Endpoint, Multiplexer, TunnelEvent},
};
use clap::{error::ErrorKind, CommandFactory, Parser};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when the peer is declared unreachable
const EXIT_PEER_UNREACHABLE: i32 = 2;

/// Circuit Tunnel Server - terminates virtual circuits at a fixed target
#[derive(Parser, Debug)]
#[command(name = "circuit-server")]
#[command(about = "Circuit Tunnel Server - terminates virtual circuits at a fixed target")]
#[command(version)]
struct Args {
    /// Local address for the datagram socket
    local_ip: IpAddr,

    /// Local datagram port
    local_port: u16,

    /// Target address every circuit connects to
    target_ip: IpAddr,

    /// Target port
    target_port: u16,

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

    let endpoint_config = TransportEndpointConfig {
        local: SocketAddr::new(args.local_ip, args.local_port),
        remote: None,
        role: Role::Server,
        disable_sequence: noseq,
    };
    let transport = UdpTransport::bind(&endpoint_config)
        .await
        .with_context(|| format!("Failed to bind datagram socket on {}", endpoint_config.local))?;

    let target = SocketAddr::new(args.target_ip, args.target_port);
    info!(
        "Serving circuits on {}, target {}",
        transport.local_addr()?,
        target
    );

    let dead_peer = config
        .tunnel
        .dead_peer_action
        .unwrap_or(DeadPeerAction::Warn);
    let (mux, mut events) = Multiplexer::new(
        config.tunnel.clone(),
        session,
        Endpoint::Server { target },
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

    info!("Server stopped");
    Ok(())
}

/// React to a tunnel event. Returns true when the process should exit.
fn apply_policy(event: TunnelEvent, dead_peer: DeadPeerAction) -> bool {
    match event {
        TunnelEvent::PeerUnreachable { silent_for } => match dead_peer {
            DeadPeerAction::Exit => {
                error!("Client unreachable for {:?}, exiting", silent_for);
                true
            }
            DeadPeerAction::Warn => {
                warn!("Client unreachable for {:?}", silent_for);
                false
            }
        },
        TunnelEvent::PeerRecovered => {
            info!("Client reachable again");
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
