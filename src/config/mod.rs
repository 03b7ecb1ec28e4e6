//! Configuration management

use crate::arq::SEGMENT_HEADER_LEN;
use crate::protocol::{
    DEAD_PEER_THRESHOLD_MS, HEARTBEAT_INTERVAL_MS, MAX_CONNECTIONS, TICK_INTERVAL_MS,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Circuit table and scheduler tuning
    pub tunnel: TunnelConfig,
    /// Reliable-session tuning
    pub session: ReliableSessionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// What the application does once the peer stops answering heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadPeerAction {
    /// Log and keep serving
    Warn,
    /// Terminate the process
    Exit,
}

/// Scheduler and circuit table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Number of circuit slots
    pub max_connections: usize,
    /// Session tick period (milliseconds)
    pub tick_interval_ms: u64,
    /// Heartbeat period (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Heartbeat silence that marks the peer unreachable (milliseconds)
    pub dead_peer_threshold_ms: u64,
    /// Interval between unacknowledged CONNECT retries (milliseconds)
    pub connect_retry_ms: u64,
    /// CONNECT attempts before the circuit is abandoned
    pub connect_attempts: u32,
    /// Maximum wait for unacknowledged data after local EOF (milliseconds)
    pub close_linger_ms: u64,
    /// Per-write timeout on local sockets (milliseconds)
    pub write_timeout_ms: u64,
    /// Bytes read from a local socket per readiness event
    pub read_chunk_size: usize,
    /// Bytes buffered per direction per circuit before back-pressure applies
    pub buffer_limit: usize,
    /// Policy for peer liveness loss; unset means the binary decides
    pub dead_peer_action: Option<DeadPeerAction>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            tick_interval_ms: TICK_INTERVAL_MS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            dead_peer_threshold_ms: DEAD_PEER_THRESHOLD_MS,
            connect_retry_ms: 1000,
            connect_attempts: 5,
            close_linger_ms: 3000,
            write_timeout_ms: 30_000,
            read_chunk_size: 8192,
            buffer_limit: 256 * 1024,
            dead_peer_action: None,
        }
    }
}

impl TunnelConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn dead_peer_threshold(&self) -> Duration {
        Duration::from_millis(self.dead_peer_threshold_ms)
    }

    pub fn close_linger(&self) -> Duration {
        Duration::from_millis(self.close_linger_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Smallest session MTU that leaves room for payload
pub const MTU_MIN: usize = SEGMENT_HEADER_LEN + 8;

/// Reliable-session presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    #[default]
    Fast,
    Fast2,
    Fast3,
}

impl FromStr for Mode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "fast" => Ok(Mode::Fast),
            "fast2" => Ok(Mode::Fast2),
            "fast3" => Ok(Mode::Fast3),
            other => Err(crate::Error::Config(format!("Unknown mode: {}", other))),
        }
    }
}

/// Tuning shared by every reliable session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableSessionConfig {
    /// Maximum datagram payload produced by a session
    pub mtu: usize,
    /// Send window (segments)
    pub send_window: u16,
    /// Receive window (segments)
    pub recv_window: u16,
    /// Aggressive RTO handling
    pub nodelay: bool,
    /// Internal flush interval (milliseconds)
    pub interval: u32,
    /// Duplicate-ack count that triggers fast retransmit (0 disables)
    pub resend: u32,
    /// Disable congestion control
    pub no_congestion: bool,
    /// Retransmissions of one segment before the session is declared dead
    pub dead_link: u32,
}

impl Default for ReliableSessionConfig {
    fn default() -> Self {
        Self::for_mode(Mode::default())
    }
}

impl ReliableSessionConfig {
    /// Preset for a mode
    pub fn for_mode(mode: Mode) -> Self {
        let (nodelay, interval) = match mode {
            Mode::Normal => (false, 40),
            Mode::Fast => (false, 30),
            Mode::Fast2 => (true, 20),
            Mode::Fast3 => (true, 10),
        };
        Self {
            mtu: 1200,
            send_window: 512,
            recv_window: 512,
            nodelay,
            interval,
            resend: 2,
            no_congestion: true,
            dead_link: 20,
        }
    }

    /// Reject settings no session can run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.mtu < MTU_MIN {
            return Err(crate::Error::Config(format!(
                "Session MTU {} is below the minimum of {}",
                self.mtu, MTU_MIN
            )));
        }
        if self.send_window == 0 || self.recv_window == 0 {
            return Err(crate::Error::Config("Session windows must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Replace the timing preset, keeping sizes
    pub fn with_mode(self, mode: Mode) -> Self {
        let preset = Self::for_mode(mode);
        Self {
            nodelay: preset.nodelay,
            interval: preset.interval,
            resend: preset.resend,
            no_congestion: preset.no_congestion,
            ..self
        }
    }
}

/// Which side of the tunnel this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts local TCP and initiates circuits
    Client,
    /// Accepts circuits and connects to the target
    Server,
}

/// Datagram endpoint configuration, fixed after startup
#[derive(Debug, Clone)]
pub struct TransportEndpointConfig {
    /// Address the datagram socket binds to
    pub local: SocketAddr,
    /// Fixed peer address (client); learned from traffic on the server
    pub remote: Option<SocketAddr>,
    /// Endpoint role
    pub role: Role,
    /// Always send a zero sequence counter
    pub disable_sequence: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
