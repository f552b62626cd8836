//! CLI definitions for tunnelthing.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::common::DEFAULT_RELAY_LISTEN;
use crate::tls::{CERT_FILENAME, DEFAULT_CERT_NAME, KEY_FILENAME};

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Authenticated TLS tunnels between devices, rendezvoused through a relay.
#[derive(Debug, Parser)]
#[command(name = "tunnelthing")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept tunnels and bridge proxied connections to a local service
    Listen(ListenArgs),

    /// Connect to a device and ping it until interrupted
    Ping(PingArgs),

    /// Connect to a device, enter proxy mode and pass the socket to a descriptor
    Connect(ConnectArgs),

    /// Generate a certificate and key
    Gencert(GencertArgs),

    /// Print the device id of a certificate
    Id(IdArgs),

    /// Show version information
    Version,
}

/// Arguments for the listen subcommand.
#[derive(Debug, Parser)]
pub struct ListenArgs {
    /// Network of the local service (tcp, tcp4, tcp6, unix)
    pub network: String,

    /// Address of the local service (e.g., 127.0.0.1:22)
    pub address: String,

    /// Certificate file path
    #[arg(long, default_value = CERT_FILENAME)]
    pub cert: PathBuf,

    /// Private key file path
    #[arg(long, default_value = KEY_FILENAME)]
    pub key: PathBuf,

    /// Relay listen address
    #[arg(long, default_value = DEFAULT_RELAY_LISTEN)]
    pub relay_listen: String,

    /// host:port announced to peers instead of the bound address
    #[arg(long)]
    pub advertise: Option<String>,

    /// Interval between discovery announcements
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub announce_interval: Duration,
}

/// Arguments for the ping subcommand.
#[derive(Debug, Parser)]
pub struct PingArgs {
    /// Device id of the listener
    pub device_id: String,

    /// Relay URI of the listener (e.g., tcp://host:22067)
    #[arg(long)]
    pub peer_address: String,

    /// Interval between pings
    #[arg(long, value_parser = parse_duration, default_value = "1500ms")]
    pub interval: Duration,
}

/// Arguments for the connect subcommand.
#[derive(Debug, Parser)]
pub struct ConnectArgs {
    /// Device id of the listener
    pub device_id: String,

    /// Relay URI of the listener (e.g., tcp://host:22067)
    #[arg(long)]
    pub peer_address: String,

    /// Unix socket descriptor the tunnel socket is passed over
    #[arg(long, default_value_t = 1)]
    pub fd: i32,
}

/// Arguments for the gencert subcommand.
#[derive(Debug, Parser)]
pub struct GencertArgs {
    /// Certificate file path
    #[arg(long, default_value = CERT_FILENAME)]
    pub cert: PathBuf,

    /// Private key file path
    #[arg(long, default_value = KEY_FILENAME)]
    pub key: PathBuf,

    /// Certificate common name
    #[arg(long, default_value = DEFAULT_CERT_NAME)]
    pub name: String,
}

/// Arguments for the id subcommand.
#[derive(Debug, Parser)]
pub struct IdArgs {
    /// Certificate file path
    #[arg(long, default_value = CERT_FILENAME)]
    pub cert: PathBuf,
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("TUNNELTHING_COMMIT").unwrap_or("unknown"),
            built: option_env!("TUNNELTHING_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "tunnelthing version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}
