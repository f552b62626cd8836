//! tunnelthing - Authenticated TLS tunnels between devices behind NAT.
//!
//! Two devices meet through a relay, authenticate each other by the hash of
//! their certificates, and then either exchange liveness pings or switch the
//! connection to a raw proxy into a local service.

pub mod bridge;
pub mod broker;
pub mod channel;
pub mod cli;
pub mod client;
pub mod common;
pub mod direct;
pub mod discovery;
pub mod error;
#[cfg(unix)]
pub mod fdpass;
pub mod identity;
pub mod protocol;
pub mod record;
pub mod relay;
pub mod server;
pub mod tls;

pub use bridge::{bridge, dial, splice, Network, Target};
pub use broker::ConnectionBroker;
pub use channel::{validate_peer, Role, SecureChannel};
pub use cli::{BuildInfo, Cli, Command, ConnectArgs, GencertArgs, IdArgs, ListenArgs, PingArgs};
pub use client::{run_connect, run_ping, CONNECT_CLIENT_NAME, PING_CLIENT_NAME};
pub use common::{
    format_duration, format_relay_uri, parse_relay_uri, DnsResolver, TunnelConfig,
    CONNECT_RETRIES, CONN_TIMEOUT, DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_RELAY_LISTEN, PING_INTERVAL,
};
pub use direct::DirectRelay;
pub use discovery::{AddressLister, Announcer, Discovery, StaticDiscovery};
pub use error::{Error, ExitCode, Result};
pub use identity::{DeviceId, IdentityError, DEVICE_ID_LEN};
pub use protocol::{enter_proxy_mode, ping, serve_commands, Command as CommandByte, Dispatch, ProtocolError};
pub use relay::{Invitation, Relay, RelayListener, SessionJoiner};
pub use server::{listen, run_listen, Server, ServerConfig};
pub use tls::{
    build_client_config, build_server_config, generate_in_memory, generate_self_signed_cert,
    load_cert_id, load_cert_key, load_or_generate_cert_at_paths, write_new_cert, CertKeyPair,
    TlsError, TlsResult, CERT_FILENAME, KEY_FILENAME,
};
