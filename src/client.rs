//! Client subcommands: ping a device, or hand a proxied socket to another
//! process.

use std::sync::Arc;
use std::time::Instant;

use crate::broker::ConnectionBroker;
use crate::cli::{ConnectArgs, PingArgs};
use crate::common::TunnelConfig;
use crate::direct::DirectRelay;
use crate::discovery::StaticDiscovery;
use crate::error::Result;
use crate::identity::DeviceId;
use crate::protocol::{enter_proxy_mode, ping};

/// Certificate name used by the ping subcommand.
pub const PING_CLIENT_NAME: &str = "tunnelthing-ping";

/// Certificate name used by the connect subcommand.
pub const CONNECT_CLIENT_NAME: &str = "tunnelthing-connect";

type DirectBroker = ConnectionBroker<StaticDiscovery, DirectRelay>;

/// Broker whose discovery knows only `peer_address` for `target`.
fn direct_broker(target: DeviceId, peer_address: &str, config: TunnelConfig) -> DirectBroker {
    let discovery = StaticDiscovery::new().with_entry(target, vec![peer_address.to_string()]);
    ConnectionBroker::new(
        Arc::new(discovery),
        Arc::new(DirectRelay::client(config)),
        config,
    )
}

/// Connects to the device and pings it every interval until Ctrl-C.
///
/// Any failed ping ends the command with that error.
pub async fn run_ping(args: &PingArgs) -> Result<()> {
    let target: DeviceId = args.device_id.parse()?;
    let config = TunnelConfig::default();
    let broker = direct_broker(target, &args.peer_address, config);

    let mut channel = broker.lookup_and_connect(PING_CLIENT_NAME, &target).await?;
    tracing::info!(peer = %channel.peer_id(), "connected");

    let mut ticker = tokio::time::interval(args.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let start = Instant::now();
                ping(&mut channel, config.conn_timeout).await?;
                tracing::info!(rtt = ?start.elapsed(), "pong");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, closing channel");
                return channel.close().await;
            }
        }
    }
}

/// Connects to the device, switches to proxy mode and passes the raw socket
/// over the unix socket at descriptor `args.fd`.
#[cfg(unix)]
pub async fn run_connect(args: &ConnectArgs) -> Result<()> {
    use std::os::fd::{AsFd, BorrowedFd};

    let target: DeviceId = args.device_id.parse()?;
    let config = TunnelConfig::default();
    let broker = direct_broker(target, &args.peer_address, config);

    let channel = broker.lookup_and_connect(CONNECT_CLIENT_NAME, &target).await?;
    tracing::info!(peer = %channel.peer_id(), "connected");

    let raw = enter_proxy_mode(channel, config.conn_timeout).await?;
    let socket = raw.into_std()?;

    // SAFETY: the descriptor is inherited from the parent process and stays
    // open for the lifetime of this process.
    let destination = unsafe { BorrowedFd::borrow_raw(args.fd) };
    crate::fdpass::send_fd(destination, socket.as_fd())?;
    tracing::info!(fd = args.fd, "passed tunnel socket");
    Ok(())
}

#[cfg(not(unix))]
pub async fn run_connect(_args: &ConnectArgs) -> Result<()> {
    Err(crate::error::Error::Config(
        "passing sockets between processes requires a unix platform".to_string(),
    ))
}
