//! Server lifecycle: accept relay invitations and announce the relay address.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::Instrument;

use crate::bridge::{bridge, Network, Target};
use crate::channel::SecureChannel;
use crate::cli::ListenArgs;
use crate::common::{format_duration, TunnelConfig};
use crate::direct::DirectRelay;
use crate::discovery::{AddressLister, Announcer, Discovery, StaticDiscovery};
use crate::error::{Error, Result};
use crate::identity::DeviceId;
use crate::protocol::{serve_commands, Dispatch};
use crate::relay::{Invitation, RelayListener, SessionJoiner};
use crate::tls::{load_or_generate_cert_at_paths, CertKeyPair, DEFAULT_CERT_NAME};

/// Immutable per-process server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cert: CertKeyPair,
    pub target: Target,
    pub tunnel: TunnelConfig,
}

/// Accepts tunnels arriving through a relay listener.
pub struct Server<R> {
    config: Arc<ServerConfig>,
    relay: Arc<R>,
}

impl<R: RelayListener + 'static> Server<R> {
    pub fn new(config: ServerConfig, relay: Arc<R>) -> Self {
        Self {
            config: Arc::new(config),
            relay,
        }
    }

    /// This server's device id.
    pub fn id(&self) -> DeviceId {
        self.config.cert.id
    }

    /// Runs the relay and handles each invitation on its own task until
    /// `shutdown` fires or the relay stops.
    ///
    /// In-flight connections are not cancelled; they end with their streams.
    pub async fn serve_invitations(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let relay = Arc::clone(&self.relay);
        let relay_shutdown = shutdown.resubscribe();
        let mut relay_task = tokio::spawn(async move { relay.serve(relay_shutdown).await });

        loop {
            tokio::select! {
                invitation = self.relay.next_invitation() => {
                    match invitation {
                        Some(invitation) => self.spawn_connection(invitation),
                        None => {
                            tracing::debug!("invitation stream ended");
                            break;
                        }
                    }
                }
                result = &mut relay_task => {
                    return relay_result(result);
                }
                _ = shutdown.recv() => {
                    tracing::debug!("invitation loop received shutdown signal");
                    break;
                }
            }
        }

        relay_result(relay_task.await)
    }

    /// Announces the relay address through `announcer` until `shutdown` fires.
    pub async fn serve_discovery<D: Discovery>(
        &self,
        announcer: &Announcer<D>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let lister = RelayAddressLister {
            relay: Arc::clone(&self.relay),
        };
        announcer.serve(&lister, shutdown).await
    }

    /// Runs both server loops until `shutdown` fires or one of them fails.
    pub async fn run<D: Discovery>(
        &self,
        announcer: &Announcer<D>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let invitations = self.serve_invitations(shutdown.resubscribe());
        let discovery = self.serve_discovery(announcer, shutdown);
        tokio::try_join!(invitations, discovery)?;
        Ok(())
    }

    fn spawn_connection(&self, invitation: Invitation) {
        let config = Arc::clone(&self.config);
        let relay = Arc::clone(&self.relay);
        let span = tracing::info_span!("conn", invitation = %invitation);

        tokio::spawn(
            async move {
                match handle_invitation(relay.as_ref(), &config, &invitation).await {
                    Ok(()) => tracing::info!("connection closed"),
                    Err(e) if e.is_authentication() => {
                        tracing::warn!(error = %e, "peer failed authentication")
                    }
                    Err(e) => tracing::warn!(error = %e, "connection failed"),
                }
            }
            .instrument(span),
        );
    }
}

/// Joins one invitation, authenticates the peer it claims to be from and
/// serves commands until the peer closes or switches to proxy mode.
async fn handle_invitation<J>(relay: &J, config: &ServerConfig, invitation: &Invitation) -> Result<()>
where
    J: SessionJoiner + ?Sized,
{
    let claimed = DeviceId::from_bytes(&invitation.from)?;
    tracing::info!("invitation received");

    let stream = relay.join_session(invitation).await?;
    let timeout = config.tunnel.conn_timeout;
    let channel = SecureChannel::handshake_as_server(stream, &config.cert, &claimed, timeout).await?;
    tracing::info!(peer = %claimed.short(), "handshake complete");

    match serve_commands(channel, timeout).await? {
        Dispatch::Closed => Ok(()),
        Dispatch::Proxy(raw) => bridge(raw, &config.target).await,
    }
}

fn relay_result(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| Error::Relay(format!("relay task failed: {}", e)))?
}

/// Lists the relay's external URI, or nothing while it is not established.
struct RelayAddressLister<R> {
    relay: Arc<R>,
}

impl<R: RelayListener> AddressLister for RelayAddressLister<R> {
    fn external_addresses(&self) -> Vec<String> {
        self.relay.uri().into_iter().collect()
    }

    fn all_addresses(&self) -> Vec<String> {
        self.external_addresses()
    }
}

/// Runs the listen subcommand until Ctrl-C.
///
/// No global discovery service is wired in: the relay address is announced
/// into a process-local directory that no peer reads, and clients are given
/// the address with --peer-address instead.
pub async fn run_listen(args: &ListenArgs) -> Result<()> {
    let discovery = Arc::new(StaticDiscovery::new());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let run = listen(args, discovery, shutdown_tx.subscribe());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown...");
            let _ = shutdown_tx.send(());
            run.await?;
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Loads the certificate, binds the relay and serves until `shutdown` fires,
/// announcing the relay address into `discovery`.
pub async fn listen<D: Discovery>(
    args: &ListenArgs,
    discovery: Arc<D>,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let network: Network = args.network.parse()?;
    let target = Target::new(network, args.address.clone());

    let (cert, generated) = load_or_generate_cert_at_paths(&args.cert, &args.key, DEFAULT_CERT_NAME)?;
    let tunnel = TunnelConfig::default();
    let relay = Arc::new(DirectRelay::bind(&args.relay_listen, args.advertise.clone(), tunnel).await?);

    let server = Server::new(
        ServerConfig {
            cert,
            target,
            tunnel,
        },
        relay,
    );
    print_startup_message(args, &server, generated);

    let announcer = Announcer::new(discovery, server.id(), args.announce_interval);
    server.run(&announcer, shutdown).await
}

fn print_startup_message<R: RelayListener + 'static>(args: &ListenArgs, server: &Server<R>, generated: bool) {
    if generated {
        tracing::info!(
            cert = %args.cert.display(),
            key = %args.key.display(),
            "generated new certificate"
        );
    }
    tracing::info!(
        id = %server.id(),
        target = %server.config.target,
        relay = %args.relay_listen,
        announce_interval = %format_duration(args.announce_interval),
        "tunnelthing listening"
    );
}
