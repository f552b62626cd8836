//! Minimal TCP rendezvous relay.
//!
//! The listening device runs the relay itself: each inbound TCP connection
//! announces the dialer's device id in a short hello, is parked under a
//! random session key, and surfaces as an [`Invitation`]. Joining the
//! invitation hands the parked socket to the caller.
//!
//! Hello format: one length byte (always 32) followed by the dialer's
//! device id.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::common::{format_relay_uri, parse_relay_uri, DnsResolver, TunnelConfig, RELAY_URI_SCHEME};
use crate::error::{Error, Result};
use crate::identity::{DeviceId, DEVICE_ID_LEN};
use crate::relay::{Invitation, Relay, RelayListener, SessionJoiner};
use crate::tls::CertKeyPair;

/// Size of the random key a parked session is stored under.
const SESSION_KEY_LEN: usize = 16;

/// Invitations buffered before the accept loop waits on the consumer.
const INVITATION_QUEUE: usize = 64;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Parked sockets by session key; `None` once the relay has stopped.
type ParkedSessions = Arc<Mutex<Option<HashMap<Bytes, TcpStream>>>>;

/// Direct TCP relay, usable as both the dialing and the listening side.
pub struct DirectRelay {
    config: TunnelConfig,
    resolver: DnsResolver,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Option<SocketAddr>,
    advertise: Option<String>,
    serving: AtomicBool,
    sessions: ParkedSessions,
    invitations_tx: Mutex<Option<mpsc::Sender<Invitation>>>,
    invitations_rx: Mutex<mpsc::Receiver<Invitation>>,
}

impl DirectRelay {
    /// A relay that can only dial out.
    pub fn client(config: TunnelConfig) -> Self {
        Self::with_listener(config, None, None)
    }

    /// Binds the listening side on `addr`.
    ///
    /// `advertise` overrides the `host:port` reported by [`RelayListener::uri`].
    pub async fn bind(addr: &str, advertise: Option<String>, config: TunnelConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Relay(format!("failed to bind relay on {}: {}", addr, e)))?;
        Ok(Self::with_listener(config, Some(listener), advertise))
    }

    fn with_listener(config: TunnelConfig, listener: Option<TcpListener>, advertise: Option<String>) -> Self {
        let (tx, rx) = mpsc::channel(INVITATION_QUEUE);
        let local_addr = listener.as_ref().and_then(|l| l.local_addr().ok());
        Self {
            config,
            resolver: DnsResolver::new(),
            listener: Mutex::new(listener),
            local_addr,
            advertise,
            serving: AtomicBool::new(false),
            sessions: Arc::new(Mutex::new(Some(HashMap::new()))),
            invitations_tx: Mutex::new(Some(tx)),
            invitations_rx: Mutex::new(rx),
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn dial(&self, invitation: &Invitation) -> Result<TcpStream> {
        let (host, port) = parse_relay_uri(&invitation.address)?;
        let addr = self.resolver.resolve(&host, port).await?;
        let timeout = self.config.conn_timeout;

        let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Relay(format!("failed to connect to {}: {}", addr, e))),
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "relay connect",
                    after: timeout,
                })
            }
        };
        stream.set_nodelay(true)?;

        let mut hello = Vec::with_capacity(1 + invitation.key.len());
        hello.push(u8::try_from(invitation.key.len()).map_err(|_| Error::Relay("session key too long".to_string()))?);
        hello.extend_from_slice(&invitation.key);
        match tokio::time::timeout(timeout, stream.write_all(&hello)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "relay hello",
                    after: timeout,
                })
            }
        }

        tracing::debug!(relay = %addr, "joined relay session");
        Ok(stream)
    }

    async fn take_parked(&self, invitation: &Invitation) -> Result<TcpStream> {
        self.sessions
            .lock()
            .await
            .as_mut()
            .and_then(|parked| parked.remove(&invitation.key))
            .ok_or_else(|| Error::Relay(format!("no pending session for {}", invitation)))
    }
}

#[async_trait]
impl SessionJoiner for DirectRelay {
    async fn join_session(&self, invitation: &Invitation) -> Result<TcpStream> {
        if invitation.server_socket {
            self.take_parked(invitation).await
        } else {
            self.dial(invitation).await
        }
    }
}

#[async_trait]
impl Relay for DirectRelay {
    async fn get_invitation(
        &self,
        relay_uri: &str,
        target: &DeviceId,
        own: &CertKeyPair,
    ) -> Result<Invitation> {
        parse_relay_uri(relay_uri)?;
        Ok(Invitation {
            from: Bytes::copy_from_slice(target.as_bytes()),
            key: Bytes::copy_from_slice(own.id.as_bytes()),
            address: relay_uri.to_string(),
            server_socket: false,
        })
    }
}

#[async_trait]
impl RelayListener for DirectRelay {
    async fn serve(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Relay("relay is not bound or already serving".to_string()))?;
        let tx = self
            .invitations_tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Relay("relay already stopped".to_string()))?;

        self.serving.store(true, Ordering::SeqCst);
        tracing::info!(uri = ?self.uri(), "relay listening");

        let listener = &listener;
        loop {
            tokio::select! {
                (stream, peer) = accept_with_backoff(move || listener.accept()) => {
                    let sessions = Arc::clone(&self.sessions);
                    let tx = tx.clone();
                    let timeout = self.config.conn_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = park(stream, peer, sessions, tx, timeout).await {
                            tracing::debug!(peer = %peer, error = %e, "rejected relay connection");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::debug!("relay received shutdown signal");
                    break;
                }
            }
        }

        self.serving.store(false, Ordering::SeqCst);
        self.invitations_tx.lock().await.take();

        // Invitations still queued can no longer be joined.
        if let Some(parked) = self.sessions.lock().await.take() {
            if !parked.is_empty() {
                tracing::debug!(count = parked.len(), "dropping unjoined sessions");
            }
        }
        Ok(())
    }

    async fn next_invitation(&self) -> Option<Invitation> {
        self.invitations_rx.lock().await.recv().await
    }

    fn uri(&self) -> Option<String> {
        if !self.serving.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(advertise) = &self.advertise {
            return Some(format!("{}://{}", RELAY_URI_SCHEME, advertise));
        }
        self.local_addr.map(|addr| format_relay_uri(&reachable(addr)))
    }
}

/// Reads the hello, parks the socket and queues an invitation for it.
async fn park(
    mut stream: TcpStream,
    peer: SocketAddr,
    sessions: ParkedSessions,
    tx: mpsc::Sender<Invitation>,
    timeout: Duration,
) -> Result<()> {
    let from = match tokio::time::timeout(timeout, read_hello(&mut stream)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Timeout {
                operation: "relay hello",
                after: timeout,
            })
        }
    };
    stream.set_nodelay(true)?;

    let mut key = [0u8; SESSION_KEY_LEN];
    getrandom::getrandom(&mut key)
        .map_err(|e| Error::Relay(format!("failed to generate session key: {}", e)))?;
    let key = Bytes::copy_from_slice(&key);

    match sessions.lock().await.as_mut() {
        Some(parked) => parked.insert(key.clone(), stream),
        None => return Err(Error::Relay("relay stopped".to_string())),
    };

    let invitation = Invitation {
        from: Bytes::copy_from_slice(from.as_bytes()),
        key: key.clone(),
        address: peer.to_string(),
        server_socket: true,
    };
    tracing::debug!(invitation = %invitation, "queued invitation");
    if tx.send(invitation).await.is_err() {
        if let Some(parked) = sessions.lock().await.as_mut() {
            parked.remove(&key);
        }
        return Err(Error::Relay("relay stopped".to_string()));
    }
    Ok(())
}

/// Accepts the next connection, pausing after each failure.
///
/// Accept errors are mostly transient: descriptor exhaustion (EMFILE, ENFILE)
/// and connections reset before they were accepted. Retrying at once would
/// spin while the condition lasts.
async fn accept_with_backoff<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!(error = %e, "relay accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn read_hello(stream: &mut TcpStream) -> Result<DeviceId> {
    let len = usize::from(stream.read_u8().await?);
    if len != DEVICE_ID_LEN {
        return Err(Error::Relay(format!("bad hello length {}", len)));
    }
    let mut id = [0u8; DEVICE_ID_LEN];
    stream.read_exact(&mut id).await?;
    Ok(DeviceId::from_bytes(&id)?)
}

/// Replaces an unspecified bind address with loopback of the same family.
fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}
