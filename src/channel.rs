//! Mutually authenticated TLS channel bound to an expected device identity.
//!
//! A [`SecureChannel`] only exists once the handshake has completed and the
//! peer's single certificate has been matched against the identity the
//! caller expected, so holding one means the peer is authenticated. Dropping
//! or closing it releases the transport; [`SecureChannel::into_raw`] hands
//! the transport back for proxy mode.

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, ServerConfig};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::error::{Error, Result};
use crate::identity::DeviceId;
use crate::record::RecordAligned;
use crate::tls::{build_client_config, build_server_config, server_name, CertKeyPair};

/// Which end of the handshake this side played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// An authenticated TLS session over a raw transport.
pub struct SecureChannel<S> {
    stream: TlsStream<RecordAligned<S>>,
    peer: DeviceId,
    role: Role,
}

impl<S> std::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .finish()
    }
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Performs the connecting side of the handshake and checks that the peer
    /// is `expected`.
    pub async fn handshake_as_client(
        raw: S,
        own: &CertKeyPair,
        expected: &DeviceId,
        timeout: Duration,
    ) -> Result<Self> {
        let config = build_client_config(own)?;
        Self::client_with_config(raw, Arc::new(config), expected, timeout).await
    }

    /// Performs the accepting side of the handshake and checks that the peer
    /// is `expected`, the identity asserted by the relay invitation.
    pub async fn handshake_as_server(
        raw: S,
        own: &CertKeyPair,
        expected: &DeviceId,
        timeout: Duration,
    ) -> Result<Self> {
        let config = build_server_config(own)?;
        Self::server_with_config(raw, Arc::new(config), expected, timeout).await
    }

    pub(crate) async fn client_with_config(
        raw: S,
        config: Arc<ClientConfig>,
        expected: &DeviceId,
        timeout: Duration,
    ) -> Result<Self> {
        let name = server_name()?;
        let connect = TlsConnector::from(config).connect(name, RecordAligned::new(raw));
        let stream = timed_handshake(connect, timeout).await?;
        let stream = TlsStream::from(stream);
        Self::authenticate(stream, expected, Role::Client)
    }

    pub(crate) async fn server_with_config(
        raw: S,
        config: Arc<ServerConfig>,
        expected: &DeviceId,
        timeout: Duration,
    ) -> Result<Self> {
        let accept = TlsAcceptor::from(config).accept(RecordAligned::new(raw));
        let stream = timed_handshake(accept, timeout).await?;
        let stream = TlsStream::from(stream);
        Self::authenticate(stream, expected, Role::Server)
    }

    fn authenticate(
        stream: TlsStream<RecordAligned<S>>,
        expected: &DeviceId,
        role: Role,
    ) -> Result<Self> {
        let (_, session) = stream.get_ref();
        let peer = validate_peer(session.peer_certificates(), expected)?;
        tracing::debug!(peer = %peer, ?role, "peer authenticated");
        Ok(Self { stream, peer, role })
    }

    /// Sends close_notify and shuts the transport down.
    pub async fn close(mut self) -> Result<()> {
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<S> SecureChannel<S> {
    /// Identity of the authenticated peer.
    pub fn peer_id(&self) -> &DeviceId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Discards the TLS layer and returns the underlying transport.
    ///
    /// Anything written afterwards travels unencrypted. Reads never ran past
    /// the last TLS record, so no raw bytes are lost.
    pub fn into_raw(self) -> S {
        let aligned = match self.stream {
            TlsStream::Client(stream) => stream.into_inner().0,
            TlsStream::Server(stream) => stream.into_inner().0,
        };
        aligned.into_inner()
    }
}

/// Bounds a handshake future by `timeout`. The deadline ends with the call.
async fn timed_handshake<F, T>(handshake: F, timeout: Duration) -> Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Handshake(e)),
        Err(_) => Err(Error::Timeout {
            operation: "TLS handshake",
            after: timeout,
        }),
    }
}

/// Checks that exactly one certificate was presented and that it belongs to
/// `expected`. Returns the peer's identity.
pub fn validate_peer(
    certs: Option<&[CertificateDer<'_>]>,
    expected: &DeviceId,
) -> Result<DeviceId> {
    let certs = certs.unwrap_or_default();
    if certs.len() != 1 {
        return Err(Error::UnexpectedPeerCertCount(certs.len()));
    }

    let actual = DeviceId::from_der(certs[0].as_ref());
    if actual != *expected {
        return Err(Error::PeerIdentityMismatch {
            expected: *expected,
            actual,
        });
    }

    Ok(actual)
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecureChannel<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecureChannel<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
