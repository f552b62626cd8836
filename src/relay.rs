//! Rendezvous relay contracts.
//!
//! A relay lets two devices that cannot reach each other meet: the listening
//! side receives [`Invitation`]s announcing who wants to connect, the dialing
//! side asks the relay for an invitation to a given device, and both sides
//! then join the session to get a raw byte stream.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::identity::DeviceId;
use crate::tls::CertKeyPair;

/// A relay-issued token for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Device id of the party on the other end, as claimed by the relay.
    pub from: Bytes,
    /// Session key understood by the relay.
    pub key: Bytes,
    /// Where to join the session.
    pub address: String,
    /// Whether this side accepts (rather than dials) the session.
    pub server_socket: bool,
}

impl fmt::Display for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DeviceId::from_bytes(&self.from) {
            Ok(id) => write!(f, "{}@{}", id, self.address),
            Err(_) => write!(f, "<invalid id>@{}", self.address),
        }
    }
}

/// Turns an invitation into a raw stream to the other party.
#[async_trait]
pub trait SessionJoiner: Send + Sync {
    async fn join_session(&self, invitation: &Invitation) -> Result<TcpStream>;
}

/// Dialing side of a relay.
#[async_trait]
pub trait Relay: SessionJoiner {
    /// Asks the relay at `relay_uri` for a session with `target`.
    async fn get_invitation(
        &self,
        relay_uri: &str,
        target: &DeviceId,
        own: &CertKeyPair,
    ) -> Result<Invitation>;
}

/// Listening side of a relay.
#[async_trait]
pub trait RelayListener: SessionJoiner {
    /// Maintains the relay connection until `shutdown` fires.
    async fn serve(&self, shutdown: broadcast::Receiver<()>) -> Result<()>;

    /// Next inbound invitation, or `None` once the listener has stopped.
    async fn next_invitation(&self) -> Option<Invitation>;

    /// Externally reachable relay address, once established.
    fn uri(&self) -> Option<String>;
}
