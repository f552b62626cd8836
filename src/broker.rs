//! Turns a device id into an authenticated channel: discovery lookup, then
//! relay rendezvous and handshake with a bounded number of immediate retries.

use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::channel::SecureChannel;
use crate::common::TunnelConfig;
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::identity::DeviceId;
use crate::relay::Relay;
use crate::tls::{generate_in_memory, CertKeyPair};

/// Connects to devices through a shared discovery directory and relay.
pub struct ConnectionBroker<D, R> {
    discovery: Arc<D>,
    relay: Arc<R>,
    config: TunnelConfig,
}

impl<D: Discovery, R: Relay> ConnectionBroker<D, R> {
    pub fn new(discovery: Arc<D>, relay: Arc<R>, config: TunnelConfig) -> Self {
        Self {
            discovery,
            relay,
            config,
        }
    }

    /// First announced address of `target`.
    pub async fn lookup(&self, target: &DeviceId) -> Result<String> {
        tracing::info!("looking up device");
        let addresses = self.discovery.lookup(target).await?;
        let address = addresses
            .into_iter()
            .next()
            .ok_or(Error::NoAddressFound(*target))?;
        tracing::info!(address = %address, "found address");
        Ok(address)
    }

    /// One rendezvous and handshake attempt against `address`.
    pub async fn connect(
        &self,
        own: &CertKeyPair,
        target: &DeviceId,
        address: &str,
    ) -> Result<SecureChannel<TcpStream>> {
        let invitation = self.relay.get_invitation(address, target, own).await?;
        tracing::debug!(invitation = %invitation, "got invitation");
        let stream = self.relay.join_session(&invitation).await?;
        let channel =
            SecureChannel::handshake_as_client(stream, own, target, self.config.conn_timeout).await?;
        tracing::info!("handshake complete");
        Ok(channel)
    }

    /// Looks up `target` and connects to it under a fresh certificate named
    /// `client_name`.
    ///
    /// A failed attempt is retried immediately up to `connect_retries` times.
    /// An empty lookup and authentication failures are returned at once.
    pub async fn lookup_and_connect(
        &self,
        client_name: &str,
        target: &DeviceId,
    ) -> Result<SecureChannel<TcpStream>> {
        let span = tracing::info_span!("connect", target = %target.short());
        self.connect_with_retries(client_name, target)
            .instrument(span)
            .await
    }

    async fn connect_with_retries(
        &self,
        client_name: &str,
        target: &DeviceId,
    ) -> Result<SecureChannel<TcpStream>> {
        let own = generate_in_memory(client_name)?;
        let address = self.lookup(target).await?;

        let retries = self.config.connect_retries;
        let mut retry = 0;
        loop {
            tracing::debug!(attempt = retry + 1, "connecting");
            match self.connect(&own, target, &address).await {
                Ok(channel) => return Ok(channel),
                Err(e) if e.is_authentication() => {
                    tracing::error!(error = %e, "peer failed authentication");
                    return Err(e);
                }
                Err(e) if retry < retries => {
                    retry += 1;
                    tracing::warn!(error = %e, "retry {} of {}", retry, retries);
                }
                Err(e) => {
                    tracing::error!(error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    }
}
