//! Splices a proxy-mode tunnel to a local service.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Byte stream that can be moved into a copy task.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Network kinds a target may be dialed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    #[cfg(unix)]
    Unix,
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            #[cfg(unix)]
            "unix" => Ok(Network::Unix),
            other => Err(Error::Config(format!("unsupported network '{}'", other))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            #[cfg(unix)]
            Network::Unix => "unix",
        };
        f.write_str(name)
    }
}

/// Local service that proxied connections are bridged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub network: Network,
    pub address: String,
}

impl Target {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.address)
    }
}

/// Connects to the target service.
pub async fn dial(target: &Target) -> Result<Box<dyn Stream>> {
    match target.network {
        Network::Tcp => Ok(Box::new(TcpStream::connect(target.address.as_str()).await?)),
        Network::Tcp4 => dial_filtered(&target.address, |addr| addr.is_ipv4()).await,
        Network::Tcp6 => dial_filtered(&target.address, |addr| addr.is_ipv6()).await,
        #[cfg(unix)]
        Network::Unix => Ok(Box::new(
            tokio::net::UnixStream::connect(&target.address).await?,
        )),
    }
}

async fn dial_filtered(address: &str, keep: fn(&SocketAddr) -> bool) -> Result<Box<dyn Stream>> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host(address).await?.filter(keep) {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(Box::new(stream)),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err
        .unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no suitable address for '{}'", address),
            )
        })
        .into())
}

/// Dials the target and copies bytes both ways until both directions end.
///
/// A dial failure is returned before the tunnel is read from. Once the
/// splice is running, copy errors are only logged.
pub async fn bridge<T>(tunnel: T, target: &Target) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let local = match dial(target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(target = %target, error = %e, "failed to dial target");
            return Err(e);
        }
    };

    tracing::info!(target = %target, "proxy started");
    splice(tunnel, local).await;
    tracing::info!(target = %target, "proxy finished");
    Ok(())
}

/// Copies `a` to `b` and `b` to `a` concurrently.
///
/// Each direction half-closes its destination when its source ends, and the
/// other direction keeps running. Both streams are dropped only after both
/// directions have finished.
pub async fn splice<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let outbound = tokio::spawn(copy_then_shutdown(a_read, b_write));
    let inbound = tokio::spawn(copy_then_shutdown(b_read, a_write));

    let (outbound, inbound) = tokio::join!(outbound, inbound);
    log_direction("tunnel -> target", outbound);
    log_direction("target -> tunnel", inbound);
}

async fn copy_then_shutdown<R, W>(mut reader: R, mut writer: W) -> (io::Result<u64>, R, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await;
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "half-close failed");
    }
    (copied, reader, writer)
}

fn log_direction<R, W>(
    direction: &'static str,
    joined: std::result::Result<(io::Result<u64>, R, W), tokio::task::JoinError>,
) {
    match joined {
        Ok((Ok(bytes), _, _)) => tracing::debug!(direction, bytes, "copy finished"),
        Ok((Err(e), _, _)) => tracing::debug!(direction, error = %e, "copy ended with error"),
        Err(e) => tracing::warn!(direction, error = %e, "copy task failed"),
    }
}
