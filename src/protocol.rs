//! One-byte command protocol spoken over an authenticated channel.
//!
//! The client sends a single command octet. `Ping` is answered with `Pong`
//! and the channel stays in command mode; `Proxy` ends the protocol and both
//! sides fall back to the raw transport. There is no framing, length prefix
//! or version byte.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::SecureChannel;
use crate::error::{Error, Result};

/// Command octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Ping = 0x01,
    Pong = 0x02,
    Proxy = 0x03,
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        command as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Ping),
            0x02 => Ok(Command::Pong),
            0x03 => Ok(Command::Proxy),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Protocol error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },

    #[error("unexpected read length: expected {expected} bytes, read {read}")]
    UnexpectedReadLength { expected: usize, read: usize },

    #[error("unexpected response: expected {expected:#04x}, got {got:#04x}")]
    UnexpectedResponse { expected: u8, got: u8 },
}

/// What the server command loop ended with.
#[derive(Debug)]
pub enum Dispatch<S> {
    /// The peer closed the channel while it was in command mode.
    Closed,
    /// The peer switched to proxy mode; carries the raw transport.
    Proxy(S),
}

/// Sends one `Ping` and waits for the matching `Pong`.
///
/// The write and the read each carry `timeout`. A reply that is not exactly
/// one byte fails with [`ProtocolError::UnexpectedReadLength`].
pub async fn ping<S>(channel: &mut SecureChannel<S>, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    send_command(channel, Command::Ping, timeout).await?;

    // One spare byte so a longer reply is rejected instead of left buffered.
    let mut buf = [0u8; 2];
    let read = match tokio::time::timeout(timeout, channel.read(&mut buf)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Timeout {
                operation: "awaiting pong",
                after: timeout,
            })
        }
    };
    if read != 1 {
        return Err(ProtocolError::UnexpectedReadLength { expected: 1, read }.into());
    }

    let pong = u8::from(Command::Pong);
    if buf[0] != pong {
        return Err(ProtocolError::UnexpectedResponse {
            expected: pong,
            got: buf[0],
        }
        .into());
    }

    Ok(())
}

/// Sends `Proxy` and downgrades the channel to its raw transport.
///
/// Everything written to or read from the returned stream bypasses TLS.
pub async fn enter_proxy_mode<S>(mut channel: SecureChannel<S>, timeout: Duration) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    send_command(&mut channel, Command::Proxy, timeout).await?;
    tracing::debug!(peer = %channel.peer_id(), "entered proxy mode");
    Ok(channel.into_raw())
}

/// Runs the server side of the protocol until the peer closes, errors, or
/// switches to proxy mode.
///
/// Awaiting a command has no deadline; only the pong write is bounded by
/// `timeout`.
pub async fn serve_commands<S>(mut channel: SecureChannel<S>, timeout: Duration) -> Result<Dispatch<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let mut buf = [0u8; 1];
        let read = match channel.read(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(e) => {
                tracing::debug!(error = %e, "command read failed");
                return Err(e.into());
            }
        };
        if read == 0 {
            tracing::debug!("peer closed channel");
            return Ok(Dispatch::Closed);
        }

        match Command::try_from(buf[0]) {
            Ok(Command::Ping) => {
                tracing::debug!("received ping");
                if let Err(e) = send_command(&mut channel, Command::Pong, timeout).await {
                    tracing::warn!(error = %e, "failed to send pong");
                    return Err(e);
                }
                tracing::debug!("sent pong");
            }
            Ok(Command::Proxy) => {
                tracing::debug!("received proxy");
                return Ok(Dispatch::Proxy(channel.into_raw()));
            }
            Ok(Command::Pong) | Err(_) => {
                tracing::warn!(command = buf[0], "protocol violation");
                return Err(ProtocolError::UnknownCommand(buf[0]).into());
            }
        }
    }
}

/// Writes exactly one command byte and flushes it, bounded by `timeout`.
async fn send_command<S>(channel: &mut SecureChannel<S>, command: Command, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match tokio::time::timeout(timeout, write_command(channel, command)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: "sending command",
            after: timeout,
        }),
    }
}

async fn write_command<S>(channel: &mut SecureChannel<S>, command: Command) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let byte = [u8::from(command)];
    let written = channel.write(&byte).await?;
    if written != byte.len() {
        return Err(ProtocolError::ShortWrite {
            expected: byte.len(),
            written,
        }
        .into());
    }
    channel.flush().await?;
    Ok(())
}
