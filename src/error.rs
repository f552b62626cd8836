//! Error types for tunnelthing.

use std::time::Duration;
use thiserror::Error;

use crate::identity::{DeviceId, IdentityError};
use crate::protocol::ProtocolError;
use crate::tls::TlsError;

/// Exit codes for the command-line entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Anything not covered below
    Failure = 1,
    /// Discovery returned no address for the device
    NoAddressFound = 10,
    /// Relay, dial or handshake failure after all retries
    ConnectFailed = 11,
    /// Peer failed identity verification
    AuthenticationFailed = 12,
    /// Peer violated the command protocol
    ProtocolError = 20,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for tunnelthing.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid device id: {0}")]
    InvalidIdentityFormat(#[from] IdentityError),

    #[error("certificate error: {0}")]
    Certificate(#[from] TlsError),

    #[error("no address found for device {0}")]
    NoAddressFound(DeviceId),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("unexpected peer certificate count: {0}")]
    UnexpectedPeerCertCount(usize),

    #[error("peer id does not match: expected {expected}, got {actual}")]
    PeerIdentityMismatch { expected: DeviceId, actual: DeviceId },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::NoAddressFound(_) => ExitCode::NoAddressFound,
            Error::Relay(_)
            | Error::Discovery(_)
            | Error::Handshake(_)
            | Error::Timeout { .. }
            | Error::Io(_) => ExitCode::ConnectFailed,
            Error::UnexpectedPeerCertCount(_) | Error::PeerIdentityMismatch { .. } => {
                ExitCode::AuthenticationFailed
            }
            Error::Protocol(_) => ExitCode::ProtocolError,
            Error::InvalidIdentityFormat(_) | Error::Certificate(_) | Error::Config(_) => {
                ExitCode::Failure
            }
        }
    }

    /// Whether the error means the peer failed identity verification.
    ///
    /// These are never retried: a second attempt against the same relay
    /// address would meet the same certificate.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedPeerCertCount(_) | Error::PeerIdentityMismatch { .. }
        )
    }
}

/// Result type alias for tunnelthing operations.
pub type Result<T> = std::result::Result<T, Error>;
