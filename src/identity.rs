//! Device identities.
//!
//! A device is identified by the SHA-256 digest of its certificate's DER
//! encoding. The identity is the only authorization credential: a peer is who
//! it claims to be exactly when the leaf certificate it presents during the TLS
//! handshake hashes to the expected value.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a device identity in bytes.
pub const DEVICE_ID_LEN: usize = 32;

/// Length of the continuous hex string form.
const HEX_LEN: usize = DEVICE_ID_LEN * 2;

/// Length of the colon-separated string form (`aa:bb:...`).
const COLON_HEX_LEN: usize = DEVICE_ID_LEN * 3 - 1;

/// Error type for identity parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("device id must be {expected} characters, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("device id must be 32 bytes, got {0}")]
    InvalidByteLength(usize),

    #[error("invalid hex in device id: {0:?}")]
    InvalidHex(String),
}

/// Identity of a device, derived from its certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// Derives the identity of a DER-encoded certificate.
    pub fn from_der(cert_der: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(cert_der);
        Self(hasher.finalize().into())
    }

    /// Builds an identity from its raw bytes, as carried in relay invitations.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let raw: [u8; DEVICE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidByteLength(bytes.len()))?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// Returns the first eight hex characters, for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self)
    }
}

impl FromStr for DeviceId {
    type Err = IdentityError;

    /// Parses either continuous hex (64 characters) or colon-separated hex
    /// (95 characters), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let hex_str = if s.contains(':') {
            if s.len() != COLON_HEX_LEN {
                return Err(IdentityError::InvalidLength {
                    expected: COLON_HEX_LEN,
                    got: s.len(),
                });
            }
            if s.split(':').any(|part| part.len() != 2) {
                return Err(IdentityError::InvalidHex(s.to_string()));
            }
            s.replace(':', "")
        } else {
            if s.len() != HEX_LEN {
                return Err(IdentityError::InvalidLength {
                    expected: HEX_LEN,
                    got: s.len(),
                });
            }
            s.to_string()
        };

        // from_str_radix alone would accept a leading '+'
        if !hex_str.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdentityError::InvalidHex(s.to_string()));
        }

        let mut raw = [0u8; DEVICE_ID_LEN];
        for (i, chunk) in hex_str.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| IdentityError::InvalidHex(s.to_string()))?;
            raw[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| IdentityError::InvalidHex(pair.to_string()))?;
        }

        Ok(Self(raw))
    }
}
