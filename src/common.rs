//! Constants, tunnel configuration and helpers shared by the client, server
//! and relay modules.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Deadline for every handshake, relay and command-byte operation.
pub const CONN_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries after the first connect attempt (11 attempts in total).
pub const CONNECT_RETRIES: u32 = 10;

/// Interval between liveness pings.
pub const PING_INTERVAL: Duration = Duration::from_millis(1500);

/// Default bind address of the direct relay listener.
pub const DEFAULT_RELAY_LISTEN: &str = "0.0.0.0:22067";

/// Default interval between discovery announcements.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// URI scheme understood by the direct relay.
pub const RELAY_URI_SCHEME: &str = "tcp";

/// Timeouts and retry budget for establishing tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Deadline applied to each handshake and command-byte operation.
    pub conn_timeout: Duration,
    /// Retries after the first connect attempt.
    pub connect_retries: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            conn_timeout: CONN_TIMEOUT,
            connect_retries: CONNECT_RETRIES,
        }
    }
}

/// Splits a relay URI of the form `tcp://host:port` into host and port.
///
/// Bracketed IPv6 hosts (`tcp://[::1]:22067`) are unwrapped.
pub fn parse_relay_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix(RELAY_URI_SCHEME)
        .and_then(|r| r.strip_prefix("://"))
        .ok_or_else(|| {
            Error::Relay(format!(
                "relay uri must start with {}://: '{}'",
                RELAY_URI_SCHEME, uri
            ))
        })?;

    // Ignore anything after the authority, e.g. query parameters
    let authority = rest
        .split(|c| c == '/' || c == '?')
        .next()
        .unwrap_or_default();

    let colon_pos = authority
        .rfind(':')
        .ok_or_else(|| Error::Relay(format!("relay uri must include port: '{}'", uri)))?;
    let host_part = &authority[..colon_pos];
    let port_part = &authority[colon_pos + 1..];

    let host = if host_part.starts_with('[') && host_part.ends_with(']') {
        &host_part[1..host_part.len() - 1]
    } else {
        host_part
    };
    if host.is_empty() {
        return Err(Error::Relay(format!("relay uri has no host: '{}'", uri)));
    }

    let port: u16 = port_part
        .parse()
        .map_err(|_| Error::Relay(format!("invalid port in relay uri '{}'", uri)))?;

    Ok((host.to_string(), port))
}

/// Formats a socket address as a relay URI.
pub fn format_relay_uri(addr: &SocketAddr) -> String {
    format!("{}://{}", RELAY_URI_SCHEME, addr)
}

/// Shared DNS resolver, lazily initialised and reused across lookups.
pub struct DnsResolver {
    resolver: Arc<Mutex<Option<hickory_resolver::Resolver<hickory_resolver::name_server::TokioConnectionProvider>>>>,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves a hostname to a SocketAddr. IP literals skip the resolver.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut resolver_guard = self.resolver.lock().await;
        if resolver_guard.is_none() {
            let resolver = hickory_resolver::Resolver::builder_tokio()
                .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))?
                .build();
            *resolver_guard = Some(resolver);
        }
        let Some(resolver) = resolver_guard.as_ref() else {
            return Err(Error::Config("DNS resolver unavailable".to_string()));
        };

        let response = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Relay(format!("failed to resolve '{}': {}", host, e)))?;

        response
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| Error::Relay(format!("no addresses found for '{}'", host)))
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats a duration in a human-readable format similar to Go's duration format.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();

    if secs == 0 && nanos == 0 {
        return "0s".to_string();
    }

    let mut result = String::new();

    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs_remainder = secs % 60;

    if hours > 0 {
        result.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        result.push_str(&format!("{}m", mins));
    }
    if nanos > 0 && hours == 0 && mins == 0 {
        let ms = secs_remainder * 1000 + u64::from(nanos / 1_000_000);
        if secs_remainder > 0 && ms % 1000 != 0 {
            result.push_str(&format!("{}.{}s", secs_remainder, (ms % 1000) / 100));
        } else if secs_remainder > 0 {
            result.push_str(&format!("{}s", secs_remainder));
        } else if ms > 0 {
            result.push_str(&format!("{}ms", ms));
        }
    } else if secs_remainder > 0 {
        result.push_str(&format!("{}s", secs_remainder));
    }

    if result.is_empty() {
        "0s".to_string()
    } else {
        result
    }
}
