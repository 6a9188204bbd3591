//! Dynamic forward target resolution
//!
//! Parses the `-D host[:port]` specification at startup and resolves the
//! host to a numeric IPv4 address. The resolved pair rides along in every
//! uplink query so the far end knows where to connect the session.

use std::net::{IpAddr, SocketAddr};

use crate::config::{ForwardMode, DEFAULT_TARGET_PORT};
use crate::TunnelError;

/// Resolve a `host[:port]` specification into dynamic-forward mode.
///
/// The port defaults to 22 when omitted. Resolution failure is fatal: a
/// session with an unusable target must not start.
pub async fn parse_forward(spec: &str) -> Result<ForwardMode, TunnelError> {
    let (host, port) = match spec.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| TunnelError::ForwardResolve(format!("invalid port in {}", spec)))?;
            (host, port)
        }
        None => (spec, DEFAULT_TARGET_PORT),
    };

    if host.is_empty() {
        return Err(TunnelError::ForwardResolve(format!(
            "missing host in {}",
            spec
        )));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TunnelError::ForwardResolve(format!("{}: {}", host, e)))?
        .collect();

    // The far end carries the target as a 32-bit address, so only IPv4
    // results are usable.
    let addr = addrs
        .iter()
        .find_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            TunnelError::ForwardResolve(format!("{}: no IPv4 address found", host))
        })?;

    Ok(ForwardMode::Dynamic { addr, port })
}
