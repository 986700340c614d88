//! Client IP resolution for per-IP throttling and event context.
//!
//! The connection peer address (from axum's `ConnectInfo`) is the only value a
//! client cannot forge. Forwarded headers are honoured only when the peer is a
//! configured trusted proxy:
//!
//! | `TRUSTED_PROXIES` | Peer      | Result                                   |
//! |-------------------|-----------|------------------------------------------|
//! | empty             | any       | peer                                     |
//! | `*`               | any       | `X-Forwarded-For` → `X-Real-IP` → peer   |
//! | ranges            | trusted   | `X-Forwarded-For` → `X-Real-IP` → peer   |
//! | ranges            | untrusted | peer                                     |
//!
//! `*` believes any sender and is only safe when every connection arrives
//! through a proxy that overwrites the forwarded headers.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Key used when no address is known at all.
pub const UNKNOWN_IP: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Parsed CIDR network range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (host route).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                u32::from(net) & mask == u32::from(*addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(*addr) & mask
            }
            _ => false,
        }
    }
}

/// Proxies whose forwarded headers are believed.
///
/// The default trusts nobody, so clients are keyed by their peer address.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    ranges: Vec<CidrRange>,
    any: bool,
}

impl TrustedProxies {
    /// Parse CIDR strings or `*`; invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let any = cidrs.iter().any(|cidr| cidr.trim() == "*");
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter(|cidr| cidr.trim() != "*")
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();
        if any {
            warn!("TRUSTED_PROXIES=* believes forwarded headers from every peer");
        }
        Self { ranges, any }
    }

    pub fn is_enabled(&self) -> bool {
        self.any || !self.ranges.is_empty()
    }

    /// Whether forwarded headers from `peer` should be believed.
    pub fn trusts(&self, peer: Option<IpAddr>) -> bool {
        self.any || peer.is_some_and(|ip| self.ranges.iter().any(|r| r.contains(&ip)))
    }
}

/// Resolve the client address of a request.
pub fn client_ip<B>(req: &Request<B>, trusted: &TrustedProxies) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if trusted.trusts(peer) {
        if let Some(ip) = forwarded_ip(req) {
            return ip.to_string();
        }
    } else if forwarded_ip(req).is_some() {
        debug!(peer = ?peer, "Ignoring forwarded headers from untrusted peer");
    }

    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
fn forwarded_ip<B>(req: &Request<B>) -> Option<&str> {
    let headers = req.headers();
    if let Some(first) = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(first);
    }
    headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
