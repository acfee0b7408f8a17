//! Header normalization for proxied requests and responses.
//!
//! # Responsibilities
//! - Strip the hop-by-hop header set before a message crosses the proxy
//! - Strip every header nominated by a `Connection` value token
//! - Preserve `TE: trailers` so backends know trailer support exists
//! - Inject `X-Forwarded-*` and `X-Real-IP` forwarding headers
//! - Restore `Connection: Upgrade` / `Upgrade` for negotiated upgrades
//!
//! # Design Decisions
//! - The hop-by-hop set is per-normalizer configuration with an RFC default,
//!   not process-global state; tests extend it via the constructor
//! - Cleaning is idempotent: re-applying it changes nothing further

use std::net::SocketAddr;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Reserved forwarding header names.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PORT: &str = "x-forwarded-port";
pub const X_REAL_IP: &str = "x-real-ip";

/// Hop-by-hop headers, removed when a message is sent to the backend or back
/// to the caller. Per RFC 7230 hop-by-hop headers must be nominated in
/// `Connection`; this closed set covers the RFC 2616 legacy names plus a few
/// that must never survive a proxy hop.
const DEFAULT_HOP_HEADERS: [&str; 11] = [
    "connection",
    "proxy-connection", // non-standard but still sent by libcurl
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "strict-transport-security", // HSTS is terminated at the proxy
    "date",
];

/// Strips hop-by-hop headers and injects forwarding headers.
#[derive(Debug, Clone)]
pub struct HeaderNormalizer {
    hop_headers: Vec<HeaderName>,
    anonymous: bool,
}

impl HeaderNormalizer {
    /// Create a normalizer with the default hop-by-hop set. `anonymous`
    /// suppresses all `X-Forwarded-*` injection.
    pub fn new(anonymous: bool) -> Self {
        Self {
            hop_headers: DEFAULT_HOP_HEADERS
                .iter()
                .map(|name| HeaderName::from_static(name))
                .collect(),
            anonymous,
        }
    }

    /// Extend the hop-by-hop set with additional names.
    pub fn with_extra_hop_headers<I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = HeaderName>,
    {
        self.hop_headers.extend(extra);
        self
    }

    /// Sanitize outbound request headers. `inbound` is the original request's
    /// header map, consulted for the `TE` token check because the outbound
    /// copy has already been through connection-header removal.
    pub fn clean_request(&self, headers: &mut HeaderMap, inbound: &HeaderMap) {
        remove_connection_headers(headers);
        self.remove_hop_headers(headers);

        // Tell backends that care about trailer support that we support
        // trailers, without forwarding arbitrary TE extensions.
        if te_contains_trailers(inbound) {
            headers.insert(header::TE, HeaderValue::from_static("trailers"));
        }
    }

    /// Sanitize response headers before they are copied to the caller.
    pub fn clean_response(&self, headers: &mut HeaderMap) {
        remove_connection_headers(headers);
        self.remove_hop_headers(headers);
    }

    /// Inject forwarding headers. `inbound` carries any prior
    /// `X-Forwarded-For` chain, `inbound_host` is the original `Host` value,
    /// `scheme` the outbound URL scheme, and `peer` the client address.
    pub fn add_forwarding_headers(
        &self,
        headers: &mut HeaderMap,
        inbound: &HeaderMap,
        inbound_host: &str,
        scheme: &str,
        peer: SocketAddr,
    ) {
        // The raw peer address is recorded regardless of anonymity.
        if let Ok(value) = HeaderValue::from_str(&peer.to_string()) {
            headers.insert(
                HeaderName::from_static(X_REAL_IP),
                value,
            );
        }

        if self.anonymous {
            return;
        }

        let scheme = if scheme.is_empty() { "http" } else { scheme };
        let (host, port) = split_host_default_port(inbound_host);
        set_str(headers, X_FORWARDED_PROTO, scheme);
        set_str(headers, X_FORWARDED_HOST, host);
        set_str(headers, X_FORWARDED_PORT, port);

        self.chain_forwarded_for(headers, inbound, peer);
    }

    /// Re-add the upgrade headers removed by hop-by-hop stripping when an
    /// upgrade was negotiated.
    pub fn restore_upgrade(&self, headers: &mut HeaderMap, token: &str) {
        if token.is_empty() {
            return;
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(value) = HeaderValue::from_str(token) {
            headers.insert(header::UPGRADE, value);
        }
    }

    fn remove_hop_headers(&self, headers: &mut HeaderMap) {
        for name in &self.hop_headers {
            headers.remove(name);
        }
    }

    /// Append the client IP to the `X-Forwarded-For` chain. A header that is
    /// present but explicitly empty is a deliberate opt-out and stays absent.
    fn chain_forwarded_for(&self, headers: &mut HeaderMap, inbound: &HeaderMap, peer: SocketAddr) {
        let name = HeaderName::from_static(X_FORWARDED_FOR);
        let prior: Vec<&str> = inbound
            .get_all(&name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();

        if prior.iter().any(|value| value.is_empty()) {
            headers.remove(&name);
            return;
        }

        let client_ip = peer.ip().to_string();
        let chained = if prior.is_empty() {
            client_ip
        } else {
            format!("{}, {}", prior.join(", "), client_ip)
        };
        if let Ok(value) = HeaderValue::from_str(&chained) {
            headers.insert(name, value);
        }
    }
}

/// Remove every header nominated by a token in a `Connection` value. This is
/// distinct from the fixed hop-by-hop set: backends and clients may nominate
/// additional headers as connection-scoped.
fn remove_connection_headers(headers: &mut HeaderMap) {
    let mut nominated = Vec::new();
    for value in headers.get_all(header::CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                nominated.push(token.to_ascii_lowercase());
            }
        }
    }
    for token in nominated {
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
}

/// Whether any `TE` value lists the `trailers` token.
fn te_contains_trailers(headers: &HeaderMap) -> bool {
    headers.get_all(header::TE).iter().any(|value| {
        let Ok(value) = value.to_str() else {
            return false;
        };
        value.split(',').any(|token| {
            token
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("trailers")
        })
    })
}

/// Split `host[:port]` at the last colon, defaulting the port to `80`.
fn split_host_default_port(host: &str) -> (&str, &str) {
    match host.rfind(':') {
        Some(index) if index + 1 < host.len() => (&host[..index], &host[index + 1..]),
        Some(index) => (&host[..index], "80"),
        None => (host, "80"),
    }
}

fn set_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
