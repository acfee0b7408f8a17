//! Route resolution for multi-backend forwarding.
//!
//! # Responsibilities
//! - Hold the ordered, immutable route table built at configuration time
//! - Match the inbound hostname against route patterns in declaration order
//! - Derive the backend authority and the `Host` header the backend sees
//!
//! # Design Decisions
//! - Host patterns are full-string regex matches, never substring matches
//! - The port is stripped from the hostname before matching, per RFC 3986
//!   (digits-only optional port, bracketed IPv6 literals unwrapped)
//! - No match is an explicit error surfaced before any backend call

use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use regex::Regex;

use crate::error::ProxyError;
use crate::rewrite::RewriteRules;

/// A single backend route, constructed once and read-only thereafter.
#[derive(Debug, Clone)]
pub struct Route {
    host_pattern: Regex,
    pub scheme: String,
    pub service_name: String,
    pub service_port: u16,
    pub rewrites: RewriteRules,
    pub request_headers: Vec<(HeaderName, HeaderValue)>,
    pub response_headers: Vec<(HeaderName, HeaderValue)>,
}

impl Route {
    /// Compile a route. The pattern is anchored so it must match the whole
    /// hostname; an empty scheme defaults to `http`.
    pub fn new(
        host_pattern: &str,
        scheme: &str,
        service_name: &str,
        service_port: u16,
    ) -> Result<Self, ProxyError> {
        let anchored = format!("^(?:{host_pattern})$");
        let host_pattern = Regex::new(&anchored)
            .map_err(|error| ProxyError::Config(format!("host pattern {host_pattern:?}: {error}")))?;
        let scheme = if scheme.is_empty() { "http" } else { scheme };
        Ok(Self {
            host_pattern,
            scheme: scheme.to_string(),
            service_name: service_name.to_string(),
            service_port,
            rewrites: RewriteRules::default(),
            request_headers: Vec::new(),
            response_headers: Vec::new(),
        })
    }

    pub fn with_rewrites(mut self, rewrites: RewriteRules) -> Self {
        self.rewrites = rewrites;
        self
    }

    pub fn with_request_headers(mut self, headers: Vec<(HeaderName, HeaderValue)>) -> Self {
        self.request_headers = headers;
        self
    }

    pub fn with_response_headers(mut self, headers: Vec<(HeaderName, HeaderValue)>) -> Self {
        self.response_headers = headers;
        self
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.host_pattern.is_match(hostname)
    }

    /// Backend authority, `service_name:service_port`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.service_name, self.service_port)
    }

    /// `Host` header the backend should see: the bare service name on a
    /// scheme-default port, the full authority otherwise.
    pub fn host_header(&self) -> String {
        match self.service_port {
            80 | 443 => self.service_name.clone(),
            _ => self.authority(),
        }
    }
}

/// Ordered route table; first match in declaration order wins.
#[derive(Debug, Clone, Default)]
pub struct RouteSet {
    routes: Vec<Arc<Route>>,
}

impl RouteSet {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Resolve a hostname (no port) to the first matching route.
    pub fn resolve(&self, hostname: &str) -> Result<Arc<Route>, ProxyError> {
        self.routes
            .iter()
            .find(|route| route.matches(hostname))
            .cloned()
            .ok_or_else(|| ProxyError::RouteNotFound(hostname.to_string()))
    }
}

/// Separate host and port. The split happens at the last colon only when the
/// suffix is a valid digits-only port per RFC 3986; bracketed IPv6 literals
/// are unwrapped. Unlike a naive split, `"::1"` stays intact as a host.
pub fn split_host_port(host_port: &str) -> (&str, &str) {
    let mut host = host_port;
    let mut port = "";

    if let Some(colon) = host.rfind(':') {
        if valid_optional_port(&host[colon..]) {
            port = &host[colon + 1..];
            host = &host[..colon];
        }
    }

    if host.starts_with('[') && host.ends_with(']') {
        host = &host[1..host.len() - 1];
    }

    (host, port)
}

/// Whether `port` is empty or matches `/^:\d*$/`.
fn valid_optional_port(port: &str) -> bool {
    if port.is_empty() {
        return true;
    }
    let Some(digits) = port.strip_prefix(':') else {
        return false;
    };
    digits.bytes().all(|b| b.is_ascii_digit())
}
