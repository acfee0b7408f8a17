//! Multi-backend forwarder constructor.
//!
//! Builds a forwarder from a declarative route table: each inbound hostname
//! resolves to one backend, in declaration order, with per-route path
//! rewrites and header injection. The resolved route is stashed in the
//! request state so the response phase sees the same route without a second
//! lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::header::{self, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::Uri;
use serde::Deserialize;

use crate::error::ProxyError;
use crate::forward::{BoxError, Config, ErrorHook, Forwarder, HookContext, Inbound, ProxyBody};
use crate::rewrite::RewriteRules;
use crate::routing::{split_host_port, Route, RouteSet};
use crate::single::parse_header_pairs;

/// Declarative multi-backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiHostsConfig {
    pub routes: Vec<RouteConfig>,
    /// Suppress `X-Forwarded-*` injection.
    #[serde(default)]
    pub anonymous: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Host pattern matched against the full inbound hostname, port excluded.
    pub host: String,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default = "default_protocol")]
    pub service_protocol: String,
    pub service_name: String,
    pub service_port: u16,
    #[serde(default)]
    pub rewrites: Vec<RewritePair>,
    /// Headers set on the outbound request. Only the first value of each
    /// list is used.
    #[serde(default)]
    pub request_headers: BTreeMap<String, Vec<String>>,
    /// Headers set on the response. Only the first value of each list is
    /// used.
    #[serde(default)]
    pub response_headers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewritePair {
    pub from: String,
    pub to: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl MultiHostsConfig {
    pub fn from_json(json: &str) -> Result<Self, ProxyError> {
        serde_json::from_str(json).map_err(|error| ProxyError::Config(error.to_string()))
    }
}

impl Forwarder {
    /// Build a forwarder that resolves each request's hostname against the
    /// configured route table.
    pub fn multi_hosts(config: MultiHostsConfig) -> Result<Self, ProxyError> {
        Self::multi_hosts_with_error_hook(config, None)
    }

    pub fn multi_hosts_with_error_hook(
        config: MultiHostsConfig,
        on_error: Option<ErrorHook>,
    ) -> Result<Self, ProxyError> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            let backend = &route.backend;
            let rewrites = RewriteRules::compile(
                backend
                    .rewrites
                    .iter()
                    .map(|pair| (pair.from.as_str(), pair.to.as_str())),
            )
            .map_err(|error| ProxyError::Config(format!("route {:?}: {error}", route.host)))?;

            routes.push(
                Route::new(
                    &route.host,
                    &backend.service_protocol,
                    &backend.service_name,
                    backend.service_port,
                )?
                .with_rewrites(rewrites)
                .with_request_headers(parse_header_pairs(backend.request_headers.iter())?)
                .with_response_headers(parse_header_pairs(backend.response_headers.iter())?),
            );
        }
        let routes = RouteSet::new(routes);

        let on_request = Box::new(
            move |outbound: &mut http::Request<ProxyBody>,
                  inbound: &Inbound,
                  ctx: &mut HookContext|
                  -> Result<(), BoxError> {
                let host = inbound.host();
                let (hostname, _) = split_host_port(&host);
                let route = routes.resolve(hostname)?;

                let path = route.rewrites.rewrite(outbound.uri().path());
                let path_and_query = match outbound.uri().query() {
                    Some(query) => format!("{path}?{query}"),
                    None => path,
                };
                let mut parts = http::uri::Parts::default();
                parts.scheme = Some(Scheme::try_from(route.scheme.as_str())?);
                parts.authority = Some(Authority::try_from(route.authority().as_str())?);
                parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>()?);
                *outbound.uri_mut() = Uri::from_parts(parts)?;

                // Backends behind service discovery expect their own name.
                outbound
                    .headers_mut()
                    .insert(header::HOST, HeaderValue::from_str(&route.host_header())?);
                for (name, value) in &route.request_headers {
                    outbound.headers_mut().insert(name.clone(), value.clone());
                }

                tracing::info!(
                    method = %inbound.method,
                    host = %hostname,
                    backend = %route.authority(),
                    path = %outbound.uri().path(),
                    "route resolved"
                );
                ctx.insert(route);
                Ok(())
            },
        );

        let on_response = Box::new(
            move |parts: &mut http::response::Parts,
                  _inbound: &Inbound,
                  ctx: &mut HookContext|
                  -> Result<(), BoxError> {
                if let Some(route) = ctx.get::<Arc<Route>>() {
                    for (name, value) in &route.response_headers {
                        parts.headers.insert(name.clone(), value.clone());
                    }
                }
                Ok(())
            },
        );

        Ok(Self::new(Config {
            anonymous: config.anonymous,
            on_request: Some(on_request),
            on_response: Some(on_response),
            on_error,
            ..Default::default()
        }))
    }
}
