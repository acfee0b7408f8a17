//! Single-backend forwarder constructor.
//!
//! Pre-wires the request and response hooks so every request lands on one
//! fixed target. Scheme and authority come from the target URL. The path is
//! the inbound path run through the rewrite rules, except when the target
//! itself carries a path and no rules are configured, in which case the
//! target path replaces the inbound one. Query strings from the target, the
//! request and the configuration are merged, configured keys replacing
//! same-named request parameters.

use std::fmt::Write as _;

use http::header::{self, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::Uri;
use url::Url;

use crate::error::ProxyError;
use crate::forward::{Config, ErrorHook, Forwarder, RequestHook, ResponseHook};
use crate::rewrite::RewriteRules;

/// Options for [`Forwarder::single_host`]. The zero value forwards verbatim.
#[derive(Default)]
pub struct SingleHostConfig {
    /// Override the target URL's scheme.
    pub scheme: Option<String>,
    /// Ordered `(pattern, replacement)` path rewrite pairs.
    pub rewrites: Vec<(String, String)>,
    /// Extra query parameters appended to every outbound request.
    pub query: Vec<(String, String)>,
    /// Headers set on every outbound request. Only the first value of each
    /// list is used.
    pub request_headers: Vec<(String, Vec<String>)>,
    /// Headers set on every response. Only the first value of each list is
    /// used.
    pub response_headers: Vec<(String, Vec<String>)>,
    /// Rewrite the `Host` header and any `Origin` header to the target, for
    /// backends that validate their origin.
    pub change_origin: bool,
    /// Suppress `X-Forwarded-*` injection.
    pub anonymous: bool,
    /// Runs after the built-in URI and header mutation, so it sees the
    /// outbound request as the backend would.
    pub on_request: Option<RequestHook>,
    /// Runs after the built-in response header injection.
    pub on_response: Option<ResponseHook>,
    pub on_error: Option<ErrorHook>,
}

impl Forwarder {
    /// Build a forwarder that sends everything to `target`, e.g.
    /// `http://backend:3000` or `https://api.example.com/v1`.
    pub fn single_host(target: &str, config: SingleHostConfig) -> Result<Self, ProxyError> {
        let target = Url::parse(target)
            .map_err(|error| ProxyError::Config(format!("target {target:?}: {error}")))?;

        let scheme_str = config
            .scheme
            .unwrap_or_else(|| target.scheme().to_string());
        let scheme = Scheme::try_from(scheme_str.as_str())
            .map_err(|error| ProxyError::Config(format!("scheme {scheme_str:?}: {error}")))?;

        let host = target
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("target {target} has no host")))?;
        let mut authority = host.to_string();
        if let Some(port) = target.port() {
            let _ = write!(authority, ":{port}");
        }
        let authority = Authority::try_from(authority.as_str())
            .map_err(|error| ProxyError::Config(format!("authority {authority:?}: {error}")))?;

        let target_path = target.path().to_string();
        let target_query = target.query().unwrap_or("").to_string();

        let rewrites = RewriteRules::compile(config.rewrites)
            .map_err(|error| ProxyError::Config(format!("rewrite rule: {error}")))?;
        // The URL parser reports "/" for a path-less target.
        let replace_path = rewrites.is_empty() && !matches!(target_path.as_str(), "" | "/");

        let extra_query = config.query;
        let request_headers =
            parse_header_pairs(config.request_headers.iter().map(|(n, v)| (n, v)))?;
        let response_headers =
            parse_header_pairs(config.response_headers.iter().map(|(n, v)| (n, v)))?;
        let origin = format!("{scheme_str}://{authority}");
        let change_origin = config.change_origin;
        let user_on_request = config.on_request;
        let user_on_response = config.on_response;

        let on_request = Box::new(
            move |outbound: &mut http::Request<crate::ProxyBody>,
                  inbound: &crate::Inbound,
                  ctx: &mut crate::HookContext|
                  -> Result<(), crate::BoxError> {
                // A path-carrying target with no rules pins the backend path;
                // otherwise the rules transform the inbound path.
                let path = if replace_path {
                    target_path.clone()
                } else {
                    rewrites.rewrite(outbound.uri().path())
                };

                let query = merge_query(
                    &target_query,
                    outbound.uri().query().unwrap_or(""),
                    &extra_query,
                );
                let path_and_query = if query.is_empty() {
                    path
                } else {
                    format!("{path}?{query}")
                };

                let mut parts = http::uri::Parts::default();
                parts.scheme = Some(scheme.clone());
                parts.authority = Some(authority.clone());
                parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>()?);
                *outbound.uri_mut() = Uri::from_parts(parts)?;

                for (name, value) in &request_headers {
                    outbound.headers_mut().insert(name.clone(), value.clone());
                }

                if change_origin {
                    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                        outbound.headers_mut().insert(header::HOST, value);
                    }
                    let has_origin = outbound
                        .headers()
                        .get(header::ORIGIN)
                        .is_some_and(|value| !value.is_empty());
                    if has_origin {
                        if let Ok(value) = HeaderValue::from_str(&origin) {
                            outbound.headers_mut().insert(header::ORIGIN, value);
                        }
                    }
                }

                // A default client identity only when nothing configured one
                // and the caller sent none.
                if !outbound.headers().contains_key(header::USER_AGENT) {
                    outbound.headers_mut().insert(
                        header::USER_AGENT,
                        HeaderValue::from_static(concat!("onehop/", env!("CARGO_PKG_VERSION"))),
                    );
                }

                if let Some(hook) = &user_on_request {
                    hook(outbound, inbound, ctx)?;
                }
                Ok(())
            },
        );

        let on_response = Box::new(
            move |parts: &mut http::response::Parts,
                  inbound: &crate::Inbound,
                  ctx: &mut crate::HookContext|
                  -> Result<(), crate::BoxError> {
                for (name, value) in &response_headers {
                    parts.headers.insert(name.clone(), value.clone());
                }
                if let Some(hook) = &user_on_response {
                    hook(parts, inbound, ctx)?;
                }
                Ok(())
            },
        );

        Ok(Self::new(Config {
            anonymous: config.anonymous,
            on_request: Some(on_request),
            on_response: Some(on_response),
            on_error: config.on_error,
            ..Default::default()
        }))
    }
}

/// Merge the target, inbound and configured query strings. Target and
/// inbound parameters are kept side by side; a configured key replaces every
/// same-named parameter.
fn merge_query(target: &str, inbound: &str, extra: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(target.as_bytes())
        .chain(url::form_urlencoded::parse(inbound.as_bytes()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    for (key, value) in extra {
        pairs.retain(|(name, _)| name != key);
        pairs.push((key.clone(), value.clone()));
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Parse configured header lists, keeping only the first value of each.
pub(crate) fn parse_header_pairs<'a, I>(
    pairs: I,
) -> Result<Vec<(HeaderName, HeaderValue)>, ProxyError>
where
    I: IntoIterator<Item = (&'a String, &'a Vec<String>)>,
{
    let mut parsed = Vec::new();
    for (name, values) in pairs {
        let Some(first) = values.first() else { continue };
        let name = name
            .parse::<HeaderName>()
            .map_err(|error| ProxyError::Config(format!("header name {name:?}: {error}")))?;
        let value = HeaderValue::from_str(first)
            .map_err(|error| ProxyError::Config(format!("header value {first:?}: {error}")))?;
        parsed.push((name, value));
    }
    Ok(parsed)
}
