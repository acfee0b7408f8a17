//! The forwarding pipeline.
//!
//! # Responsibilities
//! - Own the per-request lifecycle from inbound request to streamed response
//! - Clone the inbound request into an independent outbound envelope
//! - Run the extension hooks at fixed lifecycle points
//! - Dispatch 101 responses to the upgrade handler
//! - Funnel every failure through the single error hook
//!
//! # Data Flow
//! ```text
//! inbound ──▶ hooks ──▶ header normalizer ──▶ transport ──▶ 101? ──▶ tunnel
//!                                                 │
//!                                                 └──▶ clean ─▶ rewrite ─▶ stream
//! ```

pub mod html;
pub mod stream;
pub mod transport;
pub mod upgrade;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Scheme};
use http::{response, Extensions, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::upgrade::OnUpgrade;

pub use crate::error::{BoxError, ProxyError};
use crate::headers::HeaderNormalizer;
use html::HtmlRewriter;
use stream::{announced_trailers, FlushPolicy, StreamedBody};
use transport::{HyperTransport, Transport};
use upgrade::{handle_upgrade, is_printable_ascii, upgrade_type};

/// Body type flowing through the engine. Unsync because server-side bodies
/// (axum's included) are not `Sync`; only one task polls a body anyway.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// How much backend body is quoted when an upgrade is refused.
const UPGRADE_BODY_SNIPPET: usize = 4096;

/// A complete in-memory body.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed_unsync()
}

/// An empty body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| -> BoxError { match never {} })
        .boxed_unsync()
}

/// Immutable view of the original request, retained after the inbound
/// request has been consumed into the outbound envelope.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub peer: SocketAddr,
}

impl Inbound {
    /// The inbound `Host` value: the header when present, the URI authority
    /// otherwise (HTTP/2 requests carry it there).
    pub fn host(&self) -> String {
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.uri.authority().map(|authority| authority.to_string()))
            .unwrap_or_default()
    }
}

/// Typed per-request state, owned by exactly one in-flight request and
/// dropped when it completes. Hooks use it to pass data from the request
/// phase to the response phase without re-computing it.
#[derive(Default)]
pub struct HookContext {
    state: Extensions,
}

impl HookContext {
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.state.insert(value);
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.state.get::<T>()
    }
}

/// Called once per request before anything else; seeds the state bag.
pub type ContextHook = Box<dyn Fn(&mut HookContext) -> Result<(), BoxError> + Send + Sync>;
/// Mutates the outbound request before it is normalized and executed.
pub type RequestHook =
    Box<dyn Fn(&mut Request<ProxyBody>, &Inbound, &mut HookContext) -> Result<(), BoxError> + Send + Sync>;
/// Mutates the response head after header cleanup, before any body bytes move.
pub type ResponseHook =
    Box<dyn Fn(&mut response::Parts, &Inbound, &mut HookContext) -> Result<(), BoxError> + Send + Sync>;
/// Produces the response for a failed request; the only place errors become
/// status codes.
pub type ErrorHook = Box<dyn Fn(&ProxyError, &Inbound) -> Response<ProxyBody> + Send + Sync>;

/// Forwarder configuration. Everything is optional; the zero value proxies
/// requests as-is (the request hook is where a target is usually set).
#[derive(Default)]
pub struct Config {
    /// Suppress all `X-Forwarded-*` injection.
    pub anonymous: bool,
    /// Extra hop-by-hop header names stripped on top of the RFC set.
    pub extra_hop_headers: Vec<HeaderName>,
    pub on_context: Option<ContextHook>,
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
    pub on_error: Option<ErrorHook>,
    /// Optional HTML body rewriter applied to `text/html` responses.
    pub rewrite_html: Option<HtmlRewriter>,
    /// Backend transport; defaults to the pooled hyper client.
    pub transport: Option<Arc<dyn Transport>>,
}

/// The single-hop forwarding engine. One instance serves many concurrent
/// requests; per-request state lives in the pipeline, never on the engine.
pub struct Forwarder {
    normalizer: HeaderNormalizer,
    on_context: Option<ContextHook>,
    on_request: Option<RequestHook>,
    on_response: Option<ResponseHook>,
    on_error: Option<ErrorHook>,
    rewrite_html: Option<HtmlRewriter>,
    transport: Arc<dyn Transport>,
}

impl Forwarder {
    pub fn new(config: Config) -> Self {
        let normalizer =
            HeaderNormalizer::new(config.anonymous).with_extra_hop_headers(config.extra_hop_headers);
        Self {
            normalizer,
            on_context: config.on_context,
            on_request: config.on_request,
            on_response: config.on_response,
            on_error: config.on_error,
            rewrite_html: config.rewrite_html,
            transport: config
                .transport
                .unwrap_or_else(|| Arc::new(HyperTransport::new())),
        }
    }

    /// Replace the backend transport, e.g. with a TLS-capable connector.
    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = transport;
    }

    /// Entry point: forward one inbound request and return the response to
    /// hand to the caller. Errors never escape; they surface as the error
    /// hook's response.
    pub async fn forward<B>(&self, request: Request<B>, peer: SocketAddr) -> Response<ProxyBody>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = request.into_parts();
        // Takeover capability for protocol upgrades, claimed up front.
        let client_upgrade = parts.extensions.remove::<OnUpgrade>();
        let inbound = Inbound {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            peer,
        };

        let mut ctx = HookContext::default();
        if let Some(hook) = &self.on_context {
            if let Err(error) = hook(&mut ctx) {
                return self.error_response(ProxyError::from_hook(error), &inbound);
            }
        }

        // Outbound envelope: structural clone with an independent header map
        // and URL. A declared zero-length body is dropped outright so the
        // transport never retries a consumed stream.
        let declared_length = inbound
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let outbound_body: ProxyBody = match declared_length {
            Some(0) => empty_body(),
            _ => body.map_err(Into::into).boxed_unsync(),
        };
        let mut outbound = Request::new(outbound_body);
        *outbound.method_mut() = inbound.method.clone();
        *outbound.uri_mut() = inbound.uri.clone();
        *outbound.headers_mut() = inbound.headers.clone();
        // The backend hop negotiates its own protocol version; the inbound
        // version is not forwarded.

        if let Some(hook) = &self.on_request {
            if let Err(error) = hook(&mut outbound, &inbound, &mut ctx) {
                return self.error_response(ProxyError::from_hook(error), &inbound);
            }
        }

        default_scheme(outbound.uri_mut());

        let upgrade = upgrade_type(outbound.headers()).unwrap_or_default();
        if !is_printable_ascii(&upgrade) {
            return self.error_response(ProxyError::InvalidUpgradeToken(upgrade), &inbound);
        }

        self.normalizer
            .clean_request(outbound.headers_mut(), &inbound.headers);
        let scheme = outbound.uri().scheme_str().unwrap_or("http").to_string();
        self.normalizer.add_forwarding_headers(
            outbound.headers_mut(),
            &inbound.headers,
            &inbound.host(),
            &scheme,
            peer,
        );
        self.normalizer
            .restore_upgrade(outbound.headers_mut(), &upgrade);
        // Never leak a default client identity.
        if !outbound.headers().contains_key(header::USER_AGENT) {
            outbound
                .headers_mut()
                .insert(header::USER_AGENT, HeaderValue::from_static(""));
        }

        let mut response = match self.transport.round_trip(outbound).await {
            Ok(response) => response,
            Err(error) => return self.error_response(error, &inbound),
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let (mut response_parts, _) = response.into_parts();
            if let Some(hook) = &self.on_response {
                if let Err(error) = hook(&mut response_parts, &inbound, &mut ctx) {
                    return self.error_response(ProxyError::from_hook(error), &inbound);
                }
            }
            return match handle_upgrade(&upgrade, client_upgrade, response_parts) {
                Ok(response) => response,
                Err(error) => self.error_response(error, &inbound),
            };
        }

        // Request expected an upgrade but the backend did not switch.
        if !upgrade.is_empty() {
            let status = response.status();
            let collected = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            let snippet = collected[..collected.len().min(UPGRADE_BODY_SNIPPET)].to_vec();
            return self.error_response(
                ProxyError::UpgradeRefused {
                    status,
                    body: String::from_utf8_lossy(&snippet).into_owned(),
                },
                &inbound,
            );
        }

        // Header cleanup happens before the response hook, which happens
        // before any body bytes are written.
        let announced = announced_trailers(response.headers());
        self.normalizer.clean_response(response.headers_mut());

        let (mut response_parts, response_body) = response.into_parts();
        if let Some(hook) = &self.on_response {
            if let Err(error) = hook(&mut response_parts, &inbound, &mut ctx) {
                return self.error_response(ProxyError::from_hook(error), &inbound);
            }
        }

        let response_body = match &self.rewrite_html {
            Some(rewriter) if HtmlRewriter::applies_to(&response_parts) => {
                match rewriter.apply(&mut response_parts, response_body).await {
                    Ok(body) => body,
                    Err(error) => return self.error_response(error, &inbound),
                }
            }
            _ => response_body,
        };

        // The Trailer announcement itself is hop-by-hop; re-announce what
        // the backend declared so the caller knows what to expect.
        if !announced.is_empty() {
            let mut names: Vec<&str> = announced.iter().map(|name| name.as_str()).collect();
            names.sort_unstable();
            if let Ok(value) = HeaderValue::from_str(&names.join(", ")) {
                response_parts.headers.insert(header::TRAILER, value);
            }
        }

        let policy = FlushPolicy::for_response(&response_parts.headers);
        let body = StreamedBody::new(response_body, policy, announced).boxed_unsync();
        Response::from_parts(response_parts, body)
    }

    fn error_response(&self, error: ProxyError, inbound: &Inbound) -> Response<ProxyBody> {
        match &self.on_error {
            Some(hook) => hook(&error, inbound),
            None => default_error_response(&error, inbound),
        }
    }
}

/// Default error hook: log, remap refused connections to a generic 503, and
/// otherwise answer with the classified status and the error text.
pub fn default_error_response(error: &ProxyError, inbound: &Inbound) -> Response<ProxyBody> {
    let status = error.status();
    tracing::error!(
        method = %inbound.method,
        uri = %inbound.uri,
        peer = %inbound.peer,
        status = %status,
        %error,
        "forwarding failed"
    );

    let message = match error {
        ProxyError::Unreachable(_) => "Service Unavailable".to_string(),
        other => other.to_string(),
    };
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
}

/// Default a scheme-less outbound URI to `http`.
fn default_scheme(uri: &mut Uri) {
    if uri.scheme().is_some() {
        return;
    }
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    // Without an authority there is nothing to dial; leave the URI alone and
    // let the transport report the failure.
    if let Ok(rebuilt) = Uri::from_parts(parts) {
        *uri = rebuilt;
    }
}
