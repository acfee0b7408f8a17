//! Error taxonomy for the forwarding pipeline.
//!
//! Every failure that reaches the orchestrator is a [`ProxyError`]; the error
//! hook is the single place that turns one into a response. Classification
//! decides the status class: client protocol errors map to 4xx before any
//! backend call, transport failures to 502, and a refused connection to 503
//! with a generic body so backend topology is not leaked.

use http::StatusCode;
use thiserror::Error;

/// Boxed error type used at hook boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the forwarding pipeline.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client asked to switch to a protocol token that is not printable
    /// ASCII. Surfaced before any backend call.
    #[error("client tried to switch to invalid protocol {0:?}")]
    InvalidUpgradeToken(String),

    /// No configured route matched the inbound hostname.
    #[error("route for host {0:?} not found")]
    RouteNotFound(String),

    /// The backend could not be reached (connection refused).
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// Any other transport-level failure (dial, read, write).
    #[error("backend request failed: {0}")]
    Transport(String),

    /// The request asked for an upgrade but the backend answered with a
    /// non-101 status. Carries the backend status and a body snippet for
    /// diagnostics.
    #[error("backend refused protocol upgrade (status {status}): {body}")]
    UpgradeRefused { status: StatusCode, body: String },

    /// The backend answered 101 but negotiated a different protocol token
    /// than the one requested.
    #[error("backend tried to switch to protocol {offered:?} when {requested:?} was requested")]
    UpgradeMismatch { requested: String, offered: String },

    /// The inbound request cannot be hijacked (no upgrade capability on the
    /// caller-facing connection).
    #[error("caller connection does not support protocol upgrades")]
    UpgradeUnsupported,

    /// Invalid construction-time configuration (bad pattern, header name...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An error with an explicit status, typically raised by a hook.
    #[error("{message}")]
    Http { status: StatusCode, message: String },

    /// Opaque failure from a user-supplied hook.
    #[error("hook failed: {0}")]
    Hook(#[source] BoxError),
}

impl ProxyError {
    /// Status class the error maps to at the caller boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidUpgradeToken(_) => StatusCode::BAD_REQUEST,
            ProxyError::RouteNotFound(_)
            | ProxyError::Transport(_)
            | ProxyError::UpgradeRefused { .. }
            | ProxyError::UpgradeMismatch { .. }
            | ProxyError::UpgradeUnsupported => StatusCode::BAD_GATEWAY,
            ProxyError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Config(_) | ProxyError::Hook(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Http { status, .. } => *status,
        }
    }

    /// Convert a hook failure, unwrapping a `ProxyError` the hook may have
    /// raised directly (e.g. `Http { status, .. }` or `RouteNotFound`).
    pub fn from_hook(error: BoxError) -> Self {
        match error.downcast::<ProxyError>() {
            Ok(own) => *own,
            Err(other) => ProxyError::Hook(other),
        }
    }
}

/// Classify a transport failure, walking the source chain for a
/// connection-refused signature.
pub(crate) fn classify_transport_error<E>(error: E) -> ProxyError
where
    E: std::error::Error + 'static,
{
    let message = error.to_string();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&error);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return ProxyError::Unreachable(message);
            }
        }
        source = current.source();
    }
    if message.contains("connection refused") {
        return ProxyError::Unreachable(message);
    }
    ProxyError::Transport(message)
}
