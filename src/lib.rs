//! Embeddable HTTP reverse-proxy engine
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!                    │                  FORWARDER                    │
//!                    │                                               │
//!   Inbound Request  │  ┌─────────┐   ┌──────────┐   ┌───────────┐ │
//!   ─────────────────┼─▶│  hooks  │──▶│ headers  │──▶│ transport │─┼──▶ Backend
//!                    │  │ context │   │normalizer│   │ (hyper)   │ │
//!                    │  │ request │   └──────────┘   └─────┬─────┘ │
//!                    │  └─────────┘                        │       │
//!                    │                    101? ────────────┤       │
//!                    │                     │               ▼       │
//!                    │              ┌──────▼─────┐  ┌────────────┐ │
//!   Response         │              │  upgrade   │  │  clean +   │ │
//!   ◀────────────────┼──────────────│  tunnel    │  │ rewrite +  │ │
//!                    │              └────────────┘  │  stream    │ │
//!                    │                              └────────────┘ │
//!                    │  ┌────────────────────────────────────────┐ │
//!                    │  │  routing (multi) · rewrite · single    │ │
//!                    │  └────────────────────────────────────────┘ │
//!                    └──────────────────────────────────────────────┘
//! ```
//!
//! The engine is a library first: [`Forwarder::forward`] takes an inbound
//! request plus the peer address and returns the response to write back.
//! [`Forwarder::single_host`] and [`Forwarder::multi_hosts`] pre-wire the
//! hooks for the two common deployments; `Forwarder::new` with a custom
//! [`Config`] covers everything else.

pub mod error;
pub mod forward;
pub mod headers;
pub mod multi;
pub mod rewrite;
pub mod routing;
pub mod single;

pub use error::{BoxError, ProxyError};
pub use forward::html::HtmlRewriter;
pub use forward::transport::Transport;
pub use forward::{
    default_error_response, empty_body, full_body, Config, ContextHook, ErrorHook, Forwarder,
    HookContext, Inbound, ProxyBody, RequestHook, ResponseHook,
};
pub use multi::MultiHostsConfig;
pub use rewrite::{RewriteRule, RewriteRules};
pub use routing::{split_host_port, Route, RouteSet};
pub use single::SingleHostConfig;
