//! Pluggable backend transport.
//!
//! The engine executes outbound requests against a [`Transport`]; the default
//! is the hyper-util pooled client over plain TCP. Embedders can supply a
//! TLS-capable connector or a mock by implementing the trait.

use std::future::Future;
use std::pin::Pin;

use http::{Request, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::{classify_transport_error, ProxyError};
use crate::forward::{BoxError, ProxyBody};

/// Executes one outbound request and returns the backend response.
pub trait Transport: Send + Sync {
    fn round_trip(
        &self,
        request: Request<ProxyBody>,
    ) -> Pin<Box<dyn Future<Output = Result<Response<ProxyBody>, ProxyError>> + Send>>;
}

/// Default transport: hyper-util legacy client with connection pooling.
/// Upgrade (101) responses carry their duplex stream in the response
/// extensions, which the upgrade handler consumes.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, ProxyBody>,
}

impl HyperTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HyperTransport {
    fn round_trip(
        &self,
        request: Request<ProxyBody>,
    ) -> Pin<Box<dyn Future<Output = Result<Response<ProxyBody>, ProxyError>> + Send>> {
        let client = self.client.clone();
        Box::pin(async move {
            let response = client
                .request(request)
                .await
                .map_err(classify_transport_error)?;
            Ok(response.map(|body| {
                body.map_err(|error| Box::new(error) as BoxError)
                    .boxed_unsync()
            }))
        })
    }
}
