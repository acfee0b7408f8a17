//! HTML response body rewriting.
//!
//! Applies only to `text/html` responses. Supported `Content-Encoding`
//! values are empty, `gzip` and `deflate`; anything else skips the rewrite
//! with a warning rather than corrupting the body. After a rewrite the
//! `Content-Length` is recomputed to the exact output length and the body is
//! replaced with the new buffer.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use http::header::{self, HeaderValue};
use http::response;
use http_body_util::BodyExt;

use crate::error::ProxyError;
use crate::forward::{full_body, BoxError, ProxyBody};

type RewriteFn = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync>;

/// Rewrites HTML response bodies through a caller-supplied function.
pub struct HtmlRewriter {
    rewrite: RewriteFn,
}

impl HtmlRewriter {
    pub fn new<F>(rewrite: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        Self {
            rewrite: Box::new(rewrite),
        }
    }

    /// Convenience composition: inject generated content immediately before
    /// the first `</body>`. Empty generated content leaves the body
    /// unchanged; so does a body without a `</body>` tag.
    pub fn inject<F>(generate: F) -> Self
    where
        F: Fn(&[u8]) -> String + Send + Sync + 'static,
    {
        Self::new(move |body| {
            let content = generate(body);
            if content.is_empty() {
                return Ok(body.to_vec());
            }
            match find(body, b"</body>") {
                Some(index) => {
                    let mut rewritten = Vec::with_capacity(body.len() + content.len());
                    rewritten.extend_from_slice(&body[..index]);
                    rewritten.extend_from_slice(content.as_bytes());
                    rewritten.extend_from_slice(&body[index..]);
                    Ok(rewritten)
                }
                None => Ok(body.to_vec()),
            }
        })
    }

    /// Whether the rewriter applies to this response at all.
    pub(crate) fn applies_to(parts: &response::Parts) -> bool {
        parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("text/html"))
    }

    /// Buffer the body, rewrite it through the configured function honoring
    /// `Content-Encoding`, and return the replacement body.
    pub(crate) async fn apply(
        &self,
        parts: &mut response::Parts,
        body: ProxyBody,
    ) -> Result<ProxyBody, ProxyError> {
        let encoding = parts
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        // Deliberate scope limitation, not silent data loss: unknown codecs
        // pass through unrewritten.
        if !matches!(encoding.as_str(), "" | "gzip" | "deflate") {
            tracing::warn!(
                content_encoding = %encoding,
                "unsupported content encoding, skipping body rewrite"
            );
            return Ok(body);
        }

        let collected = body
            .collect()
            .await
            .map_err(|error| ProxyError::Transport(error.to_string()))?
            .to_bytes();

        let rewritten = self
            .rewrite_encoded(&collected, &encoding)
            .map_err(ProxyError::Hook)?;

        parts.headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from(rewritten.len() as u64),
        );
        Ok(full_body(Bytes::from(rewritten)))
    }

    fn rewrite_encoded(&self, body: &[u8], encoding: &str) -> Result<Vec<u8>, BoxError> {
        match encoding {
            "gzip" => {
                let decoded = gzip_decode(body)?;
                gzip_encode(&(self.rewrite)(&decoded)?)
            }
            "deflate" => {
                let decoded = deflate_decode(body)?;
                deflate_encode(&(self.rewrite)(&decoded)?)
            }
            _ => (self.rewrite)(body),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn gzip_decode(input: &[u8]) -> Result<Vec<u8>, BoxError> {
    let mut decoder = GzDecoder::new(input);
    let mut output = Vec::new();
    decoder.read_to_end(&mut output)?;
    Ok(output)
}

fn gzip_encode(input: &[u8]) -> Result<Vec<u8>, BoxError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}

fn deflate_decode(input: &[u8]) -> Result<Vec<u8>, BoxError> {
    let mut decoder = DeflateDecoder::new(input);
    let mut output = Vec::new();
    decoder.read_to_end(&mut output)?;
    Ok(output)
}

fn deflate_encode(input: &[u8]) -> Result<Vec<u8>, BoxError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}
