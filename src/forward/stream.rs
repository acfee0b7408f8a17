//! Streaming response copier with adaptive flush timing.
//!
//! # Responsibilities
//! - Pick a flush policy per response (SSE and unknown-length responses
//!   stream immediately; fixed-length responses use transport buffering)
//! - Forward body frames under that policy, coalescing where allowed
//! - Re-emit unannounced trailers under a reserved prefix
//!
//! # Design Decisions
//! - The copier is a body adapter polled by the connection task, so the
//!   pending-flush flag needs no lock; the latency timer is a single-shot
//!   sleep that re-arms only after the pending flush clears
//! - A backend read error aborts the in-flight response; with headers already
//!   committed there is no status left to change

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http_body::{Body, Frame, SizeHint};
use tokio::time::{sleep, Sleep};

use crate::forward::{BoxError, ProxyBody};

/// Trailers the backend sent without announcing them in `Trailer` are
/// re-emitted under this prefix, preserving the announced-trailer contract.
pub const UNANNOUNCED_TRAILER_PREFIX: &str = "x-unannounced-trailer-";

/// Coalescing buffer limit under the deferred policy.
const FLUSH_THRESHOLD: usize = 32 * 1024;

/// When body bytes are pushed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Every backend chunk is forwarded as soon as it arrives.
    Immediate,
    /// Chunks are coalesced up to a threshold; the transport's own buffering
    /// decides when bytes hit the wire.
    Deferred,
    /// Chunks are coalesced for at most this window. Reserved tunable; no
    /// built-in policy selection produces it today.
    MaxLatency(Duration),
}

impl FlushPolicy {
    /// Compute the policy for a response: immediate for `text/event-stream`
    /// (parameters ignored) and for responses without a declared length,
    /// deferred otherwise.
    pub fn for_response(headers: &HeaderMap) -> Self {
        if let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            let base = content_type.split(';').next().unwrap_or("").trim();
            if base.eq_ignore_ascii_case("text/event-stream") {
                return FlushPolicy::Immediate;
            }
        }

        let declared_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        match declared_length {
            Some(_) => FlushPolicy::Deferred,
            None => FlushPolicy::Immediate,
        }
    }
}

/// Parse the announced trailer name set from a response's `Trailer` header.
pub(crate) fn announced_trailers(headers: &HeaderMap) -> HashSet<HeaderName> {
    let mut announced = HashSet::new();
    for value in headers.get_all(header::TRAILER) {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            if let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) {
                announced.insert(name);
            }
        }
    }
    announced
}

/// Body adapter that copies the backend body to the caller under a
/// [`FlushPolicy`] and remaps unannounced trailers.
pub struct StreamedBody {
    source: ProxyBody,
    policy: FlushPolicy,
    buffer: BytesMut,
    timer: Option<Pin<Box<Sleep>>>,
    flush_pending: bool,
    announced: HashSet<HeaderName>,
    pending_trailers: Option<HeaderMap>,
    source_done: bool,
}

impl StreamedBody {
    pub fn new(source: ProxyBody, policy: FlushPolicy, announced: HashSet<HeaderName>) -> Self {
        Self {
            source,
            policy,
            buffer: BytesMut::new(),
            timer: None,
            flush_pending: false,
            announced,
            pending_trailers: None,
            source_done: false,
        }
    }

    fn take_buffer(&mut self) -> Frame<Bytes> {
        Frame::data(self.buffer.split().freeze())
    }

    /// Remap trailers: announced names pass through, everything else moves
    /// under the reserved prefix.
    fn remap_trailers(&self, trailers: HeaderMap) -> HeaderMap {
        let mut remapped = HeaderMap::new();
        for (name, value) in trailers.iter() {
            if self.announced.contains(name) {
                remapped.append(name.clone(), value.clone());
            } else if let Ok(prefixed) =
                HeaderName::from_bytes(format!("{UNANNOUNCED_TRAILER_PREFIX}{name}").as_bytes())
            {
                remapped.append(prefixed, value.clone());
            }
        }
        remapped
    }
}

impl Body for StreamedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        loop {
            // A fired latency timer flushes whatever has accumulated. The
            // timer is polled every pass so its waker stays registered.
            if this.flush_pending {
                if let Some(timer) = this.timer.as_mut() {
                    if timer.as_mut().poll(cx).is_ready() {
                        this.flush_pending = false;
                        this.timer = None;
                        if !this.buffer.is_empty() {
                            return Poll::Ready(Some(Ok(this.take_buffer())));
                        }
                    }
                }
            }

            if this.source_done {
                if !this.buffer.is_empty() {
                    return Poll::Ready(Some(Ok(this.take_buffer())));
                }
                if let Some(trailers) = this.pending_trailers.take() {
                    return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                }
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.source).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if frame.is_data() {
                        let data = frame.into_data().unwrap_or_default();
                        match this.policy {
                            FlushPolicy::Immediate => {
                                return Poll::Ready(Some(Ok(Frame::data(data))));
                            }
                            FlushPolicy::Deferred => {
                                this.buffer.extend_from_slice(&data);
                                if this.buffer.len() >= FLUSH_THRESHOLD {
                                    return Poll::Ready(Some(Ok(this.take_buffer())));
                                }
                            }
                            FlushPolicy::MaxLatency(window) => {
                                this.buffer.extend_from_slice(&data);
                                // A write while a flush is pending does not
                                // reschedule the timer.
                                if !this.flush_pending {
                                    this.timer = Some(Box::pin(sleep(window)));
                                    this.flush_pending = true;
                                }
                            }
                        }
                    } else if let Ok(trailers) = frame.into_trailers() {
                        this.pending_trailers = Some(this.remap_trailers(trailers));
                        this.source_done = true;
                    }
                }
                Poll::Ready(Some(Err(error))) => {
                    tracing::error!(%error, "error reading backend response body");
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.source_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.source_done && self.buffer.is_empty() && self.pending_trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        if self.buffer.is_empty() {
            self.source.size_hint()
        } else {
            let mut hint = self.source.size_hint();
            hint.set_lower(hint.lower() + self.buffer.len() as u64);
            if let Some(upper) = hint.upper() {
                hint.set_upper(upper + self.buffer.len() as u64);
            }
            hint
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use http_body_util::{BodyExt, StreamBody};
    use std::future::poll_fn;

    fn source_of(frames: Vec<Frame<Bytes>>) -> ProxyBody {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = frames.into_iter().map(Ok).collect();
        BodyExt::boxed_unsync(StreamBody::new(stream::iter(frames)))
    }

    async fn next_frame(body: &mut StreamedBody) -> Option<Result<Frame<Bytes>, BoxError>> {
        poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx)).await
    }

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_policy_immediate_for_event_stream() {
        let headers = headers_with(&[
            ("content-type", "text/event-stream; charset=utf-8"),
            ("content-length", "120"),
        ]);
        assert_eq!(FlushPolicy::for_response(&headers), FlushPolicy::Immediate);
    }

    #[test]
    fn test_policy_immediate_for_unknown_length() {
        let headers = headers_with(&[("content-type", "text/plain")]);
        assert_eq!(FlushPolicy::for_response(&headers), FlushPolicy::Immediate);
    }

    #[test]
    fn test_policy_deferred_for_fixed_length() {
        let headers = headers_with(&[
            ("content-type", "text/plain"),
            ("content-length", "120"),
        ]);
        assert_eq!(FlushPolicy::for_response(&headers), FlushPolicy::Deferred);
    }

    #[tokio::test]
    async fn test_immediate_forwards_each_chunk() {
        let source = source_of(vec![
            Frame::data(Bytes::from_static(b"first")),
            Frame::data(Bytes::from_static(b"second")),
        ]);
        let mut body = StreamedBody::new(source, FlushPolicy::Immediate, HashSet::new());

        let frame = next_frame(&mut body).await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "first");
        let frame = next_frame(&mut body).await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "second");
        assert!(next_frame(&mut body).await.is_none());
        assert!(body.is_end_stream());
    }

    #[tokio::test]
    async fn test_deferred_coalesces_until_end() {
        let source = source_of(vec![
            Frame::data(Bytes::from_static(b"hello ")),
            Frame::data(Bytes::from_static(b"world")),
        ]);
        let mut body = StreamedBody::new(source, FlushPolicy::Deferred, HashSet::new());

        let frame = next_frame(&mut body).await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "hello world");
        assert!(next_frame(&mut body).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_latency_flushes_on_timer() {
        // A source that yields one chunk and then stays pending, so only the
        // timer can release the buffered bytes.
        let frames: Vec<Result<Frame<Bytes>, BoxError>> =
            vec![Ok(Frame::data(Bytes::from_static(b"buffered")))];
        let source = BodyExt::boxed_unsync(StreamBody::new(
            stream::iter(frames).chain(stream::pending()),
        ));
        let mut body = StreamedBody::new(
            source,
            FlushPolicy::MaxLatency(Duration::from_millis(50)),
            HashSet::new(),
        );

        // Paused time auto-advances once the task is otherwise idle, firing
        // the latency timer.
        let frame = next_frame(&mut body).await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "buffered");
        assert!(!body.flush_pending);
    }

    #[tokio::test]
    async fn test_unannounced_trailers_are_prefixed() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-trailer", HeaderValue::from_static("announced_value"));
        trailers.insert("x-extra", HeaderValue::from_static("unannounced_value"));
        let source = source_of(vec![
            Frame::data(Bytes::from_static(b"payload")),
            Frame::trailers(trailers),
        ]);
        let response_headers = headers_with(&[("trailer", "X-Trailer")]);
        let mut body = StreamedBody::new(
            source,
            FlushPolicy::Immediate,
            announced_trailers(&response_headers),
        );

        let frame = next_frame(&mut body).await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "payload");
        let frame = next_frame(&mut body).await.unwrap().unwrap();
        let trailers = frame.into_trailers().unwrap();
        assert_eq!(trailers.get("x-trailer").unwrap(), "announced_value");
        assert_eq!(
            trailers.get("x-unannounced-trailer-x-extra").unwrap(),
            "unannounced_value"
        );
        assert!(!trailers.contains_key("x-extra"));
    }

    #[tokio::test]
    async fn test_source_error_propagates() {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err("backend reset".into()),
        ];
        let source = BodyExt::boxed_unsync(StreamBody::new(stream::iter(frames)));
        let mut body = StreamedBody::new(source, FlushPolicy::Immediate, HashSet::new());

        let frame = next_frame(&mut body).await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "partial");
        assert!(next_frame(&mut body).await.unwrap().is_err());
    }
}
