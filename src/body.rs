//! Body adapters used on the forwarding path.
//!
//! [`ReplayBody`] streams the client's request body to a backend while
//! retaining a bounded copy, so a failed attempt can be retried against
//! another endpoint without buffering the whole body up front.
//! [`GuardedBody`] keeps a resource (a connection permit) alive until a
//! streamed response body has been fully relayed or dropped.
//! [`DeadlineBody`] ends a streamed response body with an error once the
//! exchange has run past its deadline.

use crate::error::BoxError;
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::debug;

/// Errors raised by [`ReplayBody`] itself.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// This copy fell behind after the retained chunks were discarded.
    #[error("request body exceeded the replay buffer")]
    Overflowed,
}

/// Raised by [`DeadlineBody`] when the body is still streaming at its deadline.
#[derive(Error, Debug)]
#[error("exchange did not complete within {limit:?}")]
pub struct DeadlineExceeded {
    pub limit: Duration,
}

#[derive(Debug)]
struct Shared<B> {
    source: B,
    chunks: Vec<Bytes>,
    pulled: usize,
    buffered_bytes: usize,
    max_buffered: usize,
    trailers: Option<HeaderMap>,
    done: bool,
    overflowed: bool,
    source_failed: bool,
}

impl<B> Shared<B> {
    fn retain(&mut self, data: &Bytes) {
        if self.overflowed {
            return;
        }
        self.buffered_bytes += data.len();
        if self.buffered_bytes > self.max_buffered {
            self.overflowed = true;
            self.chunks = Vec::new();
            debug!(
                max_bytes = self.max_buffered,
                "request body outgrew replay buffer, retries disabled"
            );
        } else {
            self.chunks.push(data.clone());
        }
    }
}

/// Request body that can be re-read from the start by later attempts.
///
/// All copies share one source. Whichever copy is furthest ahead pulls the
/// next chunk from the client; the others replay retained chunks. Once more
/// than `max_buffered` bytes have been pulled the retained chunks are
/// dropped and [`try_clone`](ReplayBody::try_clone) returns `None`.
#[derive(Debug)]
pub struct ReplayBody<B> {
    shared: Arc<Mutex<Shared<B>>>,
    pos: usize,
    trailers_sent: bool,
    size_hint: SizeHint,
}

impl<B> ReplayBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    pub fn new(source: B, max_buffered: usize) -> Self {
        let size_hint = source.size_hint();
        Self {
            shared: Arc::new(Mutex::new(Shared {
                source,
                chunks: Vec::new(),
                pulled: 0,
                buffered_bytes: 0,
                max_buffered,
                trailers: None,
                done: false,
                overflowed: false,
                source_failed: false,
            })),
            pos: 0,
            trailers_sent: false,
            size_hint,
        }
    }

    /// Returns a copy positioned at the start of the body.
    ///
    /// `None` once the body can no longer be replayed in full.
    pub fn try_clone(&self) -> Option<Self> {
        if !self.is_replayable() {
            return None;
        }
        Some(Self {
            shared: self.shared.clone(),
            pos: 0,
            trailers_sent: false,
            size_hint: self.size_hint.clone(),
        })
    }

    pub fn is_replayable(&self) -> bool {
        let shared = self.shared.lock();
        !shared.overflowed && !shared.source_failed
    }

    /// Whether reading from the client failed.
    pub fn source_failed(&self) -> bool {
        self.shared.lock().source_failed
    }
}

impl<B> Body for ReplayBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let mut guard = this.shared.lock();
        let shared = &mut *guard;

        if this.pos < shared.pulled {
            if shared.overflowed {
                return Poll::Ready(Some(Err(ReplayError::Overflowed.into())));
            }
            let chunk = shared.chunks[this.pos].clone();
            this.pos += 1;
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }

        if shared.done {
            if !this.trailers_sent {
                if let Some(trailers) = &shared.trailers {
                    this.trailers_sent = true;
                    return Poll::Ready(Some(Ok(Frame::trailers(trailers.clone()))));
                }
            }
            return Poll::Ready(None);
        }

        loop {
            match ready!(Pin::new(&mut shared.source).poll_frame(cx)) {
                None => {
                    shared.done = true;
                    return Poll::Ready(None);
                }
                Some(Err(e)) => {
                    shared.source_failed = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Some(Ok(frame)) => {
                    let frame = match frame.into_data() {
                        Ok(data) => {
                            shared.pulled += 1;
                            this.pos += 1;
                            shared.retain(&data);
                            return Poll::Ready(Some(Ok(Frame::data(data))));
                        }
                        Err(frame) => frame,
                    };
                    if let Ok(trailers) = frame.into_trailers() {
                        shared.trailers = Some(trailers.clone());
                        shared.done = true;
                        this.trailers_sent = true;
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        let shared = self.shared.lock();
        shared.done
            && self.pos >= shared.pulled
            && (shared.trailers.is_none() || self.trailers_sent)
    }

    fn size_hint(&self) -> SizeHint {
        self.size_hint.clone()
    }
}

/// Body wrapper that holds `G` until the body is dropped.
#[derive(Debug)]
pub struct GuardedBody<B, G> {
    inner: B,
    _guard: G,
}

impl<B, G> GuardedBody<B, G> {
    pub fn new(inner: B, guard: G) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<B, G> Body for GuardedBody<B, G>
where
    B: Body + Unpin,
    G: Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

type ExpiryHook = Box<dyn FnOnce() + Send + Sync>;

/// Body wrapper that fails the stream once `deadline` passes.
///
/// The optional hook runs at most once, when the deadline fires before the
/// inner body has finished. A body that ends in time never runs it.
pub struct DeadlineBody<B> {
    inner: B,
    sleep: Pin<Box<Sleep>>,
    limit: Duration,
    on_expired: Option<ExpiryHook>,
    expired: bool,
}

impl<B> DeadlineBody<B> {
    /// Wraps `inner`; `limit` is only used to describe the error.
    pub fn new(inner: B, deadline: Instant, limit: Duration) -> Self {
        Self {
            inner,
            sleep: Box::pin(sleep_until(deadline)),
            limit,
            on_expired: None,
            expired: false,
        }
    }

    pub fn on_expired<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.on_expired = Some(Box::new(hook));
        self
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                this.on_expired = None;
                return Poll::Ready(None);
            }
            Poll::Ready(Some(frame)) => return Poll::Ready(Some(frame.map_err(Into::into))),
            Poll::Pending => {}
        }

        ready!(this.sleep.as_mut().poll(cx));
        this.expired = true;
        if let Some(hook) = this.on_expired.take() {
            hook();
        }
        Poll::Ready(Some(Err(DeadlineExceeded { limit: this.limit }.into())))
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Yields its chunks one frame at a time, optionally failing at the end.
    struct Chunks {
        chunks: VecDeque<Bytes>,
        fail_at_end: bool,
    }

    impl Chunks {
        fn new(chunks: &[&'static str]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| Bytes::from_static(c.as_bytes())).collect(),
                fail_at_end: false,
            }
        }

        fn failing(chunks: &[&'static str]) -> Self {
            Self {
                fail_at_end: true,
                ..Self::new(chunks)
            }
        }
    }

    impl Body for Chunks {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, std::io::Error>>> {
            match self.chunks.pop_front() {
                Some(chunk) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
                None if self.fail_at_end => {
                    self.fail_at_end = false;
                    Poll::Ready(Some(Err(std::io::Error::other("client reset"))))
                }
                None => Poll::Ready(None),
            }
        }
    }

    async fn read_all<B>(body: B) -> Result<Bytes, BoxError>
    where
        B: Body<Data = Bytes, Error = BoxError>,
    {
        Ok(body.collect().await?.to_bytes())
    }

    #[tokio::test]
    async fn test_replay_after_full_read() {
        let original = ReplayBody::new(Chunks::new(&["hel", "lo ", "world"]), 1024);
        let first = original.try_clone().unwrap();
        assert_eq!(read_all(first).await.unwrap(), "hello world");

        let second = original.try_clone().unwrap();
        assert_eq!(read_all(second).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_replay_after_partial_read() {
        let original = ReplayBody::new(Chunks::new(&["a", "b", "c"]), 1024);

        let mut first = original.try_clone().unwrap();
        let frame = first.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "a");
        drop(first);

        let second = original.try_clone().unwrap();
        assert_eq!(read_all(second).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_overflow_disables_replay() {
        let original = ReplayBody::new(Chunks::new(&["0123", "4567", "89"]), 6);
        let first = original.try_clone().unwrap();

        // The copy that overflowed the buffer still streams the whole body.
        assert_eq!(read_all(first).await.unwrap(), "0123456789");
        assert!(!original.is_replayable());
        assert!(original.try_clone().is_none());
    }

    #[tokio::test]
    async fn test_lagging_copy_errors_after_overflow() {
        let original = ReplayBody::new(Chunks::new(&["0123", "4567"]), 4);
        let lagging = original.try_clone().unwrap();
        let leading = original.try_clone().unwrap();

        assert_eq!(read_all(leading).await.unwrap(), "01234567");
        assert!(read_all(lagging).await.is_err());
    }

    #[tokio::test]
    async fn test_source_failure_is_reported() {
        let original = ReplayBody::new(Chunks::failing(&["x"]), 1024);
        let first = original.try_clone().unwrap();

        assert!(read_all(first).await.is_err());
        assert!(original.source_failed());
        assert!(original.try_clone().is_none());
    }

    #[tokio::test]
    async fn test_replay_keeps_exact_size_hint() {
        let original = ReplayBody::new(Full::new(Bytes::from_static(b"12345")), 1024);
        assert_eq!(original.size_hint().exact(), Some(5));
        let copy = original.try_clone().unwrap();
        assert_eq!(copy.size_hint().exact(), Some(5));
        assert_eq!(read_all(copy).await.unwrap(), "12345");
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Never yields a frame.
    struct Stalled;

    impl Body for Stalled {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, std::io::Error>>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_deadline_fails_stalled_body() {
        let fired = Arc::new(AtomicBool::new(false));
        let limit = Duration::from_millis(20);
        let body = DeadlineBody::new(Stalled, Instant::now() + limit, limit).on_expired({
            let fired = fired.clone();
            move || fired.store(true, Ordering::SeqCst)
        });

        let err = tokio::time::timeout(Duration::from_secs(2), body.collect())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is::<DeadlineExceeded>());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_deadline_not_fired_for_finished_body() {
        let fired = Arc::new(AtomicBool::new(false));
        let limit = Duration::from_millis(20);
        let body = DeadlineBody::new(
            Full::new(Bytes::from_static(b"done")),
            Instant::now() + limit,
            limit,
        )
        .on_expired({
            let fired = fired.clone();
            move || fired.store(true, Ordering::SeqCst)
        });

        assert_eq!(body.collect().await.unwrap().to_bytes(), "done");
        tokio::time::sleep(limit * 2).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guarded_body_releases_on_drop() {
        let dropped = Arc::new(AtomicBool::new(false));
        let body = GuardedBody::new(
            Full::new(Bytes::from_static(b"data")),
            DropFlag(dropped.clone()),
        );

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, "data");
        assert!(dropped.load(Ordering::SeqCst));
    }
}
