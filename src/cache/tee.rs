//! Body stream tee that commits a full copy of the body once it is complete.
//!
//! The wrapped stream is handed to the client untouched.  Every chunk is also
//! appended to an in-memory buffer, and the completion callback receives the
//! whole body as soon as it is known to be complete: when the buffer reaches
//! the declared `Content-Length`, or, for bodies without one, when the inner
//! stream reports its end (`Poll::Ready(None)`).  A fixed-length HTTP/1.1
//! server stops polling once it has written the declared length, so the end
//! signal alone cannot be relied on.
//!
//! A body error, a short body or an early drop never reaches the callback, so a
//! truncated download can never be cached.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tracing::debug;

/// One-shot handler invoked with the complete body.
pub type OnComplete = Box<dyn FnOnce(Bytes) + Send + 'static>;

pub struct CachingBodyTee<S> {
    inner: S,
    buf: BytesMut,
    /// Length announced by the response head, if any.
    declared_len: Option<u64>,
    on_complete: Option<OnComplete>,
}

impl<S> CachingBodyTee<S> {
    /// A body declared empty is complete before the first poll and is
    /// committed right away.
    pub fn new(inner: S, declared_len: Option<u64>, on_complete: OnComplete) -> Self {
        let mut tee = Self {
            inner,
            buf: BytesMut::new(),
            declared_len,
            on_complete: Some(on_complete),
        };
        if declared_len == Some(0) {
            tee.commit();
        }
        tee
    }

    fn commit(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(std::mem::take(&mut self.buf).freeze());
        }
    }

    fn disarm(&mut self) {
        self.on_complete = None;
        self.buf = BytesMut::new();
    }

    /// Bytes captured so far.
    pub fn captured(&self) -> usize {
        self.buf.len()
    }
}

impl<S> Drop for CachingBodyTee<S> {
    fn drop(&mut self) {
        if self.on_complete.is_some() {
            debug!(
                captured = self.captured(),
                "response body abandoned before completion, not cached"
            );
        }
    }
}

impl<S, E> Stream for CachingBodyTee<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                if this.on_complete.is_some() {
                    this.buf.extend_from_slice(&chunk);
                    if let Some(declared) = this.declared_len {
                        let captured = this.buf.len() as u64;
                        if captured == declared {
                            this.commit();
                        } else if captured > declared {
                            debug!(
                                captured,
                                declared, "response body exceeds declared length, not cached"
                            );
                            this.disarm();
                        }
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => {
                // Whatever follows, this body is incomplete.
                this.disarm();
                Poll::Ready(Some(Err(err)))
            }
            None => {
                match this.declared_len {
                    Some(declared) if this.on_complete.is_some() => {
                        debug!(
                            captured = this.buf.len(),
                            declared,
                            "response body shorter than declared length, not cached"
                        );
                        this.disarm();
                    }
                    _ => this.commit(),
                }
                Poll::Ready(None)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use futures::StreamExt;
    use futures::stream;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<Bytes>>>, OnComplete) {
        let commits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&commits);
        let on_complete: OnComplete = Box::new(move |body| sink.lock().unwrap().push(body));
        (commits, on_complete)
    }

    fn chunked(body: &[u8], sizes: &[usize]) -> Vec<Result<Bytes, io::Error>> {
        let mut chunks = Vec::new();
        let mut rest = body;
        for size in sizes.iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let take = (*size).min(rest.len());
            chunks.push(Ok(Bytes::copy_from_slice(&rest[..take])));
            rest = &rest[take..];
        }
        chunks
    }

    #[tokio::test]
    async fn commits_once_with_every_byte_for_any_chunking() {
        let body: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        for sizes in [
            &[1usize][..],
            &[7, 3, 1024][..],
            &[4096][..],
            &[10_000][..],
            &[9_999, 1][..],
        ] {
            let (commits, on_complete) = recorder();
            let tee = CachingBodyTee::new(stream::iter(chunked(&body, sizes)), None, on_complete);

            let received: Vec<Bytes> = tee.map(|c| c.unwrap()).collect().await;

            assert_eq!(received.concat(), body);
            let commits = commits.lock().unwrap();
            assert_eq!(commits.len(), 1, "chunk sizes {sizes:?}");
            assert_eq!(commits[0].as_ref(), body.as_slice());
        }
    }

    #[tokio::test]
    async fn commit_waits_for_end_of_stream_signal() {
        let (commits, on_complete) = recorder();
        let mut tee = CachingBodyTee::new(
            stream::iter(chunked(b"abcdef", &[3])),
            None,
            on_complete,
        );

        assert_eq!(tee.next().await.unwrap().unwrap(), "abc");
        assert_eq!(tee.next().await.unwrap().unwrap(), "def");
        assert_eq!(tee.captured(), 6);
        assert!(commits.lock().unwrap().is_empty());

        assert!(tee.next().await.is_none());
        assert_eq!(commits.lock().unwrap().len(), 1);

        // Polling past the end never commits twice.
        assert!(tee.next().await.is_none());
        assert_eq!(commits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_body_commits_empty_bytes() {
        let (commits, on_complete) = recorder();
        let empty = stream::iter(Vec::<Result<Bytes, io::Error>>::new());
        let tee = CachingBodyTee::new(empty, None, on_complete);
        assert_eq!(tee.count().await, 0);
        let commits = commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].is_empty());
    }

    #[tokio::test]
    async fn read_error_never_commits() {
        let (commits, on_complete) = recorder();
        let items: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"tail")),
        ];
        let mut tee = CachingBodyTee::new(stream::iter(items), Some(11), on_complete);

        assert!(tee.next().await.unwrap().is_ok());
        assert!(tee.next().await.unwrap().is_err());
        assert_eq!(tee.captured(), 0);
        while tee.next().await.is_some() {}

        assert!(commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_before_end_never_commits() {
        let (commits, on_complete) = recorder();
        let mut tee = CachingBodyTee::new(
            stream::iter(chunked(b"0123456789", &[2])),
            Some(10),
            on_complete,
        );
        tee.next().await;
        tee.next().await;
        drop(tee);

        assert!(commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn declared_length_commits_without_end_of_stream_poll() {
        let (commits, on_complete) = recorder();
        let mut tee = CachingBodyTee::new(
            stream::iter(chunked(b"hello world", &[6])),
            Some(11),
            on_complete,
        );

        assert_eq!(tee.next().await.unwrap().unwrap(), "hello ");
        assert!(commits.lock().unwrap().is_empty());
        assert_eq!(tee.next().await.unwrap().unwrap(), "world");

        // A fixed-length writer stops here and drops the body.
        drop(tee);
        let commits = commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0], "hello world");
    }

    #[tokio::test]
    async fn short_body_never_commits() {
        let (commits, on_complete) = recorder();
        let tee = CachingBodyTee::new(
            stream::iter(chunked(b"hello", &[2])),
            Some(11),
            on_complete,
        );
        assert_eq!(tee.count().await, 3);
        assert!(commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn body_longer_than_declared_never_commits() {
        let (commits, on_complete) = recorder();
        let tee = CachingBodyTee::new(stream::iter(chunked(b"abcdef", &[6])), Some(4), on_complete);
        assert_eq!(tee.count().await, 1);
        assert!(commits.lock().unwrap().is_empty());
    }

    #[test]
    fn declared_empty_body_commits_immediately() {
        let (commits, on_complete) = recorder();
        let _tee = CachingBodyTee::new(
            stream::iter(Vec::<Result<Bytes, io::Error>>::new()),
            Some(0),
            on_complete,
        );
        let commits = commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].is_empty());
    }
}
