//! Finite, non-restartable sequence of interpretation fragments.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};

use crate::error::InterpretError;

pub type FragmentResult = Result<String, InterpretError>;

/// Incremental text from one interpretation call.
///
/// Once the inner stream ends or `close` is called the sequence stays
/// finished; the underlying source (usually an HTTP response body) is dropped
/// at that point, which releases its connection.
pub struct FragmentStream {
    inner: Option<BoxStream<'static, FragmentResult>>,
}

impl FragmentStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = FragmentResult> + Send + 'static,
    {
        Self {
            inner: Some(stream.boxed()),
        }
    }

    /// A stream that yields the given fragments and ends.
    pub fn from_fragments<I, T>(fragments: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let items: Vec<FragmentResult> = fragments.into_iter().map(|f| Ok(f.into())).collect();
        Self::new(stream::iter(items))
    }

    /// Release the source. Later polls yield `None`.
    pub fn close(&mut self) {
        self.inner = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl Stream for FragmentStream {
    type Item = FragmentResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        let poll = inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = poll {
            self.inner = None;
        }
        poll
    }
}

impl std::fmt::Debug for FragmentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStream")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_yields_in_order_then_stays_finished() {
        let mut stream = FragmentStream::from_fragments(["a", "b"]);
        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        assert_eq!(stream.next().await, Some(Ok("b".to_string())));
        assert_eq!(stream.next().await, None);
        assert!(stream.is_closed());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let mut stream = FragmentStream::from_fragments(["a", "b", "c"]);
        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        stream.close();
        assert!(stream.is_closed());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_error_items_pass_through() {
        let items = vec![
            Ok("a".to_string()),
            Err(InterpretError::Stream("reset".to_string())),
        ];
        let mut stream = FragmentStream::new(stream::iter(items));
        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(
            stream.next().await,
            Some(Err(InterpretError::Stream("reset".to_string())))
        );
    }
}
