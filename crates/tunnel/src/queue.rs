//! The per-stream receive buffer: a single-producer/single-consumer FIFO of
//! byte chunks with close semantics. Each chunk is the payload of one DATA
//! frame; nothing is copied on the way through. The effective bound is the
//! flow-control window, which caps how much the peer may have in flight.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;

/// Error returned by [`ChunkQueue::push`] once the queue is closed.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed;

#[derive(Debug, Default)]
pub struct ChunkQueue {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    chunks: VecDeque<Bytes>,
    closed: bool,
    // The single consumer parked in poll_pop, if any.
    reader: Option<Waker>,
}

impl ChunkQueue {
    pub fn new() -> ChunkQueue {
        ChunkQueue::default()
    }

    /// Append a chunk, waking the parked consumer. Fails once closed.
    pub fn push(&self, chunk: Bytes) -> Result<(), Closed> {
        let waker = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(Closed);
            }
            inner.chunks.push_back(chunk);
            inner.reader.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Dequeue the next chunk. Buffered chunks drain even after close;
    /// `None` means closed-and-drained, which the stream surfaces as EOF.
    pub fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(chunk) = inner.chunks.pop_front() {
            return Poll::Ready(Some(chunk));
        }
        if inner.closed {
            return Poll::Ready(None);
        }
        inner.reader = Some(cx.waker().clone());
        Poll::Pending
    }

    pub async fn pop(&self) -> Option<Bytes> {
        std::future::poll_fn(|cx| self.poll_pop(cx)).await
    }

    /// Non-blocking dequeue: `Ok(None)` when nothing is buffered.
    pub fn try_pop(&self) -> Result<Option<Bytes>, Closed> {
        let mut inner = self.inner.lock().unwrap();
        match inner.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if inner.closed => Err(Closed),
            None => Ok(None),
        }
    }

    /// Close the queue, waking the parked consumer. Idempotent.
    pub fn close(&self) {
        let waker = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.reader.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = ChunkQueue::new();
        q.push(Bytes::from_static(b"one")).unwrap();
        q.push(Bytes::from_static(b"two")).unwrap();
        assert_eq!(q.pop().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(q.pop().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_close_drains_then_eof() {
        let q = ChunkQueue::new();
        q.push(Bytes::from_static(b"tail")).unwrap();
        q.close();
        q.close(); // idempotent

        assert_eq!(q.pop().await.unwrap(), Bytes::from_static(b"tail"));
        assert_eq!(q.pop().await, None);
        assert_eq!(q.push(Bytes::from_static(b"late")), Err(Closed));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer() {
        let q = std::sync::Arc::new(ChunkQueue::new());
        let popper = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert_eq!(popper.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_try_pop() {
        let q = ChunkQueue::new();
        assert_eq!(q.try_pop(), Ok(None));
        q.push(Bytes::from_static(b"x")).unwrap();
        assert_eq!(q.try_pop(), Ok(Some(Bytes::from_static(b"x"))));
        q.close();
        assert_eq!(q.try_pop(), Err(Closed));
    }
}
