//! Bounded capture of a request body for one redirect replay
//!
//! The body streams through untouched while up to `max_buffer_size` bytes are
//! captured on the side. If the body exceeds the window the capture is
//! discarded, and replay degrades to an empty body.

use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;

struct ReplayState {
    buffer: Vec<u8>,
    fully_consumed: bool,
}

/// Handle to the captured prefix of a wrapped body.
#[derive(Clone)]
pub struct ReplayBuffer {
    max_buffer_size: usize,
    state: Arc<Mutex<ReplayState>>,
}

impl ReplayBuffer {
    /// Wrap `body`, capturing up to `max_buffer_size` bytes as they stream.
    pub fn capture(body: Body, max_buffer_size: usize) -> (Body, ReplayBuffer) {
        let handle = ReplayBuffer {
            max_buffer_size,
            state: Arc::new(Mutex::new(ReplayState {
                buffer: Vec::new(),
                fully_consumed: true,
            })),
        };

        let state = handle.state.clone();
        let max = max_buffer_size;
        let stream = body.into_data_stream().map(move |item| {
            if let Ok(chunk) = &item {
                let mut st = state.lock();
                if st.fully_consumed && !chunk.is_empty() {
                    if st.buffer.len() + chunk.len() <= max {
                        st.buffer.extend_from_slice(chunk);
                    } else {
                        st.fully_consumed = false;
                        st.buffer = Vec::new();
                    }
                }
            }
            item
        });

        (Body::from_stream(stream), handle)
    }

    /// Body replaying the captured bytes, with `true` iff the full original
    /// body fit in the window. Otherwise the body is empty.
    pub fn next_body(&self) -> (Body, bool) {
        let st = self.state.lock();
        if st.fully_consumed {
            (Body::from(Bytes::from(st.buffer.clone())), true)
        } else {
            (Body::empty(), false)
        }
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn drain(body: Body) -> Vec<u8> {
        body.collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_small_body_replays() {
        let (body, replay) = ReplayBuffer::capture(Body::from("hello world"), 8192);
        assert_eq!(drain(body).await, b"hello world");

        let (replayed, ok) = replay.next_body();
        assert!(ok);
        assert_eq!(drain(replayed).await, b"hello world");

        // replay is repeatable
        let (replayed, ok) = replay.next_body();
        assert!(ok);
        assert_eq!(drain(replayed).await, b"hello world");
    }

    #[tokio::test]
    async fn test_oversized_body_degrades() {
        let payload = vec![b'x'; 100];
        let (body, replay) = ReplayBuffer::capture(Body::from(payload.clone()), 16);
        assert_eq!(drain(body).await, payload);

        let (replayed, ok) = replay.next_body();
        assert!(!ok);
        assert_eq!(drain(replayed).await, b"");
    }

    #[tokio::test]
    async fn test_boundary_exact_fit() {
        let payload = vec![b'y'; 16];
        let (body, replay) = ReplayBuffer::capture(Body::from(payload.clone()), 16);
        assert_eq!(drain(body).await, payload);

        let (replayed, ok) = replay.next_body();
        assert!(ok);
        assert_eq!(drain(replayed).await, payload);
    }

    #[tokio::test]
    async fn test_unconsumed_body_replays_prefix_read_so_far() {
        // nothing read yet: the capture is empty but still "fully consumed"
        let (_body, replay) = ReplayBuffer::capture(Body::from("never read"), 8192);
        let (replayed, ok) = replay.next_body();
        assert!(ok);
        assert_eq!(drain(replayed).await, b"");
    }
}
