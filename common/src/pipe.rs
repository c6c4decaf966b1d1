//! Bounded streaming pipe between a reader task and a writer loop.
//!
//! Segments are pooled `BytesMut` buffers rented from a process-wide pool, so
//! steady-state copying performs no per-segment allocation. The channel bound
//! is the backpressure: a producer that outruns the consumer parks on `send`,
//! a consumer that outruns the producer parks on `recv`.

use crate::errors::CopyError;

/// Size of one pipe segment.
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Number of segments a single transfer may hold in flight; bounds the
/// memory footprint of one transfer to `PIPE_SEGMENTS * SEGMENT_SIZE`.
pub const PIPE_SEGMENTS: usize = 4;

/// Maximum buffers kept for reuse across all transfers.
const POOL_LIMIT: usize = 64;

lazy_static::lazy_static! {
    static ref BUFFER_POOL: BufferPool = BufferPool::new();
}

pub struct BufferPool {
    buffers: std::sync::Mutex<Vec<bytes::BytesMut>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            buffers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn rent(&self) -> bytes::BytesMut {
        if let Some(buffer) = self.buffers.lock().unwrap().pop() {
            return buffer;
        }
        bytes::BytesMut::with_capacity(SEGMENT_SIZE)
    }

    pub fn give_back(&self, mut buffer: bytes::BytesMut) {
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < POOL_LIMIT {
            buffers.push(buffer);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// The process-wide segment pool.
pub fn pool() -> &'static BufferPool {
    &BUFFER_POOL
}

pub type Segment = Result<bytes::BytesMut, CopyError>;

/// Create the bounded pipe for one transfer.
pub fn bounded() -> (
    tokio::sync::mpsc::Sender<Segment>,
    tokio::sync::mpsc::Receiver<Segment>,
) {
    tokio::sync::mpsc::channel(PIPE_SEGMENTS)
}

/// Spawn the producer half: read `source` into pooled segments until EOF or
/// error, pushing each into the pipe. The task ends when the source is
/// drained, the consumer hangs up, or cancellation fires.
pub fn spawn_producer<R>(
    mut source: R,
    tx: tokio::sync::mpsc::Sender<Segment>,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;

    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                let _ = tx.send(Err(CopyError::Cancelled)).await;
                return;
            }
            let mut buffer = pool().rent();
            match source.read_buf(&mut buffer).await {
                Ok(0) => {
                    pool().give_back(buffer);
                    return;
                }
                Ok(_) => {
                    if let Err(unsent) = tx.send(Ok(buffer)).await {
                        // consumer hung up; reclaim the segment and stop
                        if let Ok(buffer) = unsent.0 {
                            pool().give_back(buffer);
                        }
                        return;
                    }
                }
                Err(error) => {
                    pool().give_back(buffer);
                    let _ = tx.send(Err(CopyError::Io(error))).await;
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rent_and_return_reuses_buffers() {
        // a private pool: the global one is shared with concurrent tests
        let pool = BufferPool::new();
        let rented = pool.rent();
        assert_eq!(rented.capacity(), SEGMENT_SIZE);
        pool.give_back(rented);
        assert_eq!(pool.pooled(), 1);
        let again = pool.rent();
        assert_eq!(again.capacity(), SEGMENT_SIZE);
        assert_eq!(pool.pooled(), 0);
        pool.give_back(again);
    }

    #[test(tokio::test)]
    async fn producer_streams_source_in_order() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (tx, mut rx) = bounded();
        let cancel = tokio_util::sync::CancellationToken::new();
        spawn_producer(std::io::Cursor::new(payload.clone()), tx, cancel);
        let mut received = Vec::new();
        while let Some(segment) = rx.recv().await {
            let buffer = segment.unwrap();
            received.extend_from_slice(&buffer);
            pool().give_back(buffer);
        }
        assert_eq!(received, payload);
    }

    #[test(tokio::test)]
    async fn cancelled_producer_reports_cancellation() {
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = bounded();
        spawn_producer(std::io::Cursor::new(vec![0u8; 1024]), tx, cancel);
        match rx.recv().await {
            Some(Err(CopyError::Cancelled)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
