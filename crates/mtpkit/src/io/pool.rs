//! A bounded pool of fixed-size scratch buffers.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::Notify;

struct PoolShared {
    free: Mutex<Vec<BytesMut>>,
    available: Notify,
    buffer_size: usize,
}

/// Pre-allocated byte buffers handed out to at most `pool_depth` holders at
/// a time; `acquire` suspends until a buffer is returned.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, pool_depth: usize) -> Self {
        let free = (0..pool_depth).map(|_| BytesMut::zeroed(buffer_size)).collect();
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                available: Notify::new(),
                buffer_size,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Takes a buffer, waiting for one to be released if the pool is empty.
    /// The buffer returns to the pool when the guard drops.
    pub async fn acquire(&self) -> PooledBuffer {
        loop {
            if let Some(mut buf) = self.shared.free.lock().expect("pool lock").pop() {
                buf.resize(self.shared.buffer_size, 0);
                return PooledBuffer { buf: Some(buf), shared: Arc::clone(&self.shared) };
            }
            self.shared.available.notified().await;
        }
    }
}

/// RAII guard over one pooled buffer.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    shared: Arc<PoolShared>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer present until drop")
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.shared.free.lock().expect("pool lock").push(buf);
            self.shared.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = BufferPool::new(1024, 2);
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        assert_eq!(a.as_slice().len(), 1024);
        assert_eq!(b.as_slice().len(), 1024);
        drop(a);
        let c = pool.acquire().await;
        assert_eq!(c.as_slice().len(), 1024);
    }

    #[tokio::test]
    async fn test_acquire_suspends_until_release() {
        let pool = BufferPool::new(64, 1);
        let held = pool.acquire().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let _buf = pool2.acquire().await;
        });

        // The waiter cannot finish while the only buffer is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_buffers_are_reused_not_grown() {
        let pool = BufferPool::new(16, 1);
        {
            let mut buf = pool.acquire().await;
            buf.as_mut_slice().fill(0xAB);
        }
        let buf = pool.acquire().await;
        assert_eq!(buf.as_slice().len(), 16);
    }
}
