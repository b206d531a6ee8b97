use tokio::sync::Mutex;

/// Size of one relay scratch buffer. Tunnels copy through these in both
/// directions, so 8KB keeps per-session memory bounded.
pub const BUFFER_SIZE: usize = 8_192;

const MAX_POOL_SIZE: usize = 64;

/// Pool of relay buffers shared by all tunnel sessions, backed by an
/// async-aware mutex
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a new, empty buffer pool
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Take a buffer from the pool or allocate a fresh one
    pub async fn acquire(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;

        if let Some(buffer) = pool.pop() {
            // Returned buffers are re-sized and zeroed in release()
            debug_assert_eq!(buffer.len(), BUFFER_SIZE);
            buffer
        } else {
            vec![0u8; BUFFER_SIZE]
        }
    }

    /// Return a buffer to the pool for reuse.
    ///
    /// Buffers whose capacity drifted away from [`BUFFER_SIZE`] are dropped
    /// instead of pooled to avoid memory bloat. Pooled buffers are zeroed so
    /// tunneled payload bytes never leak between sessions.
    pub async fn release(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < BUFFER_SIZE || buffer.capacity() > BUFFER_SIZE * 2 {
            return;
        }

        buffer.clear();
        buffer.resize(BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    /// Number of buffers currently available in the pool
    pub async fn available(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global buffer pool instance
static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

fn global_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// Take a relay buffer from the global pool
pub async fn acquire() -> Vec<u8> {
    global_pool().acquire().await
}

/// Return a relay buffer to the global pool
pub async fn release(buffer: Vec<u8>) {
    global_pool().release(buffer).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_returns_full_size_buffer() {
        let pool = BufferPool::new();
        let buf = pool.acquire().await;
        assert_eq!(buf.len(), BUFFER_SIZE);
    }

    #[tokio::test]
    async fn released_buffers_are_reused_and_zeroed() {
        let pool = BufferPool::new();

        let mut buf = pool.acquire().await;
        let capacity = buf.capacity();

        // Simulate relay usage: dirty the buffer and shrink it
        buf.fill(0xAA);
        buf.truncate(128);
        pool.release(buf).await;

        assert_eq!(pool.available().await, 1);

        let reused = pool.acquire().await;
        assert_eq!(reused.len(), BUFFER_SIZE);
        assert_eq!(reused.capacity(), capacity);
        assert!(reused.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn pool_size_is_capped() {
        let pool = BufferPool::new();

        let mut buffers = Vec::new();
        for _ in 0..MAX_POOL_SIZE + 10 {
            buffers.push(vec![0u8; BUFFER_SIZE]);
        }
        for buf in buffers {
            pool.release(buf).await;
        }

        assert_eq!(pool.available().await, MAX_POOL_SIZE);
    }

    #[tokio::test]
    async fn wrong_capacity_buffers_are_rejected() {
        let pool = BufferPool::new();

        pool.release(vec![0u8; 4_096]).await;
        pool.release(vec![0u8; BUFFER_SIZE * 4]).await;

        assert_eq!(pool.available().await, 0);
    }
}
