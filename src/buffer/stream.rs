//! Accumulating read stream for framed protocols

use bytes::BytesMut;

use super::{Buffer, BufferPool};

/// Collects payload bytes until a complete frame can be cut off the front.
#[derive(Debug, Default)]
pub struct BufferStream {
    data: BytesMut,
}

impl BufferStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer's payload and recycle the buffer
    pub fn push(&mut self, pool: &BufferPool, buf: Buffer) {
        self.data.extend_from_slice(buf.as_slice());
        pool.release(buf);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The first `n` buffered bytes, if that many are available
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        self.data.get(..n)
    }

    /// Cut `n` bytes off the front into a pool buffer
    pub fn read_exact(&mut self, pool: &BufferPool, n: usize) -> Option<Buffer> {
        if self.data.len() < n {
            return None;
        }
        let chunk = self.data.split_to(n);
        Some(pool.acquire_from(&chunk))
    }

    /// Discard everything buffered
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolConfig;

    #[test]
    fn test_reassembles_across_buffers() {
        let pool = BufferPool::new(0, PoolConfig::default());
        let mut stream = BufferStream::new();

        stream.push(&pool, pool.acquire_from(b"he"));
        assert!(stream.read_exact(&pool, 5).is_none());
        stream.push(&pool, pool.acquire_from(b"llo world"));
        assert_eq!(stream.len(), 11);
        assert_eq!(stream.peek(2), Some(&b"he"[..]));

        let frame = stream.read_exact(&pool, 5).unwrap();
        assert_eq!(frame.as_slice(), b"hello");
        assert_eq!(stream.len(), 6);
        pool.release(frame);

        stream.clear();
        assert!(stream.is_empty());
        assert_eq!(pool.in_use(), 0);
    }
}
