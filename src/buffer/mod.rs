//! Per-worker byte buffers
//!
//! Every payload that travels through a chain is a [`Buffer`] drawn from the
//! owning worker's [`BufferPool`]. A buffer has exactly one owner at a time;
//! it is either forwarded to the next hop or handed back with
//! [`BufferPool::release`].

mod stream;

pub use stream::BufferStream;

use std::cell::{Cell, RefCell};

use bytes::BytesMut;
use tracing::trace;

use crate::worker::WorkerId;

/// Default payload capacity of a pooled buffer (16 KiB)
const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default bytes reserved in front of the payload for headers
const DEFAULT_HEADROOM: usize = 64;

/// Default number of idle buffers kept per worker
const DEFAULT_MAX_POOLED: usize = 1024;

/// Owned byte range with reserved headroom.
///
/// `data[..head]` is headroom, `data[head..]` is the payload.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    head: usize,
    origin: WorkerId,
}

impl Buffer {
    /// Payload length
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Worker whose pool this buffer came from
    pub fn origin(&self) -> WorkerId {
        self.origin
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Append bytes at the tail
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Raw access for readers that append into spare capacity
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Write `bytes` in front of the payload, using headroom when possible
    pub fn prepend(&mut self, bytes: &[u8]) {
        let n = bytes.len();
        if self.head >= n {
            self.head -= n;
            self.data[self.head..self.head + n].copy_from_slice(bytes);
            return;
        }

        let mut grown = BytesMut::with_capacity(DEFAULT_HEADROOM + n + self.len());
        grown.resize(DEFAULT_HEADROOM, 0);
        grown.extend_from_slice(bytes);
        grown.extend_from_slice(self.as_slice());
        self.data = grown;
        self.head = DEFAULT_HEADROOM;
    }

    /// Drop `n` bytes from the front of the payload
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len(), "advance past end of buffer");
        self.head += n;
    }

    /// Keep only the first `len` payload bytes
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(self.head + len);
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of freshly allocated buffers
    pub buffer_size: usize,
    /// Headroom reserved in front of each payload
    pub headroom: usize,
    /// Max idle buffers retained
    pub max_pooled: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            headroom: DEFAULT_HEADROOM,
            max_pooled: DEFAULT_MAX_POOLED,
        }
    }
}

/// Worker-confined buffer pool.
///
/// Not `Sync`: only the owning worker may touch it.
pub struct BufferPool {
    worker: WorkerId,
    config: PoolConfig,
    free: RefCell<Vec<BytesMut>>,
    in_use: Cell<usize>,
}

impl BufferPool {
    pub fn new(worker: WorkerId, config: PoolConfig) -> Self {
        Self {
            worker,
            config,
            free: RefCell::new(Vec::new()),
            in_use: Cell::new(0),
        }
    }

    /// Hand out an empty buffer able to hold at least `size` payload bytes
    pub fn acquire(&self, size: usize) -> Buffer {
        let wanted = self.config.headroom + size.max(self.config.buffer_size);
        let recycled = {
            let mut free = self.free.borrow_mut();
            match free.last() {
                Some(b) if b.capacity() >= wanted => free.pop(),
                _ => None,
            }
        };
        let mut data = recycled.unwrap_or_else(|| BytesMut::with_capacity(wanted));
        data.resize(self.config.headroom, 0);

        self.in_use.set(self.in_use.get() + 1);
        Buffer {
            data,
            head: self.config.headroom,
            origin: self.worker,
        }
    }

    /// Acquire a buffer holding a copy of `bytes`
    pub fn acquire_from(&self, bytes: &[u8]) -> Buffer {
        let mut buf = self.acquire(bytes.len());
        buf.extend_from_slice(bytes);
        buf
    }

    /// Return a buffer to the pool
    pub fn release(&self, buf: Buffer) {
        debug_assert_eq!(buf.origin, self.worker, "buffer released to a foreign pool");
        let in_use = self.in_use.get();
        debug_assert!(in_use > 0, "buffer released twice");
        self.in_use.set(in_use.saturating_sub(1));

        let mut data = buf.data;
        data.clear();
        let mut free = self.free.borrow_mut();
        if free.len() < self.config.max_pooled {
            free.push(data);
        } else {
            trace!("worker {} pool full, dropping buffer", self.worker);
        }
    }

    /// Buffers currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.get()
    }

    /// Idle buffers kept for reuse
    pub fn pooled(&self) -> usize {
        self.free.borrow().len()
    }
}
