//! A fixed-size pool of response buffers.
//!
//! Variable-length responses (read-by-type) are assembled in a pooled
//! buffer sized to the negotiated MTU. The buffer is returned to the pool
//! when the [`ResponseBuffer`] is dropped, so release happens exactly once
//! on every path, including early error returns.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::ATT_MTU;

pub(crate) trait PoolRelease {
    fn release_slot(&self, idx: usize);
}

struct State<const N: usize> {
    free: [bool; N],
    available: usize,
}

/// Pool of `N` response buffers, each `ATT_MTU` bytes.
pub struct BufferPool<M: RawMutex, const N: usize> {
    state: Mutex<M, RefCell<State<N>>>,
}

impl<M: RawMutex, const N: usize> Default for BufferPool<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const N: usize> BufferPool<M, N> {
    /// Create a pool with all buffers free.
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                free: [true; N],
                available: N,
            })),
        }
    }

    /// Take a buffer able to hold `len` bytes, or `None` when the pool is
    /// exhausted or `len` exceeds the buffer size.
    pub fn alloc(&self, len: usize) -> Option<ResponseBuffer<'_>> {
        if len > ATT_MTU {
            return None;
        }
        let slot = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let idx = state.free.iter().position(|free| *free)?;
            state.free[idx] = false;
            state.available -= 1;
            Some(idx)
        })?;
        Some(ResponseBuffer {
            data: [0; ATT_MTU],
            len,
            slot,
            pool: self,
        })
    }

    /// Number of free buffers.
    pub fn available(&self) -> usize {
        self.state.lock(|state| state.borrow().available)
    }
}

impl<M: RawMutex, const N: usize> PoolRelease for BufferPool<M, N> {
    fn release_slot(&self, idx: usize) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            assert!(!state.free[idx]);
            state.free[idx] = true;
            state.available += 1;
        });
    }
}

/// A buffer leased from a [`BufferPool`], released on drop.
pub struct ResponseBuffer<'a> {
    data: [u8; ATT_MTU],
    len: usize,
    slot: usize,
    pool: &'a dyn PoolRelease,
}

impl<'a> ResponseBuffer<'a> {
    /// Requested capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Payload written so far.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Mutable view of the full requested capacity.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Shrink the payload to the bytes actually used.
    pub fn truncate(&mut self, used: usize) {
        if used < self.len {
            self.len = used;
        }
    }
}

impl<'a> Drop for ResponseBuffer<'a> {
    fn drop(&mut self) {
        self.pool.release_slot(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;

    #[test]
    fn pool_exhaustion_and_release() {
        let pool: BufferPool<NoopRawMutex, 2> = BufferPool::new();
        assert_eq!(pool.available(), 2);

        let a = pool.alloc(16).unwrap();
        let b = pool.alloc(16).unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc(16).is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.alloc(16).unwrap();
        assert!(pool.alloc(16).is_none());
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn oversized_request_is_refused() {
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        assert!(pool.alloc(ATT_MTU + 1).is_none());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn truncate_shrinks_payload() {
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut buf = pool.alloc(8).unwrap();
        buf.payload_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.truncate(3);
        assert_eq!(buf.payload(), &[1, 2, 3]);
    }
}
