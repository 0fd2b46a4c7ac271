//! Reassembly buffer allocation.
//!
//! The reassembler rents one buffer per segmented transfer and hands it to the completed
//! [`IsoTpDatagram`](crate::IsoTpDatagram). The buffer goes back to its allocator when the
//! datagram (or an aborted transfer) is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Source of reassembly buffers.
pub trait BufferAllocator: Send + Sync + core::fmt::Debug {
    /// Hand out a zero-filled buffer of exactly `len` bytes.
    fn rent(&self, len: usize) -> Vec<u8>;

    /// Take a buffer back.
    fn release(&self, buf: Vec<u8>);

    /// True when released buffers are recycled.
    fn is_pooled(&self) -> bool;

    /// Buffers rented and not yet released.
    fn outstanding(&self) -> usize;
}

/// Plain heap allocation; released buffers are freed.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    outstanding: AtomicUsize,
}

impl HeapAllocator {
    /// New allocator with no outstanding buffers.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferAllocator for HeapAllocator {
    fn rent(&self, len: usize) -> Vec<u8> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        vec![0u8; len]
    }

    fn release(&self, _buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_pooled(&self) -> bool {
        false
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Recycling allocator keeping up to `max_idle` released buffers.
#[derive(Debug)]
pub struct PooledAllocator {
    idle: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
    outstanding: AtomicUsize,
}

impl PooledAllocator {
    /// Pool retaining at most `max_idle` buffers between transfers.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Buffers currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl BufferAllocator for PooledAllocator {
    fn rent(&self, len: usize) -> Vec<u8> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let recycled = {
            let mut idle = self.idle.lock();
            idle.iter()
                .position(|b| b.capacity() >= len)
                .map(|idx| idle.swap_remove(idx))
        };
        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0u8; len],
        }
    }

    fn release(&self, buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    fn is_pooled(&self) -> bool {
        true
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// A buffer on loan from a [`BufferAllocator`]; returned on drop.
#[derive(Debug)]
pub struct RentedBuffer {
    buf: Vec<u8>,
    allocator: Arc<dyn BufferAllocator>,
}

impl RentedBuffer {
    /// Rent `len` bytes from `allocator`.
    pub fn rent(allocator: &Arc<dyn BufferAllocator>, len: usize) -> Self {
        Self {
            buf: allocator.rent(len),
            allocator: allocator.clone(),
        }
    }

    /// Buffer length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whole buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Whole buffer, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for RentedBuffer {
    fn drop(&mut self) {
        self.allocator.release(core::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocator_counts_rentals() {
        let alloc: Arc<dyn BufferAllocator> = Arc::new(HeapAllocator::new());
        let a = RentedBuffer::rent(&alloc, 16);
        let b = RentedBuffer::rent(&alloc, 4);
        assert_eq!(alloc.outstanding(), 2);
        assert_eq!(a.len(), 16);
        drop(a);
        drop(b);
        assert_eq!(alloc.outstanding(), 0);
        assert!(!alloc.is_pooled());
    }

    #[test]
    fn pooled_allocator_recycles_zeroed_buffers() {
        let pool = Arc::new(PooledAllocator::new(2));
        let alloc: Arc<dyn BufferAllocator> = pool.clone();
        let mut buf = RentedBuffer::rent(&alloc, 32);
        buf.as_mut_slice().fill(0xFF);
        drop(buf);
        assert_eq!(pool.idle(), 1);

        let again = RentedBuffer::rent(&alloc, 8);
        assert_eq!(again.as_slice(), &[0u8; 8]);
        assert_eq!(pool.idle(), 0);
        assert_eq!(alloc.outstanding(), 1);
    }
}
