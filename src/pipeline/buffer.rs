//! Bounded circular byte arena
//!
//! A contiguous byte region handed out as first-fit contiguous allocations.
//! Allocation blocks until a large enough span is free, which is what gives
//! the pipeline its per-stage memory caps. Frees may arrive in any order but
//! space is only reclaimed at the tail of the live region, so throughput
//! relies on the stages' roughly-FIFO usage.
//!
//! Sizes are rounded up to 8 bytes internally and the backing store is
//! 8-aligned, so allocations can be cast to Pod types like `Splat`.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

const ALIGN: usize = 8;

struct State {
    /// Start of the oldest live allocation
    head: usize,
    /// Next placement position
    tail: usize,
    /// Bytes currently allocated
    used: usize,
    /// Wrap marker: bytes `[wrap, capacity)` are skipped by the live region
    wrap: Option<usize>,
    /// Frees that have not yet reached the head, by offset
    pending: HashMap<usize, usize>,
}

struct Shared {
    name: &'static str,
    data: Box<[UnsafeCell<u64>]>,
    capacity: usize,
    state: Mutex<State>,
    freed: Condvar,
}

// Allocations hand out disjoint ranges of `data`; the metadata lock serialises
// placement and reclamation.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn release(&self, offset: usize, len: usize) {
        let mut state = self.state.lock().unwrap();
        state.pending.insert(offset, len);
        state.used -= len;
        loop {
            if let Some(w) = state.wrap {
                if state.head == w {
                    state.head = 0;
                    state.wrap = None;
                    continue;
                }
            }
            let head = state.head;
            match state.pending.remove(&head) {
                Some(freed) => state.head += freed,
                None => break,
            }
        }
        if state.used == 0 {
            debug_assert!(state.pending.is_empty());
            state.head = 0;
            state.tail = 0;
            state.wrap = None;
        }
        self.freed.notify_all();
    }

    fn try_place(&self, state: &mut State, len: usize) -> Option<usize> {
        match state.wrap {
            None => {
                if self.capacity - state.tail >= len {
                    let offset = state.tail;
                    state.tail += len;
                    Some(offset)
                } else if state.head >= len && state.tail > 0 {
                    state.wrap = Some(state.tail);
                    state.tail = len;
                    Some(0)
                } else {
                    None
                }
            }
            Some(_) => {
                if state.head - state.tail >= len {
                    let offset = state.tail;
                    state.tail += len;
                    Some(offset)
                } else {
                    None
                }
            }
        }
    }
}

/// The arena. Cheap to clone handles are not provided; share via `Arc`.
pub struct CircularBuffer {
    shared: Arc<Shared>,
}

impl CircularBuffer {
    /// Create an arena of (at least) `capacity` bytes.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity >= ALIGN);
        let words = capacity.div_ceil(ALIGN);
        let mut data = Vec::with_capacity(words);
        data.resize_with(words, || UnsafeCell::new(0));
        Self {
            shared: Arc::new(Shared {
                name,
                capacity: words * ALIGN,
                data: data.into_boxed_slice(),
                state: Mutex::new(State {
                    head: 0,
                    tail: 0,
                    used: 0,
                    wrap: None,
                    pending: HashMap::new(),
                }),
                freed: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.shared.state.lock().unwrap().used
    }

    /// Allocate `len` contiguous bytes, blocking until space frees up.
    ///
    /// Panics if `len` is zero or exceeds the capacity (a programmer error:
    /// such a request could never be satisfied).
    pub fn allocate(&self, len: usize) -> Allocation {
        let rounded = len.div_ceil(ALIGN) * ALIGN;
        assert!(
            len > 0 && rounded <= self.shared.capacity,
            "allocation of {} bytes cannot fit arena '{}'",
            len,
            self.shared.name
        );
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(offset) = self.shared.try_place(&mut state, rounded) {
                state.used += rounded;
                return Allocation {
                    shared: self.shared.clone(),
                    offset,
                    rounded,
                    len,
                };
            }
            state = self.shared.freed.wait(state).unwrap();
        }
    }
}

/// An owned range of the arena; freed on drop.
pub struct Allocation {
    shared: Arc<Shared>,
    offset: usize,
    rounded: usize,
    len: usize,
}

impl Allocation {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn ptr(&self) -> *mut u8 {
        self.shared.data.as_ptr() as *mut u8
    }

    pub fn as_slice(&self) -> &[u8] {
        // Disjointness of live allocations makes the aliasing sound; `&self`
        // guards against writers of this allocation.
        unsafe { std::slice::from_raw_parts(self.ptr().add(self.offset), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr().add(self.offset), self.len) }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.shared.release(self.offset, self.rounded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_allocate_and_reuse() {
        let buf = CircularBuffer::new("test", 64);
        let a = buf.allocate(24);
        let b = buf.allocate(24);
        assert_eq!(buf.used(), 48);
        drop(a);
        let c = buf.allocate(16);
        drop(b);
        drop(c);
        assert_eq!(buf.used(), 0);
    }

    #[test]
    fn test_rounding_keeps_alignment() {
        let buf = CircularBuffer::new("test", 64);
        let a = buf.allocate(3);
        let b = buf.allocate(5);
        assert_eq!(a.len(), 3);
        assert_eq!(b.as_slice().as_ptr() as usize % ALIGN, 0);
        assert_eq!(buf.used(), 16);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let buf = CircularBuffer::new("test", 64);
        let mut a = buf.allocate(16);
        a.as_mut_slice().copy_from_slice(&[7u8; 16]);
        assert_eq!(a.as_slice(), &[7u8; 16]);
    }

    #[test]
    fn test_out_of_order_frees_coalesce_at_head() {
        let buf = CircularBuffer::new("test", 64);
        let a = buf.allocate(16);
        let b = buf.allocate(16);
        let c = buf.allocate(16);
        drop(b); // freed out of order; not reclaimable yet
        assert_eq!(buf.used(), 32);
        // No contiguous 32-byte span exists until `a` frees the head
        drop(a);
        let d = buf.allocate(32);
        drop(c);
        drop(d);
        assert_eq!(buf.used(), 0);
    }

    #[test]
    fn test_wraparound() {
        let buf = CircularBuffer::new("test", 64);
        let a = buf.allocate(24);
        let b = buf.allocate(24);
        drop(a);
        // Only 16 bytes remain at the end; this placement must wrap to 0
        let c = buf.allocate(24);
        drop(b);
        drop(c);
        let _all = buf.allocate(64);
    }

    #[test]
    fn test_allocation_blocks_until_free() {
        let buf = Arc::new(CircularBuffer::new("test", 64));
        let a = buf.allocate(48);
        let buf2 = buf.clone();
        let handle = std::thread::spawn(move || {
            let _b = buf2.allocate(32); // blocks until `a` is dropped
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(a);
        handle.join().unwrap();
    }

    #[test]
    #[should_panic]
    fn test_oversize_allocation_panics() {
        let buf = CircularBuffer::new("test", 64);
        let _ = buf.allocate(65);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        let buf = Arc::new(CircularBuffer::new("test", 256));
        let mut handles = Vec::new();
        for t in 0..4 {
            let buf = buf.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let mut alloc = buf.allocate(8 + (i % 5) * 8);
                    let fill = (t * 50 + i) as u8;
                    for byte in alloc.as_mut_slice() {
                        *byte = fill;
                    }
                    assert!(alloc.as_slice().iter().all(|&b| b == fill));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.used(), 0);
    }
}
