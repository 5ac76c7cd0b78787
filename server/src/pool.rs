//! Reusable datagram buffers.
//!
//! Each worker thread keeps its own free list so the common acquire/release
//! path never takes a lock. When a thread's list grows past its limit, a
//! batch is moved to the shared list; a thread that runs dry takes a batch
//! back. Buffers typically get acquired on the receive task and released on
//! the process loop, which is exactly the traffic the shared list absorbs.
//!
//! Thread-local lists are keyed by pool, so several pools with different
//! buffer sizes can live on one thread without trading buffers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Buffers a thread keeps before spilling to the shared list.
pub const LOCAL_CAPACITY: usize = 64;
/// Buffers moved per spill or refill.
pub const TRANSFER_BATCH: usize = 32;
pub const DEFAULT_GLOBAL_CAPACITY: usize = 4096;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static LOCAL: RefCell<HashMap<usize, Vec<Vec<u8>>>> = RefCell::new(HashMap::new());
}

#[derive(Debug)]
pub struct PacketPool {
    id: usize,
    global: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    global_capacity: usize,
    allocated: AtomicUsize,
}

impl PacketPool {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_capacity(buffer_size, DEFAULT_GLOBAL_CAPACITY)
    }

    pub fn with_capacity(buffer_size: usize, global_capacity: usize) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            global: Mutex::new(Vec::new()),
            buffer_size,
            global_capacity,
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers allocated fresh because no free one was available.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn global_len(&self) -> usize {
        self.global.lock().len()
    }

    /// Returns an empty buffer with at least `buffer_size` capacity.
    pub fn acquire(&self) -> Vec<u8> {
        let size = self.buffer_size;
        if let Some(buffer) = self.with_local(|local| pop_fitting(local, size)) {
            return buffer;
        }

        let mut batch = {
            let mut global = self.global.lock();
            let start = global.len().saturating_sub(TRANSFER_BATCH);
            global.drain(start..).collect::<Vec<_>>()
        };
        if let Some(buffer) = pop_fitting(&mut batch, size) {
            self.with_local(|local| local.append(&mut batch));
            return buffer;
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        Vec::with_capacity(size)
    }

    /// Hands a buffer back. Buffers too small for this pool are dropped.
    pub fn release(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < self.buffer_size {
            return;
        }
        buffer.clear();

        let spill = self.with_local(|local| {
            local.push(buffer);
            if local.len() > LOCAL_CAPACITY {
                let at = local.len() - TRANSFER_BATCH;
                Some(local.split_off(at))
            } else {
                None
            }
        });

        if let Some(batch) = spill {
            let mut global = self.global.lock();
            let room = self.global_capacity.saturating_sub(global.len());
            global.extend(batch.into_iter().take(room));
        }
    }

    fn with_local<R>(&self, f: impl FnOnce(&mut Vec<Vec<u8>>) -> R) -> R {
        LOCAL.with(|local| f(local.borrow_mut().entry(self.id).or_default()))
    }
}

impl Drop for PacketPool {
    /// Only the dropping thread's list can be reached; other threads keep
    /// theirs until they exit.
    fn drop(&mut self) {
        let _ = LOCAL.try_with(|local| local.borrow_mut().remove(&self.id));
    }
}

fn pop_fitting(list: &mut Vec<Vec<u8>>, size: usize) -> Option<Vec<u8>> {
    while let Some(buffer) = list.pop() {
        if buffer.capacity() >= size {
            return Some(buffer);
        }
    }
    None
}
