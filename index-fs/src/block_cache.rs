//! Sector cache between the file system and its block device.
//!
//! Every transfer goes through [`BlockCache`]: a fixed array of
//! `CACHE_CAPACITY` slots guarded by one lock, replaced with the clock
//! (second-chance) algorithm. Reads optionally queue the following sector
//! for a background read-ahead thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use spin::Mutex;

use crate::sync::Semaphore;
use crate::{BlockDevice, CACHE_CAPACITY, SECTOR_SIZE};

/// Types that may be viewed in place inside a cached sector.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or a primitive array), contain only
/// integer fields, and accept every bit pattern as a valid value.
pub unsafe trait Plain: Sized {}

unsafe impl Plain for u32 {}
unsafe impl Plain for u64 {}
unsafe impl Plain for [u8; SECTOR_SIZE] {}
unsafe impl Plain for [u32; SECTOR_SIZE / 4] {}
unsafe impl Plain for [u64; SECTOR_SIZE / 8] {}

/// Sector-sized buffer aligned for in-place `u64` views.
#[derive(Clone)]
#[repr(C, align(8))]
struct SectorBuf([u8; SECTOR_SIZE]);

/// One cache slot
struct CacheEntry {
    valid: bool,
    dirty: bool,
    /// second-chance bit consulted by the clock hand
    accessed: bool,
    sector: usize,
    buffer: SectorBuf,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            valid: false,
            dirty: false,
            accessed: false,
            sector: 0,
            buffer: SectorBuf([0u8; SECTOR_SIZE]),
        }
    }

    fn get_ref<T: Plain>(&self, offset: usize) -> &T {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= SECTOR_SIZE);
        assert_eq!(offset % core::mem::align_of::<T>(), 0);
        // SAFETY: in bounds and aligned (checked above), `T: Plain`
        unsafe { &*(self.buffer.0.as_ptr().add(offset) as *const T) }
    }

    fn get_mut<T: Plain>(&mut self, offset: usize) -> &mut T {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= SECTOR_SIZE);
        assert_eq!(offset % core::mem::align_of::<T>(), 0);
        self.dirty = true;
        // SAFETY: in bounds and aligned (checked above), `T: Plain`
        unsafe { &mut *(self.buffer.0.as_mut_ptr().add(offset) as *mut T) }
    }

    fn write_back(&mut self, device: &dyn BlockDevice) -> bool {
        if self.valid && self.dirty {
            device.write_block(self.sector, &self.buffer.0);
            self.dirty = false;
            true
        } else {
            false
        }
    }
}

/// Counters describing cache behaviour since creation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// lookups served from a resident slot
    pub hits: usize,
    /// lookups that had to load or claim a slot
    pub misses: usize,
    /// valid slots reclaimed by the clock hand
    pub evictions: usize,
    /// dirty slots written to the device
    pub write_backs: usize,
}

struct CacheInner {
    entries: Vec<CacheEntry>,
    hand: usize,
    stats: CacheStats,
}

impl CacheInner {
    fn new() -> Self {
        Self {
            entries: (0..CACHE_CAPACITY).map(|_| CacheEntry::empty()).collect(),
            hand: 0,
            stats: CacheStats::default(),
        }
    }

    fn find(&self, sector: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.valid && entry.sector == sector)
    }

    /// Pick a slot for a new sector: an invalid slot if there is one,
    /// otherwise the first slot the clock hand finds with its accessed
    /// bit already clear.
    fn evict(&mut self, device: &dyn BlockDevice) -> usize {
        if let Some(idx) = self.entries.iter().position(|entry| !entry.valid) {
            return idx;
        }
        loop {
            let idx = self.hand;
            self.hand = (self.hand + 1) % CACHE_CAPACITY;
            let entry = &mut self.entries[idx];
            if entry.accessed {
                entry.accessed = false;
                continue;
            }
            if entry.write_back(device) {
                self.stats.write_backs += 1;
            }
            log::trace!("block cache: evict sector {} from slot {}", entry.sector, idx);
            entry.valid = false;
            self.stats.evictions += 1;
            return idx;
        }
    }

    /// Slot holding `sector`, loading it on a miss.
    /// With `load == false` the caller is about to overwrite the whole
    /// sector, so the device read is skipped.
    fn slot_for(&mut self, sector: usize, load: bool, device: &dyn BlockDevice) -> usize {
        if let Some(idx) = self.find(sector) {
            self.stats.hits += 1;
            return idx;
        }
        self.stats.misses += 1;
        let idx = self.evict(device);
        let entry = &mut self.entries[idx];
        if load {
            device.read_block(sector, &mut entry.buffer.0);
        }
        entry.valid = true;
        entry.dirty = false;
        entry.sector = sector;
        idx
    }
}

/// Pending read-ahead requests and the worker draining them.
struct ReadAhead {
    queue: Arc<ReadAheadQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct ReadAheadQueue {
    requests: Mutex<VecDeque<usize>>,
    pending: Semaphore,
    closed: AtomicBool,
}

impl ReadAhead {
    fn spawn(cache: Weak<BlockCache>) -> Option<Self> {
        let queue = Arc::new(ReadAheadQueue {
            requests: Mutex::new(VecDeque::new()),
            pending: Semaphore::new(0),
            closed: AtomicBool::new(false),
        });
        let worker_queue = Arc::clone(&queue);
        let worker = thread::Builder::new()
            .name("read-ahead".into())
            .spawn(move || Self::run(worker_queue, cache));
        match worker {
            Ok(handle) => Some(Self {
                queue,
                worker: Mutex::new(Some(handle)),
            }),
            Err(err) => {
                log::warn!("block cache: read-ahead disabled, cannot spawn worker: {}", err);
                None
            }
        }
    }

    fn run(queue: Arc<ReadAheadQueue>, cache: Weak<BlockCache>) {
        loop {
            queue.pending.down();
            if queue.closed.load(Ordering::Acquire) {
                break;
            }
            let Some(sector) = queue.requests.lock().pop_front() else {
                continue;
            };
            match cache.upgrade() {
                Some(cache) => cache.prefetch(sector),
                None => break,
            }
        }
    }

    fn enqueue(&self, sector: usize) {
        if self.queue.closed.load(Ordering::Acquire) {
            return;
        }
        self.queue.requests.lock().push_back(sector);
        self.queue.pending.up();
    }

    fn stop(&self) {
        self.queue.closed.store(true, Ordering::Release);
        let dropped = {
            let mut requests = self.queue.requests.lock();
            let dropped = requests.len();
            requests.clear();
            dropped
        };
        if dropped > 0 {
            log::trace!("block cache: dropped {} pending read-ahead requests", dropped);
        }
        self.queue.pending.up();
        if let Some(handle) = self.worker.lock().take() {
            // the worker itself may hold the last strong reference
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Fixed-capacity write-back sector cache.
///
/// Cached bytes never leave the lock by reference: callers either copy a
/// whole sector in or out, or run a closure over a typed view.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<CacheInner>,
    read_ahead: Option<ReadAhead>,
}

impl BlockCache {
    /// Create a cache in front of `device`.
    /// With `read_ahead` set, every read miss or hit queues the next sector
    /// for a background prefetch.
    pub fn new(device: Arc<dyn BlockDevice>, read_ahead: bool) -> Arc<Self> {
        Arc::new_cyclic(|cache| Self {
            device,
            inner: Mutex::new(CacheInner::new()),
            read_ahead: if read_ahead {
                ReadAhead::spawn(Weak::clone(cache))
            } else {
                None
            },
        })
    }

    /// The device behind this cache
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Copy `sector` into `buf`, which must be one sector long.
    pub fn read(&self, sector: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut inner = self.inner.lock();
        let idx = inner.slot_for(sector, true, self.device.as_ref());
        let entry = &mut inner.entries[idx];
        entry.accessed = true;
        buf.copy_from_slice(&entry.buffer.0);
        self.request_read_ahead(sector + 1);
    }

    /// Replace the content of `sector` with `buf`, which must be one sector
    /// long. The device sees the data when the slot is evicted or flushed.
    pub fn write(&self, sector: usize, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut inner = self.inner.lock();
        let idx = inner.slot_for(sector, false, self.device.as_ref());
        let entry = &mut inner.entries[idx];
        entry.accessed = true;
        entry.dirty = true;
        entry.buffer.0.copy_from_slice(buf);
    }

    /// Fill `sector` with zeros.
    pub fn zero(&self, sector: usize) {
        self.write(sector, &[0u8; SECTOR_SIZE]);
    }

    /// Run `f` over a `T` stored at `offset` of `sector`.
    pub fn read_with<T: Plain, V>(&self, sector: usize, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        let mut inner = self.inner.lock();
        let idx = inner.slot_for(sector, true, self.device.as_ref());
        let entry = &mut inner.entries[idx];
        entry.accessed = true;
        f(entry.get_ref(offset))
    }

    /// Run `f` over a mutable `T` stored at `offset` of `sector`;
    /// the slot becomes dirty.
    pub fn modify<T: Plain, V>(&self, sector: usize, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        let mut inner = self.inner.lock();
        let idx = inner.slot_for(sector, true, self.device.as_ref());
        let entry = &mut inner.entries[idx];
        entry.accessed = true;
        f(entry.get_mut(offset))
    }

    /// Whether `sector` currently occupies a slot
    pub fn is_resident(&self, sector: usize) -> bool {
        self.inner.lock().find(sector).is_some()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Write every dirty slot back to the device, keeping it cached.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let mut written = 0;
        for entry in inner.entries.iter_mut() {
            if entry.write_back(self.device.as_ref()) {
                written += 1;
            }
        }
        inner.stats.write_backs += written;
    }

    /// Flush every dirty slot, then stop the read-ahead worker and drop
    /// whatever it had not yet fetched. Calling it again is harmless.
    pub fn shutdown(&self) {
        self.flush();
        if let Some(read_ahead) = &self.read_ahead {
            read_ahead.stop();
        }
    }

    fn request_read_ahead(&self, sector: usize) {
        if let Some(read_ahead) = &self.read_ahead {
            if sector < self.device.block_count() {
                read_ahead.enqueue(sector);
            }
        }
    }

    /// Pull `sector` into the cache on behalf of the read-ahead worker.
    fn prefetch(&self, sector: usize) {
        if sector >= self.device.block_count() {
            return;
        }
        let mut inner = self.inner.lock();
        let idx = inner.slot_for(sector, true, self.device.as_ref());
        inner.entries[idx].accessed = true;
        log::trace!("block cache: read ahead sector {}", sector);
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown()
    }
}
