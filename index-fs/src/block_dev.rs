use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::SECTOR_SIZE;

/// Trait for block devices
/// which reads and writes data in the unit of sectors
pub trait BlockDevice: Send + Sync {
    /// Read data from a sector into `buf`, which is exactly one sector long
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// Write one sector of data from `buf` to a sector
    fn write_block(&self, block_id: usize, buf: &[u8]);
    /// Total number of sectors on the device
    fn block_count(&self) -> usize;
}

/// A block device kept entirely in memory.
///
/// Counts the transfers it serves so that callers can observe how much
/// traffic reaches the device.
pub struct RamDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// A zeroed disk of `block_count` sectors
    pub fn new(block_count: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; block_count]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of `read_block` calls served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_block` calls served so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Copy of a sector as it currently sits on the "platter",
    /// bypassing any cache and the transfer counters.
    pub fn snapshot(&self, block_id: usize) -> [u8; SECTOR_SIZE] {
        self.sectors.lock()[block_id]
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "not a complete block!");
        buf.copy_from_slice(&self.sectors.lock()[block_id]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "not a complete block!");
        self.sectors.lock()[block_id].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn block_count(&self) -> usize {
        self.sectors.lock().len()
    }
}
