use std::sync::Arc;

use spin::Mutex;

use crate::block_cache::BlockCache;
use crate::SECTOR_BITS;

/// A bitmap sector viewed as 64 words
type BitmapBlock = [u64; 64];
const WORDS_PER_SECTOR: usize = 64;

/// Free-space map: one bit per device sector, set when the sector is in use.
///
/// The bitmap lives in `sectors` consecutive sectors starting at `start`.
/// An in-memory copy answers allocation requests; every change is written
/// through the buffer cache.
pub struct FreeMap {
    cache: Arc<BlockCache>,
    start: u32,
    sectors: u32,
    total: usize,
    bits: Mutex<Vec<u64>>,
}

/// Decompose bits into (sector_pos, word_pos, inner_pos)
fn decomposition(mut bit: usize) -> (usize, usize, usize) {
    let sector_pos = bit / SECTOR_BITS;
    bit %= SECTOR_BITS;
    (sector_pos, bit / 64, bit % 64)
}

impl FreeMap {
    /// Number of bitmap sectors needed to describe `total` sectors
    pub fn sectors_for(total: usize) -> u32 {
        ((total + SECTOR_BITS - 1) / SECTOR_BITS) as u32
    }

    /// A fresh map where only the sectors below `start + sectors`
    /// (super block, root inode, the bitmap itself) are in use.
    pub fn create(cache: Arc<BlockCache>, start: u32, total: usize) -> Self {
        let sectors = Self::sectors_for(total);
        let map = Self {
            cache,
            start,
            sectors,
            total,
            bits: Mutex::new(vec![0u64; sectors as usize * WORDS_PER_SECTOR]),
        };
        {
            let mut bits = map.bits.lock();
            for bit in 0..(start + sectors) as usize {
                bits[bit / 64] |= 1u64 << (bit % 64);
            }
        }
        map.persist(0..sectors as usize);
        map
    }

    /// Load a map previously written by [`FreeMap::create`].
    pub fn open(cache: Arc<BlockCache>, start: u32, sectors: u32, total: usize) -> Self {
        let mut bits = Vec::with_capacity(sectors as usize * WORDS_PER_SECTOR);
        for pos in 0..sectors as usize {
            cache.read_with(start as usize + pos, 0, |block: &BitmapBlock| {
                bits.extend_from_slice(block)
            });
        }
        Self {
            cache,
            start,
            sectors,
            total,
            bits: Mutex::new(bits),
        }
    }

    /// Allocate `count` consecutive sectors and return the first one,
    /// or `None` if no such run is free.
    pub fn allocate(&self, count: usize) -> Option<u32> {
        if count == 0 {
            return None;
        }
        let mut bits = self.bits.lock();
        let first = if count == 1 {
            bits.iter()
                .enumerate()
                .find(|(_, word)| **word != u64::MAX)
                .map(|(word_pos, word)| word_pos * 64 + word.trailing_ones() as usize)
                .filter(|&bit| bit < self.total)?
        } else {
            let mut run = 0;
            let mut found = None;
            for bit in 0..self.total {
                if bits[bit / 64] & (1u64 << (bit % 64)) == 0 {
                    run += 1;
                    if run == count {
                        found = Some(bit + 1 - count);
                        break;
                    }
                } else {
                    run = 0;
                }
            }
            found?
        };
        for bit in first..first + count {
            bits[bit / 64] |= 1u64 << (bit % 64);
        }
        drop(bits);
        self.persist(decomposition(first).0..=decomposition(first + count - 1).0);
        log::trace!("free map: allocate {} sector(s) at {}", count, first);
        Some(first as u32)
    }

    /// Give `count` sectors starting at `first` back to the map.
    pub fn release(&self, first: u32, count: usize) {
        if count == 0 {
            return;
        }
        let first = first as usize;
        let mut bits = self.bits.lock();
        for bit in first..first + count {
            let (_, _, inner_pos) = decomposition(bit);
            let word = &mut bits[bit / 64];
            assert!(*word & (1u64 << inner_pos) > 0, "sector {} is not allocated", bit);
            *word &= !(1u64 << inner_pos);
        }
        drop(bits);
        self.persist(decomposition(first).0..=decomposition(first + count - 1).0);
        log::trace!("free map: release {} sector(s) at {}", count, first);
    }

    /// Whether `sector` is currently marked in use
    pub fn is_allocated(&self, sector: u32) -> bool {
        let sector = sector as usize;
        self.bits.lock()[sector / 64] & (1u64 << (sector % 64)) != 0
    }

    /// Number of sectors still available
    pub fn free_count(&self) -> usize {
        let bits = self.bits.lock();
        (0..self.total)
            .filter(|&bit| bits[bit / 64] & (1u64 << (bit % 64)) == 0)
            .count()
    }

    /// Copy the in-memory words of the given bitmap sectors into the cache.
    fn persist(&self, positions: impl IntoIterator<Item = usize>) {
        let bits = self.bits.lock();
        for pos in positions {
            let words = &bits[pos * WORDS_PER_SECTOR..(pos + 1) * WORDS_PER_SECTOR];
            self.cache
                .modify(self.start as usize + pos, 0, |block: &mut BitmapBlock| {
                    block.copy_from_slice(words)
                });
        }
    }

    /// Number of sectors holding the bitmap
    pub fn sectors(&self) -> u32 {
        self.sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RamDisk;

    fn setup(total: usize) -> (Arc<BlockCache>, FreeMap) {
        let cache = BlockCache::new(Arc::new(RamDisk::new(total)), false);
        let map = FreeMap::create(Arc::clone(&cache), 2, total);
        (cache, map)
    }

    #[test]
    fn reserved_sectors_are_in_use() {
        let (_cache, map) = setup(100);
        assert_eq!(map.sectors(), 1);
        assert!(map.is_allocated(0) && map.is_allocated(1) && map.is_allocated(2));
        assert_eq!(map.free_count(), 97);
        assert_eq!(map.allocate(1), Some(3));
    }

    #[test]
    fn exhaustion_and_release() {
        let (_cache, map) = setup(10);
        let got: Vec<u32> = (0..7).map(|_| map.allocate(1).unwrap()).collect();
        assert_eq!(got, (3..10).collect::<Vec<u32>>());
        assert_eq!(map.allocate(1), None);
        map.release(5, 1);
        assert_eq!(map.allocate(1), Some(5));
    }

    #[test]
    fn contiguous_runs() {
        let (_cache, map) = setup(64);
        assert_eq!(map.allocate(1), Some(3));
        assert_eq!(map.allocate(1), Some(4));
        map.release(3, 1);
        // a hole of one sector is skipped for a run of two
        assert_eq!(map.allocate(2), Some(5));
        assert_eq!(map.allocate(1), Some(3));
        assert_eq!(map.allocate(100), None);
    }

    #[test]
    fn survives_reopen() {
        let (cache, map) = setup(5000);
        assert_eq!(map.sectors(), 2);
        let far = map.allocate(4200).unwrap();
        let reopened = FreeMap::open(cache, 2, map.sectors(), 5000);
        assert!(reopened.is_allocated(far + 4199));
        assert_eq!(reopened.free_count(), map.free_count());
    }

    #[test]
    #[should_panic]
    fn double_release_panics() {
        let (_cache, map) = setup(16);
        let sector = map.allocate(1).unwrap();
        map.release(sector, 1);
        map.release(sector, 1);
    }
}
