//! Write-back sector cache
//!
//! Coalesces byte-granular reads and writes into sector-aligned backend I/O
//! and absorbs small writes in a pool of sector slots. All volume traffic
//! passes through one of these; large aligned transfers bypass the pool
//! (after flushing any overlapping dirty sectors) so bulk copies are not
//! throttled by it.
//!
//! The pool is a flat byte buffer carved into `cache_size / sector_size`
//! slots. Two maps track residency: sector -> slot (an LRU, which also
//! decides eviction) and slot -> sector (to unlink a recycled slot). Dirty
//! sectors are committed in ascending order on flush, then the whole table
//! is reset — clean residues are dropped too, so a later remap can never
//! observe stale data.
//!
//! Not safe for concurrent mutation; callers serialize, as everywhere else
//! in the engine. After a backend error during flush the cache is marked
//! inconsistent and every later flush re-raises, so a caller that ignores
//! the first error cannot silently lose the remaining dirty sectors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, error, trace};
use lru::LruCache;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// Default pool size: 1 MiB, i.e. 2048 slots of 512 bytes.
pub const DEFAULT_CACHE_SIZE: usize = 1 << 20;

struct CacheState {
    pool: Vec<u8>,
    /// sector index -> slot index; LRU order drives eviction.
    slot_of_sector: LruCache<u64, usize>,
    /// slot index -> sector index, for unlinking recycled slots.
    sector_of_slot: BTreeMap<usize, u64>,
    free_slots: Vec<usize>,
    dirty: BTreeSet<u64>,
    /// Set when a flush failed; all further flushes re-raise.
    poisoned: bool,
    hits: u64,
    misses: u64,
}

pub struct SectorCache {
    base: Arc<dyn BlockDevice>,
    sector_size: usize,
    state: Mutex<CacheState>,
}

impl SectorCache {
    pub fn new(base: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(base, DEFAULT_CACHE_SIZE)
    }

    pub fn with_capacity(base: Arc<dyn BlockDevice>, cache_size: usize) -> Self {
        let sector_size = base.sector_size();
        let slots = (cache_size / sector_size).max(8);
        Self {
            base,
            sector_size,
            state: Mutex::new(CacheState {
                pool: vec![0u8; slots * sector_size],
                slot_of_sector: LruCache::unbounded(),
                sector_of_slot: BTreeMap::new(),
                free_slots: (0..slots).rev().collect(),
                dirty: BTreeSet::new(),
                poisoned: false,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn base(&self) -> &Arc<dyn BlockDevice> {
        &self.base
    }

    /// Ensure `sector` occupies a slot, loading it from the backend on a
    /// miss. Returns the slot index.
    fn load_sector(&self, state: &mut CacheState, sector: u64) -> Result<usize> {
        if let Some(&slot) = state.slot_of_sector.get(&sector) {
            state.hits += 1;
            return Ok(slot);
        }
        state.misses += 1;
        let slot = match state.free_slots.pop() {
            Some(slot) => slot,
            None => {
                // Recycle the least-recently-used slot, committing it first
                // if it is dirty.
                let Some((old_sector, slot)) = state.slot_of_sector.pop_lru() else {
                    return Err(Error::Io(std::io::Error::other(
                        "sector cache has no slots",
                    )));
                };
                if state.dirty.remove(&old_sector) {
                    let range = slot * self.sector_size..(slot + 1) * self.sector_size;
                    self.base
                        .write_at(old_sector * self.sector_size as u64, &state.pool[range])?;
                    trace!("cache: evicted dirty sector {old_sector}");
                }
                state.sector_of_slot.remove(&slot);
                slot
            }
        };
        let range = slot * self.sector_size..(slot + 1) * self.sector_size;
        self.base
            .read_at(sector * self.sector_size as u64, &mut state.pool[range])?;
        state.slot_of_sector.put(sector, slot);
        state.sector_of_slot.insert(slot, sector);
        Ok(slot)
    }

    /// Drop `sector` from the cache without writing it back.
    fn discard_sector(state: &mut CacheState, sector: u64) {
        if let Some(slot) = state.slot_of_sector.pop(&sector) {
            state.sector_of_slot.remove(&slot);
            state.free_slots.push(slot);
        }
        state.dirty.remove(&sector);
    }

    fn flush_locked(&self, state: &mut CacheState) -> Result<()> {
        if state.poisoned {
            return Err(Error::Io(std::io::Error::other(
                "sector cache inconsistent after earlier flush failure",
            )));
        }
        // Ascending order keeps backend seeks monotonic.
        let dirty: Vec<u64> = state.dirty.iter().copied().collect();
        for sector in dirty {
            let slot = match state.slot_of_sector.peek(&sector) {
                Some(&slot) => slot,
                None => {
                    error!("cache: dirty sector {sector} lost its slot");
                    continue;
                }
            };
            let range = slot * self.sector_size..(slot + 1) * self.sector_size;
            if let Err(e) = self
                .base
                .write_at(sector * self.sector_size as u64, &state.pool[range])
            {
                state.poisoned = true;
                return Err(e);
            }
            state.dirty.remove(&sector);
        }
        // Reset the whole table: clean residues must not outlive a flush.
        debug!(
            "cache: flushed; {} hits / {} misses",
            state.hits, state.misses
        );
        let slots = state.pool.len() / self.sector_size;
        state.slot_of_sector.clear();
        state.sector_of_slot.clear();
        state.free_slots = (0..slots).rev().collect();
        Ok(())
    }
}

impl BlockDevice for SectorCache {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let ss = self.sector_size as u64;
        let first = offset / ss;
        let last = (offset + buf.len() as u64 - 1) / ss;
        let mut state = self.state.lock();

        if first == last {
            let slot = self.load_sector(&mut state, first)?;
            let in_sector = (offset % ss) as usize;
            let base = slot * self.sector_size + in_sector;
            buf.copy_from_slice(&state.pool[base..base + buf.len()]);
            return Ok(());
        }

        // Multi-sector read: commit overlapping dirty sectors, then bypass
        // the pool entirely. Clean cached copies are identical to disk.
        for sector in first..=last {
            if state.dirty.contains(&sector) {
                let slot = match state.slot_of_sector.peek(&sector) {
                    Some(&slot) => slot,
                    None => continue,
                };
                let range = slot * self.sector_size..(slot + 1) * self.sector_size;
                self.base
                    .write_at(sector * ss, &state.pool[range])?;
                state.dirty.remove(&sector);
            }
        }
        self.base.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.base.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(());
        }
        let ss = self.sector_size as u64;
        let mut state = self.state.lock();
        let mut pos = offset;
        let mut rest = buf;

        // Leading partial sector: read-modify in place.
        let head = (pos % ss) as usize;
        if head != 0 {
            let take = rest.len().min(self.sector_size - head);
            let sector = pos / ss;
            let slot = self.load_sector(&mut state, sector)?;
            let base = slot * self.sector_size + head;
            state.pool[base..base + take].copy_from_slice(&rest[..take]);
            state.dirty.insert(sector);
            pos += take as u64;
            rest = &rest[take..];
        }

        // Full sectors: invalidate overlapping cached copies and bypass.
        let full = rest.len() / self.sector_size * self.sector_size;
        if full > 0 {
            let first = pos / ss;
            let count = (full / self.sector_size) as u64;
            for sector in first..first + count {
                Self::discard_sector(&mut state, sector);
            }
            self.base.write_at(pos, &rest[..full])?;
            pos += full as u64;
            rest = &rest[full..];
        }

        // Trailing partial sector.
        if !rest.is_empty() {
            let sector = pos / ss;
            let slot = self.load_sector(&mut state, sector)?;
            let base = slot * self.sector_size;
            state.pool[base..base + rest.len()].copy_from_slice(rest);
            state.dirty.insert(sector);
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.base.size()
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)?;
        self.base.flush()
    }

    fn is_read_only(&self) -> bool {
        self.base.is_read_only()
    }
}

impl Drop for SectorCache {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.dirty.is_empty() {
            if let Err(e) = self.flush_locked(&mut state) {
                error!("cache: flush on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    fn cached(size: u64) -> (Arc<MemDisk>, SectorCache) {
        let disk = Arc::new(MemDisk::new(size));
        let cache = SectorCache::with_capacity(disk.clone(), 8 * 512);
        (disk, cache)
    }

    #[test]
    fn read_your_writes_sub_sector() {
        let (_disk, cache) = cached(64 * 512);
        cache.write_at(100, b"abcdef").unwrap();
        let mut buf = [0u8; 6];
        cache.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn flush_commits_in_ascending_order() {
        let (disk, cache) = cached(64 * 512);
        cache.write_at(5 * 512 + 1, &[7u8; 10]).unwrap();
        cache.write_at(2 * 512 + 3, &[9u8; 10]).unwrap();
        cache.flush().unwrap();
        let snap = disk.snapshot();
        assert_eq!(&snap[5 * 512 + 1..5 * 512 + 11], &[7u8; 10]);
        assert_eq!(&snap[2 * 512 + 3..2 * 512 + 13], &[9u8; 10]);
    }

    #[test]
    fn large_write_invalidates_overlap() {
        let (disk, cache) = cached(64 * 512);
        cache.write_at(4 * 512 + 8, &[1u8; 8]).unwrap();
        // Overwrite the same sector with a bulk aligned write.
        cache.write_at(4 * 512, &[2u8; 4 * 512]).unwrap();
        let mut buf = [0u8; 8];
        cache.read_at(4 * 512 + 8, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 8]);
        cache.flush().unwrap();
        assert_eq!(disk.snapshot()[4 * 512 + 8], 2);
    }

    #[test]
    fn eviction_under_pressure_keeps_data() {
        let (disk, cache) = cached(64 * 512);
        // Touch more sectors than there are slots (8).
        for sector in 0u64..32 {
            cache
                .write_at(sector * 512 + 7, &[sector as u8 + 1; 4])
                .unwrap();
        }
        cache.flush().unwrap();
        let snap = disk.snapshot();
        for sector in 0u64..32 {
            assert_eq!(
                snap[(sector * 512 + 7) as usize],
                sector as u8 + 1,
                "sector {sector}"
            );
        }
    }

    #[test]
    fn straddling_read_sees_dirty_data() {
        let (_disk, cache) = cached(64 * 512);
        cache.write_at(511, &[0xAA, 0xBB]).unwrap();
        let mut buf = vec![0u8; 1024];
        cache.read_at(0, &mut buf).unwrap();
        assert_eq!(buf[511], 0xAA);
        assert_eq!(buf[512], 0xBB);
    }
}
