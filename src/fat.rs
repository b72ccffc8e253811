//! Cluster allocator: the FAT slot array and the exFAT allocation bitmap.
//!
//! A FAT is an array of 12/16/32-bit slots indexed by cluster number. Slot
//! value 0 means free; 2..N+1 is the next cluster in a chain; the variant's
//! BAD value marks a reserved/bad cluster; anything in [EOC, EOC+7] ends a
//! chain. FAT[0] holds the media byte padded with ones and FAT[1] an EOC
//! mark, so cluster indices start at 2 and the last valid index is N+1.
//!
//! A FAT32 slot is really a 28-bit value: the top 4 bits are reserved and
//! must be preserved on write. FAT12 packs two slots in three bytes, so an
//! odd index takes the high 12 bits of the 16-bit group read at
//! `offset + index*12/8` and an even index the low 12; a slot may straddle
//! a sector boundary, which is why all slot I/O goes through the byte-
//! granular cached device.
//!
//! exFAT tracks allocation in a bitmap file instead (bit i == cluster 2+i
//! allocated) and uses the FAT only for fragmented chains; trailing padding
//! bits of the bitmap's last byte count as allocated.
//!
//! Free space is mirrored in memory as an ordered run map
//! `{start_cluster: run_length}` built by a full scan on first use and kept
//! coherent by every allocation and free. The map may hold mergeable
//! adjacent runs until `compact()` coalesces them; allocation compacts
//! first, then pops runs until satisfied, splicing each onto the caller's
//! chain and linking the FAT as it goes.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::bpb::FatKind;
use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// Disk extents of the exFAT allocation bitmap file (it is itself stored in
/// clusters, so it may be fragmented).
#[derive(Debug, Clone)]
pub struct BitmapExtents {
    /// (absolute byte offset, byte length) per fragment, in file order.
    pub extents: Vec<(u64, u64)>,
    /// Bitmap length in bytes: ceil(N / 8).
    pub len: u64,
}

impl BitmapExtents {
    fn locate(&self, offset: u64) -> Result<(u64, u64)> {
        let mut skip = offset;
        for &(start, len) in &self.extents {
            if skip < len {
                return Ok((start + skip, len - skip));
            }
            skip -= len;
        }
        Err(Error::invalid("FAT", "bitmap offset out of extents"))
    }

    fn read_at(&self, device: &Arc<dyn BlockDevice>, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let (disk, avail) = self.locate(pos)?;
            let take = ((buf.len() - done) as u64).min(avail) as usize;
            device.read_at(disk, &mut buf[done..done + take])?;
            done += take;
            pos += take as u64;
        }
        Ok(())
    }

    fn write_at(&self, device: &Arc<dyn BlockDevice>, offset: u64, buf: &[u8]) -> Result<()> {
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let (disk, avail) = self.locate(pos)?;
            let take = ((buf.len() - done) as u64).min(avail) as usize;
            device.write_at(disk, &buf[done..done + take])?;
            done += take;
            pos += take as u64;
        }
        Ok(())
    }
}

pub struct Allocator {
    device: Arc<dyn BlockDevice>,
    kind: FatKind,
    /// Byte offset of FAT1.
    fat_offset: u64,
    /// Byte offset of the mirror copy, absent on exFAT.
    fat2_offset: Option<u64>,
    /// Count of data clusters (N).
    clusters: u32,
    /// Highest cluster index that can be addressed: min(BAD-1, N+1).
    real_last: u32,
    /// exFAT only; attached after the root directory is scanned.
    bitmap: Option<BitmapExtents>,
    free_count: u32,
    free_runs: BTreeMap<u32, u32>,
    scanned: bool,
    needs_compact: bool,
    pub last_free_alloc: u32,
}

impl Allocator {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        kind: FatKind,
        fat_offset: u64,
        fat_size: u64,
        num_fats: usize,
        clusters: u32,
    ) -> Self {
        let fat2_offset = if kind != FatKind::ExFat && num_fats > 1 {
            Some(fat_offset + fat_size)
        } else {
            None
        };
        Self {
            device,
            kind,
            fat_offset,
            fat2_offset,
            clusters,
            real_last: (kind.bad() - 1).min(clusters + 1),
            bitmap: None,
            free_count: 0,
            free_runs: BTreeMap::new(),
            scanned: false,
            needs_compact: false,
            last_free_alloc: 2,
        }
    }

    pub fn kind(&self) -> FatKind {
        self.kind
    }

    pub fn clusters(&self) -> u32 {
        self.clusters
    }

    /// Bind the exFAT allocation bitmap once its extents are known.
    pub fn attach_bitmap(&mut self, bitmap: BitmapExtents) {
        self.bitmap = Some(bitmap);
        self.scanned = false;
        self.free_runs.clear();
    }

    pub fn bitmap(&self) -> Option<&BitmapExtents> {
        self.bitmap.as_ref()
    }

    /// Slot value at `index`. Out-of-range indices read as end-of-chain so
    /// that chain walks over corrupt links terminate instead of wandering.
    pub fn get(&self, index: u32) -> Result<u32> {
        if index < 2 || index > self.real_last {
            debug!("attempt to read nonexistent FAT index {index:#x}");
            return Ok(self.kind.eoc());
        }
        let pos = self.fat_offset + (index as u64 * self.kind.slot_bits() as u64) / 8;
        match self.kind {
            FatKind::Fat12 => {
                let mut b = [0u8; 2];
                self.device.read_at(pos, &mut b)?;
                let group = u16::from_le_bytes(b);
                Ok(if index % 2 == 1 {
                    (group >> 4) as u32
                } else {
                    (group & 0x0FFF) as u32
                })
            }
            FatKind::Fat16 => {
                let mut b = [0u8; 2];
                self.device.read_at(pos, &mut b)?;
                Ok(u16::from_le_bytes(b) as u32)
            }
            FatKind::Fat32 => {
                let mut b = [0u8; 4];
                self.device.read_at(pos, &mut b)?;
                Ok(u32::from_le_bytes(b) & 0x0FFF_FFFF)
            }
            FatKind::ExFat => {
                let mut b = [0u8; 4];
                self.device.read_at(pos, &mut b)?;
                Ok(u32::from_le_bytes(b))
            }
        }
    }

    /// Store `value` at `index` in FAT1 and the mirror. Invalid indices or
    /// values are refused with a log line, never an abort: a bad write is
    /// always worse than a lost one.
    pub fn set(&mut self, index: u32, value: u32) -> Result<()> {
        if index < 2 || index > self.real_last {
            warn!("attempt to set invalid FAT index {index:#x} to {value:#x}");
            return Ok(());
        }
        if value > self.real_last && value < self.kind.bad() {
            warn!("attempt to set FAT[{index:#x}] to invalid value {value:#x}");
            return Ok(());
        }
        let dsp = (index as u64 * self.kind.slot_bits() as u64) / 8;
        match self.kind {
            FatKind::Fat12 => {
                let mut b = [0u8; 2];
                self.device.read_at(self.fat_offset + dsp, &mut b)?;
                let group = u16::from_le_bytes(b);
                let merged = if index % 2 == 1 {
                    ((value as u16 & 0x0FFF) << 4) | (group & 0x000F)
                } else {
                    (group & 0xF000) | (value as u16 & 0x0FFF)
                };
                let bytes = merged.to_le_bytes();
                self.device.write_at(self.fat_offset + dsp, &bytes)?;
                if let Some(fat2) = self.fat2_offset {
                    self.device.write_at(fat2 + dsp, &bytes)?;
                }
            }
            FatKind::Fat16 => {
                let bytes = (value as u16).to_le_bytes();
                self.device.write_at(self.fat_offset + dsp, &bytes)?;
                if let Some(fat2) = self.fat2_offset {
                    self.device.write_at(fat2 + dsp, &bytes)?;
                }
            }
            FatKind::Fat32 => {
                // Only 28 bits are ours; keep the reserved high nibble.
                let mut b = [0u8; 4];
                self.device.read_at(self.fat_offset + dsp, &mut b)?;
                let old = u32::from_le_bytes(b);
                let bytes = ((old & 0xF000_0000) | (value & 0x0FFF_FFFF)).to_le_bytes();
                self.device.write_at(self.fat_offset + dsp, &bytes)?;
                if let Some(fat2) = self.fat2_offset {
                    self.device.write_at(fat2 + dsp, &bytes)?;
                }
            }
            FatKind::ExFat => {
                self.device
                    .write_at(self.fat_offset + dsp, &value.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Chain length and last cluster, walking `next[]` until an EOC mark.
    pub fn count(&self, start: u32) -> Result<(u32, u32)> {
        let mut cluster = start;
        let mut n = 1u32;
        loop {
            let next = self.get(cluster)?;
            if self.kind.is_eoc(next) {
                return Ok((n, cluster));
            }
            if next < 2 || self.kind.is_bad(next) {
                return Err(Error::ChainCorruption(cluster));
            }
            cluster = next;
            n += 1;
            if n > self.clusters {
                return Err(Error::ChainCorruption(start));
            }
        }
    }

    /// Index of the n-th successor of `start` (stops early at end of chain).
    pub fn count_to(&self, start: u32, mut n: u32) -> Result<u32> {
        let mut cluster = start;
        while n > 0 {
            let next = self.get(cluster)?;
            if self.kind.is_eoc(next) {
                break;
            }
            if next < 2 || self.kind.is_bad(next) {
                return Err(Error::ChainCorruption(cluster));
            }
            cluster = next;
            n -= 1;
        }
        Ok(cluster)
    }

    /// Length of the maximal physically contiguous run beginning at `start`
    /// (optionally capped at `limit` clusters) and the first cluster after
    /// it — an EOC mark if the chain ends there.
    pub fn count_run(&self, start: u32, limit: u32) -> Result<(u32, u32)> {
        let mut n = 1u32;
        let mut cluster = start;
        loop {
            if self.kind.is_eoc(cluster) {
                break;
            }
            let next = self.get(cluster)?;
            if next != cluster + 1 {
                return Ok((n, next));
            }
            if limit > 0 && n == limit {
                return Ok((n, next));
            }
            cluster = next;
            n += 1;
            if n > self.clusters {
                return Err(Error::ChainCorruption(start));
            }
        }
        Ok((n, cluster))
    }

    /// Write a chain of consecutive links over `[start, start+count)`, the
    /// final slot getting an EOC mark; or zero the range when `clear`.
    pub fn mark_run(&mut self, start: u32, count: u32, clear: bool) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if start < 2 || start > self.real_last {
            warn!("attempt to mark invalid run at {start:#x}, aborted");
            return Ok(());
        }
        if self.kind == FatKind::Fat12 {
            for i in 0..count {
                let value = if clear {
                    0
                } else if i == count - 1 {
                    self.kind.eoc()
                } else {
                    start + i + 1
                };
                self.set(start + i, value)?;
            }
            return Ok(());
        }
        // FAT16/32/exFAT slots are byte-aligned: build the run and write it
        // to both copies in one pass.
        let slot_size = (self.kind.slot_bits() / 8) as usize;
        let mut run = vec![0u8; count as usize * slot_size];
        if !clear {
            for i in 0..count {
                let value = if i == count - 1 {
                    self.kind.eoc()
                } else {
                    start + i + 1
                };
                let at = i as usize * slot_size;
                match self.kind {
                    FatKind::Fat16 => {
                        run[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes())
                    }
                    _ => run[at..at + 4].copy_from_slice(&value.to_le_bytes()),
                }
            }
        }
        let dsp = (start as u64 * self.kind.slot_bits() as u64) / 8;
        self.device.write_at(self.fat_offset + dsp, &run)?;
        if let Some(fat2) = self.fat2_offset {
            self.device.write_at(fat2 + dsp, &run)?;
        }
        Ok(())
    }

    // ---- exFAT bitmap ----

    pub fn bit_is_set(&self, cluster: u32) -> Result<bool> {
        let Some(bitmap) = &self.bitmap else {
            return Err(Error::invalid("FAT", "no allocation bitmap attached"));
        };
        let bit = cluster as u64 - 2;
        let mut b = [0u8];
        bitmap.read_at(&self.device, bit / 8, &mut b)?;
        Ok(b[0] & (1 << (bit % 8)) != 0)
    }

    /// Set or clear a run of bits, one partial byte at each end and bulk
    /// fill between.
    pub fn set_bits(&mut self, cluster: u32, mut length: u32, clear: bool) -> Result<()> {
        let Some(bitmap) = self.bitmap.clone() else {
            return Err(Error::invalid("FAT", "no allocation bitmap attached"));
        };
        let bit = cluster as u64 - 2;
        let mut pos = bit / 8;
        let rem = (bit % 8) as u32;
        if rem != 0 {
            let mut b = [0u8];
            bitmap.read_at(&self.device, pos, &mut b)?;
            let todo = (8 - rem).min(length);
            let mask = (0xFFu16 >> (8 - todo)) as u8;
            if clear {
                b[0] &= !(mask << rem);
            } else {
                b[0] |= mask << rem;
            }
            bitmap.write_at(&self.device, pos, &b)?;
            length -= todo;
            pos += 1;
        }
        let octets = (length / 8) as usize;
        if octets > 0 {
            let fill = vec![if clear { 0x00 } else { 0xFF }; octets];
            bitmap.write_at(&self.device, pos, &fill)?;
            pos += octets as u64;
            length %= 8;
        }
        if length > 0 {
            let mut b = [0u8];
            bitmap.read_at(&self.device, pos, &mut b)?;
            let mask = (0xFFu16 >> (8 - length)) as u8;
            if clear {
                b[0] &= !mask;
            } else {
                b[0] |= mask;
            }
            bitmap.write_at(&self.device, pos, &b)?;
        }
        Ok(())
    }

    // ---- free-space map ----

    pub fn free_count(&mut self) -> Result<u32> {
        self.ensure_scanned()?;
        Ok(self.free_count)
    }

    /// Free count without forcing a scan; `None` until one has happened.
    pub fn free_count_hint(&self) -> Option<u32> {
        self.scanned.then_some(self.free_count)
    }

    /// Current free-run map (scanning first if needed).
    pub fn free_runs(&mut self) -> Result<&BTreeMap<u32, u32>> {
        self.ensure_scanned()?;
        Ok(&self.free_runs)
    }

    fn ensure_scanned(&mut self) -> Result<()> {
        if self.scanned {
            return Ok(());
        }
        if self.kind == FatKind::ExFat {
            self.scan_bitmap()?;
        } else {
            self.scan_fat()?;
        }
        self.scanned = true;
        Ok(())
    }

    /// Full scan of the FAT, in pages, recording runs of zero slots.
    fn scan_fat(&mut self) -> Result<()> {
        self.free_runs.clear();
        self.free_count = 0;
        let total = self.clusters + 2;

        // FAT12 tables top out near 6 KiB; slurp them whole so no 12-bit
        // group straddles a page boundary. Wider slots stream in 1 MiB
        // pages.
        let (page_slots, slot_bytes): (u32, usize) = match self.kind {
            FatKind::Fat12 => (total, 0),
            FatKind::Fat16 => (1 << 19, 2),
            _ => (1 << 18, 4),
        };

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let mut index = 2u32;
        while index < total {
            let count = page_slots.min(total - index);
            let buf_len = if self.kind == FatKind::Fat12 {
                (count as usize * 12).div_ceil(8) + 1
            } else {
                count as usize * slot_bytes
            };
            let pos = self.fat_offset + (index as u64 * self.kind.slot_bits() as u64) / 8;
            let mut page = vec![0u8; buf_len];
            self.device.read_at(pos, &mut page)?;
            for j in 0..count {
                let value = match self.kind {
                    FatKind::Fat12 => {
                        let bitpos = ((index + j) as usize * 12) - (index as usize * 12);
                        let at = bitpos / 8;
                        let group = u16::from_le_bytes([page[at], page[at + 1]]);
                        if (index + j) % 2 == 1 {
                            (group >> 4) as u32
                        } else {
                            (group & 0x0FFF) as u32
                        }
                    }
                    FatKind::Fat16 => {
                        let at = j as usize * 2;
                        u16::from_le_bytes([page[at], page[at + 1]]) as u32
                    }
                    _ => {
                        let at = j as usize * 4;
                        u32::from_le_bytes([page[at], page[at + 1], page[at + 2], page[at + 3]])
                    }
                };
                if value == 0 {
                    if run_len == 0 {
                        run_start = index + j;
                    }
                    run_len += 1;
                } else if run_len > 0 {
                    self.free_count += run_len;
                    self.free_runs.insert(run_start, run_len);
                    run_len = 0;
                }
            }
            index += count;
        }
        if run_len > 0 {
            self.free_count += run_len;
            self.free_runs.insert(run_start, run_len);
        }
        debug!(
            "free-space scan: {} clusters free in {} runs",
            self.free_count,
            self.free_runs.len()
        );
        Ok(())
    }

    /// Scan of the exFAT bitmap; padding bits past N are treated as
    /// allocated by trimming them off the final run.
    fn scan_bitmap(&mut self) -> Result<()> {
        let Some(bitmap) = self.bitmap.clone() else {
            return Err(Error::invalid("FAT", "no allocation bitmap attached"));
        };
        self.free_runs.clear();
        self.free_count = 0;
        let bytes = (self.clusters as u64).div_ceil(8);
        let remainder = (bytes * 8 - self.clusters as u64) as u32;

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let mut offset = 0u64;
        const PAGE: u64 = 1 << 20;
        while offset < bytes {
            let take = PAGE.min(bytes - offset) as usize;
            let mut page = vec![0u8; take];
            bitmap.read_at(&self.device, offset, &mut page)?;
            for (qi, &byte) in page.iter().enumerate() {
                let base = 2 + (offset as u32 + qi as u32) * 8;
                match byte {
                    0x00 => {
                        if run_len == 0 {
                            run_start = base;
                        }
                        run_len += 8;
                    }
                    0xFF => {
                        if run_len > 0 {
                            self.free_count += run_len;
                            self.free_runs.insert(run_start, run_len);
                            run_len = 0;
                        }
                    }
                    _ => {
                        for bit in 0..8 {
                            if byte & (1 << bit) == 0 {
                                if run_len == 0 {
                                    run_start = base + bit;
                                }
                                run_len += 1;
                            } else if run_len > 0 {
                                self.free_count += run_len;
                                self.free_runs.insert(run_start, run_len);
                                run_len = 0;
                            }
                        }
                    }
                }
            }
            offset += take as u64;
        }
        if run_len > 0 {
            self.free_count += run_len;
            self.free_runs.insert(run_start, run_len);
        }
        if remainder > 0 {
            self.free_count = self.free_count.saturating_sub(remainder);
            if let Some((&start, &len)) = self.free_runs.iter().next_back() {
                if len > remainder {
                    self.free_runs.insert(start, len - remainder);
                } else {
                    self.free_runs.remove(&start);
                }
            }
        }
        debug!(
            "bitmap scan: {} clusters free in {} runs",
            self.free_count,
            self.free_runs.len()
        );
        Ok(())
    }

    /// Pop the first free run, taking at most `count` clusters; the unused
    /// remainder goes back into the map.
    fn findfree(&mut self, count: u32) -> Option<(u32, u32)> {
        let (start, len) = self.free_runs.pop_first()?;
        if len > count {
            self.free_runs.insert(start + count, len - count);
        }
        let taken = len.min(count);
        self.free_count -= taken;
        Some((start, taken))
    }

    /// Coalesce physically adjacent free runs to a fixed point.
    pub fn compact(&mut self) {
        if !self.needs_compact {
            return;
        }
        let mut merged: BTreeMap<u32, u32> = BTreeMap::new();
        let mut iter = self.free_runs.iter();
        if let Some((&first_start, &first_len)) = iter.next() {
            let (mut cur_start, mut cur_len) = (first_start, first_len);
            for (&start, &len) in iter {
                if start == cur_start + cur_len {
                    cur_len += len;
                } else {
                    merged.insert(cur_start, cur_len);
                    cur_start = start;
                    cur_len = len;
                }
            }
            merged.insert(cur_start, cur_len);
        }
        self.free_runs = merged;
        self.needs_compact = false;
    }

    /// Obtain `count` new clusters, splicing them onto `runs` (the caller's
    /// RLE chain map, extended in place). Returns the new chain tail.
    ///
    /// On FAT volumes the new runs are always chain-linked in the table. On
    /// exFAT only the bitmap is touched while the chain stays one run; the
    /// moment it fragments, the FAT is populated for every fragment.
    pub fn alloc(&mut self, runs: &mut Vec<(u32, u32)>, mut count: u32) -> Result<u32> {
        self.ensure_scanned()?;
        self.needs_compact = true;
        self.compact();
        if self.free_count < count {
            debug!(
                "cannot allocate {count} clusters, only {} free",
                self.free_count
            );
            return Err(Error::NoSpace);
        }
        let exfat = self.kind == FatKind::ExFat;
        let mut last = 0u32;
        while count > 0 {
            let last_run = runs.last().copied();
            let Some((i, n)) = self.findfree(count) else {
                return Err(Error::NoSpace);
            };
            if !exfat {
                self.mark_run(i, n, false)?;
                if let Some((ls, ll)) = last_run {
                    self.set(ls + ll - 1, i)?;
                }
            }
            let contiguous = matches!(last_run, Some((ls, ll)) if i == ls + ll);
            if contiguous {
                if let Some(tail) = runs.last_mut() {
                    tail.1 += n;
                }
            } else {
                runs.push((i, n));
            }
            if exfat {
                self.set_bits(i, n, false)?;
                if runs.len() > 1 {
                    self.mark_run(i, n, false)?;
                    if runs.len() == 2 {
                        // The chain just fragmented: the FAT knows nothing
                        // about the first fragment yet.
                        let (fs, fl) = runs[0];
                        self.mark_run(fs, fl, false)?;
                    }
                    if let Some((ls, ll)) = last_run {
                        self.set(ls + ll - 1, i)?;
                    }
                }
            }
            last = i + n - 1;
            count -= n;
        }
        if !exfat || runs.len() > 1 {
            let eoc = self.kind.eoc();
            self.set(last, eoc)?;
        }
        self.last_free_alloc = last;
        Ok(last)
    }

    /// Zero the chain from `start` in the FAT (and clear the bitmap bits on
    /// exFAT), returning each run to the free map. A caller that already
    /// knows the chain's RLE shape passes it to skip the walk.
    pub fn free(&mut self, start: u32, runs: Option<&[(u32, u32)]>) -> Result<()> {
        if start < 2 || start > self.real_last {
            debug!("attempt to free from invalid cluster {start:#x}");
            return Ok(());
        }
        self.ensure_scanned()?;
        self.needs_compact = true;
        if let Some(runs) = runs {
            for &(run_start, run_len) in runs {
                self.free_run(run_start, run_len)?;
            }
            return Ok(());
        }
        let mut cluster = start;
        loop {
            let (length, next) = self.count_run(cluster, 0)?;
            self.free_run(cluster, length)?;
            if self.kind.is_eoc(next) {
                break;
            }
            if next < 2 || self.kind.is_bad(next) {
                return Err(Error::ChainCorruption(cluster));
            }
            cluster = next;
        }
        Ok(())
    }

    fn free_run(&mut self, start: u32, length: u32) -> Result<()> {
        self.mark_run(start, length, true)?;
        if self.kind == FatKind::ExFat {
            self.set_bits(start, length, true)?;
        }
        self.free_count += length;
        self.free_runs.insert(start, length);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    fn fat12_alloc(clusters: u32) -> Allocator {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(1 << 20));
        Allocator::new(device, FatKind::Fat12, 0, 4096, 2, clusters)
    }

    fn fat32_alloc(clusters: u32) -> Allocator {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(8 << 20));
        Allocator::new(device, FatKind::Fat32, 0, 1 << 20, 2, clusters)
    }

    #[test]
    fn fat12_get_set_shares_bytes() {
        let mut fat = fat12_alloc(100);
        fat.set(2, 0x123).unwrap();
        fat.set(3, 0xABC).unwrap();
        fat.set(4, 0x456).unwrap();
        assert_eq!(fat.get(2).unwrap(), 0x123);
        assert_eq!(fat.get(3).unwrap(), 0xABC);
        assert_eq!(fat.get(4).unwrap(), 0x456);
        // Rewriting the odd index must not clobber its even neighbours.
        fat.set(3, 0xFFF).unwrap();
        assert_eq!(fat.get(2).unwrap(), 0x123);
        assert_eq!(fat.get(4).unwrap(), 0x456);
    }

    #[test]
    fn out_of_range_reads_terminate_chains() {
        let fat = fat32_alloc(50);
        assert_eq!(fat.get(5000).unwrap(), FatKind::Fat32.eoc());
        assert_eq!(fat.get(0).unwrap(), FatKind::Fat32.eoc());
    }

    #[test]
    fn alloc_builds_linked_chain() {
        let mut fat = fat32_alloc(64);
        let mut runs = Vec::new();
        let tail = fat.alloc(&mut runs, 5).unwrap();
        assert_eq!(runs, vec![(2, 5)]);
        assert_eq!(tail, 6);
        assert_eq!(fat.get(2).unwrap(), 3);
        assert_eq!(fat.get(5).unwrap(), 6);
        assert!(FatKind::Fat32.is_eoc(fat.get(6).unwrap()));
        assert_eq!(fat.count(2).unwrap(), (5, 6));
    }

    #[test]
    fn alloc_extends_existing_chain() {
        let mut fat = fat32_alloc(64);
        let mut runs = Vec::new();
        fat.alloc(&mut runs, 3).unwrap();
        let tail = fat.alloc(&mut runs, 2).unwrap();
        // Physically contiguous: still one run.
        assert_eq!(runs, vec![(2, 5)]);
        assert_eq!(tail, 6);
        assert_eq!(fat.count(2).unwrap(), (5, 6));
    }

    #[test]
    fn free_and_realloc_keeps_accounting() {
        let mut fat = fat32_alloc(64);
        let total = fat.free_count().unwrap();
        assert_eq!(total, 64);
        let mut runs = Vec::new();
        fat.alloc(&mut runs, 10).unwrap();
        assert_eq!(fat.free_count().unwrap(), total - 10);
        fat.free(2, Some(&runs)).unwrap();
        assert_eq!(fat.free_count().unwrap(), total);
        // Every freed slot really is zero again.
        for c in 2..12 {
            assert_eq!(fat.get(c).unwrap(), 0);
        }
    }

    #[test]
    fn fragmented_alloc_links_runs() {
        let mut fat = fat32_alloc(64);
        let mut a = Vec::new();
        let mut b = Vec::new();
        fat.alloc(&mut a, 2).unwrap(); // clusters 2..3
        fat.alloc(&mut b, 2).unwrap(); // clusters 4..5
        fat.free(2, Some(&a)).unwrap(); // hole at 2..3
        let mut c = Vec::new();
        fat.alloc(&mut c, 4).unwrap(); // fills the hole, then continues at 6
        assert_eq!(c, vec![(2, 2), (6, 2)]);
        // The hole's tail links across the still-allocated chain b.
        assert_eq!(fat.get(3).unwrap(), 6);
        assert_eq!(fat.count(2).unwrap(), (4, 7));
    }

    #[test]
    fn compact_merges_adjacent_runs() {
        let mut fat = fat32_alloc(64);
        let mut runs = Vec::new();
        fat.alloc(&mut runs, 6).unwrap(); // 2..7
        fat.free(2, Some(&[(2u32, 2u32)])).unwrap();
        fat.free(4, Some(&[(4u32, 2u32)])).unwrap();
        fat.free(6, Some(&[(6u32, 2u32)])).unwrap();
        fat.compact();
        let first = fat.free_runs().unwrap().iter().next().map(|(k, v)| (*k, *v));
        assert_eq!(first, Some((2, 62)));
    }
}
