//! Cluster chain stream
//!
//! Opens a cluster chain (or the FAT12/16 fixed root region) like a plain
//! seekable file. The chain's physical shape is held as an RLE run map in
//! chain order; reads and writes split at physical run boundaries so each
//! piece is one contiguous device transfer, with no FAT re-reads on the hot
//! path.
//!
//! Two lengths live here: the allocated length (`size`, always a whole
//! number of clusters) and the declared file size (`filesize`), which may be
//! smaller since FAT permits over-allocation. Writing past the allocated end
//! obtains clusters from the allocator and splices them onto the run map;
//! truncation frees tail runs and re-marks the new chain tail.
//!
//! An exFAT chain that is one single run carries the no-FAT-chain flag and
//! never consults the FAT; the moment an extension fragments it, the whole
//! chain is linked in the FAT and the flag drops. Directory chains zero
//! freshly allocated space, because table scanners depend on a zero first
//! byte to stop.

use std::sync::Arc;

use log::debug;
use spin::RwLock;

use crate::bpb::{FatKind, VolumeDescriptor};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::fat::Allocator;

enum Backing {
    /// A FAT cluster chain.
    Chain {
        start: u32,
        /// (first cluster, length) per physically contiguous run, in chain
        /// order.
        runs: Vec<(u32, u32)>,
        /// exFAT: single-run chain not recorded in the FAT.
        no_fat_chain: bool,
    },
    /// The FAT12/16 root directory region: fixed place, fixed size.
    Fixed { offset: u64 },
}

pub struct ClusterStream {
    device: Arc<dyn BlockDevice>,
    boot: Arc<VolumeDescriptor>,
    alloc: Arc<RwLock<Allocator>>,
    backing: Backing,
    /// Allocated bytes (clusters * cluster size), or the fixed region size.
    size: u64,
    /// Declared data length; `<= size`.
    filesize: u64,
    pos: u64,
    is_dir: bool,
    writable: bool,
}

impl ClusterStream {
    /// Open a chain at `start`. For an exFAT stream with the contiguous
    /// flag, `no_fat_chain` skips the FAT walk and the run map is derived
    /// from `filesize` alone.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        boot: Arc<VolumeDescriptor>,
        alloc: Arc<RwLock<Allocator>>,
        start: u32,
        filesize: u64,
        no_fat_chain: bool,
        is_dir: bool,
        writable: bool,
    ) -> Result<Self> {
        let cluster = boot.cluster_size as u64;
        let mut runs = Vec::new();
        let mut size = 0u64;
        if start >= 2 {
            if no_fat_chain {
                let count = filesize.div_ceil(cluster).max(1) as u32;
                runs.push((start, count));
                size = count as u64 * cluster;
            } else {
                let fat = alloc.read();
                let mut cursor = start;
                loop {
                    let (length, next) = fat.count_run(cursor, 0)?;
                    runs.push((cursor, length));
                    size += length as u64 * cluster;
                    if fat.kind().is_eoc(next) {
                        break;
                    }
                    if next < 2 {
                        return Err(Error::ChainCorruption(cursor));
                    }
                    cursor = next;
                    if runs.len() as u64 > fat.clusters() as u64 {
                        return Err(Error::ChainCorruption(start));
                    }
                }
            }
        }
        Ok(Self {
            device,
            boot,
            alloc,
            backing: Backing::Chain {
                start,
                runs,
                no_fat_chain,
            },
            size,
            // Directories are sized by their chain; files keep the declared
            // size, which may lag the allocation.
            filesize: if is_dir { size } else { filesize.min(size) },
            pos: 0,
            is_dir,
            writable,
        })
    }

    /// The FAT12/16 root directory window.
    pub fn fixed_root(
        device: Arc<dyn BlockDevice>,
        boot: Arc<VolumeDescriptor>,
        alloc: Arc<RwLock<Allocator>>,
    ) -> Self {
        let offset = boot.root_offset;
        let size = (boot.root_entries * 32) as u64;
        Self {
            device,
            boot,
            alloc,
            backing: Backing::Fixed { offset },
            size,
            filesize: size,
            pos: 0,
            is_dir: true,
            writable: true,
        }
    }

    pub fn start(&self) -> u32 {
        match &self.backing {
            Backing::Chain { start, .. } => *start,
            Backing::Fixed { .. } => 0,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.backing, Backing::Fixed { .. })
    }

    /// True while the chain is at most one physical run.
    pub fn is_contiguous(&self) -> bool {
        match &self.backing {
            Backing::Chain { runs, .. } => runs.len() <= 1,
            Backing::Fixed { .. } => true,
        }
    }

    pub fn no_fat_chain(&self) -> bool {
        match &self.backing {
            Backing::Chain { no_fat_chain, .. } => *no_fat_chain,
            Backing::Fixed { .. } => false,
        }
    }

    pub fn runs(&self) -> &[(u32, u32)] {
        match &self.backing {
            Backing::Chain { runs, .. } => runs,
            Backing::Fixed { .. } => &[],
        }
    }

    /// Allocated length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    pub fn set_filesize(&mut self, filesize: u64) {
        self.filesize = filesize;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Map a byte position to (device offset, bytes to the end of that
    /// physical run).
    fn locate(&self, pos: u64) -> Option<(u64, u64)> {
        match &self.backing {
            Backing::Fixed { offset } => {
                if pos >= self.size {
                    return None;
                }
                Some((offset + pos, self.size - pos))
            }
            Backing::Chain { runs, .. } => {
                let cluster = self.boot.cluster_size as u64;
                let vcn = pos / cluster;
                let vco = pos % cluster;
                let mut base = 0u64;
                for &(run_start, run_len) in runs {
                    if vcn < base + run_len as u64 {
                        let into_run = vcn - base;
                        let disk = self.boot.cluster_to_offset(run_start)
                            + into_run * cluster
                            + vco;
                        let left = (run_len as u64 - into_run) * cluster - vco;
                        return Some((disk, left));
                    }
                    base += run_len as u64;
                }
                None
            }
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let end = self.filesize.min(self.size);
        if self.pos >= end {
            return Ok(0);
        }
        let mut todo = (buf.len() as u64).min(end - self.pos) as usize;
        let mut done = 0usize;
        while todo > 0 {
            let Some((disk, left)) = self.locate(self.pos) else {
                break;
            };
            let take = (todo as u64).min(left) as usize;
            self.device.read_at(disk, &mut buf[done..done + take])?;
            done += take;
            todo -= take;
            self.pos += take as u64;
        }
        Ok(done)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let mut newly_allocated = false;
        let write_end = self.pos + buf.len() as u64;
        if write_end > self.size {
            if self.is_fixed() {
                return Err(Error::NoSpace);
            }
            let cluster = self.boot.cluster_size as u64;
            let need = write_end.div_ceil(cluster) - self.size / cluster;
            self.grow(need as u32)?;
            newly_allocated = true;
        }
        let mut done = 0usize;
        while done < buf.len() {
            let Some((disk, left)) = self.locate(self.pos) else {
                return Err(Error::ChainCorruption(self.start()));
            };
            let take = ((buf.len() - done) as u64).min(left) as usize;
            self.device.write_at(disk, &buf[done..done + take])?;
            done += take;
            self.pos += take as u64;
        }
        self.filesize = self.filesize.max(self.pos);
        // Table scanners stop at a zero byte, so a directory's fresh
        // allocation tip must read as zeros. Classic FAT blanks the tip for
        // any file; exFAT limits that to directories.
        let blank_tip = self.boot.kind != FatKind::ExFat || self.is_dir;
        if newly_allocated && blank_tip && self.pos < self.size {
            let zeros = vec![0u8; (self.size - self.pos) as usize];
            let save = self.pos;
            let mut off = 0usize;
            while off < zeros.len() {
                let Some((disk, left)) = self.locate(save + off as u64) else {
                    break;
                };
                let take = ((zeros.len() - off) as u64).min(left) as usize;
                self.device.write_at(disk, &zeros[off..off + take])?;
                off += take;
            }
        }
        Ok(done)
    }

    /// Positioned read, leaving the cursor after the transfer.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.seek(offset);
        self.read(buf)
    }

    /// Positioned write, leaving the cursor after the transfer.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.seek(offset);
        self.write(buf)
    }

    /// Grow by `count` clusters, keeping the run map and exFAT FAT-linkage
    /// rules coherent.
    pub fn grow(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let cluster = self.boot.cluster_size as u64;
        match &mut self.backing {
            Backing::Fixed { .. } => Err(Error::NoSpace),
            Backing::Chain {
                start,
                runs,
                no_fat_chain,
            } => {
                let mut alloc = self.alloc.write();
                alloc.alloc(runs, count)?;
                if *start == 0 {
                    *start = runs[0].0;
                }
                if self.boot.kind == FatKind::ExFat && self.is_dir {
                    // Directory tables always keep a FAT chain, contiguous
                    // or not, so they stay walkable after growth.
                    let mut prev_tail: Option<u32> = None;
                    for &(run_start, run_len) in runs.iter() {
                        alloc.mark_run(run_start, run_len, false)?;
                        if let Some(tail) = prev_tail {
                            alloc.set(tail, run_start)?;
                        }
                        prev_tail = Some(run_start + run_len - 1);
                    }
                    *no_fat_chain = false;
                } else {
                    *no_fat_chain = runs.len() == 1;
                }
                self.size += count as u64 * cluster;
                debug!(
                    "chain {:#x}: grew by {count} clusters to {} bytes in {} runs",
                    *start,
                    self.size,
                    runs.len()
                );
                Ok(())
            }
        }
    }

    /// Ensure at least `bytes` are allocated (used by truncation-to-grow
    /// and pre-allocation on create).
    pub fn reserve(&mut self, bytes: u64) -> Result<()> {
        if bytes <= self.size {
            return Ok(());
        }
        let cluster = self.boot.cluster_size as u64;
        let need = bytes.div_ceil(cluster) - self.size / cluster;
        self.grow(need as u32)
    }

    /// Truncate the chain to the cluster containing the current position,
    /// freeing everything beyond it. The declared size becomes the current
    /// position.
    pub fn truncate(&mut self) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let cluster = self.boot.cluster_size as u64;
        let exfat = self.boot.kind == FatKind::ExFat;
        match &mut self.backing {
            Backing::Fixed { .. } => Ok(()),
            Backing::Chain {
                runs, no_fat_chain, ..
            } => {
                let keep_vcn = self.pos / cluster;
                let total = self.size / cluster;
                if total == 0 {
                    self.filesize = self.pos;
                    return Ok(());
                }
                let mut to_free = total - keep_vcn - 1;
                self.filesize = self.pos;
                if to_free == 0 {
                    return Ok(());
                }
                self.size = (keep_vcn + 1) * cluster;
                let mut alloc = self.alloc.write();
                let eoc = alloc.kind().eoc();
                while to_free > 0 {
                    let Some((run_start, run_len)) = runs.pop() else {
                        break;
                    };
                    if to_free >= run_len as u64 {
                        alloc.free(run_start, Some(&[(run_start, run_len)]))?;
                        if to_free == run_len as u64 && (!exfat || runs.len() > 1) {
                            if let Some(&(ks, kl)) = runs.last() {
                                alloc.set(ks + kl - 1, eoc)?;
                            }
                        }
                        to_free -= run_len as u64;
                    } else {
                        let cut = to_free as u32;
                        alloc
                            .free(run_start + run_len - cut, Some(&[(run_start + run_len - cut, cut)]))?;
                        if !runs.is_empty() || !exfat {
                            alloc.set(run_start + run_len - cut - 1, eoc)?;
                        }
                        runs.push((run_start, run_len - cut));
                        to_free = 0;
                    }
                }
                *no_fat_chain = runs.len() == 1;
                Ok(())
            }
        }
    }

    /// Free the whole chain and forget it (used when erasing entries).
    pub fn release(&mut self) -> Result<()> {
        match &mut self.backing {
            Backing::Fixed { .. } => Ok(()),
            Backing::Chain { start, runs, .. } => {
                if *start >= 2 && !runs.is_empty() {
                    let mut alloc = self.alloc.write();
                    let pieces: Vec<(u32, u32)> = runs.clone();
                    alloc.free(*start, Some(&pieces))?;
                }
                *start = 0;
                runs.clear();
                self.size = 0;
                self.filesize = 0;
                self.pos = 0;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    fn test_volume() -> (Arc<dyn BlockDevice>, Arc<VolumeDescriptor>, Arc<RwLock<Allocator>>) {
        // Hand-built FAT32-ish geometry: 512-byte sectors, 2 sectors per
        // cluster, FAT at 4 KiB, data at 1 MiB.
        let device: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(8 << 20));
        let boot = Arc::new(VolumeDescriptor {
            kind: FatKind::Fat32,
            sector_size: 512,
            sectors_per_cluster: 2,
            cluster_size: 1024,
            reserved_sectors: 8,
            num_fats: 2,
            fat_offset: 4096,
            fat_size: 128 * 1024,
            root_offset: 0,
            root_entries: 0,
            root_cluster: 2,
            data_offset: 1 << 20,
            total_sectors: (8 << 20) / 512,
            clusters: 1024,
            media: 0xF8,
            serial: 0,
            label: [0x20; 11],
            fsinfo_sector: Some(1),
            backup_boot_sector: Some(6),
        });
        let alloc = Arc::new(RwLock::new(Allocator::new(
            device.clone(),
            FatKind::Fat32,
            boot.fat_offset,
            boot.fat_size,
            2,
            boot.clusters,
        )));
        (device, boot, alloc)
    }

    #[test]
    fn write_extends_and_reads_back() {
        let (device, boot, alloc) = test_volume();
        let mut stream =
            ClusterStream::open(device, boot, alloc, 0, 0, false, false, true).unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(stream.write(&data).unwrap(), data.len());
        assert_eq!(stream.filesize(), 5000);
        assert_eq!(stream.size(), 5120); // five 1 KiB clusters
        let mut back = vec![0u8; 5000];
        stream.seek(0);
        assert_eq!(stream.read(&mut back).unwrap(), 5000);
        assert_eq!(back, data);
    }

    #[test]
    fn sparse_seek_then_write() {
        let (device, boot, alloc) = test_volume();
        let mut stream =
            ClusterStream::open(device, boot, alloc, 0, 0, false, false, true).unwrap();
        stream.seek(3000);
        stream.write(b"tail").unwrap();
        assert_eq!(stream.filesize(), 3004);
        let mut buf = [0u8; 4];
        stream.read_at(3000, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn truncate_frees_tail_clusters() {
        let (device, boot, alloc) = test_volume();
        let mut stream = ClusterStream::open(
            device,
            boot,
            alloc.clone(),
            0,
            0,
            false,
            false,
            true,
        )
        .unwrap();
        stream.write(&vec![0xABu8; 8 * 1024]).unwrap();
        let free_before = alloc.write().free_count().unwrap();
        stream.seek(512);
        stream.truncate().unwrap();
        assert_eq!(stream.filesize(), 512);
        assert_eq!(stream.size(), 1024);
        assert_eq!(alloc.write().free_count().unwrap(), free_before + 7);
        // The surviving cluster is now the chain tail.
        let start = stream.start();
        let fat = alloc.read();
        assert!(fat.kind().is_eoc(fat.get(start).unwrap()));
    }

    #[test]
    fn reopen_walks_the_fat() {
        let (device, boot, alloc) = test_volume();
        let start;
        {
            let mut stream = ClusterStream::open(
                device.clone(),
                boot.clone(),
                alloc.clone(),
                0,
                0,
                false,
                false,
                true,
            )
            .unwrap();
            stream.write(&vec![7u8; 3 * 1024 + 10]).unwrap();
            start = stream.start();
        }
        let mut reopened =
            ClusterStream::open(device, boot, alloc, start, 3 * 1024 + 10, false, false, true)
                .unwrap();
        assert_eq!(reopened.size(), 4 * 1024);
        let mut buf = vec![0u8; 3 * 1024 + 10];
        assert_eq!(reopened.read(&mut buf).unwrap(), buf.len());
        assert!(buf.iter().all(|&b| b == 7));
    }
}
