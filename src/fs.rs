//! Volume mount and the directory-table registry
//!
//! A mounted volume owns the cached device, the parsed geometry and the
//! allocator, and keeps one registry of open directory tables keyed by
//! start cluster. Opening the same directory twice hands back the same
//! table — one shared chain stream, one set of caches — so a size change
//! made through one reference is observed by every other. The registry is
//! per-volume; nothing in the engine is process-global.
//!
//! Mount order: parse the boot descriptor, bind the allocator to the FAT
//! region, instantiate the root table (for exFAT, scan it for the
//! allocation bitmap entry and bind the bitmap before any allocation can
//! happen). Close order is the reverse: directory tables flush through the
//! sector cache, then the cache flushes to the container, then the
//! container to its backing file.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use spin::RwLock;

use crate::bpb::{FatKind, VolumeDescriptor};
use crate::chain::ClusterStream;
use crate::device::BlockDevice;
use crate::dir::{DirTable, SpecialEntry};
use crate::entry::{DirEntryInfo, FileAttributes};
use crate::error::{Error, Result};
use crate::fat::{Allocator, BitmapExtents};
use crate::file::FileHandle;
use crate::split_path;

/// Everything below the directory layer: shared by tables, streams and
/// handles without back-references.
pub struct VolumeCore {
    pub device: Arc<dyn BlockDevice>,
    pub boot: Arc<VolumeDescriptor>,
    pub alloc: Arc<RwLock<Allocator>>,
    pub read_only: bool,
}

pub struct Volume {
    core: Arc<VolumeCore>,
    tables: RwLock<BTreeMap<u32, Arc<RwLock<DirTable>>>>,
    root_table: Arc<RwLock<DirTable>>,
    root_key: u32,
}

impl Volume {
    /// Mount a volume on any block device (pass the container or partition
    /// view; a write-back sector cache is layered on top here).
    pub fn mount(device: Arc<dyn BlockDevice>, read_only: bool) -> Result<Arc<Self>> {
        let cached: Arc<dyn BlockDevice> =
            Arc::new(crate::cache::SectorCache::new(device));
        let boot = Arc::new(VolumeDescriptor::parse(&cached)?);
        debug!(
            "mounting {} volume: {} clusters of {} bytes",
            boot.kind.name(),
            boot.clusters,
            boot.cluster_size
        );
        let alloc = Arc::new(RwLock::new(Allocator::new(
            cached.clone(),
            boot.kind,
            boot.fat_offset,
            boot.fat_size,
            boot.num_fats,
            boot.clusters,
        )));
        let core = Arc::new(VolumeCore {
            device: cached,
            boot: boot.clone(),
            alloc: alloc.clone(),
            read_only,
        });

        let root_stream = if boot.kind == FatKind::Fat12 || boot.kind == FatKind::Fat16 {
            ClusterStream::fixed_root(core.device.clone(), boot.clone(), alloc.clone())
        } else {
            ClusterStream::open(
                core.device.clone(),
                boot.clone(),
                alloc.clone(),
                boot.root_cluster,
                0,
                false,
                true,
                !read_only,
            )?
        };
        let root_key = root_stream.start();
        let root = Arc::new(RwLock::new(DirTable::new(
            core.clone(),
            root_stream,
            String::from("."),
        )));

        if boot.kind == FatKind::ExFat {
            // The allocation bitmap is a file; its entry lives in the root.
            let mut table = root.write();
            let specials = table.specials()?.to_vec();
            drop(table);
            let bitmap = specials.iter().find_map(|s| match s {
                SpecialEntry::Bitmap {
                    start_cluster,
                    length,
                    ..
                } => Some((*start_cluster, *length)),
                _ => None,
            });
            let Some((bitmap_start, bitmap_len)) = bitmap else {
                return Err(Error::invalid("directory entry", "no allocation bitmap"));
            };
            let extents = bitmap_extents(&alloc, &boot, bitmap_start, bitmap_len)?;
            alloc.write().attach_bitmap(extents);
        }

        let mut tables = BTreeMap::new();
        tables.insert(root_key, root.clone());
        Ok(Arc::new(Self {
            core,
            tables: RwLock::new(tables),
            root_table: root,
            root_key,
        }))
    }

    pub fn core(&self) -> &Arc<VolumeCore> {
        &self.core
    }

    pub fn boot(&self) -> &Arc<VolumeDescriptor> {
        &self.core.boot
    }

    pub fn root(self: &Arc<Self>) -> DirRef {
        DirRef {
            vol: self.clone(),
            table: self.root_table.clone(),
        }
    }

    /// (free clusters, free bytes).
    pub fn getdiskspace(&self) -> Result<(u32, u64)> {
        let mut alloc = self.core.alloc.write();
        let free = alloc.free_count()?;
        Ok((free, free as u64 * self.core.boot.cluster_size as u64))
    }

    pub fn label(self: &Arc<Self>) -> Result<Option<String>> {
        self.root().table.write().get_label()
    }

    pub fn set_label(self: &Arc<Self>, name: &str) -> Result<()> {
        if self.core.read_only {
            return Err(Error::ReadOnly);
        }
        self.root().table.write().set_label(name)
    }

    /// Push everything down to the container. Tables write through their
    /// streams, so this is the FAT32 FSInfo refresh, then the sector cache,
    /// then the backend.
    pub fn flush(&self) -> Result<()> {
        if self.core.boot.kind == FatKind::Fat32 && !self.core.read_only {
            self.write_fsinfo()?;
        }
        self.core.device.flush()
    }

    /// Refresh the FSInfo free count and next-free hint, but only when the
    /// allocator actually knows them — a mount that never allocated should
    /// not pay for a FAT scan at close.
    fn write_fsinfo(&self) -> Result<()> {
        let Some(sector) = self.core.boot.fsinfo_sector else {
            return Ok(());
        };
        let alloc = self.core.alloc.read();
        let Some(free) = alloc.free_count_hint() else {
            return Ok(());
        };
        let hint = alloc.last_free_alloc;
        drop(alloc);
        let offset = sector as u64 * self.core.boot.sector_size as u64;
        let mut raw = vec![0u8; 512];
        self.core.device.read_at(offset, &mut raw)?;
        {
            use zerocopy::FromBytes;
            let (fsinfo, _) = crate::bpb::FsInfo::mut_from_prefix(&mut raw)
                .map_err(|_| Error::invalid("boot sector", "FSInfo layout"))?;
            if !fsinfo.check_signature() {
                return Ok(());
            }
            fsinfo.free_count.set(free);
            fsinfo.nxt_free.set(hint);
        }
        self.core.device.write_at(offset, &raw)?;
        Ok(())
    }

    /// Flush and drop the table registry. The volume object stays usable
    /// for nothing but being dropped.
    pub fn close(&self) -> Result<()> {
        self.tables.write().clear();
        self.flush()
    }

    /// Registry lookup: at most one live table per directory.
    fn table_for(
        self: &Arc<Self>,
        entry: &DirEntryInfo,
        parent_path: &str,
    ) -> Result<Arc<RwLock<DirTable>>> {
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(&entry.start_cluster) {
            return Ok(table.clone());
        }
        let path = if parent_path == "." {
            entry.name.clone()
        } else {
            format!("{parent_path}/{}", entry.name)
        };
        let stream = ClusterStream::open(
            self.core.device.clone(),
            self.core.boot.clone(),
            self.core.alloc.clone(),
            entry.start_cluster,
            entry.alloc_size,
            self.core.boot.kind == FatKind::ExFat && entry.contiguous,
            true,
            !self.core.read_only,
        )?;
        let table = Arc::new(RwLock::new(DirTable::new(self.core.clone(), stream, path)));
        tables.insert(entry.start_cluster, table.clone());
        Ok(table)
    }
}

/// A reference to one directory table plus the volume behind it; all the
/// path-level operations live here.
#[derive(Clone)]
pub struct DirRef {
    vol: Arc<Volume>,
    table: Arc<RwLock<DirTable>>,
}

impl DirRef {
    pub fn path(&self) -> String {
        self.table.read().path().to_string()
    }

    pub fn listdir(&self) -> Result<Vec<String>> {
        self.table.write().listdir()
    }

    /// Decoded entries in on-disk order.
    pub fn entries(&self) -> Result<Vec<DirEntryInfo>> {
        self.table.write().list_entries()
    }

    pub fn find(&self, name: &str) -> Result<Option<DirEntryInfo>> {
        self.table.write().find(name)
    }

    pub fn getdiskspace(&self) -> Result<(u32, u64)> {
        self.vol.getdiskspace()
    }

    pub fn cluster_size(&self) -> usize {
        self.vol.core.boot.cluster_size
    }

    /// Descend a relative path of directories.
    pub fn opendir(&self, path: &str) -> Result<DirRef> {
        let mut current = self.clone();
        for component in split_path(path) {
            if component == "." {
                continue;
            }
            let entry = current
                .table
                .write()
                .find(component)?
                .ok_or_else(|| Error::NotFound(component.to_string()))?;
            if !entry.is_dir() {
                return Err(Error::NotFound(component.to_string()));
            }
            let parent_path = current.path();
            let table = current.vol.table_for(&entry, &parent_path)?;
            current = DirRef {
                vol: current.vol.clone(),
                table,
            };
        }
        Ok(current)
    }

    fn resolve_parent<'n>(&self, path: &'n str) -> Result<(DirRef, &'n str)> {
        let mut parts = split_path(path);
        let Some(name) = parts.pop() else {
            return Err(Error::BadName(path.into()));
        };
        let parent = if parts.is_empty() {
            self.clone()
        } else {
            let joined = parts.join("/");
            self.opendir(&joined)?
        };
        Ok((parent, name))
    }

    /// Open an existing file for reading (and writing, on a writable
    /// volume).
    pub fn open(&self, path: &str) -> Result<FileHandle> {
        let (dir, name) = self.resolve_parent(path)?;
        let entry = dir
            .table
            .write()
            .find(name)?
            .ok_or_else(|| Error::NotFound(path.into()))?;
        if entry.is_dir() || entry.attributes.contains(FileAttributes::VOLUME_ID) {
            return Err(Error::NotFound(path.into()));
        }
        let core = &dir.vol.core;
        // The chain must cover the whole allocation, which may exceed the
        // declared size; the stream's own length is clipped afterwards.
        let mut stream = ClusterStream::open(
            core.device.clone(),
            core.boot.clone(),
            core.alloc.clone(),
            entry.start_cluster,
            entry.alloc_size.max(entry.size),
            core.boot.kind == FatKind::ExFat && entry.contiguous,
            false,
            !core.read_only,
        )?;
        stream.set_filesize(entry.size);
        Ok(FileHandle::new(
            stream,
            entry,
            dir.table.clone(),
            core.read_only,
        ))
    }

    /// Create (or replace) a file, optionally pre-allocating clusters so
    /// the first write lands contiguously.
    pub fn create(&self, path: &str, prealloc_clusters: u32) -> Result<FileHandle> {
        let (dir, name) = self.resolve_parent(path)?;
        let core = &dir.vol.core;
        if core.read_only {
            return Err(Error::ReadOnly);
        }
        if let Some(existing) = dir.table.write().find(name)? {
            // A directory in the way fails before anything is allocated.
            if existing.is_dir() {
                return Err(Error::AlreadyExists(name.into()));
            }
        }
        let mut stream = ClusterStream::open(
            core.device.clone(),
            core.boot.clone(),
            core.alloc.clone(),
            0,
            0,
            false,
            false,
            true,
        )?;
        if prealloc_clusters > 0 {
            stream.grow(prealloc_clusters)?;
        }
        let entry = dir.table.write().create_entry(
            name,
            FileAttributes::ARCHIVE,
            stream.start(),
            0,
            if core.boot.kind == FatKind::ExFat {
                stream.size()
            } else {
                0
            },
            stream.is_contiguous() && stream.start() != 0,
        )?;
        Ok(FileHandle::new(stream, entry, dir.table.clone(), false))
    }

    /// Create a directory: one pre-allocated, zeroed cluster, with `.` and
    /// `..` entries on classic FAT, registered in the volume's registry.
    pub fn mkdir(&self, path: &str) -> Result<DirRef> {
        let (dir, name) = self.resolve_parent(path)?;
        let core = &dir.vol.core;
        if core.read_only {
            return Err(Error::ReadOnly);
        }
        if dir.table.write().exists(name)? {
            return Err(Error::AlreadyExists(name.into()));
        }
        let exfat = core.boot.kind == FatKind::ExFat;
        let cluster_size = core.boot.cluster_size;

        let mut stream = ClusterStream::open(
            core.device.clone(),
            core.boot.clone(),
            core.alloc.clone(),
            0,
            0,
            false,
            true,
            true,
        )?;
        stream.grow(1)?;
        stream.write_at(0, &vec![0u8; cluster_size])?;
        let start = stream.start();

        if !exfat {
            // ".." points at 0 when the parent is the root, even on FAT32.
            let parent_start = if dir.table.read().start() == dir.vol.root_key {
                0
            } else {
                dir.table.read().start()
            };
            let mut dot = [b' '; 11];
            dot[0] = b'.';
            let mut dotdot = [b' '; 11];
            dotdot[0] = b'.';
            dotdot[1] = b'.';
            write_dot_entry(&mut stream, 0, dot, start)?;
            write_dot_entry(&mut stream, 32, dotdot, parent_start)?;
        }

        // exFAT directories are created FAT-chained (no contiguity flag),
        // so the table stays walkable however much it grows later.
        let size = if exfat { cluster_size as u64 } else { 0 };
        let entry = dir.table.write().create_entry(
            name,
            FileAttributes::DIRECTORY,
            start,
            size,
            if exfat { cluster_size as u64 } else { 0 },
            false,
        )?;
        let parent_path = dir.path();
        let table = dir.vol.table_for(&entry, &parent_path)?;
        Ok(DirRef {
            vol: dir.vol.clone(),
            table,
        })
    }

    /// Erase a file, or an empty directory.
    pub fn erase(&self, path: &str) -> Result<()> {
        let (dir, name) = self.resolve_parent(path)?;
        if dir.vol.core.read_only {
            return Err(Error::ReadOnly);
        }
        let entry = dir
            .table
            .write()
            .find(name)?
            .ok_or_else(|| Error::NotFound(path.into()))?;
        if entry.is_dir() {
            let child = dir.opendir(name)?;
            let leftovers = child
                .entries()?
                .iter()
                .filter(|e| e.name != "." && e.name != "..")
                .count();
            if leftovers > 0 {
                return Err(Error::NotEmpty(name.into()));
            }
            dir.vol.tables.write().remove(&entry.start_cluster);
        }
        let result = dir.table.write().erase_entry(&entry);
        result
    }

    /// Recursively erase a directory tree (or, with `None`, this
    /// directory's contents).
    pub fn rmtree(&self, path: Option<&str>) -> Result<()> {
        let target = match path {
            Some(p) => self.opendir(p)?,
            None => self.clone(),
        };
        for entry in target.entries()? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.attributes.contains(FileAttributes::VOLUME_ID) {
                continue;
            }
            if entry.is_dir() {
                target.rmtree(Some(&entry.name))?;
            } else {
                target.erase(&entry.name)?;
            }
        }
        if let Some(p) = path {
            self.erase(p)?;
        }
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if self.vol.core.read_only {
            return Err(Error::ReadOnly);
        }
        let renamed = self.table.write().rename_entry(old, new)?;
        // A renamed directory keeps its table; the registry key (start
        // cluster) does not change.
        let _ = renamed;
        Ok(())
    }

    pub fn attrib(&self, name: &str, ops: &[&str]) -> Result<FileAttributes> {
        if self.vol.core.read_only {
            return Err(Error::ReadOnly);
        }
        self.table.write().attrib(name, ops)
    }

    /// Depth-first traversal: (path, directory names, file names) per
    /// visited directory, in on-disk order.
    pub fn walk(&self) -> Result<Vec<(String, Vec<String>, Vec<String>)>> {
        let mut out = Vec::new();
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in self.entries()? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.attributes.contains(FileAttributes::VOLUME_ID) {
                continue;
            }
            if entry.is_dir() {
                dirs.push(entry.name.clone());
            } else {
                files.push(entry.name.clone());
            }
        }
        out.push((self.path(), dirs.clone(), files));
        for sub in dirs {
            out.extend(self.opendir(&sub)?.walk()?);
        }
        Ok(out)
    }

    /// Stable-sort the table's entries (alphabetically, or by `cmp`),
    /// optionally shrinking the chain.
    pub fn sort(
        &self,
        cmp: Option<&dyn Fn(&DirEntryInfo, &DirEntryInfo) -> core::cmp::Ordering>,
        shrink: bool,
    ) -> Result<(usize, usize)> {
        if self.vol.core.read_only {
            return Err(Error::ReadOnly);
        }
        self.table.write().sort_entries(cmp, shrink)
    }

    /// Zero every free cluster on the volume.
    pub fn wipefreespace(&self) -> Result<()> {
        if self.vol.core.read_only {
            return Err(Error::ReadOnly);
        }
        self.table.write().wipe_free_space()
    }
}

/// Walk the bitmap file's own FAT chain and turn it into byte extents the
/// allocator can address directly.
fn bitmap_extents(
    alloc: &Arc<RwLock<Allocator>>,
    boot: &Arc<VolumeDescriptor>,
    start: u32,
    len: u64,
) -> Result<BitmapExtents> {
    let fat = alloc.read();
    let cluster = boot.cluster_size as u64;
    let mut extents = Vec::new();
    let mut remaining = len;
    let mut cursor = start;
    while remaining > 0 {
        let (run_len, next) = fat.count_run(cursor, 0)?;
        let bytes = (run_len as u64 * cluster).min(remaining);
        extents.push((boot.cluster_to_offset(cursor), bytes));
        remaining -= bytes;
        if remaining == 0 || fat.kind().is_eoc(next) {
            break;
        }
        if next < 2 {
            return Err(Error::ChainCorruption(cursor));
        }
        cursor = next;
    }
    Ok(BitmapExtents { extents, len })
}

fn write_dot_entry(
    stream: &mut ClusterStream,
    offset: u64,
    raw_name: [u8; 11],
    start: u32,
) -> Result<()> {
    use zerocopy::{FromBytes, IntoBytes};
    let (cdate, ctime) = crate::entry::dos_now();
    let mut sde = crate::entry::ShortDirEntry::read_from_bytes(&[0u8; 32])
        .map_err(|_| Error::invalid("directory entry", "layout"))?;
    sde.name = raw_name;
    sde.attr = FileAttributes::DIRECTORY.bits() as u8;
    sde.crt_time.set(ctime);
    sde.crt_date.set(cdate);
    sde.wrt_time.set(ctime);
    sde.wrt_date.set(cdate);
    sde.lst_acc_date.set(cdate);
    sde.set_first_cluster(start);
    stream.write_at(offset, sde.as_bytes())?;
    Ok(())
}
