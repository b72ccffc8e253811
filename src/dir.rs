//! Directory table machinery
//!
//! A directory is a cluster chain (or, for the FAT12/16 root, a fixed
//! region) holding 32-byte slots. On first access the table is scanned
//! once, filling two caches kept coherent by every mutation:
//!
//! - `names`: lowercased name -> decoded entry, covering both the long and
//!   the short name space, so any lookup is one map probe;
//! - `slots_map`: byte offset -> free slot-run length, coalescing erased
//!   groups, with one final run for the table's unallocated capacity.
//!
//! Slot groups are written atomically: LFN slots in descending order
//! immediately followed by their short entry, or a complete exFAT entry set
//! sealed by its checksum. Erasing overwrites each slot's marker byte and
//! returns the run to `slots_map`; the table never moves live groups except
//! in `sort`.
//!
//! Cluster-backed tables grow on demand through the chain stream (which
//! zero-fills fresh directory clusters, preserving the zero terminator) up
//! to the 2 MiB / 65536-slot limit; the fixed root cannot grow.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::bpb::FatKind;
use crate::chain::ClusterStream;
use crate::entry::{
    self, exfat_set_checksum, DirEntryInfo, ExfatBitmapEntry, ExfatFileEntry, ExfatLabelEntry,
    ExfatStreamExt, ExfatUpcaseEntry, FileAttributes, LongDirEntry, ShortDirEntry,
    ATTR_LONG_NAME, DIR_ENTRY_FREE, DIR_ENTRY_LAST, EXFAT_FLAG_ALLOC_POSSIBLE,
    EXFAT_FLAG_CONTIGUOUS, EXFAT_TYPE_BITMAP, EXFAT_TYPE_FILE, EXFAT_TYPE_LABEL,
    EXFAT_TYPE_NAME, EXFAT_TYPE_STREAM, EXFAT_TYPE_UPCASE, LAST_LONG_ENTRY,
};
use crate::error::{Error, Result};
use crate::fs::VolumeCore;
use crate::{DIRENT_SIZE, PATH_MAX};

/// A cluster-backed table cannot outgrow 2 MiB (65536 slots).
pub const MAX_TABLE_BYTES: u64 = 2 << 20;

/// Root-table entries that are not files: the exFAT metadata slots and the
/// FAT volume-label slot.
#[derive(Debug, Clone)]
pub enum SpecialEntry {
    Label {
        name: String,
        slot_offset: u64,
    },
    Bitmap {
        start_cluster: u32,
        length: u64,
        slot_offset: u64,
    },
    Upcase {
        start_cluster: u32,
        length: u64,
        slot_offset: u64,
    },
    /// Anything else that must be preserved verbatim (volume GUID, ...).
    Opaque {
        slot_offset: u64,
        slots: usize,
    },
}

pub struct DirTable {
    core: Arc<VolumeCore>,
    pub(crate) stream: ClusterStream,
    /// Start cluster; 0 identifies the fixed FAT12/16 root.
    start: u32,
    path: String,
    names: BTreeMap<String, DirEntryInfo>,
    slots_map: BTreeMap<u64, u32>,
    specials: Vec<SpecialEntry>,
    scanned: bool,
    needs_compact: bool,
    /// (start cluster, validity flag) per open file handle; erase flips the
    /// flag instead of reaching into the handle.
    watchers: Vec<(u32, Weak<AtomicBool>)>,
}

impl DirTable {
    pub fn new(core: Arc<VolumeCore>, stream: ClusterStream, path: String) -> Self {
        let start = stream.start();
        Self {
            core,
            stream,
            start,
            path,
            names: BTreeMap::new(),
            slots_map: BTreeMap::new(),
            specials: Vec::new(),
            scanned: false,
            needs_compact: false,
            watchers: Vec::new(),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn specials(&mut self) -> Result<&[SpecialEntry]> {
        self.ensure_scanned()?;
        Ok(&self.specials)
    }

    fn capacity(&self) -> u64 {
        if self.stream.is_fixed() {
            self.stream.size()
        } else {
            MAX_TABLE_BYTES
        }
    }

    // ---- scanning ----

    fn ensure_scanned(&mut self) -> Result<()> {
        if self.scanned {
            return Ok(());
        }
        let (entries, specials, free_map) = self.scan()?;
        self.names.clear();
        for info in entries {
            if let Some(alias) = &info.short_name {
                self.names.insert(alias.to_lowercase(), info.clone());
            }
            self.names.insert(info.key(), info);
        }
        self.specials = specials;
        self.slots_map = free_map;
        self.scanned = true;
        self.needs_compact = true;
        self.compact_slots();
        Ok(())
    }

    /// One pass over the table: decoded entries in on-disk order, special
    /// slots, and the free-slot map (including the final unallocated run).
    fn scan(&mut self) -> Result<(Vec<DirEntryInfo>, Vec<SpecialEntry>, BTreeMap<u64, u32>)> {
        let mut entries = Vec::new();
        let mut specials = Vec::new();
        let mut free_map: BTreeMap<u64, u32> = BTreeMap::new();
        let mut pos = 0u64;
        let mut free_start = 0u64;
        let mut free_len = 0u32;
        let mut slot = [0u8; DIRENT_SIZE];
        let exfat = self.core.boot.kind == FatKind::ExFat;

        // Pending LFN accumulation (classic FAT only).
        let mut lfn_units: Vec<u16> = Vec::new();
        let mut lfn_begin = 0u64;
        let mut lfn_checksum = 0u8;

        loop {
            let got = self.stream.read_at(pos, &mut slot)?;
            if got != DIRENT_SIZE {
                break;
            }
            let first = slot[0];
            if first == DIR_ENTRY_LAST {
                break;
            }
            let erased = if exfat { first & 0x80 == 0 } else { first == DIR_ENTRY_FREE };
            if erased {
                if free_len == 0 {
                    free_start = pos;
                }
                free_len += 1;
                pos += DIRENT_SIZE as u64;
                lfn_units.clear();
                continue;
            }
            if free_len > 0 {
                free_map.insert(free_start, free_len);
                free_len = 0;
            }

            if exfat {
                let consumed = self.scan_exfat_group(
                    pos,
                    &slot,
                    &mut entries,
                    &mut specials,
                )?;
                pos += consumed as u64 * DIRENT_SIZE as u64;
                continue;
            }

            // Classic FAT slot.
            if slot[0x0B] == ATTR_LONG_NAME {
                let Ok((lde, _)) = LongDirEntry::read_from_prefix(&slot[..]) else {
                    pos += DIRENT_SIZE as u64;
                    continue;
                };
                if lde.ord & LAST_LONG_ENTRY != 0 {
                    lfn_units.clear();
                    lfn_begin = pos;
                    lfn_checksum = lde.chksum;
                }
                // Slots appear in descending order; prepend each part.
                let mut units = lde.name_units().to_vec();
                units.extend_from_slice(&lfn_units);
                lfn_units = units;
                pos += DIRENT_SIZE as u64;
                continue;
            }

            let Ok((sde, _)) = ShortDirEntry::read_from_prefix(&slot[..]) else {
                pos += DIRENT_SIZE as u64;
                continue;
            };
            if sde.is_label() {
                specials.push(SpecialEntry::Label {
                    name: sde
                        .name
                        .iter()
                        .map(|&c| c as char)
                        .collect::<String>()
                        .trim_end()
                        .to_string(),
                    slot_offset: pos,
                });
                lfn_units.clear();
                pos += DIRENT_SIZE as u64;
                continue;
            }
            let long_name = if !lfn_units.is_empty() && lfn_checksum == sde.checksum() {
                let units: Vec<u16> = lfn_units
                    .iter()
                    .copied()
                    .take_while(|&u| u != 0 && u != 0xFFFF)
                    .collect();
                char::decode_utf16(units)
                    .collect::<core::result::Result<String, _>>()
                    .ok()
            } else {
                if !lfn_units.is_empty() {
                    warn!("{}: orphan LFN slots before {:#x}", self.path, pos);
                }
                None
            };
            let slot_offset = if long_name.is_some() { lfn_begin } else { pos };
            let slot_count = ((pos - slot_offset) / DIRENT_SIZE as u64 + 1) as usize;
            let short = sde.short_name();
            entries.push(DirEntryInfo {
                name: long_name.clone().unwrap_or_else(|| short.clone()),
                short_name: long_name.is_some().then_some(short),
                attributes: FileAttributes::from_bits_truncate(sde.attr as u16),
                start_cluster: sde.first_cluster(),
                size: sde.file_size.get() as u64,
                alloc_size: sde.file_size.get() as u64,
                contiguous: false,
                slot_offset,
                slot_count,
            });
            lfn_units.clear();
            pos += DIRENT_SIZE as u64;
        }

        // The rest of the table, up to its growth limit, is one free run.
        let tail_slots = (self.capacity().saturating_sub(pos)) / DIRENT_SIZE as u64;
        if free_len > 0 {
            // Merge the trailing erased run into the unallocated tail.
            free_map.insert(free_start, free_len + tail_slots as u32);
        } else if tail_slots > 0 {
            free_map.insert(pos, tail_slots as u32);
        }
        Ok((entries, specials, free_map))
    }

    /// Decode one exFAT entry set starting with the primary slot already in
    /// `first_slot`. Returns how many slots the group spans.
    fn scan_exfat_group(
        &mut self,
        pos: u64,
        first_slot: &[u8; DIRENT_SIZE],
        entries: &mut Vec<DirEntryInfo>,
        specials: &mut Vec<SpecialEntry>,
    ) -> Result<usize> {
        let ent_type = first_slot[0];
        match ent_type {
            EXFAT_TYPE_BITMAP => {
                if let Ok((e, _)) = ExfatBitmapEntry::read_from_prefix(&first_slot[..]) {
                    specials.push(SpecialEntry::Bitmap {
                        start_cluster: e.first_cluster.get(),
                        length: e.data_length.get(),
                        slot_offset: pos,
                    });
                }
                Ok(1)
            }
            EXFAT_TYPE_UPCASE => {
                if let Ok((e, _)) = ExfatUpcaseEntry::read_from_prefix(&first_slot[..]) {
                    specials.push(SpecialEntry::Upcase {
                        start_cluster: e.first_cluster.get(),
                        length: e.data_length.get(),
                        slot_offset: pos,
                    });
                }
                Ok(1)
            }
            EXFAT_TYPE_LABEL => {
                if let Ok((e, _)) = ExfatLabelEntry::read_from_prefix(&first_slot[..]) {
                    let units: Vec<u16> = e.label[..e.char_count.min(11) as usize]
                        .iter()
                        .map(|u| u.get())
                        .collect();
                    let name = char::decode_utf16(units)
                        .collect::<core::result::Result<String, _>>()
                        .unwrap_or_default();
                    specials.push(SpecialEntry::Label {
                        name,
                        slot_offset: pos,
                    });
                }
                Ok(1)
            }
            EXFAT_TYPE_FILE => {
                let Ok((file, _)) = ExfatFileEntry::read_from_prefix(&first_slot[..]) else {
                    return Ok(1);
                };
                let secondaries = file.secondary_count as usize;
                let mut set = vec![0u8; (1 + secondaries) * DIRENT_SIZE];
                set[..DIRENT_SIZE].copy_from_slice(first_slot);
                let got = self
                    .stream
                    .read_at(pos + DIRENT_SIZE as u64, &mut set[DIRENT_SIZE..])?;
                if got != secondaries * DIRENT_SIZE {
                    warn!("{}: truncated entry set at {pos:#x}", self.path);
                    return Ok(1 + got / DIRENT_SIZE);
                }
                let stored = u16::from_le_bytes([set[2], set[3]]);
                if stored != exfat_set_checksum(&set) {
                    warn!("{}: entry set checksum mismatch at {pos:#x}", self.path);
                }
                let Ok((stream_ext, _)) = ExfatStreamExt::read_from_prefix(&set[DIRENT_SIZE..])
                else {
                    return Ok(1 + secondaries);
                };
                if stream_ext.ent_type != EXFAT_TYPE_STREAM {
                    warn!("{}: entry set without stream extension at {pos:#x}", self.path);
                    specials.push(SpecialEntry::Opaque {
                        slot_offset: pos,
                        slots: 1 + secondaries,
                    });
                    return Ok(1 + secondaries);
                }
                let mut units = Vec::with_capacity(stream_ext.name_length as usize);
                for i in 0..secondaries.saturating_sub(1) {
                    let at = (2 + i) * DIRENT_SIZE;
                    let Ok((name_ext, _)) = entry::ExfatNameExt::read_from_prefix(&set[at..])
                    else {
                        break;
                    };
                    if name_ext.ent_type != EXFAT_TYPE_NAME {
                        break;
                    }
                    units.extend(name_ext.name_part.iter().map(|u| u.get()));
                }
                units.truncate(stream_ext.name_length as usize);
                let name = char::decode_utf16(units)
                    .collect::<core::result::Result<String, _>>()
                    .unwrap_or_default();
                entries.push(DirEntryInfo {
                    name,
                    short_name: None,
                    attributes: FileAttributes::from_bits_truncate(file.attributes.get()),
                    start_cluster: stream_ext.first_cluster.get(),
                    size: stream_ext.valid_data_length.get(),
                    alloc_size: stream_ext.data_length.get(),
                    contiguous: stream_ext.flags & EXFAT_FLAG_CONTIGUOUS != 0,
                    slot_offset: pos,
                    slot_count: 1 + secondaries,
                });
                Ok(1 + secondaries)
            }
            _ => {
                specials.push(SpecialEntry::Opaque {
                    slot_offset: pos,
                    slots: 1,
                });
                Ok(1)
            }
        }
    }

    // ---- free-slot map ----

    fn compact_slots(&mut self) {
        if !self.needs_compact {
            return;
        }
        let mut merged: BTreeMap<u64, u32> = BTreeMap::new();
        let mut iter = self.slots_map.iter();
        if let Some((&first_off, &first_len)) = iter.next() {
            let (mut cur_off, mut cur_len) = (first_off, first_len);
            for (&off, &len) in iter {
                if off == cur_off + cur_len as u64 * DIRENT_SIZE as u64 {
                    cur_len += len;
                } else {
                    merged.insert(cur_off, cur_len);
                    cur_off = off;
                    cur_len = len;
                }
            }
            merged.insert(cur_off, cur_len);
        }
        self.slots_map = merged;
        self.needs_compact = false;
    }

    /// First-fit offset for a group of `slots` contiguous slots.
    fn findfree(&mut self, slots: usize) -> Result<u64> {
        self.ensure_scanned()?;
        self.compact_slots();
        let want = slots as u32;
        let found = self
            .slots_map
            .iter()
            .find(|(_, &len)| len >= want)
            .map(|(&off, &len)| (off, len));
        let Some((off, len)) = found else {
            return Err(Error::NoSpace);
        };
        self.slots_map.remove(&off);
        if len > want {
            self.slots_map
                .insert(off + want as u64 * DIRENT_SIZE as u64, len - want);
        }
        Ok(off)
    }

    // ---- lookup and iteration ----

    pub fn find(&mut self, name: &str) -> Result<Option<DirEntryInfo>> {
        self.ensure_scanned()?;
        Ok(self.names.get(&name.to_lowercase()).cloned())
    }

    pub fn exists(&mut self, name: &str) -> Result<bool> {
        Ok(self.find(name)?.is_some())
    }

    /// Entries in on-disk order, erased slots skipped.
    pub fn list_entries(&mut self) -> Result<Vec<DirEntryInfo>> {
        self.ensure_scanned()?;
        let (entries, _, _) = self.scan()?;
        Ok(entries)
    }

    /// Names in on-disk order, the volume label excluded.
    pub fn listdir(&mut self) -> Result<Vec<String>> {
        Ok(self
            .list_entries()?
            .iter()
            .map(|e| e.name.clone())
            .collect())
    }

    // ---- mutation ----

    /// Reserve a slot group and write `group` at its offset. Returns the
    /// offset.
    fn write_group(&mut self, group: &[u8]) -> Result<u64> {
        let offset = self.findfree(group.len() / DIRENT_SIZE)?;
        self.stream.write_at(offset, group)?;
        Ok(offset)
    }

    /// Create a file or directory entry. An existing *file* with the same
    /// name is erased first; an existing directory refuses. `start` may be
    /// zero for an empty file.
    pub fn create_entry(
        &mut self,
        name: &str,
        attributes: FileAttributes,
        start: u32,
        size: u64,
        alloc_size: u64,
        contiguous: bool,
    ) -> Result<DirEntryInfo> {
        if !entry::is_valid_long_name(name) {
            return Err(Error::BadName(name.into()));
        }
        if self.path.len() + 1 + name.len() + 2 > PATH_MAX {
            return Err(Error::BadName(format!("{}/{name}", self.path)));
        }
        if let Some(existing) = self.find(name)? {
            if existing.is_dir() {
                return Err(Error::AlreadyExists(name.into()));
            }
            self.erase_entry(&existing)?;
        }

        let info = if self.core.boot.kind == FatKind::ExFat {
            let set = entry::pack_exfat_group(name, attributes, start, size, alloc_size, contiguous)?;
            let slot_count = set.len() / DIRENT_SIZE;
            let slot_offset = self.write_group(&set)?;
            DirEntryInfo {
                name: name.to_string(),
                short_name: None,
                attributes,
                start_cluster: start,
                size,
                alloc_size,
                contiguous,
                slot_offset,
                slot_count,
            }
        } else {
            self.create_fat_entry(name, attributes, start, size)?
        };

        if let Some(alias) = &info.short_name {
            self.names.insert(alias.to_lowercase(), info.clone());
        }
        self.names.insert(info.key(), info.clone());
        debug!("{}: created '{name}' @{:#x}", self.path, info.slot_offset);
        Ok(info)
    }

    fn create_fat_entry(
        &mut self,
        name: &str,
        attributes: FileAttributes,
        start: u32,
        size: u64,
    ) -> Result<DirEntryInfo> {
        let (cdate, ctime) = entry::dos_now();
        let mut sde = ShortDirEntry::read_from_bytes(&[0u8; 32])
            .map_err(|_| Error::invalid("directory entry", "layout"))?;
        sde.attr = attributes.bits() as u8;
        sde.crt_time.set(ctime);
        sde.crt_date.set(cdate);
        sde.lst_acc_date.set(cdate);
        sde.wrt_time.set(ctime);
        sde.wrt_date.set(cdate);
        sde.set_first_cluster(start);
        sde.file_size.set(size as u32);

        let mut group: Vec<u8> = Vec::new();
        let short_name: Option<String>;
        if entry::is_valid_short_name(name) {
            sde.name = entry::pack_short_name(name);
            sde.nt_res = entry::short_name_case_flags(name);
            short_name = None;
        } else {
            // Generate an alias unused in this table.
            let mut attempt = 1;
            let raw = loop {
                let raw = entry::gen_short_alias(name, attempt);
                let rendered = ShortDirEntry { name: raw, ..sde }.short_name();
                if !self.names.contains_key(&rendered.to_lowercase()) {
                    break raw;
                }
                attempt += 1;
                if attempt > 1_000_000 {
                    return Err(Error::AlreadyExists(name.into()));
                }
            };
            sde.name = raw;
            for slot in entry::pack_lfn_slots(name, entry::lfn_checksum(&raw))? {
                group.extend_from_slice(&slot);
            }
            short_name = Some(ShortDirEntry { name: raw, ..sde }.short_name());
        }
        group.extend_from_slice(sde.as_bytes());
        let slot_count = group.len() / DIRENT_SIZE;
        let slot_offset = self.write_group(&group)?;
        Ok(DirEntryInfo {
            name: name.to_string(),
            short_name,
            attributes,
            start_cluster: start,
            size,
            alloc_size: size,
            contiguous: false,
            slot_offset,
            slot_count,
        })
    }

    /// Mark every slot of the group erased, free its chain, return the
    /// slots to the free map and drop it from the caches. Open handles on
    /// the same chain are invalidated.
    pub fn erase_entry(&mut self, info: &DirEntryInfo) -> Result<()> {
        self.ensure_scanned()?;
        self.invalidate_watchers(info.start_cluster);

        let exfat = self.core.boot.kind == FatKind::ExFat;
        let mut slot = [0u8; DIRENT_SIZE];
        for i in 0..info.slot_count {
            let at = info.slot_offset + (i * DIRENT_SIZE) as u64;
            if self.stream.read_at(at, &mut slot)? != DIRENT_SIZE {
                break;
            }
            if exfat {
                slot[0] &= 0x7F;
            } else {
                slot[0] = DIR_ENTRY_FREE;
            }
            self.stream.write_at(at, &slot)?;
        }
        if info.start_cluster >= 2 {
            let mut alloc = self.core.alloc.write();
            if exfat && info.contiguous {
                // A no-FAT-chain stream has nothing to walk; free by shape.
                let clusters = info
                    .alloc_size
                    .max(info.size)
                    .div_ceil(self.core.boot.cluster_size as u64)
                    .max(1) as u32;
                alloc.free(info.start_cluster, Some(&[(info.start_cluster, clusters)]))?;
            } else {
                alloc.free(info.start_cluster, None)?;
            }
        }
        self.slots_map
            .insert(info.slot_offset, info.slot_count as u32);
        self.needs_compact = true;
        self.compact_slots();
        self.names.remove(&info.key());
        if let Some(alias) = &info.short_name {
            self.names.remove(&alias.to_lowercase());
        }
        debug!(
            "{}: erased '{}' @{:#x} (chain {:#x})",
            self.path, info.name, info.slot_offset, info.start_cluster
        );
        Ok(())
    }

    /// Rename within this table: a fresh group for the new name carrying
    /// the old entry's metadata, the old group marked erased. The chain is
    /// untouched.
    pub fn rename_entry(&mut self, old: &str, new: &str) -> Result<DirEntryInfo> {
        let Some(info) = self.find(old)? else {
            return Err(Error::NotFound(old.into()));
        };
        if self.exists(new)? {
            return Err(Error::AlreadyExists(new.into()));
        }
        if !entry::is_valid_long_name(new) {
            return Err(Error::BadName(new.into()));
        }
        let created = self.create_entry(
            new,
            info.attributes,
            info.start_cluster,
            info.size,
            info.alloc_size,
            info.contiguous,
        )?;
        // Drop the old group without freeing the (shared) chain.
        let exfat = self.core.boot.kind == FatKind::ExFat;
        let mut slot = [0u8; DIRENT_SIZE];
        for i in 0..info.slot_count {
            let at = info.slot_offset + (i * DIRENT_SIZE) as u64;
            if self.stream.read_at(at, &mut slot)? != DIRENT_SIZE {
                break;
            }
            if exfat {
                slot[0] &= 0x7F;
            } else {
                slot[0] = DIR_ENTRY_FREE;
            }
            self.stream.write_at(at, &slot)?;
        }
        self.slots_map
            .insert(info.slot_offset, info.slot_count as u32);
        self.needs_compact = true;
        self.names.remove(&info.key());
        if let Some(alias) = &info.short_name {
            self.names.remove(&alias.to_lowercase());
        }
        Ok(created)
    }

    /// Write back an entry after a handle mutated its stream: start
    /// cluster, sizes, write/access stamps and (exFAT) the contiguity flag.
    pub fn update_entry(
        &mut self,
        info: &DirEntryInfo,
        start: u32,
        size: u64,
        alloc_size: u64,
        contiguous: bool,
    ) -> Result<DirEntryInfo> {
        self.ensure_scanned()?;
        let mut updated = info.clone();
        updated.start_cluster = start;
        updated.size = size;
        updated.alloc_size = alloc_size;
        updated.contiguous = contiguous;

        if self.core.boot.kind == FatKind::ExFat {
            let mut set = vec![0u8; info.slot_count * DIRENT_SIZE];
            if self.stream.read_at(info.slot_offset, &mut set)? != set.len() {
                return Err(Error::invalid("directory entry", "short entry set"));
            }
            {
                let (file, _) = ExfatFileEntry::mut_from_prefix(&mut set)
                    .map_err(|_| Error::invalid("directory entry", "layout"))?;
                let (dt, tenms) = entry::exfat_now();
                file.modify_time.set(dt);
                file.modify_10ms = tenms;
                file.access_time.set(dt);
            }
            {
                let (stream_ext, _) = ExfatStreamExt::mut_from_prefix(&mut set[DIRENT_SIZE..])
                    .map_err(|_| Error::invalid("directory entry", "layout"))?;
                stream_ext.first_cluster.set(start);
                stream_ext.valid_data_length.set(size);
                stream_ext.data_length.set(alloc_size);
                stream_ext.flags = EXFAT_FLAG_ALLOC_POSSIBLE
                    | if contiguous { EXFAT_FLAG_CONTIGUOUS } else { 0 };
            }
            let sum = exfat_set_checksum(&set);
            set[2..4].copy_from_slice(&sum.to_le_bytes());
            self.stream.write_at(info.slot_offset, &set)?;
        } else {
            let at = info.slot_offset + ((info.slot_count - 1) * DIRENT_SIZE) as u64;
            let mut slot = [0u8; DIRENT_SIZE];
            if self.stream.read_at(at, &mut slot)? != DIRENT_SIZE {
                return Err(Error::invalid("directory entry", "short slot"));
            }
            let (sde, _) = ShortDirEntry::mut_from_prefix(&mut slot[..])
                .map_err(|_| Error::invalid("directory entry", "layout"))?;
            sde.set_first_cluster(start);
            if !updated.is_dir() {
                sde.file_size.set(size as u32);
            }
            let (cdate, ctime) = entry::dos_now();
            sde.wrt_time.set(ctime);
            sde.wrt_date.set(cdate);
            sde.lst_acc_date.set(cdate);
            self.stream.write_at(at, &slot)?;
        }

        if let Some(alias) = &updated.short_name {
            self.names.insert(alias.to_lowercase(), updated.clone());
        }
        self.names.insert(updated.key(), updated.clone());
        Ok(updated)
    }

    /// Toggle attribute bits (`+A`/`-H`-style operations) on an entry.
    pub fn attrib(&mut self, name: &str, ops: &[&str]) -> Result<FileAttributes> {
        let Some(info) = self.find(name)? else {
            return Err(Error::NotFound(name.into()));
        };
        let mut attrs = info.attributes;
        for op in ops {
            let mut chars = op.chars();
            let (sign, letter) = (chars.next(), chars.next());
            let bit = match letter.map(|c| c.to_ascii_uppercase()) {
                Some('R') => FileAttributes::READ_ONLY,
                Some('H') => FileAttributes::HIDDEN,
                Some('S') => FileAttributes::SYSTEM,
                Some('A') => FileAttributes::ARCHIVE,
                _ => return Err(Error::BadName(format!("attribute op {op}"))),
            };
            match sign {
                Some('+') => attrs |= bit,
                Some('-') => attrs &= !bit,
                _ => return Err(Error::BadName(format!("attribute op {op}"))),
            }
        }
        // Patch the attribute field in place.
        if self.core.boot.kind == FatKind::ExFat {
            let mut set = vec![0u8; info.slot_count * DIRENT_SIZE];
            if self.stream.read_at(info.slot_offset, &mut set)? != set.len() {
                return Err(Error::invalid("directory entry", "short entry set"));
            }
            set[4..6].copy_from_slice(&attrs.bits().to_le_bytes());
            let sum = exfat_set_checksum(&set);
            set[2..4].copy_from_slice(&sum.to_le_bytes());
            self.stream.write_at(info.slot_offset, &set)?;
        } else {
            let at = info.slot_offset + ((info.slot_count - 1) * DIRENT_SIZE) as u64;
            let mut slot = [0u8; DIRENT_SIZE];
            if self.stream.read_at(at, &mut slot)? != DIRENT_SIZE {
                return Err(Error::invalid("directory entry", "short slot"));
            }
            slot[0x0B] = attrs.bits() as u8;
            self.stream.write_at(at, &slot)?;
        }
        let mut updated = info.clone();
        updated.attributes = attrs;
        if let Some(alias) = &updated.short_name {
            self.names.insert(alias.to_lowercase(), updated.clone());
        }
        self.names.insert(updated.key(), updated);
        Ok(attrs)
    }

    /// Stable rewrite of all groups in `order`, blanking the leftover area
    /// and optionally shrinking the chain. Root-table special slots and dot
    /// entries keep their place at the front.
    pub fn sort_entries(
        &mut self,
        cmp: Option<&dyn Fn(&DirEntryInfo, &DirEntryInfo) -> core::cmp::Ordering>,
        shrink: bool,
    ) -> Result<(usize, usize)> {
        self.ensure_scanned()?;
        let entries = self.list_entries()?;
        let exfat = self.core.boot.kind == FatKind::ExFat;

        // Raw group bytes, keyed by current table order.
        let mut raw_groups: Vec<(DirEntryInfo, Vec<u8>)> = Vec::with_capacity(entries.len());
        for info in &entries {
            let mut raw = vec![0u8; info.slot_count * DIRENT_SIZE];
            if self.stream.read_at(info.slot_offset, &mut raw)? != raw.len() {
                return Err(Error::invalid("directory entry", "short entry set"));
            }
            raw_groups.push((info.clone(), raw));
        }
        // Specials (label, bitmap, upcase, ...) and dot entries stay first.
        let mut head: Vec<Vec<u8>> = Vec::new();
        let mut specials = core::mem::take(&mut self.specials);
        specials.sort_by_key(|s| match s {
            SpecialEntry::Label { slot_offset, .. } => *slot_offset,
            SpecialEntry::Bitmap { slot_offset, .. } => *slot_offset,
            SpecialEntry::Upcase { slot_offset, .. } => *slot_offset,
            SpecialEntry::Opaque { slot_offset, .. } => *slot_offset,
        });
        for special in &specials {
            let (off, slots) = match special {
                SpecialEntry::Label { slot_offset, .. } => (*slot_offset, 1),
                SpecialEntry::Bitmap { slot_offset, .. } => (*slot_offset, 1),
                SpecialEntry::Upcase { slot_offset, .. } => (*slot_offset, 1),
                SpecialEntry::Opaque { slot_offset, slots } => (*slot_offset, *slots),
            };
            let mut raw = vec![0u8; slots * DIRENT_SIZE];
            if self.stream.read_at(off, &mut raw)? == raw.len() {
                head.push(raw);
            }
        }
        self.specials = specials;

        let mut dots: Vec<Vec<u8>> = Vec::new();
        let mut sortable: Vec<(DirEntryInfo, Vec<u8>)> = Vec::new();
        for (info, raw) in raw_groups {
            if !exfat && (info.name == "." || info.name == "..") {
                dots.push(raw);
            } else {
                sortable.push((info, raw));
            }
        }
        match cmp {
            Some(f) => sortable.sort_by(|a, b| f(&a.0, &b.0)),
            None => sortable.sort_by_key(|(info, _)| info.name.to_lowercase()),
        }

        let mut pos = 0u64;
        for raw in head.iter().chain(dots.iter()) {
            self.stream.write_at(pos, raw)?;
            pos += raw.len() as u64;
        }
        let used_groups = sortable.len();
        for (_, raw) in &sortable {
            self.stream.write_at(pos, raw)?;
            pos += raw.len() as u64;
        }
        let blank = self.stream.size().saturating_sub(pos);
        if blank > 0 {
            self.stream.write_at(pos, &vec![0u8; blank as usize])?;
        }
        if shrink && !self.stream.is_fixed() {
            let cluster = self.core.boot.cluster_size as u64;
            if pos.div_ceil(cluster) < self.stream.size() / cluster {
                self.stream.seek(pos);
                self.stream.truncate()?;
            }
        }
        // Positions moved wholesale: rebuild the caches.
        self.scanned = false;
        self.ensure_scanned()?;
        Ok((used_groups, (blank / DIRENT_SIZE as u64) as usize))
    }

    // ---- volume label (root table only) ----

    pub fn get_label(&mut self) -> Result<Option<String>> {
        self.ensure_scanned()?;
        Ok(self.specials.iter().find_map(|s| match s {
            SpecialEntry::Label { name, .. } => Some(name.clone()),
            _ => None,
        }))
    }

    /// Set (or, with an empty string, clear) the volume label slot.
    pub fn set_label(&mut self, name: &str) -> Result<()> {
        self.ensure_scanned()?;
        if name.len() > 11 {
            return Err(Error::BadName(name.into()));
        }
        let existing = self.specials.iter().position(|s| matches!(s, SpecialEntry::Label { .. }));
        let exfat = self.core.boot.kind == FatKind::ExFat;

        if let Some(idx) = existing {
            let SpecialEntry::Label { slot_offset, .. } = self.specials[idx] else {
                unreachable!();
            };
            let mut slot = [0u8; DIRENT_SIZE];
            if self.stream.read_at(slot_offset, &mut slot)? != DIRENT_SIZE {
                return Err(Error::invalid("directory entry", "short slot"));
            }
            if name.is_empty() {
                if exfat {
                    slot[0] = EXFAT_TYPE_LABEL & 0x7F;
                } else {
                    slot[0] = DIR_ENTRY_FREE;
                }
                self.specials.remove(idx);
            } else {
                write_label_slot(&mut slot, name, exfat)?;
                self.specials[idx] = SpecialEntry::Label {
                    name: name.to_string(),
                    slot_offset,
                };
            }
            self.stream.write_at(slot_offset, &slot)?;
            return Ok(());
        }
        if name.is_empty() {
            return Ok(());
        }
        let mut slot = [0u8; DIRENT_SIZE];
        write_label_slot(&mut slot, name, exfat)?;
        let offset = self.write_group(&slot)?;
        self.specials.push(SpecialEntry::Label {
            name: name.to_string(),
            slot_offset: offset,
        });
        Ok(())
    }

    // ---- open-handle bookkeeping ----

    pub fn watch(&mut self, start_cluster: u32, flag: &Arc<AtomicBool>) {
        self.watchers.retain(|(_, w)| w.strong_count() > 0);
        self.watchers.push((start_cluster, Arc::downgrade(flag)));
    }

    fn invalidate_watchers(&mut self, start_cluster: u32) {
        for (start, weak) in &self.watchers {
            if *start == start_cluster && start_cluster >= 2 {
                if let Some(flag) = weak.upgrade() {
                    flag.store(false, Ordering::Relaxed);
                }
            }
        }
        self.watchers.retain(|(_, w)| w.strong_count() > 0);
    }

    /// Zero every free cluster run. Loud, slow, deliberate.
    pub fn wipe_free_space(&mut self) -> Result<()> {
        let mut alloc = self.core.alloc.write();
        let cluster = self.core.boot.cluster_size;
        let runs: Vec<(u32, u32)> = alloc
            .free_runs()?
            .iter()
            .map(|(&s, &l)| (s, l))
            .collect();
        let zeros = vec![0u8; (4 << 20).min(cluster * 64)];
        for (start, mut length) in runs {
            debug!("wiping {length} clusters from {start:#x}");
            let mut offset = self.core.boot.cluster_to_offset(start);
            while length > 0 {
                let batch = (zeros.len() / cluster).min(length as usize);
                self.core
                    .device
                    .write_at(offset, &zeros[..batch * cluster])?;
                offset += (batch * cluster) as u64;
                length -= batch as u32;
            }
        }
        Ok(())
    }
}

fn write_label_slot(slot: &mut [u8; DIRENT_SIZE], name: &str, exfat: bool) -> Result<()> {
    if exfat {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > 11 {
            return Err(Error::BadName(name.into()));
        }
        slot.fill(0);
        slot[0] = EXFAT_TYPE_LABEL;
        slot[1] = units.len() as u8;
        for (i, u) in units.iter().enumerate() {
            slot[2 + i * 2..4 + i * 2].copy_from_slice(&u.to_le_bytes());
        }
    } else {
        if !name.is_ascii() {
            return Err(Error::BadName(name.into()));
        }
        slot.fill(0);
        let mut raw = [b' '; 11];
        for (i, c) in name.bytes().take(11).enumerate() {
            raw[i] = c.to_ascii_uppercase();
        }
        slot[..11].copy_from_slice(&raw);
        slot[0x0B] = FileAttributes::VOLUME_ID.bits() as u8;
        let (cdate, ctime) = entry::dos_now();
        slot[0x16..0x18].copy_from_slice(&ctime.to_le_bytes());
        slot[0x18..0x1A].copy_from_slice(&cdate.to_le_bytes());
    }
    Ok(())
}
