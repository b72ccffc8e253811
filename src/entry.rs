//! Directory entry structures
//!
//! Every FAT-family directory is a sequence of 32-byte slots. The first byte
//! rules the slot's fate: 0xE5 means free, 0x00 means free *and* no
//! allocated entries follow (so scanners stop there), and 0x05 stands for a
//! real leading 0xE5. An exFAT slot instead keys on its type byte, whose top
//! bit is cleared when the entry is deleted.
//!
//! Classic FAT names come in two spaces. The short name space holds 8+3
//! uppercase OEM names, space-padded, with two flag bits (0x08 basename,
//! 0x10 extension) selecting an all-lowercase rendering. The long name space
//! holds up to 255 UTF-16 code units spread over up to 20 LFN slots, each
//! carrying 13 code units in three disjoint fields, stored in *descending*
//! sequence order with bit 0x40 marking the first slot to appear. A set of
//! long entries is always physically contiguous with, and immediately
//! precedes, its short entry; every member carries an 8-bit checksum of the
//! short name so orphaned sets can be detected:
//!
//! ```text
//! Sum = 0;
//! for (i = 11; i != 0; i--)
//!     Sum = ((Sum & 1) ? 0x80 : 0) + (Sum >> 1) + *p++;
//! ```
//!
//! exFAT groups one File entry (type 0x85), one Stream Extension (0xC0) and
//! 1..17 File Name Extensions (0xC1), each with 15 UTF-16 code units. The
//! Stream Extension records the name length, a 16-bit hash of the upcased
//! UTF-16 name (so lookups can skip most groups without decoding), both the
//! valid-data and the allocated length, and the contiguity flag (bit 1 of
//! its flags byte) that lets a single-run file bypass the FAT. A 16-bit
//! rolling checksum over the whole set, skipping its own storage bytes at
//! offsets 2-3, seals the group.
//!
//! All timestamps are DOS-encoded words (2-second granularity); exFAT
//! widens them with a 10-ms component (0..199, odd seconds folded in) and a
//! UTC offset byte.

use bitflags::bitflags;
use chrono::{Datelike, Local, Timelike};
use lazy_static::lazy_static;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};
use crate::{DIRENT_SIZE, LONG_NAME_MAX};

/// First byte of a free (erased) slot.
pub const DIR_ENTRY_FREE: u8 = 0xE5;
/// First byte of the slot terminating the table.
pub const DIR_ENTRY_LAST: u8 = 0x00;
/// Stored first byte standing for a literal 0xE5.
pub const DIR_ENTRY_E5_SUBSTITUTE: u8 = 0x05;
/// LFN sequence-number bit marking the last (first-to-appear) slot.
pub const LAST_LONG_ENTRY: u8 = 0x40;
/// Attribute byte of an LFN slot.
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// Basename stored lowercase.
pub const CASE_LOWER_BASE: u8 = 0x08;
/// Extension stored lowercase.
pub const CASE_LOWER_EXT: u8 = 0x10;

// exFAT entry types (active form, top bit set).
pub const EXFAT_TYPE_BITMAP: u8 = 0x81;
pub const EXFAT_TYPE_UPCASE: u8 = 0x82;
pub const EXFAT_TYPE_LABEL: u8 = 0x83;
pub const EXFAT_TYPE_FILE: u8 = 0x85;
pub const EXFAT_TYPE_GUID: u8 = 0xA0;
pub const EXFAT_TYPE_STREAM: u8 = 0xC0;
pub const EXFAT_TYPE_NAME: u8 = 0xC1;

/// Stream Extension flags: entry may own clusters.
pub const EXFAT_FLAG_ALLOC_POSSIBLE: u8 = 0x01;
/// Stream Extension flags: contents contiguous, FAT unused.
pub const EXFAT_FLAG_CONTIGUOUS: u8 = 0x02;

bitflags! {
    /// MS-DOS file attributes; exFAT stores them in a 16-bit word with the
    /// same low-byte meanings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u16 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
    }
}

/// FAT 32-byte short directory entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ShortDirEntry {
    /// 8-char basename plus 3-char extension, space-padded, uppercase.
    pub name: [u8; 11],
    /// Attribute bits; 0x0F here marks an LFN slot instead.
    pub attr: u8,
    /// Case flags: 0x08 lowercase basename, 0x10 lowercase extension.
    pub nt_res: u8,
    /// Creation tenths of a second, 0..199.
    pub crt_time_tenth: u8,
    pub crt_time: U16,
    pub crt_date: U16,
    /// Last access date; no time is recorded.
    pub lst_acc_date: U16,
    /// High word of the first cluster (0 on FAT12/16).
    pub fst_clus_hi: U16,
    pub wrt_time: U16,
    pub wrt_date: U16,
    pub fst_clus_lo: U16,
    /// File size in bytes; always 0 for directories.
    pub file_size: U32,
}

impl ShortDirEntry {
    pub fn first_cluster(&self) -> u32 {
        ((self.fst_clus_hi.get() as u32) << 16) | self.fst_clus_lo.get() as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.fst_clus_hi.set((cluster >> 16) as u16);
        self.fst_clus_lo.set((cluster & 0xFFFF) as u16);
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == DIR_ENTRY_FREE
    }

    pub fn is_last(&self) -> bool {
        self.name[0] == DIR_ENTRY_LAST
    }

    pub fn is_lfn(&self) -> bool {
        self.attr == ATTR_LONG_NAME
    }

    pub fn is_dir(&self) -> bool {
        self.attr & FileAttributes::DIRECTORY.bits() as u8 != 0
    }

    pub fn is_label(&self) -> bool {
        self.attr & FileAttributes::VOLUME_ID.bits() as u8 != 0 && !self.is_lfn()
    }

    /// Human-readable name, honoring the lowercase flag bits.
    pub fn short_name(&self) -> String {
        let mut base: String = self.name[..8]
            .iter()
            .take_while(|&&c| c != b' ')
            .map(|&c| {
                if c == DIR_ENTRY_E5_SUBSTITUTE {
                    0xE5 as char
                } else {
                    c as char
                }
            })
            .collect();
        let mut ext: String = self.name[8..]
            .iter()
            .take_while(|&&c| c != b' ')
            .map(|&c| c as char)
            .collect();
        if self.nt_res & CASE_LOWER_BASE != 0 {
            base = base.to_ascii_lowercase();
        }
        if self.nt_res & CASE_LOWER_EXT != 0 {
            ext = ext.to_ascii_lowercase();
        }
        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }

    pub fn checksum(&self) -> u8 {
        lfn_checksum(&self.name)
    }
}

/// FAT 32-byte long-name slot: 13 UTF-16 code units in three fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct LongDirEntry {
    /// Sequence number, 0x40 marking the last member of the set.
    pub ord: u8,
    pub name1: [U16; 5],
    /// Always 0x0F.
    pub attr: u8,
    pub ent_type: u8,
    /// Checksum of the associated short name.
    pub chksum: u8,
    pub name2: [U16; 6],
    /// Must be 0.
    pub fst_clus_lo: U16,
    pub name3: [U16; 2],
}

impl LongDirEntry {
    /// The 13 code units, in order; the name ends at the first NUL.
    pub fn name_units(&self) -> [u16; 13] {
        let mut units = [0u16; 13];
        for (i, u) in self
            .name1
            .iter()
            .chain(self.name2.iter())
            .chain(self.name3.iter())
            .enumerate()
        {
            units[i] = u.get();
        }
        units
    }
}

/// exFAT File entry (type 0x85), the primary slot of a group.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExfatFileEntry {
    pub ent_type: u8,
    /// Secondary slots following this one: 2..18.
    pub secondary_count: u8,
    /// Rolling checksum over the whole set, skipping these two bytes.
    pub checksum: U16,
    pub attributes: U16,
    pub reserved1: [u8; 2],
    /// DOS datetime DWORDs: date word in the high half, time in the low.
    pub create_time: U32,
    pub modify_time: U32,
    pub access_time: U32,
    /// 10-ms refinements, 0..199 (odd DOS seconds folded in).
    pub create_10ms: u8,
    pub modify_10ms: u8,
    /// UTC offsets in 15-minute units, bit 7 = valid.
    pub create_tz: u8,
    pub modify_tz: u8,
    pub access_tz: u8,
    pub reserved2: [u8; 7],
}

/// exFAT Stream Extension (type 0xC0).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExfatStreamExt {
    pub ent_type: u8,
    /// Bit 0: allocation possible; bit 1: contiguous, FAT unused.
    pub flags: u8,
    pub reserved1: u8,
    /// Name length in code units, 1..255.
    pub name_length: u8,
    /// Hash of the upcased UTF-16 name.
    pub name_hash: U16,
    pub reserved2: [u8; 2],
    /// Bytes actually written; <= data_length.
    pub valid_data_length: U64,
    pub reserved3: [u8; 4],
    pub first_cluster: U32,
    /// Allocated bytes.
    pub data_length: U64,
}

/// exFAT File Name Extension (type 0xC1): 15 code units per slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExfatNameExt {
    pub ent_type: u8,
    pub flags: u8,
    pub name_part: [U16; 15],
}

/// exFAT Allocation Bitmap entry (type 0x81), living in the root table.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExfatBitmapEntry {
    pub ent_type: u8,
    /// Bit 0 selects the second bitmap (T-exFAT only, unsupported).
    pub flags: u8,
    pub reserved: [u8; 18],
    pub first_cluster: U32,
    /// ceil(cluster_count / 8) bytes.
    pub data_length: U64,
}

/// exFAT Upcase Table entry (type 0x82).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExfatUpcaseEntry {
    pub ent_type: u8,
    pub reserved1: [u8; 3],
    pub checksum: U32,
    pub reserved2: [u8; 12],
    pub first_cluster: U32,
    pub data_length: U64,
}

/// exFAT Volume Label entry (type 0x83).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExfatLabelEntry {
    pub ent_type: u8,
    /// Label length in code units, max 11.
    pub char_count: u8,
    pub label: [U16; 11],
    pub reserved: [u8; 8],
}

/// A decoded directory entry, variant-independent: what the directory table
/// caches under each name and what handles carry around.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    /// FAT: the 8.3 alias when a long name is present.
    pub short_name: Option<String>,
    pub attributes: FileAttributes,
    pub start_cluster: u32,
    /// Declared size (exFAT: valid data length).
    pub size: u64,
    /// Allocated bytes recorded in the entry (exFAT only; == size on FAT).
    pub alloc_size: u64,
    /// exFAT: stream recorded as contiguous, FAT unused.
    pub contiguous: bool,
    /// Byte offset of the group's first slot inside the table stream.
    pub slot_offset: u64,
    /// Slots in the group (LFN slots + short entry, or exFAT set length).
    pub slot_count: usize,
}

impl DirEntryInfo {
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    /// Lookup key: names compare case-insensitively across both name
    /// spaces.
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

// ---- checksums and hashes ----

/// 8-bit checksum of the 11 short-name bytes stored in every LFN slot.
pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &c in short_name {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(c);
    }
    sum
}

/// exFAT 16-bit rolling hash over `data`, optionally skipping bytes 2-3
/// (where an entry set stores the result).
fn exfat_hash16(data: &[u8], skip_checksum_field: bool) -> u16 {
    let mut hash: u16 = 0;
    for (i, &b) in data.iter().enumerate() {
        if skip_checksum_field && (i == 2 || i == 3) {
            continue;
        }
        hash = ((hash << 15) | (hash >> 1)).wrapping_add(b as u16);
    }
    hash
}

/// Checksum sealing an exFAT entry set (all its slots, in order).
pub fn exfat_set_checksum(set: &[u8]) -> u16 {
    exfat_hash16(set, true)
}

/// Stream Extension name hash: over the UTF-16LE bytes of the upcased name.
pub fn exfat_name_hash(name: &str) -> u16 {
    let mut bytes = Vec::with_capacity(name.len() * 2);
    for unit in name.encode_utf16() {
        bytes.extend_from_slice(&upcase_unit(unit).to_le_bytes());
    }
    exfat_hash16(&bytes, false)
}

lazy_static! {
    /// The 64 Ki-entry UTF-16 upcase map shared by name hashing and the
    /// formatter. Surrogates and units whose uppercase form leaves the BMP
    /// map to themselves.
    pub static ref UPCASE_TABLE: Vec<u16> = {
        let mut table: Vec<u16> = (0..=0xFFFFu32).map(|u| u as u16).collect();
        for unit in 0..=0xFFFFu32 {
            if (0xD800..0xE000).contains(&unit) {
                continue;
            }
            let Some(c) = char::from_u32(unit) else {
                continue;
            };
            let mut upper = c.to_uppercase();
            if let (Some(u), None) = (upper.next(), upper.next()) {
                let code = u as u32;
                if code <= 0xFFFF {
                    table[unit as usize] = code as u16;
                }
            }
        }
        table
    };
}

#[inline]
pub fn upcase_unit(unit: u16) -> u16 {
    UPCASE_TABLE[unit as usize]
}

// ---- timestamps ----

/// (DOS date, DOS time) for the current local time.
pub fn dos_now() -> (u16, u16) {
    let now = Local::now();
    let date = (((now.year().clamp(1980, 2107) - 1980) as u16) << 9)
        | ((now.month() as u16) << 5)
        | now.day() as u16;
    let time =
        ((now.hour() as u16) << 11) | ((now.minute() as u16) << 5) | (now.second() as u16 / 2);
    (date, time)
}

/// exFAT datetime DWORD (date high, time low) plus the 10-ms refinement.
pub fn exfat_now() -> (u32, u8) {
    let now = Local::now();
    let (date, time) = dos_now();
    let mut tenms = (now.timestamp_subsec_millis() / 10) as u8;
    if now.second() % 2 == 1 {
        tenms += 100;
    }
    ((date as u32) << 16 | time as u32, tenms)
}

// ---- name validity and 8.3 generation ----

const SHORT_RESERVED: &[u8] = br#"" */:<>?\|[]+.,;="#;
const LONG_RESERVED: &[u8] = br#""*/:<>?\|"#;

/// True for a name storable directly in a short entry: 1-8 char basename,
/// up to 3-char extension, no reserved characters, each part either all
/// upper or all lower (mixed case forces a long name).
pub fn is_valid_short_name(name: &str) -> bool {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return false;
    }
    let part_ok = |part: &str| {
        part.bytes()
            .all(|c| c >= 0x20 && c < 0x7F && !SHORT_RESERVED.contains(&c))
            && (part.chars().all(|c| !c.is_ascii_lowercase())
                || part.chars().all(|c| !c.is_ascii_uppercase()))
    };
    part_ok(base) && (ext.is_empty() || part_ok(ext))
}

/// True for a legal long name: at most 255 code units, none of the
/// characters forbidden in both name spaces.
pub fn is_valid_long_name(name: &str) -> bool {
    !name.is_empty()
        && name.encode_utf16().count() <= LONG_NAME_MAX
        && name
            .bytes()
            .all(|c| c >= 0x20 || !c.is_ascii())
        && !name.bytes().any(|c| LONG_RESERVED.contains(&c))
}

/// Case flag bits for a name that fits the short form as-is.
pub fn short_name_case_flags(name: &str) -> u8 {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    let mut flags = 0;
    if base.chars().any(|c| c.is_ascii_lowercase()) {
        flags |= CASE_LOWER_BASE;
    }
    if ext.chars().any(|c| c.is_ascii_lowercase()) {
        flags |= CASE_LOWER_EXT;
    }
    flags
}

/// Pack a name into the raw space-padded 11 bytes. The name must already be
/// a valid short name (any case).
pub fn pack_short_name(name: &str) -> [u8; 11] {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    let mut raw = [b' '; 11];
    for (i, c) in base.bytes().take(8).enumerate() {
        raw[i] = c.to_ascii_uppercase();
    }
    for (i, c) in ext.bytes().take(3).enumerate() {
        raw[8 + i] = c.to_ascii_uppercase();
    }
    if raw[0] == 0xE5 {
        raw[0] = DIR_ENTRY_E5_SUBSTITUTE;
    }
    raw
}

/// Generate the 8.3 alias for a long name, Windows NT style. Attempts 1-4
/// truncate the sanitized basename and append `~n`; from the fifth attempt
/// on, two leading characters plus four hex digits of the name's CRC-32
/// low word give an alias mathematically bound to the long name, so a free
/// one is almost always found at once.
pub fn gen_short_alias(long_name: &str, attempt: u32) -> [u8; 11] {
    // Characters with no OEM form vanish; spaces and reserved characters
    // become '_' before truncation.
    let mut sanitized = String::new();
    for c in long_name.chars() {
        if !c.is_ascii() || (c as u8) < 0x20 {
            continue;
        }
        if c == ' ' || (SHORT_RESERVED.contains(&(c as u8)) && c != '.') {
            sanitized.push('_');
        } else {
            sanitized.push(c);
        }
    }
    // Only the last dot separates the extension.
    let ext = match sanitized.rsplit_once('.') {
        Some((base, e)) => {
            let e = e.to_string();
            sanitized = base.replace('.', "_");
            e
        }
        None => String::new(),
    };

    let tail: String;
    let keep: usize;
    if attempt < 5 {
        tail = format!("~{attempt}");
        keep = (8 - tail.len()).min(sanitized.len());
    } else {
        let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(long_name.as_bytes());
        tail = format!("{:04X}~{}", crc & 0xFFFF, attempt - 4);
        keep = sanitized.len().min(2);
    }
    let alias = format!("{}{}.{}", &sanitized[..keep], tail, &ext);
    pack_short_name(&alias)
}

// ---- slot packing ----

/// Build the LFN slots for `long_name`, in on-disk (descending) order,
/// ready to be written immediately before the short entry.
pub fn pack_lfn_slots(long_name: &str, checksum: u8) -> Result<Vec<[u8; 32]>> {
    let mut units: Vec<u16> = long_name.encode_utf16().collect();
    if units.len() > LONG_NAME_MAX {
        return Err(Error::BadName(long_name.into()));
    }
    let count = units.len().div_ceil(13);
    // NUL-terminate unless the name exactly fills its slots, then pad.
    if units.len() % 13 != 0 {
        units.push(0);
        while units.len() % 13 != 0 {
            units.push(0xFFFF);
        }
    }
    let mut slots = Vec::with_capacity(count);
    for seq in (1..=count).rev() {
        let mut slot = LongDirEntry {
            ord: seq as u8,
            name1: [U16::ZERO; 5],
            attr: ATTR_LONG_NAME,
            ent_type: 0,
            chksum: checksum,
            name2: [U16::ZERO; 6],
            fst_clus_lo: U16::ZERO,
            name3: [U16::ZERO; 2],
        };
        if seq == count {
            slot.ord |= LAST_LONG_ENTRY;
        }
        let part = &units[(seq - 1) * 13..seq * 13];
        for i in 0..5 {
            slot.name1[i].set(part[i]);
        }
        for i in 0..6 {
            slot.name2[i].set(part[5 + i]);
        }
        for i in 0..2 {
            slot.name3[i].set(part[11 + i]);
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(slot.as_bytes());
        slots.push(raw);
    }
    Ok(slots)
}

/// Build a complete exFAT entry set for a file or directory, checksum
/// sealed. Secondary count is one Stream Extension plus one name slot per
/// 15 code units.
pub fn pack_exfat_group(
    name: &str,
    attributes: FileAttributes,
    start_cluster: u32,
    valid_data_length: u64,
    data_length: u64,
    contiguous: bool,
) -> Result<Vec<u8>> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > LONG_NAME_MAX {
        return Err(Error::BadName(name.into()));
    }
    let name_slots = units.len().div_ceil(15);
    let (dt, tenms) = exfat_now();

    let file = ExfatFileEntry {
        ent_type: EXFAT_TYPE_FILE,
        secondary_count: (1 + name_slots) as u8,
        checksum: U16::ZERO,
        attributes: U16::new(attributes.bits()),
        reserved1: [0; 2],
        create_time: U32::new(dt),
        modify_time: U32::new(dt),
        access_time: U32::new(dt),
        create_10ms: tenms,
        modify_10ms: tenms,
        create_tz: 0x80,
        modify_tz: 0x80,
        access_tz: 0x80,
        reserved2: [0; 7],
    };
    let mut flags = EXFAT_FLAG_ALLOC_POSSIBLE;
    if contiguous {
        flags |= EXFAT_FLAG_CONTIGUOUS;
    }
    let stream = ExfatStreamExt {
        ent_type: EXFAT_TYPE_STREAM,
        flags,
        reserved1: 0,
        name_length: units.len() as u8,
        name_hash: U16::new(exfat_name_hash(name)),
        reserved2: [0; 2],
        valid_data_length: U64::new(valid_data_length),
        reserved3: [0; 4],
        first_cluster: U32::new(start_cluster),
        data_length: U64::new(data_length),
    };

    let mut set = Vec::with_capacity((2 + name_slots) * DIRENT_SIZE);
    set.extend_from_slice(file.as_bytes());
    set.extend_from_slice(stream.as_bytes());
    for chunk in units.chunks(15) {
        let mut slot = ExfatNameExt {
            ent_type: EXFAT_TYPE_NAME,
            flags: 0,
            name_part: [U16::ZERO; 15],
        };
        for (i, &u) in chunk.iter().enumerate() {
            slot.name_part[i].set(u);
        }
        set.extend_from_slice(slot.as_bytes());
    }
    let sum = exfat_set_checksum(&set);
    set[2..4].copy_from_slice(&sum.to_le_bytes());
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_32_bytes() {
        assert_eq!(core::mem::size_of::<ShortDirEntry>(), 32);
        assert_eq!(core::mem::size_of::<LongDirEntry>(), 32);
        assert_eq!(core::mem::size_of::<ExfatFileEntry>(), 32);
        assert_eq!(core::mem::size_of::<ExfatStreamExt>(), 32);
        assert_eq!(core::mem::size_of::<ExfatNameExt>(), 32);
        assert_eq!(core::mem::size_of::<ExfatBitmapEntry>(), 32);
        assert_eq!(core::mem::size_of::<ExfatUpcaseEntry>(), 32);
        assert_eq!(core::mem::size_of::<ExfatLabelEntry>(), 32);
    }

    #[test]
    fn lfn_checksum_reference_value() {
        // Published reference: "FILENAMEEXT" -> the rotate-and-add fold.
        let mut expect: u8 = 0;
        for &c in b"FILENAMEEXT" {
            expect = (if expect & 1 == 1 { 0x80u8 } else { 0u8 })
                .wrapping_add(expect >> 1)
                .wrapping_add(c);
        }
        assert_eq!(lfn_checksum(b"FILENAMEEXT"), expect);
    }

    #[test]
    fn alias_generation_win95_then_nt() {
        assert_eq!(&gen_short_alias("Réadme Long.txt", 1), b"RADME_~1TXT");
        assert_eq!(&gen_short_alias("Long File Name.txt", 2), b"LONG_F~2TXT");
        // From the fifth attempt the CRC form kicks in: 2 chars + 4 hex + ~1.
        let alias = gen_short_alias("Long File Name.txt", 5);
        assert_eq!(&alias[0..2], b"LO");
        assert_eq!(alias[6], b'~');
        assert_eq!(alias[7], b'1');
        assert_eq!(&alias[8..11], b"TXT");
    }

    #[test]
    fn short_name_validity() {
        assert!(is_valid_short_name("README.TXT"));
        assert!(is_valid_short_name("readme.txt"));
        assert!(!is_valid_short_name("Readme.txt")); // mixed case base
        assert!(!is_valid_short_name("longfilename.txt"));
        assert!(!is_valid_short_name("bad*name.txt"));
        assert!(is_valid_long_name("Mixed Case with spaces.txt"));
        assert!(!is_valid_long_name("no|pipes"));
    }

    #[test]
    fn lfn_slots_round_trip() {
        let name = "Hello, wörld document.txt"; // 25 units -> 2 slots
        let slots = pack_lfn_slots(name, 0xA5).unwrap();
        assert_eq!(slots.len(), 2);
        let (first, _) = LongDirEntry::read_from_prefix(&slots[0]).unwrap();
        assert_eq!(first.ord, 2 | LAST_LONG_ENTRY);
        assert_eq!(first.chksum, 0xA5);
        let mut units = Vec::new();
        for raw in slots.iter().rev() {
            let (lde, _) = LongDirEntry::read_from_prefix(raw).unwrap();
            units.extend_from_slice(&lde.name_units());
        }
        let decoded: String = char::decode_utf16(
            units.into_iter().take_while(|&u| u != 0 && u != 0xFFFF),
        )
        .map(|c| c.unwrap())
        .collect();
        assert_eq!(decoded, name);
    }

    #[test]
    fn exfat_group_checksum_and_hash() {
        let set = pack_exfat_group(
            "Data File.bin",
            FileAttributes::ARCHIVE,
            8,
            1000,
            4096,
            true,
        )
        .unwrap();
        assert_eq!(set.len(), 3 * 32);
        let stored = u16::from_le_bytes([set[2], set[3]]);
        assert_eq!(stored, exfat_set_checksum(&set));
        let (stream, _) = ExfatStreamExt::read_from_prefix(&set[32..]).unwrap();
        assert_eq!(stream.name_length, 13);
        assert_eq!(stream.name_hash.get(), exfat_name_hash("Data File.bin"));
        assert_eq!(stream.flags, EXFAT_FLAG_ALLOC_POSSIBLE | EXFAT_FLAG_CONTIGUOUS);
    }

    #[test]
    fn upcase_is_identity_outside_letters() {
        assert_eq!(upcase_unit(b'a' as u16), b'A' as u16);
        assert_eq!(upcase_unit(b'Z' as u16), b'Z' as u16);
        assert_eq!(upcase_unit(0x00E9), 0x00C9); // é -> É
        assert_eq!(upcase_unit(0x0030), 0x0030);
        assert_eq!(upcase_unit(0xD800), 0xD800); // surrogates untouched
    }
}
