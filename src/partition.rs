//! MBR and GPT partition tables
//!
//! The MBR keeps four 16-byte entries at offset 0x1BE and the 0x55AA
//! signature at 510. Each entry carries both a CHS triple pair and the LBA
//! start/count; CHS and LBA relate through
//!
//! ```text
//! LBA = (c * heads + h) * sectors_per_track + (s - 1)
//! c = LBA / (heads * spt);  h = (LBA / spt) % heads;  s = LBA % spt + 1
//! ```
//!
//! with 63 sectors per track and the smallest head count out of
//! {2,16,32,64,128,255} that keeps the cylinder count under 1024. A sector
//! beyond cylinder 1023 stores the saturated triple (1023, 254, 63).
//! Well-known floppy sizes map to their canonical geometries instead.
//!
//! A GPT disk keeps a protective MBR with one 0xEE partition, the GPT
//! header at LBA 1, the partition entry array (128 entries of 128 bytes)
//! at LBA 2, and a backup array plus header at the disk end. The header is
//! sealed by a CRC-32 over its first `header_size` bytes with the CRC
//! field zeroed; the entry array by a CRC-32 over
//! `num_entries * entry_size` bytes.

use std::sync::Arc;

use log::debug;
use uuid::Uuid;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::device::{BlockDevice, PartitionView};
use crate::error::{Error, Result};

pub const MBR_SIGNATURE_OFFSET: usize = 510;
pub const MBR_TABLE_OFFSET: usize = 0x1BE;

/// Windows basic data partition type GUID.
pub const BASIC_DATA_GUID: Uuid = Uuid::from_u128(0xEBD0_A0A2_B9E5_4433_87C0_68B6_B726_99C7);

pub const SECTORS_PER_TRACK: u64 = 63;

// ---- CHS arithmetic ----

/// Geometry for a disk of `size` bytes: (cylinders, heads, sectors per
/// track), with the classic floppy formats special-cased.
pub fn size2chs(size: u64) -> (u32, u32, u32) {
    let lba = size / 512;
    match lba {
        640 => return (80, 1, 8),    // 3.5in DS/DD 320 KiB
        720 => return (80, 1, 9),    // 3.5in DS/DD 360 KiB
        1280 => return (80, 2, 8),   // 3.5in DS/DD 640 KiB
        1440 => return (80, 2, 9),   // 3.5in DS/DD 720 KiB
        2880 => return (80, 2, 18),  // 3.5in DS/HD 1440 KiB
        3360 => return (80, 2, 21),  // 3.5in DS/HD 1680 KiB (DMF)
        3440 => return (82, 2, 21),  // 3.5in DS/HD 1720 KiB
        5760 => return (80, 2, 36),  // 3.5in DS/XD 2880 KiB
        _ => {}
    }
    for hpc in [2u64, 16, 32, 64, 128, 255] {
        let (c, h, s) = lba2chs(lba, hpc);
        if c < 1024 || hpc == 255 {
            return (c as u32, h as u32, s as u32);
        }
    }
    unreachable!()
}

pub fn lba2chs(lba: u64, hpc: u64) -> (u64, u64, u64) {
    let spt = SECTORS_PER_TRACK;
    let hpc = if hpc == 0 {
        [16u64, 32, 64, 128, 255]
            .into_iter()
            .find(|h| lba <= spt * h * 1024)
            .unwrap_or(255)
    } else {
        hpc
    };
    (lba / (hpc * spt), (lba / spt) % hpc, lba % spt + 1)
}

pub fn chs2lba(c: u64, h: u64, s: u64, hpc: u64) -> u64 {
    (c * hpc + h) * SECTORS_PER_TRACK + (s - 1)
}

/// The three raw MBR bytes for a CHS triple, saturating past cylinder
/// 1023.
pub fn chs2raw(c: u64, h: u64, s: u64) -> [u8; 3] {
    if c > 1023 {
        [254, 255, 255]
    } else {
        [h as u8, (((c & 0x300) >> 2) | s) as u8, (c & 0xFF) as u8]
    }
}

pub fn raw2chs(raw: [u8; 3]) -> (u64, u64, u64) {
    let (h, s, c) = (raw[0] as u64, raw[1] as u64, raw[2] as u64);
    (((s & 0xC0) << 2) | c, h, s & 0x3F)
}

// ---- raw layouts ----

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MbrPartitionRaw {
    /// 0x80 = bootable, 0x00 = not bootable, anything else invalid.
    pub status: u8,
    pub first_chs: [u8; 3],
    pub ptype: u8,
    pub last_chs: [u8; 3],
    pub first_lba: U32,
    pub total_sectors: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct GptHeaderRaw {
    /// "EFI PART"
    pub signature: [u8; 8],
    /// 0x00010000
    pub revision: U32,
    /// 92 <= size <= sector size
    pub header_size: U32,
    /// CRC-32 over `header_size` bytes, this field zeroed.
    pub header_crc32: U32,
    pub reserved: U32,
    pub my_lba: U64,
    pub alternate_lba: U64,
    pub first_usable_lba: U64,
    pub last_usable_lba: U64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: U64,
    pub num_partition_entries: U32,
    pub partition_entry_size: U32,
    /// CRC-32 over the whole entry array.
    pub partition_array_crc32: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct GptEntryRaw {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub starting_lba: U64,
    pub ending_lba: U64,
    pub attributes: U64,
    /// UTF-16LE, NUL padded.
    pub name: [u8; 72],
}

// ---- parsed view ----

#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub index: usize,
    /// MBR type byte, or the GPT type GUID.
    pub mbr_type: Option<u8>,
    pub type_guid: Option<Uuid>,
    pub name: Option<String>,
    pub bootable: bool,
    pub attributes: u64,
    pub start_lba: u64,
    pub sectors: u64,
}

#[derive(Debug, Clone)]
pub enum PartitionTable {
    Mbr(Vec<PartitionInfo>),
    Gpt(Vec<PartitionInfo>),
    /// No recognizable table: treat the disk as one big volume.
    None,
}

impl PartitionTable {
    pub fn partitions(&self) -> &[PartitionInfo] {
        match self {
            PartitionTable::Mbr(p) | PartitionTable::Gpt(p) => p,
            PartitionTable::None => &[],
        }
    }
}

fn crc32(data: &[u8]) -> u32 {
    crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data)
}

/// Parse the partition table, following a protective MBR into the GPT.
pub fn read_table(device: &Arc<dyn BlockDevice>) -> Result<PartitionTable> {
    let sector = device.sector_size();
    let mut mbr = vec![0u8; sector.max(512)];
    device.read_at(0, &mut mbr)?;
    if mbr[MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2] != [0x55, 0xAA] {
        return Ok(PartitionTable::None);
    }
    let mut parts = Vec::new();
    for index in 0..4 {
        let at = MBR_TABLE_OFFSET + index * 16;
        let (raw, _) = MbrPartitionRaw::read_from_prefix(&mbr[at..])
            .map_err(|_| Error::invalid("MBR", "short sector"))?;
        if raw.ptype == 0 || raw.total_sectors.get() == 0 {
            continue;
        }
        if raw.ptype == 0xEE {
            return read_gpt(device);
        }
        parts.push(PartitionInfo {
            index,
            mbr_type: Some(raw.ptype),
            type_guid: None,
            name: None,
            bootable: raw.status == 0x80,
            attributes: 0,
            start_lba: raw.first_lba.get() as u64,
            sectors: raw.total_sectors.get() as u64,
        });
    }
    if parts.is_empty() {
        // A formatted-but-unpartitioned image carries the same signature;
        // an empty table means "no partitions" rather than an error.
        return Ok(PartitionTable::None);
    }
    Ok(PartitionTable::Mbr(parts))
}

fn read_gpt(device: &Arc<dyn BlockDevice>) -> Result<PartitionTable> {
    let sector = device.sector_size() as u64;
    let mut header_sector = vec![0u8; sector as usize];
    device.read_at(sector, &mut header_sector)?;
    let (header, _) = GptHeaderRaw::read_from_prefix(&header_sector)
        .map_err(|_| Error::invalid("GPT", "short header"))?;
    if &header.signature != b"EFI PART" {
        return Err(Error::invalid("GPT", "missing EFI PART signature"));
    }
    let header_size = header.header_size.get() as usize;
    if !(92..=sector as usize).contains(&header_size) {
        return Err(Error::invalid("GPT", format!("header size {header_size}")));
    }
    let mut for_crc = header_sector[..header_size].to_vec();
    for_crc[0x10..0x14].fill(0);
    let crc = crc32(&for_crc);
    if crc != header.header_crc32.get() {
        return Err(Error::invalid(
            "GPT",
            format!(
                "header CRC {crc:#010x} != stored {:#010x}",
                header.header_crc32.get()
            ),
        ));
    }

    let num = header.num_partition_entries.get() as usize;
    let entry_size = header.partition_entry_size.get() as usize;
    if entry_size < 128 || num > 1024 {
        return Err(Error::invalid("GPT", "implausible entry array shape"));
    }
    let mut array = vec![0u8; num * entry_size];
    device.read_at(header.partition_entry_lba.get() * sector, &mut array)?;
    let crc = crc32(&array);
    if crc != header.partition_array_crc32.get() {
        return Err(Error::invalid(
            "GPT",
            format!(
                "entry array CRC {crc:#010x} != stored {:#010x}",
                header.partition_array_crc32.get()
            ),
        ));
    }

    let mut parts = Vec::new();
    for index in 0..num {
        let (raw, _) = GptEntryRaw::read_from_prefix(&array[index * entry_size..])
            .map_err(|_| Error::invalid("GPT", "short entry"))?;
        if raw.type_guid == [0u8; 16] {
            continue;
        }
        let units: Vec<u16> = raw
            .name
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        let name = char::decode_utf16(units)
            .collect::<core::result::Result<String, _>>()
            .unwrap_or_default();
        parts.push(PartitionInfo {
            index,
            mbr_type: None,
            type_guid: Some(Uuid::from_bytes_le(raw.type_guid)),
            name: Some(name),
            bootable: false,
            attributes: raw.attributes.get(),
            start_lba: raw.starting_lba.get(),
            sectors: raw.ending_lba.get() - raw.starting_lba.get() + 1,
        });
    }
    Ok(PartitionTable::Gpt(parts))
}

/// A block-device window over partition `index`.
pub fn open_partition(
    device: &Arc<dyn BlockDevice>,
    index: usize,
) -> Result<Arc<dyn BlockDevice>> {
    let sector = device.sector_size() as u64;
    let table = read_table(device)?;
    let part = table
        .partitions()
        .iter()
        .find(|p| p.index == index)
        .ok_or_else(|| Error::NotFound(format!("partition {index}")))?;
    Ok(Arc::new(PartitionView::new(
        device.clone(),
        part.start_lba * sector,
        part.sectors * sector,
    )))
}

// ---- creation ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Vista-style MBR: 1 MiB-aligned, LBA types.
    Mbr,
    /// DOS-style MBR: track-aligned, CHS types where they fit.
    MbrOld,
    Gpt,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionOptions {
    /// Force the MBR type byte (e.g. 0x07 for an exFAT/NTFS partition).
    pub mbr_type: Option<u8>,
    /// GPT partition name.
    pub name: Option<String>,
}

/// MBR type byte for a FAT-family partition of `size` bytes, per the
/// scheme's addressing mode.
fn auto_mbr_type(size: u64, lba: bool) -> u8 {
    if size < 16 << 20 {
        0x01 // FAT12
    } else if size < 32 << 20 {
        0x04 // FAT16 under 32 MiB
    } else if size < 512 << 20 {
        0x06 // FAT16
    } else if lba {
        0x0C // FAT32 LBA
    } else {
        0x0B // FAT32 CHS
    }
}

/// Write a single partition spanning the disk in the chosen scheme.
/// 33 sectors stay reserved at the disk end so an MBR disk can later be
/// converted to GPT in place.
pub fn partition(
    device: &Arc<dyn BlockDevice>,
    scheme: Scheme,
    options: &PartitionOptions,
) -> Result<PartitionTable> {
    let sector = device.sector_size() as u64;
    let size = device.size();
    match scheme {
        Scheme::Mbr | Scheme::MbrOld => {
            let lba_mode = scheme == Scheme::Mbr;
            let start = if lba_mode {
                1u64 << 20
            } else {
                SECTORS_PER_TRACK * sector
            };
            let reserved_tail = 33 * sector;
            let part_size = size
                .checked_sub(start + reserved_tail)
                .ok_or(Error::NoSpace)?;
            let ptype = options
                .mbr_type
                .unwrap_or_else(|| auto_mbr_type(part_size, lba_mode));

            let mut sector0 = vec![0u8; sector as usize];
            let (_, heads, _) = size2chs(size);
            let first_lba = start / sector;
            let total = part_size / sector;
            let raw = MbrPartitionRaw {
                status: 0x80,
                first_chs: {
                    let (c, h, s) = lba2chs(first_lba, heads as u64);
                    chs2raw(c, h, s)
                },
                ptype,
                last_chs: {
                    let (c, h, s) = lba2chs(first_lba + total - 1, heads as u64);
                    chs2raw(c, h, s)
                },
                first_lba: U32::new(first_lba as u32),
                total_sectors: U32::new(total as u32),
            };
            sector0[MBR_TABLE_OFFSET..MBR_TABLE_OFFSET + 16].copy_from_slice(raw.as_bytes());
            sector0[MBR_SIGNATURE_OFFSET] = 0x55;
            sector0[MBR_SIGNATURE_OFFSET + 1] = 0xAA;
            // Drop any stale GPT structures, old boot sector and backup
            // header.
            device.write_at(0, &vec![0u8; (32 << 10).min(size as usize)])?;
            device.write_at(0, &sector0)?;
            device.write_at(start, &vec![0u8; sector as usize])?;
            device.write_at(size - sector, &vec![0u8; sector as usize])?;
            device.flush()?;
            debug!("wrote MBR: type {ptype:#04x}, LBA {first_lba}, {total} sectors");
        }
        Scheme::Gpt => {
            let num_entries = 128u32;
            let entry_size = 128u32;
            let array_bytes = (num_entries * entry_size) as u64;
            let alternate_lba = size / sector - 1;
            let first_usable = 2 + array_bytes / sector; // LBA 34 on 512-byte sectors
            let last_usable = alternate_lba - array_bytes / sector - 1;
            let start_lba = 2048u64;
            let end_lba = last_usable - 1;
            if end_lba <= start_lba {
                return Err(Error::NoSpace);
            }

            // Protective MBR.
            let mut sector0 = vec![0u8; sector as usize];
            let raw = MbrPartitionRaw {
                status: 0,
                first_chs: chs2raw(0, 0, 2),
                ptype: 0xEE,
                last_chs: [254, 255, 255],
                first_lba: U32::new(1),
                total_sectors: U32::new(0xFFFF_FFFFu64.min(size / sector - 1) as u32),
            };
            sector0[MBR_TABLE_OFFSET..MBR_TABLE_OFFSET + 16].copy_from_slice(raw.as_bytes());
            sector0[MBR_SIGNATURE_OFFSET] = 0x55;
            sector0[MBR_SIGNATURE_OFFSET + 1] = 0xAA;
            device.write_at(0, &sector0)?;

            // Entry array: one basic-data partition.
            let mut array = vec![0u8; array_bytes as usize];
            {
                let (entry, _) = GptEntryRaw::mut_from_prefix(&mut array)
                    .map_err(|_| Error::invalid("GPT", "layout"))?;
                entry.type_guid = BASIC_DATA_GUID.to_bytes_le();
                entry.unique_guid = *Uuid::new_v4().as_bytes();
                entry.starting_lba.set(start_lba);
                entry.ending_lba.set(end_lba);
                let name = options.name.clone().unwrap_or_default();
                for (i, u) in name.encode_utf16().take(36).enumerate() {
                    entry.name[i * 2..i * 2 + 2].copy_from_slice(&u.to_le_bytes());
                }
            }
            let array_crc = crc32(&array);

            let mut header = GptHeaderRaw::read_from_bytes(&[0u8; 92])
                .map_err(|_| Error::invalid("GPT", "layout"))?;
            header.signature = *b"EFI PART";
            header.revision.set(0x0001_0000);
            header.header_size.set(92);
            header.my_lba.set(1);
            header.alternate_lba.set(alternate_lba);
            header.first_usable_lba.set(first_usable);
            header.last_usable_lba.set(last_usable);
            header.disk_guid = Uuid::new_v4().to_bytes_le();
            header.partition_entry_lba.set(2);
            header.num_partition_entries.set(num_entries);
            header.partition_entry_size.set(entry_size);
            header.partition_array_crc32.set(array_crc);
            let seal = |header: &mut GptHeaderRaw| {
                header.header_crc32.set(0);
                let crc = crc32(header.as_bytes());
                header.header_crc32.set(crc);
            };
            seal(&mut header);

            let mut header_sector = vec![0u8; sector as usize];
            header_sector[..92].copy_from_slice(header.as_bytes());
            device.write_at(sector, &header_sector)?;
            device.write_at(2 * sector, &array)?;
            // Blank the partition's first sector.
            device.write_at(start_lba * sector, &vec![0u8; sector as usize])?;

            // Backup array and header at the disk end.
            device.write_at((last_usable + 1) * sector, &array)?;
            header.my_lba.set(alternate_lba);
            header.alternate_lba.set(1);
            header.partition_entry_lba.set(last_usable + 1);
            seal(&mut header);
            header_sector[..92].copy_from_slice(header.as_bytes());
            device.write_at(alternate_lba * sector, &header_sector)?;
            device.flush()?;
            debug!("wrote GPT: data partition LBA {start_lba}..{end_lba}");
        }
    }
    read_table(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    #[test]
    fn chs_round_trip_below_limit() {
        for lba in [0u64, 62, 63, 1000, 16064, 1_000_000] {
            let (c, h, s) = lba2chs(lba, 16);
            assert_eq!(chs2lba(c, h, s, 16), lba, "lba {lba}");
            let raw = chs2raw(c, h, s);
            if c <= 1023 {
                assert_eq!(raw2chs(raw), (c, h, s));
            }
        }
    }

    #[test]
    fn chs_saturates_past_cylinder_limit() {
        assert_eq!(chs2raw(1024, 1, 1), [254, 255, 255]);
    }

    #[test]
    fn floppy_geometries_are_canonical() {
        assert_eq!(size2chs(1440 * 1024), (80, 2, 18));
        assert_eq!(size2chs(720 * 1024), (80, 2, 9));
    }

    #[test]
    fn mbr_round_trip() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(64 << 20));
        let table = partition(&device, Scheme::Mbr, &PartitionOptions::default()).unwrap();
        let parts = table.partitions();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_lba, 2048);
        assert!(parts[0].bootable);
        assert_eq!(parts[0].mbr_type, Some(0x06)); // FAT16-sized disk
        let mut sig = [0u8; 2];
        device.read_at(510, &mut sig).unwrap();
        assert_eq!(sig, [0x55, 0xAA]);
    }

    #[test]
    fn gpt_round_trip_with_crcs() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(64 << 20));
        let table = partition(&device, Scheme::Gpt, &PartitionOptions::default()).unwrap();
        let parts = table.partitions();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_lba, 2048);
        assert_eq!(parts[0].type_guid, Some(BASIC_DATA_GUID));
        // Corrupting the header must fail the CRC check.
        let mut byte = [0u8];
        device.read_at(512 + 40, &mut byte).unwrap();
        device.write_at(512 + 40, &[byte[0] ^ 0xFF]).unwrap();
        assert!(matches!(
            read_table(&device),
            Err(Error::InvalidFormat { .. })
        ));
    }

    #[test]
    fn partition_view_is_usable() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(64 << 20));
        partition(&device, Scheme::Mbr, &PartitionOptions::default()).unwrap();
        let part = open_partition(&device, 0).unwrap();
        part.write_at(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        device.read_at(2048 * 512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
