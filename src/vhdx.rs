//! VHDX backend
//!
//! File layout, every structure little-endian and CRC-32C sealed (the
//! checksum field at offset 4 zeroed while hashing):
//!
//! ```text
//! 0        64 KiB file type identifier, "vhdxfile"
//! 64 KiB   header 1 ("head", 4 KiB)     128 KiB  header 2
//! 192 KiB  region table ("regi", 64 KiB) 256 KiB its copy
//! 1 MiB    log (1 MiB circular)
//! 2 MiB    metadata region (1 MiB)       3 MiB   BAT region, then payload
//! ```
//!
//! The active header is the valid one with the highest sequence number;
//! both copies are resequenced and rewritten on the first write after
//! open, replacing the File-Write GUID (and the Data-Write GUID on the
//! first user-data change, which orphans linked children). Metadata is a
//! GUID-keyed table: block size and flags, virtual disk size, logical and
//! physical sector size, disk GUID, and — on differencing disks — a parent
//! locator of UTF-16 key/value pairs whose `parent_linkage` value must
//! equal the parent's Data-Write GUID.
//!
//! A BAT entry is 64-bit: 3 state bits and a 44-bit MiB-aligned file
//! offset. After every `chunk_ratio = (2^23 * logical_sector_size) /
//! block_size` payload entries one sector-bitmap entry follows; a 1 MiB
//! bitmap block covers 2^23 sectors, LSB first. A PARTIALLY_PRESENT block
//! reads through the bitmap, sector by sector, falling back to the parent;
//! writing a partial sector copies it down first.
//!
//! The log is a ring of 4 KiB records: an entry header ("loge") with zero
//! descriptors and data descriptors (+ 4 KiB data sectors), each carrying
//! the entry's sequence number. A self-pointing entry (tail == own
//! offset) starts a sequence. When a nonzero log GUID survives in the
//! active header, the highest self-pointing entry's sequence is replayed
//! before any user I/O, then the GUID is cleared and the headers
//! resequenced.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use spin::Mutex;
use uuid::Uuid;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

pub const VHDX_SIGNATURE: &[u8; 8] = b"vhdxfile";
const HEADER1_OFFSET: u64 = 64 << 10;
const HEADER2_OFFSET: u64 = 128 << 10;
const REGION1_OFFSET: u64 = 192 << 10;
const REGION2_OFFSET: u64 = 256 << 10;
const LOG_RECORD: u64 = 4096;

pub const METADATA_REGION_GUID: Uuid = Uuid::from_u128(0x8B7C_A206_4790_4B9A_B8FE_575F_050F_886E);
pub const BAT_REGION_GUID: Uuid = Uuid::from_u128(0x2DC2_7766_F623_4200_9D64_115E_9BFD_4A08);

pub const MD_FILE_PARAMETERS: Uuid = Uuid::from_u128(0xCAA1_6737_FA36_4D43_B3B6_33F0_AA44_E76B);
pub const MD_VIRTUAL_DISK_SIZE: Uuid = Uuid::from_u128(0x2FA5_4224_CD1B_4876_B211_5DBE_D83B_F4B8);
pub const MD_LOGICAL_SECTOR_SIZE: Uuid = Uuid::from_u128(0x8141_BF1D_A96F_4709_BA47_F233_A8FA_AB5F);
pub const MD_PHYSICAL_SECTOR_SIZE: Uuid = Uuid::from_u128(0xCDA3_48C7_445D_4471_9CC9_E988_5251_C556);
pub const MD_VIRTUAL_DISK_ID: Uuid = Uuid::from_u128(0xBECA_12AB_B2E6_4523_93EF_C309_E000_C746);
pub const MD_PARENT_LOCATOR: Uuid = Uuid::from_u128(0xA8D3_5F2D_B30B_454D_ABF7_D3D8_4834_AB0C);
pub const PARENT_LOCATOR_TYPE: Uuid = Uuid::from_u128(0xB04A_EFB7_D19E_4A81_B789_25B8_E944_5913);

// Payload block states (3 bits of a BAT entry).
pub const PAYLOAD_BLOCK_NOT_PRESENT: u64 = 0;
pub const PAYLOAD_BLOCK_UNDEFINED: u64 = 1;
pub const PAYLOAD_BLOCK_ZERO: u64 = 2;
pub const PAYLOAD_BLOCK_UNMAPPED: u64 = 3;
pub const PAYLOAD_BLOCK_FULLY_PRESENT: u64 = 6;
pub const PAYLOAD_BLOCK_PARTIALLY_PRESENT: u64 = 7;
pub const SB_BLOCK_PRESENT: u64 = 6;

const STATE_MASK: u64 = 0xFFFFF;
const OFFSET_MASK: u64 = !STATE_MASK;

fn crc32c(data: &[u8]) -> u32 {
    crc::Crc::<u32>::new(&crc::CRC_32_ISCSI).checksum(data)
}

/// CRC over a structure whose checksum lives at bytes 4..8.
fn crc32c_zeroed_field(data: &[u8]) -> u32 {
    let mut copy = data.to_vec();
    copy[4..8].fill(0);
    crc32c(&copy)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct VhdxHeader {
    /// "head"
    pub signature: [u8; 4],
    /// CRC-32C of the 4 KiB header, this field zeroed.
    pub checksum: U32,
    /// The greater of the two copies is the live header.
    pub sequence_number: U64,
    /// Replaced on the first file write after open.
    pub file_write_guid: [u8; 16],
    /// Replaced on the first user-data write; children key on it.
    pub data_write_guid: [u8; 16],
    /// Nonzero while a log session is open; replayed at mount.
    pub log_guid: [u8; 16],
    pub log_version: U16,
    /// 1 for format version 2.
    pub version: U16,
    /// Log length, a 1 MiB multiple.
    pub log_length: U32,
    pub log_offset: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RegionTableHeader {
    /// "regi"
    pub signature: [u8; 4],
    /// CRC-32C over the whole 64 KiB table, this field zeroed.
    pub checksum: U32,
    pub entry_count: U32,
    pub reserved: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RegionTableEntry {
    pub guid: [u8; 16],
    pub file_offset: U64,
    pub length: U32,
    pub required: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MetadataEntry {
    pub item_id: [u8; 16],
    /// Offset inside the metadata region, at least 64 KiB.
    pub offset: U32,
    pub length: U32,
    /// Bit 0: IsUser; bit 1: IsVirtualDisk; bit 2: IsRequired.
    pub flags: U32,
    pub reserved: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct LogEntryHeader {
    /// "loge"
    pub signature: [u8; 4],
    /// CRC-32C over `entry_length` bytes, this field zeroed.
    pub checksum: U32,
    /// 4 KiB multiple.
    pub entry_length: U32,
    /// Log offset of the first entry of this sequence.
    pub tail: U32,
    pub sequence_number: U64,
    pub descriptor_count: U64,
    /// Must match the header's log GUID to be live.
    pub log_guid: [u8; 16],
    /// File size when the entry was written; the replay floor.
    pub flushed_file_offset: U64,
    pub last_file_offset: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ZeroDescriptor {
    /// "zero"
    pub signature: [u8; 4],
    pub reserved: U32,
    /// 4 KiB multiple.
    pub zero_length: U64,
    pub file_offset: U64,
    pub sequence_number: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DataDescriptor {
    /// "desc"
    pub signature: [u8; 4],
    /// The 4 bytes the data sector's trailer displaced.
    pub trailing_bytes: U32,
    /// The 8 bytes its header displaced.
    pub leading_bytes: U64,
    pub file_offset: U64,
    pub sequence_number: U64,
}

/// Everything the metadata region told us.
#[derive(Debug, Clone, Default)]
struct Metadata {
    block_size: u32,
    /// Bit 0: LeaveBlockAllocated; bit 1: HasParent.
    file_params: u32,
    disk_size: u64,
    logical_sector_size: u32,
    physical_sector_size: u32,
    disk_guid: [u8; 16],
    parent: Vec<(String, String)>,
}

struct VhdxState {
    file: File,
    bat: Vec<u64>,
    /// (file offset, 1 MiB contents, dirty) of the loaded bitmap block.
    bitmap: Option<(u64, Vec<u8>, bool)>,
    parent: Option<Box<VhdxDisk>>,
    header: VhdxHeader,
    headers_updated: bool,
}

pub struct VhdxDisk {
    path: PathBuf,
    state: Mutex<VhdxState>,
    size: u64,
    block_size: u64,
    logical_sector_size: u64,
    chunk_ratio: u64,
    bat_offset: u64,
    metadata: Metadata,
    read_only: bool,
}

impl VhdxDisk {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        if file.metadata()?.len() < 4 << 20 {
            return Err(Error::invalid("VHDX header", "file below minimum size"));
        }
        let mut sig = [0u8; 8];
        file.read_exact(&mut sig)?;
        if &sig != VHDX_SIGNATURE {
            return Err(Error::invalid("VHDX header", "missing vhdxfile signature"));
        }

        let h1 = read_header(&mut file, HEADER1_OFFSET)?;
        let h2 = read_header(&mut file, HEADER2_OFFSET)?;
        let mut header = match (h1, h2) {
            (Some(a), Some(b)) => {
                if a.sequence_number.get() >= b.sequence_number.get() {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                return Err(Error::invalid("VHDX header", "both header copies invalid"))
            }
        };

        // A surviving log GUID means an unclean shutdown: replay before
        // anything else sees the payload.
        if header.log_guid != [0u8; 16] {
            if read_only {
                return Err(Error::invalid(
                    "VHDX log",
                    "dirty log on a read-only open",
                ));
            }
            replay_log(&mut file, &header)?;
            header.log_guid = [0u8; 16];
            resequence_headers(&mut file, &mut header)?;
        }

        // Region table, with the copy as fallback.
        let regions = match read_region_table(&mut file, REGION1_OFFSET)? {
            Some(r) => r,
            None => read_region_table(&mut file, REGION2_OFFSET)?
                .ok_or_else(|| Error::invalid("VHDX header", "both region tables invalid"))?,
        };
        let mut metadata_region = None;
        let mut bat_region = None;
        for (guid, offset, length) in &regions {
            if *guid == METADATA_REGION_GUID {
                metadata_region = Some((*offset, *length));
            } else if *guid == BAT_REGION_GUID {
                bat_region = Some((*offset, *length));
            }
        }
        let (md_offset, _) = metadata_region
            .ok_or_else(|| Error::invalid("VHDX header", "no metadata region"))?;
        let (bat_offset, bat_length) =
            bat_region.ok_or_else(|| Error::invalid("VHDX header", "no BAT region"))?;

        let metadata = read_metadata(&mut file, md_offset)?;
        let block_size = metadata.block_size as u64;
        if !(1 << 20..=256 << 20).contains(&block_size) || !block_size.is_power_of_two() {
            return Err(Error::invalid(
                "VHDX header",
                format!("block size {block_size}"),
            ));
        }
        let lss = metadata.logical_sector_size as u64;
        if lss != 512 && lss != 4096 {
            return Err(Error::invalid(
                "VHDX header",
                format!("logical sector size {lss}"),
            ));
        }
        let chunk_ratio = ((1u64 << 23) * lss) / block_size;

        let mut bat_raw = vec![0u8; bat_length as usize];
        file.seek(SeekFrom::Start(bat_offset))?;
        file.read_exact(&mut bat_raw)?;
        let bat: Vec<u64> = bat_raw
            .chunks_exact(8)
            .map(|c| {
                u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            })
            .collect();

        let parent = if metadata.file_params & 2 != 0 {
            Some(Box::new(open_parent(&path, &metadata)?))
        } else {
            None
        };

        Ok(Self {
            size: metadata.disk_size,
            block_size,
            logical_sector_size: lss,
            chunk_ratio,
            bat_offset,
            state: Mutex::new(VhdxState {
                file,
                bat,
                bitmap: None,
                parent,
                header,
                headers_updated: false,
            }),
            metadata,
            path,
            read_only,
        })
    }

    pub fn data_write_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.state.lock().header.data_write_guid)
    }

    pub fn disk_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.metadata.disk_guid)
    }

    /// Create a dynamic VHDX (`block_size` a power of two in [1 MiB,
    /// 256 MiB]).
    pub fn create_dynamic(path: impl AsRef<Path>, size: u64, block_size: u32) -> Result<Self> {
        create_image(path.as_ref(), size, block_size, None)?;
        Self::open(path, false)
    }

    /// Create a differencing child of `parent`.
    pub fn create_differencing(path: impl AsRef<Path>, parent: impl AsRef<Path>) -> Result<Self> {
        let base = VhdxDisk::open(parent.as_ref(), true)?;
        let linkage = format!(
            "{{{}}}",
            Uuid::from_bytes_le(base.state.lock().header.data_write_guid)
        );
        let rel = parent.as_ref().to_string_lossy().into_owned();
        let abs = std::fs::canonicalize(parent.as_ref())?
            .to_string_lossy()
            .into_owned();
        let locator = vec![
            ("parent_linkage".to_string(), linkage),
            ("relative_path".to_string(), rel),
            ("absolute_win32_path".to_string(), abs),
        ];
        create_image(
            path.as_ref(),
            base.size,
            base.block_size as u32,
            Some(locator),
        )?;
        Self::open(path, false)
    }

    #[inline]
    fn bat_index(&self, block: u64) -> usize {
        (block + block / self.chunk_ratio) as usize
    }

    #[inline]
    fn bitmap_bat_index(&self, block: u64) -> usize {
        (((block + self.chunk_ratio) / self.chunk_ratio) * self.chunk_ratio
            + block / self.chunk_ratio) as usize
    }

    fn set_bat(&self, state: &mut VhdxState, index: usize, value: u64) -> Result<()> {
        state.bat[index] = value;
        state
            .file
            .seek(SeekFrom::Start(self.bat_offset + index as u64 * 8))?;
        state.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Allocate a 1 MiB-aligned block (payload or bitmap) at EOF.
    fn allocate_block(&self, state: &mut VhdxState, bytes: u64) -> Result<u64> {
        let end = state.file.metadata()?.len();
        debug_assert_eq!(end % (1 << 20), 0);
        state.file.set_len(end + bytes)?;
        Ok(end)
    }

    fn load_bitmap(&self, state: &mut VhdxState, offset: u64) -> Result<()> {
        if let Some((cur, _, _)) = &state.bitmap {
            if *cur == offset {
                return Ok(());
            }
        }
        self.flush_bitmap(state)?;
        let mut bytes = vec![0u8; 1 << 20];
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut bytes)?;
        state.bitmap = Some((offset, bytes, false));
        Ok(())
    }

    fn flush_bitmap(&self, state: &mut VhdxState) -> Result<()> {
        if let Some((offset, bytes, dirty)) = state.bitmap.take() {
            if dirty {
                state.file.seek(SeekFrom::Start(offset))?;
                state.file.write_all(&bytes)?;
            }
        }
        Ok(())
    }

    fn has_block(&self, state: &VhdxState, offset: u64) -> bool {
        let block = offset / self.block_size;
        if state.bat[self.bat_index(block)] & STATE_MASK != PAYLOAD_BLOCK_NOT_PRESENT {
            return true;
        }
        match &state.parent {
            Some(parent) => {
                let pstate = parent.state.lock();
                parent.has_block(&pstate, offset)
            }
            None => false,
        }
    }

    /// First-write protocol: bump the sequence and regenerate both write
    /// GUIDs, rewriting both header copies.
    fn touch_headers(&self, state: &mut VhdxState) -> Result<()> {
        if state.headers_updated {
            return Ok(());
        }
        let mut header = state.header;
        header.file_write_guid = Uuid::new_v4().to_bytes_le();
        header.data_write_guid = Uuid::new_v4().to_bytes_le();
        resequence_headers(&mut state.file, &mut header)?;
        state.header = header;
        state.headers_updated = true;
        Ok(())
    }
}

fn read_header(file: &mut File, offset: u64) -> Result<Option<VhdxHeader>> {
    let mut raw = vec![0u8; 4096];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut raw)?;
    let Ok(header) = VhdxHeader::read_from_prefix(&raw).map(|(h, _)| h) else {
        return Ok(None);
    };
    if &header.signature != b"head" {
        return Ok(None);
    }
    if header.checksum.get() != crc32c_zeroed_field(&raw) {
        warn!("VHDX header at {offset:#x}: checksum mismatch");
        return Ok(None);
    }
    Ok(Some(header))
}

/// Write both header copies, bumping the sequence number for each so the
/// second becomes the live one.
fn resequence_headers(file: &mut File, header: &mut VhdxHeader) -> Result<()> {
    for offset in [HEADER1_OFFSET, HEADER2_OFFSET] {
        header.sequence_number
            .set(header.sequence_number.get().wrapping_add(1));
        let mut raw = vec![0u8; 4096];
        header.checksum.set(0);
        raw[..core::mem::size_of::<VhdxHeader>()].copy_from_slice(header.as_bytes());
        let crc = crc32c(&raw);
        header.checksum.set(crc);
        raw[4..8].copy_from_slice(&crc.to_le_bytes());
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&raw)?;
    }
    Ok(())
}

fn read_region_table(
    file: &mut File,
    offset: u64,
) -> Result<Option<Vec<(Uuid, u64, u32)>>> {
    let mut raw = vec![0u8; 64 << 10];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut raw)?;
    let Ok((header, _)) = RegionTableHeader::read_from_prefix(&raw) else {
        return Ok(None);
    };
    if &header.signature != b"regi" || header.entry_count.get() > 2047 {
        return Ok(None);
    }
    if header.checksum.get() != crc32c_zeroed_field(&raw) {
        warn!("VHDX region table at {offset:#x}: checksum mismatch");
        return Ok(None);
    }
    let mut regions = Vec::new();
    for i in 0..header.entry_count.get() as usize {
        let at = 16 + i * 32;
        let Ok((entry, _)) = RegionTableEntry::read_from_prefix(&raw[at..]) else {
            break;
        };
        regions.push((
            Uuid::from_bytes_le(entry.guid),
            entry.file_offset.get(),
            entry.length.get(),
        ));
    }
    Ok(Some(regions))
}

fn read_metadata(file: &mut File, region_offset: u64) -> Result<Metadata> {
    let mut raw = vec![0u8; 1 << 20];
    file.seek(SeekFrom::Start(region_offset))?;
    file.read_exact(&mut raw)?;
    if &raw[..8] != b"metadata" {
        return Err(Error::invalid("VHDX header", "bad metadata signature"));
    }
    let entry_count = u16::from_le_bytes([raw[10], raw[11]]) as usize;
    if entry_count > 2047 {
        return Err(Error::invalid("VHDX header", "implausible metadata count"));
    }
    let mut md = Metadata {
        physical_sector_size: 512,
        ..Default::default()
    };
    for i in 0..entry_count {
        let at = 32 + i * 32;
        let (entry, _) = MetadataEntry::read_from_prefix(&raw[at..])
            .map_err(|_| Error::invalid("VHDX header", "short metadata entry"))?;
        let offset = entry.offset.get() as usize;
        let length = entry.length.get() as usize;
        if offset == 0 && length == 0 {
            continue;
        }
        if offset < (64 << 10) || offset + length > (1 << 20) {
            return Err(Error::invalid("VHDX header", "metadata entry out of region"));
        }
        let value = &raw[offset..offset + length];
        let id = Uuid::from_bytes_le(entry.item_id);
        if id == MD_FILE_PARAMETERS {
            md.block_size = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
            md.file_params = u32::from_le_bytes([value[4], value[5], value[6], value[7]]);
        } else if id == MD_VIRTUAL_DISK_SIZE {
            md.disk_size = u64::from_le_bytes([
                value[0], value[1], value[2], value[3], value[4], value[5], value[6], value[7],
            ]);
        } else if id == MD_LOGICAL_SECTOR_SIZE {
            md.logical_sector_size =
                u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
        } else if id == MD_PHYSICAL_SECTOR_SIZE {
            md.physical_sector_size =
                u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
        } else if id == MD_VIRTUAL_DISK_ID {
            md.disk_guid.copy_from_slice(&value[..16]);
        } else if id == MD_PARENT_LOCATOR {
            md.parent = parse_parent_locator(value)?;
        } else {
            debug!("unknown metadata entry {id}");
        }
    }
    Ok(md)
}

fn parse_parent_locator(raw: &[u8]) -> Result<Vec<(String, String)>> {
    if raw.len() < 20 {
        return Err(Error::invalid("VHDX header", "short parent locator"));
    }
    let count = u16::from_le_bytes([raw[18], raw[19]]) as usize;
    let mut entries = Vec::new();
    for j in 0..count {
        let i = 20 + j * 12;
        if i + 12 > raw.len() {
            break;
        }
        let ko = u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]) as usize;
        let vo = u32::from_le_bytes([raw[i + 4], raw[i + 5], raw[i + 6], raw[i + 7]]) as usize;
        let kl = u16::from_le_bytes([raw[i + 8], raw[i + 9]]) as usize;
        let vl = u16::from_le_bytes([raw[i + 10], raw[i + 11]]) as usize;
        if ko + kl > raw.len() || vo + vl > raw.len() {
            return Err(Error::invalid("VHDX header", "parent locator out of range"));
        }
        let decode = |bytes: &[u8]| -> Result<String> {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            char::decode_utf16(units)
                .collect::<core::result::Result<String, _>>()
                .map_err(|_| Error::invalid("VHDX header", "bad locator string"))
        };
        entries.push((decode(&raw[ko..ko + kl])?, decode(&raw[vo..vo + vl])?));
    }
    Ok(entries)
}

fn open_parent(child: &Path, metadata: &Metadata) -> Result<VhdxDisk> {
    let lookup = |key: &str| {
        metadata
            .parent
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    let mut candidates = Vec::new();
    for key in ["relative_path", "volume_path", "absolute_win32_path"] {
        if let Some(v) = lookup(key) {
            candidates.push(v.replace('\\', "/"));
        }
    }
    let linkage = lookup("parent_linkage")
        .ok_or_else(|| Error::ParentLink("no parent_linkage entry".into()))?;
    for candidate in &candidates {
        let p = PathBuf::from(candidate);
        let resolved = if p.is_absolute() {
            p
        } else {
            child.parent().unwrap_or(Path::new(".")).join(p)
        };
        if !resolved.exists() {
            continue;
        }
        let parent = VhdxDisk::open(&resolved, true)?;
        let guid = format!(
            "{{{}}}",
            Uuid::from_bytes_le(parent.state.lock().header.data_write_guid)
        );
        if !guid.eq_ignore_ascii_case(&linkage) {
            return Err(Error::ParentLink(format!(
                "{}: data-write GUID {guid} does not match linkage {linkage}",
                resolved.display()
            )));
        }
        return Ok(parent);
    }
    Err(Error::ParentLink(format!(
        "{}: no locator leads to an existing parent",
        child.display()
    )))
}

/// Scan the log for the active sequence and replay it: each data
/// descriptor restores its 4 KiB sector (leading and trailing bytes come
/// from the descriptor itself), each zero descriptor zeroes its range.
fn replay_log(file: &mut File, header: &VhdxHeader) -> Result<()> {
    let log_offset = header.log_offset.get();
    let log_length = header.log_length.get() as u64;
    let mut raw_log = vec![0u8; log_length as usize];
    file.seek(SeekFrom::Start(log_offset))?;
    file.read_exact(&mut raw_log)?;

    // Find the self-pointing entry with the highest sequence number.
    let mut best: Option<(u64, u64)> = None; // (offset, sequence)
    let mut i = 0u64;
    while i < log_length {
        if let Some(entry) = log_entry_at(&raw_log, i, header) {
            if entry.tail.get() as u64 == i {
                let seq = entry.sequence_number.get();
                if best.map(|(_, s)| seq > s).unwrap_or(true) {
                    best = Some((i, seq));
                }
            }
        }
        i += LOG_RECORD;
    }
    let Some((tail, mut seq)) = best else {
        return Err(Error::invalid("VHDX log", "no active sequence found"));
    };
    debug!("log replay: sequence {seq} tail at {tail:#x}");

    // Collect the consecutive entries of the sequence, then replay.
    let mut entries = vec![tail];
    let mut i = tail + entry_length_at(&raw_log, tail);
    while i < log_length {
        let Some(entry) = log_entry_at(&raw_log, i, header) else {
            break;
        };
        if entry.tail.get() as u64 != tail || entry.sequence_number.get() != seq + 1 {
            break;
        }
        seq = entry.sequence_number.get();
        entries.push(i);
        i += entry.entry_length.get() as u64;
    }

    let mut flushed_floor = 0u64;
    for &entry_offset in &entries {
        let Some(entry) = log_entry_at(&raw_log, entry_offset, header) else {
            continue;
        };
        flushed_floor = flushed_floor.max(entry.flushed_file_offset.get());
        let count = entry.descriptor_count.get() as usize;
        let descriptors_bytes = 64 + 32 * count as u64;
        let sector_base = descriptors_bytes.div_ceil(LOG_RECORD) * LOG_RECORD;
        let mut data_index = 0u64;
        for j in 0..count {
            let at = (entry_offset + 64 + 32 * j as u64) as usize;
            match &raw_log[at..at + 4] {
                b"zero" => {
                    let (desc, _) = ZeroDescriptor::read_from_prefix(&raw_log[at..])
                        .map_err(|_| Error::invalid("VHDX log", "short descriptor"))?;
                    if desc.sequence_number.get() != entry.sequence_number.get() {
                        return Err(Error::invalid("VHDX log", "descriptor sequence mismatch"));
                    }
                    let zeros = vec![0u8; desc.zero_length.get() as usize];
                    file.seek(SeekFrom::Start(desc.file_offset.get()))?;
                    file.write_all(&zeros)?;
                    debug!(
                        "log replay: zeroed {} bytes at {:#x}",
                        desc.zero_length.get(),
                        desc.file_offset.get()
                    );
                }
                b"desc" => {
                    let (desc, _) = DataDescriptor::read_from_prefix(&raw_log[at..])
                        .map_err(|_| Error::invalid("VHDX log", "short descriptor"))?;
                    if desc.sequence_number.get() != entry.sequence_number.get() {
                        return Err(Error::invalid("VHDX log", "descriptor sequence mismatch"));
                    }
                    let sec_at =
                        (entry_offset + sector_base + data_index * LOG_RECORD) as usize;
                    data_index += 1;
                    let sector = &raw_log[sec_at..sec_at + LOG_RECORD as usize];
                    if &sector[..4] != b"data" {
                        return Err(Error::invalid("VHDX log", "missing data sector"));
                    }
                    let seq_high = u32::from_le_bytes([
                        sector[4], sector[5], sector[6], sector[7],
                    ]) as u64;
                    let seq_low = u32::from_le_bytes([
                        sector[4092], sector[4093], sector[4094], sector[4095],
                    ]) as u64;
                    if (seq_high << 32 | seq_low) != entry.sequence_number.get() {
                        return Err(Error::invalid("VHDX log", "data sector sequence mismatch"));
                    }
                    let mut restored = sector.to_vec();
                    restored[..8].copy_from_slice(&desc.leading_bytes.get().to_le_bytes());
                    restored[4092..4096]
                        .copy_from_slice(&desc.trailing_bytes.get().to_le_bytes());
                    file.seek(SeekFrom::Start(desc.file_offset.get()))?;
                    file.write_all(&restored)?;
                    debug!("log replay: restored sector at {:#x}", desc.file_offset.get());
                }
                other => {
                    return Err(Error::invalid(
                        "VHDX log",
                        format!("unknown descriptor {other:02x?}"),
                    ));
                }
            }
        }
    }
    // The log may describe writes past the current end of file.
    if file.metadata()?.len() < flushed_floor {
        file.set_len(flushed_floor)?;
    }
    Ok(())
}

fn entry_length_at(raw_log: &[u8], offset: u64) -> u64 {
    let at = offset as usize;
    (u32::from_le_bytes([raw_log[at + 8], raw_log[at + 9], raw_log[at + 10], raw_log[at + 11]])
        as u64)
        .max(LOG_RECORD)
}

/// Validated log entry header at `offset`, or None.
fn log_entry_at(raw_log: &[u8], offset: u64, header: &VhdxHeader) -> Option<LogEntryHeader> {
    let at = offset as usize;
    if at + LOG_RECORD as usize > raw_log.len() {
        return None;
    }
    let (entry, _) = LogEntryHeader::read_from_prefix(&raw_log[at..]).ok()?;
    if &entry.signature != b"loge" {
        return None;
    }
    let length = entry.entry_length.get() as u64;
    if length == 0
        || length % LOG_RECORD != 0
        || entry.tail.get() as u64 % LOG_RECORD != 0
        || offset + length > raw_log.len() as u64
    {
        return None;
    }
    if entry.log_guid != header.log_guid {
        return None;
    }
    let crc = crc32c_zeroed_field(&raw_log[at..at + length as usize]);
    if crc != entry.checksum.get() {
        return None;
    }
    Some(entry)
}

/// BAT sizing: payload entries interleaved with one bitmap entry per
/// chunk, the whole table padded to 1 MiB.
fn bat_facts(disk_size: u64, block_size: u64, lss: u64, differencing: bool) -> (u64, u64, u64) {
    let chunk_ratio = ((1u64 << 23) * lss) / block_size;
    let data_blocks = disk_size.div_ceil(block_size);
    let bitmap_blocks = data_blocks.div_ceil(chunk_ratio);
    let entries = if differencing {
        bitmap_blocks * (chunk_ratio + 1)
    } else {
        data_blocks + (data_blocks.saturating_sub(1)) / chunk_ratio
    };
    let bat_bytes = (entries * 8).div_ceil(1 << 20) << 20;
    (bat_bytes, entries, chunk_ratio)
}

fn create_image(
    path: &Path,
    size: u64,
    block_size: u32,
    parent_locator: Option<Vec<(String, String)>>,
) -> Result<()> {
    if !(1 << 20..=256 << 20).contains(&(block_size as u64))
        || !block_size.is_power_of_two()
    {
        return Err(Error::Unsupported(format!(
            "VHDX block size {block_size}"
        )));
    }
    let differencing = parent_locator.is_some();
    let (bat_bytes, _, _) = bat_facts(size, block_size as u64, 512, differencing);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;

    // File type identifier.
    let mut fti = vec![0u8; 64 << 10];
    fti[..8].copy_from_slice(VHDX_SIGNATURE);
    for (i, u) in "fatio".encode_utf16().enumerate() {
        fti[8 + i * 2..10 + i * 2].copy_from_slice(&u.to_le_bytes());
    }
    file.write_all(&fti)?;

    // Both headers, sequence 0 and 1.
    let mut header = VhdxHeader::new_zeroed();
    header.signature = *b"head";
    header.file_write_guid = Uuid::new_v4().to_bytes_le();
    header.data_write_guid = Uuid::new_v4().to_bytes_le();
    header.version.set(1);
    header.log_length.set(1 << 20);
    header.log_offset.set(1 << 20);
    for (offset, seq) in [(HEADER1_OFFSET, 0u64), (HEADER2_OFFSET, 1u64)] {
        header.sequence_number.set(seq);
        header.checksum.set(0);
        let mut raw = vec![0u8; 4096];
        raw[..core::mem::size_of::<VhdxHeader>()].copy_from_slice(header.as_bytes());
        let crc = crc32c(&raw);
        raw[4..8].copy_from_slice(&crc.to_le_bytes());
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&raw)?;
    }

    // Region table and its copy.
    let mut table = vec![0u8; 64 << 10];
    table[..4].copy_from_slice(b"regi");
    table[8..12].copy_from_slice(&2u32.to_le_bytes());
    {
        let mut entry = RegionTableEntry::new_zeroed();
        entry.guid = METADATA_REGION_GUID.to_bytes_le();
        entry.file_offset.set(2 << 20);
        entry.length.set(1 << 20);
        entry.required.set(1);
        table[16..48].copy_from_slice(entry.as_bytes());
        entry.guid = BAT_REGION_GUID.to_bytes_le();
        entry.file_offset.set(3 << 20);
        entry.length.set(bat_bytes as u32);
        table[48..80].copy_from_slice(entry.as_bytes());
    }
    let crc = crc32c_zeroed_field(&table);
    table[4..8].copy_from_slice(&crc.to_le_bytes());
    file.seek(SeekFrom::Start(REGION1_OFFSET))?;
    file.write_all(&table)?;
    file.seek(SeekFrom::Start(REGION2_OFFSET))?;
    file.write_all(&table)?;

    // Metadata region.
    let mut region = vec![0u8; 1 << 20];
    region[..8].copy_from_slice(b"metadata");
    let entry_count: u16 = if differencing { 6 } else { 5 };
    region[10..12].copy_from_slice(&entry_count.to_le_bytes());
    let mut value_at = 64 << 10;
    let mut entry_at = 32;
    let mut push_entry = |region: &mut Vec<u8>, id: Uuid, value: &[u8], flags: u32| {
        let mut entry = MetadataEntry::new_zeroed();
        entry.item_id = id.to_bytes_le();
        entry.offset.set(value_at as u32);
        entry.length.set(value.len() as u32);
        entry.flags.set(flags);
        region[entry_at..entry_at + 32].copy_from_slice(entry.as_bytes());
        region[value_at..value_at + value.len()].copy_from_slice(value);
        entry_at += 32;
        value_at += value.len().next_multiple_of(8);
    };
    let file_params: u32 = if differencing { 2 } else { 0 };
    let mut fp = Vec::new();
    fp.extend_from_slice(&block_size.to_le_bytes());
    fp.extend_from_slice(&file_params.to_le_bytes());
    push_entry(&mut region, MD_FILE_PARAMETERS, &fp, 4);
    push_entry(&mut region, MD_VIRTUAL_DISK_SIZE, &size.to_le_bytes(), 6);
    push_entry(&mut region, MD_LOGICAL_SECTOR_SIZE, &512u32.to_le_bytes(), 4);
    push_entry(&mut region, MD_PHYSICAL_SECTOR_SIZE, &512u32.to_le_bytes(), 4);
    push_entry(
        &mut region,
        MD_VIRTUAL_DISK_ID,
        &Uuid::new_v4().to_bytes_le(),
        0,
    );
    if let Some(locator) = parent_locator {
        let mut raw = Vec::new();
        raw.extend_from_slice(&PARENT_LOCATOR_TYPE.to_bytes_le());
        raw.extend_from_slice(&0u16.to_le_bytes());
        raw.extend_from_slice(&(locator.len() as u16).to_le_bytes());
        let mut strings = Vec::new();
        let base = 20 + locator.len() * 12;
        for (k, v) in &locator {
            let ke: Vec<u8> = k.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
            let ve: Vec<u8> = v.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
            let ko = base + strings.len();
            raw.extend_from_slice(&(ko as u32).to_le_bytes());
            raw.extend_from_slice(&((ko + ke.len()) as u32).to_le_bytes());
            raw.extend_from_slice(&(ke.len() as u16).to_le_bytes());
            raw.extend_from_slice(&(ve.len() as u16).to_le_bytes());
            strings.extend_from_slice(&ke);
            strings.extend_from_slice(&ve);
        }
        raw.extend_from_slice(&strings);
        push_entry(&mut region, MD_PARENT_LOCATOR, &raw, 4);
    }
    file.seek(SeekFrom::Start(2 << 20))?;
    file.write_all(&region)?;

    // Zeroed log and BAT; payload grows from here, 1 MiB aligned.
    file.set_len((3 << 20) + bat_bytes)?;
    file.sync_data()?;
    Ok(())
}

impl BlockDevice for VhdxDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(Error::out_of_range(offset, self.size));
        }
        let mut state = self.state.lock();
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let block = pos / self.block_size;
            let in_block = pos % self.block_size;
            let entry = state.bat[self.bat_index(block)];
            let blk_state = entry & STATE_MASK & 7;
            let blk_ea = entry & OFFSET_MASK;
            let lss = self.logical_sector_size;
            // Partially present blocks split per sector; the rest per
            // block.
            let granularity = if blk_state == PAYLOAD_BLOCK_PARTIALLY_PRESENT {
                lss - pos % lss
            } else {
                self.block_size - in_block
            };
            let take = ((buf.len() - done) as u64).min(granularity) as usize;
            let chunk = &mut buf[done..done + take];
            match blk_state {
                PAYLOAD_BLOCK_NOT_PRESENT => {
                    if let Some(parent) = &state.parent {
                        parent.read_at(pos, chunk)?;
                    } else {
                        chunk.fill(0);
                    }
                }
                PAYLOAD_BLOCK_UNDEFINED | PAYLOAD_BLOCK_ZERO | PAYLOAD_BLOCK_UNMAPPED => {
                    chunk.fill(0)
                }
                PAYLOAD_BLOCK_FULLY_PRESENT => {
                    state.file.seek(SeekFrom::Start(blk_ea + in_block))?;
                    state.file.read_exact(chunk)?;
                }
                PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                    let bmp_entry = state.bat[self.bitmap_bat_index(block)];
                    if bmp_entry & 7 != SB_BLOCK_PRESENT {
                        return Err(Error::invalid(
                            "VHDX header",
                            "partial block without a bitmap",
                        ));
                    }
                    self.load_bitmap(&mut state, bmp_entry & OFFSET_MASK)?;
                    let sec_bi = (pos / lss) % (1 << 23);
                    let present = state
                        .bitmap
                        .as_ref()
                        .map(|(_, b, _)| b[(sec_bi / 8) as usize] & (1 << (sec_bi % 8)) != 0)
                        .unwrap_or(false);
                    if present {
                        state.file.seek(SeekFrom::Start(blk_ea + in_block))?;
                        state.file.read_exact(chunk)?;
                    } else if let Some(parent) = &state.parent {
                        parent.read_at(pos, chunk)?;
                    } else {
                        return Err(Error::invalid(
                            "VHDX header",
                            "partial block without a parent",
                        ));
                    }
                }
                other => {
                    return Err(Error::invalid(
                        "VHDX header",
                        format!("payload block state {other}"),
                    ));
                }
            }
            done += take;
            pos += take as u64;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if offset + buf.len() as u64 > self.size {
            return Err(Error::out_of_range(offset, self.size));
        }
        let mut state = self.state.lock();
        self.touch_headers(&mut state)?;
        let start_pos = offset;
        let end_pos = offset + buf.len() as u64;
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let block = pos / self.block_size;
            let in_block = pos % self.block_size;
            let take = ((buf.len() - done) as u64).min(self.block_size - in_block) as usize;
            let chunk = &buf[done..done + take];
            let bat_i = self.bat_index(block);
            let entry = state.bat[bat_i];
            let mut blk_state = entry & 7;
            let mut blk_ea = entry & OFFSET_MASK;
            match blk_state {
                PAYLOAD_BLOCK_FULLY_PRESENT => {
                    state.file.seek(SeekFrom::Start(blk_ea + in_block))?;
                    state.file.write_all(chunk)?;
                }
                PAYLOAD_BLOCK_UNDEFINED | PAYLOAD_BLOCK_ZERO | PAYLOAD_BLOCK_UNMAPPED => {
                    if chunk.iter().all(|&b| b == 0) {
                        if blk_state != PAYLOAD_BLOCK_ZERO {
                            self.set_bat(&mut state, bat_i, PAYLOAD_BLOCK_ZERO)?;
                        }
                    } else {
                        blk_ea = self.allocate_block(&mut state, self.block_size)?;
                        self.set_bat(
                            &mut state,
                            bat_i,
                            blk_ea | PAYLOAD_BLOCK_FULLY_PRESENT,
                        )?;
                        state.file.seek(SeekFrom::Start(blk_ea + in_block))?;
                        state.file.write_all(chunk)?;
                    }
                }
                PAYLOAD_BLOCK_NOT_PRESENT | PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                    let in_parent = match &state.parent {
                        Some(parent) => {
                            let pstate = parent.state.lock();
                            parent.has_block(&pstate, pos)
                        }
                        None => false,
                    };
                    if blk_state == PAYLOAD_BLOCK_NOT_PRESENT {
                        blk_state = if in_parent {
                            PAYLOAD_BLOCK_PARTIALLY_PRESENT
                        } else {
                            PAYLOAD_BLOCK_FULLY_PRESENT
                        };
                        blk_ea = self.allocate_block(&mut state, self.block_size)?;
                        self.set_bat(&mut state, bat_i, blk_ea | blk_state)?;
                    }
                    if blk_state == PAYLOAD_BLOCK_PARTIALLY_PRESENT {
                        let bmp_i = self.bitmap_bat_index(block);
                        let bmp_entry = state.bat[bmp_i];
                        let bmp_ea = if bmp_entry & 7 == SB_BLOCK_PRESENT {
                            bmp_entry & OFFSET_MASK
                        } else {
                            let ea = self.allocate_block(&mut state, 1 << 20)?;
                            self.set_bat(&mut state, bmp_i, ea | SB_BLOCK_PRESENT)?;
                            ea
                        };
                        self.load_bitmap(&mut state, bmp_ea)?;
                        let lss = self.logical_sector_size;
                        let sec_bi = (pos / lss) % (1 << 23);
                        let sec_bi2 = ((pos + take as u64 - 1) / lss) % (1 << 23);
                        // Partially overwritten edge sectors come down
                        // from the parent first.
                        if in_parent {
                            if start_pos == pos && pos % lss != 0 {
                                copy_parent_sector(self, &mut state, pos, blk_ea)?;
                            }
                            let last = pos + take as u64;
                            if end_pos == last && last % lss != 0 {
                                copy_parent_sector(self, &mut state, last - 1, blk_ea)?;
                            }
                        }
                        if let Some((_, bitmap, dirty)) = state.bitmap.as_mut() {
                            for s in sec_bi..=sec_bi2 {
                                bitmap[(s / 8) as usize] |= 1 << (s % 8);
                            }
                            *dirty = true;
                        }
                    }
                    state.file.seek(SeekFrom::Start(blk_ea + in_block))?;
                    state.file.write_all(chunk)?;
                }
                other => {
                    return Err(Error::invalid(
                        "VHDX header",
                        format!("payload block state {other}"),
                    ));
                }
            }
            done += take;
            pos += take as u64;
        }
        self.flush_bitmap(&mut state)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> usize {
        self.logical_sector_size as usize
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_bitmap(&mut state)?;
        state.file.sync_data()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Copy the logical sector containing virtual `pos` from the parent into
/// the child block at `blk_ea`, marking its bitmap bit.
fn copy_parent_sector(
    disk: &VhdxDisk,
    state: &mut VhdxState,
    pos: u64,
    blk_ea: u64,
) -> Result<()> {
    let lss = disk.logical_sector_size;
    let sec_bi = (pos / lss) % (1 << 23);
    let already = state
        .bitmap
        .as_ref()
        .map(|(_, b, _)| b[(sec_bi / 8) as usize] & (1 << (sec_bi % 8)) != 0)
        .unwrap_or(false);
    if already {
        return Ok(());
    }
    let sector_start = pos / lss * lss;
    let mut data = vec![0u8; lss as usize];
    if let Some(parent) = &state.parent {
        parent.read_at(sector_start, &mut data)?;
    }
    let in_block = sector_start % disk.block_size;
    state.file.seek(SeekFrom::Start(blk_ea + in_block))?;
    state.file.write_all(&data)?;
    if let Some((_, bitmap, dirty)) = state.bitmap.as_mut() {
        bitmap[(sec_bi / 8) as usize] |= 1 << (sec_bi % 8);
        *dirty = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_create_open_rw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhdx");
        let disk = VhdxDisk::create_dynamic(&path, 16 << 20, 1 << 20).unwrap();
        let mut buf = vec![0u8; 8192];
        disk.read_at(5 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        disk.write_at(5 << 20, &vec![0x77u8; 8192]).unwrap();
        disk.flush().unwrap();
        drop(disk);
        let disk = VhdxDisk::open(&path, true).unwrap();
        disk.read_at(5 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x77));
    }

    #[test]
    fn first_write_resequences_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhdx");
        let disk = VhdxDisk::create_dynamic(&path, 8 << 20, 1 << 20).unwrap();
        let guid_before = disk.data_write_guid();
        let seq_before = disk.state.lock().header.sequence_number.get();
        disk.write_at(0, &[1u8; 512]).unwrap();
        disk.flush().unwrap();
        let seq_after = disk.state.lock().header.sequence_number.get();
        assert!(seq_after > seq_before);
        assert_ne!(disk.data_write_guid(), guid_before);
        drop(disk);
        // Both header copies must still carry valid CRCs.
        let disk = VhdxDisk::open(&path, true).unwrap();
        drop(disk);
    }

    #[test]
    fn differencing_reads_through_and_verifies_linkage() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.vhdx");
        let delta_path = dir.path().join("delta.vhdx");
        let base = VhdxDisk::create_dynamic(&base_path, 8 << 20, 1 << 20).unwrap();
        base.write_at(2000, b"parent vhdx data").unwrap();
        base.flush().unwrap();
        drop(base);

        let delta = VhdxDisk::create_differencing(&delta_path, &base_path).unwrap();
        let mut buf = [0u8; 16];
        delta.read_at(2000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent vhdx data");
        // Partial-sector write: the rest of the sector must survive.
        delta.write_at(2007, b"VHDX").unwrap();
        delta.read_at(2000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent VHDXdata ");
        delta.flush().unwrap();
        drop(delta);

        // Parent written after linkage: data-write GUID changes, child
        // refuses.
        let base = VhdxDisk::open(&base_path, false).unwrap();
        base.write_at(0, &[9u8; 512]).unwrap();
        base.flush().unwrap();
        drop(base);
        assert!(matches!(
            VhdxDisk::open(&delta_path, false),
            Err(Error::ParentLink(_))
        ));
    }

    #[test]
    fn log_replay_applies_data_and_zero_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhdx");
        let disk = VhdxDisk::create_dynamic(&path, 8 << 20, 1 << 20).unwrap();
        // Allocate a block so there is a payload area to patch.
        disk.write_at(0, &vec![0xAAu8; 1 << 20]).unwrap();
        disk.flush().unwrap();
        let (block_ea, header, log_offset) = {
            let state = disk.state.lock();
            (
                state.bat[0] & OFFSET_MASK,
                state.header,
                state.header.log_offset.get(),
            )
        };
        drop(disk);

        // Craft a log: one self-pointing entry with one data descriptor
        // (sector of 0xBB at the block start) and one zero descriptor
        // (4 KiB at block start + 8 KiB).
        let log_guid = Uuid::new_v4().to_bytes_le();
        let seq = 9u64;
        let mut entry = vec![0u8; 2 * LOG_RECORD as usize];
        let mut sector = vec![0xBBu8; LOG_RECORD as usize];
        sector[..4].copy_from_slice(b"data");
        sector[4..8].copy_from_slice(&((seq >> 32) as u32).to_le_bytes());
        sector[4092..4096].copy_from_slice(&(seq as u32).to_le_bytes());
        entry[LOG_RECORD as usize..].copy_from_slice(&sector);
        {
            let mut data_desc = DataDescriptor::new_zeroed();
            data_desc.signature = *b"desc";
            data_desc.trailing_bytes.set(u32::from_le_bytes([0xBB; 4]));
            data_desc.leading_bytes.set(u64::from_le_bytes([0xBB; 8]));
            data_desc.file_offset.set(block_ea);
            data_desc.sequence_number.set(seq);
            entry[64..96].copy_from_slice(data_desc.as_bytes());
            let mut zero_desc = ZeroDescriptor::new_zeroed();
            zero_desc.signature = *b"zero";
            zero_desc.zero_length.set(4096);
            zero_desc.file_offset.set(block_ea + 8192);
            zero_desc.sequence_number.set(seq);
            entry[96..128].copy_from_slice(zero_desc.as_bytes());
        }
        {
            let mut head = LogEntryHeader::new_zeroed();
            head.signature = *b"loge";
            head.entry_length.set(entry.len() as u32);
            head.tail.set(0);
            head.sequence_number.set(seq);
            head.descriptor_count.set(2);
            head.log_guid = log_guid;
            head.flushed_file_offset.set(block_ea + (1 << 20));
            head.last_file_offset.set(block_ea + (1 << 20));
            entry[..64].copy_from_slice(head.as_bytes());
            let crc = crc32c_zeroed_field(&entry);
            entry[4..8].copy_from_slice(&crc.to_le_bytes());
        }
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(log_offset)).unwrap();
            file.write_all(&entry).unwrap();
            // Arm the log GUID in both headers.
            let mut armed = header;
            armed.log_guid = log_guid;
            resequence_headers(&mut file, &mut armed).unwrap();
            file.sync_data().unwrap();
        }

        // Reopening read-write replays the log and clears the GUID.
        let disk = VhdxDisk::open(&path, false).unwrap();
        assert_eq!(disk.state.lock().header.log_guid, [0u8; 16]);
        let mut buf = vec![0u8; 4096];
        disk.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xBB), "data descriptor replayed");
        disk.read_at(8192, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "zero descriptor replayed");
        disk.read_at(4096, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA), "untouched area survives");
    }
}
