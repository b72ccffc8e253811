//! VHD (Connectix/Microsoft Virtual Hard Disk) backend
//!
//! All VHD structures are big-endian. A fixed image is the raw payload with
//! a 512-byte footer appended; the footer opens with the `conectix` cookie
//! and is sealed by a one's-complement sum of its bytes with the checksum
//! field zeroed. Dynamic images put a copy of the footer at offset 0, the
//! `cxsparse` dynamic header at 512, a BAT of 32-bit sector addresses, and
//! payload blocks (2 MiB by default), each prefixed by a bitmap sector
//! group carrying one bit per 512-byte sector, MSB first. A BAT entry of
//! 0xFFFFFFFF means the block is unallocated; allocation happens at the
//! end of the file, overwriting the trailing footer and re-appending it
//! after the new block.
//!
//! A differencing image adds eight 24-byte parent locators (`W2ku` holds
//! the absolute, `W2ru` the relative UTF-16LE Windows path). Its block
//! bitmap tells which sectors live in the child; clear bits defer to the
//! parent chain. Writing a partial sector into a block first copies that
//! sector down from the parent, so every written sector is self-contained.
//! The parent link is verified by UUID at open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::debug;
use spin::Mutex;
use uuid::Uuid;
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

pub const VHD_COOKIE: &[u8; 8] = b"conectix";
pub const VHD_DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";
pub const VHD_BLOCK_SIZE: u32 = 2 << 20;
/// 2040 GiB, the format ceiling.
pub const MAX_VHD_SIZE: u64 = 2040 << 30;

pub const DISK_TYPE_FIXED: u32 = 2;
pub const DISK_TYPE_DYNAMIC: u32 = 3;
pub const DISK_TYPE_DIFFERENCING: u32 = 4;

const UNALLOCATED: u32 = 0xFFFF_FFFF;
/// Seconds between the Unix and the VHD epoch (2000-01-01).
const VHD_EPOCH: i64 = 946_684_800;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct VhdFooter {
    /// "conectix"
    pub cookie: [u8; 8],
    /// Bit 1 is always set.
    pub features: U32,
    /// 0x00010000
    pub file_format_version: U32,
    /// Offset of the dynamic header, or all ones on fixed disks.
    pub data_offset: U64,
    /// Seconds since 2000-01-01 00:00 UTC.
    pub timestamp: U32,
    pub creator_app: [u8; 4],
    pub creator_version: U32,
    /// "Wi2k" or "Mac "
    pub creator_host: [u8; 4],
    pub original_size: U64,
    pub current_size: U64,
    /// Pseudo CHS: cylinders word, heads byte, sectors byte.
    pub disk_geometry: [u8; 4],
    pub disk_type: U32,
    /// One's complement of the byte sum, this field zeroed.
    pub checksum: U32,
    pub unique_id: [u8; 16],
    pub saved_state: u8,
    pub reserved: [u8; 427],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct VhdDynamicHeader {
    /// "cxsparse"
    pub cookie: [u8; 8],
    pub data_offset: U64,
    /// Absolute offset of the BAT.
    pub table_offset: U64,
    pub version: U32,
    /// BAT entries == total virtual blocks.
    pub max_table_entries: U32,
    pub block_size: U32,
    pub checksum: U32,
    pub parent_unique_id: [u8; 16],
    pub parent_timestamp: U32,
    pub reserved1: U32,
    /// Parent absolute path, UTF-16 big-endian, zero padded.
    pub parent_unicode_name: [u8; 512],
    /// Eight 24-byte locator entries.
    pub parent_locators: [u8; 192],
    pub reserved2: [u8; 256],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ParentLocator {
    /// "W2ku" (absolute) or "W2ru" (relative) on Windows images.
    pub platform_code: [u8; 4],
    /// Sectors reserved for the locator data.
    pub data_space: U32,
    /// Locator length in bytes.
    pub data_length: U32,
    pub reserved: U32,
    /// Absolute file offset of the locator data.
    pub data_offset: U64,
}

/// One's-complement byte-sum checksum used by both VHD headers.
pub fn vhd_checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in data {
        sum = sum.wrapping_add(b as u32);
    }
    !sum
}

fn footer_checksum(footer: &VhdFooter) -> u32 {
    let mut copy = *footer;
    copy.checksum.set(0);
    vhd_checksum(copy.as_bytes())
}

fn header_checksum(header: &VhdDynamicHeader) -> u32 {
    let mut copy = *header;
    copy.checksum.set(0);
    vhd_checksum(copy.as_bytes())
}

/// Pseudo-CHS geometry bytes for the footer, per the VHD specification's
/// capacity algorithm.
pub fn vhd_geometry(size: u64) -> [u8; 4] {
    let mut sectors = size / 512;
    if sectors > 65535 * 16 * 255 {
        sectors = 65535 * 16 * 255;
    }
    let (cth, heads, spt);
    if sectors >= 65535 * 16 * 63 {
        spt = 255u64;
        heads = 16u64;
        cth = sectors / spt;
    } else {
        let mut s = 17u64;
        let mut c = sectors / s;
        let mut h = (c + 1023) / 1024;
        if h < 4 {
            h = 4;
        }
        if c >= h * 1024 || h > 16 {
            s = 31;
            h = 16;
            c = sectors / s;
        }
        if c >= h * 1024 {
            s = 63;
            h = 16;
            c = sectors / s;
        }
        spt = s;
        heads = h;
        cth = c;
    }
    let cylinders = (cth / heads) as u16;
    let mut geometry = [0u8; 4];
    geometry[..2].copy_from_slice(&cylinders.to_be_bytes());
    geometry[2] = heads as u8;
    geometry[3] = spt as u8;
    geometry
}

fn now_vhd_timestamp() -> u32 {
    (Utc::now().timestamp() - VHD_EPOCH).max(0) as u32
}

fn new_footer(size: u64, disk_type: u32, data_offset: u64) -> VhdFooter {
    let mut footer = VhdFooter::new_zeroed();
    footer.cookie = *VHD_COOKIE;
    footer.features.set(2);
    footer.file_format_version.set(0x0001_0000);
    footer.data_offset.set(data_offset);
    footer.timestamp.set(now_vhd_timestamp());
    footer.creator_app = *b"rs  ";
    footer.creator_version.set(0x0003_000A);
    footer.creator_host = *b"Wi2k";
    footer.original_size.set(size);
    footer.current_size.set(size);
    footer.disk_geometry = vhd_geometry(size);
    footer.disk_type.set(disk_type);
    footer.unique_id = *Uuid::new_v4().as_bytes();
    let sum = footer_checksum(&footer);
    footer.checksum.set(sum);
    footer
}

/// MSB-first sector bitmap prefixed to every allocated block.
struct BlockBitmap {
    bytes: Vec<u8>,
    block: u32,
    dirty: bool,
}

impl BlockBitmap {
    fn isset(&self, sector: u64) -> bool {
        self.bytes[(sector / 8) as usize] & (128 >> (sector % 8)) != 0
    }

    fn set(&mut self, sector: u64, length: u64) {
        for s in sector..sector + length {
            self.bytes[(s / 8) as usize] |= 128 >> (s % 8);
        }
        self.dirty = true;
    }
}

struct VhdState {
    file: File,
    bat: Vec<u32>,
    parent: Option<Arc<VhdDisk>>,
}

pub struct VhdDisk {
    path: PathBuf,
    parent_path: Option<PathBuf>,
    state: Mutex<VhdState>,
    footer: VhdFooter,
    disk_type: u32,
    size: u64,
    block_size: u64,
    bitmap_size: u64,
    bat_offset: u64,
    read_only: bool,
}

impl VhdDisk {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < 512 {
            return Err(Error::invalid("VHD footer", "file shorter than a footer"));
        }
        let mut raw = [0u8; 512];
        file.seek(SeekFrom::Start(file_size - 512))?;
        file.read_exact(&mut raw)?;
        let footer = VhdFooter::read_from_bytes(&raw)
            .map_err(|_| Error::invalid("VHD footer", "layout"))?;
        if &footer.cookie != VHD_COOKIE {
            return Err(Error::invalid("VHD footer", "missing conectix cookie"));
        }
        if footer.checksum.get() != footer_checksum(&footer) {
            return Err(Error::invalid("VHD footer", "checksum mismatch"));
        }
        let disk_type = footer.disk_type.get();
        let size = footer.current_size.get();

        match disk_type {
            DISK_TYPE_FIXED => {
                if file_size - 512 != size {
                    return Err(Error::invalid("VHD footer", "fixed image size mismatch"));
                }
                Ok(Self {
                    path,
                    parent_path: None,
                    state: Mutex::new(VhdState {
                        file,
                        bat: Vec::new(),
                        parent: None,
                    }),
                    footer,
                    disk_type,
                    size,
                    block_size: 0,
                    bitmap_size: 0,
                    bat_offset: 0,
                    read_only,
                })
            }
            DISK_TYPE_DYNAMIC | DISK_TYPE_DIFFERENCING => {
                // The footer copy at offset 0 must match the trailing one.
                let mut copy = [0u8; 512];
                file.seek(SeekFrom::Start(0))?;
                file.read_exact(&mut copy)?;
                if copy != raw {
                    return Err(Error::invalid("VHD footer", "footer copy differs"));
                }
                let mut header_raw = [0u8; 1024];
                file.read_exact(&mut header_raw)?;
                let header = VhdDynamicHeader::read_from_bytes(&header_raw)
                    .map_err(|_| Error::invalid("VHD footer", "dynamic header layout"))?;
                if &header.cookie != VHD_DYNAMIC_COOKIE {
                    return Err(Error::invalid("VHD footer", "missing cxsparse cookie"));
                }
                if header.checksum.get() != header_checksum(&header) {
                    return Err(Error::invalid("VHD footer", "dynamic header checksum"));
                }
                let block_size = header.block_size.get() as u64;
                let entries = header.max_table_entries.get() as usize;
                let bat_offset = header.table_offset.get();
                let mut bat_raw = vec![0u8; entries * 4];
                file.seek(SeekFrom::Start(bat_offset))?;
                file.read_exact(&mut bat_raw)?;
                let bat: Vec<u32> = bat_raw
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                let bitmap_size = ((block_size / 512) / 8).max(512);

                let (parent, parent_path) = if disk_type == DISK_TYPE_DIFFERENCING {
                    let parent_path = resolve_parent(&path, &mut file, &header)?;
                    let parent = VhdDisk::open(&parent_path, true)?;
                    if parent.footer.unique_id != header.parent_unique_id {
                        return Err(Error::ParentLink(format!(
                            "{}: parent UUID mismatch",
                            parent_path.display()
                        )));
                    }
                    (Some(Arc::new(parent)), Some(parent_path))
                } else {
                    (None, None)
                };
                Ok(Self {
                    path,
                    parent_path,
                    state: Mutex::new(VhdState { file, bat, parent }),
                    footer,
                    disk_type,
                    size,
                    block_size,
                    bitmap_size,
                    bat_offset,
                    read_only,
                })
            }
            other => Err(Error::Unsupported(format!("VHD disk type {other}"))),
        }
    }

    /// A raw image with a footer appended.
    pub fn create_fixed(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        if size > MAX_VHD_SIZE {
            return Err(Error::Unsupported("VHD over 2040 GiB".into()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        let footer = new_footer(size, DISK_TYPE_FIXED, u64::MAX);
        file.set_len(size)?;
        file.seek(SeekFrom::Start(size))?;
        file.write_all(footer.as_bytes())?;
        file.sync_data()?;
        drop(file);
        Self::open(path, false)
    }

    pub fn create_dynamic(path: impl AsRef<Path>, size: u64, block_size: u32) -> Result<Self> {
        if size > MAX_VHD_SIZE {
            return Err(Error::Unsupported("VHD over 2040 GiB".into()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        let footer = new_footer(size, DISK_TYPE_DYNAMIC, 512);

        let entries = size.div_ceil(block_size as u64) as u32;
        let mut header = VhdDynamicHeader::new_zeroed();
        header.cookie = *VHD_DYNAMIC_COOKIE;
        header.data_offset.set(u64::MAX);
        header.table_offset.set(1536);
        header.version.set(0x0001_0000);
        header.max_table_entries.set(entries);
        header.block_size.set(block_size);
        let sum = header_checksum(&header);
        header.checksum.set(sum);

        let bat_bytes = (entries as u64 * 4).div_ceil(512) * 512;
        file.write_all(footer.as_bytes())?;
        file.write_all(header.as_bytes())?;
        file.write_all(&vec![0xFFu8; bat_bytes as usize])?;
        file.write_all(footer.as_bytes())?;
        file.sync_data()?;
        drop(file);
        Self::open(path, false)
    }

    /// A child image recording only the blocks that diverge from `parent`.
    pub fn create_differencing(path: impl AsRef<Path>, parent: impl AsRef<Path>) -> Result<Self> {
        let parent_abs = std::fs::canonicalize(parent.as_ref())?;
        let base = VhdDisk::open(&parent_abs, true)?;
        let size = base.size;
        let block_size = if base.block_size > 0 {
            base.block_size as u32
        } else {
            VHD_BLOCK_SIZE
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        let mut footer = new_footer(size, DISK_TYPE_DIFFERENCING, 512);
        let sum = footer_checksum(&footer);
        footer.checksum.set(sum);

        let entries = size.div_ceil(block_size as u64) as u32;
        let bat_bytes = (entries as u64 * 4).div_ceil(512) * 512;

        // Windows wants UTF-16 paths: the relative W2ru locator, the
        // absolute W2ku one, and the big-endian name in the header itself.
        let rel = {
            let name = parent.as_ref().to_string_lossy().into_owned();
            if name.starts_with('.') {
                name
            } else {
                format!(".\\{name}")
            }
        };
        let abs = parent_abs.to_string_lossy().into_owned();
        let rel_utf16: Vec<u8> = rel.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let abs_utf16: Vec<u8> = abs.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();

        let mut header = VhdDynamicHeader::new_zeroed();
        header.cookie = *VHD_DYNAMIC_COOKIE;
        header.data_offset.set(u64::MAX);
        header.table_offset.set(1536);
        header.version.set(0x0001_0000);
        header.max_table_entries.set(entries);
        header.block_size.set(block_size);
        header.parent_unique_id = base.footer.unique_id;
        header.parent_timestamp.set(base.footer.timestamp.get());
        for (i, u) in abs.encode_utf16().take(255).enumerate() {
            header.parent_unicode_name[i * 2..i * 2 + 2].copy_from_slice(&u.to_be_bytes());
        }
        let rel_space = (rel_utf16.len() as u64).div_ceil(512) * 512;
        let abs_space = (abs_utf16.len() as u64).div_ceil(512) * 512;
        let rel_offset = 1536 + bat_bytes;
        let abs_offset = rel_offset + rel_space;
        {
            let mut loc = ParentLocator::new_zeroed();
            loc.platform_code = *b"W2ru";
            loc.data_space.set(rel_space as u32);
            loc.data_length.set(rel_utf16.len() as u32);
            loc.data_offset.set(rel_offset);
            header.parent_locators[..24].copy_from_slice(loc.as_bytes());
            loc.platform_code = *b"W2ku";
            loc.data_space.set(abs_space as u32);
            loc.data_length.set(abs_utf16.len() as u32);
            loc.data_offset.set(abs_offset);
            header.parent_locators[24..48].copy_from_slice(loc.as_bytes());
        }
        let sum = header_checksum(&header);
        header.checksum.set(sum);

        file.write_all(footer.as_bytes())?;
        file.write_all(header.as_bytes())?;
        file.write_all(&vec![0xFFu8; bat_bytes as usize])?;
        let mut rel_sector = rel_utf16;
        rel_sector.resize(rel_space as usize, 0);
        let mut abs_sector = abs_utf16;
        abs_sector.resize(abs_space as usize, 0);
        file.write_all(&rel_sector)?;
        file.write_all(&abs_sector)?;
        file.write_all(footer.as_bytes())?;
        file.sync_data()?;
        drop(file);
        Self::open(path, false)
    }

    pub fn unique_id(&self) -> Uuid {
        Uuid::from_bytes(self.footer.unique_id)
    }

    pub fn disk_type(&self) -> u32 {
        self.disk_type
    }

    fn load_bitmap(&self, state: &mut VhdState, block: u32) -> Result<BlockBitmap> {
        let mut bytes = vec![0u8; self.bitmap_size as usize];
        state.file.seek(SeekFrom::Start(block as u64 * 512))?;
        state.file.read_exact(&mut bytes)?;
        Ok(BlockBitmap {
            bytes,
            block,
            dirty: false,
        })
    }

    fn store_bitmap(&self, state: &mut VhdState, bitmap: &BlockBitmap) -> Result<()> {
        state
            .file
            .seek(SeekFrom::Start(bitmap.block as u64 * 512))?;
        state.file.write_all(&bitmap.bytes)?;
        Ok(())
    }

    /// Allocate a block at the end of the file, overwriting the trailing
    /// footer and re-appending it. Differencing children zero the block and
    /// its bitmap; dynamic images mark every sector present.
    fn allocate_block(&self, state: &mut VhdState, index: usize) -> Result<u32> {
        let end = state.file.metadata()?.len();
        let block_sector = ((end - 512) / 512) as u32;
        state.file.seek(SeekFrom::Start(end - 512))?;
        if self.disk_type == DISK_TYPE_DIFFERENCING {
            state
                .file
                .write_all(&vec![0u8; (self.bitmap_size + self.block_size) as usize])?;
        } else {
            state.file.write_all(&vec![0xFFu8; self.bitmap_size as usize])?;
            state
                .file
                .seek(SeekFrom::Current(self.block_size as i64))?;
        }
        state.file.write_all(self.footer.as_bytes())?;
        state.bat[index] = block_sector;
        state
            .file
            .seek(SeekFrom::Start(self.bat_offset + index as u64 * 4))?;
        state.file.write_all(&block_sector.to_be_bytes())?;
        debug!(
            "{}: allocated block #{index} at sector {block_sector:#x}",
            self.path.display()
        );
        Ok(block_sector)
    }

    /// Does this image or any ancestor hold the block?
    fn has_block(&self, state: &VhdState, index: usize) -> bool {
        if state.bat[index] != UNALLOCATED {
            return true;
        }
        match &state.parent {
            Some(parent) => {
                let pstate = parent.state.lock();
                parent.has_block(&pstate, index)
            }
            None => false,
        }
    }

    /// Merge every bitmap-present sector into the parent, then delete this
    /// child image. Returns (sectors, blocks) merged.
    pub fn merge(self) -> Result<(u64, u64)> {
        let Some(parent_path) = self.parent_path.clone() else {
            return Err(Error::ParentLink("not a differencing image".into()));
        };
        let parent = VhdDisk::open(&parent_path, false)?;
        let mut sectors = 0u64;
        let mut blocks = 0u64;
        {
            let mut state = self.state.lock();
            let bat = state.bat.clone();
            for (index, &block) in bat.iter().enumerate() {
                if block == UNALLOCATED {
                    continue;
                }
                let bitmap = self.load_bitmap(&mut state, block)?;
                let mut copied = false;
                for sector in 0..self.block_size / 512 {
                    if !bitmap.isset(sector) {
                        continue;
                    }
                    let mut data = [0u8; 512];
                    state.file.seek(SeekFrom::Start(
                        block as u64 * 512 + self.bitmap_size + sector * 512,
                    ))?;
                    state.file.read_exact(&mut data)?;
                    parent.write_at(
                        index as u64 * self.block_size + sector * 512,
                        &data,
                    )?;
                    sectors += 1;
                    copied = true;
                }
                if copied {
                    blocks += 1;
                }
            }
        }
        parent.flush()?;
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok((sectors, blocks))
    }
}

/// Follow the locators (absolute first) to the parent image path,
/// resolving relative paths against the child's directory.
fn resolve_parent(
    child: &Path,
    file: &mut File,
    header: &VhdDynamicHeader,
) -> Result<PathBuf> {
    let mut candidates = Vec::new();
    for code in [b"W2ku", b"W2ru"] {
        for i in 0..8 {
            let raw = &header.parent_locators[i * 24..(i + 1) * 24];
            let Ok(loc) = ParentLocator::read_from_bytes(raw) else {
                continue;
            };
            if &loc.platform_code != code || loc.data_length.get() == 0 {
                continue;
            }
            let mut data = vec![0u8; loc.data_length.get() as usize];
            file.seek(SeekFrom::Start(loc.data_offset.get()))?;
            file.read_exact(&mut data)?;
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            let Ok(path) = char::decode_utf16(units).collect::<core::result::Result<String, _>>()
            else {
                continue;
            };
            candidates.push(path.replace('\\', "/"));
        }
    }
    for candidate in &candidates {
        let p = PathBuf::from(candidate);
        let resolved = if p.is_absolute() {
            p
        } else {
            child.parent().unwrap_or(Path::new(".")).join(p)
        };
        if resolved.exists() {
            return Ok(resolved);
        }
    }
    Err(Error::ParentLink(format!(
        "{}: no locator leads to an existing parent",
        child.display()
    )))
}

impl BlockDevice for VhdDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(Error::out_of_range(offset, self.size));
        }
        if self.disk_type == DISK_TYPE_FIXED {
            let mut state = self.state.lock();
            state.file.seek(SeekFrom::Start(offset))?;
            state.file.read_exact(buf)?;
            return Ok(());
        }
        let mut state = self.state.lock();
        let mut pos = offset;
        let mut done = 0usize;
        let mut bitmap: Option<BlockBitmap> = None;
        while done < buf.len() {
            let index = (pos / self.block_size) as usize;
            let in_block = pos % self.block_size;
            // Differencing images consult the sector bitmap, so split at
            // sector granularity there; plain dynamic splits at the block.
            let granularity = if self.disk_type == DISK_TYPE_DIFFERENCING {
                512 - pos % 512
            } else {
                self.block_size - in_block
            };
            let take = ((buf.len() - done) as u64).min(granularity) as usize;
            let block = state.bat[index];
            let chunk = &mut buf[done..done + take];
            if self.disk_type == DISK_TYPE_DIFFERENCING {
                let present = if block == UNALLOCATED {
                    false
                } else {
                    if bitmap.as_ref().map(|b| b.block) != Some(block) {
                        bitmap = Some(self.load_bitmap(&mut state, block)?);
                    }
                    bitmap
                        .as_ref()
                        .map(|b| b.isset(in_block / 512))
                        .unwrap_or(false)
                };
                if present {
                    state.file.seek(SeekFrom::Start(
                        block as u64 * 512 + self.bitmap_size + in_block,
                    ))?;
                    state.file.read_exact(chunk)?;
                } else if let Some(parent) = &state.parent {
                    parent.read_at(pos, chunk)?;
                } else {
                    chunk.fill(0);
                }
            } else if block == UNALLOCATED {
                chunk.fill(0);
            } else {
                state.file.seek(SeekFrom::Start(
                    block as u64 * 512 + self.bitmap_size + in_block,
                ))?;
                state.file.read_exact(chunk)?;
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
        if self.disk_type == DISK_TYPE_FIXED {
            let mut state = self.state.lock();
            state.file.seek(SeekFrom::Start(offset))?;
            state.file.write_all(buf)?;
            return Ok(());
        }
        let mut state = self.state.lock();
        let mut pos = offset;
        let mut done = 0usize;
        let mut bitmap: Option<BlockBitmap> = None;
        while done < buf.len() {
            let index = (pos / self.block_size) as usize;
            let in_block = pos % self.block_size;
            let take = ((buf.len() - done) as u64).min(self.block_size - in_block) as usize;
            let chunk = &buf[done..done + take];
            let mut block = state.bat[index];
            if block == UNALLOCATED {
                // A zero write into a block nobody holds stays virtual.
                let shadowed = self.disk_type == DISK_TYPE_DIFFERENCING
                    && self.has_block(&state, index);
                if !shadowed && chunk.iter().all(|&b| b == 0) {
                    done += take;
                    pos += take as u64;
                    continue;
                }
                if let Some(b) = bitmap.take() {
                    if b.dirty {
                        self.store_bitmap(&mut state, &b)?;
                    }
                }
                block = self.allocate_block(&mut state, index)?;
            }
            if self.disk_type == DISK_TYPE_DIFFERENCING {
                if bitmap.as_ref().map(|b| b.block) != Some(block) {
                    if let Some(b) = bitmap.take() {
                        if b.dirty {
                            self.store_bitmap(&mut state, &b)?;
                        }
                    }
                    bitmap = Some(self.load_bitmap(&mut state, block)?);
                }
                let Some(bmp) = bitmap.as_mut() else {
                    return Err(Error::invalid("VHD footer", "bitmap state lost"));
                };
                // Copy partially overwritten edge sectors down from the
                // parent before touching them.
                let first_sector = in_block / 512;
                let last_sector = (in_block + take as u64 - 1) / 512;
                if in_block % 512 != 0 && !bmp.isset(first_sector) {
                    copy_parent_sector(self, &mut state, index, block, first_sector)?;
                }
                if (in_block + take as u64) % 512 != 0 && !bmp.isset(last_sector) {
                    copy_parent_sector(self, &mut state, index, block, last_sector)?;
                }
                bmp.set(first_sector, last_sector - first_sector + 1);
            }
            state.file.seek(SeekFrom::Start(
                block as u64 * 512 + self.bitmap_size + in_block,
            ))?;
            state.file.write_all(chunk)?;
            done += take;
            pos += take as u64;
        }
        if let Some(b) = bitmap {
            if b.dirty {
                self.store_bitmap(&mut state, &b)?;
            }
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&self) -> Result<()> {
        self.state.lock().file.sync_data()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

fn copy_parent_sector(
    disk: &VhdDisk,
    state: &mut VhdState,
    index: usize,
    block: u32,
    sector: u64,
) -> Result<()> {
    let mut data = [0u8; 512];
    if let Some(parent) = &state.parent {
        parent.read_at(index as u64 * disk.block_size + sector * 512, &mut data)?;
    }
    state.file.seek(SeekFrom::Start(
        block as u64 * 512 + disk.bitmap_size + sector * 512,
    ))?;
    state.file.write_all(&data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_plausible() {
        let g = vhd_geometry(64 << 20);
        assert!(g[2] >= 4); // heads
        assert!(g[3] > 0); // sectors per track
    }

    #[test]
    fn fixed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixed.vhd");
        let disk = VhdDisk::create_fixed(&path, 4 << 20).unwrap();
        disk.write_at(123456, b"payload").unwrap();
        let mut buf = [0u8; 7];
        disk.read_at(123456, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        drop(disk);
        // Footer survives reopen with a valid checksum.
        let disk = VhdDisk::open(&path, true).unwrap();
        assert_eq!(disk.disk_type(), DISK_TYPE_FIXED);
        assert_eq!(disk.size(), 4 << 20);
    }

    #[test]
    fn dynamic_allocates_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dyn.vhd");
        let disk = VhdDisk::create_dynamic(&path, 16 << 20, VHD_BLOCK_SIZE).unwrap();
        // Unallocated reads come back zeroed.
        let mut buf = vec![0xAAu8; 4096];
        disk.read_at(3 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        // A zero write stays virtual.
        disk.write_at(3 << 20, &vec![0u8; 4096]).unwrap();
        // A payload write allocates.
        disk.write_at(3 << 20, &vec![0x5Au8; 4096]).unwrap();
        disk.read_at(3 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5A));
        drop(disk);
        let disk = VhdDisk::open(&path, true).unwrap();
        let mut buf = vec![0u8; 4096];
        disk.read_at(3 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn differencing_cow_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.vhd");
        let child_path = dir.path().join("delta.vhd");
        let base = VhdDisk::create_dynamic(&base_path, 8 << 20, VHD_BLOCK_SIZE).unwrap();
        base.write_at(1000, b"base data here").unwrap();
        base.flush().unwrap();
        drop(base);

        let child = VhdDisk::create_differencing(&child_path, &base_path).unwrap();
        // Unwritten ranges come from the parent.
        let mut buf = [0u8; 14];
        child.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"base data here");
        // A partial-sector write must keep the rest of the sector intact.
        child.write_at(1005, b"DATA").unwrap();
        child.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"base DATA here");
        child.flush().unwrap();

        let (sectors, blocks) = child.merge().unwrap();
        assert!(sectors >= 1 && blocks == 1);
        assert!(!child_path.exists());
        let base = VhdDisk::open(&base_path, true).unwrap();
        base.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"base DATA here");
    }

    #[test]
    fn parent_uuid_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.vhd");
        let child_path = dir.path().join("delta.vhd");
        VhdDisk::create_dynamic(&base_path, 4 << 20, VHD_BLOCK_SIZE).unwrap();
        VhdDisk::create_differencing(&child_path, &base_path).unwrap();
        // Recreate the parent: fresh UUID, same path.
        std::fs::remove_file(&base_path).unwrap();
        VhdDisk::create_dynamic(&base_path, 4 << 20, VHD_BLOCK_SIZE).unwrap();
        assert!(matches!(
            VhdDisk::open(&child_path, false),
            Err(Error::ParentLink(_))
        ));
    }
}
