//! VMDK (VMware sparse) backend
//!
//! A VMDK disk is described by a textual descriptor file: a 32-bit content
//! identifier (CID, regenerated after every writing session), an optional
//! `parentCID`/`parentFileNameHint` pair for differencing disks, and the
//! extent list (`RW <sectors> SPARSE|FLAT "<file>"`).
//!
//! A sparse extent opens with a 512-byte `KDMV` header, then a redundant
//! grain directory with its grain tables, a second directory with its own
//! tables, and the grain data. A grain is 64 KiB by default (a power of
//! two, at least 4 KiB); a grain table holds 512 32-bit sector addresses.
//! A grain table entry of 0 is unallocated (zeros, or the parent's data);
//! 1 is allocated-but-zeroed; anything else is the sector offset of the
//! grain. Grains are allocated at the end of the extent file in write
//! order, and table updates land in both directory copies.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use rand::Rng;
use spin::Mutex;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// "KDMV", little-endian on disk.
pub const VMDK_MAGIC: u32 = 0x564D_444B;
pub const VMDK_GRAIN_SIZE: u32 = 64 << 10;
const GTES_PER_GT: u64 = 512;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct VmdkSparseHeader {
    pub magic: U32,
    /// 1 for the classic sparse layout.
    pub version: U32,
    /// Bit 0: newline detection valid; bit 1: redundant tables in use.
    pub flags: U32,
    /// Extent capacity in sectors.
    pub capacity: U64,
    /// Grain size in sectors, a power of two (128 = 64 KiB).
    pub grain_size: U64,
    /// Embedded-descriptor window, zero for descriptor files.
    pub descriptor_offset: U64,
    pub descriptor_size: U64,
    /// Always 512.
    pub num_gtes_per_gt: U32,
    /// Sector of the redundant grain directory (typically 1).
    pub rgd_offset: U64,
    pub gd_offset: U64,
    /// Metadata overhead in sectors, grain aligned.
    pub overhead: U64,
    pub unclean_shutdown: u8,
    /// 0x0A 0x20 0x0D 0x0A, guarding against newline-mangling transfers.
    pub single_end_line_char: u8,
    pub non_end_line_char: u8,
    pub double_end_line_char1: u8,
    pub double_end_line_char2: u8,
    pub compress_algorithm: U16,
    pub padding: [u8; 433],
}

/// (extent bytes, GD sectors, GT-array sectors, overhead grains) for a
/// virtual size; extents are capped near 2 TB since grain addresses are
/// 32-bit sector numbers.
fn calc_extent_meta(size: u64, grain_size: u64) -> (u64, u64, u64, u64) {
    let grains = size.div_ceil(grain_size);
    let gt_sectors = (grains * 4).div_ceil(512);
    let gt_count = gt_sectors.div_ceil(4);
    let gd_sectors = (gt_count * 4).div_ceil(512);
    let grain_sectors = grain_size / 512;
    let overhead_grains = (2 * (gd_sectors + gt_sectors) + grain_sectors) / grain_sectors;
    let mut block = 0;
    for i in 20..=40u32 {
        let meta = if i == 40 {
            let bytes = grain_size * overhead_grains;
            1u64 << (63 - bytes.leading_zeros())
        } else {
            0
        };
        block = (2u64 << i) - meta;
        if size < block {
            break;
        }
    }
    (block, gd_sectors, gt_sectors, overhead_grains)
}

#[derive(Debug, Clone)]
struct ExtentDesc {
    start: u64,
    size: u64,
    sparse: bool,
    name: String,
}

#[derive(Debug, Clone)]
struct Descriptor {
    raw: String,
    cid: u32,
    parent_cid: u32,
    parent_hint: Option<String>,
    extents: Vec<ExtentDesc>,
}

fn parse_descriptor(text: &str) -> Result<Descriptor> {
    let mut desc = Descriptor {
        raw: text.to_string(),
        cid: 0,
        parent_cid: 0,
        parent_hint: None,
        extents: Vec::new(),
    };
    let mut offset = 0u64;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        if let Some(value) = line.strip_prefix("CID=") {
            desc.cid = u32::from_str_radix(value.trim(), 16)
                .map_err(|_| Error::invalid("VMDK descriptor", "bad CID"))?;
        } else if let Some(value) = line.strip_prefix("parentCID=") {
            desc.parent_cid = u32::from_str_radix(value.trim(), 16)
                .map_err(|_| Error::invalid("VMDK descriptor", "bad parentCID"))?;
        } else if let Some(value) = line.strip_prefix("parentFileNameHint=") {
            desc.parent_hint = Some(value.trim().trim_matches('"').to_string());
        } else if line.starts_with("RW ") || line.starts_with("RDONLY ") {
            let mut fields = line.split_whitespace();
            let _mode = fields.next();
            let sectors: u64 = fields
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::invalid("VMDK descriptor", "bad extent size"))?;
            let kind = fields.next().unwrap_or("");
            if kind != "SPARSE" && kind != "FLAT" {
                return Err(Error::Unsupported(format!("VMDK extent type {kind}")));
            }
            let name = line
                .split('"')
                .nth(1)
                .ok_or_else(|| Error::invalid("VMDK descriptor", "unquoted extent name"))?
                .to_string();
            desc.extents.push(ExtentDesc {
                start: offset,
                size: sectors * 512,
                sparse: kind == "SPARSE",
                name,
            });
            offset += sectors * 512;
        }
    }
    if desc.cid == 0 || desc.extents.is_empty() {
        return Err(Error::invalid(
            "VMDK descriptor",
            "no CID or extent lines found",
        ));
    }
    Ok(desc)
}

struct VmdkExtent {
    file: Mutex<File>,
    start: u64,
    size: u64,
    sparse: bool,
    grain_size: u64,
    /// Byte offsets of the two grain-table arrays.
    gt_offset: u64,
    gt2_offset: u64,
}

impl VmdkExtent {
    fn open(path: &Path, desc: &ExtentDesc, read_only: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        if !desc.sparse {
            return Ok(Self {
                file: Mutex::new(file),
                start: desc.start,
                size: desc.size,
                sparse: false,
                grain_size: 0,
                gt_offset: 0,
                gt2_offset: 0,
            });
        }
        let mut raw = [0u8; 512];
        file.read_exact(&mut raw)?;
        let header = VmdkSparseHeader::read_from_bytes(&raw)
            .map_err(|_| Error::invalid("VMDK descriptor", "short extent header"))?;
        if header.magic.get() != VMDK_MAGIC
            || header.version.get() != 1
            || header.single_end_line_char != 0x0A
            || header.non_end_line_char != 0x20
            || header.double_end_line_char1 != 0x0D
            || header.double_end_line_char2 != 0x0A
        {
            return Err(Error::invalid("VMDK descriptor", "bad KDMV extent header"));
        }
        let grain_size = header.grain_size.get() * 512;
        let grains = header.capacity.get() / header.grain_size.get();
        let gts = grains.div_ceil(GTES_PER_GT);
        let gd_bytes = (gts * 4).div_ceil(512) * 512;
        let gt_bytes = (grains * 4).div_ceil(512) * 512;
        Ok(Self {
            file: Mutex::new(file),
            start: desc.start,
            size: desc.size,
            sparse: true,
            grain_size,
            gt_offset: header.rgd_offset.get() * 512 + gd_bytes,
            gt2_offset: header.rgd_offset.get() * 512 + 2 * gd_bytes + gt_bytes,
        })
    }

    fn gte(&self, file: &mut File, grain: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        file.seek(SeekFrom::Start(self.gt_offset + grain * 4))?;
        file.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn set_gte(&self, file: &mut File, grain: u64, value: u32) -> Result<()> {
        let bytes = value.to_le_bytes();
        file.seek(SeekFrom::Start(self.gt_offset + grain * 4))?;
        file.write_all(&bytes)?;
        file.seek(SeekFrom::Start(self.gt2_offset + grain * 4))?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

pub struct VmdkDisk {
    path: PathBuf,
    descriptor: Descriptor,
    extents: Vec<VmdkExtent>,
    parent: Option<Box<VmdkDisk>>,
    size: u64,
    read_only: bool,
    modified: Mutex<bool>,
}

impl VmdkDisk {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut head = [0u8; 4];
        {
            let mut f = File::open(&path)?;
            f.read_exact(&mut head)?;
        }
        if u32::from_le_bytes(head) == VMDK_MAGIC {
            return Err(Error::Unsupported(
                "monolithic VMDK with embedded descriptor".into(),
            ));
        }
        let text = std::fs::read_to_string(&path)?;
        let descriptor = parse_descriptor(&text)?;
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

        let parent = if descriptor.parent_cid != 0xFFFF_FFFF {
            let hint = descriptor
                .parent_hint
                .clone()
                .ok_or_else(|| Error::ParentLink("no parentFileNameHint".into()))?;
            let parent_path = {
                let p = PathBuf::from(&hint);
                if p.is_absolute() {
                    p
                } else {
                    dir.join(p)
                }
            };
            if !parent_path.exists() {
                return Err(Error::ParentLink(format!(
                    "parent image {hint} not found"
                )));
            }
            let parent = VmdkDisk::open(&parent_path, true)?;
            if parent.descriptor.cid != descriptor.parent_cid {
                return Err(Error::ParentLink(format!(
                    "{hint}: CID {:08x} != parentCID {:08x}",
                    parent.descriptor.cid, descriptor.parent_cid
                )));
            }
            Some(Box::new(parent))
        } else {
            None
        };

        let mut extents = Vec::new();
        let mut size = 0u64;
        for desc in &descriptor.extents {
            let extent = VmdkExtent::open(&dir.join(&desc.name), desc, read_only)?;
            size += extent.size;
            extents.push(extent);
        }
        Ok(Self {
            path,
            descriptor,
            extents,
            parent,
            size,
            read_only,
            modified: Mutex::new(false),
        })
    }

    pub fn cid(&self) -> u32 {
        self.descriptor.cid
    }

    /// Create a dynamic (sparse) VMDK: descriptor plus `-s00N` extents of
    /// at most ~2 GiB each.
    pub fn create_dynamic(path: impl AsRef<Path>, size: u64, grain: u32) -> Result<Self> {
        if grain < 4 << 10 || !grain.is_power_of_two() {
            return Err(Error::Unsupported(
                "VMDK grain must be a power of two, 4 KiB minimum".into(),
            ));
        }
        let path = path.as_ref();
        let dir = path.parent().unwrap_or(Path::new("."));
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "disk".into());
        let (extent_cap, _, _, _) = calc_extent_meta(size, VMDK_GRAIN_SIZE as u64);

        let mut text = String::from(
            "# Disk DescriptorFile\nversion=1\nencoding=\"windows-1252\"\nCID=fffffffe\nparentCID=ffffffff\ncreateType=\"twoGbMaxExtentSparse\"\n\n# Extent description\n",
        );
        let mut left = size;
        let mut index = 1;
        while left > 0 {
            let seg = left.min(extent_cap);
            let ename = format!("{stem}-s{index:03}.vmdk");
            text.push_str(&format!("RW {} SPARSE \"{ename}\"\n", seg / 512));
            mk_sparse_extent(&dir.join(&ename), seg, grain as u64)?;
            left -= seg;
            index += 1;
        }
        text.push_str(&format!(
            "\n# The Disk Data Base\n#DDB\n\nddb.geometry.cylinders = \"{}\"\nddb.geometry.heads = \"255\"\nddb.geometry.sectors = \"63\"\n",
            size / (63 * 255 * 512)
        ));
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        f.write_all(text.as_bytes())?;
        f.sync_data()?;
        drop(f);
        Self::open(path, false)
    }

    /// A differencing VMDK: a fresh sparse disk whose descriptor names the
    /// parent and pins its CID.
    pub fn create_differencing(path: impl AsRef<Path>, parent: impl AsRef<Path>) -> Result<Self> {
        let base = VmdkDisk::open(parent.as_ref(), true)?;
        let grain = base
            .extents
            .iter()
            .find(|e| e.sparse)
            .map(|e| e.grain_size as u32)
            .unwrap_or(VMDK_GRAIN_SIZE);
        let child = Self::create_dynamic(path.as_ref(), base.size, grain)?;
        let text = child.descriptor.raw.replace(
            "parentCID=ffffffff",
            &format!(
                "parentCID={:08x}\nparentFileNameHint=\"{}\"",
                base.descriptor.cid,
                parent.as_ref().to_string_lossy()
            ),
        );
        std::fs::write(path.as_ref(), text)?;
        drop(child);
        Self::open(path, false)
    }

    fn extent_for(&self, pos: u64) -> Result<&VmdkExtent> {
        self.extents
            .iter()
            .find(|e| pos >= e.start && pos < e.start + e.size)
            .ok_or_else(|| Error::out_of_range(pos, self.size))
    }

    /// Rewrite the descriptor with a fresh random CID; called on flush
    /// after a writing session so children of the old state are orphaned.
    fn refresh_cid(&self) -> Result<()> {
        let new_cid: u32 = rand::thread_rng().gen_range(1..=0xFFFF_FFFD);
        let text = self.descriptor.raw.replace(
            &format!("CID={:08x}", self.descriptor.cid),
            &format!("CID={new_cid:x}"),
        );
        // The descriptor sometimes spells the CID without zero padding.
        let text = if text == self.descriptor.raw {
            self.descriptor.raw.replace(
                &format!("CID={:x}", self.descriptor.cid),
                &format!("CID={new_cid:x}"),
            )
        } else {
            text
        };
        std::fs::write(&self.path, text)?;
        debug!(
            "{}: refreshed CID {:08x} -> {new_cid:08x}",
            self.path.display(),
            self.descriptor.cid
        );
        Ok(())
    }
}

fn mk_sparse_extent(path: &Path, size: u64, grain_size: u64) -> Result<()> {
    let (_, gd_sectors, gt_sectors, overhead_grains) = calc_extent_meta(size, grain_size);
    let mut header = VmdkSparseHeader::new_zeroed();
    header.magic.set(VMDK_MAGIC);
    header.version.set(1);
    header.flags.set(3);
    header.capacity.set(size / 512);
    header.grain_size.set(grain_size / 512);
    header.num_gtes_per_gt.set(GTES_PER_GT as u32);
    header.rgd_offset.set(1);
    header
        .gd_offset
        .set(1 + gd_sectors + gt_sectors);
    header
        .overhead
        .set(overhead_grains * grain_size / 512);
    header.single_end_line_char = 0x0A;
    header.non_end_line_char = 0x20;
    header.double_end_line_char1 = 0x0D;
    header.double_end_line_char2 = 0x0A;

    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    f.write_all(header.as_bytes())?;
    // Each directory entry points at its table, tables packed right after
    // the directory (4 sectors each).
    let mut gd = Vec::with_capacity(gd_sectors as usize * 512);
    let gt_base = 1 + gd_sectors;
    for i in 0..(gd_sectors * 512 / 4) {
        let gt = if i * 4 < gt_sectors {
            (gt_base + i * 4) as u32
        } else {
            0
        };
        gd.extend_from_slice(&gt.to_le_bytes());
    }
    f.write_all(&gd)?;
    f.write_all(&vec![0u8; gt_sectors as usize * 512])?;
    let gd2_base = header.gd_offset.get();
    let gt2_base = gd2_base + gd_sectors;
    f.seek(SeekFrom::Start(gd2_base * 512))?;
    let mut gd2 = Vec::with_capacity(gd_sectors as usize * 512);
    for i in 0..(gd_sectors * 512 / 4) {
        let gt = if i * 4 < gt_sectors {
            (gt2_base + i * 4) as u32
        } else {
            0
        };
        gd2.extend_from_slice(&gt.to_le_bytes());
    }
    f.write_all(&gd2)?;
    f.write_all(&vec![0u8; gt_sectors as usize * 512])?;
    // Pad the metadata to a whole grain.
    let pos = f.stream_position()?;
    let meta = overhead_grains * grain_size;
    if pos < meta {
        f.seek(SeekFrom::Start(meta - 1))?;
        f.write_all(&[0])?;
    }
    f.sync_data()?;
    Ok(())
}

impl BlockDevice for VmdkDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(Error::out_of_range(offset, self.size));
        }
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let extent = self.extent_for(pos)?;
            let in_extent = pos - extent.start;
            if !extent.sparse {
                let take = ((buf.len() - done) as u64).min(extent.size - in_extent) as usize;
                let mut file = extent.file.lock();
                file.seek(SeekFrom::Start(in_extent))?;
                file.read_exact(&mut buf[done..done + take])?;
                done += take;
                pos += take as u64;
                continue;
            }
            let grain = in_extent / extent.grain_size;
            let in_grain = in_extent % extent.grain_size;
            let take = ((buf.len() - done) as u64).min(extent.grain_size - in_grain) as usize;
            let chunk = &mut buf[done..done + take];
            let gte = {
                let mut file = extent.file.lock();
                extent.gte(&mut file, grain)?
            };
            match gte {
                0 => {
                    if let Some(parent) = &self.parent {
                        parent.read_at(pos, chunk)?;
                    } else {
                        chunk.fill(0);
                    }
                }
                1 => chunk.fill(0),
                sector => {
                    let mut file = extent.file.lock();
                    file.seek(SeekFrom::Start(sector as u64 * 512 + in_grain))?;
                    file.read_exact(chunk)?;
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
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let extent = self.extent_for(pos)?;
            let in_extent = pos - extent.start;
            if !extent.sparse {
                let take = ((buf.len() - done) as u64).min(extent.size - in_extent) as usize;
                let mut file = extent.file.lock();
                file.seek(SeekFrom::Start(in_extent))?;
                file.write_all(&buf[done..done + take])?;
                done += take;
                pos += take as u64;
                continue;
            }
            let grain = in_extent / extent.grain_size;
            let in_grain = in_extent % extent.grain_size;
            let take = ((buf.len() - done) as u64).min(extent.grain_size - in_grain) as usize;
            let chunk = &buf[done..done + take];
            let mut file = extent.file.lock();
            let mut gte = extent.gte(&mut file, grain)?;
            if gte <= 1 {
                let parent_data = match (&self.parent, gte) {
                    (Some(parent), 0) => {
                        let mut data = vec![0u8; extent.grain_size as usize];
                        parent.read_at(extent.start + grain * extent.grain_size, &mut data)?;
                        if data.iter().any(|&b| b != 0) {
                            Some(data)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                if parent_data.is_none() && chunk.iter().all(|&b| b == 0) {
                    // Zeros into a virtual grain stay virtual.
                    if gte == 0 {
                        extent.set_gte(&mut file, grain, 1)?;
                    }
                    *self.modified.lock() = true;
                    done += take;
                    pos += take as u64;
                    continue;
                }
                let end = file.metadata()?.len();
                let sector = (end / 512) as u32;
                match parent_data {
                    Some(data) => {
                        file.seek(SeekFrom::Start(end))?;
                        file.write_all(&data)?;
                    }
                    None => {
                        file.set_len(end + extent.grain_size)?;
                    }
                }
                extent.set_gte(&mut file, grain, sector)?;
                gte = sector;
            }
            file.seek(SeekFrom::Start(gte as u64 * 512 + in_grain))?;
            file.write_all(chunk)?;
            *self.modified.lock() = true;
            done += take;
            pos += take as u64;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&self) -> Result<()> {
        for extent in &self.extents {
            extent.file.lock().sync_data()?;
        }
        let mut modified = self.modified.lock();
        if *modified {
            self.refresh_cid()?;
            *modified = false;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let disk = VmdkDisk::create_dynamic(&path, 16 << 20, VMDK_GRAIN_SIZE).unwrap();
        let mut buf = vec![0u8; 128 << 10];
        disk.read_at(1 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        let data: Vec<u8> = (0..buf.len()).map(|i| (i % 241) as u8).collect();
        disk.write_at(1 << 20, &data).unwrap();
        disk.read_at(1 << 20, &mut buf).unwrap();
        assert_eq!(buf, data);
        disk.flush().unwrap();
        drop(disk);
        let disk = VmdkDisk::open(&path, true).unwrap();
        disk.read_at(1 << 20, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn cid_changes_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let disk = VmdkDisk::create_dynamic(&path, 8 << 20, VMDK_GRAIN_SIZE).unwrap();
        let before = disk.cid();
        disk.write_at(0, &[0x11u8; 512]).unwrap();
        disk.flush().unwrap();
        drop(disk);
        let disk = VmdkDisk::open(&path, true).unwrap();
        assert_ne!(disk.cid(), before);
    }

    #[test]
    fn differencing_reads_parent_and_refuses_stale_link() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.vmdk");
        let delta_path = dir.path().join("delta.vmdk");
        let base = VmdkDisk::create_dynamic(&base_path, 8 << 20, VMDK_GRAIN_SIZE).unwrap();
        base.write_at(4096, b"from the parent").unwrap();
        base.flush().unwrap();
        drop(base);

        let delta = VmdkDisk::create_differencing(&delta_path, &base_path).unwrap();
        let mut buf = [0u8; 15];
        delta.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"from the parent");
        delta.write_at(4100, b"THE").unwrap();
        delta.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"fromTHEe parent");
        drop(delta);

        // Writing the parent refreshes its CID; the child must refuse.
        let base = VmdkDisk::open(&base_path, false).unwrap();
        base.write_at(0, &[5u8; 512]).unwrap();
        base.flush().unwrap();
        drop(base);
        assert!(matches!(
            VmdkDisk::open(&delta_path, false),
            Err(Error::ParentLink(_))
        ));
    }
}
