//! VDI (VirtualBox Disk Image) backend
//!
//! Little-endian throughout, with every region 1 MiB aligned: a 512-byte
//! header (signature 0xBEDA107F) inside the first MiB, the block
//! allocation table at `bat_offset`, and fixed-size data blocks (1 MiB
//! minimum) from `blocks_offset` on. A BAT entry holds the index of the
//! data block backing a virtual block: 0xFFFFFFFF is unallocated (read as
//! zeros, or through the parent on a differencing image), 0xFFFFFFFE is
//! virtually allocated and zeroed. Blocks are allocated at the file's end
//! in write order.
//!
//! A differencing VDI links to its parent by UUID pair: `uuid_linkage`
//! must equal the parent's create UUID and `uuid_parent_modify` its modify
//! UUID at snapshot time, so a parent altered after the snapshot is
//! refused. The parent is located by scanning sibling `.vdi` files. On
//! close after a write, the image's own modify UUID is regenerated and the
//! allocated-block count rewritten.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use spin::Mutex;
use uuid::Uuid;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

pub const VDI_SIGNATURE: u32 = 0xBEDA_107F;
pub const VDI_BLOCK_SIZE: u32 = 1 << 20;

pub const IMAGE_TYPE_DYNAMIC: u32 = 1;
pub const IMAGE_TYPE_FIXED: u32 = 2;
pub const IMAGE_TYPE_DIFFERENCING: u32 = 4;

const UNALLOCATED: u32 = 0xFFFF_FFFF;
const ZEROED: u32 = 0xFFFF_FFFE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct VdiHeader {
    /// Free-form text, conventionally naming the creator.
    pub descriptor: [u8; 64],
    /// 0xBEDA107F
    pub signature: U32,
    /// 0x00010001 for format 1.1.
    pub version: U32,
    pub header_size: U32,
    /// 1=dynamic, 2=fixed, 3=undo, 4=differencing.
    pub image_type: U32,
    pub flags: U32,
    pub description: [u8; 256],
    pub bat_offset: U32,
    pub blocks_offset: U32,
    /// Legacy geometry slot, zero in 1.1 images.
    pub legacy_geometry: [u8; 16],
    pub unused: U32,
    pub current_size: U64,
    pub block_size: U32,
    /// Sector-aligned data preceding each block, normally 0.
    pub block_extra_size: U32,
    pub total_blocks: U32,
    pub allocated_blocks: U32,
    /// Set at image creation.
    pub uuid_create: [u8; 16],
    /// Regenerated at every modification.
    pub uuid_modify: [u8; 16],
    /// Parent's create UUID (differencing only).
    pub uuid_linkage: [u8; 16],
    /// Parent's modify UUID at snapshot time.
    pub uuid_parent_modify: [u8; 16],
    pub cylinders: U32,
    pub heads: U32,
    pub sectors: U32,
    pub sector_size: U32,
    pub padding: [u8; 40],
}

struct VdiState {
    file: File,
    bat: Vec<u32>,
    parent: Option<Arc<VdiDisk>>,
    modified: bool,
    header_synced: bool,
}

pub struct VdiDisk {
    path: PathBuf,
    header: VdiHeader,
    state: Mutex<VdiState>,
    size: u64,
    block_size: u64,
    blocks_offset: u64,
    read_only: bool,
}

impl VdiDisk {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let mut raw = [0u8; 512];
        file.read_exact(&mut raw)?;
        let header =
            VdiHeader::read_from_bytes(&raw).map_err(|_| Error::invalid("VDI header", "layout"))?;
        if header.signature.get() != VDI_SIGNATURE {
            return Err(Error::invalid("VDI header", "bad signature"));
        }
        let image_type = header.image_type.get();
        if !matches!(
            image_type,
            IMAGE_TYPE_DYNAMIC | IMAGE_TYPE_FIXED | IMAGE_TYPE_DIFFERENCING
        ) {
            return Err(Error::Unsupported(format!("VDI image type {image_type}")));
        }
        let total_blocks = header.total_blocks.get() as usize;
        let mut bat_raw = vec![0u8; total_blocks * 4];
        file.seek(SeekFrom::Start(header.bat_offset.get() as u64))?;
        file.read_exact(&mut bat_raw)?;
        let bat: Vec<u32> = bat_raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let parent = if image_type == IMAGE_TYPE_DIFFERENCING {
            let parent = find_parent(&path, &header)?;
            if parent.header.uuid_modify != header.uuid_parent_modify {
                return Err(Error::ParentLink(format!(
                    "{}: parent was altered after the snapshot",
                    parent.path.display()
                )));
            }
            Some(Arc::new(parent))
        } else {
            None
        };

        Ok(Self {
            size: header.current_size.get(),
            block_size: header.block_size.get() as u64,
            blocks_offset: header.blocks_offset.get() as u64,
            state: Mutex::new(VdiState {
                file,
                bat,
                parent,
                modified: false,
                header_synced: true,
            }),
            header,
            path,
            read_only,
        })
    }

    fn new_header(size: u64, block: u32, image_type: u32) -> VdiHeader {
        let mut header = VdiHeader::new_zeroed();
        let text = b"<<< fatio VDI Disk Image >>>\n";
        header.descriptor[..text.len()].copy_from_slice(text);
        header.signature.set(VDI_SIGNATURE);
        header.version.set(0x0001_0001);
        header.header_size.set(0x200);
        header.image_type.set(image_type);
        header.bat_offset.set(1 << 20);
        let total_blocks = size.div_ceil(block as u64) as u32;
        let bat_mb = ((total_blocks as u64 * 4).div_ceil(1 << 20) << 20) as u32;
        header.blocks_offset.set((1 << 20) + bat_mb);
        header.current_size.set(size);
        header.block_size.set(block);
        header.total_blocks.set(total_blocks);
        header.uuid_create = *Uuid::new_v4().as_bytes();
        header.uuid_modify = *Uuid::new_v4().as_bytes();
        header.sector_size.set(512);
        header
    }

    pub fn create_dynamic(path: impl AsRef<Path>, size: u64, block: u32) -> Result<Self> {
        if block < 1 << 20 {
            return Err(Error::Unsupported("VDI block under 1 MiB".into()));
        }
        let header = Self::new_header(size, block, IMAGE_TYPE_DYNAMIC);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.write_all(header.as_bytes())?;
        file.set_len(header.blocks_offset.get() as u64)?;
        file.seek(SeekFrom::Start(header.bat_offset.get() as u64))?;
        file.write_all(&vec![0xFFu8; header.total_blocks.get() as usize * 4])?;
        file.sync_data()?;
        drop(file);
        Self::open(path, false)
    }

    /// All blocks mapped in order at creation time.
    pub fn create_fixed(path: impl AsRef<Path>, size: u64, block: u32) -> Result<Self> {
        if block < 1 << 20 {
            return Err(Error::Unsupported("VDI block under 1 MiB".into()));
        }
        let mut header = Self::new_header(size, block, IMAGE_TYPE_FIXED);
        header.allocated_blocks.set(header.total_blocks.get());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.write_all(header.as_bytes())?;
        file.seek(SeekFrom::Start(header.bat_offset.get() as u64))?;
        let mut bat = Vec::with_capacity(header.total_blocks.get() as usize * 4);
        for i in 0..header.total_blocks.get() {
            bat.extend_from_slice(&i.to_le_bytes());
        }
        file.write_all(&bat)?;
        file.set_len(header.blocks_offset.get() as u64 + size)?;
        file.sync_data()?;
        drop(file);
        Self::open(path, false)
    }

    pub fn create_differencing(path: impl AsRef<Path>, parent: impl AsRef<Path>) -> Result<Self> {
        let base = VdiDisk::open(parent.as_ref(), true)?;
        let mut header = Self::new_header(
            base.size,
            base.header.block_size.get(),
            IMAGE_TYPE_DIFFERENCING,
        );
        header.uuid_linkage = base.header.uuid_create;
        header.uuid_parent_modify = base.header.uuid_modify;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.write_all(header.as_bytes())?;
        file.set_len(header.blocks_offset.get() as u64)?;
        file.seek(SeekFrom::Start(header.bat_offset.get() as u64))?;
        file.write_all(&vec![0xFFu8; header.total_blocks.get() as usize * 4])?;
        file.sync_data()?;
        drop(file);
        Self::open(path, false)
    }

    pub fn create_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.header.uuid_create)
    }

    fn has_block(&self, state: &VdiState, index: usize) -> bool {
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

    fn set_bat(&self, state: &mut VdiState, index: usize, value: u32) -> Result<()> {
        state.bat[index] = value;
        state
            .file
            .seek(SeekFrom::Start(self.header.bat_offset.get() as u64 + index as u64 * 4))?;
        state.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// New data block at the end of the file; returns its index.
    fn allocate_block(&self, state: &mut VdiState) -> Result<u32> {
        let end = state.file.metadata()?.len().max(self.blocks_offset);
        let block = (end - self.blocks_offset) / self.block_size;
        state
            .file
            .set_len(self.blocks_offset + (block + 1) * self.block_size)?;
        debug!("{}: allocated data block {block}", self.path.display());
        Ok(block as u32)
    }

    /// Rewrite the header with a fresh modify UUID and the allocated-block
    /// count; called once per modified session.
    fn sync_header(&self, state: &mut VdiState) -> Result<()> {
        if state.header_synced || !state.modified {
            return Ok(());
        }
        let end = state.file.metadata()?.len().max(self.blocks_offset);
        let mut header = self.header;
        header
            .allocated_blocks
            .set(((end - self.blocks_offset) / self.block_size) as u32);
        header.uuid_modify = *Uuid::new_v4().as_bytes();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(header.as_bytes())?;
        state.header_synced = true;
        Ok(())
    }
}

/// Scan sibling `.vdi` images for the one whose create UUID matches the
/// child's linkage UUID.
fn find_parent(child: &Path, header: &VdiHeader) -> Result<VdiDisk> {
    let dir = child.parent().unwrap_or(Path::new("."));
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path == child {
            continue;
        }
        let is_vdi = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("vdi"))
            .unwrap_or(false);
        if !is_vdi {
            continue;
        }
        if let Ok(image) = VdiDisk::open(&path, true) {
            if image.header.uuid_create == header.uuid_linkage {
                return Ok(image);
            }
        }
    }
    Err(Error::ParentLink(format!(
        "{}: no sibling image matches the linkage UUID",
        child.display()
    )))
}

impl BlockDevice for VdiDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(Error::out_of_range(offset, self.size));
        }
        let extra = self.header.block_extra_size.get() as u64;
        let mut state = self.state.lock();
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let index = (pos / self.block_size) as usize;
            let in_block = pos % self.block_size;
            let take = ((buf.len() - done) as u64).min(self.block_size - in_block) as usize;
            let chunk = &mut buf[done..done + take];
            match state.bat[index] {
                UNALLOCATED => {
                    if let Some(parent) = &state.parent {
                        parent.read_at(pos, chunk)?;
                    } else {
                        chunk.fill(0);
                    }
                }
                ZEROED => chunk.fill(0),
                block => {
                    state.file.seek(SeekFrom::Start(
                        self.blocks_offset + block as u64 * self.block_size + extra + in_block,
                    ))?;
                    state.file.read_exact(chunk)?;
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
        let extra = self.header.block_extra_size.get() as u64;
        let mut state = self.state.lock();
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let index = (pos / self.block_size) as usize;
            let in_block = pos % self.block_size;
            let take = ((buf.len() - done) as u64).min(self.block_size - in_block) as usize;
            let chunk = &buf[done..done + take];
            let mut block = state.bat[index];
            if block == UNALLOCATED || block == ZEROED {
                let parent_holds = block == UNALLOCATED && {
                    let held = match &state.parent {
                        Some(parent) => {
                            let pstate = parent.state.lock();
                            parent.has_block(&pstate, index)
                        }
                        None => false,
                    };
                    held
                };
                if parent_holds {
                    // Whole-block copy-on-write from the parent chain.
                    let new_block = self.allocate_block(&mut state)?;
                    let mut data = vec![0u8; self.block_size as usize];
                    if let Some(parent) = &state.parent {
                        parent.read_at(index as u64 * self.block_size, &mut data)?;
                    }
                    state.file.seek(SeekFrom::Start(
                        self.blocks_offset + new_block as u64 * self.block_size + extra,
                    ))?;
                    state.file.write_all(&data)?;
                    self.set_bat(&mut state, index, new_block)?;
                    block = new_block;
                } else if chunk.iter().all(|&b| b == 0) {
                    // Zeros into a virtual block stay virtual.
                    if block == UNALLOCATED {
                        self.set_bat(&mut state, index, ZEROED)?;
                    }
                    state.modified = true;
                    state.header_synced = false;
                    done += take;
                    pos += take as u64;
                    continue;
                } else {
                    let new_block = self.allocate_block(&mut state)?;
                    self.set_bat(&mut state, index, new_block)?;
                    block = new_block;
                }
            }
            state.file.seek(SeekFrom::Start(
                self.blocks_offset + block as u64 * self.block_size + extra + in_block,
            ))?;
            state.file.write_all(chunk)?;
            state.modified = true;
            state.header_synced = false;
            done += take;
            pos += take as u64;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.sync_header(&mut state)?;
        state.file.sync_data()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl Drop for VdiDisk {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(e) = self.sync_header(&mut state) {
            log::error!("{}: header sync on drop failed: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vdi");
        let disk = VdiDisk::create_dynamic(&path, 8 << 20, VDI_BLOCK_SIZE).unwrap();
        let mut buf = vec![0xEEu8; 8192];
        disk.read_at(5 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        disk.write_at(5 << 20, &vec![0x42u8; 8192]).unwrap();
        disk.flush().unwrap();
        drop(disk);
        let disk = VdiDisk::open(&path, true).unwrap();
        disk.read_at(5 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn zero_write_virtualizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vdi");
        let disk = VdiDisk::create_dynamic(&path, 4 << 20, VDI_BLOCK_SIZE).unwrap();
        disk.write_at(0, &vec![0u8; 1 << 20]).unwrap();
        disk.flush().unwrap();
        // The data area must still be empty: the zero block was virtual.
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), disk.blocks_offset);
    }

    #[test]
    fn differencing_links_and_cows() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.vdi");
        let delta_path = dir.path().join("delta.vdi");
        let base = VdiDisk::create_dynamic(&base_path, 4 << 20, VDI_BLOCK_SIZE).unwrap();
        base.write_at(100, b"parent bytes").unwrap();
        base.flush().unwrap();
        drop(base);

        let delta = VdiDisk::create_differencing(&delta_path, &base_path).unwrap();
        let mut buf = [0u8; 12];
        delta.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"parent bytes");
        delta.write_at(107, b"DATA").unwrap();
        delta.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"parent DATAs");
        delta.flush().unwrap();
        drop(delta);

        // Parent modified after the snapshot: the child must refuse.
        let base = VdiDisk::open(&base_path, false).unwrap();
        base.write_at(0, &[1u8; 512]).unwrap();
        base.flush().unwrap();
        drop(base);
        assert!(matches!(
            VdiDisk::open(&delta_path, false),
            Err(Error::ParentLink(_))
        ));
    }
}
