//! Container detection and the top-level open
//!
//! `open_image` sniffs the container format by signature — `conectix` in
//! the trailing 512 bytes (VHD), `vhdxfile` at offset 0 (VHDX), the
//! 0xBEDA107F cookie at offset 64 (VDI), `KDMV` at 0 or a textual
//! descriptor with extent lines (VMDK) — and falls back to RAW, with the
//! file extension as a tie-break for ambiguous or empty images.
//!
//! `open_volume` mounts a FAT/exFAT volume from a container: `Auto` tries
//! the partition table first and falls back to treating the whole disk as
//! one volume, which is how unpartitioned floppies and superfloppy media
//! present themselves.

use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::device::{BlockDevice, FileDisk};
use crate::error::{Error, Result};
use crate::fs::Volume;
use crate::partition;
use crate::vdi::VdiDisk;
use crate::vhd::VhdDisk;
use crate::vhdx::VhdxDisk;
use crate::vmdk::VmdkDisk;

/// What `open` should resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenWhat {
    /// First partition if a table exists, else the whole disk.
    Auto,
    /// The raw disk device.
    Disk,
    /// A specific partition.
    Partition(usize),
    /// The whole disk as one volume.
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Vhd,
    Vhdx,
    Vdi,
    Vmdk,
}

/// Sniff the container format from its signatures, falling back to the
/// extension.
pub fn probe_format(path: impl AsRef<Path>) -> Result<ImageFormat> {
    let path = path.as_ref();
    let mut head = [0u8; 512];
    let mut tail = [0u8; 8];
    {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = std::fs::File::open(path)?;
        let len = f.metadata()?.len();
        let got = f.read(&mut head)?;
        head[got..].fill(0);
        if len >= 512 {
            f.seek(SeekFrom::Start(len - 512))?;
            f.read_exact(&mut tail)?;
        }
    }
    if &head[..8] == b"vhdxfile" {
        return Ok(ImageFormat::Vhdx);
    }
    if &tail == b"conectix" || &head[..8] == b"conectix" {
        return Ok(ImageFormat::Vhd);
    }
    if head.len() >= 68 && u32::from_le_bytes([head[64], head[65], head[66], head[67]]) == crate::vdi::VDI_SIGNATURE
    {
        return Ok(ImageFormat::Vdi);
    }
    if u32::from_le_bytes([head[0], head[1], head[2], head[3]]) == crate::vmdk::VMDK_MAGIC {
        return Ok(ImageFormat::Vmdk);
    }
    if head.starts_with(b"# Disk DescriptorFile")
        || (head.iter().all(|&b| b == 0 || b.is_ascii()) && {
            let text = String::from_utf8_lossy(&head);
            text.contains("CID=") && (text.contains("SPARSE") || text.contains("FLAT"))
        })
    {
        return Ok(ImageFormat::Vmdk);
    }
    // Unrecognized innards: trust the extension.
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    Ok(match ext.as_str() {
        "vhd" => ImageFormat::Vhd,
        "vhdx" => ImageFormat::Vhdx,
        "vdi" => ImageFormat::Vdi,
        "vmdk" => ImageFormat::Vmdk,
        _ => ImageFormat::Raw,
    })
}

/// Open any supported container as a block device.
pub fn open_image(path: impl AsRef<Path>, read_only: bool) -> Result<Arc<dyn BlockDevice>> {
    let path = path.as_ref();
    let format = probe_format(path)?;
    debug!("opening {} as {format:?}", path.display());
    Ok(match format {
        ImageFormat::Raw => Arc::new(FileDisk::open(path, read_only)?),
        ImageFormat::Vhd => Arc::new(VhdDisk::open(path, read_only)?),
        ImageFormat::Vhdx => Arc::new(VhdxDisk::open(path, read_only)?),
        ImageFormat::Vdi => Arc::new(VdiDisk::open(path, read_only)?),
        ImageFormat::Vmdk => Arc::new(VmdkDisk::open(path, read_only)?),
    })
}

/// Create an empty container of the requested format and size. Dynamic
/// variants get their default block/grain sizes.
pub fn create_image(
    path: impl AsRef<Path>,
    format: ImageFormat,
    size: u64,
) -> Result<Arc<dyn BlockDevice>> {
    let path = path.as_ref();
    Ok(match format {
        ImageFormat::Raw => Arc::new(FileDisk::create(path, size)?),
        ImageFormat::Vhd => Arc::new(VhdDisk::create_dynamic(path, size, crate::vhd::VHD_BLOCK_SIZE)?),
        ImageFormat::Vhdx => Arc::new(VhdxDisk::create_dynamic(path, size, 2 << 20)?),
        ImageFormat::Vdi => Arc::new(VdiDisk::create_dynamic(path, size, crate::vdi::VDI_BLOCK_SIZE)?),
        ImageFormat::Vmdk => {
            Arc::new(VmdkDisk::create_dynamic(path, size, crate::vmdk::VMDK_GRAIN_SIZE)?)
        }
    })
}

/// Open a container and mount the requested thing inside it.
pub fn open_volume(
    path: impl AsRef<Path>,
    read_only: bool,
    what: OpenWhat,
) -> Result<Arc<Volume>> {
    let disk = open_image(path, read_only)?;
    open_volume_on(disk, read_only, what)
}

/// Same, over an already-open device.
pub fn open_volume_on(
    disk: Arc<dyn BlockDevice>,
    read_only: bool,
    what: OpenWhat,
) -> Result<Arc<Volume>> {
    match what {
        OpenWhat::Disk | OpenWhat::Volume => Volume::mount(disk, read_only),
        OpenWhat::Partition(index) => {
            let part = partition::open_partition(&disk, index)?;
            Volume::mount(part, read_only)
        }
        OpenWhat::Auto => {
            match partition::read_table(&disk) {
                Ok(table) if !table.partitions().is_empty() => {
                    let part = partition::open_partition(&disk, table.partitions()[0].index)?;
                    Volume::mount(part, read_only)
                }
                _ => Volume::mount(disk, read_only),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_by_signature() {
        let dir = tempfile::tempdir().unwrap();
        let vhd = dir.path().join("a.img"); // wrong extension on purpose
        VhdDisk::create_dynamic(&vhd, 4 << 20, 2 << 20).unwrap();
        assert_eq!(probe_format(&vhd).unwrap(), ImageFormat::Vhd);

        let vdi = dir.path().join("b.img");
        VdiDisk::create_dynamic(&vdi, 4 << 20, 1 << 20).unwrap();
        assert_eq!(probe_format(&vdi).unwrap(), ImageFormat::Vdi);

        let raw = dir.path().join("c.img");
        FileDisk::create(&raw, 1 << 20).unwrap();
        assert_eq!(probe_format(&raw).unwrap(), ImageFormat::Raw);
    }

    #[test]
    fn image_types_round_trip_as_block_devices() {
        let dir = tempfile::tempdir().unwrap();
        for (name, format) in [
            ("t.vhd", ImageFormat::Vhd),
            ("t.vhdx", ImageFormat::Vhdx),
            ("t.vdi", ImageFormat::Vdi),
            ("t.vmdk", ImageFormat::Vmdk),
            ("t.img", ImageFormat::Raw),
        ] {
            let path = dir.path().join(name);
            let disk = create_image(&path, format, 8 << 20).unwrap();
            disk.write_at(1 << 20, b"fatio!").unwrap();
            disk.flush().unwrap();
            drop(disk);
            let disk = open_image(&path, false).unwrap();
            let mut buf = [0u8; 6];
            disk.read_at(1 << 20, &mut buf).unwrap();
            assert_eq!(&buf, b"fatio!", "{name}");
        }
    }
}
