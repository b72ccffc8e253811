//! fatio — a host-side, userspace engine for FAT-family file systems.
//!
//! Reads and writes FAT12, FAT16, FAT32 and exFAT volumes living inside raw
//! images, host block devices or virtual disk containers (VHD fixed/dynamic/
//! differencing, VHDX with log replay, VDI, VMDK sparse), without a kernel
//! mount. Bottom-up, each layer depends only on the ones below it:
//!
//! - [`device`]: seekable, sized block devices with a fixed sector size
//! - [`vhd`], [`vhdx`], [`vdi`], [`vmdk`], [`vdisk`]: container backends
//! - [`cache`]: a write-back sector cache over any block device
//! - [`partition`]: MBR and GPT tables, exposing sub-ranges as devices
//! - [`bpb`]: boot-sector/VBR decoding and the volume geometry
//! - [`fat`]: the cluster allocator (FAT slot array, exFAT bitmap)
//! - [`chain`]: a seekable byte stream over a (fragmented) cluster chain
//! - [`entry`], [`dir`], [`file`]: directory tables and file handles
//! - [`fs`]: volume mount/unmount and the directory-table registry
//! - [`mkfs`]: formatters
//! - [`tools`]: host-to-image copy helpers
//!
//! Everything on disk is little-endian except the VHD structures, which are
//! big-endian; all multi-byte integers go through explicit byte-order types.
//!
//! The engine is single-threaded cooperative within a volume: callers must
//! serialize mutations.

pub mod bpb;
pub mod cache;
pub mod chain;
pub mod device;
pub mod dir;
pub mod entry;
pub mod error;
pub mod fat;
pub mod file;
pub mod fs;
pub mod mkfs;
pub mod partition;
pub mod tools;
pub mod vdi;
pub mod vdisk;
pub mod vhd;
pub mod vhdx;
pub mod vmdk;

pub use bpb::{FatKind, VolumeDescriptor};
pub use device::{BlockDevice, FileDisk, MemDisk, PartitionView};
pub use error::{Error, Result};
pub use file::FileHandle;
pub use fs::{DirRef, Volume};

/// Size of one directory slot, common to every FAT variant.
pub const DIRENT_SIZE: usize = 32;

/// Longest long file name, in UTF-16 code units.
pub const LONG_NAME_MAX: usize = 255;

/// Longest path accepted by the lookup routines.
pub const PATH_MAX: usize = 260;

/// First data cluster index; clusters 0 and 1 are reserved sentinels.
pub const FIRST_DATA_CLUSTER: u32 = 2;

/// Splits a path on `/` and `\`, dropping empty components.
pub(crate) fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|c| !c.is_empty()).collect()
}
