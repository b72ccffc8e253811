//! BIOS Parameter Block (BPB) and Boot Sector
//!
//! The first important data structure on a FAT volume is the BPB, located in
//! the first sector of the volume in the Reserved Region. This sector is
//! sometimes called the "boot sector" or the "0th sector"; the important
//! fact is simply that it is the first sector of the volume. An exFAT volume
//! instead begins with a 12-sector Volume Boot Record whose BPB area is
//! zeroed, which is also how the variant is told apart.
//!
//! Variant detection, in order:
//! 1. bytes-per-sector field reads zero -> exFAT (the VBR zeroes the BPB);
//! 2. max root entries reads zero -> FAT32;
//! 3. the informational file-system-type string says "FAT12" or "FAT16";
//! 4. otherwise, fewer than 512 root entries -> FAT12, else FAT16.
//!
//! The variant legality is then cross-checked against the count of data
//! clusters: there is no such thing as a FAT12 volume with more than 4084
//! clusters, a FAT16 volume outside [4085, 65524], or a FAT32 volume below
//! 65525 clusters. Cluster indices start at 2, so the maximum valid cluster
//! number is CountofClusters + 1.
//!
//! Region layout (byte offsets relative to the volume start):
//!
//! ```text
//! fat_offset  = reserved_sectors * sector_size
//! FAT12/16:   root_offset = fat_offset + num_fats * fat_size
//!             data_offset = root_offset + root_entries * 32
//! FAT32/exFAT: data_offset = fat_offset + num_fats * fat_size
//!             (exFAT: data_offset comes straight from ClusterHeapOffset)
//! cluster_to_offset(c) = data_offset + (c - 2) * cluster_size
//! ```
//!
//! The exFAT VBR carries a checksum over its first 11 sectors, computed with
//! a rolling rotate-and-add over every byte except the VolumeFlags word and
//! PercentInUse (offsets 106, 107 and 112 of the boot sector), replicated as
//! a DWORD across the whole 12th sector.

use std::sync::Arc;

use log::warn;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const FSINFO_LEAD_SIG: u32 = 0x41615252;
pub const FSINFO_STRUCT_SIG: u32 = 0x61417272;
pub const FSINFO_TRAIL_SIG: u32 = 0xAA550000;

/// Largest cluster this engine accepts: 32 MiB.
pub const MAX_CLUSTER_BYTES: u64 = 32 << 20;

pub const MAX_CLUSTER_FAT12: u32 = 4085;
pub const MAX_CLUSTER_FAT16: u32 = 65525;
pub const MAX_CLUSTER_FAT32: u32 = (1 << 28) - 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
    ExFat,
}

impl FatKind {
    /// Bits per FAT slot (exFAT uses full 32-bit slots).
    pub fn slot_bits(&self) -> u32 {
        match self {
            FatKind::Fat12 => 12,
            FatKind::Fat16 => 16,
            FatKind::Fat32 => 32,
            FatKind::ExFat => 32,
        }
    }

    /// Canonical end-of-chain mark written to a chain tail.
    pub fn eoc(&self) -> u32 {
        match self {
            FatKind::Fat12 => 0xFFF,
            FatKind::Fat16 => 0xFFFF,
            FatKind::Fat32 => 0x0FFF_FFFF,
            FatKind::ExFat => 0xFFFF_FFFF,
        }
    }

    /// Bad/reserved cluster mark.
    pub fn bad(&self) -> u32 {
        match self {
            FatKind::Fat12 => 0xFF7,
            FatKind::Fat16 => 0xFFF7,
            FatKind::Fat32 => 0x0FFF_FFF7,
            FatKind::ExFat => 0xFFFF_FFF7,
        }
    }

    /// Any value in [EOC base, EOC base + 7] terminates a chain.
    pub fn is_eoc(&self, value: u32) -> bool {
        value >= self.bad() + 1
    }

    pub fn is_bad(&self, value: u32) -> bool {
        value == self.bad()
    }

    pub fn name(&self) -> &'static str {
        match self {
            FatKind::Fat12 => "FAT12",
            FatKind::Fat16 => "FAT16",
            FatKind::Fat32 => "FAT32",
            FatKind::ExFat => "exFAT",
        }
    }
}

/// Boot Sector and BPB structure common to FAT12/16/32, offsets 0..36.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BasicBpb {
    /// Jump and NOP instructions    Size: 3 bytes    Value: 0xEB ?? 0x90    Offset: 0x00
    pub bs_jmp_boot: [u8; 3],
    /// OEM name    Size: 8 bytes    Offset: 0x03
    pub bs_oem_name: [u8; 8],
    /// Bytes per sector: 512, 1024, 2048 or 4096    Offset: 0x0B
    pub byts_per_sec: U16,
    /// Sectors per allocation unit, a power of 2    Offset: 0x0D
    pub sec_per_clus: u8,
    /// Sectors in the Reserved Region    Offset: 0x0E
    pub rsvd_sec_cnt: U16,
    /// Count of FATs; 2 for any FAT volume of any type    Offset: 0x10
    pub num_fats: u8,
    /// Root directory entry count; 0 on FAT32    Offset: 0x11
    pub root_ent_cnt: U16,
    /// Total sectors if they fit in 16 bits; 0 on FAT32    Offset: 0x13
    pub tot_sec16: U16,
    /// Media descriptor; 0xF8 fixed, 0xF0 removable    Offset: 0x15
    pub media: u8,
    /// Sectors per FAT for FAT12/16; 0 on FAT32    Offset: 0x16
    pub fat_sz16: U16,
    /// Sectors per track for interrupt 0x13    Offset: 0x18
    pub sec_per_trk: U16,
    /// Head count for interrupt 0x13    Offset: 0x1A
    pub num_heads: U16,
    /// Sectors preceding this volume's partition    Offset: 0x1C
    pub hidd_sec: U32,
    /// Total sectors when tot_sec16 is 0    Offset: 0x20
    pub tot_sec32: U32,
}

/// FAT12/16 tail, offsets 36..62.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Bpb1216Ext {
    /// Physical drive number for INT 13h    Offset: 0x24
    pub bs_drv_num: u8,
    pub bs_reserved1: u8,
    /// 0x29 when the three fields below are present    Offset: 0x26
    pub bs_boot_sig: u8,
    /// Volume serial number    Offset: 0x27
    pub bs_vol_id: U32,
    /// Volume label, matching the root-directory label slot    Offset: 0x2B
    pub bs_vol_lab: [u8; 11],
    /// "FAT12   ", "FAT16   " or "FAT     "; informational only    Offset: 0x36
    pub bs_fil_sys_type: [u8; 8],
}

/// FAT32 tail, offsets 36..90.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Bpb32Ext {
    /// Sectors occupied by ONE FAT    Offset: 0x24
    pub fat_sz32: U32,
    /// Mirroring control; 0 mirrors the FAT into all copies    Offset: 0x28
    pub ext_flags: U16,
    /// FAT32 volume version, must be 0    Offset: 0x2A
    pub fs_ver: U16,
    /// First cluster of the root directory, usually 2    Offset: 0x2C
    pub root_clus: U32,
    /// FSINFO sector in the reserved area, usually 1    Offset: 0x30
    pub fs_info: U16,
    /// Backup boot record sector, usually 6    Offset: 0x32
    pub bk_boot_sec: U16,
    pub reserved: [u8; 12],
    /// Physical drive number for INT 13h    Offset: 0x40
    pub bs_drv_num: u8,
    pub bs_reserved1: u8,
    /// 0x29 when the three fields below are present    Offset: 0x42
    pub bs_boot_sig: u8,
    /// Volume serial number    Offset: 0x43
    pub bs_vol_id: U32,
    /// Volume label    Offset: 0x47
    pub bs_vol_lab: [u8; 11],
    /// "FAT32   "; informational only    Offset: 0x52
    pub bs_fil_sys_type: [u8; 8],
}

/// exFAT main boot sector, a whole 512-byte layout (the BPB area of a
/// classic boot sector falls inside `must_be_zero`).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExfatBootSector {
    pub bs_jmp_boot: [u8; 3],
    /// "EXFAT   "    Offset: 0x03
    pub bs_oem_name: [u8; 8],
    /// Zeroed so FAT drivers see an impossible BPB    Offset: 0x0B
    pub must_be_zero: [u8; 53],
    /// Media-relative sector offset of this partition    Offset: 0x40
    pub partition_offset: U64,
    /// Volume length in sectors    Offset: 0x48
    pub volume_length: U64,
    /// FAT start, in sectors from the volume start    Offset: 0x50
    pub fat_offset: U32,
    /// FAT length in sectors    Offset: 0x54
    pub fat_length: U32,
    /// Cluster heap start, in sectors    Offset: 0x58
    pub cluster_heap_offset: U32,
    /// Count of data clusters    Offset: 0x5C
    pub cluster_count: U32,
    /// First cluster of the root directory    Offset: 0x60
    pub first_cluster_of_root: U32,
    pub volume_serial: U32,
    /// 0x0100 for revision 1.00    Offset: 0x68
    pub fs_revision: U16,
    /// Bit 0: active FAT; bit 1: volume dirty; bit 2: media failure    Offset: 0x6A
    pub volume_flags: U16,
    /// log2(bytes per sector), in [9, 12]    Offset: 0x6C
    pub bytes_per_sector_shift: u8,
    /// log2(sectors per cluster); cluster size caps at 32 MiB    Offset: 0x6D
    pub sectors_per_cluster_shift: u8,
    /// 1; exFAT does not mirror its FAT    Offset: 0x6E
    pub number_of_fats: u8,
    /// 0x80    Offset: 0x6F
    pub drive_select: u8,
    pub percent_in_use: u8,
    pub reserved: [u8; 7],
    pub boot_code: [u8; 390],
    pub signature: [u8; 2],
}

/// FAT32 FSInfo sector.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FsInfo {
    /// 0x41615252 ("RRaA")    Offset: 0
    pub lead_sig: U32,
    pub reserved1: [u8; 480],
    /// 0x61417272 ("rrAa")    Offset: 484
    pub struc_sig: U32,
    /// Last known free cluster count; 0xFFFFFFFF if unknown    Offset: 488
    pub free_count: U32,
    /// Cluster number where the driver should start looking    Offset: 492
    pub nxt_free: U32,
    pub reserved2: [u8; 12],
    /// 0xAA550000    Offset: 508
    pub trail_sig: U32,
}

impl FsInfo {
    pub fn check_signature(&self) -> bool {
        self.lead_sig.get() == FSINFO_LEAD_SIG
            && self.struc_sig.get() == FSINFO_STRUCT_SIG
            && self.trail_sig.get() == FSINFO_TRAIL_SIG
    }
}

/// Parsed volume geometry: everything the allocator, chain streams and
/// directory tables need, with all offsets precomputed in bytes. Built once
/// at mount, mutated only by the formatter.
#[derive(Debug, Clone)]
pub struct VolumeDescriptor {
    pub kind: FatKind,
    pub sector_size: usize,
    pub sectors_per_cluster: usize,
    pub cluster_size: usize,
    pub reserved_sectors: usize,
    pub num_fats: usize,
    /// Byte offset of the first FAT.
    pub fat_offset: u64,
    /// Size of one FAT in bytes.
    pub fat_size: u64,
    /// FAT12/16 only: byte offset and entry count of the fixed root region.
    pub root_offset: u64,
    pub root_entries: usize,
    /// FAT32/exFAT only: first cluster of the root directory chain.
    pub root_cluster: u32,
    /// Byte offset of cluster 2.
    pub data_offset: u64,
    pub total_sectors: u64,
    /// Count of data clusters; the maximum valid index is `clusters + 1`.
    pub clusters: u32,
    pub media: u8,
    pub serial: u32,
    pub label: [u8; 11],
    /// FAT32 only: FSInfo sector number.
    pub fsinfo_sector: Option<u16>,
    pub backup_boot_sector: Option<u16>,
}

impl VolumeDescriptor {
    /// First byte of a data cluster.
    #[inline]
    pub fn cluster_to_offset(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 2);
        self.data_offset + (cluster as u64 - 2) * self.cluster_size as u64
    }

    /// Highest valid cluster index.
    #[inline]
    pub fn max_cluster(&self) -> u32 {
        self.clusters + 1
    }

    /// Parse sector 0 (and, for exFAT, verify the 11-sector VBR checksum).
    pub fn parse(device: &Arc<dyn BlockDevice>) -> Result<Self> {
        let mut sector0 = vec![0u8; 512];
        device.read_at(0, &mut sector0)?;

        let (basic, _) = BasicBpb::read_from_prefix(&sector0)
            .map_err(|_| Error::invalid("boot sector", "short sector"))?;

        if basic.byts_per_sec.get() == 0 {
            return Self::parse_exfat(device, &sector0);
        }
        Self::parse_fat(&sector0, &basic)
    }

    fn parse_fat(sector0: &[u8], basic: &BasicBpb) -> Result<Self> {
        if sector0[510..512] != BOOT_SIGNATURE {
            return Err(Error::invalid("boot sector", "missing 0x55AA signature"));
        }
        let sector_size = basic.byts_per_sec.get() as usize;
        if !matches!(sector_size, 512 | 1024 | 2048 | 4096) {
            return Err(Error::invalid(
                "boot sector",
                format!("bytes per sector {sector_size}"),
            ));
        }
        let spc = basic.sec_per_clus as usize;
        if spc == 0 || !spc.is_power_of_two() {
            return Err(Error::invalid(
                "boot sector",
                format!("sectors per cluster {spc}"),
            ));
        }
        let reserved = basic.rsvd_sec_cnt.get() as usize;
        let num_fats = basic.num_fats as usize;
        if reserved == 0 || num_fats == 0 || num_fats > 2 {
            return Err(Error::invalid("boot sector", "bad reserved/FAT counts"));
        }
        let root_entries = basic.root_ent_cnt.get() as usize;
        let total_sectors = if basic.tot_sec16.get() != 0 {
            basic.tot_sec16.get() as u64
        } else {
            basic.tot_sec32.get() as u64
        };
        if total_sectors == 0 {
            return Err(Error::invalid("boot sector", "zero total sectors"));
        }

        let kind;
        let fat32: Option<Bpb32Ext>;
        let fat_sectors: u64;
        let serial: u32;
        let label: [u8; 11];
        if root_entries == 0 {
            let (ext, _) = Bpb32Ext::read_from_prefix(&sector0[36..])
                .map_err(|_| Error::invalid("boot sector", "short FAT32 extension"))?;
            kind = FatKind::Fat32;
            fat32 = Some(ext);
            fat_sectors = ext.fat_sz32.get() as u64;
            serial = ext.bs_vol_id.get();
            label = ext.bs_vol_lab;
        } else {
            let (ext, _) = Bpb1216Ext::read_from_prefix(&sector0[36..])
                .map_err(|_| Error::invalid("boot sector", "short FAT extension"))?;
            let fs_type = &ext.bs_fil_sys_type;
            kind = if fs_type.starts_with(b"FAT12") {
                FatKind::Fat12
            } else if fs_type.starts_with(b"FAT16") {
                FatKind::Fat16
            } else if root_entries < 512 {
                FatKind::Fat12
            } else {
                FatKind::Fat16
            };
            fat32 = None;
            fat_sectors = basic.fat_sz16.get() as u64;
            serial = ext.bs_vol_id.get();
            label = ext.bs_vol_lab;
        }
        if fat_sectors == 0 {
            return Err(Error::invalid("boot sector", "zero FAT size"));
        }

        let root_sectors = (root_entries * 32).div_ceil(sector_size);
        let data_sectors = total_sectors
            .saturating_sub(reserved as u64)
            .saturating_sub(num_fats as u64 * fat_sectors)
            .saturating_sub(root_sectors as u64);
        let clusters = (data_sectors / spc as u64) as u32;

        let legal = match kind {
            FatKind::Fat12 => clusters < MAX_CLUSTER_FAT12,
            FatKind::Fat16 => (MAX_CLUSTER_FAT12..MAX_CLUSTER_FAT16).contains(&clusters),
            FatKind::Fat32 => (MAX_CLUSTER_FAT16..=MAX_CLUSTER_FAT32).contains(&clusters),
            FatKind::ExFat => unreachable!(),
        };
        if !legal {
            return Err(Error::invalid(
                "boot sector",
                format!("{} with {clusters} clusters", kind.name()),
            ));
        }

        let fat_offset = (reserved * sector_size) as u64;
        let root_offset = fat_offset + num_fats as u64 * fat_sectors * sector_size as u64;
        let data_offset = root_offset + (root_entries * 32) as u64;

        Ok(VolumeDescriptor {
            kind,
            sector_size,
            sectors_per_cluster: spc,
            cluster_size: sector_size * spc,
            reserved_sectors: reserved,
            num_fats,
            fat_offset,
            fat_size: fat_sectors * sector_size as u64,
            root_offset,
            root_entries,
            root_cluster: fat32.as_ref().map(|e| e.root_clus.get()).unwrap_or(0),
            data_offset,
            total_sectors,
            clusters,
            media: basic.media,
            serial,
            label,
            fsinfo_sector: fat32.as_ref().map(|e| e.fs_info.get()),
            backup_boot_sector: fat32.as_ref().map(|e| e.bk_boot_sec.get()),
        })
    }

    fn parse_exfat(device: &Arc<dyn BlockDevice>, sector0: &[u8]) -> Result<Self> {
        let (boot, _) = ExfatBootSector::read_from_prefix(sector0)
            .map_err(|_| Error::invalid("boot sector", "short sector"))?;
        if &boot.bs_oem_name != b"EXFAT   " {
            return Err(Error::invalid("boot sector", "bad exFAT OEM name"));
        }
        if boot.signature != BOOT_SIGNATURE {
            return Err(Error::invalid("boot sector", "missing 0x55AA signature"));
        }
        let bps_shift = boot.bytes_per_sector_shift;
        let spc_shift = boot.sectors_per_cluster_shift;
        if !(9..=12).contains(&bps_shift) {
            return Err(Error::invalid(
                "boot sector",
                format!("bytes-per-sector shift {bps_shift}"),
            ));
        }
        let sector_size = 1usize << bps_shift;
        let cluster_size = 1u64 << (bps_shift as u32 + spc_shift as u32);
        if cluster_size > MAX_CLUSTER_BYTES {
            return Err(Error::invalid(
                "boot sector",
                format!("cluster size {cluster_size}"),
            ));
        }

        // The VBR checksum covers sectors 0..11 and fills sector 11.
        let mut vbr = vec![0u8; 11 * sector_size];
        device.read_at(0, &mut vbr)?;
        let sum = exfat_vbr_checksum(&vbr);
        let mut checksum_sector = vec![0u8; sector_size];
        device.read_at(11 * sector_size as u64, &mut checksum_sector)?;
        for chunk in checksum_sector.chunks_exact(4) {
            let stored = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if stored != sum {
                return Err(Error::invalid(
                    "boot sector",
                    format!("VBR checksum {stored:#010x} != {sum:#010x}"),
                ));
            }
        }

        if boot.number_of_fats != 1 {
            warn!(
                "exFAT volume declares {} FATs; only the first is used",
                boot.number_of_fats
            );
        }

        Ok(VolumeDescriptor {
            kind: FatKind::ExFat,
            sector_size,
            sectors_per_cluster: 1 << spc_shift,
            cluster_size: cluster_size as usize,
            reserved_sectors: boot.fat_offset.get() as usize,
            num_fats: boot.number_of_fats as usize,
            fat_offset: boot.fat_offset.get() as u64 * sector_size as u64,
            fat_size: boot.fat_length.get() as u64 * sector_size as u64,
            root_offset: 0,
            root_entries: 0,
            root_cluster: boot.first_cluster_of_root.get(),
            data_offset: boot.cluster_heap_offset.get() as u64 * sector_size as u64,
            total_sectors: boot.volume_length.get(),
            clusters: boot.cluster_count.get(),
            media: 0xF8,
            serial: boot.volume_serial.get(),
            label: [0x20; 11],
            fsinfo_sector: None,
            backup_boot_sector: Some(12),
        })
    }
}

/// Rolling checksum over the 11 VBR sectors, skipping the VolumeFlags word
/// and PercentInUse so a dirty-bit flip does not invalidate the region.
pub fn exfat_vbr_checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in data.iter().enumerate() {
        if i == 106 || i == 107 || i == 112 {
            continue;
        }
        sum = sum.rotate_right(1).wrapping_add(b as u32);
    }
    sum
}

/// Same rolling hash with no byte exclusions; used for the upcase table.
pub fn exfat_table_checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in data {
        sum = sum.rotate_right(1).wrapping_add(b as u32);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_have_canonical_sizes() {
        assert_eq!(core::mem::size_of::<BasicBpb>(), 36);
        assert_eq!(core::mem::size_of::<Bpb1216Ext>(), 26);
        assert_eq!(core::mem::size_of::<Bpb32Ext>(), 54);
        assert_eq!(core::mem::size_of::<ExfatBootSector>(), 512);
        assert_eq!(core::mem::size_of::<FsInfo>(), 512);
    }

    #[test]
    fn rolling_checksum_matches_reference() {
        // H(n+1) = ROR(H(n)) + b, seeded with zero.
        let sum = exfat_table_checksum(&[1, 2, 3]);
        let mut expect: u32 = 0;
        for b in [1u32, 2, 3] {
            expect = (expect >> 1 | expect << 31).wrapping_add(b);
        }
        assert_eq!(sum, expect);
    }

    #[test]
    fn eoc_ranges() {
        assert!(FatKind::Fat32.is_eoc(0x0FFF_FFF8));
        assert!(FatKind::Fat32.is_eoc(0x0FFF_FFFF));
        assert!(!FatKind::Fat32.is_eoc(0x0FFF_FFF7));
        assert!(FatKind::Fat12.is_eoc(0xFF8));
        assert!(!FatKind::Fat16.is_eoc(0x1234));
    }
}
