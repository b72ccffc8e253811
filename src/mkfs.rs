//! Formatters
//!
//! FAT Volume Initialization: given that the FAT type is dependent on the
//! number of clusters, and that the sectors available in the data area
//! depend on the size of the FAT itself, the formatter enumerates every
//! cluster size and solves for the exact cluster count such that
//!
//! ```text
//! clusters * cluster_size + fat_copies * fat_size + reserved <= volume
//! fat_size = ceil(slot_bits * (clusters + 2) / 8) rounded up to a sector
//! ```
//!
//! then rejects combinations whose cluster count falls outside the
//! variant's legal window (there is no such thing as a FAT12 volume with
//! more than 4084 clusters, a FAT16 volume outside 4085..65524, or a FAT32
//! volume that CHKDSK accepts below 65526 clusters). With no explicit
//! variant the narrowest one that fits is chosen, falling through
//! FAT12 -> FAT16 -> FAT32 -> exFAT like the MS FORMAT chain does.
//!
//! exFAT lays out a 12-sector VBR (boot sector, 8 spare boot sectors with
//! bare signatures, a zeroed OEM parameter sector, a reserved sector, and a
//! checksum sector filled with the rolling hash of the previous 11),
//! immediately followed by a backup of all 12; then a single FAT, the
//! allocation bitmap at cluster 2, the compressed upcase table, and the
//! root directory holding the bitmap and upcase slots. The FAT chains of
//! those three are always marked, contiguous or not.

use std::sync::Arc;

use log::{debug, info};
use zerocopy::{FromBytes, IntoBytes};

use crate::bpb::{
    exfat_table_checksum, exfat_vbr_checksum, BasicBpb, Bpb1216Ext, Bpb32Ext, ExfatBootSector,
    FatKind, FsInfo, FSINFO_LEAD_SIG, FSINFO_STRUCT_SIG, FSINFO_TRAIL_SIG,
};
use crate::device::BlockDevice;
use crate::entry::{self, upcase_unit};
use crate::error::{Error, Result};
use crate::partition::size2chs;

/// Tiny real-mode stub printing "NO DOS": load DS, walk the message with
/// INT 10h teletype output, halt. `code_offset` is where it lands in the
/// boot sector, needed to fix up the message pointer.
fn nodos_stub(code_offset: usize) -> Vec<u8> {
    let msg_at = (code_offset + 27) as u8;
    let mut stub = vec![
        0xB8, 0xC0, 0x07, // mov ax, 0x7C0
        0x8E, 0xD8, // mov ds, ax
        0xBE, msg_at, 0x00, // mov si, msg
        0xAC, // lodsb
        0x08, 0xC0, // or al, al
        0x74, 0x0A, // jz halt
        0xB4, 0x0E, // mov ah, 0x0E
        0xBB, 0x07, 0x00, // mov bx, 7
        0xCD, 0x10, // int 0x10
        0xE9, 0xF1, 0xFF, // jmp loop
        0xF4, // halt: hlt
        0xE9, 0xFC, 0xFF, // jmp halt
    ];
    stub.extend_from_slice(b"NO DOS\0");
    stub
}

#[derive(Debug, Clone, Default)]
pub struct FormatParams {
    /// Force a variant; `None` picks the narrowest that fits.
    pub fat_kind: Option<FatKind>,
    /// Force a cluster size (bytes, power of two).
    pub cluster_size: Option<usize>,
    /// Reserved sectors before FAT1 (defaults: 1 / 9 / 128).
    pub reserved_sectors: Option<usize>,
    /// FAT copies (default 2; exFAT always 1).
    pub fat_copies: Option<usize>,
    /// FAT12/16 fixed root entries (defaults 224 / 512).
    pub root_entries: Option<usize>,
    pub media_byte: Option<u8>,
    /// FAT32 backup boot sector (default 6).
    pub backup_boot_sector: Option<u16>,
    /// Cap FAT cluster size at 32 KiB for pre-Windows-NT readers.
    pub no_64k_clusters: bool,
    /// Never pick FAT12 on auto-selection (hard-disk-sized media).
    pub fat12_disabled: bool,
    /// Accept FAT32 volumes under 65526 clusters (CHKDSK refuses them).
    pub fat32_allows_few_clusters: bool,
    /// Reject FAT32 volumes over 4177917 clusters (Windows FORMAT limit).
    pub fat32_forbids_high_clusters: bool,
}

/// What the formatter settled on.
#[derive(Debug, Clone)]
pub struct FormatInfo {
    pub kind: FatKind,
    pub cluster_size: usize,
    pub clusters: u32,
    pub fat_size: u64,
    pub reserved_size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    cluster_size: usize,
    clusters: u64,
    fat_size: u64,
    reserved_size: u64,
    root_bytes: u64,
}

/// Solve cluster count and FAT size for one cluster size, shrinking until
/// everything fits.
fn solve(
    size: u64,
    sector: u64,
    cluster_size: u64,
    slot_bits: u64,
    fat_copies: u64,
    reserved: u64,
    root_bytes: u64,
    even: bool,
    fat_round_to_cluster: bool,
) -> (u64, u64) {
    let overhead = reserved + root_bytes;
    let mut clusters = size.saturating_sub(overhead) / cluster_size;
    if even && clusters % 2 == 1 {
        clusters -= 1;
    }
    let fat_bytes = |clusters: u64| {
        let raw = (slot_bits * (clusters + 2)).div_ceil(8);
        let sectors = raw.div_ceil(sector) * sector;
        if fat_round_to_cluster {
            sectors.div_ceil(cluster_size) * cluster_size
        } else {
            sectors
        }
    };
    let mut fat_size = fat_bytes(clusters);
    while clusters > 0 && cluster_size * clusters + fat_copies * fat_size + overhead > size {
        clusters -= if even { 2 } else { 1 };
        fat_size = fat_bytes(clusters);
    }
    (clusters, fat_size)
}

/// Format `device` per `params`, auto-selecting the variant when none is
/// forced. The device size rules; the written volume spans all of it.
pub fn format(device: &Arc<dyn BlockDevice>, params: &FormatParams) -> Result<FormatInfo> {
    match params.fat_kind {
        Some(FatKind::Fat12) => format_fat(device, FatKind::Fat12, params),
        Some(FatKind::Fat16) => format_fat(device, FatKind::Fat16, params),
        Some(FatKind::Fat32) => format_fat(device, FatKind::Fat32, params),
        Some(FatKind::ExFat) => format_exfat(device, params),
        None => {
            // FAT12 makes sense on floppy-sized media only; a 64 KiB
            // cluster can squeeze a big disk under 4085 clusters, which is
            // legal but never what anyone wants.
            let small = device.size() <= 16 << 20;
            let kinds: &[FatKind] = if params.fat12_disabled || !small {
                &[FatKind::Fat16, FatKind::Fat32]
            } else {
                &[FatKind::Fat12, FatKind::Fat16, FatKind::Fat32]
            };
            for &kind in kinds {
                match format_fat(device, kind, params) {
                    Ok(info) => return Ok(info),
                    Err(Error::NoSpace) => continue,
                    Err(e) => return Err(e),
                }
            }
            format_exfat(device, params)
        }
    }
}

/// Legal cluster-count window per variant (the FAT32 bounds optionally
/// tightened to what Windows tooling accepts).
fn legal_clusters(kind: FatKind, clusters: u64, params: &FormatParams) -> bool {
    match kind {
        FatKind::Fat12 => (1..4085).contains(&clusters),
        FatKind::Fat16 => (4086..=65524).contains(&clusters),
        FatKind::Fat32 => {
            let low = if params.fat32_allows_few_clusters {
                1
            } else {
                65526
            };
            let high = if params.fat32_forbids_high_clusters {
                4_177_917
            } else {
                0x0FFF_FFF6
            };
            (low..=high).contains(&clusters)
        }
        FatKind::ExFat => (1..=0xFFFF_FFFF).contains(&clusters),
    }
}

fn pick_candidate(
    kind: FatKind,
    size: u64,
    allowed: &[Candidate],
    params: &FormatParams,
) -> Result<Candidate> {
    if allowed.is_empty() {
        return Err(Error::NoSpace);
    }
    if let Some(wanted) = params.cluster_size {
        return allowed
            .iter()
            .find(|c| c.cluster_size == wanted)
            .copied()
            .ok_or(Error::NoSpace);
    }
    // MS FORMAT-inspired defaults by volume size; fall back to the middle
    // of the allowed set when the table misses.
    let preferred: usize = match kind {
        FatKind::Fat12 => 512,
        FatKind::Fat16 => match size {
            s if s <= 32 << 20 => 512,
            s if s <= 64 << 20 => 1024,
            s if s <= 128 << 20 => 2048,
            s if s <= 256 << 20 => 4096,
            s if s <= 512 << 20 => 8192,
            s if s <= 1 << 30 => 16384,
            s if s <= 2 << 30 => 32768,
            _ => 65536,
        },
        FatKind::Fat32 => match size {
            s if s <= 64 << 20 => 512,
            s if s <= 128 << 20 => 1024,
            s if s <= 256 << 20 => 2048,
            s if s <= 8 << 30 => 4096,
            s if s <= 16 << 30 => 8192,
            s if s <= 32 << 30 => 16384,
            s if s <= 2048u64 << 30 => 32768,
            _ => 65536,
        },
        FatKind::ExFat => unreachable!("exFAT picks via calc_cluster"),
    };
    if let Some(c) = allowed.iter().find(|c| c.cluster_size == preferred) {
        return Ok(*c);
    }
    Ok(allowed[allowed.len() / 2])
}

fn format_fat(
    device: &Arc<dyn BlockDevice>,
    kind: FatKind,
    params: &FormatParams,
) -> Result<FormatInfo> {
    let size = device.size();
    let sector = device.sector_size() as u64;
    let sectors = size / sector;
    if sectors < 16 || sectors > 0xFFFF_FFFF {
        return Err(Error::Unsupported(format!(
            "cannot apply a FAT file system to {sectors} sectors"
        )));
    }

    let fat_copies = params.fat_copies.unwrap_or(2) as u64;
    let (reserved_default, root_default) = match kind {
        FatKind::Fat12 => (1, 224),
        FatKind::Fat16 => (1, 512),
        _ => (9, 0),
    };
    let reserved = params.reserved_sectors.unwrap_or(reserved_default) as u64 * sector;
    let root_entries = if kind == FatKind::Fat32 {
        0
    } else {
        params.root_entries.unwrap_or(root_default)
    };
    // The fixed root must fill whole sectors.
    let root_bytes = ((root_entries * 32) as u64).div_ceil(sector) * sector;

    let max_shift = if params.no_64k_clusters { 15 } else { 16 };
    let mut allowed = Vec::new();
    for shift in 9..=max_shift {
        let cluster_size = 1u64 << shift;
        let (clusters, fat_size) = solve(
            size,
            sector,
            cluster_size,
            kind.slot_bits() as u64,
            fat_copies,
            reserved,
            root_bytes,
            true,
            false,
        );
        if !legal_clusters(kind, clusters, params) {
            continue;
        }
        allowed.push(Candidate {
            cluster_size: cluster_size as usize,
            clusters,
            fat_size,
            reserved_size: reserved,
            root_bytes,
        });
    }
    let chosen = pick_candidate(kind, size, &allowed, params)?;
    debug!(
        "{}: {} clusters of {} bytes, FAT of {} bytes",
        kind.name(),
        chosen.clusters,
        chosen.cluster_size,
        chosen.fat_size
    );

    // ---- boot sector ----
    let mut boot = vec![0u8; sector as usize];
    let media = params.media_byte.unwrap_or(0xF8);
    let (_, heads, spt) = size2chs(size);
    let serial = {
        let (d, t) = entry::dos_now();
        (d as u32) << 16 | t as u32
    };
    {
        let (bpb, _) = BasicBpb::mut_from_prefix(&mut boot)
            .map_err(|_| Error::invalid("boot sector", "layout"))?;
        bpb.bs_jmp_boot = [0xEB, if kind == FatKind::Fat32 { 0x58 } else { 0x3C }, 0x90];
        bpb.bs_oem_name = if kind == FatKind::Fat32 {
            *b"MSWIN4.1"
        } else {
            *b"MSDOS5.0"
        };
        bpb.byts_per_sec.set(sector as u16);
        bpb.sec_per_clus = (chosen.cluster_size as u64 / sector) as u8;
        bpb.rsvd_sec_cnt.set((reserved / sector) as u16);
        bpb.num_fats = fat_copies as u8;
        bpb.root_ent_cnt.set(root_entries as u16);
        if kind != FatKind::Fat32 && sectors < 65536 {
            bpb.tot_sec16.set(sectors as u16);
        } else {
            bpb.tot_sec32.set(sectors as u32);
        }
        bpb.media = media;
        if kind != FatKind::Fat32 {
            bpb.fat_sz16.set((chosen.fat_size / sector) as u16);
        }
        bpb.sec_per_trk.set(spt as u16);
        bpb.num_heads.set(heads as u16);
    }
    let backup_sector = if kind == FatKind::Fat32 {
        params.backup_boot_sector.unwrap_or(6)
    } else {
        0
    };
    if kind == FatKind::Fat32 {
        let (ext, _) = Bpb32Ext::mut_from_prefix(&mut boot[36..])
            .map_err(|_| Error::invalid("boot sector", "layout"))?;
        ext.fat_sz32.set((chosen.fat_size / sector) as u32);
        ext.root_clus.set(2);
        ext.fs_info.set(1);
        ext.bk_boot_sec.set(backup_sector);
        ext.bs_drv_num = 0x80;
        ext.bs_boot_sig = 0x29;
        ext.bs_vol_id.set(serial);
        ext.bs_vol_lab = *b"NO NAME    ";
        ext.bs_fil_sys_type = *b"FAT32   ";
        let stub = nodos_stub(0x5A);
        boot[0x5A..0x5A + stub.len()].copy_from_slice(&stub);
    } else {
        let (ext, _) = Bpb1216Ext::mut_from_prefix(&mut boot[36..])
            .map_err(|_| Error::invalid("boot sector", "layout"))?;
        ext.bs_drv_num = 0x80;
        ext.bs_boot_sig = 0x29;
        ext.bs_vol_id.set(serial);
        ext.bs_vol_lab = *b"NO NAME    ";
        ext.bs_fil_sys_type = if kind == FatKind::Fat12 {
            *b"FAT12   "
        } else {
            *b"FAT16   "
        };
        let stub = nodos_stub(0x3E);
        boot[0x3E..0x3E + stub.len()].copy_from_slice(&stub);
    }
    boot[510] = 0x55;
    boot[511] = 0xAA;
    device.write_at(0, &boot)?;

    // ---- FSInfo (FAT32) and backups ----
    if kind == FatKind::Fat32 {
        let mut fsi = FsInfo::read_from_bytes(&[0u8; 512])
            .map_err(|_| Error::invalid("boot sector", "layout"))?;
        fsi.lead_sig.set(FSINFO_LEAD_SIG);
        fsi.struc_sig.set(FSINFO_STRUCT_SIG);
        fsi.free_count.set(chosen.clusters as u32 - 1); // root takes #2
        fsi.nxt_free.set(3);
        fsi.trail_sig.set(FSINFO_TRAIL_SIG);
        device.write_at(sector, fsi.as_bytes())?;
        if backup_sector != 0 {
            device.write_at(backup_sector as u64 * sector, &boot)?;
            device.write_at((backup_sector as u64 + 1) * sector, fsi.as_bytes())?;
        }
    }

    // ---- zero the FAT copies, in 2 MiB strides ----
    let fat_offset = reserved;
    let zero = vec![0u8; 2 << 20];
    for copy in 0..fat_copies {
        let mut at = fat_offset + copy * chosen.fat_size;
        let end = at + chosen.fat_size;
        while at < end {
            let take = ((end - at) as usize).min(zero.len());
            device.write_at(at, &zero[..take])?;
            at += take as u64;
        }
    }
    // ---- seed FAT[0]/FAT[1] (and the root chain on FAT32) ----
    let seed: Vec<u8> = match kind {
        FatKind::Fat12 => {
            let mut s = vec![0u8; 3];
            // FAT[0] = 0xF<media>, FAT[1] = 0xFFF, sharing the middle byte.
            s[0] = media;
            s[1] = 0xFF;
            s[2] = 0xFF;
            s
        }
        FatKind::Fat16 => {
            let mut s = vec![0u8; 4];
            s[0..2].copy_from_slice(&(0xFF00u16 | media as u16).to_le_bytes());
            s[2..4].copy_from_slice(&0xFFFFu16.to_le_bytes());
            s
        }
        _ => {
            let mut s = vec![0u8; 12];
            s[0..4].copy_from_slice(&(0x0FFF_FF00u32 | media as u32).to_le_bytes());
            s[4..8].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            // Root directory chain: cluster 2, terminated.
            s[8..12].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
            s
        }
    };
    for copy in 0..fat_copies {
        device.write_at(fat_offset + copy * chosen.fat_size, &seed)?;
    }

    // ---- root directory ----
    let root_offset = fat_offset + fat_copies * chosen.fat_size;
    if kind == FatKind::Fat32 {
        device.write_at(root_offset, &vec![0u8; chosen.cluster_size])?;
    } else {
        device.write_at(root_offset, &vec![0u8; chosen.root_bytes as usize])?;
    }
    device.flush()?;

    info!(
        "applied {} to a {} byte volume: {} clusters of {} bytes",
        kind.name(),
        size,
        chosen.clusters,
        chosen.cluster_size
    );
    Ok(FormatInfo {
        kind,
        cluster_size: chosen.cluster_size,
        clusters: chosen.clusters as u32,
        fat_size: chosen.fat_size,
        reserved_size: chosen.reserved_size,
    })
}

/// MS FORMAT cluster heuristic for exFAT: 512 bytes at 64 MiB, doubling
/// with the volume, with jumps at 256 MiB and 256 GiB, capped at 32 MiB.
fn calc_cluster(size: u64) -> u64 {
    let mut c = 9u32;
    let mut v = 26u32;
    for _ in 0..17 {
        if size <= 1u64 << v {
            return 1 << c;
        }
        c += 1;
        v += 1;
        if v == 29 {
            v += 4;
        }
        if v == 39 {
            v += 1;
        }
    }
    2 << 25
}

/// Run-length compress the upcase table: identity runs longer than two
/// code units collapse to `0xFFFF, run_length`.
pub fn gen_upcase_compressed() -> Vec<u8> {
    let mut out: Vec<u16> = Vec::new();
    let mut run: i64 = -1;
    for i in 0..=0xFFFFu32 {
        let upper = upcase_unit(i as u16);
        if upper != i as u16 {
            let run_len = i as i64 - run;
            if run >= 0 && run_len > 2 {
                out.truncate(out.len() - run_len as usize);
                out.push(0xFFFF);
                out.push(run_len as u16);
            }
            run = -1;
        } else if run < 0 {
            run = i as i64;
        }
        out.push(upper);
    }
    let mut bytes = Vec::with_capacity(out.len() * 2);
    for u in out {
        bytes.extend_from_slice(&u.to_le_bytes());
    }
    bytes
}

pub fn format_exfat(device: &Arc<dyn BlockDevice>, params: &FormatParams) -> Result<FormatInfo> {
    let size = device.size();
    let sector = device.sector_size() as u64;
    let sectors = size / sector;

    // Boot region and its backup need 24 sectors minimum; FORMAT reserves
    // 64 KiB.
    let reserved = match params.reserved_sectors {
        Some(r) => (r as u64).max(24) * sector,
        None => 65536,
    };
    let fat_copies = params.fat_copies.unwrap_or(1) as u64;

    let mut allowed = Vec::new();
    for shift in 9..=25 {
        let cluster_size = 1u64 << shift;
        let (clusters, fat_size) = solve(
            size,
            sector,
            cluster_size,
            32,
            fat_copies,
            reserved,
            0,
            false,
            true,
        );
        if !legal_clusters(FatKind::ExFat, clusters, params) {
            continue;
        }
        allowed.push(Candidate {
            cluster_size: cluster_size as usize,
            clusters,
            fat_size,
            reserved_size: reserved,
            root_bytes: 0,
        });
    }
    if allowed.is_empty() {
        return Err(Error::NoSpace);
    }
    let wanted = params
        .cluster_size
        .map(|c| c as u64)
        .unwrap_or_else(|| calc_cluster(size));
    let chosen = allowed
        .iter()
        .find(|c| c.cluster_size as u64 == wanted)
        .copied()
        .ok_or(Error::NoSpace)?;
    let cluster = chosen.cluster_size as u64;
    let fat_offset = reserved.div_ceil(sector);
    let fat_length = chosen.fat_size.div_ceil(sector);
    let heap_offset = fat_offset + fat_length;

    // Metadata files at the front of the heap: bitmap at cluster 2, then
    // the upcase table, then the root directory.
    let bitmap_bytes = chosen.clusters.div_ceil(8);
    let bitmap_clusters = bitmap_bytes.div_ceil(cluster);
    let upcase = gen_upcase_compressed();
    let upcase_start = 2 + bitmap_clusters as u32;
    let upcase_clusters = (upcase.len() as u64).div_ceil(cluster);
    let root_cluster = upcase_start + upcase_clusters as u32;
    let cl2offset =
        |c: u32| (heap_offset * sector) + (c as u64 - 2) * cluster;

    // ---- main boot sector ----
    let mut boot = ExfatBootSector::read_from_bytes(&vec![0u8; 512])
        .map_err(|_| Error::invalid("boot sector", "layout"))?;
    boot.bs_jmp_boot = [0xEB, 0x76, 0x90];
    boot.bs_oem_name = *b"EXFAT   ";
    boot.partition_offset.set(0x3F);
    boot.volume_length.set(sectors);
    boot.fat_offset.set(fat_offset as u32);
    boot.fat_length.set(fat_length as u32);
    boot.cluster_heap_offset.set(heap_offset as u32);
    boot.cluster_count.set(chosen.clusters as u32);
    boot.first_cluster_of_root.set(root_cluster);
    let (dt, _) = entry::exfat_now();
    boot.volume_serial.set(dt);
    boot.fs_revision.set(0x0100);
    boot.volume_flags.set(0);
    boot.bytes_per_sector_shift = sector.trailing_zeros() as u8;
    boot.sectors_per_cluster_shift = (cluster / sector).trailing_zeros() as u8;
    boot.number_of_fats = fat_copies as u8;
    boot.drive_select = 0x80;
    let stub = nodos_stub(0x78);
    boot.boot_code[..stub.len()].copy_from_slice(&stub);
    boot.signature = [0x55, 0xAA];

    // VBR: boot sector, 8 spare boot sectors carrying only the signature,
    // a blank OEM parameter sector, a reserved sector.
    let ss = sector as usize;
    let mut vbr = vec![0u8; 11 * ss];
    vbr[..512].copy_from_slice(boot.as_bytes());
    for i in 1..9 {
        vbr[i * ss + ss - 2] = 0x55;
        vbr[i * ss + ss - 1] = 0xAA;
    }
    let sum = exfat_vbr_checksum(&vbr);
    let mut checksum_sector = Vec::with_capacity(ss);
    for _ in 0..ss / 4 {
        checksum_sector.extend_from_slice(&sum.to_le_bytes());
    }
    device.write_at(0, &vbr)?;
    device.write_at(11 * sector, &checksum_sector)?;
    // Backup of the whole 12-sector region.
    device.write_at(12 * sector, &vbr)?;
    device.write_at(23 * sector, &checksum_sector)?;

    // ---- FAT ----
    let fat_byte_offset = fat_offset * sector;
    let zero = vec![0u8; 2 << 20];
    let mut at = fat_byte_offset;
    let end = fat_byte_offset + fat_length * sector;
    while at < end {
        let take = ((end - at) as usize).min(zero.len());
        device.write_at(at, &zero[..take])?;
        at += take as u64;
    }
    let mut seed = Vec::new();
    seed.extend_from_slice(&0xFFFF_FFF8u32.to_le_bytes());
    seed.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    device.write_at(fat_byte_offset, &seed)?;

    // ---- bitmap (zeroed), upcase table, root cluster ----
    device.write_at(
        cl2offset(2),
        &vec![0u8; (bitmap_clusters * cluster) as usize],
    )?;
    device.write_at(cl2offset(upcase_start), &upcase)?;
    device.write_at(cl2offset(root_cluster), &vec![0u8; cluster as usize])?;

    // Chain the three metadata files in the FAT (mandatory even while
    // contiguous) and mark their bitmap bits.
    let mut fat_chain = |start: u32, count: u64| -> Result<()> {
        for i in 0..count {
            let value = if i == count - 1 {
                0xFFFF_FFFFu32
            } else {
                start + i as u32 + 1
            };
            device.write_at(
                fat_byte_offset + (start as u64 + i) * 4,
                &value.to_le_bytes(),
            )?;
        }
        Ok(())
    };
    fat_chain(2, bitmap_clusters)?;
    fat_chain(upcase_start, upcase_clusters)?;
    fat_chain(root_cluster, 1)?;

    let used = bitmap_clusters + upcase_clusters + 1;
    let mut bitmap_head = vec![0u8; used.div_ceil(8) as usize];
    for bit in 0..used {
        bitmap_head[(bit / 8) as usize] |= 1 << (bit % 8);
    }
    device.write_at(cl2offset(2), &bitmap_head)?;

    // ---- root slots: allocation bitmap and upcase table ----
    let mut slots = [0u8; 64];
    {
        let (e, _) = crate::entry::ExfatBitmapEntry::mut_from_prefix(&mut slots[..])
            .map_err(|_| Error::invalid("directory entry", "layout"))?;
        e.ent_type = crate::entry::EXFAT_TYPE_BITMAP;
        e.first_cluster.set(2);
        e.data_length.set(bitmap_bytes);
    }
    {
        let (e, _) = crate::entry::ExfatUpcaseEntry::mut_from_prefix(&mut slots[32..])
            .map_err(|_| Error::invalid("directory entry", "layout"))?;
        e.ent_type = crate::entry::EXFAT_TYPE_UPCASE;
        e.checksum.set(exfat_table_checksum(&upcase));
        e.first_cluster.set(upcase_start);
        e.data_length.set(upcase.len() as u64);
    }
    device.write_at(cl2offset(root_cluster), &slots)?;
    device.flush()?;

    info!(
        "applied exFAT to a {size} byte volume: {} clusters of {cluster} bytes",
        chosen.clusters
    );
    Ok(FormatInfo {
        kind: FatKind::ExFat,
        cluster_size: chosen.cluster_size,
        clusters: chosen.clusters as u32,
        fat_size: chosen.fat_size,
        reserved_size: reserved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::fs::Volume;

    fn disk(size: u64) -> Arc<dyn BlockDevice> {
        Arc::new(MemDisk::new(size))
    }

    #[test]
    fn fat16_format_then_mount() {
        let device = disk(32 << 20);
        let info = format(
            &device,
            &FormatParams {
                fat_kind: Some(FatKind::Fat16),
                cluster_size: Some(2048),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(info.kind, FatKind::Fat16);
        assert_eq!(info.cluster_size, 2048);
        let vol = Volume::mount(device, false).unwrap();
        assert_eq!(vol.boot().kind, FatKind::Fat16);
        assert_eq!(vol.boot().cluster_size, 2048);
        assert!(vol.root().listdir().unwrap().is_empty());
    }

    #[test]
    fn fat32_format_then_mount() {
        // Small FAT32 needs the few-clusters escape hatch.
        let device = disk(64 << 20);
        let info = format(
            &device,
            &FormatParams {
                fat_kind: Some(FatKind::Fat32),
                cluster_size: Some(512),
                fat32_allows_few_clusters: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(info.kind, FatKind::Fat32);
        let vol = Volume::mount(device, false).unwrap();
        assert_eq!(vol.boot().kind, FatKind::Fat32);
        assert_eq!(vol.boot().root_cluster, 2);
        let (free, _) = vol.getdiskspace().unwrap();
        assert_eq!(free, info.clusters - 1);
    }

    #[test]
    fn exfat_format_then_mount() {
        let device = disk(64 << 20);
        let info = format(
            &device,
            &FormatParams {
                fat_kind: Some(FatKind::ExFat),
                cluster_size: Some(4096),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(info.kind, FatKind::ExFat);
        let vol = Volume::mount(device, false).unwrap();
        assert_eq!(vol.boot().kind, FatKind::ExFat);
        assert!(vol.root().listdir().unwrap().is_empty());
        // Bitmap accounting: metadata clusters are allocated.
        let (free, _) = vol.getdiskspace().unwrap();
        assert!(free < info.clusters);
    }

    #[test]
    fn auto_selection_prefers_narrow_variants() {
        let device = disk(4 << 20);
        let info = format(&device, &FormatParams::default()).unwrap();
        assert_eq!(info.kind, FatKind::Fat12);
        let device = disk(128 << 20);
        let info = format(&device, &FormatParams::default()).unwrap();
        assert_eq!(info.kind, FatKind::Fat16);
    }

    #[test]
    fn upcase_table_checksum_is_stable() {
        let t1 = gen_upcase_compressed();
        let t2 = gen_upcase_compressed();
        assert_eq!(exfat_table_checksum(&t1), exfat_table_checksum(&t2));
        // The compressed table starts with an identity run marker for the
        // control range.
        assert_eq!(u16::from_le_bytes([t1[0], t1[1]]), 0xFFFF);
    }
}
