//! End-to-end scenarios: format, mount, file and directory round trips,
//! virtual disks and partitions working together.

use std::sync::Arc;

use fatio::device::{BlockDevice, FileDisk, MemDisk};
use fatio::file::SeekFrom;
use fatio::fs::Volume;
use fatio::mkfs::{format, FormatParams};
use fatio::partition::{self, Scheme};
use fatio::vdisk::{self, OpenWhat};
use fatio::vhd::{VhdDisk, VHD_BLOCK_SIZE};
use fatio::{Error, FatKind};

fn formatted_mem(size: u64, kind: FatKind, cluster: usize) -> (Arc<MemDisk>, Arc<Volume>) {
    let mem = Arc::new(MemDisk::new(size));
    let device: Arc<dyn BlockDevice> = mem.clone();
    format(
        &device,
        &FormatParams {
            fat_kind: Some(kind),
            cluster_size: Some(cluster),
            ..Default::default()
        },
    )
    .unwrap();
    (mem, Volume::mount(device, false).unwrap())
}

#[test]
fn fat16_hello_world_survives_remount() {
    let (mem, vol) = formatted_mem(32 << 20, FatKind::Fat16, 2048);
    {
        let root = vol.root();
        let mut f = root.create("hello.txt", 0).unwrap();
        f.write(b"Hello, world!").unwrap();
        f.close().unwrap();
    }
    vol.close().unwrap();

    let reopened: Arc<dyn BlockDevice> = Arc::new(MemDisk::from_vec(mem.snapshot()));
    let vol = Volume::mount(reopened, false).unwrap();
    let mut f = vol.root().open("hello.txt").unwrap();
    assert_eq!(f.read_to_end().unwrap(), b"Hello, world!");
}

#[test]
fn fat32_long_name_gets_the_expected_alias() {
    let (mem, vol) = formatted_mem(80 << 20, FatKind::Fat32, 512);
    {
        let root = vol.root();
        let mut f = root.create("Réadme Long.txt", 0).unwrap();
        f.write(b"lfn").unwrap();
        f.close().unwrap();
    }
    vol.close().unwrap();

    let reopened: Arc<dyn BlockDevice> = Arc::new(MemDisk::from_vec(mem.snapshot()));
    let vol = Volume::mount(reopened, false).unwrap();
    let root = vol.root();
    let entry = root.find("Réadme Long.txt").unwrap().unwrap();
    assert_eq!(entry.short_name.as_deref(), Some("RADME_~1.TXT"));
    // Both name spaces resolve, case-insensitively.
    assert!(root.find("rAdMe_~1.tXt").unwrap().is_some());
    assert!(root.find("réadme long.TXT").unwrap().is_some());
}

#[test]
fn exfat_tree_walk_and_disk_space() {
    let (_, vol) = formatted_mem(64 << 20, FatKind::ExFat, 4096);
    let root = vol.root();
    root.mkdir("a").unwrap();
    root.mkdir("a/b").unwrap();
    let leaf = root.mkdir("a/b/c").unwrap();
    let mut sizes = Vec::new();
    for i in 0..20 {
        let name = format!("file{i:02}.bin");
        let size = 100 + i * 37;
        let mut f = leaf.create(&name, 0).unwrap();
        f.write(&vec![i as u8; size]).unwrap();
        f.close().unwrap();
        sizes.push((name, size));
    }
    let walk = root.walk().unwrap();
    assert_eq!(walk.len(), 4); // root, a, a/b, a/b/c
    let (_, _, files) = walk.last().unwrap();
    assert_eq!(files.len(), 20);
    // On-disk order is creation order here.
    assert_eq!(files[0], "file00.bin");
    for (name, size) in sizes {
        let mut f = leaf.open(&name).unwrap();
        assert_eq!(f.read_to_end().unwrap().len(), size);
    }
    let (free, free_bytes) = root.getdiskspace().unwrap();
    assert_eq!(free_bytes, free as u64 * 4096);
    assert!(free > 0);
}

#[test]
fn truncate_round_trip() {
    let (_, vol) = formatted_mem(32 << 20, FatKind::Fat16, 2048);
    let root = vol.root();
    let mut f = root.create("big.bin", 0).unwrap();
    let payload: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();
    f.write(&payload).unwrap();
    f.ftruncate(512, true).unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    let back = f.read_to_end().unwrap();
    assert_eq!(back, &payload[..512]);

    f.ftruncate(4 << 20, false).unwrap();
    assert_eq!(f.size(), 4 << 20);
    f.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(f.read_to_end().unwrap().len(), 4 << 20);
    f.close().unwrap();

    // The declared size survives a fresh open.
    let f = root.open("big.bin").unwrap();
    assert_eq!(f.size(), 4 << 20);
}

#[test]
fn directory_operations_and_errors() {
    let (_, vol) = formatted_mem(32 << 20, FatKind::Fat16, 1024);
    let root = vol.root();
    let sub = root.mkdir("docs").unwrap();
    let mut f = sub.create("note.txt", 0).unwrap();
    f.write(b"text").unwrap();
    f.close().unwrap();

    // Dot entries come first in a FAT subdirectory.
    let entries = sub.entries().unwrap();
    assert_eq!(entries[0].name, ".");
    assert_eq!(entries[1].name, "..");

    // A populated directory refuses erase.
    assert!(matches!(root.erase("docs"), Err(Error::NotEmpty(_))));

    root.rename("docs", "papers").unwrap();
    assert!(root.find("docs").unwrap().is_none());
    let papers = root.opendir("papers").unwrap();
    assert!(papers.find("note.txt").unwrap().is_some());

    // rmtree clears recursively; then the empty directory erases cleanly.
    root.rmtree(Some("papers")).unwrap();
    assert!(root.find("papers").unwrap().is_none());

    // Accounting is conserved across the whole dance.
    let boot = vol.boot();
    let (free, _) = vol.getdiskspace().unwrap();
    assert_eq!(free, boot.clusters);
}

#[test]
fn label_and_attributes() {
    let (_, vol) = formatted_mem(32 << 20, FatKind::Fat16, 1024);
    vol.set_label("MYVOLUME").unwrap();
    assert_eq!(vol.label().unwrap().as_deref(), Some("MYVOLUME"));
    let root = vol.root();
    // The label slot is not a file.
    assert!(root.open("MYVOLUME").is_err());

    let mut f = root.create("flags.txt", 0).unwrap();
    f.write(b"x").unwrap();
    f.close().unwrap();
    let attrs = root.attrib("flags.txt", &["+R", "+H"]).unwrap();
    assert!(attrs.contains(fatio::entry::FileAttributes::READ_ONLY));
    let attrs = root.attrib("flags.txt", &["-H"]).unwrap();
    assert!(!attrs.contains(fatio::entry::FileAttributes::HIDDEN));
}

#[test]
fn erase_invalidates_open_handles() {
    let (_, vol) = formatted_mem(32 << 20, FatKind::Fat16, 1024);
    let root = vol.root();
    let mut f = root.create("doomed.txt", 0).unwrap();
    f.write(b"payload").unwrap();
    f.close().unwrap();

    let mut stale = root.open("doomed.txt").unwrap();
    root.erase("doomed.txt").unwrap();
    assert!(!stale.is_valid());
    assert!(stale.write(b"zombie").is_err());
}

#[test]
fn sort_orders_directory_entries() {
    let (_, vol) = formatted_mem(32 << 20, FatKind::Fat16, 1024);
    let root = vol.root();
    for name in ["zeta.txt", "alpha.txt", "mid.txt"] {
        let mut f = root.create(name, 0).unwrap();
        f.write(name.as_bytes()).unwrap();
        f.close().unwrap();
    }
    root.sort(None, false).unwrap();
    let names = root.listdir().unwrap();
    assert_eq!(names, vec!["alpha.txt", "mid.txt", "zeta.txt"]);
    // Contents survive the rewrite.
    let mut f = root.open("alpha.txt").unwrap();
    assert_eq!(f.read_to_end().unwrap(), b"alpha.txt");
}

#[test]
fn vhd_differencing_write_then_merge() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.vhd");
    let delta_path = dir.path().join("delta.vhd");

    // Base: dynamic VHD with a FAT32 volume inside.
    {
        let base: Arc<dyn BlockDevice> =
            Arc::new(VhdDisk::create_dynamic(&base_path, 80 << 20, VHD_BLOCK_SIZE).unwrap());
        format(
            &base,
            &FormatParams {
                fat_kind: Some(FatKind::Fat32),
                cluster_size: Some(512),
                ..Default::default()
            },
        )
        .unwrap();
        base.flush().unwrap();
    }

    // Child: write a file through the delta only.
    {
        let delta: Arc<dyn BlockDevice> =
            Arc::new(VhdDisk::create_differencing(&delta_path, &base_path).unwrap());
        let vol = Volume::mount(delta, false).unwrap();
        let mut f = vol.root().create("delta.txt", 0).unwrap();
        f.write(b"only in the child").unwrap();
        f.close().unwrap();
        vol.close().unwrap();
    }

    // The base must not see it yet.
    {
        let base: Arc<dyn BlockDevice> = Arc::new(VhdDisk::open(&base_path, true).unwrap());
        let vol = Volume::mount(base, true).unwrap();
        assert!(vol.root().find("delta.txt").unwrap().is_none());
    }

    // Merge child into parent; now it must.
    let (sectors, _) = VhdDisk::open(&delta_path, false).unwrap().merge().unwrap();
    assert!(sectors > 0);
    assert!(!delta_path.exists());
    let base: Arc<dyn BlockDevice> = Arc::new(VhdDisk::open(&base_path, true).unwrap());
    let vol = Volume::mount(base, true).unwrap();
    let mut f = vol.root().open("delta.txt").unwrap();
    assert_eq!(f.read_to_end().unwrap(), b"only in the child");
}

#[test]
fn partition_format_mount_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let disk: Arc<dyn BlockDevice> = Arc::new(FileDisk::create(&path, 1 << 30).unwrap());

    let table = partition::partition(&disk, Scheme::Mbr, &Default::default()).unwrap();
    let parts = table.partitions();
    assert_eq!(parts.len(), 1);
    assert!(matches!(parts[0].mbr_type, Some(0x0B) | Some(0x0C)));

    let part = partition::open_partition(&disk, 0).unwrap();
    format(
        &part,
        &FormatParams {
            fat_kind: Some(FatKind::Fat32),
            ..Default::default()
        },
    )
    .unwrap();

    let vol = vdisk::open_volume(&path, false, OpenWhat::Auto).unwrap();
    assert_eq!(vol.boot().kind, FatKind::Fat32);
    assert!(vol.root().listdir().unwrap().is_empty());
    vol.close().unwrap();

    let mut mbr = [0u8; 512];
    disk.read_at(0, &mut mbr).unwrap();
    assert_eq!(&mbr[510..512], &[0x55, 0xAA]);
}

#[test]
fn wipe_free_space_zeroes_unused_clusters() {
    let (mem, vol) = formatted_mem(16 << 20, FatKind::Fat16, 1024);
    {
        let root = vol.root();
        let mut f = root.create("keep.bin", 0).unwrap();
        f.write(&[0x55u8; 4096]).unwrap();
        f.close().unwrap();
        let mut f = root.create("drop.bin", 0).unwrap();
        f.write(&[0xAAu8; 4096]).unwrap();
        f.close().unwrap();
        root.erase("drop.bin").unwrap();
        root.wipefreespace().unwrap();
    }
    vol.close().unwrap();

    // The erased payload is gone from the data region; the kept one is
    // intact.
    let snap = mem.snapshot();
    assert!(!snap
        .windows(4096)
        .any(|w| w.iter().all(|&b| b == 0xAA)));
    let vol = Volume::mount(Arc::new(MemDisk::from_vec(snap)), true).unwrap();
    let mut f = vol.root().open("keep.bin").unwrap();
    assert!(f.read_to_end().unwrap().iter().all(|&b| b == 0x55));
}
