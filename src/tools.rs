//! Host <-> image copy helpers
//!
//! Thin plumbing over the directory API: pour host files and trees into a
//! mounted volume, pull them back out, and a defragmenting cluster copy
//! that rewrites a chain contiguously. Batches report each item through an
//! optional callback; a missing source is reported and skipped, anything
//! else aborts the batch.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use log::debug;

use crate::entry::FileAttributes;
use crate::error::{Error, Result};
use crate::fs::DirRef;

pub const COPY_CHUNK: usize = 1 << 20;

pub type ProgressCallback<'a> = &'a mut dyn FnMut(&str);

fn report(callback: &mut Option<ProgressCallback<'_>>, item: &str) {
    if let Some(cb) = callback.as_mut() {
        cb(item);
    }
}

/// Copy host files (or whole directories) into `dest`. Files are created
/// with every cluster pre-allocated so their contents land in one run.
pub fn copy_in(
    sources: &[&Path],
    dest: &DirRef,
    mut callback: Option<ProgressCallback<'_>>,
) -> Result<()> {
    copy_in_inner(sources, dest, &mut callback)
}

fn copy_in_inner(
    sources: &[&Path],
    dest: &DirRef,
    callback: &mut Option<ProgressCallback<'_>>,
) -> Result<()> {
    for &source in sources {
        if source.is_dir() {
            let name = source
                .file_name()
                .ok_or_else(|| Error::BadName(source.display().to_string()))?
                .to_string_lossy()
                .into_owned();
            let subdir = dest.mkdir(&name)?;
            copy_tree_in_inner(source, &subdir, callback)?;
        } else if source.is_file() {
            copy_file_in(source, dest, callback)?;
        } else {
            report(callback, &format!("{}: not found", source.display()));
        }
    }
    Ok(())
}

fn copy_file_in(
    source: &Path,
    dest: &DirRef,
    callback: &mut Option<ProgressCallback<'_>>,
) -> Result<()> {
    let name = source
        .file_name()
        .ok_or_else(|| Error::BadName(source.display().to_string()))?
        .to_string_lossy()
        .into_owned();
    let size = fs::metadata(source)?.len();
    report(callback, &name);
    let mut reader = fs::File::open(source)?;
    let prealloc = size.div_ceil(dest.cluster_size() as u64) as u32;
    let mut handle = dest.create(&name, prealloc)?;
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let got = reader.read(&mut buf)?;
        if got == 0 {
            break;
        }
        handle.write(&buf[..got])?;
    }
    handle.close()?;
    Ok(())
}

/// Recursively copy a host tree under `dest`.
pub fn copy_tree_in(
    base: &Path,
    dest: &DirRef,
    mut callback: Option<ProgressCallback<'_>>,
) -> Result<()> {
    copy_tree_in_inner(base, dest, &mut callback)
}

fn copy_tree_in_inner(
    base: &Path,
    dest: &DirRef,
    callback: &mut Option<ProgressCallback<'_>>,
) -> Result<()> {
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            let subdir = dest.mkdir(&name)?;
            copy_tree_in_inner(&path, &subdir, callback)?;
        } else if path.is_file() {
            copy_file_in(&path, dest, callback)?;
        }
    }
    Ok(())
}

/// Copy image files out to a host directory. `NotFound` sources are
/// reported and skipped so one bad name does not kill a batch.
pub fn copy_out(
    base: &DirRef,
    sources: &[&str],
    dest: &Path,
    mut callback: Option<ProgressCallback<'_>>,
) -> Result<()> {
    copy_out_inner(base, sources, dest, &mut callback)
}

fn copy_out_inner(
    base: &DirRef,
    sources: &[&str],
    dest: &Path,
    callback: &mut Option<ProgressCallback<'_>>,
) -> Result<()> {
    for &source in sources {
        match base.open(source) {
            Ok(mut handle) => {
                let name = source.rsplit(['/', '\\']).next().unwrap_or(source);
                report(callback, name);
                let mut writer = fs::File::create(dest.join(name))?;
                let mut buf = vec![0u8; COPY_CHUNK];
                loop {
                    let got = handle.read(&mut buf)?;
                    if got == 0 {
                        break;
                    }
                    writer.write_all(&buf[..got])?;
                }
            }
            Err(Error::NotFound(_)) => {
                report(callback, &format!("{source}: not found"));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Recursively copy a whole image directory out under `dest`.
pub fn copy_tree_out(
    base: &DirRef,
    dest: &Path,
    mut callback: Option<ProgressCallback<'_>>,
) -> Result<()> {
    copy_tree_out_inner(base, dest, &mut callback)
}

fn copy_tree_out_inner(
    base: &DirRef,
    dest: &Path,
    callback: &mut Option<ProgressCallback<'_>>,
) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in base.entries()? {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        if entry.attributes.contains(FileAttributes::VOLUME_ID) {
            continue;
        }
        if entry.is_dir() {
            let sub = base.opendir(&entry.name)?;
            copy_tree_out_inner(&sub, &dest.join(&entry.name), callback)?;
        } else {
            copy_out_inner(base, &[entry.name.as_str()], dest, callback)?;
        }
    }
    Ok(())
}

/// Defragmenting copy: free the chain behind `name` and rewrite its
/// contents into freshly allocated clusters (one contiguous run if free
/// space allows). Returns the new start cluster.
pub fn fat_copy_clusters(dir: &DirRef, name: &str) -> Result<u32> {
    let entry = dir
        .find(name)?
        .ok_or_else(|| Error::NotFound(name.into()))?;
    if entry.start_cluster < 2 {
        return Ok(entry.start_cluster);
    }
    let mut handle = dir.open(name)?;
    let data = handle.read_to_end()?;
    handle.ftruncate(0, true)?;
    handle.seek(crate::file::SeekFrom::Start(0))?;
    if !data.is_empty() {
        handle.write(&data)?;
    }
    handle.close()?;
    let moved = dir
        .find(name)?
        .ok_or_else(|| Error::NotFound(name.into()))?;
    debug!(
        "defragmented '{name}': {:#x} -> {:#x}",
        entry.start_cluster, moved.start_cluster
    );
    Ok(moved.start_cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpb::FatKind;
    use crate::device::MemDisk;
    use crate::fs::Volume;
    use crate::mkfs::{format, FormatParams};
    use std::sync::Arc;

    fn small_volume() -> Arc<Volume> {
        let device: Arc<dyn crate::device::BlockDevice> = Arc::new(MemDisk::new(16 << 20));
        format(
            &device,
            &FormatParams {
                fat_kind: Some(FatKind::Fat16),
                cluster_size: Some(1024),
                ..Default::default()
            },
        )
        .unwrap();
        Volume::mount(device, false).unwrap()
    }

    #[test]
    fn copy_in_then_out_round_trips() {
        let vol = small_volume();
        let root = vol.root();
        let host = tempfile::tempdir().unwrap();
        let src = host.path().join("input.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        fs::write(&src, &payload).unwrap();

        copy_in(&[src.as_path()], &root, None).unwrap();
        let names = root.listdir().unwrap();
        assert!(names.iter().any(|n| n == "input.bin"));

        let out = host.path().join("out");
        fs::create_dir(&out).unwrap();
        copy_out(&root, &["input.bin"], &out, None).unwrap();
        assert_eq!(fs::read(out.join("input.bin")).unwrap(), payload);
    }

    #[test]
    fn copy_out_skips_missing_sources() {
        let vol = small_volume();
        let root = vol.root();
        let host = tempfile::tempdir().unwrap();
        let mut seen = Vec::new();
        {
            let mut cb = |s: &str| seen.push(s.to_string());
            copy_out(&root, &["ghost.txt"], host.path(), Some(&mut cb)).unwrap();
        }
        assert!(seen.iter().any(|s| s.contains("not found")));
    }

    #[test]
    fn tree_round_trip() {
        let vol = small_volume();
        let root = vol.root();
        let host = tempfile::tempdir().unwrap();
        let tree = host.path().join("tree");
        fs::create_dir_all(tree.join("sub")).unwrap();
        fs::write(tree.join("a.txt"), b"alpha").unwrap();
        fs::write(tree.join("sub/b.txt"), b"beta").unwrap();

        copy_in(&[tree.as_path()], &root, None).unwrap();
        let dir = root.opendir("tree").unwrap();
        assert!(dir.find("a.txt").unwrap().is_some());
        assert!(dir.opendir("sub").unwrap().find("b.txt").unwrap().is_some());

        let out = host.path().join("exported");
        copy_tree_out(&root.opendir("tree").unwrap(), &out, None).unwrap();
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(out.join("sub/b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn defrag_copy_preserves_contents() {
        let vol = small_volume();
        let root = vol.root();
        // Interleave two files so the second fragments, then defragment.
        let mut a = root.create("a.bin", 0).unwrap();
        a.write(&[1u8; 3000]).unwrap();
        a.close().unwrap();
        let mut b = root.create("b.bin", 0).unwrap();
        b.write(&[2u8; 3000]).unwrap();
        b.close().unwrap();
        let mut a = root.open("a.bin").unwrap();
        a.write(&[1u8; 3000]).unwrap();
        a.seek(crate::file::SeekFrom::End(0)).unwrap();
        a.write(&[3u8; 3000]).unwrap();
        a.close().unwrap();

        fat_copy_clusters(&root, "a.bin").unwrap();
        let mut a = root.open("a.bin").unwrap();
        let data = a.read_to_end().unwrap();
        assert_eq!(data.len(), 6000);
        assert!(data[..3000].iter().all(|&b| b == 1));
        assert!(data[3000..].iter().all(|&b| b == 3));
    }
}
