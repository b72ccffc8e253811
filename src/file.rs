//! File handles
//!
//! A handle pairs a directory entry with the cluster chain stream behind
//! it. Reads and writes go straight to the stream; the entry is written
//! back once, on close, with whatever changed: the start cluster (a file
//! empty at open gets its first cluster lazily), the declared size (and on
//! exFAT both the valid-data and allocated lengths plus the contiguity
//! flag), and the modify/access stamps.
//!
//! Erasing an entry from its table flips the handle's validity flag; a
//! closed-because-invalid handle writes nothing, so a deleted file cannot
//! be resurrected by a stale close. Dropping an unclosed writable handle
//! closes it best-effort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error};
use spin::RwLock;

use crate::chain::ClusterStream;
use crate::dir::DirTable;
use crate::entry::DirEntryInfo;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

pub struct FileHandle {
    stream: ClusterStream,
    entry: DirEntryInfo,
    table: Arc<RwLock<DirTable>>,
    /// Cleared by the owning table when the entry is erased.
    valid: Arc<AtomicBool>,
    read_only: bool,
    modified: bool,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn new(
        stream: ClusterStream,
        entry: DirEntryInfo,
        table: Arc<RwLock<DirTable>>,
        read_only: bool,
    ) -> Self {
        let valid = Arc::new(AtomicBool::new(true));
        table.write().watch(entry.start_cluster, &valid);
        Self {
            stream,
            entry,
            table,
            valid,
            read_only,
            modified: false,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn entry(&self) -> &DirEntryInfo {
        &self.entry
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> u64 {
        self.stream.filesize()
    }

    pub fn tell(&self) -> u64 {
        self.stream.tell()
    }

    pub fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        let base: i128 = match from {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => self.stream.tell() as i128 + d as i128,
            SeekFrom::End(d) => self.stream.filesize() as i128 + d as i128,
        };
        if base < 0 {
            return Err(Error::out_of_range(0, self.stream.filesize()));
        }
        self.stream.seek(base as u64);
        Ok(base as u64)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf)
    }

    /// Read the whole remaining contents.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let left = self.stream.filesize().saturating_sub(self.stream.tell());
        let mut buf = vec![0u8; left as usize];
        let got = self.stream.read(&mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if !self.is_valid() {
            return Err(Error::NotFound(self.entry.name.clone()));
        }
        let written = self.stream.write(buf)?;
        self.modified = true;
        Ok(written)
    }

    /// Resize to `length`. Growing allocates (the declared size follows);
    /// shrinking keeps the clusters unless `free` also unlinks them.
    pub fn ftruncate(&mut self, length: u64, free: bool) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if length > self.stream.size() {
            self.stream.reserve(length)?;
        }
        self.stream.seek(length);
        self.stream.set_filesize(length);
        self.modified = true;
        if free {
            self.stream.truncate()?;
        }
        Ok(())
    }

    /// Write the directory entry back if this handle changed anything.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.is_valid() {
            debug!("close of '{}' skipped, entry erased", self.entry.name);
            return Ok(());
        }
        if self.read_only || !self.modified {
            return Ok(());
        }
        let mut table = self.table.write();
        self.entry = table.update_entry(
            &self.entry,
            self.stream.start(),
            self.stream.filesize(),
            self.stream.size(),
            self.stream.is_contiguous() && self.stream.no_fat_chain(),
        )?;
        debug!(
            "closed '{}': start {:#x}, {} bytes",
            self.entry.name,
            self.stream.start(),
            self.stream.filesize()
        );
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.closed && self.modified {
            if let Err(e) = self.close() {
                error!("implicit close of '{}' failed: {e}", self.entry.name);
            }
        }
    }
}
