//! Typed inodes and their reference-count lifecycle.

use crate::fs::Filesystem;
use roext_dir::DirIter;
use roext_error::{ExtError, Result};
use roext_file::FileReader;
use roext_ondisk::InodeRecord;
use roext_types::InodeNumber;
use std::sync::atomic::{AtomicI64, Ordering};

/// Inode type as seen by the VFS consumer.
///
/// Socket and device inodes never get this far: their decode fails with an
/// unsupported-object error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Fifo,
}

/// Variant-specific payload. Immutable after construction, like the
/// decoded record itself.
#[derive(Debug)]
pub(crate) enum InodeKind {
    Regular(FileReader),
    Directory(FileReader),
    Symlink(Box<[u8]>),
    Fifo,
}

/// A decoded inode plus its cache lifecycle state.
///
/// The refcount counts consumer references (dentry handles), not `Arc`
/// clones; when it reaches zero the inode is removed from the filesystem
/// cache and any remaining weak holders see `try_inc_ref` fail.
#[derive(Debug)]
pub struct Inode {
    ino: InodeNumber,
    refs: AtomicI64,
    record: InodeRecord,
    kind: InodeKind,
}

impl Inode {
    pub(crate) fn new(ino: InodeNumber, record: InodeRecord, kind: InodeKind) -> Self {
        Self {
            ino,
            refs: AtomicI64::new(1),
            record,
            kind,
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// The raw decoded record, for callers that need every field.
    #[must_use]
    pub fn record(&self) -> &InodeRecord {
        &self.record
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        match self.kind {
            InodeKind::Regular(_) => FileType::Regular,
            InodeKind::Directory(_) => FileType::Directory,
            InodeKind::Symlink(_) => FileType::Symlink,
            InodeKind::Fifo => FileType::Fifo,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        match &self.kind {
            // Symlink size is the target length however it is stored.
            InodeKind::Symlink(target) => target.len() as u64,
            _ => self.record.size,
        }
    }

    #[must_use]
    pub fn mode(&self) -> u16 {
        self.record.mode
    }

    #[must_use]
    pub fn uid(&self) -> u32 {
        self.record.uid
    }

    #[must_use]
    pub fn gid(&self) -> u32 {
        self.record.gid
    }

    /// Modification time, seconds since the epoch.
    #[must_use]
    pub fn mtime(&self) -> u32 {
        self.record.mtime
    }

    #[must_use]
    pub fn link_count(&self) -> u16 {
        self.record.links_count
    }

    /// Positioned read for regular files and symlinks.
    ///
    /// `Ok(0)` at end of file; partial reads are the caller's signal to
    /// retry at the advanced offset.
    pub fn read_at(&self, fs: &Filesystem, offset: u64, dst: &mut [u8]) -> Result<usize> {
        match &self.kind {
            InodeKind::Regular(reader) => {
                reader.read_at(fs.device(), fs.block_size(), offset, dst)
            }
            InodeKind::Symlink(target) => {
                let len = target.len() as u64;
                if offset >= len {
                    return Ok(0);
                }
                #[allow(clippy::cast_possible_truncation)]
                let start = offset as usize;
                let n = dst.len().min(target.len() - start);
                dst[..n].copy_from_slice(&target[start..start + n]);
                Ok(n)
            }
            InodeKind::Directory(_) => Err(ExtError::IsDirectory),
            InodeKind::Fifo => Err(ExtError::Unsupported("named pipe has no stored data")),
        }
    }

    /// Lazy directory entry sequence, in on-disk order.
    pub fn iterate<'a>(&'a self, fs: &'a Filesystem) -> Result<DirIter<'a>> {
        match &self.kind {
            InodeKind::Directory(reader) => Ok(DirIter::new(
                fs.device(),
                reader,
                fs.block_size(),
                fs.superblock().dirent_has_file_type(),
            )),
            _ => Err(ExtError::NotDirectory),
        }
    }

    /// Name lookup within this directory.
    pub fn lookup(&self, fs: &Filesystem, name: &[u8]) -> Result<InodeNumber> {
        match &self.kind {
            InodeKind::Directory(reader) => roext_dir::lookup_ino(
                fs.device(),
                reader,
                fs.block_size(),
                fs.superblock().dirent_has_file_type(),
                name,
            ),
            _ => Err(ExtError::NotDirectory),
        }
    }

    /// Symlink target bytes.
    pub fn target(&self) -> Result<&[u8]> {
        match &self.kind {
            InodeKind::Symlink(target) => Ok(target),
            _ => Err(ExtError::Unsupported("not a symlink")),
        }
    }

    // ── Reference counting ───────────────────────────────────────────────

    /// Current reference count (diagnostic).
    #[must_use]
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Take a reference.
    ///
    /// # Panics
    ///
    /// The caller must already hold a reference; incrementing from zero
    /// would resurrect an inode that eviction has already claimed.
    pub fn inc_ref(&self) {
        let prev = self.refs.fetch_add(1, Ordering::SeqCst);
        assert!(prev > 0, "inc_ref on an inode with no live references");
    }

    /// Try to take a reference; fails if the count was observed at zero.
    ///
    /// The CAS loop exists for holders of weak handles racing a concurrent
    /// final `dec_ref`: the count must never move 0 -> 1 here.
    pub fn try_inc_ref(&self) -> bool {
        let mut refs = self.refs.load(Ordering::SeqCst);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => refs = observed,
            }
        }
    }

    /// Drop a reference; the last one removes the inode from `fs`'s cache
    /// under the filesystem lock.
    ///
    /// # Panics
    ///
    /// Dropping a reference that was never taken drives the count
    /// negative, which is a caller bug.
    pub fn dec_ref(&self, fs: &Filesystem) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "dec_ref called without holding a reference");
        if prev == 1 {
            // The eviction step re-checks the count under the lock: a
            // concurrent get_or_create may have already replaced the cache
            // entry after observing the zero.
            fs.evict_if_dead(self);
        }
    }
}
