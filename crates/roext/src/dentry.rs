//! Dentries: the consumer-facing handle around a cached inode.

use crate::fs::Filesystem;
use crate::inode::Inode;
use std::sync::Arc;

/// A directory-tree handle for one inode.
///
/// Multiple dentries may share one non-directory inode (hard links); a
/// directory inode is referenced by at most one dentry. The refcount
/// operations act on the underlying inode; parent/child linkage between
/// dentries is maintained by the consumer, not here.
#[derive(Debug, Clone)]
pub struct Dentry {
    inode: Arc<Inode>,
}

impl Dentry {
    /// Wrap an inode handle that already carries a reference.
    #[must_use]
    pub fn new(inode: Arc<Inode>) -> Self {
        Self { inode }
    }

    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Take a reference on the underlying inode.
    pub fn inc_ref(&self) {
        self.inode.inc_ref();
    }

    /// Try to take a reference; fails if the inode is mid-eviction.
    #[must_use]
    pub fn try_inc_ref(&self) -> bool {
        self.inode.try_inc_ref()
    }

    /// Drop a reference; the last one evicts the inode from `fs`'s cache.
    pub fn dec_ref(&self, fs: &Filesystem) {
        self.inode.dec_ref(fs);
    }
}
