//! The filesystem root object: mount, geometry, and the inode cache.

use crate::dentry::Dentry;
use crate::inode::{Inode, InodeKind};
use parking_lot::Mutex;
use roext_block::{ByteDevice, read_superblock_region, read_vec};
use roext_error::{ExtError, Result};
use roext_file::{FileReader, read_full};
use roext_ondisk::{
    GroupDesc, INCOMPAT_ALLOWED_MASK, INCOMPAT_REJECT_MASK, InodeRecord, Superblock,
    verify_group_desc_checksum,
};
use roext_types::{
    BlockSize, ByteOffset, FAST_SYMLINK_MAX, GroupNumber, InodeNumber, u64_to_usize,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Mount-time configuration. The device handle is mandatory.
#[derive(Clone)]
pub struct MountOptions {
    /// Backing store holding the filesystem image.
    pub device: Option<Arc<dyn ByteDevice>>,
    /// Verify superblock and group-descriptor CRC32C checksums when the
    /// image carries `metadata_csum`.
    pub verify_checksums: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            device: None,
            verify_checksums: true,
        }
    }
}

impl MountOptions {
    /// Options with the given device and checksum verification enabled.
    #[must_use]
    pub fn with_device(device: Arc<dyn ByteDevice>) -> Self {
        Self {
            device: Some(device),
            verify_checksums: true,
        }
    }
}

/// Mount the image behind `options.device`, returning the filesystem and a
/// dentry for the root directory (inode 2).
pub fn mount(options: MountOptions) -> Result<(Arc<Filesystem>, Dentry)> {
    let device = options
        .device
        .ok_or_else(|| ExtError::Format("mount requires a device handle".to_owned()))?;

    let fs = Arc::new(Filesystem::new(device, options.verify_checksums)?);
    let root = fs.root_inode()?;
    Ok((fs, Dentry::new(root)))
}

/// A mounted read-only filesystem.
///
/// Owns the device handle, the parsed superblock, the eagerly loaded
/// block-group table, and the inode cache behind the filesystem lock.
/// Dropping the filesystem drops the cached inodes in unspecified order.
pub struct Filesystem {
    dev: Arc<dyn ByteDevice>,
    sb: Superblock,
    block_size: BlockSize,
    groups: Vec<GroupDesc>,
    /// Inode cache. The lock serialises cache mutation and the
    /// decode-and-insert step of `get_or_create_inode`; refcount updates
    /// themselves are atomic and lock-free.
    cache: Mutex<HashMap<InodeNumber, Arc<Inode>>>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("block_size", &self.block_size)
            .field("groups", &self.groups.len())
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    fn new(dev: Arc<dyn ByteDevice>, verify_checksums: bool) -> Result<Self> {
        let region = read_superblock_region(&*dev)?;
        let sb = Superblock::parse_region(&region)?;
        sb.validate_geometry()?;

        let rejected = sb.feature_incompat & INCOMPAT_REJECT_MASK;
        if rejected != 0 {
            return Err(ExtError::Format(format!(
                "unsupported incompatible feature flags {rejected:#x}"
            )));
        }
        let unknown = sb.feature_incompat & !(INCOMPAT_ALLOWED_MASK | INCOMPAT_REJECT_MASK);
        if unknown != 0 {
            return Err(ExtError::Unsupported("unknown incompatible feature flags"));
        }

        if !matches!(sb.block_size, 1024 | 2048 | 4096) {
            return Err(ExtError::Format(format!(
                "unsupported block size {}",
                sb.block_size
            )));
        }
        let block_size = BlockSize::new(sb.block_size)?;

        if verify_checksums {
            sb.validate_checksum(&region)?;
        }

        let groups = load_group_table(&*dev, &sb, verify_checksums)?;

        info!(
            target: "roext::fs",
            event = "mount",
            volume = %sb.volume_name,
            block_size = sb.block_size,
            groups = groups.len(),
            inodes = sb.inodes_count,
            inode_size = sb.inode_size,
        );

        Ok(Self {
            dev,
            sb,
            block_size,
            groups,
            cache: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn device(&self) -> &dyn ByteDevice {
        &*self.dev
    }

    #[must_use]
    pub fn group_table(&self) -> &[GroupDesc] {
        &self.groups
    }

    /// Number of inodes currently held in the cache.
    #[must_use]
    pub fn cached_inodes(&self) -> usize {
        self.cache.lock().len()
    }

    /// The root directory, inode 2.
    pub fn root_inode(&self) -> Result<Arc<Inode>> {
        self.get_or_create_inode(InodeNumber::ROOT)
    }

    /// Return the cached inode after taking a reference, or decode it from
    /// disk and insert it with one reference.
    ///
    /// Two concurrent calls for the same number return the same object;
    /// the decode happens at most once per cache residency.
    ///
    /// # Panics
    ///
    /// Inode number 0 is reserved-invalid; asking for it is a caller bug.
    pub fn get_or_create_inode(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        assert!(ino.0 != 0, "inode number 0 is not possible on ext filesystems");

        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(&ino) {
            if existing.try_inc_ref() {
                return Ok(Arc::clone(existing));
            }
            // The entry is mid-eviction: its final reference was dropped
            // but the owner has not removed it yet. Replace it.
            cache.remove(&ino);
        }

        let inode = Arc::new(self.decode_inode(ino)?);
        cache.insert(ino, Arc::clone(&inode));
        Ok(inode)
    }

    /// Remove `inode` from the cache if its refcount is still zero and the
    /// cached entry is this very object.
    pub(crate) fn evict_if_dead(&self, inode: &Inode) {
        let mut cache = self.cache.lock();
        if inode.ref_count() != 0 {
            return;
        }
        if let Some(entry) = cache.get(&inode.ino()) {
            if std::ptr::eq(Arc::as_ptr(entry), inode) {
                cache.remove(&inode.ino());
                debug!(target: "roext::fs", event = "evict", ino = inode.ino().0);
            }
        }
    }

    /// Read and decode the on-disk inode record, then build the typed
    /// payload for it.
    fn decode_inode(&self, ino: InodeNumber) -> Result<Inode> {
        if ino.0 > self.sb.inodes_count {
            return Err(ExtError::Corruption {
                block: 0,
                detail: format!("inode {ino} out of range (filesystem has {})", self.sb.inodes_count),
            });
        }

        let (group, _index, byte_in_table) = self.sb.inode_table_offset(ino);
        let gd = self
            .groups
            .get(group.0 as usize)
            .ok_or_else(|| ExtError::Corruption {
                block: 0,
                detail: format!("inode {ino} maps to missing block group {group}"),
            })?;

        let table_byte = gd
            .inode_table
            .checked_mul(self.block_size.as_u64())
            .and_then(|base| base.checked_add(byte_in_table))
            .ok_or_else(|| ExtError::Corruption {
                block: gd.inode_table,
                detail: "inode table offset overflows u64".to_owned(),
            })?;

        let raw = read_vec(
            &*self.dev,
            ByteOffset(table_byte),
            usize::from(self.sb.inode_size),
        )?;
        let record = InodeRecord::parse_from_bytes(&raw)?;

        let kind = self.build_payload(&record)?;
        debug!(
            target: "roext::fs",
            event = "inode_decoded",
            ino = ino.0,
            mode = record.mode,
            size = record.size,
        );
        Ok(Inode::new(ino, record, kind))
    }

    /// Construct the variant payload for a decoded record.
    fn build_payload(&self, record: &InodeRecord) -> Result<InodeKind> {
        use roext_ondisk::FileKind;

        match record.file_kind() {
            FileKind::Regular => Ok(InodeKind::Regular(FileReader::new(
                &*self.dev,
                self.block_size,
                record,
            )?)),
            FileKind::Directory => Ok(InodeKind::Directory(FileReader::new(
                &*self.dev,
                self.block_size,
                record,
            )?)),
            FileKind::Symlink => Ok(InodeKind::Symlink(self.decode_symlink_target(record)?)),
            FileKind::Fifo => Ok(InodeKind::Fifo),
            FileKind::CharDev | FileKind::BlockDev | FileKind::Socket => {
                Err(ExtError::Unsupported("socket or device inode"))
            }
            FileKind::Unknown => Err(ExtError::Format(format!(
                "invalid file type bits in mode {:#o}",
                record.mode
            ))),
        }
    }

    /// A short target lives in the inode data area; a long one is read
    /// through the regular-file machinery.
    fn decode_symlink_target(&self, record: &InodeRecord) -> Result<Box<[u8]>> {
        let size = u64_to_usize(record.size, "symlink_size")?;
        if size < FAST_SYMLINK_MAX {
            return Ok(record.data[..size].to_vec().into_boxed_slice());
        }

        let reader = FileReader::new(&*self.dev, self.block_size, record)?;
        let mut target = vec![0_u8; size];
        let n = read_full(&reader, &*self.dev, self.block_size, 0, &mut target)?;
        if n != size {
            return Err(ExtError::Format(format!(
                "symlink target truncated: inode says {size} bytes, read {n}"
            )));
        }
        Ok(target.into_boxed_slice())
    }
}

fn load_group_table(
    dev: &dyn ByteDevice,
    sb: &Superblock,
    verify_checksums: bool,
) -> Result<Vec<GroupDesc>> {
    let desc_size = sb.group_desc_size();
    let csum_seed = sb.csum_seed();
    let count = sb.groups_count();

    let mut groups = Vec::with_capacity(count as usize);
    for g in 0..count {
        let offset = sb
            .group_desc_offset(GroupNumber(g))
            .ok_or_else(|| ExtError::Format("group descriptor offset overflows u64".to_owned()))?;
        let raw = read_vec(dev, ByteOffset(offset), usize::from(desc_size))?;

        if verify_checksums && sb.has_metadata_csum() {
            verify_group_desc_checksum(&raw, csum_seed, g, desc_size)?;
        }
        groups.push(GroupDesc::parse_from_bytes(&raw, desc_size)?);
    }

    debug!(target: "roext::fs", event = "group_table_loaded", groups = groups.len());
    Ok(groups)
}
