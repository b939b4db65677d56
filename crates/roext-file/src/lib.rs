#![forbid(unsafe_code)]
//! Regular-file read backends.
//!
//! A regular file stores its data one of three ways, selected by inode
//! flags: an extent tree, inline in the inode record, or the classic
//! direct/indirect block map. Each backend exposes the same positioned
//! read; `FileReader` picks the backend at construction and dispatches.
//!
//! `read_at` returns `Ok(0)` at end of file. It may return fewer bytes than
//! requested while data remains (a partial read, e.g. at an extent
//! boundary); callers that need the full range re-enter at the advanced
//! offset, which `read_full` does in a loop.

mod block_map;
mod extent;

pub use block_map::BlockMapFile;
pub use extent::ExtentFile;

use roext_block::ByteDevice;
use roext_error::Result;
use roext_ondisk::InodeRecord;
use roext_types::{BlockSize, INODE_DATA_SIZE};

/// A file whose entire payload lives in the inode's 60-byte data area.
#[derive(Debug, Clone)]
pub struct InlineFile {
    size: usize,
    data: [u8; INODE_DATA_SIZE],
}

impl InlineFile {
    /// Build an inline reader from a decoded inode record.
    ///
    /// # Panics
    ///
    /// An inline inode whose size exceeds the data area is a decoder bug,
    /// not an input error.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(record: &InodeRecord) -> Self {
        assert!(
            record.size <= INODE_DATA_SIZE as u64,
            "inline inode larger than {INODE_DATA_SIZE} bytes"
        );
        let mut data = [0_u8; INODE_DATA_SIZE];
        let n = record.data.len().min(INODE_DATA_SIZE);
        data[..n].copy_from_slice(&record.data[..n]);
        Self {
            size: record.size as usize,
            data,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size as u64
    }

    /// Copy `data[offset..size]` into `dst`; `Ok(0)` at or past EOF.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        if offset >= self.size as u64 {
            return Ok(0);
        }
        #[allow(clippy::cast_possible_truncation)]
        let start = offset as usize;
        let n = dst.len().min(self.size - start);
        dst[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// The regular-file read backend, selected by inode flags.
///
/// Selection priority: extents flag, then inline flag, then the block map.
#[derive(Debug, Clone)]
pub enum FileReader {
    Inline(InlineFile),
    BlockMap(BlockMapFile),
    Extents(ExtentFile),
}

impl FileReader {
    /// Construct the appropriate backend for `record`.
    ///
    /// The extent backend reads the whole tree off the device eagerly and
    /// validates it; the other two only decode the inode data area.
    pub fn new(
        dev: &dyn ByteDevice,
        block_size: BlockSize,
        record: &InodeRecord,
    ) -> Result<Self> {
        if record.uses_extents() {
            return Ok(Self::Extents(ExtentFile::load(dev, block_size, record)?));
        }
        if record.has_inline_data() {
            return Ok(Self::Inline(InlineFile::new(record)));
        }
        Ok(Self::BlockMap(BlockMapFile::new(record)?))
    }

    /// File size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Inline(f) => f.size(),
            Self::BlockMap(f) => f.size(),
            Self::Extents(f) => f.size(),
        }
    }

    /// Positioned read: `Ok(0)` at EOF, possibly partial otherwise.
    pub fn read_at(
        &self,
        dev: &dyn ByteDevice,
        block_size: BlockSize,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<usize> {
        match self {
            Self::Inline(f) => f.read_at(offset, dst),
            Self::BlockMap(f) => f.read_at(dev, block_size, offset, dst),
            Self::Extents(f) => f.read_at(dev, block_size, offset, dst),
        }
    }
}

/// Fill `dst` by re-entering `read_at` until it is full or EOF; returns the
/// number of bytes read.
pub fn read_full(
    reader: &FileReader,
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    mut offset: u64,
    dst: &mut [u8],
) -> Result<usize> {
    let mut total = 0_usize;
    while total < dst.len() {
        let n = reader.read_at(dev, block_size, offset, &mut dst[total..])?;
        if n == 0 {
            break;
        }
        total += n;
        offset += n as u64;
    }
    Ok(total)
}
