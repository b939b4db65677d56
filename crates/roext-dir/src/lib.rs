#![forbid(unsafe_code)]
//! Directory iteration.
//!
//! A directory's payload is a sequence of variable-length entries packed
//! into data blocks, read here through the directory inode's regular-file
//! reader one block at a time. Iteration is lazy: a block is only pulled
//! off the device when the previous block's entries are exhausted.
//!
//! Htree-indexed directories carry their index inside ordinary-looking
//! data blocks, so linear iteration works on them unchanged; the index is
//! simply not used for lookup acceleration.

use roext_block::ByteDevice;
use roext_error::{ExtError, Result};
use roext_file::FileReader;
use roext_ondisk::{DirEntry, parse_dir_block};
use roext_types::{BlockSize, InodeNumber};
use std::collections::VecDeque;

/// Lazy iterator over a directory's live entries, in on-disk order.
///
/// Deleted slots (inode 0) and checksum tails are skipped. Each yielded
/// item is `Ok(entry)` or the error that stopped iteration.
pub struct DirIter<'a> {
    dev: &'a dyn ByteDevice,
    reader: &'a FileReader,
    block_size: BlockSize,
    has_file_type: bool,
    /// Byte offset of the next unread block within the directory stream.
    pos: u64,
    pending: VecDeque<DirEntry>,
    failed: bool,
}

impl<'a> DirIter<'a> {
    /// Iterate the directory stream behind `reader`.
    ///
    /// `has_file_type` is the filetype incompat feature bit; it changes how
    /// byte 7 of each entry is decoded.
    #[must_use]
    pub fn new(
        dev: &'a dyn ByteDevice,
        reader: &'a FileReader,
        block_size: BlockSize,
        has_file_type: bool,
    ) -> Self {
        Self {
            dev,
            reader,
            block_size,
            has_file_type,
            pos: 0,
            pending: VecDeque::new(),
            failed: false,
        }
    }

    /// Pull the next directory block and queue its entries.
    ///
    /// Returns false at end of stream.
    fn refill(&mut self) -> Result<bool> {
        let size = self.reader.size();
        while self.pos < size {
            let want = usize::try_from(
                self.block_size.as_u64().min(size - self.pos),
            )
            .map_err(|_| ExtError::Format("directory block exceeds usize".to_owned()))?;

            let mut block = vec![0_u8; want];
            let n = roext_file::read_full(self.reader, self.dev, self.block_size, self.pos, &mut block)?;
            if n == 0 {
                return Ok(false);
            }
            block.truncate(n);
            self.pos += n as u64;

            let (entries, _tail) = parse_dir_block(&block, self.has_file_type)?;
            if entries.is_empty() {
                // A block of only deleted slots; keep going.
                continue;
            }
            self.pending.extend(entries);
            return Ok(true);
        }
        Ok(false)
    }
}

impl Iterator for DirIter<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            match self.refill() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Linear name lookup: scan the directory for `name` and return its inode
/// number and entry.
pub fn lookup(
    dev: &dyn ByteDevice,
    reader: &FileReader,
    block_size: BlockSize,
    has_file_type: bool,
    name: &[u8],
) -> Result<DirEntry> {
    for entry in DirIter::new(dev, reader, block_size, has_file_type) {
        let entry = entry?;
        if entry.name == name {
            return Ok(entry);
        }
    }
    Err(ExtError::NotFound(
        String::from_utf8_lossy(name).into_owned(),
    ))
}

/// Convenience: collect every live entry of a directory.
pub fn read_all(
    dev: &dyn ByteDevice,
    reader: &FileReader,
    block_size: BlockSize,
    has_file_type: bool,
) -> Result<Vec<DirEntry>> {
    DirIter::new(dev, reader, block_size, has_file_type).collect()
}

/// Look up a name and return just the inode number.
pub fn lookup_ino(
    dev: &dyn ByteDevice,
    reader: &FileReader,
    block_size: BlockSize,
    has_file_type: bool,
    name: &[u8],
) -> Result<InodeNumber> {
    lookup(dev, reader, block_size, has_file_type, name).map(|entry| entry.ino)
}
