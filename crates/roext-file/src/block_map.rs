//! Classic direct/indirect block-map reader.
//!
//! The inode data area holds 15 block pointers: 12 direct, then one each of
//! single-, double-, and triple-indirect. Indirect blocks are arrays of
//! `block_size / 4` little-endian physical block numbers. A zero pointer at
//! any level is a hole; reads of a hole return zeros.

use roext_block::{ByteDevice, read_block_vec};
use roext_error::{ExtError, Result};
use roext_ondisk::{BLOCK_MAP_DIRECT, BlockPtrs, InodeRecord, read_indirect_entry};
use roext_types::{BlockNumber, BlockSize};

/// How a file block is reached through the pointer hierarchy.
///
/// Index values count entries within each indirection level, where a level
/// holds `K = block_size / 4` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BidPath {
    Direct(usize),
    Indirect(u64),
    Double(u64, u64),
    Triple(u64, u64, u64),
    OutOfRange,
}

fn classify(file_block: u64, k: u64) -> BidPath {
    let direct = BLOCK_MAP_DIRECT as u64;
    if file_block < direct {
        #[allow(clippy::cast_possible_truncation)]
        return BidPath::Direct(file_block as usize);
    }
    let past_direct = file_block - direct;
    if past_direct < k {
        return BidPath::Indirect(past_direct);
    }
    let past_single = past_direct - k;
    if past_single < k * k {
        return BidPath::Double(past_single / k, past_single % k);
    }
    let past_double = past_single - k * k;
    if past_double < k * k * k {
        return BidPath::Triple(past_double / (k * k), (past_double / k) % k, past_double % k);
    }
    BidPath::OutOfRange
}

/// A regular file backed by the classic block map.
#[derive(Debug, Clone)]
pub struct BlockMapFile {
    ptrs: BlockPtrs,
    size: u64,
}

impl BlockMapFile {
    /// Decode the 15 pointers from the inode record.
    pub fn new(record: &InodeRecord) -> Result<Self> {
        let ptrs = BlockPtrs::parse_from_bytes(&record.data)?;
        Ok(Self {
            ptrs,
            size: record.size,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Resolve a file block to its physical block, `None` for a hole.
    ///
    /// A zero pointer anywhere along the indirection chain makes the whole
    /// subtree a hole.
    fn resolve(
        &self,
        dev: &dyn ByteDevice,
        block_size: BlockSize,
        file_block: u64,
    ) -> Result<Option<BlockNumber>> {
        let k = u64::from(block_size.get() / 4);

        let walk = |dev: &dyn ByteDevice, start: u32, indexes: &[u64]| -> Result<Option<BlockNumber>> {
            let mut current = u64::from(start);
            for &index in indexes {
                if current == 0 {
                    return Ok(None);
                }
                let block = read_block_vec(dev, BlockNumber(current), block_size)?;
                current = read_indirect_entry(&block, index)?.0;
            }
            Ok((current != 0).then_some(BlockNumber(current)))
        };

        match classify(file_block, k) {
            BidPath::Direct(slot) => {
                let phys = self.ptrs.direct[slot];
                Ok((phys != 0).then_some(BlockNumber(u64::from(phys))))
            }
            BidPath::Indirect(i) => walk(dev, self.ptrs.single_indirect, &[i]),
            BidPath::Double(i, j) => walk(dev, self.ptrs.double_indirect, &[i, j]),
            BidPath::Triple(i, j, l) => walk(dev, self.ptrs.triple_indirect, &[i, j, l]),
            BidPath::OutOfRange => Err(ExtError::Format(format!(
                "file block {file_block} beyond triple-indirect range"
            ))),
        }
    }

    /// Positioned read: proceeds block by block, concatenating into `dst`,
    /// zero-filling holes, until `dst` is full or EOF.
    pub fn read_at(
        &self,
        dev: &dyn ByteDevice,
        block_size: BlockSize,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let remaining_in_file = self.size - offset;
        let want = usize::try_from(remaining_in_file)
            .map_or(dst.len(), |remaining| dst.len().min(remaining));

        let bs = block_size.as_u64();
        let mut copied = 0_usize;
        while copied < want {
            let pos = offset + copied as u64;
            let file_block = pos / bs;
            let in_block = pos % bs;
            #[allow(clippy::cast_possible_truncation)]
            let chunk = ((bs - in_block) as usize).min(want - copied);

            match self.resolve(dev, block_size, file_block)? {
                Some(phys) => {
                    let byte = block_size
                        .block_to_byte(phys)
                        .and_then(|b| b.checked_add(in_block))
                        .ok_or_else(|| {
                            ExtError::Format(format!("block {phys} byte offset overflows u64"))
                        })?;
                    dev.read_exact_at(byte, &mut dst[copied..copied + chunk])?;
                }
                None => {
                    dst[copied..copied + chunk].fill(0);
                }
            }
            copied += chunk;
        }
        Ok(copied)
    }
}
