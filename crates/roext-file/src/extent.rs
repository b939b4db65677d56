//! Extent-tree reader.
//!
//! An extent tree is a shallow B-tree rooted in the inode's 60-byte data
//! area: internal nodes hold `(first_file_block, child_block)` index
//! entries, leaves hold extents mapping a run of file blocks to a run of
//! physical blocks. The root holds at most 4 entries; on-disk nodes fill a
//! block (fan-out up to 340 at 4 KiB).
//!
//! The whole tree is read eagerly at construction and validated. Each
//! `read_at` call is one descent: it locates the extent (or hole) covering
//! the starting offset and returns bytes from that extent only; the caller
//! re-enters at the advanced offset to cross into the next extent. Lazy
//! node loading could replace the eager build without changing `read_at`.

use roext_block::{ByteDevice, read_block_vec};
use roext_error::{ExtError, Result};
use roext_ondisk::{
    Extent, ExtentHeader, ExtentIdx, ExtentNodeEntries, InodeRecord, parse_extent_node,
};
use roext_types::{BlockNumber, BlockSize, ByteOffset, read_le_u16};
use tracing::trace;

/// Deepest tree this reader will follow (matches the format's own limit).
const MAX_EXTENT_DEPTH: u16 = 5;

/// The inode-resident root node holds at most a header plus 4 entries.
const ROOT_MAX_ENTRIES: u16 = 4;

/// One fully-loaded extent tree node. A node is a leaf or an index purely
/// by its own header depth; depth steps down by exactly one per level, so
/// every arm of the tree bottoms out at the same height.
#[derive(Debug, Clone)]
struct ExtentNode {
    entries: NodeEntries,
}

#[derive(Debug, Clone)]
enum NodeEntries {
    Leaf(Vec<Extent>),
    Index(Vec<(ExtentIdx, ExtentNode)>),
}

impl ExtentNode {
    /// First file block keyed by entry `i`.
    fn entry_key(&self, i: usize) -> u32 {
        match &self.entries {
            NodeEntries::Leaf(extents) => extents[i].logical_block,
            NodeEntries::Index(indexes) => indexes[i].0.logical_block,
        }
    }

    fn len(&self) -> usize {
        match &self.entries {
            NodeEntries::Leaf(extents) => extents.len(),
            NodeEntries::Index(indexes) => indexes.len(),
        }
    }

    /// Index of the last entry with `first_file_block <= file_block`, or
    /// `None` if the block precedes every entry.
    ///
    /// Binary search: fan-out reaches 340 entries per node.
    fn search(&self, file_block: u32) -> Option<usize> {
        let mut lo = 0_usize;
        let mut hi = self.len();
        // Invariant: entries[..lo] all have key <= file_block.
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry_key(mid) <= file_block {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }
}

/// A regular file backed by an extent tree.
#[derive(Debug, Clone)]
pub struct ExtentFile {
    root: ExtentNode,
    size: u64,
}

impl ExtentFile {
    /// Decode the root from the inode data area and eagerly load the rest
    /// of the tree from the device, validating every node.
    pub fn load(
        dev: &dyn ByteDevice,
        block_size: BlockSize,
        record: &InodeRecord,
    ) -> Result<Self> {
        // The data area fits a header plus 4 entries; a larger claim is
        // checked before the entry table is decoded so the failure names
        // the real problem rather than a short buffer.
        let root_entries = read_le_u16(&record.data, 2)?;
        if root_entries > ROOT_MAX_ENTRIES {
            return Err(ExtError::Format(format!(
                "extent root claims {root_entries} entries, inode data area fits at most {ROOT_MAX_ENTRIES}"
            )));
        }

        let (header, raw_entries) = parse_extent_node(&record.data)?;
        if header.depth > MAX_EXTENT_DEPTH {
            return Err(ExtError::Format(format!(
                "extent tree depth {} exceeds maximum {MAX_EXTENT_DEPTH}",
                header.depth
            )));
        }

        let entries = load_entries(dev, block_size, &header, raw_entries)?;
        trace!(
            target: "roext::file::extent",
            event = "tree_loaded",
            depth = header.depth,
            root_entries = header.entries
        );
        Ok(Self {
            root: ExtentNode { entries },
            size: record.size,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Positioned read: one descent, returning bytes from the extent (or
    /// hole) covering `offset`. `Ok(0)` at EOF; otherwise at least 1 byte.
    pub fn read_at(
        &self,
        dev: &dyn ByteDevice,
        block_size: BlockSize,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<usize> {
        if offset >= self.size || dst.is_empty() {
            return Ok(0);
        }
        let remaining_in_file = self.size - offset;
        let want = usize::try_from(remaining_in_file)
            .map_or(dst.len(), |remaining| dst.len().min(remaining));

        self.descend(&self.root, dev, block_size, offset, &mut dst[..want])
    }

    fn descend(
        &self,
        node: &ExtentNode,
        dev: &dyn ByteDevice,
        block_size: BlockSize,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<usize> {
        let file_block = u32::try_from(block_size.byte_to_block(offset))
            .map_err(|_| ExtError::Format("file block exceeds u32 range".to_owned()))?;

        // Every descent step narrows to a subtree whose key range contains
        // the file block, so an empty search result here means the tree
        // escaped validation in a corrupt state.
        let found = node
            .search(file_block)
            .expect("extent descent fell off the left edge of the tree");

        match &node.entries {
            NodeEntries::Index(indexes) => {
                let (_, child) = &indexes[found];
                self.descend(child, dev, block_size, offset, dst)
            }
            NodeEntries::Leaf(extents) => {
                let extent = &extents[found];
                if file_block < extent.logical_end() {
                    read_from_extent(extent, dev, block_size, offset, dst)
                } else {
                    // Gap past the last extent that starts at or before
                    // file_block: a hole. Zero at most one block; the next
                    // call re-searches from the advanced offset.
                    let in_block = block_size.offset_in_block(offset);
                    #[allow(clippy::cast_possible_truncation)]
                    let n = ((block_size.as_u64() - in_block) as usize).min(dst.len());
                    dst[..n].fill(0);
                    Ok(n)
                }
            }
        }
    }
}

/// Read as much of `dst` as this extent can serve, starting at `offset`.
///
/// Unwritten (preallocated) extents read as zeros.
fn read_from_extent(
    extent: &Extent,
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    offset: u64,
    dst: &mut [u8],
) -> Result<usize> {
    let bs = block_size.as_u64();
    let file_block = block_size.byte_to_block(offset);
    let block_in_extent = file_block - u64::from(extent.logical_block);

    let cur_phys = extent.physical_start + block_in_extent;
    let cur_off = cur_phys * bs + block_size.offset_in_block(offset);
    let end_off = (extent.physical_start + u64::from(extent.actual_len())) * bs;

    let available = usize::try_from(end_off - cur_off)
        .map_err(|_| ExtError::Format("extent span exceeds usize".to_owned()))?;
    let n = available.min(dst.len());

    if extent.is_unwritten() {
        dst[..n].fill(0);
    } else {
        dev.read_exact_at(ByteOffset(cur_off), &mut dst[..n])?;
    }
    Ok(n)
}

/// Load the entries of one node, recursing into children.
fn load_entries(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    header: &ExtentHeader,
    raw: ExtentNodeEntries,
) -> Result<NodeEntries> {
    match raw {
        ExtentNodeEntries::Leaf(extents) => Ok(NodeEntries::Leaf(extents)),
        ExtentNodeEntries::Index(indexes) => {
            let mut children = Vec::with_capacity(indexes.len());
            for idx in indexes {
                let child = load_child(dev, block_size, &idx, header.depth)?;
                children.push((idx, child));
            }
            Ok(NodeEntries::Index(children))
        }
    }
}

fn load_child(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    idx: &ExtentIdx,
    parent_depth: u16,
) -> Result<ExtentNode> {
    let block = read_block_vec(dev, BlockNumber(idx.child_block), block_size)?;
    let (header, raw_entries) = parse_extent_node(&block)?;

    // Depth must decrease by exactly one on the way down; this bounds the
    // recursion and rejects index cycles.
    if header.depth + 1 != parent_depth {
        return Err(ExtError::Format(format!(
            "extent child at block {} has depth {}, expected {}",
            idx.child_block,
            header.depth,
            parent_depth - 1
        )));
    }

    let entries = load_entries(dev, block_size, &header, raw_entries)?;
    let node = ExtentNode { entries };

    // The child's first key must agree with the index entry pointing at it.
    if node.len() > 0 && node.entry_key(0) != idx.logical_block {
        return Err(ExtError::Format(format!(
            "extent child at block {} starts at file block {}, index entry says {}",
            idx.child_block,
            node.entry_key(0),
            idx.logical_block
        )));
    }

    Ok(node)
}
