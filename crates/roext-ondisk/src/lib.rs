#![forbid(unsafe_code)]
//! On-disk structure decoding for the ext2/3/4 family.
//!
//! Everything in this crate works on byte slices and is little-endian at the
//! decoding boundary. No I/O happens here; callers read the right region off
//! the device and hand it over.

use roext_types::{
    BlockNumber, EXT_EXTENTS_FL, EXT_INDEX_FL, EXT_INLINE_DATA_FL, EXT_SUPER_MAGIC, GroupNumber,
    INODE_DATA_SIZE, InodeNumber, ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT,
    S_IFREG, S_IFSOCK, SUPERBLOCK_SIZE, block_size_from_log, ensure_slice, read_fixed,
    read_le_u16, read_le_u32, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Extent tree node header magic (`eh_magic`).
pub const EXT_EXTENT_MAGIC: u16 = 0xF30A;
/// `ee_len` values above this encode unwritten extents.
const EXT_INIT_MAX_LEN: u16 = 1_u16 << 15;

// ── Incompatible feature flags (s_feature_incompat) ─────────────────────────

pub const INCOMPAT_COMPRESSION: u32 = 0x0001;
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_RECOVER: u32 = 0x0004;
pub const INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const INCOMPAT_META_BG: u32 = 0x0010;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_MMP: u32 = 0x0100;
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const INCOMPAT_EA_INODE: u32 = 0x0400;
pub const INCOMPAT_DIRDATA: u32 = 0x1000;
pub const INCOMPAT_CSUM_SEED: u32 = 0x2000;
pub const INCOMPAT_LARGEDIR: u32 = 0x4000;
pub const INCOMPAT_INLINE_DATA: u32 = 0x8000;
pub const INCOMPAT_ENCRYPT: u32 = 0x0001_0000;
pub const INCOMPAT_CASEFOLD: u32 = 0x0002_0000;

/// Incompatible features a read-only decode can honour. Note that neither
/// FILETYPE nor EXTENTS is required: plain ext2 images carry both features
/// unset and still decode.
pub const INCOMPAT_ALLOWED_MASK: u32 = INCOMPAT_FILETYPE
    | INCOMPAT_EXTENTS
    | INCOMPAT_RECOVER
    | INCOMPAT_META_BG
    | INCOMPAT_64BIT
    | INCOMPAT_MMP
    | INCOMPAT_FLEX_BG
    | INCOMPAT_EA_INODE
    | INCOMPAT_DIRDATA
    | INCOMPAT_CSUM_SEED
    | INCOMPAT_LARGEDIR;

/// Incompatible features that change on-disk layout in ways this decoder
/// refuses to guess at.
pub const INCOMPAT_REJECT_MASK: u32 = INCOMPAT_COMPRESSION
    | INCOMPAT_JOURNAL_DEV
    | INCOMPAT_INLINE_DATA
    | INCOMPAT_ENCRYPT
    | INCOMPAT_CASEFOLD;

// ── Read-only compatible feature flags (s_feature_ro_compat) ────────────────

pub const RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed superblock. Immutable after mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub desc_size: u16,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    // ── Revision ─────────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,

    // ── State ────────────────────────────────────────────────────────────
    pub state: u16,
    pub mtime: u32,
    pub wtime: u32,

    // ── Checksums ────────────────────────────────────────────────────────
    pub checksum_seed: u32,
    pub checksum: u32,
}

/// Legacy (revision 0) filesystems have a fixed 128-byte inode record and no
/// `s_inode_size` field worth trusting.
const GOOD_OLD_REV: u32 = 0;
const GOOD_OLD_INODE_SIZE: u16 = 128;
const GOOD_OLD_FIRST_INO: u32 = 11;

impl Superblock {
    /// Parse a superblock from its 1024-byte on-disk region.
    ///
    /// Rejects a wrong magic up front; everything else decodes and is
    /// validated separately so callers can distinguish "not an ext image"
    /// from "an ext image we refuse".
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let feature_incompat = read_le_u32(region, 0x60)?;

        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        // s_blocks_count_hi is only meaningful with the 64-bit feature.
        let blocks_hi = if feature_incompat & INCOMPAT_64BIT != 0 {
            u64::from(read_le_u32(region, 0x150)?)
        } else {
            0
        };

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };

        let rev_level = read_le_u32(region, 0x4C)?;
        let (inode_size, first_ino) = if rev_level == GOOD_OLD_REV {
            (GOOD_OLD_INODE_SIZE, GOOD_OLD_FIRST_INO)
        } else {
            (read_le_u16(region, 0x58)?, read_le_u32(region, 0x54)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: blocks_lo | (blocks_hi << 32),
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,
            first_ino,
            desc_size: read_le_u16(region, 0xFE)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,

            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat,
            feature_ro_compat: read_le_u32(region, 0x64)?,

            state: read_le_u16(region, 0x3A)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,

            checksum_seed: read_le_u32(region, 0x270)?,
            checksum: read_le_u32(region, 0x3FC)?,
        })
    }

    #[must_use]
    pub fn has_incompat(&self, mask: u32) -> bool {
        (self.feature_incompat & mask) != 0
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: u32) -> bool {
        (self.feature_ro_compat & mask) != 0
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.has_incompat(INCOMPAT_64BIT)
    }

    /// Whether directory entries carry a file-type byte. When absent, byte 7
    /// of an entry is the high byte of `name_len` instead.
    #[must_use]
    pub fn dirent_has_file_type(&self) -> bool {
        self.has_incompat(INCOMPAT_FILETYPE)
    }

    #[must_use]
    pub fn has_metadata_csum(&self) -> bool {
        self.has_ro_compat(RO_COMPAT_METADATA_CSUM)
    }

    /// Group descriptor record size: 32 bytes, or `s_desc_size` (≥ 64) with
    /// the 64-bit feature.
    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.desc_size.max(64)
        } else {
            32
        }
    }

    /// Number of block groups: ⌈(blocks − first_data_block) / blocks_per_group⌉.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // group count is u32 on disk
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self
            .blocks_count
            .saturating_sub(u64::from(self.first_data_block));
        data_blocks.div_ceil(u64::from(self.blocks_per_group)) as u32
    }

    /// Byte offset of a group descriptor within the device.
    ///
    /// The descriptor table starts in the block after the one holding the
    /// superblock: block 2 for 1 KiB blocks, block 1 otherwise.
    #[must_use]
    pub fn group_desc_offset(&self, group: GroupNumber) -> Option<u64> {
        let gdt_start_block = if self.block_size == 1024 { 2_u64 } else { 1_u64 };
        let gdt_start_byte = gdt_start_block.checked_mul(u64::from(self.block_size))?;
        let desc_offset = u64::from(group.0).checked_mul(u64::from(self.group_desc_size()))?;
        gdt_start_byte.checked_add(desc_offset)
    }

    /// Locate an inode within its group's inode table.
    ///
    /// Returns `(group, index_in_group, byte_offset_in_inode_table)`; the
    /// caller adds the group's `inode_table` block to get the device offset.
    #[must_use]
    pub fn inode_table_offset(&self, ino: InodeNumber) -> (GroupNumber, u32, u64) {
        let group = roext_types::inode_to_group(ino, self.inodes_per_group);
        let index = roext_types::inode_index_in_group(ino, self.inodes_per_group);
        let byte_offset = u64::from(index) * u64::from(self.inode_size);
        (group, index, byte_offset)
    }

    /// Validate basic geometry: group sizes, inode record size, block count.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inode_size < 128 {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be >= 128",
            });
        }
        if !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two",
            });
        }
        if u64::from(self.inode_size) > u64::from(self.block_size) {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must not exceed block size",
            });
        }
        if u64::from(self.first_data_block) >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        Ok(())
    }

    /// Compute the crc32c seed used for metadata checksums.
    ///
    /// With `INCOMPAT_CSUM_SEED` the precomputed `s_checksum_seed` is used;
    /// otherwise the seed is `crc32c_append(!0, uuid)`.
    #[must_use]
    pub fn csum_seed(&self) -> u32 {
        if self.has_incompat(INCOMPAT_CSUM_SEED) {
            self.checksum_seed
        } else {
            crc32c::crc32c_append(!0_u32, &self.uuid)
        }
    }

    /// Validate the superblock's own CRC32C over bytes `[0, 0x3FC)` of the
    /// raw region. A no-op unless `metadata_csum` is set.
    pub fn validate_checksum(&self, raw_region: &[u8]) -> Result<(), ParseError> {
        if !self.has_metadata_csum() {
            return Ok(());
        }
        if raw_region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: raw_region.len(),
            });
        }
        let computed = crc32c::crc32c_append(!0_u32, &raw_region[..0x3FC]);
        if computed != self.checksum {
            return Err(ParseError::InvalidField {
                field: "s_checksum",
                reason: "superblock CRC32C mismatch",
            });
        }
        Ok(())
    }
}

// ── Block group descriptors ─────────────────────────────────────────────────

/// Parsed block group descriptor. The field a read path actually needs is
/// `inode_table`; the rest is kept for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
    pub checksum: u16,
}

impl GroupDesc {
    /// Parse a descriptor record. `desc_size` selects the 32-byte or 64-byte
    /// layout; the 32-byte case is zero-extended.
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let desc_size_usize = usize::from(desc_size);
        if desc_size_usize < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        if bytes.len() < desc_size_usize {
            return Err(ParseError::InsufficientData {
                needed: desc_size_usize,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let block_bitmap_lo = u64::from(read_le_u32(bytes, 0x00)?);
        let inode_bitmap_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let inode_table_lo = u64::from(read_le_u32(bytes, 0x08)?);
        let free_blocks_lo = u32::from(read_le_u16(bytes, 0x0C)?);
        let free_inodes_lo = u32::from(read_le_u16(bytes, 0x0E)?);
        let used_dirs_lo = u32::from(read_le_u16(bytes, 0x10)?);
        let flags = read_le_u16(bytes, 0x12)?;
        let checksum = read_le_u16(bytes, 0x1E)?;

        if desc_size_usize >= 64 {
            let block_bitmap_hi = u64::from(read_le_u32(bytes, 0x20)?);
            let inode_bitmap_hi = u64::from(read_le_u32(bytes, 0x24)?);
            let inode_table_hi = u64::from(read_le_u32(bytes, 0x28)?);
            let free_blocks_hi = u32::from(read_le_u16(bytes, 0x2C)?);
            let free_inodes_hi = u32::from(read_le_u16(bytes, 0x2E)?);
            let used_dirs_hi = u32::from(read_le_u16(bytes, 0x30)?);

            Ok(Self {
                block_bitmap: block_bitmap_lo | (block_bitmap_hi << 32),
                inode_bitmap: inode_bitmap_lo | (inode_bitmap_hi << 32),
                inode_table: inode_table_lo | (inode_table_hi << 32),
                free_blocks_count: free_blocks_lo | (free_blocks_hi << 16),
                free_inodes_count: free_inodes_lo | (free_inodes_hi << 16),
                used_dirs_count: used_dirs_lo | (used_dirs_hi << 16),
                flags,
                checksum,
            })
        } else {
            Ok(Self {
                block_bitmap: block_bitmap_lo,
                inode_bitmap: inode_bitmap_lo,
                inode_table: inode_table_lo,
                free_blocks_count: free_blocks_lo,
                free_inodes_count: free_inodes_lo,
                used_dirs_count: used_dirs_lo,
                flags,
                checksum,
            })
        }
    }
}

/// Offset of `bg_checksum` within a group descriptor.
const GD_CHECKSUM_OFFSET: usize = 0x1E;

/// Verify a group descriptor's CRC32C checksum (`metadata_csum` mode).
///
/// The checksum covers the little-endian group number, the descriptor bytes
/// before the checksum field, a zeroed checksum field, and the rest of the
/// record; the stored value is the low 16 bits.
pub fn verify_group_desc_checksum(
    raw_gd: &[u8],
    csum_seed: u32,
    group_number: u32,
    desc_size: u16,
) -> Result<(), ParseError> {
    let ds = usize::from(desc_size);
    if raw_gd.len() < ds {
        return Err(ParseError::InsufficientData {
            needed: ds,
            offset: 0,
            actual: raw_gd.len(),
        });
    }

    let le_group = group_number.to_le_bytes();
    let mut csum = crc32c::crc32c_append(csum_seed, &le_group);
    csum = crc32c::crc32c_append(csum, &raw_gd[..GD_CHECKSUM_OFFSET]);
    csum = crc32c::crc32c_append(csum, &[0, 0]);
    let after_csum = GD_CHECKSUM_OFFSET + 2;
    if after_csum < ds {
        csum = crc32c::crc32c_append(csum, &raw_gd[after_csum..ds]);
    }

    #[allow(clippy::cast_possible_truncation)]
    let expected = (csum & 0xFFFF) as u16;
    let stored = read_le_u16(raw_gd, GD_CHECKSUM_OFFSET)?;

    if expected != stored {
        return Err(ParseError::InvalidField {
            field: "bg_checksum",
            reason: "group descriptor CRC32C mismatch",
        });
    }
    Ok(())
}

// ── Inode records ───────────────────────────────────────────────────────────

/// File type decoded from the mode's high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDev,
    BlockDev,
    Socket,
    Unknown,
}

impl FileKind {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFIFO => Self::Fifo,
            S_IFCHR => Self::CharDev,
            S_IFBLK => Self::BlockDev,
            S_IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

/// Decoded inode record. Immutable after construction.
///
/// Legacy records are 128 bytes; larger records append extended timestamps
/// behind `i_extra_isize`. The 60-byte `data` area holds, depending on the
/// inode, block pointers, the extent tree root, inline file data, or a fast
/// symlink target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    pub blocks: u64,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u64,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub crtime: u32,

    pub extra_isize: u16,

    /// Raw `i_block[0..15]` bytes; always `INODE_DATA_SIZE` long.
    pub data: Vec<u8>,
}

impl InodeRecord {
    /// Parse an inode record.
    ///
    /// `bytes` must hold the full record (`s_inode_size` bytes). A 128-byte
    /// buffer decodes the legacy layout only; larger buffers also decode the
    /// extension, honouring `i_extra_isize`.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let legacy = bytes.len() == 128;

        let mode = read_le_u16(bytes, 0x00)?;
        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);

        // The legacy layout stores a 32-bit size; the extended layout splits
        // a 64-bit size across i_size_lo and i_size_high.
        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size = if legacy {
            size_lo
        } else {
            size_lo | (u64::from(read_le_u32(bytes, 0x6C)?) << 32)
        };

        let blocks_lo = u64::from(read_le_u32(bytes, 0x1C)?);

        // Linux osd2 area: blocks_hi, file_acl_hi, uid_hi, gid_hi.
        let blocks_hi = u64::from(read_le_u16(bytes, 0x74)?);
        let file_acl_hi = u64::from(read_le_u16(bytes, 0x76)?);
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        let (extra_isize, crtime) = if legacy {
            (0, 0)
        } else {
            let extra_isize = read_le_u16(bytes, 0x80)?;
            let extra_end = 128_usize + usize::from(extra_isize);
            let crtime = if extra_end >= 0x94 && bytes.len() >= 0x94 {
                read_le_u32(bytes, 0x90)?
            } else {
                0
            };
            (extra_isize, crtime)
        };

        Ok(Self {
            mode,
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: blocks_lo | (blocks_hi << 32),
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: u64::from(read_le_u32(bytes, 0x68)?) | (file_acl_hi << 32),

            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            crtime,

            extra_isize,

            data: read_fixed::<INODE_DATA_SIZE>(bytes, 0x28)?.to_vec(),
        })
    }

    #[must_use]
    pub fn file_kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Permission bits (mode with the type bits masked off).
    #[must_use]
    pub fn perm(&self) -> u16 {
        self.mode & !S_IFMT
    }

    #[must_use]
    pub fn uses_extents(&self) -> bool {
        (self.flags & EXT_EXTENTS_FL) != 0
    }

    #[must_use]
    pub fn has_inline_data(&self) -> bool {
        (self.flags & EXT_INLINE_DATA_FL) != 0
    }

    #[must_use]
    pub fn is_htree_dir(&self) -> bool {
        (self.flags & EXT_INDEX_FL) != 0
    }
}

// ── Extent tree records ─────────────────────────────────────────────────────

/// Size of the extent header and of each entry (`ext4_extent` /
/// `ext4_extent_idx` are both 12 bytes).
pub const EXTENT_RECORD_SIZE: usize = 12;

/// `ext4_extent_header`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
    pub generation: u32,
}

/// Leaf entry: a run of `actual_len()` file blocks starting at
/// `logical_block`, stored contiguously from `physical_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub logical_block: u32,
    pub raw_len: u16,
    pub physical_start: u64,
}

impl Extent {
    /// Whether this extent is preallocated-but-unwritten (reads as zeros).
    #[must_use]
    pub fn is_unwritten(self) -> bool {
        self.raw_len > EXT_INIT_MAX_LEN
    }

    #[must_use]
    pub fn actual_len(self) -> u16 {
        if self.raw_len <= EXT_INIT_MAX_LEN {
            self.raw_len
        } else {
            self.raw_len - EXT_INIT_MAX_LEN
        }
    }

    /// First file block past this extent.
    #[must_use]
    pub fn logical_end(self) -> u32 {
        self.logical_block.saturating_add(u32::from(self.actual_len()))
    }
}

/// Internal entry: all file blocks ≥ `logical_block` (up to the next index
/// entry) live under the node at `child_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIdx {
    pub logical_block: u32,
    pub child_block: u64,
}

/// Entries of one decoded extent node: leaves at depth 0, indexes above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentNodeEntries {
    Leaf(Vec<Extent>),
    Index(Vec<ExtentIdx>),
}

/// Parse one extent node (header + entries) from a node-sized region: the
/// 60-byte inode data area for the root, a full block otherwise.
pub fn parse_extent_node(bytes: &[u8]) -> Result<(ExtentHeader, ExtentNodeEntries), ParseError> {
    if bytes.len() < EXTENT_RECORD_SIZE {
        return Err(ParseError::InsufficientData {
            needed: EXTENT_RECORD_SIZE,
            offset: 0,
            actual: bytes.len(),
        });
    }

    let header = ExtentHeader {
        magic: read_le_u16(bytes, 0x00)?,
        entries: read_le_u16(bytes, 0x02)?,
        max_entries: read_le_u16(bytes, 0x04)?,
        depth: read_le_u16(bytes, 0x06)?,
        generation: read_le_u32(bytes, 0x08)?,
    };

    if header.magic != EXT_EXTENT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(EXT_EXTENT_MAGIC),
            actual: u64::from(header.magic),
        });
    }

    if header.entries > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }

    let entries_len = usize::from(header.entries);
    let needed = EXTENT_RECORD_SIZE
        .checked_add(entries_len.saturating_mul(EXTENT_RECORD_SIZE))
        .ok_or(ParseError::InvalidField {
            field: "eh_entries",
            reason: "overflow",
        })?;

    if bytes.len() < needed {
        return Err(ParseError::InsufficientData {
            needed,
            offset: EXTENT_RECORD_SIZE,
            actual: bytes.len().saturating_sub(EXTENT_RECORD_SIZE),
        });
    }

    if header.depth == 0 {
        let mut extents = Vec::with_capacity(entries_len);
        for idx in 0..entries_len {
            let base = EXTENT_RECORD_SIZE + idx * EXTENT_RECORD_SIZE;
            let logical_block = read_le_u32(bytes, base)?;
            let raw_len = read_le_u16(bytes, base + 4)?;
            let start_hi = u64::from(read_le_u16(bytes, base + 6)?);
            let start_lo = u64::from(read_le_u32(bytes, base + 8)?);

            extents.push(Extent {
                logical_block,
                raw_len,
                physical_start: start_lo | (start_hi << 32),
            });
        }
        Ok((header, ExtentNodeEntries::Leaf(extents)))
    } else {
        let mut indexes = Vec::with_capacity(entries_len);
        for idx in 0..entries_len {
            let base = EXTENT_RECORD_SIZE + idx * EXTENT_RECORD_SIZE;
            let logical_block = read_le_u32(bytes, base)?;
            let child_lo = u64::from(read_le_u32(bytes, base + 4)?);
            let child_hi = u64::from(read_le_u16(bytes, base + 8)?);

            indexes.push(ExtentIdx {
                logical_block,
                child_block: child_lo | (child_hi << 32),
            });
        }
        Ok((header, ExtentNodeEntries::Index(indexes)))
    }
}

// ── Block map pointers ──────────────────────────────────────────────────────

/// Number of direct block slots in the inode data area.
pub const BLOCK_MAP_DIRECT: usize = 12;
/// Slot index of the single-indirect pointer.
pub const BLOCK_MAP_SINGLE: usize = 12;
/// Slot index of the double-indirect pointer.
pub const BLOCK_MAP_DOUBLE: usize = 13;
/// Slot index of the triple-indirect pointer.
pub const BLOCK_MAP_TRIPLE: usize = 14;

/// The 15 block pointers of a classic block-map inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPtrs {
    pub direct: [u32; BLOCK_MAP_DIRECT],
    pub single_indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
}

impl BlockPtrs {
    /// Decode the 15 little-endian pointers from the inode data area.
    pub fn parse_from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, 60)?;
        let mut direct = [0_u32; BLOCK_MAP_DIRECT];
        for (slot, out) in direct.iter_mut().enumerate() {
            *out = read_le_u32(data, slot * 4)?;
        }
        Ok(Self {
            direct,
            single_indirect: read_le_u32(data, BLOCK_MAP_SINGLE * 4)?,
            double_indirect: read_le_u32(data, BLOCK_MAP_DOUBLE * 4)?,
            triple_indirect: read_le_u32(data, BLOCK_MAP_TRIPLE * 4)?,
        })
    }
}

/// Read entry `index` of an on-disk indirect block (an array of
/// `block_size / 4` little-endian block numbers).
pub fn read_indirect_entry(block: &[u8], index: u64) -> Result<BlockNumber, ParseError> {
    let offset = usize::try_from(index.checked_mul(4).ok_or(ParseError::InvalidField {
        field: "indirect_index",
        reason: "overflow",
    })?)
    .map_err(|_| ParseError::IntegerConversion {
        field: "indirect_index",
    })?;
    Ok(BlockNumber(u64::from(read_le_u32(block, offset)?)))
}

// ── Directory entries ───────────────────────────────────────────────────────

/// File type byte carried in directory entries (filetype feature only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DirEntryType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl DirEntryType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// Sentinel `file_type` value marking a directory-block checksum tail.
const FT_DIR_CSUM: u8 = 0xDE;

/// A parsed directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub rec_len: u16,
    pub file_type: DirEntryType,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// A checksum tail at the end of an ext4 directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryTail {
    pub checksum: u32,
}

/// Parse all live directory entries from one directory data block.
///
/// Entries advance by `rec_len`; slots with inode 0 are deleted and skipped.
/// `has_file_type` reflects the filetype incompat feature: when unset, byte
/// 7 of each entry is the high byte of a 16-bit `name_len` rather than a
/// type code. Returns the entries plus the checksum tail if one terminates
/// the block.
pub fn parse_dir_block(
    block: &[u8],
    has_file_type: bool,
) -> Result<(Vec<DirEntry>, Option<DirEntryTail>), ParseError> {
    let mut entries = Vec::new();
    let mut tail = None;
    let mut offset = 0_usize;

    while offset + 8 <= block.len() {
        let ino = read_le_u32(block, offset)?;
        let rec_len = read_le_u16(block, offset + 4)?;
        let name_len_lo = ensure_slice(block, offset + 6, 1)?[0];
        let byte7 = ensure_slice(block, offset + 7, 1)?[0];

        let (name_len, file_type) = if has_file_type {
            (usize::from(name_len_lo), DirEntryType::from_raw(byte7))
        } else {
            (
                usize::from(u16::from_le_bytes([name_len_lo, byte7])),
                DirEntryType::Unknown,
            )
        };

        // rec_len governs the advance: it must cover the 8-byte header and
        // stay inside the block.
        if rec_len < 8 {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "directory entry rec_len < 8",
            });
        }
        let entry_end =
            offset
                .checked_add(usize::from(rec_len))
                .ok_or(ParseError::InvalidField {
                    field: "de_rec_len",
                    reason: "overflow",
                })?;
        if entry_end > block.len() {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "directory entry extends past block boundary",
            });
        }

        // Checksum tail: inode=0, name_len=0, file_type=0xDE, rec_len=12.
        if has_file_type && ino == 0 && name_len_lo == 0 && byte7 == FT_DIR_CSUM && rec_len == 12 {
            if offset + 12 <= block.len() {
                tail = Some(DirEntryTail {
                    checksum: read_le_u32(block, offset + 8)?,
                });
            }
            break;
        }

        // Deleted slot.
        if ino == 0 {
            offset = entry_end;
            continue;
        }

        let name_end = offset + 8 + name_len;
        if name_end > entry_end {
            return Err(ParseError::InvalidField {
                field: "de_name_len",
                reason: "name extends past rec_len",
            });
        }
        let name = block[offset + 8..name_end].to_vec();

        entries.push(DirEntry {
            ino: InodeNumber(ino),
            rec_len,
            file_type,
            name,
        });

        offset = entry_end;
    }

    Ok((entries, tail))
}
