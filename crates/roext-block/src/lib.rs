#![forbid(unsafe_code)]
//! Read-only block device layer.
//!
//! Provides the `ByteDevice` trait for positioned (pread-style) reads plus
//! file- and memory-backed implementations. Decoders above this layer read
//! whole blocks or fixed-layout regions and never write.

use roext_error::{ExtError, Result};
use roext_types::{BlockNumber, BlockSize, ByteOffset, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset reads (pread semantics).
///
/// Implementations are position-stateless: concurrent `read_exact_at` calls
/// never interfere, so callers need no lock for device access.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// A read that would run past the end of the device is an error; short
    /// reads from the backing store surface as `ExtError::Io`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;
}

fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let len_u64 =
        u64::try_from(len).map_err(|_| ExtError::Format("read length overflows u64".to_owned()))?;
    let end = offset
        .0
        .checked_add(len_u64)
        .ok_or_else(|| ExtError::Format("read range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(ExtError::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`-style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. The file is opened read-only; this layer
/// has no write path.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        trace!(
            target: "roext::block",
            event = "pread",
            offset = offset.0,
            len = buf.len()
        );
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }
}

/// Memory-backed byte device over an immutable image.
///
/// Used by tests and by consumers that already hold the image in memory.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset.0)
            .map_err(|_| ExtError::Format("offset exceeds addressable range".to_owned()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read `len` bytes at `offset` into a fresh buffer.
pub fn read_vec(dev: &dyn ByteDevice, offset: ByteOffset, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

/// Read one filesystem block into a fresh buffer.
pub fn read_block_vec(
    dev: &dyn ByteDevice,
    block: BlockNumber,
    block_size: BlockSize,
) -> Result<Vec<u8>> {
    let offset = block_size
        .block_to_byte(block)
        .ok_or_else(|| ExtError::Format(format!("block {block} byte offset overflows u64")))?;
    let len = usize::try_from(block_size.get())
        .map_err(|_| ExtError::Format("block size does not fit usize".to_owned()))?;
    read_vec(dev, offset, len)
}

/// Read the raw 1024-byte superblock region at device offset 1024.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<Vec<u8>> {
    read_vec(
        dev,
        ByteOffset(SUPERBLOCK_OFFSET as u64),
        SUPERBLOCK_SIZE,
    )
}
