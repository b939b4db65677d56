#![forbid(unsafe_code)]
//! Read-only ext2/3/4 filesystem decoder.
//!
//! Given a seekable byte device holding an ext-family image, this crate
//! exposes the directory tree, file contents, and symlink targets to a
//! virtual-filesystem consumer:
//!
//! ```no_run
//! use roext::{MountOptions, mount};
//! use roext_block::FileByteDevice;
//! use std::sync::Arc;
//!
//! # fn main() -> roext_error::Result<()> {
//! let dev = Arc::new(FileByteDevice::open("/path/to/image")?);
//! let (fs, root) = mount(MountOptions::with_device(dev))?;
//! for entry in root.inode().iterate(&fs)? {
//!     let entry = entry?;
//!     println!("{} -> inode {}", entry.name_str(), entry.ino);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The decoder never writes. Dentries carry the refcounting surface the
//! consumer drives; the parent/child linkage between dentries is the
//! consumer's to maintain.

mod dentry;
mod fs;
mod inode;

pub use dentry::Dentry;
pub use fs::{Filesystem, MountOptions, mount};
pub use inode::{FileType, Inode};

pub use roext_dir::DirIter;
pub use roext_ondisk::{DirEntry, DirEntryType, GroupDesc, InodeRecord, Superblock};
pub use roext_types::InodeNumber;
