//! Provisioning of ext4 base images from container image content.
//!
//! An image goes through three stages: a sparse backing file is allocated and formatted
//! ([`builder`]), the archive is extracted into it through a loop mount ([`populate`]), and
//! the filesystem is shrunk to its minimum size ([`shrink`]).  [`provision`] runs them in
//! order.  Every external tool sits behind a trait in [`tools`], [`loopdev`], [`extract`] or
//! [`source`], so the stages can be driven by fakes in tests.

pub mod builder;
pub mod error;
pub mod extract;
pub mod image;
pub mod loopdev;
pub mod parse;
pub mod populate;
pub mod provision;
pub mod release;
pub mod shrink;
pub mod size;
pub mod source;
pub mod tools;


pub use error::{Error, Result};

/// Filesystem block size.  mkfs.ext4, resize2fs block counts and the final truncation all
/// use this unit.
pub const BLOCK_SIZE: u64 = 4096;

/// On-disk inode size passed to mkfs.ext4.
pub const INODE_SIZE: u64 = 256;
