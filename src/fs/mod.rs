//! Filesystem support
//!
//! The on-disk layout contract the block cache is formatted with.

pub mod layout;

pub use layout::{mkfs, mount, Superblock};
