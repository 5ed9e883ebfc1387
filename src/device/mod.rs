//! Device Subsystem
//!
//! Provides block storage for cache-backed memory objects:
//! - block: the raw block device interface and in-memory/file devices
//! - bcache: the fixed-pool block cache over a block device

pub mod bcache;
pub mod block;

pub use bcache::{Bcache, BcacheStats, BlockFlags, BlockNode};
#[cfg(feature = "std")]
pub use block::FileDisk;
pub use block::{BlockDevice, RamDisk};
