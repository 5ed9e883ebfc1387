//! Kern subsystem - Core kernel primitives
//!
//! Allocator support for fixed-size kernel object pools.

pub mod arena;

pub use arena::{Arena, ArenaStats};
