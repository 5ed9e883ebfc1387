//! Virtual Memory Subsystem
//!
//! Provides memory objects and the bookkeeping around them:
//! - vm_page: page constants, the page pool and committed pages
//! - vm_object: resizable memory objects (paged, physical, cached)
//! - vm_mapping: the mapping set tying objects to address space regions
//! - vm_user: rights-checked handles, the entry points user requests use

pub mod vm_mapping;
pub mod vm_object;
pub mod vm_page;
pub mod vm_user;

pub use vm_mapping::{AddressRegion, MappingId, MappingSet, VmMapping};
pub use vm_object::{CachePolicy, RangeOp, VmObject, VmObjectId};
pub use vm_page::{PagePool, VmPage, PAGE_SIZE};
pub use vm_user::{Rights, VmoHandle, DEFAULT_VMO_RIGHTS};
