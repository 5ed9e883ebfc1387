//! VM User Interface - Rights-checked handles to memory objects
//!
//! Requests from user space reach a memory object through a [`VmoHandle`].
//! The handle carries the rights it was granted and checks them before
//! forwarding to the object, which itself trusts its callers.

use alloc::sync::Arc;
use bitflags::bitflags;

use super::vm_mapping::{AddressRegion, VmMapping};
use super::vm_object::{RangeOp, VmObject, CACHE_POLICY_MASK};
use super::vm_page::PagePool;
use crate::config::DEFAULT_MAX_OBJECT_SIZE;
use crate::error::{Error, Result};

bitflags! {
    /// Handle rights
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rights: u32 {
        const DUPLICATE = 1 << 0;
        const TRANSFER = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const EXECUTE = 1 << 4;
        const MAP = 1 << 5;
        const GET_PROPERTY = 1 << 6;
        const SET_PROPERTY = 1 << 7;
    }
}

/// Rights a freshly created object handle carries
pub const DEFAULT_VMO_RIGHTS: Rights = Rights::all();

/// Capability to one memory object
#[derive(Debug, Clone)]
pub struct VmoHandle {
    object: Arc<VmObject>,
    rights: Rights,
}

impl VmoHandle {
    /// Wrap an existing object
    pub fn new(object: Arc<VmObject>, rights: Rights) -> Self {
        Self { object, rights }
    }

    /// Create a paged object and a handle with default rights
    ///
    /// No options are defined; any non-zero `options` is rejected.
    pub fn create(pool: &Arc<PagePool>, size: u64, options: u32) -> Result<Self> {
        if options != 0 {
            return Err(Error::InvalidArgs);
        }
        let object = VmObject::create_paged(pool, size, DEFAULT_MAX_OBJECT_SIZE)?;
        Ok(Self::new(object, DEFAULT_VMO_RIGHTS))
    }

    /// Rights held
    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// Underlying object
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    fn require(&self, rights: Rights) -> Result<()> {
        if self.rights.contains(rights) {
            Ok(())
        } else {
            log::trace!(
                "vmo {}: denied, need {:?} have {:?}",
                self.object.id().0,
                rights,
                self.rights
            );
            Err(Error::AccessDenied)
        }
    }

    /// Read at `offset`; needs `READ`
    pub fn read(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        self.require(Rights::READ)?;
        self.object.read(dst, offset)
    }

    /// Write at `offset`; needs `WRITE`
    pub fn write(&self, src: &[u8], offset: u64) -> Result<usize> {
        self.require(Rights::WRITE)?;
        self.object.write(src, offset)
    }

    /// Object size; anyone holding a handle may ask
    pub fn get_size(&self) -> u64 {
        self.object.size()
    }

    /// Resize; needs `WRITE`
    pub fn set_size(&self, size: u64) -> Result<()> {
        self.require(Rights::WRITE)?;
        self.object.set_size(size)
    }

    /// Range operation by raw code
    ///
    /// Commit and decommit need `WRITE`, lookup needs `READ`; cache
    /// maintenance needs nothing.
    pub fn op_range(&self, op: u32, offset: u64, len: u64, buffer: &mut [u8]) -> Result<()> {
        let op = RangeOp::from_raw(op)?;
        match op {
            RangeOp::Commit | RangeOp::Decommit => self.require(Rights::WRITE)?,
            RangeOp::Lookup => self.require(Rights::READ)?,
            _ => {}
        }
        self.object.range_op(op, offset, len, buffer)
    }

    /// Set the mapping cache policy; needs `WRITE | MAP`
    pub fn set_cache_policy(&self, policy: u32) -> Result<()> {
        self.require(Rights::WRITE | Rights::MAP)?;
        if policy & !CACHE_POLICY_MASK != 0 {
            return Err(Error::InvalidArgs);
        }
        self.object.set_mapping_cache_policy(policy)
    }

    /// Map part of the object into `region`; needs `MAP`
    pub fn map(
        &self,
        region: Arc<dyn AddressRegion>,
        base: u64,
        offset: u64,
        len: u64,
    ) -> Result<Arc<VmMapping>> {
        self.require(Rights::MAP)?;
        VmMapping::create(&self.object, region, base, offset, len)
    }

    /// New handle to the same object with `rights`; needs `DUPLICATE`
    ///
    /// Rights can only be narrowed.
    pub fn duplicate(&self, rights: Rights) -> Result<Self> {
        self.require(Rights::DUPLICATE)?;
        if !self.rights.contains(rights) {
            return Err(Error::InvalidArgs);
        }
        Ok(Self::new(Arc::clone(&self.object), rights))
    }
}
