//! The pool handle
//!
//! [`Mpool`] is the public surface of the metadata core. It wraps the
//! shared [`MpoolCore`] that the background pre-compactor and the erase
//! workers also hold, and forwards every operation to the component that
//! owns it. Dropping an `Mpool` without deactivating stops the background
//! threads but leaves the media as-is, which is exactly what a crash does.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mpool_common::{MediaClass, PmdParams, PoolConfig, Result};
use parking_lot::{Condvar, Mutex};

use crate::device::DeviceTable;
use crate::layout::ObjLayout;
use crate::mda::Mda;
use crate::mdc::{Mdc0Image, MdcStore, ObjectIo};
use crate::erase::EraseQueue;
use crate::objid::{ObjId, ObjType};
use crate::ops::ObjCapacity;

/// Pre-compactor control block
pub(crate) struct PcoCtl {
    /// Next-MDC-to-compact cursor
    pub nmtoc: AtomicU32,
    pub stop: Mutex<bool>,
    pub wake: Condvar,
    pub handle: Mutex<Option<JoinHandle<()>>>,
}

impl PcoCtl {
    fn new() -> Self {
        Self {
            nmtoc: AtomicU32::new(0),
            stop: Mutex::new(false),
            wake: Condvar::new(),
            handle: Mutex::new(None),
        }
    }
}

/// Shared state of one activated pool
pub struct MpoolCore {
    pub(crate) name: String,
    pub(crate) params: PmdParams,
    pub(crate) cfg: Mutex<PoolConfig>,
    pub(crate) devices: Arc<DeviceTable>,
    pub(crate) mda: Mda,
    pub(crate) store: Arc<dyn MdcStore>,
    pub(crate) io: Arc<dyn ObjectIo>,
    pub(crate) eraser: EraseQueue,
    /// In-memory MDC0 superblock image
    pub(crate) sbimage: Mutex<Mdc0Image>,
    pub(crate) pco: PcoCtl,
    /// Serializes MDC allocation, capacity reporting and deactivation
    pub(crate) serial: Mutex<()>,
}

impl MpoolCore {
    pub(crate) fn new(
        name: String,
        params: PmdParams,
        cfg: PoolConfig,
        drives: Vec<(String, mpool_common::DriveParms)>,
        store: Arc<dyn MdcStore>,
        io: Arc<dyn ObjectIo>,
    ) -> Self {
        Self {
            name,
            params,
            cfg: Mutex::new(cfg),
            devices: Arc::new(DeviceTable::new(drives)),
            mda: Mda::new(),
            store,
            io,
            eraser: EraseQueue::new(),
            sbimage: Mutex::new(Mdc0Image::default()),
            pco: PcoCtl::new(),
            serial: Mutex::new(()),
        }
    }
}

/// Aggregate object usage across all user MDCs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MpoolUsage {
    pub mblock_cnt: u64,
    pub mlog_cnt: u64,
    pub mblock_alen: u64,
    pub mlog_alen: u64,
    /// Total allocated bytes
    pub alen: u64,
}

/// An activated pool
pub struct Mpool {
    pub(crate) core: Arc<MpoolCore>,
    deactivated: AtomicBool,
}

impl std::fmt::Debug for Mpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpool").field("name", &self.core.name).finish()
    }
}

impl Mpool {
    pub(crate) fn from_core(core: Arc<MpoolCore>) -> Self {
        Self {
            core,
            deactivated: AtomicBool::new(false),
        }
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Allocate a new object
    pub fn obj_alloc(
        &self,
        otype: ObjType,
        ocap: ObjCapacity,
        mclassp: MediaClass,
        best_effort: bool,
    ) -> Result<Arc<ObjLayout>> {
        self.core
            .obj_alloc_cmn(None, otype, ocap, mclassp, best_effort, false)
    }

    /// Re-allocate a previously allocated but uncommitted object id
    pub fn obj_realloc(
        &self,
        objid: ObjId,
        ocap: ObjCapacity,
        mclassp: MediaClass,
        best_effort: bool,
    ) -> Result<Arc<ObjLayout>> {
        if objid.slot() == 0 || !objid.is_user_type() {
            return Err(mpool_common::Error::invalid_arg(
                "re-allocation is only authorized for application objects",
            ));
        }
        self.core
            .obj_alloc_cmn(Some(objid), objid.objtype(), ocap, mclassp, best_effort, true)
    }

    /// Persist an allocated object
    pub fn obj_commit(&self, layout: &Arc<ObjLayout>) -> Result<()> {
        self.core.obj_commit(layout)
    }

    /// Discard an uncommitted object
    pub fn obj_abort(&self, layout: &Arc<ObjLayout>) -> Result<()> {
        self.core.obj_abort(layout)
    }

    /// Delete a committed object
    pub fn obj_delete(&self, layout: &Arc<ObjLayout>) -> Result<()> {
        self.core.obj_delete(layout)
    }

    /// Record a new erase generation for a committed mlog
    pub fn obj_erase(&self, layout: &Arc<ObjLayout>, gen: u64) -> Result<()> {
        self.core.obj_erase(layout, gen)
    }

    /// Take a reference on a layout
    pub fn obj_get(&self, layout: &ObjLayout) -> Result<()> {
        self.core.obj_get(layout)
    }

    /// Release a reference on a layout
    pub fn obj_put(&self, layout: &ObjLayout) {
        self.core.obj_put(layout);
    }

    /// Look an object up by id and take a reference on it
    pub fn obj_find_get(&self, objid: ObjId) -> Result<Arc<ObjLayout>> {
        self.core.obj_find_get(objid)
    }

    /// Allocate a new metadata container
    pub fn mdc_alloc(&self, mincap: u64, iter: u32) -> Result<()> {
        self.core.mdc_alloc(mincap, iter)
    }

    /// (max MDC index, user MDC capacity, MDC0 capacity)
    #[must_use]
    pub fn mdc_cap(&self) -> (u64, u64, u64) {
        self.core.mdc_cap()
    }

    /// Persist a drive configuration record
    pub fn prop_mcconfig(&self, pdh: u16) -> Result<()> {
        self.core.prop_mcconfig(pdh, false)
    }

    /// Persist and apply a media class spare percentage
    pub fn prop_mcspare(&self, mclassp: MediaClass, spzone: u8) -> Result<()> {
        self.core.prop_mcspare(mclassp, spzone, false)
    }

    /// Persist the pool configuration
    pub fn prop_mpconfig(&self, cfg: &PoolConfig) -> Result<()> {
        self.core.prop_mpconfig(cfg, false)
    }

    /// Start the periodic pre-compaction task
    pub fn precompact_start(&self) {
        MpoolCore::precompact_start(&self.core);
    }

    /// Cancel the pre-compaction task and wait for it
    pub fn precompact_stop(&self) {
        self.core.precompact_stop();
    }

    /// Aggregate object usage across user MDCs
    #[must_use]
    pub fn usage(&self) -> MpoolUsage {
        self.core.usage()
    }

    /// Close the pool: stop background work, drain erases, close every MDC
    pub fn deactivate(self) -> Result<()> {
        self.deactivated.store(true, Ordering::Release);
        self.core.precompact_stop();
        self.core.eraser.flush();
        self.core.eraser.stop();
        let _serial = self.core.serial.lock();
        self.core.mda_free();
        Ok(())
    }
}

impl Drop for Mpool {
    fn drop(&mut self) {
        if !self.deactivated.load(Ordering::Acquire) {
            // not a clean shutdown: stop threads, leave media untouched
            self.core.precompact_stop();
            self.core.eraser.abandon();
        }
    }
}

/// Convert an object id to the tagged handle form handed to clients
#[must_use]
pub fn objid_to_uhandle(objid: ObjId) -> u64 {
    objid.to_uhandle()
}

/// Convert a client handle back to an object id
pub fn uhandle_to_objid(uhandle: u64) -> Result<ObjId> {
    ObjId::from_uhandle(uhandle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestPool;
    use mpool_common::Error;

    #[test]
    fn test_uhandle_roundtrip() {
        let objid = ObjId::new(17, ObjType::Mblock, 2);
        let uhandle = objid_to_uhandle(objid);
        assert_eq!(uhandle_to_objid(uhandle).unwrap(), objid);
        assert!(matches!(
            uhandle_to_objid(objid.as_u64()),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn test_pool_name_and_usage_empty() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();
        assert_eq!(mp.name(), "mp-test");
        assert_eq!(mp.usage(), MpoolUsage::default());
        mp.deactivate().unwrap();
    }

    #[test]
    fn test_drop_without_deactivate_is_safe() {
        let tp = TestPool::new(64, 64 * 1024);
        {
            let mp = tp.create();
            mp.precompact_start();
            // dropped while background work is live
        }
        // the media is still activatable
        let mp = tp.reactivate().unwrap();
        mp.deactivate().unwrap();
    }
}
