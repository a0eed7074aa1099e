//! Object layouts and the per-MDC layout index
//!
//! An [`ObjLayout`] describes where an object lives: the owning drive, the
//! starting zone and the zone count, plus the lifecycle state the metadata
//! core tracks for it. Layout placement is immutable after allocation; the
//! mutable lifecycle fields are atomics whose compound updates are guarded
//! by the owning slot's locks.
//!
//! [`LayoutMap`] is the ordered objid index; insertion never overwrites.

use std::collections::btree_map::{BTreeMap, Entry};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::objid::ObjId;

/// Layout state bit: the object has been committed
pub const LYT_COMMITTED: u8 = 1 << 0;

/// Layout state bit: the object has been removed (delete or abort)
pub const LYT_REMOVED: u8 = 1 << 1;

/// Base reference count of a live layout: one for the index, one for the
/// creating caller. The erase worker releases the final reference.
pub const REF_BASE: u32 = 2;

/// In-memory descriptor of one object's on-drive placement and state
pub struct ObjLayout {
    objid: ObjId,
    pdh: u16,
    zaddr: u64,
    zcnt: u32,
    gen: AtomicU64,
    state: AtomicU8,
    refcnt: AtomicU32,
    isdel: AtomicBool,
    // isolates payload readers from erase; see the slot lock hierarchy
    rwlock: RwLock<()>,
}

impl ObjLayout {
    pub fn new(objid: ObjId, pdh: u16, zaddr: u64, zcnt: u32, gen: u64) -> Arc<Self> {
        Arc::new(Self {
            objid,
            pdh,
            zaddr,
            zcnt,
            gen: AtomicU64::new(gen),
            state: AtomicU8::new(0),
            refcnt: AtomicU32::new(REF_BASE),
            isdel: AtomicBool::new(false),
            rwlock: RwLock::new(()),
        })
    }

    #[must_use]
    pub fn objid(&self) -> ObjId {
        self.objid
    }

    /// Handle of the drive holding this object
    #[must_use]
    pub fn pdh(&self) -> u16 {
        self.pdh
    }

    /// First zone of the object
    #[must_use]
    pub fn zaddr(&self) -> u64 {
        self.zaddr
    }

    /// Number of contiguous zones
    #[must_use]
    pub fn zcnt(&self) -> u32 {
        self.zcnt
    }

    /// Allocated capacity in bytes given the drive's zone size
    #[must_use]
    pub fn capacity(&self, zone_bytes: u64) -> u64 {
        u64::from(self.zcnt) * zone_bytes
    }

    #[must_use]
    pub fn gen(&self) -> u64 {
        self.gen.load(Ordering::Acquire)
    }

    /// Update the generation; caller holds the owning slot's compact lock
    pub fn set_gen(&self, gen: u64) {
        self.gen.store(gen, Ordering::Release);
    }

    #[must_use]
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state() & LYT_COMMITTED != 0
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.state() & LYT_REMOVED != 0
    }

    pub fn set_state_bits(&self, bits: u8) {
        self.state.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_state_bits(&self, bits: u8) {
        self.state.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Committed, not removed and not tombstoned
    #[must_use]
    pub fn is_visible(&self) -> bool {
        let state = self.state();
        state & LYT_COMMITTED != 0 && state & LYT_REMOVED == 0 && !self.is_del()
    }

    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Set the reference count; caller holds the owning slot's reflock
    pub fn set_refcnt(&self, val: u32) {
        self.refcnt.store(val, Ordering::Release);
    }

    pub fn inc_refcnt(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_refcnt(&self) {
        self.refcnt.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_del(&self) -> bool {
        self.isdel.load(Ordering::Acquire)
    }

    /// Set the delete tombstone; caller holds the owning slot's reflock
    pub fn set_del(&self, val: bool) {
        self.isdel.store(val, Ordering::Release);
    }

    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.rwlock.read()
    }

    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.rwlock.write()
    }
}

impl std::fmt::Debug for ObjLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjLayout")
            .field("objid", &self.objid)
            .field("pdh", &self.pdh)
            .field("zaddr", &self.zaddr)
            .field("zcnt", &self.zcnt)
            .field("gen", &self.gen())
            .field("state", &self.state())
            .field("refcnt", &self.refcnt())
            .field("isdel", &self.is_del())
            .finish()
    }
}

/// Ordered objid -> layout index
///
/// Iteration order is objid-ascending, which the compactor relies on to
/// produce deterministic logs.
#[derive(Default)]
pub struct LayoutMap {
    map: BTreeMap<ObjId, Arc<ObjLayout>>,
}

impl LayoutMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a layout
    ///
    /// Never overwrites: if the objid is already present, the existing
    /// layout is returned and the map is unchanged.
    pub fn insert(&mut self, layout: Arc<ObjLayout>) -> Option<Arc<ObjLayout>> {
        match self.map.entry(layout.objid()) {
            Entry::Vacant(e) => {
                e.insert(layout);
                None
            }
            Entry::Occupied(e) => Some(Arc::clone(e.get())),
        }
    }

    #[must_use]
    pub fn find(&self, objid: ObjId) -> Option<Arc<ObjLayout>> {
        self.map.get(&objid).cloned()
    }

    pub fn remove(&mut self, objid: ObjId) -> Option<Arc<ObjLayout>> {
        self.map.remove(&objid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ObjLayout>> {
        self.map.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
