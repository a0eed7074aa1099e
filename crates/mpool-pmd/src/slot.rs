//! Per-MDC slot state
//!
//! Each metadata container (MDC) owns: its open paired log and a scratch
//! pack buffer, the committed and uncommitted layout indexes, the uniq
//! counter with its checkpoint pointer, usage statistics, and the counters
//! the pre-compactor steers by.
//!
//! Lock roles (acquired in the order listed, per the pool lock hierarchy):
//! - `compactlock` serializes compaction against mutators of this MDC
//! - `uq` guards the uniq counter; `lckpt` is written under it plus the
//!   compact lock, and read lock-free by the compactor
//! - `cobj` (rwlock) guards the committed index, `uncobj` the uncommitted
//! - `reflock` guards refcount/tombstone updates of this MDC's layouts
//! - `stats` is a leaf lock for usage accounting

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use mpool_common::Result;
use parking_lot::{Mutex, RwLock};

use crate::layout::{LayoutMap, ObjLayout};
use crate::mdc::MetaLog;
use crate::objid::{ObjId, ObjType};
use crate::record::{MdcRecord, MAX_REC_LEN};
use crate::version::MdccVer;

/// Pre-compaction steering counters
///
/// `cr`/`up`/`del`/`er` count records appended since the last compaction;
/// `cobj` tracks committed objects; `len`/`cap` mirror the active mlog
/// usage reported by the media layer.
#[derive(Default)]
pub struct PcoCounters {
    pub cr: AtomicU32,
    pub up: AtomicU32,
    pub del: AtomicU32,
    pub er: AtomicU32,
    pub cobj: AtomicU32,
    pub len: AtomicU64,
    pub cap: AtomicU64,
}

impl PcoCounters {
    /// Records appended since the last compaction
    #[must_use]
    pub fn rec_total(&self) -> u64 {
        u64::from(self.cr.load(Ordering::Relaxed))
            + u64::from(self.up.load(Ordering::Relaxed))
            + u64::from(self.del.load(Ordering::Relaxed))
            + u64::from(self.er.load(Ordering::Relaxed))
    }
}

/// Per-MDC object usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MdcStats {
    pub mblock_cnt: u64,
    pub mblock_alen: u64,
    pub mlog_cnt: u64,
    pub mlog_alen: u64,
}

/// Allocation-scheduler state for one MDC
#[derive(Clone, Copy, Debug, Default)]
pub struct CreditInfo {
    /// Free bytes in the active mlog at the last credit update
    pub free: u64,
    /// Credits assigned out of [`MDC_TBL_SZ`](crate::mda::MDC_TBL_SZ)
    pub credit: u32,
}

/// The open log of a slot plus its scratch pack buffer
pub struct SlotLog {
    pub mdc: Option<Box<dyn MetaLog>>,
    recbuf: Box<[u8; MAX_REC_LEN]>,
}

impl SlotLog {
    /// Pack `rec` into the scratch buffer and append it
    pub fn append_rec(&mut self, rec: &MdcRecord, sync: bool) -> Result<()> {
        let mdc = self
            .mdc
            .as_mut()
            .ok_or_else(|| mpool_common::Error::critical("append to closed MDC log"))?;
        let plen = rec.pack_into(&mut self.recbuf[..])?;
        mdc.append(&self.recbuf[..plen], sync)
    }
}

/// All state of one metadata container
pub struct MdcSlot {
    slot: u8,
    pub compactlock: Mutex<()>,
    /// High-water uniq allocated in this slot
    pub uq: Mutex<u64>,
    lckpt: AtomicU64,
    /// Committed layouts, ordered by objid
    pub cobj: RwLock<LayoutMap>,
    /// Uncommitted layouts, ordered by objid
    pub uncobj: Mutex<LayoutMap>,
    pub reflock: Mutex<()>,
    pub log: Mutex<SlotLog>,
    pub mdccver: Mutex<MdccVer>,
    pub stats: Mutex<MdcStats>,
    pub pco: PcoCounters,
    pub credit: Mutex<CreditInfo>,
}

impl MdcSlot {
    #[must_use]
    pub fn new(slot: u8) -> Self {
        Self {
            slot,
            compactlock: Mutex::new(()),
            uq: Mutex::new(0),
            lckpt: AtomicU64::new(ObjId::new(0, ObjType::Undef, slot).as_u64()),
            cobj: RwLock::new(LayoutMap::new()),
            uncobj: Mutex::new(LayoutMap::new()),
            reflock: Mutex::new(()),
            log: Mutex::new(SlotLog {
                mdc: None,
                recbuf: Box::new([0u8; MAX_REC_LEN]),
            }),
            mdccver: Mutex::new(MdccVer::BASE),
            stats: Mutex::new(MdcStats::default()),
            pco: PcoCounters::default(),
            credit: Mutex::new(CreditInfo::default()),
        }
    }

    #[must_use]
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Last objid whose checkpoint was persisted
    #[must_use]
    pub fn lckpt(&self) -> ObjId {
        ObjId::from_u64(self.lckpt.load(Ordering::Acquire))
    }

    /// Record a persisted checkpoint; caller holds the uniq and compact locks
    pub fn set_lckpt(&self, objid: ObjId) {
        self.lckpt.store(objid.as_u64(), Ordering::Release);
    }

    /// Append one record, then refresh the mirrored log usage
    pub fn append_rec(&self, rec: &MdcRecord, sync: bool) -> Result<()> {
        let mut log = self.log.lock();
        let result = log.append_rec(rec, sync);
        if let Some(mdc) = log.mdc.as_ref() {
            let (len, cap) = mdc.usage();
            self.pco.len.store(len, Ordering::Relaxed);
            self.pco.cap.store(cap, Ordering::Relaxed);
        }
        result
    }

    /// Install a freshly opened log
    pub fn open_log(&self, mdc: Box<dyn MetaLog>) {
        let (len, cap) = mdc.usage();
        self.log.lock().mdc = Some(mdc);
        self.pco.len.store(len, Ordering::Relaxed);
        self.pco.cap.store(cap, Ordering::Relaxed);
    }

    /// Drop the open log, marking the slot closed
    pub fn close_log(&self) {
        self.log.lock().mdc = None;
        self.pco.len.store(0, Ordering::Relaxed);
        self.pco.cap.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_log_open(&self) -> bool {
        self.log.lock().mdc.is_some()
    }

    /// Re-mirror the active mlog usage into the steering counters
    pub fn refresh_usage(&self) {
        let log = self.log.lock();
        if let Some(mdc) = log.mdc.as_ref() {
            let (len, cap) = mdc.usage();
            self.pco.len.store(len, Ordering::Relaxed);
            self.pco.cap.store(cap, Ordering::Relaxed);
        }
    }

    /// Reset steering counters after a successful compaction
    pub fn pco_reset(&self, compacted: u32) {
        self.pco.cr.store(compacted, Ordering::Relaxed);
        self.pco.cobj.store(compacted, Ordering::Relaxed);
        self.pco.up.store(0, Ordering::Relaxed);
        self.pco.del.store(0, Ordering::Relaxed);
        self.pco.er.store(0, Ordering::Relaxed);
    }

    /// Account an allocated or replayed layout
    pub fn stats_add(&self, layout: &ObjLayout, zone_bytes: u64) {
        let cap = layout.capacity(zone_bytes);
        let mut stats = self.stats.lock();
        match layout.objid().objtype() {
            ObjType::Mblock => {
                stats.mblock_cnt += 1;
                stats.mblock_alen += cap;
            }
            ObjType::Mlog => {
                stats.mlog_cnt += 1;
                stats.mlog_alen += cap;
            }
            ObjType::Undef => {}
        }
    }

    /// Account a removed layout
    pub fn stats_sub(&self, layout: &ObjLayout, zone_bytes: u64) {
        let cap = layout.capacity(zone_bytes);
        let mut stats = self.stats.lock();
        match layout.objid().objtype() {
            ObjType::Mblock => {
                stats.mblock_cnt -= 1;
                stats.mblock_alen -= cap;
            }
            ObjType::Mlog => {
                stats.mlog_cnt -= 1;
                stats.mlog_alen -= cap;
            }
            ObjType::Undef => {}
        }
    }
}
