//! Pre-compactor and MDC allocation scheduler
//!
//! A periodic task bounds worst-case commit latency by compacting MDCs
//! before they fill, grows the MDC population when the existing ones run
//! out of room, and rebalances the credit weights that steer new-object
//! allocation. Compacting ahead of time means an application commit almost
//! never pays for a compaction itself.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mpool_common::{Error, MediaClass, Result};
use tracing::{debug, error, info, warn};

use crate::mda::{MDC_SLOTS, MDC_TBL_SZ};
use crate::objid::{mdc_logids, ObjType};
use crate::ops::ObjCapacity;
use crate::pool::MpoolCore;

/// MDCs are allocated in multiples of this set size, and credit is spread
/// over at most this many MDCs at a time
pub const MDC_SET_SZ: usize = 4;

/// An MDC with less than 1/400 of its capacity free is treated as full
const FULL_DENOM: u64 = 400;

impl MpoolCore {
    /// Start the periodic pre-compaction task
    pub(crate) fn precompact_start(core: &Arc<MpoolCore>) {
        let mut handle = core.pco.handle.lock();
        if handle.is_some() {
            return;
        }
        *core.pco.stop.lock() = false;

        let task = Arc::clone(core);
        *handle = Some(thread::spawn(move || loop {
            {
                let stop = task.pco.stop.lock();
                if *stop {
                    break;
                }
            }

            task.precompact_tick();

            let period = Duration::from_secs(task.params.pcoperiod_clamped());
            let mut stop = task.pco.stop.lock();
            if *stop {
                break;
            }
            task.pco.wake.wait_for(&mut stop, period);
        }));
    }

    /// Cancel the pre-compaction task and wait for it to finish
    pub(crate) fn precompact_stop(&self) {
        {
            let mut stop = self.pco.stop.lock();
            *stop = true;
            self.pco.wake.notify_all();
        }
        let handle = self.pco.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// One scheduler tick: maybe compact, maybe grow, then rebalance
    pub(crate) fn precompact_tick(&self) {
        let slotvcnt = self.mda.slotvcnt();
        if slotvcnt < 2 {
            return;
        }

        let nmtoc = self.pco.nmtoc.fetch_add(1, Ordering::Relaxed);
        let cslot = (nmtoc % (u32::from(slotvcnt) - 1)) as u8 + 1;

        if self.need_compact(cslot, false) {
            let slot = self.mda.slot(cslot);
            let _compact = slot.compactlock.lock();
            // re-check under the lock to avoid a redundant compaction
            if self.need_compact(cslot, true) {
                if let Err(err) = self.mdc_compact(cslot) {
                    error!(pool = %self.name, cslot, %err, "pre-compaction failed");
                }
            }
        }

        if self.mdc_needed() {
            self.mdc_alloc_set();
        }

        self.update_credit();
    }

    /// Does this MDC's active mlog warrant compaction
    ///
    /// True when the active mlog is filled beyond the threshold and enough
    /// of its records are garbage for compaction to reclaim real space.
    /// Without the compact lock held the counters may be sampled mid-update;
    /// the caller re-checks under the lock before acting.
    pub(crate) fn need_compact(&self, cslot: u8, log_detail: bool) -> bool {
        let pco = &self.mda.slot(cslot).pco;

        let cap = pco.cap.load(Ordering::Relaxed);
        if cap == 0 {
            return false;
        }
        let len = pco.len.load(Ordering::Relaxed);
        let rec = pco.rec_total();
        let cobj = u64::from(pco.cobj.load(Ordering::Relaxed));

        let pct = len * 100 / cap;
        if pct < u64::from(self.params.pcopctfull) {
            return false;
        }

        let garbage = if rec > cobj {
            (rec - cobj) * 100 / rec
        } else {
            0
        };
        if garbage < u64::from(self.params.pcopctgarbage) {
            return false;
        }

        if log_detail {
            info!(pool = %self.name, cslot, len, cap, pct, rec, cobj, garbage,
                "MDC needs compaction");
        }
        true
    }

    /// Should new MDCs be created
    ///
    /// True when overall usage across the user MDCs is above the creation
    /// threshold while there is too little garbage for compaction to help.
    pub(crate) fn mdc_needed(&self) -> bool {
        let slotvcnt = self.mda.slotvcnt() as usize;
        if slotvcnt >= MDC_SLOTS {
            debug!(pool = %self.name, "already at the MDC limit");
            return false;
        }

        let mut cap = 0u64;
        let mut used = 0u64;
        let mut garbage = 0u64;
        let mut record = 0u64;
        let mut mdccnt = 0u32;

        for cslot in 1..slotvcnt {
            let pco = &self.mda.slot(cslot as u8).pco;
            let tcap = pco.cap.load(Ordering::Relaxed);
            if tcap == 0 {
                warn!(pool = %self.name, cslot, "MDC not open");
                continue;
            }
            cap += tcap;
            mdccnt += 1;
            used += pco.len.load(Ordering::Relaxed);

            let rec = pco.rec_total();
            let cobj = u64::from(pco.cobj.load(Ordering::Relaxed));
            if rec > cobj {
                garbage += rec - cobj;
            }
            record += rec;
        }

        if mdccnt == 0 {
            warn!(pool = %self.name, "no user MDC available");
            return false;
        }

        let pct = used * 100 / cap;
        let pctg = if garbage > 0 { garbage * 100 / record } else { 0 };

        pct > u64::from(self.params.crtmdcpctfull) && pctg < u64::from(self.params.crtmdcpctgrbg)
    }

    /// Allocate one new MDC
    ///
    /// Builds the backing mlog pair on the capacity class: allocate both,
    /// erase both so the log starts empty, commit both, open the pair,
    /// write the VERSION record, then publish the new slot. MDC0 validation
    /// cleans up any half-built pair left by a failure here.
    pub(crate) fn mdc_alloc(&self, mincap: u64, iter: u32) -> Result<()> {
        let _serial = self.serial.lock();

        // recover a previously torn MDC allocation first
        self.mdc0_validate(false)?;

        let slot0 = self.mda.slot(0);
        let mdcslot = *slot0.uq.lock() + 1;
        if mdcslot >= (MDC_SLOTS - 1) as u64 {
            warn!(pool = %self.name, mdcslot, "too many MDCs");
            return Err(Error::NoSpace);
        }
        let cslot = mdcslot as u8;
        let (logid1, logid2) = mdc_logids(cslot);

        // alternate the pair order across iterations so active mlogs
        // spread over the drives of the class
        let pdcnt = {
            let devices = self.devices.read();
            devices
                .pdv
                .iter()
                .filter(|pd| {
                    pd.parms.class == MediaClass::Capacity
                        && pd.state == mpool_common::DriveState::Active
                })
                .count() as u64
        };
        let reverse = pdcnt > 0 && pdcnt % 2 == 0 && (u64::from(iter) * 2 / pdcnt) % 2 == 1;
        let (first, second) = if reverse {
            (logid2, logid1)
        } else {
            (logid1, logid2)
        };

        let ocap = ObjCapacity {
            target: mincap,
            spare: false,
        };

        // each mlog alone must meet mincap; only one is active at a time
        let layout1 =
            self.obj_alloc_cmn(Some(first), ObjType::Mlog, ocap, MediaClass::Capacity, false, false)?;
        let layout2 = match self.obj_alloc_cmn(
            Some(second),
            ObjType::Mlog,
            ocap,
            MediaClass::Capacity,
            false,
            false,
        ) {
            Ok(layout) => layout,
            Err(err) => {
                let _ = self.obj_abort(&layout1);
                return Err(err);
            }
        };

        // erase before commit so the new log starts empty
        {
            let _w1 = layout1.write_lock();
            let _w2 = layout2.write_lock();
            if let Err(err) = self
                .io
                .erase_mlog(&layout1)
                .and_then(|()| self.io.erase_mlog(&layout2))
            {
                drop(_w2);
                drop(_w1);
                let _ = self.obj_abort(&layout1);
                let _ = self.obj_abort(&layout2);
                return Err(err);
            }
        }

        // the pair need not commit atomically; MDC0 validation deletes a
        // non-paired leftover
        if let Err(err) = self.obj_commit(&layout1) {
            let _ = self.obj_abort(&layout1);
            let _ = self.obj_abort(&layout2);
            return Err(err);
        }
        if let Err(err) = self.obj_commit(&layout2) {
            let _ = self.obj_delete(&layout1);
            let _ = self.obj_abort(&layout2);
            return Err(err);
        }

        let newslot = self.mda.slot(cslot);
        match self.store.open(logid1, logid2) {
            Ok(log) => newslot.open_log(log),
            Err(err) => {
                let _ = self.obj_delete(&layout1);
                let _ = self.obj_delete(&layout2);
                return Err(err);
            }
        }

        if let Err(err) = self.mdc_addrec_version(cslot) {
            // an empty MDC without a VERSION record is compacted (and thus
            // versioned) on the next activation; still undo this slot
            newslot.close_log();
            let _ = self.obj_delete(&layout1);
            let _ = self.obj_delete(&layout2);
            return Err(err);
        }

        // make the new MDC visible
        {
            let mut luniq = slot0.uq.lock();
            *luniq = mdcslot;
            self.mda.set_slotvcnt(mdcslot as u16 + 1);
        }

        debug!(pool = %self.name, cslot, %logid1, %logid2, "MDC allocated");
        self.update_credit();
        Ok(())
    }

    /// Allocate MDCs up to the next multiple of the set size
    ///
    /// A failure leaves a partial set; the next call backfills it.
    pub(crate) fn mdc_alloc_set(&self) {
        let slotvcnt = self.mda.slotvcnt() as usize;
        let want = (MDC_SET_SZ - (slotvcnt - 1) % MDC_SET_SZ).min(MDC_SLOTS - slotvcnt);

        for sidx in 0..want {
            if let Err(err) = self.mdc_alloc(self.params.mdcncap, sidx as u32) {
                error!(pool = %self.name, %err, created = sidx, wanted = want,
                    "MDC set allocation incomplete");
                break;
            }
        }
    }

    /// Rebalance allocation credits and rebuild the selector table
    ///
    /// Skips MDC0, the MDC the pre-compactor is about to visit and the
    /// `pconbnoalloc` MDCs after it (allocations queued behind a compaction
    /// stall on its sync), plus MDCs that are effectively full. The
    /// survivors with the most free space share the table in proportion to
    /// their free bytes, interleaved so consecutive allocations land on
    /// different MDCs.
    pub(crate) fn update_credit(&self) {
        let slotvcnt = u32::from(self.mda.slotvcnt());
        if slotvcnt < 2 {
            warn!(pool = %self.name, "no user MDC to assign credit to");
            return;
        }
        let user_mdcs = slotvcnt - 1;

        let nmtoc = self.pco.nmtoc.load(Ordering::Relaxed) % user_mdcs + 1;
        let nbnoalloc = self.params.pconbnoalloc;

        let (num_mdc, mut cslot) = if slotvcnt < nbnoalloc + 2 {
            (user_mdcs, 1u32)
        } else {
            (slotvcnt - (nbnoalloc + 2), (nmtoc + nbnoalloc) % user_mdcs)
        };

        // collect candidates, skipping those that are almost full
        let mut cands: Vec<(u8, u64)> = Vec::new();
        for _ in 0..num_mdc {
            cslot = cslot % user_mdcs + 1;
            let pco = &self.mda.slot(cslot as u8).pco;
            let cap = pco.cap.load(Ordering::Relaxed);
            let used = pco.len.load(Ordering::Relaxed);
            if cap == 0 {
                continue;
            }
            if cap.saturating_sub(used) < cap / FULL_DENOM {
                warn!(pool = %self.name, cslot, "MDC almost full");
                continue;
            }
            cands.push((cslot as u8, cap - used));
        }
        if cands.is_empty() {
            return;
        }

        // most free space first; ties keep scan order
        cands.sort_by(|a, b| b.1.cmp(&a.1));
        cands.truncate(MDC_SET_SZ);

        let total_free: u64 = cands.iter().map(|(_, free)| free).sum();
        let mut credits: Vec<u32> = cands
            .iter()
            .map(|(_, free)| (MDC_TBL_SZ as u64 * free / total_free) as u32)
            .collect();

        // distribute any rounding shortfall round-robin
        let mut shortfall = MDC_TBL_SZ as u32 - credits.iter().sum::<u32>();
        let mut sidx = 0;
        let credits_len = credits.len();
        while shortfall > 0 {
            credits[sidx % credits_len] += 1;
            sidx += 1;
            shortfall -= 1;
        }

        for ((slotnum, free), credit) in cands.iter().zip(&credits) {
            let mut info = self.mda.slot(*slotnum).credit.lock();
            info.free = *free;
            info.credit = *credit;
        }

        self.update_mds_tbl(&cands, &credits);
    }

    /// Realize credit ratios in the selector table by interleaving
    ///
    /// Members are grouped into credit sets that each match the credit of
    /// the largest member; the table is then filled by taking one entry
    /// from each set in turn, which maximizes the spacing between
    /// appearances of the same slot.
    fn update_mds_tbl(&self, cands: &[(u8, u64)], credits: &[u32]) {
        struct SetMember {
            slot: u8,
            credit: u32,
        }
        struct CreditSet {
            members: Vec<SetMember>,
            next: usize,
        }

        let refcredit = credits[0];
        let mut remaining: Vec<u32> = credits.to_vec();
        let mut sets: Vec<CreditSet> = Vec::new();

        let mut idx = 0;
        while idx < cands.len() {
            let mut set = CreditSet {
                members: Vec::new(),
                next: 0,
            };
            let mut needed = refcredit;

            while set.members.len() < MDC_SET_SZ && idx < cands.len() {
                let avail = remaining[idx];
                if needed <= avail {
                    set.members.push(SetMember {
                        slot: cands[idx].0,
                        credit: needed,
                    });
                    remaining[idx] -= needed;
                    if remaining[idx] == 0 {
                        idx += 1;
                    }
                    break;
                }
                set.members.push(SetMember {
                    slot: cands[idx].0,
                    credit: avail,
                });
                needed -= avail;
                remaining[idx] = 0;
                idx += 1;
            }

            sets.push(set);
        }

        let num_sets = sets.len();
        let mut tidx = 0;
        let mut csidx = 0;
        while tidx < MDC_TBL_SZ {
            let set = &mut sets[csidx];
            if set.next < set.members.len() {
                let member = &mut set.members[set.next];
                if member.credit > 0 {
                    member.credit -= 1;
                    self.mda.set_sel_entry(tidx, member.slot);
                    if member.credit == 0 {
                        set.next += 1;
                    }
                    tidx += 1;
                }
            }
            csidx = (csidx + 1) % num_sets;
        }
    }

    /// Report MDC capacity: (max index, user MDC bytes, MDC0 bytes)
    ///
    /// Only one mlog of each pair is active, so the pair totals are halved.
    pub(crate) fn mdc_cap(&self) -> (u64, u64, u64) {
        let _serial = self.serial.lock();

        let slot0 = self.mda.slot(0);
        let mdcmax = *slot0.uq.lock();

        let _compact = slot0.compactlock.lock();
        let devices = self.devices.read();
        let cobj = slot0.cobj.read();

        let mut mdccap = 0u64;
        let mut mdc0cap = 0u64;
        for layout in cobj.iter() {
            let mdcn = layout.objid().uniq() >> 1;
            if mdcn > mdcmax {
                // detritus from a failed MDC allocation
                continue;
            }
            let zone_bytes = devices.pdv[layout.pdh() as usize].parms.zone_bytes();
            let mlogsz = u64::from(layout.zcnt()) * zone_bytes;
            if mdcn == 0 {
                mdc0cap += mlogsz;
            } else {
                mdccap += mlogsz;
            }
        }

        (mdcmax, mdccap / 2, mdc0cap / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mda::MDC_TBL_SZ;
    use crate::objid::ObjType;
    use crate::testutil::TestPool;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn cap(target: u64) -> ObjCapacity {
        ObjCapacity {
            target,
            spare: false,
        }
    }

    fn set_usage(core: &MpoolCore, cslot: u8, len: u64, capb: u64) {
        let pco = &core.mda.slot(cslot).pco;
        pco.len.store(len, Ordering::Relaxed);
        pco.cap.store(capb, Ordering::Relaxed);
    }

    #[test]
    fn test_credit_realization() {
        let mut tp = TestPool::new(64, 64 * 1024);
        // keep every user MDC eligible for credit
        tp.params.pconbnoalloc = 3;
        let mp = tp.create();
        mp.mdc_alloc(tp.params.mdcncap, 1).unwrap();
        mp.mdc_alloc(tp.params.mdcncap, 2).unwrap();
        assert_eq!(mp.core.mda.slotvcnt(), 4);

        // free bytes 100 / 100 / 50
        set_usage(&mp.core, 1, 900, 1000);
        set_usage(&mp.core, 2, 900, 1000);
        set_usage(&mp.core, 3, 950, 1000);

        mp.core.update_credit();

        let credit = |slot: u8| mp.core.mda.slot(slot).credit.lock().credit;
        assert_eq!(credit(1), 410);
        assert_eq!(credit(2), 410);
        assert_eq!(credit(3), 204);

        // the table realizes exactly the assigned credits
        let hist = mp.core.mda.sel_histogram();
        assert_eq!(hist[1], 410);
        assert_eq!(hist[2], 410);
        assert_eq!(hist[3], 204);
        assert_eq!(hist.iter().sum::<u32>(), MDC_TBL_SZ as u32);

        // interleaved placement never puts a slot in adjacent entries
        let entries: Vec<u8> = (0..MDC_TBL_SZ)
            .map(|_| mp.core.mda.next_sel_slot())
            .collect();
        for pair in entries.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_credit_skips_full_mdc() {
        let mut tp = TestPool::new(64, 64 * 1024);
        tp.params.pconbnoalloc = 3;
        let mp = tp.create();
        mp.mdc_alloc(tp.params.mdcncap, 1).unwrap();

        set_usage(&mp.core, 1, 1000, 1000); // full
        set_usage(&mp.core, 2, 0, 1000);

        mp.core.update_credit();

        let hist = mp.core.mda.sel_histogram();
        assert_eq!(hist[1], 0);
        assert_eq!(hist[2], MDC_TBL_SZ as u32);
    }

    #[test]
    fn test_need_compact_thresholds() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();
        let pco = &mp.core.mda.slot(1).pco;

        // filled and mostly garbage
        set_usage(&mp.core, 1, 80, 100);
        pco.cr.store(100, Ordering::Relaxed);
        pco.cobj.store(10, Ordering::Relaxed);
        assert!(mp.core.need_compact(1, false));

        // not filled enough
        set_usage(&mp.core, 1, 50, 100);
        assert!(!mp.core.need_compact(1, false));

        // filled but no garbage to reclaim
        set_usage(&mp.core, 1, 80, 100);
        pco.cobj.store(100, Ordering::Relaxed);
        assert!(!mp.core.need_compact(1, false));

        // closed MDC is never compacted
        set_usage(&mp.core, 1, 0, 0);
        assert!(!mp.core.need_compact(1, false));
    }

    #[test]
    fn test_mdc_needed_thresholds() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();
        let pco = &mp.core.mda.slot(1).pco;

        // nearly full, little garbage: grow
        set_usage(&mp.core, 1, 90, 100);
        pco.cr.store(50, Ordering::Relaxed);
        pco.cobj.store(48, Ordering::Relaxed);
        assert!(mp.core.mdc_needed());

        // nearly full but compactable: don't grow
        pco.cobj.store(10, Ordering::Relaxed);
        assert!(!mp.core.mdc_needed());

        // mostly empty: don't grow
        set_usage(&mp.core, 1, 10, 100);
        pco.cobj.store(48, Ordering::Relaxed);
        assert!(!mp.core.mdc_needed());
    }

    #[test]
    fn test_mdc_alloc_set_fills_to_set_size() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();
        assert_eq!(mp.core.mda.slotvcnt(), 2);

        mp.core.mdc_alloc_set();

        // one user MDC existed; the set is topped up to a multiple of four
        assert_eq!(mp.core.mda.slotvcnt(), 5);
        for cslot in 1..5u8 {
            assert!(mp.core.mda.slot(cslot).is_log_open());
        }
    }

    #[test]
    fn test_mdc_cap_reporting() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let (mdcmax, mdccap, mdc0cap) = mp.mdc_cap();
        assert_eq!(mdcmax, 1);
        // each pair member is one 1 MiB zone; only one is active at a time
        assert_eq!(mdccap, MIB);
        assert_eq!(mdc0cap, MIB);
    }

    #[test]
    fn test_precompact_task_runs_and_stops() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        mp.precompact_start();
        // the first tick fires immediately
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while mp.core.pco.nmtoc.load(Ordering::Relaxed) == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(mp.core.pco.nmtoc.load(Ordering::Relaxed) >= 1);
        mp.precompact_stop();

        // idempotent stop
        mp.precompact_stop();
        mp.deactivate().unwrap();
    }

    #[test]
    fn test_precompact_tick_compacts_when_needed() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let mut layouts = Vec::new();
        for _ in 0..10 {
            let layout = mp
                .obj_alloc(ObjType::Mblock, cap(MIB), mpool_common::MediaClass::Capacity, false)
                .unwrap();
            mp.obj_commit(&layout).unwrap();
            layouts.push(layout);
        }
        for layout in layouts.drain(..8) {
            mp.obj_delete(&layout).unwrap();
        }

        // force the fill/garbage thresholds
        let pco = &mp.core.mda.slot(1).pco;
        pco.len.store(90, Ordering::Relaxed);
        pco.cap.store(100, Ordering::Relaxed);

        mp.core.precompact_tick();

        // the tick compacted MDC1: counters reflect only live objects
        assert_eq!(pco.cr.load(Ordering::Relaxed), 2);
        assert_eq!(pco.del.load(Ordering::Relaxed), 0);
    }
}
