//! Object operations
//!
//! The public object lifecycle over the metadata machinery: allocate,
//! commit, abort, delete, erase, reference counting and lookup. Each
//! operation logs its record before exposing the state change, and reverts
//! the in-memory flags when the log append fails, so a crash can never
//! observe a half-applied mutation.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mpool_common::{Error, MediaClass, Result};
use tracing::{error, warn};

use crate::erase::layout_free;
use crate::layout::{ObjLayout, LYT_COMMITTED, LYT_REMOVED};
use crate::objid::{ObjId, ObjType};
use crate::pool::{MpoolCore, MpoolUsage};
use crate::record::{LayoutRec, MdcRecord};
use crate::smap::{roundup_pow2, SpcType};

/// Capacity request for an object allocation
#[derive(Clone, Copy, Debug, Default)]
pub struct ObjCapacity {
    /// Capacity target in bytes; zero means one zone
    pub target: u64,
    /// Draw from the spare reserve
    pub spare: bool,
}

/// Zone-wait retry budget when the requested class is the final candidate
const ALLOC_RETRIES: u32 = 1024;

/// Zone-wait retry budget when a class fallback is still available
const ALLOC_RETRIES_FALLBACK: u32 = 8;

impl MpoolCore {
    /// Mint a new objid, checkpointing it first when required
    ///
    /// The slot comes from the credit-weighted selector table. A checkpoint
    /// boundary id is persisted (OIDCKPT) before the uniq counter advances;
    /// if that append fails the counter is untouched and the id is never
    /// handed out.
    pub(crate) fn alloc_idgen(&self, otype: ObjType) -> Result<ObjId> {
        if self.mda.slotvcnt() < 2 {
            warn!(pool = %self.name, "no user MDC to assign object to");
            return Err(Error::NoSpace);
        }

        let cslot = self.mda.next_sel_slot().max(1);
        let slot = self.mda.slot(cslot);

        let mut luniq = slot.uq.lock();
        let objid = ObjId::new(*luniq + 1, otype, cslot);
        if objid.is_ckpt() {
            let _compact = slot.compactlock.lock();
            self.mdc_addrec(cslot, &MdcRecord::OidCkpt(objid))?;
            slot.set_lckpt(objid);
        }
        *luniq += 1;
        Ok(objid)
    }

    /// Validate an objid supplied for re-allocation
    fn realloc_idvalidate(&self, objid: ObjId) -> Result<()> {
        let cslot = objid.slot();
        if cslot == 0 {
            return Err(Error::invalid_arg(
                "cannot re-allocate an MDC0 object".to_string(),
            ));
        }
        if u16::from(cslot) >= self.mda.slotvcnt() {
            return Err(Error::invalid_arg(format!(
                "slot {cslot} of {objid} beyond visible MDCs"
            )));
        }
        let luniq = *self.mda.slot(cslot).uq.lock();
        if objid.uniq() > luniq {
            return Err(Error::invalid_arg(format!(
                "uniq {} of {objid} was never allocated (high water {luniq})",
                objid.uniq()
            )));
        }
        Ok(())
    }

    /// Common allocation path for alloc, realloc and MDC provisioning
    pub(crate) fn obj_alloc_cmn(
        &self,
        objid: Option<ObjId>,
        otype: ObjType,
        ocap: ObjCapacity,
        mclassp: MediaClass,
        best_effort: bool,
        realloc: bool,
    ) -> Result<Arc<ObjLayout>> {
        if !otype.is_user() {
            return Err(Error::invalid_arg(format!("not a client object type: {otype:?}")));
        }
        if let Some(id) = objid {
            if id.objtype() != otype {
                return Err(Error::invalid_arg(format!(
                    "object type mismatch: {id} vs {otype:?}"
                )));
            }
        }

        let objid = match objid {
            None => self.alloc_idgen(otype)?,
            Some(id) => {
                if realloc {
                    self.realloc_idvalidate(id)?;
                }
                id
            }
        };

        let layout = self.layout_alloc_wait(objid, ocap, mclassp, best_effort)?;

        let cslot = objid.slot();
        let slot = self.mda.slot(cslot);
        let zone_bytes = self.devices.read().zone_bytes(layout.pdh());

        // stats first; undone if the index insert collides
        slot.stats_add(&layout, zone_bytes);

        let mut collision = false;
        {
            let mut uncobj = slot.uncobj.lock();
            // a reallocated objid may race a commit; a generated one cannot
            if realloc && slot.cobj.read().find(objid).is_some() {
                collision = true;
            }
            if !collision && uncobj.insert(Arc::clone(&layout)).is_some() {
                collision = true;
            }
        }

        if collision {
            warn!(pool = %self.name, %objid, realloc, "allocated objid already indexed");
            slot.stats_sub(&layout, zone_bytes);
            layout_free(&self.devices, &layout);
            return Err(Error::Exists {
                objid: objid.as_u64(),
            });
        }

        Ok(layout)
    }

    /// Pick a class and wait for zones, flushing the erase queue as needed
    fn layout_alloc_wait(
        &self,
        objid: ObjId,
        ocap: ObjCapacity,
        mclassp: MediaClass,
        best_effort: bool,
    ) -> Result<Arc<ObjLayout>> {
        let mut mclass = mclassp;
        let fallback = best_effort && mclass.next().is_some();
        let mut retries = if fallback {
            ALLOC_RETRIES_FALLBACK
        } else {
            ALLOC_RETRIES
        };
        let mut flush = if fallback { 0 } else { retries / 8 };

        loop {
            let devices = self.devices.read();

            // find the first acceptable class with a drive
            let pdh = loop {
                if let Some(pdh) = devices.classes[mclass.index()].pdmc {
                    break pdh;
                }
                match (best_effort, mclass.next()) {
                    (true, Some(next)) => mclass = next,
                    _ => return Err(Error::NoSpace),
                }
            };

            let drive = &devices.pdv[pdh];
            let zone_bytes = drive.parms.zone_bytes();
            let zcnt = if ocap.target == 0 {
                1
            } else {
                1 + (ocap.target - 1) / zone_bytes
            };
            let zcnt32 = u32::try_from(zcnt)
                .map_err(|_| Error::invalid_arg(format!("capacity {} too large", ocap.target)))?;
            let align = roundup_pow2(zcnt.min(devices.classes[mclass.index()].smap_align));
            let spctype = if ocap.spare {
                SpcType::Spare2Usable
            } else {
                SpcType::UsableOnly
            };

            let allocated = drive.smap.lock().alloc(zcnt, spctype, align);
            match allocated {
                Ok(zaddr) => {
                    return Ok(ObjLayout::new(objid, pdh as u16, zaddr, zcnt32, 0));
                }
                Err(_) => {
                    drop(devices);

                    if retries > 0 {
                        retries -= 1;
                        // wait out asynchronous erases
                        thread::sleep(Duration::from_micros(128 + u64::from(retries & 127)));
                        if flush > 0 && retries % flush == 0 {
                            self.eraser.flush();
                        }
                        continue;
                    }

                    if best_effort {
                        if let Some(next) = mclass.next() {
                            mclass = next;
                            if mclass.next().is_none() {
                                retries = ALLOC_RETRIES;
                                flush = retries / 8;
                            }
                            continue;
                        }
                    }

                    warn!(pool = %self.name, %objid, zcnt, "zone allocation failed");
                    return Err(Error::NoSpace);
                }
            }
        }
    }

    fn log_create(&self, layout: &ObjLayout) -> Result<()> {
        let devid = self.devices.read().pdv[layout.pdh() as usize].parms.devid;
        let rec = MdcRecord::OCreate(LayoutRec {
            objid: layout.objid(),
            gen: layout.gen(),
            devid,
            zaddr: layout.zaddr(),
            zcnt: layout.zcnt(),
        });
        self.mdc_addrec(layout.objid().slot(), &rec)
    }

    /// Commit an allocated object
    ///
    /// The create record is logged before the object is marked committed,
    /// all under the compact lock, so compaction can never observe the
    /// object without its record being durable.
    pub(crate) fn obj_commit(&self, layout: &Arc<ObjLayout>) -> Result<()> {
        let _w = layout.write_lock();
        let objid = layout.objid();

        if !objid.is_user_type() {
            return Err(Error::invalid_arg(format!("wrong object type: {objid}")));
        }
        if layout.is_committed() {
            warn!(pool = %self.name, %objid, "object already committed");
            return Ok(());
        }

        let cslot = objid.slot();
        let slot = self.mda.slot(cslot);
        let _compact = slot.compactlock.lock();

        self.log_create(layout)?;

        layout.set_state_bits(LYT_COMMITTED);
        slot.uncobj.lock().remove(objid);
        let dup = slot.cobj.write().insert(Arc::clone(layout));

        if dup.is_some() {
            // an objid collision in the committed index is a serious bug:
            // a second create record is now in the log, and only a
            // compaction before the next activation will absorb it
            error!(pool = %self.name, %objid, "objid collided during commit");
            layout.clear_state_bits(LYT_COMMITTED);
            slot.uncobj.lock().insert(Arc::clone(layout));
            return Err(Error::Exists {
                objid: objid.as_u64(),
            });
        }

        slot.pco.cr.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        slot.pco.cobj.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Discard an uncommitted object and queue its zones for erase
    pub(crate) fn obj_abort(&self, layout: &Arc<ObjLayout>) -> Result<()> {
        let objid = layout.objid();
        {
            let _w = layout.write_lock();

            if !objid.is_user_type() || layout.is_committed() {
                return Err(Error::invalid_arg(format!(
                    "abort needs an uncommitted client object: {objid}"
                )));
            }

            let slot = self.mda.slot(objid.slot());
            {
                let _ref = slot.reflock.lock();
                if layout.is_del() {
                    return Err(Error::invalid_arg(format!("object already deleted: {objid}")));
                }
                if layout.refcnt() > 2 {
                    return Err(Error::Busy {
                        objid: objid.as_u64(),
                    });
                }
                layout.set_refcnt(0);
                layout.set_del(true);
                layout.set_state_bits(LYT_REMOVED);
            }

            slot.uncobj.lock().remove(objid);
        }

        let slot = self.mda.slot(objid.slot());
        let zone_bytes = self.devices.read().zone_bytes(layout.pdh());
        slot.stats_sub(layout, zone_bytes);
        self.eraser.enqueue(Arc::clone(layout));
        Ok(())
    }

    /// Delete a committed object
    ///
    /// The delete record is logged before the object leaves the committed
    /// index; if the append fails the tombstone flags are rolled back and
    /// the object stays fully visible.
    pub(crate) fn obj_delete(&self, layout: &Arc<ObjLayout>) -> Result<()> {
        let objid = layout.objid();
        let cslot = objid.slot();
        let slot = self.mda.slot(cslot);
        let removed;

        {
            let _w = layout.write_lock();

            if !objid.is_user_type() || !layout.is_committed() {
                return Err(Error::invalid_arg(format!(
                    "delete needs a committed client object: {objid}"
                )));
            }
            if layout.is_removed() {
                return Err(Error::Gone {
                    objid: objid.as_u64(),
                });
            }

            let _compact = slot.compactlock.lock();
            {
                let _ref = slot.reflock.lock();
                if layout.is_del() {
                    return Err(Error::Gone {
                        objid: objid.as_u64(),
                    });
                }
                if layout.refcnt() > 2 {
                    return Err(Error::Busy {
                        objid: objid.as_u64(),
                    });
                }
                layout.set_refcnt(0);
                layout.set_del(true);
                layout.set_state_bits(LYT_REMOVED);
            }

            match self.mdc_addrec(cslot, &MdcRecord::ODelete(objid)) {
                Ok(()) => {
                    removed = slot.cobj.write().remove(objid).is_some();
                }
                Err(err) => {
                    // deletion is legal but the record is not durable
                    let _ref = slot.reflock.lock();
                    layout.set_refcnt(2);
                    layout.set_del(false);
                    layout.clear_state_bits(LYT_REMOVED);
                    error!(pool = %self.name, %objid, %err, "delete record append failed");
                    return Err(err);
                }
            }
        }

        if removed {
            slot.pco.cobj.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            let zone_bytes = self.devices.read().zone_bytes(layout.pdh());
            slot.stats_sub(layout, zone_bytes);
        }
        slot.pco.del.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.eraser.enqueue(Arc::clone(layout));
        Ok(())
    }

    /// Record a higher erase generation for a committed mlog
    pub(crate) fn obj_erase(&self, layout: &Arc<ObjLayout>, gen: u64) -> Result<()> {
        let objid = layout.objid();

        if objid.objtype() != ObjType::Mlog
            || !layout.is_committed()
            || layout.is_removed()
            || gen <= layout.gen()
        {
            warn!(pool = %self.name, %objid, gen, state = layout.state(),
                "object erase failed to start");
            return Err(Error::invalid_arg(format!("cannot erase {objid} to gen {gen}")));
        }

        if objid.is_mdc0_log() {
            // MDC0 metadata lives in superblocks; caller holds the MDC0
            // compact lock
            let (logid1, _) = crate::objid::mdc_logids(0);
            let image = {
                let mut image = self.sbimage.lock();
                if objid == logid1 {
                    image.mdc01_gen = gen;
                } else {
                    image.mdc02_gen = gen;
                }
                *image
            };
            let devid = self.devices.read().pdv[layout.pdh() as usize].parms.devid;
            self.store.write_mdc0_image(&devid, &image)?;
            layout.set_gen(gen);
        } else {
            let cslot = objid.slot();
            let slot = self.mda.slot(cslot);
            let _compact = slot.compactlock.lock();
            self.mdc_addrec(cslot, &MdcRecord::OErase { objid, gen })?;
            layout.set_gen(gen);
            if cslot > 0 {
                slot.pco.er.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }

        Ok(())
    }

    /// Take a reference on a layout; fails once the tombstone is set
    pub(crate) fn obj_get(&self, layout: &ObjLayout) -> Result<()> {
        let slot = self.mda.slot(layout.objid().slot());
        let _ref = slot.reflock.lock();
        if layout.is_del() {
            return Err(Error::Gone {
                objid: layout.objid().as_u64(),
            });
        }
        layout.inc_refcnt();
        Ok(())
    }

    /// Release a reference on a layout
    ///
    /// The reference taken by delete/abort is not released here; the erase
    /// worker owns it.
    pub(crate) fn obj_put(&self, layout: &ObjLayout) {
        let objid = layout.objid();
        let slot = self.mda.slot(objid.slot());

        let _r = layout.read_lock();
        if !objid.is_user_type() || layout.is_removed() {
            warn!(pool = %self.name, %objid, state = layout.state(), "put on removed object");
            return;
        }

        let _ref = slot.reflock.lock();
        if layout.refcnt() > 1 && !layout.is_del() {
            layout.dec_refcnt();
        } else {
            warn!(pool = %self.name, %objid, refcnt = layout.refcnt(),
                isdel = layout.is_del(), "unbalanced put");
        }
    }

    /// Find an object by id and take a reference on it
    pub(crate) fn obj_find_get(&self, objid: ObjId) -> Result<Arc<ObjLayout>> {
        if !objid.is_user_type() {
            return Err(Error::NotFound {
                objid: objid.as_u64(),
            });
        }

        let slot = self.mda.slot(objid.slot());
        let not_found = Err(Error::NotFound {
            objid: objid.as_u64(),
        });

        {
            let cobj = slot.cobj.read();
            if let Some(layout) = cobj.find(objid) {
                return match self.obj_get(&layout) {
                    Ok(()) => Ok(layout),
                    Err(_) => not_found,
                };
            }
        }

        let found = slot.uncobj.lock().find(objid);
        match found {
            Some(layout) => match self.obj_get(&layout) {
                Ok(()) => Ok(layout),
                Err(_) => not_found,
            },
            None => not_found,
        }
    }

    /// Aggregate object usage across user MDCs
    pub(crate) fn usage(&self) -> MpoolUsage {
        let slotvcnt = self.mda.slotvcnt();
        let mut usage = MpoolUsage::default();

        for cslot in 1..slotvcnt {
            let stats = *self.mda.slot(cslot as u8).stats.lock();
            usage.mblock_cnt += stats.mblock_cnt;
            usage.mlog_cnt += stats.mlog_cnt;
            usage.mblock_alen += stats.mblock_alen;
            usage.mlog_alen += stats.mlog_alen;
        }

        usage.alen = usage.mblock_alen + usage.mlog_alen;
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objid::mdc_logids;
    use crate::testutil::TestPool;
    use mpool_common::MediaClass;

    const MIB: u64 = 1024 * 1024;

    fn cap(target: u64) -> ObjCapacity {
        ObjCapacity {
            target,
            spare: false,
        }
    }

    #[test]
    fn test_fresh_create_and_commit() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(3 * MIB), MediaClass::Capacity, false)
            .unwrap();
        let objid = layout.objid();
        assert_eq!(objid.slot(), 1);
        assert_eq!(objid.uniq(), 1);
        assert_eq!(objid.objtype(), ObjType::Mblock);
        assert_eq!(layout.zcnt(), 3);

        mp.obj_commit(&layout).unwrap();

        let found = mp.obj_find_get(objid).unwrap();
        assert!(Arc::ptr_eq(&found, &layout));
        mp.obj_put(&found);

        let usage = mp.usage();
        assert_eq!(usage.mblock_cnt, 1);
        assert_eq!(usage.mblock_alen, 3 * MIB);
        assert_eq!(usage.alen, 3 * MIB);

        mp.deactivate().unwrap();
    }

    #[test]
    fn test_alloc_without_user_mdc() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.activate_raw(true).unwrap();
        let err = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap_err();
        assert!(matches!(err, Error::NoSpace));
    }

    #[test]
    fn test_delete_then_find_not_found() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_commit(&layout).unwrap();
        mp.obj_delete(&layout).unwrap();

        let err = mp.obj_find_get(layout.objid()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(mp.usage().mblock_cnt, 0);
    }

    #[test]
    fn test_second_delete_sees_gone() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_commit(&layout).unwrap();
        mp.obj_delete(&layout).unwrap();

        assert!(matches!(
            mp.obj_delete(&layout),
            Err(Error::Gone { .. })
        ));
    }

    #[test]
    fn test_delete_busy_while_referenced() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_commit(&layout).unwrap();

        // a second reader holds the object
        let other = mp.obj_find_get(layout.objid()).unwrap();
        assert!(matches!(mp.obj_delete(&layout), Err(Error::Busy { .. })));

        mp.obj_put(&other);
        mp.obj_delete(&layout).unwrap();
    }

    #[test]
    fn test_get_fails_after_delete() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_commit(&layout).unwrap();
        mp.obj_delete(&layout).unwrap();

        assert!(matches!(mp.obj_get(&layout), Err(Error::Gone { .. })));
    }

    #[test]
    fn test_abort_returns_zones() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let free_before = {
            let devices = mp.core.devices.read();
            let free = devices.pdv[0].smap.lock().free_zones();
            free
        };

        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(4 * MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_abort(&layout).unwrap();
        mp.core.eraser.flush();

        let devices = mp.core.devices.read();
        assert_eq!(devices.pdv[0].smap.lock().free_zones(), free_before);
    }

    #[test]
    fn test_abort_committed_rejected() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_commit(&layout).unwrap();
        assert!(matches!(mp.obj_abort(&layout), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn test_realloc_after_abort() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        let objid = layout.objid();
        mp.obj_abort(&layout).unwrap();

        let again = mp
            .obj_realloc(objid, cap(2 * MIB), MediaClass::Capacity, false)
            .unwrap();
        assert_eq!(again.objid(), objid);
        assert_eq!(again.zcnt(), 2);
        mp.obj_commit(&again).unwrap();
        assert!(mp.obj_find_get(objid).is_ok());
    }

    #[test]
    fn test_realloc_validation() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        // never-allocated uniq
        let bogus = ObjId::new(50, ObjType::Mblock, 1);
        assert!(matches!(
            mp.obj_realloc(bogus, cap(MIB), MediaClass::Capacity, false),
            Err(Error::InvalidArg(_))
        ));

        // a committed objid cannot be reallocated
        let layout = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_commit(&layout).unwrap();
        assert!(matches!(
            mp.obj_realloc(layout.objid(), cap(MIB), MediaClass::Capacity, false),
            Err(Error::Exists { .. })
        ));

        // MDC0 objects are never reallocated
        let (logid1, _) = mdc_logids(1);
        assert!(matches!(
            mp.obj_realloc(logid1, cap(MIB), MediaClass::Capacity, false),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn test_erase_bumps_mlog_gen() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let layout = mp
            .obj_alloc(ObjType::Mlog, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_commit(&layout).unwrap();

        mp.obj_erase(&layout, 5).unwrap();
        assert_eq!(layout.gen(), 5);

        // generations only move forward
        assert!(matches!(
            mp.obj_erase(&layout, 5),
            Err(Error::InvalidArg(_))
        ));

        // mblocks are not erasable through this path
        let mb = mp
            .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
            .unwrap();
        mp.obj_commit(&mb).unwrap();
        assert!(matches!(mp.obj_erase(&mb, 1), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn test_erase_mdc0_log_updates_superblock() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();

        let (logid1, _) = mdc_logids(0);
        let layout = mp.obj_find_get(logid1).unwrap();

        {
            // the mlog layer holds the MDC0 compact lock on this path
            let _compact = mp.core.mda.slot(0).compactlock.lock();
            mp.obj_erase(&layout, 7).unwrap();
        }
        assert_eq!(layout.gen(), 7);

        let devid = tp.drives[0].1.devid;
        let image = tp.store.mdc0_image(&devid).expect("superblock written");
        assert_eq!(image.mdc01_gen, 7);
    }

    #[test]
    fn test_alloc_spreads_over_visible_mdcs() {
        let tp = TestPool::new(64, 64 * 1024);
        let mp = tp.create();
        mp.mdc_alloc(tp.params.mdcncap, 1).unwrap();

        // both user MDCs should receive allocations
        let mut seen = [false; 3];
        for _ in 0..32 {
            let layout = mp
                .obj_alloc(ObjType::Mblock, cap(MIB), MediaClass::Capacity, false)
                .unwrap();
            seen[layout.objid().slot() as usize] = true;
            mp.obj_abort(&layout).unwrap();
            mp.core.eraser.flush();
        }
        assert!(seen[1]);
        assert!(seen[2]);
    }
}
