//! Pool activation, recovery and deactivation
//!
//! Activation rebuilds the entire in-memory state from MDC0 and the user
//! MDCs: replay MDC0 for properties, reconcile the persisted drive list
//! against the drives actually present, initialize the space maps, replay
//! MDC0's object records to find every user MDC, then load the user MDCs
//! in parallel. A failure at any step tears the partial state down in
//! reverse slot order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;

use mpool_common::{DriveParms, DriveState, Error, PmdParams, PoolConfig, Result, MED_NUMBER};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::Devices;
use crate::erase::EraseCtx;
use crate::layout::{ObjLayout, LYT_COMMITTED};
use crate::mda::MDC_SLOTS;
use crate::mdc::{Mdc0Image, MdcStore, ObjectIo};
use crate::objid::{mdc_logid_slot, mdc_logids, OBJID_CKPT_DELTA};
use crate::pool::{Mpool, MpoolCore};
use crate::record::{is_object_record, peek_type, DriveRec, MdcRecord, RecType, MAX_REC_LEN};
use crate::version::MdccVer;

/// Placement of one MDC0 backing mlog, read from the superblock by the caller
#[derive(Clone, Copy, Debug)]
pub struct Mdc0Layout {
    pub pdh: u16,
    pub zaddr: u64,
    pub zcnt: u32,
    pub gen: u64,
}

/// Everything activation needs besides the media interfaces
pub struct ActivateSpec {
    pub name: String,
    /// Fresh pool: skip the property replay of MDC0
    pub create: bool,
    /// Drives present, in drive-handle order
    pub drives: Vec<(String, DriveParms)>,
    /// MDC0's two backing mlogs
    pub mdc0: [Mdc0Layout; 2],
    pub params: PmdParams,
    pub cfg: PoolConfig,
}

impl Mpool {
    /// Activate a pool
    pub fn activate(
        spec: ActivateSpec,
        store: Arc<dyn MdcStore>,
        io: Arc<dyn ObjectIo>,
    ) -> Result<Mpool> {
        let core = Arc::new(MpoolCore::new(
            spec.name,
            spec.params,
            spec.cfg,
            spec.drives,
            store,
            io,
        ));

        if let Err(err) = core.activate_body(&spec.mdc0, spec.create) {
            core.mda_free();
            return Err(err);
        }

        core.eraser.start(EraseCtx {
            devices: Arc::clone(&core.devices),
            io: Arc::clone(&core.io),
        });

        info!(pool = %core.name, slotvcnt = core.mda.slotvcnt(), "pool activated");
        Ok(Mpool::from_core(core))
    }
}

impl MpoolCore {
    fn activate_body(&self, mdc0: &[Mdc0Layout; 2], create: bool) -> Result<()> {
        self.mdc0_init(mdc0)?;

        if !create {
            self.props_load()?;
        }

        self.devices.write().init_smaps();

        // MDC0 object records locate every user MDC
        self.objs_load(0)?;
        self.objs_load_parallel()?;

        if !create {
            self.write_meta_to_latest(true)?;
        }

        if self.mda.slotvcnt() >= 2 {
            self.update_credit();
        }
        Ok(())
    }

    /// Index MDC0's own mlogs and open its log
    ///
    /// The MDC0 mlog layouts go into slot 0's committed index so the rest
    /// of the code treats them like any other object, even though their
    /// metadata actually lives in superblocks.
    fn mdc0_init(&self, mdc0: &[Mdc0Layout; 2]) -> Result<()> {
        let (logid1, logid2) = mdc_logids(0);
        let slot0 = self.mda.slot(0);

        *self.sbimage.lock() = Mdc0Image {
            mdc01_gen: mdc0[0].gen,
            mdc02_gen: mdc0[1].gen,
        };

        {
            let mut cobj = slot0.cobj.write();
            for (logid, lspec) in [(logid1, &mdc0[0]), (logid2, &mdc0[1])] {
                let layout = ObjLayout::new(logid, lspec.pdh, lspec.zaddr, lspec.zcnt, lspec.gen);
                layout.set_state_bits(LYT_COMMITTED);
                layout.set_refcnt(1);
                cobj.insert(layout);
            }
        }
        self.mda.set_slotvcnt(1);

        match self.store.open(logid1, logid2) {
            Ok(log) => {
                slot0.open_log(log);
                Ok(())
            }
            Err(err) => {
                slot0.cobj.write().clear();
                self.mda.set_slotvcnt(0);
                Err(err)
            }
        }
    }

    /// Replay MDC0 for property records and reconcile the drive list
    fn props_load(&self) -> Result<()> {
        let slot0 = self.mda.slot(0);
        let mut staged: HashMap<Uuid, DriveRec> = HashMap::new();
        let mut spzone: [Option<u8>; MED_NUMBER] = [None; MED_NUMBER];

        {
            let mut log = slot0.log.lock();
            let mdc = log
                .mdc
                .as_mut()
                .ok_or_else(|| Error::critical("MDC0 log closed"))?;
            mdc.rewind()?;

            let mut buf = [0u8; MAX_REC_LEN];
            loop {
                let rlen = mdc.read_rec(&mut buf)?;
                if rlen == 0 {
                    break;
                }
                // object records are replayed later, once drives are final
                if is_object_record(&buf[..rlen]) {
                    continue;
                }

                let ver = *slot0.mdccver.lock();
                match MdcRecord::unpack(&buf[..rlen], ver)? {
                    MdcRecord::Version(v) => {
                        if v > MdccVer::LATEST {
                            return Err(Error::UnsupportedVersion {
                                found: v.to_string(),
                                latest: MdccVer::LATEST.to_string(),
                            });
                        }
                        *slot0.mdccver.lock() = v;
                    }
                    MdcRecord::McConfig(drec) => {
                        // last record wins per drive
                        staged.insert(drec.parms.devid, drec);
                    }
                    MdcRecord::McSpare { class, spzone: pct } => {
                        spzone[class.index()] = Some(pct);
                    }
                    MdcRecord::MpConfig(cfg) => {
                        *self.cfg.lock() = cfg;
                    }
                    rec => {
                        return Err(Error::corrupt(format!(
                            "unexpected {:?} record in MDC0 property replay",
                            rec.rectype()
                        )));
                    }
                }
            }
        }

        let mut devices = self.devices.write();
        self.reconcile_drives(&mut devices, &staged)?;

        devices.recompute_classes();
        let unavail = devices.max_uacnt();
        if unavail >= MED_NUMBER as u32 {
            return Err(Error::InsufficientGood { unavail });
        }

        for (idx, pct) in spzone.iter().enumerate() {
            if let Some(pct) = *pct {
                let class = mpool_common::MediaClass::from_repr(idx as u8)
                    .expect("class index in range");
                devices.set_spzone(class, pct)?;
            }
        }

        Ok(())
    }

    /// Match the staged drive list against the drives actually present
    fn reconcile_drives(
        &self,
        devices: &mut Devices,
        staged: &HashMap<Uuid, DriveRec>,
    ) -> Result<()> {
        // a present drive not claimed by any record is a zombie
        for pd in &mut devices.pdv {
            pd.state = DriveState::Defunct;
        }

        for (devid, drec) in staged {
            if drec.state == DriveState::Defunct {
                continue;
            }
            match devices.drive_by_uuid(devid) {
                Some(pdh) => {
                    let pd = &mut devices.pdv[pdh];
                    pd.state = drec.state;
                    if !pd.parms.same_class_parms(&drec.parms) {
                        if pd.state == DriveState::Unavail {
                            warn!(pool = %self.name, %devid,
                                "unavailable drive parameters do not match drive list record");
                        } else {
                            return Err(Error::ParmMismatch { devid: *devid });
                        }
                    }
                }
                None if drec.state == DriveState::Unavail => {
                    devices.add_unavail(format!("unavail-{devid}"), drec.parms);
                }
                None => {
                    // recorded active but not present
                    return Err(Error::Zombie { devid: *devid });
                }
            }
        }

        for pd in &devices.pdv {
            if pd.state == DriveState::Defunct {
                return Err(Error::Zombie {
                    devid: pd.parms.devid,
                });
            }
        }
        Ok(())
    }

    /// Replay the object records of one MDC
    pub(crate) fn objs_load(&self, cslot: u8) -> Result<()> {
        let slot = self.mda.slot(cslot);

        if cslot > 0 {
            let (logid1, logid2) = mdc_logids(cslot);
            let log = self.store.open(logid1, logid2)?;
            slot.open_log(log);
        }

        {
            let mut log = slot.log.lock();
            let mdc = log
                .mdc
                .as_mut()
                .ok_or_else(|| Error::critical(format!("MDC{cslot} log closed")))?;
            mdc.rewind()?;

            let mut buf = [0u8; MAX_REC_LEN];
            let mut first = true;
            loop {
                let rlen = mdc.read_rec(&mut buf)?;
                if rlen == 0 {
                    break;
                }
                let rec = &buf[..rlen];
                let rtype = peek_type(rec)
                    .map_err(|err| Error::corrupt(format!("MDC{cslot}: {err}")))?;

                if rtype == RecType::Version {
                    if !first {
                        return Err(Error::corrupt(format!(
                            "MDC{cslot}: VERSION record not first"
                        )));
                    }
                    first = false;
                    let ver = *slot.mdccver.lock();
                    if let MdcRecord::Version(v) = MdcRecord::unpack(rec, ver)? {
                        if v > MdccVer::LATEST {
                            return Err(Error::UnsupportedVersion {
                                found: v.to_string(),
                                latest: MdccVer::LATEST.to_string(),
                            });
                        }
                        *slot.mdccver.lock() = v;
                    }
                    continue;
                }
                first = false;

                // property records belong to the MDC0 property replay
                if cslot == 0 && !rtype.is_object() {
                    continue;
                }

                let ver = *slot.mdccver.lock();
                let rec = MdcRecord::unpack(rec, ver)
                    .map_err(|err| Error::corrupt(format!("MDC{cslot}: {err}")))?;
                self.replay_record(cslot, rec)?;
            }
        }

        self.objs_load_finish(cslot)
    }

    /// Apply one object record to the in-memory state
    fn replay_record(&self, cslot: u8, rec: MdcRecord) -> Result<()> {
        let slot = self.mda.slot(cslot);

        let objid = match &rec {
            MdcRecord::OCreate(lrec) | MdcRecord::OUpdate(lrec) => lrec.objid,
            MdcRecord::ODelete(objid) | MdcRecord::OidCkpt(objid) => *objid,
            MdcRecord::OErase { objid, .. } => *objid,
            other => {
                return Err(Error::corrupt(format!(
                    "MDC{cslot}: unexpected {:?} record in object replay",
                    other.rectype()
                )));
            }
        };
        if objid.slot() != cslot {
            return Err(Error::corrupt(format!(
                "MDC{cslot}: record for {objid} belongs to slot {}",
                objid.slot()
            )));
        }

        match rec {
            MdcRecord::OCreate(lrec) => {
                let layout = self.layout_from_rec(cslot, &lrec)?;
                if slot.cobj.write().insert(layout).is_some() {
                    return Err(Error::corrupt(format!(
                        "MDC{cslot}: OCREATE duplicate object {objid}"
                    )));
                }
                slot.pco.cr.fetch_add(1, Ordering::Relaxed);
                slot.pco.cobj.fetch_add(1, Ordering::Relaxed);
            }
            MdcRecord::ODelete(_) => {
                if slot.cobj.write().remove(objid).is_none() {
                    return Err(Error::corrupt(format!(
                        "MDC{cslot}: ODELETE of unknown object {objid}"
                    )));
                }
                slot.pco.del.fetch_add(1, Ordering::Relaxed);
                slot.pco.cobj.fetch_sub(1, Ordering::Relaxed);
            }
            MdcRecord::OErase { gen, .. } => {
                let layout = slot.cobj.read().find(objid).ok_or_else(|| {
                    Error::corrupt(format!("MDC{cslot}: OERASE of unknown object {objid}"))
                })?;
                // gen equality is legal right after a compaction
                if gen < layout.gen() {
                    return Err(Error::corrupt(format!(
                        "MDC{cslot}: OERASE gen {gen} below layout gen {} for {objid}",
                        layout.gen()
                    )));
                }
                layout.set_gen(gen);
                slot.pco.er.fetch_add(1, Ordering::Relaxed);
            }
            MdcRecord::OUpdate(lrec) => {
                let layout = self.layout_from_rec(cslot, &lrec)?;
                let mut cobj = slot.cobj.write();
                if cobj.remove(objid).is_none() {
                    return Err(Error::corrupt(format!(
                        "MDC{cslot}: OUPDATE of unknown object {objid}"
                    )));
                }
                cobj.insert(layout);
                slot.pco.up.fetch_add(1, Ordering::Relaxed);
            }
            MdcRecord::OidCkpt(_) => {
                let lckpt = slot.lckpt();
                // a zero/zero pair is written by upgrade compaction of an
                // empty MDC and is legal
                if (objid.uniq() != 0 || lckpt.uniq() != 0) && objid.uniq() <= lckpt.uniq() {
                    return Err(Error::corrupt(format!(
                        "MDC{cslot}: OIDCKPT uniq {} not above checkpoint {}",
                        objid.uniq(),
                        lckpt.uniq()
                    )));
                }
                slot.set_lckpt(objid);
            }
            _ => unreachable!("filtered above"),
        }
        Ok(())
    }

    fn layout_from_rec(
        &self,
        cslot: u8,
        lrec: &crate::record::LayoutRec,
    ) -> Result<Arc<ObjLayout>> {
        let pdh = self
            .devices
            .read()
            .drive_by_uuid(&lrec.devid)
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "MDC{cslot}: object {} on unknown drive {}",
                    lrec.objid, lrec.devid
                ))
            })?;
        let layout = ObjLayout::new(lrec.objid, pdh as u16, lrec.zaddr, lrec.zcnt, lrec.gen);
        layout.set_state_bits(LYT_COMMITTED);
        layout.set_refcnt(1);
        Ok(layout)
    }

    /// Post-replay accounting and slot finalization
    fn objs_load_finish(&self, cslot: u8) -> Result<()> {
        let slot = self.mda.slot(cslot);
        let mut mdcmax = 0u64;

        {
            let devices = self.devices.read();
            let cobj = slot.cobj.read();
            for layout in cobj.iter() {
                let objid = layout.objid();
                if objid.slot() != cslot {
                    return Err(Error::corrupt(format!(
                        "MDC{cslot}: indexed layout {objid} belongs to slot {}",
                        objid.slot()
                    )));
                }
                let pd = &devices.pdv[layout.pdh() as usize];
                pd.smap
                    .lock()
                    .insert(layout.zaddr(), u64::from(layout.zcnt()))?;
                slot.stats_add(layout, pd.parms.zone_bytes());

                if cslot == 0 {
                    mdcmax = mdcmax.max(objid.uniq() >> 1);
                }
            }
        }
        slot.refresh_usage();

        if cslot == 0 {
            *slot.uq.lock() = mdcmax;
            self.mda.set_slotvcnt(mdcmax as u16 + 1);
            self.mdc0_validate(true)?;
        } else {
            // guaranteed above any uniq handed out before the crash, and
            // the next allocation lands on a checkpoint boundary
            *slot.uq.lock() = slot.lckpt().uniq() + OBJID_CKPT_DELTA - 1;
        }

        debug!(pool = %self.name, cslot, objects = slot.cobj.read().len(), "MDC loaded");
        Ok(())
    }

    /// Check MDC0's backing-mlog census and clean up a torn MDC allocation
    ///
    /// Every MDC below the maximum index must have exactly two backing
    /// mlogs. The maximum may have fewer when an MDC allocation tore; the
    /// leftovers are deleted, and during activation the slot count is
    /// trimmed back.
    pub(crate) fn mdc0_validate(&self, activation: bool) -> Result<()> {
        let slotvcnt = self.mda.slotvcnt();
        if slotvcnt == 0 {
            return Err(Error::invalid_arg("no MDC0"));
        }

        let slot0 = self.mda.slot(0);
        let mut lcnt = [0u32; MDC_SLOTS];
        let mut mdcmax = 0u64;

        {
            let cobj = slot0.cobj.read();
            for layout in cobj.iter() {
                let objid = layout.objid();
                let Some(mdcn) = mdc_logid_slot(objid) else {
                    return Err(Error::corrupt(format!(
                        "MDC0 indexes unexpected object {objid}"
                    )));
                };
                let mdcn = u64::from(mdcn);
                lcnt[mdcn as usize] += 1;
                if lcnt[mdcn as usize] > 2 {
                    return Err(Error::corrupt(format!(
                        "MDC{mdcn} has more than two backing mlogs"
                    )));
                }
                mdcmax = mdcmax.max(mdcn);
            }
        }

        if mdcmax == 0 {
            if lcnt[0] != 2 || slotvcnt != 1 {
                return Err(Error::corrupt(format!(
                    "inconsistent MDC0-only census: {} mlogs, {slotvcnt} slots",
                    lcnt[0]
                )));
            }
            return Ok(());
        }

        if mdcmax != u64::from(slotvcnt - 1) && mdcmax != u64::from(slotvcnt) {
            return Err(Error::corrupt(format!(
                "max MDC index {mdcmax} inconsistent with {slotvcnt} slots"
            )));
        }

        for (mdcn, &cnt) in lcnt.iter().enumerate().take(mdcmax as usize) {
            if cnt != 2 {
                return Err(Error::corrupt(format!(
                    "MDC{mdcn} is missing backing mlogs ({cnt} of 2)"
                )));
            }
        }

        if lcnt[mdcmax as usize] != 2 || mdcmax == u64::from(slotvcnt) {
            // torn MDC allocation from a prior run
            let (logid1, logid2) = mdc_logids(mdcmax as u8);
            let mut first_err = None;

            for logid in [logid1, logid2] {
                if let Ok(layout) = self.obj_find_get(logid) {
                    if let Err(err) = self.obj_delete(&layout) {
                        warn!(pool = %self.name, %logid, %err, "torn MDC mlog delete failed");
                        first_err.get_or_insert(err);
                    }
                }
            }

            if activation {
                // activation is single threaded and tolerates cleanup
                // failure; trim the visible slots back
                *slot0.uq.lock() = mdcmax - 1;
                self.mda.set_slotvcnt(mdcmax as u16);
                warn!(pool = %self.name, mdcmax, "recovered from torn MDC allocation");
            } else if let Some(err) = first_err {
                return Err(err);
            }
        }

        Ok(())
    }

    /// Load every user MDC with a small worker pool
    fn objs_load_parallel(&self) -> Result<()> {
        let slotvcnt = self.mda.slotvcnt();
        if slotvcnt < 2 {
            return Ok(());
        }

        let njobs = self
            .params
            .objloadjobs
            .clamp(1, u32::from(slotvcnt) - 1) as usize;
        let progress = AtomicU16::new(1);
        let failure: Mutex<Option<Error>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..njobs {
                scope.spawn(|| loop {
                    if failure.lock().is_some() {
                        break;
                    }
                    let sidx = progress.fetch_add(1, Ordering::SeqCst);
                    if sidx >= slotvcnt {
                        break;
                    }
                    if let Err(err) = self.objs_load(sidx as u8) {
                        let mut first = failure.lock();
                        if first.is_none() {
                            *first = Some(err);
                        }
                        break;
                    }
                });
            }
        });

        match failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close every MDC and drop in-memory state, MDC0 last
    ///
    /// Closing MDCi for i > 0 can still append to MDC0, so teardown walks
    /// the slots in reverse.
    pub(crate) fn mda_free(&self) {
        let slotvcnt = self.mda.slotvcnt();
        for sidx in (0..slotvcnt).rev() {
            let slot = self.mda.slot(sidx as u8);
            slot.close_log();
            slot.cobj.write().clear();
            slot.uncobj.lock().clear();
        }
        self.mda.set_slotvcnt(0);
    }
}
