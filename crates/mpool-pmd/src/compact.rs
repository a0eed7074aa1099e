//! MDC log engine: record append and compaction
//!
//! Every mutation of pool metadata funnels through [`MpoolCore::mdc_addrec`]:
//! pack, append with sync, and on an active-mlog overflow compact the MDC
//! once and retry. Compaction rewrites the net state into the inactive
//! mlog under the slot's compact lock:
//!
//! 1. reopen the log if a prior failure closed it
//! 2. `cstart`
//! 3. a VERSION record
//! 4. MDC0: one MCCONFIG per live drive, one MCSPARE per populated class,
//!    then the pool config; MDCi: the objid checkpoint
//! 5. one OCREATE per committed object, in objid order
//! 6. `cend`, which flushes and atomically swaps the mlog roles
//!
//! Everything between `cstart` and `cend` appends without sync; `cend` is
//! the barrier. Records written by the compactor must never re-enter
//! `mdc_addrec` or a nested compaction of the same MDC would deadlock.

use mpool_common::{DriveState, Error, MediaClass, PoolConfig, Result};
use tracing::{debug, error, warn};

use crate::mda::MDC_SLOTS;
use crate::mdc::MetaLog;
use crate::objid::mdc_logids;
use crate::pool::MpoolCore;
use crate::record::{DriveRec, LayoutRec, MdcRecord};
use crate::version::MdccVer;

/// Attempts before a compaction failure is considered permanent
pub const COMPACT_RETRY_MAX: u32 = 5;

impl MpoolCore {
    /// Append one record to an MDC without triggering compaction
    pub(crate) fn mdc_append(&self, cslot: u8, rec: &MdcRecord, sync: bool) -> Result<()> {
        self.mda.slot(cslot).append_rec(rec, sync)
    }

    /// Append one record, compacting once on overflow
    ///
    /// Caller holds the slot's compact lock.
    pub(crate) fn mdc_addrec(&self, cslot: u8, rec: &MdcRecord) -> Result<()> {
        match self.mdc_append(cslot, rec, true) {
            Err(err) if err.is_too_big() => {
                self.mdc_compact(cslot)?;
                let result = self.mdc_append(cslot, rec, true);
                if let Err(err) = &result {
                    warn!(pool = %self.name, cslot, %err, "append failed post compaction");
                }
                result
            }
            result => {
                if let Err(err) = &result {
                    warn!(pool = %self.name, cslot, %err, "append failed");
                }
                result
            }
        }
    }

    /// Append the latest VERSION record through the addrec path
    pub(crate) fn mdc_addrec_version(&self, cslot: u8) -> Result<()> {
        self.mdc_addrec(cslot, &MdcRecord::Version(MdccVer::LATEST))
    }

    /// Compact MDC `cslot`; caller holds the slot's compact lock
    pub(crate) fn mdc_compact(&self, cslot: u8) -> Result<()> {
        let slot = self.mda.slot(cslot);
        let (logid1, logid2) = mdc_logids(cslot);
        let mut result = Ok(());

        for retry in 0..COMPACT_RETRY_MAX {
            if !slot.is_log_open() {
                match self.store.open(logid1, logid2) {
                    Ok(log) => slot.open_log(log),
                    Err(err) => {
                        result = Err(err);
                        continue;
                    }
                }
            }

            match self.compact_once(cslot) {
                Ok(compacted) => {
                    if cslot > 0 {
                        slot.pco_reset(compacted);
                    }
                    *slot.mdccver.lock() = MdccVer::LATEST;
                    slot.refresh_usage();
                    debug!(pool = %self.name, cslot, compacted, retry, "MDC compacted");
                    return Ok(());
                }
                Err(err) => {
                    warn!(pool = %self.name, cslot, retry, %err, "MDC compaction attempt failed");
                    slot.close_log();
                    result = Err(err);
                }
            }
        }

        error!(pool = %self.name, cslot, "MDC compaction failed permanently");
        result
    }

    /// One compaction attempt; returns the count of re-emitted OCREATEs
    fn compact_once(&self, cslot: u8) -> Result<u32> {
        let slot = self.mda.slot(cslot);

        self.with_log(cslot, |log| log.cstart())?;

        if MdccVer::LATEST >= MdccVer::VERSIONED {
            slot.append_rec(&MdcRecord::Version(MdccVer::LATEST), false)?;
        }

        if cslot == 0 {
            self.log_mdc0_preamble()?;
        } else {
            // the checkpoint guards objid uniqueness across the swap
            slot.append_rec(&MdcRecord::OidCkpt(slot.lckpt()), false)?;
        }

        let (compacted, total) = self.log_committed(cslot)?;
        debug!(pool = %self.name, cslot, compacted, total, "compaction sweep complete");

        self.with_log(cslot, |log| log.cend())?;
        Ok(compacted)
    }

    fn with_log<F>(&self, cslot: u8, op: F) -> Result<()>
    where
        F: FnOnce(&mut dyn MetaLog) -> Result<()>,
    {
        let mut log = self.mda.slot(cslot).log.lock();
        let mdc = log
            .mdc
            .as_mut()
            .ok_or_else(|| Error::critical("MDC log closed"))?;
        op(mdc.as_mut())
    }

    /// MDC0 compaction preamble: drive list, class spares, pool config
    fn log_mdc0_preamble(&self) -> Result<()> {
        let (drecs, spares) = {
            let devices = self.devices.read();
            let drecs: Vec<DriveRec> = devices
                .pdv
                .iter()
                .filter(|pd| pd.state != DriveState::Defunct)
                .map(|pd| DriveRec {
                    state: pd.state,
                    parms: pd.parms,
                })
                .collect();
            let spares: Vec<(MediaClass, u8)> = devices
                .classes
                .iter()
                .enumerate()
                .filter(|(_, info)| info.pdmc.is_some())
                .map(|(idx, info)| {
                    (
                        MediaClass::from_repr(idx as u8).expect("class index in range"),
                        info.spzone,
                    )
                })
                .collect();
            (drecs, spares)
        };

        let slot0 = self.mda.slot(0);
        for drec in drecs {
            slot0.append_rec(&MdcRecord::McConfig(drec), false)?;
        }
        for (mclassp, spzone) in spares {
            slot0.append_rec(&MdcRecord::McSpare { class: mclassp, spzone }, false)?;
        }
        let cfg = self.cfg.lock().clone();
        slot0.append_rec(&MdcRecord::MpConfig(cfg), false)?;
        Ok(())
    }

    /// Re-emit one OCREATE per committed object, in objid order
    fn log_committed(&self, cslot: u8) -> Result<(u32, u32)> {
        let slot = self.mda.slot(cslot);
        let devices = self.devices.read();
        let cobj = slot.cobj.read();

        let mut compacted = 0u32;
        let mut total = 0u32;
        for layout in cobj.iter() {
            total += 1;
            if layout.objid().is_mdc0_log() {
                // MDC0's own mlogs live in superblocks, not in its log
                continue;
            }
            let rec = MdcRecord::OCreate(LayoutRec {
                objid: layout.objid(),
                gen: layout.gen(),
                devid: devices.pdv[layout.pdh() as usize].parms.devid,
                zaddr: layout.zaddr(),
                zcnt: layout.zcnt(),
            });
            slot.append_rec(&rec, false)?;
            compacted += 1;
        }

        Ok((compacted, total))
    }

    /// Persist a drive configuration record into MDC0
    ///
    /// `compacting` selects the no-sync append used from inside an MDC0
    /// compaction; the live path syncs and may itself compact.
    pub(crate) fn prop_mcconfig(&self, pdh: u16, compacting: bool) -> Result<()> {
        let rec = {
            let devices = self.devices.read();
            let pd = devices
                .pdv
                .get(pdh as usize)
                .ok_or_else(|| Error::invalid_arg(format!("no drive {pdh}")))?;
            MdcRecord::McConfig(DriveRec {
                state: pd.state,
                parms: pd.parms,
            })
        };
        if compacting {
            self.mdc_append(0, &rec, false)
        } else {
            let _compact = self.mda.slot(0).compactlock.lock();
            self.mdc_addrec(0, &rec)
        }
    }

    /// Persist (and on the live path apply) a class spare percentage
    pub(crate) fn prop_mcspare(&self, mclassp: MediaClass, spzone: u8, compacting: bool) -> Result<()> {
        if spzone > 100 {
            return Err(Error::invalid_arg(format!("spare percent {spzone} > 100")));
        }
        let rec = MdcRecord::McSpare {
            class: mclassp,
            spzone,
        };
        if compacting {
            self.mdc_append(0, &rec, false)
        } else {
            {
                let _compact = self.mda.slot(0).compactlock.lock();
                self.mdc_addrec(0, &rec)?;
            }
            self.devices.write().set_spzone(mclassp, spzone)
        }
    }

    /// Persist the pool configuration
    pub(crate) fn prop_mpconfig(&self, cfg: &PoolConfig, compacting: bool) -> Result<()> {
        let rec = MdcRecord::MpConfig(cfg.clone());
        if compacting {
            self.mdc_append(0, &rec, false)
        } else {
            {
                let _compact = self.mda.slot(0).compactlock.lock();
                self.mdc_addrec(0, &rec)?;
            }
            *self.cfg.lock() = cfg.clone();
            Ok(())
        }
    }

    /// Compact every MDC whose on-media version predates this binary
    ///
    /// MDC0 goes first so MDCi compactions never mix old and new records
    /// into it.
    pub(crate) fn write_meta_to_latest(&self, permitted: bool) -> Result<()> {
        let slotvcnt = self.mda.slotvcnt();
        for cslot in 0..slotvcnt {
            debug_assert!((cslot as usize) < MDC_SLOTS);
            let slot = self.mda.slot(cslot as u8);
            let ver = *slot.mdccver.lock();
            if ver == MdccVer::LATEST {
                continue;
            }
            if !permitted {
                return Err(Error::PermissionDenied(format!(
                    "metadata upgrade needed from version {ver} to {}",
                    MdccVer::LATEST
                )));
            }
            tracing::info!(pool = %self.name, cslot, %ver, latest = %MdccVer::LATEST,
                "upgrading MDC metadata");
            let _compact = slot.compactlock.lock();
            self.mdc_compact(cslot as u8)?;
        }
        Ok(())
    }
}
