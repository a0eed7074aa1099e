//! Drive table and media classes
//!
//! The drive table owns every drive descriptor of the pool plus the derived
//! per-class state (allocation target drive, spare percentage, unavailable
//! count). One reader-writer lock covers the whole table: the allocation
//! path holds it for read; mutation only happens during activation, which
//! is single threaded.

use mpool_common::{DriveParms, DriveState, Error, MediaClass, Result, MED_NUMBER};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;
use uuid::Uuid;

use crate::smap::ZoneMap;

/// Default spare-zone percentage applied until an MCSPARE record overrides it
pub const DEFAULT_SPARE_PCT: u8 = 5;

/// Default zone-count alignment target for allocations in a class
pub const DEFAULT_SMAP_ALIGN: u64 = 8;

/// One pool drive
pub struct Drive {
    pub name: String,
    pub parms: DriveParms,
    pub state: DriveState,
    /// Zone space map; empty until smap initialization, and for drives
    /// that are unavailable
    pub smap: Mutex<ZoneMap>,
}

impl Drive {
    fn new(name: String, parms: DriveParms, state: DriveState) -> Self {
        Self {
            name,
            parms,
            state,
            smap: Mutex::new(ZoneMap::new(0, 0)),
        }
    }
}

/// Derived per-class state
#[derive(Clone, Copy, Debug)]
pub struct ClassInfo {
    /// Allocation target drive for this class
    pub pdmc: Option<usize>,
    /// Spare-zone percentage for the class
    pub spzone: u8,
    /// Zone-count alignment target
    pub smap_align: u64,
    /// Count of unavailable drives in the class
    pub uacnt: u32,
}

impl Default for ClassInfo {
    fn default() -> Self {
        Self {
            pdmc: None,
            spzone: DEFAULT_SPARE_PCT,
            smap_align: DEFAULT_SMAP_ALIGN,
            uacnt: 0,
        }
    }
}

/// The guarded interior of the drive table
pub struct Devices {
    pub pdv: Vec<Drive>,
    pub classes: [ClassInfo; MED_NUMBER],
}

impl Devices {
    /// Find a drive handle by UUID
    #[must_use]
    pub fn drive_by_uuid(&self, devid: &Uuid) -> Option<usize> {
        self.pdv.iter().position(|pd| pd.parms.devid == *devid)
    }

    /// Bytes per zone on a drive
    #[must_use]
    pub fn zone_bytes(&self, pdh: u16) -> u64 {
        self.pdv[pdh as usize].parms.zone_bytes()
    }

    /// Add a drive known to the pool but not present at activation
    pub fn add_unavail(&mut self, name: String, parms: DriveParms) {
        warn!(devid = %parms.devid, "drive unavailable, adding placeholder");
        self.pdv.push(Drive::new(name, parms, DriveState::Unavail));
    }

    /// Recompute per-class derived state from the drive list
    pub fn recompute_classes(&mut self) {
        for class in &mut self.classes {
            class.pdmc = None;
            class.uacnt = 0;
        }
        for (pdh, pd) in self.pdv.iter().enumerate() {
            let class = &mut self.classes[pd.parms.class.index()];
            match pd.state {
                DriveState::Active => {
                    if class.pdmc.is_none() {
                        class.pdmc = Some(pdh);
                    }
                }
                DriveState::Unavail => class.uacnt += 1,
                DriveState::Defunct => {}
            }
        }
    }

    /// Largest per-class unavailable count
    #[must_use]
    pub fn max_uacnt(&self) -> u32 {
        self.classes.iter().map(|c| c.uacnt).max().unwrap_or(0)
    }

    /// Size the zone maps of all pool drives
    ///
    /// Called once activation has finalized the drive list. Unavailable
    /// drives get a map too so replay can account their layouts; they are
    /// never an allocation target.
    pub fn init_smaps(&mut self) {
        for pd in &mut self.pdv {
            if pd.state != DriveState::Defunct {
                let spzone = self.classes[pd.parms.class.index()].spzone;
                *pd.smap.lock() = ZoneMap::new(pd.parms.zone_count, spzone);
            }
        }
    }

    /// Apply a spare percentage to a class and its drives
    pub fn set_spzone(&mut self, class: MediaClass, pct: u8) -> Result<()> {
        if pct > 100 {
            return Err(Error::invalid_arg(format!("spare percent {pct} > 100")));
        }
        let info = &mut self.classes[class.index()];
        if info.pdmc.is_none() {
            return Err(Error::invalid_arg(format!(
                "media class {class:?} has no drive"
            )));
        }
        info.spzone = pct;
        for pd in &self.pdv {
            if pd.parms.class == class && pd.state == DriveState::Active {
                pd.smap.lock().set_spare_pct(pct);
            }
        }
        Ok(())
    }
}

/// The pool drive table
pub struct DeviceTable {
    inner: RwLock<Devices>,
}

impl DeviceTable {
    /// Build the table from the drives handed to activation, all active
    #[must_use]
    pub fn new(drives: Vec<(String, DriveParms)>) -> Self {
        let pdv = drives
            .into_iter()
            .map(|(name, parms)| Drive::new(name, parms, DriveState::Active))
            .collect();
        let mut devices = Devices {
            pdv,
            classes: [ClassInfo::default(); MED_NUMBER],
        };
        devices.recompute_classes();
        Self {
            inner: RwLock::new(devices),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Devices> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Devices> {
        self.inner.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parms(class: MediaClass, zones: u64) -> DriveParms {
        DriveParms {
            devid: Uuid::new_v4(),
            class,
            zonepg: 256,
            sector_size: 4096,
            devtype: 1,
            features: 0,
            zone_count: zones,
            devsz: zones * 256 * 4096,
        }
    }

    #[test]
    fn test_class_assignment() {
        let table = DeviceTable::new(vec![
            ("pd0".into(), parms(MediaClass::Capacity, 128)),
            ("pd1".into(), parms(MediaClass::Staging, 64)),
            ("pd2".into(), parms(MediaClass::Capacity, 128)),
        ]);

        let devices = table.read();
        assert_eq!(devices.classes[MediaClass::Capacity.index()].pdmc, Some(0));
        assert_eq!(devices.classes[MediaClass::Staging.index()].pdmc, Some(1));
    }

    #[test]
    fn test_unavail_counts() {
        let table = DeviceTable::new(vec![("pd0".into(), parms(MediaClass::Capacity, 128))]);
        {
            let mut devices = table.write();
            devices.add_unavail("pd1".into(), parms(MediaClass::Capacity, 128));
            devices.add_unavail("pd2".into(), parms(MediaClass::Staging, 64));
            devices.recompute_classes();
        }
        let devices = table.read();
        assert_eq!(devices.classes[MediaClass::Capacity.index()].uacnt, 1);
        assert_eq!(devices.classes[MediaClass::Staging.index()].uacnt, 1);
        assert_eq!(devices.max_uacnt(), 1);
        // unavailable drives never become the allocation target
        assert_eq!(devices.classes[MediaClass::Staging.index()].pdmc, None);
    }

    #[test]
    fn test_smap_init_and_spzone() {
        let table = DeviceTable::new(vec![("pd0".into(), parms(MediaClass::Capacity, 100))]);
        {
            let mut devices = table.write();
            devices.init_smaps();
            devices.set_spzone(MediaClass::Capacity, 10).unwrap();
        }

        let devices = table.read();
        let mut smap = devices.pdv[0].smap.lock();
        assert_eq!(smap.total_zones(), 100);
        // 10% spare leaves 90 usable
        assert!(smap.alloc(91, crate::smap::SpcType::UsableOnly, 1).is_err());
        assert!(smap.alloc(90, crate::smap::SpcType::UsableOnly, 1).is_ok());
    }

    #[test]
    fn test_set_spzone_requires_drive() {
        let table = DeviceTable::new(vec![("pd0".into(), parms(MediaClass::Capacity, 100))]);
        let mut devices = table.write();
        assert!(devices.set_spzone(MediaClass::Staging, 10).is_err());
    }
}
