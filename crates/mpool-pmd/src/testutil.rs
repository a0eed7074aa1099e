//! Shared fixtures for the in-crate tests

use std::sync::Arc;

use mpool_common::{DriveParms, MediaClass, PmdParams, PoolConfig, Result};
use uuid::Uuid;

use crate::lifecycle::{ActivateSpec, Mdc0Layout};
use crate::mem::MemStore;
use crate::pool::Mpool;

/// Zones of 1 MiB: 256 pages of 4 KiB
pub const ZONEPG: u32 = 256;

/// One-capacity-drive test fixture over a shared in-memory store
pub struct TestPool {
    pub store: Arc<MemStore>,
    pub drives: Vec<(String, DriveParms)>,
    pub params: PmdParams,
    pub cfg: PoolConfig,
}

pub fn drive_parms(class: MediaClass, zone_count: u64) -> DriveParms {
    DriveParms {
        devid: Uuid::new_v4(),
        class,
        zonepg: ZONEPG,
        sector_size: 4096,
        devtype: 1,
        features: 0,
        zone_count,
        devsz: zone_count * u64::from(ZONEPG) * 4096,
    }
}

impl TestPool {
    /// One capacity drive with `zone_count` 1 MiB zones
    pub fn new(zone_count: u64, log_cap: u64) -> Self {
        Self::with_drives(
            vec![("pd0".to_string(), drive_parms(MediaClass::Capacity, zone_count))],
            log_cap,
        )
    }

    pub fn with_drives(drives: Vec<(String, DriveParms)>, log_cap: u64) -> Self {
        Self {
            store: Arc::new(MemStore::new(log_cap)),
            drives,
            params: PmdParams::default(),
            cfg: PoolConfig {
                pool_id: Uuid::new_v4(),
                label: "test".to_string(),
            },
        }
    }

    fn spec(&self, create: bool) -> ActivateSpec {
        ActivateSpec {
            name: "mp-test".to_string(),
            create,
            drives: self.drives.clone(),
            // MDC0's pair occupies the first two zones of drive 0
            mdc0: [
                Mdc0Layout {
                    pdh: 0,
                    zaddr: 0,
                    zcnt: 1,
                    gen: 1,
                },
                Mdc0Layout {
                    pdh: 0,
                    zaddr: 1,
                    zcnt: 1,
                    gen: 1,
                },
            ],
            params: self.params.clone(),
            cfg: self.cfg.clone(),
        }
    }

    /// Activate without writing anything: fresh pool, no user MDC yet
    pub fn activate_raw(&self, create: bool) -> Result<Mpool> {
        Mpool::activate(self.spec(create), self.store(), self.io())
    }

    /// Create the pool: activate fresh, persist the property records, and
    /// allocate the first user MDC
    pub fn create(&self) -> Mpool {
        let mp = self.activate_raw(true).expect("fresh activation");

        for pdh in 0..self.drives.len() {
            mp.prop_mcconfig(pdh as u16).expect("mcconfig");
        }
        mp.prop_mpconfig(&self.cfg).expect("mpconfig");
        mp.mdc_alloc(self.params.mdcncap, 0).expect("first MDC");
        mp
    }

    /// Re-activate over the surviving media
    pub fn reactivate(&self) -> Result<Mpool> {
        self.activate_raw(false)
    }

    fn store(&self) -> Arc<dyn crate::mdc::MdcStore> {
        Arc::clone(&self.store) as Arc<dyn crate::mdc::MdcStore>
    }

    fn io(&self) -> Arc<dyn crate::mdc::ObjectIo> {
        Arc::clone(&self.store) as Arc<dyn crate::mdc::ObjectIo>
    }
}
