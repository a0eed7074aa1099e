//! Per-drive zone space map
//!
//! Tracks zone allocation on one drive with a bitmap (one bit per zone,
//! 0 = free, 1 = used) and a usable/spare budget split. Allocation returns
//! contiguous, aligned runs; replay re-inserts the zones of surviving
//! objects before any new allocation happens.

use mpool_common::{Error, Result};

/// Which budget an allocation may draw from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpcType {
    /// Only the usable budget
    UsableOnly,
    /// Usable budget plus the spare reserve
    Spare2Usable,
}

/// Zone allocation bitmap for one drive
pub struct ZoneMap {
    bits: Vec<u8>,
    total: u64,
    /// Zones allocatable without touching the spare reserve
    usable: u64,
    used: u64,
    /// Next-fit search hint
    hint: u64,
}

impl ZoneMap {
    /// Create a map with all zones free and `spzone_pct` percent held spare
    #[must_use]
    pub fn new(total_zones: u64, spzone_pct: u8) -> Self {
        let bytes = total_zones.div_ceil(8) as usize;
        let mut zm = Self {
            bits: vec![0u8; bytes],
            total: total_zones,
            usable: total_zones,
            used: 0,
            hint: 0,
        };
        zm.set_spare_pct(spzone_pct);
        zm
    }

    /// Adjust the spare reserve percentage
    pub fn set_spare_pct(&mut self, pct: u8) {
        let pct = u64::from(pct.min(100));
        self.usable = self.total - self.total * pct / 100;
    }

    /// Total zones tracked by this map
    #[must_use]
    pub fn total_zones(&self) -> u64 {
        self.total
    }

    /// Currently free zones (usable and spare)
    #[must_use]
    pub fn free_zones(&self) -> u64 {
        self.total - self.used
    }

    /// Allocate `zcnt` contiguous zones starting at a multiple of `align`
    pub fn alloc(&mut self, zcnt: u64, spc: SpcType, align: u64) -> Result<u64> {
        if zcnt == 0 {
            return Err(Error::invalid_arg("zero-zone allocation"));
        }
        let align = align.max(1);

        let budget = match spc {
            SpcType::UsableOnly => self.usable,
            SpcType::Spare2Usable => self.total,
        };
        if self.used + zcnt > budget {
            return Err(Error::NoSpace);
        }

        // next-fit from the hint, then wrap
        let start_hint = self.hint - self.hint % align;
        if let Some(zaddr) = self.scan(start_hint, self.total, zcnt, align) {
            self.take(zaddr, zcnt);
            return Ok(zaddr);
        }
        if let Some(zaddr) = self.scan(0, start_hint, zcnt, align) {
            self.take(zaddr, zcnt);
            return Ok(zaddr);
        }

        Err(Error::NoSpace)
    }

    /// Release a previously allocated run
    pub fn free_range(&mut self, zaddr: u64, zcnt: u64) -> Result<()> {
        if zaddr + zcnt > self.total {
            return Err(Error::invalid_arg(format!(
                "free of zones {zaddr}..{} beyond drive end {}",
                zaddr + zcnt,
                self.total
            )));
        }
        for z in zaddr..zaddr + zcnt {
            if !self.bit(z) {
                return Err(Error::critical(format!("double free of zone {z}")));
            }
            self.set_bit(z, false);
        }
        self.used -= zcnt;
        self.hint = zaddr;
        Ok(())
    }

    /// Mark a run as allocated during replay
    pub fn insert(&mut self, zaddr: u64, zcnt: u64) -> Result<()> {
        if zaddr + zcnt > self.total {
            return Err(Error::corrupt(format!(
                "layout zones {zaddr}..{} beyond drive end {}",
                zaddr + zcnt,
                self.total
            )));
        }
        for z in zaddr..zaddr + zcnt {
            if self.bit(z) {
                return Err(Error::critical(format!(
                    "zone {z} claimed by two layouts"
                )));
            }
        }
        self.take(zaddr, zcnt);
        Ok(())
    }

    fn scan(&self, from: u64, to: u64, zcnt: u64, align: u64) -> Option<u64> {
        let mut zaddr = from + (align - from % align) % align;
        while zaddr + zcnt <= to {
            match self.first_used(zaddr, zcnt) {
                None => return Some(zaddr),
                Some(used) => {
                    // skip past the conflict, keeping alignment
                    let next = used + 1;
                    zaddr = next + (align - next % align) % align;
                }
            }
        }
        None
    }

    fn first_used(&self, zaddr: u64, zcnt: u64) -> Option<u64> {
        (zaddr..zaddr + zcnt).find(|&z| self.bit(z))
    }

    fn take(&mut self, zaddr: u64, zcnt: u64) {
        for z in zaddr..zaddr + zcnt {
            self.set_bit(z, true);
        }
        self.used += zcnt;
        self.hint = zaddr + zcnt;
    }

    fn bit(&self, z: u64) -> bool {
        self.bits[(z / 8) as usize] & (1 << (z % 8)) != 0
    }

    fn set_bit(&mut self, z: u64, val: bool) {
        let byte = &mut self.bits[(z / 8) as usize];
        if val {
            *byte |= 1 << (z % 8);
        } else {
            *byte &= !(1 << (z % 8));
        }
    }
}

/// Round up to the next power of two, saturating at 2^63
#[must_use]
pub fn roundup_pow2(v: u64) -> u64 {
    v.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_contiguous_and_aligned() {
        let mut zm = ZoneMap::new(64, 0);

        let a = zm.alloc(3, SpcType::UsableOnly, 1).unwrap();
        assert_eq!(a, 0);
        let b = zm.alloc(4, SpcType::UsableOnly, 4).unwrap();
        assert_eq!(b % 4, 0);
        assert!(b >= 3);
        assert_eq!(zm.free_zones(), 64 - 7);
    }

    #[test]
    fn test_free_and_reuse() {
        let mut zm = ZoneMap::new(16, 0);
        let a = zm.alloc(8, SpcType::UsableOnly, 1).unwrap();
        let b = zm.alloc(8, SpcType::UsableOnly, 1).unwrap();
        assert!(zm.alloc(1, SpcType::UsableOnly, 1).is_err());

        zm.free_range(a, 8).unwrap();
        let c = zm.alloc(8, SpcType::UsableOnly, 1).unwrap();
        assert_eq!(c, a);
        assert_ne!(b, c);
    }

    #[test]
    fn test_spare_budget() {
        let mut zm = ZoneMap::new(100, 10);

        // only 90 zones usable
        assert!(zm.alloc(91, SpcType::UsableOnly, 1).is_err());
        zm.alloc(90, SpcType::UsableOnly, 1).unwrap();
        assert!(zm.alloc(1, SpcType::UsableOnly, 1).is_err());

        // the spare reserve is reachable when asked for
        zm.alloc(10, SpcType::Spare2Usable, 1).unwrap();
        assert_eq!(zm.free_zones(), 0);
    }

    #[test]
    fn test_insert_detects_overlap() {
        let mut zm = ZoneMap::new(32, 0);
        zm.insert(4, 4).unwrap();
        assert!(zm.insert(6, 2).is_err());
        assert!(zm.insert(30, 4).is_err());

        // inserted zones are not allocatable
        let a = zm.alloc(8, SpcType::UsableOnly, 8).unwrap();
        assert_eq!(a, 8);
    }

    #[test]
    fn test_double_free_is_critical() {
        let mut zm = ZoneMap::new(8, 0);
        let a = zm.alloc(2, SpcType::UsableOnly, 1).unwrap();
        zm.free_range(a, 2).unwrap();
        assert!(matches!(
            zm.free_range(a, 2),
            Err(mpool_common::Error::Critical(_))
        ));
    }

    #[test]
    fn test_roundup_pow2() {
        assert_eq!(roundup_pow2(0), 1);
        assert_eq!(roundup_pow2(1), 1);
        assert_eq!(roundup_pow2(3), 4);
        assert_eq!(roundup_pow2(4), 4);
        assert_eq!(roundup_pow2(5), 8);
    }
}
