//! Drive and media class types
//!
//! A pool aggregates block drives ("pd") into media classes. Each drive
//! advertises fixed parameters at activation; the metadata core compares
//! them against the persisted drive list when a pool is re-activated.

use uuid::Uuid;

/// Number of media classes a pool can hold
pub const MED_NUMBER: usize = 2;

/// Zone addressing granularity: zones are counted in 4 KiB pages
pub const PAGE_SHIFT: u32 = 12;

/// Performance class of a drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaClass {
    /// Fast tier, typically NVMe
    Staging = 0,
    /// Bulk tier
    Capacity = 1,
}

impl MediaClass {
    /// Decode from the on-media representation
    #[must_use]
    pub fn from_repr(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Staging),
            1 => Some(Self::Capacity),
            _ => None,
        }
    }

    /// Next class in fallback order (staging falls back to capacity)
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Staging => Some(Self::Capacity),
            Self::Capacity => None,
        }
    }

    /// Index into per-class arrays
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle state of a pool drive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DriveState {
    /// Drive present and usable
    Active = 0,
    /// Drive listed in pool metadata but not currently present
    Unavail = 1,
    /// Drive removed from the pool
    Defunct = 2,
}

impl DriveState {
    /// Decode from the on-media representation
    #[must_use]
    pub fn from_repr(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Active),
            1 => Some(Self::Unavail),
            2 => Some(Self::Defunct),
            _ => None,
        }
    }
}

/// Fixed parameters of a pool drive
///
/// These are written to the pool drive list (MCCONFIG records) and must
/// match what the drive itself reports on every subsequent activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriveParms {
    /// Unique drive identifier
    pub devid: Uuid,
    /// Media class this drive belongs to
    pub class: MediaClass,
    /// Pages per zone
    pub zonepg: u32,
    /// Sector size in bytes
    pub sector_size: u32,
    /// Device type discriminator
    pub devtype: u8,
    /// Device feature flags
    pub features: u64,
    /// Total zones on the drive
    pub zone_count: u64,
    /// Raw device size in bytes
    pub devsz: u64,
}

impl DriveParms {
    /// Bytes per zone
    #[must_use]
    pub fn zone_bytes(&self) -> u64 {
        u64::from(self.zonepg) << PAGE_SHIFT
    }

    /// Compare the class-defining parameters against another set
    ///
    /// Size fields are excluded: a drive may be grown without changing
    /// its identity.
    #[must_use]
    pub fn same_class_parms(&self, other: &DriveParms) -> bool {
        self.class == other.class
            && self.zonepg == other.zonepg
            && self.sector_size == other.sector_size
            && self.devtype == other.devtype
            && self.features == other.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parms(class: MediaClass) -> DriveParms {
        DriveParms {
            devid: Uuid::new_v4(),
            class,
            zonepg: 256,
            sector_size: 4096,
            devtype: 1,
            features: 0,
            zone_count: 1024,
            devsz: 1 << 30,
        }
    }

    #[test]
    fn test_zone_bytes() {
        let p = parms(MediaClass::Capacity);
        assert_eq!(p.zone_bytes(), 256 * 4096);
    }

    #[test]
    fn test_class_fallback_order() {
        assert_eq!(MediaClass::Staging.next(), Some(MediaClass::Capacity));
        assert_eq!(MediaClass::Capacity.next(), None);
    }

    #[test]
    fn test_same_class_parms_ignores_size() {
        let a = parms(MediaClass::Capacity);
        let mut b = a;
        b.zone_count = 4096;
        b.devsz = 4 << 30;
        assert!(a.same_class_parms(&b));

        b.zonepg = 128;
        assert!(!a.same_class_parms(&b));
    }

    #[test]
    fn test_state_repr_roundtrip() {
        for st in [DriveState::Active, DriveState::Unavail, DriveState::Defunct] {
            assert_eq!(DriveState::from_repr(st as u8), Some(st));
        }
        assert_eq!(DriveState::from_repr(9), None);
    }
}
