//! 64-bit object identifiers
//!
//! Every pool object carries a 64-bit id packing three fields:
//!
//! ```text
//! +-----+----------------+------+------+
//! | 63  | 62..12         | 11..8| 7..0 |
//! | tag | uniq           | type | slot |
//! +-----+----------------+------+------+
//! ```
//!
//! `slot` names the MDC that owns the object (0 is reserved for MDC
//! bookkeeping), `uniq` is a per-slot monotone counter, and the tag bit is
//! zero for object ids and set for user handles. Ids whose `uniq` lands on
//! a checkpoint boundary must be persisted (OIDCKPT) before they are handed
//! out, which is what makes them safe to re-mint after a crash.

use std::fmt;

use mpool_common::{Error, Result};

/// Checkpoint interval for per-slot uniq counters
pub const OBJID_CKPT_DELTA: u64 = 256;

const SLOT_BITS: u32 = 8;
const TYPE_BITS: u32 = 4;
const TYPE_SHIFT: u32 = SLOT_BITS;
const UNIQ_SHIFT: u32 = SLOT_BITS + TYPE_BITS;
const UNIQ_MAX: u64 = (1 << (63 - UNIQ_SHIFT)) - 1;
const UHANDLE_TAG: u64 = 1 << 63;

/// Object type encoded in an object id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjType {
    /// No type; only valid in checkpoint sentinels
    Undef = 0,
    /// Write-once bulk data object
    Mblock = 1,
    /// Append-only log object
    Mlog = 2,
}

impl ObjType {
    /// Decode from the id field
    #[must_use]
    pub fn from_repr(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Undef),
            1 => Some(Self::Mblock),
            2 => Some(Self::Mlog),
            _ => None,
        }
    }

    /// Whether this is a client-visible object type
    #[must_use]
    pub fn is_user(self) -> bool {
        matches!(self, Self::Mblock | Self::Mlog)
    }
}

/// A packed 64-bit object identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjId(u64);

impl ObjId {
    /// Compose an id from its three fields
    #[must_use]
    pub fn new(uniq: u64, otype: ObjType, slot: u8) -> Self {
        debug_assert!(uniq <= UNIQ_MAX);
        Self((uniq << UNIQ_SHIFT) | (u64::from(otype as u8) << TYPE_SHIFT) | u64::from(slot))
    }

    /// Reconstruct from the raw representation
    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw representation
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Per-slot monotone counter field
    #[must_use]
    pub fn uniq(self) -> u64 {
        (self.0 & !UHANDLE_TAG) >> UNIQ_SHIFT
    }

    /// Object type field
    #[must_use]
    pub fn objtype(self) -> ObjType {
        ObjType::from_repr(((self.0 >> TYPE_SHIFT) & ((1 << TYPE_BITS) - 1)) as u8)
            .unwrap_or(ObjType::Undef)
    }

    /// Owning MDC slot field
    #[must_use]
    pub fn slot(self) -> u8 {
        (self.0 & ((1 << SLOT_BITS) - 1)) as u8
    }

    /// Whether this id names a client object (mblock or mlog)
    #[must_use]
    pub fn is_user_type(self) -> bool {
        self.objtype().is_user()
    }

    /// Whether handing out this id requires a persisted checkpoint first
    #[must_use]
    pub fn is_ckpt(self) -> bool {
        self.uniq() % OBJID_CKPT_DELTA == 0
    }

    /// Whether this id names one of MDC0's own backing mlogs
    #[must_use]
    pub fn is_mdc0_log(self) -> bool {
        self.slot() == 0 && self.uniq() < 2
    }

    /// Convert to the tagged handle form handed to clients
    #[must_use]
    pub fn to_uhandle(self) -> u64 {
        self.0 | UHANDLE_TAG
    }

    /// Convert a client handle back to an object id
    pub fn from_uhandle(uhandle: u64) -> Result<Self> {
        if uhandle & UHANDLE_TAG == 0 {
            return Err(Error::invalid_arg(format!(
                "not a user handle: {uhandle:#x}"
            )));
        }
        Ok(Self(uhandle & !UHANDLE_TAG))
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjId({:#x} uniq={} type={:?} slot={})",
            self.0,
            self.uniq(),
            self.objtype(),
            self.slot()
        )
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Id of an MDC backing mlog
///
/// The two mlogs backing MDCi are mlogs in slot 0 with uniq `2i` and
/// `2i + 1`.
#[must_use]
pub fn logid_make(uniq: u64, slot: u8) -> ObjId {
    ObjId::new(uniq, ObjType::Mlog, slot)
}

/// The backing mlog id pair of MDC `slot`
#[must_use]
pub fn mdc_logids(slot: u8) -> (ObjId, ObjId) {
    let n = 2 * u64::from(slot);
    (logid_make(n, 0), logid_make(n + 1, 0))
}

/// The MDC index backed by `logid`, if it is a backing mlog id
#[must_use]
pub fn mdc_logid_slot(logid: ObjId) -> Option<u8> {
    if logid.objtype() != ObjType::Mlog || logid.slot() != 0 {
        return None;
    }
    let mdcn = logid.uniq() / 2;
    (mdcn < crate::mda::MDC_SLOTS as u64).then_some(mdcn as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objid_field_roundtrip() {
        let id = ObjId::new(513, ObjType::Mblock, 7);
        assert_eq!(id.uniq(), 513);
        assert_eq!(id.objtype(), ObjType::Mblock);
        assert_eq!(id.slot(), 7);
        assert!(id.is_user_type());
    }

    #[test]
    fn test_ckpt_boundary() {
        assert!(ObjId::new(OBJID_CKPT_DELTA, ObjType::Mlog, 1).is_ckpt());
        assert!(ObjId::new(2 * OBJID_CKPT_DELTA, ObjType::Mlog, 1).is_ckpt());
        assert!(!ObjId::new(OBJID_CKPT_DELTA + 1, ObjType::Mlog, 1).is_ckpt());
    }

    #[test]
    fn test_mdc_logids() {
        let (l1, l2) = mdc_logids(3);
        assert_eq!(l1.uniq(), 6);
        assert_eq!(l2.uniq(), 7);
        assert_eq!(l1.slot(), 0);
        assert_eq!(l1.objtype(), ObjType::Mlog);
        assert_eq!(mdc_logid_slot(l1), Some(3));
        assert_eq!(mdc_logid_slot(l2), Some(3));

        let (m1, m2) = mdc_logids(0);
        assert!(m1.is_mdc0_log());
        assert!(m2.is_mdc0_log());
        assert!(!l1.is_mdc0_log());

        // client ids never resolve to an MDC index
        assert_eq!(mdc_logid_slot(ObjId::new(4, ObjType::Mblock, 1)), None);
        assert_eq!(mdc_logid_slot(ObjId::new(4, ObjType::Mlog, 2)), None);
    }

    #[test]
    fn test_uhandle_roundtrip() {
        let id = ObjId::new(42, ObjType::Mlog, 9);
        let uh = id.to_uhandle();
        assert_ne!(uh, id.as_u64());
        assert_eq!(ObjId::from_uhandle(uh).unwrap(), id);
        assert!(ObjId::from_uhandle(id.as_u64()).is_err());
    }

    #[test]
    fn test_ordering_is_by_uniq_within_slot() {
        let a = ObjId::new(1, ObjType::Mblock, 1);
        let b = ObjId::new(2, ObjType::Mblock, 1);
        assert!(a < b);
    }
}
