//! Metadata array: the slot vector and the allocation selector
//!
//! The pool owns a fixed array of [`MdcSlot`]s. `slotvcnt` publishes how
//! many are visible; it only grows after activation (new MDC allocation)
//! and is read lock-free on the allocation fast path. The selector table
//! spreads new-object allocations across user MDCs in the credit ratios
//! computed by the pre-compactor.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::slot::MdcSlot;

/// Maximum number of MDCs, including MDC0
pub const MDC_SLOTS: usize = 256;

/// Size of the slot-selection table; a power of two
pub const MDC_TBL_SZ: usize = 1024;

/// The pool's metadata array
pub struct Mda {
    slotv: Vec<MdcSlot>,
    slotvcnt: AtomicU16,
    sel_tbl: Vec<AtomicU8>,
    sel_idx: AtomicU32,
}

impl Mda {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slotv: (0..MDC_SLOTS).map(|s| MdcSlot::new(s as u8)).collect(),
            slotvcnt: AtomicU16::new(0),
            sel_tbl: (0..MDC_TBL_SZ).map(|_| AtomicU8::new(0)).collect(),
            sel_idx: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn slot(&self, slot: u8) -> &MdcSlot {
        &self.slotv[slot as usize]
    }

    /// Number of visible MDCs (MDC0 included)
    #[must_use]
    pub fn slotvcnt(&self) -> u16 {
        self.slotvcnt.load(Ordering::Acquire)
    }

    /// Publish a new visible slot count
    pub fn set_slotvcnt(&self, cnt: u16) {
        self.slotvcnt.store(cnt, Ordering::Release);
    }

    /// Pick the next slot from the selector table
    #[must_use]
    pub fn next_sel_slot(&self) -> u8 {
        let tidx = self.sel_idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as usize % MDC_TBL_SZ;
        self.sel_tbl[tidx].load(Ordering::Relaxed)
    }

    /// Rewrite one selector table entry
    pub fn set_sel_entry(&self, tidx: usize, slot: u8) {
        self.sel_tbl[tidx].store(slot, Ordering::Relaxed);
    }

    /// Occurrences of each slot in the selector table
    #[must_use]
    pub fn sel_histogram(&self) -> Vec<u32> {
        let mut hist = vec![0u32; MDC_SLOTS];
        for entry in &self.sel_tbl {
            hist[entry.load(Ordering::Relaxed) as usize] += 1;
        }
        hist
    }
}

impl Default for Mda {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_size_is_power_of_two() {
        assert!(MDC_TBL_SZ.is_power_of_two());
    }

    #[test]
    fn test_selector_round_robin() {
        let mda = Mda::new();
        for tidx in 0..MDC_TBL_SZ {
            mda.set_sel_entry(tidx, if tidx % 2 == 0 { 1 } else { 2 });
        }

        // the cursor walks entries in order, wrapping at the table size
        let first: Vec<u8> = (0..4).map(|_| mda.next_sel_slot()).collect();
        assert_eq!(first, vec![2, 1, 2, 1]);

        let hist = mda.sel_histogram();
        assert_eq!(hist[1], (MDC_TBL_SZ / 2) as u32);
        assert_eq!(hist[2], (MDC_TBL_SZ / 2) as u32);
    }

    #[test]
    fn test_slotvcnt_publish() {
        let mda = Mda::new();
        assert_eq!(mda.slotvcnt(), 0);
        mda.set_slotvcnt(5);
        assert_eq!(mda.slotvcnt(), 5);
    }
}
