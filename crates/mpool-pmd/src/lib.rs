//! Pool metadata (PMD) core
//!
//! The authoritative metadata manager of an mpool. An mpool aggregates
//! block drives into media classes and stores two object flavors on them:
//! mblocks (write-once bulk data) and mlogs (append-only logs). This crate
//! owns:
//! - Object identity: collision-free 64-bit ids, checkpointed for crash
//!   safety
//! - The metadata containers (MDCs): paired-mlog logs with atomic
//!   compaction, MDC0 for pool-wide state and MDC1..N for user objects
//! - Object lifecycle: allocate, commit, abort, delete, erase, reference
//!   counting and lookup
//! - Activation and crash recovery, including parallel MDC replay
//! - The pre-compactor and the credit-weighted allocation scheduler
//!
//! Reading drives, tracking zones and writing payloads belong to the media
//! layer behind the traits in [`mdc`]; [`mem`] provides an in-process
//! implementation.

pub mod compact;
pub mod device;
pub mod erase;
pub mod layout;
pub mod lifecycle;
pub mod mda;
pub mod mdc;
pub mod mem;
pub mod objid;
pub mod ops;
pub mod pool;
pub mod precompact;
pub mod record;
pub mod slot;
pub mod smap;
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use layout::ObjLayout;
pub use lifecycle::{ActivateSpec, Mdc0Layout};
pub use mdc::{Mdc0Image, MdcStore, MetaLog, ObjectIo};
pub use mem::MemStore;
pub use objid::{logid_make, mdc_logids, ObjId, ObjType, OBJID_CKPT_DELTA};
pub use ops::ObjCapacity;
pub use pool::{objid_to_uhandle, uhandle_to_objid, Mpool, MpoolUsage};
pub use record::{MdcRecord, RecType, MAX_REC_LEN};
pub use version::MdccVer;
