//! Interfaces consumed from the media layer
//!
//! The metadata core does not read or write drives itself. It drives three
//! narrow interfaces: the paired-mlog metadata log, the store that opens
//! such logs and persists the MDC0 superblock image, and the object-payload
//! erase entry points used by the erase worker.

use mpool_common::Result;
use uuid::Uuid;

use crate::layout::ObjLayout;
use crate::objid::ObjId;

/// One open metadata log backed by a pair of mlogs
///
/// The pair presents a single append-only log. Exactly one mlog is active
/// at a time; compaction opens the inactive mlog (`cstart`), rewrites the
/// net state into it, then atomically swaps the roles (`cend`). A crash
/// between the two leaves the old active mlog authoritative.
pub trait MetaLog: Send {
    /// Append one packed record; fails with `TooBig` when the record does
    /// not fit the active mlog
    fn append(&mut self, rec: &[u8], sync: bool) -> Result<()>;

    /// Reset the read cursor to the start of the active mlog
    fn rewind(&mut self) -> Result<()>;

    /// Read the next record into `buf`, returning its length; 0 at end of log
    fn read_rec(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Begin compaction: clear the inactive mlog and make it the write target
    fn cstart(&mut self) -> Result<()>;

    /// Finish compaction: flush and atomically swap the active role
    fn cend(&mut self) -> Result<()>;

    /// (bytes used, byte capacity) of the active mlog
    fn usage(&self) -> (u64, u64);
}

/// In-memory image of the MDC0 metadata kept in drive superblocks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mdc0Image {
    /// Generation of MDC0's first backing mlog
    pub mdc01_gen: u64,
    /// Generation of MDC0's second backing mlog
    pub mdc02_gen: u64,
}

/// Opens metadata logs and persists the MDC0 superblock image
pub trait MdcStore: Send + Sync {
    /// Open the paired log backed by `logid1`/`logid2`
    fn open(&self, logid1: ObjId, logid2: ObjId) -> Result<Box<dyn MetaLog>>;

    /// Rewrite the MDC0 image in the superblocks of the named drive
    fn write_mdc0_image(&self, devid: &Uuid, image: &Mdc0Image) -> Result<()>;
}

/// Object payload erase entry points
pub trait ObjectIo: Send + Sync {
    /// Erase an mlog's zones; advisory, failures are tolerated
    fn erase_mlog(&self, layout: &ObjLayout) -> Result<()>;

    /// Erase an mblock's zones; mandatory
    fn erase_mblock(&self, layout: &ObjLayout) -> Result<()>;
}
