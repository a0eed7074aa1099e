//! In-process media backend
//!
//! Implements the consumed media interfaces over plain memory: each mlog is
//! a record vector with a byte budget, and each paired log keeps a durable
//! active-role flag that only `cend` flips. The backend outlives any number
//! of `Mpool` instances, so tests exercise crash recovery by dropping a
//! pool without deactivating it and re-activating over the same store.

use std::collections::HashMap;
use std::sync::Arc;

use mpool_common::{Error, Result};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::layout::ObjLayout;
use crate::mdc::{Mdc0Image, MdcStore, MetaLog, ObjectIo};
use crate::objid::{ObjId, ObjType};

/// Default per-mlog capacity in bytes
pub const DEFAULT_LOG_CAP: u64 = 1024 * 1024;

#[derive(Default)]
struct MlogMedia {
    recs: Vec<Vec<u8>>,
    len: u64,
}

impl MlogMedia {
    fn clear(&mut self) {
        self.recs.clear();
        self.len = 0;
    }
}

#[derive(Default)]
struct Media {
    logs: HashMap<u64, MlogMedia>,
    /// Per pair: does the first logid hold the active role
    active_first: HashMap<(u64, u64), bool>,
    images: HashMap<Uuid, Mdc0Image>,
}

/// Shared in-memory media
pub struct MemStore {
    media: Arc<Mutex<Media>>,
    log_cap: u64,
}

impl MemStore {
    /// Create a store whose mlogs hold `log_cap` bytes each
    #[must_use]
    pub fn new(log_cap: u64) -> Self {
        Self {
            media: Arc::new(Mutex::new(Media::default())),
            log_cap,
        }
    }

    /// The MDC0 image last written for a drive
    #[must_use]
    pub fn mdc0_image(&self, devid: &Uuid) -> Option<Mdc0Image> {
        self.media.lock().images.get(devid).copied()
    }

    /// Records currently stored in one mlog
    #[must_use]
    pub fn record_count(&self, logid: ObjId) -> usize {
        self.media
            .lock()
            .logs
            .get(&logid.as_u64())
            .map(|log| log.recs.len())
            .unwrap_or(0)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAP)
    }
}

impl MdcStore for MemStore {
    fn open(&self, logid1: ObjId, logid2: ObjId) -> Result<Box<dyn MetaLog>> {
        let key = (logid1.as_u64(), logid2.as_u64());
        let mut media = self.media.lock();
        media.logs.entry(key.0).or_default();
        media.logs.entry(key.1).or_default();
        media.active_first.entry(key).or_insert(true);
        drop(media);

        Ok(Box::new(MemLog {
            media: Arc::clone(&self.media),
            cap: self.log_cap,
            pair: key,
            cursor: 0,
            compacting: false,
        }))
    }

    fn write_mdc0_image(&self, devid: &Uuid, image: &Mdc0Image) -> Result<()> {
        self.media.lock().images.insert(*devid, *image);
        Ok(())
    }
}

impl ObjectIo for MemStore {
    fn erase_mlog(&self, layout: &ObjLayout) -> Result<()> {
        let mut media = self.media.lock();
        if let Some(log) = media.logs.get_mut(&layout.objid().as_u64()) {
            log.clear();
        }
        Ok(())
    }

    fn erase_mblock(&self, layout: &ObjLayout) -> Result<()> {
        debug_assert_eq!(layout.objid().objtype(), ObjType::Mblock);
        Ok(())
    }
}

struct MemLog {
    media: Arc<Mutex<Media>>,
    cap: u64,
    pair: (u64, u64),
    cursor: usize,
    compacting: bool,
}

impl MemLog {
    fn active_id(&self, media: &Media) -> u64 {
        if media.active_first.get(&self.pair).copied().unwrap_or(true) {
            self.pair.0
        } else {
            self.pair.1
        }
    }

    fn inactive_id(&self, media: &Media) -> u64 {
        if media.active_first.get(&self.pair).copied().unwrap_or(true) {
            self.pair.1
        } else {
            self.pair.0
        }
    }
}

impl MetaLog for MemLog {
    fn append(&mut self, rec: &[u8], _sync: bool) -> Result<()> {
        let mut media = self.media.lock();
        let target = if self.compacting {
            self.inactive_id(&media)
        } else {
            self.active_id(&media)
        };
        let log = media.logs.entry(target).or_default();
        if log.len + rec.len() as u64 > self.cap {
            return Err(Error::TooBig {
                len: rec.len() as u64,
                cap: self.cap - log.len,
            });
        }
        log.recs.push(rec.to_vec());
        log.len += rec.len() as u64;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn read_rec(&mut self, buf: &mut [u8]) -> Result<usize> {
        let media = self.media.lock();
        let active = self.active_id(&media);
        let Some(log) = media.logs.get(&active) else {
            return Ok(0);
        };
        let Some(rec) = log.recs.get(self.cursor) else {
            return Ok(0);
        };
        if rec.len() > buf.len() {
            return Err(Error::corrupt(format!(
                "record of {} bytes exceeds read buffer",
                rec.len()
            )));
        }
        buf[..rec.len()].copy_from_slice(rec);
        self.cursor += 1;
        Ok(rec.len())
    }

    fn cstart(&mut self) -> Result<()> {
        let mut media = self.media.lock();
        let inactive = self.inactive_id(&media);
        media.logs.entry(inactive).or_default().clear();
        self.compacting = true;
        Ok(())
    }

    fn cend(&mut self) -> Result<()> {
        let mut media = self.media.lock();
        let flag = media.active_first.entry(self.pair).or_insert(true);
        *flag = !*flag;
        self.compacting = false;
        self.cursor = 0;
        Ok(())
    }

    fn usage(&self) -> (u64, u64) {
        let media = self.media.lock();
        let active = self.active_id(&media);
        let len = media.logs.get(&active).map(|l| l.len).unwrap_or(0);
        (len, self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objid::mdc_logids;

    #[test]
    fn test_append_and_replay() {
        let store = MemStore::new(1024);
        let (l1, l2) = mdc_logids(1);

        let mut log = store.open(l1, l2).unwrap();
        log.append(b"alpha", true).unwrap();
        log.append(b"beta", true).unwrap();

        // a second handle over the same pair sees the same records
        let mut log2 = store.open(l1, l2).unwrap();
        log2.rewind().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(log2.read_rec(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"alpha");
        assert_eq!(log2.read_rec(&mut buf).unwrap(), 4);
        assert_eq!(log2.read_rec(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_append_too_big() {
        let store = MemStore::new(8);
        let (l1, l2) = mdc_logids(1);
        let mut log = store.open(l1, l2).unwrap();

        log.append(b"12345678", true).unwrap();
        let err = log.append(b"x", true).unwrap_err();
        assert!(err.is_too_big());
    }

    #[test]
    fn test_compaction_swaps_roles() {
        let store = MemStore::new(1024);
        let (l1, l2) = mdc_logids(2);
        let mut log = store.open(l1, l2).unwrap();

        log.append(b"old-1", true).unwrap();
        log.append(b"old-2", true).unwrap();

        log.cstart().unwrap();
        log.append(b"new", true).unwrap();
        log.cend().unwrap();

        log.rewind().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(log.read_rec(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"new");
        assert_eq!(log.read_rec(&mut buf).unwrap(), 0);
        assert_eq!(log.usage().0, 3);
    }

    #[test]
    fn test_crash_before_cend_keeps_old_active() {
        let store = MemStore::new(1024);
        let (l1, l2) = mdc_logids(2);

        {
            let mut log = store.open(l1, l2).unwrap();
            log.append(b"durable", true).unwrap();
            log.cstart().unwrap();
            log.append(b"torn", true).unwrap();
            // dropped without cend: the swap never happened
        }

        let mut log = store.open(l1, l2).unwrap();
        log.rewind().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(log.read_rec(&mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"durable");
        assert_eq!(log.read_rec(&mut buf).unwrap(), 0);
    }
}
