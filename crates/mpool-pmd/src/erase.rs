//! Asynchronous object erase
//!
//! Delete and abort hand the final layout reference to a dedicated erase
//! queue. Workers erase the payload through the media layer (advisory for
//! mlogs, mandatory for mblocks), then return the zones to the drive's
//! space map and drop the layout. The allocation retry path can flush the
//! queue to wait out pending erases.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::device::DeviceTable;
use crate::layout::ObjLayout;
use crate::mdc::ObjectIo;
use crate::objid::ObjType;

/// Worker count of the erase queue
pub const ERASE_WORKERS: usize = 2;

/// Context an erase worker needs to finish a removal
#[derive(Clone)]
pub struct EraseCtx {
    pub devices: Arc<DeviceTable>,
    pub io: Arc<dyn ObjectIo>,
}

/// Return a layout's zones to its drive and drop it
///
/// Also used directly on allocation failure paths, before a layout ever
/// became visible.
pub fn layout_free(devices: &DeviceTable, layout: &ObjLayout) {
    let guard = devices.read();
    let drive = &guard.pdv[layout.pdh() as usize];
    if let Err(err) = drive
        .smap
        .lock()
        .free_range(layout.zaddr(), u64::from(layout.zcnt()))
    {
        // releasing space must not fail; the map is now inconsistent
        error!(objid = %layout.objid(), drive = %drive.name, %err, "zone free failed");
    };
}

struct EraseState {
    queue: VecDeque<Arc<ObjLayout>>,
    in_flight: usize,
    shutdown: bool,
}

struct EraseInner {
    state: Mutex<EraseState>,
    work: Condvar,
    done: Condvar,
}

/// The dedicated erase work queue
pub struct EraseQueue {
    inner: Arc<EraseInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EraseQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EraseInner {
                state: Mutex::new(EraseState {
                    queue: VecDeque::new(),
                    in_flight: 0,
                    shutdown: false,
                }),
                work: Condvar::new(),
                done: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker threads
    pub fn start(&self, ctx: EraseCtx) {
        let mut workers = self.workers.lock();
        for _ in 0..ERASE_WORKERS {
            let inner = Arc::clone(&self.inner);
            let ctx = ctx.clone();
            workers.push(thread::spawn(move || worker_loop(&inner, &ctx)));
        }
    }

    /// Queue a removed layout for payload erase and space release
    pub fn enqueue(&self, layout: Arc<ObjLayout>) {
        let mut state = self.inner.state.lock();
        state.queue.push_back(layout);
        self.inner.work.notify_one();
    }

    /// Wait until every queued erase has completed
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        while !state.queue.is_empty() || state.in_flight > 0 {
            self.inner.done.wait(&mut state);
        }
    }

    /// Discard pending work and join the workers
    ///
    /// Used on the crash-like teardown path, where releasing zones or
    /// touching payloads would be wrong.
    pub fn abandon(&self) {
        {
            let mut state = self.inner.state.lock();
            state.queue.clear();
            state.shutdown = true;
            self.inner.work.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Drain the queue and join the workers
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.work.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Default for EraseQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(inner: &EraseInner, ctx: &EraseCtx) {
    loop {
        let layout = {
            let mut state = inner.state.lock();
            loop {
                if let Some(layout) = state.queue.pop_front() {
                    state.in_flight += 1;
                    break layout;
                }
                if state.shutdown {
                    return;
                }
                inner.work.wait(&mut state);
            }
        };

        erase_one(ctx, &layout);

        let mut state = inner.state.lock();
        state.in_flight -= 1;
        if state.queue.is_empty() && state.in_flight == 0 {
            inner.done.notify_all();
        }
    }
}

fn erase_one(ctx: &EraseCtx, layout: &Arc<ObjLayout>) {
    match layout.objid().objtype() {
        ObjType::Mlog => {
            // discard is advisory for mlogs
            if let Err(err) = ctx.io.erase_mlog(layout) {
                warn!(objid = %layout.objid(), %err, "mlog erase failed");
            }
        }
        ObjType::Mblock => {
            if let Err(err) = ctx.io.erase_mblock(layout) {
                error!(objid = %layout.objid(), %err, "mblock erase failed");
            }
        }
        ObjType::Undef => {}
    }

    layout_free(&ctx.devices, layout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::objid::ObjId;
    use crate::smap::{SpcType, ZoneMap};
    use mpool_common::{DriveParms, MediaClass};
    use uuid::Uuid;

    fn ctx_with_one_drive(zones: u64) -> EraseCtx {
        let parms = DriveParms {
            devid: Uuid::new_v4(),
            class: MediaClass::Capacity,
            zonepg: 1,
            sector_size: 4096,
            devtype: 1,
            features: 0,
            zone_count: zones,
            devsz: zones * 4096,
        };
        let devices = Arc::new(DeviceTable::new(vec![("pd0".into(), parms)]));
        {
            let guard = devices.read();
            *guard.pdv[0].smap.lock() = ZoneMap::new(zones, 0);
        }
        EraseCtx {
            devices,
            io: Arc::new(MemStore::default()),
        }
    }

    #[test]
    fn test_erase_returns_zones() {
        let ctx = ctx_with_one_drive(16);
        let zaddr = {
            let guard = ctx.devices.read();
            let z = guard.pdv[0]
                .smap
                .lock()
                .alloc(4, SpcType::UsableOnly, 1)
                .unwrap();
            z
        };

        let queue = EraseQueue::new();
        queue.start(ctx.clone());

        let layout = ObjLayout::new(ObjId::new(1, ObjType::Mblock, 1), 0, zaddr, 4, 0);
        queue.enqueue(layout);
        queue.flush();

        let guard = ctx.devices.read();
        assert_eq!(guard.pdv[0].smap.lock().free_zones(), 16);
        queue.stop();
    }

    #[test]
    fn test_stop_drains_queue() {
        let ctx = ctx_with_one_drive(16);
        let queue = EraseQueue::new();
        queue.start(ctx.clone());

        for uniq in 0..4 {
            let zaddr = {
                let guard = ctx.devices.read();
                let z = guard.pdv[0]
                    .smap
                    .lock()
                    .alloc(2, SpcType::UsableOnly, 1)
                    .unwrap();
                z
            };
            queue.enqueue(ObjLayout::new(
                ObjId::new(uniq + 1, ObjType::Mblock, 1),
                0,
                zaddr,
                2,
                0,
            ));
        }

        queue.stop();
        let guard = ctx.devices.read();
        assert_eq!(guard.pdv[0].smap.lock().free_zones(), 16);
    }
}
