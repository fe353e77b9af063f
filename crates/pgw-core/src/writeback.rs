//! Asynchronous writeback queue and push master.
//!
//! Dirty pages the decider cannot free directly are handed to a bounded
//! pool of request slots and written back by a dedicated master thread,
//! paced to `maxpgio / SCHEDPAGING_HZ` successful pushes per scheduler
//! tick. Filesystems may block the master while allocating memory for the
//! push itself; the scanners keep running regardless, and the deadman
//! watches the master's progress through `pushing` / `push_count`.

use parking_lot::{Condvar, Mutex};
use pgw_types::{PushFlags, SCHEDPAGING_HZ, VnodeId};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{trace, warn};

use crate::PageoutCtx;

/// One queued page push. The vnode hold is taken by the decider before the
/// request is queued and released by the master after the push completes,
/// successful or not.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PushRequest {
    pub(crate) vnode: VnodeId,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) flags: PushFlags,
}

#[derive(Debug)]
struct PushState {
    /// Unused request slots. Slots are capacity, not storage: the pool
    /// never holds more than `free + pending + pushing` == `slots` entries.
    free_slots: usize,
    /// Queued requests, most recent first.
    pending: Vec<PushRequest>,
    /// A push is currently in flight at the host.
    pushing: bool,
    /// Successful pushes since the last wakeup of the master.
    pushes_this_tick: u64,
    /// Monotonic count of completed pushes, successful or not.
    push_count: u64,
}

/// The request pool: one mutex, one condvar, exactly `slots` slots.
#[derive(Debug)]
pub(crate) struct PushQueue {
    slots: usize,
    state: Mutex<PushState>,
    cv: Condvar,
}

/// Point-in-time accounting of the pool, for observers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritebackDepths {
    pub free_slots: usize,
    pub pending: usize,
    pub pushing: bool,
    pub push_count: u64,
}

impl PushQueue {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            slots,
            state: Mutex::new(PushState {
                free_slots: slots,
                pending: Vec::with_capacity(slots),
                pushing: false,
                pushes_this_tick: 0,
                push_count: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Queue a request if a slot is free. Returns false on saturation, in
    /// which case the caller still owns the vnode hold.
    pub(crate) fn try_queue(&self, req: PushRequest) -> bool {
        let mut state = self.state.lock();
        if state.free_slots == 0 {
            return false;
        }
        state.free_slots -= 1;
        state.pending.push(req);
        if state.free_slots == 0 {
            // Pool just ran dry; make sure the master is draining.
            self.cv.notify_one();
        }
        true
    }

    /// Wake the master if there is queued work. Called by the scheduler's
    /// quiet path and by each scanner before it sleeps.
    pub(crate) fn signal_if_pending(&self) {
        let state = self.state.lock();
        if !state.pending.is_empty() {
            self.cv.notify_one();
        }
    }

    /// Block until a request is available and the tick pacing allows
    /// another push, then claim it. Returns `None` once `stop` is set.
    /// Every wakeup resets the per-tick push count.
    pub(crate) fn next_request(
        &self,
        stop: &AtomicBool,
        max_pushes: impl Fn() -> u64,
    ) -> Option<PushRequest> {
        let mut state = self.state.lock();
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if !state.pending.is_empty() && state.pushes_this_tick <= max_pushes() {
                break;
            }
            self.cv.wait(&mut state);
            state.pushes_this_tick = 0;
        }
        let req = state.pending.pop()?;
        state.pushing = true;
        Some(req)
    }

    /// Record the completion of an in-flight push and return its slot.
    /// `counted` pushes advance the per-tick pacing total.
    pub(crate) fn complete(&self, counted: bool) {
        let mut state = self.state.lock();
        state.pushing = false;
        state.push_count += 1;
        if counted {
            state.pushes_this_tick += 1;
        }
        state.free_slots += 1;
    }

    pub(crate) fn depths(&self) -> WritebackDepths {
        let state = self.state.lock();
        WritebackDepths {
            free_slots: state.free_slots,
            pending: state.pending.len(),
            pushing: state.pushing,
            push_count: state.push_count,
        }
    }

    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    /// Wake the master unconditionally (shutdown).
    pub(crate) fn wake_all(&self) {
        self.cv.notify_all();
    }
}

impl PageoutCtx {
    /// Hand a dirty page to the writeback queue. Returns false when the
    /// pool is saturated; the caller must release its vnode hold and leave
    /// the page for a later sweep.
    pub fn queue_io_request(&self, vnode: VnodeId, offset: u64) -> bool {
        self.push.try_queue(PushRequest {
            vnode,
            offset,
            len: self.tunables.page_size,
            flags: PushFlags::ASYNC | PushFlags::FREE,
        })
    }

    /// Body of the push master thread: drain the pending list into the
    /// host's put-page path, pacing successful pushes per tick. A failed
    /// push consumes its slot and releases the vnode hold but does not
    /// count against the pacing budget.
    ///
    /// [`PageoutDaemon`](crate::PageoutDaemon) runs this on its own
    /// thread; embeddings that manage threads themselves may call it
    /// directly. Returns after [`request_stop`](PageoutCtx::request_stop).
    pub fn push_master_loop(&self) {
        loop {
            let Some(req) = self.push.next_request(&self.stop, || {
                self.thresholds.load().maxpgio / SCHEDPAGING_HZ
            }) else {
                return;
            };

            trace!(
                target: "pgw::writeback",
                event = "pageout_push",
                vnode = req.vnode.0,
                offset = req.offset
            );
            let counted = match self.pages.put_page(req.vnode, req.offset, req.len, req.flags) {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        target: "pgw::writeback",
                        event = "push_failed",
                        vnode = req.vnode.0,
                        offset = req.offset,
                        error = %err
                    );
                    false
                }
            };

            // Hold taken by the decider when it queued the page.
            self.pages.release_vnode(req.vnode);
            self.push.complete(counted);
        }
    }

    /// Wake the writeback master if requests are pending. The scheduler's
    /// quiet path and every scanner use this; host paths that queue
    /// requests of their own may call it as well.
    pub fn signal_writeback(&self) {
        self.push.signal_if_pending();
    }

    /// Current writeback pool accounting.
    pub fn writeback_depths(&self) -> WritebackDepths {
        self.push.depths()
    }
}
