//! Writeback deadman.
//!
//! Pushing a page out requires short-term memory of its own (driver
//! buffers, allocation maps), so a system that is completely out of memory
//! can deadlock inside a single put-page call. The deadman runs once per
//! second and panics the host if one push has made no progress for the
//! configured number of seconds, trading an indefinite hang for a crash
//! dump and a reboot.

use std::sync::atomic::Ordering;

use crate::PageoutCtx;

/// Watchdog bookkeeping owned by whoever drives the 1 Hz tick.
#[derive(Debug, Default)]
pub struct DeadmanState {
    /// Consecutive seconds the same push has been observed in flight.
    stucktime: u64,
    /// Completed-push count at the last observation.
    push_count_seen: u64,
}

impl PageoutCtx {
    /// One 1 Hz deadman observation.
    pub fn deadman_tick(&self, state: &mut DeadmanState) {
        if self.vm.panicking() {
            // There is no pageout after panic.
            return;
        }

        let deadman_seconds = self.deadman_seconds.load(Ordering::Acquire);
        if deadman_seconds == 0 {
            return;
        }

        let depths = self.push.depths();
        if !depths.pushing || depths.push_count != state.push_count_seen {
            // Not pushing, or a different push from the last check: we are
            // not stuck.
            state.stucktime = 0;
            state.push_count_seen = depths.push_count;
            return;
        }

        state.stucktime += 1;
        if state.stucktime >= deadman_seconds {
            self.vm.panic_vm(&format!(
                "pageout deadman: stuck pushing the same page for {} seconds (freemem is {})",
                deadman_seconds,
                self.vm.freemem()
            ));
        }
    }
}
