//! Scanner worker.
//!
//! Each worker owns two hands on the circular page array: the front hand
//! clears reference bits, the back hand trails `handspreadpages` behind
//! and reclaims whatever was not referenced in between. Workers sleep on a
//! shared wakeup and run one budgeted cycle per wake; the scheduler's
//! `reset_hands` latch repositions a worker's hands (or retires the worker
//! entirely when the pool shrinks). Worker 0 additionally runs the
//! self-calibration sampling that teaches the plane its host's scan rate.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use pgw_types::{MAX_PO_SHARE, NANOSEC, PAGES_POLL_MASK, PageId};
use tracing::{debug, error, trace};

use crate::decider::{CheckResult, Hand};
use crate::stats::PageoutStats;
use crate::PageoutCtx;

/// Whether a worker keeps running after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    /// The pool shrank below this worker's instance number; retire.
    Exit,
}

/// Per-worker scanning state. The hands persist across wakeups and are
/// only re-derived when the scheduler latches a reset.
#[derive(Debug)]
pub struct ScannerState {
    inst: usize,
    front: PageId,
    back: PageId,
    /// Front-hand wraps since the worker started.
    iter: u64,
    hands_set: bool,
}

impl ScannerState {
    #[must_use]
    pub fn new(inst: usize) -> Self {
        Self {
            inst,
            front: PageId(0),
            back: PageId(0),
            iter: 0,
            hands_set: false,
        }
    }

    #[must_use]
    pub fn inst(&self) -> usize {
        self.inst
    }

    /// Current hand positions, once established.
    #[must_use]
    pub fn hands(&self) -> Option<(PageId, PageId)> {
        self.hands_set.then_some((self.back, self.front))
    }
}

impl PageoutCtx {
    /// True while the startup sampling phase is still collecting.
    pub fn calibrating(&self) -> bool {
        self.sample.count.load(Ordering::Acquire) < self.tunables.pageout_sample_lim
    }

    /// One wakeup's worth of scanning for worker `state.inst`.
    ///
    /// Honors the page budget (`desscan`, or the whole of memory while
    /// calibrating) and the CPU budget (`pageout_nsec`), and keeps going
    /// only while there is a reason to scan: a zone over cap, a global
    /// shortage, or calibration itself.
    pub fn scan_cycle(&self, state: &mut ScannerState) -> ScanControl {
        if !self.dopageout.load(Ordering::Acquire) {
            return ScanControl::Continue;
        }

        if self.reset_hands[state.inst].swap(false, Ordering::AcqRel) || !state.hands_set {
            let scanners = self.n_page_scanners.load(Ordering::Acquire);
            if state.inst >= scanners {
                // The pool shrank and this instance is no longer wanted.
                debug_assert_ne!(state.inst, 0, "worker 0 never retires");
                return ScanControl::Exit;
            }

            // Spread the instances evenly around the clock face, with each
            // front hand `handspreadpages` ahead of its back hand but
            // never a full revolution.
            let th = self.thresholds.load();
            let offset = th.total_pages / scanners as u64;
            let first = self.pages.first();
            state.back = self.pages.nextn(first, offset * state.inst as u64);
            let spread = th.handspreadpages.min(th.total_pages.saturating_sub(1));
            state.front = self.pages.nextn(state.back, spread);
            state.hands_set = true;
        }

        PageoutStats::bump(&self.stats.pgrrun);

        let th = self.thresholds.load_full();
        let startup = self.calibrating();
        let nscan_limit = if startup {
            th.total_pages
        } else {
            self.desscan.load(Ordering::Acquire)
        };
        let budget_nsec = self.pageout_nsec.load(Ordering::Acquire);

        debug!(
            target: "pgw::scanner",
            event = "pageout_start",
            limit = nscan_limit,
            inst = state.inst,
            back = state.back.0,
            front = state.front.0
        );

        let mut pcount: u64 = 0;
        let mut nscan_cnt: u64 = 0;
        // Front-hand wraps this wake without freeing anything.
        let mut count: u64 = 0;
        let sample_start = self.vm.now_ns();

        while nscan_cnt < nscan_limit {
            let zones_over = self.zones_over.load(Ordering::Acquire);
            if !(zones_over
                || self.vm.freemem() < th.lotsfree + self.vm.needfree()
                || startup)
            {
                break;
            }

            trace!(
                target: "pgw::scanner",
                event = "pageout_loop",
                pcount,
                inst = state.inst
            );

            // Check the CPU budget every so often, not on every page.
            if (pcount & PAGES_POLL_MASK) == PAGES_POLL_MASK {
                let elapsed = self.vm.now_ns().saturating_sub(sample_start);
                if elapsed >= budget_nsec {
                    if !zones_over {
                        PageoutStats::bump(&self.stats.pageout_timeouts);
                    }
                    debug!(
                        target: "pgw::scanner",
                        event = "pageout_timeout",
                        inst = state.inst
                    );
                    break;
                }
            }

            // A freed page buys the worker more trips around memory.
            let rv_front = self.check_page(state.front, Hand::Front);
            if rv_front == CheckResult::Freed {
                count = 0;
            }
            let rv_back = self.check_page(state.back, Hand::Back);
            if rv_back == CheckResult::Freed {
                count = 0;
            }

            pcount += 1;
            PageoutStats::bump(&self.stats.scan);

            if rv_front != CheckResult::Ineligible || rv_back != CheckResult::Ineligible {
                nscan_cnt += 1;
            }

            state.back = self.pages.next(state.back);
            state.front = self.pages.next(state.front);

            if state.front == self.pages.first() {
                trace!(
                    target: "pgw::scanner",
                    event = "pageout_wrap_front",
                    inst = state.inst
                );
                state.iter += 1;
                if state.iter % self.tunables.pageout_reset_cnt == 0 {
                    self.reset_hands[state.inst].store(true, Ordering::Release);
                }
                PageoutStats::bump(&self.stats.rev);

                // Wrapping while still short on memory means a revolution
                // reclaimed too little: skip fewer highly shared pages,
                // and once that threshold is exhausted give up until the
                // next tick. Zone-cap scans wrap routinely and keep going.
                if self.vm.freemem() < th.lotsfree + self.vm.needfree() {
                    count += 1;
                    if count > 1 {
                        let guard = self.pageout_mutex.lock();
                        let share = self.po_share.load(Ordering::Relaxed);
                        if share < MAX_PO_SHARE {
                            self.po_share.store(share << 1, Ordering::Relaxed);
                            drop(guard);
                        } else {
                            drop(guard);
                            break;
                        }
                    }
                }
            }
        }

        self.nscan.fetch_add(nscan_cnt, Ordering::AcqRel);
        let sample_end = self.vm.now_ns();

        debug!(
            target: "pgw::scanner",
            event = "pageout_loop_end",
            nscan = nscan_cnt,
            pcount,
            inst = state.inst
        );

        if state.inst == 0 {
            self.calibration_bookkeeping(startup, pcount, sample_end.saturating_sub(sample_start));
        }

        ScanControl::Continue
    }

    /// Accumulate one sample during startup; on the first cycle after the
    /// sample limit is reached, turn the samples into a scan rate and
    /// re-derive the thresholds from it.
    fn calibration_bookkeeping(&self, startup: bool, pcount: u64, elapsed_ns: u64) {
        if startup {
            self.sample.pages.fetch_add(pcount, Ordering::AcqRel);
            self.sample.etime_ns.fetch_add(elapsed_ns, Ordering::AcqRel);
            self.sample.count.fetch_add(1, Ordering::AcqRel);
        } else if self.sample.new_spread.load(Ordering::Acquire) == 0 {
            let pages = self.sample.pages.load(Ordering::Acquire);
            let etime = self.sample.etime_ns.load(Ordering::Acquire);
            if etime == 0 {
                // Calibration stalled; stay on the aggressive path.
                return;
            }
            let rate = (u128::from(pages) * u128::from(NANOSEC) / u128::from(etime)) as u64;
            self.sample.rate.store(rate, Ordering::Release);
            self.sample.new_spread.store(rate / 10, Ordering::Release);
            debug!(
                target: "pgw::scanner",
                event = "calibration_complete",
                sample_pages = pages,
                sample_etime_ns = etime,
                pageout_rate = rate,
                pageout_new_spread = rate / 10
            );
            self.setup_clock();
        }
    }

    /// Spawn scanner thread `inst`. Failures are logged, not propagated:
    /// the remaining workers keep the plane alive.
    pub(crate) fn spawn_scanner(self: &Arc<Self>, inst: usize) {
        let ctx = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("pgw-scanner-{inst}"))
            .spawn(move || scanner_thread(&ctx, inst));
        match spawned {
            Ok(handle) => self.scanner_joins.lock().push(handle),
            Err(err) => {
                error!(
                    target: "pgw::scanner",
                    event = "scanner_spawn_failed",
                    inst,
                    error = %err
                );
            }
        }
    }
}

/// Body of one scanner thread: signal the writeback drain, sleep until the
/// scheduler wakes the pool, run a cycle, repeat until retired or stopped.
fn scanner_thread(ctx: &Arc<PageoutCtx>, inst: usize) {
    let mut state = ScannerState::new(inst);
    let mut wake_gen = ctx.scanner_wake.current();
    loop {
        ctx.push.signal_if_pending();
        ctx.scanner_wake.wait(&mut wake_gen);
        if ctx.stop.load(Ordering::Acquire) {
            return;
        }
        if ctx.scan_cycle(&mut state) == ScanControl::Exit {
            return;
        }
    }
}
