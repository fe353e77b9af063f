//! Pageout scheduling.
//!
//! One tick runs `SCHEDPAGING_HZ` times a second. It invokes the memory-
//! hungry reapers first (so their effect on `freemem` is not observed
//! within the same tick), then derives the scan budget and the CPU budget
//! for the coming cycle from current pressure, resizes the scanner pool
//! once calibration allows it, and finally decides whether to wake the
//! scanners, service zones over their cap, or let the system cool down.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use pgw_types::{MAX_PSCAN_THREADS, MIN_PO_SHARE, SCHEDPAGING_HZ};
use tracing::debug;

use crate::stats::PageoutStats;
use crate::PageoutCtx;

fn nz(value: u64) -> u64 {
    value.max(1)
}

impl PageoutCtx {
    /// One scheduler tick. Reads fresh pressure signals from the host,
    /// publishes `desscan` and the per-cycle CPU budget, and wakes whoever
    /// has work to do.
    pub fn schedule_tick(self: &Arc<Self>) {
        let th = self.thresholds.load_full();
        let vm = &*self.vm;

        let freemem = vm.freemem();
        let needfree = vm.needfree();

        if freemem < th.lotsfree + needfree + vm.kmem_reapahead() {
            vm.kmem_reap();
        }
        if freemem < th.lotsfree + needfree {
            vm.seg_preap();
        }
        if vm.kcage_on() && (vm.kcage_freemem() < vm.kcage_desfree() || vm.kcage_needfree() > 0) {
            vm.kcage_cageout_wakeup();
        }

        self.nscan.swap(0, Ordering::AcqRel);

        let calibrated = self.sample.new_spread.load(Ordering::Acquire) != 0;

        // Free-memory headroom used for the interpolation. Once calibrated,
        // needfree is treated as another form of deficit. Signed and wide:
        // freemem can be far below the subtracted demand.
        let mut vavail = i128::from(freemem) - i128::from(vm.deficit());
        if calibrated {
            vavail -= i128::from(needfree);
        }
        let vavail = vavail.clamp(0, i128::from(th.lotsfree)) as u64;

        // Scan budget for the next cycle. Wide intermediates: the products
        // overflow 64 bits on very large systems as freemem approaches 0.
        let mut desscan = if needfree > 0 && !calibrated {
            // No spread yet; kick into high gear whenever there is hard
            // demand. The CPU budget is simultaneously maxed below.
            th.fastscan / SCHEDPAGING_HZ
        } else {
            let slow = u128::from(th.slowscan) * u128::from(vavail);
            let fast = u128::from(th.fastscan) * u128::from(th.lotsfree - vavail);
            ((slow + fast) / u128::from(nz(th.lotsfree)) / u128::from(SCHEDPAGING_HZ)) as u64
        };

        let mut pageout_nsec = if !calibrated {
            self.max_pageout_nsec
        } else {
            let span = u128::from(th.lotsfree - vavail)
                * u128::from(self.max_pageout_nsec - self.min_pageout_nsec)
                / u128::from(nz(th.lotsfree));
            self.min_pageout_nsec + span as u64
        };

        if calibrated {
            let desired = self.des_page_scanners.load(Ordering::Acquire);
            let current = self.n_page_scanners.load(Ordering::Acquire);
            if desired != current {
                self.resize_scanner_pool(desired, current, th.total_pages, th.handspreadpages);
            }
        }

        let startup = self.calibrating();
        self.zones_over.store(false, Ordering::Release);

        if freemem < th.lotsfree + needfree || startup {
            if !startup {
                PageoutStats::bump(&self.stats.low_mem_scan);
            }
            debug!(
                target: "pgw::sched",
                event = "schedpage_wake_low",
                freemem,
                needfree,
                desscan,
                pageout_nsec
            );
            self.desscan.store(desscan, Ordering::Release);
            self.pageout_nsec.store(pageout_nsec, Ordering::Release);
            self.scanner_wake.wake_all();
        } else if vm.zones_over_cap() > 0 {
            // One or more zones are over their cap: no page limit, maximum
            // (or operator-chosen) CPU budget, and the decider filters to
            // pages of offending zones.
            desscan = th.total_pages;
            let zone_nsec = self.zone_pageout_nsec.load(Ordering::Acquire);
            pageout_nsec = if zone_nsec != 0 {
                zone_nsec
            } else {
                self.max_pageout_nsec
            };
            self.zones_over.store(true, Ordering::Release);
            PageoutStats::bump(&self.stats.zone_cap_scan);
            debug!(
                target: "pgw::sched",
                event = "schedpage_wake_zone",
                desscan,
                pageout_nsec
            );
            self.desscan.store(desscan, Ordering::Release);
            self.pageout_nsec.store(pageout_nsec, Ordering::Release);
            self.scanner_wake.wake_all();
        } else {
            self.desscan.store(desscan, Ordering::Release);
            self.pageout_nsec.store(pageout_nsec, Ordering::Release);

            // Plenty of memory. Let the writeback queue drain, and skip
            // fewer highly shared pages next time around.
            self.push.signal_if_pending();

            let _guard = self.pageout_mutex.lock();
            let share = self.po_share.load(Ordering::Relaxed);
            if share > MIN_PO_SHARE {
                self.po_share.store(share >> 1, Ordering::Relaxed);
            }
        }

        if vm.kmem_avail() > 0 {
            self.memavail.wake_all();
        }
    }

    /// Publish a changed scanner count and latch every worker's hand
    /// reset. Workers at or beyond the new count retire themselves the
    /// next time they observe their latch; missing workers are spawned.
    fn resize_scanner_pool(
        self: &Arc<Self>,
        desired: usize,
        current: usize,
        total_pages: u64,
        handspreadpages: u64,
    ) {
        let max = usize::try_from(total_pages / nz(handspreadpages)).unwrap_or(usize::MAX);
        let desired = desired.clamp(1, max.max(1)).min(MAX_PSCAN_THREADS);
        self.des_page_scanners.store(desired, Ordering::Release);

        // Publish the count before latching so a shrinking worker sees
        // itself out of range when it consumes its latch.
        self.n_page_scanners.store(desired, Ordering::Release);
        for latch in &self.reset_hands {
            latch.store(true, Ordering::Release);
        }

        if desired > current {
            for inst in current..desired {
                self.spawn_scanner(inst);
            }
        }
    }
}
