//! Kstat-style counters for the pageout subsystem.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, updated lock-free from every thread in the plane.
#[derive(Debug, Default)]
pub struct PageoutStats {
    /// Scanner wakes driven by a global free-memory shortage.
    pub(crate) low_mem_scan: AtomicU64,
    /// Scanner wakes driven only by zones over their cap.
    pub(crate) zone_cap_scan: AtomicU64,
    /// Scan cycles ended by the CPU budget rather than the page budget.
    pub(crate) pageout_timeouts: AtomicU64,
    /// Scanner wake cycles that reached the scan loop.
    pub(crate) pgrrun: AtomicU64,
    /// Page pairs visited.
    pub(crate) scan: AtomicU64,
    /// Front-hand revolutions around the clock face.
    pub(crate) rev: AtomicU64,
    /// Pages freed by the decider.
    pub(crate) dfree: AtomicU64,
    /// Freed pages that mapped executable text.
    pub(crate) execfree: AtomicU64,
    /// Freed pages backed by a filesystem vnode.
    pub(crate) fsfree: AtomicU64,
    /// Freed anonymous pages.
    pub(crate) anonfree: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub low_mem_scan: u64,
    pub zone_cap_scan: u64,
    pub pageout_timeouts: u64,
    pub pgrrun: u64,
    pub scan: u64,
    pub rev: u64,
    pub dfree: u64,
    pub execfree: u64,
    pub fsfree: u64,
    pub anonfree: u64,
}

impl PageoutStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            low_mem_scan: self.low_mem_scan.load(Ordering::Relaxed),
            zone_cap_scan: self.zone_cap_scan.load(Ordering::Relaxed),
            pageout_timeouts: self.pageout_timeouts.load(Ordering::Relaxed),
            pgrrun: self.pgrrun.load(Ordering::Relaxed),
            scan: self.scan.load(Ordering::Relaxed),
            rev: self.rev.load(Ordering::Relaxed),
            dfree: self.dfree.load(Ordering::Relaxed),
            execfree: self.execfree.load(Ordering::Relaxed),
            fsfree: self.fsfree.load(Ordering::Relaxed),
            anonfree: self.anonfree.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
