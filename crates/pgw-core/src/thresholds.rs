//! Threshold calculator.
//!
//! Derives the descending reclaim thresholds (`lotsfree` down to
//! `pageout_reserve`), the scan-rate bounds and the hand spread from the
//! pageable page count, and sizes the scanner pool. Runs once at boot to
//! record the operator's overrides into a sticky snapshot, and again after
//! calibration completes or memory is dynamically reconfigured; the
//! snapshot guarantees overrides survive every recalculation.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use pgw_types::{
    DISKRPM, LOTSFREE_MAX_BYTES, LOTSFREE_MIN_BYTES, MAX_PSCAN_THREADS, MAXHANDSPREAD_BYTES,
    PageoutTunables, SCAN_REGION_BYTES, ThresholdStyle,
};
use tracing::info;

use crate::PageoutCtx;

/// Snapshot of the derived reclaim parameters, published as one unit so a
/// reader never observes a half-recalculated set. The all-zero `Default`
/// is a construction placeholder, replaced before the context is handed
/// out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Pageable pages at derivation time.
    pub total_pages: u64,
    pub lotsfree_min: u64,
    pub lotsfree_max: u64,
    /// Scanner start threshold.
    pub lotsfree: u64,
    /// Kernel facilities begin waiting on allocation below this.
    pub desfree: u64,
    /// Aggressive-reclamation threshold.
    pub minfree: u64,
    /// Allocation throttle threshold.
    pub throttlefree: u64,
    /// Pages reserved for the pageout path itself.
    pub pageout_reserve: u64,
    /// Pushes per second the writeback master will pace to.
    pub maxpgio: u64,
    pub maxfastscan: u64,
    /// Pages examined per second when memory is exhausted.
    pub fastscan: u64,
    /// Pages examined per second when memory is merely below `lotsfree`.
    pub slowscan: u64,
    /// Distance between the front and back hands.
    pub handspreadpages: u64,
}

/// Operator overrides captured on the first `setup_clock` call. A zero
/// field means "no override"; non-zero fields are re-applied verbatim on
/// every recalculation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClockInit {
    lotsfree_min: u64,
    lotsfree_max: u64,
    lotsfree: u64,
    desfree: u64,
    minfree: u64,
    throttlefree: u64,
    pageout_reserve: u64,
    maxpgio: u64,
    maxfastscan: u64,
    fastscan: u64,
    slowscan: u64,
    handspreadpages: u64,
}

impl ClockInit {
    pub(crate) fn capture(tunables: &PageoutTunables) -> Self {
        Self {
            lotsfree_min: tunables.lotsfree_min,
            lotsfree_max: tunables.lotsfree_max,
            lotsfree: tunables.lotsfree,
            desfree: tunables.desfree,
            minfree: tunables.minfree,
            throttlefree: tunables.throttlefree,
            pageout_reserve: tunables.pageout_reserve,
            maxpgio: tunables.maxpgio,
            maxfastscan: tunables.maxfastscan,
            fastscan: tunables.fastscan,
            slowscan: tunables.slowscan,
            handspreadpages: tunables.handspreadpages,
        }
    }
}

fn clamp(value: u64, minimum: u64, maximum: u64) -> u64 {
    value.max(minimum).min(maximum)
}

/// Override policy: zero means "use the default", and a value at or above
/// its ceiling collapses to the default as well.
fn tune(initval: u64, initval_ceiling: u64, defval: u64) -> u64 {
    if initval == 0 || initval >= initval_ceiling {
        defval
    } else {
        initval
    }
}

pub(crate) fn derive(
    ci: &ClockInit,
    tunables: &PageoutTunables,
    total_pages: u64,
    new_spread: u64,
) -> Thresholds {
    let half = tunables.threshold_style == ThresholdStyle::Halves;

    let lotsfree_max = tune(
        ci.lotsfree_max,
        total_pages,
        tunables.pages_from_bytes(LOTSFREE_MAX_BYTES),
    );
    let lotsfree_min = tune(
        ci.lotsfree_min,
        lotsfree_max,
        tunables.pages_from_bytes(LOTSFREE_MIN_BYTES),
    );

    let lotsfree = tune(
        ci.lotsfree,
        total_pages,
        clamp(
            total_pages / tunables.lotsfree_fraction,
            lotsfree_min,
            lotsfree_max,
        ),
    );

    let desfree = tune(ci.desfree, lotsfree, lotsfree / 2);

    let minfree = tune(
        ci.minfree,
        desfree,
        if half { desfree / 2 } else { 3 * desfree / 4 },
    );

    let throttlefree = tune(ci.throttlefree, desfree, minfree);

    let pageout_reserve = tune(
        ci.pageout_reserve,
        throttlefree,
        if half {
            throttlefree / 2
        } else {
            3 * throttlefree / 4
        },
    );

    // One push per disk revolution, two thirds busy.
    let maxpgio = if ci.maxpgio == 0 {
        (DISKRPM * 2) / 3
    } else {
        ci.maxpgio
    };

    // Until calibration has produced a spread, maxfastscan falls back to
    // the pages covering MAXHANDSPREAD_BYTES and the sampling cycles run
    // under the CPU budget alone.
    let maxfastscan = if ci.maxfastscan == 0 {
        if new_spread != 0 {
            new_spread
        } else {
            tunables.pages_from_bytes(MAXHANDSPREAD_BYTES)
        }
    } else {
        ci.maxfastscan
    };

    let mut fastscan = if ci.fastscan == 0 {
        (total_pages / 2).min(maxfastscan)
    } else {
        ci.fastscan
    };
    if fastscan > total_pages / 2 {
        fastscan = total_pages / 2;
    }

    let mut slowscan = if ci.slowscan == 0 {
        (fastscan / 10).min(tunables.max_slowscan)
    } else {
        ci.slowscan
    };
    if slowscan > fastscan / 2 {
        slowscan = fastscan / 2;
    }

    // The back hand must trail by at least one scheduler cycle and by less
    // than a full revolution, or it would revisit pages in the same wakeup
    // that the front hand cleared them.
    let mut handspreadpages = if ci.handspreadpages == 0 {
        fastscan
    } else {
        ci.handspreadpages
    };
    if handspreadpages >= total_pages {
        handspreadpages = total_pages - 1;
    }
    handspreadpages = handspreadpages.max(1);

    Thresholds {
        total_pages,
        lotsfree_min,
        lotsfree_max,
        lotsfree,
        desfree,
        minfree,
        throttlefree,
        pageout_reserve,
        maxpgio,
        maxfastscan,
        fastscan,
        slowscan,
        handspreadpages,
    }
}

/// Region sizing for the scanner pool: one scanner per `SCAN_REGION_BYTES`
/// of memory (or per doubled hand spread if that is wider), capped at
/// `MAX_PSCAN_THREADS`.
pub(crate) fn scanner_regions(
    tunables: &PageoutTunables,
    total_pages: u64,
    handspreadpages: u64,
) -> (u64, usize) {
    let mut sz = tunables.pages_from_bytes(SCAN_REGION_BYTES);
    if sz < handspreadpages {
        sz = handspreadpages.saturating_mul(2);
    }
    if sz > total_pages {
        sz = total_pages;
    }
    let sz = sz.max(1);

    let regions = total_pages.div_ceil(sz).max(1);
    let des = usize::try_from(regions)
        .unwrap_or(MAX_PSCAN_THREADS)
        .min(MAX_PSCAN_THREADS);
    (sz, des)
}

impl PageoutCtx {
    /// Recompute all reclaim thresholds from the host's current page count
    /// and the sticky operator overrides, then publish them as one unit.
    ///
    /// The first call records the override snapshot and leaves the scanner
    /// pool at one thread; later calls (calibration completion, memory
    /// reconfiguration) also re-derive the desired scanner count.
    pub fn setup_clock(&self) {
        let total_pages = self.vm.total_pages();
        let mut init = self.clock_init.lock();
        let recalc = init.is_some();
        let ci = init.get_or_insert_with(|| ClockInit::capture(&self.tunables));
        let new_spread = self.sample.new_spread.load(Ordering::Acquire);

        let th = derive(ci, &self.tunables, total_pages, new_spread);
        info!(
            target: "pgw::thresholds",
            event = "setup_clock",
            recalc,
            total_pages,
            lotsfree = th.lotsfree,
            desfree = th.desfree,
            minfree = th.minfree,
            throttlefree = th.throttlefree,
            pageout_reserve = th.pageout_reserve,
            fastscan = th.fastscan,
            slowscan = th.slowscan,
            handspreadpages = th.handspreadpages
        );
        self.thresholds.store(Arc::new(th));

        if !recalc {
            self.pscan_region_sz.store(total_pages, Ordering::Release);
            self.des_page_scanners.store(1, Ordering::Release);
            self.n_page_scanners.store(1, Ordering::Release);
            self.reset_hands[0].store(true, Ordering::Release);
        } else {
            let (region, des) = scanner_regions(&self.tunables, total_pages, th.handspreadpages);
            self.pscan_region_sz.store(region, Ordering::Release);
            self.des_page_scanners.store(des, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn derive_default(total_pages: u64) -> Thresholds {
        let tunables = PageoutTunables::default();
        let ci = ClockInit::capture(&tunables);
        derive(&ci, &tunables, total_pages, 0)
    }

    #[test]
    fn one_gigabyte_boot_sizing() {
        // 1 GiB of 4 KiB pages, no overrides.
        let th = derive_default(262_144);
        assert_eq!(th.lotsfree, 4096);
        assert_eq!(th.desfree, 2048);
        assert_eq!(th.minfree, 1536);
        assert_eq!(th.throttlefree, 1536);
        assert_eq!(th.pageout_reserve, 1152);
        assert_eq!(th.maxpgio, 40);
        // Before calibration fastscan is bounded by the 64 MiB spread.
        assert_eq!(th.fastscan, 16384);
        assert_eq!(th.handspreadpages, 16384);
    }

    #[test]
    fn halves_style_shrinks_lower_thresholds() {
        let tunables = PageoutTunables {
            threshold_style: ThresholdStyle::Halves,
            ..PageoutTunables::default()
        };
        let ci = ClockInit::capture(&tunables);
        let th = derive(&ci, &tunables, 262_144, 0);
        assert_eq!(th.minfree, th.desfree / 2);
        assert_eq!(th.pageout_reserve, th.throttlefree / 2);
    }

    #[test]
    fn calibrated_spread_caps_fastscan() {
        let tunables = PageoutTunables::default();
        let ci = ClockInit::capture(&tunables);
        let total = 262_144;
        let th = derive(&ci, &tunables, total, 200_000);
        assert_eq!(th.maxfastscan, 200_000);
        assert_eq!(th.fastscan, (total / 2).min(200_000));
    }

    #[test]
    fn override_below_ceiling_is_honored_across_recalc() {
        let tunables = PageoutTunables {
            lotsfree: 9000,
            slowscan: 77,
            ..PageoutTunables::default()
        };
        let ci = ClockInit::capture(&tunables);
        let first = derive(&ci, &tunables, 262_144, 0);
        let second = derive(&ci, &tunables, 262_144, 500_000);
        assert_eq!(first.lotsfree, 9000);
        assert_eq!(second.lotsfree, 9000);
        assert_eq!(first.slowscan, 77);
        assert_eq!(second.slowscan, 77);
    }

    #[test]
    fn override_at_ceiling_collapses_to_default() {
        let total = 262_144;
        let tunables = PageoutTunables {
            lotsfree: total,
            ..PageoutTunables::default()
        };
        let ci = ClockInit::capture(&tunables);
        let th = derive(&ci, &tunables, total, 0);
        assert_eq!(th.lotsfree, 4096);
    }

    #[test]
    fn derivation_is_idempotent() {
        let tunables = PageoutTunables {
            desfree: 1234,
            ..PageoutTunables::default()
        };
        let ci = ClockInit::capture(&tunables);
        let a = derive(&ci, &tunables, 1 << 22, 150_000);
        let b = derive(&ci, &tunables, 1 << 22, 150_000);
        assert_eq!(a, b);
    }

    #[test]
    fn region_sizing_matches_memory_size() {
        let tunables = PageoutTunables::default();
        // 64 GiB of memory is exactly one region.
        let region_pages = tunables.pages_from_bytes(SCAN_REGION_BYTES);
        let (sz, des) = scanner_regions(&tunables, region_pages, 16384);
        assert_eq!(sz, region_pages);
        assert_eq!(des, 1);
        // 256 GiB wants four scanners.
        let (_, des) = scanner_regions(&tunables, region_pages * 4, 16384);
        assert_eq!(des, 4);
        // Absurdly large memory is capped at the thread limit.
        let (_, des) = scanner_regions(&tunables, region_pages * 100, 16384);
        assert_eq!(des, MAX_PSCAN_THREADS);
    }

    #[test]
    fn wide_hand_spread_doubles_the_region() {
        let tunables = PageoutTunables::default();
        let region_pages = tunables.pages_from_bytes(SCAN_REGION_BYTES);
        let spread = region_pages * 3;
        let total = region_pages * 12;
        let (sz, des) = scanner_regions(&tunables, total, spread);
        assert_eq!(sz, spread * 2);
        assert_eq!(des, 2);
    }

    proptest! {
        #[test]
        fn threshold_chain_holds(total in 1u64 << 20..=1u64 << 40, spread in 0u64..=1u64 << 32) {
            let th = {
                let tunables = PageoutTunables::default();
                let ci = ClockInit::capture(&tunables);
                derive(&ci, &tunables, total, spread)
            };
            prop_assert!(th.pageout_reserve <= th.throttlefree);
            prop_assert!(th.throttlefree <= th.minfree);
            prop_assert!(th.minfree <= th.desfree);
            prop_assert!(th.desfree <= th.lotsfree);
            prop_assert!(th.lotsfree <= total);
            prop_assert!(th.slowscan <= th.fastscan / 2);
            prop_assert!(th.handspreadpages >= 1);
            prop_assert!(th.handspreadpages < total);
        }

        #[test]
        fn overrides_survive_any_recalc(
            total in 1024u64..=1u64 << 30,
            lotsfree_override in 1u64..1024u64,
            spread_a in 0u64..=1u64 << 24,
            spread_b in 0u64..=1u64 << 24,
        ) {
            let tunables = PageoutTunables {
                lotsfree: lotsfree_override,
                ..PageoutTunables::default()
            };
            let ci = ClockInit::capture(&tunables);
            let a = derive(&ci, &tunables, total, spread_a);
            let b = derive(&ci, &tunables, total, spread_b);
            // Below the ceiling, the override sticks verbatim.
            prop_assert_eq!(a.lotsfree, lotsfree_override);
            prop_assert_eq!(b.lotsfree, lotsfree_override);
        }

        #[test]
        fn scanner_count_is_bounded(total in 2u64..=1u64 << 40, spread in 1u64..=1u64 << 30) {
            let tunables = PageoutTunables::default();
            let (_, des) = scanner_regions(&tunables, total, spread);
            prop_assert!(des >= 1);
            prop_assert!(des <= MAX_PSCAN_THREADS);
        }
    }
}
