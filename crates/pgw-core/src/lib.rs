#![forbid(unsafe_code)]
//! Pagewheel: page replacement and pageout control plane.
//!
//! The plane decides when physical pages are reclaimed, how fast, and
//! which pages become candidates. A scheduling tick runs `SCHEDPAGING_HZ`
//! times a second and converts instantaneous memory pressure into a scan
//! budget and a CPU budget; one to sixteen scanner workers walk the
//! circular page array with the classic two clock hands; a per-page
//! decider classifies each page under a hand; dirty pages drain through a
//! bounded asynchronous writeback queue; and a deadman watchdog panics the
//! host rather than let a wedged push hang the system forever.
//!
//! The plane owns no pages and performs no I/O itself. Everything it needs
//! from the surrounding virtual memory system comes through the two
//! capability traits in [`host`], which makes the whole plane runnable
//! against an in-memory mock host.
//!
//! Module map:
//! - [`host`]: `VmHost` / `PageHost` capability traits
//! - [`thresholds`]: `setup_clock`, reclaim thresholds and scanner sizing
//! - [`scheduler`]: `schedule_tick`, pressure to budgets, wake decisions
//! - [`scanner`]: `scan_cycle`, the two-handed clock workers
//! - [`decider`]: `check_page`, per-page classification
//! - [`writeback`]: bounded request pool and the push master
//! - [`deadman`]: stuck-push watchdog
//! - [`stats`]: kstat-style counters

pub mod deadman;
pub mod decider;
pub mod host;
pub mod scanner;
pub mod scheduler;
pub mod stats;
pub mod thresholds;
pub mod writeback;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use pgw_error::Result;
use pgw_types::{MAX_PSCAN_THREADS, MIN_PO_SHARE, NANOSEC, PageoutTunables, SCHEDPAGING_HZ};
use tracing::info;

pub use deadman::DeadmanState;
pub use decider::{CheckResult, Hand};
pub use host::{PageHost, VmHost};
pub use scanner::{ScanControl, ScannerState};
pub use stats::{PageoutStats, StatsSnapshot};
pub use thresholds::Thresholds;
pub use writeback::WritebackDepths;

use thresholds::ClockInit;
use writeback::PushQueue;

/// Scan-rate sampling state, written by worker 0 only.
#[derive(Debug, Default)]
pub(crate) struct CalibrationState {
    /// Pages visited across all samples.
    pub(crate) pages: AtomicU64,
    /// Nanoseconds spent across all samples.
    pub(crate) etime_ns: AtomicU64,
    /// Samples collected so far.
    pub(crate) count: AtomicU64,
    /// Measured scan rate, pages per second.
    pub(crate) rate: AtomicU64,
    /// `rate / 10`; non-zero marks calibration complete.
    pub(crate) new_spread: AtomicU64,
}

/// Broadcast wakeup: a generation counter under a mutex plus a condvar.
/// Waiters sleep until the generation moves past the one they last saw, so
/// a wake that races a waiter about to block is never lost.
#[derive(Debug, Default)]
pub(crate) struct WakeCell {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl WakeCell {
    pub(crate) fn current(&self) -> u64 {
        *self.generation.lock()
    }

    pub(crate) fn wake_all(&self) {
        *self.generation.lock() += 1;
        self.cv.notify_all();
    }

    /// Block until the generation advances past `seen`.
    pub(crate) fn wait(&self, seen: &mut u64) {
        let mut generation = self.generation.lock();
        while *generation == *seen {
            self.cv.wait(&mut generation);
        }
        *seen = *generation;
    }

    /// Like `wait`, with a timeout. Returns true if the generation moved.
    pub(crate) fn wait_timeout(&self, seen: &mut u64, timeout: Duration) -> bool {
        let mut generation = self.generation.lock();
        if *generation == *seen
            && self
                .cv
                .wait_for(&mut generation, timeout)
                .timed_out()
            && *generation == *seen
        {
            return false;
        }
        *seen = *generation;
        true
    }
}

/// Shared state of the pageout control plane.
///
/// One instance exists per host VM. The scheduler tick is the only writer
/// of the published budgets; scanner workers read them without locking and
/// tolerate one-cycle staleness by design.
pub struct PageoutCtx {
    pub(crate) tunables: PageoutTunables,
    pub(crate) vm: Arc<dyn VmHost>,
    pub(crate) pages: Arc<dyn PageHost>,

    pub(crate) thresholds: ArcSwap<Thresholds>,
    pub(crate) clock_init: Mutex<Option<ClockInit>>,

    /// Pages each scanner may examine next cycle.
    pub(crate) desscan: AtomicU64,
    /// Nanoseconds each scanner may spend next cycle.
    pub(crate) pageout_nsec: AtomicU64,
    pub(crate) min_pageout_nsec: u64,
    pub(crate) max_pageout_nsec: u64,
    pub(crate) zone_pageout_nsec: AtomicU64,

    /// Pages examined in the current scheduler interval.
    pub(crate) nscan: AtomicU64,
    pub(crate) zones_over: AtomicBool,
    /// Share-count skip threshold; read lock-free, modified under
    /// `pageout_mutex`.
    pub(crate) po_share: AtomicU64,
    pub(crate) pageout_mutex: Mutex<()>,

    /// One-way latches: the scheduler sets them, worker `i` consumes its
    /// own. A worker that consumes its latch while `i >=
    /// n_page_scanners` retires.
    pub(crate) reset_hands: [AtomicBool; MAX_PSCAN_THREADS],
    pub(crate) n_page_scanners: AtomicUsize,
    pub(crate) des_page_scanners: AtomicUsize,
    pub(crate) pscan_region_sz: AtomicU64,

    pub(crate) sample: CalibrationState,

    pub(crate) dopageout: AtomicBool,
    pub(crate) deadman_seconds: AtomicU64,

    pub(crate) scanner_wake: WakeCell,
    pub(crate) memavail: WakeCell,
    pub(crate) push: PushQueue,
    pub(crate) stats: PageoutStats,

    pub(crate) stop: AtomicBool,
    pub(crate) scanner_joins: Mutex<Vec<JoinHandle<()>>>,
}

impl PageoutCtx {
    /// Validate the tunables, wire up the host capabilities, and run the
    /// boot `setup_clock` pass.
    pub fn new(
        tunables: PageoutTunables,
        vm: Arc<dyn VmHost>,
        pages: Arc<dyn PageHost>,
    ) -> Result<Arc<Self>> {
        let tunables = tunables.validate()?;

        // Scanner duty cycle bounds: percent of one CPU, as nanoseconds
        // per scheduler interval.
        let min_pageout_nsec =
            (NANOSEC * tunables.min_percent_cpu / 100 / SCHEDPAGING_HZ).max(1);
        let max_pageout_nsec =
            (NANOSEC * tunables.max_percent_cpu / 100 / SCHEDPAGING_HZ).max(min_pageout_nsec);

        let ctx = Arc::new(Self {
            vm,
            pages,
            thresholds: ArcSwap::from_pointee(Thresholds::default()),
            clock_init: Mutex::new(None),
            desscan: AtomicU64::new(0),
            pageout_nsec: AtomicU64::new(max_pageout_nsec),
            min_pageout_nsec,
            max_pageout_nsec,
            zone_pageout_nsec: AtomicU64::new(tunables.zone_pageout_nsec),
            nscan: AtomicU64::new(0),
            zones_over: AtomicBool::new(false),
            po_share: AtomicU64::new(MIN_PO_SHARE),
            pageout_mutex: Mutex::new(()),
            reset_hands: std::array::from_fn(|_| AtomicBool::new(false)),
            n_page_scanners: AtomicUsize::new(1),
            des_page_scanners: AtomicUsize::new(1),
            pscan_region_sz: AtomicU64::new(0),
            sample: CalibrationState::default(),
            dopageout: AtomicBool::new(tunables.dopageout),
            deadman_seconds: AtomicU64::new(tunables.pageout_deadman_seconds),
            scanner_wake: WakeCell::default(),
            memavail: WakeCell::default(),
            push: PushQueue::new(tunables.async_list_size),
            stats: PageoutStats::default(),
            stop: AtomicBool::new(false),
            scanner_joins: Mutex::new(Vec::new()),
            tunables,
        });

        ctx.setup_clock();

        // An operator-preset scanner count takes effect at the first
        // calibrated tick, subject to the scheduler's clamps.
        if ctx.tunables.des_page_scanners != 0 {
            ctx.des_page_scanners
                .store(ctx.tunables.des_page_scanners, Ordering::Release);
        }

        Ok(ctx)
    }

    /// Latest published thresholds.
    #[must_use]
    pub fn thresholds(&self) -> Arc<Thresholds> {
        self.thresholds.load_full()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Scan budget published for the current cycle.
    #[must_use]
    pub fn desscan(&self) -> u64 {
        self.desscan.load(Ordering::Acquire)
    }

    /// CPU budget (nanoseconds) published for the current cycle.
    #[must_use]
    pub fn pageout_nsec(&self) -> u64 {
        self.pageout_nsec.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn min_pageout_nsec(&self) -> u64 {
        self.min_pageout_nsec
    }

    #[must_use]
    pub fn max_pageout_nsec(&self) -> u64 {
        self.max_pageout_nsec
    }

    /// Pages examined since the last scheduler tick.
    #[must_use]
    pub fn nscan(&self) -> u64 {
        self.nscan.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn zones_over(&self) -> bool {
        self.zones_over.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn po_share(&self) -> u64 {
        self.po_share.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn n_page_scanners(&self) -> usize {
        self.n_page_scanners.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn des_page_scanners(&self) -> usize {
        self.des_page_scanners.load(Ordering::Acquire)
    }

    /// Informational region size behind the scanner-pool calculation.
    #[must_use]
    pub fn pscan_region_sz(&self) -> u64 {
        self.pscan_region_sz.load(Ordering::Acquire)
    }

    /// Measured scan rate in pages per second; zero until calibrated.
    #[must_use]
    pub fn pageout_rate(&self) -> u64 {
        self.sample.rate.load(Ordering::Acquire)
    }

    /// `pageout_rate / 10`; non-zero marks calibration complete.
    #[must_use]
    pub fn pageout_new_spread(&self) -> u64 {
        self.sample.new_spread.load(Ordering::Acquire)
    }

    /// Whether worker `inst` has an unconsumed hand-reset latch.
    #[must_use]
    pub fn reset_hand_pending(&self, inst: usize) -> bool {
        self.reset_hands[inst].load(Ordering::Acquire)
    }

    /// Enable or disable page reclamation entirely. Disabled workers wake,
    /// observe, and go back to sleep.
    pub fn set_dopageout(&self, enabled: bool) {
        self.dopageout.store(enabled, Ordering::Release);
    }

    /// Request a different scanner-pool size. Applied (and clamped) by the
    /// next calibrated scheduler tick. Racing operator writes are not
    /// serialized.
    pub fn set_des_page_scanners(&self, desired: usize) {
        self.des_page_scanners.store(desired, Ordering::Release);
    }

    /// Adjust the deadman window; zero disables it.
    pub fn set_deadman_seconds(&self, seconds: u64) {
        self.deadman_seconds.store(seconds, Ordering::Release);
    }

    /// CPU budget override for zone-cap scans; zero means the maximum.
    pub fn set_zone_pageout_nsec(&self, nsec: u64) {
        self.zone_pageout_nsec.store(nsec, Ordering::Release);
    }

    /// Pin the share-count skip threshold, clamped to its legal range.
    pub fn set_po_share(&self, share: u64) {
        let _guard = self.pageout_mutex.lock();
        self.po_share
            .store(share.clamp(MIN_PO_SHARE, pgw_types::MAX_PO_SHARE), Ordering::Relaxed);
    }

    /// Block until the scheduler next announces that kernel memory is
    /// available, or until `timeout`. Returns true on an announcement.
    pub fn wait_for_memory(&self, timeout: Duration) -> bool {
        let mut seen = self.memavail.current();
        self.memavail.wait_timeout(&mut seen, timeout)
    }

    /// Ask every thread of the plane to wind down. Loop bodies observe the
    /// flag at their next wakeup; [`PageoutDaemon`] calls this and then
    /// joins.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.scanner_wake.wake_all();
        self.push.wake_all();
        self.memavail.wake_all();
    }
}

impl std::fmt::Debug for PageoutCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageoutCtx")
            .field("thresholds", &self.thresholds.load())
            .field("desscan", &self.desscan())
            .field("pageout_nsec", &self.pageout_nsec())
            .field("n_page_scanners", &self.n_page_scanners())
            .field("po_share", &self.po_share())
            .field("zones_over", &self.zones_over())
            .finish_non_exhaustive()
    }
}

/// Handle for a running pageout plane: the scheduler, the writeback
/// master, the deadman, and however many scanner workers the scheduler
/// decides to run. Threads are stopped and joined on `shutdown` or drop.
#[derive(Debug)]
pub struct PageoutDaemon {
    ctx: Arc<PageoutCtx>,
    scheduler: Option<JoinHandle<()>>,
    master: Option<JoinHandle<()>>,
    deadman: Option<JoinHandle<()>>,
}

impl PageoutDaemon {
    /// Spawn the plane's threads: scanner 0, the writeback master, the
    /// 4 Hz scheduler and the 1 Hz deadman.
    pub fn start(ctx: Arc<PageoutCtx>) -> Result<Self> {
        info!(
            target: "pgw::daemon",
            event = "pageout_start",
            total_pages = ctx.thresholds().total_pages,
            lotsfree = ctx.thresholds().lotsfree
        );

        ctx.spawn_scanner(0);

        let master_ctx = Arc::clone(&ctx);
        let master = thread::Builder::new()
            .name("pgw-pageout".to_owned())
            .spawn(move || master_ctx.push_master_loop())?;

        let sched_ctx = Arc::clone(&ctx);
        let scheduler = thread::Builder::new()
            .name("pgw-schedpage".to_owned())
            .spawn(move || {
                let interval = Duration::from_nanos(NANOSEC / SCHEDPAGING_HZ);
                while !sched_ctx.stop.load(Ordering::Acquire) {
                    sched_ctx.schedule_tick();
                    thread::sleep(interval);
                }
            })?;

        let deadman_ctx = Arc::clone(&ctx);
        let deadman = thread::Builder::new()
            .name("pgw-deadman".to_owned())
            .spawn(move || {
                let mut state = DeadmanState::default();
                while !deadman_ctx.stop.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_secs(1));
                    deadman_ctx.deadman_tick(&mut state);
                }
            })?;

        Ok(Self {
            ctx,
            scheduler: Some(scheduler),
            master: Some(master),
            deadman: Some(deadman),
        })
    }

    #[must_use]
    pub fn ctx(&self) -> &Arc<PageoutCtx> {
        &self.ctx
    }

    /// Request shutdown and block until every thread exits.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.ctx.request_stop();

        for handle in [
            self.scheduler.take(),
            self.master.take(),
            self.deadman.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }
        let scanners = std::mem::take(&mut *self.ctx.scanner_joins.lock());
        for handle in scanners {
            let _ = handle.join();
        }
        info!(target: "pgw::daemon", event = "pageout_stopped");
    }
}

impl Drop for PageoutDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
