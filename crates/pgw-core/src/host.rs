//! Host capability traits.
//!
//! The control plane never touches a page table, a filesystem, or a wall
//! clock directly; everything it needs from the surrounding virtual memory
//! system arrives through these two trait objects, handed to
//! [`PageoutCtx::new`](crate::PageoutCtx::new). Production hosts wire them
//! to the real VM; tests wire them to in-memory doubles.

use pgw_error::Result;
use pgw_types::{PageAttrs, PageId, PageSyncFlags, PushFlags, VnodeId, VnodeInfo, ZoneId, ZonePageoutStat};

/// Memory-pressure signals, reclaim callbacks, zone accounting and the
/// clock. All getters are read-only snapshots: the scheduler reads them
/// once per tick, the scanners once per loop iteration, and no consistency
/// between successive reads is assumed.
pub trait VmHost: Send + Sync {
    /// Pages currently on the free list.
    fn freemem(&self) -> u64;

    /// Pages that waiting allocations have asked the scanner to produce.
    fn needfree(&self) -> u64;

    /// Anticipated short-term demand added to the pressure calculation.
    fn deficit(&self) -> u64;

    /// Total pageable pages in the system.
    fn total_pages(&self) -> u64;

    /// Extra headroom below which the slab reaper should run early.
    fn kmem_reapahead(&self) -> u64 {
        0
    }

    /// Net pages the kernel allocator could give back; positive means
    /// memory waiters are worth waking.
    fn kmem_avail(&self) -> i64;

    /// Reap idle slab caches.
    fn kmem_reap(&self);

    /// Pre-reap segment-level caches.
    fn seg_preap(&self);

    fn kcage_on(&self) -> bool {
        false
    }

    fn kcage_freemem(&self) -> u64 {
        0
    }

    fn kcage_desfree(&self) -> u64 {
        0
    }

    fn kcage_needfree(&self) -> u64 {
        0
    }

    /// Wake the kernel cage reclaimer.
    fn kcage_cageout_wakeup(&self) {}

    /// Number of zones currently over their physical memory cap.
    fn zones_over_cap(&self) -> u64 {
        0
    }

    /// Whether one specific zone is over its cap.
    fn zone_is_over(&self, zone: ZoneId) -> bool;

    /// Per-zone pageout accounting. `None` means the page was not owned by
    /// any single zone.
    fn zone_pageout_stat(&self, _zone: Option<ZoneId>, _stat: ZonePageoutStat) {}

    /// Monotonic wall clock in nanoseconds.
    fn now_ns(&self) -> u64;

    /// True once the system has begun panicking; the deadman stands down.
    fn panicking(&self) -> bool {
        false
    }

    /// Deliver a fatal diagnostic. Production hosts are expected to abort
    /// the system here (the deadman calls this to force a crash dump
    /// rather than hang); test hosts may record the call and return.
    fn panic_vm(&self, diagnostic: &str);
}

/// The circular page array and per-page operations.
///
/// Pages form a closed ring: `next` of the last page is `first` again.
/// `PageId` values are positions on that ring and carry no other meaning.
/// The ring may be re-numbered across a memory reconfiguration; callers
/// must not assume a previously fetched id stays valid across a yield,
/// which is why the scanner re-derives both hands whenever its reset latch
/// fires.
pub trait PageHost: Send + Sync {
    fn first(&self) -> PageId;

    fn next(&self, page: PageId) -> PageId;

    /// Advance `n` steps around the ring.
    fn nextn(&self, page: PageId, n: u64) -> PageId;

    /// Page belongs to the kernel and is permanently ineligible.
    fn is_kernel(&self, page: PageId) -> bool;

    /// Page is locked by someone else (e.g. for physical I/O).
    fn is_locked(&self, page: PageId) -> bool;

    fn is_free(&self, page: PageId) -> bool;

    /// Count of soft locks pinning the page.
    fn lock_count(&self, page: PageId) -> u64;

    /// Count of copy-on-write reservations against the page.
    fn cow_count(&self, page: PageId) -> u64;

    /// Whether the page is mapped by more than `threshold` address spaces.
    fn share_count_exceeds(&self, page: PageId, threshold: u64) -> bool;

    /// Size class; non-zero means part of a large page.
    fn size_class(&self, page: PageId) -> u32;

    /// Owning zone, or `None` for cross-zone shared pages.
    fn zone_of(&self, page: PageId) -> Option<ZoneId>;

    /// Try to take the page's exclusive lock without blocking.
    fn try_lock_exclusive(&self, page: PageId) -> bool;

    fn unlock(&self, page: PageId);

    /// Synchronize the REF/MOD bits out of the MMU per `mode` and return
    /// the observed attributes.
    fn sync_attrs(&self, page: PageId, mode: PageSyncFlags) -> PageAttrs;

    fn clear_ref(&self, page: PageId);

    /// Read attribute bits covered by `mask` without clearing them.
    fn get_attrs(&self, page: PageId, mask: PageAttrs) -> PageAttrs;

    /// Attempt to demote a large page to base pages. The caller holds the
    /// exclusive lock; on success the page's size class is zero.
    fn try_demote(&self, page: PageId) -> bool;

    /// Force-unload all MMU mappings of the page.
    fn unload_mappings(&self, page: PageId);

    /// Release the page to the free list. The caller holds the exclusive
    /// lock, which this consumes.
    fn dispose_free(&self, page: PageId);

    /// The page's vnode binding, if any, snapshotted under the page lock.
    fn vnode_of(&self, page: PageId) -> Option<VnodeInfo>;

    /// Take a hold on a vnode so it survives until the matching release.
    fn hold_vnode(&self, vnode: VnodeId);

    fn release_vnode(&self, vnode: VnodeId);

    /// Asynchronous write of one page back to its vnode. This is a request
    /// submission, not the I/O itself; it should only block if the
    /// filesystem is itself starved for memory.
    fn put_page(&self, vnode: VnodeId, offset: u64, len: u64, flags: PushFlags) -> Result<()>;
}
