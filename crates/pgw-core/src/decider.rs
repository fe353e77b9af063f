//! Per-page decision.
//!
//! Looks at the page under one of the two clock hands. Pages that are
//! kernel-owned, locked, free, pinned or widely shared are ineligible.
//! Otherwise the front hand clears the reference bit and moves on, while
//! the back hand frees pages the front hand marked and nobody has touched
//! since, pushing dirty ones through the writeback queue first.

use std::sync::atomic::Ordering;

use pgw_types::{PageAttrs, PageId, PageSyncFlags, ZonePageoutStat};
use tracing::trace;

use crate::stats::PageoutStats;
use crate::PageoutCtx;

/// Which clock hand is examining the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hand {
    /// Clears reference bits ahead of the back hand.
    Front,
    /// Reclaims pages left unreferenced since the front hand passed.
    Back,
}

/// Outcome of examining one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// Not a candidate at all; does not count as a scanned page.
    Ineligible,
    /// Examined but kept (referenced, or the writeback queue was full).
    NotFreed,
    /// Freed outright, or queued for writeback and free-on-completion.
    Freed,
}

impl PageoutCtx {
    /// Examine `page` under `hand` and decide its fate.
    pub fn check_page(&self, page: PageId, hand: Hand) -> CheckResult {
        let pages = &*self.pages;

        // Cheap unlocked rejections first; the reads are racy and the
        // locked recheck below catches anything that changed under us.
        let po_share = self.po_share.load(Ordering::Relaxed);
        if pages.is_kernel(page)
            || pages.is_locked(page)
            || pages.is_free(page)
            || pages.lock_count(page) != 0
            || pages.cow_count(page) != 0
            || pages.share_count_exceeds(page, po_share)
        {
            return CheckResult::Ineligible;
        }

        if !pages.try_lock_exclusive(page) {
            return CheckResult::Ineligible;
        }
        if pages.is_free(page) {
            // It became free between the check above and our lock.
            pages.unlock(page);
            return CheckResult::Ineligible;
        }
        if pages.lock_count(page) != 0 || pages.cow_count(page) != 0 {
            pages.unlock(page);
            return CheckResult::Ineligible;
        }

        // When reclaiming for zones over cap, only pages wholly owned by
        // an offending zone are candidates.
        let mut zid = None;
        if self.zones_over.load(Ordering::Acquire) {
            match pages.zone_of(page) {
                Some(zone) if self.vm.zone_is_over(zone) => zid = Some(zone),
                _ => {
                    pages.unlock(page);
                    return CheckResult::Ineligible;
                }
            }
        }

        let vnode = pages.vnode_of(page);
        let is_exec = vnode.map_or(false, |v| v.is_exec);
        let is_fs = vnode.map_or(false, |v| !v.is_swapfs);

        // The front hand clears REF and MOD while reading them; the back
        // hand reads without clearing and treats shared mappings as
        // referenced.
        let mode = match hand {
            Hand::Front => PageSyncFlags::ZERO_RM,
            Hand::Back => {
                PageSyncFlags::DONT_ZERO | PageSyncFlags::STOPON_REF | PageSyncFlags::STOPON_SHARED
            }
        };
        let mut attrs = pages.sync_attrs(page, mode);

        loop {
            if attrs.contains(PageAttrs::REF) {
                trace!(
                    target: "pgw::scanner",
                    event = "pageout_isref",
                    page = page.0,
                    hand = ?hand
                );
                if hand == Hand::Front {
                    pages.clear_ref(page);
                }
                pages.unlock(page);
                return CheckResult::NotFreed;
            }

            // Large pages must be demoted to base pages before they can be
            // freed one at a time. Demotion can unload mappings, so the
            // attributes are reloaded and the REF test repeated.
            if pages.size_class(page) != 0 {
                if !pages.try_demote(page) {
                    pages.unlock(page);
                    return CheckResult::Ineligible;
                }
                attrs = pages.get_attrs(page, PageAttrs::REF | PageAttrs::MOD);
                continue;
            }

            if attrs.contains(PageAttrs::MOD) {
                if let Some(v) = vnode {
                    // Hold the vnode before dropping the page lock so it
                    // cannot be recycled under the queued request.
                    pages.hold_vnode(v.id);
                    pages.unlock(page);
                    if !self.queue_io_request(v.id, v.offset) {
                        pages.release_vnode(v.id);
                        return CheckResult::NotFreed;
                    }
                    self.vm.zone_pageout_stat(
                        zid,
                        if is_fs {
                            ZonePageoutStat::Dirty
                        } else {
                            ZonePageoutStat::AnonDirty
                        },
                    );
                    return CheckResult::Freed;
                }
            }

            // Unload every translation and re-read the bits: a mapping may
            // have been used between the sync and the unload, in which
            // case the page goes back through the REF/MOD tests.
            trace!(
                target: "pgw::scanner",
                event = "pageout_free",
                page = page.0,
                hand = ?hand
            );
            pages.unload_mappings(page);
            attrs = pages.get_attrs(page, PageAttrs::REF | PageAttrs::MOD);
            if attrs.contains(PageAttrs::REF)
                || (attrs.contains(PageAttrs::MOD) && vnode.is_some())
            {
                continue;
            }

            pages.dispose_free(page);
            PageoutStats::bump(&self.stats.dfree);
            if is_fs {
                if is_exec {
                    PageoutStats::bump(&self.stats.execfree);
                } else {
                    PageoutStats::bump(&self.stats.fsfree);
                }
                self.vm.zone_pageout_stat(zid, ZonePageoutStat::Fs);
            } else {
                PageoutStats::bump(&self.stats.anonfree);
                self.vm.zone_pageout_stat(zid, ZonePageoutStat::Anon);
            }
            return CheckResult::Freed;
        }
    }
}
