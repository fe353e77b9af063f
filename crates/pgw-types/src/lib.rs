#![forbid(unsafe_code)]

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheduler wakeups per second.
pub const SCHEDPAGING_HZ: u64 = 4;

/// The scanner re-checks its CPU budget every `PAGES_POLL_MASK + 1` pages.
pub const PAGES_POLL_MASK: u64 = 1023;

/// Upper bound on concurrent scanner threads.
pub const MAX_PSCAN_THREADS: usize = 16;

/// Floor for the share-count skip threshold.
pub const MIN_PO_SHARE: u64 = 8;

/// Ceiling for the share-count skip threshold.
pub const MAX_PO_SHARE: u64 = MIN_PO_SHARE << 24;

/// Assumed rotational speed of a paging device, in revolutions per second.
/// Feeds the default `maxpgio` of `(DISKRPM * 2) / 3` operations per second.
pub const DISKRPM: u64 = 60;

pub const NANOSEC: u64 = 1_000_000_000;

const MEGABYTE: u64 = 1024 * 1024;

/// Default floor for `lotsfree` (16 MiB).
pub const LOTSFREE_MIN_BYTES: u64 = 16 * MEGABYTE;

/// Default ceiling for `lotsfree` (2 GiB).
pub const LOTSFREE_MAX_BYTES: u64 = 2048 * MEGABYTE;

/// Span of the hand spread before calibration has produced a scan rate
/// (64 MiB, expressed in bytes; divide by the page size for pages).
pub const MAXHANDSPREAD_BYTES: u64 = 64 * MEGABYTE;

/// Per-scanner region used to size the scanner pool (64 GiB).
pub const SCAN_REGION_BYTES: u64 = 64 * 1024 * MEGABYTE;

pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Position of a page frame on the circular page "clock face".
///
/// Opaque to the control plane; only the host can interpret it. Walks of
/// the clock face go through the host's `first`/`next`/`nextn` capability,
/// never through arithmetic on the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

/// Stable identity of a vnode backing one or more pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VnodeId(pub u64);

/// Zone (resource-control container) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(pub u32);

/// Snapshot of a page's vnode binding, taken while the page is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VnodeInfo {
    pub id: VnodeId,
    /// Byte offset of the page within the vnode.
    pub offset: u64,
    /// The vnode maps executable text.
    pub is_exec: bool,
    /// The vnode belongs to swapfs; its pages count as anonymous memory.
    pub is_swapfs: bool,
}

bitflags! {
    /// Hardware-maintained page attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttrs: u8 {
        const REF = 0b01;
        const MOD = 0b10;
    }
}

bitflags! {
    /// Modes for synchronizing a page's attribute bits out of the MMU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageSyncFlags: u8 {
        /// Atomically clear REF and MOD while reading them.
        const ZERO_RM = 0b0001;
        /// Read the bits without clearing.
        const DONT_ZERO = 0b0010;
        /// Stop the sync as soon as a set REF bit is seen.
        const STOPON_REF = 0b0100;
        /// Treat shared mappings as referenced.
        const STOPON_SHARED = 0b1000;
    }
}

bitflags! {
    /// Flags carried by an asynchronous writeback request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PushFlags: u8 {
        const ASYNC = 0b01;
        /// Free the page once the write completes.
        const FREE = 0b10;
    }
}

/// How the descending thresholds are derived from one another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStyle {
    /// `minfree = 3/4 desfree`, `pageout_reserve = 3/4 throttlefree`.
    #[default]
    Quarters,
    /// Each threshold is half of the next larger one.
    Halves,
}

/// Per-zone pageout accounting event, forwarded to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePageoutStat {
    /// Dirty fs-backed page queued for writeback.
    Dirty,
    /// Dirty anonymous page queued for writeback.
    AnonDirty,
    /// Clean fs-backed page freed.
    Fs,
    /// Clean anonymous page freed.
    Anon,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunablesError {
    #[error("invalid tunable: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Operator-supplied knobs for the pageout control plane.
///
/// Every threshold override defaults to zero, which means "derive the value
/// from the system size". A non-zero override below its ceiling is honored
/// verbatim across all later recalculations; a value at or above the ceiling
/// collapses back to the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PageoutTunables {
    /// Host page size in bytes. Must be a power of two.
    pub page_size: u64,
    /// `lotsfree` defaults to `total_pages / lotsfree_fraction`.
    pub lotsfree_fraction: u64,
    /// Override (pages) for the `lotsfree` floor.
    pub lotsfree_min: u64,
    /// Override (pages) for the `lotsfree` ceiling.
    pub lotsfree_max: u64,
    pub lotsfree: u64,
    pub desfree: u64,
    pub minfree: u64,
    pub throttlefree: u64,
    pub pageout_reserve: u64,
    /// Pages pushed to backing store per second before pacing kicks in.
    pub maxpgio: u64,
    pub maxfastscan: u64,
    pub fastscan: u64,
    pub slowscan: u64,
    pub handspreadpages: u64,
    pub threshold_style: ThresholdStyle,
    /// Scanner duty-cycle floor, percent of one CPU.
    pub min_percent_cpu: u64,
    /// Scanner duty-cycle ceiling, percent of one CPU.
    pub max_percent_cpu: u64,
    /// Cap on the derived `slowscan` (pages per second).
    pub max_slowscan: u64,
    /// Samples collected before the scan rate is considered calibrated.
    pub pageout_sample_lim: u64,
    /// Front-hand wraps between self-repositionings of a scanner's hands.
    pub pageout_reset_cnt: u64,
    /// Seconds a single push may stall before the deadman panics the
    /// system. Zero disables the deadman.
    pub pageout_deadman_seconds: u64,
    /// Master kill switch; false idles the scanners entirely.
    pub dopageout: bool,
    /// Number of slots in the async writeback request pool.
    pub async_list_size: usize,
    /// Desired scanner thread count; zero lets calibration decide.
    pub des_page_scanners: usize,
    /// CPU budget per wakeup while reclaiming for zones over cap.
    /// Zero means "use the maximum budget".
    pub zone_pageout_nsec: u64,
}

impl Default for PageoutTunables {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            lotsfree_fraction: 64,
            lotsfree_min: 0,
            lotsfree_max: 0,
            lotsfree: 0,
            desfree: 0,
            minfree: 0,
            throttlefree: 0,
            pageout_reserve: 0,
            maxpgio: 0,
            maxfastscan: 0,
            fastscan: 0,
            slowscan: 0,
            handspreadpages: 0,
            threshold_style: ThresholdStyle::Quarters,
            min_percent_cpu: 4,
            max_percent_cpu: 80,
            max_slowscan: 100,
            pageout_sample_lim: 4,
            pageout_reset_cnt: 64,
            pageout_deadman_seconds: 90,
            dopageout: true,
            async_list_size: 256,
            des_page_scanners: 0,
            zone_pageout_nsec: 0,
        }
    }
}

impl PageoutTunables {
    /// Validate operator input, returning the tunables unchanged on success.
    pub fn validate(self) -> Result<Self, TunablesError> {
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(TunablesError::InvalidField {
                field: "page_size",
                reason: "must be a power of two >= 512",
            });
        }
        if self.lotsfree_fraction == 0 {
            return Err(TunablesError::InvalidField {
                field: "lotsfree_fraction",
                reason: "must be non-zero",
            });
        }
        if self.min_percent_cpu == 0 || self.min_percent_cpu > 100 {
            return Err(TunablesError::InvalidField {
                field: "min_percent_cpu",
                reason: "must be in 1..=100",
            });
        }
        if self.max_percent_cpu < self.min_percent_cpu || self.max_percent_cpu > 100 {
            return Err(TunablesError::InvalidField {
                field: "max_percent_cpu",
                reason: "must be in min_percent_cpu..=100",
            });
        }
        if self.pageout_sample_lim == 0 {
            return Err(TunablesError::InvalidField {
                field: "pageout_sample_lim",
                reason: "must be non-zero",
            });
        }
        if self.pageout_reset_cnt == 0 {
            return Err(TunablesError::InvalidField {
                field: "pageout_reset_cnt",
                reason: "must be non-zero",
            });
        }
        if self.async_list_size == 0 {
            return Err(TunablesError::InvalidField {
                field: "async_list_size",
                reason: "must be non-zero",
            });
        }
        if self.des_page_scanners > MAX_PSCAN_THREADS {
            return Err(TunablesError::InvalidField {
                field: "des_page_scanners",
                reason: "must not exceed MAX_PSCAN_THREADS",
            });
        }
        Ok(self)
    }

    /// Convert a byte count to pages, truncating.
    #[must_use]
    pub fn pages_from_bytes(&self, bytes: u64) -> u64 {
        bytes / self.page_size
    }
}
