#![forbid(unsafe_code)]
//! Error types for Pagewheel.
//!
//! Defines `PgwError` and a `Result<T>` alias used throughout the workspace.
//! Most pageout failures are modes rather than errors (an ineligible page,
//! a saturated queue, an exhausted time budget); `PgwError` covers the few
//! places a call can genuinely fail: configuration, thread creation, and
//! the host's put-page path.

use pgw_types::TunablesError;
use thiserror::Error;

/// Unified error type for all Pagewheel operations.
#[derive(Debug, Error)]
pub enum PgwError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] TunablesError),

    #[error("put_page failed for vnode {vnode} at offset {offset}: {detail}")]
    PutPage {
        vnode: u64,
        offset: u64,
        detail: String,
    },
}

/// Result alias using `PgwError`.
pub type Result<T> = std::result::Result<T, PgwError>;
