//! Error types for the **wmchain** core crate.
//!
//! All high-level operations return [`crate::Result`], a convenient
//! alias for `core::result::Result<T, Error>`.
//!
//! The enum maps directly onto the error kinds a single image
//! operation (embed/extract/remove) can raise. Batch-level failures
//! (missing input directory, corrupt ledger) abort the whole batch;
//! per-image failures are collected by the caller instead of
//! propagated, so the ledger is never mutated for a failed image.
//!
//! # Examples
//!
//! ```
//! use wmchain_core::{Error, Result};
//!
//! fn demo_fn(fail: bool) -> Result<()> {
//!     if fail {
//!         Err(Error::NoMatchingTransaction)
//!     } else {
//!         Ok(())
//!     }
//! }
//! ```

use thiserror::Error;

/// Core crate error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Input path does not exist, or a batch directory contains no
    /// supported images.
    #[error("input missing: {0}")]
    InputMissing(String),

    /// File extension is not one of the supported image formats.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// The image decoder rejected the file.
    #[error("image decode failed: {0}")]
    ImageDecodeFailed(String),

    /// Ledger hash mismatch, broken chain linkage, or JSON parse
    /// failure. Fatal; there is no recovery path.
    #[error("ledger corrupt: {0}")]
    LedgerCorrupt(String),

    /// An `add_transaction` append conflicted with a concurrent
    /// writer after the bounded retry budget was exhausted.
    #[error("ledger contention: {0}")]
    LedgerContention(String),

    /// Extract/remove could not find a matching transaction. For
    /// extract this triggers the provenance resolver; for remove this
    /// is fatal for the image in question.
    #[error("no matching transaction found for image hash")]
    NoMatchingTransaction,

    /// The recovered image's content hash does not match
    /// `hash_image_orig` recorded in the embed transaction.
    #[error("codec assertion failed: recovered image hash mismatch")]
    CodecAssertionFailed,

    /// Placeholder for errors bubbled up from external crates that do
    /// not warrant their own variant.
    #[error("{0}")]
    Other(String),
}

/// Convenient result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
