//! # Restart signals for optimistic traversal
//!
//! Nothing in here reaches the public API. Every tree operation is written as
//! a fallible closure over optimistic reads; an `Err` means "what you read may
//! be garbage, start over" and the surrounding retry loop does exactly that.
//!
//! ```text
//! pin epoch
//!     │
//!     ▼
//! descend from root ──► Err(Unwind) / Err(Obsolete) ──┐
//!     │                                               │
//!     ▼                                               │
//! read / upgrade leaf ─► Err(Unwind) ─────────────────┤
//!     │                                               │
//!     ▼                                               ▼
//! return result                               restart from root
//! ```

use thiserror::Error;

/// Reasons an optimistic step has to be abandoned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// A version check failed: a writer held or released the latch since the
	/// snapshot was taken, or a latch upgrade lost the race to another
	/// writer. Anything read under the snapshot must be discarded.
	#[error("optimistic validation failed")]
	Unwind,

	/// The node has been retired from the tree. It may still be dereferenced
	/// (the epoch keeps it alive) but it will never be latched exclusively
	/// again.
	#[error("node is obsolete")]
	Obsolete,
}

/// Result alias used by every restartable step.
pub type Result<T> = std::result::Result<T, Error>;
