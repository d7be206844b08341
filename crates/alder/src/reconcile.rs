use std::io;

use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::tree::page::{Address, Page};

/// Outcome of the most recent reconciliation of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RecOutcome {
	/// The page was never reconciled (or the outcome was cleared).
	#[default]
	None = 0,
	/// The page reconciled to nothing and merges into its parent.
	Empty = 1,
	/// The page was rewritten one-for-one to a new location.
	Replace = 2,
	/// The page split into a replacement internal page.
	Split = 3,
	/// The page is itself a split byproduct with no on-disk identity; it
	/// only ever merges into an ancestor.
	SplitMerge = 4,
}

impl RecOutcome {
	pub(crate) fn from_u8(value: u8) -> Self {
		match value {
			0 => Self::None,
			1 => Self::Empty,
			2 => Self::Replace,
			3 => Self::Split,
			4 => Self::SplitMerge,
			_ => unreachable!("invalid reconciliation outcome {value}"),
		}
	}

	/// Whether a child page with this outcome can fold into an evicted
	/// parent.
	#[inline]
	pub fn mergeable(self) -> bool {
		matches!(self, Self::Empty | Self::Split | Self::SplitMerge)
	}
}

#[derive(Debug, Error)]
#[error("page reconciliation failed")]
pub struct ReconcileError(#[from] pub io::Error);

#[derive(Debug, Error)]
#[error("block manager failed to free an address")]
pub struct BlockError(#[from] pub io::Error);

/// The reconciliation writer. `write` turns a dirty in-memory page into one
/// or more on-disk images and records the outcome on the page
/// (`rec_outcome` plus the modify result).
#[cfg_attr(test, automock)]
pub trait Reconciler {
	fn write(&self, page: &Page) -> Result<(), ReconcileError>;

	/// Finalize objects tracked during reconciliation; invoked while a page
	/// with a modify structure is being discarded.
	fn track_wrapup(&self, page: &Page, finalize: bool) -> Result<(), ReconcileError>;
}

/// On-disk space management; the eviction core only ever frees space, and
/// only for replaced root addresses.
#[cfg_attr(test, automock)]
pub trait BlockManager {
	fn free(&self, addr: Address) -> Result<(), BlockError>;
}

/// Destructor for page memory; receives ownership of every evicted page.
#[cfg_attr(test, automock)]
pub trait PageHeap {
	fn page_out(&self, page: Box<Page>);
}
