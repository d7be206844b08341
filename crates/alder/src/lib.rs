// Lint config
#![cfg_attr(
	not(test),
	warn(clippy::cast_possible_wrap),
	warn(clippy::cast_possible_truncation)
)]

mod cache;
mod consts;
mod eviction;
mod reconcile;
mod tree;

pub use cache::{
	hazard::{HazardRegistry, HazardSnapshot, HazardTable, SessionId},
	stats::EvictionStats,
	Cache, CacheConfig,
};
pub use eviction::{EvictError, EvictFlags, Evictor};
pub use reconcile::{
	BlockError, BlockManager, PageHeap, RecOutcome, ReconcileError, Reconciler,
};
pub use tree::{
	page::{Address, Page, PageKind, PageModify, RecResult, RefAddr, SplitChild},
	slot::{PageRef, RefState},
	Btree,
};
