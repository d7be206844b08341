use std::{ptr::NonNull, sync::atomic::Ordering, thread};

use log::{debug, error};

use super::{EvictError, EvictFlags, Evictor};
use crate::{
	cache::hazard::HazardRegistry,
	reconcile::{BlockManager, PageHeap, RecOutcome, Reconciler},
	tree::{
		page::Page,
		slot::{PageRef, RefState},
	},
};

impl<'a, R, B, P, H> Evictor<'a, R, B, P, H>
where
	R: Reconciler,
	B: BlockManager,
	P: PageHeap,
	H: HazardRegistry,
{
	/// Get exclusive access to the candidate and review its subtree for
	/// conditions that block eviction. On failure every lock taken by the
	/// review has been released again.
	pub(super) fn review(&self, page: NonNull<Page>, flags: EvictFlags) -> Result<(), EvictError> {
		let mut last = None;

		// Exclusive access to the candidate itself, unless the caller has
		// the tree locked down.
		if !flags.single {
			let slot = unsafe { page.as_ref().parent_ref() }.ok_or(EvictError::Corrupted(
				"eviction candidate without a parent reference",
			))?;
			self.hazard_exclusive(slot, flags.wait)?;
			last = Some(page);
		}

		// The subtree may reference deleted or split pages that will merge
		// into the candidate; every one of them must be locked down too. An
		// ordinary in-memory child ends the walk: those pages must be
		// evicted first.
		let result = if unsafe { page.as_ref() }.is_internal() {
			self.excl(page, &mut last, flags)
		} else {
			Ok(())
		};

		if let Err(err) = result {
			if !flags.single && last.is_some() {
				let _ = self.excl_clear(page, last);
			}
			return Err(err);
		}
		Ok(())
	}

	/// Walk an internal page's subtree in depth-first pre-order, acquiring
	/// each page's lock before reviewing the children it references.
	/// `last` tracks the most recently locked page so a failed walk can be
	/// unwound in the same order.
	fn excl(
		&self,
		parent: NonNull<Page>,
		last: &mut Option<NonNull<Page>>,
		flags: EvictFlags,
	) -> Result<(), EvictError> {
		let parent = unsafe { parent.as_ref() };
		for slot in parent.children() {
			match slot.state() {
				RefState::Disk => continue,
				RefState::Mem => {}
				RefState::Locked | RefState::Reading => return Err(EvictError::Busy),
			}
			let Some(child) = slot.page() else {
				return Err(EvictError::Corrupted(
					"in-memory child reference without a page",
				));
			};
			self.excl_page(slot, child, last, flags)?;

			if unsafe { child.as_ref() }.is_internal() {
				self.excl(child, last, flags)?;
			}
		}
		Ok(())
	}

	/// Acquire exclusive access to one child and check whether it can merge
	/// into the evicted candidate.
	fn excl_page(
		&self,
		slot: &PageRef,
		page: NonNull<Page>,
		last: &mut Option<NonNull<Page>>,
		flags: EvictFlags,
	) -> Result<(), EvictError> {
		let child = unsafe { page.as_ref() };

		// Cheap test first: without a merge-capable reconciliation outcome
		// the child can never fold into the candidate, and the subtree
		// cannot be evicted. Not a problem, just a bad candidate choice.
		if !child.rec_outcome().mergeable() {
			return Err(EvictError::Unmergeable);
		}

		if !flags.single {
			self.hazard_exclusive(slot, flags.wait)?;
			// The lock is held from here on; advance the unwind marker
			// before any further check can fail.
			*last = Some(page);
		}

		// The careful test: merge-split pages merge no matter what; split
		// or empty pages only while clean. A dirty split or empty page must
		// be written first, so the parent knows its on-disk shape.
		match child.rec_outcome() {
			RecOutcome::SplitMerge => Ok(()),
			outcome if outcome.mergeable() && !child.is_modified() => Ok(()),
			_ => Err(EvictError::Unmergeable),
		}
	}

	/// Discard exclusive access and return a subtree to availability.
	///
	/// Pages are unlocked in the same depth-first pre-order they were
	/// locked in; anything else would make the `last` marker meaningless.
	/// Returns `true` once `last` has been reached.
	pub(super) fn excl_clear(
		&self,
		page: NonNull<Page>,
		last: Option<NonNull<Page>>,
	) -> Result<bool, EvictError> {
		let current = unsafe { page.as_ref() };
		let slot = unsafe { current.parent_ref() }.ok_or(EvictError::Corrupted(
			"locked page without a parent reference",
		))?;
		slot.publish(RefState::Mem);
		if last == Some(page) {
			return Ok(true);
		}

		if current.is_internal() {
			for child_slot in current.children() {
				match child_slot.state() {
					RefState::Disk => continue,
					RefState::Locked => {
						let Some(child) = child_slot.page() else {
							return Err(EvictError::Corrupted(
								"in-memory child reference without a page",
							));
						};
						if self.excl_clear(child, last)? {
							return Ok(true);
						}
					}
					// The acquisition walk locked every in-memory page it
					// passed and ended at the first reader; any other state
					// here means the walk orders diverged.
					state @ (RefState::Mem | RefState::Reading) => {
						error!(
							"session {}: page in state {state:?} while unlocking a reviewed subtree",
							self.session
						);
						return Err(EvictError::Corrupted(
							"unexpected page state during subtree unlock",
						));
					}
				}
			}
		}
		Ok(false)
	}

	/// Request exclusive access to the page behind `slot`.
	///
	/// The `Locked` store is globally ordered against reader hazard
	/// publishes: a reader that succeeds in publishing after this store
	/// will observe `Locked` and back out, so a snapshot without the page
	/// proves no reader holds it.
	pub(super) fn hazard_exclusive(&self, slot: &PageRef, force: bool) -> Result<(), EvictError> {
		// The page must be in memory; we may already have it locked.
		debug_assert!(matches!(slot.state(), RefState::Mem | RefState::Locked));

		// Hazard references are acquired down the tree, so exclusivity
		// requests cannot deadlock.
		slot.lock_for_evict();
		let Some(page) = slot.page() else {
			return Err(EvictError::Corrupted(
				"in-memory child reference without a page",
			));
		};

		let stats = self.cache.stats();
		let mut snap = self.snapshot.borrow_mut();
		loop {
			self.cache.hazards().snapshot(&mut snap);
			// No matching hazard reference: the page is ours.
			if !snap.contains(page.as_ptr()) {
				return Ok(());
			}

			stats.rec_hazard.fetch_add(1, Ordering::Relaxed);

			if force {
				// The caller insists: spin until the hazard goes away.
				thread::yield_now();
				continue;
			}

			stats.cache_evict_hazard.fetch_add(1, Ordering::Relaxed);
			debug!(
				"session {}: page {:p} hazard request failed",
				self.session,
				page.as_ptr()
			);

			// Return the page to use.
			slot.publish(RefState::Mem);
			return Err(EvictError::Busy);
		}
	}
}
