use std::{cell::RefCell, ptr::NonNull, sync::atomic::Ordering};

use log::trace;
use thiserror::Error;

use crate::{
	cache::{
		hazard::{HazardRegistry, HazardSnapshot, SessionId},
		Cache,
	},
	reconcile::{BlockError, BlockManager, PageHeap, RecOutcome, ReconcileError, Reconciler},
	tree::{
		page::{Address, Page, RecResult, RefAddr},
		slot::{PageRef, RefState},
		Btree,
	},
};

mod discard;
mod review;

#[derive(Debug, Error)]
pub enum EvictError {
	/// A concurrent actor holds a conflicting state (`Reading`, `Locked`)
	/// or a hazard reference. The caller may retry later.
	#[error("page is busy")]
	Busy,
	/// The subtree contains a child that cannot merge into the candidate.
	/// The eviction server should pick another page.
	#[error("subtree contains a page that cannot be merged")]
	Unmergeable,
	#[error(transparent)]
	Reconcile(#[from] ReconcileError),
	#[error(transparent)]
	Block(#[from] BlockError),
	/// Unexpected state observed during unwind or dispatch; the tree must
	/// be considered corrupted.
	#[error("page tree corrupted: {0}")]
	Corrupted(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictFlags {
	/// The caller guarantees a quiescent tree (e.g. close); hazard
	/// acquisition and unlocking are skipped.
	pub single: bool,
	/// Spin on hazard conflicts instead of returning `Busy`.
	pub wait: bool,
}

impl EvictFlags {
	pub const SINGLE: Self = Self {
		single: true,
		wait: false,
	};
	pub const WAIT: Self = Self {
		single: false,
		wait: true,
	};
}

/// The eviction controller for one session.
///
/// Orchestrates review, the reconciliation write for dirty pages, the
/// parent/root reference update and the discard of the evicted subtree.
pub struct Evictor<'a, R, B, P, H>
where
	R: Reconciler,
	B: BlockManager,
	P: PageHeap,
	H: HazardRegistry,
{
	session: SessionId,
	tree: &'a Btree,
	cache: &'a Cache<H>,
	reconciler: &'a R,
	blocks: &'a B,
	heap: &'a P,
	/// Reusable buffer for hazard snapshots taken by this session.
	snapshot: RefCell<HazardSnapshot>,
}

impl<'a, R, B, P, H> Evictor<'a, R, B, P, H>
where
	R: Reconciler,
	B: BlockManager,
	P: PageHeap,
	H: HazardRegistry,
{
	pub fn new(
		session: SessionId,
		tree: &'a Btree,
		cache: &'a Cache<H>,
		reconciler: &'a R,
		blocks: &'a B,
		heap: &'a P,
	) -> Self {
		Self {
			session,
			tree,
			cache,
			reconciler,
			blocks,
			heap,
			snapshot: RefCell::new(HazardSnapshot::new()),
		}
	}

	/// Evict `page` from the cache: reconcile it if dirty, commit the
	/// outcome into the parent reference (or the root descriptor) and
	/// discard the page together with every subpage merged into it.
	pub fn evict(&self, page: NonNull<Page>, flags: EvictFlags) -> Result<(), EvictError> {
		// Safety: the caller hands us a page resident in the tree.
		let candidate = unsafe { page.as_ref() };
		trace!(
			"session {}: evict page {:p} ({:?})",
			self.session,
			page.as_ptr(),
			candidate.kind()
		);

		// Merge-split pages have no standalone on-disk form and may only
		// leave the cache with an ancestor, else the merge is lost and the
		// tree deepens permanently. Rerank the page so the eviction server
		// does not immediately select it again, and put it back in use.
		if candidate.rec_outcome() == RecOutcome::SplitMerge {
			candidate.set_read_gen(self.cache.read_gen());
			let slot = unsafe { candidate.parent_ref() }.ok_or(EvictError::Corrupted(
				"merge-split page without a parent reference",
			))?;
			slot.publish(RefState::Mem);
			return Ok(());
		}

		// Get exclusive access and review the subtree for conditions that
		// block eviction. Clean pages need the review too: nothing forbids
		// the eviction server from choosing an internal page. On failure
		// the review has already released everything it locked.
		self.review(page, flags)?;

		if candidate.is_modified() {
			if let Err(err) = self.reconciler.write(candidate) {
				return Err(self.fail_unwind(page, flags, err.into()));
			}
		}

		let stats = self.cache.stats();
		if !flags.single && candidate.is_internal() {
			stats.cache_evict_internal.fetch_add(1, Ordering::Relaxed);
		}

		if candidate.rec_outcome() == RecOutcome::None {
			stats.cache_evict_unmodified.fetch_add(1, Ordering::Relaxed);
			if candidate.is_root() {
				self.root_clean_update(page, flags)
			} else {
				self.page_clean_update(page, flags)
			}
		} else {
			stats.cache_evict_modified.fetch_add(1, Ordering::Relaxed);
			if candidate.is_root() {
				self.root_dirty_update(page, flags)
			} else {
				self.page_dirty_update(page, flags)
			}
		}
	}

	/// Release every exclusivity acquired during review, then hand the
	/// original failure back. Only sound while the subtree is still intact,
	/// i.e. before ownership of the candidate has been taken.
	fn fail_unwind(&self, page: NonNull<Page>, flags: EvictFlags, err: EvictError) -> EvictError {
		if !flags.single {
			// Corruption found while unlocking has already been logged; the
			// original failure is the error to surface.
			let _ = self.excl_clear(page, None);
		}
		err
	}

	fn page_clean_update(&self, page: NonNull<Page>, flags: EvictFlags) -> Result<(), EvictError> {
		let candidate = unsafe { page.as_ref() };
		let Some(slot) = (unsafe { candidate.parent_ref() }) else {
			return Err(self.fail_unwind(
				page,
				flags,
				EvictError::Corrupted("evicted page without a parent reference"),
			));
		};
		// Safety: the slot is locked by the review (or the tree is
		// quiescent); no reader can be dereferencing the pointer.
		let Some(old) = (unsafe { slot.take_page() }) else {
			return Err(EvictError::Corrupted(
				"parent reference lost its page during eviction",
			));
		};
		slot.publish(RefState::Disk);
		self.discard_page(old)
	}

	fn root_clean_update(&self, page: NonNull<Page>, flags: EvictFlags) -> Result<(), EvictError> {
		debug_assert_eq!(self.tree.root_page(), Some(page));
		// Safety: the root is locked by the review (or the tree is
		// quiescent).
		let Some(root) = (unsafe { self.tree.take_root() }) else {
			return Err(self.fail_unwind(
				page,
				flags,
				EvictError::Corrupted("btree has no resident root page"),
			));
		};
		self.discard_page(root)
	}

	fn page_dirty_update(&self, page: NonNull<Page>, flags: EvictFlags) -> Result<(), EvictError> {
		let candidate = unsafe { page.as_ref() };
		match candidate.rec_outcome() {
			RecOutcome::Empty => {
				// Not evicting after all: the page merges into its parent
				// when the parent is evicted. Release the exclusive
				// references and return the subtree into use.
				if !flags.single {
					self.excl_clear(page, None)?;
				}
				Ok(())
			}
			RecOutcome::Replace => {
				let Some(RecResult::Replace(addr)) = candidate.take_rec_result() else {
					return Err(self.fail_unwind(
						page,
						flags,
						EvictError::Corrupted("replace outcome without a replacement address"),
					));
				};
				let Some(slot) = (unsafe { candidate.parent_ref() }) else {
					return Err(self.fail_unwind(
						page,
						flags,
						EvictError::Corrupted("evicted page without a parent reference"),
					));
				};
				// Safety: the slot is locked by the review (or the tree is
				// quiescent).
				let Some(old) = (unsafe { slot.take_page() }) else {
					return Err(EvictError::Corrupted(
						"parent reference lost its page during eviction",
					));
				};
				// The previous address holder is dropped by the overwrite;
				// an address inlined in the parent's image stays owned by
				// the parent.
				slot.set_addr(RefAddr::Owned(addr));
				// Publish: structure fields are set before the state change
				// makes the reference available to readers.
				slot.publish(RefState::Disk);
				self.discard(old)
			}
			RecOutcome::Split => {
				let Some(RecResult::Split(split)) = candidate.take_rec_result() else {
					return Err(self.fail_unwind(
						page,
						flags,
						EvictError::Corrupted("split outcome without a split page"),
					));
				};
				let Some(slot) = (unsafe { candidate.parent_ref() }) else {
					return Err(self.fail_unwind(
						page,
						flags,
						EvictError::Corrupted("evicted page without a parent reference"),
					));
				};
				// Safety: the slot is locked by the review (or the tree is
				// quiescent).
				let Some(old) = (unsafe { slot.take_page() }) else {
					return Err(EvictError::Corrupted(
						"parent reference lost its page during eviction",
					));
				};
				// Update the parent to reference the new internal page,
				// with the back-links wired before the state is published.
				let replacement = split.into_page();
				replacement.set_parent(old.parent_ptr());
				replacement.set_parent_ref(slot as *const PageRef as *mut PageRef);
				slot.set_page_ptr(Box::into_raw(replacement));
				slot.publish(RefState::Mem);
				self.discard(old)
			}
			RecOutcome::None | RecOutcome::SplitMerge => Err(self.fail_unwind(
				page,
				flags,
				EvictError::Corrupted("unexpected reconciliation outcome for a dirty page"),
			)),
		}
	}

	fn root_dirty_update(&self, page: NonNull<Page>, flags: EvictFlags) -> Result<(), EvictError> {
		let candidate = unsafe { page.as_ref() };
		match candidate.rec_outcome() {
			RecOutcome::Empty => {
				trace!("session {}: root page empty", self.session);
				// An empty root clears the durable root address.
				if let Err(err) = self.root_addr_update(None) {
					return Err(self.fail_unwind(page, flags, err));
				}
			}
			RecOutcome::Replace => {
				trace!("session {}: root page replaced", self.session);
				let Some(RecResult::Replace(addr)) = candidate.take_rec_result() else {
					return Err(self.fail_unwind(
						page,
						flags,
						EvictError::Corrupted("replace outcome without a replacement address"),
					));
				};
				if let Err(err) = self.root_addr_update(Some(addr)) {
					return Err(self.fail_unwind(page, flags, err));
				}
			}
			RecOutcome::Split => {}
			RecOutcome::None | RecOutcome::SplitMerge => {
				return Err(self.fail_unwind(
					page,
					flags,
					EvictError::Corrupted("unexpected reconciliation outcome for a dirty root"),
				));
			}
		}

		// Ownership of the root transfers here; failures past this point
		// tear the subtree down instead of re-installing freed pages.
		// Safety: the root is locked by the review (or the tree is
		// quiescent).
		let Some(root) = (unsafe { self.tree.take_root() }) else {
			return Err(EvictError::Corrupted("btree has no resident root page"));
		};
		match root.rec_outcome() {
			RecOutcome::Split => self.root_split_update(root),
			_ => self.discard(root),
		}
	}

	/// A split root has no parent to merge into, and the checkpoint that
	/// triggered the eviction will not see the replacement during its
	/// traversal. Treat the replacement as a dirty root and write it
	/// immediately, until reconciliation stops splitting and the root
	/// address can be updated. Multiple rounds only happen when an index
	/// page referencing a huge bulk load is evicted.
	fn root_split_update(&self, mut root: Box<Page>) -> Result<(), EvictError> {
		loop {
			let Some(RecResult::Split(split)) = root.take_rec_result() else {
				return Err(EvictError::Corrupted("split outcome without a split page"));
			};
			trace!(
				"session {}: root page split {:p} -> {:p}",
				self.session,
				&*root as *const Page,
				split.as_ptr()
			);
			self.discard(root)?;

			let next = split.into_page();
			next.modify_init();
			next.modify_set();
			next.set_rec_outcome(RecOutcome::None);
			self.reconciler.write(&next)?;

			match next.rec_outcome() {
				RecOutcome::Empty => {
					trace!("session {}: root page empty", self.session);
					self.root_addr_update(None)?;
					return self.discard(next);
				}
				RecOutcome::Replace => {
					trace!("session {}: root page replaced", self.session);
					let Some(RecResult::Replace(addr)) = next.take_rec_result() else {
						return Err(EvictError::Corrupted(
							"replace outcome without a replacement address",
						));
					};
					self.root_addr_update(Some(addr))?;
					return self.discard(next);
				}
				RecOutcome::Split => root = next,
				RecOutcome::None | RecOutcome::SplitMerge => {
					return Err(EvictError::Corrupted(
						"unexpected reconciliation outcome for a dirty root",
					));
				}
			}
		}
	}

	/// Free the previous durable root address through the block manager,
	/// then install the new one and flag the change for checkpoint/sync.
	fn root_addr_update(&self, addr: Option<Address>) -> Result<(), EvictError> {
		if let Some(old) = self.tree.root_addr() {
			self.blocks.free(old)?;
		}
		self.tree.publish_root_addr(addr);
		Ok(())
	}
}
