use log::error;

use super::{EvictError, Evictor};
use crate::{
	cache::hazard::HazardRegistry,
	reconcile::{BlockManager, PageHeap, Reconciler},
	tree::{page::Page, slot::RefState},
};

impl<'a, R, B, P, H> Evictor<'a, R, B, P, H>
where
	R: Reconciler,
	B: BlockManager,
	P: PageHeap,
	H: HazardRegistry,
{
	/// Discard every page merged into an evicted page, then the page
	/// itself: children that are not on disk were folded into this page
	/// during reconciliation and have no separate existence anymore.
	///
	/// Teardown always completes; the first failure is remembered and
	/// returned once the whole subtree has been released.
	pub(super) fn discard(&self, page: Box<Page>) -> Result<(), EvictError> {
		let mut result = Ok(());
		for slot in page.children() {
			if slot.state() == RefState::Disk {
				continue;
			}
			// Safety: the subtree is held exclusively and already detached
			// from the tree.
			match unsafe { slot.take_page() } {
				Some(child) => {
					if let Err(err) = self.discard(child) {
						if result.is_ok() {
							result = Err(err);
						}
					}
				}
				None => {
					error!(
						"session {}: in-memory child reference without a page during discard",
						self.session
					);
					if result.is_ok() {
						result = Err(EvictError::Corrupted(
							"in-memory child reference without a page during discard",
						));
					}
				}
			}
		}
		if let Err(err) = self.discard_page(page) {
			if result.is_ok() {
				result = Err(err);
			}
		}
		result
	}

	/// Resolve the page's tracked objects, then hand the memory back to the
	/// allocator.
	pub(super) fn discard_page(&self, page: Box<Page>) -> Result<(), EvictError> {
		let mut result = Ok(());
		if page.has_modify() {
			if let Err(err) = self.reconciler.track_wrapup(&page, true) {
				let page_ptr: *const Page = &*page;
				error!(
					"session {}: tracked-object cleanup failed for page {page_ptr:p}: {err}",
					self.session
				);
				result = Err(err.into());
			}
		}
		self.heap.page_out(page);
		result
	}
}

#[cfg(test)]
mod tests {
	use std::io;

	use super::*;
	use crate::{
		cache::{Cache, CacheConfig},
		reconcile::{MockBlockManager, MockPageHeap, MockReconciler, ReconcileError},
		tree::test_helpers::*,
	};

	#[test]
	fn discards_merged_children_before_the_parent() {
		// given
		let page = internal(vec![empty_child(), disk_child(), split_merge_child(Vec::new())]);
		page.modify_set();

		let tree = btree(internal(Vec::new()));
		let cache = Cache::new(&CacheConfig::default());
		let mut reconciler = MockReconciler::new();
		// The parent and the empty child carry modify structures.
		reconciler
			.expect_track_wrapup()
			.times(2)
			.returning(|_, _| Ok(()));
		let blocks = MockBlockManager::new();
		let mut heap = MockPageHeap::new();
		heap.expect_page_out().times(3).returning(|_| ());

		// when
		let evictor = Evictor::new(0, &tree, &cache, &reconciler, &blocks, &heap);
		evictor.discard(page).unwrap();
	}

	#[test]
	fn teardown_continues_past_wrapup_failures() {
		// given: every tracked-object cleanup fails
		let page = internal(vec![empty_child()]);
		page.modify_set();

		let tree = btree(internal(Vec::new()));
		let cache = Cache::new(&CacheConfig::default());
		let mut reconciler = MockReconciler::new();
		reconciler.expect_track_wrapup().times(2).returning(|_, _| {
			Err(ReconcileError(io::Error::new(
				io::ErrorKind::Other,
				"track list corrupt",
			)))
		});
		let blocks = MockBlockManager::new();
		let mut heap = MockPageHeap::new();
		// Both pages still go back to the allocator.
		heap.expect_page_out().times(2).returning(|_| ());

		// when
		let evictor = Evictor::new(0, &tree, &cache, &reconciler, &blocks, &heap);
		let err = evictor.discard(page).unwrap_err();

		// then
		assert!(matches!(err, EvictError::Reconcile(_)));
	}
}
