use std::{
	fmt,
	mem,
	ptr::NonNull,
	sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering},
};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use super::slot::PageRef;
use crate::reconcile::RecOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
	RowLeaf,
	ColLeaf,
	RowInt,
	ColInt,
}

impl PageKind {
	#[inline]
	pub fn is_internal(self) -> bool {
		matches!(self, Self::RowInt | Self::ColInt)
	}
}

/// On-disk locator produced by reconciliation / the block manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
	pub addr: u64,
	pub size: u32,
}

/// A child's address slot in its parent, tagged with provenance: `Inline`
/// addresses live in the parent's disk image and are merely borrowed,
/// `Owned` addresses were installed separately by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefAddr {
	#[default]
	None,
	Inline(Address),
	Owned(Address),
}

impl RefAddr {
	pub fn address(&self) -> Option<Address> {
		match self {
			Self::None => None,
			Self::Inline(addr) | Self::Owned(addr) => Some(*addr),
		}
	}
}

/// Owner of a new internal page built during reconciliation, parked in the
/// modify structure until a commit installs it into the tree.
pub struct SplitChild(NonNull<Page>);

// Safety: the wrapped page is exclusively owned by the modify structure; it
// is not reachable from the tree until a commit installs it.
unsafe impl Send for SplitChild {}
unsafe impl Sync for SplitChild {}

impl SplitChild {
	pub fn new(page: Box<Page>) -> Self {
		Self(NonNull::from(Box::leak(page)))
	}

	pub fn as_ptr(&self) -> *const Page {
		self.0.as_ptr()
	}

	pub(crate) fn into_page(self) -> Box<Page> {
		let page = self.0.as_ptr();
		mem::forget(self);
		// Safety: the pointer came from `Box::leak` in `new` and ownership is
		// relinquished by the `mem::forget` above.
		unsafe { Box::from_raw(page) }
	}
}

impl Drop for SplitChild {
	fn drop(&mut self) {
		// Safety: see `into_page`; a dropped holder still owns its page.
		unsafe { drop(Box::from_raw(self.0.as_ptr())) };
	}
}

impl fmt::Debug for SplitChild {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("SplitChild").field(&self.0).finish()
	}
}

#[derive(Debug)]
pub enum RecResult {
	Replace(Address),
	Split(SplitChild),
}

/// Present iff the page has been dirtied since it was read in; carries the
/// output of the most recent reconciliation pass.
#[derive(Debug, Default)]
pub struct PageModify {
	dirty: bool,
	result: Option<RecResult>,
}

/// An in-memory node of the B-tree.
///
/// Pages are heap-allocated and address-stable; the hazard protocol
/// identifies them by address. All fields are shareable across reader
/// sessions and the evictor; mutation is gated by the owning slot's state.
pub struct Page {
	kind: PageKind,
	parent: AtomicPtr<Page>,
	parent_ref: AtomicPtr<PageRef>,
	read_gen: AtomicU64,
	rec: AtomicU8,
	modify: Mutex<Option<PageModify>>,
	children: Box<[PageRef]>,
}

assert_impl_all!(Page: Send, Sync);

impl Page {
	pub fn new_leaf(kind: PageKind) -> Box<Self> {
		debug_assert!(!kind.is_internal());
		Self::alloc(kind, Vec::new())
	}

	pub fn new_internal(kind: PageKind, children: Vec<PageRef>) -> Box<Self> {
		debug_assert!(kind.is_internal());
		let page = Self::alloc(kind, children);
		page.link_children();
		page
	}

	fn alloc(kind: PageKind, children: Vec<PageRef>) -> Box<Self> {
		Box::new(Self {
			kind,
			parent: AtomicPtr::new(std::ptr::null_mut()),
			parent_ref: AtomicPtr::new(std::ptr::null_mut()),
			read_gen: AtomicU64::new(0),
			rec: AtomicU8::new(RecOutcome::None as u8),
			modify: Mutex::new(None),
			children: children.into_boxed_slice(),
		})
	}

	#[inline]
	pub fn kind(&self) -> PageKind {
		self.kind
	}

	#[inline]
	pub fn is_internal(&self) -> bool {
		self.kind.is_internal()
	}

	/// The root is the only page without an owning parent page; its slot
	/// back-link points at the btree's root reference instead.
	#[inline]
	pub fn is_root(&self) -> bool {
		self.parent.load(Ordering::Acquire).is_null()
	}

	pub fn parent(&self) -> Option<NonNull<Page>> {
		NonNull::new(self.parent.load(Ordering::Acquire))
	}

	pub(crate) fn parent_ptr(&self) -> *mut Page {
		self.parent.load(Ordering::Acquire)
	}

	pub(crate) fn set_parent(&self, parent: *mut Page) {
		self.parent.store(parent, Ordering::Release);
	}

	pub(crate) fn set_parent_ref(&self, slot: *mut PageRef) {
		self.parent_ref.store(slot, Ordering::Release);
	}

	/// The slot in the parent (or the btree root reference) pointing at this
	/// page.
	///
	/// # Safety
	/// The caller must guarantee the owner of the slot outlives the borrow;
	/// parents outlive their children and the btree outlives its root, so
	/// any caller holding the page inside its tree satisfies this.
	pub(crate) unsafe fn parent_ref(&self) -> Option<&PageRef> {
		let slot = self.parent_ref.load(Ordering::Acquire);
		if slot.is_null() {
			None
		} else {
			Some(unsafe { &*slot })
		}
	}

	pub fn children(&self) -> &[PageRef] {
		&self.children
	}

	pub fn read_gen(&self) -> u64 {
		self.read_gen.load(Ordering::Relaxed)
	}

	pub fn set_read_gen(&self, read_gen: u64) {
		self.read_gen.store(read_gen, Ordering::Relaxed);
	}

	pub fn rec_outcome(&self) -> RecOutcome {
		RecOutcome::from_u8(self.rec.load(Ordering::Acquire))
	}

	pub fn set_rec_outcome(&self, outcome: RecOutcome) {
		self.rec.store(outcome as u8, Ordering::Release);
	}

	/// Whether the page carries changes that reconciliation has not written.
	pub fn is_modified(&self) -> bool {
		self.modify.lock().as_ref().is_some_and(|modify| modify.dirty)
	}

	pub fn has_modify(&self) -> bool {
		self.modify.lock().is_some()
	}

	pub fn modify_init(&self) {
		let mut modify = self.modify.lock();
		if modify.is_none() {
			*modify = Some(PageModify::default());
		}
	}

	pub fn modify_set(&self) {
		self.modify
			.lock()
			.get_or_insert_with(PageModify::default)
			.dirty = true;
	}

	/// Reconciliation emptied the page; it will merge into its parent when
	/// the parent is evicted.
	pub fn set_empty_result(&self) {
		self.set_result(None, RecOutcome::Empty);
	}

	/// Reconciliation rewrote the page one-for-one to a new location.
	pub fn set_replace_result(&self, addr: Address) {
		self.set_result(Some(RecResult::Replace(addr)), RecOutcome::Replace);
	}

	/// Reconciliation split the page; the replacement internal page takes
	/// its place in the parent on commit.
	pub fn set_split_result(&self, page: Box<Page>) {
		self.set_result(
			Some(RecResult::Split(SplitChild::new(page))),
			RecOutcome::Split,
		);
	}

	fn set_result(&self, result: Option<RecResult>, outcome: RecOutcome) {
		let mut modify = self.modify.lock();
		let modify = modify.get_or_insert_with(PageModify::default);
		modify.dirty = false;
		modify.result = result;
		self.set_rec_outcome(outcome);
	}

	pub(crate) fn take_rec_result(&self) -> Option<RecResult> {
		self.modify.lock().as_mut().and_then(|modify| modify.result.take())
	}

	/// Rebuild the `page -> parent` navigational back-links for every
	/// in-memory child of this page.
	pub(crate) fn link_children(&self) {
		let parent = self as *const Page as *mut Page;
		for slot in self.children.iter() {
			if let Some(child) = slot.page() {
				// Safety: the child is owned by this slot and cannot go away
				// while the parent is alive.
				let child = unsafe { child.as_ref() };
				child.set_parent(parent);
				child.set_parent_ref(slot as *const PageRef as *mut PageRef);
				child.link_children();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tree::slot::RefState;

	#[test]
	fn internal_page_links_children() {
		let child = Page::new_leaf(PageKind::RowLeaf);
		let page = Page::new_internal(PageKind::RowInt, vec![PageRef::new_in_memory(child)]);

		let slot = &page.children()[0];
		let child = slot.page().unwrap();
		let child = unsafe { child.as_ref() };

		assert_eq!(child.parent(), Some(NonNull::from(&*page)));
		assert!(std::ptr::eq(
			unsafe { child.parent_ref() }.unwrap(),
			slot
		));
		assert!(!child.is_root());
	}

	#[test]
	fn modify_lifecycle() {
		let page = Page::new_leaf(PageKind::RowLeaf);
		assert!(!page.has_modify());
		assert!(!page.is_modified());

		page.modify_init();
		assert!(page.has_modify());
		assert!(!page.is_modified());

		page.modify_set();
		assert!(page.is_modified());
	}

	#[test]
	fn reconciliation_results_mark_the_page_clean() {
		let page = Page::new_leaf(PageKind::RowLeaf);
		page.modify_set();

		page.set_replace_result(Address {
			addr: 0xA,
			size: 100,
		});

		assert!(!page.is_modified());
		assert_eq!(page.rec_outcome(), RecOutcome::Replace);
		assert!(matches!(
			page.take_rec_result(),
			Some(RecResult::Replace(Address {
				addr: 0xA,
				size: 100,
			}))
		));
		// The result is consumed exactly once.
		assert!(page.take_rec_result().is_none());
	}

	#[test]
	fn split_result_owns_the_new_page() {
		let page = Page::new_leaf(PageKind::RowLeaf);
		let replacement = Page::new_internal(PageKind::RowInt, Vec::new());
		let replacement_ptr: *const Page = &*replacement;

		page.set_split_result(replacement);

		let Some(RecResult::Split(split)) = page.take_rec_result() else {
			panic!("expected a split result");
		};
		assert_eq!(split.as_ptr(), replacement_ptr);

		let replacement = split.into_page();
		assert_eq!(replacement.kind(), PageKind::RowInt);
	}

	#[test]
	fn dropping_a_subtree_frees_in_memory_children() {
		// Exercised under the leak checks of the test harness: the nested
		// pages must all be reclaimed through the slot drops.
		let grandchild = Page::new_leaf(PageKind::RowLeaf);
		let child = Page::new_internal(PageKind::RowInt, vec![PageRef::new_in_memory(grandchild)]);
		let root = Page::new_internal(PageKind::RowInt, vec![PageRef::new_in_memory(child)]);

		assert_eq!(root.children()[0].state(), RefState::Mem);
		drop(root);
	}
}
