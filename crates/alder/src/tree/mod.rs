use std::{ptr, ptr::NonNull, sync::atomic::AtomicBool, sync::atomic::Ordering};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use self::{
	page::{Address, Page},
	slot::{PageRef, RefState},
};

pub mod page;
pub mod slot;

/// Descriptor of one B-tree: the currently resident root (if any) and the
/// durable root address.
///
/// The root reference is heap-pinned so that the root page's back-link
/// stays valid for the btree's lifetime, which makes the locking and hazard
/// protocol uniform for root and non-root pages.
pub struct Btree {
	root: Box<PageRef>,
	root_addr: Mutex<Option<Address>>,
	root_update: AtomicBool,
}

assert_impl_all!(Btree: Send, Sync);

impl Btree {
	pub fn new(root_page: Box<Page>, root_addr: Option<Address>) -> Self {
		let root = Box::new(PageRef::new_in_memory(root_page));
		if let Some(page) = root.page() {
			// Safety: the page is owned by the root slot we just created.
			let page = unsafe { page.as_ref() };
			page.set_parent(ptr::null_mut());
			page.set_parent_ref(&*root as *const PageRef as *mut PageRef);
			page.link_children();
		}
		Self {
			root,
			root_addr: Mutex::new(root_addr),
			root_update: AtomicBool::new(false),
		}
	}

	pub fn root_ref(&self) -> &PageRef {
		&self.root
	}

	pub fn root_page(&self) -> Option<NonNull<Page>> {
		self.root.page()
	}

	pub fn root_addr(&self) -> Option<Address> {
		*self.root_addr.lock()
	}

	/// Whether the root descriptor changed since the last checkpoint pass.
	pub fn root_update(&self) -> bool {
		self.root_update.load(Ordering::Acquire)
	}

	/// Install a new durable root address and flag the change for
	/// checkpoint/sync.
	pub(crate) fn publish_root_addr(&self, addr: Option<Address>) {
		*self.root_addr.lock() = addr;
		self.root_update.store(true, Ordering::Release);
	}

	/// Detach the resident root page from the tree.
	///
	/// # Safety
	/// The caller must hold the root exclusively (state `Locked`, or a
	/// quiescent tree).
	pub(crate) unsafe fn take_root(&self) -> Option<Box<Page>> {
		let page = unsafe { self.root.take_page() };
		self.root.publish(RefState::Disk);
		page
	}
}

#[cfg(test)]
pub(crate) mod test_helpers {
	use super::{
		page::{Address, Page, PageKind, RefAddr},
		slot::PageRef,
		Btree,
	};
	use crate::reconcile::RecOutcome;

	pub(crate) fn leaf() -> Box<Page> {
		Page::new_leaf(PageKind::RowLeaf)
	}

	pub(crate) fn internal(children: Vec<PageRef>) -> Box<Page> {
		Page::new_internal(PageKind::RowInt, children)
	}

	pub(crate) fn mem_child(page: Box<Page>) -> PageRef {
		PageRef::new_in_memory(page)
	}

	pub(crate) fn disk_child() -> PageRef {
		PageRef::new_disk(RefAddr::Inline(Address {
			addr: 0x100,
			size: 64,
		}))
	}

	/// A clean in-memory leaf that reconciliation has declared empty.
	pub(crate) fn empty_child() -> PageRef {
		let page = leaf();
		page.set_empty_result();
		mem_child(page)
	}

	/// An internal page created as a byproduct of a prior split; it has no
	/// on-disk identity of its own.
	pub(crate) fn split_merge_child(children: Vec<PageRef>) -> PageRef {
		let page = internal(children);
		page.set_rec_outcome(RecOutcome::SplitMerge);
		mem_child(page)
	}

	pub(crate) fn btree(root: Box<Page>) -> Btree {
		Btree::new(
			root,
			Some(Address {
				addr: 0x40,
				size: 128,
			}),
		)
	}
}
