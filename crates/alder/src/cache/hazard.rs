use std::{
	iter,
	ptr,
	ptr::NonNull,
	sync::atomic::{fence, AtomicPtr, Ordering},
};

use static_assertions::assert_impl_all;

use crate::tree::{
	page::Page,
	slot::{PageRef, RefState},
};

pub type SessionId = usize;

/// The process-wide set of (session, page) pairs asserting "do not evict
/// this page".
///
/// Sessions write only their own slots; the evictor only reads, through
/// [`HazardRegistry::snapshot`]. The registry is a trait so tests can
/// substitute a deterministic implementation.
pub trait HazardRegistry: Send + Sync {
	/// Publish a hazard on the page behind `slot`.
	///
	/// Returns the page pointer the caller may now dereference, or `None`
	/// if the slot moved away from `Mem` while publishing (the hazard has
	/// been cleared again; retry or give up) or the session is out of
	/// hazard capacity.
	fn publish(&self, session: SessionId, slot: &PageRef) -> Option<NonNull<Page>>;

	/// Clear a hazard previously returned by `publish`.
	fn clear(&self, session: SessionId, page: NonNull<Page>);

	/// Copy all live hazards into `snap`, compacted and sorted by page
	/// address. The snapshot is eventually consistent; hazards published
	/// after the copy starts may be missed, which the state-before-snapshot
	/// ordering of the eviction side accounts for.
	fn snapshot(&self, snap: &mut HazardSnapshot);
}

/// Compact, sorted copy of the hazard array. Page addresses are held as
/// plain words; they are compared, never dereferenced.
#[derive(Debug, Default)]
pub struct HazardSnapshot {
	pages: Vec<usize>,
}

impl HazardSnapshot {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn clear(&mut self) {
		self.pages.clear();
	}

	pub fn record(&mut self, page: *mut Page) {
		self.pages.push(page as usize);
	}

	/// Sort the recorded addresses so `contains` can binary-search.
	pub fn finish(&mut self) {
		self.pages.sort_unstable();
	}

	pub fn contains(&self, page: *const Page) -> bool {
		self.pages.binary_search(&(page as usize)).is_ok()
	}

	pub fn len(&self) -> usize {
		self.pages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pages.is_empty()
	}
}

/// Flat `sessions x slots_per_session` hazard array.
pub struct HazardTable {
	slots: Box<[AtomicPtr<Page>]>,
	slots_per_session: usize,
}

assert_impl_all!(HazardTable: Send, Sync);

impl HazardTable {
	pub fn new(max_sessions: usize, slots_per_session: usize) -> Self {
		Self {
			slots: iter::repeat_with(|| AtomicPtr::new(ptr::null_mut()))
				.take(max_sessions * slots_per_session)
				.collect(),
			slots_per_session,
		}
	}

	fn session_slots(&self, session: SessionId) -> &[AtomicPtr<Page>] {
		let start = session * self.slots_per_session;
		&self.slots[start..start + self.slots_per_session]
	}
}

impl HazardRegistry for HazardTable {
	fn publish(&self, session: SessionId, slot: &PageRef) -> Option<NonNull<Page>> {
		let page = slot.page()?;
		let hazard = self
			.session_slots(session)
			.iter()
			.find(|hazard| hazard.load(Ordering::Relaxed).is_null())?;

		// Store the hazard, then re-check the slot. Any evictor that locks
		// this page afterwards is guaranteed to observe the hazard in its
		// snapshot; if the slot already left `Mem`, back out.
		hazard.store(page.as_ptr(), Ordering::SeqCst);
		fence(Ordering::SeqCst);

		if slot.state_seqcst() == RefState::Mem && slot.page() == Some(page) {
			Some(page)
		} else {
			hazard.store(ptr::null_mut(), Ordering::SeqCst);
			None
		}
	}

	fn clear(&self, session: SessionId, page: NonNull<Page>) {
		for hazard in self.session_slots(session) {
			if hazard.load(Ordering::Relaxed) == page.as_ptr() {
				hazard.store(ptr::null_mut(), Ordering::Release);
				return;
			}
		}
		debug_assert!(false, "cleared a hazard that was never published");
	}

	fn snapshot(&self, snap: &mut HazardSnapshot) {
		snap.clear();
		for hazard in self.slots.iter() {
			let page = hazard.load(Ordering::SeqCst);
			if !page.is_null() {
				snap.record(page);
			}
		}
		snap.finish();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tree::test_helpers::*;

	#[test]
	fn publish_and_snapshot() {
		let table = HazardTable::new(2, 4);
		let slot = mem_child(leaf());

		let page = table.publish(0, &slot).unwrap();
		assert_eq!(Some(page), slot.page());

		let mut snap = HazardSnapshot::new();
		table.snapshot(&mut snap);
		assert_eq!(snap.len(), 1);
		assert!(snap.contains(page.as_ptr()));

		table.clear(0, page);
		table.snapshot(&mut snap);
		assert!(snap.is_empty());
	}

	#[test]
	fn publish_backs_out_of_a_locked_slot() {
		let table = HazardTable::new(1, 4);
		let slot = mem_child(leaf());

		slot.lock_for_evict();
		assert!(table.publish(0, &slot).is_none());

		// The failed publish must not leave a hazard behind.
		let mut snap = HazardSnapshot::new();
		table.snapshot(&mut snap);
		assert!(snap.is_empty());
	}

	#[test]
	fn publish_fails_on_a_disk_slot() {
		let table = HazardTable::new(1, 4);
		assert!(table.publish(0, &disk_child()).is_none());
	}

	#[test]
	fn out_of_hazard_capacity() {
		let table = HazardTable::new(1, 1);
		let first = mem_child(leaf());
		let second = mem_child(leaf());

		let page = table.publish(0, &first).unwrap();
		assert!(table.publish(0, &second).is_none());

		table.clear(0, page);
		assert!(table.publish(0, &second).is_some());
	}

	#[test]
	fn snapshot_is_sorted_across_sessions() {
		let table = HazardTable::new(3, 2);
		let slots: Vec<_> = (0..3).map(|_| mem_child(leaf())).collect();

		let mut pages: Vec<usize> = Vec::new();
		for (session, slot) in slots.iter().enumerate() {
			let page = table.publish(session, slot).unwrap();
			pages.push(page.as_ptr() as usize);
		}
		pages.sort_unstable();

		let mut snap = HazardSnapshot::new();
		table.snapshot(&mut snap);
		assert_eq!(snap.len(), 3);
		for page in pages {
			assert!(snap.contains(page as *const Page));
		}
	}
}
