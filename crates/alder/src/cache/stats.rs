use std::sync::atomic::AtomicU64;

/// Eviction counters; incremented with relaxed atomics, read by the host's
/// statistics surface.
#[derive(Debug, Default)]
pub struct EvictionStats {
	/// Internal pages evicted during normal operation.
	pub cache_evict_internal: AtomicU64,
	/// Clean pages evicted.
	pub cache_evict_unmodified: AtomicU64,
	/// Reconciled pages evicted.
	pub cache_evict_modified: AtomicU64,
	/// Eviction attempts abandoned because of a hazard reference.
	pub cache_evict_hazard: AtomicU64,
	/// Hazard conflicts observed while requesting exclusive access.
	pub rec_hazard: AtomicU64,
}
