use std::sync::atomic::{AtomicU64, Ordering};

use static_assertions::assert_impl_all;

use crate::consts::{DEFAULT_HAZARDS_PER_SESSION, DEFAULT_MAX_SESSIONS};

use self::{
	hazard::{HazardRegistry, HazardTable},
	stats::EvictionStats,
};

pub mod hazard;
pub mod stats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
	pub max_sessions: usize,
	pub hazards_per_session: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			max_sessions: DEFAULT_MAX_SESSIONS,
			hazards_per_session: DEFAULT_HAZARDS_PER_SESSION,
		}
	}
}

/// Shared cache state the eviction core works against: the hazard registry,
/// the read-generation clock and the statistics counters.
pub struct Cache<H = HazardTable>
where
	H: HazardRegistry,
{
	hazards: H,
	read_gen: AtomicU64,
	stats: EvictionStats,
}

assert_impl_all!(Cache: Send, Sync);

impl Cache {
	pub fn new(config: &CacheConfig) -> Self {
		Self::with_registry(HazardTable::new(
			config.max_sessions,
			config.hazards_per_session,
		))
	}
}

impl<H> Cache<H>
where
	H: HazardRegistry,
{
	pub fn with_registry(hazards: H) -> Self {
		Self {
			hazards,
			read_gen: AtomicU64::new(1),
			stats: EvictionStats::default(),
		}
	}

	pub fn hazards(&self) -> &H {
		&self.hazards
	}

	pub fn stats(&self) -> &EvictionStats {
		&self.stats
	}

	/// Current read generation; stamped onto pages to rerank them for the
	/// eviction server.
	pub fn read_gen(&self) -> u64 {
		self.read_gen.load(Ordering::Relaxed)
	}

	/// Advance the read-generation clock; called once per eviction-server
	/// pass.
	pub fn bump_read_gen(&self) -> u64 {
		self.read_gen.fetch_add(1, Ordering::Relaxed) + 1
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_gen_is_monotonic() {
		let cache = Cache::new(&CacheConfig::default());

		let before = cache.read_gen();
		let bumped = cache.bump_read_gen();

		assert!(bumped > before);
		assert_eq!(cache.read_gen(), bumped);
	}
}
