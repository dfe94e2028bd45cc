use serde::{Deserialize, Serialize};
use tracing::debug;

/// Associativity value stored for a fully associative cache.
pub const FULLY_ASSOCIATIVE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

impl CacheLevel {
    /// Maps the 3-bit level field of the cache descriptor leaves.
    pub fn from_raw(level: u32) -> Option<Self> {
        match level {
            1 => Some(Self::L1),
            2 => Some(Self::L2),
            3 => Some(Self::L3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKind {
    Data,
    Instruction,
    Unified,
}

impl CacheKind {
    /// Maps the 5-bit type field; 0 ("no more caches") and reserved values give `None`.
    pub fn from_raw(kind: u32) -> Option<Self> {
        match kind {
            1 => Some(Self::Data),
            2 => Some(Self::Instruction),
            3 => Some(Self::Unified),
            _ => None,
        }
    }
}

/// Canonical identity of a cache: level, kind and capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub level: CacheLevel,
    pub kind: CacheKind,
    pub capacity: u64,
}

/// One distinct cache level/type as seen by at least one logical core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub level: CacheLevel,
    pub kind: CacheKind,
    pub line_size: u32,
    /// Number of ways, or [`FULLY_ASSOCIATIVE`].
    pub associativity: u32,
    pub partitions: u32,
    pub sets: u32,
    /// Size in bytes.
    pub capacity: u64,
    /// WBINVD/INVD does not act on lower-level caches of sharing threads.
    pub wbinvd: bool,
    /// Logical cores sharing one instance of this cache, 0 when not reported.
    pub shared_by: u32,
    /// Raw observation tally while probing; number of instances after post-update.
    pub times_observed: u32,
}

impl CacheRecord {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            level: self.level,
            kind: self.kind,
            capacity: self.capacity,
        }
    }

    pub fn is_fully_associative(&self) -> bool {
        self.associativity == FULLY_ASSOCIATIVE
    }

    /// Every field except the observation tally matches.
    pub fn same_structure(&self, other: &CacheRecord) -> bool {
        self.level == other.level
            && self.kind == other.kind
            && self.line_size == other.line_size
            && self.associativity == other.associativity
            && self.partitions == other.partitions
            && self.sets == other.sets
            && self.capacity == other.capacity
            && self.wbinvd == other.wbinvd
            && self.shared_by == other.shared_by
    }

    /// Sharing widths agree, or at least one side did not report one.
    pub fn compatible_sharing(&self, other: &CacheRecord) -> bool {
        self.shared_by == 0 || other.shared_by == 0 || self.shared_by == other.shared_by
    }

    /// Turns the raw tally into an instance count using the sharing width.
    ///
    /// Leaves the tally untouched when sharing is unknown.
    pub fn normalize_instances(&mut self) {
        if self.shared_by == 0 || self.times_observed == 0 {
            return;
        }
        let instances = (self.times_observed as f64 / self.shared_by as f64).round() as u32;
        self.times_observed = instances.max(1);
    }
}

/// Adds one observation to `caches`, folding it into an entry with the same
/// canonical key instead of appending a duplicate.
///
/// Descriptors that report different sharing widths describe different
/// instances and are kept apart.
pub fn record_observation(caches: &mut Vec<CacheRecord>, observed: CacheRecord) {
    let existing = caches
        .iter_mut()
        .find(|c| c.key() == observed.key() && c.compatible_sharing(&observed));
    match existing {
        Some(existing) => {
            if existing.shared_by == 0 {
                existing.shared_by = observed.shared_by;
            }
            if !existing.same_structure(&observed) {
                debug!(
                    level = ?observed.level,
                    kind = ?observed.kind,
                    "cache descriptors share a key but differ in layout, keeping the first"
                );
            }
            existing.times_observed += observed.times_observed.max(1);
        }
        None => {
            let mut observed = observed;
            observed.times_observed = observed.times_observed.max(1);
            caches.push(observed);
        }
    }
}

#[cfg(test)]
pub(crate) fn l1_data() -> CacheRecord {
    CacheRecord {
        level: CacheLevel::L1,
        kind: CacheKind::Data,
        line_size: 64,
        associativity: 8,
        partitions: 1,
        sets: 64,
        capacity: 32 * 1024,
        wbinvd: false,
        shared_by: 2,
        times_observed: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_observations_collapse_into_one_entry() {
        let mut caches = Vec::new();
        record_observation(&mut caches, l1_data());
        record_observation(&mut caches, l1_data());
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].times_observed, 2);
    }

    #[test]
    fn different_levels_stay_apart() {
        let mut caches = Vec::new();
        record_observation(&mut caches, l1_data());
        let mut l2 = l1_data();
        l2.level = CacheLevel::L2;
        l2.kind = CacheKind::Unified;
        l2.capacity = 1024 * 1024;
        record_observation(&mut caches, l2);
        assert_eq!(caches.len(), 2);
    }

    #[test]
    fn layout_noise_does_not_fragment_the_entry() {
        let mut caches = vec![l1_data()];
        let mut noisy = l1_data();
        noisy.wbinvd = true;
        record_observation(&mut caches, noisy);
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].times_observed, 2);
        assert!(!caches[0].wbinvd);
    }

    #[test]
    fn different_sharing_widths_stay_apart() {
        let mut caches = vec![l1_data()];
        let mut wide = l1_data();
        wide.shared_by = caches[0].shared_by * 2;
        record_observation(&mut caches, wide);
        assert_eq!(caches.len(), 2);
        assert_eq!(caches[0].times_observed, 1);

        let mut unreported = l1_data();
        unreported.shared_by = 0;
        record_observation(&mut caches, unreported);
        assert_eq!(caches.len(), 2);
        assert_eq!(caches[0].times_observed, 2);
    }

    #[test]
    fn normalize_rounds_to_nearest_instance_count() {
        let mut cache = l1_data();
        cache.times_observed = 8;
        cache.shared_by = 2;
        cache.normalize_instances();
        assert_eq!(cache.times_observed, 4);

        cache.times_observed = 7;
        cache.shared_by = 16;
        cache.normalize_instances();
        assert_eq!(cache.times_observed, 1);
    }

    #[test]
    fn normalize_without_sharing_keeps_tally() {
        let mut cache = l1_data();
        cache.shared_by = 0;
        cache.times_observed = 6;
        cache.normalize_instances();
        assert_eq!(cache.times_observed, 6);
    }
}
