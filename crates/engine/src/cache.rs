//! Existence cache
//!
//! Remembers ids this process has inserted so reference validation can
//! skip the store for them. The cache is advisory: a stale positive is
//! caught by the repository's in-commit re-check, and a miss just falls
//! through to `find_existing`.
//!
//! Every call takes a batch and acquires the lock once.

use edstore_core::DocumentId;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Batch-first set of ids known to exist
pub trait ExistenceCache: Send + Sync {
    /// Subset of `ids` known to exist, in input order
    fn has(&self, ids: &[DocumentId]) -> Vec<DocumentId>;

    /// Record ids as existing
    fn add(&self, ids: &[DocumentId]);

    /// Forget ids
    fn remove(&self, ids: &[DocumentId]);

    /// Number of remembered ids
    fn len(&self) -> usize;

    /// Check if nothing is remembered
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Generations {
    current: HashSet<DocumentId>,
    previous: HashSet<DocumentId>,
}

impl Generations {
    fn contains(&self, id: &DocumentId) -> bool {
        self.current.contains(id) || self.previous.contains(id)
    }
}

/// Bounded in-process cache
///
/// Ids go into the current generation. When it reaches half of
/// `max_entries` it becomes the previous generation and the old previous
/// one is dropped, so at most `max_entries` ids are held and the most
/// recently inserted ones survive.
#[derive(Debug)]
pub struct InMemoryExistenceCache {
    generations: RwLock<Generations>,
    generation_size: usize,
}

impl InMemoryExistenceCache {
    /// Create a cache holding at most `max_entries` ids
    pub fn new(max_entries: usize) -> Self {
        InMemoryExistenceCache {
            generations: RwLock::new(Generations::default()),
            generation_size: (max_entries / 2).max(1),
        }
    }
}

impl ExistenceCache for InMemoryExistenceCache {
    fn has(&self, ids: &[DocumentId]) -> Vec<DocumentId> {
        let generations = self.generations.read();
        ids.iter()
            .filter(|id| generations.contains(id))
            .cloned()
            .collect()
    }

    fn add(&self, ids: &[DocumentId]) {
        let mut generations = self.generations.write();
        for id in ids {
            if generations.contains(id) {
                continue;
            }
            if generations.current.len() >= self.generation_size {
                generations.previous = std::mem::take(&mut generations.current);
            }
            generations.current.insert(id.clone());
        }
    }

    fn remove(&self, ids: &[DocumentId]) {
        let mut generations = self.generations.write();
        for id in ids {
            generations.current.remove(id);
            generations.previous.remove(id);
        }
    }

    fn len(&self) -> usize {
        let generations = self.generations.read();
        generations.current.len() + generations.previous.len()
    }
}

/// Cache that remembers nothing, used when caching is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExistenceCache;

impl ExistenceCache for NoopExistenceCache {
    fn has(&self, _ids: &[DocumentId]) -> Vec<DocumentId> {
        Vec::new()
    }

    fn add(&self, _ids: &[DocumentId]) {}

    fn remove(&self, _ids: &[DocumentId]) {}

    fn len(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edstore_core::{derive_document_id, DocumentIdentity};

    fn id(n: usize) -> DocumentId {
        let identity = DocumentIdentity::from_pairs([("n", n.to_string())]).unwrap();
        derive_document_id("Ed-Fi", "School", "3.3.1-b", &identity)
    }

    #[test]
    fn test_has_returns_known_subset_in_order() {
        let cache = InMemoryExistenceCache::new(100);
        cache.add(&[id(1), id(3)]);
        assert_eq!(cache.has(&[id(3), id(2), id(1)]), vec![id(3), id(1)]);
    }

    #[test]
    fn test_remove_forgets() {
        let cache = InMemoryExistenceCache::new(100);
        cache.add(&[id(1), id(2)]);
        cache.remove(&[id(1)]);
        assert_eq!(cache.has(&[id(1), id(2)]), vec![id(2)]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_bounded_by_max_entries() {
        let cache = InMemoryExistenceCache::new(10);
        let ids: Vec<DocumentId> = (0..100).map(id).collect();
        cache.add(&ids);
        assert!(cache.len() <= 10);
        // Most recent insert survives rotation
        assert_eq!(cache.has(&[id(99)]), vec![id(99)]);
        assert!(cache.has(&[id(0)]).is_empty());
    }

    #[test]
    fn test_duplicate_add_does_not_rotate() {
        let cache = InMemoryExistenceCache::new(4);
        cache.add(&[id(1), id(2)]);
        cache.add(&[id(1), id(2), id(1)]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_noop_cache_never_hits() {
        let cache = NoopExistenceCache;
        cache.add(&[id(1)]);
        assert!(cache.has(&[id(1)]).is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_add_and_has() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(InMemoryExistenceCache::new(10_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let ids: Vec<DocumentId> = (t * 100..(t + 1) * 100).map(id).collect();
                    cache.add(&ids);
                    assert_eq!(cache.has(&ids).len(), 100);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_bounded_and_keeps_latest(
                max_entries in 2usize..64,
                batches in proptest::collection::vec(proptest::collection::vec(0usize..200, 1..20), 1..20),
            ) {
                let cache = InMemoryExistenceCache::new(max_entries);
                for batch in &batches {
                    let ids: Vec<DocumentId> = batch.iter().copied().map(id).collect();
                    cache.add(&ids);
                    prop_assert!(cache.len() <= max_entries);
                    let last = ids[ids.len() - 1].clone();
                    prop_assert_eq!(cache.has(&[last.clone()]), vec![last]);
                }
            }
        }
    }
}
