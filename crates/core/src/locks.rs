//! Striped row locks
//!
//! A fixed table of mutexes addressed by document id. Callers that need
//! several ids at once get all of their stripes in ascending stripe order,
//! so two callers can never wait on each other in opposite orders.
//!
//! Distinct ids may share a stripe; that only costs contention, never
//! correctness.

use crate::types::DocumentId;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Default number of stripes
pub const DEFAULT_STRIPES: usize = 256;

/// Fixed-size lock table keyed by document id
pub struct StripedLocks {
    stripes: Box<[Mutex<()>]>,
}

/// Guard over one or more stripes; releases them on drop
pub struct StripeGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl StripedLocks {
    /// Create a table with the given number of stripes (at least one)
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        StripedLocks {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of stripes
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    /// Always false; a table has at least one stripe
    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    fn stripe_of(&self, id: &DocumentId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.as_str().hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Lock the stripe of a single id
    pub fn lock(&self, id: &DocumentId) -> StripeGuard<'_> {
        StripeGuard {
            _guards: vec![self.stripes[self.stripe_of(id)].lock()],
        }
    }

    /// Lock the stripes of every given id, in ascending stripe order
    pub fn lock_all<'a, I>(&self, ids: I) -> StripeGuard<'_>
    where
        I: IntoIterator<Item = &'a DocumentId>,
    {
        let mut indices: Vec<usize> = ids.into_iter().map(|id| self.stripe_of(id)).collect();
        indices.sort_unstable();
        indices.dedup();
        StripeGuard {
            _guards: indices.into_iter().map(|i| self.stripes[i].lock()).collect(),
        }
    }
}

impl Default for StripedLocks {
    fn default() -> Self {
        StripedLocks::new(DEFAULT_STRIPES)
    }
}

impl std::fmt::Debug for StripedLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedLocks")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}
