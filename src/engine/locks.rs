//! Striped per-EPC lock table.
//!
//! Each EPC hashes to one stripe. A batch locks the union of its stripes in
//! ascending index order, so two batches can never wait on each other in a
//! cycle.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

/// Holds a set of stripes until dropped.
#[must_use = "stripes are released as soon as the guard is dropped"]
pub struct StripeGuard<'a> {
    _held: Vec<MutexGuard<'a, ()>>,
    stripes: Vec<usize>,
}

impl StripeGuard<'_> {
    pub fn stripes(&self) -> &[usize] {
        &self.stripes
    }
}

impl KeyLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn stripe_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let slot = (hasher.finish() % self.stripes.len() as u64) as usize;
        slot
    }

    /// Lock the stripes covering `keys`, lowest index first.
    pub fn lock<'k, I>(&self, keys: I) -> StripeGuard<'_>
    where
        I: IntoIterator<Item = &'k str>,
    {
        let ordered: BTreeSet<usize> = keys.into_iter().map(|k| self.stripe_of(k)).collect();
        self.acquire(ordered)
    }

    /// Lock every stripe, for operations that touch the whole index.
    pub fn lock_all(&self) -> StripeGuard<'_> {
        self.acquire((0..self.stripes.len()).collect())
    }

    fn acquire(&self, ordered: BTreeSet<usize>) -> StripeGuard<'_> {
        let held = ordered
            .iter()
            .map(|&i| {
                self.stripes[i].lock().unwrap_or_else(|poisoned| {
                    tracing::warn!(stripe = i, "Lock stripe poisoned, recovering");
                    poisoned.into_inner()
                })
            })
            .collect();
        StripeGuard {
            _held: held,
            stripes: ordered.into_iter().collect(),
        }
    }
}
