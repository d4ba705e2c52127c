use crate::digest::CertificateDigest;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    First,
    Duplicate,
}

/// Set of digests seen during a run. Grows monotonically; nothing is evicted.
///
/// `observe` is a single check-and-insert under the lock, so two callers racing
/// on the same digest can never both see `First`.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: Mutex<HashSet<CertificateDigest>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Deduplicator { seen: Mutex::new(HashSet::with_capacity(capacity)) }
    }

    pub fn observe(&self, digest: CertificateDigest) -> Observation {
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if seen.insert(digest) {
            Observation::First
        } else {
            Observation::Duplicate
        }
    }

    pub fn contains(&self, digest: &CertificateDigest) -> bool {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).contains(digest)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
