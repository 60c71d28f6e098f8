use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A `(participant, server)` pair reserved by an active challenge.
pub type ChallengeKey = (Uuid, Uuid);

/// Process-wide reservation set enforcing "at most one active challenge per
/// participant per server".
///
/// All mutation goes through [`try_reserve`](Self::try_reserve) and
/// [`release`](Self::release); membership checks and inserts happen under one
/// lock so two overlapping reservations can never both succeed.
#[derive(Clone, Default)]
pub struct ActiveChallengeRegistry {
    entries: Arc<Mutex<HashSet<ChallengeKey>>>,
}

impl ActiveChallengeRegistry {
    pub fn new() -> Self {
        ActiveChallengeRegistry {
            entries: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Atomically reserves every pair, or none of them.
    ///
    /// Returns `false` without inserting anything if any pair is already held.
    pub fn try_reserve(&self, keys: &[ChallengeKey]) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if keys.iter().any(|key| entries.contains(key)) {
            return false;
        }
        for key in keys {
            entries.insert(*key);
        }
        true
    }

    /// Idempotent removal. Returns whether the pair was present, so callers
    /// can use the release as an exactly-once guard.
    pub fn release(&self, key: ChallengeKey) -> bool {
        self.entries.lock().unwrap().remove(&key)
    }

    pub fn is_registered(&self, key: ChallengeKey) -> bool {
        self.entries.lock().unwrap().contains(&key)
    }

    pub fn any_registered(&self, keys: &[ChallengeKey]) -> bool {
        let entries = self.entries.lock().unwrap();
        keys.iter().any(|key| entries.contains(key))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ChallengeKey {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_reserve_and_release() {
        let registry = ActiveChallengeRegistry::new();
        let a = key();
        assert!(registry.try_reserve(&[a]));
        assert!(registry.is_registered(a));
        assert!(registry.release(a));
        assert!(!registry.is_registered(a));
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = ActiveChallengeRegistry::new();
        let a = key();
        assert!(registry.try_reserve(&[a]));
        assert!(registry.release(a));
        assert!(!registry.release(a));
        assert!(!registry.release(key()));
    }

    #[test]
    fn test_overlapping_reservations_are_all_or_nothing() {
        let registry = ActiveChallengeRegistry::new();
        let a = key();
        let b = key();
        let c = key();
        assert!(registry.try_reserve(&[a, b]));

        // Overlaps on b: must fail and must not leave c behind.
        assert!(!registry.try_reserve(&[b, c]));
        assert!(!registry.is_registered(c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_disjoint_reservations_both_succeed() {
        let registry = ActiveChallengeRegistry::new();
        assert!(registry.try_reserve(&[key(), key()]));
        assert!(registry.try_reserve(&[key()]));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_any_registered() {
        let registry = ActiveChallengeRegistry::new();
        let a = key();
        let b = key();
        assert!(registry.try_reserve(&[a]));
        assert!(registry.any_registered(&[a, b]));
        assert!(!registry.any_registered(&[b]));
    }

    #[test]
    fn test_concurrent_overlap_admits_one_winner() {
        let registry = ActiveChallengeRegistry::new();
        let shared = key();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry.try_reserve(&[shared, key()])
            }));
        }
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        // The winner holds the shared pair plus its private one.
        assert_eq!(registry.len(), 2);
    }
}
