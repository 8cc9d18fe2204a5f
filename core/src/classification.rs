//! Classification store of the mempool.
//!
//! Error verdicts live in bounded buckets: a lock-free ring of hashes
//! capped at the configured capacity, paired with a concurrent map of
//! the operations and their errors. When the ring wraps, the evicted
//! operation leaves the map and the discard callback fires (the
//! network layer forgets it). Applied and prechecked operations are
//! unbounded, as is the set of unparsable hashes. An operation hash is
//! in at most one of these sets at any time.

use crossbeam_queue::ArrayQueue;
use dashmap::{DashMap, DashSet};
use tessera_data_model::{Operation, OperationHash};

/// Verdict recorded for an operation in the mempool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Applies on the current head.
    Applied,
    /// Passed the protocol precheck, not fully applied.
    Prechecked,
    /// Could apply on a future head of this branch.
    BranchDelayed(Vec<String>),
    /// Could apply on another branch.
    BranchRefused(Vec<String>),
    /// Can never apply.
    Refused(Vec<String>),
    /// Anchored too far in the past.
    Outdated(Vec<String>),
}

/// Which bounded bucket a verdict lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bucket {
    BranchDelayed,
    BranchRefused,
    Refused,
    Outdated,
}

struct BoundedMap {
    ring: ArrayQueue<OperationHash>,
    map: DashMap<OperationHash, (Operation, Vec<String>)>,
}

impl BoundedMap {
    fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            map: DashMap::new(),
        }
    }

    /// Insert, evicting the oldest entry when full.
    fn insert(
        &self,
        hash: OperationHash,
        operation: Operation,
        errors: Vec<String>,
        on_discard: &mut dyn FnMut(OperationHash),
    ) {
        while self.ring.push(hash).is_err() {
            let Some(evicted) = self.ring.pop() else { break };
            // Slots of operations removed out of band are reclaimed
            // silently; only a real eviction is a discard.
            if self.map.remove(&evicted).is_some() {
                on_discard(evicted);
            }
        }
        self.map.insert(hash, (operation, errors));
    }

    fn remove(&self, hash: &OperationHash) -> Option<(Operation, Vec<String>)> {
        // The ring keeps a stale hash until it wraps; `map` is the
        // source of truth for membership.
        self.map.remove(hash).map(|(_, entry)| entry)
    }

    fn contains(&self, hash: &OperationHash) -> bool {
        self.map.contains_key(hash)
    }

    fn hashes(&self) -> Vec<OperationHash> {
        self.map.iter().map(|entry| *entry.key()).collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn clear(&self, on_discard: &mut dyn FnMut(OperationHash)) -> Vec<(OperationHash, Operation)> {
        let drained: Vec<(OperationHash, Operation)> = self
            .map
            .iter()
            .map(|entry| (*entry.key(), entry.value().0.clone()))
            .collect();
        self.map.clear();
        while self.ring.pop().is_some() {}
        for (hash, _) in &drained {
            on_discard(*hash);
        }
        drained
    }
}

/// The classification state of one mempool.
pub struct ClassificationStore {
    applied: Vec<(OperationHash, Operation)>,
    prechecked: DashMap<OperationHash, Operation>,
    branch_delayed: BoundedMap,
    branch_refused: BoundedMap,
    refused: BoundedMap,
    outdated: BoundedMap,
    unparsable: DashSet<OperationHash>,
    /// Derived membership set for O(1) "already classified" checks.
    in_mempool: DashSet<OperationHash>,
}

impl ClassificationStore {
    /// A store whose error buckets hold at most `bucket_capacity`
    /// operations each.
    #[must_use]
    pub fn new(bucket_capacity: usize) -> Self {
        Self {
            applied: Vec::new(),
            prechecked: DashMap::new(),
            branch_delayed: BoundedMap::new(bucket_capacity),
            branch_refused: BoundedMap::new(bucket_capacity),
            refused: BoundedMap::new(bucket_capacity),
            outdated: BoundedMap::new(bucket_capacity),
            unparsable: DashSet::new(),
            in_mempool: DashSet::new(),
        }
    }

    /// Whether the store has seen this hash in any state.
    #[must_use]
    pub fn is_known(&self, hash: &OperationHash) -> bool {
        self.in_mempool.contains(hash) || self.unparsable.contains(hash)
    }

    /// Whether the hash is classified (unparsable does not count).
    #[must_use]
    pub fn is_in_mempool(&self, hash: &OperationHash) -> bool {
        self.in_mempool.contains(hash)
    }

    /// Record a verdict. The discard callback fires for every
    /// operation evicted from a bounded bucket.
    pub fn classify(
        &mut self,
        hash: OperationHash,
        operation: Operation,
        classification: Classification,
        on_discard: &mut dyn FnMut(OperationHash),
    ) {
        debug_assert!(
            !self.is_known(&hash),
            "an operation is classified at most once"
        );
        let mut forget = |evicted: OperationHash| {
            self.in_mempool.remove(&evicted);
            on_discard(evicted);
        };
        match classification {
            Classification::Applied => self.applied.push((hash, operation)),
            Classification::Prechecked => {
                self.prechecked.insert(hash, operation);
            }
            Classification::BranchDelayed(errors) => {
                self.branch_delayed.insert(hash, operation, errors, &mut forget);
            }
            Classification::BranchRefused(errors) => {
                self.branch_refused.insert(hash, operation, errors, &mut forget);
            }
            Classification::Refused(errors) => {
                self.refused.insert(hash, operation, errors, &mut forget);
            }
            Classification::Outdated(errors) => {
                self.outdated.insert(hash, operation, errors, &mut forget);
            }
        }
        self.in_mempool.insert(hash);
    }

    /// Record a hash whose bytes never decoded. Sink state.
    pub fn mark_unparsable(&mut self, hash: OperationHash) {
        debug_assert!(!self.is_known(&hash));
        self.unparsable.insert(hash);
    }

    /// Remove one operation from whatever set holds it.
    pub fn remove(&mut self, hash: &OperationHash) -> Option<(Operation, Classification)> {
        self.in_mempool.remove(hash);
        self.unparsable.remove(hash);
        if let Some(position) = self.applied.iter().position(|(h, _)| h == hash) {
            let (_, operation) = self.applied.remove(position);
            return Some((operation, Classification::Applied));
        }
        if let Some((_, operation)) = self.prechecked.remove(hash) {
            return Some((operation, Classification::Prechecked));
        }
        if let Some((operation, errors)) = self.branch_delayed.remove(hash) {
            return Some((operation, Classification::BranchDelayed(errors)));
        }
        if let Some((operation, errors)) = self.branch_refused.remove(hash) {
            return Some((operation, Classification::BranchRefused(errors)));
        }
        if let Some((operation, errors)) = self.refused.remove(hash) {
            return Some((operation, Classification::Refused(errors)));
        }
        if let Some((operation, errors)) = self.outdated.remove(hash) {
            return Some((operation, Classification::Outdated(errors)));
        }
        None
    }

    /// Applied operations, in classification order.
    #[must_use]
    pub fn applied(&self) -> &[(OperationHash, Operation)] {
        &self.applied
    }

    /// Hashes of the prechecked operations.
    #[must_use]
    pub fn prechecked_hashes(&self) -> Vec<OperationHash> {
        self.prechecked.iter().map(|entry| *entry.key()).collect()
    }

    /// Hashes per bucket, for observation.
    #[must_use]
    pub fn branch_delayed_hashes(&self) -> Vec<OperationHash> {
        self.branch_delayed.hashes()
    }

    #[must_use]
    pub fn branch_refused_hashes(&self) -> Vec<OperationHash> {
        self.branch_refused.hashes()
    }

    #[must_use]
    pub fn refused_hashes(&self) -> Vec<OperationHash> {
        self.refused.hashes()
    }

    #[must_use]
    pub fn outdated_hashes(&self) -> Vec<OperationHash> {
        self.outdated.hashes()
    }

    #[must_use]
    pub fn unparsable_hashes(&self) -> Vec<OperationHash> {
        self.unparsable.iter().map(|hash| *hash).collect()
    }

    /// Number of classified operations.
    #[must_use]
    pub fn in_mempool_count(&self) -> usize {
        self.in_mempool.len()
    }

    /// In how many sets this hash currently appears. The disjointness
    /// invariant demands at most one.
    #[must_use]
    pub fn membership_count(&self, hash: &OperationHash) -> usize {
        usize::from(self.applied.iter().any(|(h, _)| h == hash))
            + usize::from(self.prechecked.contains_key(hash))
            + usize::from(self.branch_delayed.contains(hash))
            + usize::from(self.branch_refused.contains(hash))
            + usize::from(self.refused.contains(hash))
            + usize::from(self.outdated.contains(hash))
            + usize::from(self.unparsable.contains(hash))
    }

    /// Drain what a head switch recycles: applied and prechecked are
    /// always reconsidered; the branch-delayed bucket is always
    /// dropped; branch-refused joins the recycle set only when the
    /// switch leaves the branch (their refusal was branch-specific).
    /// Refused and outdated survive untouched. Unparsable hashes are
    /// forgotten.
    pub fn drain_for_flush(
        &mut self,
        handle_branch_refused: bool,
        on_discard: &mut dyn FnMut(OperationHash),
    ) -> FlushDrain {
        let applied = std::mem::take(&mut self.applied);
        let prechecked: Vec<(OperationHash, Operation)> = self
            .prechecked
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.prechecked.clear();
        for (hash, _) in applied.iter().chain(prechecked.iter()) {
            self.in_mempool.remove(hash);
        }

        let mut forget = |evicted: OperationHash| {
            self.in_mempool.remove(&evicted);
            on_discard(evicted);
        };
        let branch_delayed = self.branch_delayed.clear(&mut forget);
        let branch_refused_candidates = if handle_branch_refused {
            // Reconsidered, not forgotten: the network layer keeps the
            // operations around.
            let recycled: Vec<(OperationHash, Operation)> = self
                .branch_refused
                .hashes()
                .into_iter()
                .filter_map(|hash| {
                    self.branch_refused
                        .remove(&hash)
                        .map(|(operation, _)| (hash, operation))
                })
                .collect();
            for (hash, _) in &recycled {
                self.in_mempool.remove(hash);
            }
            recycled
        } else {
            Vec::new()
        };
        self.unparsable.clear();

        FlushDrain {
            applied,
            prechecked,
            branch_delayed,
            branch_refused_candidates,
            recycle_branch_refused: handle_branch_refused,
        }
    }
}

/// What `drain_for_flush` recovered from the previous head.
pub struct FlushDrain {
    /// Applied operations, classification order.
    pub applied: Vec<(OperationHash, Operation)>,
    /// Prechecked operations.
    pub prechecked: Vec<(OperationHash, Operation)>,
    /// The dropped branch-delayed bucket (never recycled).
    pub branch_delayed: Vec<(OperationHash, Operation)>,
    /// Branch-refused operations; candidates only when recycled.
    pub branch_refused_candidates: Vec<(OperationHash, Operation)>,
    /// Whether the branch-refused bucket joins the recycle set.
    pub recycle_branch_refused: bool,
}

impl FlushDrain {
    /// The operations to replay on the new head.
    #[must_use]
    pub fn recycle_set(self) -> Vec<(OperationHash, Operation)> {
        let mut set = self.applied;
        set.extend(self.prechecked);
        if self.recycle_branch_refused {
            set.extend(self.branch_refused_candidates);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use tessera_data_model::test_support::operation_on_branch;
    use tessera_data_model::BlockHash;

    use super::*;

    fn op(tag: u8) -> (OperationHash, Operation) {
        let operation = operation_on_branch(BlockHash::hash_bytes(b"branch"), &[tag, tag]);
        (operation.hash(), operation)
    }

    #[test]
    fn disjointness_over_every_class() {
        let mut store = ClassificationStore::new(8);
        let mut discarded = Vec::new();
        let mut on_discard = |hash| discarded.push(hash);

        let classes = [
            Classification::Applied,
            Classification::Prechecked,
            Classification::BranchDelayed(vec!["d".into()]),
            Classification::BranchRefused(vec!["b".into()]),
            Classification::Refused(vec!["r".into()]),
            Classification::Outdated(vec!["o".into()]),
        ];
        let mut hashes = Vec::new();
        for (i, class) in classes.into_iter().enumerate() {
            let (hash, operation) = op(i as u8);
            store.classify(hash, operation, class, &mut on_discard);
            hashes.push(hash);
        }
        for hash in &hashes {
            assert_eq!(store.membership_count(hash), 1);
            assert!(store.is_in_mempool(hash));
        }
        assert!(discarded.is_empty());
    }

    #[test]
    fn bounded_bucket_evicts_and_notifies() {
        let mut store = ClassificationStore::new(2);
        let mut discarded = Vec::new();
        let mut on_discard = |hash| discarded.push(hash);

        let (h1, o1) = op(1);
        let (h2, o2) = op(2);
        let (h3, o3) = op(3);
        for (hash, operation) in [(h1, o1), (h2, o2), (h3, o3)] {
            store.classify(
                hash,
                operation,
                Classification::Refused(vec!["no".into()]),
                &mut on_discard,
            );
        }

        assert_eq!(discarded, vec![h1]);
        assert!(!store.is_known(&h1));
        assert!(store.is_known(&h2) && store.is_known(&h3));
        assert_eq!(store.refused_hashes().len(), 2);
    }

    #[test]
    fn remove_restores_unknown_state() {
        let mut store = ClassificationStore::new(4);
        let (hash, operation) = op(9);
        store.classify(
            hash,
            operation,
            Classification::Applied,
            &mut |_| {},
        );
        let (_, class) = store.remove(&hash).unwrap();
        assert_eq!(class, Classification::Applied);
        assert!(!store.is_known(&hash));
        assert_eq!(store.membership_count(&hash), 0);
    }

    #[test]
    fn flush_drain_keeps_refused_and_drops_branch_delayed() {
        let mut store = ClassificationStore::new(4);
        let (ha, oa) = op(0);
        let (hd, od) = op(1);
        let (hr, or_) = op(3);
        store.classify(ha, oa, Classification::Applied, &mut |_| {});
        store.classify(hd, od, Classification::BranchDelayed(vec![]), &mut |_| {});
        store.classify(hr, or_, Classification::Refused(vec![]), &mut |_| {});

        let mut discarded = Vec::new();
        let drain = store.drain_for_flush(false, &mut |hash| discarded.push(hash));
        assert_eq!(discarded, vec![hd]);

        let recycled: Vec<OperationHash> =
            drain.recycle_set().into_iter().map(|(hash, _)| hash).collect();
        assert_eq!(recycled, vec![ha]);
        // Refused survives the flush untouched.
        assert!(store.is_known(&hr));
        assert!(!store.is_known(&ha));
        assert!(!store.is_known(&hd));
    }
}
