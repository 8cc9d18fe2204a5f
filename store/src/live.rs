//! The live-blocks window: the last `max_operations_ttl + 1` blocks of
//! the current chain and the operations they carry. Operations may only
//! branch on a live block, and included operations are exactly the live
//! operations.

use std::collections::{HashSet, VecDeque};

use tessera_data_model::{Block, BlockHash, OperationHash};

/// Fixed-capacity ring over the tail of the chain.
#[derive(Debug)]
pub struct LiveWindow {
    capacity: usize,
    /// Oldest entry at the front.
    entries: VecDeque<(BlockHash, HashSet<OperationHash>)>,
    live_blocks: HashSet<BlockHash>,
    live_operations: HashSet<OperationHash>,
}

impl LiveWindow {
    /// An empty window of the given capacity (TTL + 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            live_blocks: HashSet::new(),
            live_operations: HashSet::new(),
        }
    }

    /// Capacity of the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The blocks currently in the window.
    #[must_use]
    pub fn live_blocks(&self) -> &HashSet<BlockHash> {
        &self.live_blocks
    }

    /// The operations carried by the live blocks.
    #[must_use]
    pub fn live_operations(&self) -> &HashSet<OperationHash> {
        &self.live_operations
    }

    /// Hash of the newest block in the window.
    #[must_use]
    pub fn newest(&self) -> Option<BlockHash> {
        self.entries.back().map(|(hash, _)| *hash)
    }

    /// O(1) amortised update for a head that is the direct child of the
    /// previous one: add the new contribution, evict the oldest.
    pub fn push_head(&mut self, head: &Block) {
        let operations: HashSet<OperationHash> = head.operation_hashes().into_iter().collect();
        self.live_blocks.insert(head.hash);
        self.live_operations.extend(operations.iter().copied());
        self.entries.push_back((head.hash, operations));

        while self.entries.len() > self.capacity {
            let (evicted_hash, evicted_operations) = self
                .entries
                .pop_front()
                .expect("INTERNAL BUG: over-capacity ring is non-empty");
            self.live_blocks.remove(&evicted_hash);
            for operation in evicted_operations {
                // An operation can, pathologically, sit in two live
                // blocks of a window spanning a reorg; only drop it
                // when no remaining entry carries it.
                if !self.entries.iter().any(|(_, ops)| ops.contains(&operation)) {
                    self.live_operations.remove(&operation);
                }
            }
        }
    }

    /// O(capacity) rebuild from the blocks of the new tail, oldest
    /// first. Used on reorgs and TTL changes.
    pub fn rebuild<'a>(&mut self, capacity: usize, tail: impl IntoIterator<Item = &'a Block>) {
        self.capacity = capacity.max(1);
        self.entries.clear();
        self.live_blocks.clear();
        self.live_operations.clear();
        for block in tail {
            self.push_head(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_data_model::test_support::{block_at_level, operation_on_branch};

    use super::*;

    fn block_with_op(level: i32, predecessor: BlockHash) -> Block {
        let mut block = block_at_level(level, predecessor);
        block.operations = vec![vec![operation_on_branch(predecessor, &level.to_be_bytes())]];
        block
    }

    #[test]
    fn window_tracks_the_tail() {
        let mut window = LiveWindow::new(3);
        let b0 = block_with_op(0, BlockHash::zero());
        let b1 = block_with_op(1, b0.hash);
        let b2 = block_with_op(2, b1.hash);
        let b3 = block_with_op(3, b2.hash);

        for block in [&b0, &b1, &b2] {
            window.push_head(block);
        }
        assert_eq!(window.live_blocks().len(), 3);
        assert!(window.live_blocks().contains(&b0.hash));

        window.push_head(&b3);
        assert_eq!(window.live_blocks().len(), 3);
        assert!(!window.live_blocks().contains(&b0.hash));
        assert!(window.live_blocks().contains(&b3.hash));
        // The evicted block's operation left with it.
        let evicted_op = b0.operations[0][0].hash();
        assert!(!window.live_operations().contains(&evicted_op));
        assert_eq!(window.live_operations().len(), 3);
    }

    #[test]
    fn rebuild_replaces_the_window() {
        let mut window = LiveWindow::new(2);
        let b0 = block_with_op(0, BlockHash::zero());
        let b1 = block_with_op(1, b0.hash);
        window.push_head(&b0);
        window.push_head(&b1);

        let mut c1 = block_with_op(1, b0.hash);
        c1.header.protocol_data = vec![0xb2];
        c1.hash = c1.header.hash();
        let c2 = block_with_op(2, c1.hash);
        window.rebuild(3, [&b0, &c1, &c2]);

        assert_eq!(window.capacity(), 3);
        assert_eq!(window.live_blocks().len(), 3);
        assert!(window.live_blocks().contains(&c2.hash));
        assert!(!window.live_blocks().contains(&b1.hash));
    }
}
