//! Builders for synthetic chains, used by the test suites of the store,
//! the validators and the mempool.

use crate::{
    block::{Block, BlockHeader, BlockMetadata},
    hash::{BlockHash, ContextHash, OperationListListHash},
    Operation,
};

/// A block at `level` on top of `predecessor`, with one empty
/// validation pass and deterministic contents.
#[must_use]
pub fn block_at_level(level: i32, predecessor: BlockHash) -> Block {
    let header = BlockHeader {
        level,
        proto_level: 1,
        predecessor,
        timestamp: 1_600_000_000 + i64::from(level) * 30,
        validation_passes: 1,
        operations_hash: OperationListListHash::hash_bytes(level.to_be_bytes()),
        fitness: vec![vec![0x01], level.to_be_bytes().to_vec()],
        context: ContextHash::hash_bytes(level.to_be_bytes()),
        protocol_data: Vec::new(),
    };
    let hash = header.hash();
    Block {
        hash,
        header,
        operations: vec![Vec::new()],
        block_metadata_hash: None,
        operations_metadata_hashes: None,
        metadata: None,
    }
}

/// Metadata with the given operation TTL and last-allowed-fork level.
#[must_use]
pub fn metadata_with_ttl(max_operations_ttl: u16, last_allowed_fork_level: i32) -> BlockMetadata {
    BlockMetadata {
        message: Some("applied".to_owned()),
        max_operations_ttl,
        last_allowed_fork_level,
        block_metadata: vec![0xca, 0xfe],
        operations_metadata: vec![Vec::new()],
    }
}

/// A linear chain of `len` blocks starting at level 0, each carrying
/// metadata with the given TTL. The last-allowed-fork level of every
/// block is 0 so the chain is reorg-friendly in tests.
#[must_use]
pub fn chain_of(len: usize, max_operations_ttl: u16) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut predecessor = BlockHash::zero();
    for level in 0..len {
        let mut block = block_at_level(level as i32, predecessor);
        block.metadata = Some(metadata_with_ttl(max_operations_ttl, 0));
        predecessor = block.hash;
        blocks.push(block);
    }
    blocks
}

/// An operation branched on `branch` with the given payload.
#[must_use]
pub fn operation_on_branch(branch: BlockHash, proto: &[u8]) -> Operation {
    Operation {
        branch,
        proto: proto.to_vec(),
    }
}
