//! Block and operation representations shared by the store, the
//! validators and the mempool.

use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::hash::{
    BlockHash, BlockMetadataHash, ContextHash, OperationHash, OperationListListHash,
    OperationMetadataHash,
};

/// Fixed header of a block. Its hash identifies the block.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Height of the block, genesis is level 0.
    pub level: i32,
    /// Index into the protocol activation table.
    pub proto_level: u8,
    /// Hash of the preceding block.
    pub predecessor: BlockHash,
    /// Seconds since the UNIX epoch.
    pub timestamp: i64,
    /// Number of operation passes; the operation list-of-lists has
    /// exactly this many inner lists.
    pub validation_passes: u8,
    /// Commitment to the carried operations.
    pub operations_hash: OperationListListHash,
    /// Protocol-specific fitness, compared lexicographically.
    pub fitness: Vec<Vec<u8>>,
    /// Commitment to the context resulting from this block.
    pub context: ContextHash,
    /// Opaque protocol-specific payload.
    pub protocol_data: Vec<u8>,
}

impl BlockHeader {
    /// Hash of the canonical encoding of this header.
    #[must_use]
    pub fn hash(&self) -> BlockHash {
        BlockHash::hash_bytes(self.encode())
    }
}

/// An operation, addressed by hash, anchored on a branch block.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Operation {
    /// The block this operation considers to be the head of a valid chain.
    pub branch: BlockHash,
    /// Opaque protocol-specific payload.
    pub proto: Vec<u8>,
}

impl Operation {
    /// Hash of the canonical encoding of this operation.
    #[must_use]
    pub fn hash(&self) -> OperationHash {
        OperationHash::hash_bytes(self.encode())
    }
}

/// Result of applying a block, kept alongside it until pruned.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Free-form application message.
    pub message: Option<String>,
    /// Protocol-declared inclusion window, in blocks, for operations
    /// branched on this block.
    pub max_operations_ttl: u16,
    /// Level below which no reorg from this block is legal.
    pub last_allowed_fork_level: i32,
    /// Opaque protocol metadata for the block itself.
    pub block_metadata: Vec<u8>,
    /// Per-operation protocol metadata, same shape as the operation
    /// list-of-lists.
    pub operations_metadata: Vec<Vec<Vec<u8>>>,
}

/// A stored block: header, operations, optional hashes and metadata.
///
/// The metadata hashes are absent on blocks produced before the protocol
/// started committing to them; `metadata` is absent once the block has
/// been pruned by a history-mode merge.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Block {
    /// Hash of `header`.
    pub hash: BlockHash,
    /// The block header.
    pub header: BlockHeader,
    /// One inner list per validation pass.
    pub operations: Vec<Vec<Operation>>,
    /// Commitment to `metadata.block_metadata`, when the protocol
    /// provides one.
    pub block_metadata_hash: Option<BlockMetadataHash>,
    /// Commitments to `metadata.operations_metadata`, same shape as
    /// `operations`.
    pub operations_metadata_hashes: Option<Vec<Vec<OperationMetadataHash>>>,
    /// Application metadata, absent on pruned blocks.
    pub metadata: Option<BlockMetadata>,
}

impl Block {
    /// Level of the block.
    #[must_use]
    pub const fn level(&self) -> i32 {
        self.header.level
    }

    /// Lightweight identifier of the block.
    #[must_use]
    pub const fn descriptor(&self) -> BlockDescriptor {
        BlockDescriptor {
            hash: self.hash,
            level: self.header.level,
        }
    }

    /// Hashes of every carried operation, pass structure flattened away.
    #[must_use]
    pub fn operation_hashes(&self) -> Vec<OperationHash> {
        self.operations
            .iter()
            .flatten()
            .map(Operation::hash)
            .collect()
    }

    /// Strip the application metadata, as the history-mode merge does.
    #[must_use]
    pub fn pruned(mut self) -> Self {
        self.metadata = None;
        self
    }
}

/// Canonical lightweight block identifier.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize,
)]
pub struct BlockDescriptor {
    /// Hash of the block.
    pub hash: BlockHash,
    /// Level of the block.
    pub level: i32,
}

impl BlockDescriptor {
    /// Pair up a hash and a level.
    #[must_use]
    pub const fn new(hash: BlockHash, level: i32) -> Self {
        Self { hash, level }
    }
}

impl core::fmt::Display for BlockDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} (level {})", self.hash, self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{block_at_level, metadata_with_ttl};

    #[test]
    fn header_hash_commits_to_every_field() {
        let block = block_at_level(7, BlockHash::zero());
        let mut tweaked = block.header.clone();
        tweaked.timestamp += 1;
        assert_ne!(block.header.hash(), tweaked.hash());
    }

    #[test]
    fn block_scale_round_trip() {
        let mut block = block_at_level(3, BlockHash::hash_bytes(b"pred"));
        block.metadata = Some(metadata_with_ttl(12, 0));
        let decoded = Block::decode(&mut block.encode().as_slice()).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn metadata_scale_round_trip() {
        let metadata = metadata_with_ttl(60, 41);
        let decoded = BlockMetadata::decode(&mut metadata.encode().as_slice()).unwrap();
        assert_eq!(metadata, decoded);
    }

    #[test]
    fn pruning_only_drops_metadata() {
        let mut block = block_at_level(5, BlockHash::zero());
        block.metadata = Some(metadata_with_ttl(12, 0));
        let pruned = block.clone().pruned();
        assert!(pruned.metadata.is_none());
        assert_eq!(pruned.hash, block.hash);
        assert_eq!(pruned.operations, block.operations);
    }
}
