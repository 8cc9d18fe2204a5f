//! Tessera data model: content-addressed hashes, blocks, operations and
//! chain-level configuration, with their canonical SCALE encodings.

pub mod block;
pub mod chain;
pub mod hash;
pub mod test_support;

pub use block::{Block, BlockDescriptor, BlockHeader, BlockMetadata, Operation};
pub use chain::{ChainConfig, CommitInfo, Genesis, HistoryMode, Mempool, ProtocolLevelEntry};
pub use hash::{
    BlockHash, BlockMetadataHash, ChainId, ContextHash, Hash, OperationHash,
    OperationListListHash, OperationMetadataHash, ProtocolHash,
};

pub mod prelude {
    //! Re-exports of the types almost every consumer needs.
    pub use crate::{
        Block, BlockDescriptor, BlockHash, BlockHeader, BlockMetadata, ChainConfig, ChainId,
        ContextHash, Genesis, HistoryMode, Mempool, Operation, OperationHash, ProtocolHash,
        ProtocolLevelEntry,
    };
}
