//! Protocol-engine seam.
//!
//! Economic protocols are opaque plugins behind the [`ProtocolEngine`]
//! trait; the validator dispatches to whichever engine the block's
//! protocol level resolves to. The ledger context is equally opaque,
//! specified only by [`ContextIndex`]. One trivial engine ships
//! in-tree: it activates chains (genesis commit, test-chain forks) and
//! classifies operations by a tag byte, which is all the shell needs
//! before a real protocol takes over.

use std::{collections::HashMap, sync::Arc};

use parity_scale_codec::{Decode, Encode};
use parking_lot::RwLock;
use tessera_data_model::{Block, BlockHeader, ChainId, ContextHash, Operation, ProtocolHash};

use crate::{ApplyBlockResult, PreapplyResult, ValidationStore, ValidatorError};

/// Verdict of a protocol engine on a single mempool operation.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum OperationVerdict {
    /// Applies cleanly on the current validation state.
    Applied,
    /// Fails now but could apply on a future head of this branch.
    BranchDelayed(Vec<String>),
    /// Fails on this branch, could apply on another.
    BranchRefused(Vec<String>),
    /// Can never apply.
    Refused(Vec<String>),
    /// Anchored too far in the past.
    Outdated(Vec<String>),
}

/// Incremental validation state for classifying operations on top of a
/// head.
pub trait MempoolContext: Send {
    /// Apply one operation to the state.
    fn apply_operation(&mut self, operation: &Operation) -> OperationVerdict;
}

/// An economic protocol, as seen by the shell.
#[async_trait::async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Hash identifying this protocol.
    fn protocol_hash(&self) -> ProtocolHash;

    /// Apply a block on top of `predecessor`.
    async fn apply_block(
        &self,
        context: &dyn ContextIndex,
        chain_id: ChainId,
        predecessor: &Block,
        max_operations_ttl: u16,
        header: &BlockHeader,
        operations: &[Vec<Operation>],
    ) -> Result<ApplyBlockResult, ValidatorError>;

    /// Simulate a block from loose parts, returning the header it
    /// would get and the per-pass operation results.
    async fn preapply_block(
        &self,
        context: &dyn ContextIndex,
        chain_id: ChainId,
        predecessor: &Block,
        timestamp: i64,
        protocol_data: Vec<u8>,
        operations: &[Vec<Operation>],
    ) -> Result<PreapplyResult, ValidatorError>;

    /// Cheap structural check of a block, without applying it.
    async fn precheck_block(
        &self,
        context: &dyn ContextIndex,
        chain_id: ChainId,
        predecessor: &Block,
        header: &BlockHeader,
        operations: &[Vec<Operation>],
    ) -> Result<(), ValidatorError>;

    /// Start a validation state for mempool classification on top of
    /// `predecessor`.
    fn begin_construction(
        &self,
        predecessor: &Block,
    ) -> Result<Box<dyn MempoolContext>, ValidatorError>;
}

/// The opaque ledger-context provider.
pub trait ContextIndex: Send + Sync {
    /// Whether `hash` is a committed context that can be checked out.
    fn checkout(&self, hash: &ContextHash) -> bool;
    /// Record `hash` as committed.
    fn commit(&self, hash: ContextHash);
}

/// In-memory context index; the reference implementation for tests and
/// the subprocess demo loop.
#[derive(Debug, Default)]
pub struct InMemoryContextIndex {
    committed: RwLock<std::collections::HashSet<ContextHash>>,
}

impl ContextIndex for InMemoryContextIndex {
    fn checkout(&self, hash: &ContextHash) -> bool {
        self.committed.read().contains(hash)
    }

    fn commit(&self, hash: ContextHash) {
        self.committed.write().insert(hash);
    }
}

/// Table of registered protocol engines.
#[derive(Default)]
pub struct ProtocolRegistry {
    by_hash: HashMap<ProtocolHash, Arc<dyn ProtocolEngine>>,
    by_level: HashMap<u8, ProtocolHash>,
}

impl ProtocolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `engine` as the protocol of `proto_level`.
    pub fn register(&mut self, proto_level: u8, engine: Arc<dyn ProtocolEngine>) {
        let hash = engine.protocol_hash();
        self.by_level.insert(proto_level, hash);
        self.by_hash.insert(hash, engine);
    }

    /// Engine serving `proto_level`.
    pub fn engine_for_level(&self, proto_level: u8) -> Option<Arc<dyn ProtocolEngine>> {
        let hash = self.by_level.get(&proto_level)?;
        self.by_hash.get(hash).cloned()
    }

    /// Engine registered under `hash`.
    pub fn engine_for_hash(&self, hash: &ProtocolHash) -> Option<Arc<dyn ProtocolEngine>> {
        self.by_hash.get(hash).cloned()
    }
}

/// TTL granted by the activation engine.
pub const GENESIS_MAX_OPERATIONS_TTL: u16 = 120;

/// The chain-activation engine: commits genesis, forks test chains,
/// and validates blocks with purely structural rules. Operations are
/// classified by their first payload byte, which makes the engine
/// deterministic enough to drive the whole shell in tests and in the
/// subprocess demo loop.
#[derive(Debug)]
pub struct GenesisEngine {
    hash: ProtocolHash,
}

impl GenesisEngine {
    /// Engine with the canonical activation-protocol hash.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hash: ProtocolHash::hash_bytes(b"tessera-activation-protocol"),
        }
    }

    fn validation_store(header: &BlockHeader, context_hash: ContextHash) -> ValidationStore {
        ValidationStore {
            context_hash,
            message: Some(format!("validated level {}", header.level)),
            max_operations_ttl: GENESIS_MAX_OPERATIONS_TTL,
            last_allowed_fork_level: (header.level - i32::from(GENESIS_MAX_OPERATIONS_TTL)).max(0),
            timestamp: header.timestamp,
        }
    }

    /// Deterministic context commitment of a block.
    #[must_use]
    pub fn context_after(header: &BlockHeader) -> ContextHash {
        ContextHash::hash_bytes(header.encode())
    }
}

impl Default for GenesisEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProtocolEngine for GenesisEngine {
    fn protocol_hash(&self) -> ProtocolHash {
        self.hash
    }

    async fn apply_block(
        &self,
        context: &dyn ContextIndex,
        _chain_id: ChainId,
        predecessor: &Block,
        _max_operations_ttl: u16,
        header: &BlockHeader,
        operations: &[Vec<Operation>],
    ) -> Result<ApplyBlockResult, ValidatorError> {
        if !context.checkout(&predecessor.header.context) {
            return Err(ValidatorError::FailedToCheckoutContext(
                predecessor.header.context,
            ));
        }
        if header.predecessor != predecessor.hash {
            return Err(ValidatorError::InvalidBlock {
                errors: vec!["predecessor mismatch".to_owned()],
            });
        }
        if header.level != predecessor.header.level + 1 {
            return Err(ValidatorError::InvalidBlock {
                errors: vec![format!(
                    "level {} does not follow {}",
                    header.level, predecessor.header.level
                )],
            });
        }
        if operations.len() != usize::from(header.validation_passes) {
            return Err(ValidatorError::InvalidBlock {
                errors: vec!["operation pass count mismatch".to_owned()],
            });
        }

        let context_hash = Self::context_after(header);
        context.commit(context_hash);
        let operations_metadata: Vec<Vec<Vec<u8>>> = operations
            .iter()
            .map(|pass| pass.iter().map(|_| Vec::new()).collect())
            .collect();
        Ok(ApplyBlockResult {
            validation_store: Self::validation_store(header, context_hash),
            block_metadata: Vec::new(),
            operations_metadata,
            block_metadata_hash: None,
            operations_metadata_hashes: None,
        })
    }

    async fn preapply_block(
        &self,
        context: &dyn ContextIndex,
        _chain_id: ChainId,
        predecessor: &Block,
        timestamp: i64,
        protocol_data: Vec<u8>,
        operations: &[Vec<Operation>],
    ) -> Result<PreapplyResult, ValidatorError> {
        if !context.checkout(&predecessor.header.context) {
            return Err(ValidatorError::FailedToCheckoutContext(
                predecessor.header.context,
            ));
        }
        let mut shell_header = BlockHeader {
            level: predecessor.header.level + 1,
            proto_level: predecessor.header.proto_level,
            predecessor: predecessor.hash,
            timestamp,
            validation_passes: operations.len() as u8,
            operations_hash: tessera_data_model::OperationListListHash::hash_bytes(
                operations.encode(),
            ),
            fitness: predecessor.header.fitness.clone(),
            context: ContextHash::zero(),
            protocol_data,
        };
        shell_header.context = Self::context_after(&shell_header);
        let operations_results = operations
            .iter()
            .map(|pass| pass.iter().map(|op| op.hash().encode()).collect())
            .collect();
        Ok(PreapplyResult {
            shell_header,
            operations_results,
        })
    }

    async fn precheck_block(
        &self,
        _context: &dyn ContextIndex,
        _chain_id: ChainId,
        predecessor: &Block,
        header: &BlockHeader,
        _operations: &[Vec<Operation>],
    ) -> Result<(), ValidatorError> {
        if header.predecessor != predecessor.hash || header.level != predecessor.header.level + 1 {
            return Err(ValidatorError::InvalidBlock {
                errors: vec!["header does not extend the predecessor".to_owned()],
            });
        }
        if header.fitness.is_empty() {
            return Err(ValidatorError::InvalidBlock {
                errors: vec!["empty fitness".to_owned()],
            });
        }
        Ok(())
    }

    fn begin_construction(
        &self,
        predecessor: &Block,
    ) -> Result<Box<dyn MempoolContext>, ValidatorError> {
        Ok(Box::new(TagByteMempoolContext {
            branch_level: predecessor.level(),
        }))
    }
}

/// Classification by the first payload byte. The mapping is part of the
/// activation protocol's (informal) spec: 0 applies, 1 delays, 2
/// branch-refuses, 3 refuses, 4 is outdated.
struct TagByteMempoolContext {
    branch_level: i32,
}

impl MempoolContext for TagByteMempoolContext {
    fn apply_operation(&mut self, operation: &Operation) -> OperationVerdict {
        match operation.proto.first() {
            Some(0) | None => OperationVerdict::Applied,
            Some(1) => OperationVerdict::BranchDelayed(vec![format!(
                "not yet applicable at level {}",
                self.branch_level
            )]),
            Some(2) => OperationVerdict::BranchRefused(vec!["wrong branch".to_owned()]),
            Some(3) => OperationVerdict::Refused(vec!["refused by protocol".to_owned()]),
            Some(4) => OperationVerdict::Outdated(vec!["past the ttl window".to_owned()]),
            Some(_) => OperationVerdict::Applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_data_model::test_support::{block_at_level, operation_on_branch};
    use tessera_data_model::BlockHash;

    use super::*;

    #[tokio::test]
    async fn apply_refuses_unknown_context() {
        let engine = GenesisEngine::new();
        let context = InMemoryContextIndex::default();
        let predecessor = block_at_level(3, BlockHash::zero());
        let header = block_at_level(4, predecessor.hash).header;
        let chain_id = ChainId::from_block_hash(&predecessor.hash);

        let refused = engine
            .apply_block(&context, chain_id, &predecessor, 120, &header, &[Vec::new()])
            .await;
        assert!(matches!(
            refused,
            Err(ValidatorError::FailedToCheckoutContext(_))
        ));

        context.commit(predecessor.header.context);
        let applied = engine
            .apply_block(&context, chain_id, &predecessor, 120, &header, &[Vec::new()])
            .await
            .unwrap();
        assert_eq!(
            applied.validation_store.context_hash,
            GenesisEngine::context_after(&header)
        );
        assert!(context.checkout(&applied.validation_store.context_hash));
    }

    #[test]
    fn tag_bytes_cover_every_verdict() {
        let engine = GenesisEngine::new();
        let predecessor = block_at_level(1, BlockHash::zero());
        let mut state = engine.begin_construction(&predecessor).unwrap();
        let branch = predecessor.hash;

        assert_eq!(
            state.apply_operation(&operation_on_branch(branch, &[0, 1])),
            OperationVerdict::Applied
        );
        assert!(matches!(
            state.apply_operation(&operation_on_branch(branch, &[1])),
            OperationVerdict::BranchDelayed(_)
        ));
        assert!(matches!(
            state.apply_operation(&operation_on_branch(branch, &[2])),
            OperationVerdict::BranchRefused(_)
        ));
        assert!(matches!(
            state.apply_operation(&operation_on_branch(branch, &[3])),
            OperationVerdict::Refused(_)
        ));
        assert!(matches!(
            state.apply_operation(&operation_on_branch(branch, &[4])),
            OperationVerdict::Outdated(_)
        ));
    }
}
