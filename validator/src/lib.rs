//! Tessera block validator: applies, preapplies and prechecks blocks
//! through an economic-protocol engine, either in-process or in an
//! isolated subprocess.

use std::sync::Arc;

use parity_scale_codec::{Decode, Encode};
use parking_lot::Mutex;
use tessera_data_model::{
    Block, BlockHeader, BlockMetadata, BlockMetadataHash, ChainId, ContextHash, Genesis,
    Operation, OperationMetadataHash, ProtocolHash,
};
use tessera_logger::prelude::*;

pub mod engine;
pub mod external;

pub use engine::{
    ContextIndex, GenesisEngine, InMemoryContextIndex, MempoolContext, OperationVerdict,
    ProtocolEngine, ProtocolRegistry, GENESIS_MAX_OPERATIONS_TTL,
};
pub use external::ExternalValidator;

/// Validator error taxonomy.
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum ValidatorError {
    /// Failed to checkout context {0}
    FailedToCheckoutContext(ContextHash),
    /// Invalid block: {errors:?}
    InvalidBlock {
        /// Rendered protocol errors.
        errors: Vec<String>,
    },
    /// Inconsistent hash: got {got}, expected {expected}
    InconsistentHash {
        /// Hash computed from the bytes.
        got: tessera_data_model::BlockHash,
        /// Hash that was announced.
        expected: tessera_data_model::BlockHash,
    },
    /// Protocol of level {proto_level} is unavailable
    UnavailableProtocol {
        /// The unresolved protocol level.
        proto_level: u8,
    },
    /// Inconsistent handshake: {0}
    InconsistentHandshake(String),
    /// Validation process failed: {0}
    ValidationProcessFailed(String),
    /// Cannot validate while shutting down
    CannotValidateWhileShuttingDown,
    /// Validator i/o error
    Io(#[from] std::io::Error),
    /// Validator codec error
    Codec(#[from] parity_scale_codec::Error),
}

type Result<T, E = ValidatorError> = std::result::Result<T, E>;

/// What the protocol persists about an applied block.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ValidationStore {
    /// Context commitment; must equal the applied header's `context`.
    pub context_hash: ContextHash,
    /// Free-form application message.
    pub message: Option<String>,
    /// Operation TTL declared by the protocol.
    pub max_operations_ttl: u16,
    /// Level below which no reorg from this block is legal.
    pub last_allowed_fork_level: i32,
    /// Timestamp of the applied block.
    pub timestamp: i64,
}

/// Full result of applying a block.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ApplyBlockResult {
    /// The persisted summary.
    pub validation_store: ValidationStore,
    /// Opaque protocol metadata for the block.
    pub block_metadata: Vec<u8>,
    /// Per-operation protocol metadata, same shape as the operations.
    pub operations_metadata: Vec<Vec<Vec<u8>>>,
    /// Commitment to `block_metadata`, when the protocol provides one.
    pub block_metadata_hash: Option<BlockMetadataHash>,
    /// Commitments to `operations_metadata`.
    pub operations_metadata_hashes: Option<Vec<Vec<OperationMetadataHash>>>,
}

impl ApplyBlockResult {
    /// Assemble the block metadata to store alongside the block.
    #[must_use]
    pub fn into_metadata(self) -> BlockMetadata {
        BlockMetadata {
            message: self.validation_store.message,
            max_operations_ttl: self.validation_store.max_operations_ttl,
            last_allowed_fork_level: self.validation_store.last_allowed_fork_level,
            block_metadata: self.block_metadata,
            operations_metadata: self.operations_metadata,
        }
    }
}

/// Result of preapplying a block.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct PreapplyResult {
    /// The header the block would get.
    pub shell_header: BlockHeader,
    /// Per-pass preapply results, encoded by the protocol.
    pub operations_results: Vec<Vec<Vec<u8>>>,
}

/// A block validator: in-process or external, selected at
/// construction.
#[async_trait::async_trait]
pub trait BlockValidator: Send + Sync {
    /// Apply a block on top of its predecessor.
    async fn apply_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        max_operations_ttl: u16,
        header: &BlockHeader,
        operations: Vec<Vec<Operation>>,
    ) -> Result<ApplyBlockResult>;

    /// Simulate a block from loose parts.
    async fn preapply_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        timestamp: i64,
        protocol_data: Vec<u8>,
        operations: Vec<Vec<Operation>>,
    ) -> Result<PreapplyResult>;

    /// Cheap check of a block without applying it.
    async fn precheck_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        header: &BlockHeader,
        operations: Vec<Vec<Operation>>,
    ) -> Result<()>;

    /// Commit the genesis context and build the genesis block.
    async fn commit_genesis(&self, chain_id: ChainId) -> Result<Block>;

    /// Fork a test chain from `forked_header` on `context_hash`.
    async fn init_test_chain(
        &self,
        context_hash: ContextHash,
        forked_header: BlockHeader,
    ) -> Result<BlockHeader>;

    /// Adjust the validator's log filtering at runtime.
    async fn reconfigure_event_logging(&self, filter: String) -> Result<()>;

    /// Release the validator's resources.
    async fn close(&self);
}

/// Cache hint of the in-process validator: what the next application
/// can assume about the protocol caches.
#[derive(Clone, Debug, PartialEq, Eq)]
enum CacheHint {
    /// Cold start; everything is loaded from the context.
    Load,
    /// The caches of the given context are still warm.
    Inherited(ContextHash),
    /// Populated on demand, as prechecks do not build full caches.
    Lazy,
}

/// In-process validator over a [`ProtocolRegistry`].
pub struct InternalValidator {
    registry: ProtocolRegistry,
    context: Arc<dyn ContextIndex>,
    genesis: Genesis,
    cache: Mutex<CacheHint>,
    /// Most recent preapply outcome; an `apply_block` for the same
    /// header reuses it instead of re-executing the protocol.
    preapply_stash: Mutex<Option<(BlockHeader, ApplyBlockResult)>>,
}

impl InternalValidator {
    /// Build a validator over `registry` and `context`.
    #[must_use]
    pub fn new(
        registry: ProtocolRegistry,
        context: Arc<dyn ContextIndex>,
        genesis: Genesis,
    ) -> Self {
        Self {
            registry,
            context,
            genesis,
            cache: Mutex::new(CacheHint::Load),
            preapply_stash: Mutex::new(None),
        }
    }

    fn engine_for(&self, proto_level: u8) -> Result<Arc<dyn ProtocolEngine>> {
        self.registry
            .engine_for_level(proto_level)
            .ok_or(ValidatorError::UnavailableProtocol { proto_level })
    }

    /// Protocol hash registered for a protocol level, if any.
    #[must_use]
    pub fn protocol_of_level(&self, proto_level: u8) -> Option<ProtocolHash> {
        self.registry
            .engine_for_level(proto_level)
            .map(|engine| engine.protocol_hash())
    }

    /// Start a mempool validation state on top of `predecessor`.
    pub fn begin_construction(&self, predecessor: &Block) -> Result<Box<dyn MempoolContext>> {
        *self.cache.lock() = CacheHint::Lazy;
        self.engine_for(predecessor.header.proto_level)?
            .begin_construction(predecessor)
    }
}

#[async_trait::async_trait]
impl BlockValidator for InternalValidator {
    async fn apply_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        max_operations_ttl: u16,
        header: &BlockHeader,
        operations: Vec<Vec<Operation>>,
    ) -> Result<ApplyBlockResult> {
        if let Some((stashed_header, stashed)) = &*self.preapply_stash.lock() {
            if stashed_header == header {
                debug!(level = header.level, "reusing the preapplied result");
                return Ok(stashed.clone());
            }
        }

        match &*self.cache.lock() {
            CacheHint::Inherited(context) if *context == predecessor.header.context => {
                debug!(level = header.level, "protocol caches inherited from the predecessor");
            }
            CacheHint::Inherited(_) | CacheHint::Lazy => {
                debug!(level = header.level, "protocol caches rebuilt on demand");
            }
            CacheHint::Load => debug!(level = header.level, "protocol caches loaded cold"),
        }

        let engine = self.engine_for(header.proto_level)?;
        let result = engine
            .apply_block(
                self.context.as_ref(),
                chain_id,
                predecessor,
                max_operations_ttl,
                header,
                &operations,
            )
            .await?;
        if result.validation_store.context_hash != header.context {
            return Err(ValidatorError::InvalidBlock {
                errors: vec![format!(
                    "context commitment mismatch: {} != {}",
                    result.validation_store.context_hash, header.context
                )],
            });
        }
        // The caches now reflect this block's context; a direct
        // successor inherits them.
        *self.cache.lock() = CacheHint::Inherited(result.validation_store.context_hash);
        Ok(result)
    }

    async fn preapply_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        timestamp: i64,
        protocol_data: Vec<u8>,
        operations: Vec<Vec<Operation>>,
    ) -> Result<PreapplyResult> {
        let engine = self.engine_for(predecessor.header.proto_level)?;
        let preapplied = engine
            .preapply_block(
                self.context.as_ref(),
                chain_id,
                predecessor,
                timestamp,
                protocol_data,
                &operations,
            )
            .await?;
        // Stash the matching application for the follow-up apply.
        let applied = engine
            .apply_block(
                self.context.as_ref(),
                chain_id,
                predecessor,
                GENESIS_MAX_OPERATIONS_TTL,
                &preapplied.shell_header,
                &operations,
            )
            .await;
        if let Ok(applied) = applied {
            *self.preapply_stash.lock() = Some((preapplied.shell_header.clone(), applied));
        }
        Ok(preapplied)
    }

    async fn precheck_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        header: &BlockHeader,
        operations: Vec<Vec<Operation>>,
    ) -> Result<()> {
        *self.cache.lock() = CacheHint::Lazy;
        self.engine_for(header.proto_level)?
            .precheck_block(
                self.context.as_ref(),
                chain_id,
                predecessor,
                header,
                &operations,
            )
            .await
    }

    async fn commit_genesis(&self, _chain_id: ChainId) -> Result<Block> {
        let context_hash = ContextHash::hash_bytes(self.genesis.block.as_bytes());
        self.context.commit(context_hash);
        let mut block = self.genesis.make_block(context_hash);
        block.metadata = Some(BlockMetadata {
            message: Some("genesis".to_owned()),
            max_operations_ttl: 0,
            last_allowed_fork_level: 0,
            block_metadata: Vec::new(),
            operations_metadata: Vec::new(),
        });
        *self.cache.lock() = CacheHint::Load;
        Ok(block)
    }

    async fn init_test_chain(
        &self,
        context_hash: ContextHash,
        forked_header: BlockHeader,
    ) -> Result<BlockHeader> {
        if !self.context.checkout(&context_hash) {
            return Err(ValidatorError::FailedToCheckoutContext(context_hash));
        }
        let mut header = forked_header;
        header.predecessor = header.hash();
        header.context = context_hash;
        header.fitness = Vec::new();
        Ok(header)
    }

    async fn reconfigure_event_logging(&self, filter: String) -> Result<()> {
        info!(%filter, "event logging reconfigured");
        Ok(())
    }

    async fn close(&self) {
        *self.preapply_stash.lock() = None;
        *self.cache.lock() = CacheHint::Load;
    }
}

#[cfg(test)]
mod tests {
    use tessera_data_model::test_support::block_at_level;
    use tessera_data_model::BlockHash;

    use super::*;

    fn validator() -> InternalValidator {
        let mut registry = ProtocolRegistry::new();
        let engine = Arc::new(GenesisEngine::new());
        registry.register(0, engine.clone());
        registry.register(1, engine);
        let genesis = Genesis {
            time: 1_600_000_000,
            block: BlockHash::hash_bytes(b"genesis"),
            protocol: ProtocolHash::hash_bytes(b"proto-genesis"),
        };
        InternalValidator::new(registry, Arc::new(InMemoryContextIndex::default()), genesis)
    }

    #[tokio::test]
    async fn commit_genesis_builds_a_block_with_metadata() {
        let validator = validator();
        let chain_id = ChainId::from_block_hash(&BlockHash::hash_bytes(b"genesis"));
        let genesis = validator.commit_genesis(chain_id).await.unwrap();
        assert_eq!(genesis.level(), 0);
        assert!(genesis.metadata.is_some());
        assert_eq!(genesis.hash, validator.genesis.block);
    }

    #[tokio::test]
    async fn apply_checks_the_context_commitment() {
        let validator = validator();
        let chain_id = ChainId::from_block_hash(&BlockHash::hash_bytes(b"genesis"));
        let predecessor = block_at_level(1, BlockHash::zero());
        validator.context.commit(predecessor.header.context);

        // A header whose announced context does not match what the
        // engine commits is invalid.
        let mut header = block_at_level(2, predecessor.hash).header;
        header.context = ContextHash::hash_bytes(b"wrong");
        let result = validator
            .apply_block(chain_id, &predecessor, 120, &header, vec![Vec::new()])
            .await;
        assert!(matches!(result, Err(ValidatorError::InvalidBlock { .. })));

        let mut header = block_at_level(2, predecessor.hash).header;
        header.context = GenesisEngine::context_after(&header);
        let applied = validator
            .apply_block(chain_id, &predecessor, 120, &header, vec![Vec::new()])
            .await
            .unwrap();
        assert_eq!(applied.validation_store.context_hash, header.context);
    }

    #[tokio::test]
    async fn preapply_stash_feeds_the_next_apply() {
        let validator = validator();
        let chain_id = ChainId::from_block_hash(&BlockHash::hash_bytes(b"genesis"));
        let predecessor = block_at_level(1, BlockHash::zero());
        validator.context.commit(predecessor.header.context);

        let preapplied = validator
            .preapply_block(
                chain_id,
                &predecessor,
                predecessor.header.timestamp + 30,
                Vec::new(),
                vec![Vec::new()],
            )
            .await
            .unwrap();

        let applied = validator
            .apply_block(
                chain_id,
                &predecessor,
                120,
                &preapplied.shell_header,
                vec![Vec::new()],
            )
            .await
            .unwrap();
        assert_eq!(
            applied.validation_store.context_hash,
            preapplied.shell_header.context
        );
    }

    #[tokio::test]
    async fn unknown_protocol_level_is_unavailable() {
        let validator = validator();
        let chain_id = ChainId::from_block_hash(&BlockHash::hash_bytes(b"genesis"));
        let predecessor = block_at_level(1, BlockHash::zero());
        let mut header = block_at_level(2, predecessor.hash).header;
        header.proto_level = 9;
        let result = validator
            .apply_block(chain_id, &predecessor, 120, &header, vec![Vec::new()])
            .await;
        assert!(matches!(
            result,
            Err(ValidatorError::UnavailableProtocol { proto_level: 9 })
        ));
    }
}
