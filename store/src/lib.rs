//! Tessera persistent store: the two-tier block store (cemented cycles
//! plus floating logs), the background cementing merge, and the chain
//! state with its durable pointers.

use std::{fs, path::PathBuf, sync::Arc};

use fs2::FileExt as _;
use tessera_config::StoreConfig;
use tessera_data_model::{Block, ChainConfig, ChainId};
use tessera_logger::prelude::*;

pub mod block_store;
pub mod cell;
pub mod cemented;
pub mod chain;
pub mod error;
pub mod floating;
pub mod index;
pub mod live;

pub use block_store::{BlockStore, MergeParams, MergeStatus};
pub use cemented::{CementedRange, CementedStore};
pub use chain::{ChainState, InvalidBlockEntry};
pub use error::{CannotCement, CementedIssue, Error};
pub use floating::{FloatingKind, FloatingStore};
pub use live::LiveWindow;

use error::{AddErrContextExt as _, Result};

const RECONSTRUCTION_LOCK_NAME: &str = "reconstruction.lock";

/// A whole on-disk store, rooted at `<store_dir>/<chain_id>/`.
pub struct Store {
    chain: Arc<ChainState>,
}

impl Store {
    /// Open the store, creating the chain from `genesis_block` when it
    /// does not exist yet. The genesis block must carry metadata (it
    /// comes out of `commit_genesis`).
    pub fn init(
        store_config: &StoreConfig,
        chain_config: ChainConfig,
        genesis_block: Option<&Block>,
    ) -> Result<Self> {
        let chain_id = ChainId::from_block_hash(&chain_config.genesis.block);
        let chain_dir = store_config.store_dir.join(chain_id.to_string());
        fs::create_dir_all(&chain_dir).add_err_context(&chain_dir)?;

        if chain_dir.join(RECONSTRUCTION_LOCK_NAME).exists() {
            return Err(Error::ReconstructionPending);
        }
        probe_process_lock(&chain_dir)?;

        let block_store = BlockStore::open(
            &chain_dir,
            store_config.blocks_per_cycle,
            store_config.index_write_buffer,
        )?;

        let exists = chain_dir.join("chain_config").exists();
        let chain = if exists {
            let chain = ChainState::open(&chain_dir, &chain_config, Arc::clone(&block_store))?;
            // Startup consistency check; what the open-time recovery
            // could not repair is surfaced as corruption.
            block_store
                .cemented()
                .check_indexes_consistency()
                .map_err(|error| Error::CorruptedStore(error.to_string()))?;
            chain.check_invariants()?;
            chain
        } else {
            let genesis_block = genesis_block.ok_or_else(|| {
                Error::CorruptedStore("no chain on disk and no genesis to create one".to_owned())
            })?;
            let chain = ChainState::create(
                &chain_dir,
                chain_config,
                genesis_block,
                Arc::clone(&block_store),
            )?;
            // Genesis seeds the cemented tier as its own cycle.
            block_store
                .cemented()
                .cement_blocks(std::slice::from_ref(genesis_block), true)?;
            chain
        };

        info!(chain_id = %chain.chain_id(), "store ready");
        Ok(Self { chain })
    }

    /// The chain state.
    #[must_use]
    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    /// Wait for background work and flush indexes.
    pub fn close(&self) {
        self.chain.block_store().await_merge_idle();
    }
}

/// Make sure no other process has the chain open: take the advisory
/// lock once, then release it so the merge can use it.
fn probe_process_lock(chain_dir: &std::path::Path) -> Result<()> {
    let path: PathBuf = chain_dir.join("lock");
    let file = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .add_err_context(&path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(Error::Locked(path));
    }
    let _ = fs2::FileExt::unlock(&file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tessera_data_model::{
        test_support::metadata_with_ttl, BlockDescriptor, BlockHash, Genesis, HistoryMode,
        ProtocolHash,
    };

    use super::*;

    fn genesis_config(history_mode: HistoryMode) -> (ChainConfig, Block) {
        let header = tessera_data_model::BlockHeader {
            level: 0,
            proto_level: 0,
            predecessor: BlockHash::zero(),
            timestamp: 1_600_000_000,
            validation_passes: 0,
            operations_hash: tessera_data_model::OperationListListHash::zero(),
            fitness: Vec::new(),
            context: tessera_data_model::ContextHash::hash_bytes(b"genesis-context"),
            protocol_data: Vec::new(),
        };
        let hash = header.hash();
        let mut genesis_block = Block {
            hash,
            header,
            operations: Vec::new(),
            block_metadata_hash: None,
            operations_metadata_hashes: None,
            metadata: Some(metadata_with_ttl(0, 0)),
        };
        genesis_block.metadata.as_mut().unwrap().message = Some("genesis".to_owned());
        let config = ChainConfig {
            genesis: Genesis {
                time: 1_600_000_000,
                block: hash,
                protocol: ProtocolHash::hash_bytes(b"proto-genesis"),
            },
            expiration: None,
            history_mode,
        };
        (config, genesis_block)
    }

    /// A child of `predecessor` with controllable TTL, fork level and
    /// salt (to make siblings differ).
    fn child_block(
        predecessor: &Block,
        max_operations_ttl: u16,
        last_allowed_fork_level: i32,
        salt: u8,
    ) -> Block {
        let level = predecessor.level() + 1;
        let header = tessera_data_model::BlockHeader {
            level,
            proto_level: 1,
            predecessor: predecessor.hash,
            timestamp: predecessor.header.timestamp + 30,
            validation_passes: 1,
            operations_hash: tessera_data_model::OperationListListHash::hash_bytes([salt]),
            fitness: vec![vec![salt], level.to_be_bytes().to_vec()],
            context: tessera_data_model::ContextHash::hash_bytes(level.to_be_bytes()),
            protocol_data: vec![salt],
        };
        let hash = header.hash();
        Block {
            hash,
            header,
            operations: vec![Vec::new()],
            block_metadata_hash: None,
            operations_metadata_hashes: None,
            metadata: Some(metadata_with_ttl(max_operations_ttl, last_allowed_fork_level)),
        }
    }

    fn store_config(dir: &std::path::Path, blocks_per_cycle: u32) -> StoreConfig {
        StoreConfig {
            store_dir: dir.to_path_buf(),
            history_mode: HistoryMode::Archive,
            blocks_per_cycle,
            index_write_buffer: 10_000,
        }
    }

    #[test]
    fn head_switch_without_reorg_updates_the_window_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let store = Store::init(&store_config(dir.path(), 4096), config, Some(&genesis)).unwrap();
        let chain = store.chain().clone();

        let a = child_block(&genesis, 2, 0, 1);
        let b = child_block(&a, 2, 0, 1);
        let c = child_block(&b, 2, 0, 1);
        let d = child_block(&c, 2, 0, 1);
        for block in [&a, &b, &c, &d] {
            chain.store_block(block).unwrap();
            chain.set_head(block).unwrap();
        }

        assert_eq!(chain.current_head().hash, d.hash);
        let live = chain.live_blocks();
        assert_eq!(
            live,
            [b.hash, c.hash, d.hash].into_iter().collect(),
            "live window must cover the last ttl+1 blocks"
        );
        assert!(chain.alternate_heads().is_empty());
        assert_eq!(chain.checkpoint().level, 0);
        chain.check_invariants().unwrap();
    }

    #[test]
    fn reorg_demotes_the_old_head() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let store = Store::init(&store_config(dir.path(), 4096), config, Some(&genesis)).unwrap();
        let chain = store.chain().clone();

        let a = child_block(&genesis, 1, 0, 1);
        let b = child_block(&a, 1, 0, 1);
        let c = child_block(&b, 1, 0, 1);
        for block in [&a, &b, &c] {
            chain.store_block(block).unwrap();
            chain.set_head(block).unwrap();
        }

        // A sibling of `b` with higher fitness wins.
        let b_prime = child_block(&a, 1, 0, 9);
        chain.store_block(&b_prime).unwrap();
        let previous = chain.set_head(&b_prime).unwrap();

        assert_eq!(previous, Some(c.descriptor()));
        assert_eq!(chain.current_head().hash, b_prime.hash);
        assert_eq!(chain.alternate_heads(), vec![c.descriptor()]);
        assert_eq!(
            chain.live_blocks(),
            [a.hash, b_prime.hash].into_iter().collect()
        );
    }

    #[test]
    fn set_head_of_an_ancestor_is_a_benign_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let store = Store::init(&store_config(dir.path(), 4096), config, Some(&genesis)).unwrap();
        let chain = store.chain().clone();

        let a = child_block(&genesis, 2, 0, 1);
        let b = child_block(&a, 2, 0, 1);
        for block in [&a, &b] {
            chain.store_block(block).unwrap();
            chain.set_head(block).unwrap();
        }

        // The current head itself, twice.
        assert!(chain.set_head(&b).unwrap().is_none());
        assert!(chain.set_head(&b).unwrap().is_none());
        // An ancestor of the current head.
        assert!(chain.set_head(&a).unwrap().is_none());
        assert_eq!(chain.current_head().hash, b.hash);
    }

    #[test]
    fn storing_at_the_checkpoint_level_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let store = Store::init(&store_config(dir.path(), 4096), config, Some(&genesis)).unwrap();
        let chain = store.chain().clone();

        // The checkpoint sits at genesis (level 0): a competing block
        // at level 0 must be refused.
        let stray = {
            let mut block = genesis.clone();
            block.header.protocol_data = vec![0xff];
            block.hash = block.header.hash();
            block
        };
        assert!(matches!(
            chain.store_block(&stray),
            Err(Error::CheckpointError(_))
        ));
    }

    #[test]
    fn invalid_blocks_are_sticky_until_the_checkpoint_passes() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let store = Store::init(&store_config(dir.path(), 4096), config, Some(&genesis)).unwrap();
        let chain = store.chain().clone();

        let a = child_block(&genesis, 2, 0, 1);
        chain.store_block(&a).unwrap();
        chain.set_head(&a).unwrap();

        let bad = child_block(&a, 2, 0, 66);
        chain
            .mark_invalid_block(bad.hash, bad.level(), vec!["bad fitness".to_owned()])
            .unwrap();
        assert!(matches!(
            chain.store_block(&bad),
            Err(Error::KnownInvalid(_))
        ));
        assert!(chain.invalid_blocks().contains_key(&bad.hash));
        chain.check_invariants().unwrap();

        // Once the checkpoint advances past the recorded level, the
        // entry is dropped.
        let b = child_block(&a, 2, 0, 1);
        let c = child_block(&b, 2, 0, 1);
        let d = child_block(&c, 2, 3, 1);
        for block in [&b, &c, &d] {
            chain.store_block(block).unwrap();
            chain.set_head(block).unwrap();
        }
        assert_eq!(chain.checkpoint().level, 3);
        assert!(chain.invalid_blocks().is_empty());
        chain.check_invariants().unwrap();
    }

    #[test]
    fn target_blocks_conflicting_heads() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let store = Store::init(&store_config(dir.path(), 4096), config, Some(&genesis)).unwrap();
        let chain = store.chain().clone();

        let a = child_block(&genesis, 2, 0, 1);
        let b = child_block(&a, 2, 0, 1);
        chain.store_block(&a).unwrap();
        chain.set_head(&a).unwrap();
        chain.set_target(b.descriptor()).unwrap();

        // A block competing with the target at its level is not
        // acceptable, the target itself is.
        let b_evil = child_block(&a, 2, 0, 7);
        assert!(!chain.is_acceptable_block(&b_evil.hash, b_evil.level()));
        assert!(chain.is_acceptable_block(&b.hash, b.level()));

        // A head through the target clears it.
        chain.store_block(&b).unwrap();
        chain.set_head(&b).unwrap();
        assert_eq!(chain.target(), None);

        // A head that contradicts a target fails.
        chain.set_target(BlockDescriptor::new(BlockHash::hash_bytes(b"other"), 3)).unwrap();
        let c = child_block(&b, 2, 0, 1);
        chain.store_block(&c).unwrap();
        assert!(matches!(
            chain.set_head(&c),
            Err(Error::TargetMismatch { .. })
        ));
    }

    #[test]
    fn merge_cements_up_to_the_fork_level() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let store = Store::init(&store_config(dir.path(), 4), config, Some(&genesis)).unwrap();
        let chain = store.chain().clone();
        let block_store = chain.block_store().clone();

        // Build a chain whose fork level trails the head by 4 blocks,
        // letting each started merge settle before the next head.
        let mut blocks = vec![genesis.clone()];
        for level in 1..=12 {
            let lafl = (level - 4).max(0);
            let block = child_block(blocks.last().unwrap(), 2, lafl, 1);
            chain.store_block(&block).unwrap();
            chain.set_head(&block).unwrap();
            block_store.await_merge_idle();
            blocks.push(block);
        }
        assert!(!block_store.merge_ongoing());

        assert_eq!(block_store.get_merge_status(), MergeStatus::Idle);
        let highest = block_store.cemented().highest_cemented_level().unwrap();
        assert_eq!(highest, 8, "cemented up to the last fork level");
        assert_eq!(chain.cementing_highwatermark(), Some(8));

        // The merged view still serves every block, in order.
        for block in &blocks {
            let read_back = block_store.read_block(&block.hash, false).unwrap().unwrap();
            assert_eq!(read_back.hash, block.hash);
        }
        // Cemented blocks left the floating tier.
        for block in &blocks[..=8] {
            assert!(block_store.cemented().is_cemented(&block.hash));
        }
        chain.check_invariants().unwrap();
    }

    #[test]
    fn reopen_preserves_the_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let head_hash;
        {
            let store =
                Store::init(&store_config(dir.path(), 4096), config.clone(), Some(&genesis))
                    .unwrap();
            let chain = store.chain().clone();
            let a = child_block(&genesis, 2, 0, 1);
            let b = child_block(&a, 2, 1, 1);
            for block in [&a, &b] {
                chain.store_block(block).unwrap();
                chain.set_head(block).unwrap();
            }
            head_hash = b.hash;
            store.close();
        }
        let store = Store::init(&store_config(dir.path(), 4096), config, None).unwrap();
        let chain = store.chain();
        assert_eq!(chain.current_head().hash, head_hash);
        assert_eq!(chain.checkpoint().level, 1);
        chain.check_invariants().unwrap();
    }

    #[test]
    fn rolling_store_cannot_widen_its_history() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Rolling { extra_cycles: Some(1) });
        {
            let store_config = StoreConfig {
                history_mode: HistoryMode::Rolling { extra_cycles: Some(1) },
                ..store_config(dir.path(), 4096)
            };
            Store::init(&store_config, config.clone(), Some(&genesis)).unwrap();
        }
        let widened = ChainConfig {
            history_mode: HistoryMode::Archive,
            ..config
        };
        assert!(matches!(
            Store::init(&store_config(dir.path(), 4096), widened, None),
            Err(Error::CannotSwitchHistoryMode { .. })
        ));
    }

    #[test]
    fn protocol_activations_and_forks_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let protocol = ProtocolHash::hash_bytes(b"proto-one");
        {
            let store =
                Store::init(&store_config(dir.path(), 4096), config.clone(), Some(&genesis))
                    .unwrap();
            let chain = store.chain();
            let a = child_block(&genesis, 2, 0, 1);
            chain.store_block(&a).unwrap();
            chain
                .activate_protocol(1, protocol, a.descriptor())
                .unwrap();
            chain
                .register_forked_chain(chain.chain_id(), a.hash)
                .unwrap();
        }
        let store = Store::init(&store_config(dir.path(), 4096), config, None).unwrap();
        let chain = store.chain();
        assert_eq!(chain.protocol_of_level(1), Some(protocol));
        assert_eq!(chain.protocol_of_level(2), None);
        assert_eq!(chain.forked_chains().len(), 1);
    }

    #[test]
    fn reorg_walk_finds_the_common_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let (config, genesis) = genesis_config(HistoryMode::Archive);
        let store = Store::init(&store_config(dir.path(), 4096), config, Some(&genesis)).unwrap();
        let chain = store.chain().clone();

        let a = child_block(&genesis, 2, 0, 1);
        let b = child_block(&a, 2, 0, 1);
        let c = child_block(&b, 2, 0, 1);
        let b2 = child_block(&a, 2, 0, 5);
        let c2 = child_block(&b2, 2, 0, 5);
        for block in [&a, &b, &c, &b2, &c2] {
            chain.store_block(block).unwrap();
        }

        let (ancestor, path) = chain.new_blocks(&c.descriptor(), &c2.descriptor()).unwrap();
        assert_eq!(ancestor, a.descriptor());
        assert_eq!(
            path.iter().map(|block| block.hash).collect::<Vec<_>>(),
            vec![b2.hash, c2.hash]
        );
    }
}
