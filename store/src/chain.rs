//! Persistent chain state: the pointer cells (`current_head`,
//! `checkpoint`, `savepoint`, `caboose`, …), the live-blocks window and
//! the head-switch state machine.
//!
//! All mutation goes through one exclusive section; readers are
//! serialised only against writers. A successful head switch is
//! linearisable: once it returns, every reader observes the new head,
//! checkpoint, alternate heads and target together.

use std::{
    cell::Cell,
    collections::{BTreeMap, HashSet},
    path::Path,
    sync::Arc,
};

use parity_scale_codec::{Decode, Encode};
use parking_lot::RwLock;
use tessera_data_model::{
    Block, BlockDescriptor, BlockHash, ChainConfig, ChainId, OperationHash, ProtocolHash,
    ProtocolLevelEntry,
};
use tessera_logger::prelude::*;
use tokio::sync::broadcast;

use crate::{
    block_store::{BlockStore, MergeParams, MergeStatus},
    cell::DataCell,
    error::{Error, Result},
    live::LiveWindow,
};

/// A block recorded as invalid, until the checkpoint passes it.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct InvalidBlockEntry {
    /// Level of the invalid block.
    pub level: i32,
    /// The validation errors, rendered.
    pub errors: Vec<String>,
}

struct Cells {
    chain_config: DataCell<ChainConfig>,
    genesis_block: DataCell<Block>,
    current_head: DataCell<BlockDescriptor>,
    alternate_heads: DataCell<Vec<BlockDescriptor>>,
    checkpoint: DataCell<BlockDescriptor>,
    cementing_highwatermark: DataCell<i32>,
    target: DataCell<BlockDescriptor>,
    savepoint: DataCell<BlockDescriptor>,
    caboose: DataCell<BlockDescriptor>,
    protocol_levels: DataCell<BTreeMap<u8, ProtocolLevelEntry>>,
    invalid_blocks: DataCell<BTreeMap<BlockHash, InvalidBlockEntry>>,
    forked_chains: DataCell<BTreeMap<ChainId, BlockHash>>,
}

impl Cells {
    fn bind(dir: &Path) -> Self {
        Self {
            chain_config: DataCell::new(dir, "chain_config"),
            genesis_block: DataCell::new(dir, "genesis_block"),
            current_head: DataCell::new(dir, "current_head"),
            alternate_heads: DataCell::new(dir, "alternate_heads"),
            checkpoint: DataCell::new(dir, "checkpoint"),
            cementing_highwatermark: DataCell::new(dir, "cementing_highwatermark"),
            target: DataCell::new(dir, "target"),
            savepoint: DataCell::new(dir, "savepoint"),
            caboose: DataCell::new(dir, "caboose"),
            protocol_levels: DataCell::new(dir, "protocol_levels"),
            invalid_blocks: DataCell::new(dir, "invalid_blocks"),
            forked_chains: DataCell::new(dir, "forked_chains"),
        }
    }
}

struct Inner {
    current_head: Block,
    alternate_heads: Vec<BlockDescriptor>,
    checkpoint: BlockDescriptor,
    target: Option<BlockDescriptor>,
    savepoint: BlockDescriptor,
    caboose: BlockDescriptor,
    cementing_highwatermark: Option<i32>,
    invalid_blocks: BTreeMap<BlockHash, InvalidBlockEntry>,
    protocol_levels: BTreeMap<u8, ProtocolLevelEntry>,
    forked_chains: BTreeMap<ChainId, BlockHash>,
    live: LiveWindow,
}

thread_local! {
    static WRITE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// The shared mutable state of one chain.
pub struct ChainState {
    chain_id: ChainId,
    config: ChainConfig,
    is_testchain: bool,
    block_store: Arc<BlockStore>,
    cells: Cells,
    inner: RwLock<Inner>,
    head_events: broadcast::Sender<BlockDescriptor>,
}

impl ChainState {
    /// Create a fresh chain around its genesis block. The genesis must
    /// carry metadata (produced by committing genesis through the
    /// validator).
    pub fn create(
        chain_dir: &Path,
        config: ChainConfig,
        genesis_block: &Block,
        block_store: Arc<BlockStore>,
    ) -> Result<Arc<Self>> {
        let metadata = genesis_block
            .metadata
            .as_ref()
            .ok_or_else(|| Error::BadHeadInvariant(genesis_block.descriptor()))?;
        if genesis_block.hash != config.genesis.block {
            return Err(Error::InconsistentGenesis {
                expected: config.genesis.block,
                got: genesis_block.hash,
            });
        }

        let cells = Cells::bind(chain_dir);
        let genesis_descriptor = genesis_block.descriptor();
        cells.chain_config.store(&config)?;
        cells.genesis_block.store(genesis_block)?;
        cells.current_head.store(&genesis_descriptor)?;
        cells.alternate_heads.store(&Vec::new())?;
        cells.checkpoint.store(&genesis_descriptor)?;
        cells.savepoint.store(&genesis_descriptor)?;
        cells.caboose.store(&genesis_descriptor)?;
        cells.protocol_levels.store(&BTreeMap::new())?;
        cells.invalid_blocks.store(&BTreeMap::new())?;
        cells.forked_chains.store(&BTreeMap::new())?;

        block_store.store_block(genesis_block)?;

        let mut live = LiveWindow::new(usize::from(metadata.max_operations_ttl) + 1);
        live.push_head(genesis_block);

        let chain_id = ChainId::from_block_hash(&config.genesis.block);
        let is_testchain = config.expiration.is_some();
        let (head_events, _) = broadcast::channel(128);
        Ok(Arc::new(Self {
            chain_id,
            config,
            is_testchain,
            block_store,
            cells,
            inner: RwLock::new(Inner {
                current_head: genesis_block.clone(),
                alternate_heads: Vec::new(),
                checkpoint: genesis_descriptor,
                target: None,
                savepoint: genesis_descriptor,
                caboose: genesis_descriptor,
                cementing_highwatermark: None,
                invalid_blocks: BTreeMap::new(),
                protocol_levels: BTreeMap::new(),
                forked_chains: BTreeMap::new(),
                live,
            }),
            head_events,
        }))
    }

    /// Reopen an existing chain, verifying genesis and history mode.
    pub fn open(
        chain_dir: &Path,
        requested: &ChainConfig,
        block_store: Arc<BlockStore>,
    ) -> Result<Arc<Self>> {
        let cells = Cells::bind(chain_dir);
        let stored_config = cells
            .chain_config
            .load()?
            .ok_or_else(|| Error::CorruptedStore("chain_config cell is missing".to_owned()))?;
        if stored_config.genesis.block != requested.genesis.block {
            return Err(Error::InconsistentGenesis {
                expected: requested.genesis.block,
                got: stored_config.genesis.block,
            });
        }
        if !stored_config
            .history_mode
            .can_switch_to(&requested.history_mode)
        {
            return Err(Error::CannotSwitchHistoryMode {
                previous: stored_config.history_mode,
                next: requested.history_mode,
            });
        }
        let config = ChainConfig {
            history_mode: requested.history_mode,
            ..stored_config
        };
        if config.history_mode != stored_config.history_mode {
            cells.chain_config.store(&config)?;
        }

        let genesis_block = cells
            .genesis_block
            .load()?
            .ok_or_else(|| Error::CorruptedStore("genesis_block cell is missing".to_owned()))?;
        if genesis_block.hash != config.genesis.block {
            return Err(Error::InconsistentGenesis {
                expected: config.genesis.block,
                got: genesis_block.hash,
            });
        }

        let head_descriptor = cells
            .current_head
            .load()?
            .ok_or_else(|| Error::CorruptedStore("current_head cell is missing".to_owned()))?;
        let current_head = block_store
            .read_block(&head_descriptor.hash, true)?
            .ok_or_else(|| Error::CorruptedStore("current head is not stored".to_owned()))?;

        let genesis_descriptor = genesis_block.descriptor();
        let checkpoint = cells.checkpoint.load()?.unwrap_or(genesis_descriptor);
        // Gauges are re-derived from the tiers when their cells are
        // missing (fresh snapshot imports).
        let savepoint = match cells.savepoint.load()? {
            Some(savepoint) => savepoint,
            None => genesis_descriptor,
        };
        let caboose = match cells.caboose.load()? {
            Some(caboose) => caboose,
            None => genesis_descriptor,
        };

        let ttl = current_head
            .metadata
            .as_ref()
            .map_or(0, |metadata| metadata.max_operations_ttl);
        let mut live = LiveWindow::new(usize::from(ttl) + 1);
        rebuild_live_window(&block_store, &mut live, &current_head, usize::from(ttl) + 1)?;

        let is_testchain = config.expiration.is_some();
        let (head_events, _) = broadcast::channel(128);
        Ok(Arc::new(Self {
            chain_id: ChainId::from_block_hash(&config.genesis.block),
            config,
            is_testchain,
            block_store,
            inner: RwLock::new(Inner {
                current_head,
                alternate_heads: cells.alternate_heads.load()?.unwrap_or_default(),
                checkpoint,
                target: cells.target.load()?,
                savepoint,
                caboose,
                cementing_highwatermark: cells.cementing_highwatermark.load()?,
                invalid_blocks: cells.invalid_blocks.load()?.unwrap_or_default(),
                protocol_levels: cells.protocol_levels.load()?.unwrap_or_default(),
                forked_chains: cells.forked_chains.load()?.unwrap_or_default(),
                live,
            }),
            cells,
            head_events,
        }))
    }

    /// Identifier of this chain.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// The chain configuration.
    #[must_use]
    pub fn chain_config(&self) -> &ChainConfig {
        &self.config
    }

    /// The underlying two-tier block store.
    #[must_use]
    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.block_store
    }

    /// Subscribe to head-switch events.
    #[must_use]
    pub fn subscribe_heads(&self) -> broadcast::Receiver<BlockDescriptor> {
        self.head_events.subscribe()
    }

    fn read<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        f(&self.inner.read())
    }

    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        WRITE_DEPTH.with(|depth| {
            debug_assert_eq!(
                depth.get(),
                0,
                "nested chain-state write section would deadlock"
            );
            depth.set(depth.get() + 1);
        });
        let result = {
            let mut inner = self.inner.write();
            f(&mut inner)
        };
        WRITE_DEPTH.with(|depth| depth.set(depth.get() - 1));
        result
    }

    /// The current head block.
    #[must_use]
    pub fn current_head(&self) -> Block {
        self.read(|inner| inner.current_head.clone())
    }

    /// The alternate heads.
    #[must_use]
    pub fn alternate_heads(&self) -> Vec<BlockDescriptor> {
        self.read(|inner| inner.alternate_heads.clone())
    }

    /// The checkpoint.
    #[must_use]
    pub fn checkpoint(&self) -> BlockDescriptor {
        self.read(|inner| inner.checkpoint)
    }

    /// The target, if one is set.
    #[must_use]
    pub fn target(&self) -> Option<BlockDescriptor> {
        self.read(|inner| inner.target)
    }

    /// The savepoint: earliest block with metadata.
    #[must_use]
    pub fn savepoint(&self) -> BlockDescriptor {
        self.read(|inner| inner.savepoint)
    }

    /// The caboose: earliest block retained at all.
    #[must_use]
    pub fn caboose(&self) -> BlockDescriptor {
        self.read(|inner| inner.caboose)
    }

    /// The cementing highwatermark.
    #[must_use]
    pub fn cementing_highwatermark(&self) -> Option<i32> {
        self.read(|inner| inner.cementing_highwatermark)
    }

    /// The recorded invalid blocks.
    #[must_use]
    pub fn invalid_blocks(&self) -> BTreeMap<BlockHash, InvalidBlockEntry> {
        self.read(|inner| inner.invalid_blocks.clone())
    }

    /// The protocol activation table.
    #[must_use]
    pub fn protocol_levels(&self) -> BTreeMap<u8, ProtocolLevelEntry> {
        self.read(|inner| inner.protocol_levels.clone())
    }

    /// The live blocks of the current head.
    #[must_use]
    pub fn live_blocks(&self) -> HashSet<BlockHash> {
        self.read(|inner| inner.live.live_blocks().clone())
    }

    /// The live operations of the current head.
    #[must_use]
    pub fn live_operations(&self) -> HashSet<OperationHash> {
        self.read(|inner| inner.live.live_operations().clone())
    }

    /// Whether a block at `(hash, level)` may be stored: above the
    /// checkpoint, and not conflicting with the target.
    #[must_use]
    pub fn is_acceptable_block(&self, hash: &BlockHash, level: i32) -> bool {
        self.read(|inner| {
            level > inner.checkpoint.level
                && inner
                    .target
                    .map_or(true, |target| level != target.level || *hash == target.hash)
        })
    }

    /// Declare an advisory target block the chain must include.
    pub fn set_target(&self, target: BlockDescriptor) -> Result<()> {
        self.update(|inner| {
            self.cells.target.store(&target)?;
            inner.target = Some(target);
            Ok(())
        })
    }

    /// Record a block as invalid. Only blocks above the checkpoint are
    /// recorded; anything below can never be proposed again anyway.
    pub fn mark_invalid_block(
        &self,
        hash: BlockHash,
        level: i32,
        errors: Vec<String>,
    ) -> Result<()> {
        self.update(|inner| {
            if level <= inner.checkpoint.level {
                return Ok(());
            }
            inner
                .invalid_blocks
                .insert(hash, InvalidBlockEntry { level, errors });
            self.cells.invalid_blocks.store(&inner.invalid_blocks)
        })
    }

    /// Record a protocol activation.
    pub fn activate_protocol(
        &self,
        proto_level: u8,
        protocol: ProtocolHash,
        activation_block: BlockDescriptor,
    ) -> Result<()> {
        self.update(|inner| {
            inner.protocol_levels.insert(
                proto_level,
                ProtocolLevelEntry {
                    activation_block,
                    protocol,
                    commit_info: None,
                },
            );
            self.cells.protocol_levels.store(&inner.protocol_levels)
        })
    }

    /// Protocol registered for `proto_level`.
    #[must_use]
    pub fn protocol_of_level(&self, proto_level: u8) -> Option<ProtocolHash> {
        self.read(|inner| {
            inner
                .protocol_levels
                .get(&proto_level)
                .map(|entry| entry.protocol)
        })
    }

    /// Record a forked test chain.
    pub fn register_forked_chain(&self, chain_id: ChainId, fork_block: BlockHash) -> Result<()> {
        self.update(|inner| {
            inner.forked_chains.insert(chain_id, fork_block);
            self.cells.forked_chains.store(&inner.forked_chains)
        })
    }

    /// The registered forked chains.
    #[must_use]
    pub fn forked_chains(&self) -> BTreeMap<ChainId, BlockHash> {
        self.read(|inner| inner.forked_chains.clone())
    }

    /// Store a validated block.
    ///
    /// Refused when the block would violate the checkpoint or the
    /// target, or is known invalid.
    pub fn store_block(&self, block: &Block) -> Result<()> {
        if self.read(|inner| inner.invalid_blocks.contains_key(&block.hash)) {
            return Err(Error::KnownInvalid(block.hash));
        }
        if !self.is_acceptable_block(&block.hash, block.level()) {
            return Err(Error::CheckpointError(block.descriptor()));
        }
        if self.block_store.mem(&block.hash) {
            return Ok(());
        }
        self.block_store.store_block(block)
    }

    /// Walk `from` and `to` back to their common ancestor.
    ///
    /// Returns the ancestor and the path from it to `to`, ancestor
    /// excluded, oldest first.
    pub fn new_blocks(
        &self,
        from: &BlockDescriptor,
        to: &BlockDescriptor,
    ) -> Result<(BlockDescriptor, Vec<Block>)> {
        let read = |hash: &BlockHash| -> Result<Block> {
            self.block_store
                .read_block(hash, false)?
                .ok_or(Error::BlockNotFound {
                    hash: *hash,
                    distance: 0,
                })
        };

        let mut left = read(&from.hash)?;
        let mut right = read(&to.hash)?;
        let mut path = Vec::new();

        while right.level() > left.level() {
            let predecessor = right.header.predecessor;
            path.push(right);
            right = read(&predecessor)?;
        }
        while left.level() > right.level() {
            let predecessor = left.header.predecessor;
            left = read(&predecessor)?;
        }
        while left.hash != right.hash {
            let right_predecessor = right.header.predecessor;
            path.push(right);
            right = read(&right_predecessor)?;
            left = read(&left.header.predecessor)?;
        }
        path.reverse();
        Ok((right.descriptor(), path))
    }

    /// Whether `ancestor` is an ancestor of (or equal to) `descendant`.
    fn is_ancestor(&self, ancestor: &BlockDescriptor, descendant: &BlockDescriptor) -> Result<bool> {
        if ancestor.level > descendant.level {
            return Ok(false);
        }
        let distance = descendant.level - ancestor.level;
        Ok(self.block_store.get_hash(&descendant.hash, distance)? == Some(ancestor.hash))
    }

    /// Switch the current head. See the contract in the module docs:
    /// checkpoint compatibility is enforced, the checkpoint may advance
    /// to the new head's last-allowed-fork level, a background merge
    /// may start, and the live window is updated. Returns `None` when
    /// the switch is a benign no-op (the given head is the current head
    /// or one of its ancestors), the previous head otherwise.
    pub fn set_head(self: &Arc<Self>, new_head: &Block) -> Result<Option<BlockDescriptor>> {
        let new_descriptor = new_head.descriptor();

        // A failed merge suspends cementing but not head updates.
        if let MergeStatus::Failed(reason) = self.block_store.get_merge_status() {
            warn!(%reason, "head switch while merging is suspended");
        }

        self.update(|inner| {
            // Checkpoint compatibility.
            if new_head.level() < inner.checkpoint.level
                || (new_head.level() == inner.checkpoint.level
                    && new_head.hash != inner.checkpoint.hash)
            {
                return Err(Error::InvalidHeadSwitch {
                    checkpoint_level: inner.checkpoint.level,
                    given_head: new_descriptor,
                });
            }

            // Benign race: the head moved past the candidate already.
            let previous_head = inner.current_head.descriptor();
            for known in std::iter::once(&previous_head).chain(inner.alternate_heads.iter()) {
                if self.is_ancestor(&new_descriptor, known)? {
                    return Ok(None);
                }
            }

            let metadata = new_head
                .metadata
                .as_ref()
                .ok_or(Error::BadHeadInvariant(new_descriptor))?;
            // Never commit to a head whose predecessor cannot be
            // checkpointed.
            if new_head.level() > 0
                && self
                    .block_store
                    .read_block_metadata(&new_head.header.predecessor)?
                    .is_none()
            {
                return Err(Error::BadHeadInvariant(new_descriptor));
            }

            let mut new_head_lafl = metadata.last_allowed_fork_level;
            if self.is_testchain && new_head_lafl < 0 {
                // A young test chain computes a fork level below its
                // own genesis; clamp it to the genesis level.
                new_head_lafl = 0;
            }

            // Bootstrap the highwatermark on snapshot-imported stores.
            if inner.cementing_highwatermark.is_none() && new_head_lafl >= inner.caboose.level {
                let bootstrap = self
                    .block_store
                    .cemented()
                    .highest_cemented_level()
                    .map_or(new_head_lafl, |highest| highest.max(new_head_lafl));
                self.cells.cementing_highwatermark.store(&bootstrap)?;
                inner.cementing_highwatermark = Some(bootstrap);
            }

            // Resolve the block at the last-allowed-fork level on the
            // new head's branch.
            let lafl_distance = new_head.level() - new_head_lafl;
            let lafl_block = if lafl_distance <= 0 {
                new_descriptor
            } else {
                match self.block_store.get_hash(&new_head.hash, lafl_distance)? {
                    Some(hash) => BlockDescriptor::new(hash, new_head_lafl),
                    None => inner.checkpoint,
                }
            };

            // Checkpoint promotion and target resolution.
            let previous_checkpoint = inner.checkpoint;
            let mut new_checkpoint = inner.checkpoint;
            if lafl_block.level > new_checkpoint.level {
                new_checkpoint = lafl_block;
            }
            if let Some(target) = inner.target {
                if new_head.level() >= target.level {
                    if !self.is_ancestor(&target, &new_descriptor)? {
                        return Err(Error::TargetMismatch {
                            target,
                            head: new_descriptor,
                        });
                    }
                    // Reached: the target has done its job.
                    inner.target = None;
                    self.cells.target.clear()?;
                }
            }

            // Decide on a merge before mutating the head.
            let should_merge = !self.block_store.merge_ongoing()
                && inner
                    .cementing_highwatermark
                    .is_some_and(|highwatermark| new_head_lafl > highwatermark);

            // Alternate-head bookkeeping: demote the old head on a
            // branch switch, drop alternates incompatible with the new
            // checkpoint.
            let switched_branch = !self.is_ancestor(&previous_head, &new_descriptor)?;
            if switched_branch {
                inner.alternate_heads.push(previous_head);
            }
            let mut retained_alternates = Vec::new();
            for alternate in inner.alternate_heads.drain(..) {
                if alternate.hash != new_head.hash
                    && alternate.level > new_checkpoint.level
                    && self.is_ancestor(&new_checkpoint, &alternate)?
                {
                    retained_alternates.push(alternate);
                }
            }
            inner.alternate_heads = retained_alternates;

            // Invalid blocks below the advanced checkpoint are moot.
            if new_checkpoint.level > previous_checkpoint.level {
                inner
                    .invalid_blocks
                    .retain(|_, entry| entry.level > new_checkpoint.level);
                self.cells.invalid_blocks.store(&inner.invalid_blocks)?;
            }

            // Persist, pointers first, then flip the in-memory view.
            inner.checkpoint = new_checkpoint;
            self.cells.checkpoint.store(&new_checkpoint)?;
            self.cells.current_head.store(&new_descriptor)?;
            self.cells.alternate_heads.store(&inner.alternate_heads)?;
            self.cells.target.store_opt(inner.target.as_ref())?;

            // Live window: O(1) when the new head extends the old one
            // and the TTL is unchanged, full rebuild otherwise.
            let capacity = usize::from(metadata.max_operations_ttl) + 1;
            if new_head.header.predecessor == previous_head.hash
                && capacity == inner.live.capacity()
            {
                inner.live.push_head(new_head);
            } else {
                rebuild_live_window(&self.block_store, &mut inner.live, new_head, capacity)?;
            }

            inner.current_head = new_head.clone();

            if should_merge {
                let state = Arc::downgrade(self);
                let highwatermark = inner
                    .cementing_highwatermark
                    .expect("INTERNAL BUG: merge decided without a highwatermark");
                self.block_store.merge_stores(MergeParams {
                    history_mode: self.config.history_mode,
                    from_highwatermark: highwatermark,
                    to_level: new_head_lafl,
                    final_hash: new_head.hash,
                    finalizer: Box::new(move |new_highest| {
                        if let Some(state) = state.upgrade() {
                            if let Err(error) = state.finalize_merge(new_highest) {
                                error!(%error, "failed to persist the merge outcome");
                            }
                        }
                    }),
                    on_error: Box::new(|error| {
                        error!(%error, "background merge failed");
                    }),
                })?;
            }

            info!(head = %new_descriptor, checkpoint = %new_checkpoint, "head switched");
            let _ = self.head_events.send(new_descriptor);
            Ok(Some(previous_head))
        })
    }

    /// Persist the outcome of a merge: the new highwatermark and the
    /// refreshed savepoint/caboose gauges.
    fn finalize_merge(&self, new_highest_cemented: i32) -> Result<()> {
        self.update(|inner| {
            inner.cementing_highwatermark = Some(new_highest_cemented);
            self.cells
                .cementing_highwatermark
                .store(&new_highest_cemented)?;

            if let Some((hash, level)) = self.block_store.caboose_gauge() {
                let caboose = BlockDescriptor::new(hash, level);
                inner.caboose = caboose;
                self.cells.caboose.store(&caboose)?;
            }
            if let Some(savepoint_level) = self.block_store.savepoint_gauge() {
                if let Some(hash) = self
                    .block_store
                    .cemented()
                    .get_cemented_block_hash(savepoint_level)
                {
                    let savepoint = BlockDescriptor::new(hash, savepoint_level);
                    inner.savepoint = savepoint;
                    self.cells.savepoint.store(&savepoint)?;
                }
            }
            Ok(())
        })
    }

    /// Check the global pointer ordering invariant.
    pub fn check_invariants(&self) -> Result<()> {
        self.read(|inner| {
            let ordered = inner.caboose.level <= inner.savepoint.level
                && inner.savepoint.level <= inner.checkpoint.level
                && inner
                    .cementing_highwatermark
                    .map_or(true, |highwatermark| highwatermark <= inner.checkpoint.level);
            if !ordered {
                return Err(Error::CorruptedStore(format!(
                    "pointer ordering violated: caboose {}, savepoint {}, checkpoint {}, highwatermark {:?}",
                    inner.caboose.level,
                    inner.savepoint.level,
                    inner.checkpoint.level,
                    inner.cementing_highwatermark,
                )));
            }
            if inner
                .invalid_blocks
                .values()
                .any(|entry| entry.level <= inner.checkpoint.level)
            {
                return Err(Error::CorruptedStore(
                    "invalid-blocks set reaches below the checkpoint".to_owned(),
                ));
            }
            Ok(())
        })
    }
}

fn rebuild_live_window(
    block_store: &BlockStore,
    live: &mut LiveWindow,
    head: &Block,
    capacity: usize,
) -> Result<()> {
    let mut tail = Vec::with_capacity(capacity);
    let mut cursor = head.clone();
    for _ in 0..capacity {
        let at_genesis = cursor.level() == 0;
        let predecessor = cursor.header.predecessor;
        tail.push(cursor);
        if at_genesis {
            break;
        }
        match block_store.read_block(&predecessor, false)? {
            Some(block) => cursor = block,
            None => break,
        }
    }
    tail.reverse();
    live.rebuild(capacity, tail.iter());
    Ok(())
}
