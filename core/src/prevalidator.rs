//! The prevalidator: a worker that classifies operations on top of the
//! current head, advertises what applies, and replays its state across
//! head switches.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use parity_scale_codec::{Decode as _, Encode as _};
use tessera_actor::prelude::*;
use tessera_config::MempoolConfig;
use tessera_data_model::{Block, BlockHash, Mempool, Operation, OperationHash};
use tessera_logger::prelude::*;
use tessera_store::ChainState;
use tessera_validator::{InternalValidator, MempoolContext, OperationVerdict, ValidatorError};

use crate::{
    classification::{Classification, ClassificationStore},
    distributed_db::DistributedDb,
};

/// The per-chain mempool worker.
pub struct Prevalidator {
    config: MempoolConfig,
    chain: Arc<ChainState>,
    validator: Arc<InternalValidator>,
    ddb: Arc<dyn DistributedDb>,
    head: Block,
    validation_state: Box<dyn MempoolContext>,
    live_blocks: HashSet<BlockHash>,
    live_operations: HashSet<OperationHash>,
    classification: ClassificationStore,
    pending: VecDeque<(OperationHash, Operation)>,
    pending_set: HashSet<OperationHash>,
    fetching: HashSet<OperationHash>,
    /// Banned hashes, with the operation as last seen (so an unban can
    /// put it back in front of the classifier).
    banned: HashMap<OperationHash, Option<Operation>>,
    advert: Mempool,
    advert_scheduled: bool,
    batch_scheduled: bool,
}

impl Prevalidator {
    /// Build a prevalidator on the chain's current head.
    pub fn new(
        config: MempoolConfig,
        chain: Arc<ChainState>,
        validator: Arc<InternalValidator>,
        ddb: Arc<dyn DistributedDb>,
    ) -> Result<Self, ValidatorError> {
        let head = chain.current_head();
        let validation_state = validator.begin_construction(&head)?;
        let live_blocks = chain.live_blocks();
        let live_operations = chain.live_operations();
        Ok(Self {
            classification: ClassificationStore::new(config.max_refused_operations),
            config,
            chain,
            validator,
            ddb,
            head,
            validation_state,
            live_blocks,
            live_operations,
            pending: VecDeque::new(),
            pending_set: HashSet::new(),
            fetching: HashSet::new(),
            banned: HashMap::new(),
            advert: Mempool::empty(),
            advert_scheduled: false,
            batch_scheduled: false,
        })
    }

    fn is_handled(&self, hash: &OperationHash) -> bool {
        self.classification.is_known(hash)
            || self.pending_set.contains(hash)
            || self.banned.contains_key(hash)
    }

    fn enqueue_pending(&mut self, hash: OperationHash, operation: Operation) {
        if self.pending_set.insert(hash) {
            self.pending.push_back((hash, operation));
        }
    }

    fn schedule_batch(&mut self, ctx: &Context<Self>) {
        if !self.batch_scheduled && !self.pending.is_empty() {
            self.batch_scheduled = true;
            ctx.notify(ProcessBatch, std::time::Duration::ZERO);
        }
    }

    fn schedule_advert(&mut self, ctx: &Context<Self>) {
        if !self.advert_scheduled && !self.advert.is_empty() {
            self.advert_scheduled = true;
            ctx.notify(FlushAdvert, self.config.advertisement_delay);
        }
    }

    /// Classify one operation and record the verdict.
    fn classify_one(&mut self, hash: OperationHash, operation: Operation) {
        let verdict = self.validation_state.apply_operation(&operation);
        let ddb = Arc::clone(&self.ddb);
        let mut on_discard = move |evicted: OperationHash| ddb.clear_operation(&evicted);

        let classification = match verdict {
            OperationVerdict::Applied => {
                self.advert.known_valid.push(hash);
                Classification::Applied
            }
            OperationVerdict::BranchDelayed(errors) => Classification::BranchDelayed(errors),
            OperationVerdict::BranchRefused(errors) => Classification::BranchRefused(errors),
            OperationVerdict::Refused(errors) => Classification::Refused(errors),
            OperationVerdict::Outdated(errors) => {
                // Peers are no longer asked about outdated operations.
                self.ddb.clear_operation(&hash);
                Classification::Outdated(errors)
            }
        };
        self.classification
            .classify(hash, operation, classification, &mut on_discard);
    }

    /// Replay the mempool onto a new head.
    fn flush(
        &mut self,
        new_head: Block,
        is_branch_switch: bool,
        new_live_blocks: HashSet<BlockHash>,
        new_live_operations: HashSet<OperationHash>,
    ) -> Result<(), ValidatorError> {
        let ddb = Arc::clone(&self.ddb);
        let mut on_discard = move |evicted: OperationHash| ddb.clear_operation(&evicted);
        let drained = self
            .classification
            .drain_for_flush(is_branch_switch, &mut on_discard);

        let mut candidates: HashMap<OperationHash, Operation> =
            drained.recycle_set().into_iter().collect();
        for (hash, operation) in self.pending.drain(..) {
            candidates.insert(hash, operation);
        }
        self.pending_set.clear();

        // Replay along the reorg path: reinject what the old branch
        // carried, drop what the new branch includes.
        let old_head = self.head.descriptor();
        let new_descriptor = new_head.descriptor();
        if old_head.hash != new_descriptor.hash {
            match self.chain.new_blocks(&new_descriptor, &old_head) {
                Ok((_, rolled_back)) => {
                    for block in rolled_back {
                        for operation in block.operations.into_iter().flatten() {
                            candidates.insert(operation.hash(), operation);
                        }
                    }
                }
                Err(error) => debug!(%error, "could not walk the abandoned branch"),
            }
            match self.chain.new_blocks(&old_head, &new_descriptor) {
                Ok((_, adopted)) => {
                    for block in adopted {
                        for hash in block.operation_hashes() {
                            candidates.remove(&hash);
                        }
                    }
                }
                Err(error) => debug!(%error, "could not walk the adopted branch"),
            }
        }

        // Dead branches and already-included operations are not worth
        // keeping.
        candidates.retain(|hash, operation| {
            new_live_blocks.contains(&operation.branch) && !new_live_operations.contains(hash)
        });

        self.validation_state = self.validator.begin_construction(&new_head)?;
        self.head = new_head;
        self.live_blocks = new_live_blocks;
        self.live_operations = new_live_operations;
        for (hash, operation) in candidates {
            self.enqueue_pending(hash, operation);
        }
        info!(
            head = %self.head.hash,
            pending = self.pending.len(),
            "mempool flushed onto the new head"
        );
        Ok(())
    }
}

/// An operation arrived (from a peer fetch or a reinjection).
pub struct Arrived {
    /// Announced hash.
    pub hash: OperationHash,
    /// Raw operation bytes.
    pub bytes: Vec<u8>,
}
impl Message for Arrived {
    type Result = ();
}

/// A peer advertised its mempool alongside a head.
pub struct PeerAdvert {
    /// The advertised mempool.
    pub mempool: Mempool,
}
impl Message for PeerAdvert {
    type Result = ();
}

/// Locally inject an operation.
pub struct Inject {
    /// The operation.
    pub operation: Operation,
    /// Enqueue even when the trial application fails.
    pub force: bool,
}
impl Message for Inject {
    type Result = Result<(), Vec<String>>;
}

/// Classify the next batch of pending operations.
#[derive(Default)]
pub struct ProcessBatch;
impl Message for ProcessBatch {
    type Result = ();
}

/// Flush the debounced advertisement buffer.
pub struct FlushAdvert;
impl Message for FlushAdvert {
    type Result = ();
}

/// The chain validator switched heads.
pub struct HeadSwitch {
    /// The new head, with metadata.
    pub new_head: Block,
    /// Whether the switch left the previous branch.
    pub is_branch_switch: bool,
    /// Live blocks of the new head.
    pub live_blocks: HashSet<BlockHash>,
    /// Live operations of the new head.
    pub live_operations: HashSet<OperationHash>,
}
impl Message for HeadSwitch {
    type Result = ();
}

/// Ban an operation hash.
pub struct Ban(pub OperationHash);
impl Message for Ban {
    type Result = ();
}

/// Lift a ban.
pub struct Unban(pub OperationHash);
impl Message for Unban {
    type Result = ();
}

/// A fetch gave up; the hash may be requested again later.
pub struct FetchFailed(pub OperationHash);
impl Message for FetchFailed {
    type Result = ();
}

/// Observable state of the mempool, for the RPC surface and tests.
#[derive(Clone, Debug)]
pub struct MempoolSnapshot {
    pub applied: Vec<OperationHash>,
    pub prechecked: Vec<OperationHash>,
    pub branch_delayed: Vec<OperationHash>,
    pub branch_refused: Vec<OperationHash>,
    pub refused: Vec<OperationHash>,
    pub outdated: Vec<OperationHash>,
    pub unparsable: Vec<OperationHash>,
    pub pending: Vec<OperationHash>,
    pub banned: Vec<OperationHash>,
    pub in_mempool_count: usize,
}

/// Request a snapshot.
pub struct GetSnapshot;
impl Message for GetSnapshot {
    type Result = MempoolSnapshot;
}

#[async_trait::async_trait]
impl Actor for Prevalidator {
    async fn on_start(&mut self, _ctx: &mut Context<Self>) {
        info!(head = %self.head.hash, "prevalidator started");
    }
}

#[async_trait::async_trait]
impl ContextHandler<Arrived> for Prevalidator {
    async fn handle(&mut self, ctx: &mut Context<Self>, Arrived { hash, bytes }: Arrived) {
        self.fetching.remove(&hash);
        if self.banned.contains_key(&hash) {
            self.ddb.clear_operation(&hash);
            return;
        }
        if self.is_handled(&hash) {
            return;
        }
        let Ok(operation) = Operation::decode(&mut bytes.as_slice()) else {
            debug!(%hash, "operation bytes do not decode");
            self.classification.mark_unparsable(hash);
            return;
        };
        if operation.hash() != hash {
            warn!(%hash, "operation bytes do not match their announced hash");
            return;
        }
        if self.live_operations.contains(&hash) {
            // Already included in a live block.
            self.ddb.clear_operation(&hash);
            return;
        }
        if !self.live_blocks.contains(&operation.branch) {
            self.ddb.clear_operation(&hash);
            return;
        }
        self.enqueue_pending(hash, operation);
        self.schedule_batch(ctx);
    }
}

#[async_trait::async_trait]
impl ContextHandler<PeerAdvert> for Prevalidator {
    async fn handle(&mut self, ctx: &mut Context<Self>, PeerAdvert { mempool }: PeerAdvert) {
        let candidates = mempool
            .known_valid
            .into_iter()
            .chain(mempool.pending.into_iter());
        for hash in candidates {
            if self.is_handled(&hash) || !self.fetching.insert(hash) {
                continue;
            }
            let ddb = Arc::clone(&self.ddb);
            let addr = ctx.addr();
            let timeout = self.config.operation_timeout;
            tokio::spawn(async move {
                match ddb.fetch_operation(hash, timeout).await {
                    Ok(bytes) => addr.do_send(Arrived { hash, bytes }).await,
                    Err(error) => {
                        debug!(%error, "operation fetch failed");
                        addr.do_send(FetchFailed(hash)).await;
                    }
                }
            });
        }
    }
}

#[async_trait::async_trait]
impl Handler<FetchFailed> for Prevalidator {
    async fn handle(&mut self, FetchFailed(hash): FetchFailed) {
        self.fetching.remove(&hash);
    }
}

#[async_trait::async_trait]
impl ContextHandler<Inject> for Prevalidator {
    async fn handle(
        &mut self,
        ctx: &mut Context<Self>,
        Inject { operation, force }: Inject,
    ) -> Result<(), Vec<String>> {
        let hash = operation.hash();
        if self.banned.contains_key(&hash) {
            return Err(vec![format!("operation {hash} is banned")]);
        }
        if self.is_handled(&hash) {
            return Ok(());
        }

        // Trial application against the current state decides whether
        // the injection is accepted at all.
        let verdict = self.validation_state.apply_operation(&operation);
        match verdict {
            OperationVerdict::Applied => {
                self.ddb.inject_operation(hash, operation.encode());
                self.enqueue_pending(hash, operation);
                self.schedule_batch(ctx);
                Ok(())
            }
            OperationVerdict::BranchDelayed(errors)
            | OperationVerdict::BranchRefused(errors)
            | OperationVerdict::Refused(errors)
            | OperationVerdict::Outdated(errors) => {
                if force {
                    self.enqueue_pending(hash, operation);
                    self.schedule_batch(ctx);
                    Ok(())
                } else {
                    Err(errors)
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ContextHandler<ProcessBatch> for Prevalidator {
    async fn handle(&mut self, ctx: &mut Context<Self>, ProcessBatch: ProcessBatch) {
        self.batch_scheduled = false;
        for _ in 0..self.config.operations_batch_size {
            let Some((hash, operation)) = self.pending.pop_front() else {
                break;
            };
            self.pending_set.remove(&hash);
            if self.banned.contains_key(&hash) || self.classification.is_known(&hash) {
                continue;
            }
            self.classify_one(hash, operation);
        }
        self.schedule_batch(ctx);
        self.schedule_advert(ctx);
    }
}

#[async_trait::async_trait]
impl Handler<FlushAdvert> for Prevalidator {
    async fn handle(&mut self, FlushAdvert: FlushAdvert) {
        self.advert_scheduled = false;
        if self.advert.is_empty() {
            return;
        }
        let advert = std::mem::take(&mut self.advert);
        self.ddb.advertise_mempool(self.head.hash, advert).await;
    }
}

#[async_trait::async_trait]
impl ContextHandler<HeadSwitch> for Prevalidator {
    async fn handle(
        &mut self,
        ctx: &mut Context<Self>,
        HeadSwitch {
            new_head,
            is_branch_switch,
            live_blocks,
            live_operations,
        }: HeadSwitch,
    ) {
        if let Err(error) = self.flush(new_head, is_branch_switch, live_blocks, live_operations) {
            error!(%error, "mempool flush failed");
            return;
        }
        self.schedule_batch(ctx);
    }
}

#[async_trait::async_trait]
impl ContextHandler<Ban> for Prevalidator {
    async fn handle(&mut self, ctx: &mut Context<Self>, Ban(hash): Ban) {
        self.ddb.clear_operation(&hash);
        self.fetching.remove(&hash);

        let mut last_seen = None;
        if self.pending_set.remove(&hash) {
            if let Some(position) = self.pending.iter().position(|(h, _)| *h == hash) {
                last_seen = self.pending.remove(position).map(|(_, op)| op);
            }
        }
        let removed = self.classification.remove(&hash);
        let was_applied = matches!(removed, Some((_, Classification::Applied)));
        if let Some((operation, _)) = removed {
            last_seen = Some(operation);
        }
        self.advert.known_valid.retain(|h| *h != hash);
        self.banned.insert(hash, last_seen);

        if was_applied {
            // Everything classified after the banned operation may have
            // depended on it: reclassify the whole mempool on the same
            // head.
            let head = self.head.clone();
            let live_blocks = self.live_blocks.clone();
            let live_operations = self.live_operations.clone();
            if let Err(error) = self.flush(head, false, live_blocks, live_operations) {
                error!(%error, "mempool flush after ban failed");
            }
            self.schedule_batch(ctx);
        }
    }
}

#[async_trait::async_trait]
impl ContextHandler<Unban> for Prevalidator {
    async fn handle(&mut self, ctx: &mut Context<Self>, Unban(hash): Unban) {
        if let Some(last_seen) = self.banned.remove(&hash) {
            if let Some(operation) = last_seen {
                self.enqueue_pending(hash, operation);
                self.schedule_batch(ctx);
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler<GetSnapshot> for Prevalidator {
    async fn handle(&mut self, GetSnapshot: GetSnapshot) -> MempoolSnapshot {
        MempoolSnapshot {
            applied: self
                .classification
                .applied()
                .iter()
                .map(|(hash, _)| *hash)
                .collect(),
            prechecked: self.classification.prechecked_hashes(),
            branch_delayed: self.classification.branch_delayed_hashes(),
            branch_refused: self.classification.branch_refused_hashes(),
            refused: self.classification.refused_hashes(),
            outdated: self.classification.outdated_hashes(),
            unparsable: self.classification.unparsable_hashes(),
            pending: self.pending.iter().map(|(hash, _)| *hash).collect(),
            banned: self.banned.keys().copied().collect(),
            in_mempool_count: self.classification.in_mempool_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tessera_config::StoreConfig;
    use tessera_data_model::{
        test_support::metadata_with_ttl, BlockHeader, ChainConfig, ContextHash, Genesis,
        HistoryMode, OperationListListHash, ProtocolHash,
    };
    use tessera_store::Store;
    use tessera_validator::{GenesisEngine, InMemoryContextIndex, ProtocolRegistry};

    use crate::distributed_db::InMemoryDdb;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        chain: Arc<ChainState>,
        ddb: Arc<InMemoryDdb>,
        addr: Addr<Prevalidator>,
        genesis: Block,
    }

    use tessera_actor::Addr;

    fn genesis_setup() -> (ChainConfig, Block) {
        let header = BlockHeader {
            level: 0,
            proto_level: 0,
            predecessor: BlockHash::zero(),
            timestamp: 1_600_000_000,
            validation_passes: 0,
            operations_hash: OperationListListHash::zero(),
            fitness: Vec::new(),
            context: ContextHash::hash_bytes(b"mempool-genesis-context"),
            protocol_data: Vec::new(),
        };
        let hash = header.hash();
        let genesis_block = Block {
            hash,
            header,
            operations: Vec::new(),
            block_metadata_hash: None,
            operations_metadata_hashes: None,
            metadata: Some(metadata_with_ttl(2, 0)),
        };
        let config = ChainConfig {
            genesis: Genesis {
                time: 1_600_000_000,
                block: hash,
                protocol: ProtocolHash::hash_bytes(b"proto-genesis"),
            },
            expiration: None,
            history_mode: HistoryMode::Archive,
        };
        (config, genesis_block)
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (chain_config, genesis) = genesis_setup();
        let store = Store::init(
            &StoreConfig {
                store_dir: dir.path().to_path_buf(),
                history_mode: HistoryMode::Archive,
                blocks_per_cycle: 4096,
                index_write_buffer: 10_000,
            },
            chain_config.clone(),
            Some(&genesis),
        )
        .unwrap();
        let chain = store.chain().clone();

        let mut registry = ProtocolRegistry::new();
        let engine = Arc::new(GenesisEngine::new());
        registry.register(0, engine.clone());
        registry.register(1, engine);
        let validator = Arc::new(InternalValidator::new(
            registry,
            Arc::new(InMemoryContextIndex::default()),
            chain_config.genesis,
        ));
        let ddb = Arc::new(InMemoryDdb::default());

        let prevalidator = Prevalidator::new(
            MempoolConfig {
                advertisement_delay: Duration::from_millis(20),
                ..MempoolConfig::default()
            },
            Arc::clone(&chain),
            validator,
            ddb.clone(),
        )
        .unwrap();
        let addr = prevalidator.start().await;
        Fixture {
            _dir: dir,
            chain,
            ddb,
            addr,
            genesis,
        }
    }

    fn operation(branch: BlockHash, tag: u8) -> (OperationHash, Operation, Vec<u8>) {
        let operation = Operation {
            branch,
            proto: vec![tag, 0xaa],
        };
        (operation.hash(), operation.clone(), operation.encode())
    }

    #[tokio::test]
    async fn classification_fills_disjoint_buckets() {
        let fx = fixture().await;
        let branch = fx.genesis.hash;

        let (h_applied, _, bytes_applied) = operation(branch, 0);
        let (h_delayed, _, bytes_delayed) = operation(branch, 1);
        let (h_refused, _, bytes_refused) = operation(branch, 3);
        let h_unparsable = OperationHash::hash_bytes(b"garbage");

        for (hash, bytes) in [
            (h_applied, bytes_applied),
            (h_delayed, bytes_delayed),
            (h_refused, bytes_refused),
            (h_unparsable, vec![0xde, 0xad]),
        ] {
            fx.addr.do_send(Arrived { hash, bytes }).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = fx.addr.send(GetSnapshot).await.unwrap();
        assert_eq!(snapshot.applied, vec![h_applied]);
        assert_eq!(snapshot.branch_delayed, vec![h_delayed]);
        assert_eq!(snapshot.refused, vec![h_refused]);
        assert_eq!(snapshot.unparsable, vec![h_unparsable]);
        assert_eq!(snapshot.in_mempool_count, 3);
        assert!(snapshot.pending.is_empty());
    }

    #[tokio::test]
    async fn dead_branch_operations_are_dropped() {
        let fx = fixture().await;
        let (hash, _, bytes) = operation(BlockHash::hash_bytes(b"unknown-branch"), 0);
        fx.addr.do_send(Arrived { hash, bytes }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = fx.addr.send(GetSnapshot).await.unwrap();
        assert_eq!(snapshot.in_mempool_count, 0);
        assert!(fx.ddb.was_cleared(&hash));
    }

    #[tokio::test]
    async fn banning_an_applied_operation_reclassifies_the_rest() {
        let fx = fixture().await;
        let branch = fx.genesis.hash;

        let (h_applied, _, bytes_applied) = operation(branch, 0);
        let (h_applied2, _, bytes_applied2) = operation(branch, 5);
        let (h_delayed, _, bytes_delayed) = operation(branch, 1);
        let (h_refused, _, bytes_refused) = operation(branch, 3);
        for (hash, bytes) in [
            (h_applied, bytes_applied),
            (h_applied2, bytes_applied2),
            (h_delayed, bytes_delayed),
            (h_refused, bytes_refused),
        ] {
            fx.addr.do_send(Arrived { hash, bytes }).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.addr.do_send(Ban(h_applied)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = fx.addr.send(GetSnapshot).await.unwrap();
        // The banned operation is gone everywhere and forgotten by the
        // network layer.
        assert!(!snapshot.applied.contains(&h_applied));
        assert!(fx.ddb.was_cleared(&h_applied));
        assert_eq!(snapshot.banned, vec![h_applied]);
        // The surviving applied operation was reclassified onto the
        // same head.
        assert_eq!(snapshot.applied, vec![h_applied2]);
        // The flush dropped the branch-delayed bucket outright.
        assert!(snapshot.branch_delayed.is_empty());
        // Refused verdicts survive a flush.
        assert_eq!(snapshot.refused, vec![h_refused]);

        // Unbanning restores the operation through the pending path.
        fx.addr.do_send(Unban(h_applied)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = fx.addr.send(GetSnapshot).await.unwrap();
        assert!(snapshot.applied.contains(&h_applied));
    }

    #[tokio::test]
    async fn adverts_are_debounced_into_one_broadcast() {
        let fx = fixture().await;
        let branch = fx.genesis.hash;

        let (h1, _, b1) = operation(branch, 0);
        let (h2, _, b2) = operation(branch, 5);
        fx.addr.do_send(Arrived { hash: h1, bytes: b1 }).await;
        fx.addr.do_send(Arrived { hash: h2, bytes: b2 }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let adverts = fx.ddb.adverts();
        assert_eq!(adverts.len(), 1, "one debounced CurrentHead broadcast");
        let (head, mempool) = &adverts[0];
        assert_eq!(*head, fx.genesis.hash);
        assert_eq!(mempool.known_valid, vec![h1, h2]);
    }

    #[tokio::test]
    async fn peer_advert_triggers_fetch_and_classification() {
        let fx = fixture().await;
        let branch = fx.genesis.hash;
        let (hash, _, bytes) = operation(branch, 0);
        fx.ddb.seed_operation(hash, bytes);

        fx.addr
            .do_send(PeerAdvert {
                mempool: Mempool {
                    known_valid: vec![hash],
                    pending: Default::default(),
                },
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = fx.addr.send(GetSnapshot).await.unwrap();
        assert_eq!(snapshot.applied, vec![hash]);
    }

    #[tokio::test]
    async fn injection_rejects_refused_operations_unless_forced() {
        let fx = fixture().await;
        let branch = fx.genesis.hash;

        let (_, refused_op, _) = operation(branch, 3);
        let rejected = fx
            .addr
            .send(Inject {
                operation: refused_op.clone(),
                force: false,
            })
            .await
            .unwrap();
        assert!(rejected.is_err());

        let forced = fx
            .addr
            .send(Inject {
                operation: refused_op,
                force: true,
            })
            .await
            .unwrap();
        assert!(forced.is_ok());

        let (_, applied_op, _) = operation(branch, 0);
        let injected_hash = applied_op.hash();
        fx.addr
            .send(Inject {
                operation: applied_op,
                force: false,
            })
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = fx.addr.send(GetSnapshot).await.unwrap();
        assert!(snapshot.applied.contains(&injected_hash));
    }

    #[tokio::test]
    async fn head_switch_recycles_applied_operations() {
        let fx = fixture().await;
        let branch = fx.genesis.hash;

        let (hash, _, bytes) = operation(branch, 0);
        fx.addr.do_send(Arrived { hash, bytes }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Advance the chain by one block that does not include the
        // operation.
        let header = BlockHeader {
            level: 1,
            proto_level: 1,
            predecessor: fx.genesis.hash,
            timestamp: fx.genesis.header.timestamp + 30,
            validation_passes: 1,
            operations_hash: OperationListListHash::zero(),
            fitness: vec![vec![1]],
            context: ContextHash::hash_bytes(b"ctx-1"),
            protocol_data: Vec::new(),
        };
        let block = Block {
            hash: header.hash(),
            header,
            operations: vec![Vec::new()],
            block_metadata_hash: None,
            operations_metadata_hashes: None,
            metadata: Some(metadata_with_ttl(2, 0)),
        };
        fx.chain.store_block(&block).unwrap();
        fx.chain.set_head(&block).unwrap();

        fx.addr
            .do_send(HeadSwitch {
                new_head: block.clone(),
                is_branch_switch: false,
                live_blocks: fx.chain.live_blocks(),
                live_operations: fx.chain.live_operations(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = fx.addr.send(GetSnapshot).await.unwrap();
        // Still applied, now on top of the new head.
        assert_eq!(snapshot.applied, vec![hash]);
        assert_eq!(snapshot.in_mempool_count, 1);
    }
}
