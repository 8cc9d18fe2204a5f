//! Composite block store: one logical view over the cemented and
//! floating tiers, plus the background merge that promotes floating
//! blocks into cemented cycles.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use fs2::FileExt as _;
use parking_lot::{Mutex, RwLock};
use tessera_data_model::{Block, BlockHash, BlockMetadata, HistoryMode};
use tessera_logger::prelude::*;

use crate::{
    cemented::CementedStore,
    error::{AddErrContextExt as _, Error, Result},
    floating::{FloatingKind, FloatingStore},
};

const FLOATING_DIR_NAME: &str = "floating_blocks";
const CEMENTED_DIR_NAME: &str = "cemented_blocks";
const LOCKFILE_NAME: &str = "lock";

/// Number of power-of-two back pointers stored per floating block.
const PREDECESSOR_LIST_LEN: u32 = 8;

/// State of the background merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeStatus {
    /// No merge is running.
    Idle,
    /// A merge is running in the background.
    Running,
    /// The last merge failed; merging is suspended until restart.
    Failed(String),
}

/// Everything a merge needs besides the store itself.
pub struct MergeParams {
    /// Retention policy applied after cementing.
    pub history_mode: HistoryMode,
    /// Highest level already cemented and accounted for, i.e. the
    /// cementing highwatermark at the time the merge was decided.
    pub from_highwatermark: i32,
    /// Level up to which the merge cements (the new head's
    /// last-allowed-fork level).
    pub to_level: i32,
    /// A block at or above `to_level` on the chain being cemented; the
    /// ancestor chain is resolved from it.
    pub final_hash: BlockHash,
    /// Invoked with the new highest cemented level once the merge has
    /// committed; persists the highwatermark under the chain lock.
    pub finalizer: Box<dyn FnOnce(i32) + Send>,
    /// Invoked when the merge fails, after the status turned sticky.
    pub on_error: Box<dyn FnOnce(&Error) + Send>,
}

/// The two-tier block store of one chain.
#[derive(Debug)]
pub struct BlockStore {
    chain_dir: PathBuf,
    floating_dir: PathBuf,
    cemented: Arc<CementedStore>,
    /// Read-only floating instances, oldest first. Usually one; two
    /// while a merge is consuming the frozen RW.
    ro_stores: RwLock<Vec<Arc<FloatingStore>>>,
    rw_store: RwLock<Arc<FloatingStore>>,
    merge_status: Arc<Mutex<MergeStatus>>,
    merge_thread: Mutex<Option<thread::JoinHandle<()>>>,
    blocks_per_cycle: u32,
}

impl BlockStore {
    /// Open (or create) the block store under `chain_dir`, recovering
    /// from an interrupted merge if one is found.
    pub fn open(chain_dir: &Path, blocks_per_cycle: u32, index_write_buffer: usize) -> Result<Arc<Self>> {
        let floating_dir = chain_dir.join(FLOATING_DIR_NAME);
        fs::create_dir_all(&floating_dir).add_err_context(&floating_dir)?;

        Self::recover_interrupted_merge(&floating_dir)?;

        let cemented = Arc::new(CementedStore::open(
            &chain_dir.join(CEMENTED_DIR_NAME),
            index_write_buffer,
            true,
        )?);
        let ro = Arc::new(FloatingStore::open(&floating_dir, FloatingKind::RO)?);
        let rw = Arc::new(FloatingStore::open(&floating_dir, FloatingKind::RW)?);

        Ok(Arc::new(Self {
            chain_dir: chain_dir.to_path_buf(),
            floating_dir,
            cemented,
            ro_stores: RwLock::new(vec![ro]),
            rw_store: RwLock::new(rw),
            merge_status: Arc::new(Mutex::new(MergeStatus::Idle)),
            merge_thread: Mutex::new(None),
            blocks_per_cycle: blocks_per_cycle.max(1),
        }))
    }

    /// Undo the visible traces of a merge that died between its swap
    /// steps. The pointer cells are authoritative; blocks are salvaged
    /// where the tier still has them.
    fn recover_interrupted_merge(floating_dir: &Path) -> Result<()> {
        let ro = floating_dir.join(FloatingKind::RO.dir_name());
        let ro_tmp = floating_dir.join(FloatingKind::RoTmp.dir_name());
        let rw = floating_dir.join(FloatingKind::RW.dir_name());
        let rw_tmp = floating_dir.join(FloatingKind::RwTmp.dir_name());

        if ro_tmp.exists() {
            if ro.exists() {
                // The rewrite never completed; the originals are intact.
                warn!("discarding partial floating rewrite left by an interrupted merge");
                fs::remove_dir_all(&ro_tmp).add_err_context(&ro_tmp)?;
            } else {
                warn!("completing interrupted floating swap");
                fs::rename(&ro_tmp, &ro).add_err_context(&ro)?;
            }
        }
        if rw_tmp.exists() {
            if rw.exists() {
                // Blocks accepted during the interrupted merge live in
                // the staging instance; fold them back.
                warn!("salvaging blocks from an interrupted merge staging instance");
                let staging = FloatingStore::open(floating_dir, FloatingKind::RwTmp)?;
                let target = FloatingStore::open(floating_dir, FloatingKind::RW)?;
                staging.iter_with_pred(|block, predecessors| {
                    if !target.mem(&block.hash) {
                        target.append_block(&block, predecessors.to_vec())?;
                    }
                    Ok(())
                })?;
                staging.delete()?;
            } else {
                fs::rename(&rw_tmp, &rw).add_err_context(&rw)?;
            }
        }
        Ok(())
    }

    /// The cemented tier.
    #[must_use]
    pub fn cemented(&self) -> &Arc<CementedStore> {
        &self.cemented
    }

    /// Path of the chain-wide advisory lockfile.
    #[must_use]
    pub fn lockfile_path(&self) -> PathBuf {
        self.chain_dir.join(LOCKFILE_NAME)
    }

    /// Current merge status. `Failed` is sticky until restart.
    #[must_use]
    pub fn get_merge_status(&self) -> MergeStatus {
        self.merge_status.lock().clone()
    }

    /// Whether a merge is currently running.
    #[must_use]
    pub fn merge_ongoing(&self) -> bool {
        matches!(self.get_merge_status(), MergeStatus::Running)
    }

    /// Whether any tier knows `hash`.
    #[must_use]
    pub fn mem(&self, hash: &BlockHash) -> bool {
        if self.rw_store.read().mem(hash) {
            return true;
        }
        if self.ro_stores.read().iter().rev().any(|store| store.mem(hash)) {
            return true;
        }
        self.cemented.is_cemented(hash)
    }

    /// Level of a stored block.
    #[must_use]
    pub fn level_of(&self, hash: &BlockHash) -> Option<i32> {
        if let Some(level) = self.rw_store.read().level_of(hash) {
            return Some(level);
        }
        for store in self.ro_stores.read().iter().rev() {
            if let Some(level) = store.level_of(hash) {
                return Some(level);
            }
        }
        self.cemented.get_cemented_block_level(hash)
    }

    /// Read a block by hash, floating tiers first.
    pub fn read_block(&self, hash: &BlockHash, read_metadata: bool) -> Result<Option<Block>> {
        if let Some(mut block) = self.rw_store.read().read_block_opt(hash)? {
            if !read_metadata {
                block.metadata = None;
            }
            return Ok(Some(block));
        }
        let ro_stores = self.ro_stores.read().clone();
        for store in ro_stores.iter().rev() {
            if let Some(mut block) = store.read_block_opt(hash)? {
                if !read_metadata {
                    block.metadata = None;
                }
                return Ok(Some(block));
            }
        }
        self.cemented.get_cemented_block_by_hash(hash, read_metadata)
    }

    /// Read the metadata of a block, if still available.
    pub fn read_block_metadata(&self, hash: &BlockHash) -> Result<Option<BlockMetadata>> {
        Ok(self.read_block(hash, true)?.and_then(|block| block.metadata))
    }

    /// Hash of the ancestor `distance` levels above `hash`.
    ///
    /// Uses the stored power-of-two predecessor lists over the floating
    /// tier and level arithmetic once the walk reaches the cemented
    /// tier.
    pub fn get_hash(&self, hash: &BlockHash, distance: i32) -> Result<Option<BlockHash>> {
        if distance < 0 {
            return Ok(None);
        }
        let mut current = *hash;
        let mut remaining = distance;
        loop {
            if remaining == 0 {
                return Ok(if self.mem(&current) { Some(current) } else { None });
            }
            if let Some(level) = self.cemented.get_cemented_block_level(&current) {
                return Ok(self.cemented.get_cemented_block_hash(level - remaining));
            }
            let predecessors = self.floating_predecessors(&current);
            let Some(predecessors) = predecessors else {
                return Ok(None);
            };
            if predecessors.is_empty() {
                return Ok(None);
            }
            // Largest stored power-of-two step not overshooting.
            let mut step_index = 0_u32;
            while step_index + 1 < predecessors.len() as u32
                && (1_i64 << (step_index + 1)) <= i64::from(remaining)
            {
                step_index += 1;
            }
            let next = predecessors[step_index as usize];
            if next == current {
                // Genesis points at itself; nothing above it.
                return Ok(None);
            }
            current = next;
            remaining -= 1 << step_index;
        }
    }

    /// Read the ancestor `distance` levels above `hash`.
    pub fn read_ancestor(
        &self,
        hash: &BlockHash,
        distance: i32,
        read_metadata: bool,
    ) -> Result<Option<Block>> {
        match self.get_hash(hash, distance)? {
            Some(ancestor) => self.read_block(&ancestor, read_metadata),
            None => Ok(None),
        }
    }

    fn floating_predecessors(&self, hash: &BlockHash) -> Option<Vec<BlockHash>> {
        if let Some(predecessors) = self.rw_store.read().predecessors(hash) {
            return Some(predecessors);
        }
        self.ro_stores
            .read()
            .iter()
            .rev()
            .find_map(|store| store.predecessors(hash))
    }

    /// Compute the power-of-two predecessor list of a block about to be
    /// stored.
    pub fn compute_predecessors(&self, block: &Block) -> Result<Vec<BlockHash>> {
        if block.level() == 0 {
            // Genesis points at itself.
            return Ok(vec![block.hash]);
        }
        let mut predecessors = Vec::with_capacity(PREDECESSOR_LIST_LEN as usize);
        predecessors.push(block.header.predecessor);
        for i in 1..PREDECESSOR_LIST_LEN {
            match self.get_hash(&block.header.predecessor, (1 << i) - 1)? {
                Some(ancestor) => predecessors.push(ancestor),
                None => break,
            }
        }
        Ok(predecessors)
    }

    /// Append a freshly validated block to the accumulating floating
    /// instance.
    pub fn store_block(&self, block: &Block) -> Result<()> {
        let predecessors = self.compute_predecessors(block)?;
        self.rw_store.read().append_block(block, predecessors)
    }

    /// Lowest block any tier still holds.
    #[must_use]
    pub fn caboose_gauge(&self) -> Option<(BlockHash, i32)> {
        if let Some(level) = self.cemented.lowest_cemented_level() {
            let hash = self.cemented.get_cemented_block_hash(level)?;
            return Some((hash, level));
        }
        // No cemented cycle yet: the lowest floating block.
        let mut lowest: Option<(BlockHash, i32)> = None;
        let consider = |lowest: &mut Option<(BlockHash, i32)>, store: &FloatingStore| {
            for hash in store.hashes() {
                if let Some(level) = store.level_of(&hash) {
                    if lowest.map_or(true, |(_, l)| level < l) {
                        *lowest = Some((hash, level));
                    }
                }
            }
        };
        for store in self.ro_stores.read().iter() {
            consider(&mut lowest, store);
        }
        consider(&mut lowest, &self.rw_store.read());
        lowest
    }

    /// Lowest level whose metadata is still on disk.
    #[must_use]
    pub fn savepoint_gauge(&self) -> Option<i32> {
        let ranges = self.cemented.cemented_ranges();
        for range in &ranges {
            // Metadata archives are pruned oldest-first: the first one
            // still present bounds the savepoint.
            if self
                .cemented
                .read_cemented_metadata(range, range.start_level)
                .ok()
                .flatten()
                .is_some()
            {
                return Some(range.start_level);
            }
        }
        // All cemented metadata pruned: the floating tier still has
        // metadata for everything above the cemented tail.
        ranges.last().map(|range| range.end_level + 1)
    }

    /// Try to take the chain-wide write lock without blocking.
    fn try_lock_for_write(&self) -> Result<Option<fs::File>> {
        let path = self.lockfile_path();
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .add_err_context(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(_) => Ok(None),
        }
    }

    /// Start the six-step merge in the background.
    ///
    /// Returns without merging when a merge is already running, a
    /// previous merge failed, or the chain write lock is held
    /// elsewhere (the merge is then simply postponed).
    pub fn merge_stores(self: &Arc<Self>, params: MergeParams) -> Result<()> {
        {
            let mut status = self.merge_status.lock();
            match &*status {
                MergeStatus::Running => return Ok(()),
                MergeStatus::Failed(reason) => {
                    warn!(%reason, "merge suspended by a previous failure");
                    return Ok(());
                }
                MergeStatus::Idle => {}
            }
            let Some(lock_file) = self.try_lock_for_write()? else {
                info!("chain write lock unavailable; merge postponed");
                return Ok(());
            };
            *status = MergeStatus::Running;
            drop(status);

            // Step 1: freeze RW into the read-only set and accumulate
            // new blocks in a staging instance. A failure this early is
            // an internal guard failure and suspends merging.
            let staging = match FloatingStore::open(&self.floating_dir, FloatingKind::RwTmp) {
                Ok(staging) => Arc::new(staging),
                Err(error) => {
                    *self.merge_status.lock() = MergeStatus::Failed(error.to_string());
                    return Err(error);
                }
            };
            {
                let mut rw = self.rw_store.write();
                let frozen = Arc::clone(&rw);
                self.ro_stores.write().push(frozen);
                *rw = staging;
            }

            let store = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("block-store-merge".to_owned())
                .spawn(move || {
                    store.run_merge(params, lock_file);
                })
                .expect("INTERNAL BUG: failed to spawn the merge thread");
            *self.merge_thread.lock() = Some(handle);
        }
        Ok(())
    }

    fn run_merge(self: &Arc<Self>, params: MergeParams, lock_file: fs::File) {
        let MergeParams {
            history_mode,
            from_highwatermark,
            to_level,
            final_hash,
            finalizer,
            on_error,
        } = params;

        info!(from_highwatermark, to_level, "merge started");
        let outcome = self.merge_work(&history_mode, from_highwatermark, to_level, &final_hash);
        match outcome {
            Ok(new_highest) => {
                *self.merge_status.lock() = MergeStatus::Idle;
                info!(new_highest, "merge complete");
                finalizer(new_highest);
            }
            Err(error) => {
                error!(%error, "merge failed; further merges suspended");
                *self.merge_status.lock() = MergeStatus::Failed(error.to_string());
                on_error(&error);
            }
        }
        let _ = fs2::FileExt::unlock(&lock_file);
    }

    fn merge_work(
        &self,
        history_mode: &HistoryMode,
        from_highwatermark: i32,
        to_level: i32,
        final_hash: &BlockHash,
    ) -> Result<i32> {
        // Step 2: resolve the ancestor chain to cement. Re-anchoring on
        // the cemented tail makes a replayed merge idempotent.
        let from_level = self
            .cemented
            .highest_cemented_level()
            .map_or(from_highwatermark + 1, |highest| {
                (from_highwatermark + 1).max(highest + 1)
            });
        let mut chain = Vec::new();
        if from_level <= to_level {
            let mut cursor = match self.read_block(final_hash, true)? {
                Some(block) => block,
                None => {
                    return Err(Error::CorruptedStore(format!(
                        "merge anchor {final_hash} disappeared"
                    )))
                }
            };
            while cursor.level() > to_level {
                let predecessor = cursor.header.predecessor;
                cursor = self.read_block(&predecessor, true)?.ok_or_else(|| {
                    Error::CorruptedStore(format!("broken chain at {predecessor}"))
                })?;
            }
            while cursor.level() >= from_level {
                let predecessor = cursor.header.predecessor;
                let done = cursor.level() == from_level;
                chain.push(cursor);
                if done {
                    break;
                }
                cursor = self.read_block(&predecessor, true)?.ok_or_else(|| {
                    Error::CorruptedStore(format!("broken chain at {predecessor}"))
                })?;
            }
            chain.reverse();
        }

        // Step 3: cement cycle by cycle.
        for cycle in chain.chunks(self.blocks_per_cycle as usize) {
            self.cemented.cement_blocks(cycle, true)?;
        }

        // Step 4: apply the retention policy.
        self.cemented.trigger_gc(history_mode)?;

        // Step 5: rewrite the frozen floating instances, dropping what
        // is now cemented (and, in rolling mode, what fell below the
        // purged tail).
        let lowest_retained = self.cemented.lowest_cemented_level();
        let rewrite = FloatingStore::open(&self.floating_dir, FloatingKind::RoTmp)?;
        let frozen: Vec<Arc<FloatingStore>> = self.ro_stores.read().clone();
        for store in &frozen {
            store.iter_with_pred(|block, predecessors| {
                let cemented = self.cemented.is_cemented(&block.hash);
                let below_caboose =
                    lowest_retained.is_some_and(|lowest| block.level() < lowest);
                if !cemented && !below_caboose && !rewrite.mem(&block.hash) {
                    rewrite.append_block(&block, predecessors.to_vec())?;
                }
                Ok(())
            })?;
        }

        // Step 6: atomic swap of the floating instances.
        {
            let mut ro_stores = self.ro_stores.write();
            let mut rw = self.rw_store.write();
            for store in ro_stores.drain(..) {
                store.delete()?;
            }
            rewrite.rename_to(&self.floating_dir, FloatingKind::RO)?;
            *ro_stores = vec![Arc::new(rewrite)];
            rw.rename_to(&self.floating_dir, FloatingKind::RW)?;
        }

        self.cemented
            .highest_cemented_level()
            .ok_or_else(|| Error::CorruptedStore("merge cemented nothing".to_owned()))
    }

    /// Wait for an ongoing merge to finish. Test and shutdown aid.
    pub fn await_merge_idle(&self) {
        let handle = self.merge_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        let handle = self.merge_thread.lock().take();
        if let Some(handle) = handle {
            // The merge thread may hold the last reference and run this
            // drop itself; joining would then wait forever.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
