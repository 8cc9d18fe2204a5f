//! Seam to the peer-to-peer layer. The prevalidator only needs to
//! fetch operation bytes, forget operations peers should not be asked
//! about again, and broadcast its head with the accompanying mempool.

use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tessera_data_model::{BlockHash, Mempool, OperationHash};

/// Failure of an operation fetch.
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum FetchError {
    /// Fetching operation {0} timed out
    Timeout(OperationHash),
    /// Fetching operation {0} was canceled
    Canceled(OperationHash),
}

/// What the shell requires from the distributed database.
#[async_trait::async_trait]
pub trait DistributedDb: Send + Sync {
    /// Fetch the raw bytes of an operation from the network.
    async fn fetch_operation(
        &self,
        hash: OperationHash,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError>;

    /// Make a locally injected operation available to peers.
    fn inject_operation(&self, hash: OperationHash, bytes: Vec<u8>);

    /// Forget an operation; peers are no longer asked for it.
    fn clear_operation(&self, hash: &OperationHash);

    /// Broadcast the current head with its mempool advert.
    async fn advertise_mempool(&self, head: BlockHash, mempool: Mempool);
}

/// In-memory distributed database: the reference implementation used
/// by tests and single-node runs.
#[derive(Debug, Default)]
pub struct InMemoryDdb {
    operations: DashMap<OperationHash, Vec<u8>>,
    cleared: DashSet<OperationHash>,
    adverts: Mutex<Vec<(BlockHash, Mempool)>>,
}

impl InMemoryDdb {
    /// Seed an operation as if a peer had sent it.
    pub fn seed_operation(&self, hash: OperationHash, bytes: Vec<u8>) {
        self.operations.insert(hash, bytes);
    }

    /// Whether `hash` was cleared.
    #[must_use]
    pub fn was_cleared(&self, hash: &OperationHash) -> bool {
        self.cleared.contains(hash)
    }

    /// Recorded adverts, oldest first.
    #[must_use]
    pub fn adverts(&self) -> Vec<(BlockHash, Mempool)> {
        self.adverts.lock().clone()
    }
}

#[async_trait::async_trait]
impl DistributedDb for InMemoryDdb {
    async fn fetch_operation(
        &self,
        hash: OperationHash,
        _timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        self.operations
            .get(&hash)
            .map(|bytes| bytes.clone())
            .ok_or(FetchError::Timeout(hash))
    }

    fn inject_operation(&self, hash: OperationHash, bytes: Vec<u8>) {
        self.cleared.remove(&hash);
        self.operations.insert(hash, bytes);
    }

    fn clear_operation(&self, hash: &OperationHash) {
        self.operations.remove(hash);
        self.cleared.insert(*hash);
    }

    async fn advertise_mempool(&self, head: BlockHash, mempool: Mempool) {
        self.adverts.lock().push((head, mempool));
    }
}
