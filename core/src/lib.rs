//! Tessera shell core: the prevalidator (mempool classifier) and its
//! seams to the distributed database and the block validator.

pub mod classification;
pub mod distributed_db;
pub mod prevalidator;

pub use classification::{Classification, ClassificationStore};
pub use distributed_db::{DistributedDb, FetchError, InMemoryDdb};
pub use prevalidator::{
    Arrived, Ban, FetchFailed, FlushAdvert, GetSnapshot, HeadSwitch, Inject, MempoolSnapshot,
    PeerAdvert, Prevalidator, ProcessBatch, Unban,
};
