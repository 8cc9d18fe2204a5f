//! Error taxonomy of the store.

use std::path::PathBuf;

use tessera_data_model::{BlockDescriptor, BlockHash, ContextHash, HistoryMode};

/// Detail of a cemented-store inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, displaydoc::Display)]
pub enum CementedIssue {
    /// missing cycle file `{0}`
    MissingCycle(String),
    /// offset slot of level {level} does not point at a block start
    BadOffset {
        /// The level whose slot is wrong.
        level: i32,
    },
    /// found block at level {got}, expected {expected}
    UnexpectedLevel {
        /// The level read from disk.
        got: i32,
        /// The level the slot promises.
        expected: i32,
    },
    /// block {0} at level {1} is missing from an index
    CorruptedIndex(BlockHash, i32),
}

/// Why a batch of blocks cannot be cemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, displaydoc::Display)]
pub enum CannotCement {
    /// no block to cement
    Empty,
    /// the batch starts at or below the highest cemented level
    HigherCemented,
    /// a temporary cycle file is already present
    TmpExists,
}

/// Error variants of the persistent store.
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum Error {
    /// Failed reading/writing {1:?} from disk
    Io(#[source] std::io::Error, PathBuf),
    /// Failed to serialize/deserialize a stored value
    Codec(#[from] parity_scale_codec::Error),
    /// Corrupted store: {0}; import a snapshot to recover
    CorruptedStore(String),
    /// Inconsistent cemented store: {0}
    InconsistentCementedStore(CementedIssue),
    /// Inconsistent genesis: expected {expected}, got {got}
    InconsistentGenesis {
        /// Hash the configuration promises.
        expected: BlockHash,
        /// Hash found on disk.
        got: BlockHash,
    },
    /// Cannot switch history mode from {previous} to {next}
    CannotSwitchHistoryMode {
        /// Mode the store was created with.
        previous: HistoryMode,
        /// Mode requested at reopen.
        next: HistoryMode,
    },
    /// Cannot checkout context {0}
    CannotCheckoutContext(ContextHash),
    /// Block {hash} (distance {distance}) not found
    BlockNotFound {
        /// The base of the look-up.
        hash: BlockHash,
        /// Requested distance above the base.
        distance: i32,
    },
    /// Metadata of block {0} not found
    BlockMetadataNotFound(BlockHash),
    /// Cannot cement blocks: {0}
    CannotCement(CannotCement),
    /// Store is locked by another process ({0:?})
    Locked(PathBuf),
    /// A reconstruction is pending; resume it before opening the store
    ReconstructionPending,
    /// Store merge failed: {0}
    MergeFailed(String),
    /// Invalid head switch: checkpoint level {checkpoint_level}, given head {given_head}
    InvalidHeadSwitch {
        /// Current checkpoint level.
        checkpoint_level: i32,
        /// The refused head.
        given_head: BlockDescriptor,
    },
    /// New head {0} breaks the head invariant: predecessor metadata unavailable
    BadHeadInvariant(BlockDescriptor),
    /// Target {target} is not an ancestor of head {head}
    TargetMismatch {
        /// The configured target.
        target: BlockDescriptor,
        /// The refused head.
        head: BlockDescriptor,
    },
    /// Checkpoint violation by block {0}
    CheckpointError(BlockDescriptor),
    /// Block {0} is known invalid
    KnownInvalid(BlockHash),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) trait AddErrContextExt<T> {
    fn add_err_context(self, path: &std::path::Path) -> Result<T>;
}

impl<T> AddErrContextExt<T> for std::result::Result<T, std::io::Error> {
    fn add_err_context(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| Error::Io(e, path.to_path_buf()))
    }
}
