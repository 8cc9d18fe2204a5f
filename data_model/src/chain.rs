//! Chain-level configuration: genesis parameters, history modes and the
//! protocol activation table.

use std::collections::BTreeSet;

use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{
    block::{Block, BlockDescriptor, BlockHeader},
    hash::{BlockHash, ContextHash, OperationHash, OperationListListHash, ProtocolHash},
};

/// Parameters of the chain's level-0 block.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Genesis {
    /// Timestamp of the genesis block, seconds since the UNIX epoch.
    pub time: i64,
    /// Hash the genesis block must have.
    pub block: BlockHash,
    /// Protocol activated at genesis.
    pub protocol: ProtocolHash,
}

impl Genesis {
    /// Construct the deterministic level-0 block for these parameters.
    ///
    /// The genesis block has a single empty validation pass, zero
    /// fitness and no predecessor; its context commitment is filled in
    /// when genesis is committed through the validator.
    #[must_use]
    pub fn make_block(&self, context: ContextHash) -> Block {
        let header = BlockHeader {
            level: 0,
            proto_level: 0,
            predecessor: self.block,
            timestamp: self.time,
            validation_passes: 0,
            operations_hash: OperationListListHash::zero(),
            fitness: Vec::new(),
            context,
            protocol_data: Vec::new(),
        };
        Block {
            hash: self.block,
            header,
            operations: Vec::new(),
            block_metadata_hash: None,
            operations_metadata_hashes: None,
            metadata: None,
        }
    }
}

/// How much history the node retains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum HistoryMode {
    /// Everything is kept forever.
    Archive,
    /// Every block is kept; metadata older than the retained cycles is
    /// dropped.
    Full {
        /// Cycles of metadata kept below the checkpoint. `None` means
        /// the default.
        extra_cycles: Option<u16>,
    },
    /// Only the retained cycles are kept at all; older blocks are
    /// deleted outright.
    Rolling {
        /// Cycles kept below the checkpoint. `None` means the default.
        extra_cycles: Option<u16>,
    },
}

impl HistoryMode {
    /// Cycles retained below the checkpoint when none are specified.
    pub const DEFAULT_EXTRA_CYCLES: u16 = 5;

    /// The number of cycles this mode keeps fully readable.
    #[must_use]
    pub fn retained_cycles(&self) -> Option<u16> {
        match self {
            HistoryMode::Archive => None,
            HistoryMode::Full { extra_cycles } | HistoryMode::Rolling { extra_cycles } => {
                Some(extra_cycles.unwrap_or(Self::DEFAULT_EXTRA_CYCLES))
            }
        }
    }

    /// Whether a store created with `self` may be reopened as `next`.
    ///
    /// Only restrictions are legal: an archive store can become full or
    /// rolling, a full store can become rolling. Widening would promise
    /// history that is no longer on disk.
    #[must_use]
    pub fn can_switch_to(&self, next: &HistoryMode) -> bool {
        use HistoryMode::{Archive, Full, Rolling};
        match (self, next) {
            (Archive, _) | (Full { .. }, Full { .. } | Rolling { .. }) => true,
            (Rolling { .. }, Rolling { .. }) => true,
            _ => false,
        }
    }
}

impl Default for HistoryMode {
    fn default() -> Self {
        HistoryMode::Full { extra_cycles: None }
    }
}

impl core::fmt::Display for HistoryMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HistoryMode::Archive => write!(f, "archive"),
            HistoryMode::Full { .. } => write!(f, "full"),
            HistoryMode::Rolling { .. } => write!(f, "rolling"),
        }
    }
}

/// Persistent chain parameters, written once at chain creation.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Genesis parameters.
    pub genesis: Genesis,
    /// Optional expiration date of the chain (test chains only).
    pub expiration: Option<i64>,
    /// Retention policy.
    pub history_mode: HistoryMode,
}

/// Commit information recorded when a protocol is compiled in.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Hash of the source commit.
    pub commit_hash: String,
    /// Author of the commit.
    pub author: String,
    /// Date of the commit.
    pub date: String,
}

/// One row of the protocol activation table.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ProtocolLevelEntry {
    /// The block that activated this protocol.
    pub activation_block: BlockDescriptor,
    /// The activated protocol.
    pub protocol: ProtocolHash,
    /// Build provenance, when known.
    pub commit_info: Option<CommitInfo>,
}

/// The operations a node advertises alongside its current head.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Mempool {
    /// Operations applied on top of the advertised head, in
    /// classification order.
    pub known_valid: Vec<OperationHash>,
    /// Operations still awaiting classification.
    pub pending: BTreeSet<OperationHash>,
}

impl Mempool {
    /// A mempool advertising nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the advert carries no operation at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known_valid.is_empty() && self.pending.is_empty()
    }
}
