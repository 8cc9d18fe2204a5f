//! Content addressing. Every persistent entity is identified by a
//! blake2b-32 digest of its canonical SCALE encoding.

use core::{fmt, str::FromStr};

use blake2::{
    digest::{Update, VariableOutput},
    Blake2bVar,
};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Raw blake2b-32 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Hash([u8; Self::LENGTH]);

impl Hash {
    /// Length of the digest in bytes.
    pub const LENGTH: usize = 32;

    /// Hash the given bytes.
    #[must_use]
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        let digest = Blake2bVar::new(Self::LENGTH)
            .expect("INTERNAL BUG: 32 is a valid blake2b output size")
            .chain(bytes.as_ref())
            .finalize_boxed();
        let mut hash = [0; Self::LENGTH];
        hash.copy_from_slice(&digest);
        Self(hash)
    }

    /// Wrap bytes that are already a digest.
    #[must_use]
    pub const fn prehashed(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// The zero digest. Used as the predecessor of the genesis block.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0; Self::LENGTH])
    }

    /// View the digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Failure to parse a hash from its hex form.
#[derive(Debug, thiserror::Error)]
#[error("invalid hash literal: {0}")]
pub struct ParseHashError(String);

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ParseHashError(e.to_string()))?;
        let bytes: [u8; Self::LENGTH] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| ParseHashError(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Encode,
            Decode,
            Serialize,
            Deserialize,
            derive_more::Display,
            derive_more::From,
            derive_more::FromStr,
        )]
        pub struct $name(pub Hash);

        impl $name {
            /// Hash the given bytes.
            #[must_use]
            pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Self {
                Self(Hash::new(bytes))
            }

            /// The zero digest.
            #[must_use]
            pub const fn zero() -> Self {
                Self(Hash::zero())
            }

            /// View the digest bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; Hash::LENGTH] {
                self.0.as_bytes()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_ref()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }
    };
}

hash_newtype! {
    /// Identifier of a block, the digest of its encoded header.
    BlockHash
}
hash_newtype! {
    /// Identifier of an operation.
    OperationHash
}
hash_newtype! {
    /// Digest of the full list-of-lists of operations carried by a block.
    OperationListListHash
}
hash_newtype! {
    /// Commitment to the ledger context produced by applying a block.
    ContextHash
}
hash_newtype! {
    /// Identifier of an economic protocol.
    ProtocolHash
}
hash_newtype! {
    /// Digest of a block's application metadata.
    BlockMetadataHash
}
hash_newtype! {
    /// Digest of a single operation's application metadata.
    OperationMetadataHash
}

/// Chain identifier, derived from the genesis block hash.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct ChainId([u8; Self::LENGTH]);

impl ChainId {
    /// Length of a chain identifier in bytes.
    pub const LENGTH: usize = 4;

    /// Derive the chain id from a genesis (or fork point) block hash.
    #[must_use]
    pub fn from_block_hash(hash: &BlockHash) -> Self {
        let digest = Hash::new(hash.as_bytes());
        let mut id = [0; Self::LENGTH];
        id.copy_from_slice(&digest.as_bytes()[..Self::LENGTH]);
        Self(id)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
