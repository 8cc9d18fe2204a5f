//! Wire protocol between the node and the validator subprocess.
//!
//! Every message is a frame: a big-endian `u32` length followed by the
//! SCALE-encoded payload. The session opens with an 8-byte magic
//! exchanged in both directions, then one parameters frame; after that
//! the parent sends tagged requests and the child answers them strictly
//! in order.

use parity_scale_codec::{Decode, Encode};
use tessera_data_model::{
    Block, BlockHeader, ChainId, ContextHash, Genesis, Operation, ProtocolHash,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::ValidatorError;

/// Magic exchanged by both ends before anything else.
pub const HANDSHAKE_MAGIC: [u8; 8] = *b"TSSAVAL\0";

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: u32 = 128 * 1024 * 1024;

/// Session parameters, sent once after the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ValidatorParams {
    /// Root directory of the context store.
    pub context_root: String,
    /// Root directory of compiled protocols.
    pub protocol_root: String,
    /// Encoded sandbox parameters, if the node runs sandboxed.
    pub sandbox_parameters: Option<Vec<u8>>,
    /// Genesis of the chain being validated.
    pub genesis: Genesis,
    /// Forced protocol switches: level, protocol to activate there.
    pub user_activated_upgrades: Vec<(i32, ProtocolHash)>,
    /// Forced protocol replacements.
    pub user_activated_protocol_overrides: Vec<(ProtocolHash, ProtocolHash)>,
}

/// Requests the parent may send. The SCALE variant index is the tag
/// byte on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum ValidatorRequest {
    /// Initialize the child after the parameters frame.
    Init,
    /// Apply a block.
    Validate {
        chain_id: ChainId,
        predecessor: Block,
        max_operations_ttl: u16,
        header: BlockHeader,
        operations: Vec<Vec<Operation>>,
    },
    /// Simulate a block from loose parts.
    Preapply {
        chain_id: ChainId,
        predecessor: Block,
        timestamp: i64,
        protocol_data: Vec<u8>,
        operations: Vec<Vec<Operation>>,
    },
    /// Structurally check a block.
    Precheck {
        chain_id: ChainId,
        predecessor: Block,
        header: BlockHeader,
        operations: Vec<Vec<Operation>>,
    },
    /// Commit the genesis context.
    CommitGenesis { chain_id: ChainId },
    /// Fork a test chain.
    ForkTestChain {
        context_hash: ContextHash,
        forked_header: BlockHeader,
    },
    /// Adjust log filtering.
    ReconfigureEventLogging { filter: String },
    /// Shut the child down.
    Terminate,
}

/// Response to any request: the encoded result, or a rendered error
/// trace.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum ValidatorResponse {
    /// Request succeeded; payload is the request-specific result.
    Ok(Vec<u8>),
    /// Request failed in the child.
    Err(Vec<String>),
}

impl ValidatorResponse {
    /// Wrap a result type into a response.
    pub fn ok<T: Encode>(value: &T) -> Self {
        ValidatorResponse::Ok(value.encode())
    }

    /// Unwrap into the request-specific result type.
    pub fn into_result<T: Decode>(self) -> Result<T, ValidatorError> {
        match self {
            ValidatorResponse::Ok(bytes) => Ok(T::decode(&mut bytes.as_slice())?),
            ValidatorResponse::Err(errors) => Err(ValidatorError::InvalidBlock { errors }),
        }
    }
}

/// Send one length-prefixed frame.
pub async fn write_frame<W, T>(stream: &mut W, payload: &T) -> Result<(), ValidatorError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Encode,
{
    let encoded = payload.encode();
    let mut frame = Vec::with_capacity(4 + encoded.len());
    frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    frame.extend_from_slice(&encoded);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Receive one length-prefixed frame.
pub async fn read_frame<R, T>(stream: &mut R) -> Result<T, ValidatorError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: Decode,
{
    let mut word = [0_u8; 4];
    stream.read_exact(&mut word).await?;
    let length = u32::from_be_bytes(word);
    if length > MAX_FRAME_LEN {
        return Err(ValidatorError::ValidationProcessFailed(format!(
            "oversized frame of {length} bytes"
        )));
    }
    let mut payload = vec![0_u8; length as usize];
    stream.read_exact(&mut payload).await?;
    Ok(T::decode(&mut payload.as_slice())?)
}

/// Exchange and verify the magic.
pub async fn handshake<S>(stream: &mut S) -> Result<(), ValidatorError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(&HANDSHAKE_MAGIC).await?;
    stream.flush().await?;
    let mut peer = [0_u8; 8];
    stream.read_exact(&mut peer).await?;
    if peer != HANDSHAKE_MAGIC {
        return Err(ValidatorError::InconsistentHandshake(format!(
            "unexpected magic {peer:02x?}"
        )));
    }
    Ok(())
}

/// Socket file used by the process with parent pid `pid`.
pub fn socket_path(socket_dir: &std::path::Path, pid: u32) -> std::path::PathBuf {
    socket_dir.join(format!("tessera-validator-{pid}.sock"))
}
