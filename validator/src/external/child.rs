//! The subprocess side of the validator protocol: connect back to the
//! parent, handshake, then serve requests in order until `Terminate`
//! or the parent goes away.

use std::sync::Arc;

use tessera_data_model::ChainId;
use tessera_logger::prelude::*;
use tokio::net::UnixStream;

use crate::{
    engine::{GenesisEngine, InMemoryContextIndex, ProtocolRegistry},
    external::protocol::{
        handshake, read_frame, socket_path, write_frame, ValidatorParams, ValidatorRequest,
        ValidatorResponse,
    },
    BlockValidator as _, InternalValidator, ValidatorError,
};

/// Registry served by the stock validator binary: the activation
/// engine, at the genesis protocol level and the first real level.
#[must_use]
pub fn default_registry() -> ProtocolRegistry {
    let engine = Arc::new(GenesisEngine::new());
    let mut registry = ProtocolRegistry::new();
    registry.register(0, engine.clone());
    registry.register(1, engine);
    registry
}

/// Serve the validator protocol from inside the subprocess.
///
/// # Errors
/// Fails when the parent socket is unreachable or the handshake does
/// not match.
pub async fn run(socket_dir: &std::path::Path) -> Result<(), ValidatorError> {
    let path = socket_path(socket_dir, std::os::unix::process::parent_id());
    let mut stream = UnixStream::connect(&path).await?;
    handshake(&mut stream).await?;
    let params: ValidatorParams = read_frame(&mut stream).await?;
    info!(genesis = %params.genesis.block, "validator subprocess connected");

    let validator = InternalValidator::new(
        default_registry(),
        Arc::new(InMemoryContextIndex::default()),
        params.genesis.clone(),
    );
    // The activation context must exist before the first block refers
    // to it.
    let chain_id = ChainId::from_block_hash(&params.genesis.block);
    let _ = validator.commit_genesis(chain_id).await;

    loop {
        let request: ValidatorRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(ValidatorError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                info!("parent closed the session");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let response = serve(&validator, request).await;
        let Some(response) = response else {
            // Terminate: acknowledge and exit.
            write_frame(&mut stream, &ValidatorResponse::ok(&())).await?;
            return Ok(());
        };
        write_frame(&mut stream, &response).await?;
    }
}

async fn serve(
    validator: &InternalValidator,
    request: ValidatorRequest,
) -> Option<ValidatorResponse> {
    let response = match request {
        ValidatorRequest::Init => ValidatorResponse::ok(&()),
        ValidatorRequest::Validate {
            chain_id,
            predecessor,
            max_operations_ttl,
            header,
            operations,
        } => as_response(
            validator
                .apply_block(chain_id, &predecessor, max_operations_ttl, &header, operations)
                .await,
        ),
        ValidatorRequest::Preapply {
            chain_id,
            predecessor,
            timestamp,
            protocol_data,
            operations,
        } => as_response(
            validator
                .preapply_block(chain_id, &predecessor, timestamp, protocol_data, operations)
                .await,
        ),
        ValidatorRequest::Precheck {
            chain_id,
            predecessor,
            header,
            operations,
        } => as_response(
            validator
                .precheck_block(chain_id, &predecessor, &header, operations)
                .await,
        ),
        ValidatorRequest::CommitGenesis { chain_id } => {
            as_response(validator.commit_genesis(chain_id).await)
        }
        ValidatorRequest::ForkTestChain {
            context_hash,
            forked_header,
        } => as_response(validator.init_test_chain(context_hash, forked_header).await),
        ValidatorRequest::ReconfigureEventLogging { filter } => {
            as_response(validator.reconfigure_event_logging(filter).await)
        }
        ValidatorRequest::Terminate => return None,
    };
    Some(response)
}

fn as_response<T: parity_scale_codec::Encode>(
    result: Result<T, ValidatorError>,
) -> ValidatorResponse {
    match result {
        Ok(value) => ValidatorResponse::ok(&value),
        Err(error) => ValidatorResponse::Err(vec![error.to_string()]),
    }
}
