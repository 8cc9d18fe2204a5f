//! End-to-end tests of the validator subprocess protocol, driving the
//! real child binary.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tessera_data_model::{BlockHash, ChainId, Genesis, ProtocolHash};
use tessera_validator::{
    external::protocol::ValidatorParams, BlockValidator, ExternalValidator, GenesisEngine,
};

fn validator_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tessera_validator"))
}

fn params() -> ValidatorParams {
    ValidatorParams {
        context_root: "/tmp/context".to_owned(),
        protocol_root: "/tmp/protocols".to_owned(),
        sandbox_parameters: None,
        genesis: Genesis {
            time: 1_600_000_000,
            block: BlockHash::hash_bytes(b"external-genesis"),
            protocol: ProtocolHash::hash_bytes(b"proto-genesis"),
        },
        user_activated_upgrades: Vec::new(),
        user_activated_protocol_overrides: Vec::new(),
    }
}

fn external_validator(socket_dir: &std::path::Path) -> Arc<ExternalValidator> {
    Arc::new(ExternalValidator::new(
        validator_binary(),
        socket_dir.to_path_buf(),
        params(),
        Duration::from_secs(5),
    ))
}

/// A header extending `predecessor`, with the context commitment the
/// activation engine will produce.
fn next_header(
    predecessor: &tessera_data_model::Block,
    salt: u8,
) -> tessera_data_model::BlockHeader {
    let mut header = tessera_data_model::BlockHeader {
        level: predecessor.level() + 1,
        proto_level: 1,
        predecessor: predecessor.hash,
        timestamp: predecessor.header.timestamp + 30,
        validation_passes: 1,
        operations_hash: tessera_data_model::OperationListListHash::hash_bytes([salt]),
        fitness: vec![vec![salt]],
        context: tessera_data_model::ContextHash::zero(),
        protocol_data: vec![salt],
    };
    header.context = GenesisEngine::context_after(&header);
    header
}

#[tokio::test]
async fn apply_block_round_trips_through_the_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    let validator = external_validator(dir.path());
    let chain_id = ChainId::from_block_hash(&params().genesis.block);

    let genesis = validator.commit_genesis(chain_id).await.unwrap();
    assert_eq!(genesis.level(), 0);
    assert_eq!(genesis.hash, params().genesis.block);

    let header = next_header(&genesis, 1);
    let applied = validator
        .apply_block(chain_id, &genesis, 120, &header, vec![Vec::new()])
        .await
        .unwrap();
    assert_eq!(applied.validation_store.context_hash, header.context);
    assert_eq!(validator.restart_count(), 0);

    validator.close().await;
}

#[tokio::test]
async fn killed_subprocess_is_restarted_once() {
    let dir = tempfile::tempdir().unwrap();
    let validator = external_validator(dir.path());
    let chain_id = ChainId::from_block_hash(&params().genesis.block);

    let genesis = validator.commit_genesis(chain_id).await.unwrap();
    let pid = validator.child_pid().await.expect("child is running");

    // Kill the child mid-session.
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The next request notices the death, restarts the child with a
    // fresh handshake, and completes.
    let header = next_header(&genesis, 2);
    let applied = validator
        .apply_block(chain_id, &genesis, 120, &header, vec![Vec::new()])
        .await
        .unwrap();
    assert_eq!(applied.validation_store.context_hash, header.context);
    assert_eq!(validator.restart_count(), 1);
    assert_ne!(validator.child_pid().await, Some(pid));

    validator.close().await;
}

#[tokio::test]
async fn close_refuses_further_requests() {
    let dir = tempfile::tempdir().unwrap();
    let validator = external_validator(dir.path());
    let chain_id = ChainId::from_block_hash(&params().genesis.block);

    validator.commit_genesis(chain_id).await.unwrap();
    validator.close().await;

    let result = validator.commit_genesis(chain_id).await;
    assert!(matches!(
        result,
        Err(tessera_validator::ValidatorError::CannotValidateWhileShuttingDown)
    ));
}

#[tokio::test]
async fn requests_are_answered_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let validator = external_validator(dir.path());
    let chain_id = ChainId::from_block_hash(&params().genesis.block);

    let genesis = validator.commit_genesis(chain_id).await.unwrap();
    let mut predecessor = genesis;
    // A chain applied strictly in order; any frame reordering would
    // break a context checkout.
    for salt in 1..=5 {
        let header = next_header(&predecessor, salt);
        let applied = validator
            .apply_block(chain_id, &predecessor, 120, &header, vec![Vec::new()])
            .await
            .unwrap();
        predecessor = tessera_data_model::Block {
            hash: header.hash(),
            header,
            operations: vec![Vec::new()],
            block_metadata_hash: None,
            operations_metadata_hashes: None,
            metadata: Some(applied.into_metadata()),
        };
    }

    validator.close().await;
}
