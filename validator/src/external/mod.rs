//! Parent side of the external validator: spawn the subprocess, own
//! the socket session, serialise request/response pairs, restart the
//! child once after an abnormal exit.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tessera_data_model::{Block, BlockHeader, ChainId, ContextHash, Operation};
use tessera_logger::prelude::*;
use tokio::{
    net::{UnixListener, UnixStream},
    process::{Child, Command},
    sync::Mutex,
    time,
};

use crate::{
    ApplyBlockResult, BlockValidator, PreapplyResult, ValidatorError,
};

pub mod child;
pub mod protocol;

use protocol::{
    handshake, read_frame, socket_path, write_frame, ValidatorParams, ValidatorRequest,
    ValidatorResponse,
};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

type Result<T, E = ValidatorError> = std::result::Result<T, E>;

struct Session {
    child: Child,
    stream: UnixStream,
}

impl Session {
    /// One ordered request/response pair.
    async fn request(&mut self, request: &ValidatorRequest) -> Result<ValidatorResponse> {
        write_frame(&mut self.stream, request).await?;
        read_frame(&mut self.stream).await
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

enum SessionState {
    Uninitialized,
    Running(Session),
    Exiting,
}

/// A block validator running in an isolated subprocess.
pub struct ExternalValidator {
    binary: PathBuf,
    socket_dir: PathBuf,
    params: ValidatorParams,
    shutdown_timeout: Duration,
    session: Mutex<SessionState>,
    restarts: AtomicUsize,
}

impl ExternalValidator {
    /// Configure an external validator; the subprocess is spawned
    /// lazily on the first request.
    #[must_use]
    pub fn new(
        binary: PathBuf,
        socket_dir: PathBuf,
        params: ValidatorParams,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            binary,
            socket_dir,
            params,
            shutdown_timeout,
            session: Mutex::new(SessionState::Uninitialized),
            restarts: AtomicUsize::new(0),
        }
    }

    /// How many times the child was restarted after abnormal exits.
    #[must_use]
    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Pid of the running child, if any.
    pub async fn child_pid(&self) -> Option<u32> {
        match &*self.session.lock().await {
            SessionState::Running(session) => session.pid(),
            _ => None,
        }
    }

    /// Spawn the child, accept its connection, handshake and send the
    /// parameters frame plus the `Init` request.
    async fn spawn_session(&self) -> Result<Session> {
        std::fs::create_dir_all(&self.socket_dir)?;
        let path = socket_path(&self.socket_dir, std::process::id());
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;

        let child = Command::new(&self.binary)
            .arg("--socket-dir")
            .arg(&self.socket_dir)
            .kill_on_drop(true)
            .spawn()?;

        let accepted = time::timeout(ACCEPT_TIMEOUT, listener.accept()).await;
        // The descriptor alone keeps the endpoint alive from here on.
        let _ = std::fs::remove_file(&path);
        let (mut stream, _addr) = accepted
            .map_err(|_| {
                ValidatorError::ValidationProcessFailed(
                    "validator subprocess did not connect".to_owned(),
                )
            })??;

        handshake(&mut stream).await?;
        write_frame(&mut stream, &self.params).await?;

        let mut session = Session { child, stream };
        session
            .request(&ValidatorRequest::Init)
            .await?
            .into_result::<()>()?;
        info!(pid = ?session.pid(), "validator subprocess started");
        Ok(session)
    }

    /// Send a request, restarting the child once if it exited
    /// abnormally under us.
    async fn request(&self, request: ValidatorRequest) -> Result<ValidatorResponse> {
        let mut state = self.session.lock().await;
        match &mut *state {
            SessionState::Exiting => return Err(ValidatorError::CannotValidateWhileShuttingDown),
            SessionState::Uninitialized => {
                *state = SessionState::Running(self.spawn_session().await?);
            }
            SessionState::Running(_) => {}
        }

        let SessionState::Running(session) = &mut *state else {
            unreachable!("state was just initialised");
        };
        match session.request(&request).await {
            Ok(response) => Ok(response),
            Err(error) => {
                if !session.has_exited() {
                    return Err(error);
                }
                // Abnormal exit: one restart, then the error surfaces.
                warn!(%error, "validator subprocess died; restarting once");
                self.restarts.fetch_add(1, Ordering::SeqCst);
                let mut fresh = self.spawn_session().await.map_err(|respawn_error| {
                    ValidatorError::ValidationProcessFailed(respawn_error.to_string())
                })?;
                let response = fresh.request(&request).await;
                *state = SessionState::Running(fresh);
                response
            }
        }
    }
}

#[async_trait::async_trait]
impl BlockValidator for ExternalValidator {
    async fn apply_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        max_operations_ttl: u16,
        header: &BlockHeader,
        operations: Vec<Vec<Operation>>,
    ) -> Result<ApplyBlockResult> {
        self.request(ValidatorRequest::Validate {
            chain_id,
            predecessor: predecessor.clone(),
            max_operations_ttl,
            header: header.clone(),
            operations,
        })
        .await?
        .into_result()
    }

    async fn preapply_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        timestamp: i64,
        protocol_data: Vec<u8>,
        operations: Vec<Vec<Operation>>,
    ) -> Result<PreapplyResult> {
        self.request(ValidatorRequest::Preapply {
            chain_id,
            predecessor: predecessor.clone(),
            timestamp,
            protocol_data,
            operations,
        })
        .await?
        .into_result()
    }

    async fn precheck_block(
        &self,
        chain_id: ChainId,
        predecessor: &Block,
        header: &BlockHeader,
        operations: Vec<Vec<Operation>>,
    ) -> Result<()> {
        self.request(ValidatorRequest::Precheck {
            chain_id,
            predecessor: predecessor.clone(),
            header: header.clone(),
            operations,
        })
        .await?
        .into_result()
    }

    async fn commit_genesis(&self, chain_id: ChainId) -> Result<Block> {
        self.request(ValidatorRequest::CommitGenesis { chain_id })
            .await?
            .into_result()
    }

    async fn init_test_chain(
        &self,
        context_hash: ContextHash,
        forked_header: BlockHeader,
    ) -> Result<BlockHeader> {
        self.request(ValidatorRequest::ForkTestChain {
            context_hash,
            forked_header,
        })
        .await?
        .into_result()
    }

    async fn reconfigure_event_logging(&self, filter: String) -> Result<()> {
        self.request(ValidatorRequest::ReconfigureEventLogging { filter })
            .await?
            .into_result()
    }

    async fn close(&self) {
        let mut state = self.session.lock().await;
        let previous = std::mem::replace(&mut *state, SessionState::Exiting);
        let SessionState::Running(mut session) = previous else {
            return;
        };

        // Ask politely first; connection errors here mean the child is
        // already gone, which is fine.
        match session.request(&ValidatorRequest::Terminate).await {
            Ok(_) => {}
            Err(ValidatorError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::UnexpectedEof
                ) => {}
            Err(error) => warn!(%error, "error while terminating the validator subprocess"),
        }

        match time::timeout(self.shutdown_timeout, session.child.wait()).await {
            Ok(_) => {}
            Err(_elapsed) => {
                warn!("validator subprocess ignored Terminate; sending SIGTERM");
                if let Some(pid) = session.pid() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
                let _ = session.child.wait().await;
            }
        }
    }
}
