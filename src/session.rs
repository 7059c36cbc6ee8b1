//! Retrieval session: one pass from connect to a trajectory list.
//!
//! ```text
//! Idle → Connecting → AwaitingSlotList → AwaitingPerSlotData → Complete
//!   └──────────┴──────────────┴────────────────────┴──────────→ Fallback
//! ```
//!
//! Any [`ClientError`] on the remote path moves the session to `Fallback`,
//! where the bundled dataset is parsed through the same framing, decoding
//! and building pipeline. Only [`SessionError::FatalDataUnavailable`]
//! reaches the caller.
//!
//! # Usage
//!
//! ```ignore
//! use atomata::{config::ClientConfig, session::Session};
//!
//! let mut session = Session::tcp(ClientConfig::from_env()?);
//! let trajectories = session.retrieve().await?;
//! ```

use std::future::Future;
use std::path::PathBuf;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::ipc::{AgentClient, ClientError, Connector, FrameDecoder, TcpConnector};
use crate::models::{compare_slot_ids, SlotDescriptor, Trajectory};
use crate::trajectory::{MessageKind, Progress, TrajectoryBuilder};

/// Demo trajectory compiled into the binary.
pub const EMBEDDED_DATASET: &[u8] = include_bytes!("../assets/demo_protein.pyon");

/// Slot id given to the fallback trajectory.
pub const FALLBACK_SLOT_ID: &str = "demo";

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingSlotList,
    AwaitingPerSlotData,
    Complete,
    Fallback,
}

/// Where the returned trajectories came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Remote,
    Fallback,
}

/// The only error a session surfaces.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Neither the agent nor the fallback dataset produced a trajectory.
    #[error("No trajectory data available (remote: {remote}; fallback: {fallback})")]
    FatalDataUnavailable { remote: String, fallback: String },
}

/// Source of the offline dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackDataset {
    /// [`EMBEDDED_DATASET`].
    Embedded,
    File(PathBuf),
    Bytes(Vec<u8>),
}

impl FallbackDataset {
    async fn load(&self) -> std::io::Result<Vec<u8>> {
        match self {
            FallbackDataset::Embedded => Ok(EMBEDDED_DATASET.to_vec()),
            FallbackDataset::File(path) => tokio::fs::read(path).await,
            FallbackDataset::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Parse a complete dataset (the same message stream the agent sends for a
/// slot) into one trajectory.
pub fn parse_dataset(
    bytes: &[u8],
    slot_id: &str,
    max_frame_bytes: usize,
) -> Result<Trajectory, ClientError> {
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    let mut messages = decoder.push(bytes)?;
    messages.extend(decoder.finish()?);

    let mut builder = TrajectoryBuilder::new(slot_id);
    for message in &messages {
        let kind = MessageKind::from_tag(&message.message_type);
        match kind {
            MessageKind::End => break,
            MessageKind::Topology | MessageKind::Checkpoint => {
                let value = ClientError::decode_payload(message)?;
                if builder.apply(&kind, &value)? == Progress::Finished {
                    break;
                }
            }
            MessageKind::Slots | MessageKind::Other(_) => {
                debug!("Skipping {} message in dataset", message.message_type);
            }
        }
    }

    match builder.finish() {
        Some(trajectory) if !trajectory.is_empty() => Ok(trajectory),
        Some(_) => Err(ClientError::NoUsableData("dataset has no snapshots".to_string())),
        None => Err(ClientError::NoUsableData("dataset has no topology".to_string())),
    }
}

/// Pick the slot to display: the lowest usable slot id.
pub fn select_slot(slots: &[SlotDescriptor]) -> Option<&SlotDescriptor> {
    slots
        .iter()
        .filter(|slot| slot.status.is_usable())
        .min_by(|a, b| compare_slot_ids(&a.id, &b.id))
}

/// One retrieval session against an agent.
///
/// The session owns its connector and configuration; callers own the
/// returned trajectories.
pub struct Session<C: Connector> {
    config: ClientConfig,
    connector: C,
    fallback: FallbackDataset,
    state: SessionState,
    history: Vec<SessionState>,
    source: Option<DataSource>,
}

impl Session<TcpConnector> {
    /// Session over TCP using the configured endpoint.
    pub fn tcp(config: ClientConfig) -> Self {
        Self::new(config, TcpConnector)
    }
}

impl<C: Connector> Session<C> {
    pub fn new(config: ClientConfig, connector: C) -> Self {
        let fallback = match &config.fallback_path {
            Some(path) => FallbackDataset::File(path.clone()),
            None => FallbackDataset::Embedded,
        };
        Self {
            config,
            connector,
            fallback,
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            source: None,
        }
    }

    /// Replace the fallback dataset.
    pub fn with_fallback(mut self, fallback: FallbackDataset) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the last retrieval passed through, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Source of the last successful retrieval.
    pub fn source(&self) -> Option<DataSource> {
        self.source
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Retrieve trajectories from the agent, or from the fallback dataset.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::FatalDataUnavailable`] only when the remote
    /// exchange failed and the fallback is disabled, missing, or unparsable.
    pub async fn retrieve(&mut self) -> Result<Vec<Trajectory>, SessionError> {
        self.retrieve_until(std::future::pending::<()>()).await
    }

    /// Like [`retrieve`](Self::retrieve), but abandons the remote exchange
    /// when `cancel` completes first. The connection is dropped and the
    /// session falls back.
    pub async fn retrieve_until<F>(&mut self, cancel: F) -> Result<Vec<Trajectory>, SessionError>
    where
        F: Future<Output = ()>,
    {
        self.state = SessionState::Idle;
        self.history = vec![SessionState::Idle];
        self.source = None;

        let budget = self.config.session_timeout();
        let outcome = {
            let remote = async {
                match budget {
                    Some(limit) => match timeout(limit, self.fetch_remote()).await {
                        Ok(result) => result,
                        Err(_) => Err(ClientError::SessionTimeout(limit.as_millis() as u64)),
                    },
                    None => self.fetch_remote().await,
                }
            };
            tokio::select! {
                result = remote => result,
                () = cancel => Err(ClientError::Cancelled),
            }
        };

        match outcome {
            Ok(trajectories) => {
                self.transition(SessionState::Complete);
                self.source = Some(DataSource::Remote);
                Ok(trajectories)
            }
            Err(cause) => {
                warn!("Remote retrieval failed ({}); using demo data", cause);
                self.enter_fallback(cause).await
            }
        }
    }

    async fn fetch_remote(&mut self) -> Result<Vec<Trajectory>, ClientError> {
        self.transition(SessionState::Connecting);
        info!("Connecting to agent at {}", self.config.connect);
        let transport = self
            .connector
            .connect(&self.config.connect, self.config.connect_timeout())
            .await?;

        let mut client = AgentClient::new(
            transport,
            self.config.receive_timeout(),
            self.config.max_frame_bytes,
        );
        let result = self.exchange(&mut client).await;
        if let Err(e) = client.close().await {
            debug!("Error closing agent connection: {}", e);
        }
        result
    }

    async fn exchange(
        &mut self,
        client: &mut AgentClient<C::Transport>,
    ) -> Result<Vec<Trajectory>, ClientError> {
        if let Some(password) = self.config.password.clone() {
            client.authenticate(&password).await?;
        }

        self.transition(SessionState::AwaitingSlotList);
        let slots = client.slot_info().await?;
        info!("Agent reported {} slot(s)", slots.len());

        let slot = select_slot(&slots)
            .cloned()
            .ok_or_else(|| ClientError::NoUsableData("no usable slots".to_string()))?;
        if slots.len() > 1 {
            debug!("Using slot {}; ignoring {} other(s)", slot.id, slots.len() - 1);
        }

        self.transition(SessionState::AwaitingPerSlotData);
        let trajectory = client.trajectory(&slot).await?;
        if trajectory.is_empty() {
            return Err(ClientError::NoUsableData(format!(
                "slot {} sent no snapshots",
                slot.id
            )));
        }
        Ok(vec![trajectory])
    }

    async fn enter_fallback(&mut self, cause: ClientError) -> Result<Vec<Trajectory>, SessionError> {
        self.transition(SessionState::Fallback);
        let remote = cause.to_string();

        if !self.config.allow_fallback {
            return Err(SessionError::FatalDataUnavailable {
                remote,
                fallback: "disabled by configuration".to_string(),
            });
        }

        let bytes = self.fallback.load().await.map_err(|e| SessionError::FatalDataUnavailable {
            remote: remote.clone(),
            fallback: format!("cannot read dataset: {}", e),
        })?;
        let trajectory = parse_dataset(&bytes, FALLBACK_SLOT_ID, self.config.max_frame_bytes)
            .map_err(|e| SessionError::FatalDataUnavailable {
                remote,
                fallback: e.to_string(),
            })?;

        info!(
            "Loaded demo trajectory: {} snapshot(s), {} atoms",
            trajectory.len(),
            trajectory.topology().atom_count()
        );
        self.source = Some(DataSource::Fallback);
        Ok(vec![trajectory])
    }
}
