//! Command client for the agent's command server.
//!
//! This module provides `AgentClient`, which owns one transport, writes
//! protocol commands and turns the agent's answers into slot listings and
//! trajectories.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::framing::{FrameError, FrameReader, RawMessage};
use super::transport::{Transport, TransportError};
use crate::models::{SlotDescriptor, Trajectory};
use crate::pyon::{SyntaxError, Value};
use crate::trajectory::{parse_slots, BuildError, MessageKind, Progress, TrajectoryBuilder};

/// Errors from one exchange with the agent.
///
/// All of these are recoverable: the session logs them and falls back to
/// the bundled dataset.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A payload is not well-formed notation.
    #[error("Malformed {message_type} payload: {source}")]
    Syntax {
        message_type: String,
        #[source]
        source: SyntaxError,
    },

    /// A payload is well-formed but does not match its message shape.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The agent hung up before the expected message arrived.
    #[error("Connection closed before {0} arrived")]
    Disconnected(&'static str),

    /// The exchange completed but produced nothing worth showing.
    #[error("No usable data: {0}")]
    NoUsableData(String),

    /// The whole-session budget ran out.
    #[error("Session timed out after {0}ms")]
    SessionTimeout(u64),

    /// The caller abandoned the retrieval.
    #[error("Retrieval cancelled")]
    Cancelled,
}

impl ClientError {
    /// Decode a message payload, tagging syntax errors with the message type.
    pub fn decode_payload(message: &RawMessage) -> Result<Value, ClientError> {
        message.decode().map_err(|source| ClientError::Syntax {
            message_type: message.message_type.clone(),
            source,
        })
    }
}

/// Client for one connection to the agent.
///
/// # Example
///
/// ```ignore
/// let mut client = AgentClient::new(transport, Duration::from_secs(5), DEFAULT_MAX_FRAME_BYTES);
/// let slots = client.slot_info().await?;
/// let trajectory = client.trajectory(&slots[0]).await?;
/// client.close().await;
/// ```
pub struct AgentClient<T: Transport> {
    reader: FrameReader<T>,
}

impl<T: Transport> AgentClient<T> {
    pub fn new(transport: T, receive_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            reader: FrameReader::new(transport, receive_timeout, max_frame_bytes),
        }
    }

    /// Send one newline-terminated command.
    pub async fn send_command(&mut self, command: &str) -> Result<(), ClientError> {
        debug!("-> {}", command);
        let line = format!("{}\n", command);
        self.reader.transport_mut().send(line.as_bytes()).await?;
        Ok(())
    }

    /// Send the pre-shared password.
    pub async fn authenticate(&mut self, password: &str) -> Result<(), ClientError> {
        debug!("-> auth ********");
        let line = format!("auth {}\n", password);
        self.reader.transport_mut().send(line.as_bytes()).await?;
        Ok(())
    }

    /// Read the next message from the agent, `None` on orderly close.
    pub async fn next_message(&mut self) -> Result<Option<RawMessage>, ClientError> {
        let message = self.reader.next_message().await?;
        if let Some(message) = &message {
            debug!(
                "<- {} ({} bytes)",
                message.message_type,
                message.payload.len()
            );
        }
        Ok(message)
    }

    /// Request and parse the slot listing.
    ///
    /// Messages of other types arriving first are skipped.
    pub async fn slot_info(&mut self) -> Result<Vec<SlotDescriptor>, ClientError> {
        self.send_command("slot-info").await?;
        loop {
            let Some(message) = self.next_message().await? else {
                return Err(ClientError::Disconnected("slot listing"));
            };
            if MessageKind::from_tag(&message.message_type) != MessageKind::Slots {
                debug!("Skipping {} message while awaiting slots", message.message_type);
                continue;
            }
            let value = ClientError::decode_payload(&message)?;
            return Ok(parse_slots(&value)?);
        }
    }

    /// Request one slot's trajectory and collect it.
    ///
    /// Collection stops at an `end` message, when the agent closes the
    /// connection, or when the agent goes quiet after at least one snapshot
    /// has arrived.
    pub async fn trajectory(&mut self, slot: &SlotDescriptor) -> Result<Trajectory, ClientError> {
        self.send_command(&format!("trajectory {}", slot.id)).await?;
        let mut builder = TrajectoryBuilder::new(slot.id.clone());

        loop {
            let message = match self.next_message().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(ClientError::Frame(FrameError::Transport(TransportError::Timeout(ms))))
                    if builder.snapshot_count() > 0 =>
                {
                    debug!("Agent idle for {}ms, treating slot {} as complete", ms, slot.id);
                    break;
                }
                Err(e) => return Err(e),
            };

            let kind = MessageKind::from_tag(&message.message_type);
            match kind {
                MessageKind::End => break,
                MessageKind::Other(_) | MessageKind::Slots => {
                    debug!("Skipping {} message while awaiting trajectory", message.message_type);
                    continue;
                }
                MessageKind::Topology | MessageKind::Checkpoint => {}
            }

            let value = ClientError::decode_payload(&message)?;
            if builder.apply(&kind, &value)? == Progress::Finished {
                break;
            }
        }

        let trajectory = builder.finish().ok_or_else(|| {
            ClientError::NoUsableData(format!("slot {} sent no topology", slot.id))
        })?;
        info!(
            "Received {} snapshot(s) for slot {}",
            trajectory.len(),
            trajectory.slot_id
        );
        Ok(trajectory)
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.reader.transport_mut().close().await?;
        Ok(())
    }
}
