//! Protocol client for the compute agent's command server.
//!
//! The agent listens on a TCP port (36330 by default) and speaks a simple
//! line-oriented protocol: the client writes newline-terminated text
//! commands, the agent answers with self-delimiting PyON messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  bytes  ┌─────────────┐ RawMessage ┌──────────┐ Value ┌───────────────────┐
//! │  Transport   │ ──────► │ FrameReader │ ─────────► │   pyon   │ ────► │ TrajectoryBuilder │
//! │ (TcpStream)  │         │             │            │ decoder  │       │                   │
//! └──────────────┘         └─────────────┘            └──────────┘       └───────────────────┘
//! ```
//!
//! # Protocol
//!
//! Every message starts with a header line naming its type, followed by a
//! payload and an optional `---` terminator line:
//!
//! ```text
//! PyON 1 slots
//! [{"id": "00", "status": "RUNNING"}]
//! ---
//! ```
//!
//! The agent's greeting banner and `> ` prompts are interleaved with the
//! messages and skipped by the reader.
//!
//! # Usage
//!
//! ```ignore
//! use atomata::ipc::{AgentClient, Connector, Endpoint, TcpConnector};
//!
//! let transport = TcpConnector.connect(&Endpoint::default(), timeout).await?;
//! let mut client = AgentClient::new(transport, receive_timeout, max_frame_bytes);
//! let slots = client.slot_info().await?;
//! ```

mod client;
mod framing;
mod transport;

pub use client::{AgentClient, ClientError};
pub use framing::{FrameDecoder, FrameError, FrameReader, RawMessage, DEFAULT_MAX_FRAME_BYTES};
pub use transport::{
    Connector, Endpoint, EndpointParseError, TcpConnector, TcpTransport, Transport,
    TransportError, DEFAULT_PORT,
};
