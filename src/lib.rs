//! Atomata client library
//!
//! Retrieves molecular trajectories from a Folding@home agent's command
//! server for display:
//!
//! - `ipc` - transport, message framing and the command client
//! - `pyon` - decoder and encoder for the agent's PyON notation
//! - `trajectory` - mapping decoded messages onto slots and trajectories
//! - `models` - slot, atom, topology and trajectory records
//! - `session` - one retrieval pass with offline fallback
//! - `config` - TOML and environment configuration
//!
//! # Example
//!
//! ```ignore
//! use atomata::{config::ClientConfig, session::Session};
//!
//! let mut session = Session::tcp(ClientConfig::from_env()?);
//! for trajectory in session.retrieve().await? {
//!     println!("slot {}: {} snapshots", trajectory.slot_id, trajectory.len());
//! }
//! ```

pub mod config;
pub mod ipc;
pub mod models;
pub mod pyon;
pub mod session;
pub mod trajectory;
