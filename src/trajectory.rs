//! Mapping decoded PyON trees onto slot and trajectory records.
//!
//! The agent's message types and their payload shapes:
//!
//! ```text
//! slots       [{"id": "00", "status": "RUNNING", ...}, ...]
//! topology    {"atoms": [["C", ...] | {"symbol": "C", ...}, ...],
//!              "bonds": [[0, 1], ...],
//!              "positions": [[x, y, z], ...]}        (positions optional)
//! checkpoint  {"index": 3, "positions": [[x, y, z] | {"x":..,"y":..,"z":..}, ...]}
//!             or a bare [[x, y, z], ...]
//! end         no more data for the slot
//! ```
//!
//! Extra keys are ignored everywhere. Missing required keys and values of
//! the wrong shape are reported as [`BuildError`]s naming the key and the
//! message type.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Bond, SlotDescriptor, SlotStatus, Topology, Trajectory};
use crate::pyon::Value;

/// Well-formed notation that does not describe valid trajectory data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    /// A required mapping key is absent.
    #[error("{message_type} message is missing field '{key}'")]
    FieldMissing {
        key: &'static str,
        message_type: &'static str,
    },

    /// A field holds a value of the wrong shape.
    #[error("{message_type} field '{key}' should be {expected}, found {found}")]
    FieldType {
        key: &'static str,
        message_type: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    /// Checkpoint index does not advance past the newest snapshot.
    #[error("Checkpoint {index} arrived after checkpoint {last}")]
    ProtocolOrder { index: u64, last: u64 },

    /// Checkpoint atom count differs from the topology.
    #[error("Checkpoint has {found} positions but topology has {expected} atoms")]
    TopologyMismatch { expected: usize, found: usize },

    /// Snapshot bonds differ from the trajectory's topology.
    #[error("Snapshot {index} has different bonds than its trajectory")]
    BondsChanged { index: u64 },

    /// Bond joins an atom to itself or references a missing atom.
    #[error("Invalid bond ({a}, {b}) for {atoms} atoms")]
    InvalidBond { a: usize, b: usize, atoms: usize },

    /// Checkpoint received before any topology.
    #[error("Checkpoint received before topology")]
    MissingTopology,

    /// Message type not valid at this point of the exchange.
    #[error("Unexpected {0} message")]
    UnexpectedMessage(String),
}

/// Message types understood by the client, parsed from the frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Slots,
    Topology,
    Checkpoint,
    End,
    Other(String),
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "slots" => MessageKind::Slots,
            "topology" => MessageKind::Topology,
            "checkpoint" | "positions" => MessageKind::Checkpoint,
            "end" => MessageKind::End,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

const SLOTS: &str = "slots";
const TOPOLOGY: &str = "topology";
const CHECKPOINT: &str = "checkpoint";

fn field<'v>(
    value: &'v Value,
    key: &'static str,
    message_type: &'static str,
) -> Result<&'v Value, BuildError> {
    value
        .get(key)
        .ok_or(BuildError::FieldMissing { key, message_type })
}

fn type_error(
    key: &'static str,
    message_type: &'static str,
    expected: &'static str,
    found: &Value,
) -> BuildError {
    BuildError::FieldType {
        key,
        message_type,
        expected,
        found: found.kind(),
    }
}

fn sequence<'v>(
    value: &'v Value,
    key: &'static str,
    message_type: &'static str,
) -> Result<&'v [Value], BuildError> {
    value
        .as_sequence()
        .ok_or_else(|| type_error(key, message_type, "a sequence", value))
}

/// Parse a slot listing.
///
/// An empty list is valid and means no slots are configured.
pub fn parse_slots(value: &Value) -> Result<Vec<SlotDescriptor>, BuildError> {
    let entries = sequence(value, "slots", SLOTS)?;
    entries
        .iter()
        .map(|entry| {
            if entry.as_mapping().is_none() {
                return Err(type_error("slots", SLOTS, "a mapping", entry));
            }
            let id = match field(entry, "id", SLOTS)? {
                Value::String(s) => s.clone(),
                Value::Number(n) if n.as_u64().is_some() => n.as_str().to_string(),
                other => return Err(type_error("id", SLOTS, "a string or integer", other)),
            };
            let status = field(entry, "status", SLOTS)?;
            let status = status
                .as_str()
                .ok_or_else(|| type_error("status", SLOTS, "a string", status))?;
            Ok(SlotDescriptor::new(id, SlotStatus::from_tag(status)))
        })
        .collect()
}

/// Parse a topology message.
///
/// Returns the positions too when the agent bundles the first frame with
/// the topology.
pub fn parse_topology(value: &Value) -> Result<(Topology, Option<Vec<[f64; 3]>>), BuildError> {
    if value.as_mapping().is_none() {
        return Err(type_error("topology", TOPOLOGY, "a mapping", value));
    }

    let atoms = sequence(field(value, "atoms", TOPOLOGY)?, "atoms", TOPOLOGY)?;
    let elements = atoms
        .iter()
        .map(parse_atom_tag)
        .collect::<Result<Vec<_>, _>>()?;

    let mut bonds = Vec::new();
    if let Some(raw) = value.get("bonds") {
        let mut seen = HashSet::new();
        for pair in sequence(raw, "bonds", TOPOLOGY)? {
            let bond = parse_bond(pair, elements.len())?;
            if seen.insert(bond) {
                bonds.push(bond);
            } else {
                let (a, b) = bond.indices();
                warn!("Dropping duplicate bond ({}, {}) in topology", a, b);
            }
        }
    }

    let positions = match value.get("positions") {
        Some(raw) if !raw.is_null() => Some(parse_positions(raw, TOPOLOGY)?),
        _ => None,
    };

    Ok((Topology { elements, bonds }, positions))
}

fn parse_atom_tag(atom: &Value) -> Result<String, BuildError> {
    let tag = match atom {
        Value::Mapping(_) => match atom.get("symbol").or_else(|| atom.get("type")) {
            Some(tag) => tag,
            None => {
                return Err(BuildError::FieldMissing {
                    key: "symbol",
                    message_type: TOPOLOGY,
                })
            }
        },
        Value::Sequence(items) => items.first().ok_or(BuildError::FieldMissing {
            key: "symbol",
            message_type: TOPOLOGY,
        })?,
        other => return Err(type_error("atoms", TOPOLOGY, "a mapping or sequence", other)),
    };
    tag.as_str()
        .map(str::to_string)
        .ok_or_else(|| type_error("symbol", TOPOLOGY, "a string", tag))
}

fn parse_bond(pair: &Value, atom_count: usize) -> Result<Bond, BuildError> {
    let ends = match pair.as_sequence() {
        Some(ends) if ends.len() == 2 => ends,
        _ => return Err(type_error("bonds", TOPOLOGY, "a pair of atom indices", pair)),
    };
    let index = |v: &Value| {
        v.as_u64()
            .map(|i| i as usize)
            .ok_or_else(|| type_error("bonds", TOPOLOGY, "a non-negative integer", v))
    };
    Bond::new(index(&ends[0])?, index(&ends[1])?, atom_count)
}

fn parse_positions(value: &Value, message_type: &'static str) -> Result<Vec<[f64; 3]>, BuildError> {
    sequence(value, "positions", message_type)?
        .iter()
        .map(|p| parse_position(p, message_type))
        .collect()
}

fn parse_position(value: &Value, message_type: &'static str) -> Result<[f64; 3], BuildError> {
    match value {
        Value::Sequence(coords) if coords.len() == 3 => {
            let mut out = [0.0; 3];
            for (slot, coord) in out.iter_mut().zip(coords) {
                *slot = coord
                    .as_f64()
                    .ok_or_else(|| type_error("positions", message_type, "a number", coord))?;
            }
            Ok(out)
        }
        Value::Mapping(_) => {
            let mut out = [0.0; 3];
            for (slot, key) in out.iter_mut().zip(["x", "y", "z"]) {
                let coord = field(value, key, message_type)?;
                *slot = coord
                    .as_f64()
                    .ok_or_else(|| type_error(key, message_type, "a number", coord))?;
            }
            Ok(out)
        }
        other => Err(type_error(
            "positions",
            message_type,
            "an [x, y, z] triple or coordinate mapping",
            other,
        )),
    }
}

/// A decoded checkpoint before it is attached to a trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Explicit index, if the agent sent one.
    pub index: Option<u64>,
    pub positions: Vec<[f64; 3]>,
}

/// Parse a checkpoint message.
pub fn parse_checkpoint(value: &Value) -> Result<Checkpoint, BuildError> {
    match value {
        Value::Sequence(_) => Ok(Checkpoint {
            index: None,
            positions: parse_positions(value, CHECKPOINT)?,
        }),
        Value::Mapping(_) => {
            let index = match value.get("index") {
                None | Some(Value::Null) => None,
                Some(raw) => Some(
                    raw.as_u64()
                        .ok_or_else(|| type_error("index", CHECKPOINT, "a non-negative integer", raw))?,
                ),
            };
            let positions = parse_positions(field(value, "positions", CHECKPOINT)?, CHECKPOINT)?;
            Ok(Checkpoint { index, positions })
        }
        other => Err(type_error(
            "checkpoint",
            CHECKPOINT,
            "a mapping or sequence",
            other,
        )),
    }
}

/// What the builder did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Data was added; more may follow.
    Continue,
    /// Message carried nothing for this trajectory.
    Ignored,
    /// The agent signalled that the slot has no more data.
    Finished,
}

/// Accumulates one slot's trajectory from a stream of messages.
#[derive(Debug)]
pub struct TrajectoryBuilder {
    slot_id: String,
    trajectory: Option<Trajectory>,
}

impl TrajectoryBuilder {
    pub fn new(slot_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            trajectory: None,
        }
    }

    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    /// Number of snapshots accumulated so far.
    pub fn snapshot_count(&self) -> usize {
        self.trajectory.as_ref().map_or(0, Trajectory::len)
    }

    /// Apply one decoded message.
    ///
    /// A failing checkpoint leaves the trajectory as it was.
    pub fn apply(&mut self, kind: &MessageKind, value: &Value) -> Result<Progress, BuildError> {
        match kind {
            MessageKind::Topology => {
                let (topology, positions) = parse_topology(value)?;
                if let Some(existing) = &self.trajectory {
                    if existing.topology() == &topology && positions.is_none() {
                        debug!("Ignoring repeated topology for slot {}", self.slot_id);
                        return Ok(Progress::Ignored);
                    }
                    return Err(BuildError::UnexpectedMessage(TOPOLOGY.to_string()));
                }
                debug!(
                    "Slot {} topology: {} atoms, {} bonds",
                    self.slot_id,
                    topology.atom_count(),
                    topology.bonds.len()
                );
                let mut trajectory = Trajectory::new(self.slot_id.clone(), topology);
                if let Some(positions) = positions {
                    let snapshot = trajectory.topology().instantiate(0, &positions)?;
                    trajectory.push(snapshot)?;
                }
                self.trajectory = Some(trajectory);
                Ok(Progress::Continue)
            }
            MessageKind::Checkpoint => {
                let checkpoint = parse_checkpoint(value)?;
                let trajectory = self.trajectory.as_mut().ok_or(BuildError::MissingTopology)?;
                let index = checkpoint.index.unwrap_or_else(|| trajectory.next_index());
                let snapshot = trajectory.topology().instantiate(index, &checkpoint.positions)?;
                trajectory.push(snapshot)?;
                debug!("Slot {} checkpoint {}", self.slot_id, index);
                Ok(Progress::Continue)
            }
            MessageKind::End => Ok(Progress::Finished),
            MessageKind::Slots => Err(BuildError::UnexpectedMessage(SLOTS.to_string())),
            MessageKind::Other(tag) => {
                debug!("Ignoring {} message for slot {}", tag, self.slot_id);
                Ok(Progress::Ignored)
            }
        }
    }

    /// The trajectory built so far, or `None` if no topology arrived.
    pub fn finish(self) -> Option<Trajectory> {
        self.trajectory
    }
}
