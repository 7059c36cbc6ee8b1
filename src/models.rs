//! Domain models for slot and trajectory data.
//!
//! These are the strongly-typed records the rendering side consumes. They
//! are built from decoded PyON trees by [`crate::trajectory`] and serialize
//! with serde for the JSON dump in the binary.

use std::cmp::Ordering;

use serde::Serialize;

use crate::trajectory::BuildError;

/// Slot execution state as reported by the agent.
///
/// Includes `Unknown` for forward-compatibility with new states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Running,
    Ready,
    Paused,
    Finishing,
    Download,
    Upload,
    Stopping,
    Failed,
    /// Forward-compatible fallback for unknown states
    Unknown(String),
}

impl SlotStatus {
    /// Parse the agent's status tag, case-insensitively.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => SlotStatus::Running,
            "READY" => SlotStatus::Ready,
            "PAUSED" => SlotStatus::Paused,
            "FINISHING" => SlotStatus::Finishing,
            "DOWNLOAD" => SlotStatus::Download,
            "UPLOAD" => SlotStatus::Upload,
            "STOPPING" => SlotStatus::Stopping,
            "FAILED" => SlotStatus::Failed,
            _ => SlotStatus::Unknown(tag.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SlotStatus::Running => "RUNNING",
            SlotStatus::Ready => "READY",
            SlotStatus::Paused => "PAUSED",
            SlotStatus::Finishing => "FINISHING",
            SlotStatus::Download => "DOWNLOAD",
            SlotStatus::Upload => "UPLOAD",
            SlotStatus::Stopping => "STOPPING",
            SlotStatus::Failed => "FAILED",
            SlotStatus::Unknown(tag) => tag,
        }
    }

    /// Whether a slot in this state can be asked for trajectory data.
    pub fn is_usable(&self) -> bool {
        !matches!(self, SlotStatus::Failed)
    }
}

/// One simulation slot reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotDescriptor {
    pub id: String,
    pub status: SlotStatus,
}

impl SlotDescriptor {
    pub fn new(id: impl Into<String>, status: SlotStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }
}

/// Order slot identifiers: integral ids numerically ("2" < "10"), then any
/// non-numeric ids lexically.
pub fn compare_slot_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// A positioned atom.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Atom {
    /// Element symbol or force-field type tag.
    pub element: String,
    pub position: [f64; 3],
}

impl Atom {
    pub fn new(element: impl Into<String>, position: [f64; 3]) -> Self {
        Self {
            element: element.into(),
            position,
        }
    }
}

/// Unordered pair of atom indices, stored as `(low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Bond {
    a: usize,
    b: usize,
}

impl Bond {
    /// Create a bond between two distinct atoms of a structure with
    /// `atom_count` atoms.
    pub fn new(i: usize, j: usize, atom_count: usize) -> Result<Self, BuildError> {
        if i == j || i >= atom_count || j >= atom_count {
            return Err(BuildError::InvalidBond {
                a: i,
                b: j,
                atoms: atom_count,
            });
        }
        Ok(Self {
            a: i.min(j),
            b: i.max(j),
        })
    }

    pub fn indices(&self) -> (usize, usize) {
        (self.a, self.b)
    }
}

/// Atom types and connectivity of one slot, without coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Topology {
    pub elements: Vec<String>,
    pub bonds: Vec<Bond>,
}

impl Topology {
    pub fn atom_count(&self) -> usize {
        self.elements.len()
    }

    /// Combine the topology with one frame of coordinates.
    pub fn instantiate(&self, index: u64, positions: &[[f64; 3]]) -> Result<Snapshot, BuildError> {
        if positions.len() != self.elements.len() {
            return Err(BuildError::TopologyMismatch {
                expected: self.elements.len(),
                found: positions.len(),
            });
        }
        let atoms = self
            .elements
            .iter()
            .zip(positions)
            .map(|(element, position)| Atom::new(element.clone(), *position))
            .collect();
        Ok(Snapshot {
            index,
            atoms,
            bonds: self.bonds.clone(),
        })
    }
}

/// Atom positions at one point of the simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Position in the animation sequence.
    pub index: u64,
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
}

/// Ordered snapshots of one slot.
///
/// Every snapshot shares the trajectory's topology; only positions differ
/// from frame to frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub slot_id: String,
    topology: Topology,
    snapshots: Vec<Snapshot>,
}

impl Trajectory {
    pub fn new(slot_id: impl Into<String>, topology: Topology) -> Self {
        Self {
            slot_id: slot_id.into(),
            topology,
            snapshots: Vec::new(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Index of the newest snapshot.
    pub fn last_index(&self) -> Option<u64> {
        self.snapshots.last().map(|s| s.index)
    }

    /// Index the next snapshot gets when the agent omits one.
    pub fn next_index(&self) -> u64 {
        self.last_index().map_or(0, |i| i + 1)
    }

    /// Append a snapshot.
    ///
    /// # Errors
    ///
    /// Fails without modifying the trajectory if the index does not exceed
    /// the last one, or if the snapshot's atoms or bonds differ from the
    /// topology.
    pub fn push(&mut self, snapshot: Snapshot) -> Result<(), BuildError> {
        if let Some(last) = self.last_index() {
            if snapshot.index <= last {
                return Err(BuildError::ProtocolOrder {
                    index: snapshot.index,
                    last,
                });
            }
        }
        if snapshot.atoms.len() != self.topology.atom_count() {
            return Err(BuildError::TopologyMismatch {
                expected: self.topology.atom_count(),
                found: snapshot.atoms.len(),
            });
        }
        if snapshot.bonds != self.topology.bonds {
            return Err(BuildError::BondsChanged {
                index: snapshot.index,
            });
        }
        self.snapshots.push(snapshot);
        Ok(())
    }
}
