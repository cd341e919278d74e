/*!
 * Data model: identifiers, pieces and the persisted pipeline records
 */

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use manufactory_core_batch::{PieceId, PipeOrdering, DEFAULT_MAX_ATTEMPTS};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifier of a building
    BuildingId
);
id_type!(
    /// Identifier of a pipe
    PipeId
);
id_type!(
    /// Identifier of a manufacture
    ManufactureId
);

/// Immutable unit of data produced by a building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    /// Dense and increasing per producing building
    pub id: PieceId,
    pub building_id: BuildingId,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// How many pieces a building takes per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchSize {
    /// Fixed number of pieces
    Count(usize),
    /// Share (1..=100) of whatever the pipe can currently offer
    Percentage(u8),
    /// Everything up to the configured ceiling
    Unbounded,
}

impl Default for BatchSize {
    fn default() -> Self {
        BatchSize::Count(10)
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchSize::Count(n) => write!(f, "{}", n),
            BatchSize::Percentage(p) => write!(f, "{}%", p),
            BatchSize::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Role of a building in its pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildingKind {
    /// Originates pieces, takes no input
    Miner,
    /// Transforms input into output
    #[default]
    Factory,
    /// Sink
    Printer,
    /// Routing / filtering
    Logic,
}

impl fmt::Display for BuildingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildingKind::Miner => write!(f, "miner"),
            BuildingKind::Factory => write!(f, "factory"),
            BuildingKind::Printer => write!(f, "printer"),
            BuildingKind::Logic => write!(f, "logic"),
        }
    }
}

/// Scheduling state of a building.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildingState {
    Idle,
    /// Queued for the facility
    Waiting,
    /// Admitted and executing
    Running,
}

impl BuildingState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            BuildingState::Idle => 0,
            BuildingState::Waiting => 1,
            BuildingState::Running => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => BuildingState::Waiting,
            2 => BuildingState::Running,
            _ => BuildingState::Idle,
        }
    }
}

impl fmt::Display for BuildingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildingState::Idle => write!(f, "idle"),
            BuildingState::Waiting => write!(f, "waiting"),
            BuildingState::Running => write!(f, "running"),
        }
    }
}

/// Persisted building configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRecord {
    pub id: BuildingId,
    #[serde(default)]
    pub name: String,
    /// Key into the gear registry
    pub module_id: String,
    #[serde(default)]
    pub batch_size: BatchSize,
    /// Scheduling bias, -20 (favoured) to 19
    #[serde(default)]
    pub niceness: i32,
    #[serde(default)]
    pub run_config: Value,
    #[serde(default)]
    pub meta: Value,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Persisted pipe configuration (cursor state is stored separately).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeRecord {
    pub id: PipeId,
    pub from: BuildingId,
    pub to: BuildingId,
    #[serde(default)]
    pub ordering: PipeOrdering,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Persisted pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManufactureRecord {
    pub id: ManufactureId,
    #[serde(default)]
    pub name: String,
    /// At most one building of this manufacture runs at a time
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub buildings: Vec<BuildingRecord>,
    #[serde(default)]
    pub pipes: Vec<PipeRecord>,
}

/// Periodic trigger of a miner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerSchedule {
    pub building_id: BuildingId,
    pub every_secs: u64,
}
