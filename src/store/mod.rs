//! Storage collaborators of the execution core
//!
//! The core never talks to a database directly. It goes through two traits:
//!
//! - [`PieceStore`]: finds and saves pieces (heap discovery, batch payloads,
//!   building output)
//! - [`RecordStore`]: loads pipeline graphs and reads/writes per-pipe cursor
//!   snapshots
//!
//! [`MemoryStore`] implements both and backs the CLI and the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{BuildingId, ManufactureRecord, MinerSchedule, Piece, PieceId, PipeId};
use manufactory_core_batch::CursorSnapshot;

pub mod memory;

pub use memory::MemoryStore;

/// Query over the pieces of one building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceFilter {
    pub building_id: BuildingId,
    /// Only these ids (None = any)
    pub ids: Option<Vec<PieceId>>,
    /// Only pieces created at or after this instant
    pub created_after: Option<DateTime<Utc>>,
    /// Skip ids inside this inclusive range
    pub exclude_range: Option<(PieceId, PieceId)>,
}

impl PieceFilter {
    pub fn building(building_id: BuildingId) -> Self {
        Self {
            building_id,
            ids: None,
            created_after: None,
            exclude_range: None,
        }
    }

    pub fn with_ids(mut self, ids: Vec<PieceId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn created_after(mut self, instant: DateTime<Utc>) -> Self {
        self.created_after = Some(instant);
        self
    }

    /// Exclude `[first, last]` when both cursors are known.
    pub fn outside(mut self, first: Option<PieceId>, last: Option<PieceId>) -> Self {
        if let (Some(first), Some(last)) = (first, last) {
            self.exclude_range = Some((first, last));
        }
        self
    }

    /// Whether `piece` satisfies every clause of the filter.
    pub fn matches(&self, piece: &Piece) -> bool {
        if piece.building_id != self.building_id {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&piece.id) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if piece.created_at < after {
                return false;
            }
        }
        if let Some((first, last)) = self.exclude_range {
            if first <= piece.id && piece.id <= last {
                return false;
            }
        }
        true
    }
}

/// Piece persistence.
///
/// `save` assigns ids: dense and increasing per building, starting at 0.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Pieces matching `filter`, ascending by id
    async fn find(&self, filter: &PieceFilter) -> anyhow::Result<Vec<Piece>>;

    /// Ids only; backends should override this to skip payload loading
    async fn find_ids(&self, filter: &PieceFilter) -> anyhow::Result<Vec<PieceId>> {
        Ok(self.find(filter).await?.into_iter().map(|p| p.id).collect())
    }

    /// Persist output payloads of one building, returning the stored pieces
    async fn save(&self, building_id: BuildingId, payloads: Vec<Value>)
        -> anyhow::Result<Vec<Piece>>;

    /// Persist the output of several buildings in one call.
    ///
    /// Backends with transactions should override this to write atomically;
    /// the default saves building by building.
    async fn save_all(
        &self,
        output: Vec<(BuildingId, Vec<Value>)>,
    ) -> anyhow::Result<Vec<Piece>> {
        let mut saved = Vec::new();
        for (building_id, payloads) in output {
            saved.extend(self.save(building_id, payloads).await?);
        }
        Ok(saved)
    }
}

/// Pipeline graph and cursor persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every persisted manufacture
    async fn load_manufactures(&self) -> anyhow::Result<Vec<ManufactureRecord>>;

    /// Cursor snapshot of a pipe, None if it never ran
    async fn load_cursor(&self, pipe_id: PipeId) -> anyhow::Result<Option<CursorSnapshot>>;

    async fn save_cursor(&self, pipe_id: PipeId, snapshot: &CursorSnapshot) -> anyhow::Result<()>;

    /// Miner trigger bindings
    async fn load_schedules(&self) -> anyhow::Result<Vec<MinerSchedule>> {
        Ok(Vec::new())
    }
}
