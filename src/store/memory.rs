//! In-memory backend for [`PieceStore`] and [`RecordStore`]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{PieceFilter, PieceStore, RecordStore};
use crate::model::{BuildingId, ManufactureRecord, MinerSchedule, Piece, PieceId, PipeId};
use manufactory_core_batch::CursorSnapshot;

/// Process-local store; everything is lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pieces: RwLock<HashMap<BuildingId, Vec<Piece>>>,
    manufactures: RwLock<Vec<ManufactureRecord>>,
    cursors: RwLock<HashMap<PipeId, CursorSnapshot>>,
    schedules: RwLock<Vec<MinerSchedule>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with pipeline graphs and miner schedules
    pub fn with_records(manufactures: Vec<ManufactureRecord>, schedules: Vec<MinerSchedule>) -> Self {
        Self {
            manufactures: RwLock::new(manufactures),
            schedules: RwLock::new(schedules),
            ..Self::default()
        }
    }

    pub async fn insert_manufacture(&self, record: ManufactureRecord) {
        let mut manufactures = self.manufactures.write().await;
        manufactures.retain(|m| m.id != record.id);
        manufactures.push(record);
    }

    /// Insert a fully formed piece, keeping the per-building list sorted.
    pub async fn insert_piece(&self, piece: Piece) {
        let mut pieces = self.pieces.write().await;
        let list = pieces.entry(piece.building_id).or_default();
        match list.binary_search_by_key(&piece.id, |p| p.id) {
            Ok(index) => list[index] = piece,
            Err(index) => list.insert(index, piece),
        }
    }

    /// All pieces of a building, ascending by id
    pub async fn pieces_of(&self, building_id: BuildingId) -> Vec<Piece> {
        self.pieces
            .read()
            .await
            .get(&building_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, building_id: BuildingId) -> usize {
        self.pieces
            .read()
            .await
            .get(&building_id)
            .map_or(0, Vec::len)
    }

    /// Overwrite a cursor snapshot as another process would.
    pub async fn put_cursor(&self, pipe_id: PipeId, snapshot: CursorSnapshot) {
        self.cursors.write().await.insert(pipe_id, snapshot);
    }
}

#[async_trait]
impl PieceStore for MemoryStore {
    async fn find(&self, filter: &PieceFilter) -> anyhow::Result<Vec<Piece>> {
        let pieces = self.pieces.read().await;
        Ok(pieces
            .get(&filter.building_id)
            .map(|list| list.iter().filter(|p| filter.matches(p)).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_ids(&self, filter: &PieceFilter) -> anyhow::Result<Vec<PieceId>> {
        let pieces = self.pieces.read().await;
        Ok(pieces
            .get(&filter.building_id)
            .map(|list| {
                list.iter()
                    .filter(|p| filter.matches(p))
                    .map(|p| p.id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save(
        &self,
        building_id: BuildingId,
        payloads: Vec<Value>,
    ) -> anyhow::Result<Vec<Piece>> {
        let mut pieces = self.pieces.write().await;
        Ok(append(&mut pieces, building_id, payloads))
    }

    /// Every building's output lands under a single write lock.
    async fn save_all(
        &self,
        output: Vec<(BuildingId, Vec<Value>)>,
    ) -> anyhow::Result<Vec<Piece>> {
        let mut pieces = self.pieces.write().await;
        Ok(output
            .into_iter()
            .flat_map(|(building_id, payloads)| append(&mut pieces, building_id, payloads))
            .collect())
    }
}

fn append(
    pieces: &mut HashMap<BuildingId, Vec<Piece>>,
    building_id: BuildingId,
    payloads: Vec<Value>,
) -> Vec<Piece> {
    let list = pieces.entry(building_id).or_default();
    let mut next_id = list.last().map_or(0, |p| p.id + 1);
    let created_at = Utc::now();

    let mut saved = Vec::with_capacity(payloads.len());
    for data in payloads {
        let piece = Piece {
            id: next_id,
            building_id,
            data,
            created_at,
        };
        next_id += 1;
        list.push(piece.clone());
        saved.push(piece);
    }
    saved
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_manufactures(&self) -> anyhow::Result<Vec<ManufactureRecord>> {
        Ok(self.manufactures.read().await.clone())
    }

    async fn load_cursor(&self, pipe_id: PipeId) -> anyhow::Result<Option<CursorSnapshot>> {
        Ok(self.cursors.read().await.get(&pipe_id).cloned())
    }

    async fn save_cursor(&self, pipe_id: PipeId, snapshot: &CursorSnapshot) -> anyhow::Result<()> {
        self.cursors.write().await.insert(pipe_id, snapshot.clone());
        Ok(())
    }

    async fn load_schedules(&self) -> anyhow::Result<Vec<MinerSchedule>> {
        Ok(self.schedules.read().await.clone())
    }
}
