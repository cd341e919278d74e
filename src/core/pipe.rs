//! Pipe: directed edge between two buildings
//!
//! A pipe owns the [`BatchLedger`] of its edge and the getter for its
//! ordering. It turns allocated ids into piece payloads, applies the
//! receiving building's batch-size policy, and keeps the persisted cursor
//! snapshot in step with memory.
//!
//! # Persistence
//!
//! The pipe remembers the cursors it last wrote. If the persisted cursors
//! ever differ from those, someone else moved them and the in-memory ledger
//! is rebuilt from the persisted record instead of being merged.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::model::{BatchSize, BuildingId, Piece, PieceId, PipeId, PipeOrdering, PipeRecord};
use crate::store::{PieceFilter, PieceStore, RecordStore};
use manufactory_core_batch::{
    BatchGetter, BatchLedger, CursorSnapshot, DeadLetter, Draw, RecycleOutcome,
};

/// Tuning shared by every pipe of a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// Heap scans only consider pieces this recent
    pub lookback: chrono::Duration,
    /// Upper bound on ids fetched by percentage and unbounded batches
    pub percentage_ceiling: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            lookback: chrono::Duration::days(90),
            percentage_ceiling: 1000,
        }
    }
}

/// What a `sync` call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Snapshot written; `discovered` new heap ids
    Persisted { discovered: usize },
    /// Persisted cursors had moved; ledger rebuilt from them
    Rebuilt { discovered: usize, restored: usize },
}

type Cursors = (Option<PieceId>, Option<PieceId>);

struct PipeState {
    ledger: BatchLedger,
    last_written: Cursors,
}

pub struct Pipe {
    id: PipeId,
    from: BuildingId,
    to: BuildingId,
    ordering: PipeOrdering,
    max_attempts: u32,
    options: PipeOptions,
    getter: Box<dyn BatchGetter>,
    state: Mutex<PipeState>,
    pieces: Arc<dyn PieceStore>,
    records: Arc<dyn RecordStore>,
}

impl Pipe {
    /// Build a pipe from its record and the persisted cursor snapshot.
    ///
    /// Holds found in the snapshot belong to a previous process; they go
    /// back to the recycle pool without a penalty before the heap is scanned.
    pub async fn load(
        record: &PipeRecord,
        options: PipeOptions,
        pieces: Arc<dyn PieceStore>,
        records: Arc<dyn RecordStore>,
    ) -> anyhow::Result<Self> {
        let snapshot = records.load_cursor(record.id).await?.unwrap_or_default();
        let mut ledger = BatchLedger::from_snapshot(&snapshot, record.max_attempts);
        let restored = ledger.restore_holds();
        if restored > 0 {
            info!(
                pipe_id = %record.id,
                restored,
                "Restored in-flight pieces from a previous run"
            );
        }

        let pipe = Self {
            id: record.id,
            from: record.from,
            to: record.to,
            ordering: record.ordering,
            max_attempts: ledger.max_attempts(),
            options,
            getter: record.ordering.getter(),
            state: Mutex::new(PipeState {
                ledger,
                last_written: snapshot.cursors(),
            }),
            pieces,
            records,
        };

        {
            let mut state = pipe.state.lock().await;
            let discovered = pipe.scan(&mut state.ledger).await?;
            debug!(pipe_id = %pipe.id, discovered, "Pipe loaded");
        }
        Ok(pipe)
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn from(&self) -> BuildingId {
        self.from
    }

    pub fn to(&self) -> BuildingId {
        self.to
    }

    pub fn ordering(&self) -> PipeOrdering {
        self.ordering
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// In-memory check: could the next batch be non-empty?
    pub async fn has_work(&self) -> bool {
        self.state.lock().await.ledger.has_work()
    }

    /// Allocate the next batch and load its payloads.
    ///
    /// Returned pieces are held until passed to [`Pipe::release_batch`] or
    /// [`Pipe::fail_batch`].
    pub async fn get_batch(&self, size: BatchSize) -> anyhow::Result<Vec<Piece>> {
        let mut state = self.state.lock().await;

        let ids = match size {
            BatchSize::Count(n) => {
                let draw = self.draw(&mut state.ledger, n);
                if draw.len() < n {
                    // Put the short draw back and look for more before settling.
                    self.getter.recycle(&mut state.ledger, &draw.ids, true);
                    self.sync_locked(&mut state).await?;
                    self.draw(&mut state.ledger, n).ids
                } else {
                    draw.ids
                }
            }
            BatchSize::Percentage(pct) => {
                let draw = self.draw(&mut state.ledger, self.options.percentage_ceiling);
                let pct = usize::from(pct.clamp(1, 100));
                let take = (draw.len() * pct).div_ceil(100);
                let (kept, rest) = draw.ids.split_at(take.min(draw.len()));
                self.getter.recycle(&mut state.ledger, rest, true);
                kept.to_vec()
            }
            BatchSize::Unbounded => {
                self.draw(&mut state.ledger, self.options.percentage_ceiling)
                    .ids
            }
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.materialize(&mut state.ledger, ids).await
    }

    /// Mark pieces as processed.
    pub async fn release_batch(&self, ids: &[PieceId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut state = self.state.lock().await;
        self.getter.release(&mut state.ledger, ids)
    }

    /// Return failed pieces to the recycle pool, costing one attempt each.
    pub async fn fail_batch(&self, ids: &[PieceId]) -> RecycleOutcome {
        if ids.is_empty() {
            return RecycleOutcome::default();
        }
        let mut state = self.state.lock().await;
        let outcome = self.getter.recycle(&mut state.ledger, ids, false);
        self.report_exhausted(&outcome);
        outcome
    }

    /// Offer freshly saved upstream pieces to the heap without a store scan.
    pub async fn discover(&self, pieces: &[Piece]) -> usize {
        let ids = pieces
            .iter()
            .filter(|p| p.building_id == self.from)
            .map(|p| p.id);
        let mut state = self.state.lock().await;
        state.ledger.extend_heap(ids)
    }

    /// Reconcile with the persisted record, persist, and rescan the heap.
    pub async fn sync(&self) -> anyhow::Result<SyncOutcome> {
        let mut state = self.state.lock().await;
        self.sync_locked(&mut state).await
    }

    /// Like [`Pipe::sync`] without the heap scan; used after every run.
    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(restored) = self.rebuild_if_diverged(&mut state).await? {
            self.scan(&mut state.ledger).await?;
            debug!(pipe_id = %self.id, restored, "Checkpoint rebuilt the pipe");
            return Ok(());
        }
        self.persist(&mut state).await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.ledger.dead_letters()
    }

    /// Give dead letters another chance. Returns how many were revived.
    pub async fn revive(&self, ids: &[PieceId]) -> usize {
        self.state.lock().await.ledger.revive(ids)
    }

    pub async fn snapshot(&self) -> CursorSnapshot {
        self.state.lock().await.ledger.snapshot()
    }

    fn draw(&self, ledger: &mut BatchLedger, size: usize) -> Draw {
        let draw = self.getter.get_batch(ledger, size);
        if !draw.gaps.recycled.is_empty() {
            debug!(
                pipe_id = %self.id,
                gaps = draw.gaps.recycled.len(),
                "Cursor skipped unseen ids, queued them for delivery"
            );
        }
        if draw.gaps.overflow > 0 {
            error!(
                pipe_id = %self.id,
                span = draw.gaps.overflow,
                "Cursor jumped over a gap too wide to recycle, its pieces will not be delivered"
            );
        }
        draw
    }

    /// Join ids against the store, keeping draw order.
    ///
    /// Ids without a payload are recycled with a penalty so they end up as
    /// dead letters instead of being retried forever.
    async fn materialize(
        &self,
        ledger: &mut BatchLedger,
        ids: Vec<PieceId>,
    ) -> anyhow::Result<Vec<Piece>> {
        let filter = PieceFilter::building(self.from).with_ids(ids.clone());
        let found = match self.pieces.find(&filter).await {
            Ok(found) => found,
            Err(err) => {
                self.getter.recycle(ledger, &ids, true);
                return Err(err);
            }
        };
        let mut by_id: HashMap<PieceId, Piece> = found.into_iter().map(|p| (p.id, p)).collect();

        let mut batch = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match by_id.remove(&id) {
                Some(piece) => batch.push(piece),
                None => missing.push(id),
            }
        }

        if !missing.is_empty() {
            warn!(
                pipe_id = %self.id,
                missing = ?missing,
                "Pieces vanished from the store, recycling with penalty"
            );
            let outcome = self.getter.recycle(ledger, &missing, false);
            self.report_exhausted(&outcome);
        }
        Ok(batch)
    }

    async fn scan(&self, ledger: &mut BatchLedger) -> anyhow::Result<usize> {
        let filter = PieceFilter::building(self.from)
            .created_after(Utc::now() - self.options.lookback)
            .outside(ledger.first_cursor(), ledger.last_cursor());
        let ids = self.pieces.find_ids(&filter).await?;
        Ok(ledger.extend_heap(ids))
    }

    async fn persist(&self, state: &mut PipeState) -> anyhow::Result<()> {
        let snapshot = state.ledger.snapshot();
        self.records.save_cursor(self.id, &snapshot).await?;
        state.last_written = snapshot.cursors();
        Ok(())
    }

    /// Rebuild from the persisted record when its cursors are not ours.
    ///
    /// Returns the number of holds moved to the recycle pool, or None if the
    /// record matched.
    async fn rebuild_if_diverged(&self, state: &mut PipeState) -> anyhow::Result<Option<usize>> {
        let persisted = self
            .records
            .load_cursor(self.id)
            .await?
            .unwrap_or_default();
        if persisted.cursors() == state.last_written {
            return Ok(None);
        }

        error!(
            pipe_id = %self.id,
            persisted = ?persisted.cursors(),
            expected = ?state.last_written,
            "Persisted cursors diverged, rebuilding pipe state"
        );

        let in_flight = state.ledger.held_entries();
        let mut ledger = BatchLedger::from_snapshot(&persisted, self.max_attempts);
        let restored = ledger.adopt_in_flight(&in_flight);
        state.ledger = ledger;
        self.persist(state).await?;
        Ok(Some(restored))
    }

    async fn sync_locked(&self, state: &mut PipeState) -> anyhow::Result<SyncOutcome> {
        match self.rebuild_if_diverged(state).await? {
            Some(restored) => {
                let discovered = self.scan(&mut state.ledger).await?;
                Ok(SyncOutcome::Rebuilt {
                    discovered,
                    restored,
                })
            }
            None => {
                self.persist(state).await?;
                let discovered = self.scan(&mut state.ledger).await?;
                Ok(SyncOutcome::Persisted { discovered })
            }
        }
    }

    fn report_exhausted(&self, outcome: &RecycleOutcome) {
        if !outcome.exhausted.is_empty() {
            warn!(
                pipe_id = %self.id,
                pieces = ?outcome.exhausted,
                max_attempts = self.max_attempts,
                "Pieces exhausted their attempts and became dead letters"
            );
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("ordering", &self.ordering)
            .finish()
    }
}
