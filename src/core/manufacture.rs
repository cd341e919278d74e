//! Manufacture: one pipeline graph of buildings and pipes
//!
//! Pipes are visited round-robin through a [`Loop`]. Walks over the loop
//! are explicit step loops bounded by the number of pipes, with the first
//! empty position kept as a visited sentinel, so a drained manufacture costs
//! at most one full traversal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info};

use super::building::Building;
use super::pipe::Pipe;
use crate::model::{BuildingId, BuildingState, ManufactureId, Piece, PipeId};
use crate::store::PieceStore;
use manufactory_core_batch::{DeadLetter, Loop};

/// Summary of one building run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub building_id: BuildingId,
    /// None for miner runs
    pub pipe_id: Option<PipeId>,
    /// Input pieces taken from the pipe
    pub consumed: usize,
    pub ok: usize,
    pub errors: usize,
    /// Output pieces saved
    pub produced: usize,
    pub logs: Vec<String>,
}

/// Result of [`Manufacture::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A pipe produced work
    Continue(TickReport),
    /// Every pipe came up empty this round
    Drained,
}

/// Aggregate of a [`Manufacture::mining`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiningReport {
    /// Miners that ran
    pub miners: usize,
    /// Miners whose gear finished
    pub succeeded: Vec<BuildingId>,
    /// Miners whose gear returned an error or panicked; their output is dropped
    pub failed: Vec<BuildingId>,
    /// Pieces saved across every miner
    pub produced: usize,
    pub logs: Vec<String>,
}

pub struct Manufacture {
    id: ManufactureId,
    name: String,
    sequential: bool,
    buildings: HashMap<BuildingId, Arc<Building>>,
    building_order: Vec<BuildingId>,
    pipes: Vec<Arc<Pipe>>,
    pipe_loop: Mutex<Loop<usize>>,
    pieces: Arc<dyn PieceStore>,
}

impl Manufacture {
    /// Assemble a manufacture; graph integrity is checked by the loader.
    pub fn new(
        id: ManufactureId,
        name: impl Into<String>,
        sequential: bool,
        buildings: Vec<Arc<Building>>,
        pipes: Vec<Arc<Pipe>>,
        pieces: Arc<dyn PieceStore>,
    ) -> Self {
        let building_order = buildings.iter().map(|b| b.id()).collect();
        let buildings = buildings.into_iter().map(|b| (b.id(), b)).collect();
        let pipe_loop = Loop::new((0..pipes.len()).collect());
        Self {
            id,
            name: name.into(),
            sequential,
            buildings,
            building_order,
            pipes,
            pipe_loop: Mutex::new(pipe_loop),
            pieces,
        }
    }

    pub fn id(&self) -> ManufactureId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    pub fn building(&self, id: BuildingId) -> Option<&Arc<Building>> {
        self.buildings.get(&id)
    }

    pub fn has_building(&self, id: BuildingId) -> bool {
        self.buildings.contains_key(&id)
    }

    /// Buildings in record order
    pub fn buildings(&self) -> impl Iterator<Item = &Arc<Building>> {
        self.building_order
            .iter()
            .filter_map(|id| self.buildings.get(id))
    }

    pub fn pipes(&self) -> &[Arc<Pipe>] {
        &self.pipes
    }

    pub fn pipe(&self, id: PipeId) -> Option<&Arc<Pipe>> {
        self.pipes.iter().find(|p| p.id() == id)
    }

    pub fn miners(&self) -> impl Iterator<Item = &Arc<Building>> {
        self.buildings().filter(|b| b.is_miner())
    }

    /// Tick the next productive pipe, running its target building inline.
    pub async fn tick(&self) -> anyhow::Result<TickOutcome> {
        let mut sentinel: Option<usize> = None;
        for _ in 0..self.pipes.len() {
            let Some(index) = self.next_pipe_index() else {
                break;
            };
            if sentinel == Some(index) {
                break;
            }

            let pipe = Arc::clone(&self.pipes[index]);
            match self.pipe_tick(&pipe).await? {
                Some(report) => return Ok(TickOutcome::Continue(report)),
                None => {
                    sentinel.get_or_insert(index);
                }
            }
        }
        Ok(TickOutcome::Drained)
    }

    /// Next pipe, in loop order, whose target building is idle and which has
    /// work. None after one full traversal without a match.
    pub async fn next_ready_pipe(&self) -> Option<Arc<Pipe>> {
        let mut sentinel: Option<usize> = None;
        for _ in 0..self.pipes.len() {
            let index = self.next_pipe_index()?;
            if sentinel == Some(index) {
                return None;
            }

            let pipe = &self.pipes[index];
            let target_idle = self
                .buildings
                .get(&pipe.to())
                .is_some_and(|b| b.state() == BuildingState::Idle);
            if target_idle && pipe.has_work().await {
                return Some(Arc::clone(pipe));
            }
            sentinel.get_or_insert(index);
        }
        None
    }

    /// Pull a batch from `pipe` and run its target. None if the pipe was empty.
    pub async fn pipe_tick(&self, pipe: &Arc<Pipe>) -> anyhow::Result<Option<TickReport>> {
        let building = self.target(pipe)?;
        let batch = pipe.get_batch(building.batch_size()).await?;
        if batch.is_empty() {
            return Ok(None);
        }
        self.pipe_tick_with_batch(pipe, batch).await.map(Some)
    }

    /// Run the target of `pipe` over a batch already allocated from it.
    pub async fn pipe_tick_with_batch(
        &self,
        pipe: &Arc<Pipe>,
        batch: Vec<Piece>,
    ) -> anyhow::Result<TickReport> {
        let building = self.target(pipe)?;
        let consumed = batch.len();
        let input_ids: Vec<_> = batch.iter().map(|p| p.id).collect();

        let report = building.run(batch).await;
        let output = vec![(building.id(), report.produced.clone())];
        let produced = match self.store_output(output).await {
            Ok(produced) => produced,
            Err(err) => {
                // Output is lost, so the input must be delivered again.
                pipe.fail_batch(&input_ids).await;
                return Err(err);
            }
        };

        pipe.release_batch(&report.consumed()).await;
        pipe.fail_batch(&report.errors).await;
        pipe.checkpoint().await?;

        debug!(
            manufacture_id = %self.id,
            pipe_id = %pipe.id(),
            building_id = %building.id(),
            consumed,
            ok = report.ok.len(),
            errors = report.errors.len(),
            produced,
            "Pipe tick finished"
        );

        Ok(TickReport {
            building_id: building.id(),
            pipe_id: Some(pipe.id()),
            consumed,
            ok: report.ok.len() + report.unreported.len(),
            errors: report.errors.len(),
            produced,
            logs: report.logs,
        })
    }

    /// Run every miner, or just `miner` when given.
    ///
    /// Output of all miners is saved with one store call after the last
    /// miner finished; a failed save loses the output of the whole call.
    pub async fn mining(&self, miner: Option<BuildingId>) -> anyhow::Result<MiningReport> {
        let miners: Vec<Arc<Building>> = self
            .miners()
            .filter(|b| miner.map_or(true, |wanted| wanted == b.id()))
            .cloned()
            .collect();

        let mut summary = MiningReport::default();
        let mut output = Vec::new();
        for building in miners {
            let report = building.run(Vec::new()).await;
            summary.miners += 1;
            if report.failed {
                summary.failed.push(building.id());
            } else {
                summary.succeeded.push(building.id());
            }
            summary.logs.extend(report.logs);
            if !report.produced.is_empty() {
                output.push((building.id(), report.produced));
            }
        }

        summary.produced = self
            .store_output(output)
            .await
            .with_context(|| format!("saving mined pieces of manufacture {}", self.id))?;

        if summary.miners > 0 {
            info!(
                manufacture_id = %self.id,
                miners = summary.miners,
                failed = summary.failed.len(),
                produced = summary.produced,
                "Mining finished"
            );
        }
        Ok(summary)
    }

    /// Dead letters of every pipe that has any
    pub async fn dead_letters(&self) -> Vec<(PipeId, Vec<DeadLetter>)> {
        let mut letters = Vec::new();
        for pipe in &self.pipes {
            let dead = pipe.dead_letters().await;
            if !dead.is_empty() {
                letters.push((pipe.id(), dead));
            }
        }
        letters
    }

    /// Sync every pipe, stopping at the first failure.
    pub async fn sync(&self) -> anyhow::Result<()> {
        for pipe in &self.pipes {
            pipe.sync().await?;
        }
        Ok(())
    }

    fn next_pipe_index(&self) -> Option<usize> {
        self.pipe_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next()
    }

    fn target(&self, pipe: &Pipe) -> anyhow::Result<&Arc<Building>> {
        self.buildings.get(&pipe.to()).ok_or_else(|| {
            anyhow::anyhow!(
                "pipe {} targets building {} outside manufacture {}",
                pipe.id(),
                pipe.to(),
                self.id
            )
        })
    }

    /// Save pushed output in one call and offer it to the outgoing pipes of
    /// the producing buildings.
    async fn store_output(&self, output: Vec<(BuildingId, Vec<Value>)>) -> anyhow::Result<usize> {
        let output: Vec<_> = output
            .into_iter()
            .filter(|(_, payloads)| !payloads.is_empty())
            .collect();
        if output.is_empty() {
            return Ok(0);
        }
        let producers: HashSet<BuildingId> = output.iter().map(|(id, _)| *id).collect();
        let saved = self.pieces.save_all(output).await?;
        for pipe in self.pipes.iter().filter(|p| producers.contains(&p.from())) {
            pipe.discover(&saved).await;
        }
        Ok(saved.len())
    }
}

impl fmt::Debug for Manufacture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manufacture")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sequential", &self.sequential)
            .field("buildings", &self.building_order)
            .field("pipes", &self.pipes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gear::{BuildingType, Gear, GearContext, GearOutput};
    use crate::core::loader::{load_manufacture, LoadContext};
    use crate::core::pipe::PipeOptions;
    use crate::core::test_support;
    use crate::model::{
        BatchSize, BuildingKind, BuildingRecord, ManufactureRecord, PipeOrdering, PipeRecord,
    };
    use crate::store::{MemoryStore, PieceFilter};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn chain(store: &Arc<MemoryStore>) -> (Arc<Manufacture>, crate::gears::PrinterSink) {
        let (gears, sink) = test_support::gears();
        let record = test_support::chain_record(ManufactureId(1), false);
        (test_support::manufacture(store, gears, &record).await, sink)
    }

    #[tokio::test]
    async fn test_empty_chain_drains() {
        let store = Arc::new(MemoryStore::new());
        let (manufacture, _sink) = chain(&store).await;
        assert_eq!(manufacture.tick().await.unwrap(), TickOutcome::Drained);
        assert!(manufacture.next_ready_pipe().await.is_none());
        assert_eq!(manufacture.miners().count(), 1);
    }

    #[tokio::test]
    async fn test_mining_then_ticks_run_whole_chain() {
        let store = Arc::new(MemoryStore::new());
        let (manufacture, sink) = chain(&store).await;

        let mined = manufacture.mining(None).await.unwrap();
        assert_eq!(mined.miners, 1);
        assert_eq!(mined.succeeded, vec![BuildingId(1)]);
        assert_eq!(mined.produced, 10);
        assert_eq!(store.count(BuildingId(1)).await, 10);

        let mut ticks = 0;
        while let TickOutcome::Continue(report) = manufacture.tick().await.unwrap() {
            assert!(report.consumed > 0);
            ticks += 1;
            assert!(ticks < 100, "chain never drained");
        }

        assert_eq!(sink.ints(), (0..10).map(|i| i * 2).collect::<Vec<i64>>());
        assert_eq!(store.count(BuildingId(2)).await, 10);
        assert!(manufacture.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_mining_only_runs_requested_miner() {
        let store = Arc::new(MemoryStore::new());
        let (manufacture, _sink) = chain(&store).await;

        let report = manufacture.mining(Some(BuildingId(3))).await.unwrap();
        assert_eq!(report.miners, 0);
        assert_eq!(store.count(BuildingId(1)).await, 0);
    }

    /// Counts store writes made through the trait.
    struct CountingStore {
        inner: Arc<MemoryStore>,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl PieceStore for CountingStore {
        async fn find(&self, filter: &PieceFilter) -> anyhow::Result<Vec<Piece>> {
            self.inner.find(filter).await
        }

        async fn save(
            &self,
            building_id: BuildingId,
            payloads: Vec<Value>,
        ) -> anyhow::Result<Vec<Piece>> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(building_id, payloads).await
        }

        async fn save_all(
            &self,
            output: Vec<(BuildingId, Vec<Value>)>,
        ) -> anyhow::Result<Vec<Piece>> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save_all(output).await
        }
    }

    struct BrokenMiner;

    #[async_trait]
    impl Gear for BrokenMiner {
        async fn run(&self, ctx: GearContext) -> anyhow::Result<GearOutput> {
            ctx.push.push(json!({ "value": -1 }));
            anyhow::bail!("quarry flooded")
        }
    }

    /// Miners 1 and 2 both feed printer 3.
    fn two_miner_record(second_module: &str) -> ManufactureRecord {
        let building = |id: i64, module: &str, run_config: Value| BuildingRecord {
            id: BuildingId(id),
            name: module.to_string(),
            module_id: module.to_string(),
            batch_size: BatchSize::Count(10),
            niceness: 0,
            run_config,
            meta: Value::Null,
        };
        let pipe = |id: i64, from: i64| PipeRecord {
            id: PipeId(id),
            from: BuildingId(from),
            to: BuildingId(3),
            ordering: PipeOrdering::Direct,
            max_attempts: 1,
        };
        ManufactureRecord {
            id: ManufactureId(1),
            name: "quarries".to_string(),
            sequential: false,
            buildings: vec![
                building(1, "sequence", json!({ "count": 3 })),
                building(2, second_module, json!({ "count": 4, "start": 100 })),
                building(3, "printer", Value::Null),
            ],
            pipes: vec![pipe(10, 1), pipe(11, 2)],
        }
    }

    async fn counted_manufacture(
        store: &Arc<MemoryStore>,
        record: &ManufactureRecord,
    ) -> (Arc<Manufacture>, Arc<CountingStore>) {
        let counting = Arc::new(CountingStore {
            inner: Arc::clone(store),
            saves: AtomicUsize::new(0),
        });
        let (mut gears, _sink) = test_support::gears();
        gears.register(
            BuildingType::new("broken", BuildingKind::Miner),
            Arc::new(BrokenMiner),
        );
        let ctx = LoadContext {
            pieces: counting.clone(),
            records: store.clone(),
            gears: Arc::new(gears),
            options: PipeOptions::default(),
        };
        let manufacture = Arc::new(load_manufacture(record, &ctx).await.unwrap());
        (manufacture, counting)
    }

    #[tokio::test]
    async fn test_mining_saves_every_miner_in_one_call() {
        let store = Arc::new(MemoryStore::new());
        let record = two_miner_record("sequence");
        let (manufacture, counting) = counted_manufacture(&store, &record).await;

        let report = manufacture.mining(None).await.unwrap();
        assert_eq!(report.miners, 2);
        assert_eq!(report.succeeded, vec![BuildingId(1), BuildingId(2)]);
        assert!(report.failed.is_empty());
        assert_eq!(report.produced, 7);
        assert_eq!(report.logs.len(), 2);
        assert_eq!(counting.saves.load(Ordering::SeqCst), 1);

        assert_eq!(store.count(BuildingId(1)).await, 3);
        assert_eq!(store.count(BuildingId(2)).await, 4);
        for pipe in manufacture.pipes() {
            assert!(pipe.has_work().await, "pipe {} saw no output", pipe.id());
        }
    }

    #[tokio::test]
    async fn test_failed_miner_does_not_drop_the_others() {
        let store = Arc::new(MemoryStore::new());
        let record = two_miner_record("broken");
        let (manufacture, counting) = counted_manufacture(&store, &record).await;

        let report = manufacture.mining(None).await.unwrap();
        assert_eq!(report.succeeded, vec![BuildingId(1)]);
        assert_eq!(report.failed, vec![BuildingId(2)]);
        assert_eq!(report.produced, 3);
        assert!(report.logs.iter().any(|line| line.contains("quarry flooded")));
        assert_eq!(counting.saves.load(Ordering::SeqCst), 1);
        assert_eq!(store.count(BuildingId(2)).await, 0);
        assert!(!manufacture.pipe(PipeId(11)).unwrap().has_work().await);
    }

    #[tokio::test]
    async fn test_next_ready_pipe_skips_busy_targets() {
        let store = Arc::new(MemoryStore::new());
        let (manufacture, _sink) = chain(&store).await;
        manufacture.mining(None).await.unwrap();

        let pipe = manufacture.next_ready_pipe().await.unwrap();
        assert_eq!(pipe.id(), PipeId(10));

        let target = manufacture.building(BuildingId(2)).unwrap();
        target.set_state(BuildingState::Waiting);
        assert!(manufacture.next_ready_pipe().await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_pieces_become_dead_letters() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(BuildingId(1), vec![json!({"value": 1}), json!({"other": true})])
            .await
            .unwrap();
        let (manufacture, sink) = chain(&store).await;

        while let TickOutcome::Continue(_) = manufacture.tick().await.unwrap() {}

        assert_eq!(sink.ints(), vec![2]);
        let dead = manufacture.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, PipeId(10));
        assert_eq!(dead[0].1[0].piece_id, 1);
    }
}
