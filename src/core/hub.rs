//! Hub: owns the loaded manufactures and drives them
//!
//! # Loops
//!
//! Two cooperative loops run as tasks on the hub's [`TaskTracker`]:
//!
//! - **main** cycles over manufacture ids. Each step asks the manufacture
//!   for its next ready pipe and queues the target building.
//! - **mining** cycles over miner ids that were triggered. Each step queues
//!   one miner run and drops the id.
//!
//! A processor runs up to `loop_step_budget` steps, yields to the runtime,
//! and goes on until its loop is empty or paused, then flips to idle and
//! wakes anyone waiting in [`Hub::await_for_loop`].
//!
//! # Dispatch
//!
//! ```text
//!   main / mining step ──push──▶ QueueArea ──pop (min vruntime)──▶ Facility
//!            ▲                                                       │
//!            └───────── seed main, requeue or idle ◀── completion ───┘
//! ```

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::building::Building;
use super::facility::{Completion, Facility};
use super::gear::GearRegistry;
use super::loader::{load_all_manufactures, LoadContext, LoadError, LoadReport};
use super::manufacture::Manufacture;
use super::queue_area::{QueueArea, QueueItem};
use crate::config::HubConfig;
use crate::error::{ManufactoryError, Result};
use crate::model::{BuildingId, BuildingState, ManufactureId, MinerSchedule, PipeId};
use crate::store::{PieceStore, RecordStore};
use manufactory_core_batch::{DeadLetter, Loop};

/// The two loops owned by a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopName {
    Main,
    Mining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Run,
    Idle,
}

struct LoopState<T> {
    items: Loop<T>,
    status: LoopStatus,
    paused: bool,
    /// Items seeded since they were last handed to a step
    touched: HashSet<T>,
}

struct LoopControl<T> {
    state: Mutex<LoopState<T>>,
    idle: watch::Sender<bool>,
}

impl<T: Copy + Eq + Hash> LoopControl<T> {
    fn new() -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            state: Mutex::new(LoopState {
                items: Loop::default(),
                status: LoopStatus::Idle,
                paused: false,
                touched: HashSet::new(),
            }),
            idle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seed(&self, item: T) {
        let mut state = self.lock();
        state.items.add_unique(item);
        state.touched.insert(item);
    }

    /// Claim the processor slot; true if the caller must spawn a processor.
    fn try_start(&self) -> bool {
        let mut state = self.lock();
        if state.status == LoopStatus::Run {
            return false;
        }
        state.status = LoopStatus::Run;
        state.paused = false;
        self.idle.send_replace(false);
        true
    }

    /// Next item, or None after flipping to idle when paused or empty.
    fn next_or_idle(&self) -> Option<T> {
        let mut state = self.lock();
        if state.paused || state.items.is_empty() {
            state.status = LoopStatus::Idle;
            state.paused = false;
            self.idle.send_replace(true);
            return None;
        }
        let item = state.items.next()?;
        state.touched.remove(&item);
        Some(item)
    }

    /// Drop `item` unless it was seeded again while its step ran.
    fn retire(&self, item: &T) -> bool {
        let mut state = self.lock();
        if state.touched.contains(item) {
            return false;
        }
        state.items.remove(item)
    }

    fn remove(&self, item: &T) {
        let mut state = self.lock();
        state.items.remove(item);
        state.touched.remove(item);
    }

    fn pause(&self) {
        let mut state = self.lock();
        if state.status == LoopStatus::Run {
            state.paused = true;
        }
    }

    fn status(&self) -> LoopStatus {
        self.lock().status
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }

    async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        // The sender lives as long as the hub; an error means it is gone.
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

struct HubInner {
    config: HubConfig,
    pieces: Arc<dyn PieceStore>,
    records: Arc<dyn RecordStore>,
    gears: Arc<GearRegistry>,
    manufactures: RwLock<HashMap<ManufactureId, Arc<Manufacture>>>,
    owners: RwLock<HashMap<BuildingId, ManufactureId>>,
    facility: Arc<Facility>,
    queue: Mutex<QueueArea>,
    main: LoopControl<ManufactureId>,
    mining: LoopControl<BuildingId>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Top-level coordinator. Cheap to clone; clones share everything.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        pieces: Arc<dyn PieceStore>,
        records: Arc<dyn RecordStore>,
        gears: GearRegistry,
    ) -> Self {
        let facility = Arc::new(Facility::new(config.facility_capacity));
        Self {
            inner: Arc::new(HubInner {
                config,
                pieces,
                records,
                gears: Arc::new(gears),
                manufactures: RwLock::new(HashMap::new()),
                owners: RwLock::new(HashMap::new()),
                facility,
                queue: Mutex::new(QueueArea::new()),
                main: LoopControl::new(),
                mining: LoopControl::new(),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn facility(&self) -> &Arc<Facility> {
        &self.inner.facility
    }

    /// Load every persisted manufacture and start ticking them.
    ///
    /// A manufacture that fails to load, or whose building ids clash with
    /// one already loaded, is reported in `failed` and skipped.
    pub async fn load(&self) -> Result<LoadReport> {
        let ctx = LoadContext {
            pieces: Arc::clone(&self.inner.pieces),
            records: Arc::clone(&self.inner.records),
            gears: Arc::clone(&self.inner.gears),
            options: self.inner.config.pipe_options(),
        };
        let loaded = load_all_manufactures(&ctx).await?;

        let mut report = LoadReport {
            loaded: Vec::new(),
            failed: loaded.failed,
        };
        for manufacture in loaded.loaded {
            match self.add_manufacture(Arc::clone(&manufacture)) {
                Ok(()) => report.loaded.push(manufacture),
                Err(ManufactoryError::Load {
                    manufacture: id,
                    source,
                }) => {
                    error!(manufacture_id = %id, error = %source, "Skipping manufacture");
                    report.failed.push((id, source));
                }
                Err(other) => return Err(other),
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Hub loaded manufactures"
        );
        Ok(report)
    }

    /// Register a manufacture and seed the main loop with it.
    pub fn add_manufacture(&self, manufacture: Arc<Manufacture>) -> Result<()> {
        let id = manufacture.id();
        {
            let mut manufactures = write(&self.inner.manufactures);
            let mut owners = write(&self.inner.owners);
            if manufactures.contains_key(&id) {
                return Err(ManufactoryError::Load {
                    manufacture: id,
                    source: LoadError::Store(format!("manufacture {} is already loaded", id)),
                });
            }
            if let Some(clash) = manufacture.buildings().find(|b| owners.contains_key(&b.id())) {
                return Err(ManufactoryError::Load {
                    manufacture: id,
                    source: LoadError::DuplicateBuilding(clash.id()),
                });
            }
            for building in manufacture.buildings() {
                owners.insert(building.id(), id);
            }
            manufactures.insert(id, manufacture);
        }
        self.inner.seed_main(id);
        Ok(())
    }

    pub fn manufacture(&self, id: ManufactureId) -> Option<Arc<Manufacture>> {
        self.inner.manufacture(id)
    }

    /// Loaded manufacture ids, sorted
    pub fn manufacture_ids(&self) -> Vec<ManufactureId> {
        let mut ids: Vec<ManufactureId> = read(&self.inner.manufactures).keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn building(&self, id: BuildingId) -> Option<Arc<Building>> {
        self.inner.locate(id).map(|(_, building)| building)
    }

    pub fn building_state(&self, id: BuildingId) -> Option<BuildingState> {
        self.building(id).map(|b| b.state())
    }

    /// Ask the main loop to look at the manufacture owning `building_id`.
    pub fn add_building_to_facility(&self, building_id: BuildingId) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(ManufactoryError::ShuttingDown);
        }
        let (manufacture, _) = self
            .inner
            .locate(building_id)
            .ok_or(ManufactoryError::UnknownBuilding(building_id))?;
        self.inner.seed_main(manufacture.id());
        Ok(())
    }

    /// Trigger one run of a miner.
    pub fn run_miner(&self, building_id: BuildingId) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(ManufactoryError::ShuttingDown);
        }
        let (_, building) = self
            .inner
            .locate(building_id)
            .ok_or(ManufactoryError::UnknownBuilding(building_id))?;
        if !building.is_miner() {
            return Err(ManufactoryError::NotAMiner(building_id));
        }
        self.inner.mining.seed(building_id);
        self.inner.start_loop(LoopName::Mining);
        Ok(())
    }

    /// Trigger every miner of every loaded manufacture once.
    pub fn run_all_miners(&self) -> Result<usize> {
        let miners: Vec<BuildingId> = read(&self.inner.manufactures)
            .values()
            .flat_map(|m| m.miners().map(|b| b.id()).collect::<Vec<_>>())
            .collect();
        for id in &miners {
            self.run_miner(*id)?;
        }
        Ok(miners.len())
    }

    /// Stop a loop at its next step boundary.
    pub fn pause_loop(&self, name: LoopName) {
        match name {
            LoopName::Main => self.inner.main.pause(),
            LoopName::Mining => self.inner.mining.pause(),
        }
    }

    pub fn loop_status(&self, name: LoopName) -> LoopStatus {
        match name {
            LoopName::Main => self.inner.main.status(),
            LoopName::Mining => self.inner.mining.status(),
        }
    }

    /// Items currently in a loop
    pub fn loop_len(&self, name: LoopName) -> usize {
        match name {
            LoopName::Main => self.inner.main.len(),
            LoopName::Mining => self.inner.mining.len(),
        }
    }

    /// Resolve once the loop is idle; immediately if it already is.
    pub async fn await_for_loop(&self, name: LoopName) {
        match name {
            LoopName::Main => self.inner.main.wait_idle().await,
            LoopName::Mining => self.inner.mining.wait_idle().await,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue().len()
    }

    /// Wait until both loops are idle and no building work or follow-up is
    /// left in flight.
    pub async fn drain(&self) {
        let inner = &self.inner;
        loop {
            inner.main.wait_idle().await;
            inner.mining.wait_idle().await;

            inner.tracker.close();
            inner.tracker.wait().await;
            inner.tracker.reopen();

            let settled = inner.main.status() == LoopStatus::Idle
                && inner.mining.status() == LoopStatus::Idle
                && inner.tracker.is_empty()
                && inner.facility.is_empty();
            if !settled {
                continue;
            }

            if inner.queue().is_empty() || inner.cancel.is_cancelled() {
                return;
            }
            // Queued work with nothing running: admit it and wait again.
            inner.dispatch();
            if inner.facility.is_empty() {
                warn!(queued = inner.queue().len(), "Queued work cannot be admitted");
                return;
            }
        }
    }

    /// Spawn interval triggers for miners. Stopped by [`Hub::shutdown`].
    pub fn schedule_miners(&self, schedules: &[MinerSchedule]) -> Result<usize> {
        for schedule in schedules {
            let building = self
                .building(schedule.building_id)
                .ok_or(ManufactoryError::UnknownBuilding(schedule.building_id))?;
            if !building.is_miner() {
                return Err(ManufactoryError::NotAMiner(schedule.building_id));
            }
        }

        for schedule in schedules {
            let hub = self.clone();
            let cancel = self.inner.cancel.child_token();
            let building_id = schedule.building_id;
            let every = Duration::from_secs(schedule.every_secs.max(1));

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = hub.run_miner(building_id) {
                                warn!(building_id = %building_id, error = %err, "Scheduled mining failed");
                            }
                        }
                    }
                }
                debug!(building_id = %building_id, "Miner schedule stopped");
            });
        }
        Ok(schedules.len())
    }

    pub async fn dead_letters(
        &self,
        manufacture_id: ManufactureId,
    ) -> Result<Vec<(PipeId, Vec<DeadLetter>)>> {
        let manufacture = self
            .manufacture(manufacture_id)
            .ok_or(ManufactoryError::UnknownManufacture(manufacture_id))?;
        Ok(manufacture.dead_letters().await)
    }

    /// Sync every manufacture; failures are isolated and returned.
    pub async fn sync_all(&self) -> Vec<(ManufactureId, anyhow::Error)> {
        let manufactures: Vec<Arc<Manufacture>> =
            read(&self.inner.manufactures).values().cloned().collect();

        let mut failures = Vec::new();
        for manufacture in manufactures {
            if let Err(err) = manufacture.sync().await {
                error!(
                    manufacture_id = %manufacture.id(),
                    error = %format!("{:#}", err),
                    "Sync failed"
                );
                failures.push((manufacture.id(), err));
            }
        }
        failures
    }

    /// Stop triggers and loops, wait for running work, persist cursors.
    pub async fn shutdown(&self) -> Vec<(ManufactureId, anyhow::Error)> {
        info!("Shutting down hub");
        self.inner.cancel.cancel();
        self.pause_loop(LoopName::Main);
        self.pause_loop(LoopName::Mining);
        self.drain().await;
        let failures = self.sync_all().await;
        info!(sync_failures = failures.len(), "Hub stopped");
        failures
    }
}

impl HubInner {
    fn manufacture(&self, id: ManufactureId) -> Option<Arc<Manufacture>> {
        read(&self.manufactures).get(&id).cloned()
    }

    fn locate(&self, building_id: BuildingId) -> Option<(Arc<Manufacture>, Arc<Building>)> {
        let manufacture_id = *read(&self.owners).get(&building_id)?;
        let manufacture = self.manufacture(manufacture_id)?;
        let building = Arc::clone(manufacture.building(building_id)?);
        Some((manufacture, building))
    }

    fn queue(&self) -> MutexGuard<'_, QueueArea> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seed_main(self: &Arc<Self>, id: ManufactureId) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.main.seed(id);
        self.start_loop(LoopName::Main);
    }

    fn start_loop(self: &Arc<Self>, name: LoopName) {
        if self.cancel.is_cancelled() {
            return;
        }
        let claimed = match name {
            LoopName::Main => self.main.try_start(),
            LoopName::Mining => self.mining.try_start(),
        };
        if claimed {
            debug!(loop_name = ?name, "Starting loop processor");
            let hub = Arc::clone(self);
            self.tracker.spawn(async move { hub.process(name).await });
        }
    }

    async fn process(self: Arc<Self>, name: LoopName) {
        let budget = self.config.loop_step_budget.max(1);
        loop {
            for _ in 0..budget {
                let stepped = match name {
                    LoopName::Main => match self.main.next_or_idle() {
                        Some(id) => {
                            self.main_step(id).await;
                            true
                        }
                        None => false,
                    },
                    LoopName::Mining => match self.mining.next_or_idle() {
                        Some(id) => {
                            self.mining_step(id);
                            true
                        }
                        None => false,
                    },
                };
                if !stepped {
                    debug!(loop_name = ?name, "Loop idle");
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
    }

    async fn main_step(self: &Arc<Self>, id: ManufactureId) {
        let Some(manufacture) = self.manufacture(id) else {
            self.main.remove(&id);
            return;
        };

        match manufacture.next_ready_pipe().await {
            Some(pipe) => {
                if let Some(building) = manufacture.building(pipe.to()).cloned() {
                    if building.transition(BuildingState::Idle, BuildingState::Waiting) {
                        self.queue()
                            .push(QueueItem::new(Arc::clone(&manufacture), building, Some(pipe)));
                    }
                }
            }
            None => {
                self.main.retire(&id);
            }
        }
        self.dispatch();
    }

    fn mining_step(self: &Arc<Self>, id: BuildingId) {
        self.mining.remove(&id);
        let Some((manufacture, building)) = self.locate(id) else {
            return;
        };
        if building.transition(BuildingState::Idle, BuildingState::Waiting) {
            self.queue().push(QueueItem::new(manufacture, building, None));
        } else {
            debug!(building_id = %id, "Miner busy, trigger coalesced");
        }
        self.dispatch();
    }

    /// Admit queued items while the facility has room.
    fn dispatch(self: &Arc<Self>) {
        loop {
            if self.facility.is_full() {
                return;
            }
            let exclusives = self.facility.get_exclusives();
            let Some(mut item) = self.queue().pop(&exclusives) else {
                return;
            };

            match self.facility.push(item.take_work()) {
                Ok(handle) => {
                    let hub = Arc::clone(self);
                    self.tracker.spawn(async move {
                        let completion = handle.await;
                        hub.on_completion(item, completion);
                    });
                }
                Err(err) => {
                    debug!(
                        building_id = %item.building_id(),
                        reason = %err,
                        "Admission refused, requeued"
                    );
                    self.queue().push(item);
                    return;
                }
            }
        }
    }

    fn on_completion(self: &Arc<Self>, mut item: QueueItem, completion: Completion) {
        if let Some(err) = &completion.error {
            warn!(
                building_id = %completion.building_id,
                pipe_id = ?completion.pipe_id,
                error = %err,
                "Building work failed"
            );
        }

        item.vruntime = Some(QueueArea::get_new_vruntime(completion.spent, &item));
        let building = Arc::clone(&item.building);
        let manufacture_id = item.manufacture.id();

        if completion.should_continue && !self.cancel.is_cancelled() {
            building.set_state(BuildingState::Waiting);
            self.queue().push(item);
        } else {
            building.set_state(BuildingState::Idle);
        }

        self.seed_main(manufacture_id);
        self.dispatch();
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
