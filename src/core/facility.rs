//! Facility: bounded pool running admitted building work
//!
//! `push` is the only admission point. It is idempotent per building: a
//! second push for a building with work in flight returns the same
//! completion handle. Exclusive building types and sequential manufactures
//! are enforced here, before any work starts.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, warn};

use super::building::Building;
use super::manufacture::Manufacture;
use super::pipe::Pipe;
use crate::model::{BuildingId, BuildingState, ManufactureId, Piece, PipeId};

/// Admission failures. Callers re-queue; none of these is a system fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FacilityError {
    #[error("Facility is full")]
    Full,

    #[error("Building {0} has no manufacture")]
    NoManufacture(BuildingId),

    #[error("Exclusive building type '{module}' is already running (building {building})")]
    ExclusiveConflict { module: String, building: BuildingId },

    #[error("Sequential manufacture {manufacture} already has a running building (building {building})")]
    SequentialConflict {
        manufacture: ManufactureId,
        building: BuildingId,
    },
}

/// One unit of work: a pipe tick when `pipe` is set, a miner run otherwise.
#[derive(Clone)]
pub struct WorkItem {
    pub manufacture: Arc<Manufacture>,
    pub building: Arc<Building>,
    pub pipe: Option<Arc<Pipe>>,
    /// Pre-allocated batch; drawn from the pipe at run time when None
    pub batch: Option<Vec<Piece>>,
}

/// Resolution of a completion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub building_id: BuildingId,
    pub manufacture_id: ManufactureId,
    pub pipe_id: Option<PipeId>,
    pub spent: Duration,
    /// The pipe tick found work, more is likely available
    pub should_continue: bool,
    pub produced: usize,
    pub error: Option<String>,
}

pub type CompletionHandle = Shared<BoxFuture<'static, Completion>>;

/// Ids currently blocking admission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusives {
    /// Module ids of exclusive types with a resident building
    pub types: HashSet<String>,
    /// Sequential manufactures with a resident building
    pub manufactures: HashSet<ManufactureId>,
}

#[derive(Default)]
struct Residents {
    in_flight: HashMap<BuildingId, CompletionHandle>,
    exclusive: HashMap<String, HashSet<BuildingId>>,
    sequential: HashMap<ManufactureId, HashSet<BuildingId>>,
}

pub struct Facility {
    capacity: usize,
    residents: Mutex<Residents>,
}

impl Facility {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            residents: Mutex::new(Residents::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.residents().in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn contains(&self, building_id: BuildingId) -> bool {
        self.residents().in_flight.contains_key(&building_id)
    }

    /// Handle of the work in flight for a building
    pub fn handle(&self, building_id: BuildingId) -> Option<CompletionHandle> {
        self.residents().in_flight.get(&building_id).cloned()
    }

    pub fn get_exclusives(&self) -> Exclusives {
        let residents = self.residents();
        Exclusives {
            types: residents
                .exclusive
                .iter()
                .filter(|(_, ids)| !ids.is_empty())
                .map(|(module, _)| module.clone())
                .collect(),
            manufactures: residents
                .sequential
                .iter()
                .filter(|(_, ids)| !ids.is_empty())
                .map(|(id, _)| *id)
                .collect(),
        }
    }

    /// Admit work and start it on the runtime.
    ///
    /// The building is marked running. Its state is left alone on
    /// completion; whoever awaits the handle decides what comes next.
    pub fn push(self: &Arc<Self>, work: WorkItem) -> Result<CompletionHandle, FacilityError> {
        let building_id = work.building.id();
        let manufacture_id = work.manufacture.id();
        let module = work.building.building_type().module_id.clone();
        let exclusive = work.building.is_exclusive();
        let sequential = work.manufacture.is_sequential();

        let mut residents = self.residents();
        if let Some(handle) = residents.in_flight.get(&building_id) {
            return Ok(handle.clone());
        }
        if residents.in_flight.len() >= self.capacity {
            return Err(FacilityError::Full);
        }
        if work.building.manufacture_id() != manufacture_id
            || !work.manufacture.has_building(building_id)
        {
            return Err(FacilityError::NoManufacture(building_id));
        }
        if exclusive
            && residents
                .exclusive
                .get(&module)
                .is_some_and(|ids| !ids.is_empty())
        {
            return Err(FacilityError::ExclusiveConflict {
                module,
                building: building_id,
            });
        }
        if sequential
            && residents
                .sequential
                .get(&manufacture_id)
                .is_some_and(|ids| !ids.is_empty())
        {
            return Err(FacilityError::SequentialConflict {
                manufacture: manufacture_id,
                building: building_id,
            });
        }

        work.building.set_state(BuildingState::Running);
        if exclusive {
            residents
                .exclusive
                .entry(module.clone())
                .or_default()
                .insert(building_id);
        }
        if sequential {
            residents
                .sequential
                .entry(manufacture_id)
                .or_default()
                .insert(building_id);
        }

        let pipe_id = work.pipe.as_ref().map(|p| p.id());
        let facility = Arc::clone(self);
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(execute(&work)).catch_unwind().await;
            let mut completion = Completion {
                building_id,
                manufacture_id,
                pipe_id,
                spent: started.elapsed(),
                should_continue: false,
                produced: 0,
                error: None,
            };
            match outcome {
                Ok(Ok((should_continue, produced))) => {
                    completion.should_continue = should_continue;
                    completion.produced = produced;
                }
                Ok(Err(err)) => completion.error = Some(format!("{:#}", err)),
                Err(_) => completion.error = Some("building work panicked".to_string()),
            }
            facility.finish(building_id, &module, manufacture_id);
            completion
        });

        let handle: CompletionHandle = async move {
            match task.await {
                Ok(completion) => completion,
                Err(err) => Completion {
                    building_id,
                    manufacture_id,
                    pipe_id,
                    spent: Duration::ZERO,
                    should_continue: false,
                    produced: 0,
                    error: Some(format!("building task aborted: {}", err)),
                },
            }
        }
        .boxed()
        .shared();

        residents.in_flight.insert(building_id, handle.clone());
        debug!(
            building_id = %building_id,
            manufacture_id = %manufacture_id,
            resident = residents.in_flight.len(),
            "Admitted building"
        );
        Ok(handle)
    }

    fn finish(&self, building_id: BuildingId, module: &str, manufacture_id: ManufactureId) {
        let mut residents = self.residents();
        residents.in_flight.remove(&building_id);
        if let Some(ids) = residents.exclusive.get_mut(module) {
            ids.remove(&building_id);
            if ids.is_empty() {
                residents.exclusive.remove(module);
            }
        }
        if let Some(ids) = residents.sequential.get_mut(&manufacture_id) {
            ids.remove(&building_id);
            if ids.is_empty() {
                residents.sequential.remove(&manufacture_id);
            }
        }
    }

    fn residents(&self) -> std::sync::MutexGuard<'_, Residents> {
        self.residents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns `(should_continue, produced)`.
async fn execute(work: &WorkItem) -> anyhow::Result<(bool, usize)> {
    let manufacture = &work.manufacture;
    match (&work.pipe, &work.batch) {
        (Some(pipe), Some(batch)) => {
            let report = manufacture
                .pipe_tick_with_batch(pipe, batch.clone())
                .await?;
            Ok((true, report.produced))
        }
        (Some(pipe), None) => match manufacture.pipe_tick(pipe).await? {
            Some(report) => Ok((true, report.produced)),
            None => Ok((false, 0)),
        },
        (None, _) => {
            let report = manufacture.mining(Some(work.building.id())).await?;
            if !report.failed.is_empty() {
                warn!(
                    building_id = %work.building.id(),
                    logs = ?report.logs,
                    "Miner run failed"
                );
            }
            Ok((false, report.produced))
        }
    }
}
