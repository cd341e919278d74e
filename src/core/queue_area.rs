//! QueueArea: fair-share ready queue in front of the facility
//!
//! Modeled on CFS virtual-runtime accounting. Every item carries a
//! `vruntime`; the eligible item with the smallest one is admitted next.
//! A building's weight is `1024 / 1.25^niceness` and a run of `ms`
//! milliseconds advances its vruntime by `floor(ms * 1024 * 1024 / weight)`,
//! so favoured (low niceness) buildings age slower and come back sooner.
//! Run time is measured in microseconds, so sub-millisecond runs still cost
//! their fraction of a millisecond.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::building::Building;
use super::facility::{Exclusives, WorkItem};
use super::manufacture::Manufacture;
use super::pipe::Pipe;
use crate::model::{BuildingId, BuildingState, Piece};

/// Weight of niceness 0.
pub const NICE_0_WEIGHT: f64 = 1024.0;

const NICE_STEP: f64 = 1.25;
const MIN_NICE: i32 = -20;
const MAX_NICE: i32 = 19;

#[derive(Clone)]
pub struct QueueItem {
    pub manufacture: Arc<Manufacture>,
    pub building: Arc<Building>,
    pub pipe: Option<Arc<Pipe>>,
    pub batch: Option<Vec<Piece>>,
    pub niceness: i32,
    /// None until the item is first pushed
    pub vruntime: Option<u64>,
}

impl QueueItem {
    /// Unscheduled item for a pipe tick (`pipe` set) or a miner run.
    pub fn new(
        manufacture: Arc<Manufacture>,
        building: Arc<Building>,
        pipe: Option<Arc<Pipe>>,
    ) -> Self {
        let niceness = building.niceness();
        Self {
            manufacture,
            building,
            pipe,
            batch: None,
            niceness,
            vruntime: None,
        }
    }

    pub fn with_vruntime(mut self, vruntime: u64) -> Self {
        self.vruntime = Some(vruntime);
        self
    }

    pub fn building_id(&self) -> BuildingId {
        self.building.id()
    }

    /// Work item for the facility; the batch moves out of the queue item.
    pub fn take_work(&mut self) -> WorkItem {
        WorkItem {
            manufacture: Arc::clone(&self.manufacture),
            building: Arc::clone(&self.building),
            pipe: self.pipe.clone(),
            batch: self.batch.take(),
        }
    }

    fn is_eligible(&self, exclusives: &Exclusives) -> bool {
        let building = &self.building;
        if building.is_exclusive() && exclusives.types.contains(&building.building_type().module_id)
        {
            return false;
        }
        if self.manufacture.is_sequential()
            && exclusives.manufactures.contains(&self.manufacture.id())
        {
            return false;
        }
        building.state() != BuildingState::Running
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("building", &self.building.id())
            .field("pipe", &self.pipe.as_ref().map(|p| p.id()))
            .field("niceness", &self.niceness)
            .field("vruntime", &self.vruntime)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct QueueArea {
    items: Vec<QueueItem>,
}

impl QueueArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue; an unscheduled item enters at the current minimum vruntime.
    pub fn push(&mut self, mut item: QueueItem) {
        if item.vruntime.is_none() {
            item.vruntime = Some(self.min_vruntime().unwrap_or(0));
        }
        self.items.push(item);
    }

    /// Remove and return the eligible item with the smallest vruntime.
    ///
    /// Ties go to the item queued first.
    pub fn pop(&mut self, exclusives: &Exclusives) -> Option<QueueItem> {
        let index = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_eligible(exclusives))
            .min_by_key(|(index, item)| (item.vruntime.unwrap_or(0), *index))
            .map(|(index, _)| index)?;
        Some(self.items.remove(index))
    }

    pub fn min_vruntime(&self) -> Option<u64> {
        self.items.iter().filter_map(|item| item.vruntime).min()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, building_id: BuildingId) -> bool {
        self.items.iter().any(|item| item.building_id() == building_id)
    }

    /// Vruntime after `cpu_time` of service.
    pub fn get_new_vruntime(cpu_time: Duration, item: &QueueItem) -> u64 {
        let delta = vruntime_delta(cpu_time, item.niceness);
        item.vruntime.unwrap_or(0).saturating_add(delta)
    }
}

/// Scheduling weight of a niceness (clamped to -20..=19).
pub fn weight(niceness: i32) -> f64 {
    NICE_0_WEIGHT / NICE_STEP.powi(niceness.clamp(MIN_NICE, MAX_NICE))
}

/// `floor(ms * 1024 * 1.25^niceness)` with `ms` fractional, i.e. time
/// scaled by `NICE_0_WEIGHT / weight(niceness)` in units of a nice-0
/// millisecond.
pub fn vruntime_delta(cpu_time: Duration, niceness: i32) -> u64 {
    let scale = NICE_STEP.powi(niceness.clamp(MIN_NICE, MAX_NICE));
    let micros = cpu_time.as_micros() as f64;
    (micros * NICE_0_WEIGHT * scale / 1000.0).floor() as u64
}
