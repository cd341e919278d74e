//! Building: one pipeline node and a single run of its gear

use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::gear::{BuildingType, Gear, GearContext, PushHandle};
use crate::model::{
    BatchSize, BuildingId, BuildingRecord, BuildingState, ManufactureId, Piece, PieceId,
};

/// Result of one gear run, normalized against the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Input ids reported as processed
    pub ok: Vec<PieceId>,
    /// Input ids reported as failed
    pub errors: Vec<PieceId>,
    /// Input ids the gear did not mention; treated as consumed
    pub unreported: Vec<PieceId>,
    /// Payloads pushed through the side channel
    pub produced: Vec<Value>,
    pub logs: Vec<String>,
    /// The gear returned an error or panicked
    pub failed: bool,
}

impl RunReport {
    /// Ids that leave the pipe for good (ok + unreported)
    pub fn consumed(&self) -> Vec<PieceId> {
        self.ok.iter().chain(&self.unreported).copied().collect()
    }
}

pub struct Building {
    id: BuildingId,
    name: String,
    manufacture_id: ManufactureId,
    batch_size: BatchSize,
    niceness: i32,
    run_config: Value,
    meta: Value,
    building_type: BuildingType,
    gear: Arc<dyn Gear>,
    state: AtomicU8,
}

impl Building {
    pub fn new(
        record: &BuildingRecord,
        manufacture_id: ManufactureId,
        building_type: BuildingType,
        gear: Arc<dyn Gear>,
    ) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            manufacture_id,
            batch_size: record.batch_size,
            niceness: record.niceness,
            run_config: record.run_config.clone(),
            meta: record.meta.clone(),
            building_type,
            gear,
            state: AtomicU8::new(BuildingState::Idle.as_u8()),
        }
    }

    pub fn id(&self) -> BuildingId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manufacture_id(&self) -> ManufactureId {
        self.manufacture_id
    }

    pub fn batch_size(&self) -> BatchSize {
        self.batch_size
    }

    pub fn niceness(&self) -> i32 {
        self.niceness
    }

    pub fn building_type(&self) -> &BuildingType {
        &self.building_type
    }

    pub fn is_miner(&self) -> bool {
        self.building_type.is_miner()
    }

    pub fn is_exclusive(&self) -> bool {
        self.building_type.exclusive
    }

    pub fn state(&self) -> BuildingState {
        BuildingState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: BuildingState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Move from `from` to `to` only if the building is currently in `from`.
    pub fn transition(&self, from: BuildingState, to: BuildingState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Run the gear once over `input`.
    ///
    /// Never fails: a gear error or panic becomes a report with every input
    /// id in `errors` and the message in `logs`. Output pushed by a failed
    /// run is discarded.
    pub async fn run(&self, input: Vec<Piece>) -> RunReport {
        let input_ids: Vec<PieceId> = input.iter().map(|p| p.id).collect();
        let push = PushHandle::default();
        let ctx = GearContext {
            input,
            push: push.clone(),
            run_config: self.run_config.clone(),
            type_meta: self.building_type.meta.clone(),
            building_meta: self.meta.clone(),
            building_id: self.id,
        };

        debug!(
            building_id = %self.id,
            module = %self.building_type.module_id,
            input = input_ids.len(),
            "Running gear"
        );

        let outcome = AssertUnwindSafe(self.gear.run(ctx)).catch_unwind().await;
        let message = match outcome {
            Ok(Ok(output)) => {
                let input_set: HashSet<PieceId> = input_ids.iter().copied().collect();
                let ok: Vec<PieceId> = dedup_within(&output.ok, &input_set, &HashSet::new());
                let ok_set: HashSet<PieceId> = ok.iter().copied().collect();
                let errors = dedup_within(&output.errors, &input_set, &ok_set);
                let reported: HashSet<PieceId> = ok.iter().chain(&errors).copied().collect();
                let unreported = input_ids
                    .iter()
                    .copied()
                    .filter(|id| !reported.contains(id))
                    .collect();

                return RunReport {
                    ok,
                    errors,
                    unreported,
                    produced: push.take(),
                    logs: output.logs,
                    failed: false,
                };
            }
            Ok(Err(err)) => format!("{:#}", err),
            Err(panic) => panic_message(panic.as_ref()),
        };

        warn!(
            building_id = %self.id,
            module = %self.building_type.module_id,
            error = %message,
            "Gear failed, failing the whole batch"
        );
        push.take();
        RunReport {
            errors: input_ids,
            logs: vec![message],
            failed: true,
            ..RunReport::default()
        }
    }
}

/// Keep ids that are in `allowed`, not in `exclude`, first occurrence only.
fn dedup_within(
    ids: &[PieceId],
    allowed: &HashSet<PieceId>,
    exclude: &HashSet<PieceId>,
) -> Vec<PieceId> {
    let mut seen = HashSet::new();
    ids.iter()
        .copied()
        .filter(|id| allowed.contains(id) && !exclude.contains(id) && seen.insert(*id))
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("gear panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("gear panicked: {}", s)
    } else {
        "gear panicked".to_string()
    }
}

impl fmt::Debug for Building {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Building")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("manufacture_id", &self.manufacture_id)
            .field("module", &self.building_type.module_id)
            .field("state", &self.state())
            .finish()
    }
}
