//! Loader: persisted records to live manufactures
//!
//! Each manufacture is validated and built on its own. A graph integrity
//! error aborts that manufacture only; the rest still load.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use super::building::Building;
use super::gear::GearRegistry;
use super::manufacture::Manufacture;
use super::pipe::{Pipe, PipeOptions};
use crate::model::{BuildingId, ManufactureId, ManufactureRecord, PipeId};
use crate::store::{PieceStore, RecordStore};

/// Why a manufacture could not be loaded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("building {building} uses unregistered module '{module}'")]
    UnknownModule { building: BuildingId, module: String },

    #[error("building {0} is declared more than once")]
    DuplicateBuilding(BuildingId),

    #[error("pipe {0} is declared more than once")]
    DuplicatePipe(PipeId),

    #[error("pipe {pipe} references missing building {building}")]
    MissingBuilding { pipe: PipeId, building: BuildingId },

    #[error("pipe {pipe} feeds miner {building}; miners take no input")]
    PipeIntoMiner { pipe: PipeId, building: BuildingId },

    #[error("pipe {0} connects a building to itself")]
    SelfLoop(PipeId),

    #[error("storage error: {0}")]
    Store(String),
}

/// Everything the loader needs besides the records.
#[derive(Clone)]
pub struct LoadContext {
    pub pieces: Arc<dyn PieceStore>,
    pub records: Arc<dyn RecordStore>,
    pub gears: Arc<GearRegistry>,
    pub options: PipeOptions,
}

/// Outcome of [`load_all_manufactures`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<Arc<Manufacture>>,
    pub failed: Vec<(ManufactureId, LoadError)>,
}

/// Check a record's graph without touching storage.
///
/// Returns every problem found, not just the first.
pub fn validate(record: &ManufactureRecord, gears: &GearRegistry) -> Vec<LoadError> {
    let mut problems = Vec::new();
    let mut buildings = HashSet::new();
    let mut miners = HashSet::new();

    for building in &record.buildings {
        if !buildings.insert(building.id) {
            problems.push(LoadError::DuplicateBuilding(building.id));
        }
        match gears.resolve(&building.module_id) {
            Some((building_type, _)) => {
                if building_type.is_miner() {
                    miners.insert(building.id);
                }
            }
            None => problems.push(LoadError::UnknownModule {
                building: building.id,
                module: building.module_id.clone(),
            }),
        }
    }

    let mut pipes = HashSet::new();
    for pipe in &record.pipes {
        if !pipes.insert(pipe.id) {
            problems.push(LoadError::DuplicatePipe(pipe.id));
        }
        if pipe.from == pipe.to {
            problems.push(LoadError::SelfLoop(pipe.id));
        }
        for end in [pipe.from, pipe.to] {
            if !buildings.contains(&end) {
                problems.push(LoadError::MissingBuilding {
                    pipe: pipe.id,
                    building: end,
                });
            }
        }
        if miners.contains(&pipe.to) {
            problems.push(LoadError::PipeIntoMiner {
                pipe: pipe.id,
                building: pipe.to,
            });
        }
    }
    problems
}

/// Validate and build one manufacture, loading every pipe's cursor state.
pub async fn load_manufacture(
    record: &ManufactureRecord,
    ctx: &LoadContext,
) -> Result<Manufacture, LoadError> {
    if let Some(problem) = validate(record, &ctx.gears).into_iter().next() {
        return Err(problem);
    }

    let mut buildings = Vec::with_capacity(record.buildings.len());
    for building in &record.buildings {
        let (building_type, gear) =
            ctx.gears
                .resolve(&building.module_id)
                .ok_or_else(|| LoadError::UnknownModule {
                    building: building.id,
                    module: building.module_id.clone(),
                })?;
        buildings.push(Arc::new(Building::new(
            building,
            record.id,
            building_type,
            gear,
        )));
    }

    let mut pipes = Vec::with_capacity(record.pipes.len());
    for pipe in &record.pipes {
        let loaded = Pipe::load(
            pipe,
            ctx.options,
            Arc::clone(&ctx.pieces),
            Arc::clone(&ctx.records),
        )
        .await
        .map_err(|e| LoadError::Store(format!("{:#}", e)))?;
        pipes.push(Arc::new(loaded));
    }

    Ok(Manufacture::new(
        record.id,
        record.name.clone(),
        record.sequential,
        buildings,
        pipes,
        Arc::clone(&ctx.pieces),
    ))
}

/// Load every persisted manufacture, isolating failures per manufacture.
///
/// Only a failure to read the records themselves is returned as an error.
pub async fn load_all_manufactures(ctx: &LoadContext) -> anyhow::Result<LoadReport> {
    let records = ctx.records.load_manufactures().await?;
    let mut report = LoadReport::default();

    for record in &records {
        match load_manufacture(record, ctx).await {
            Ok(manufacture) => {
                info!(
                    manufacture_id = %record.id,
                    name = %record.name,
                    buildings = record.buildings.len(),
                    pipes = record.pipes.len(),
                    sequential = record.sequential,
                    "Loaded manufacture"
                );
                report.loaded.push(Arc::new(manufacture));
            }
            Err(err) => {
                error!(
                    manufacture_id = %record.id,
                    error = %err,
                    "Failed to load manufacture, skipping it"
                );
                report.failed.push((record.id, err));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support;
    use crate::model::{BuildingRecord, PipeRecord};
    use crate::store::MemoryStore;

    fn record() -> ManufactureRecord {
        test_support::chain_record(ManufactureId(1), false)
    }

    #[test]
    fn test_valid_chain() {
        let (gears, _sink) = test_support::gears();
        assert!(validate(&record(), &gears).is_empty());
    }

    #[test]
    fn test_reports_every_problem() {
        let (gears, _sink) = test_support::gears();
        let mut broken = record();
        broken.buildings.push(BuildingRecord {
            module_id: "nope".to_string(),
            ..broken.buildings[0].clone()
        });
        broken.pipes.push(PipeRecord {
            id: PipeId(900),
            from: BuildingId(2),
            to: BuildingId(77),
            ..broken.pipes[0].clone()
        });
        broken.pipes.push(PipeRecord {
            id: PipeId(901),
            from: BuildingId(2),
            to: BuildingId(1),
            ..broken.pipes[0].clone()
        });

        let problems = validate(&broken, &gears);
        assert!(problems.contains(&LoadError::DuplicateBuilding(BuildingId(1))));
        assert!(problems.iter().any(|p| matches!(p, LoadError::UnknownModule { .. })));
        assert!(problems.contains(&LoadError::MissingBuilding {
            pipe: PipeId(900),
            building: BuildingId(77)
        }));
        assert!(problems.contains(&LoadError::PipeIntoMiner {
            pipe: PipeId(901),
            building: BuildingId(1)
        }));
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (gears, _sink) = test_support::gears();
        let mut broken = test_support::chain_record(ManufactureId(2), false);
        broken.pipes[0].to = BuildingId(404);

        let store = Arc::new(MemoryStore::with_records(vec![record(), broken], vec![]));
        let ctx = LoadContext {
            pieces: store.clone(),
            records: store,
            gears: Arc::new(gears),
            options: PipeOptions::default(),
        };

        let report = load_all_manufactures(&ctx).await.unwrap();
        assert_eq!(report.loaded.len(), 1);
        assert_eq!(report.loaded[0].id(), ManufactureId(1));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, ManufactureId(2));
    }
}
