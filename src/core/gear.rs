//! Gear: the pluggable run function behind a building
//!
//! Gears are registered once at startup under a module id. A building
//! record names its module id and the loader resolves it through the
//! [`GearRegistry`]; there is no runtime lookup by reflection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{BuildingId, BuildingKind, Piece, PieceId};

/// Side channel through which a gear emits output payloads.
///
/// Cloneable; every clone appends to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct PushHandle {
    buffer: Arc<Mutex<Vec<Value>>>,
}

impl PushHandle {
    pub fn push(&self, payload: Value) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload);
    }

    pub fn extend<I: IntoIterator<Item = Value>>(&self, payloads: I) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(payloads);
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain everything pushed so far
    pub(crate) fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Everything a gear sees for one run.
#[derive(Debug, Clone)]
pub struct GearContext {
    /// Empty for miners
    pub input: Vec<Piece>,
    pub push: PushHandle,
    pub run_config: Value,
    pub type_meta: Value,
    pub building_meta: Value,
    pub building_id: BuildingId,
}

impl GearContext {
    pub fn input_ids(&self) -> Vec<PieceId> {
        self.input.iter().map(|p| p.id).collect()
    }
}

/// Per-piece verdict returned by a gear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GearOutput {
    pub ok: Vec<PieceId>,
    pub errors: Vec<PieceId>,
    pub logs: Vec<String>,
}

impl GearOutput {
    /// Every input piece succeeded
    pub fn all_ok(input: &[Piece]) -> Self {
        Self {
            ok: input.iter().map(|p| p.id).collect(),
            ..Self::default()
        }
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }
}

/// User-supplied building logic.
#[async_trait]
pub trait Gear: Send + Sync {
    async fn run(&self, ctx: GearContext) -> anyhow::Result<GearOutput>;
}

/// Static description of a gear, shared by every building that uses it.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingType {
    pub module_id: String,
    pub kind: BuildingKind,
    /// At most one building of this type may run at a time
    pub exclusive: bool,
    pub meta: Value,
}

impl BuildingType {
    pub fn new(module_id: impl Into<String>, kind: BuildingKind) -> Self {
        Self {
            module_id: module_id.into(),
            kind,
            exclusive: false,
            meta: Value::Null,
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn is_miner(&self) -> bool {
        self.kind == BuildingKind::Miner
    }
}

/// Module id to gear mapping, populated at startup.
#[derive(Clone, Default)]
pub struct GearRegistry {
    entries: HashMap<String, (BuildingType, Arc<dyn Gear>)>,
}

impl GearRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gear under its type's module id, replacing any previous one.
    pub fn register(&mut self, building_type: BuildingType, gear: Arc<dyn Gear>) -> &mut Self {
        self.entries
            .insert(building_type.module_id.clone(), (building_type, gear));
        self
    }

    pub fn resolve(&self, module_id: &str) -> Option<(BuildingType, Arc<dyn Gear>)> {
        self.entries
            .get(module_id)
            .map(|(building_type, gear)| (building_type.clone(), Arc::clone(gear)))
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.entries.contains_key(module_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered module ids, sorted
    pub fn module_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for GearRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GearRegistry")
            .field("modules", &self.module_ids())
            .finish()
    }
}
