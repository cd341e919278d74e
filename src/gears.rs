/*!
 * Built-in gears
 *
 * - `sequence` (miner): emits `count` pieces `{"value": start + i}`
 * - `multiply` (factory): multiplies `value` by `factor`
 * - `printer` (printer): logs every piece and records it in a [`PrinterSink`]
 */

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::core::gear::{BuildingType, Gear, GearContext, GearOutput, GearRegistry};
use crate::model::BuildingKind;

fn config_or_default<T: for<'de> Deserialize<'de> + Default>(value: &Value) -> anyhow::Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value.clone())?)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SequenceConfig {
    count: u64,
    start: i64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            count: 10,
            start: 0,
        }
    }
}

/// Miner emitting a run of consecutive integers.
#[derive(Debug, Default)]
pub struct SequenceMiner;

#[async_trait]
impl Gear for SequenceMiner {
    async fn run(&self, ctx: GearContext) -> anyhow::Result<GearOutput> {
        let config: SequenceConfig = config_or_default(&ctx.run_config)?;
        ctx.push.extend(
            (0..config.count).map(|i| json!({ "value": config.start + i as i64 })),
        );
        Ok(GearOutput::default().with_log(format!("mined {} pieces", config.count)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MultiplyConfig {
    factor: i64,
}

impl Default for MultiplyConfig {
    fn default() -> Self {
        Self { factor: 2 }
    }
}

/// Factory multiplying the integer `value` of each piece.
///
/// Pieces without an integer `value` are reported as errors.
#[derive(Debug, Default)]
pub struct MultiplyFactory;

#[async_trait]
impl Gear for MultiplyFactory {
    async fn run(&self, ctx: GearContext) -> anyhow::Result<GearOutput> {
        let config: MultiplyConfig = config_or_default(&ctx.run_config)?;
        let mut output = GearOutput::default();
        for piece in &ctx.input {
            match piece.data.get("value").and_then(Value::as_i64) {
                Some(value) => {
                    ctx.push.push(json!({ "value": value * config.factor }));
                    output.ok.push(piece.id);
                }
                None => output.errors.push(piece.id),
            }
        }
        Ok(output)
    }
}

/// Shared record of everything a [`CollectingPrinter`] received, in order.
#[derive(Debug, Clone, Default)]
pub struct PrinterSink {
    received: Arc<Mutex<Vec<Value>>>,
}

impl PrinterSink {
    pub fn values(&self) -> Vec<Value> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Integer `value` fields, skipping anything else
    pub fn ints(&self) -> Vec<i64> {
        self.values()
            .iter()
            .filter_map(|v| v.get("value").and_then(Value::as_i64))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, values: impl IntoIterator<Item = Value>) {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(values);
    }
}

/// Sink that logs each piece and keeps it in a [`PrinterSink`].
#[derive(Debug, Clone, Default)]
pub struct CollectingPrinter {
    sink: PrinterSink,
}

impl CollectingPrinter {
    pub fn new(sink: PrinterSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Gear for CollectingPrinter {
    async fn run(&self, ctx: GearContext) -> anyhow::Result<GearOutput> {
        for piece in &ctx.input {
            info!(
                building_id = %ctx.building_id,
                piece_id = piece.id,
                data = %piece.data,
                "Printer received piece"
            );
        }
        self.sink.record(ctx.input.iter().map(|p| p.data.clone()));
        Ok(GearOutput::all_ok(&ctx.input))
    }
}

/// Registry with every built-in gear and the sink of its printer.
pub fn builtin_registry() -> (GearRegistry, PrinterSink) {
    let sink = PrinterSink::default();
    let mut registry = GearRegistry::new();
    registry
        .register(
            BuildingType::new("sequence", BuildingKind::Miner),
            Arc::new(SequenceMiner),
        )
        .register(
            BuildingType::new("multiply", BuildingKind::Factory),
            Arc::new(MultiplyFactory),
        )
        .register(
            BuildingType::new("printer", BuildingKind::Printer),
            Arc::new(CollectingPrinter::new(sink.clone())),
        );
    (registry, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gear::PushHandle;
    use crate::model::{BuildingId, Piece};
    use chrono::Utc;

    fn ctx(input: Vec<Value>, run_config: Value) -> GearContext {
        GearContext {
            input: input
                .into_iter()
                .enumerate()
                .map(|(i, data)| Piece {
                    id: i as u64,
                    building_id: BuildingId(1),
                    data,
                    created_at: Utc::now(),
                })
                .collect(),
            push: PushHandle::default(),
            run_config,
            type_meta: Value::Null,
            building_meta: Value::Null,
            building_id: BuildingId(9),
        }
    }

    #[tokio::test]
    async fn test_sequence_miner() {
        let ctx = ctx(vec![], json!({ "count": 3, "start": 5 }));
        let push = ctx.push.clone();
        SequenceMiner.run(ctx).await.unwrap();
        assert_eq!(
            push.take(),
            vec![json!({"value": 5}), json!({"value": 6}), json!({"value": 7})]
        );
    }

    #[tokio::test]
    async fn test_sequence_miner_rejects_bad_config() {
        let ctx = ctx(vec![], json!({ "count": "many" }));
        assert!(SequenceMiner.run(ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_multiply_factory() {
        let ctx = ctx(
            vec![json!({"value": 2}), json!({"other": 1}), json!({"value": -4})],
            Value::Null,
        );
        let push = ctx.push.clone();
        let output = MultiplyFactory.run(ctx).await.unwrap();
        assert_eq!(output.ok, vec![0, 2]);
        assert_eq!(output.errors, vec![1]);
        assert_eq!(push.take(), vec![json!({"value": 4}), json!({"value": -8})]);
    }

    #[tokio::test]
    async fn test_printer_records_in_order() {
        let sink = PrinterSink::default();
        let printer = CollectingPrinter::new(sink.clone());
        let output = printer
            .run(ctx(vec![json!({"value": 1}), json!({"value": 3})], Value::Null))
            .await
            .unwrap();
        assert_eq!(output.ok, vec![0, 1]);
        assert_eq!(sink.ints(), vec![1, 3]);
    }

    #[test]
    fn test_builtin_registry() {
        let (registry, sink) = builtin_registry();
        assert_eq!(registry.module_ids(), vec!["multiply", "printer", "sequence"]);
        assert!(registry.resolve("sequence").unwrap().0.is_miner());
        assert!(sink.is_empty());
    }
}
