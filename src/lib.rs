/*!
 * Manufactory - batch pipeline orchestrator
 *
 * Runs graphs of buildings connected by pipes:
 * - Miners produce pieces, factories transform them, printers sink them
 * - Pipes hand out batches with at-least-once delivery and retry limits
 * - A bounded facility runs buildings with exclusivity and sequential rules
 * - A fair-share queue orders admission by virtual runtime and niceness
 * - Cursor state survives restarts and concurrent writers
 */

pub mod config;
pub mod core;
pub mod error;
pub mod gears;
pub mod logging;
pub mod model;
pub mod store;

// Re-export commonly used types
pub use config::{HubConfig, LogConfig, LogLevel, ManifestFile};
pub use core::{
    Building, BuildingType, Facility, Gear, GearContext, GearOutput, GearRegistry, Hub, LoopName,
    LoopStatus, Manufacture, Pipe, QueueArea,
};
pub use error::{ManufactoryError, Result};
pub use model::{
    BatchSize, BuildingId, BuildingKind, BuildingRecord, BuildingState, ManufactureId,
    ManufactureRecord, MinerSchedule, Piece, PipeId, PipeRecord,
};
pub use store::{MemoryStore, PieceStore, RecordStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
