/*!
 * Execution core: buildings, pipes, manufactures, the facility, the ready
 * queue and the hub that drives them
 */

pub mod building;
pub mod facility;
pub mod gear;
pub mod hub;
pub mod loader;
pub mod manufacture;
pub mod pipe;
pub mod queue_area;

pub use building::{Building, RunReport};
pub use facility::{Completion, CompletionHandle, Exclusives, Facility, FacilityError, WorkItem};
pub use gear::{BuildingType, Gear, GearContext, GearOutput, GearRegistry, PushHandle};
pub use hub::{Hub, LoopName, LoopStatus};
pub use loader::{LoadContext, LoadError, LoadReport};
pub use manufacture::{Manufacture, MiningReport, TickOutcome, TickReport};
pub use pipe::{Pipe, PipeOptions, SyncOutcome};
pub use queue_area::{QueueArea, QueueItem};
