mod coordinator;
pub mod effects;
mod phase;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorSnapshot};
pub use phase::{Effect, Event, Lifecycle, LifecyclePhase, ReportOutcome, Step};
