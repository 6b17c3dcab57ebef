pub mod chaining;
pub mod dead_letter;
pub mod engine;
pub mod failer;
pub mod fair_queue;
pub mod reaper;
pub mod share_gate;
pub mod stac;

pub use dead_letter::{DeadLetterMessage, DeadLetterMonitor, DeadLetterQueue};
pub use engine::{DispatchEngine, GetWorkResponse, UpdateWorkOutcome, WorkItemUpdate};
pub use failer::{FailerReport, WorkFailer};
pub use reaper::{ReaperReport, WorkReaper};
pub use share_gate::{can_read, ShareGateRequest};
