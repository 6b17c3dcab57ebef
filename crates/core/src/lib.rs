//! Domain model for the data-transformation request orchestrator: the Job /
//! WorkflowStep / WorkItem aggregate and the status transition table that
//! governs it. This crate has no I/O — persistence, HTTP, and external
//! clients live in sibling crates.

pub mod config;
pub mod data_operation;
pub mod error;
pub mod job;
pub mod state_machine;
pub mod work_item;
pub mod workflow_step;

pub use config::OrchestratorConfig;
pub use data_operation::{AveragingMethod, DataOperation, Dimensions, ScaleExtent};
pub use error::{CoreError, CoreResult};
pub use job::{BoundingBox, Job, JobLink, JobStatus, TemporalInterval};
pub use state_machine::{apply_event, valid_events_for, JobEvent};
pub use work_item::{WorkItem, WorkItemStatus};
pub use workflow_step::{validate_step_sequence, WorkflowStep};
