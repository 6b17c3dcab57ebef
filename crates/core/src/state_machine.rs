//! The Job status transition table.
//!
//! Every status change on a Job goes through `apply_event`; nothing outside
//! this module is allowed to assign `job.status` directly. Always call this
//! against a row just re-read under `FOR UPDATE` in the surrounding
//! transaction — never against an in-memory snapshot a caller may have
//! mutated (see DESIGN.md, "Mutable originalStatus").

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::job::Job;
use crate::job::JobStatus;
use crate::job::JobStatus::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    Create,
    Dispatch,
    WorkSucceeded,
    WorkFailed { ignore_errors: bool },
    WorkItemUpdate,
    Cancel { ignore_repeats: bool },
    Pause,
    Resume,
    SkipPreview,
    Fail,
    Complete,
    CompleteWithErrors,
}

/// Whether the request that created this job opted into a preview step.
/// Threaded through explicitly rather than read off `job` because the
/// DISPATCH event's target depends on it.
pub fn apply_event(job: &mut Job, event: JobEvent, requested_preview: bool) -> CoreResult<()> {
    job.check_mutable()?;

    let new_status = match (job.status, event) {
        (Accepted, JobEvent::Dispatch) => {
            if requested_preview {
                Previewing
            } else {
                Running
            }
        }
        (Accepted, JobEvent::Pause) => Paused,
        (Accepted | Running | RunningWithErrors, JobEvent::Cancel { .. }) => Canceled,
        (Running, JobEvent::WorkFailed { ignore_errors: true }) => RunningWithErrors,
        (Running, JobEvent::WorkFailed { ignore_errors: false }) => Failed,
        (RunningWithErrors, JobEvent::WorkFailed { .. }) => RunningWithErrors,
        (Running, JobEvent::Complete) => Successful,
        (Running, JobEvent::CompleteWithErrors) => CompleteWithErrors,
        (RunningWithErrors, JobEvent::Complete | JobEvent::CompleteWithErrors) => {
            CompleteWithErrors
        }
        (Paused, JobEvent::Resume) => Running,
        (Previewing, JobEvent::SkipPreview) => Running,
        (_, JobEvent::Fail) => Failed,
        (Canceled, JobEvent::Cancel { ignore_repeats: true }) => Canceled,
        _ => {
            return Err(CoreError::conflict(format!(
                "event {:?} is not valid from status {:?}",
                event, job.status
            )))
        }
    };

    job.status = new_status;
    apply_default_message(job);
    if job.status == Successful {
        job.progress = 100;
    }
    job.updated_at = chrono::Utc::now();
    job.original_status = job.status;
    Ok(())
}

/// If the job's message is empty, or is still the canonical default for a
/// *different* status, replace it with the canonical default for the new
/// status. A caller-supplied custom message (e.g. a worker's error text) is
/// left untouched.
fn apply_default_message(job: &mut Job) {
    if job.message.is_empty() || JobStatus::is_any_default_message(&job.message) {
        job.message = job.status.default_message().to_string();
    }
}

/// The subset of user-invokable events currently applicable to `job`; used by
/// the HTTP layer to decide which actions to present.
pub fn valid_events_for(job: &Job) -> Vec<&'static str> {
    let mut events = Vec::new();
    match job.status {
        Accepted => {
            events.push("cancel");
            events.push("pause");
        }
        Running => {
            events.push("cancel");
            events.push("pause");
        }
        RunningWithErrors => {
            events.push("cancel");
        }
        Paused => {
            events.push("resume");
            events.push("cancel");
        }
        Previewing => {
            events.push("skip_preview");
            events.push("cancel");
        }
        Successful | CompleteWithErrors | Failed | Canceled => {}
    }
    events
}
