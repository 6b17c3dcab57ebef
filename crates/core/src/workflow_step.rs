//! One row per (job, stepIndex): a stage of a job's processing pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data_operation::DataOperation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct WorkflowStep {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub job_id: Uuid,
    /// 1-based; contiguous 1..N for a job. Step N is the terminal producer
    /// of the job's links.
    pub step_index: u32,
    /// Identifier a polling worker presents to `get-work` to claim items of
    /// this step.
    pub service_id: String,
    pub work_item_count: u32,
    pub has_aggregated_output: bool,
    pub operation: DataOperation,
}

impl WorkflowStep {
    pub fn new(
        job_id: Uuid,
        step_index: u32,
        service_id: impl Into<String>,
        work_item_count: u32,
        has_aggregated_output: bool,
        operation: DataOperation,
    ) -> Self {
        WorkflowStep {
            id: None,
            job_id,
            step_index,
            service_id: service_id.into(),
            work_item_count,
            has_aggregated_output,
            operation,
        }
    }
}

/// Validates that a job's steps form a contiguous 1..N sequence.
pub fn validate_step_sequence(steps: &[WorkflowStep]) -> bool {
    let mut indices: Vec<u32> = steps.iter().map(|s| s.step_index).collect();
    indices.sort_unstable();
    indices.iter().enumerate().all(|(i, &idx)| idx == i as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(job: Uuid, idx: u32) -> WorkflowStep {
        WorkflowStep::new(job, idx, "svc", 1, false, DataOperation::default())
    }

    #[test]
    fn contiguous_sequence_is_valid() {
        let job = Uuid::new_v4();
        let steps = vec![step(job, 1), step(job, 2), step(job, 3)];
        assert!(validate_step_sequence(&steps));
    }

    #[test]
    fn gap_in_sequence_is_invalid() {
        let job = Uuid::new_v4();
        let steps = vec![step(job, 1), step(job, 3)];
        assert!(!validate_step_sequence(&steps));
    }
}
