//! Dead-letter monitor (spec §4.8): consumes `{requestId}` messages off a
//! dead-letter queue and marks the corresponding job FAILED. The message is
//! always deleted from the queue except when the database itself is
//! unreachable, so a single poisoned job can never wedge the queue.

use std::sync::Arc;

use chrono::Utc;
use tessera_core::{CoreError, CoreResult};
use tessera_storage::Repository;
use tracing::{error, warn};

const DEAD_LETTER_MESSAGE: &str = "job failed after exhausting retries and was routed to the dead-letter queue";

#[async_trait::async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn receive(&self) -> CoreResult<Vec<DeadLetterMessage>>;
    async fn delete(&self, receipt_handle: &str) -> CoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct DeadLetterMessage {
    pub receipt_handle: String,
    pub job_id: uuid::Uuid,
}

pub struct DeadLetterMonitor {
    repo: Arc<dyn Repository>,
    queue: Arc<dyn DeadLetterQueue>,
}

impl DeadLetterMonitor {
    pub fn new(repo: Arc<dyn Repository>, queue: Arc<dyn DeadLetterQueue>) -> Self {
        Self { repo, queue }
    }

    pub async fn run_once(&self) -> CoreResult<usize> {
        let messages = self.queue.receive().await?;
        let mut processed = 0;

        for message in messages {
            match self.handle_message(&message).await {
                Ok(()) => {
                    self.queue.delete(&message.receipt_handle).await?;
                    processed += 1;
                }
                Err(e) if is_transient(&e) => {
                    warn!(job_id = %message.job_id, error = %e, "transient error handling dead-letter message, leaving for retry");
                }
                Err(e) => {
                    error!(job_id = %message.job_id, error = %e, "failed to mark dead-lettered job as failed, deleting message anyway");
                    self.queue.delete(&message.receipt_handle).await?;
                    processed += 1;
                }
            }
        }

        Ok(processed)
    }

    async fn handle_message(&self, message: &DeadLetterMessage) -> CoreResult<()> {
        self.repo
            .fail_job_with_message(message.job_id, DEAD_LETTER_MESSAGE.to_string(), Utc::now())
            .await?;
        Ok(())
    }
}

/// Treats `Service` (e.g. database connectivity) as the only retryable
/// class — validation, not-found, and conflict all mean the message itself
/// is unsalvageable and should be dropped rather than retried forever.
fn is_transient(err: &CoreError) -> bool {
    matches!(err, CoreError::Service(_))
}
