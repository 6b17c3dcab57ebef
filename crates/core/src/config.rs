//! Process-scoped configuration.
//!
//! Loaded once at boot and passed explicitly to every component constructor —
//! never reached for as a global. See DESIGN.md for the rationale (this
//! replaces the config-singleton pattern the original system used).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Page size for link/STAC listing endpoints.
    pub default_result_page_size: u32,
    /// Max retries for a single WorkItem before it is marked permanently FAILED.
    pub work_item_retry_limit: u32,
    /// Max page size requested from the granule index per scroll.
    pub cmr_max_page_size: u32,
    /// Max STAC items per aggregated catalog page before splitting with prev/next links.
    pub aggregate_stac_catalog_max_page_size: u32,
    /// Scratch root for per-job temporary outputs.
    pub host_volume_path: String,
    pub aws_default_region: String,
    /// Key used to encrypt access tokens carried in DataOperation.
    pub shared_secret_key: String,
    /// Fallback fail-duration when a step has fewer than two successful items
    /// to derive an outlier threshold from (7,200,000 ms == 2 hours).
    pub default_fail_duration: Duration,
    /// How long a job must sit idle in a terminal state before the reaper
    /// deletes its WorkItems and WorkflowSteps.
    pub reap_age: Duration,
    /// Tick interval for the work-failer background task.
    pub failer_period: Duration,
    /// Tick interval for the work-reaper background task.
    pub reaper_period: Duration,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            default_result_page_size: env_u32("DEFAULT_RESULT_PAGE_SIZE", 10),
            work_item_retry_limit: env_u32("WORK_ITEM_RETRY_LIMIT", 3),
            cmr_max_page_size: env_u32("CMR_MAX_PAGE_SIZE", 2000),
            aggregate_stac_catalog_max_page_size: env_u32(
                "AGGREGATE_STAC_CATALOG_MAX_PAGE_SIZE",
                1000,
            ),
            host_volume_path: std::env::var("HOST_VOLUME_PATH")
                .unwrap_or_else(|_| "/tmp/harmony".to_string()),
            aws_default_region: std::env::var("AWS_DEFAULT_REGION")
                .unwrap_or_else(|_| "us-west-2".to_string()),
            shared_secret_key: std::env::var("SHARED_SECRET_KEY")
                .unwrap_or_else(|_| "_THIS_IS_MY_32_CHARS_SECRET_KEY".to_string()),
            default_fail_duration: Duration::from_millis(env_u64(
                "DEFAULT_FAIL_DURATION_MS",
                7_200_000,
            )),
            reap_age: Duration::from_millis(env_u64("REAP_AGE_MS", 7 * 24 * 60 * 60 * 1000)),
            failer_period: Duration::from_millis(env_u64("FAILER_PERIOD_MS", 60_000)),
            reaper_period: Duration::from_millis(env_u64("REAPER_PERIOD_MS", 3_600_000)),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_result_page_size: 10,
            work_item_retry_limit: 3,
            cmr_max_page_size: 2000,
            aggregate_stac_catalog_max_page_size: 1000,
            host_volume_path: "/tmp/harmony".to_string(),
            aws_default_region: "us-west-2".to_string(),
            shared_secret_key: "_THIS_IS_MY_32_CHARS_SECRET_KEY".to_string(),
            default_fail_duration: Duration::from_millis(7_200_000),
            reap_age: Duration::from_millis(7 * 24 * 60 * 60 * 1000),
            failer_period: Duration::from_millis(60_000),
            reaper_period: Duration::from_millis(3_600_000),
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
