//! Catalog synchronization: reconciliation, sync intents, and retrying jobs.

use simcat_adapters::AdapterError;
use simcat_storage::{FetchError, StoreError};
use thiserror::Error;

pub mod config;
pub mod jobs;
pub mod orchestrator;
pub mod quality;
pub mod reconcile;
pub mod scheduler;
pub mod service;
pub mod telemetry;

pub use config::{CatalogConfig, LogConfig, LogFormat};
pub use jobs::{
    Backoff, JobCommand, JobHandle, JobHandler, JobRecord, JobResult, JobResultStatus, JobRunner,
    JobRetention, JobState, RetryPolicy,
};
pub use orchestrator::{
    normalize_country_code, BatchSummary, CountryResult, Orchestrator, ProviderSyncReport,
    SyncIntent, SyncOutcome,
};
pub use quality::{issues_for, validate, VALIDATION_ISSUE_LIMIT};
pub use reconcile::{PurgeReport, ReconcileReport, Reconciler};
pub use service::{CatalogService, SupportedCountries};

pub const CRATE_NAME: &str = "simcat-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("invalid country code `{0}`")]
    InvalidCountryCode(String),
    #[error("no providers are configured")]
    NoProviders,
    #[error("scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("{0}")]
    Orchestration(String),
}

impl SyncError {
    /// Errors caused by the request itself rather than by the system.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::UnknownProvider(_) | Self::InvalidCountryCode(_))
    }
}
