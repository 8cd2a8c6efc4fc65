//! Background jobs: each accepted command runs on its own task, retried whole
//! on failure, with its state kept in memory for status polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::orchestrator::SyncIntent;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `step * attempt` after the n-th failed attempt.
    Linear(Duration),
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first run included.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next run, given how many attempts have failed so far.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let n = failed_attempts.max(1);
        match self.backoff {
            Backoff::Linear(step) => step.saturating_mul(n),
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(n - 1);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// How long finished job records stay available for status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRetention {
    pub max_age: Duration,
    /// Finished records kept at most; the oldest are evicted first.
    pub max_finished: usize,
}

impl Default for JobRetention {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            max_finished: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum JobCommand {
    Sync(SyncIntent),
    Cleanup { days: u32, dry_run: bool },
    Validate,
}

impl JobCommand {
    pub fn label(&self) -> String {
        match self {
            Self::Sync(intent) => intent.to_string(),
            Self::Cleanup { days, dry_run } => format!("cleanup(days={days}, dry_run={dry_run})"),
            Self::Validate => "validate".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResultStatus {
    Success,
    Completed,
    Error,
}

/// Terminal payload of a job: a status, a message, and command-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub status: JobResultStatus,
    pub message: String,
    #[serde(flatten)]
    pub details: Map<String, JsonValue>,
}

impl JobResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: JobResultStatus::Success,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            status: JobResultStatus::Completed,
            ..Self::success(message)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: JobResultStatus::Error,
            ..Self::success(message)
        }
    }

    /// Merges the fields of `details` when it serializes to an object.
    /// `status` and `message` keep the values already set.
    pub fn with_details<T: Serialize>(mut self, details: &T) -> Self {
        if let Ok(JsonValue::Object(fields)) = serde_json::to_value(details) {
            self.details.extend(
                fields
                    .into_iter()
                    .filter(|(key, _)| key != "status" && key != "message"),
            );
        }
        self
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, command: &JobCommand) -> Result<JobResult, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub command: JobCommand,
    pub state: JobState,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<JobResult>,
}

pub struct JobHandle {
    pub id: Uuid,
    join: JoinHandle<JobRecord>,
}

impl JobHandle {
    /// Waits for the job to finish and returns its final record.
    pub async fn wait(self) -> Result<JobRecord, SyncError> {
        let id = self.id;
        self.join
            .await
            .map_err(|err| SyncError::Orchestration(format!("job {id} did not finish: {err}")))
    }
}

#[derive(Clone)]
pub struct JobRunner {
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
    retention: JobRetention,
    jobs: Arc<RwLock<HashMap<Uuid, JobRecord>>>,
}

impl JobRunner {
    pub fn new(handler: Arc<dyn JobHandler>, policy: RetryPolicy) -> Self {
        Self {
            handler,
            policy,
            retention: JobRetention::default(),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_retention(mut self, retention: JobRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Number of records currently held, finished or not.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Records the job as queued and starts it in the background.
    pub async fn enqueue(&self, command: JobCommand) -> JobHandle {
        let id = Uuid::new_v4();
        let record = JobRecord {
            id,
            command: command.clone(),
            state: JobState::Queued,
            attempts: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
        };
        {
            let mut jobs = self.jobs.write().await;
            prune_finished(&mut jobs, self.retention, Utc::now());
            jobs.insert(id, record.clone());
        }

        let span = info_span!("job", job_id = %id, command = %command.label());
        let runner = self.clone();
        let join = tokio::spawn(async move { runner.execute(record).await }.instrument(span));
        JobHandle { id, join }
    }

    pub async fn status(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.read().await.get(&id).cloned()
    }

    async fn execute(&self, mut record: JobRecord) -> JobRecord {
        record.started_at = Some(Utc::now());
        loop {
            record.attempts += 1;
            record.state = JobState::Running;
            self.save(&record).await;

            let outcome = self.attempt(&record.command).await;
            let err = match outcome {
                Ok(Ok(result)) => {
                    info!(attempt = record.attempts, "job succeeded");
                    record.state = JobState::Succeeded;
                    record.result = Some(result);
                    record.finished_at = Some(Utc::now());
                    self.save(&record).await;
                    return record;
                }
                Ok(Err(err)) => err,
                Err(panic) => {
                    error!(attempt = record.attempts, error = %panic, "job handler panicked");
                    record.state = JobState::Failed;
                    record.result = Some(JobResult::error(panic.clone()));
                    record.last_error = Some(panic);
                    record.finished_at = Some(Utc::now());
                    self.save(&record).await;
                    return record;
                }
            };

            let message = err.to_string();
            if err.is_invalid_input() || record.attempts >= self.policy.max_attempts {
                error!(attempt = record.attempts, error = %message, "job failed");
                record.state = JobState::Failed;
                record.result = Some(JobResult::error(message.clone()));
                record.last_error = Some(message);
                record.finished_at = Some(Utc::now());
                self.save(&record).await;
                return record;
            }

            let delay = self.policy.delay_after(record.attempts);
            warn!(
                attempt = record.attempts,
                delay_secs = delay.as_secs(),
                error = %message,
                "job attempt failed; retrying"
            );
            record.state = JobState::Retrying;
            record.last_error = Some(message);
            self.save(&record).await;
            tokio::time::sleep(delay).await;
        }
    }

    /// Runs the handler on its own task so a panic fails the job instead of
    /// leaving its record running.
    async fn attempt(
        &self,
        command: &JobCommand,
    ) -> Result<Result<JobResult, SyncError>, String> {
        let handler = self.handler.clone();
        let command = command.clone();
        tokio::spawn(async move { handler.handle(&command).await }.in_current_span())
            .await
            .map_err(|err| format!("job handler panicked: {err}"))
    }

    async fn save(&self, record: &JobRecord) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(record.id, record.clone());
        if record.state.is_finished() {
            prune_finished(&mut jobs, self.retention, Utc::now());
        }
    }
}

fn prune_finished(
    jobs: &mut HashMap<Uuid, JobRecord>,
    retention: JobRetention,
    now: DateTime<Utc>,
) {
    let max_age = TimeDelta::from_std(retention.max_age).unwrap_or(TimeDelta::MAX);
    jobs.retain(|_, record| match record.finished_at {
        Some(finished) if record.state.is_finished() => now - finished <= max_age,
        _ => true,
    });

    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter(|record| record.state.is_finished())
        .filter_map(|record| record.finished_at.map(|at| (at, record.id)))
        .collect();
    if finished.len() <= retention.max_finished {
        return;
    }
    finished.sort();
    let excess = finished.len() - retention.max_finished;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(times),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, command: &JobCommand) -> Result<JobResult, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let JobCommand::Cleanup { .. } = command {
                panic!("cleanup handler exploded");
            }
            if let JobCommand::Sync(SyncIntent::SyncCountry { country }) = command {
                return Err(SyncError::InvalidCountryCode(country.clone()));
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SyncError::Orchestration(format!("upstream timeout ({left} left)")));
            }
            Ok(JobResult::success("done").with_details(&serde_json::json!({"count": 4})))
        }
    }

    #[test]
    fn linear_and_exponential_delays() {
        let linear = RetryPolicy::default();
        assert_eq!(linear.delay_after(1), Duration::from_secs(60));
        assert_eq!(linear.delay_after(2), Duration::from_secs(120));

        let exponential = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(5),
            },
        };
        assert_eq!(exponential.delay_after(1), Duration::from_secs(1));
        assert_eq!(exponential.delay_after(3), Duration::from_secs(4));
        assert_eq!(exponential.delay_after(4), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn job_succeeds_after_two_linear_retries() {
        let handler = Flaky::failing(2);
        let runner = JobRunner::new(handler.clone(), RetryPolicy::default());
        let started = tokio::time::Instant::now();

        let handle = runner.enqueue(JobCommand::Sync(SyncIntent::SyncAll)).await;
        let id = handle.id;
        let record = handle.wait().await.expect("job");

        assert!(started.elapsed() >= Duration::from_secs(180));
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.attempts, 3);
        let result = record.result.expect("result");
        assert_eq!(result.status, JobResultStatus::Success);
        assert_eq!(result.details["count"], 4);
        assert_eq!(runner.status(id).await.map(|r| r.state), Some(JobState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_keeps_the_last_error() {
        let handler = Flaky::failing(10);
        let runner = JobRunner::new(handler.clone(), RetryPolicy::default());

        let record = runner
            .enqueue(JobCommand::Validate)
            .await
            .wait()
            .await
            .expect("job");

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(record.last_error.as_deref(), Some("upstream timeout (8 left)"));
        assert_eq!(record.result.map(|r| r.status), Some(JobResultStatus::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_is_not_retried() {
        let handler = Flaky::failing(0);
        let runner = JobRunner::new(handler.clone(), RetryPolicy::default());

        let record = runner
            .enqueue(JobCommand::Sync(SyncIntent::SyncCountry {
                country: "??".to_string(),
            }))
            .await
            .wait()
            .await
            .expect("job");

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_marks_the_job_failed() {
        let handler = Flaky::failing(0);
        let runner = JobRunner::new(handler.clone(), RetryPolicy::default());

        let handle = runner
            .enqueue(JobCommand::Cleanup {
                days: 30,
                dry_run: true,
            })
            .await;
        let id = handle.id;
        let record = handle.wait().await.expect("runner task survives the panic");

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(record
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("panicked")));
        assert_eq!(runner.status(id).await.map(|r| r.state), Some(JobState::Failed));
    }

    #[tokio::test]
    async fn finished_records_are_capped() {
        let runner = JobRunner::new(Flaky::failing(0), RetryPolicy::default()).with_retention(
            JobRetention {
                max_finished: 2,
                ..JobRetention::default()
            },
        );

        let mut ids = Vec::new();
        for _ in 0..5 {
            let handle = runner.enqueue(JobCommand::Validate).await;
            ids.push(handle.id);
            handle.wait().await.expect("job");
        }

        assert_eq!(runner.len().await, 2);
        assert!(runner.status(ids[0]).await.is_none(), "oldest record evicted");
        assert!(runner.status(ids[4]).await.is_some(), "newest record kept");
    }

    fn record(state: JobState, finished_at: Option<DateTime<Utc>>) -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            command: JobCommand::Validate,
            state,
            attempts: 1,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at,
            last_error: None,
            result: None,
        }
    }

    #[test]
    fn expired_finished_records_are_pruned_but_running_ones_stay() {
        let now = Utc::now();
        let old = record(JobState::Succeeded, Some(now - TimeDelta::hours(30)));
        let fresh = record(JobState::Failed, Some(now - TimeDelta::hours(1)));
        let running = record(JobState::Running, None);
        let mut jobs: HashMap<Uuid, JobRecord> = [&old, &fresh, &running]
            .into_iter()
            .map(|r| (r.id, r.clone()))
            .collect();

        prune_finished(&mut jobs, JobRetention::default(), now);

        assert!(!jobs.contains_key(&old.id));
        assert!(jobs.contains_key(&fresh.id));
        assert!(jobs.contains_key(&running.id));
    }

    #[test]
    fn commands_serialize_with_tags() {
        let command = JobCommand::Sync(SyncIntent::BatchSync {
            countries: vec!["TR".into()],
        });
        assert_eq!(
            serde_json::to_value(&command).expect("json"),
            serde_json::json!({"command": "sync", "intent": "batch_sync", "countries": ["TR"]})
        );
    }
}
