//! Persistent job scheduler.
//!
//! Jobs live in a [`JobStore`]. Each firing runs through a [`JobExecutor`]
//! under a per-attempt deadline with bounded, exponentially backed-off
//! retries. A job that exhausts its retries is recorded as failed and stays
//! armed: `next_run_at` is recomputed after every firing.

pub mod history;
pub mod job;
pub mod schedule;
pub mod store;

pub use history::{JobHistory, JobRun, RunTrigger};
pub use job::{CronJob, JobDefinition, JobPayload, RunStatus, AUTO_AGENT};
pub use schedule::Schedule;
pub use store::{FileJobStore, JobStore, MemoryJobStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_agent::compute_backoff;
use conclave_core::{ConclaveError, ConclaveResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest the loop sleeps without re-reading the store.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// Runs the payload of a fired job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute one attempt and return its output text.
    async fn execute(&self, job: &CronJob) -> ConclaveResult<String>;

    /// Reject definitions whose references cannot be resolved.
    fn validate(&self, _definition: &JobDefinition) -> ConclaveResult<()> {
        Ok(())
    }
}

/// Result of reconciling declarative definitions into the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileReport {
    pub fn writes(&self) -> usize {
        self.inserted.len() + self.updated.len()
    }
}

/// Backoff between retry attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

/// Removes a job from the running set when its execution ends.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.id);
    }
}

/// Cron/interval scheduler over a durable job store.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    history: Arc<JobHistory>,
    executor: Arc<dyn JobExecutor>,
    running: Mutex<HashSet<Uuid>>,
    wake: Notify,
    backoff: RetryBackoff,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        history: Arc<JobHistory>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            store,
            history,
            executor,
            running: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            backoff: RetryBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Create a job. Names are unique.
    pub async fn add(&self, definition: JobDefinition) -> ConclaveResult<CronJob> {
        self.executor.validate(&definition)?;
        if self.store.get_by_name(&definition.name).await?.is_some() {
            return Err(ConclaveError::Config(format!(
                "A job named '{}' already exists",
                definition.name
            )));
        }
        let job = CronJob::from_definition(&definition, Utc::now())?;
        self.store.put(&job).await?;
        info!(job = %job.name, id = %job.id, schedule = %job.schedule, "Job added");
        self.wake.notify_one();
        Ok(job)
    }

    /// Replace a job's definition, keeping its id and runtime counters.
    pub async fn update(&self, id: Uuid, definition: JobDefinition) -> ConclaveResult<CronJob> {
        self.executor.validate(&definition)?;
        let mut job = self.get(id).await?;
        if definition.name != job.name {
            if let Some(other) = self.store.get_by_name(&definition.name).await? {
                if other.id != id {
                    return Err(ConclaveError::Config(format!(
                        "A job named '{}' already exists",
                        definition.name
                    )));
                }
            }
        }
        if job.apply_definition(&definition, Utc::now())? {
            self.store.put(&job).await?;
            info!(job = %job.name, id = %job.id, "Job updated");
            self.wake.notify_one();
        }
        Ok(job)
    }

    pub async fn remove(&self, id: Uuid) -> ConclaveResult<()> {
        if !self.store.delete(id).await? {
            return Err(ConclaveError::NotFound(format!("job {id}")));
        }
        info!(id = %id, "Job removed");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> ConclaveResult<CronJob> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ConclaveError::NotFound(format!("job {id}")))
    }

    /// All jobs, sorted by name.
    pub async fn list(&self) -> ConclaveResult<Vec<CronJob>> {
        self.store.list().await
    }

    /// Past runs of a job, newest first.
    pub async fn history(&self, id: Uuid, offset: usize, limit: usize) -> ConclaveResult<Vec<JobRun>> {
        let runs = self.history.page(id, offset, limit);
        if runs.is_empty() && offset == 0 && self.store.get(id).await?.is_none() {
            return Err(ConclaveError::NotFound(format!("job {id}")));
        }
        Ok(runs)
    }

    /// Upsert declarative definitions by name.
    ///
    /// New names are inserted, changed definitions updated in place with their
    /// counters preserved, unchanged ones not written at all. Stored jobs absent
    /// from `definitions` are left alone. Every definition is validated before
    /// anything is written.
    pub async fn reconcile(&self, definitions: &[JobDefinition]) -> ConclaveResult<ReconcileReport> {
        let mut seen = HashSet::new();
        for definition in definitions {
            definition.validate()?;
            self.executor.validate(definition)?;
            if !seen.insert(definition.name.as_str()) {
                return Err(ConclaveError::Config(format!(
                    "Duplicate job name '{}' in job definitions",
                    definition.name
                )));
            }
        }

        let now = Utc::now();
        let existing = self.store.list().await?;
        let mut report = ReconcileReport::default();
        for definition in definitions {
            match existing.iter().find(|j| j.name == definition.name) {
                None => {
                    let job = CronJob::from_definition(definition, now)?;
                    self.store.put(&job).await?;
                    report.inserted.push(job.name);
                }
                Some(current) => {
                    let mut job = current.clone();
                    if job.apply_definition(definition, now)? {
                        self.store.put(&job).await?;
                        report.updated.push(job.name);
                    } else {
                        report.unchanged.push(job.name);
                    }
                }
            }
        }
        info!(
            inserted = report.inserted.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            "Reconciled job definitions"
        );
        if report.writes() > 0 {
            self.wake.notify_one();
        }
        Ok(report)
    }

    /// Run a job now, regardless of its schedule or `enabled` flag.
    pub async fn trigger(&self, id: Uuid) -> ConclaveResult<JobRun> {
        self.execute_job(id, RunTrigger::Manual).await
    }

    /// Fire every job due at `now` and wait for all of them.
    pub async fn run_due(&self, now: DateTime<Utc>) -> ConclaveResult<Vec<JobRun>> {
        let due = self.due_jobs(now).await?;
        let runs = futures_util::future::join_all(
            due.iter()
                .map(|id| self.execute_job(*id, RunTrigger::Scheduled)),
        )
        .await;
        Ok(runs.into_iter().filter_map(Result::ok).collect())
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> ConclaveResult<Vec<Uuid>> {
        let running = self.running.lock().clone();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|j| j.is_due(now) && !running.contains(&j.id))
            .map(|j| j.id)
            .collect())
    }

    /// Earliest `next_run_at` among enabled jobs that are not running.
    async fn next_wakeup(&self) -> ConclaveResult<Option<DateTime<Utc>>> {
        let running = self.running.lock().clone();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|j| j.enabled && !running.contains(&j.id))
            .filter_map(|j| j.next_run_at)
            .min())
    }

    /// Spawn the firing loop. It stops when `shutdown` is cancelled, after
    /// the runs it started have finished and been recorded.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Scheduler started");
            let mut in_flight = JoinSet::new();
            loop {
                let sleep_for = match self.next_wakeup().await {
                    Ok(Some(next)) => (next - Utc::now()).to_std().unwrap_or_default().min(MAX_IDLE),
                    Ok(None) => MAX_IDLE,
                    Err(e) => {
                        error!(error = %e, "Scheduler could not read jobs");
                        MAX_IDLE
                    }
                };
                debug!(?sleep_for, "Scheduler sleeping");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.wake.notified() => continue,
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        log_join(joined);
                        continue;
                    }
                    _ = tokio::time::sleep(sleep_for) => {}
                }

                let due = match self.due_jobs(Utc::now()).await {
                    Ok(due) => due,
                    Err(e) => {
                        error!(error = %e, "Scheduler could not read jobs");
                        continue;
                    }
                };
                for id in due {
                    let this = self.clone();
                    in_flight.spawn(async move {
                        if let Err(e) = this.execute_job(id, RunTrigger::Scheduled).await {
                            warn!(job_id = %id, error = %e, "Scheduled run did not start");
                        }
                    });
                }
            }
            if !in_flight.is_empty() {
                info!(runs = in_flight.len(), "Waiting for in-flight job runs");
            }
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
            info!("Scheduler stopped");
        })
    }

    /// Wait until every recorded run has reached durable storage.
    pub async fn flush_history(&self) {
        self.history.flush().await;
    }

    async fn execute_job(&self, id: Uuid, trigger: RunTrigger) -> ConclaveResult<JobRun> {
        if !self.running.lock().insert(id) {
            return Err(ConclaveError::Scheduler(format!("job {id} is already running")));
        }
        let guard = RunningGuard {
            running: &self.running,
            id,
        };

        let job = self.get(id).await?;
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = Duration::from_secs(job.max_duration_secs);
        let max_attempts = job.retry_count.saturating_add(1);
        info!(job = %job.name, ?trigger, payload = job.payload.kind(), "Running job");

        let mut attempts = 0;
        let mut outcome: Result<String, (RunStatus, String)> =
            Err((RunStatus::Failure, "job did not run".into()));
        while attempts < max_attempts {
            attempts += 1;
            outcome = match tokio::time::timeout(deadline, self.executor.execute(&job)).await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(ConclaveError::Timeout(msg))) => Err((RunStatus::Timeout, msg)),
                Ok(Err(e)) => Err((RunStatus::Failure, e.to_string())),
                Err(_) => Err((
                    RunStatus::Timeout,
                    format!("exceeded max duration of {}s", job.max_duration_secs),
                )),
            };
            match &outcome {
                Ok(_) => break,
                Err((_, msg)) if attempts < max_attempts => {
                    let wait = compute_backoff(self.backoff.base_ms, self.backoff.max_ms, attempts - 1);
                    warn!(job = %job.name, attempt = attempts, error = %msg, wait_ms = wait, "Job attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                Err(_) => {}
            }
        }

        let finished_at = Utc::now();
        let (status, error, output) = match outcome {
            Ok(output) => (RunStatus::Success, None, Some(output)),
            Err((status, msg)) => {
                error!(job = %job.name, attempts, error = %msg, "Job failed");
                (status, Some(msg), None)
            }
        };

        // Re-read so concurrent edits made during the run are kept.
        match self.store.get(id).await? {
            Some(mut latest) => {
                latest.run_count += 1;
                if status == RunStatus::Success {
                    latest.success_count += 1;
                } else {
                    latest.fail_count += 1;
                }
                latest.last_run_at = Some(started_at);
                latest.last_status = Some(status);
                latest.next_run_at = latest.schedule.next_after(finished_at);
                self.store.put(&latest).await?;
            }
            None => debug!(job_id = %id, "Job removed while running"),
        }

        let run = JobRun {
            id: Uuid::new_v4(),
            job_id: id,
            job_name: job.name.clone(),
            trigger,
            started_at,
            finished_at,
            duration_ms: started.elapsed().as_millis() as u64,
            status,
            attempts,
            error,
            output_preview: output.as_deref().map(history::preview),
        };
        self.history.record(run.clone());
        drop(guard);
        self.wake.notify_one();
        Ok(run)
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Job run task ended abnormally");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts, then succeeds.
    struct FlakyExecutor {
        failures: u32,
        calls: AtomicU32,
        delay: Duration,
    }

    impl FlakyExecutor {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl JobExecutor for FlakyExecutor {
        async fn execute(&self, job: &CronJob) -> ConclaveResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                Err(ConclaveError::Backend("flaky".into()))
            } else {
                Ok(format!("ran {}", job.name))
            }
        }

        fn validate(&self, definition: &JobDefinition) -> ConclaveResult<()> {
            match &definition.payload {
                JobPayload::Skill { tool, .. } if tool != "clock" => {
                    Err(ConclaveError::Config(format!("Unknown tool: {tool}")))
                }
                _ => Ok(()),
            }
        }
    }

    fn scheduler(executor: FlakyExecutor) -> (Arc<MemoryJobStore>, Arc<Scheduler>) {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(JobHistory::in_memory()),
            Arc::new(executor),
        )
        .with_backoff(RetryBackoff { base_ms: 1, max_ms: 2 });
        (store, Arc::new(scheduler))
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (store, scheduler) = scheduler(FlakyExecutor::new(0));
        let defs = vec![
            JobDefinition::prompt("a", "@every 1h", "x"),
            JobDefinition::prompt("b", "0 9 * * *", "y"),
        ];
        let first = scheduler.reconcile(&defs).await.unwrap();
        assert_eq!(first.inserted.len(), 2);
        let writes_after_first = store.writes();

        let second = scheduler.reconcile(&defs).await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged.len(), 2);
        assert_eq!(store.writes(), writes_after_first);
    }

    #[tokio::test]
    async fn test_reconcile_schedule_change_preserves_counters() {
        let (_, scheduler) = scheduler(FlakyExecutor::new(0));
        let mut defs = vec![JobDefinition::prompt("a", "@every 1h", "x")];
        scheduler.reconcile(&defs).await.unwrap();
        let job = scheduler.list().await.unwrap().remove(0);
        scheduler.trigger(job.id).await.unwrap();
        let before = scheduler.get(job.id).await.unwrap();

        defs[0].schedule = "@every 2h".into();
        let report = scheduler.reconcile(&defs).await.unwrap();
        assert_eq!(report.updated, vec!["a"]);

        let after = scheduler.get(job.id).await.unwrap();
        assert_eq!(after.run_count, 1);
        assert_eq!(after.success_count, 1);
        assert_eq!(after.schedule.source(), "@every 2h");
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.last_status, before.last_status);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_before_writing() {
        let (store, scheduler) = scheduler(FlakyExecutor::new(0));
        let defs = vec![
            JobDefinition::prompt("good", "@every 1h", "x"),
            JobDefinition::prompt("bad", "not a schedule", "y"),
        ];
        assert!(scheduler.reconcile(&defs).await.is_err());
        assert_eq!(store.writes(), 0);

        let dupes = vec![
            JobDefinition::prompt("same", "@every 1h", "x"),
            JobDefinition::prompt("same", "@every 2h", "y"),
        ];
        assert!(scheduler.reconcile(&dupes).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (_, scheduler) = scheduler(FlakyExecutor::new(2));
        let job = scheduler
            .add(JobDefinition::prompt("j", "@every 1h", "x"))
            .await
            .unwrap();
        let run = scheduler.trigger(job.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.attempts, 3);
        assert_eq!(run.output_preview.as_deref(), Some("ran j"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_stay_armed() {
        let (_, scheduler) = scheduler(FlakyExecutor::new(100));
        let mut def = JobDefinition::prompt("j", "@every 1h", "x");
        def.retry_count = 1;
        let job = scheduler.add(def).await.unwrap();

        let run = scheduler.trigger(job.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.attempts, 2);

        let after = scheduler.get(job.id).await.unwrap();
        assert!(after.enabled);
        assert_eq!(after.fail_count, 1);
        assert_eq!(after.last_status, Some(RunStatus::Failure));
        assert!(after.next_run_at.unwrap() > run.finished_at);
        assert_eq!(scheduler.history(job.id, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_status() {
        let mut executor = FlakyExecutor::new(0);
        executor.delay = Duration::from_secs(5);
        let (_, scheduler) = scheduler(executor);
        let mut def = JobDefinition::prompt("slow", "@every 1h", "x");
        def.max_duration_secs = 1;
        def.retry_count = 0;
        let job = scheduler.add(def).await.unwrap();

        let run = scheduler.trigger(job.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Timeout);
        assert_eq!(
            scheduler.get(job.id).await.unwrap().last_status,
            Some(RunStatus::Timeout)
        );
    }

    #[tokio::test]
    async fn test_run_due_fires_only_due_enabled_jobs() {
        let (_, scheduler) = scheduler(FlakyExecutor::new(0));
        let due = scheduler
            .add(JobDefinition::prompt("due", "@every 1m", "x"))
            .await
            .unwrap();
        let mut disabled = JobDefinition::prompt("off", "@every 1m", "x");
        disabled.enabled = false;
        scheduler.add(disabled).await.unwrap();
        scheduler
            .add(JobDefinition::prompt("later", "@every 1h", "x"))
            .await
            .unwrap();

        let runs = scheduler
            .run_due(Utc::now() + chrono::Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, due.id);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_bad_skills() {
        let (_, scheduler) = scheduler(FlakyExecutor::new(0));
        scheduler
            .add(JobDefinition::prompt("j", "@every 1h", "x"))
            .await
            .unwrap();
        assert!(scheduler
            .add(JobDefinition::prompt("j", "@every 2h", "x"))
            .await
            .is_err());

        let mut skill = JobDefinition::prompt("s", "@every 1h", "x");
        skill.payload = JobPayload::Skill {
            tool: "teleport".into(),
            arguments: serde_json::Value::Null,
        };
        assert!(matches!(
            scheduler.add(skill).await,
            Err(ConclaveError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_and_not_found() {
        let (_, scheduler) = scheduler(FlakyExecutor::new(0));
        let job = scheduler
            .add(JobDefinition::prompt("j", "@every 1h", "x"))
            .await
            .unwrap();
        scheduler.remove(job.id).await.unwrap();
        assert!(matches!(
            scheduler.remove(job.id).await,
            Err(ConclaveError::NotFound(_))
        ));
        assert!(matches!(
            scheduler.trigger(job.id).await,
            Err(ConclaveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_loop_fires_and_stops() {
        let (_, scheduler) = scheduler(FlakyExecutor::new(0));
        let job = scheduler
            .add(JobDefinition::prompt("tick", "every 1s", "x"))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let handle = scheduler.clone().start(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(scheduler.get(job.id).await.unwrap().run_count >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_runs() {
        let mut executor = FlakyExecutor::new(0);
        executor.delay = Duration::from_millis(800);
        let (_, scheduler) = scheduler(executor);
        let job = scheduler
            .add(JobDefinition::prompt("slow-tick", "every 1s", "x"))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let handle = scheduler.clone().start(shutdown.clone());

        // Cancel while the first run is still executing.
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let runs = scheduler.history(job.id, 0, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(scheduler.get(job.id).await.unwrap().run_count, 1);
    }
}
