use super::job::RunStatus;
use chrono::{DateTime, Utc};
use conclave_core::ConclaveResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

const PREVIEW_CHARS: usize = 500;

/// Runs kept in memory per job. `runs.jsonl` keeps everything.
pub const DEFAULT_RETAINED_RUNS: usize = 200;

/// What caused a job to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

/// One execution of a job, across all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output_preview: Option<String>,
}

/// Truncate output to a bounded preview.
pub fn preview(output: &str) -> String {
    if output.chars().count() <= PREVIEW_CHARS {
        output.to_string()
    } else {
        let mut cut: String = output.chars().take(PREVIEW_CHARS).collect();
        cut.push('…');
        cut
    }
}

enum HistoryCommand {
    Append(Box<JobRun>),
    Flush(oneshot::Sender<()>),
}

/// Append-only execution history, queryable by job id.
///
/// The newest runs of each job are indexed in memory and, when opened on a
/// directory, every run is appended to `runs.jsonl` by a background writer
/// in submission order.
pub struct JobHistory {
    runs: RwLock<HashMap<Uuid, VecDeque<JobRun>>>,
    retained: usize,
    tx: Option<mpsc::UnboundedSender<HistoryCommand>>,
}

impl JobHistory {
    pub fn in_memory() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            retained: DEFAULT_RETAINED_RUNS,
            tx: None,
        }
    }

    /// Keep at most `runs` entries per job in memory.
    pub fn with_retention(mut self, runs: usize) -> Self {
        self.retained = runs.max(1);
        let retained = self.retained;
        for job_runs in self.runs.get_mut().values_mut() {
            while job_runs.len() > retained {
                job_runs.pop_front();
            }
        }
        self
    }

    /// Load `runs.jsonl` from `dir` and spawn the writer task.
    pub async fn open(dir: PathBuf) -> ConclaveResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let log_file = dir.join("runs.jsonl");
        let mut runs: HashMap<Uuid, VecDeque<JobRun>> = HashMap::new();
        if log_file.exists() {
            let data = tokio::fs::read_to_string(&log_file).await?;
            for (line_no, line) in data.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JobRun>(line) {
                    Ok(run) => retain(&mut runs, run, DEFAULT_RETAINED_RUNS),
                    Err(e) => warn!(line = line_no + 1, error = %e, "Skipping malformed history line"),
                }
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<HistoryCommand>();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    HistoryCommand::Append(run) => {
                        let Ok(line) = serde_json::to_string(&run) else {
                            continue;
                        };
                        if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                            warn!(error = %e, "Failed to append job history");
                        }
                    }
                    HistoryCommand::Flush(done) => {
                        let _ = file.flush().await;
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(Self {
            runs: RwLock::new(runs),
            retained: DEFAULT_RETAINED_RUNS,
            tx: Some(tx),
        })
    }

    pub fn record(&self, run: JobRun) {
        info!(
            job = %run.job_name,
            job_id = %run.job_id,
            status = ?run.status,
            attempts = run.attempts,
            duration_ms = run.duration_ms,
            "job run"
        );
        if let Some(tx) = &self.tx {
            let _ = tx.send(HistoryCommand::Append(Box::new(run.clone())));
        }
        retain(&mut self.runs.write(), run, self.retained);
    }

    /// Retained runs of one job, newest first.
    pub fn page(&self, job_id: Uuid, offset: usize, limit: usize) -> Vec<JobRun> {
        self.runs
            .read()
            .get(&job_id)
            .map(|runs| runs.iter().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Number of retained runs of one job.
    pub fn count(&self, job_id: Uuid) -> usize {
        self.runs.read().get(&job_id).map_or(0, VecDeque::len)
    }

    /// Wait until every recorded run has reached the file.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(HistoryCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn retain(index: &mut HashMap<Uuid, VecDeque<JobRun>>, run: JobRun, limit: usize) {
    let runs = index.entry(run.job_id).or_default();
    runs.push_back(run);
    while runs.len() > limit {
        runs.pop_front();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn run(job_id: Uuid, n: u32) -> JobRun {
        let now = Utc::now();
        JobRun {
            id: Uuid::new_v4(),
            job_id,
            job_name: "digest".into(),
            trigger: RunTrigger::Scheduled,
            started_at: now,
            finished_at: now,
            duration_ms: 1,
            status: RunStatus::Success,
            attempts: n,
            error: None,
            output_preview: None,
        }
    }

    #[test]
    fn test_page_newest_first() {
        let history = JobHistory::in_memory();
        let job = Uuid::new_v4();
        for n in 1..=5 {
            history.record(run(job, n));
        }
        history.record(run(Uuid::new_v4(), 99));

        let page: Vec<u32> = history.page(job, 0, 2).iter().map(|r| r.attempts).collect();
        assert_eq!(page, vec![5, 4]);
        let page: Vec<u32> = history.page(job, 4, 10).iter().map(|r| r.attempts).collect();
        assert_eq!(page, vec![1]);
        assert_eq!(history.count(job), 5);
    }

    #[test]
    fn test_retention_drops_oldest_runs_per_job() {
        let history = JobHistory::in_memory().with_retention(3);
        let busy = Uuid::new_v4();
        let quiet = Uuid::new_v4();
        history.record(run(quiet, 1));
        for n in 1..=10 {
            history.record(run(busy, n));
        }

        let kept: Vec<u32> = history.page(busy, 0, 10).iter().map(|r| r.attempts).collect();
        assert_eq!(kept, vec![10, 9, 8]);
        assert_eq!(history.count(busy), 3);
        assert_eq!(history.count(quiet), 1);
    }

    #[tokio::test]
    async fn test_file_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();
        {
            let history = JobHistory::open(dir.path().to_path_buf()).await.unwrap();
            history.record(run(job, 1));
            history.record(run(job, 2));
            history.flush().await;
        }
        let reopened = JobHistory::open(dir.path().to_path_buf()).await.unwrap();
        let attempts: Vec<u32> = reopened.page(job, 0, 10).iter().map(|r| r.attempts).collect();
        assert_eq!(attempts, vec![2, 1]);
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(PREVIEW_CHARS + 10);
        let cut = preview(&long);
        assert_eq!(cut.chars().count(), PREVIEW_CHARS + 1);
        assert_eq!(preview("short"), "short");
    }
}
