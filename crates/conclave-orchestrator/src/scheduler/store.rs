use super::job::CronJob;
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;
use uuid::Uuid;

/// Durable storage for scheduled jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list(&self) -> ConclaveResult<Vec<CronJob>>;
    async fn get(&self, id: Uuid) -> ConclaveResult<Option<CronJob>>;
    /// Insert or replace by id.
    async fn put(&self, job: &CronJob) -> ConclaveResult<()>;
    async fn delete(&self, id: Uuid) -> ConclaveResult<bool>;

    async fn get_by_name(&self, name: &str) -> ConclaveResult<Option<CronJob>> {
        Ok(self.list().await?.into_iter().find(|j| j.name == name))
    }
}

/// One JSON file per job.
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub async fn new(dir: PathBuf) -> ConclaveResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn job_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn list(&self) -> ConclaveResult<Vec<CronJob>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<CronJob>(&data) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job"),
            }
        }
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn get(&self, id: Uuid) -> ConclaveResult<Option<CronJob>> {
        let path = self.job_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let job = serde_json::from_str(&data)
            .map_err(|e| ConclaveError::Store(format!("Failed to parse job {id}: {e}")))?;
        Ok(Some(job))
    }

    async fn put(&self, job: &CronJob) -> ConclaveResult<()> {
        let path = self.job_path(job.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(job)?).await?;
        tokio::fs::rename(tmp, path).await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> ConclaveResult<bool> {
        let path = self.job_path(id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// In-memory job store. Counts writes so reconciliation can be observed.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, CronJob>>,
    writes: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put`/`delete` calls that changed the store.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list(&self) -> ConclaveResult<Vec<CronJob>> {
        let mut jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn get(&self, id: Uuid) -> ConclaveResult<Option<CronJob>> {
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn put(&self, job: &CronJob) -> ConclaveResult<()> {
        self.jobs.write().insert(job.id, job.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> ConclaveResult<bool> {
        let removed = self.jobs.write().remove(&id).is_some();
        if removed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }
}
