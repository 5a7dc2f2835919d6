use crate::model::{SessionKind, SessionRecord};
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Durable storage for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &SessionRecord) -> ConclaveResult<()>;
    async fn get(&self, id: Uuid) -> ConclaveResult<Option<SessionRecord>>;
    async fn update(&self, session: &SessionRecord) -> ConclaveResult<()>;
    async fn delete(&self, id: Uuid) -> ConclaveResult<bool>;
    async fn list(&self) -> ConclaveResult<Vec<Uuid>>;

    /// All sessions of one kind, newest first.
    async fn list_records(&self, kind: SessionKind) -> ConclaveResult<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for id in self.list().await? {
            if let Some(record) = self.get(id).await? {
                if record.session_type == kind {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

/// File-based session store: one pretty-printed JSON file per session.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub async fn new(dir: PathBuf) -> ConclaveResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, session: &SessionRecord) -> ConclaveResult<()> {
        let path = self.session_path(session.id);
        let json = serde_json::to_string_pretty(session)?;
        // Replaced atomically via rename.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(tmp, path).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> ConclaveResult<Option<SessionRecord>> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let session: SessionRecord = serde_json::from_str(&data)
            .map_err(|e| ConclaveError::Store(format!("Failed to parse session {id}: {e}")))?;
        Ok(Some(session))
    }

    async fn update(&self, session: &SessionRecord) -> ConclaveResult<()> {
        self.create(session).await
    }

    async fn delete(&self, id: Uuid) -> ConclaveResult<bool> {
        let path = self.session_path(id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list(&self) -> ConclaveResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }
}

/// In-memory session store, used by tests and ephemeral deployments.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &SessionRecord) -> ConclaveResult<()> {
        self.sessions.write().insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> ConclaveResult<Option<SessionRecord>> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn update(&self, session: &SessionRecord) -> ConclaveResult<()> {
        self.create(session).await
    }

    async fn delete(&self, id: Uuid) -> ConclaveResult<bool> {
        Ok(self.sessions.write().remove(&id).is_some())
    }

    async fn list(&self) -> ConclaveResult<Vec<Uuid>> {
        Ok(self.sessions.read().keys().copied().collect())
    }
}
