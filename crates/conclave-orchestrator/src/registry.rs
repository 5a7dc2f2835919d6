use crate::types::{AgentSpec, AgentState, AgentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_core::{ConclaveError, ConclaveResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Durable storage for agent records.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn load_all(&self) -> ConclaveResult<Vec<AgentState>>;
    async fn save(&self, agent: &AgentState) -> ConclaveResult<()>;
}

/// One JSON file per agent, named after the agent id.
pub struct FileAgentStore {
    dir: PathBuf,
}

impl FileAgentStore {
    pub async fn new(dir: PathBuf) -> ConclaveResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl AgentStore for FileAgentStore {
    async fn load_all(&self) -> ConclaveResult<Vec<AgentState>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut agents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<AgentState>(&data) {
                Ok(agent) => agents.push(agent),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable agent record"),
            }
        }
        Ok(agents)
    }

    async fn save(&self, agent: &AgentState) -> ConclaveResult<()> {
        let path = self.dir.join(format!("{}.json", agent.id));
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(agent)?).await?;
        tokio::fs::rename(tmp, path).await?;
        Ok(())
    }
}

/// In-memory agent store. Counts writes so callers can observe persistence.
#[derive(Default)]
pub struct MemoryAgentStore {
    agents: RwLock<HashMap<String, AgentState>>,
    writes: AtomicUsize,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, as if the records had been persisted by an earlier run.
    pub fn with_agents(agents: Vec<AgentState>) -> Self {
        let store = Self::default();
        {
            let mut map = store.agents.write();
            for agent in agents {
                map.insert(agent.id.clone(), agent);
            }
        }
        store
    }

    /// Last persisted version of an agent.
    pub fn stored(&self, id: &str) -> Option<AgentState> {
        self.agents.read().get(id).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn load_all(&self) -> ConclaveResult<Vec<AgentState>> {
        Ok(self.agents.read().values().cloned().collect())
    }

    async fn save(&self, agent: &AgentState) -> ConclaveResult<()> {
        self.agents.write().insert(agent.id.clone(), agent.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Authoritative in-memory view of all agents, written through to an [`AgentStore`].
///
/// Reads never touch the store. Every mutation is followed by [`AgentRegistry::persist`],
/// which serializes writes and always saves the latest in-memory state, so
/// concurrent writers of disjoint fields never overwrite each other on disk.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentState>>,
    store: Arc<dyn AgentStore>,
    write_lock: tokio::sync::Mutex<()>,
}

impl AgentRegistry {
    /// Load every persisted agent. Agents left `busy` by a previous process
    /// are reset to `idle`: no dispatch survives a restart.
    pub async fn load(store: Arc<dyn AgentStore>) -> ConclaveResult<Self> {
        let mut agents = HashMap::new();
        let mut reset = Vec::new();
        for mut agent in store.load_all().await? {
            if agent.status == AgentStatus::Busy {
                agent.status = AgentStatus::Idle;
                agent.current_session_id = None;
                reset.push(agent.clone());
            }
            agents.insert(agent.id.clone(), agent);
        }
        for agent in &reset {
            info!(agent = %agent.id, "Resetting agent left busy by a previous run");
            store.save(agent).await?;
        }
        Ok(Self {
            agents: RwLock::new(agents),
            store,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Insert a new agent, or refresh the identity fields of a known one.
    ///
    /// Runtime fields and the pheromone score of a known agent are preserved.
    pub async fn register(
        &self,
        spec: &AgentSpec,
        initial_pheromone: f64,
    ) -> ConclaveResult<AgentState> {
        if !spec.has_valid_id() {
            return Err(ConclaveError::Config(format!(
                "Invalid agent id '{}': use 1-64 letters, digits, '-' or '_'",
                spec.id
            )));
        }
        {
            let mut agents = self.agents.write();
            agents
                .entry(spec.id.clone())
                .and_modify(|agent| {
                    agent.display_name = spec.display_name();
                    agent.specialty_domains = spec.domains();
                    agent.model_config = spec.model.clone();
                    if spec.disabled {
                        agent.status = AgentStatus::Disabled;
                    } else if agent.status == AgentStatus::Disabled {
                        agent.status = AgentStatus::Idle;
                    }
                })
                .or_insert_with(|| AgentState::new(spec, initial_pheromone));
        }
        self.persist(&spec.id).await?;
        self.get(&spec.id)
            .ok_or_else(|| ConclaveError::NotFound(format!("agent {}", spec.id)))
    }

    pub fn get(&self, id: &str) -> Option<AgentState> {
        self.agents.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.read().contains_key(id)
    }

    /// All agents, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentState> {
        let mut agents: Vec<_> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Mutate pool-owned fields (status, session, failure streak, last activity).
    pub(crate) fn update_runtime<F>(&self, id: &str, update: F) -> Option<AgentState>
    where
        F: FnOnce(&mut AgentState),
    {
        let mut agents = self.agents.write();
        let agent = agents.get_mut(id)?;
        update(agent);
        Some(agent.clone())
    }

    /// Set router-owned fields.
    pub(crate) fn set_pheromone(&self, id: &str, score: f64, at: DateTime<Utc>) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(id) {
            Some(agent) => {
                agent.pheromone_score = score;
                agent.pheromone_updated_at = at;
                true
            }
            None => false,
        }
    }

    /// Write the current in-memory state of one agent to the store.
    pub async fn persist(&self, id: &str) -> ConclaveResult<()> {
        let _guard = self.write_lock.lock().await;
        match self.get(id) {
            Some(agent) => self.store.save(&agent).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_persists() {
        let store = Arc::new(MemoryAgentStore::new());
        let registry = AgentRegistry::load(store.clone()).await.unwrap();
        let state = registry
            .register(&AgentSpec::new("alpha", &["security"]), 0.5)
            .await
            .unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(store.stored("alpha").unwrap().pheromone_score, 0.5);
    }

    #[tokio::test]
    async fn test_reregister_preserves_pheromone() {
        let store = Arc::new(MemoryAgentStore::new());
        let registry = AgentRegistry::load(store.clone()).await.unwrap();
        registry
            .register(&AgentSpec::new("alpha", &["security"]), 0.5)
            .await
            .unwrap();
        registry.set_pheromone("alpha", 0.9, Utc::now());

        let state = registry
            .register(&AgentSpec::new("alpha", &["databases"]), 0.5)
            .await
            .unwrap();
        assert_eq!(state.pheromone_score, 0.9);
        assert!(state.specialty_domains.contains("databases"));
        assert!(!state.specialty_domains.contains("security"));
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let registry = AgentRegistry::load(Arc::new(MemoryAgentStore::new()))
            .await
            .unwrap();
        let err = registry
            .register(&AgentSpec::new("a/b", &[]), 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Config(_)));
    }

    #[tokio::test]
    async fn test_busy_agents_reset_on_load() {
        let mut busy = AgentState::new(&AgentSpec::new("alpha", &[]), 0.5);
        busy.status = AgentStatus::Busy;
        busy.current_session_id = Some(uuid::Uuid::new_v4());
        let store = Arc::new(MemoryAgentStore::with_agents(vec![busy]));

        let registry = AgentRegistry::load(store.clone()).await.unwrap();
        let agent = registry.get("alpha").unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_session_id.is_none());
        assert_eq!(store.stored("alpha").unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_disjoint_writes_both_survive() {
        let store = Arc::new(MemoryAgentStore::new());
        let registry = AgentRegistry::load(store.clone()).await.unwrap();
        registry
            .register(&AgentSpec::new("alpha", &[]), 0.5)
            .await
            .unwrap();

        registry.update_runtime("alpha", |a| a.consecutive_failures = 3);
        registry.set_pheromone("alpha", 0.8, Utc::now());
        registry.persist("alpha").await.unwrap();

        let stored = store.stored("alpha").unwrap();
        assert_eq!(stored.consecutive_failures, 3);
        assert_eq!(stored.pheromone_score, 0.8);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAgentStore::new(dir.path().join("agents")).await.unwrap();
        let agent = AgentState::new(&AgentSpec::new("alpha", &["rust"]), 0.4);
        store.save(&agent).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, vec![agent]);
    }
}
