//! The orchestration context: every component, constructed once and passed
//! by reference.

use crate::events::{EventSink, SessionEvent};
use crate::executor::{dispatch_routed, OrchestratorExecutor, PipelineConfig};
use crate::pool::{AgentPool, DispatchResult, PoolConfig};
use crate::registry::{AgentRegistry, AgentStore, FileAgentStore, MemoryAgentStore};
use crate::roundtable::{RoundtableEngine, RoundtablePlan, RoundtableRequest, RoundtableResult};
use crate::router::{Router, RouterConfig};
use crate::scheduler::{
    FileJobStore, JobDefinition, JobHistory, JobStore, MemoryJobStore, ReconcileReport, Scheduler,
};
use crate::swarm::{ConsensusConfig, SwarmEngine, SwarmPlan, SwarmRequest, SwarmResult};
use crate::tools::register_builtins;
use crate::types::{AgentSpec, AgentSummary};
use conclave_agent::CompletionBackend;
use conclave_core::{ConclaveError, ConclaveResult, ToolRegistry};
use conclave_session::{FileSessionStore, MemorySessionStore, SessionKind, SessionRecord, SessionStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Orchestration settings shared by every deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            pool: PoolConfig::default(),
            router: RouterConfig::default(),
            consensus: ConsensusConfig::default(),
            agents: Vec::new(),
            jobs: Vec::new(),
            pipelines: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> ConclaveResult<()> {
        if self.pool.max_concurrent == 0 {
            return Err(ConclaveError::Config("pool.max_concurrent must be positive".into()));
        }
        if self.pool.dispatch_timeout_secs == 0 {
            return Err(ConclaveError::Config(
                "pool.dispatch_timeout_secs must be positive".into(),
            ));
        }
        self.router.validate()?;
        self.consensus.validate()?;
        let mut names = std::collections::HashSet::new();
        for pipeline in &self.pipelines {
            if !names.insert(pipeline.name.as_str()) {
                return Err(ConclaveError::Config(format!(
                    "pipeline '{}' defined twice",
                    pipeline.name
                )));
            }
        }
        Ok(())
    }
}

/// The durable stores behind an orchestrator.
pub struct Stores {
    pub agents: Arc<dyn AgentStore>,
    pub jobs: Arc<dyn JobStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub history: Arc<JobHistory>,
}

impl Stores {
    /// File-backed stores under `data_dir`: `agents/`, `jobs/`, `sessions/`, `history/`.
    pub async fn file(data_dir: &Path) -> ConclaveResult<Self> {
        Ok(Self {
            agents: Arc::new(FileAgentStore::new(data_dir.join("agents")).await?),
            jobs: Arc::new(FileJobStore::new(data_dir.join("jobs")).await?),
            sessions: Arc::new(FileSessionStore::new(data_dir.join("sessions")).await?),
            history: Arc::new(JobHistory::open(data_dir.join("history")).await?),
        })
    }

    pub fn memory() -> Self {
        Self {
            agents: Arc::new(MemoryAgentStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            history: Arc::new(JobHistory::in_memory()),
        }
    }
}

/// Owns the pool, router, scheduler and session engines.
pub struct Orchestrator {
    pool: Arc<AgentPool>,
    router: Arc<Router>,
    scheduler: Arc<Scheduler>,
    roundtable: Arc<RoundtableEngine>,
    swarm: Arc<SwarmEngine>,
    sessions: Arc<dyn SessionStore>,
    events: broadcast::Sender<SessionEvent>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    job_definitions: Vec<JobDefinition>,
    boot_report: ReconcileReport,
}

impl Orchestrator {
    /// Wire every component, spawn the configured agents and reconcile the
    /// declarative jobs into the job store.
    pub async fn build(
        config: OrchestratorConfig,
        stores: Stores,
        backend: Arc<dyn CompletionBackend>,
        mut tools: ToolRegistry,
    ) -> ConclaveResult<Arc<Self>> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::load(stores.agents).await?);
        register_builtins(&mut tools, registry.clone(), config.router.pheromone.clone());

        let pool = Arc::new(
            AgentPool::new(registry.clone(), backend, Arc::new(tools), config.pool.clone())
                .with_initial_pheromone(config.router.pheromone.initial),
        );
        for spec in &config.agents {
            pool.spawn(spec).await?;
        }
        let router = Arc::new(Router::new(registry, pool.clone(), config.router.clone())?);
        let roundtable = Arc::new(RoundtableEngine::new(
            pool.clone(),
            router.clone(),
            stores.sessions.clone(),
        ));
        let swarm = Arc::new(SwarmEngine::new(
            pool.clone(),
            router.clone(),
            stores.sessions.clone(),
            config.consensus.clone(),
        )?);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let executor = Arc::new(OrchestratorExecutor::new(
            pool.clone(),
            router.clone(),
            roundtable.clone(),
            swarm.clone(),
            config.pipelines.clone(),
            publisher(events.clone()),
        ));
        let scheduler = Arc::new(Scheduler::new(stores.jobs, stores.history, executor));

        let boot_report = scheduler.reconcile(&config.jobs).await?;
        let orchestrator = Arc::new(Self {
            pool,
            router,
            scheduler,
            roundtable,
            swarm,
            sessions: stores.sessions,
            events,
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            scheduler_task: Mutex::new(None),
            job_definitions: config.jobs,
            boot_report,
        });
        info!(
            agents = orchestrator.pool.registry().snapshot().len(),
            jobs = orchestrator.job_definitions.len(),
            "Orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Receive every session event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// What reconciling the configured jobs changed at build time.
    pub fn boot_report(&self) -> &ReconcileReport {
        &self.boot_report
    }

    /// Re-apply the declarative job definitions from the config.
    pub async fn reconcile_jobs(&self) -> ConclaveResult<ReconcileReport> {
        self.scheduler.reconcile(&self.job_definitions).await
    }

    pub async fn spawn_agent(&self, spec: &AgentSpec) -> ConclaveResult<AgentSummary> {
        self.pool.spawn(spec).await?;
        self.agent(&spec.id).await
    }

    pub async fn terminate_agent(&self, agent_id: &str) -> ConclaveResult<()> {
        self.pool.terminate(agent_id).await
    }

    pub async fn list_agents(&self) -> Vec<AgentSummary> {
        self.pool.list().await
    }

    pub async fn agent(&self, agent_id: &str) -> ConclaveResult<AgentSummary> {
        self.pool
            .list()
            .await
            .into_iter()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| ConclaveError::NotFound(format!("agent {agent_id}")))
    }

    /// Single routed dispatch with fallback.
    pub async fn ask(&self, message: &str) -> ConclaveResult<DispatchResult> {
        dispatch_routed(&self.pool, &self.router, message, None).await
    }

    /// Run a roundtable and wait for it to finish. Dropping the returned
    /// future cancels the session.
    pub async fn run_roundtable(
        self: &Arc<Self>,
        request: &RoundtableRequest,
    ) -> ConclaveResult<RoundtableResult> {
        let plan = self.roundtable.prepare(request).await?;
        let session_id = plan.session_id();
        let cancel = self.track(session_id);
        let _cancel_on_drop = cancel.clone().drop_guard();
        self.spawn_roundtable(plan, cancel)
            .await
            .map_err(|e| ConclaveError::Agent(format!("roundtable {session_id} aborted: {e}")))
    }

    /// Start a roundtable in the background and return its session id.
    pub async fn start_roundtable(self: &Arc<Self>, request: &RoundtableRequest) -> ConclaveResult<Uuid> {
        let plan = self.roundtable.prepare(request).await?;
        let session_id = plan.session_id();
        let cancel = self.track(session_id);
        drop(self.spawn_roundtable(plan, cancel));
        Ok(session_id)
    }

    /// Run a swarm and wait for it to finish. Dropping the returned future
    /// cancels the session.
    pub async fn run_swarm(self: &Arc<Self>, request: &SwarmRequest) -> ConclaveResult<SwarmResult> {
        let plan = self.swarm.prepare(request).await?;
        let session_id = plan.session_id();
        let cancel = self.track(session_id);
        let _cancel_on_drop = cancel.clone().drop_guard();
        self.spawn_swarm(plan, cancel)
            .await
            .map_err(|e| ConclaveError::Agent(format!("swarm {session_id} aborted: {e}")))
    }

    /// Start a swarm in the background and return its session id.
    pub async fn start_swarm(self: &Arc<Self>, request: &SwarmRequest) -> ConclaveResult<Uuid> {
        let plan = self.swarm.prepare(request).await?;
        let session_id = plan.session_id();
        let cancel = self.track(session_id);
        drop(self.spawn_swarm(plan, cancel));
        Ok(session_id)
    }

    fn spawn_roundtable(
        self: &Arc<Self>,
        plan: RoundtablePlan,
        cancel: CancellationToken,
    ) -> JoinHandle<RoundtableResult> {
        let session_id = plan.session_id();
        let this = self.clone();
        tokio::spawn(async move {
            let _tracked = Tracked { orchestrator: this.clone(), session_id };
            this.roundtable.run(plan, this.sink(), cancel).await
        })
    }

    fn spawn_swarm(self: &Arc<Self>, plan: SwarmPlan, cancel: CancellationToken) -> JoinHandle<SwarmResult> {
        let session_id = plan.session_id();
        let this = self.clone();
        tokio::spawn(async move {
            let _tracked = Tracked { orchestrator: this.clone(), session_id };
            this.swarm.run(plan, this.sink(), cancel).await
        })
    }

    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.running.lock().contains_key(&session_id)
    }

    pub fn running_sessions(&self) -> Vec<Uuid> {
        self.running.lock().keys().copied().collect()
    }

    /// Cancel a running session. In-flight dispatches release their slots;
    /// the partial transcript is kept.
    pub fn cancel_session(&self, session_id: Uuid) -> ConclaveResult<()> {
        match self.running.lock().get(&session_id) {
            Some(token) => {
                token.cancel();
                info!(session_id = %session_id, "Session cancellation requested");
                Ok(())
            }
            None => Err(ConclaveError::NotFound(format!(
                "running session {session_id}"
            ))),
        }
    }

    pub async fn get_session(&self, session_id: Uuid) -> ConclaveResult<SessionRecord> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| ConclaveError::NotFound(format!("session {session_id}")))
    }

    pub async fn list_sessions(&self, kind: SessionKind) -> ConclaveResult<Vec<SessionRecord>> {
        self.sessions.list_records(kind).await
    }

    /// Delete a finished session. Running sessions must be cancelled first.
    pub async fn delete_session(&self, session_id: Uuid) -> ConclaveResult<()> {
        if self.is_running(session_id) {
            return Err(ConclaveError::Config(format!(
                "session {session_id} is still running; cancel it first"
            )));
        }
        if self.sessions.delete(session_id).await? {
            Ok(())
        } else {
            Err(ConclaveError::NotFound(format!("session {session_id}")))
        }
    }

    /// Agent summaries, monitor counters and running sessions as one document.
    pub async fn dashboard(&self) -> serde_json::Value {
        serde_json::json!({
            "agents": self.pool.list().await,
            "monitor": self.pool.monitor().to_json().await,
            "active_dispatches": self.pool.active_count(),
            "max_concurrent": self.pool.max_concurrent(),
            "running_sessions": self.running_sessions(),
        })
    }

    /// Start the scheduler loop. Calling it twice has no effect.
    pub fn start_scheduler(&self) {
        let mut task = self.scheduler_task.lock();
        if task.is_none() {
            *task = Some(self.scheduler.clone().start(self.shutdown.child_token()));
        }
    }

    /// Stop the scheduler, cancel running sessions, then flush job history
    /// and score updates.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.scheduler_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        self.scheduler.flush_history().await;
        self.router.shutdown().await;
        info!("Orchestrator stopped");
    }

    fn track(&self, session_id: Uuid) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.running.lock().insert(session_id, token.clone());
        token
    }

    fn untrack(&self, session_id: Uuid) {
        self.running.lock().remove(&session_id);
    }

    fn sink(&self) -> EventSink {
        publisher(self.events.clone())
    }
}

/// Removes a session from the running set when its task ends, panics included.
struct Tracked {
    orchestrator: Arc<Orchestrator>,
    session_id: Uuid,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.orchestrator.untrack(self.session_id);
    }
}

fn publisher(events: broadcast::Sender<SessionEvent>) -> EventSink {
    Arc::new(move |event| {
        // No subscribers is normal.
        let _ = events.send(event);
    })
}
