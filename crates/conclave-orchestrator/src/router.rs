use crate::pheromone::{deposit, evaporate, PheromoneConfig};
use crate::pool::AgentPool;
use crate::registry::AgentRegistry;
use crate::types::{AgentState, AgentStatus, InteractionOutcome};
use chrono::{DateTime, Utc};
use conclave_core::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Relative weight of each routing signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterWeights {
    #[serde(default = "default_specialty_weight")]
    pub specialty: f64,
    #[serde(default = "default_load_weight")]
    pub load: f64,
    #[serde(default = "default_pheromone_weight")]
    pub pheromone: f64,
}

fn default_specialty_weight() -> f64 {
    0.5
}

fn default_load_weight() -> f64 {
    0.2
}

fn default_pheromone_weight() -> f64 {
    0.3
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            specialty: default_specialty_weight(),
            load: default_load_weight(),
            pheromone: default_pheromone_weight(),
        }
    }
}

/// `[router]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub weights: RouterWeights,
    /// Last resort of every fallback chain.
    #[serde(default)]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub pheromone: PheromoneConfig,
    /// Capacity of the score update queue.
    #[serde(default = "default_score_queue_capacity")]
    pub score_queue_capacity: usize,
}

fn default_score_queue_capacity() -> usize {
    256
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            weights: RouterWeights::default(),
            default_agent: None,
            pheromone: PheromoneConfig::default(),
            score_queue_capacity: default_score_queue_capacity(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> ConclaveResult<()> {
        self.pheromone.validate()?;
        let w = &self.weights;
        if w.specialty < 0.0 || w.load < 0.0 || w.pheromone < 0.0 {
            return Err(ConclaveError::Config(
                "router weights must be non-negative".into(),
            ));
        }
        if w.specialty + w.load + w.pheromone <= 0.0 {
            return Err(ConclaveError::Config(
                "router weights must not all be zero".into(),
            ));
        }
        Ok(())
    }
}

/// One candidate in a routing decision, with the signals behind its score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedAgent {
    pub agent_id: String,
    pub score: f64,
    pub specialty: f64,
    pub load: f64,
    pub pheromone: f64,
}

/// Lowercase alphanumeric words of a message.
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether a tag appears in the message. Multi-word tags must match every
/// word; tags of four or more characters also match as a word prefix
/// ("database" matches "databases").
fn tag_matches(tag: &str, words: &HashSet<String>) -> bool {
    let parts: Vec<&str> = tag
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|p| !p.is_empty())
        .collect();
    if words.contains(tag) {
        return true;
    }
    !parts.is_empty()
        && parts.iter().all(|part| {
            words
                .iter()
                .any(|w| w == part || (part.len() >= 4 && w.starts_with(part)))
        })
}

/// Specialty signal: 0 when no tag matches, otherwise in `[0.5, 1]` by the
/// fraction of tags matched.
pub fn specialty_score(message: &str, tags: &BTreeSet<String>) -> f64 {
    if tags.is_empty() {
        return 0.0;
    }
    let words = tokenize(message);
    let matched = tags.iter().filter(|t| tag_matches(t, &words)).count();
    if matched == 0 {
        0.0
    } else {
        0.5 + 0.5 * matched as f64 / tags.len() as f64
    }
}

/// Load signal: availability scaled down by the failure streak.
pub fn load_score(agent: &AgentState) -> f64 {
    let base = match agent.status {
        AgentStatus::Idle => 1.0,
        AgentStatus::Busy => 0.5,
        AgentStatus::Error => 0.25,
        AgentStatus::Disabled => 0.0,
    };
    base / (1.0 + f64::from(agent.consecutive_failures))
}

/// Effective (evaporated) pheromone of an agent at `now`.
pub fn effective_pheromone(
    agent: &AgentState,
    now: DateTime<Utc>,
    config: &PheromoneConfig,
) -> f64 {
    evaporate(
        agent.pheromone_score,
        agent.pheromone_updated_at,
        now,
        config,
    )
}

/// Fold a batch of outcomes into the registry. Unknown agents are skipped.
/// Returns the ids that were updated.
pub fn apply_outcomes(
    registry: &AgentRegistry,
    config: &PheromoneConfig,
    outcomes: &[InteractionOutcome],
) -> Vec<String> {
    let mut touched = Vec::new();
    for outcome in outcomes {
        let Some(agent) = registry.get(&outcome.agent_id) else {
            debug!(agent = %outcome.agent_id, "Dropping outcome for unknown agent");
            continue;
        };
        let at = outcome.at.max(agent.pheromone_updated_at);
        let current = evaporate(agent.pheromone_score, agent.pheromone_updated_at, at, config);
        let next = deposit(current, outcome.value, config);
        if registry.set_pheromone(&outcome.agent_id, next, at)
            && !touched.contains(&outcome.agent_id)
        {
            touched.push(outcome.agent_id.clone());
        }
    }
    touched
}

enum ScoreCommand {
    Apply(Vec<InteractionOutcome>),
    Flush(oneshot::Sender<()>),
}

/// Bounded queue feeding outcomes to a single writer task.
///
/// Submitting never waits: when the queue is full the batch is dropped with a
/// warning.
pub struct ScoreUpdater {
    tx: parking_lot::Mutex<Option<mpsc::Sender<ScoreCommand>>>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ScoreUpdater {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(registry: Arc<AgentRegistry>, config: PheromoneConfig, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ScoreCommand>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    ScoreCommand::Apply(outcomes) => {
                        for agent_id in apply_outcomes(&registry, &config, &outcomes) {
                            if let Err(e) = registry.persist(&agent_id).await {
                                warn!(agent = %agent_id, error = %e, "Failed to persist pheromone score");
                            }
                        }
                    }
                    ScoreCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Score updater stopped");
        });
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Enqueue outcomes. Returns `false` if they were dropped.
    pub fn submit(&self, outcomes: Vec<InteractionOutcome>) -> bool {
        if outcomes.is_empty() {
            return true;
        }
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            warn!(count = outcomes.len(), "Score updater is shut down; dropping outcomes");
            return false;
        };
        match tx.try_send(ScoreCommand::Apply(outcomes)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ScoreCommand::Apply(dropped))) => {
                warn!(count = dropped.len(), "Score update queue full; dropping outcomes");
                false
            }
            Err(_) => {
                warn!("Score update queue closed; dropping outcomes");
                false
            }
        }
    }

    /// Wait until every outcome submitted so far has been applied.
    pub async fn flush(&self) {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(ScoreCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain the queue and stop the writer task.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Ranks agents for a message and maintains their reputation.
pub struct Router {
    registry: Arc<AgentRegistry>,
    pool: Arc<AgentPool>,
    config: RouterConfig,
    updater: ScoreUpdater,
}

impl Router {
    /// Must be called inside a tokio runtime (spawns the score writer).
    pub fn new(
        registry: Arc<AgentRegistry>,
        pool: Arc<AgentPool>,
        config: RouterConfig,
    ) -> ConclaveResult<Self> {
        config.validate()?;
        let updater = ScoreUpdater::spawn(
            registry.clone(),
            config.pheromone.clone(),
            config.score_queue_capacity,
        );
        Ok(Self {
            registry,
            pool,
            config,
            updater,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Dispatchable agents ranked for `message`, best first.
    pub fn route(&self, message: &str) -> Vec<RankedAgent> {
        self.route_at(message, Utc::now())
    }

    /// [`Router::route`] evaluated at an explicit instant.
    pub fn route_at(&self, message: &str, now: DateTime<Utc>) -> Vec<RankedAgent> {
        let weights = &self.config.weights;
        let mut ranked: Vec<(RankedAgent, u32, Option<DateTime<Utc>>)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|a| a.status != AgentStatus::Disabled && self.pool.is_available(&a.id))
            .map(|agent| {
                let specialty = specialty_score(message, &agent.specialty_domains);
                let load = load_score(&agent);
                let pheromone = effective_pheromone(&agent, now, &self.config.pheromone);
                let score = weights.specialty * specialty
                    + weights.load * load
                    + weights.pheromone * pheromone;
                (
                    RankedAgent {
                        agent_id: agent.id.clone(),
                        score,
                        specialty,
                        load,
                        pheromone,
                    },
                    agent.consecutive_failures,
                    agent.last_active_at,
                )
            })
            .collect();

        ranked.sort_by(|(a, a_fail, a_active), (b, b_fail, b_active)| {
            if (a.score - b.score).abs() > 1e-9 {
                return b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal);
            }
            a_fail
                .cmp(b_fail)
                .then_with(|| b_active.cmp(a_active))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        ranked.into_iter().map(|(r, _, _)| r).collect()
    }

    /// Ordered alternates for `primary`: the primary itself, the best agent
    /// with no specialty tag in common with it, then the default agent.
    /// Duplicates and unavailable agents are omitted.
    pub fn fallback_chain(&self, primary: &str) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let push = |id: &str, chain: &mut Vec<String>| {
            if self.pool.is_available(id) && !chain.iter().any(|c| c == id) {
                chain.push(id.to_string());
            }
        };
        push(primary, &mut chain);

        let primary_tags = self
            .registry
            .get(primary)
            .map(|a| a.specialty_domains)
            .unwrap_or_default();
        let alternate = self.route("").into_iter().find(|candidate| {
            candidate.agent_id != primary
                && self.registry.get(&candidate.agent_id).is_some_and(|a| {
                    a.specialty_domains.is_disjoint(&primary_tags)
                })
        });
        if let Some(alternate) = alternate {
            push(&alternate.agent_id, &mut chain);
        }
        if let Some(default_agent) = &self.config.default_agent {
            push(default_agent, &mut chain);
        }
        chain
    }

    /// Current effective pheromone of an agent (0 if unknown).
    pub fn pheromone(&self, agent_id: &str) -> f64 {
        self.pheromone_at(agent_id, Utc::now())
    }

    pub fn pheromone_at(&self, agent_id: &str, now: DateTime<Utc>) -> f64 {
        self.registry
            .get(agent_id)
            .map(|a| effective_pheromone(&a, now, &self.config.pheromone))
            .unwrap_or(0.0)
    }

    /// Queue interaction outcomes for the reputation store. Never blocks.
    pub fn update_scores(&self, outcomes: Vec<InteractionOutcome>) -> bool {
        self.updater.submit(outcomes)
    }

    /// Wait for queued score updates to be applied.
    pub async fn flush(&self) {
        self.updater.flush().await;
    }

    pub async fn shutdown(&self) {
        self.updater.shutdown().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::registry::MemoryAgentStore;
    use crate::testing::ScriptedBackend;
    use crate::types::AgentSpec;
    use conclave_core::ToolRegistry;

    async fn setup(specs: &[AgentSpec], config: RouterConfig) -> (Arc<AgentRegistry>, Router) {
        let registry = Arc::new(
            AgentRegistry::load(Arc::new(MemoryAgentStore::new()))
                .await
                .unwrap(),
        );
        let pool = Arc::new(AgentPool::new(
            registry.clone(),
            Arc::new(ScriptedBackend::new()),
            Arc::new(ToolRegistry::new()),
            PoolConfig::default(),
        ));
        for spec in specs {
            pool.spawn(spec).await.unwrap();
        }
        let router = Router::new(registry.clone(), pool, config).unwrap();
        (registry, router)
    }

    #[test]
    fn test_specialty_score() {
        let tags: BTreeSet<String> = ["security", "databases"].iter().map(|s| s.to_string()).collect();
        assert_eq!(specialty_score("tell me a joke", &tags), 0.0);
        assert_eq!(specialty_score("is this SECURITY issue real?", &tags), 0.75);
        assert_eq!(specialty_score("security of databases", &tags), 1.0);
        assert_eq!(specialty_score("anything", &BTreeSet::new()), 0.0);
    }

    #[test]
    fn test_prefix_and_multiword_tags() {
        let tags: BTreeSet<String> = ["threat modeling", "database"].iter().map(|s| s.to_string()).collect();
        assert_eq!(specialty_score("we need threat modeling for databases", &tags), 1.0);
    }

    #[tokio::test]
    async fn test_specialty_wins_over_generalist() {
        let (_, router) = setup(
            &[
                AgentSpec::new("generalist", &[]),
                AgentSpec::new("sec", &["security"]),
            ],
            RouterConfig::default(),
        )
        .await;
        let ranked = router.route("review the security of this login flow");
        assert_eq!(ranked[0].agent_id, "sec");
        assert_eq!(ranked.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_agents_excluded() {
        let mut off = AgentSpec::new("off", &["security"]);
        off.disabled = true;
        let (_, router) = setup(&[off, AgentSpec::new("on", &[])], RouterConfig::default()).await;
        let ids: Vec<_> = router.route("security").into_iter().map(|r| r.agent_id).collect();
        assert_eq!(ids, vec!["on"]);
    }

    #[tokio::test]
    async fn test_tie_broken_by_failures_then_recency() {
        let (registry, router) = setup(
            &[AgentSpec::new("a", &[]), AgentSpec::new("b", &[]), AgentSpec::new("c", &[])],
            RouterConfig {
                weights: RouterWeights {
                    specialty: 1.0,
                    load: 0.0,
                    pheromone: 0.0,
                },
                ..Default::default()
            },
        )
        .await;
        registry.update_runtime("a", |a| a.consecutive_failures = 2);
        registry.update_runtime("b", |a| a.last_active_at = Some(Utc::now() - chrono::Duration::hours(1)));
        registry.update_runtime("c", |a| a.last_active_at = Some(Utc::now()));

        let ids: Vec<_> = router.route("hello").into_iter().map(|r| r.agent_id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_fallback_chain() {
        let (_, router) = setup(
            &[
                AgentSpec::new("sec", &["security"]),
                AgentSpec::new("sec2", &["security", "rust"]),
                AgentSpec::new("db", &["databases"]),
                AgentSpec::new("general", &[]),
            ],
            RouterConfig {
                default_agent: Some("general".into()),
                ..Default::default()
            },
        )
        .await;
        let chain = router.fallback_chain("sec");
        assert_eq!(chain[0], "sec");
        assert!(!chain.contains(&"sec2".to_string()));
        assert_eq!(chain.last().unwrap(), "general");
        let mut deduped = chain.clone();
        deduped.dedup();
        assert_eq!(deduped, chain);
    }

    #[tokio::test]
    async fn test_update_scores_applies_and_persists() {
        let (registry, router) = setup(&[AgentSpec::new("a", &[])], RouterConfig::default()).await;
        let before = router.pheromone("a");
        assert!(router.update_scores(vec![InteractionOutcome::success("a")]));
        router.flush().await;
        assert!(router.pheromone("a") > before);
        assert!(registry.get("a").unwrap().pheromone_score > 0.5);
        router.shutdown().await;
        assert!(!router.update_scores(vec![InteractionOutcome::success("a")]));
    }

    #[tokio::test]
    async fn test_repeated_failures_lower_reputation() {
        let (_, router) = setup(&[AgentSpec::new("a", &[])], RouterConfig::default()).await;
        for _ in 0..3 {
            router.update_scores(vec![InteractionOutcome::failure("a")]);
        }
        router.flush().await;
        assert!(router.pheromone("a") < 0.5);
    }

    #[tokio::test]
    async fn test_pheromone_decays_in_simulated_time() {
        let (_, router) = setup(&[AgentSpec::new("a", &[])], RouterConfig::default()).await;
        let now = Utc::now();
        let later = router.pheromone_at("a", now + chrono::Duration::hours(12));
        assert!(later < router.pheromone_at("a", now));
    }
}
