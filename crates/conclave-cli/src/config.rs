use anyhow::Context;
use conclave_agent::BackendConfig;
use conclave_gateway::AuthConfig;
use conclave_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::Path;

/// Environment variable that overrides `[backend] api_key`.
pub const API_KEY_ENV: &str = "CONCLAVE_BACKEND_API_KEY";

/// The whole `conclave.toml`.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub backend: BackendConfig,
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Keys accepted by the gateway. Empty disables auth.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn auth(&self) -> AuthConfig {
        AuthConfig::new(self.api_keys.clone())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl AppConfig {
    /// Parse and validate. `api_key_override` replaces the backend key.
    pub fn parse(raw: &str, api_key_override: Option<String>) -> anyhow::Result<Self> {
        let mut config: AppConfig = toml::from_str(raw)?;
        if let Some(key) = api_key_override.filter(|k| !k.is_empty()) {
            config.backend.api_key = Some(key);
        }
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// Read `path` after loading `.env`.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        // A missing .env is fine.
        let _ = dotenvy::dotenv();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::parse(&raw, std::env::var(API_KEY_ENV).ok())
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }
}
