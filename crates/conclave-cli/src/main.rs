//! `conclave`: run the orchestration gateway and administer its state.

mod config;

use clap::{Parser, Subcommand};
use conclave_core::ToolRegistry;
use conclave_gateway::GatewayServer;
use conclave_orchestrator::{
    AgentRegistry, FileAgentStore, FileJobStore, JobStore, Orchestrator, Stores,
};
use config::AppConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conclave", about = "Conclave: multi-agent orchestration core")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conclave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and the gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect agents
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Inspect and reconcile scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List persisted agents
    List,
}

#[derive(Subcommand)]
enum JobsAction {
    /// List persisted jobs
    List,
    /// Apply the [[jobs]] section to the job store
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config).await?;
    let data_dir = config.orchestrator.data_dir.clone();

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{host}:{port}").parse()?;

            let auth = config.server.auth();
            if auth.is_enabled() {
                info!(keys = auth.api_keys.len(), "API key auth enabled");
            }
            let backend = Arc::new(config.backend.build());
            let stores = Stores::file(&data_dir).await?;
            let orchestrator =
                Orchestrator::build(config.orchestrator, stores, backend, ToolRegistry::new())
                    .await?;
            orchestrator.start_scheduler();

            let app = GatewayServer::build_with_auth(orchestrator.clone(), auth);
            GatewayServer::serve(app, addr, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
            })
            .await?;
            orchestrator.shutdown().await;
        }
        Commands::Agents { action } => match action {
            AgentsAction::List => {
                let store = Arc::new(FileAgentStore::new(data_dir.join("agents")).await?);
                let registry = AgentRegistry::load(store).await?;
                let agents = registry.snapshot();
                if agents.is_empty() {
                    println!("No agents persisted in {}.", data_dir.display());
                } else {
                    for agent in &agents {
                        let domains: Vec<&str> =
                            agent.specialty_domains.iter().map(String::as_str).collect();
                        println!(
                            "  {:<20} {:<9} pheromone={:.3} [{}]",
                            agent.id,
                            agent.status.to_string(),
                            agent.pheromone_score,
                            domains.join(", ")
                        );
                    }
                    println!("\nTotal: {} agent(s)", agents.len());
                }
            }
        },
        Commands::Jobs { action } => match action {
            JobsAction::List => {
                let store = FileJobStore::new(data_dir.join("jobs")).await?;
                let jobs = store.list().await?;
                if jobs.is_empty() {
                    println!("No jobs persisted. Declare them under [[jobs]] and run `conclave jobs reconcile`.");
                } else {
                    for job in &jobs {
                        let next = job
                            .next_run_at
                            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
                        println!(
                            "  {:<24} {:<16} agent={:<12} runs={} ok={} failed={} next={}",
                            job.name,
                            job.schedule.source(),
                            job.agent_id,
                            job.run_count,
                            job.success_count,
                            job.fail_count,
                            next
                        );
                    }
                    println!("\nTotal: {} job(s)", jobs.len());
                }
            }
            JobsAction::Reconcile => {
                let backend = Arc::new(config.backend.build());
                let stores = Stores::file(&data_dir).await?;
                let orchestrator =
                    Orchestrator::build(config.orchestrator, stores, backend, ToolRegistry::new())
                        .await?;
                let report = orchestrator.boot_report();
                println!(
                    "inserted: {}\nupdated: {}\nunchanged: {}",
                    report.inserted.join(", "),
                    report.updated.join(", "),
                    report.unchanged.join(", ")
                );
                orchestrator.shutdown().await;
            }
        },
    }

    Ok(())
}
