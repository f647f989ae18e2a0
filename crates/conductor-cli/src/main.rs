//! `conductor` binary: serve the gateway, list agents, or run a single task.

mod config;

use clap::{Parser, Subcommand};
use conductor_agents::{AgentRegistry, HttpAgent};
use conductor_core::{EventBus, TaskRequest};
use conductor_gateway::{AuthConfig, GatewayServer};
use conductor_orchestrator::{Conductor, MessagesApiProvider};
use config::ConductorConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: task routing and orchestration for agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List configured and discovered agents
    Agents {
        /// Check every agent's health endpoint first
        #[arg(long)]
        check: bool,
    },
    /// Execute one task and print the outcome as JSON
    Run {
        /// Task text
        message: String,
        /// Send to this agent instead of selecting one
        #[arg(long)]
        agent: Option<String>,
        /// Required capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        /// Decompose into subtasks and orchestrate them
        #[arg(long)]
        compound: bool,
    },
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

    let config_str = tokio::fs::read_to_string(&cli.config).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            cli.config.display(),
            e
        )
    })?;
    let config = ConductorConfig::parse(&config_str)?;
    let conductor = Arc::new(build_conductor(&config).await?);

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            conductor
                .start(Duration::from_secs(config.health.interval_secs))
                .await;

            let auth_config = AuthConfig::new(config.server.api_keys.clone());
            if auth_config.is_enabled() {
                info!(keys = config.server.api_keys.len(), "API key auth enabled");
            }
            let app = GatewayServer::build_with_auth(Arc::clone(&conductor), auth_config);

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("Conductor gateway listening on {}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            conductor.shutdown().await;
        }
        Commands::Agents { check } => {
            if check {
                conductor.registry().check_health().await;
            }
            let agents = conductor.registry().list();
            if agents.is_empty() {
                println!("No agents registered.");
                println!("Configure agents in conductor.toml under [[agents]] or [discovery]");
            } else {
                println!("Registered agents:");
                for agent in &agents {
                    println!(
                        "  {} ({}): {:?}",
                        agent.name(),
                        agent.descriptor.agent_type,
                        agent.status
                    );
                    if let Some(url) = &agent.descriptor.base_url {
                        println!("    url: {url}");
                    }
                    if !agent.descriptor.capabilities.is_empty() {
                        println!(
                            "    capabilities: {}",
                            agent.descriptor.capabilities.join(", ")
                        );
                    }
                }
                println!("\nTotal: {} agent(s)", agents.len());
            }
        }
        Commands::Run {
            message,
            agent,
            capabilities,
            compound,
        } => {
            conductor.registry().check_health().await;
            let request = TaskRequest {
                agent,
                required_capabilities: capabilities,
                compound,
                ..TaskRequest::new(message)
            };
            let result = conductor.submit(request).await;
            conductor.shutdown().await;
            let outcome = result?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}

/// Build the context and register static and discovered agents.
async fn build_conductor(config: &ConductorConfig) -> anyhow::Result<Conductor> {
    let registry = Arc::new(AgentRegistry::new(Arc::new(EventBus::new())));
    for agent in &config.agents {
        registry.register(Arc::new(HttpAgent::new(agent.descriptor())?))?;
    }
    info!(count = registry.len(), "Configured agents registered");

    let provider = config.provider();
    if provider.api_key.is_empty() {
        warn!(
            env = config::API_KEY_ENV,
            "No provider API key; compound tasks and intent analysis will fail"
        );
    }
    let conductor = Conductor::new(
        registry,
        Arc::new(MessagesApiProvider::new(provider)),
        config.settings(),
    )?;

    if !config.discovery.endpoints.is_empty() {
        let report = conductor.discover().await;
        info!(
            registered = report.registered.len(),
            failed = report.failed.len(),
            "Discovery complete"
        );
    }
    Ok(conductor)
}
