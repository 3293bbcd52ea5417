//! covagent -- in-cluster code-coverage collection agent.
//!
//! The agent discovers coverage-instrumented services, periodically dumps
//! execution data from every instance, merges it per service and per project,
//! and reports the results to a central coordinator.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod layout;
pub mod registry;
pub mod retry;
pub mod tool;
pub mod topology;
pub mod transfer;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::coordinator::CoordinatorClient;
use crate::tool::JacocoCli;
use crate::topology::{KubectlExec, KubectlTopology};

/// Start the agent with the process-backed adapters and run until Ctrl-C.
pub async fn serve(config: AgentConfig) -> Result<()> {
    config.validate()?;
    tracing::info!(
        host = %config.coordinator.host,
        namespace = %config.cluster.namespace,
        work_dir = %config.paths.work_dir.display(),
        "Starting covagent"
    );
    tokio::fs::create_dir_all(&config.paths.work_dir)
        .await
        .with_context(|| format!("failed to create {}", config.paths.work_dir.display()))?;

    let coordinator = CoordinatorClient::new(config.coordinator.clone())
        .context("failed to build coordinator client")?;
    let tool = JacocoCli::new(&config.tool);
    let exec = KubectlExec::new(&config.cluster);
    let topology = KubectlTopology::new(config.cluster.clone());

    let agent = Agent::new(config, Arc::new(tool), Arc::new(coordinator), Arc::new(exec));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Ctrl-C handler unavailable"),
        }
    });

    agent.run(Arc::new(topology), shutdown).await
}
