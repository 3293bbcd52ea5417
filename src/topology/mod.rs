//! Inventory events describing instrumented services and their instances.
//!
//! The agent consumes these from a [`TopologySource`]; how a source learns
//! about workloads is its own business.

pub mod kubectl;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use kubectl::{KubectlExec, KubectlTopology};

/// One running copy of a service as seen by the topology source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Network address reachable from the agent (pod IP).
    pub address: String,
    /// Pod name, unique within the namespace.
    pub name: String,
    /// Container that runs the instrumented process.
    pub container: String,
}

/// An instrumented service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub instances: Vec<InstanceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A service was added or changed. `initial` marks the start-up listing.
    Observed { spec: ServiceSpec, initial: bool },
    Removed { name: String },
    /// The initial listing has been delivered completely.
    Synced,
}

/// Produces [`TopologyEvent`]s until cancelled.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn run(
        &self,
        events: mpsc::Sender<TopologyEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Whether any of `envs` marks a container as instrumented.
pub fn is_instrumented<'a, I>(envs: I, markers: &[String]) -> bool
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    envs.into_iter()
        .any(|(name, value)| value == "true" && markers.iter().any(|m| m == name))
}
