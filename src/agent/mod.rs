//! The orchestration engine.
//!
//! An [`Agent`] consumes topology events into the service registry, polls the
//! coordinator for the active run and drives each run's scheduling loop:
//! bootstrap, periodic dumps, periodic merges and the final report.

mod dump;
mod message;
mod report;
mod run;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::AgentConfig;
use crate::coordinator::{Coordinator, RetryingCoordinator};
use crate::layout::Layout;
use crate::registry::{JobRegistry, ServiceRegistry};
use crate::tool::CoverageTool;
use crate::topology::{ServiceSpec, TopologyEvent, TopologySource};
use crate::transfer::{copy_from_instance, InstanceExec};

pub use dump::DumpSummary;
pub use message::{compose_error_message, MAX_MESSAGE_CHARS};
pub use report::{merge_artifacts, PipelineError};

/// Extension of the archives discovered in an application directory.
const ARCHIVE_EXT: &str = "jar";

pub struct Agent {
    config: AgentConfig,
    layout: Layout,
    services: Arc<ServiceRegistry>,
    jobs: JobRegistry,
    tool: Arc<dyn CoverageTool>,
    coordinator: Arc<dyn Coordinator>,
    exec: Arc<dyn InstanceExec>,
}

impl Agent {
    /// Build an agent. Coordinator calls are wrapped in the configured retry
    /// policy; tool invocations and transfers are not retried.
    pub fn new(
        config: AgentConfig,
        tool: Arc<dyn CoverageTool>,
        coordinator: Arc<dyn Coordinator>,
        exec: Arc<dyn InstanceExec>,
    ) -> Arc<Self> {
        let coordinator: Arc<dyn Coordinator> =
            Arc::new(RetryingCoordinator::new(coordinator, config.retry.clone()));
        Arc::new(Self {
            layout: Layout::new(&config.paths.work_dir),
            config,
            services: Arc::new(ServiceRegistry::new()),
            jobs: JobRegistry::new(),
            tool,
            coordinator,
            exec,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Run until `shutdown` fires: consume `topology`, and once its initial
    /// listing is in, watch the coordinator for runs.
    pub async fn run(
        self: Arc<Self>,
        topology: Arc<dyn TopologySource>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(256);
        let source_cancel = shutdown.child_token();
        let source = tokio::spawn({
            let cancel = source_cancel.clone();
            async move { topology.run(tx, cancel).await }
        });

        let mut watcher = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else {
                        warn!("topology source stopped");
                        break;
                    };
                    if matches!(event, TopologyEvent::Synced) && watcher.is_none() {
                        let services = self.services.len().await;
                        info!(services, "initial inventory loaded");
                        let agent = Arc::clone(&self);
                        let cancel = shutdown.child_token();
                        watcher = Some(tokio::spawn(async move { agent.watch_runs(cancel).await }));
                        continue;
                    }
                    self.handle_topology_event(event).await;
                }
            }
        }

        source_cancel.cancel();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        for job in self.jobs.list().await {
            job.cancel();
        }
        match source.await {
            Ok(result) => result.context("topology source failed"),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(anyhow::anyhow!("topology source panicked: {e}")),
        }
    }

    pub async fn handle_topology_event(self: &Arc<Self>, event: TopologyEvent) {
        match event {
            TopologyEvent::Observed { spec, initial } => self.on_service_observed(spec, initial).await,
            TopologyEvent::Removed { name } => self.on_service_removed(&name).await,
            TopologyEvent::Synced => {}
        }
    }

    /// Register or refresh a service. Artifact discovery runs inline for the
    /// initial listing and in the background otherwise.
    pub async fn on_service_observed(self: &Arc<Self>, spec: ServiceSpec, initial: bool) {
        let name = spec.name.clone();
        let observation = self.services.observe(spec).await;
        if !observation.needs_discovery() {
            return;
        }
        if initial {
            let _ = self.reload_artifacts(&name).await;
        } else {
            let agent = Arc::clone(self);
            tokio::spawn(async move {
                let _ = agent.reload_artifacts(&name).await;
            });
        }
    }

    pub async fn on_service_removed(&self, name: &str) {
        self.services
            .remove(name, self.config.schedule.service_grace)
            .await;
    }

    /// Copy the application directory out of one instance and record the
    /// archives found in it. Failures are recorded on the service.
    pub async fn reload_artifacts(&self, name: &str) -> Result<Vec<PathBuf>> {
        let Some((load_lock, lifecycle)) = self.services.lifecycle(name).await else {
            anyhow::bail!("service {name} is not registered");
        };
        let _guard = load_lock.lock().await;
        if lifecycle.is_cancelled() {
            debug!(service = name, "service deleted, skipping artifact discovery");
            return Ok(Vec::new());
        }

        match self.discover_archives(name).await {
            Ok(archives) => {
                info!(service = name, archives = archives.len(), "artifacts discovered");
                let found = archives.clone();
                self.services
                    .update(name, |r| {
                        r.archives = found;
                        r.discovery_error = None;
                    })
                    .await;
                Ok(archives)
            }
            Err(e) => {
                error!(service = name, error = %format!("{e:#}"), "artifact discovery failed");
                let msg = format!("load svc {name} jar error: {e:#}");
                self.services
                    .update(name, |r| r.discovery_error = Some(msg))
                    .await;
                Err(e)
            }
        }
    }

    async fn discover_archives(&self, name: &str) -> Result<Vec<PathBuf>> {
        let record = self
            .services
            .get(name)
            .await
            .with_context(|| format!("service {name} vanished"))?;
        let instance = record
            .instances
            .first()
            .with_context(|| format!("service {name} has no running instance"))?;

        let cache = self.layout.service_cache_dir(name);
        if tokio::fs::try_exists(&cache).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&cache)
                .await
                .with_context(|| format!("failed to clear {}", cache.display()))?;
        }
        let app = cache.join("app");
        tokio::fs::create_dir_all(&app)
            .await
            .with_context(|| format!("failed to create {}", app.display()))?;

        copy_from_instance(
            self.exec.as_ref(),
            &instance.spec,
            &self.config.cluster.app_dir,
            &app,
        )
        .await
        .with_context(|| format!("failed to copy {} from {}", self.config.cluster.app_dir, instance.spec.name))?;

        let archives = tokio::task::spawn_blocking(move || find_archives(&app))
            .await
            .context("archive scan task failed")?;
        if archives.is_empty() {
            anyhow::bail!("no .{ARCHIVE_EXT} files under {}", self.config.cluster.app_dir);
        }
        Ok(archives)
    }

    /// Poll the coordinator until `cancel` fires.
    async fn watch_runs(self: Arc<Self>, cancel: CancellationToken) {
        info!("watching coordinator for runs");
        loop {
            let wait = match self.poll_once().await {
                Ok(true) => self.config.coordinator.poll_interval,
                Ok(false) => self.config.coordinator.idle_poll_interval,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "run status poll failed");
                    self.config.coordinator.idle_poll_interval
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Ask the coordinator for the active run and track it. Returns whether a
    /// run was found.
    pub async fn poll_once(self: &Arc<Self>) -> Result<bool> {
        let detail = self
            .coordinator
            .status()
            .await
            .context("failed to query run status")?;
        let Some(detail) = detail else {
            debug!("no active run");
            return Ok(false);
        };
        self.upsert_run(detail).await?;
        Ok(true)
    }
}

fn find_archives(root: &std::path::Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == ARCHIVE_EXT))
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_archives_walks_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("app.jar"), b"x").unwrap();
        std::fs::write(dir.path().join("lib/dep.jar"), b"x").unwrap();
        std::fs::write(dir.path().join("lib/readme.txt"), b"x").unwrap();

        let found = find_archives(dir.path());

        assert_eq!(
            found,
            vec![dir.path().join("app.jar"), dir.path().join("lib/dep.jar")]
        );
    }
}
