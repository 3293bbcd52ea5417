//! Run lifecycle: tracking coordinator runs, the per-run scheduling loop and
//! its supervisor.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use super::Agent;
use crate::coordinator::{CoordinatorError, RunDetail, RunStatus};
use crate::registry::{Job, RunPhase};
use crate::tool::Filters;

impl Agent {
    /// Track the run the coordinator reported.
    ///
    /// A known plan only has its status updated. A new plan supersedes every
    /// tracked run, then rewrites the build settings and starts its own
    /// supervisor. A new plan whose settings cannot be written is dropped.
    pub async fn upsert_run(self: &Arc<Self>, detail: RunDetail) -> Result<Arc<Job>> {
        if let Some(job) = self.jobs.get(detail.plan_id).await {
            let previous = job.status();
            if previous != detail.status {
                info!(plan_id = job.plan_id, from = %previous, to = %detail.status, "run status changed");
                job.set_status(detail.status);
            }
            return Ok(job);
        }

        info!(plan_id = detail.plan_id, status = %detail.status, "new run");
        let job = Arc::new(Job::new(
            detail.plan_id,
            detail.status,
            detail.build_settings,
            Filters {
                includes: detail.includes,
                excludes: detail.excludes,
            },
        ));
        let superseded = self.jobs.insert_exclusive(Arc::clone(&job)).await;
        if !superseded.is_empty() {
            info!(plan_id = job.plan_id, superseded = superseded.len(), "previous runs cancelled");
        }
        // Superseded runs are cancelled before their settings are replaced.
        if let Err(e) = self.write_build_settings(&job.build_settings).await {
            job.cancel();
            self.jobs.delete_if_same(&job).await;
            return Err(e);
        }
        self.services.reset_run_errors().await;

        let agent = Arc::clone(self);
        let supervised = Arc::clone(&job);
        tokio::spawn(async move { agent.supervise(supervised).await });
        Ok(job)
    }

    async fn write_build_settings(&self, content: &str) -> Result<()> {
        let path = &self.config.paths.build_settings;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("failed to write build settings {}", path.display()))
    }

    /// Own a run from start to removal: start its scheduling loop, watch its
    /// status, then join the loop, clean the workspace after the grace period
    /// and drop the run from the registry.
    async fn supervise(self: Arc<Self>, job: Arc<Job>) {
        let scheduling = (job.phase() == RunPhase::Running).then(|| {
            let agent = Arc::clone(&self);
            let job = Arc::clone(&job);
            tokio::spawn(async move { agent.scheduling_loop(job).await })
        });

        self.watchdog(&job).await;

        if let Some(task) = scheduling {
            if let Err(e) = task.await {
                warn!(plan_id = job.plan_id, error = %e, "scheduling loop aborted");
            }
        }

        tokio::time::sleep(self.config.schedule.run_grace).await;
        let dir = self.layout.run_dir(job.plan_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(plan_id = job.plan_id, dir = %dir.display(), error = %e, "failed to remove run workspace"),
        }
        if self.jobs.delete_if_same(&job).await {
            info!(plan_id = job.plan_id, phase = %job.phase(), "run retired");
        }
    }

    /// Follow the run's status until it is cancelled. A final status cancels
    /// the run; `ending` triggers the final report.
    async fn watchdog(self: &Arc<Self>, job: &Arc<Job>) {
        let interval = self.config.schedule.watchdog_interval;
        loop {
            if job.is_cancelled() {
                return;
            }

            let status = job.status();
            if status.is_final() {
                if !job.phase().is_terminal() {
                    let phase = match status {
                        RunStatus::Success => RunPhase::Success,
                        RunStatus::Fail => RunPhase::Fail,
                        _ => RunPhase::Error,
                    };
                    job.fail(phase, "");
                }
                info!(plan_id = job.plan_id, %status, "run finished");
                job.cancel();
                return;
            }

            if status == RunStatus::Ending && !job.phase().is_terminal() {
                match self.final_report(job).await {
                    Ok(()) => {
                        info!(plan_id = job.plan_id, "final report delivered");
                        job.set_phase(RunPhase::Success);
                        job.set_status(RunStatus::Success);
                        job.cancel();
                        return;
                    }
                    Err(e) => {
                        self.fail_run(job, &format!("report xml and html error: {e}"))
                            .await;
                        return;
                    }
                }
            }

            tokio::select! {
                _ = job.cancel_token().cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Bootstrap, initial dump, ready notification, then periodic dumps with
    /// a full merge every `merge_every` iterations.
    async fn scheduling_loop(self: Arc<Self>, job: Arc<Job>) {
        info!(plan_id = job.plan_id, "scheduling run");
        if let Err(e) = self.bootstrap(&job).await {
            if job.is_cancelled() {
                return;
            }
            self.fail_run(&job, &format!("load class and sources error: {e:#}"))
                .await;
            return;
        }
        if job.is_cancelled() {
            return;
        }

        self.dump_exec(&job).await;

        if let Err(e) = self.notify_ready(&job).await {
            if job.is_cancelled() {
                return;
            }
            self.fail_run(&job, &format!("callback ready error: {e}")).await;
            return;
        }

        let schedule = &self.config.schedule;
        let merge_every = schedule.merge_every.max(1);
        let mut iteration: u32 = 0;
        loop {
            tokio::select! {
                _ = job.cancel_token().cancelled() => {
                    info!(plan_id = job.plan_id, "scheduling loop stopped");
                    return;
                }
                _ = tokio::time::sleep(schedule.dump_interval) => {}
            }
            self.dump_exec(&job).await;
            iteration += 1;
            if iteration % merge_every == 0 {
                self.merge_all_services(&job).await;
            }
        }
    }

    /// Create the workspace and extract classes and sources of every service
    /// whose last artifact discovery succeeded. Errors of earlier runs do not
    /// exclude a service.
    async fn bootstrap(&self, job: &Job) -> Result<()> {
        let dir = self.layout.run_dir(job.plan_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create run workspace {}", dir.display()))?;

        let archives: Vec<_> = self
            .services
            .live()
            .await
            .into_iter()
            .filter(|s| s.discovery_error.is_none())
            .flat_map(|s| s.archives)
            .collect();
        if archives.is_empty() {
            anyhow::bail!("no service has discovered archives");
        }

        info!(plan_id = job.plan_id, archives = archives.len(), "extracting classes and sources");
        self.tool
            .extract(&archives, &self.layout.project_class_dir(), &job.filters)
            .await
            .context("failed to extract classes and sources")?;
        Ok(())
    }

    /// Tell the coordinator the run is collecting. Returns `false` without a
    /// call when the run is already ready.
    pub async fn notify_ready(&self, job: &Job) -> Result<bool, CoordinatorError> {
        if job.phase() == RunPhase::Ready {
            return Ok(false);
        }
        if job.status() == RunStatus::Ready {
            job.set_phase(RunPhase::Ready);
            return Ok(false);
        }
        let msg = self.build_error_message(job).await;
        self.coordinator.ready(job.plan_id, &msg).await?;
        job.set_phase(RunPhase::Ready);
        info!(plan_id = job.plan_id, "run ready");
        Ok(true)
    }

    /// Move the run to `Fail`, cancel it and send a best-effort `end`
    /// notification carrying the aggregated message.
    pub async fn fail_run(&self, job: &Job, reason: &str) {
        error!(plan_id = job.plan_id, reason, "run failed");
        job.fail(RunPhase::Fail, reason);
        job.set_status(RunStatus::Fail);
        job.cancel();

        let msg = self.build_error_message(job).await;
        if let Err(e) = self
            .coordinator
            .end(job.plan_id, RunStatus::Fail, &msg, None)
            .await
        {
            warn!(plan_id = job.plan_id, error = %e, "failed to send end notification");
        }
    }
}
