//! Dump cycle: pull execution data out of every live instance.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::report::merge_artifacts;
use super::Agent;
use crate::registry::{Job, ServiceRecord};

/// Outcome of one dump cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// Services whose worker ran.
    pub services: usize,
    /// Instances dumped successfully.
    pub dumped: usize,
    /// Instances that failed during this cycle.
    pub failed: usize,
    /// Service artifacts produced by merging instance dumps.
    pub merged: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct ServiceOutcome {
    dumped: usize,
    failed: usize,
    merged: Option<PathBuf>,
}

impl Agent {
    /// Dump every live service of `job`, at most `dump.concurrency` services
    /// at a time. Holds the run's artifact lock for the whole cycle.
    pub async fn dump_exec(self: &Arc<Self>, job: &Job) -> DumpSummary {
        let _artifacts = job.lock_artifacts().await;
        let services = self.services.live().await;
        let semaphore = Arc::new(Semaphore::new(self.config.dump.concurrency.max(1)));
        let mut workers = JoinSet::new();
        let mut summary = DumpSummary::default();

        debug!(plan_id = job.plan_id, services = services.len(), "dump cycle started");
        for svc in services {
            let permit = tokio::select! {
                _ = job.cancel_token().cancelled() => {
                    info!(plan_id = job.plan_id, "run cancelled, not launching further dumps");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let agent = Arc::clone(self);
            let plan_id = job.plan_id;
            workers.spawn(async move {
                let _permit = permit;
                agent.dump_service(plan_id, svc).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => {
                    summary.services += 1;
                    summary.dumped += outcome.dumped;
                    summary.failed += outcome.failed;
                    summary.merged.extend(outcome.merged);
                }
                Err(e) => warn!(plan_id = job.plan_id, error = %e, "dump worker failed"),
            }
        }
        info!(
            plan_id = job.plan_id,
            services = summary.services,
            dumped = summary.dumped,
            failed = summary.failed,
            "dump cycle finished"
        );
        summary
    }

    async fn dump_service(&self, plan_id: u64, svc: ServiceRecord) -> ServiceOutcome {
        let mut outcome = ServiceOutcome::default();
        let dir = self.layout.service_dump_dir(plan_id, &svc.name);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            let msg = format!("create svc {} dump dir error: {e}", svc.name);
            warn!(service = %svc.name, error = %e, "failed to create dump dir");
            self.services.update(&svc.name, |r| r.push_error(&msg)).await;
            return outcome;
        }

        let port = self.config.tool.agent_port;
        let mut collected = Vec::new();
        let mut instance_errors = Vec::new();
        for inst in svc.instances.iter().filter(|i| !i.is_errored()) {
            let address = inst.spec.address.as_str();
            if let Err(e) = probe(address, port, self.config.dump.probe_timeout).await {
                debug!(service = %svc.name, instance = %inst.spec.name, address, error = %e, "instance unreachable");
                instance_errors.push((
                    inst.spec.name.clone(),
                    format!("svc {} instance {} ({address}) fail to dial: {e}", svc.name, inst.spec.name),
                ));
                continue;
            }

            let dest = self.layout.new_instance_artifact(plan_id, &svc.name, &inst.spec.name);
            match self.tool.dump(address, port, &dest).await {
                Ok(()) => collected.push(dest),
                Err(e) => {
                    warn!(service = %svc.name, instance = %inst.spec.name, error = %e, "dump failed");
                    let _ = tokio::fs::remove_file(&dest).await;
                    instance_errors.push((
                        inst.spec.name.clone(),
                        format!("svc {} instance {} ({address}) dump exec error: {e}", svc.name, inst.spec.name),
                    ));
                }
            }
        }
        outcome.dumped = collected.len();
        outcome.failed = instance_errors.len();

        // Instance dumps that fail to merge stay on disk for the next full merge.
        let mut service_error = None;
        if !collected.is_empty() {
            let dest = self.layout.new_service_artifact(plan_id, &svc.name);
            match merge_artifacts(self.tool.as_ref(), &collected, &dest).await {
                Ok(()) => {
                    for file in &collected {
                        if let Err(e) = tokio::fs::remove_file(file).await {
                            debug!(file = %file.display(), error = %e, "failed to remove merged dump");
                        }
                    }
                    outcome.merged = Some(dest);
                }
                Err(e) => {
                    warn!(service = %svc.name, error = %e, "merging instance dumps failed");
                    service_error = Some(format!("merge pod exec error: {e}"));
                }
            }
        }

        if service_error.is_some() || !instance_errors.is_empty() {
            let written = self
                .services
                .update(&svc.name, |record| {
                    if let Some(msg) = &service_error {
                        record.push_error(msg);
                    }
                    for (instance, msg) in instance_errors {
                        record.fail_instance(&instance, msg);
                    }
                })
                .await;
            if !written {
                debug!(service = %svc.name, "service deleted during dump, errors dropped");
            }
        }
        outcome
    }
}

/// Check that the coverage agent port accepts connections.
async fn probe(address: &str, port: u16, timeout: Duration) -> std::io::Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
        Ok(stream) => stream.map(drop),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no answer within {}s", timeout.as_secs_f64()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe("127.0.0.1", port, Duration::from_secs(1)).await.is_ok());

        drop(listener);
        assert!(probe("127.0.0.1", port, Duration::from_secs(1)).await.is_err());
    }
}
