//! `kubectl`-backed topology polling and remote execution.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context as TaskContext, Poll};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{is_instrumented, InstanceSpec, ServiceSpec, TopologyEvent, TopologySource};
use crate::config::ClusterConfig;
use crate::transfer::{CopyError, ExecStdout, InstanceExec};

// ---------------------------------------------------------------------------
// Kubernetes JSON subset
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Deployment {
    #[serde(default)]
    metadata: Meta,
    spec: DeploymentSpec,
}

#[derive(Debug, Deserialize)]
struct DeploymentSpec {
    template: PodTemplate,
}

#[derive(Debug, Deserialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    env: Vec<EnvVar>,
}

#[derive(Debug, Deserialize)]
struct EnvVar {
    name: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: Meta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(rename = "podIP", default)]
    pod_ip: Option<String>,
}

/// Build the instrumented services from raw deployment and pod listings.
fn build_services(
    deployments: List<Deployment>,
    pods: List<Pod>,
    config: &ClusterConfig,
) -> HashMap<String, ServiceSpec> {
    let mut by_app: HashMap<String, Vec<InstanceSpec>> = HashMap::new();
    for pod in pods.items {
        let (Some(app), Some(ip)) = (pod.metadata.labels.get(&config.app_label), pod.status.pod_ip)
        else {
            continue;
        };
        if ip.is_empty() {
            continue;
        }
        let container = pod
            .spec
            .containers
            .first()
            .map(|c| c.name.clone())
            .unwrap_or_default();
        by_app.entry(app.clone()).or_default().push(InstanceSpec {
            address: ip,
            name: pod.metadata.name,
            container,
        });
    }

    let mut services = HashMap::new();
    for deploy in deployments.items {
        let image = deploy.spec.template.spec.containers.iter().find_map(|c| {
            let envs = c
                .env
                .iter()
                .map(|e| (e.name.as_str(), e.value.as_deref().unwrap_or_default()));
            is_instrumented(envs, &config.marker_envs).then(|| c.image.clone())
        });
        let Some(image) = image else {
            continue;
        };
        let name = deploy
            .metadata
            .labels
            .get(&config.app_label)
            .cloned()
            .unwrap_or(deploy.metadata.name);
        let mut instances = by_app.remove(&name).unwrap_or_default();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        services.insert(
            name.clone(),
            ServiceSpec {
                name,
                image,
                instances,
            },
        );
    }
    services
}

/// Diff two listings into the events that turn `old` into `new`.
fn diff(
    old: &HashMap<String, ServiceSpec>,
    new: &HashMap<String, ServiceSpec>,
    initial: bool,
) -> Vec<TopologyEvent> {
    let mut events: Vec<TopologyEvent> = new
        .iter()
        .filter(|(name, spec)| old.get(*name) != Some(*spec))
        .map(|(_, spec)| TopologyEvent::Observed {
            spec: spec.clone(),
            initial,
        })
        .collect();
    events.extend(
        old.keys()
            .filter(|name| !new.contains_key(*name))
            .map(|name| TopologyEvent::Removed { name: name.clone() }),
    );
    events
}

// ---------------------------------------------------------------------------
// KubectlTopology
// ---------------------------------------------------------------------------

/// Polls deployments and pods in one namespace.
pub struct KubectlTopology {
    config: ClusterConfig,
}

impl KubectlTopology {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, kind: &str) -> Result<List<T>> {
        let output = Command::new(&self.config.kubectl_path)
            .args(["get", kind, "-n", self.config.namespace.as_str(), "-o", "json"])
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {} get {}", self.config.kubectl_path, kind))?;
        if !output.status.success() {
            anyhow::bail!(
                "kubectl get {} exited with {}: {}",
                kind,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("failed to parse kubectl {kind} listing"))
    }

    async fn snapshot(&self) -> Result<HashMap<String, ServiceSpec>> {
        let deployments = self.get::<Deployment>("deployments").await?;
        let pods = self.get::<Pod>("pods").await?;
        Ok(build_services(deployments, pods, &self.config))
    }
}

#[async_trait]
impl TopologySource for KubectlTopology {
    async fn run(
        &self,
        events: mpsc::Sender<TopologyEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(namespace = %self.config.namespace, "watching instrumented deployments");
        let mut known: HashMap<String, ServiceSpec> = HashMap::new();
        let mut initial = true;

        loop {
            match self.snapshot().await {
                Ok(current) => {
                    for event in diff(&known, &current, initial) {
                        debug!(?event, "topology change");
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    known = current;
                    // Synced is only announced once a listing was delivered.
                    if initial {
                        initial = false;
                        if events.send(TopologyEvent::Synced).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) if initial => {
                    warn!(error = %format!("{e:#}"), "initial workload listing failed, retrying")
                }
                Err(e) => warn!(error = %format!("{e:#}"), "failed to list workloads"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// KubectlExec
// ---------------------------------------------------------------------------

/// Runs commands inside pods via `kubectl exec`.
pub struct KubectlExec {
    kubectl: String,
    namespace: String,
}

impl KubectlExec {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            kubectl: config.kubectl_path.clone(),
            namespace: config.namespace.clone(),
        }
    }
}

type ExitFuture = Pin<Box<dyn Future<Output = std::io::Result<ExitStatus>> + Send>>;

/// Stdout of a remote command. At end of stream the child is reaped and a
/// non-zero exit turns into a read error, so truncated output is never
/// mistaken for a complete one.
struct ChildStdoutReader {
    child: Option<Child>,
    exit: Option<ExitFuture>,
    stdout: ChildStdout,
}

impl ChildStdoutReader {
    fn new(child: Child, stdout: ChildStdout) -> Self {
        Self {
            child: Some(child),
            exit: None,
            stdout,
        }
    }
}

impl AsyncRead for ChildStdoutReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if let Some(mut child) = this.child.take() {
            this.exit = Some(Box::pin(async move { child.wait().await }));
        }
        let Some(exit) = this.exit.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let status = ready!(exit.as_mut().poll(cx));
        this.exit = None;
        match status {
            Ok(status) if status.success() => Poll::Ready(Ok(())),
            Ok(status) => Poll::Ready(Err(std::io::Error::other(format!(
                "remote command exited with {status}"
            )))),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[async_trait]
impl InstanceExec for KubectlExec {
    async fn exec(&self, instance: &InstanceSpec, command: &[String]) -> Result<ExecStdout, CopyError> {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("exec").arg("-n").arg(&self.namespace).arg(&instance.name);
        if !instance.container.is_empty() {
            cmd.arg("-c").arg(&instance.container);
        }
        cmd.arg("--")
            .args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CopyError::Exec(format!("failed to spawn {}: {e}", self.kubectl)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CopyError::Exec("kubectl exec produced no stdout".to_string()))?;
        Ok(Box::new(ChildStdoutReader::new(child, stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    const DEPLOYMENTS: &str = r#"{
      "items": [
        {
          "metadata": {"name": "orders-v1", "labels": {"app": "orders"}},
          "spec": {"template": {"spec": {"containers": [
            {"name": "orders", "image": "reg/orders:1", "env": [{"name": "SOURCECOV_ENABLED", "value": "true"}]}
          ]}}}
        },
        {
          "metadata": {"name": "gateway", "labels": {"app": "gateway"}},
          "spec": {"template": {"spec": {"containers": [
            {"name": "gw", "image": "reg/gw:3", "env": [{"name": "SECRET", "valueFrom": {}}]}
          ]}}}
        }
      ]
    }"#;

    const PODS: &str = r#"{
      "items": [
        {"metadata": {"name": "orders-b", "labels": {"app": "orders"}},
         "spec": {"containers": [{"name": "orders"}]}, "status": {"podIP": "10.0.0.2"}},
        {"metadata": {"name": "orders-a", "labels": {"app": "orders"}},
         "spec": {"containers": [{"name": "orders"}]}, "status": {"podIP": "10.0.0.1"}},
        {"metadata": {"name": "orders-pending", "labels": {"app": "orders"}},
         "spec": {"containers": [{"name": "orders"}]}, "status": {}},
        {"metadata": {"name": "gw-0", "labels": {"app": "gateway"}},
         "spec": {"containers": [{"name": "gw"}]}, "status": {"podIP": "10.0.1.1"}}
      ]
    }"#;

    fn listing() -> HashMap<String, ServiceSpec> {
        let deployments: List<Deployment> = serde_json::from_str(DEPLOYMENTS).unwrap();
        let pods: List<Pod> = serde_json::from_str(PODS).unwrap();
        build_services(deployments, pods, &ClusterConfig::default())
    }

    #[test]
    fn test_only_instrumented_services_are_listed() {
        let services = listing();
        assert_eq!(services.len(), 1);
        let orders = &services["orders"];
        assert_eq!(orders.image, "reg/orders:1");
        let names: Vec<_> = orders.instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["orders-a", "orders-b"]);
        assert_eq!(orders.instances[0].address, "10.0.0.1");
        assert_eq!(orders.instances[0].container, "orders");
    }

    #[test]
    fn test_diff_emits_changes_and_removals() {
        let current = listing();
        let first = diff(&HashMap::new(), &current, true);
        assert!(matches!(&first[..], [TopologyEvent::Observed { initial: true, .. }]));

        assert!(diff(&current, &current, false).is_empty());

        let mut scaled = current.clone();
        scaled.get_mut("orders").unwrap().instances.pop();
        let changed = diff(&current, &scaled, false);
        assert!(matches!(&changed[..], [TopologyEvent::Observed { initial: false, .. }]));

        let removed = diff(&current, &HashMap::new(), false);
        assert_eq!(
            removed,
            vec![TopologyEvent::Removed {
                name: "orders".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_initial_listing_is_not_synced() {
        let topology = KubectlTopology::new(ClusterConfig {
            kubectl_path: "false".to_string(),
            namespace: "test".to_string(),
            poll_interval: Duration::from_millis(10),
            ..ClusterConfig::default()
        });
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { topology.run(tx, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(rx.recv().await.is_none());
    }

    fn spawn_sh(script: &str) -> ChildStdoutReader {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        ChildStdoutReader::new(child, stdout)
    }

    #[tokio::test]
    async fn test_reader_passes_clean_exit() {
        let mut reader = spawn_sh("printf archive");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"archive");
    }

    #[tokio::test]
    async fn test_reader_reports_failed_exit() {
        let mut reader = spawn_sh("printf partial; exit 3");
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("exited with"), "{err}");
    }
}
