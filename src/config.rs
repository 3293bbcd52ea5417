//! TOML configuration for the coverage agent.
//!
//! Layered model: compiled-in defaults, an optional TOML file (path from
//! `COVAGENT_CONFIG` or `/etc/covagent/covagent.toml`), then the deployment
//! environment variables the agent's StatefulSet injects (`CENTER_HOST`,
//! `CENTER_TOKEN`, `PROJECT_ID`, `PROJECT_NS`, `ORG_NAME`, `WORKSPACE`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "COVAGENT_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/covagent/covagent.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the agent process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded agent configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `COVAGENT_CONFIG`.
    /// 2. `/etc/covagent/covagent.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "COVAGENT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Overlay the deployment environment variables onto this config.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CENTER_HOST") {
            self.coordinator.host = host;
        }
        if let Some(token) = lookup("CENTER_TOKEN") {
            self.coordinator.token = token;
        }
        if let Some(org) = lookup("ORG_NAME") {
            self.coordinator.org = org;
        }
        if let Some(workspace) = lookup("WORKSPACE") {
            self.coordinator.workspace = workspace;
        }
        if let Some(project_id) = lookup("PROJECT_ID") {
            self.coordinator.project_id = project_id
                .trim()
                .parse()
                .with_context(|| format!("PROJECT_ID is not a number: {project_id}"))?;
        }
        if let Some(ns) = lookup("PROJECT_NS") {
            self.cluster.namespace = ns;
        }
        Ok(())
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.host.trim().is_empty() {
            anyhow::bail!("coordinator.host must be set (or CENTER_HOST)");
        }
        if self.coordinator.token.trim().is_empty() {
            anyhow::bail!("coordinator.token must be set (or CENTER_TOKEN)");
        }
        if self.cluster.namespace.trim().is_empty() {
            anyhow::bail!("cluster.namespace must be set (or PROJECT_NS)");
        }
        if self.dump.concurrency == 0 {
            anyhow::bail!("dump.concurrency must be at least 1");
        }
        if self.schedule.merge_every == 0 {
            anyhow::bail!("schedule.merge_every must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Central coordinator endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Base URL, e.g. `https://erda.example.com`.
    pub host: String,
    /// Value sent in the `Authorization` header.
    pub token: String,
    /// Value sent in the `Org` header.
    pub org: String,
    /// Value sent in the `USER-ID` header.
    pub user_id: String,
    pub project_id: u64,
    pub workspace: String,
    /// Path prefix for the status and callback endpoints.
    pub api_prefix: String,
    /// Timeout for status and callback requests.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Timeout for artifact uploads.
    #[serde(with = "duration_secs")]
    pub upload_timeout: Duration,
    /// Retention passed to the file service.
    pub upload_expiry: String,
    /// Poll interval while a run is active.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Poll interval after an error or when no run exists.
    #[serde(with = "duration_secs")]
    pub idle_poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            token: String::new(),
            org: String::new(),
            user_id: "2".to_string(),
            project_id: 0,
            workspace: String::new(),
            api_prefix: "/api/code-coverage/actions".to_string(),
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(180),
            upload_expiry: "168h".to_string(),
            poll_interval: Duration::from_secs(60),
            idle_poll_interval: Duration::from_secs(180),
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// Where instrumented workloads live and how they are recognised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace: String,
    pub kubectl_path: String,
    /// Environment variables that mark a container as instrumented when set to `true`.
    pub marker_envs: Vec<String>,
    /// Label holding the service name on deployments and pods.
    pub app_label: String,
    /// Directory copied out of an instance to discover archives.
    pub app_dir: String,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            kubectl_path: "kubectl".to_string(),
            marker_envs: vec![
                "OPEN_JACOCO_AGENT".to_string(),
                "SOURCECOV_ENABLED".to_string(),
            ],
            app_label: "app".to_string(),
            app_dir: "/app".to_string(),
            poll_interval: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Coverage tool
// ---------------------------------------------------------------------------

/// External coverage-tool executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub java_path: String,
    pub cli_jar: PathBuf,
    pub extract_script: PathBuf,
    /// TCP port of the coverage agent inside every instance.
    pub agent_port: u16,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            java_path: "java".to_string(),
            cli_jar: PathBuf::from("/app/jacococli.jar"),
            extract_script: PathBuf::from("/app/extract-jar.sh"),
            agent_port: 6300,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Cadence of the per-run scheduling loop and its cleanup timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "duration_secs")]
    pub dump_interval: Duration,
    /// A full merge runs every `merge_every` steady-state iterations.
    pub merge_every: u32,
    #[serde(with = "duration_secs")]
    pub watchdog_interval: Duration,
    /// Delay between a run's cancellation and its workspace removal.
    #[serde(with = "duration_secs")]
    pub run_grace: Duration,
    /// Delay between a service's removal and its purge from the registry.
    #[serde(with = "duration_secs")]
    pub service_grace: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            dump_interval: Duration::from_secs(5 * 60),
            merge_every: 10,
            watchdog_interval: Duration::from_secs(30),
            run_grace: Duration::from_secs(5 * 60),
            service_grace: Duration::from_secs(10 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// Dump
// ---------------------------------------------------------------------------

/// Dump coordinator limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Maximum number of services dumped concurrently.
    pub concurrency: usize,
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of every run workspace and artifact cache.
    pub work_dir: PathBuf,
    /// Build-tool settings file rewritten for every new run.
    pub build_settings: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/jacoco/work"),
            build_settings: PathBuf::from("/usr/share/maven/conf/settings.xml"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Durations are written as seconds in TOML; fractions are allowed.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}"
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AgentConfig = toml::from_str("").unwrap();
        let defaults = AgentConfig::default();

        assert_eq!(cfg.tool.agent_port, defaults.tool.agent_port);
        assert_eq!(cfg.dump.concurrency, 5);
        assert_eq!(cfg.schedule.merge_every, 10);
        assert_eq!(cfg.schedule.dump_interval, Duration::from_secs(300));
        assert_eq!(cfg.paths.work_dir, PathBuf::from("/jacoco/work"));
    }

    #[test]
    fn test_partial_toml_overrides() {
        let toml_str = r#"
[coordinator]
host = "https://center.example"
poll_interval = 0.5

[dump]
concurrency = 2
"#;
        let cfg: AgentConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.coordinator.host, "https://center.example");
        assert_eq!(cfg.coordinator.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.dump.concurrency, 2);
        assert_eq!(cfg.dump.probe_timeout, Duration::from_secs(5));
        assert_eq!(cfg.coordinator.user_id, "2");
    }

    #[test]
    fn test_negative_duration_rejected() {
        let result: Result<AgentConfig, _> = toml::from_str("[schedule]\ndump_interval = -1\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CENTER_HOST", "http://center:8080"),
            ("CENTER_TOKEN", "secret"),
            ("PROJECT_ID", "17"),
            ("PROJECT_NS", "project-17-test"),
            ("ORG_NAME", "acme"),
            ("WORKSPACE", "TEST"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AgentConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.coordinator.host, "http://center:8080");
        assert_eq!(cfg.coordinator.token, "secret");
        assert_eq!(cfg.coordinator.project_id, 17);
        assert_eq!(cfg.cluster.namespace, "project-17-test");
        assert_eq!(cfg.coordinator.org, "acme");
        assert_eq!(cfg.coordinator.workspace, "TEST");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_bad_project_id_errors() {
        let mut cfg = AgentConfig::default();
        let result = cfg.apply_overrides(|k| (k == "PROJECT_ID").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_requires_host() {
        let cfg = AgentConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("covagent.toml");
        std::fs::write(
            &path,
            r#"
[tool]
agent_port = 6400
"#,
        )
        .unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.tool.agent_port, 6400);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = AgentConfig::load(Path::new("/nonexistent/path/covagent.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = AgentConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: AgentConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.schedule.run_grace, back.schedule.run_grace);
        assert_eq!(cfg.cluster.marker_envs, back.cluster.marker_envs);
        assert_eq!(cfg.retry.max_attempts, back.retry.max_attempts);
    }
}
