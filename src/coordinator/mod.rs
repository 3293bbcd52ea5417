//! Central coordinator boundary: run status polling, status callbacks and
//! artifact upload.

pub mod client;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

pub use client::CoordinatorClient;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("coordinator answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("coordinator rejected request: {0}")]
    Rejected(String),

    #[error("malformed coordinator response: {0}")]
    Decode(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoordinatorError {
    /// Failures worth retrying: network trouble and server-side errors.
    /// Rejections, malformed answers and client errors fail fast.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinatorError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            CoordinatorError::Status { status, .. } => *status >= 500,
            CoordinatorError::Rejected(_)
            | CoordinatorError::Decode(_)
            | CoordinatorError::Io { .. } => false,
        }
    }
}

/// Run status as reported by, and reported back to, the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ready,
    Ending,
    Cancel,
    Success,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ready => "ready",
            RunStatus::Ending => "ending",
            RunStatus::Cancel => "cancel",
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
        }
    }

    /// Statuses after which the run is never scheduled again.
    pub fn is_final(&self) -> bool {
        matches!(self, RunStatus::Cancel | RunStatus::Success | RunStatus::Fail)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "ready" => Ok(RunStatus::Ready),
            "ending" => Ok(RunStatus::Ending),
            "cancel" => Ok(RunStatus::Cancel),
            "success" => Ok(RunStatus::Success),
            "fail" => Ok(RunStatus::Fail),
            other => Err(CoordinatorError::Decode(format!("unknown run status '{other}'"))),
        }
    }
}

/// The coordinator's view of the active run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDetail {
    pub plan_id: u64,
    pub project_id: u64,
    pub status: RunStatus,
    /// Build-tool settings file content.
    pub build_settings: String,
    pub includes: String,
    pub excludes: String,
}

/// A file accepted by the coordinator's file service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedFile {
    pub uuid: String,
    #[serde(rename = "url", default)]
    pub download_url: String,
    #[serde(default)]
    pub name: String,
}

/// Calls the agent makes against the coordinator.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// The currently active run, if any.
    async fn status(&self) -> Result<Option<RunDetail>, CoordinatorError>;

    async fn ready(&self, plan_id: u64, msg: &str) -> Result<(), CoordinatorError>;

    async fn end(
        &self,
        plan_id: u64,
        status: RunStatus,
        msg: &str,
        report_xml_uuid: Option<&str>,
    ) -> Result<(), CoordinatorError>;

    async fn report(
        &self,
        plan_id: u64,
        status: RunStatus,
        msg: &str,
        report_tar_url: Option<&str>,
    ) -> Result<(), CoordinatorError>;

    async fn upload(&self, plan_id: u64, file: &Path) -> Result<UploadedFile, CoordinatorError>;
}

/// Applies a [`RetryPolicy`] to status polling and the status callbacks.
///
/// Uploads pass straight through.
pub struct RetryingCoordinator {
    inner: Arc<dyn Coordinator>,
    policy: RetryPolicy,
}

impl RetryingCoordinator {
    pub fn new(inner: Arc<dyn Coordinator>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Coordinator for RetryingCoordinator {
    async fn status(&self) -> Result<Option<RunDetail>, CoordinatorError> {
        self.policy
            .run("status", CoordinatorError::is_transient, || self.inner.status())
            .await
    }

    async fn ready(&self, plan_id: u64, msg: &str) -> Result<(), CoordinatorError> {
        self.policy
            .run("ready-callBack", CoordinatorError::is_transient, || {
                self.inner.ready(plan_id, msg)
            })
            .await
    }

    async fn end(
        &self,
        plan_id: u64,
        status: RunStatus,
        msg: &str,
        report_xml_uuid: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        self.policy
            .run("end-callBack", CoordinatorError::is_transient, || {
                self.inner.end(plan_id, status, msg, report_xml_uuid)
            })
            .await
    }

    async fn report(
        &self,
        plan_id: u64,
        status: RunStatus,
        msg: &str,
        report_tar_url: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        self.policy
            .run("report-callBack", CoordinatorError::is_transient, || {
                self.inner.report(plan_id, status, msg, report_tar_url)
            })
            .await
    }

    async fn upload(&self, plan_id: u64, file: &Path) -> Result<UploadedFile, CoordinatorError> {
        self.inner.upload(plan_id, file).await
    }
}
