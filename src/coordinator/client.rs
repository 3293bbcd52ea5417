//! HTTP implementation of [`Coordinator`] on top of `reqwest`.

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Coordinator, CoordinatorError, RunDetail, RunStatus, UploadedFile};
use crate::config::CoordinatorConfig;

/// Standard response envelope of the coordinator API.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    err: Option<ApiError>,
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    #[serde(rename = "planID", default)]
    plan_id: i64,
    #[serde(rename = "projectID", default)]
    project_id: u64,
    #[serde(default)]
    status: String,
    #[serde(rename = "mavenSetting", default)]
    maven_setting: String,
    #[serde(default)]
    includes: String,
    #[serde(default)]
    excludes: String,
}

#[derive(Debug, Serialize)]
struct ReadyRequest<'a> {
    id: u64,
    status: RunStatus,
    msg: &'a str,
}

#[derive(Debug, Serialize)]
struct EndRequest<'a> {
    id: u64,
    status: RunStatus,
    msg: &'a str,
    #[serde(rename = "reportXmlUUID")]
    report_xml_uuid: &'a str,
}

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    id: u64,
    status: RunStatus,
    msg: &'a str,
    #[serde(rename = "reportTarUrl")]
    report_tar_url: &'a str,
}

/// Decode a `/status` response body into the active run, if there is one.
pub(crate) fn parse_status(body: &[u8]) -> Result<Option<RunDetail>, CoordinatorError> {
    let envelope: Envelope<StatusData> =
        serde_json::from_slice(body).map_err(|e| CoordinatorError::Decode(e.to_string()))?;
    if !envelope.success {
        let err = envelope.err.unwrap_or_default();
        return Err(CoordinatorError::Rejected(format!("{} {}", err.code, err.msg)));
    }
    let Some(data) = envelope.data else {
        return Ok(None);
    };
    // A non-positive plan id means no run is active.
    let Ok(plan_id) = u64::try_from(data.plan_id) else {
        return Ok(None);
    };
    if plan_id == 0 {
        return Ok(None);
    }
    Ok(Some(RunDetail {
        plan_id,
        project_id: data.project_id,
        status: data.status.parse()?,
        build_settings: data.maven_setting,
        includes: data.includes,
        excludes: data.excludes,
    }))
}

fn parse_upload(body: &[u8]) -> Result<UploadedFile, CoordinatorError> {
    let envelope: Envelope<UploadedFile> =
        serde_json::from_slice(body).map_err(|e| CoordinatorError::Decode(e.to_string()))?;
    if !envelope.success {
        let err = envelope.err.unwrap_or_default();
        return Err(CoordinatorError::Rejected(format!("{} {}", err.code, err.msg)));
    }
    envelope
        .data
        .ok_or_else(|| CoordinatorError::Decode("upload response without data".to_string()))
}

/// Talks to the coordinator over HTTP.
pub struct CoordinatorClient {
    http: Client,
    config: CoordinatorConfig,
}

impl CoordinatorClient {
    pub fn new(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { http, config })
    }

    fn action_url(&self, action: &str) -> String {
        format!(
            "{}{}/{}",
            self.config.host.trim_end_matches('/'),
            self.config.api_prefix,
            action
        )
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("Authorization", &self.config.token)
            .header("Org", &self.config.org)
            .header("USER-ID", &self.config.user_id)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Vec<u8>, CoordinatorError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(CoordinatorError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        debug!(status = status.as_u16(), body = %String::from_utf8_lossy(&body), "coordinator response");
        Ok(body.to_vec())
    }

    async fn post_json<T: Serialize + Sync>(&self, action: &str, body: &T) -> Result<(), CoordinatorError> {
        let req = self.authed(self.http.post(self.action_url(action))).json(body);
        self.send(req).await.map(|_| ())
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn status(&self) -> Result<Option<RunDetail>, CoordinatorError> {
        debug!(project_id = self.config.project_id, "querying run status");
        let req = self.authed(self.http.get(self.action_url("status"))).query(&[
            ("projectID", self.config.project_id.to_string()),
            ("workspace", self.config.workspace.clone()),
        ]);
        let body = self.send(req).await?;
        parse_status(&body)
    }

    async fn ready(&self, plan_id: u64, msg: &str) -> Result<(), CoordinatorError> {
        info!(plan_id, "sending ready callback");
        let body = ReadyRequest {
            id: plan_id,
            status: RunStatus::Ready,
            msg,
        };
        self.post_json("ready-callBack", &body).await
    }

    async fn end(
        &self,
        plan_id: u64,
        status: RunStatus,
        msg: &str,
        report_xml_uuid: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        info!(plan_id, %status, "sending end callback");
        let body = EndRequest {
            id: plan_id,
            status,
            msg,
            report_xml_uuid: report_xml_uuid.unwrap_or_default(),
        };
        self.post_json("end-callBack", &body).await
    }

    async fn report(
        &self,
        plan_id: u64,
        status: RunStatus,
        msg: &str,
        report_tar_url: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        info!(plan_id, %status, "sending report callback");
        let body = ReportRequest {
            id: plan_id,
            status,
            msg,
            report_tar_url: report_tar_url.unwrap_or_default(),
        };
        self.post_json("report-callBack", &body).await
    }

    async fn upload(&self, plan_id: u64, file: &Path) -> Result<UploadedFile, CoordinatorError> {
        let bytes = tokio::fs::read(file).await.map_err(|source| CoordinatorError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        info!(plan_id, file = %file.display(), size = bytes.len(), "uploading artifact");

        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));
        let url = format!("{}/api/files", self.config.host.trim_end_matches('/'));
        let req = self
            .http
            .post(url)
            .timeout(self.config.upload_timeout)
            .header("Authorization", &self.config.token)
            .query(&[
                (
                    "fileFrom",
                    format!("jacoco-upload-{}-{}", plan_id, self.config.project_id),
                ),
                ("expiredIn", self.config.upload_expiry.clone()),
            ])
            .multipart(form);
        let body = self.send(req).await?;
        parse_upload(&body)
    }
}
