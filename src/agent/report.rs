//! Merge/report pipeline: service merges, the project artifact and the final
//! report archives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::Agent;
use crate::coordinator::{CoordinatorError, RunStatus};
use crate::layout::is_exec_file;
use crate::registry::Job;
use crate::tool::{CoverageTool, ReportOutput, ToolError};

const PROJECT_EXEC: &str = "_project_.exec";
const XML_REPORT: &str = "_project_xml";
const HTML_REPORT: &str = "_project_html";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no artifacts to merge into {}", .0.display())]
    NothingToMerge(PathBuf),

    #[error("no service produced execution data")]
    NoServiceArtifacts,

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upload of {} failed: {source}", .path.display())]
    Upload {
        path: PathBuf,
        #[source]
        source: CoordinatorError,
    },

    #[error("{what} notification failed: {source}")]
    Notify {
        what: &'static str,
        #[source]
        source: CoordinatorError,
    },

    #[error("background task failed: {0}")]
    Join(String),
}

impl PipelineError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Merge `sources` into `dest`. Refuses an empty source list so that no
/// empty destination artifact is ever produced.
pub async fn merge_artifacts(
    tool: &dyn CoverageTool,
    sources: &[PathBuf],
    dest: &Path,
) -> Result<(), PipelineError> {
    if sources.is_empty() {
        return Err(PipelineError::NothingToMerge(dest.to_path_buf()));
    }
    tool.merge(sources, dest).await?;
    Ok(())
}

impl Agent {
    /// Merge every live service's accumulated artifacts, holding the run's
    /// artifact lock. Returns service name to merged artifact.
    pub async fn merge_all_services(&self, job: &Job) -> BTreeMap<String, PathBuf> {
        let _artifacts = job.lock_artifacts().await;
        self.merge_all_locked(job).await
    }

    async fn merge_all_locked(&self, job: &Job) -> BTreeMap<String, PathBuf> {
        let mut merged = BTreeMap::new();
        for svc in self.services.live().await {
            if job.is_cancelled() {
                break;
            }
            let dir = self.layout.service_dump_dir(job.plan_id, &svc.name);
            let sources = match list_exec_files(&dir).await {
                Ok(sources) => sources,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(service = %svc.name, dir = %dir.display(), error = %e, "failed to list service artifacts");
                    continue;
                }
            };
            if sources.is_empty() {
                continue;
            }

            let dest = self.layout.new_service_artifact(job.plan_id, &svc.name);
            match merge_artifacts(self.tool.as_ref(), &sources, &dest).await {
                Ok(()) => {
                    for file in &sources {
                        if let Err(e) = tokio::fs::remove_file(file).await {
                            debug!(file = %file.display(), error = %e, "failed to remove merged artifact");
                        }
                    }
                    merged.insert(svc.name.clone(), dest);
                }
                Err(e) => {
                    warn!(service = %svc.name, error = %e, "service merge failed");
                    let msg = format!("merge svc {} exec error: {e}", svc.name);
                    self.services.update(&svc.name, |r| r.push_error(&msg)).await;
                }
            }
        }
        info!(plan_id = job.plan_id, services = merged.len(), "full merge finished");
        merged
    }

    /// Produce and deliver the final reports of `job`.
    ///
    /// Dumps once more, merges every service and then the project, renders
    /// the XML report (uploaded with the `end` notification) and the HTML
    /// report tree (uploaded with the `report` notification).
    pub async fn final_report(self: &Arc<Self>, job: &Job) -> Result<(), PipelineError> {
        info!(plan_id = job.plan_id, "building final report");
        self.dump_exec(job).await;

        let report_dir = self.layout.report_dir(job.plan_id);
        let project_exec = report_dir.join(PROJECT_EXEC);
        {
            let _artifacts = job.lock_artifacts().await;
            let merged = self.merge_all_locked(job).await;
            if merged.is_empty() {
                return Err(PipelineError::NoServiceArtifacts);
            }
            reset_dir(&report_dir).await?;
            let sources: Vec<PathBuf> = merged.into_values().collect();
            merge_artifacts(self.tool.as_ref(), &sources, &project_exec).await?;
        }

        let classes = self.layout.project_classfiles();
        let sources = self.layout.project_sourcefiles();
        let msg = self.build_error_message(job).await;

        let xml = report_dir.join(XML_REPORT);
        self.tool
            .report(&project_exec, &classes, &sources, ReportOutput::Xml(&xml))
            .await?;
        let xml_archive = report_dir.join(format!("{XML_REPORT}.tar.gz"));
        archive(&report_dir, XML_REPORT, &xml_archive).await?;
        let uploaded = self
            .coordinator
            .upload(job.plan_id, &xml_archive)
            .await
            .map_err(|source| PipelineError::Upload {
                path: xml_archive.clone(),
                source,
            })?;
        self.coordinator
            .end(job.plan_id, RunStatus::Success, &msg, Some(&uploaded.uuid))
            .await
            .map_err(|source| PipelineError::Notify { what: "end", source })?;

        let html = report_dir.join(HTML_REPORT);
        self.tool
            .report(&project_exec, &classes, &sources, ReportOutput::Html(&html))
            .await?;
        let html_archive = report_dir.join(format!("{}.tar.gz", Local::now().format("%Y%m%d%H%M%S")));
        archive(&report_dir, HTML_REPORT, &html_archive).await?;
        let uploaded = self
            .coordinator
            .upload(job.plan_id, &html_archive)
            .await
            .map_err(|source| PipelineError::Upload {
                path: html_archive.clone(),
                source,
            })?;
        self.coordinator
            .report(job.plan_id, RunStatus::Success, &msg, Some(&uploaded.download_url))
            .await
            .map_err(|source| PipelineError::Notify { what: "report", source })?;
        Ok(())
    }
}

async fn list_exec_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_exec_file(&path) && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn reset_dir(dir: &Path) -> Result<(), PipelineError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(PipelineError::io(format!("failed to clear {}", dir.display()), e)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| PipelineError::io(format!("failed to create {}", dir.display()), e))
}

/// Write `base/name` (file or directory) as a gzip-compressed tarball at `dest`.
async fn archive(base: &Path, name: &str, dest: &Path) -> Result<(), PipelineError> {
    let src = base.join(name);
    let name = name.to_string();
    let target = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::create(&target)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        if src.is_dir() {
            builder.append_dir_all(&name, &src)?;
        } else {
            builder.append_path_with_name(&src, &name)?;
        }
        builder.into_inner()?.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::Join(e.to_string()))?
    .map_err(|e| PipelineError::io(format!("failed to archive {}", dest.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn test_archive_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("_project_html");
        std::fs::create_dir_all(tree.join("pkg")).unwrap();
        std::fs::write(tree.join("index.html"), b"<html/>").unwrap();
        std::fs::write(tree.join("pkg/a.html"), b"a").unwrap();
        let dest = dir.path().join("out.tar.gz");

        archive(dir.path(), "_project_html", &dest).await.unwrap();

        let gz = flate2::read::GzDecoder::new(std::fs::File::open(&dest).unwrap());
        let mut tar = tar::Archive::new(gz);
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert!(names.contains(&"_project_html/index.html".to_string()));
        assert!(names.contains(&"_project_html/pkg/a.html".to_string()));
    }

    #[tokio::test]
    async fn test_archive_single_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("_project_xml"), b"<report/>").unwrap();
        let dest = dir.path().join("_project_xml.tar.gz");

        archive(dir.path(), "_project_xml", &dest).await.unwrap();

        let gz = flate2::read::GzDecoder::new(std::fs::File::open(&dest).unwrap());
        let mut tar = tar::Archive::new(gz);
        let mut entry = tar.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "_project_xml");
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "<report/>");
    }

    #[tokio::test]
    async fn test_list_exec_files_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pod_a.exec"), b"").unwrap();
        std::fs::write(dir.path().join("svc_b.exec"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("nested.exec")).unwrap();

        let files = list_exec_files(dir.path()).await.unwrap();

        assert_eq!(
            files,
            vec![dir.path().join("pod_a.exec"), dir.path().join("svc_b.exec")]
        );
    }
}
