//! Process-backed [`CoverageTool`]: `java -jar jacococli.jar ...` and the
//! archive extraction script.
//!
//! Children are awaited to completion and are never killed when a run is
//! cancelled.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{CoverageTool, Filters, ReportOutput, ToolError};
use crate::config::ToolConfig;

/// Longest stderr excerpt carried in an error.
const STDERR_TAIL: usize = 2048;

pub struct JacocoCli {
    java: String,
    cli_jar: PathBuf,
    extract_script: PathBuf,
}

impl JacocoCli {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            java: config.java_path.clone(),
            cli_jar: config.cli_jar.clone(),
            extract_script: config.extract_script.clone(),
        }
    }

    fn java(&self, action: &str) -> Command {
        let mut cmd = Command::new(&self.java);
        cmd.arg("-jar").arg(&self.cli_jar).arg(action);
        cmd
    }

    pub(crate) fn merge_args(sources: &[PathBuf], dest: &Path) -> Vec<String> {
        let mut args: Vec<String> = sources.iter().map(|p| p.display().to_string()).collect();
        args.push("--destfile".to_string());
        args.push(dest.display().to_string());
        args
    }

    pub(crate) fn report_args(
        exec: &Path,
        classes: &Path,
        sources: &Path,
        output: ReportOutput<'_>,
    ) -> Vec<String> {
        let (flag, target) = match output {
            ReportOutput::Xml(p) => ("--xml", p),
            ReportOutput::Html(p) => ("--html", p),
        };
        vec![
            exec.display().to_string(),
            "--classfiles".to_string(),
            classes.display().to_string(),
            "--sourcefiles".to_string(),
            sources.display().to_string(),
            flag.to_string(),
            target.display().to_string(),
        ]
    }
}

async fn run(mut cmd: Command, program: &str, action: &str) -> Result<(), ToolError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    info!(program, action, command = ?cmd.as_std(), "running coverage tool");

    let output = cmd.output().await.map_err(|source| ToolError::Spawn {
        program: program.to_string(),
        source,
    })?;

    debug!(
        program,
        action,
        stdout = %String::from_utf8_lossy(&output.stdout),
        "coverage tool finished"
    );

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let start = stderr
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    Err(ToolError::Failed {
        program: program.to_string(),
        action: action.to_string(),
        status: output.status.to_string(),
        stderr: stderr[start..].to_string(),
    })
}

#[async_trait]
impl CoverageTool for JacocoCli {
    async fn dump(&self, address: &str, port: u16, dest: &Path) -> Result<(), ToolError> {
        let mut cmd = self.java("dump");
        cmd.arg("--address")
            .arg(address)
            .arg("--port")
            .arg(port.to_string())
            .arg("--destfile")
            .arg(dest)
            .arg("--reset");
        run(cmd, &self.java, "dump").await
    }

    async fn merge(&self, sources: &[PathBuf], dest: &Path) -> Result<(), ToolError> {
        let mut cmd = self.java("merge");
        cmd.args(Self::merge_args(sources, dest));
        run(cmd, &self.java, "merge").await
    }

    async fn report(
        &self,
        exec: &Path,
        classes: &Path,
        sources: &Path,
        output: ReportOutput<'_>,
    ) -> Result<(), ToolError> {
        let mut cmd = self.java("report");
        cmd.args(Self::report_args(exec, classes, sources, output));
        run(cmd, &self.java, "report").await
    }

    async fn extract(
        &self,
        archives: &[PathBuf],
        out_dir: &Path,
        filters: &Filters,
    ) -> Result<(), ToolError> {
        let joined = archives
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut cmd = Command::new("bash");
        cmd.arg(&self.extract_script)
            .arg(joined)
            .arg(out_dir)
            .env("INCLUDES", &filters.includes)
            .env("EXCLUDES", &filters.excludes);
        run(cmd, "bash", "extract").await
    }
}
