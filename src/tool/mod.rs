//! Contract of the external coverage-tool executor.
//!
//! The agent never interprets execution data itself: dumping, merging,
//! reporting and class extraction are all delegated to an external program.

pub mod jacoco;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use jacoco::JacocoCli;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {action} exited with {status}: {stderr}")]
    Failed {
        program: String,
        action: String,
        status: String,
        stderr: String,
    },
}

/// Output shape of a report invocation.
#[derive(Debug, Clone, Copy)]
pub enum ReportOutput<'a> {
    /// Machine-readable report written to a single file.
    Xml(&'a Path),
    /// Human-readable report tree written under a directory.
    Html(&'a Path),
}

/// Include/exclude patterns of the active run, handed to the extraction tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub includes: String,
    pub excludes: String,
}

#[async_trait]
pub trait CoverageTool: Send + Sync {
    /// Dump-and-reset the execution data of the agent at `address:port` into `dest`.
    async fn dump(&self, address: &str, port: u16, dest: &Path) -> Result<(), ToolError>;

    /// Merge `sources` into a new artifact at `dest`.
    async fn merge(&self, sources: &[PathBuf], dest: &Path) -> Result<(), ToolError>;

    /// Render a report for `exec` against the given class and source trees.
    async fn report(
        &self,
        exec: &Path,
        classes: &Path,
        sources: &Path,
        output: ReportOutput<'_>,
    ) -> Result<(), ToolError>;

    /// Populate `out_dir` with classes and sources unpacked from `archives`.
    async fn extract(
        &self,
        archives: &[PathBuf],
        out_dir: &Path,
        filters: &Filters,
    ) -> Result<(), ToolError>;
}
