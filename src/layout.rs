//! On-disk layout under the agent's work directory.
//!
//! ```text
//! <root>/<plan>/                   run workspace
//! <root>/<plan>/<service>/         per-instance and merged execution data
//! <root>/<plan>/_report_/          project artifact, reports, archives
//! <root>/service/<service>/        archives copied out of an instance
//! <root>/class/_project_/          extracted classes/sources of all services
//! ```
//!
//! Service directories inside a run never start with a single `_`: a
//! leading `_` is doubled, leaving that namespace to the run's own entries.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Extension of every execution-data artifact.
pub const EXEC_EXT: &str = "exec";

const PROJECT_DIR: &str = "_project_";
const REPORT_DIR: &str = "_report_";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, plan_id: u64) -> PathBuf {
        self.root.join(plan_id.to_string())
    }

    pub fn service_dump_dir(&self, plan_id: u64, service: &str) -> PathBuf {
        let name = sanitize(service);
        let name = if name.starts_with('_') {
            format!("_{name}")
        } else {
            name
        };
        self.run_dir(plan_id).join(name)
    }

    pub fn report_dir(&self, plan_id: u64) -> PathBuf {
        self.run_dir(plan_id).join(REPORT_DIR)
    }

    pub fn service_cache_dir(&self, service: &str) -> PathBuf {
        self.root.join("service").join(sanitize(service))
    }

    pub fn project_class_dir(&self) -> PathBuf {
        self.root.join("class").join(PROJECT_DIR)
    }

    /// Class files produced by the extraction tool.
    pub fn project_classfiles(&self) -> PathBuf {
        self.project_class_dir().join("sub").join("libjarcls")
    }

    /// Source files produced by the extraction tool.
    pub fn project_sourcefiles(&self) -> PathBuf {
        self.project_class_dir().join("sub").join("libjarsrc")
    }

    /// A fresh, not yet existing artifact path for a merged service artifact.
    pub fn new_service_artifact(&self, plan_id: u64, service: &str) -> PathBuf {
        self.service_dump_dir(plan_id, service).join(format!(
            "svc_{}_{}.{EXEC_EXT}",
            sanitize(service),
            Uuid::new_v4().simple()
        ))
    }

    /// A fresh artifact path for one instance's dump.
    pub fn new_instance_artifact(&self, plan_id: u64, service: &str, instance: &str) -> PathBuf {
        self.service_dump_dir(plan_id, service).join(format!(
            "pod_{}_{}.{EXEC_EXT}",
            sanitize(instance),
            Uuid::new_v4().simple()
        ))
    }
}

/// Keep names usable as a single path component.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}_"),
        _ => cleaned,
    }
}

/// Whether `path` is an execution-data artifact.
pub fn is_exec_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == EXEC_EXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_layout() {
        let l = Layout::new("/jacoco/work");
        assert_eq!(l.run_dir(42), PathBuf::from("/jacoco/work/42"));
        assert_eq!(
            l.service_dump_dir(42, "orders"),
            PathBuf::from("/jacoco/work/42/orders")
        );
        assert_eq!(
            l.service_cache_dir("orders"),
            PathBuf::from("/jacoco/work/service/orders")
        );
        assert_eq!(
            l.project_classfiles(),
            PathBuf::from("/jacoco/work/class/_project_/sub/libjarcls")
        );
    }

    #[test]
    fn test_artifacts_are_unique_exec_files() {
        let l = Layout::new("/w");
        let a = l.new_service_artifact(1, "svc");
        let b = l.new_service_artifact(1, "svc");
        assert_ne!(a, b);
        assert!(is_exec_file(&a));
        assert!(a.starts_with("/w/1/svc"));
        assert!(is_exec_file(&l.new_instance_artifact(1, "svc", "pod-0")));
    }

    #[test]
    fn test_names_cannot_escape_root() {
        let l = Layout::new("/w");
        assert_eq!(l.service_dump_dir(1, "../etc"), PathBuf::from("/w/1/.._etc"));
        assert_eq!(l.service_cache_dir(".."), PathBuf::from("/w/service/_.._"));
    }

    #[test]
    fn test_service_named_like_report_dir_gets_its_own_dir() {
        let l = Layout::new("/w");
        let report = l.report_dir(1);
        let dump = l.service_dump_dir(1, "_report_");
        assert_ne!(dump, report);
        assert_eq!(dump, PathBuf::from("/w/1/__report_"));
        assert!(!l.new_service_artifact(1, "_report_").starts_with(&report));

        assert_ne!(l.service_dump_dir(1, "_a"), l.service_dump_dir(1, "a"));
        assert_eq!(l.service_dump_dir(1, "..").parent(), Some(l.run_dir(1).as_path()));
    }
}
