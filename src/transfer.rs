//! Copying a directory out of a running instance.
//!
//! The instance streams `tar cf - <dir>` through its remote execution
//! capability; the archive is validated and unpacked under a local root.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info};

use crate::topology::InstanceSpec;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("remote exec failed: {0}")]
    Exec(String),

    #[error("tar contents corrupted: entry '{entry}' is outside '{prefix}'")]
    Corrupted { entry: String, prefix: String },

    #[error("instance returned an empty archive for {0}")]
    Empty(String),

    #[error("io error while unpacking: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte stream produced by a command running inside an instance.
pub type ExecStdout = Box<dyn AsyncRead + Send + Unpin>;

/// Ability to run a command inside an instance and read its stdout.
#[async_trait]
pub trait InstanceExec: Send + Sync {
    async fn exec(&self, instance: &InstanceSpec, command: &[String]) -> Result<ExecStdout, CopyError>;
}

/// Copy `src_dir` from `instance` into `dest`, returning the number of
/// entries unpacked.
pub async fn copy_from_instance(
    exec: &dyn InstanceExec,
    instance: &InstanceSpec,
    src_dir: &str,
    dest: &Path,
) -> Result<usize, CopyError> {
    let command = vec![
        "tar".to_string(),
        "cf".to_string(),
        "-".to_string(),
        src_dir.to_string(),
    ];
    info!(instance = %instance.name, src_dir, dest = %dest.display(), "copying from instance");
    let stdout = exec.exec(instance, &command).await?;

    let prefix = strip_path_shortcuts(src_dir.trim_start_matches('/'));
    let dest = dest.to_path_buf();
    let src = src_dir.to_string();
    let unpacked = tokio::task::spawn_blocking(move || {
        let mut reader = SyncIoBridge::new(stdout);
        let unpacked = unpack_tar(&mut reader, &dest, &prefix)?;
        // Read to the end so a failed remote command surfaces as an error.
        std::io::copy(&mut reader, &mut std::io::sink())?;
        Ok::<_, CopyError>(unpacked)
    })
    .await
    .map_err(|e| CopyError::Exec(format!("unpack task failed: {e}")))??;

    if unpacked == 0 {
        return Err(CopyError::Empty(src));
    }
    debug!(instance = %instance.name, entries = unpacked, "copy finished");
    Ok(unpacked)
}

/// Normalise a path and drop leading `../` segments and any root.
pub fn strip_path_shortcuts(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in p.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Unpack a tar stream whose entries must all live under `prefix`.
///
/// Entries are written below `dest` with `prefix` removed. Parent-directory
/// segments are dropped so nothing lands outside `dest`.
pub fn unpack_tar<R: Read>(reader: R, dest: &Path, prefix: &str) -> Result<usize, CopyError> {
    let mut archive = tar::Archive::new(reader);
    let mut count = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = raw.trim_start_matches("./").trim_start_matches('/');
        if !name.starts_with(prefix) {
            return Err(CopyError::Corrupted {
                entry: raw.clone(),
                prefix: prefix.to_string(),
            });
        }

        let relative = safe_relative(&name[prefix.len()..]);
        let target = dest.join(&relative);
        let kind = entry.header().entry_type();

        if kind.is_dir() {
            std::fs::create_dir_all(&target)?;
            count += 1;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if kind.is_symlink() {
            let link = entry
                .link_name()?
                .map(|l| l.into_owned())
                .unwrap_or_default();
            if target.symlink_metadata().is_ok() {
                std::fs::remove_file(&target)?;
            }
            symlink(&link, &target)?;
        } else if kind.is_file() {
            let mut out = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
        } else {
            debug!(entry = %raw, "skipping unsupported tar entry");
            continue;
        }
        count += 1;
    }
    Ok(count)
}

fn safe_relative(p: &str) -> PathBuf {
    Path::new(p)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s),
            _ => None,
        })
        .collect()
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn symlink(_link: &Path, target: &Path) -> std::io::Result<()> {
    debug!(target = %target.display(), "symlinks unsupported, skipping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_strip_path_shortcuts() {
        assert_eq!(strip_path_shortcuts("app"), "app");
        assert_eq!(strip_path_shortcuts("../../app/lib"), "app/lib");
        assert_eq!(strip_path_shortcuts("./app/./lib/"), "app/lib");
        assert_eq!(strip_path_shortcuts(".."), "");
    }

    #[test]
    fn test_unpack_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let tar = archive(&[
            ("app/service.jar", b"jar"),
            ("app/lib/dep.jar", b"dep"),
        ]);

        let n = unpack_tar(&tar[..], dir.path(), "app").unwrap();

        assert_eq!(n, 2);
        assert_eq!(std::fs::read(dir.path().join("service.jar")).unwrap(), b"jar");
        assert_eq!(std::fs::read(dir.path().join("lib/dep.jar")).unwrap(), b"dep");
    }

    #[test]
    fn test_unpack_rejects_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let tar = archive(&[("app/ok.jar", b"1"), ("etc/passwd", b"x")]);

        let err = unpack_tar(&tar[..], dir.path(), "app").unwrap_err();

        assert!(matches!(err, CopyError::Corrupted { .. }));
        assert!(!dir.path().join("passwd").exists());
    }

    #[test]
    fn test_unpack_drops_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let data = b"evil";
        // `append_data` refuses `..`, so write the name into the header directly.
        header.as_gnu_mut().unwrap().name[..16].copy_from_slice(b"app/../../x.jar\0");
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        let tar = builder.into_inner().unwrap();

        unpack_tar(&tar[..], &dest, "app").unwrap();

        assert!(dest.join("x.jar").exists());
        assert!(!dir.path().join("x.jar").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "app/current.jar", "service.jar")
            .unwrap();
        let tar = builder.into_inner().unwrap();

        unpack_tar(&tar[..], dir.path(), "app").unwrap();

        let link = std::fs::read_link(dir.path().join("current.jar")).unwrap();
        assert_eq!(link, PathBuf::from("service.jar"));
    }

    /// Serves `data`, then fails instead of reporting end of stream.
    struct FailsAtEnd(std::io::Cursor<Vec<u8>>);

    impl AsyncRead for FailsAtEnd {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let before = buf.filled().len();
            let polled = std::pin::Pin::new(&mut self.0).poll_read(cx, buf);
            if polled.is_ready() && buf.filled().len() == before && buf.remaining() > 0 {
                return std::task::Poll::Ready(Err(std::io::Error::other("exit status: 2")));
            }
            polled
        }
    }

    struct Streams(Vec<u8>);

    #[async_trait]
    impl InstanceExec for Streams {
        async fn exec(&self, _: &InstanceSpec, _: &[String]) -> Result<ExecStdout, CopyError> {
            Ok(Box::new(FailsAtEnd(std::io::Cursor::new(self.0.clone()))))
        }
    }

    #[tokio::test]
    async fn test_copy_fails_when_remote_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Streams(archive(&[("app/service.jar", b"jar")]));
        let instance = InstanceSpec {
            address: "10.0.0.1".to_string(),
            name: "orders-0".to_string(),
            container: "orders".to_string(),
        };

        let err = copy_from_instance(&exec, &instance, "/app", dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, CopyError::Io(_)), "{err}");
    }
}
