//! Filesystem helpers: directory creation, recursive scanning and removal.

use async_recursion::async_recursion;
use std::collections::BTreeSet;
use std::os::unix::fs::DirBuilderExt;

use crate::error::{Error, Result};

/// Creates `path` and any missing parents with mode 0700.
pub fn mkdirs(path: &std::path::Path) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|err| Error::Io(format!("cannot create directory {path:?}: {err}")))
}

/// Recursively collects regular files under `root/dir` into `out` as paths
/// relative to `root`. Entries whose name starts with a dot are skipped.
/// Scan failures (unreadable or disappearing directories) fail fast.
pub fn list_files(root: &std::path::Path, dir: &str, out: &mut BTreeSet<String>) -> Result<()> {
    let full = root.join(dir);
    let entries = std::fs::read_dir(&full)
        .map_err(|err| Error::Io(format!("cannot scan directory {full:?}: {err}")))?;
    for entry in entries {
        let entry = entry.map_err(|err| Error::Io(format!("failed scanning {full:?}: {err}")))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(Error::InvalidArg(format!(
                "non-unicode file name under {full:?}"
            )));
        };
        if name.starts_with('.') {
            continue;
        }
        let relative = if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        };
        let file_type = entry
            .file_type()
            .map_err(|err| Error::Io(format!("failed scanning {full:?}: {err}")))?;
        if file_type.is_dir() {
            list_files(root, &relative, out)?;
        } else if file_type.is_file() {
            out.insert(relative);
        }
    }
    Ok(())
}

/// Recursively removes `path` and everything below it.
#[async_recursion]
pub async fn remove_rec(path: &std::path::Path) -> Result<()> {
    tracing::debug!("remove: {:?}", path);
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|err| Error::Io(format!("failed reading metadata from {path:?}: {err}")))?;
    if !metadata.is_dir() {
        return tokio::fs::remove_file(path)
            .await
            .map_err(|err| Error::Io(format!("failed removing {path:?}: {err}")));
    }
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|err| Error::Io(format!("cannot open directory {path:?} for reading: {err}")))?;
    let mut join_set = tokio::task::JoinSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| Error::Io(format!("failed traversing directory {path:?}: {err}")))?
    {
        let entry_path = entry.path();
        join_set.spawn(async move { remove_rec(&entry_path).await });
    }
    let mut errors = vec![];
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(error)) => errors.push(error),
            Err(join_error) => errors.push(Error::Io(join_error.to_string())),
        }
    }
    if let Some(error) = errors.into_iter().next() {
        return Err(error);
    }
    tokio::fs::remove_dir(path)
        .await
        .map_err(|err| Error::Io(format!("failed removing directory {path:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_files_skips_dot_entries() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path();
        std::fs::create_dir_all(root.join("data/sub"))?;
        std::fs::write(root.join("data/a.txt"), "a")?;
        std::fs::write(root.join("data/.hidden"), "h")?;
        std::fs::write(root.join("data/sub/b.txt"), "b")?;
        std::fs::create_dir(root.join("data/.git"))?;
        std::fs::write(root.join("data/.git/c.txt"), "c")?;
        let mut out = BTreeSet::new();
        list_files(root, "data", &mut out)?;
        let found: Vec<_> = out.iter().cloned().collect();
        assert_eq!(found, vec!["data/a.txt", "data/sub/b.txt"]);
        Ok(())
    }

    #[test]
    fn list_files_fails_on_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut out = BTreeSet::new();
        let result = list_files(tmp.path(), "nope", &mut out);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn mkdirs_creates_private_directories() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir()?;
        let deep = tmp.path().join("a/b/c");
        mkdirs(&deep)?;
        let mode = std::fs::metadata(&deep)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        Ok(())
    }

    #[tokio::test]
    async fn remove_rec_removes_trees() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("tree");
        std::fs::create_dir_all(root.join("x/y"))?;
        std::fs::write(root.join("x/a"), "a")?;
        std::fs::write(root.join("x/y/b"), "b")?;
        remove_rec(&root).await?;
        assert!(!root.exists());
        Ok(())
    }
}
