#![allow(dead_code)]

//! Helpers shared by unit and integration tests.

use async_recursion::async_recursion;
use std::os::unix::fs::PermissionsExt;

/// Creates every `(relative path, content)` pair under `root`, including
/// intermediate directories.
pub fn populate(root: &std::path::Path, files: &[(&str, &str)]) {
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
    }
}

pub fn file_mode(path: &std::path::Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

pub fn set_file_mode(path: &std::path::Path, mode: u32) {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

/// Asserts that every regular file under `src` exists under `dst` with
/// identical bytes and permission bits.
#[async_recursion]
pub async fn check_trees_identical(src: &std::path::Path, dst: &std::path::Path) {
    let mut entries = tokio::fs::read_dir(src).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let src_path = entry.path();
        let dst_path = dst.join(src_path.file_name().unwrap());
        let src_md = tokio::fs::symlink_metadata(&src_path).await.unwrap();
        if src_md.is_dir() {
            check_trees_identical(&src_path, &dst_path).await;
            continue;
        }
        let dst_md = tokio::fs::symlink_metadata(&dst_path)
            .await
            .unwrap_or_else(|_| panic!("destination file {dst_path:?} is missing"));
        assert!(dst_md.is_file());
        let src_contents = tokio::fs::read(&src_path).await.unwrap();
        let dst_contents = tokio::fs::read(&dst_path).await.unwrap();
        assert_eq!(src_contents, dst_contents, "content differs: {src_path:?}");
        assert_eq!(
            src_md.permissions().mode() & 0o7777,
            dst_md.permissions().mode() & 0o7777,
            "mode differs: {src_path:?}"
        );
    }
}
