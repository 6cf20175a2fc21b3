//! The fileset model: a named bundle of files, directories and metadata
//! rooted at an absolute path.
//!
//! A fileset is built by its owner (registering files, directories and
//! metadata), then handed to the client engine for migration. Files and
//! directories are two independent indices: deregistration only targets the
//! index a path was registered into, and the transfer-time expansion unions
//! both.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::fsutil;

/// Default maximum number of bytes per chunked write RPC (1 MiB).
pub const DEFAULT_XFER_SIZE: u64 = 1 << 20;

/// Sentinel provider id matching any provider on the receiver.
pub const PROVIDER_ID_ANY: u16 = u16::MAX;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fileset {
    class: String,
    root: String,
    provider_id: u16,
    metadata: BTreeMap<String, String>,
    files: BTreeSet<String>,
    directories: BTreeSet<String>,
    xfer_size: u64,
}

fn normalize_root(root: &str) -> Result<String> {
    if !root.starts_with('/') {
        return Err(Error::InvalidArg(format!(
            "fileset root must be absolute: {root:?}"
        )));
    }
    let mut root = root.to_string();
    if !root.ends_with('/') {
        root.push('/');
    }
    Ok(root)
}

fn normalize_relative(path: &str) -> Result<&str> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidArg(format!("empty relative path: {path:?}")));
    }
    Ok(trimmed)
}

impl Fileset {
    /// Creates an empty fileset of the given class, rooted at an absolute
    /// path. The root is canonicalized to end in `/`.
    pub fn new(class: &str, root: &str) -> Result<Fileset> {
        if class.is_empty() {
            return Err(Error::InvalidArg("fileset class must not be empty".into()));
        }
        Ok(Fileset {
            class: class.to_string(),
            root: normalize_root(root)?,
            provider_id: PROVIDER_ID_ANY,
            metadata: BTreeMap::new(),
            files: BTreeSet::new(),
            directories: BTreeSet::new(),
            xfer_size: DEFAULT_XFER_SIZE,
        })
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// The absolute root, always ending in `/`.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn set_root(&mut self, root: &str) -> Result<()> {
        self.root = normalize_root(root)?;
        Ok(())
    }

    pub fn provider_id(&self) -> u16 {
        self.provider_id
    }

    /// Scopes the class lookup on the receiver; [`PROVIDER_ID_ANY`] (the
    /// default) matches a class registered under any provider id.
    pub fn set_provider_id(&mut self, provider_id: u16) {
        self.provider_id = provider_id;
    }

    pub fn xfer_size(&self) -> u64 {
        self.xfer_size
    }

    pub fn set_xfer_size(&mut self, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArg("transfer size must be positive".into()));
        }
        self.xfer_size = size;
        Ok(())
    }

    /// Registers a file path relative to the root. Leading slashes are
    /// stripped; the file need not exist until migration time.
    pub fn register_file(&mut self, filename: &str) -> Result<()> {
        let filename = normalize_relative(filename)?;
        self.files.insert(filename.to_string());
        Ok(())
    }

    pub fn deregister_file(&mut self, filename: &str) -> Result<()> {
        let filename = normalize_relative(filename)?;
        if !self.files.remove(filename) {
            return Err(Error::UnknownFile(filename.to_string()));
        }
        Ok(())
    }

    pub fn register_directory(&mut self, dirname: &str) -> Result<()> {
        let dirname = normalize_relative(dirname)?;
        self.directories
            .insert(dirname.trim_end_matches('/').to_string());
        Ok(())
    }

    pub fn deregister_directory(&mut self, dirname: &str) -> Result<()> {
        let dirname = normalize_relative(dirname)?;
        if !self.directories.remove(dirname.trim_end_matches('/')) {
            return Err(Error::UnknownFile(dirname.to_string()));
        }
        Ok(())
    }

    /// Registered files in lexicographic order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    /// Registered directories in lexicographic order.
    pub fn directories(&self) -> impl Iterator<Item = &str> {
        self.directories.iter().map(String::as_str)
    }

    /// Registers a metadata pair; an existing value under the same key is
    /// overwritten.
    pub fn register_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArg("metadata key must not be empty".into()));
        }
        self.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn deregister_metadata(&mut self, key: &str) -> Result<()> {
        if self.metadata.remove(key).is_none() {
            return Err(Error::UnknownMeta(key.to_string()));
        }
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn metadata(&self) -> impl Iterator<Item = (&str, &str)> {
        self.metadata
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Absolute path of a root-relative entry.
    pub fn full_path(&self, relative: &str) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("{}{relative}", self.root))
    }

    /// Expands the fileset into the concrete file list used for a transfer:
    /// the union of explicitly registered files with a recursive scan of
    /// every registered directory. Scan results are root-relative and
    /// sorted; registered files missing on disk are kept verbatim.
    pub fn walkthrough(&self) -> Result<BTreeSet<String>> {
        let mut files = self.files.clone();
        let root = std::path::Path::new(&self.root);
        for dir in &self.directories {
            fsutil::list_files(root, dir, &mut files)?;
        }
        Ok(files)
    }

    /// Sums the on-disk sizes of the expanded file list, plus
    /// `len(key) + len(value) + 2` per metadata pair when requested.
    pub fn compute_size(&self, include_metadata: bool) -> Result<u64> {
        let mut total = 0u64;
        for file in self.walkthrough()? {
            let path = self.full_path(&file);
            let metadata = std::fs::metadata(&path)
                .map_err(|err| Error::Io(format!("cannot stat {path:?}: {err}")))?;
            total += metadata.len();
        }
        if include_metadata {
            for (key, value) in &self.metadata {
                total += (key.len() + value.len() + 2) as u64;
            }
        }
        Ok(total)
    }

    /// Builds the transfer-time copy of this fileset: rebased onto the
    /// remote root, directories resolved into the expanded file list. The
    /// class, provider id, metadata and transfer size carry over.
    pub fn resolved(&self, remote_root: &str, files: BTreeSet<String>) -> Result<Fileset> {
        Ok(Fileset {
            class: self.class.clone(),
            root: normalize_root(remote_root)?,
            provider_id: self.provider_id,
            metadata: self.metadata.clone(),
            files,
            directories: BTreeSet::new(),
            xfer_size: self.xfer_size,
        })
    }
}
