//! Artifact store adapter: whole-directory transfer between a unit's local
//! folder and its remote URI.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::metadata::{UnitDetails, METADATA_FILE};

/// `scheme://bucket/path` location of a unit's artifact directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageUri {
    pub scheme: String,
    pub bucket: String,
    /// '/'-separated key inside the bucket, without leading or trailing '/'.
    pub path: String,
}

impl StorageUri {
    pub fn new(
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            path: path.into().trim_matches('/').to_string(),
        }
    }

    /// Relative filesystem path `<bucket>/<path>`.
    pub fn relative_path(&self) -> PathBuf {
        let mut p = PathBuf::from(&self.bucket);
        for segment in self.path.split('/').filter(|s| !s.is_empty()) {
            p.push(segment);
        }
        p
    }
}

impl FromStr for StorageUri {
    type Err = StorageError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| StorageError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing '://'"))?;
        let scheme_ok = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !scheme_ok {
            return Err(invalid("bad scheme"));
        }

        let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }
        if rest
            .split('/')
            .any(|segment| segment == ".." || segment == ".")
        {
            return Err(invalid("relative path segments are not allowed"));
        }

        Ok(Self::new(scheme.to_ascii_lowercase(), bucket, path))
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}://{}", self.scheme, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.bucket, self.path)
        }
    }
}

impl Serialize for StorageUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StorageUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Configuration for the filesystem-backed object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory standing in for the object storage service.
    pub root: PathBuf,
    /// URI schemes accepted by the store.
    pub allowed_schemes: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".model-compose/store"),
            allowed_schemes: vec!["s3".into(), "gs".into(), "minio".into(), "file".into()],
        }
    }
}

impl StorageConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

/// Remote side of an artifact transfer.
///
/// A failed transfer leaves the destination unchanged and a successful one
/// replaces it whole; readers never see a partially copied tree. Readers
/// racing a replacement may still find the destination absent for a
/// moment, so a `NotFound` during a concurrent upload is not final.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Copy the tree at `local` to `uri`. Returns the number of bytes copied.
    async fn upload_dir(&self, local: &Path, uri: &StorageUri) -> Result<u64, StorageError>;

    /// Copy the tree at `uri` to `local`. Returns the number of bytes copied.
    async fn download_dir(&self, uri: &StorageUri, local: &Path) -> Result<u64, StorageError>;
}

/// Object store backed by a local directory, one sub-tree per bucket.
pub struct FsObjectStore {
    config: StorageConfig,
}

impl FsObjectStore {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn object_path(&self, uri: &StorageUri) -> PathBuf {
        self.config.root.join(uri.relative_path())
    }

    async fn transfer(src: PathBuf, dst: PathBuf) -> Result<u64, StorageError> {
        tokio::task::spawn_blocking(move || replace_tree(&src, &dst))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload_dir(&self, local: &Path, uri: &StorageUri) -> Result<u64, StorageError> {
        Self::transfer(local.to_path_buf(), self.object_path(uri)).await
    }

    async fn download_dir(&self, uri: &StorageUri, local: &Path) -> Result<u64, StorageError> {
        Self::transfer(self.object_path(uri), local.to_path_buf()).await
    }
}

/// Copy `src` into a staging sibling of `dst`, then swap it into place.
///
/// Readers of `dst` never see a partial tree, but `dst` is absent between
/// the two renames. Portable `rename` cannot exchange two directories in
/// one step.
fn replace_tree(src: &Path, dst: &Path) -> Result<u64, StorageError> {
    if !src.is_dir() {
        return Err(StorageError::NotFound(src.to_path_buf()));
    }
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StorageError::Io { path, source }
    };

    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;

    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifacts".into());
    let suffix: u64 = rand::thread_rng().gen();
    let staging = parent.join(format!(".{file_name}.staging-{suffix:016x}"));
    let retired = parent.join(format!(".{file_name}.old-{suffix:016x}"));

    let copied = match copy_tree(src, &staging) {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    let had_previous = dst.exists();
    if had_previous {
        fs::rename(dst, &retired).map_err(io_err(dst))?;
    }
    if let Err(source) = fs::rename(&staging, dst) {
        if had_previous {
            let _ = fs::rename(&retired, dst);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(StorageError::Io {
            path: dst.to_path_buf(),
            source,
        });
    }
    if had_previous {
        fs::remove_dir_all(&retired).map_err(io_err(&retired))?;
    }
    Ok(copied)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<u64, StorageError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StorageError::Io { path, source }
    };
    fs::create_dir_all(dst).map_err(io_err(dst))?;
    let mut total = 0;
    for entry in fs::read_dir(src).map_err(io_err(src))? {
        let entry = entry.map_err(io_err(src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(io_err(&from))?;
        if file_type.is_dir() {
            total += copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            total += fs::copy(&from, &to).map_err(io_err(&from))?;
        }
    }
    Ok(total)
}

/// Uploads and downloads unit artifact folders.
#[derive(Clone)]
pub struct ArtifactStore {
    backend: Arc<dyn ObjectStore>,
    allowed_schemes: Vec<String>,
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("allowed_schemes", &self.allowed_schemes)
            .finish_non_exhaustive()
    }
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn ObjectStore>, allowed_schemes: Vec<String>) -> Self {
        Self {
            backend,
            allowed_schemes,
        }
    }

    /// Store backed by [`FsObjectStore`].
    pub fn filesystem(config: StorageConfig) -> Self {
        let schemes = config.allowed_schemes.clone();
        Self::new(Arc::new(FsObjectStore::new(config)), schemes)
    }

    fn check_scheme(&self, uri: &StorageUri) -> Result<(), StorageError> {
        if self.allowed_schemes.iter().any(|s| s == &uri.scheme) {
            Ok(())
        } else {
            Err(StorageError::UnsupportedScheme(uri.scheme.clone()))
        }
    }

    pub async fn upload(&self, local: &Path, uri: &StorageUri) -> Result<u64, StorageError> {
        self.check_scheme(uri)?;
        let bytes = self.backend.upload_dir(local, uri).await?;
        info!(local = %local.display(), uri = %uri, bytes, "storage: uploaded");
        Ok(bytes)
    }

    pub async fn download(&self, uri: &StorageUri, local: &Path) -> Result<u64, StorageError> {
        self.check_scheme(uri)?;
        let bytes = self.backend.download_dir(uri, local).await?;
        info!(uri = %uri, local = %local.display(), bytes, "storage: downloaded");
        Ok(bytes)
    }

    /// Upload a saved unit folder to the unit's URI.
    pub async fn upload_unit(&self, details: &UnitDetails) -> Result<u64, StorageError> {
        if !details.local_folder.is_dir() {
            return Err(StorageError::NotFound(details.local_folder.clone()));
        }
        if !details.local_folder.join(METADATA_FILE).is_file() {
            return Err(StorageError::NotSaved(details.name.clone()));
        }
        debug!(unit = %details.name, "storage: uploading unit");
        self.upload(&details.local_folder, &details.uri).await
    }
}
