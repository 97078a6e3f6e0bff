//! File-backed envelope store

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{ApiCacheError, Result};

use super::{Envelope, FILE_EXTENSION, SCHEMA_VERSION};

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Entry exists and was written by the running version
    Hit {
        /// Stored envelope
        envelope: Envelope,
        /// File it was read from
        path: PathBuf,
    },
    /// Entry exists but its schema version differs; never served
    Stale {
        /// Version found in the file, if any
        found: Option<String>,
        /// File that was inspected
        path: PathBuf,
    },
    /// No entry for the key
    Miss,
}

impl Lookup {
    /// Servable envelope, if any
    #[must_use]
    pub fn into_hit(self) -> Option<(Envelope, PathBuf)> {
        match self {
            Self::Hit { envelope, path } => Some((envelope, path)),
            Self::Stale { .. } | Self::Miss => None,
        }
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: Option<String>,
}

/// One file per cache key under a root directory
///
/// Writers never lock: two requests sharing a key both write, and the last
/// rename wins. Each file is always a complete envelope.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    schema_version: String,
    tmp_counter: AtomicU64,
}

impl CacheStore {
    /// Create a store rooted at `root`; directories are created on first write
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            schema_version: SCHEMA_VERSION.to_string(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for a cache key
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{FILE_EXTENSION}"))
    }

    /// Write an envelope, replacing any previous entry for the key
    ///
    /// # Errors
    ///
    /// Returns [`ApiCacheError::Persist`] if the file cannot be written
    pub async fn put(&self, key: &str, envelope: &Envelope) -> Result<PathBuf> {
        let path = self.path_for(key);
        let data = serde_json::to_vec_pretty(envelope)
            .map_err(|e| ApiCacheError::Other(format!("Failed to serialize envelope: {e}")))?;

        let persist = |source| ApiCacheError::Persist {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(persist)?;
        }

        let tmp = self.tmp_path(&path);
        tokio::fs::write(&tmp, &data).await.map_err(persist)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(persist(e));
        }

        debug!("Stored cache entry {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }

    /// Read the entry for a key
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read, or carries the
    /// current version yet does not parse
    pub async fn get(&self, key: &str) -> Result<Lookup> {
        let path = self.path_for(key);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Lookup::Miss),
            Err(e) => return Err(e.into()),
        };

        let found = serde_json::from_slice::<VersionProbe>(&data)
            .ok()
            .and_then(|probe| probe.schema_version);
        if found.as_deref() != Some(self.schema_version.as_str()) {
            warn!(
                "Ignoring stale cache entry {} (version {:?}, expected {})",
                path.display(),
                found,
                self.schema_version
            );
            return Ok(Lookup::Stale { found, path });
        }

        let envelope: Envelope = serde_json::from_slice(&data).map_err(|e| {
            ApiCacheError::InvalidFormat(format!("{}: {e}", path.display()))
        })?;

        Ok(Lookup::Hit { envelope, path })
    }

    fn tmp_path(&self, path: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}-{n}.tmp", std::process::id()));
        path.with_file_name(name)
    }
}
