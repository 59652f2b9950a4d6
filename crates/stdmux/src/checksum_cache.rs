//! Persisted map from file identifier to previously computed content hash.
//!
//! Stored as JSON: `{"Hashes": {"<identifier>": "<hash>", ...}}`.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("checksum cache i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("checksum cache is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumCache {
    #[serde(rename = "Hashes", default)]
    hashes: BTreeMap<String, String>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &str) -> Option<&str> {
        self.hashes.get(identifier).map(String::as_str)
    }

    /// Returns the previous hash, if any.
    pub fn set(&mut self, identifier: impl Into<String>, hash: impl Into<String>) -> Option<String> {
        self.hashes.insert(identifier.into(), hash.into())
    }

    pub fn remove(&mut self, identifier: &str) -> Option<String> {
        self.hashes.remove(identifier)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Cached hash for `identifier`, computing and recording it on a miss.
    pub fn get_or_compute<F, E>(&mut self, identifier: &str, compute: F) -> Result<&str, E>
    where
        F: FnOnce() -> Result<String, E>,
    {
        if !self.hashes.contains_key(identifier) {
            let hash = compute()?;
            tracing::trace!(identifier, "Checksum cache miss");
            self.hashes.insert(identifier.to_string(), hash);
        }
        Ok(self
            .hashes
            .get(identifier)
            .map(String::as_str)
            .unwrap_or_default())
    }

    /// Load a cache file. A missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let cache: Self = serde_json::from_slice(&data)?;
        tracing::debug!(path = %path.display(), entries = cache.len(), "Loaded checksum cache");
        Ok(cache)
    }

    /// Write the cache, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec(self)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), entries = self.len(), "Saved checksum cache");
        Ok(())
    }
}
