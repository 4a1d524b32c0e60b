use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, instrument};

use super::keys;
use super::{CacheEntry, KeyValueStore};
use crate::error::StoreError;

const STAGING_PREFIX: &str = ".recall-";

/// One file per entry, named by its key. Files whose names are not valid keys are ignored.
#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    /// Opens the store rooted at `directory`, creating it if necessary.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        keys::decode(key).map_err(|err| StoreError::from_key_error(key, err))?;
        Ok(self.directory.join(key))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.directory).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if keys::is_valid(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

fn ignore_missing(result: std::io::Result<()>) -> Result<(), StoreError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let Ok(metadata) = keys::decode(key) else {
            debug!(key, "Ignoring lookup of malformed cache key");
            return Ok(None);
        };
        match fs::read(self.directory.join(key)).await {
            Ok(payload) => Ok(Some(CacheEntry {
                metadata,
                declared_type: None,
                payload,
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self, entry), fields(bytes = entry.payload.len()))]
    async fn save(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let directory = self.directory.clone();
        let payload = entry.payload;
        // Each write stages in its own file; an unpersisted one is removed on drop.
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut staging = tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile_in(&directory)?;
            staging.write_all(&payload)?;
            staging.persist(&path).map_err(|err| err.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        ignore_missing(fs::remove_file(self.path_for(key)?).await)
    }

    async fn rename(&self, old_key: &str, new_key: &str) -> Result<(), StoreError> {
        let from = self.path_for(old_key)?;
        let to = self.path_for(new_key)?;
        ignore_missing(fs::rename(from, to).await)
    }

    async fn values(&self) -> Result<BTreeMap<String, CacheEntry>, StoreError> {
        let mut values = BTreeMap::new();
        for key in self.keys().await? {
            // Entries deleted since listing come back as `None`.
            if let Some(entry) = self.get(&key).await? {
                values.insert(key, entry);
            }
        }
        Ok(values)
    }

    async fn find_partial_key(&self, partial: &str) -> Result<Option<String>, StoreError> {
        let names = self.keys().await?;
        Ok(keys::latest_matching(names.iter().map(String::as_str), partial))
    }
}
