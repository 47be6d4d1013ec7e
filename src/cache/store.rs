//! Whole-page cache storage.
//!
//! Entries are files laid out by [`ShardResolver`] and encoded by [`CacheEntry`].
//! Writes go through a temp file in the target directory and are renamed into
//! place, so a concurrent reader sees either the old or the new entry.

use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::config::CacheConfig;
use super::entry::{CacheEntry, CachedPage};
use super::error::CacheError;
use super::keys::{CacheKey, KeyDeriver};
use super::shard::{ShardAddress, ShardResolver, is_shard_segment};

const TEMP_PREFIX: &str = ".tmp-";

pub struct PageCacheStore {
    resolver: ShardResolver,
    deriver: KeyDeriver,
    lifetime: Option<Duration>,
}

impl PageCacheStore {
    /// Create a store with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self::from_parts(
            ShardResolver::new(config.storage_roots.clone()),
            KeyDeriver::new(config.salts.iter().cloned()),
            config.page_lifetime(),
        )
    }

    pub fn from_parts(
        resolver: ShardResolver,
        deriver: KeyDeriver,
        lifetime: Option<Duration>,
    ) -> Self {
        Self {
            resolver,
            deriver,
            lifetime,
        }
    }

    pub fn resolver(&self) -> &ShardResolver {
        &self.resolver
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// Advisory lifetime written into each entry header.
    pub fn get_lifetime(&self) -> Option<Duration> {
        self.lifetime
    }

    // ========================================================================
    // Current-request operations
    // ========================================================================

    /// Cached page for the current request.
    pub fn get_cache(&self) -> Result<Option<CachedPage>, CacheError> {
        let key = self.deriver.compute_hash(None)?;
        self.get(&key)
    }

    /// Store `content` as the current request's page.
    pub fn put(&self, content: impl Into<Bytes>) -> Result<(), CacheError> {
        self.put_page(CachedPage::from_content(content))
    }

    pub fn put_page(&self, page: CachedPage) -> Result<(), CacheError> {
        let key = self.deriver.compute_hash(None)?;
        self.store(&key, page).map(|_| ())
    }

    /// Remove the current request's page.
    pub fn forget(&self) -> Result<bool, CacheError> {
        let key = self.deriver.compute_hash(None)?;
        self.remove(&key)
    }

    // ========================================================================
    // Keyed operations
    // ========================================================================

    pub fn locate(&self, key: &CacheKey) -> Option<ShardAddress> {
        self.resolver.resolve(key)
    }

    /// Read the entry for `key`. Missing, expired and storage-less lookups are `Ok(None)`.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CachedPage>, CacheError> {
        let Some(address) = self.resolver.resolve(key) else {
            debug!(cache = "page", outcome = "disabled", "no storage root available");
            return Ok(None);
        };

        let path = address.path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CacheError::Io(err)),
        };

        let entry = CacheEntry::decode(&path, &bytes)?;
        if entry.is_expired_at(OffsetDateTime::now_utc()) {
            debug!(cache = "page", outcome = "expired", path = %path.display(), "dropping expired entry");
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        Ok(Some(entry.into_page()))
    }

    /// Write `page` under `key`, returning the entry path.
    pub fn store(&self, key: &CacheKey, page: CachedPage) -> Result<PathBuf, CacheError> {
        let address = self
            .resolver
            .resolve(key)
            .ok_or(CacheError::StorageUnavailable)?;

        let entry = CacheEntry::new(page, self.lifetime, OffsetDateTime::now_utc());
        let bytes = entry.encode()?;

        let directory = address.directory();
        let path = address.path();
        fs::create_dir_all(&directory).map_err(|err| CacheError::write_failure(&directory, err))?;

        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&directory)
            .map_err(|err| CacheError::write_failure(&directory, err))?;
        file.write_all(&bytes)
            .map_err(|err| CacheError::write_failure(file.path(), err))?;
        file.persist(&path)
            .map_err(|err| CacheError::write_failure(&path, err.error))?;

        debug!(cache = "page", outcome = "stored", path = %path.display(), bytes = bytes.len(), "page stored");
        Ok(path)
    }

    pub fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let Some(address) = self.resolver.resolve(key) else {
            return Ok(false);
        };
        match fs::remove_file(address.path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CacheError::Io(err)),
        }
    }

    /// Delete every page entry under the storage root.
    ///
    /// Only shard directories are touched; anything else living in the root is left alone.
    pub fn flush(&self) -> Result<usize, CacheError> {
        let Some(root) = self.resolver.storage_root() else {
            return Ok(0);
        };

        let mut removed = 0;
        for shard in fs::read_dir(&root)? {
            let shard = shard?;
            let is_segment = shard.file_name().to_str().is_some_and(is_shard_segment);
            if !is_segment || !shard.file_type()?.is_dir() {
                continue;
            }
            removed += count_entries(&shard.path())?;
            fs::remove_dir_all(shard.path())?;
        }

        info!(cache = "page", root = %root.display(), removed, "page cache flushed");
        Ok(removed)
    }
}

fn count_entries(first_level: &Path) -> Result<usize, CacheError> {
    let mut count = 0;
    for second in fs::read_dir(first_level)? {
        let second = second?;
        if !second.file_type()?.is_dir() {
            continue;
        }
        for entry in fs::read_dir(second.path())? {
            let entry = entry?;
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if entry.file_type()?.is_file() && !is_temp {
                count += 1;
            }
        }
    }
    Ok(count)
}
