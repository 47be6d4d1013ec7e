//! Sharded on-disk addressing.
//!
//! An entry lives at `root/xx/yy/<digest>` where `xx` and `yy` are the first two
//! character pairs of the key digest. Writers and the kickstart reader both go
//! through [`ShardResolver`], so they always agree on the location.

use std::path::{Path, PathBuf};

use super::keys::CacheKey;

/// Physical location of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAddress {
    root: PathBuf,
    first: String,
    second: String,
    digest: String,
}

impl ShardAddress {
    pub fn new(root: &Path, key: &CacheKey) -> Self {
        let digest = key.digest();
        Self {
            root: root.to_path_buf(),
            first: digest[0..2].to_string(),
            second: digest[2..4].to_string(),
            digest,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segments(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Directory holding the entry.
    pub fn directory(&self) -> PathBuf {
        self.root.join(&self.first).join(&self.second)
    }

    /// Full path of the entry file.
    pub fn path(&self) -> PathBuf {
        self.directory().join(&self.digest)
    }
}

/// Picks the storage root and maps keys to addresses.
#[derive(Debug, Clone)]
pub struct ShardResolver {
    candidates: Vec<PathBuf>,
}

impl ShardResolver {
    /// `candidates` are probed in order, most specific first.
    pub fn new(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// First candidate that exists as a directory, or `None` when caching is unavailable.
    pub fn storage_root(&self) -> Option<PathBuf> {
        self.candidates
            .iter()
            .find(|path| path.is_dir())
            .map(|path| path.canonicalize().unwrap_or_else(|_| path.clone()))
    }

    pub fn resolve(&self, key: &CacheKey) -> Option<ShardAddress> {
        self.storage_root()
            .map(|root| ShardAddress::new(&root, key))
    }
}

/// Whether a directory name looks like a shard segment (two lowercase hex chars).
pub(crate) fn is_shard_segment(name: &str) -> bool {
    name.len() == 2
        && name
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
