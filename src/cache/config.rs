//! Cache configuration.
//!
//! Read from the `[cache]` table of `pagecache.toml` (or `PAGECACHE__CACHE__*`
//! environment variables). Values are read-only once the process is running.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_STORAGE_ROOTS: [&str; 3] = ["storage/framework/cache", "storage/cache", "cache"];
const DEFAULT_PAGE_LIFETIME_SECS: u64 = 18_000;
const DEFAULT_SECTION_LIFETIME_SECS: u64 = 18_000;
const DEFAULT_SECTION_CAPACITY: usize = 1024;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_BYPASS_HEADERS: [&str; 1] = ["authorization"];

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch for whole-page caching.
    pub enabled: bool,
    /// Candidate storage roots, most specific first.
    pub storage_roots: Vec<PathBuf>,
    /// Extra key discriminators (locale, tenant, deploy version...).
    pub salts: Vec<String>,
    /// Page entry lifetime in seconds; 0 keeps entries until flushed.
    pub page_lifetime_secs: u64,
    /// Section lifetime in seconds when a section names none; 0 keeps them until flushed.
    pub section_lifetime_secs: u64,
    /// Maximum sections held by the in-memory section store.
    pub section_capacity: usize,
    /// Regex patterns; when non-empty, only matching pages are cached.
    pub only: Vec<String>,
    /// Regex patterns of pages that are never cached.
    pub ignore: Vec<String>,
    /// Request headers whose presence disables caching for the request.
    pub bypass_headers: Vec<String>,
    /// Cookie names whose presence disables caching for the request.
    pub bypass_cookies: Vec<String>,
    /// Response statuses eligible for storage.
    pub cacheable_statuses: Vec<u16>,
    /// Largest response body that will be stored.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_roots: DEFAULT_STORAGE_ROOTS.iter().map(PathBuf::from).collect(),
            salts: Vec::new(),
            page_lifetime_secs: DEFAULT_PAGE_LIFETIME_SECS,
            section_lifetime_secs: DEFAULT_SECTION_LIFETIME_SECS,
            section_capacity: DEFAULT_SECTION_CAPACITY,
            only: Vec::new(),
            ignore: Vec::new(),
            bypass_headers: DEFAULT_BYPASS_HEADERS.iter().map(|h| h.to_string()).collect(),
            bypass_cookies: Vec::new(),
            cacheable_statuses: vec![200],
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl CacheConfig {
    /// Page lifetime, `None` meaning "until flushed".
    pub fn page_lifetime(&self) -> Option<Duration> {
        non_zero_secs(self.page_lifetime_secs)
    }

    /// Default section lifetime, `None` meaning "until flushed or evicted".
    pub fn section_lifetime(&self) -> Option<Duration> {
        non_zero_secs(self.section_lifetime_secs)
    }

    /// Returns the section capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn section_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.section_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
