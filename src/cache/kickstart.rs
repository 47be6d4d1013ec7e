//! Pre-bootstrap fast path.
//!
//! [`Kickstart`] needs nothing but the raw method, path and query string. It
//! derives the key the same way the slow path does, reads the entry and either
//! hands back the stored page or reports why it fell through. It never writes
//! or deletes anything.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use axum::http::{Method, Uri};
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::entry::{CacheEntry, CachedPage};
use super::keys::{KeyDeriver, page_for};
use super::shard::ShardResolver;

const METRIC_KICKSTART_HIT: &str = "pagecache_kickstart_hit_total";

/// Transport-level request data, before any parsing by the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    method: String,
    path: String,
    query: Option<String>,
}

impl RawRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>, query: Option<&str>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: query.map(str::to_string),
        }
    }

    pub fn from_uri(method: &Method, uri: &Uri) -> Self {
        Self::new(method.as_str(), uri.path(), uri.query())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn page(&self) -> String {
        page_for(&self.path, self.query.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NotGet,
    StorageUnavailable,
    NotCached,
    Expired,
    Corrupt,
    Unreadable,
}

impl MissReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotGet => "not_get",
            Self::StorageUnavailable => "storage_unavailable",
            Self::NotCached => "not_cached",
            Self::Expired => "expired",
            Self::Corrupt => "corrupt",
            Self::Unreadable => "unreadable",
        }
    }
}

#[derive(Debug)]
pub enum KickstartOutcome {
    /// Serve this page and stop; nothing else should run for the request.
    Hit(CachedPage),
    /// Fall through to the normal pipeline.
    Miss(MissReason),
}

impl KickstartOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

#[derive(Debug, Clone)]
pub struct Kickstart {
    resolver: ShardResolver,
    deriver: KeyDeriver,
}

impl Kickstart {
    pub fn new(resolver: ShardResolver, deriver: KeyDeriver) -> Self {
        Self { resolver, deriver }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            ShardResolver::new(config.storage_roots.clone()),
            KeyDeriver::new(config.salts.iter().cloned()),
        )
    }

    /// Path the entry for `request` would live at, if a storage root exists.
    pub fn path_for(&self, request: &RawRequest) -> Option<PathBuf> {
        let key = self.deriver.derive(request.method(), &request.page());
        self.resolver.resolve(&key).map(|address| address.path())
    }

    pub fn try_serve(&self, request: &RawRequest) -> KickstartOutcome {
        if request.method() != Method::GET.as_str() {
            return KickstartOutcome::Miss(MissReason::NotGet);
        }

        let key = self.deriver.derive(Method::GET.as_str(), &request.page());
        let Some(address) = self.resolver.resolve(&key) else {
            return KickstartOutcome::Miss(MissReason::StorageUnavailable);
        };
        let path = address.path();

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return KickstartOutcome::Miss(MissReason::NotCached);
            }
            Err(err) => {
                warn!(
                    target = "pagecache::kickstart",
                    op = "read",
                    path = %path.display(),
                    result = "fallthrough",
                    error = %err,
                    "Kickstart could not read cache entry"
                );
                return KickstartOutcome::Miss(MissReason::Unreadable);
            }
        };

        let entry = match CacheEntry::decode(&path, &bytes) {
            Ok(entry) => entry,
            Err(err) => {
                // Left on disk; a writer may be replacing it right now.
                warn!(
                    target = "pagecache::kickstart",
                    op = "decode",
                    path = %path.display(),
                    result = "fallthrough",
                    error = %err,
                    "Kickstart found a corrupt cache entry"
                );
                return KickstartOutcome::Miss(MissReason::Corrupt);
            }
        };

        if entry.is_expired_at(OffsetDateTime::now_utc()) {
            return KickstartOutcome::Miss(MissReason::Expired);
        }

        counter!(METRIC_KICKSTART_HIT).increment(1);
        debug!(cache = "kickstart", outcome = "hit", path = %path.display(), "serving page before bootstrap");
        KickstartOutcome::Hit(entry.into_page())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::cache::store::PageCacheStore;

    fn pair(dir: &TempDir) -> (PageCacheStore, Kickstart) {
        let resolver = ShardResolver::new(vec![dir.path().to_path_buf()]);
        let deriver = KeyDeriver::new(["v1"]);
        (
            PageCacheStore::from_parts(resolver.clone(), deriver.clone(), None),
            Kickstart::new(resolver, deriver),
        )
    }

    #[test]
    fn serves_what_the_slow_path_wrote() {
        let dir = TempDir::new().expect("temp dir");
        let (store, kickstart) = pair(&dir);
        let key = store.deriver().derive("GET", "/blog?page=2");
        store
            .store(&key, CachedPage::from_content("<p>page two</p>"))
            .expect("store");

        let outcome = kickstart.try_serve(&RawRequest::new("GET", "/blog", Some("page=2")));
        match outcome {
            KickstartOutcome::Hit(page) => assert_eq!(page.content(), Some("<p>page two</p>")),
            KickstartOutcome::Miss(reason) => panic!("unexpected miss: {reason:?}"),
        }
    }

    #[test]
    fn empty_query_addresses_the_bare_path() {
        let dir = TempDir::new().expect("temp dir");
        let (store, kickstart) = pair(&dir);
        let key = store.deriver().derive("GET", "/about");
        store.store(&key, CachedPage::from_content("about")).expect("store");

        assert!(kickstart.try_serve(&RawRequest::new("GET", "/about", Some(""))).is_hit());
        assert_eq!(
            kickstart.path_for(&RawRequest::new("GET", "/about", None)),
            store.locate(&key).map(|address| address.path())
        );
    }

    #[test]
    fn other_methods_fall_through_untouched() {
        let dir = TempDir::new().expect("temp dir");
        let (store, kickstart) = pair(&dir);
        let key = store.deriver().derive("POST", "/form");
        store.store(&key, CachedPage::from_content("x")).expect("store");

        let outcome = kickstart.try_serve(&RawRequest::new("POST", "/form", None));
        assert!(matches!(outcome, KickstartOutcome::Miss(MissReason::NotGet)));
    }

    #[test]
    fn missing_entry_and_missing_root_are_misses() {
        let dir = TempDir::new().expect("temp dir");
        let (_, kickstart) = pair(&dir);
        assert!(matches!(
            kickstart.try_serve(&RawRequest::new("GET", "/nothing", None)),
            KickstartOutcome::Miss(MissReason::NotCached)
        ));

        let rootless = Kickstart::new(
            ShardResolver::new(vec![dir.path().join("absent")]),
            KeyDeriver::default(),
        );
        assert!(matches!(
            rootless.try_serve(&RawRequest::new("GET", "/", None)),
            KickstartOutcome::Miss(MissReason::StorageUnavailable)
        ));
    }

    #[test]
    fn corrupt_entry_falls_through_and_stays() {
        let dir = TempDir::new().expect("temp dir");
        let (store, kickstart) = pair(&dir);
        let request = RawRequest::new("GET", "/blog", Some("page=2"));
        let path = kickstart.path_for(&request).expect("path");

        fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        fs::write(&path, b"99999999{ not json").expect("write");

        let outcome = kickstart.try_serve(&request);
        assert!(matches!(outcome, KickstartOutcome::Miss(MissReason::Corrupt)));
        assert!(path.exists());

        // The slow path can still overwrite it.
        let key = store.deriver().derive("GET", "/blog?page=2");
        store.store(&key, CachedPage::from_content("fresh")).expect("store");
        assert!(kickstart.try_serve(&request).is_hit());
    }

    #[test]
    fn expired_entry_is_a_miss_but_not_deleted() {
        let dir = TempDir::new().expect("temp dir");
        let (_, kickstart) = pair(&dir);
        let request = RawRequest::new("GET", "/stale", None);
        let path = kickstart.path_for(&request).expect("path");

        let stale = CacheEntry::new(
            CachedPage::from_content("old"),
            Some(Duration::from_secs(1)),
            OffsetDateTime::now_utc() - time::Duration::hours(2),
        );
        fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        fs::write(&path, stale.encode().expect("encode")).expect("write");

        assert!(matches!(
            kickstart.try_serve(&request),
            KickstartOutcome::Miss(MissReason::Expired)
        ));
        assert!(path.exists());
    }

    #[test]
    fn salts_must_match_the_writer() {
        let dir = TempDir::new().expect("temp dir");
        let (store, _) = pair(&dir);
        let key = store.deriver().derive("GET", "/");
        store.store(&key, CachedPage::from_content("v1 home")).expect("store");

        let other = Kickstart::new(
            ShardResolver::new(vec![dir.path().to_path_buf()]),
            KeyDeriver::new(["v2"]),
        );
        assert!(!other.try_serve(&RawRequest::new("GET", "/", None)).is_hit());
    }
}
