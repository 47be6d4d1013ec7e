//! One handle for both caches.
//!
//! Each capability is its own trait. [`PageCache`] holds typed references to
//! the page store and the section cache and forwards to them statically.

use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use bytes::Bytes;
use tracing::debug;

use super::config::CacheConfig;
use super::entry::CachedPage;
use super::error::CacheError;
use super::keys::CacheKey;
use super::kv::KeyValueStore;
use super::section::{SectionBuffer, SectionCache};
use super::store::PageCacheStore;

/// Whole-page caching keyed by the current request.
pub trait PageCaching {
    fn compute_hash(&self, page: Option<&str>) -> Result<CacheKey, CacheError>;
    fn get_cache(&self) -> Result<Option<CachedPage>, CacheError>;
    fn put(&self, content: Bytes) -> Result<(), CacheError>;
    fn forget(&self) -> Result<bool, CacheError>;
    fn flush(&self) -> Result<usize, CacheError>;
    fn get_lifetime(&self) -> Option<Duration>;
}

/// Named fragment memoization.
pub trait FragmentCaching {
    fn section<F>(&self, name: &str, lifetime: Option<Duration>, compute: F) -> String
    where
        F: FnOnce() -> String;

    fn section_with<F>(&self, name: &str, lifetime: Option<Duration>, render: F) -> String
    where
        F: FnOnce(&mut SectionBuffer);

    fn flush_section(&self, name: &str) -> bool;
}

impl PageCaching for PageCacheStore {
    fn compute_hash(&self, page: Option<&str>) -> Result<CacheKey, CacheError> {
        self.deriver().compute_hash(page)
    }

    fn get_cache(&self) -> Result<Option<CachedPage>, CacheError> {
        PageCacheStore::get_cache(self)
    }

    fn put(&self, content: Bytes) -> Result<(), CacheError> {
        PageCacheStore::put(self, content)
    }

    fn forget(&self) -> Result<bool, CacheError> {
        PageCacheStore::forget(self)
    }

    fn flush(&self) -> Result<usize, CacheError> {
        PageCacheStore::flush(self)
    }

    fn get_lifetime(&self) -> Option<Duration> {
        PageCacheStore::get_lifetime(self)
    }
}

impl<S: KeyValueStore> FragmentCaching for SectionCache<S> {
    fn section<F>(&self, name: &str, lifetime: Option<Duration>, compute: F) -> String
    where
        F: FnOnce() -> String,
    {
        SectionCache::section(self, name, lifetime, compute)
    }

    fn section_with<F>(&self, name: &str, lifetime: Option<Duration>, render: F) -> String
    where
        F: FnOnce(&mut SectionBuffer),
    {
        SectionCache::section_with(self, name, lifetime, render)
    }

    fn flush_section(&self, name: &str) -> bool {
        SectionCache::flush_section(self, name)
    }
}

pub struct PageCache<S> {
    pages: Arc<PageCacheStore>,
    sections: Arc<SectionCache<S>>,
}

impl<S> Clone for PageCache<S> {
    fn clone(&self) -> Self {
        Self {
            pages: Arc::clone(&self.pages),
            sections: Arc::clone(&self.sections),
        }
    }
}

impl<S: KeyValueStore> PageCache<S> {
    pub fn new(pages: Arc<PageCacheStore>, sections: Arc<SectionCache<S>>) -> Self {
        Self { pages, sections }
    }

    /// Build both caches from configuration, with `store` backing the sections.
    pub fn from_config(config: &CacheConfig, store: S) -> Self {
        Self::new(
            Arc::new(PageCacheStore::new(config)),
            Arc::new(SectionCache::new(store, config.section_lifetime())),
        )
    }

    pub fn pages(&self) -> &Arc<PageCacheStore> {
        &self.pages
    }

    pub fn sections(&self) -> &Arc<SectionCache<S>> {
        &self.sections
    }

    /// Response for the current request.
    ///
    /// With `content`, a fresh HTML page holding it. Without, the cached page,
    /// or an empty `200` when nothing usable is stored.
    pub fn response(&self, content: Option<Bytes>) -> Response {
        let page = match content {
            Some(content) => CachedPage::from_content(content),
            None => match self.pages.get_cache() {
                Ok(Some(page)) => page,
                Ok(None) => CachedPage::from_content(Bytes::new()),
                Err(err) => {
                    debug!(cache = "page", outcome = "miss", error = %err, "no cached page for response");
                    CachedPage::from_content(Bytes::new())
                }
            },
        };
        page.into_response()
    }
}

impl<S: KeyValueStore> PageCaching for PageCache<S> {
    fn compute_hash(&self, page: Option<&str>) -> Result<CacheKey, CacheError> {
        PageCaching::compute_hash(self.pages.as_ref(), page)
    }

    fn get_cache(&self) -> Result<Option<CachedPage>, CacheError> {
        self.pages.get_cache()
    }

    fn put(&self, content: Bytes) -> Result<(), CacheError> {
        self.pages.put(content)
    }

    fn forget(&self) -> Result<bool, CacheError> {
        self.pages.forget()
    }

    fn flush(&self) -> Result<usize, CacheError> {
        self.pages.flush()
    }

    fn get_lifetime(&self) -> Option<Duration> {
        self.pages.get_lifetime()
    }
}

impl<S: KeyValueStore> FragmentCaching for PageCache<S> {
    fn section<F>(&self, name: &str, lifetime: Option<Duration>, compute: F) -> String
    where
        F: FnOnce() -> String,
    {
        self.sections.section(name, lifetime, compute)
    }

    fn section_with<F>(&self, name: &str, lifetime: Option<Duration>, render: F) -> String
    where
        F: FnOnce(&mut SectionBuffer),
    {
        self.sections.section_with(name, lifetime, render)
    }

    fn flush_section(&self, name: &str) -> bool {
        self.sections.flush_section(name)
    }
}
