//! Named, TTL-bound fragment memoization.
//!
//! Sections sit on top of any [`KeyValueStore`]. Each call renders into its own
//! buffer, so a section rendered inside another section is captured and stored
//! independently of its parent.

use std::fmt;
use std::time::Duration;

use metrics::counter;
use tracing::debug;

use super::kv::KeyValueStore;

const SECTION_PREFIX: &str = "pagecache-section-";
const METRIC_SECTION_HIT: &str = "pagecache_section_hit_total";
const METRIC_SECTION_MISS: &str = "pagecache_section_miss_total";

/// Output buffer handed to a section's render callback.
#[derive(Debug, Default)]
pub struct SectionBuffer {
    out: String,
}

impl SectionBuffer {
    pub fn push_str(&mut self, text: &str) {
        self.out.push_str(text);
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn into_string(self) -> String {
        self.out
    }
}

impl fmt::Write for SectionBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.out.push_str(s);
        Ok(())
    }
}

pub struct SectionCache<S> {
    store: S,
    default_lifetime: Option<Duration>,
}

impl<S: KeyValueStore> SectionCache<S> {
    /// `default_lifetime` applies to sections rendered without an explicit lifetime.
    pub fn new(store: S, default_lifetime: Option<Duration>) -> Self {
        Self {
            store,
            default_lifetime,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn default_lifetime(&self) -> Option<Duration> {
        self.default_lifetime
    }

    /// Store key for a section name.
    pub fn section_key(name: &str) -> String {
        format!("{SECTION_PREFIX}{name}")
    }

    /// Cached content of `name`, computing and storing it on a miss.
    pub fn section<F>(&self, name: &str, lifetime: Option<Duration>, compute: F) -> String
    where
        F: FnOnce() -> String,
    {
        let ttl = lifetime.or(self.default_lifetime);
        let mut computed = false;
        let content = self
            .store
            .remember(&Self::section_key(name), ttl, || {
                computed = true;
                compute()
            });

        if computed {
            counter!(METRIC_SECTION_MISS).increment(1);
            debug!(cache = "section", outcome = "miss", section = name, bytes = content.len(), "section rendered");
        } else {
            counter!(METRIC_SECTION_HIT).increment(1);
            debug!(cache = "section", outcome = "hit", section = name, "section served from cache");
        }

        content
    }

    /// Like [`section`](Self::section), but the callback writes into a fresh buffer.
    pub fn section_with<F>(&self, name: &str, lifetime: Option<Duration>, render: F) -> String
    where
        F: FnOnce(&mut SectionBuffer),
    {
        self.section(name, lifetime, || {
            let mut buffer = SectionBuffer::default();
            render(&mut buffer);
            buffer.into_string()
        })
    }

    /// Drop the cached content of `name`. Missing sections are not an error.
    pub fn flush_section(&self, name: &str) -> bool {
        let removed = self.store.forget(&Self::section_key(name));
        debug!(cache = "section", section = name, removed, "section flushed");
        removed
    }
}
