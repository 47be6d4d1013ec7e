//! Full-page and fragment response cache.
//!
//! - **Page cache**: whole responses stored on disk under a sharded layout,
//!   written by [`page_cache_layer`] and read either by that layer or, ahead of
//!   everything else, by [`kickstart_layer`].
//! - **Section cache**: named, TTL-bound fragments memoized in any
//!   [`KeyValueStore`].
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `pagecache.toml`:
//!
//! ```toml
//! [cache]
//! storage_roots = ["storage/framework/cache", "storage/cache", "cache"]
//! salts = ["v1"]
//! page_lifetime_secs = 18000
//! section_lifetime_secs = 18000
//! # ... see config.rs for all options
//! ```

mod config;
pub mod context;
mod entry;
mod error;
mod facade;
mod keys;
mod kickstart;
mod kv;
mod lifecycle;
mod lock;
mod middleware;
mod section;
mod shard;
mod store;

pub use config::CacheConfig;
pub use entry::{CacheEntry, CachedPage, HEADER_LEN, NEVER_EXPIRES};
pub use error::CacheError;
pub use facade::{FragmentCaching, PageCache, PageCaching};
pub use keys::{CacheKey, KeyDeriver, RequestContext, page_for};
pub use kickstart::{Kickstart, KickstartOutcome, MissReason, RawRequest};
pub use kv::{KeyValueStore, MemoryStore};
pub use lifecycle::{CachePhase, CapturedResponse, EligibilityRules, RequestLifecycle};
pub use middleware::{CacheState, kickstart_layer, page_cache_layer};
pub use section::{SectionBuffer, SectionCache};
pub use shard::{ShardAddress, ShardResolver};
pub use store::PageCacheStore;
