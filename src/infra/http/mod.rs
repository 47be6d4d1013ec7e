mod middleware;
mod site;

use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};

pub use middleware::RequestId;
pub use site::{NAV_PLACEHOLDER, SiteState, page_file, serve_page};

use crate::{
    cache::{
        CacheConfig, CacheState, Kickstart, MemoryStore, PageCache, SectionCache,
        kickstart_layer, page_cache_layer,
    },
    config::Settings,
};

use super::error::InfraError;
use middleware::{log_responses, set_request_id};

#[derive(Clone)]
pub struct HttpState {
    pub site: SiteState,
    pub cache: Option<CacheState>,
    pub kickstart: Option<Arc<Kickstart>>,
}

impl HttpState {
    pub fn from_settings(settings: &Settings) -> Result<Self, InfraError> {
        Self::new(settings.site.root.clone(), &settings.cache)
    }

    /// Wire the site and both cache layers. With caching disabled only sections stay active.
    pub fn new(site_root: std::path::PathBuf, config: &CacheConfig) -> Result<Self, InfraError> {
        let cache_state = CacheState::from_config(config)?;
        let sections = SectionCache::new(
            MemoryStore::new(config.section_capacity_non_zero()),
            config.section_lifetime(),
        );
        let facade = PageCache::new(cache_state.store.clone(), Arc::new(sections));

        let (cache, kickstart) = if config.enabled {
            (
                Some(cache_state),
                Some(Arc::new(Kickstart::from_config(config))),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            site: SiteState::new(site_root, facade),
            cache,
            kickstart,
        })
    }
}

pub fn build_router(state: HttpState) -> Router {
    let pages = Router::new().fallback(serve_page).with_state(state.site);

    // Only site pages go through the page cache.
    let pages = match state.cache {
        Some(cache_state) => pages.layer(from_fn_with_state(cache_state, page_cache_layer)),
        None => pages,
    };

    let router = Router::new()
        .route("/_health", get(health))
        .merge(pages)
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_id));

    match state.kickstart {
        Some(kickstart) => router.layer(from_fn_with_state(kickstart, kickstart_layer)),
        None => router,
    }
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
