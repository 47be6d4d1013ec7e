//! Per-request caching decisions.
//!
//! A [`RequestLifecycle`] walks `Idle -> Armed -> Captured -> Stored | Skipped`.
//! [`EligibilityRules`] decide both transitions that can veto caching: one at
//! request start, one against the final response.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use bytes::Bytes;
use metrics::counter;
use regex::Regex;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::entry::CachedPage;
use super::error::CacheError;
use super::keys::{CacheKey, RequestContext};
use super::store::PageCacheStore;

const METRIC_PAGE_STORE: &str = "pagecache_page_store_total";
const METRIC_PAGE_STORE_FAILED: &str = "pagecache_page_store_failed_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    Idle,
    Armed,
    Captured,
    Stored,
    Skipped,
}

impl CachePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stored | Self::Skipped)
    }
}

/// Compiled request and response eligibility policy.
#[derive(Debug)]
pub struct EligibilityRules {
    enabled: bool,
    only: Vec<Regex>,
    ignore: Vec<Regex>,
    bypass_headers: Vec<HeaderName>,
    bypass_cookies: Vec<String>,
    statuses: Vec<StatusCode>,
    max_body_bytes: usize,
}

impl EligibilityRules {
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let bypass_headers = config
            .bypass_headers
            .iter()
            .map(|name| {
                HeaderName::try_from(name.to_ascii_lowercase()).map_err(|err| {
                    CacheError::InvalidPattern {
                        pattern: name.clone(),
                        reason: err.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let statuses = config
            .cacheable_statuses
            .iter()
            .map(|code| {
                StatusCode::from_u16(*code).map_err(|err| CacheError::InvalidPattern {
                    pattern: code.to_string(),
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            enabled: config.enabled,
            only: compile_patterns(&config.only)?,
            ignore: compile_patterns(&config.ignore)?,
            bypass_headers,
            bypass_cookies: config.bypass_cookies.clone(),
            statuses,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Why the request may not be cached, or `None` when it may.
    pub fn request_veto(&self, context: &RequestContext, headers: &HeaderMap) -> Option<&'static str> {
        if !self.enabled {
            return Some("disabled");
        }
        if context.method() != Method::GET {
            return Some("method");
        }

        let page = context.page();
        if !self.only.is_empty() && !self.only.iter().any(|re| re.is_match(&page)) {
            return Some("not_in_only");
        }
        if self.ignore.iter().any(|re| re.is_match(&page)) {
            return Some("ignored");
        }
        if self.bypass_headers.iter().any(|name| headers.contains_key(name)) {
            return Some("bypass_header");
        }
        if has_bypass_cookie(headers, &self.bypass_cookies) {
            return Some("bypass_cookie");
        }
        None
    }

    pub fn allows_request(&self, context: &RequestContext, headers: &HeaderMap) -> bool {
        self.request_veto(context, headers).is_none()
    }

    /// Why a response with this head may not be stored. Checked before the body is buffered.
    pub fn response_veto(&self, status: StatusCode, headers: &HeaderMap) -> Option<&'static str> {
        if !self.statuses.contains(&status) {
            return Some("status");
        }
        if headers.contains_key(header::SET_COOKIE) {
            return Some("set_cookie");
        }

        let cache_control = header_str(headers, header::CACHE_CONTROL).to_ascii_lowercase();
        if cache_control.contains("no-store") || cache_control.contains("private") {
            return Some("cache_control");
        }
        if header_str(headers, header::CONTENT_TYPE).starts_with("text/event-stream") {
            return Some("event_stream");
        }

        let declared_len = header_str(headers, header::CONTENT_LENGTH).parse::<usize>().ok();
        if declared_len.is_some_and(|len| len > self.max_body_bytes) {
            return Some("too_large");
        }
        None
    }

    pub fn allows_response(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        self.response_veto(status, headers).is_none()
    }

    pub fn allows_body(&self, len: usize) -> bool {
        len <= self.max_body_bytes
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, CacheError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| CacheError::InvalidPattern {
                pattern: pattern.clone(),
                reason: err.to_string(),
            })
        })
        .collect()
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

fn has_bypass_cookie(headers: &HeaderMap, names: &[String]) -> bool {
    if names.is_empty() {
        return false;
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('=').map(|(name, _)| name))
        .any(|name| names.iter().any(|bypass| bypass == name))
}

/// A fully buffered response, as handed to [`RequestLifecycle::end`].
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedResponse {
    pub fn to_page(&self) -> CachedPage {
        CachedPage {
            status: self.status.as_u16(),
            headers: self
                .headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
                .collect(),
            body: self.body.clone(),
        }
    }
}

pub struct RequestLifecycle {
    store: Arc<PageCacheStore>,
    rules: Arc<EligibilityRules>,
    context: RequestContext,
    key: CacheKey,
    phase: CachePhase,
}

impl RequestLifecycle {
    pub fn new(
        store: Arc<PageCacheStore>,
        rules: Arc<EligibilityRules>,
        context: RequestContext,
    ) -> Self {
        let key = store.deriver().for_request(&context);
        Self {
            store,
            rules,
            context,
            key,
            phase: CachePhase::Idle,
        }
    }

    pub fn phase(&self) -> CachePhase {
        self.phase
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn rules(&self) -> &EligibilityRules {
        &self.rules
    }

    /// Arm the lifecycle if the request is eligible. Only acts once.
    pub fn start(&mut self, headers: &HeaderMap) -> CachePhase {
        if self.phase != CachePhase::Idle {
            return self.phase;
        }
        self.phase = match self.rules.request_veto(&self.context, headers) {
            None => CachePhase::Armed,
            Some(reason) => {
                debug!(cache = "page", outcome = "bypass", reason, page = %self.context.page(), "request not cacheable");
                CachePhase::Skipped
            }
        };
        self.phase
    }

    /// Stored page for an armed request. Corrupt or unreadable entries count as a miss.
    pub fn cached(&self) -> Option<CachedPage> {
        if self.phase != CachePhase::Armed {
            return None;
        }
        match self.store.get(&self.key) {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    target = "pagecache::lifecycle",
                    op = "get",
                    result = "miss",
                    page = %self.context.page(),
                    error = %err,
                    "Ignoring unreadable cache entry"
                );
                None
            }
        }
    }

    /// Mark the response body as buffered. Only an armed lifecycle moves.
    pub fn capture(&mut self) -> CachePhase {
        if self.phase == CachePhase::Armed {
            self.phase = CachePhase::Captured;
        }
        self.phase
    }

    /// Whether `end` would store `response`.
    pub fn should_run(&self, response: &CapturedResponse) -> bool {
        matches!(self.phase, CachePhase::Armed | CachePhase::Captured)
            && self.rules.allows_response(response.status, &response.headers)
            && self.rules.allows_body(response.body.len())
    }

    /// Give up on caching this request.
    pub fn skip(&mut self) -> CachePhase {
        if !self.phase.is_terminal() {
            self.phase = CachePhase::Skipped;
        }
        self.phase
    }

    /// Store `response` if it qualifies, capturing it first when still armed.
    /// Later calls are no-ops.
    pub fn end(&mut self, response: &CapturedResponse) -> CachePhase {
        if self.phase.is_terminal() {
            return self.phase;
        }
        self.capture();
        if !self.should_run(response) {
            debug!(cache = "page", outcome = "skip", status = response.status.as_u16(), page = %self.context.page(), "response not stored");
            self.phase = CachePhase::Skipped;
            return self.phase;
        }

        self.phase = match self.store.store(&self.key, response.to_page()) {
            Ok(_) => {
                counter!(METRIC_PAGE_STORE).increment(1);
                CachePhase::Stored
            }
            Err(err) if err.is_disabled() => CachePhase::Skipped,
            Err(err) => {
                counter!(METRIC_PAGE_STORE_FAILED).increment(1);
                warn!(
                    target = "pagecache::lifecycle",
                    op = "store",
                    result = "skipped",
                    page = %self.context.page(),
                    error = %err,
                    "Failed to store page; response served uncached"
                );
                CachePhase::Skipped
            }
        };
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use axum::http::HeaderValue;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::keys::KeyDeriver;
    use crate::cache::shard::ShardResolver;

    fn rules(config: &CacheConfig) -> Arc<EligibilityRules> {
        Arc::new(EligibilityRules::from_config(config).expect("rules"))
    }

    fn store_at(root: PathBuf) -> Arc<PageCacheStore> {
        Arc::new(PageCacheStore::from_parts(
            ShardResolver::new(vec![root]),
            KeyDeriver::new(["v1"]),
            None,
        ))
    }

    fn ok_html(body: &'static str) -> CapturedResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        CapturedResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn get(path: &str) -> RequestContext {
        RequestContext::new(Method::GET, path, None)
    }

    #[test]
    fn eligible_request_is_stored() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().to_path_buf());
        let mut lifecycle = RequestLifecycle::new(store.clone(), rules(&CacheConfig::default()), get("/"));

        assert_eq!(lifecycle.start(&HeaderMap::new()), CachePhase::Armed);
        assert!(lifecycle.cached().is_none());
        assert_eq!(lifecycle.end(&ok_html("<h1>home</h1>")), CachePhase::Stored);

        let page = store.get(lifecycle.key()).expect("get").expect("page");
        assert_eq!(page.content(), Some("<h1>home</h1>"));
    }

    #[test]
    fn captured_phase_is_visible_until_end() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().to_path_buf());
        let mut lifecycle = RequestLifecycle::new(store, rules(&CacheConfig::default()), get("/"));

        assert_eq!(lifecycle.capture(), CachePhase::Idle);
        lifecycle.start(&HeaderMap::new());
        assert_eq!(lifecycle.capture(), CachePhase::Captured);
        assert_eq!(lifecycle.phase(), CachePhase::Captured);
        assert!(lifecycle.should_run(&ok_html("home")));
        assert_eq!(lifecycle.end(&ok_html("home")), CachePhase::Stored);
        assert_eq!(lifecycle.capture(), CachePhase::Stored);
    }

    #[test]
    fn end_twice_writes_once() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().to_path_buf());
        let mut lifecycle = RequestLifecycle::new(store.clone(), rules(&CacheConfig::default()), get("/"));
        lifecycle.start(&HeaderMap::new());

        assert_eq!(lifecycle.end(&ok_html("first")), CachePhase::Stored);
        let path = store.locate(lifecycle.key()).expect("address").path();
        let written = fs::metadata(&path).expect("metadata").modified().expect("mtime");

        assert_eq!(lifecycle.end(&ok_html("second")), CachePhase::Stored);
        let page = store.get(lifecycle.key()).expect("get").expect("page");
        assert_eq!(page.content(), Some("first"));
        assert_eq!(fs::metadata(&path).expect("metadata").modified().expect("mtime"), written);
    }

    #[test]
    fn non_get_requests_are_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().to_path_buf());
        let context = RequestContext::new(Method::POST, "/form", None);
        let mut lifecycle = RequestLifecycle::new(store.clone(), rules(&CacheConfig::default()), context);

        assert_eq!(lifecycle.start(&HeaderMap::new()), CachePhase::Skipped);
        assert_eq!(lifecycle.end(&ok_html("posted")), CachePhase::Skipped);
        assert!(store.get(lifecycle.key()).expect("get").is_none());
    }

    #[test]
    fn end_without_start_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().to_path_buf());
        let mut lifecycle = RequestLifecycle::new(store, rules(&CacheConfig::default()), get("/"));
        assert_eq!(lifecycle.end(&ok_html("x")), CachePhase::Skipped);
    }

    #[test]
    fn authorization_header_bypasses() {
        let rules = rules(&CacheConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        assert_eq!(rules.request_veto(&get("/"), &headers), Some("bypass_header"));
    }

    #[test]
    fn bypass_cookie_matches_by_name() {
        let config = CacheConfig {
            bypass_cookies: vec!["session".into()],
            ..Default::default()
        };
        let rules = rules(&config);

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; session=abc"));
        assert!(!rules.allows_request(&get("/"), &headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; sessionid=abc"));
        assert!(rules.allows_request(&get("/"), &headers));
    }

    #[test]
    fn only_and_ignore_patterns() {
        let config = CacheConfig {
            only: vec!["^/blog".into()],
            ignore: vec!["preview=1".into()],
            ..Default::default()
        };
        let rules = rules(&config);
        let headers = HeaderMap::new();

        assert!(rules.allows_request(&get("/blog/post"), &headers));
        assert_eq!(rules.request_veto(&get("/about"), &headers), Some("not_in_only"));
        let preview = RequestContext::new(Method::GET, "/blog/post", Some("preview=1"));
        assert_eq!(rules.request_veto(&preview, &headers), Some("ignored"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let config = CacheConfig {
            ignore: vec!["(".into()],
            ..Default::default()
        };
        let err = EligibilityRules::from_config(&config).expect_err("invalid regex");
        assert!(matches!(err, CacheError::InvalidPattern { pattern, .. } if pattern == "("));
    }

    #[test]
    fn disabled_cache_skips_everything() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(rules(&config).request_veto(&get("/"), &HeaderMap::new()), Some("disabled"));
    }

    #[test]
    fn response_rules() {
        let rules = rules(&CacheConfig {
            max_body_bytes: 8,
            ..Default::default()
        });
        let empty = HeaderMap::new();

        assert!(rules.allows_response(StatusCode::OK, &empty));
        assert_eq!(rules.response_veto(StatusCode::NOT_FOUND, &empty), Some("status"));

        let mut headers = HeaderMap::new();
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("a=b"));
        assert_eq!(rules.response_veto(StatusCode::OK, &headers), Some("set_cookie"));

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("Private, max-age=0"));
        assert_eq!(rules.response_veto(StatusCode::OK, &headers), Some("cache_control"));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        assert_eq!(rules.response_veto(StatusCode::OK, &headers), Some("event_stream"));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("9"));
        assert_eq!(rules.response_veto(StatusCode::OK, &headers), Some("too_large"));

        assert!(rules.allows_body(8));
        assert!(!rules.allows_body(9));
    }

    #[test]
    fn ineligible_response_does_no_io() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().to_path_buf());
        let mut lifecycle = RequestLifecycle::new(store, rules(&CacheConfig::default()), get("/missing"));
        lifecycle.start(&HeaderMap::new());

        let mut response = ok_html("not found");
        response.status = StatusCode::NOT_FOUND;
        assert!(!lifecycle.should_run(&response));
        assert_eq!(lifecycle.end(&response), CachePhase::Skipped);
        assert_eq!(fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn missing_storage_skips_quietly() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().join("absent"));
        let mut lifecycle = RequestLifecycle::new(store, rules(&CacheConfig::default()), get("/"));
        lifecycle.start(&HeaderMap::new());
        assert_eq!(lifecycle.end(&ok_html("x")), CachePhase::Skipped);
    }

    #[test]
    fn write_failure_skips_without_panicking() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().to_path_buf());
        let mut lifecycle = RequestLifecycle::new(store.clone(), rules(&CacheConfig::default()), get("/"));
        lifecycle.start(&HeaderMap::new());

        // A plain file where the first shard directory should go.
        let address = store.locate(lifecycle.key()).expect("address");
        let (first, _) = address.segments();
        let blocker = dir.path().join(first);
        fs::write(&blocker, b"").expect("write");

        assert_eq!(lifecycle.end(&ok_html("x")), CachePhase::Skipped);
    }

    #[test]
    fn corrupt_entry_reads_as_miss() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_at(dir.path().to_path_buf());
        let mut lifecycle = RequestLifecycle::new(store.clone(), rules(&CacheConfig::default()), get("/"));
        lifecycle.start(&HeaderMap::new());

        let address = store.locate(lifecycle.key()).expect("address");
        fs::create_dir_all(address.directory()).expect("dirs");
        fs::write(address.path(), b"broken").expect("write");

        assert!(lifecycle.cached().is_none());
        assert_eq!(lifecycle.end(&ok_html("fresh")), CachePhase::Stored);
        assert!(lifecycle.cached().is_none());
        assert_eq!(
            store.get(lifecycle.key()).expect("get").expect("page").content(),
            Some("fresh")
        );
    }
}
