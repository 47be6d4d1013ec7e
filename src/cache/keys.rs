//! Cache key definitions.
//!
//! A [`CacheKey`] is derived from the configured salts, the request method and
//! the request page (path plus query string). Components are length-prefixed
//! before joining, so a salt containing the separator cannot collide with a
//! different component split.

use std::fmt;
use std::sync::Arc;

use axum::http::{Method, Request, Uri};
use sha2::{Digest, Sha256};

use super::context;
use super::error::CacheError;

const COMPONENT_SEPARATOR: char = '|';

/// Deterministic identifier of a cacheable response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase hex SHA-256 of the key, used as the on-disk leaf name.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The request data key derivation depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    method: Method,
    path: String,
    query: Option<String>,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>, query: Option<&str>) -> Self {
        Self {
            method,
            path: path.into(),
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
        }
    }

    pub fn from_uri(method: Method, uri: &Uri) -> Self {
        Self::new(method, uri.path(), uri.query())
    }

    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self::from_uri(request.method().clone(), request.uri())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Canonical page: the path, with `?query` appended when a query is present.
    pub fn page(&self) -> String {
        page_for(&self.path, self.query.as_deref())
    }
}

/// Build the canonical page string from a raw path and query.
///
/// Shared by the slow path and the kickstart path so both address the same entry.
pub fn page_for(path: &str, query: Option<&str>) -> String {
    match query.filter(|q| !q.is_empty()) {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}

/// Computes cache keys from salts, method and page. Pure, no I/O.
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    salts: Arc<[String]>,
}

impl KeyDeriver {
    pub fn new<I, S>(salts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            salts: salts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn salts(&self) -> &[String] {
        &self.salts
    }

    /// Derive the key for an explicit method and page.
    pub fn derive(&self, method: &str, page: &str) -> CacheKey {
        let mut joined = String::new();
        let components = self
            .salts
            .iter()
            .map(String::as_str)
            .chain([method, page]);

        for (index, component) in components.enumerate() {
            if index > 0 {
                joined.push(COMPONENT_SEPARATOR);
            }
            joined.push_str(&component.len().to_string());
            joined.push(':');
            joined.push_str(component);
        }

        CacheKey(joined)
    }

    pub fn for_request(&self, context: &RequestContext) -> CacheKey {
        self.derive(context.method().as_str(), &context.page())
    }

    /// Key for `page`, or for the current request's page when `page` is `None`.
    ///
    /// The method comes from the current request; an explicit page derived
    /// outside any request scope is treated as a `GET`.
    pub fn compute_hash(&self, page: Option<&str>) -> Result<CacheKey, CacheError> {
        let current = context::current();
        match (page, current) {
            (Some(page), Ok(ctx)) => Ok(self.derive(ctx.method().as_str(), page)),
            (Some(page), Err(_)) => Ok(self.derive(Method::GET.as_str(), page)),
            (None, Ok(ctx)) => Ok(self.for_request(&ctx)),
            (None, Err(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deriver() -> KeyDeriver {
        KeyDeriver::new(["v1"])
    }

    #[test]
    fn identical_requests_share_a_key() {
        let first = deriver().derive("GET", "/blog?page=2");
        let second = deriver().derive("GET", "/blog?page=2");
        assert_eq!(first, second);
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn query_change_changes_the_key() {
        let page2 = deriver().derive("GET", "/blog?page=2");
        let page3 = deriver().derive("GET", "/blog?page=3");
        assert_ne!(page2, page3);
    }

    #[test]
    fn method_path_and_salt_each_discriminate() {
        let base = deriver().derive("GET", "/blog");
        assert_ne!(base, deriver().derive("HEAD", "/blog"));
        assert_ne!(base, deriver().derive("GET", "/blog/"));
        assert_ne!(base, KeyDeriver::new(["v2"]).derive("GET", "/blog"));
        assert_ne!(base, KeyDeriver::new(["v1", "en"]).derive("GET", "/blog"));
        assert_ne!(base, KeyDeriver::default().derive("GET", "/blog"));
    }

    #[test]
    fn separator_inside_a_salt_does_not_collide() {
        let split = KeyDeriver::new(["a", "b"]).derive("GET", "/");
        let joined = KeyDeriver::new(["a|1:b"]).derive("GET", "/");
        assert_ne!(split, joined);
    }

    #[test]
    fn salt_order_matters() {
        let ab = KeyDeriver::new(["a", "b"]).derive("GET", "/");
        let ba = KeyDeriver::new(["b", "a"]).derive("GET", "/");
        assert_ne!(ab, ba);
    }

    #[test]
    fn key_layout_is_length_prefixed() {
        let key = deriver().derive("GET", "/blog");
        assert_eq!(key.as_str(), "2:v1|3:GET|5:/blog");
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let digest = deriver().derive("GET", "/").digest();
        assert_eq!(digest.len(), 64);
        assert!(
            digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        );
    }

    #[test]
    fn page_appends_non_empty_query_only() {
        assert_eq!(page_for("/blog", Some("page=2")), "/blog?page=2");
        assert_eq!(page_for("/blog", Some("")), "/blog");
        assert_eq!(page_for("/blog", None), "/blog");

        let ctx = RequestContext::new(Method::GET, "/blog", Some(""));
        assert_eq!(ctx.query(), None);
    }

    #[test]
    fn request_context_reads_the_uri() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/blog?page=2")
            .body(())
            .expect("request");
        let ctx = RequestContext::from_request(&request);
        assert_eq!(ctx.path(), "/blog");
        assert_eq!(ctx.query(), Some("page=2"));
        assert_eq!(
            deriver().for_request(&ctx),
            deriver().derive("GET", "/blog?page=2")
        );
    }

    #[test]
    fn compute_hash_without_context_needs_a_page() {
        let err = deriver().compute_hash(None).expect_err("no request scope");
        assert!(matches!(err, CacheError::ContextUnavailable));

        let explicit = deriver().compute_hash(Some("/about")).expect("explicit page");
        assert_eq!(explicit, deriver().derive("GET", "/about"));
    }

    #[test]
    fn compute_hash_uses_the_current_request() {
        let ctx = RequestContext::new(Method::POST, "/contact", Some("ref=nav"));
        let (current, explicit) = context::sync_scope(ctx, || {
            (
                deriver().compute_hash(None).expect("current page"),
                deriver().compute_hash(Some("/other")).expect("explicit page"),
            )
        });
        assert_eq!(current, deriver().derive("POST", "/contact?ref=nav"));
        assert_eq!(explicit, deriver().derive("POST", "/other"));
    }
}
