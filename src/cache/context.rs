//! Request scope for key derivation.
//!
//! Uses `tokio::task_local!` so code running below the page cache middleware
//! can derive the current page's key without threading the request through
//! every call. Outside a scope the lookup fails with
//! [`CacheError::ContextUnavailable`].

use std::future::Future;

use super::error::CacheError;
use super::keys::RequestContext;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Run an async block with `context` as the current request.
pub async fn scope<F>(context: RequestContext, f: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(context, f).await
}

/// Run a synchronous closure with `context` as the current request.
pub fn sync_scope<R>(context: RequestContext, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(context, f)
}

/// The request currently being handled.
pub fn current() -> Result<RequestContext, CacheError> {
    CURRENT
        .try_with(RequestContext::clone)
        .map_err(|_| CacheError::ContextUnavailable)
}
