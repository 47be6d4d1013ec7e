//! File-backed demo site.
//!
//! Pages are read from the site root on every request, so the page cache in
//! front of it is what keeps repeat requests off the disk. HTML pages may carry
//! a navigation placeholder, filled from a cached section.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode, Uri, header::CONTENT_TYPE},
    response::{Html, IntoResponse, Response},
};
use tracing::error;

use crate::cache::{FragmentCaching, MemoryStore, PageCache};

/// Replaced by the cached navigation section in HTML pages.
pub const NAV_PLACEHOLDER: &str = "<!-- pagecache:navigation -->";

const NAV_SECTION: &str = "navigation";
const INDEX_FILE: &str = "index.html";

#[derive(Clone)]
pub struct SiteState {
    root: Arc<PathBuf>,
    cache: PageCache<MemoryStore>,
}

impl SiteState {
    pub fn new(root: PathBuf, cache: PageCache<MemoryStore>) -> Self {
        Self {
            root: Arc::new(root),
            cache,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &PageCache<MemoryStore> {
        &self.cache
    }
}

pub async fn serve_page(State(site): State<SiteState>, uri: Uri) -> Response {
    let Some(relative) = page_file(uri.path()) else {
        return not_found();
    };
    let candidate = site.root.join(&relative);

    let contents = match tokio::fs::read(&candidate).await {
        Ok(contents) => contents,
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
            return not_found();
        }
        Err(err) => {
            error!(
                target = "pagecache::http::site",
                path = %candidate.display(),
                error = %err,
                "Failed to read site page"
            );
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mime = mime_guess::from_path(&candidate).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT && mime.subtype() == mime_guess::mime::HTML {
        let text = String::from_utf8_lossy(&contents);
        if text.contains(NAV_PLACEHOLDER) {
            let nav = site
                .cache
                .section(NAV_SECTION, None, || render_navigation(&site.root));
            return Html(text.replace(NAV_PLACEHOLDER, &nav)).into_response();
        }
        return Html(text.into_owned()).into_response();
    }

    let mut response = contents.into_response();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

/// Map a request path to a file under the site root.
///
/// `/` and directory paths map to `index.html`; extensionless paths get `.html`.
/// Paths escaping the root yield `None`.
pub fn page_file(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let mut relative = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if relative.as_os_str().is_empty() || path.ends_with('/') {
        relative.push(INDEX_FILE);
    } else if relative.extension().is_none() {
        relative.set_extension("html");
    }
    Some(relative)
}

fn render_navigation(root: &Path) -> String {
    let mut pages = std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter_map(|name| name.strip_suffix(".html").map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    pages.sort();

    let mut nav = String::from("<nav>");
    for page in pages {
        let href = if page == "index" { "/".to_string() } else { format!("/{page}") };
        nav.push_str(&format!("<a href=\"{href}\">{page}</a>"));
    }
    nav.push_str("</nav>");
    nav
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Html("<h1>Not Found</h1>")).into_response()
}
