//! On-disk entry format.
//!
//! Every entry starts with a fixed [`HEADER_LEN`]-byte header holding the
//! zero-padded UNIX expiry timestamp, followed by the JSON-encoded
//! [`CachedPage`]. Readers split the header off before touching the payload.

use std::path::Path;
use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::{body::Body, response::Response};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use super::error::CacheError;

/// Width of the expiry header in bytes.
pub const HEADER_LEN: usize = 10;

/// Expiry value written for entries without a lifetime.
pub const NEVER_EXPIRES: i64 = 9_999_999_999;

const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Serialized response body plus the bits needed to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPage {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(serialize_with = "encode_body", deserialize_with = "decode_body")]
    pub body: Bytes,
}

impl CachedPage {
    /// A `200 OK` HTML page holding `content`.
    pub fn from_content(content: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            headers: vec![(
                header::CONTENT_TYPE.as_str().to_string(),
                DEFAULT_CONTENT_TYPE.to_string(),
            )],
            body: content.into(),
        }
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn content(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Replay the stored page as an HTTP response.
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);

        for (name, value) in &self.headers {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), header_value);
            }
        }

        builder.body(Body::from(self.body)).unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }
}

fn encode_body<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
}

fn decode_body<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

/// A header plus payload as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    expires_at: i64,
    page: CachedPage,
}

impl CacheEntry {
    /// Entry expiring `lifetime` after `now`; `None` never expires.
    pub fn new(page: CachedPage, lifetime: Option<Duration>, now: OffsetDateTime) -> Self {
        let expires_at = match lifetime {
            Some(lifetime) => {
                let secs = i64::try_from(lifetime.as_secs()).unwrap_or(NEVER_EXPIRES);
                now.unix_timestamp()
                    .saturating_add(secs)
                    .min(NEVER_EXPIRES)
            }
            None => NEVER_EXPIRES,
        };
        Self { expires_at, page }
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn page(&self) -> &CachedPage {
        &self.page
    }

    pub fn into_page(self) -> CachedPage {
        self.page
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at != NEVER_EXPIRES && now.unix_timestamp() >= self.expires_at
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let payload = serde_json::to_vec(&self.page)?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(format!("{:0width$}", self.expires_at, width = HEADER_LEN).as_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Split and decode `bytes` read from `path`.
    pub fn decode(path: &Path, bytes: &[u8]) -> Result<Self, CacheError> {
        if bytes.len() < HEADER_LEN {
            return Err(CacheError::corrupt(
                path,
                format!("entry is {} bytes, shorter than its header", bytes.len()),
            ));
        }

        let (header, payload) = bytes.split_at(HEADER_LEN);
        if !header.iter().all(u8::is_ascii_digit) {
            return Err(CacheError::corrupt(path, "expiry header is not numeric"));
        }
        let expires_at = std::str::from_utf8(header)
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| CacheError::corrupt(path, "expiry header is not numeric"))?;

        let page = serde_json::from_slice::<CachedPage>(payload)
            .map_err(|err| CacheError::corrupt(path, format!("payload does not decode: {err}")))?;

        Ok(Self { expires_at, page })
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const NOW: OffsetDateTime = datetime!(2026-01-01 00:00 UTC);

    #[test]
    fn header_has_fixed_width() {
        let short = CacheEntry::new(CachedPage::from_content("a"), Some(Duration::from_secs(5)), NOW);
        let forever = CacheEntry::new(CachedPage::from_content("a"), None, NOW);

        let short = short.encode().expect("encode");
        let forever = forever.encode().expect("encode");

        assert!(short[..HEADER_LEN].iter().all(u8::is_ascii_digit));
        assert_eq!(&forever[..HEADER_LEN], b"9999999999");
        assert_eq!(
            std::str::from_utf8(&short[..HEADER_LEN]).expect("ascii"),
            (NOW.unix_timestamp() + 5).to_string()
        );
    }

    #[test]
    fn stored_bytes_come_back_identical() {
        let body = Bytes::from_static(b"<p>caf\xc3\xa9</p>\x00\xff");
        let page = CachedPage {
            status: 200,
            headers: vec![("content-type".into(), "application/octet-stream".into())],
            body: body.clone(),
        };
        let entry = CacheEntry::new(page, Some(Duration::from_secs(60)), NOW);

        let bytes = entry.encode().expect("encode");
        let decoded = CacheEntry::decode(Path::new("/c/x"), &bytes).expect("decode");

        assert_eq!(decoded, entry);
        assert_eq!(decoded.page().body, body);
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let entry = CacheEntry::new(CachedPage::from_content("a"), Some(Duration::from_secs(60)), NOW);
        assert!(!entry.is_expired_at(NOW));
        assert!(!entry.is_expired_at(NOW + time::Duration::seconds(59)));
        assert!(entry.is_expired_at(NOW + time::Duration::seconds(60)));

        let forever = CacheEntry::new(CachedPage::from_content("a"), None, NOW);
        assert!(!forever.is_expired_at(datetime!(2300-01-01 00:00 UTC)));
    }

    #[test]
    fn short_entries_are_corrupt() {
        let err = CacheEntry::decode(Path::new("/c/x"), b"12345").expect_err("too short");
        assert!(matches!(err, CacheError::CorruptEntry { .. }));
    }

    #[test]
    fn non_numeric_header_is_corrupt() {
        let err = CacheEntry::decode(Path::new("/c/x"), b"abcdefghij{}").expect_err("bad header");
        assert!(matches!(err, CacheError::CorruptEntry { .. }));
    }

    #[test]
    fn garbage_payload_is_corrupt() {
        let err = CacheEntry::decode(Path::new("/c/x"), b"9999999999not json").expect_err("bad payload");
        match err {
            CacheError::CorruptEntry { path, reason } => {
                assert_eq!(path, Path::new("/c/x"));
                assert!(reason.contains("payload"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn page_replays_status_headers_and_body() {
        let page = CachedPage {
            status: 201,
            headers: vec![("x-origin".into(), "cache".into())],
            body: Bytes::from_static(b"done"),
        };
        let response = page.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-origin"], "cache");
    }

    #[test]
    fn content_defaults_to_html() {
        let page = CachedPage::from_content("<h1>hi</h1>");
        assert_eq!(page.status, 200);
        assert_eq!(page.content(), Some("<h1>hi</h1>"));
        assert_eq!(page.headers[0].1, "text/html; charset=utf-8");
    }
}
