//! Raw HTTP/1.1 serialization of cached responses.
//!
//! An entry is stored exactly as it would appear on the wire: status line,
//! headers, blank line, body.  The `Date` header doubles as the freshness
//! timestamp used by the caching transport.

use axum::http::header::{CONTENT_LENGTH, DATE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Upper bound on header lines accepted when decoding an entry.
const MAX_HEADERS: usize = 128;

/// IMF-fixdate, the preferred HTTP-date format.
const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Obsolete RFC 850 HTTP-date format.
const RFC850_DATE: &str = "%A, %d-%b-%y %H:%M:%S GMT";

/// ANSI C `asctime()` HTTP-date format.
const ASCTIME_DATE: &str = "%a %b %e %H:%M:%S %Y";

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("malformed cache entry: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("truncated cache entry: response head is incomplete")]
    Truncated,
    #[error("cache entry status {0} is not a valid HTTP status")]
    InvalidStatus(u16),
    #[error("invalid header {0:?} in cache entry")]
    InvalidHeader(String),
    #[error("cache entry body is {actual} bytes but Content-Length says {declared}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("cache entry has no Date header")]
    MissingDate,
    #[error("cache entry Date header {0:?} is not an HTTP-date")]
    InvalidDate(String),
}

/// A fully buffered response as persisted in the local cache tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    /// Serialize to HTTP/1.x wire format.
    ///
    /// `Content-Length` always reflects the body actually captured and
    /// `Transfer-Encoding` is never written, so the entry can be decoded
    /// without any framing state.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.headers.len() * 64 + self.body.len());

        let version = if self.version == Version::HTTP_10 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        };
        buf.put(
            format!(
                "{version} {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );

        for (name, value) in &self.headers {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            buf.put(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put(format!("content-length: {}\r\n\r\n", self.body.len()).as_bytes());
        buf.put(self.body.as_ref());

        buf.freeze()
    }

    /// Parse an entry previously produced by [`encode`](Self::encode).
    pub fn decode(raw: &Bytes) -> Result<Self, EntryError> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut header_buf);

        let head_len = match parsed.parse(raw)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Err(EntryError::Truncated),
        };

        let code = parsed.code.ok_or(EntryError::Truncated)?;
        let status = StatusCode::from_u16(code).map_err(|_| EntryError::InvalidStatus(code))?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| EntryError::InvalidHeader(h.name.to_string()))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|_| EntryError::InvalidHeader(h.name.to_string()))?;
            headers.append(name, value);
        }

        let body = raw.slice(head_len..);
        if let Some(declared) = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            && declared != body.len()
        {
            return Err(EntryError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        Ok(Self {
            status,
            version,
            headers,
            body,
        })
    }

    /// The instant this response was produced, taken from its `Date` header.
    pub fn stored_at(&self) -> Result<DateTime<Utc>, EntryError> {
        let raw = self.headers.get(DATE).ok_or(EntryError::MissingDate)?;
        let text = raw
            .to_str()
            .map_err(|_| EntryError::InvalidDate(String::from_utf8_lossy(raw.as_bytes()).into()))?;
        parse_http_date(text).ok_or_else(|| EntryError::InvalidDate(text.to_string()))
    }
}

/// Parse any of the three HTTP-date forms into a UTC instant.
pub fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    [IMF_FIXDATE, RFC850_DATE, ASCTIME_DATE]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Render `at` as an IMF-fixdate `Date` header value.
pub fn http_date(at: DateTime<Utc>) -> HeaderValue {
    // The formatted string is plain ASCII.
    HeaderValue::from_str(&at.format(IMF_FIXDATE).to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}
