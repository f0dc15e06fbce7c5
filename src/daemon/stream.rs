//! Byte-range file responses
//!
//! Players seek to the end of a file for container indexes and then read from the
//! start, so single `Range` requests are honored. Responses are never cacheable
//! because the file is still being fetched.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderValue, InvalidHeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io::{self, SeekFrom};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::engine::FileReader;

/// Errors producing a stream response
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid header value: {0}")]
    Header(#[from] InvalidHeaderValue),
}

/// What part of a file a request asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// The whole file
    Full,
    /// Inclusive byte positions
    Partial { start: u64, end: u64 },
    /// A range that lies outside the file
    Unsatisfiable,
}

impl ByteRange {
    /// Interpret a `Range` header against a file of `length` bytes
    ///
    /// Unknown units, malformed specs and multi-range requests fall back to the full file.
    pub fn parse(header: Option<&str>, length: u64) -> Self {
        let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
            return ByteRange::Full;
        };
        if spec.contains(',') {
            return ByteRange::Full;
        }
        let Some((first, last)) = spec.split_once('-') else {
            return ByteRange::Full;
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            // Suffix range: the last N bytes
            return match last.parse::<u64>() {
                Ok(0) => ByteRange::Unsatisfiable,
                Ok(_) if length == 0 => ByteRange::Unsatisfiable,
                Ok(n) => ByteRange::Partial {
                    start: length.saturating_sub(n),
                    end: length - 1,
                },
                Err(_) => ByteRange::Full,
            };
        }

        let Ok(start) = first.parse::<u64>() else {
            return ByteRange::Full;
        };
        if start >= length {
            return ByteRange::Unsatisfiable;
        }

        let end = if last.is_empty() {
            length - 1
        } else {
            match last.parse::<u64>() {
                Ok(end) if end >= start => end.min(length - 1),
                _ => return ByteRange::Full,
            }
        };

        ByteRange::Partial { start, end }
    }
}

/// `attachment` disposition carrying the file's base name
fn content_disposition(display_name: &str) -> HeaderValue {
    let base = display_name.rsplit('/').next().unwrap_or(display_name);
    let escaped = base.replace('\\', "\\\\").replace('"', "\\\"");
    HeaderValue::from_bytes(format!("attachment; filename=\"{}\"", escaped).as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn base_headers(display_name: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mime = mime_guess::from_path(display_name).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate, max-age=0"),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(display_name));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers
}

/// Serve `reader` (a file of `length` bytes) honoring an optional `Range` header
pub async fn serve_range(
    mut reader: Box<dyn FileReader>,
    display_name: &str,
    length: u64,
    range_header: Option<&str>,
) -> Result<Response, StreamError> {
    let mut headers = base_headers(display_name);

    let (status, start, count) = match ByteRange::parse(range_header, length) {
        ByteRange::Full => (StatusCode::OK, 0, length),
        ByteRange::Partial { start, end } => {
            let range = format!("bytes {}-{}/{}", start, end, length);
            headers.insert(header::CONTENT_RANGE, HeaderValue::from_str(&range)?);
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
        ByteRange::Unsatisfiable => {
            let range = format!("bytes */{}", length);
            headers.insert(header::CONTENT_RANGE, HeaderValue::from_str(&range)?);
            return Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response());
        }
    };

    if start > 0 {
        reader.seek(SeekFrom::Start(start)).await?;
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(count));

    let body = Body::from_stream(ReaderStream::new(reader.take(count)));
    Ok((status, headers, body).into_response())
}
