//! Request-parsing helpers shared by the image handlers: the `Range` and `Content-Range`
//! headers are where most of the protocol's edge cases live, so they get their own careful,
//! independently testable parsers rather than being inlined into each handler.

use axum::http::HeaderMap;

use crate::http::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Exclusive.
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Parses a `Range: bytes=start-end` request header (inclusive end, per RFC 9110) into a
/// half-open `[start, end)` span. Only a single range is supported; a multi-range request is
/// rejected rather than silently serving the first one. Returns `None` when there is no `Range`
/// header at all, meaning the caller wants the whole image.
pub fn parse_range_header(headers: &HeaderMap, size: u64) -> Result<Option<ByteRange>, HttpError> {
    let Some(value) = headers.get(axum::http::header::RANGE) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| HttpError::bad_request("range header is not valid utf-8"))?;

    let spec = value.strip_prefix("bytes=").ok_or_else(|| HttpError::bad_request("unsupported range unit"))?;
    if spec.contains(',') {
        return Err(HttpError::bad_request("multiple ranges are not supported"));
    }

    let (start_str, end_str) = spec.split_once('-').ok_or_else(|| HttpError::bad_request("malformed range header"))?;

    let range = if start_str.is_empty() {
        // "bytes=-N": last N bytes.
        let suffix_len: u64 = end_str.parse().map_err(|_| HttpError::bad_request("malformed range header"))?;
        let start = size.saturating_sub(suffix_len);
        ByteRange { start, end: size }
    } else {
        let start: u64 = start_str.parse().map_err(|_| HttpError::bad_request("malformed range header"))?;
        let end = if end_str.is_empty() {
            size
        } else {
            let inclusive_end: u64 = end_str.parse().map_err(|_| HttpError::bad_request("malformed range header"))?;
            inclusive_end.saturating_add(1)
        };
        ByteRange { start, end }
    };

    if range.start > range.end || range.end > size {
        return Err(HttpError::range_not_satisfiable(
            format!("range [{}, {}) lies outside of image of size {size}", range.start, range.end),
            size,
        ));
    }

    Ok(Some(range))
}

/// Parses a `Content-Range: bytes start-end/*` request header (used on `PUT`, where the total
/// size is already known from the ticket and the server-side `*` is expected) into the `(start,
/// end)` span the body covers.
pub fn parse_content_range_header(headers: &HeaderMap, body_len: u64) -> Result<ByteRange, HttpError> {
    let Some(value) = headers.get(axum::http::header::CONTENT_RANGE) else {
        return Ok(ByteRange { start: 0, end: body_len });
    };
    let value = value.to_str().map_err(|_| HttpError::bad_request("content-range header is not valid utf-8"))?;
    let spec = value.strip_prefix("bytes ").ok_or_else(|| HttpError::bad_request("unsupported content-range unit"))?;
    let (range_part, _total) = spec.split_once('/').ok_or_else(|| HttpError::bad_request("malformed content-range header"))?;
    let (start_str, end_str) = range_part.split_once('-').ok_or_else(|| HttpError::bad_request("malformed content-range header"))?;

    let start: u64 = start_str.parse().map_err(|_| HttpError::bad_request("malformed content-range header"))?;
    let inclusive_end: u64 = end_str.parse().map_err(|_| HttpError::bad_request("malformed content-range header"))?;
    let end = inclusive_end.saturating_add(1);

    if end - start != body_len {
        return Err(HttpError::bad_request("content-range span does not match body length"));
    }

    Ok(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::RANGE, value.parse().unwrap());
        headers
    }

    #[test]
    fn no_range_header_means_whole_image() {
        assert_eq!(parse_range_header(&HeaderMap::new(), 100).unwrap(), None);
    }

    #[test]
    fn inclusive_end_converts_to_exclusive() {
        let range = parse_range_header(&headers("bytes=10-19"), 100).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 10, end: 20 });
    }

    #[test]
    fn open_ended_range_goes_to_size() {
        let range = parse_range_header(&headers("bytes=90-"), 100).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 90, end: 100 });
    }

    #[test]
    fn suffix_range_counts_from_the_end() {
        let range = parse_range_header(&headers("bytes=-10"), 100).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 90, end: 100 });
    }

    #[test]
    fn range_past_size_is_rejected() {
        assert!(parse_range_header(&headers("bytes=50-150"), 100).is_err());
    }

    #[test]
    fn multi_range_is_rejected() {
        assert!(parse_range_header(&headers("bytes=0-9,20-29"), 100).is_err());
    }
}
