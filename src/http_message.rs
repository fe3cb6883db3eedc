//! Serialization of proxied HTTP/1.1 messages.
//!
//! Requests are dumped to raw bytes before travelling through a tunnel;
//! responses come back as raw bytes and are parsed with `httparse`.

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::request::Parts;
use thiserror::Error;

const MAX_HEADERS: usize = 100;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("incomplete response head")]
    Incomplete,

    #[error("invalid response head: {0}")]
    Invalid(#[from] httparse::Error),

    #[error("invalid content-length: {0}")]
    ContentLength(String),

    #[error("body truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid chunked body")]
    Chunked,
}

/// A relayed HTTP response split into its parts
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl ParsedResponse {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

/// Serialize a request the way it would appear on the wire
pub fn dump_request(parts: &Parts, body: &[u8]) -> Vec<u8> {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(parts.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let host = parts
        .headers
        .get(HOST)
        .map(|h| h.as_bytes().to_vec())
        .or_else(|| parts.uri.authority().map(|a| a.as_str().as_bytes().to_vec()));
    if let Some(host) = host {
        push_header(&mut out, "Host", &host);
    }

    for (name, value) in parts.headers.iter() {
        if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        push_header(&mut out, name.as_str(), value.as_bytes());
    }

    if !body.is_empty() || parts.headers.contains_key(CONTENT_LENGTH) {
        let length = body.len().to_string();
        push_header(&mut out, "Content-Length", length.as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

/// Parse a complete HTTP/1.x response
pub fn parse_response(data: &[u8]) -> Result<ParsedResponse, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let header_len = match resp.parse(data)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(ParseError::Incomplete),
    };

    let status = resp.code.ok_or(ParseError::Incomplete)?;
    let reason = resp.reason.unwrap_or("").to_string();

    let mut content_length = None;
    let mut chunked = false;
    let mut parsed_headers = Vec::with_capacity(resp.headers.len());
    for header in resp.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let value = String::from_utf8_lossy(header.value);
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::ContentLength(value.to_string()))?;
            content_length = Some(len);
        }
        if header.name.eq_ignore_ascii_case("transfer-encoding")
            && String::from_utf8_lossy(header.value)
                .to_ascii_lowercase()
                .contains("chunked")
        {
            chunked = true;
        }
        parsed_headers.push((header.name.to_string(), header.value.to_vec()));
    }

    let rest = &data[header_len..];
    let body = if matches!(status, 100..=199 | 204 | 304) {
        Vec::new()
    } else if chunked {
        decode_chunked(rest)?
    } else if let Some(expected) = content_length {
        if rest.len() < expected {
            return Err(ParseError::Truncated {
                expected,
                actual: rest.len(),
            });
        }
        rest[..expected].to_vec()
    } else {
        rest.to_vec()
    };

    Ok(ParsedResponse {
        status,
        reason,
        headers: parsed_headers,
        body: body.into(),
    })
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut body = Vec::new();
    loop {
        let (offset, size) = match httparse::parse_chunk_size(data) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            _ => return Err(ParseError::Chunked),
        };
        data = &data[offset..];
        if size == 0 {
            // trailers are dropped
            return Ok(body);
        }

        let size = usize::try_from(size).map_err(|_| ParseError::Chunked)?;
        if data.len() < size + 2 || &data[size..size + 2] != b"\r\n" {
            return Err(ParseError::Chunked);
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn test_dump_request() {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("/api/items?limit=5")
            .header("Host", "svc.test.loc")
            .header("X-Trace", "abc")
            .header("Transfer-Encoding", "chunked")
            .body(())
            .unwrap()
            .into_parts();

        let dump = dump_request(&parts, b"hello");
        let text = String::from_utf8(dump).unwrap();
        assert!(text.starts_with("POST /api/items?limit=5 HTTP/1.1\r\nHost: svc.test.loc\r\n"));
        assert!(text.contains("x-trace: abc\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(text.ends_with("Content-Length: 5\r\n\r\nhello"));
    }

    #[test]
    fn test_dump_request_round_trips_through_httparse() {
        let (parts, _) = Request::builder()
            .uri("/")
            .header("Host", "a.test.loc")
            .body(())
            .unwrap()
            .into_parts();
        let dump = dump_request(&parts, b"");

        let mut headers = [httparse::EMPTY_HEADER; 8];
        let mut req = httparse::Request::new(&mut headers);
        assert!(req.parse(&dump).unwrap().is_complete());
        assert_eq!(req.method, Some("GET"));
        assert_eq!(req.path, Some("/"));
    }

    #[test]
    fn test_parse_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nX-Test: 1\r\nContent-Length: 5\r\n\r\nhello";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.header("x-test"), Some(&b"1"[..]));
        assert_eq!(&resp.body[..], b"hello");
    }

    #[test]
    fn test_parse_chunked() {
        let raw = b"HTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(&resp.body[..], b"Wikipedia");
    }

    #[test]
    fn test_parse_reads_to_end_without_length() {
        let resp = parse_response(b"HTTP/1.0 200 OK\r\n\r\nraw body").unwrap();
        assert_eq!(&resp.body[..], b"raw body");
    }

    #[test]
    fn test_parse_no_body_status() {
        let resp = parse_response(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n").unwrap();
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort"),
            Err(ParseError::Truncated { expected: 10, actual: 5 })
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\n"),
            Err(ParseError::Incomplete)
        ));
        assert!(matches!(
            parse_response(b"not http at all\r\n\r\n"),
            Err(ParseError::Invalid(_))
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"),
            Err(ParseError::Chunked)
        ));
    }
}
