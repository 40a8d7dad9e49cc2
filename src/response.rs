use bytes::{Buf, Bytes, BytesMut};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::HeaderMap;
use log::trace;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 96;
/// Longest response head accepted before the blank line that ends it.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Result of one parse attempt over the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// Not enough bytes yet; nothing was consumed.
    Incomplete,
    Complete(T),
    /// Well-formed, but the peer refused.
    Rejected(String),
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub version: &'static str,
    pub status: u16,
    pub reason: String,
}

impl ConnectReply {
    pub fn status_line(&self) -> String {
        format!("{} {} {}", self.version, self.status, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub version: &'static str,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn status_line(&self) -> String {
        format!("{} {} {}", self.version, self.status, self.reason)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

struct Head {
    version: &'static str,
    status: u16,
    reason: String,
    headers: HeaderMap,
    /// Offset one past the blank line that ends the head.
    end: usize,
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

fn version_str(minor: Option<u8>) -> &'static str {
    match minor {
        Some(0) => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Parses the status line and headers of a head already known to be terminated.
fn parse_head(buf: &[u8], end: usize) -> Result<Head, String> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut raw_headers);
    match response.parse(&buf[..end]) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err("truncated response head".to_string()),
        Err(e) => return Err(format!("invalid response head: {}", e)),
    }

    let status = response.code.ok_or_else(|| "missing status code".to_string())?;
    let mut headers = HeaderMap::new();
    for header in response.headers.iter() {
        match (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_bytes(header.value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => trace!("skipping unrepresentable header {:?}", header.name),
        }
    }

    Ok(Head {
        version: version_str(response.version),
        status,
        reason: response.reason.unwrap_or("").to_string(),
        headers,
        end,
    })
}

/// Tries to read the proxy's answer to CONNECT from the front of `buf`.
///
/// On `Complete` exactly the header bytes are consumed; whatever follows
/// belongs to the target TLS layer and is left in `buf` untouched.
pub fn parse_connect_response(buf: &mut BytesMut) -> Parsed<ConnectReply> {
    let end = match find_header_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEAD_BYTES => {
            return Parsed::Malformed(format!("CONNECT reply head exceeds {} bytes", MAX_HEAD_BYTES))
        }
        None => return Parsed::Incomplete,
    };
    let head = match parse_head(buf, end) {
        Ok(head) => head,
        Err(detail) => return Parsed::Malformed(detail),
    };
    let reply = ConnectReply {
        version: head.version,
        status: head.status,
        reason: head.reason,
    };
    if !(200..300).contains(&reply.status) {
        return Parsed::Rejected(format!("{} {}", reply.status, reply.reason).trim_end().to_string());
    }
    buf.advance(head.end);
    Parsed::Complete(reply)
}

enum Framing {
    Chunked,
    Length(usize),
    Empty,
    UntilClose,
}

fn framing_of(head: &Head) -> Result<Framing, String> {
    let chunked = head
        .headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }
    if let Some(value) = head.headers.get(CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| "non-ASCII Content-Length".to_string())?;
        let length = text
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("invalid Content-Length {:?}", text))?;
        return Ok(Framing::Length(length));
    }
    if head.status == 204 || head.status == 304 {
        return Ok(Framing::Empty);
    }
    Ok(Framing::UntilClose)
}

/// Decodes a chunked body. `Ok(None)` means more bytes are needed.
/// On success returns the decoded body and the number of bytes it spanned.
fn decode_chunked(data: &[u8]) -> Result<Option<(Bytes, usize)>, String> {
    let mut body = BytesMut::new();
    let mut pos = 0;
    loop {
        let (size_len, size) = match httparse::parse_chunk_size(&data[pos..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err("invalid chunk size line".to_string()),
        };
        pos += size_len;

        if size == 0 {
            // Skip trailer fields up to the closing blank line.
            loop {
                match data[pos..].windows(2).position(|w| w == b"\r\n") {
                    None => return Ok(None),
                    Some(0) => return Ok(Some((body.freeze(), pos + 2))),
                    Some(line) => pos += line + 2,
                }
            }
        }

        let size = usize::try_from(size).map_err(|_| "chunk too large".to_string())?;
        let Some(frame_end) = pos.checked_add(size).and_then(|end| end.checked_add(2)) else {
            return Err("chunk too large".to_string());
        };
        let Some(frame) = data.get(pos..frame_end) else {
            return Ok(None);
        };
        let (chunk, crlf) = frame.split_at(size);
        if crlf != b"\r\n" {
            return Err("chunk data not followed by CRLF".to_string());
        }
        body.extend_from_slice(chunk);
        pos = frame_end;
    }
}

/// Tries to read the target's HTTP response from `buf`.
///
/// `eof` tells the parser the stream has ended, which completes a
/// close-delimited body and turns any other shortfall into `Malformed`.
/// Bytes are only consumed on `Complete`, so feeding the same stream in any
/// fragmentation yields the same outcome.
pub fn parse_http_response(buf: &mut BytesMut, eof: bool) -> Parsed<HttpResponse> {
    let mut offset = 0;
    let head = loop {
        let end = match find_header_end(&buf[offset..]) {
            Some(end) => offset + end,
            None if eof => {
                return Parsed::Malformed(
                    "connection closed before the response head was complete".to_string(),
                )
            }
            None if buf.len() - offset > MAX_HEAD_BYTES => {
                return Parsed::Malformed(format!("response head exceeds {} bytes", MAX_HEAD_BYTES))
            }
            None => return Parsed::Incomplete,
        };
        let head = match parse_head(&buf[offset..], end - offset) {
            Ok(mut head) => {
                head.end = end;
                head
            }
            Err(detail) => return Parsed::Malformed(detail),
        };
        // Interim 1xx heads precede the real response.
        if (100..200).contains(&head.status) && head.status != 101 {
            trace!("skipping interim response {}", head.status);
            offset = end;
            continue;
        }
        break head;
    };

    if !(200..300).contains(&head.status) {
        return Parsed::Rejected(
            format!("{} {} {}", head.version, head.status, head.reason)
                .trim_end()
                .to_string(),
        );
    }

    let framing = match framing_of(&head) {
        Ok(framing) => framing,
        Err(detail) => return Parsed::Malformed(detail),
    };
    let available = &buf[head.end..];
    let (body, consumed) = match framing {
        Framing::Chunked => match decode_chunked(available) {
            Ok(Some((body, used))) => (body, head.end + used),
            Ok(None) if eof => {
                return Parsed::Malformed(
                    "connection closed in the middle of a chunked body".to_string(),
                )
            }
            Ok(None) => return Parsed::Incomplete,
            Err(detail) => return Parsed::Malformed(detail),
        },
        Framing::Length(length) if available.len() < length => {
            if eof {
                return Parsed::Malformed(format!(
                    "connection closed after {} of {} body bytes",
                    available.len(),
                    length
                ));
            }
            return Parsed::Incomplete;
        }
        Framing::Length(length) => (
            Bytes::copy_from_slice(&available[..length]),
            head.end + length,
        ),
        Framing::Empty => (Bytes::new(), head.end),
        Framing::UntilClose if eof => (Bytes::copy_from_slice(available), buf.len()),
        Framing::UntilClose => return Parsed::Incomplete,
    };

    buf.advance(consumed);
    Parsed::Complete(HttpResponse {
        version: head.version,
        status: head.status,
        reason: head.reason,
        headers: head.headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    /// Feeds `stream` in pieces of `step` bytes and returns the first non-incomplete outcome.
    fn feed_http(stream: &[u8], step: usize, eof_at_end: bool) -> Parsed<HttpResponse> {
        let mut buf = BytesMut::new();
        for piece in stream.chunks(step) {
            buf.extend_from_slice(piece);
            match parse_http_response(&mut buf, false) {
                Parsed::Incomplete => continue,
                other => return other,
            }
        }
        if eof_at_end {
            parse_http_response(&mut buf, true)
        } else {
            Parsed::Incomplete
        }
    }

    #[test]
    fn connect_established_consumes_exactly_the_head() {
        let mut buf = buffer(b"HTTP/1.1 200 Connection Established\r\n\r\n");
        match parse_connect_response(&mut buf) {
            Parsed::Complete(reply) => {
                assert_eq!(reply.status, 200);
                assert_eq!(reply.status_line(), "HTTP/1.1 200 Connection Established");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn connect_tolerates_http10_and_leaves_trailing_bytes() {
        let mut buf = buffer(b"HTTP/1.0 200 Connection established\r\nProxy-Agent: x\r\n\r\n\x16\x03\x01");
        match parse_connect_response(&mut buf) {
            Parsed::Complete(reply) => assert_eq!(reply.version, "HTTP/1.0"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(&buf[..], b"\x16\x03\x01");
    }

    #[test]
    fn connect_auth_required_is_rejected() {
        let mut buf = buffer(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n");
        assert_eq!(
            parse_connect_response(&mut buf),
            Parsed::Rejected("407 Proxy Authentication Required".to_string())
        );
    }

    #[test]
    fn connect_waits_for_terminator() {
        let mut buf = buffer(b"HTTP/1.1 200 Connection Established\r\n");
        assert_eq!(parse_connect_response(&mut buf), Parsed::Incomplete);
        assert_eq!(buf.len(), 37);
    }

    #[test]
    fn connect_garbage_is_malformed() {
        let mut buf = buffer(b"SSH-2.0-OpenSSH\r\n\r\n");
        assert!(matches!(parse_connect_response(&mut buf), Parsed::Malformed(_)));
    }

    #[test]
    fn content_length_body_across_two_fragments() {
        let mut buf = buffer(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhe");
        assert_eq!(parse_http_response(&mut buf, false), Parsed::Incomplete);
        buf.extend_from_slice(b"llo");
        match parse_http_response(&mut buf, false) {
            Parsed::Complete(resp) => assert_eq!(&resp.body[..], b"hello"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn content_length_is_case_insensitive() {
        let mut buf = buffer(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok");
        assert!(matches!(parse_http_response(&mut buf, false), Parsed::Complete(_)));
    }

    #[test]
    fn one_byte_at_a_time_matches_single_chunk() {
        let streams: [&[u8]; 4] = [
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\nhello world",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n",
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc",
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
        ];
        for stream in streams {
            let whole = feed_http(stream, stream.len(), true);
            let bytewise = feed_http(stream, 1, true);
            assert_eq!(whole, bytewise);
            assert!(!matches!(whole, Parsed::Incomplete | Parsed::Malformed(_)));
        }
    }

    #[test]
    fn chunked_body_is_decoded() {
        let stream = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n";
        match feed_http(stream, 7, false) {
            Parsed::Complete(resp) => assert_eq!(&resp.body[..], b"hello world"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_chunk_size_is_malformed() {
        let mut buf = buffer(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
        assert!(matches!(parse_http_response(&mut buf, false), Parsed::Malformed(_)));
    }

    #[test]
    fn oversized_chunk_size_is_malformed() {
        let mut buf = buffer(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffed\r\nx",
        );
        assert_eq!(
            parse_http_response(&mut buf, false),
            Parsed::Malformed("chunk too large".to_string())
        );
        let mut buf = buffer(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nx",
        );
        assert!(matches!(parse_http_response(&mut buf, false), Parsed::Malformed(_)));
    }

    #[test]
    fn chunk_without_trailing_crlf_is_malformed() {
        let mut buf = buffer(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabXY0\r\n\r\n");
        assert!(matches!(parse_http_response(&mut buf, false), Parsed::Malformed(_)));
    }

    #[test]
    fn endless_head_is_malformed() {
        let mut stream = b"HTTP/1.1 200 OK\r\n".to_vec();
        while stream.len() <= MAX_HEAD_BYTES {
            stream.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        let mut buf = buffer(&stream);
        assert!(matches!(parse_http_response(&mut buf, false), Parsed::Malformed(_)));
        let mut buf = buffer(&stream);
        assert!(matches!(parse_connect_response(&mut buf), Parsed::Malformed(_)));

        let mut buf = buffer(&stream[..1024]);
        assert_eq!(parse_http_response(&mut buf, false), Parsed::Incomplete);
    }

    #[test]
    fn non_2xx_is_rejected() {
        let mut buf = buffer(b"HTTP/1.1 503 Service Unavailable\r\n\r\n");
        assert_eq!(
            parse_http_response(&mut buf, false),
            Parsed::Rejected("HTTP/1.1 503 Service Unavailable".to_string())
        );
    }

    #[test]
    fn close_delimited_body_completes_at_eof() {
        let mut buf = buffer(b"HTTP/1.0 200 OK\r\nContent-Type: text/html\r\n\r\n<html>");
        assert_eq!(parse_http_response(&mut buf, false), Parsed::Incomplete);
        buf.extend_from_slice(b"</html>");
        match parse_http_response(&mut buf, true) {
            Parsed::Complete(resp) => {
                assert_eq!(&resp.body[..], b"<html></html>");
                assert_eq!(resp.content_type(), Some("text/html"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn short_body_at_eof_is_malformed() {
        let mut buf = buffer(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        assert_eq!(
            parse_http_response(&mut buf, true),
            Parsed::Malformed("connection closed after 3 of 10 body bytes".to_string())
        );
    }

    #[test]
    fn no_content_needs_no_body() {
        let mut buf = buffer(b"HTTP/1.1 204 No Content\r\n\r\n");
        match parse_http_response(&mut buf, false) {
            Parsed::Complete(resp) => assert!(resp.body.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn headless_eof_is_malformed() {
        let mut buf = buffer(b"HTTP/1.1 200 OK\r\nContent-Le");
        assert!(matches!(parse_http_response(&mut buf, true), Parsed::Malformed(_)));
    }
}
