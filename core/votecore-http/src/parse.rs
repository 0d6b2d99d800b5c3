//! Incremental HTTP/1.x request-line-and-headers parser, grounded in
//! `parse_request()`: handed a growing byte buffer plus the offsets of
//! every CRLF already seen, it resumes scanning from the last one instead
//! of rescanning from byte zero on every call.

use std::fmt;

/// A 32 KiB header cap, same bound as the original's use of an `i16` offset
/// array to track CRLF positions (`i16::MAX`, rounded down to a friendly
/// number of bits).
pub const MAX_HEADER_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub version: Version,
    pub keep_alive: bool,
    /// Byte offset just past the blank line terminating the headers; body
    /// bytes (if any) start here in the buffer that was parsed.
    pub header_end: usize,
}

/// Mirrors the original's small fixed set of rejections: a malformed
/// request line is a `400`, an unsupported method a `501`, a bad version a
/// `505`, and an oversized header block a `413`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    BadRequest,
    NotImplemented,
    HttpVersionNotSupported,
    PayloadTooLarge,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (code, text) = self.status();
        write!(f, "{} {}", code, text)
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            ParseError::BadRequest => (400, "Bad Request"),
            ParseError::NotImplemented => (501, "Not Implemented"),
            ParseError::HttpVersionNotSupported => (505, "HTTP Version Not Supported"),
            ParseError::PayloadTooLarge => (413, "Payload Too Large"),
        }
    }
}

/// Parser state carried across calls as more bytes arrive on the socket.
pub struct Parser {
    /// Byte offsets of every `\r\n` found so far.
    crlf_offsets: Vec<usize>,
    scanned_up_to: usize,
}

pub enum Outcome {
    Incomplete,
    Complete(Request),
    Error(ParseError),
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            crlf_offsets: Vec::new(),
            scanned_up_to: 0,
        }
    }

    /// Feed the full buffer received so far (not just new bytes) and get
    /// back whether a full header block is now available.
    pub fn feed(&mut self, buf: &[u8]) -> Outcome {
        // Checked against total buffered size before anything else, the
        // same order the original cap check runs in: ahead of even
        // attempting to find the terminating blank line.
        if buf.len() > MAX_HEADER_BYTES {
            return Outcome::Error(ParseError::PayloadTooLarge);
        }

        self.scan_for_crlf(buf);

        let header_end = match self.find_blank_line() {
            Some(i) => i,
            None => return Outcome::Incomplete,
        };

        match parse_headers(buf, &self.crlf_offsets, header_end) {
            Ok(request) => Outcome::Complete(request),
            Err(e) => Outcome::Error(e),
        }
    }

    fn scan_for_crlf(&mut self, buf: &[u8]) {
        let mut i = self.scanned_up_to;
        while i + 1 < buf.len() {
            if buf[i] == b'\r' && buf[i + 1] == b'\n' {
                self.crlf_offsets.push(i);
                i += 2;
            } else {
                i += 1;
            }
        }
        self.scanned_up_to = i;
    }

    /// A blank line is two consecutive CRLFs with nothing between them.
    fn find_blank_line(&self) -> Option<usize> {
        self.crlf_offsets
            .windows(2)
            .find(|w| w[0] + 2 == w[1])
            .map(|w| w[1] + 2)
    }

}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

const PATH_CHARS: &[u8] = b"-._~/,+";

fn is_path_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || PATH_CHARS.contains(&b)
}

fn parse_headers(
    buf: &[u8],
    crlf_offsets: &[usize],
    header_end: usize,
) -> Result<Request, ParseError> {
    let mut lines = Vec::new();
    let mut start = 0;
    for &crlf in crlf_offsets {
        if crlf >= header_end {
            break;
        }
        lines.push(&buf[start..crlf]);
        start = crlf + 2;
    }

    let request_line = lines.first().ok_or(ParseError::BadRequest)?;
    let (raw_path, version) = parse_request_line(request_line)?;
    let (path, query) = parse_path_and_query(raw_path)?;

    let mut keep_alive = matches!(version, Version::Http11);
    for line in &lines[1..] {
        let lower: Vec<u8> = line.iter().map(|b| b.to_ascii_lowercase()).collect();
        if let Some(rest) = lower.strip_prefix(b"connection:") {
            let value = std::str::from_utf8(rest).unwrap_or("").trim();
            keep_alive = value != "close";
            break;
        }
    }

    Ok(Request {
        path,
        query,
        version,
        keep_alive,
        header_end,
    })
}

fn parse_request_line(line: &[u8]) -> Result<(&[u8], Version), ParseError> {
    let line = line
        .strip_prefix(b"GET ")
        .ok_or(ParseError::NotImplemented)?;

    let sp = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ParseError::BadRequest)?;
    let (raw_path, rest) = (&line[..sp], &line[sp + 1..]);
    if raw_path.is_empty() {
        return Err(ParseError::BadRequest);
    }
    // A well-formed request line has exactly one more token after the path:
    // the version. A stray space in `rest` means the path itself contained
    // an unencoded space and the line has too many tokens.
    if rest.contains(&b' ') {
        return Err(ParseError::BadRequest);
    }

    let version = match rest {
        b"HTTP/1.0" => Version::Http10,
        b"HTTP/1.1" => Version::Http11,
        _ => return Err(ParseError::HttpVersionNotSupported),
    };

    Ok((raw_path, version))
}

/// Parse `path?query`. A malformed path is a hard `400`; a malformed query
/// on an otherwise-good path is swallowed and the path is used alone, per
/// the original's leniency rule ("if managed to parse a path... disregard
/// the query string").
fn parse_path_and_query(raw: &[u8]) -> Result<(String, Vec<(String, String)>), ParseError> {
    let q_index = raw.iter().position(|&b| b == b'?');
    let path_bytes = match q_index {
        Some(i) => &raw[..i],
        None => raw,
    };

    let path = percent_decode_path(path_bytes)?;

    let query = match q_index {
        Some(i) => parse_query(&raw[i + 1..]).unwrap_or_default(),
        None => Vec::new(),
    };

    Ok((path, query))
}

fn percent_decode_path(bytes: &[u8]) -> Result<String, ParseError> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let hi = hex_value(*bytes.get(i + 1).ok_or(ParseError::BadRequest)?)
                .ok_or(ParseError::BadRequest)?;
            let lo = hex_value(*bytes.get(i + 2).ok_or(ParseError::BadRequest)?)
                .ok_or(ParseError::BadRequest)?;
            out.push(hi * 16 + lo);
            i += 3;
        } else if is_path_char(b) {
            out.push(b);
            i += 1;
        } else {
            return Err(ParseError::BadRequest);
        }
    }
    String::from_utf8(out).map_err(|_| ParseError::BadRequest)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_query(bytes: &[u8]) -> Option<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for field in bytes.split(|&b| b == b'&') {
        if field.is_empty() {
            continue;
        }
        let eq = field.iter().position(|&b| b == b'=')?;
        let key = percent_decode_query_component(&field[..eq])?;
        let value = percent_decode_query_component(&field[eq + 1..])?;
        pairs.push((key, value));
    }
    Some(pairs)
}

fn percent_decode_query_component(bytes: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_value(*bytes.get(i + 1)?)?;
                let lo = hex_value(*bytes.get(i + 2)?)?;
                out.push(hi * 16 + lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_once(req: &str) -> Outcome {
        Parser::new().feed(req.as_bytes())
    }

    #[test]
    fn simple_get_request() {
        match parse_once("GET /index.html HTTP/1.1\r\nHost: example\r\n\r\n") {
            Outcome::Complete(r) => {
                assert_eq!(r.path, "/index.html");
                assert!(r.keep_alive);
                assert_eq!(r.version, Version::Http11);
            }
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn query_string_is_parsed_in_order() {
        match parse_once("GET /search?q=rust&page=2 HTTP/1.1\r\n\r\n") {
            Outcome::Complete(r) => {
                assert_eq!(r.path, "/search");
                assert_eq!(
                    r.query,
                    vec![("q".to_string(), "rust".to_string()), ("page".to_string(), "2".to_string())]
                );
            }
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn malformed_query_falls_back_to_path_only() {
        match parse_once("GET /search?garbled%%bytes HTTP/1.1\r\n\r\n") {
            Outcome::Complete(r) => {
                assert_eq!(r.path, "/search");
                assert!(r.query.is_empty());
            }
            _ => panic!("expected a complete request despite the bad query"),
        }
    }

    #[test]
    fn malformed_path_is_bad_request() {
        match parse_once("GET /bad path HTTP/1.1\r\n\r\n") {
            Outcome::Error(ParseError::BadRequest) => {}
            other => panic!("expected BadRequest, got something else entirely: {:?}", other.is_err_variant()),
        }
    }

    #[test]
    fn non_get_method_is_not_implemented() {
        match parse_once("POST /x HTTP/1.1\r\n\r\n") {
            Outcome::Error(ParseError::NotImplemented) => {}
            _ => panic!("expected NotImplemented"),
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        match parse_once("GET / HTTP/2.0\r\n\r\n") {
            Outcome::Error(ParseError::HttpVersionNotSupported) => {}
            _ => panic!("expected HttpVersionNotSupported"),
        }
    }

    #[test]
    fn http_1_0_defaults_to_close() {
        match parse_once("GET / HTTP/1.0\r\n\r\n") {
            Outcome::Complete(r) => assert!(!r.keep_alive),
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn connection_close_overrides_1_1_default() {
        match parse_once("GET / HTTP/1.1\r\nConnection: close\r\n\r\n") {
            Outcome::Complete(r) => assert!(!r.keep_alive),
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn incomplete_request_waits_for_more_bytes() {
        match parse_once("GET /index.html HTTP/1.1\r\nHost: example\r\n") {
            Outcome::Incomplete => {}
            _ => panic!("expected Incomplete"),
        }
    }

    #[test]
    fn oversized_headers_are_rejected() {
        let mut req = "GET / HTTP/1.1\r\n".to_string();
        req.push_str(&"X-Pad: ".repeat(1));
        req.push_str(&"a".repeat(MAX_HEADER_BYTES + 1));
        req.push_str("\r\n\r\n");
        match parse_once(&req) {
            Outcome::Error(ParseError::PayloadTooLarge) => {}
            other => panic!("expected PayloadTooLarge, got {:?}", other.is_err_variant()),
        }
    }

    #[test]
    fn percent_decoding_round_trips() {
        match parse_once("GET /a%20b%2Fc HTTP/1.1\r\n\r\n") {
            Outcome::Complete(r) => assert_eq!(r.path, "/a b/c"),
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn incremental_feed_resumes_from_last_scan_point() {
        let mut parser = Parser::new();
        let first = b"GET / HTTP/1.1\r\nHost: ex".to_vec();
        assert!(matches!(parser.feed(&first), Outcome::Incomplete));
        let mut second = first;
        second.extend_from_slice(b"ample\r\n\r\n");
        assert!(matches!(parser.feed(&second), Outcome::Complete(_)));
    }

    // Small helper so assertion messages above can print something sane
    // without requiring Outcome/Request to implement Debug end-to-end.
    impl Outcome {
        fn is_err_variant(&self) -> &'static str {
            match self {
                Outcome::Incomplete => "Incomplete",
                Outcome::Complete(_) => "Complete",
                Outcome::Error(_) => "Error",
            }
        }
    }
}
