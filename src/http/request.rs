//! Incremental HTTP/1.1 request-line + header + body parser.
//!
//! `continue_to_parse` is resumable: a connection's `recv_buf` fills across
//! many readiness wake-ups, and this parser picks up from wherever it left
//! off rather than re-scanning from byte 0. Slices already recovered from the
//! buffer are stored as `(offset, len)` pairs rather than raw pointers, so
//! growing `recv_buf` (which may reallocate) never invalidates them — unlike
//! a pointer-based slice, an offset is still correct after the backing
//! allocation moves. This is why `continue_to_parse` takes `&Buffer` rather
//! than requiring a rebase step after every append.
//!
//! Percent-decoding the request target and query string produces bytes
//! strictly shorter than (or equal to) their source span, but since this
//! parser only ever reads `recv_buf` (never writes it), the decoded path and
//! query pairs are held as owned `Vec<u8>` rather than written back in
//! place. Header names/values and the body aren't decoded, so those stay as
//! offset/len views into the shared buffer.

use crate::http::method::HttpMethod;

/// An `(offset, len)` view into a connection's `recv_buf`.
pub type Slice = (usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Initial,
    UriDone,
    HeadersDone,
    BodyDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The request line, headers, and (if any) body have all been parsed.
    /// `consumed` is the total byte count from the start of the request to
    /// consume out of `recv_buf` via `erase_front`.
    Complete { consumed: usize },
    /// Not enough bytes buffered yet; call again once more data arrives.
    NeedMore,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported or unrecognized HTTP method")]
    UnsupportedMethod,
    #[error("request target must start with '/'")]
    BadTarget,
    #[error("query string has an empty key")]
    EmptyQueryKey,
    #[error("malformed header line")]
    BadHeaderLine,
    #[error("header name or value is empty")]
    EmptyHeaderField,
    #[error("NUL byte encountered before a line terminator")]
    NulInLine,
    #[error("Content-Length must be a non-negative integer")]
    BadContentLength,
    #[error("Content-Length of {0} bytes exceeds the 10,000,000 byte limit")]
    BodyTooLarge(usize),
}

const MAX_CONTENT_LENGTH: usize = 10_000_000;

pub struct HttpRequest {
    state: ParseState,
    method: Option<HttpMethod>,
    path: Vec<u8>,
    query: Vec<(Vec<u8>, Vec<u8>)>,
    headers: Vec<(Slice, Slice)>,
    hostname: Option<Slice>,
    content_length: usize,
    content_length_known: bool,
    body: Option<Slice>,
    cursor: usize,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::Initial,
            method: None,
            path: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
            hostname: None,
            content_length: 0,
            content_length_known: false,
            body: None,
            cursor: 0,
        }
    }

    pub fn method(&self) -> Option<HttpMethod> {
        self.method
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn query_value(&self, key: &str) -> Option<&[u8]> {
        self.query
            .binary_search_by(|(k, _)| k.as_slice().cmp(key.as_bytes()))
            .ok()
            .map(|i| self.query[i].1.as_slice())
    }

    pub fn query_pairs(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.query
    }

    pub fn header_value<'a>(&self, buf: &'a [u8], key: &str) -> Option<&'a [u8]> {
        self.find_header_index(buf, key)
            .map(|i| slice(buf, self.headers[i].1))
    }

    pub fn hostname<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        self.hostname.map(|s| slice(buf, s))
    }

    pub fn body<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        self.body.map(|s| slice(buf, s)).unwrap_or(&[])
    }

    /// Total bytes of this request (request line through body) consumed out
    /// of `recv_buf` so far. Once `Complete` is returned this is the full
    /// request length; the caller erases exactly this many bytes.
    pub fn consumed(&self) -> usize {
        self.cursor
    }

    pub fn continue_to_parse(&mut self, buf: &[u8]) -> Result<ParseOutcome, ParseError> {
        loop {
            match self.state {
                ParseState::Initial => match self.parse_request_line(buf)? {
                    true => self.state = ParseState::UriDone,
                    false => return Ok(ParseOutcome::NeedMore),
                },
                ParseState::UriDone => match self.parse_headers(buf)? {
                    true => self.state = ParseState::HeadersDone,
                    false => return Ok(ParseOutcome::NeedMore),
                },
                ParseState::HeadersDone => match self.parse_body(buf)? {
                    true => {
                        self.state = ParseState::BodyDone;
                        return Ok(ParseOutcome::Complete {
                            consumed: self.cursor,
                        });
                    }
                    false => return Ok(ParseOutcome::NeedMore),
                },
                ParseState::BodyDone => {
                    return Ok(ParseOutcome::Complete {
                        consumed: self.cursor,
                    })
                }
            }
        }
    }

    fn parse_request_line(&mut self, buf: &[u8]) -> Result<bool, ParseError> {
        let (line_len, total) = match scan_line(&buf[self.cursor..])? {
            None => return Ok(false),
            Some(v) => v,
        };
        let line_start = self.cursor;
        let line = &buf[line_start..line_start + line_len];

        let fields = split_fields(line).ok_or(ParseError::BadRequestLine)?;
        let (m_start, m_end) = fields[0];
        let (t_start, t_end) = fields[1];

        let method_str =
            std::str::from_utf8(&line[m_start..m_end]).map_err(|_| ParseError::UnsupportedMethod)?;
        self.method = Some(HttpMethod::parse(method_str).ok_or(ParseError::UnsupportedMethod)?);

        if t_end <= t_start || line[t_start] != b'/' {
            return Err(ParseError::BadTarget);
        }
        let target = &line[t_start..t_end];
        let query_sep = target.iter().position(|&b| b == b'?');
        let (path_raw, query_raw) = match query_sep {
            Some(pos) => (&target[..pos], &target[pos + 1..]),
            None => (target, &b""[..]),
        };

        self.path = percent_decode(path_raw);
        self.query = if query_sep.is_some() {
            parse_query_owned(query_raw)?
        } else {
            Vec::new()
        };

        self.cursor += total;
        Ok(true)
    }

    fn parse_headers(&mut self, buf: &[u8]) -> Result<bool, ParseError> {
        loop {
            let (line_len, total) = match scan_line(&buf[self.cursor..])? {
                None => return Ok(false),
                Some(v) => v,
            };
            let line_start = self.cursor;

            if line_len == 0 {
                self.cursor += total;
                self.headers
                    .sort_by(|a, b| ascii_lower(slice(buf, a.0)).cmp(&ascii_lower(slice(buf, b.0))));
                self.extract_hostname(buf);
                return Ok(true);
            }

            let line = &buf[line_start..line_start + line_len];
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(ParseError::BadHeaderLine)?;
            if colon == 0 {
                return Err(ParseError::EmptyHeaderField);
            }
            let key: Slice = (line_start, colon);

            let mut v_start = colon + 1;
            let mut v_end = line_len;
            while v_start < v_end && matches!(line[v_start], b' ' | b'\t') {
                v_start += 1;
            }
            while v_end > v_start && matches!(line[v_end - 1], b' ' | b'\t') {
                v_end -= 1;
            }
            if v_start == v_end {
                return Err(ParseError::EmptyHeaderField);
            }
            let value: Slice = (line_start + v_start, v_end - v_start);

            self.headers.push((key, value));
            self.cursor += total;
        }
    }

    fn parse_body(&mut self, buf: &[u8]) -> Result<bool, ParseError> {
        if !self.content_length_known {
            self.content_length = match self.header_value(buf, "Content-Length") {
                Some(v) => {
                    let s = std::str::from_utf8(v).map_err(|_| ParseError::BadContentLength)?;
                    let n: i64 = s.trim().parse().map_err(|_| ParseError::BadContentLength)?;
                    if n < 0 {
                        return Err(ParseError::BadContentLength);
                    }
                    let n = n as usize;
                    if n > MAX_CONTENT_LENGTH {
                        return Err(ParseError::BodyTooLarge(n));
                    }
                    n
                }
                None => 0,
            };
            self.content_length_known = true;
        }

        if buf.len() - self.cursor < self.content_length {
            return Ok(false);
        }

        self.body = Some((self.cursor, self.content_length));
        self.cursor += self.content_length;
        Ok(true)
    }

    fn find_header_index(&self, buf: &[u8], key: &str) -> Option<usize> {
        let key_lower = key.as_bytes().to_ascii_lowercase();
        self.headers
            .binary_search_by(|(k, _)| ascii_lower(slice(buf, *k)).cmp(&key_lower))
            .ok()
    }

    fn extract_hostname(&mut self, buf: &[u8]) {
        if let Some(idx) = self.find_header_index(buf, "Host") {
            let value = self.headers[idx].1;
            let raw = slice(buf, value);
            let host_len = raw.iter().position(|&b| b == b':').unwrap_or(raw.len());
            self.hostname = Some((value.0, host_len));
        }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn slice(buf: &[u8], s: Slice) -> &[u8] {
    &buf[s.0..s.0 + s.1]
}

fn ascii_lower(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(u8::to_ascii_lowercase).collect()
}

/// Scan for `\n`; a NUL byte encountered before it is a fatal parse error.
/// An optional preceding `\r` is consumed as part of the line terminator but
/// excluded from the returned line length. Returns `(line_len, total_consumed)`.
fn scan_line(data: &[u8]) -> Result<Option<(usize, usize)>, ParseError> {
    for (i, &b) in data.iter().enumerate() {
        if b == 0 {
            return Err(ParseError::NulInLine);
        }
        if b == b'\n' {
            let has_cr = i > 0 && data[i - 1] == b'\r';
            let line_len = if has_cr { i - 1 } else { i };
            return Ok(Some((line_len, i + 1)));
        }
    }
    Ok(None)
}

/// Splits a request line into exactly three whitespace-separated fields
/// (method, target, version), rejecting anything with fewer or more.
fn split_fields(line: &[u8]) -> Option<[(usize, usize); 3]> {
    let mut fields = [(0usize, 0usize); 3];
    let mut i = 0;
    for field in fields.iter_mut() {
        while i < line.len() && matches!(line[i], b' ' | b'\t') {
            i += 1;
        }
        if i >= line.len() {
            return None;
        }
        let start = i;
        while i < line.len() && !matches!(line[i], b' ' | b'\t') {
            i += 1;
        }
        *field = (start, i);
    }
    while i < line.len() && matches!(line[i], b' ' | b'\t') {
        i += 1;
    }
    if i != line.len() {
        return None;
    }
    Some(fields)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn parse_query_owned(raw: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ParseError> {
    let mut pairs = Vec::new();
    for raw_pair in raw.split(|&b| b == b'&') {
        if raw_pair.is_empty() {
            continue;
        }
        let eq = raw_pair.iter().position(|&b| b == b'=');
        let (k, v) = match eq {
            Some(pos) => (&raw_pair[..pos], &raw_pair[pos + 1..]),
            None => (&raw_pair[..], &b""[..]),
        };
        if k.is_empty() {
            return Err(ParseError::EmptyQueryKey);
        }
        pairs.push((percent_decode(k), percent_decode(v)));
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_in_one_shot() {
        let mut req = HttpRequest::new();
        let buf = b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let outcome = req.continue_to_parse(buf).unwrap();
        assert_eq!(outcome, ParseOutcome::Complete { consumed: buf.len() });
        assert_eq!(req.method(), Some(HttpMethod::Get));
        assert_eq!(req.path(), b"/hello");
        assert_eq!(req.hostname(buf), Some(&b"example.com"[..]));
    }

    #[test]
    fn needs_more_when_split_mid_request_line() {
        let mut req = HttpRequest::new();
        let partial = b"GET /hello HTTP/1.1\r\n";
        assert_eq!(
            req.continue_to_parse(partial).unwrap(),
            ParseOutcome::NeedMore
        );
        let full = b"GET /hello HTTP/1.1\r\nHost: h\r\n\r\n";
        assert_eq!(
            req.continue_to_parse(full).unwrap(),
            ParseOutcome::Complete { consumed: full.len() }
        );
    }

    #[test]
    fn splits_and_sorts_query_vars() {
        let mut req = HttpRequest::new();
        let buf = b"GET /s?b=2&a=1&c=%68%69 HTTP/1.1\r\n\r\n";
        req.continue_to_parse(buf).unwrap();
        assert_eq!(req.query_value("a"), Some(&b"1"[..]));
        assert_eq!(req.query_value("c"), Some(&b"hi"[..]));
        let keys: Vec<_> = req.query_pairs().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn percent_decodes_path() {
        let mut req = HttpRequest::new();
        let buf = b"GET /a%20b HTTP/1.1\r\n\r\n";
        req.continue_to_parse(buf).unwrap();
        assert_eq!(req.path(), b"/a b");
    }

    #[test]
    fn headers_are_sorted_case_insensitively() {
        let mut req = HttpRequest::new();
        let buf = b"GET / HTTP/1.1\r\nX-Zeta: z\r\nAccept: */*\r\ncontent-length: 0\r\n\r\n";
        req.continue_to_parse(buf).unwrap();
        assert_eq!(req.header_value(buf, "accept"), Some(&b"*/*"[..]));
        assert_eq!(req.header_value(buf, "X-ZETA"), Some(&b"z"[..]));
    }

    #[test]
    fn waits_for_full_body_by_content_length() {
        let mut req = HttpRequest::new();
        let head = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(req.continue_to_parse(head).unwrap(), ParseOutcome::NeedMore);
        let full = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let outcome = req.continue_to_parse(full).unwrap();
        assert_eq!(outcome, ParseOutcome::Complete { consumed: full.len() });
        assert_eq!(req.body(full), b"hello");
    }

    #[test]
    fn rejects_content_length_over_limit() {
        let mut req = HttpRequest::new();
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 10000001\r\n\r\n";
        let err = req.continue_to_parse(buf).unwrap_err();
        assert!(matches!(err, ParseError::BodyTooLarge(10_000_001)));
    }

    #[test]
    fn rejects_target_without_leading_slash() {
        let mut req = HttpRequest::new();
        let buf = b"GET hello HTTP/1.1\r\n\r\n";
        assert!(matches!(
            req.continue_to_parse(buf).unwrap_err(),
            ParseError::BadTarget
        ));
    }

    #[test]
    fn rejects_unsupported_method() {
        let mut req = HttpRequest::new();
        let buf = b"PATCH / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            req.continue_to_parse(buf).unwrap_err(),
            ParseError::UnsupportedMethod
        ));
    }

    #[test]
    fn rejects_nul_byte() {
        let mut req = HttpRequest::new();
        let buf = b"GET /\0 HTTP/1.1\r\n\r\n";
        assert!(matches!(
            req.continue_to_parse(buf).unwrap_err(),
            ParseError::NulInLine
        ));
    }
}
