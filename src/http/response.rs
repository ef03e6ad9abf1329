//! Response writer: serializes directly into a connection's `send_buf`,
//! reserving fixed-width numeric fields for the status code and
//! `Content-Length` so both can be patched in place after the body is fully
//! buffered, without rewriting anything already written.
//!
//! Patch offsets are plain `usize` indices into `send_buf`, not pointers —
//! growth-safe for the same reason `http::request`'s slices are.

use chrono::Utc;

use crate::error::Error;
use crate::net::buffer::Buffer;

const PROTECTED_HEADERS: &[&str] = &["connection", "date", "server", "content-length"];

fn is_protected_header(name: &str) -> bool {
    PROTECTED_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Two-letter reason stub derived from the status code's class: `"ER"` for
/// 400-599, `"OK"` otherwise.
pub fn reason_phrase(code: u16) -> &'static str {
    if (400..=599).contains(&code) {
        "ER"
    } else {
        "OK"
    }
}

fn http_date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// A response under construction. Call order: `begin`, zero or more
/// `add_header`, `finish_headers`, zero or more `write_body`, `finish`.
pub struct HttpResponse {
    code_patch_offset: usize,
    length_patch_offset: usize,
    body_offset: usize,
    content_type_set: bool,
}

impl HttpResponse {
    /// Writes the status line (`HTTP/1.1 <code> <reason>\r\n`) into `buf`.
    /// `code`'s three ASCII digits are recorded as a patch field so
    /// `set_status` can flip the code later without touching anything else.
    pub fn begin(buf: &mut Buffer, code: u16) -> Self {
        buf.append_str("HTTP/1.1 ");
        let code_patch_offset = buf.len();
        buf.append_integer(code as usize);
        buf.append_str(" ");
        buf.append_str(reason_phrase(code));
        buf.append_str("\r\n");
        Self {
            code_patch_offset,
            length_patch_offset: 0,
            body_offset: 0,
            content_type_set: false,
        }
    }

    /// Append an application header. Silently dropped (with a warning) if
    /// `name` collides with one of the terminal headers `finish_headers`
    /// owns. `Content-Type` is not protected: setting it here suppresses
    /// the default `Content-Type` `finish_headers` would otherwise write.
    pub fn add_header(&mut self, buf: &mut Buffer, name: &str, value: &str) {
        if is_protected_header(name) {
            tracing::warn!(header = name, "dropping attempt to set a protected response header");
            return;
        }
        if name.eq_ignore_ascii_case("content-type") {
            self.content_type_set = true;
        }
        buf.append_str(name);
        buf.append_str(": ");
        buf.append_str(value);
        buf.append_str("\r\n");
    }

    /// Emit `Connection`, optional `Date`, `Server`, a default `Content-Type`
    /// (only if the caller hasn't already set one via `add_header`), and a
    /// reserved 8-digit `Content-Length` field, then the blank line
    /// separating headers from the body. Must run exactly once, after all
    /// `add_header` calls and before `write_body`.
    pub fn finish_headers(
        &mut self,
        buf: &mut Buffer,
        keep_alive: bool,
        include_date: bool,
        content_type: &str,
    ) {
        buf.append_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        if include_date {
            buf.append_str("Date: ");
            buf.append_str(&http_date_now());
            buf.append_str("\r\n");
        }
        buf.append_str("Server: corehttpd\r\n");
        if !self.content_type_set {
            buf.append_str("Content-Type: ");
            buf.append_str(content_type);
            buf.append_str("\r\n");
        }
        buf.append_str("Content-Length: ");
        self.length_patch_offset = buf.len();
        buf.append_str("00000000\r\n\r\n");
        self.body_offset = buf.len();
    }

    pub fn write_body(&self, buf: &mut Buffer, bytes: &[u8]) {
        buf.append(bytes);
    }

    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    /// Patch the reserved `Content-Length` field now that the body is fully
    /// buffered. `buf` must be the same buffer passed to every prior call.
    pub fn finish(&self, buf: &mut Buffer) -> Result<(), Error> {
        let body_len = buf.len() - self.body_offset;
        if body_len > 99_999_999 {
            return Err(Error::ResponseTooLarge(body_len));
        }
        let digits = pad_decimal::<8>(body_len);
        buf.as_mut_slice()[self.length_patch_offset..self.length_patch_offset + 8]
            .copy_from_slice(&digits);
        Ok(())
    }

    /// Overwrite the three status-code digits written by `begin`. Safe to
    /// call at any point, including after the body has been written — the
    /// reason phrase is not rewritten, since doing so in place would require
    /// a variable-width patch.
    pub fn set_status(&self, buf: &mut Buffer, code: u16) {
        let digits = pad_decimal::<3>(code as usize);
        buf.as_mut_slice()[self.code_patch_offset..self.code_patch_offset + 3]
            .copy_from_slice(&digits);
    }
}

fn pad_decimal<const N: usize>(mut value: usize) -> [u8; N] {
    let mut out = [b'0'; N];
    for slot in out.iter_mut().rev() {
        *slot = b'0' + (value % 10) as u8;
        value /= 10;
    }
    out
}
