//! Request-head parser written directly against the byte buffer.
//!
//! Accepts bare `\n` line endings as well as CRLF, skips blank lines before
//! the request line, and rejects obsolete line folding.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::http::parser::{HeadParser, MAX_HEADERS};
use crate::http::request::{Header, Method, RequestHead, Version, is_token, is_valid_header_value};

#[derive(Debug, Default, Clone, Copy)]
pub struct PortableHead;

impl HeadParser for PortableHead {
    fn parse_head(&self, buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProtocolError> {
        let Some(skip) = buf.iter().position(|b| *b != b'\r' && *b != b'\n') else {
            return Ok(None);
        };
        let data = &buf[skip..];
        let Some(end) = find_head_end(data) else {
            return Ok(None);
        };

        let mut lines = data[..end]
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .take_while(|line| !line.is_empty());

        let request_line = lines
            .next()
            .ok_or_else(|| ProtocolError::remote("missing request line"))?;
        let (method, target, version) = parse_request_line(request_line)?;

        let mut headers: Vec<Header> = Vec::new();
        for line in lines {
            if headers.len() == MAX_HEADERS {
                return Err(ProtocolError::remote("too many headers"));
            }
            headers.push(parse_header_line(line)?);
        }

        let head = RequestHead::new(method, target, version, headers);
        Ok(Some((head, skip + end)))
    }
}

/// Index just past the blank line ending the head, if present.
fn find_head_end(data: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(offset) = data[from..].iter().position(|b| *b == b'\n') {
        let i = from + offset;
        match &data[i + 1..] {
            [b'\n', ..] => return Some(i + 2),
            [b'\r', b'\n', ..] => return Some(i + 3),
            _ => from = i + 1,
        }
    }
    None
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Bytes, Version), ProtocolError> {
    let parts: Vec<&[u8]> = line.split(|b| *b == b' ').collect();
    let [method, target, version] = parts.as_slice() else {
        return Err(ProtocolError::remote("illegal request line"));
    };

    let method = std::str::from_utf8(method)
        .ok()
        .and_then(Method::from_str)
        .ok_or_else(|| ProtocolError::remote("illegal request method"))?;

    if target.is_empty() || target.iter().any(|b| *b <= 0x20 || *b == 0x7f) {
        return Err(ProtocolError::remote("illegal request target"));
    }

    let version = match *version {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        _ => return Err(ProtocolError::remote("unsupported HTTP version")),
    };

    Ok((method, Bytes::copy_from_slice(target), version))
}

fn parse_header_line(line: &[u8]) -> Result<Header, ProtocolError> {
    if line.starts_with(b" ") || line.starts_with(b"\t") {
        return Err(ProtocolError::remote("obsolete line folding is not supported"));
    }
    let colon = line
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| ProtocolError::remote("illegal header line"))?;
    let (name, value) = (&line[..colon], &line[colon + 1..]);

    // Rejects "Name : value" as well, since space is not a token char.
    if !is_token(name) {
        return Err(ProtocolError::remote("illegal header name"));
    }
    let value = trim_ows(value);
    if !is_valid_header_value(value) {
        return Err(ProtocolError::remote("illegal header value"));
    }

    Ok((Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)))
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map_or(start, |i| i + 1);
    &value[start..end]
}
