//! Response serialization and body framing.
//!
//! The engine decides *which* framing applies; this module knows how each
//! framing puts bytes on the wire and enforces declared lengths.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::http::request::{Header, Method, comma_tokens, is_token, is_valid_header_value};
use crate::http::response::{ResponseHead, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// How a response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength(u64),
    Chunked,
    /// HTTP/1.0 style: the body ends when we close the connection.
    CloseDelimited,
}

/// Framing implied by the status, request method and framing headers.
///
/// `None` means the response carries no framing header of its own.
pub(crate) fn declared_framing(
    method: &Method,
    status: StatusCode,
    headers: &[Header],
) -> Result<Option<Framing>, ProtocolError> {
    let code = status.as_u16();
    let connect_ok = *method == Method::CONNECT && (200..300).contains(&code);
    if code == 204 || code == 304 || *method == Method::HEAD || connect_ok {
        return Ok(Some(Framing::ContentLength(0)));
    }

    let te = comma_tokens(headers, "transfer-encoding");
    if !te.is_empty() {
        if te != [b"chunked".to_vec()] {
            return Err(ProtocolError::local(
                "Only Transfer-Encoding: chunked is supported",
            ));
        }
        return Ok(Some(Framing::Chunked));
    }

    match content_length(headers)? {
        Some(n) => Ok(Some(Framing::ContentLength(n))),
        None => Ok(None),
    }
}

/// Parses every `Content-Length` occurrence; all of them must agree.
pub(crate) fn content_length(headers: &[Header]) -> Result<Option<u64>, ProtocolError> {
    let mut found: Option<u64> = None;
    for value in comma_tokens(headers, "content-length") {
        if value.is_empty() || value.len() > 19 || !value.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::local("bad Content-Length"));
        }
        let n = value
            .iter()
            .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
        match found {
            Some(prev) if prev != n => {
                return Err(ProtocolError::local("conflicting Content-Length headers"));
            }
            _ => found = Some(n),
        }
    }
    Ok(found)
}

/// Replaces every occurrence of `name` with a single comma-joined value,
/// or removes it when `values` is empty.
pub(crate) fn set_comma_header(headers: &mut Vec<Header>, name: &str, values: &[&[u8]]) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name.as_bytes()));
    if values.is_empty() {
        return;
    }
    let joined = values.join(&b", "[..]);
    headers.push((Bytes::from(name.to_string()), Bytes::from(joined)));
}

/// Writes the status line and header block.
pub fn write_head(head: &ResponseHead, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let status_line = format!("{} {} {}\r\n", HTTP_VERSION, head.status.as_u16(), head.reason);
    out.put_slice(status_line.as_bytes());

    for (name, value) in &head.headers {
        if !is_token(name) {
            return Err(ProtocolError::local(format!(
                "illegal header name {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        if !is_valid_header_value(value) {
            return Err(ProtocolError::local("illegal header value"));
        }
        out.put_slice(&name.to_ascii_lowercase());
        out.put_slice(b": ");
        out.put_slice(value);
        out.put_slice(b"\r\n");
    }

    out.put_slice(b"\r\n");
    Ok(())
}

/// Encodes the body of one response according to its framing.
#[derive(Debug)]
pub struct BodyWriter {
    framing: Framing,
    remaining: u64,
}

impl BodyWriter {
    pub fn new(framing: Framing) -> Self {
        let remaining = match framing {
            Framing::ContentLength(n) => n,
            _ => 0,
        };
        Self { framing, remaining }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Fails before touching `out` when the data would overrun the
    /// declared length.
    pub fn write_data(&mut self, data: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
        match self.framing {
            Framing::ContentLength(_) => {
                let len = data.len() as u64;
                if len > self.remaining {
                    return Err(ProtocolError::local("Too much data for declared Content-Length"));
                }
                self.remaining -= len;
                out.put_slice(data);
            }
            Framing::Chunked => {
                // A zero-length chunk would end the body early.
                if !data.is_empty() {
                    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
                    out.put_slice(data);
                    out.put_slice(b"\r\n");
                }
            }
            Framing::CloseDelimited => out.put_slice(data),
        }
        Ok(())
    }

    pub fn write_end(&mut self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        match self.framing {
            Framing::ContentLength(_) if self.remaining != 0 => Err(ProtocolError::local(
                "Too little data for declared Content-Length",
            )),
            Framing::ContentLength(_) | Framing::CloseDelimited => Ok(()),
            Framing::Chunked => {
                out.put_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}
