//! Request-head parser backed by `httparse`.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::http::parser::{HeadParser, MAX_HEADERS};
use crate::http::request::{Header, Method, RequestHead, Version, is_valid_header_value};

#[derive(Debug, Default, Clone, Copy)]
pub struct HttparseHead;

impl HeadParser for HttparseHead {
    fn parse_head(&self, buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProtocolError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut slots);

        let consumed = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProtocolError::remote(e.to_string())),
        };

        let method = req
            .method
            .and_then(Method::from_str)
            .ok_or_else(|| ProtocolError::remote("illegal request method"))?;
        let target = req
            .path
            .ok_or_else(|| ProtocolError::remote("illegal request target"))?;
        let version = match req.version {
            Some(1) => Version::Http11,
            Some(0) => Version::Http10,
            _ => return Err(ProtocolError::remote("unsupported HTTP version")),
        };

        let mut headers: Vec<Header> = Vec::with_capacity(req.headers.len());
        for h in req.headers.iter() {
            // httparse lets a few control bytes through that the portable
            // parser refuses; keep the two strategies in agreement.
            if !is_valid_header_value(h.value) {
                return Err(ProtocolError::remote("illegal header value"));
            }
            headers.push((
                Bytes::copy_from_slice(h.name.as_bytes()),
                Bytes::copy_from_slice(h.value.trim_ascii()),
            ));
        }

        let head = RequestHead::new(method, Bytes::copy_from_slice(target.as_bytes()), version, headers);
        Ok(Some((head, consumed)))
    }
}
