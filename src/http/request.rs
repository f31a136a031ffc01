use bytes::{BufMut, Bytes, BytesMut};

/// A single header as it travels through the server: `(name, value)`.
///
/// Names of request headers are always lower-cased.
pub type Header = (Bytes, Bytes);

/// HTTP request methods.
///
/// The common methods get their own variant; any other syntactically valid
/// token is carried verbatim in [`Method::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Message loop-back test
    TRACE,
    /// Extension method
    Other(String),
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Methods are case-sensitive. Returns `None` when `s` is not a valid
    /// RFC 7230 token.
    ///
    /// # Example
    ///
    /// ```
    /// # use portico::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("PURGE"), Some(Method::Other("PURGE".into())));
    /// assert_eq!(Method::from_str("G T"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let method = match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            "CONNECT" => Method::CONNECT,
            "TRACE" => Method::TRACE,
            other if is_token(other.as_bytes()) => Method::Other(other.to_string()),
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
            Method::Other(s) => s,
        }
    }
}

/// Protocol version of a request. Only HTTP/1.x is spoken here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// The version as it appears in the application scope (`"1.1"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "1.0",
            Version::Http11 => "1.1",
        }
    }
}

/// The request line and header block of one request.
///
/// Produced once per request by the protocol engine and never modified
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Raw request target: path plus optional `?query`.
    pub target: Bytes,
    pub version: Version,
    /// Header list in arrival order, names lower-cased.
    pub headers: Vec<Header>,
    /// Lower-cased `Upgrade` token when the client asked to switch protocols.
    pub upgrade: Option<Bytes>,
}

impl RequestHead {
    pub fn new(method: Method, target: Bytes, version: Version, headers: Vec<Header>) -> Self {
        let headers: Vec<Header> = headers
            .into_iter()
            .map(|(name, value)| (Bytes::from(name.to_ascii_lowercase()), value))
            .collect();
        let upgrade = find_upgrade_header(&headers);

        Self {
            method,
            target,
            version,
            headers,
            upgrade,
        }
    }

    /// First value of the named header. `name` must be lower-case.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.as_ref() == name.as_bytes())
            .map(|(_, v)| v.as_ref())
    }

    /// All comma-separated tokens across every occurrence of `name`,
    /// trimmed and lower-cased.
    pub fn header_tokens(&self, name: &str) -> Vec<Vec<u8>> {
        comma_tokens(&self.headers, name)
    }

    /// Whether the request allows the connection to be reused.
    ///
    /// HTTP/1.0 requests and requests carrying `Connection: close` disable
    /// keep-alive for the rest of the cycle.
    pub fn keep_alive(&self) -> bool {
        self.version == Version::Http11
            && !self
                .header_tokens("connection")
                .iter()
                .any(|t| t.as_slice() == b"close")
    }

    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map(|v| v.trim_ascii().eq_ignore_ascii_case(b"100-continue"))
            .unwrap_or(false)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.upgrade.as_deref() == Some(b"websocket".as_slice())
    }

    /// Splits the target into `(path, query_string)` at the first `?`.
    pub fn path_and_query(&self) -> (Bytes, Bytes) {
        match self.target.iter().position(|b| *b == b'?') {
            Some(i) => (self.target.slice(..i), self.target.slice(i + 1..)),
            None => (self.target.clone(), Bytes::new()),
        }
    }

    /// Re-serializes the head so it can be replayed into another protocol
    /// engine after an upgrade.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(&self.target);
        buf.put_slice(b" HTTP/");
        buf.put_slice(self.version.as_str().as_bytes());
        buf.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            buf.put_slice(name);
            buf.put_slice(b": ");
            buf.put_slice(value);
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

/// Returns the `Upgrade` value when `Connection` carries the `upgrade` token.
pub fn find_upgrade_header(headers: &[Header]) -> Option<Bytes> {
    let wants_upgrade = comma_tokens(headers, "connection")
        .iter()
        .any(|t| t.as_slice() == b"upgrade");
    if !wants_upgrade {
        return None;
    }

    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(b"upgrade"))
        .map(|(_, v)| Bytes::from(v.trim_ascii().to_ascii_lowercase()))
}

pub(crate) fn comma_tokens(headers: &[Header], name: &str) -> Vec<Vec<u8>> {
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name.as_bytes()))
        .flat_map(|(_, v)| v.split(|b| *b == b','))
        .map(|t| t.trim_ascii().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// RFC 7230 `tchar`.
pub(crate) fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~')
        || b.is_ascii_alphanumeric()
}

pub(crate) fn is_token(s: &[u8]) -> bool {
    !s.is_empty() && s.iter().all(|b| is_tchar(*b))
}

/// Header values may carry HTAB, visible ASCII and obs-text, nothing else.
pub(crate) fn is_valid_header_value(v: &[u8]) -> bool {
    v.iter().all(|b| *b == b'\t' || (*b >= 0x20 && *b != 0x7f))
}
