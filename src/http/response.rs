use bytes::Bytes;

use crate::http::request::Header;

/// An HTTP status code.
///
/// Any value in `100..=999` can be carried; the common codes have named
/// constants and a reason phrase. Unknown codes get an empty reason, which
/// is still a valid status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    pub const fn new(code: u16) -> Self {
        StatusCode(code)
    }

    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use portico::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.as_u16(), 200);
    /// assert_eq!(StatusCode::NOT_FOUND.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use portico::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::new(418).reason_phrase(), "I'm a teapot");
    /// assert_eq!(StatusCode::new(299).reason_phrase(), "");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            102 => "Processing",
            103 => "Early Hints",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            207 => "Multi-Status",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Content Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Range Not Satisfiable",
            417 => "Expectation Failed",
            418 => "I'm a teapot",
            421 => "Misdirected Request",
            422 => "Unprocessable Content",
            425 => "Too Early",
            426 => "Upgrade Required",
            428 => "Precondition Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            451 => "Unavailable For Legal Reasons",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "",
        }
    }
}

/// Status line and headers of a response, written exactly once per cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Vec<Header>,
    pub reason: &'static str,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: Vec<Header>) -> Self {
        Self {
            status,
            headers,
            reason: status.reason_phrase(),
        }
    }
}

/// A complete, server-generated response (400, 500, 503 and friends).
///
/// These never reach the application: the connection handler writes them
/// directly through the engine.
#[derive(Debug)]
pub struct SimpleResponse {
    pub status: StatusCode,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

/// Builder for [`SimpleResponse`].
///
/// # Example
///
/// ```
/// # use portico::http::response::{ResponseBuilder, StatusCode};
/// let response = ResponseBuilder::new(StatusCode::OK)
///     .header("content-type", "application/json")
///     .body("{}")
///     .build();
/// assert!(response.headers.iter().any(|(k, v)| &k[..] == b"content-length" && &v[..] == b"2"));
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<Header>,
    body: Bytes,
    close: bool,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            close: false,
        }
    }

    /// Appends a header. Names are stored lower-case.
    pub fn header(mut self, key: &str, value: impl Into<Bytes>) -> Self {
        self.headers
            .push((Bytes::from(key.to_ascii_lowercase()), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Marks the response as the last one on the connection.
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Builds the final response, adding `content-length` (and
    /// `connection: close` when requested).
    pub fn build(mut self) -> SimpleResponse {
        let has_length = self
            .headers
            .iter()
            .any(|(k, _)| k.as_ref() == b"content-length");
        if !has_length {
            self.headers.push((
                Bytes::from_static(b"content-length"),
                Bytes::from(self.body.len().to_string()),
            ));
        }
        if self.close {
            self.headers
                .push((Bytes::from_static(b"connection"), Bytes::from_static(b"close")));
        }

        SimpleResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl SimpleResponse {
    fn plain(status: StatusCode, body: &'static str) -> ResponseBuilder {
        ResponseBuilder::new(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(body)
    }

    /// Answer to a request the engine could not parse. Always closes.
    pub fn bad_request() -> Self {
        Self::plain(StatusCode::BAD_REQUEST, "Invalid HTTP request received.")
            .close()
            .build()
    }

    /// Synthesized when the application fails before starting a response.
    pub fn internal_error() -> Self {
        Self::plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            .close()
            .build()
    }

    /// Admission-control answer once `limit_concurrency` is exceeded.
    pub fn service_unavailable() -> Self {
        Self::plain(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
            .close()
            .build()
    }

    /// Splits into the head to send plus the body bytes.
    pub fn into_parts(self) -> (ResponseHead, Bytes) {
        (ResponseHead::new(self.status, self.headers), self.body)
    }
}
