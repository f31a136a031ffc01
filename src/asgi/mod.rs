//! The application interface: `(scope, receive, send)`.
//!
//! An [`Application`] is called once per request (and once for the lifespan
//! handshake) with a [`Scope`], an [`AppReceiver`] to pull inbound events
//! from and an [`AppSender`] to push response messages into. Messages are
//! closed enums, so an application cannot send something the server does
//! not understand; ordering rules are still checked at runtime by
//! [`cycle::RequestResponseCycle`].
//!
//! ```no_run
//! use portico::asgi::{app_fn, ReceiveEvent, Scope, SendMessage};
//!
//! let app = app_fn(|scope, mut receive, send| async move {
//!     if let Scope::Http(_) = scope {
//!         while let ReceiveEvent::HttpRequest { more_body: true, .. } = receive.receive().await {}
//!         send.send(SendMessage::start(200, vec![])).await?;
//!         send.send(SendMessage::body("Hello, world", false)).await?;
//!     }
//!     Ok(())
//! });
//! # let _ = app;
//! ```

pub mod cycle;

use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::AppError;
use crate::http::body::{BodyRead, PendingBody};
use crate::http::flow::FlowControl;
use crate::http::request::{Header, RequestHead};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Interface version advertised in every scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsgiVersion {
    pub version: &'static str,
    pub spec_version: &'static str,
}

pub const ASGI_VERSION: AsgiVersion = AsgiVersion {
    version: "3.0",
    spec_version: "2.3",
};

#[derive(Debug, Clone)]
pub struct HttpScope {
    pub asgi: AsgiVersion,
    pub http_version: &'static str,
    pub scheme: &'static str,
    pub method: String,
    pub root_path: String,
    /// Percent-decoded path.
    pub path: String,
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub headers: Vec<Header>,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
}

impl HttpScope {
    pub fn from_request(
        head: &RequestHead,
        root_path: &str,
        client: Option<SocketAddr>,
        server: Option<SocketAddr>,
    ) -> Self {
        let (raw_path, query_string) = head.path_and_query();
        let path = format!("{}{}", root_path, percent_decode_path(&raw_path));
        Self {
            asgi: ASGI_VERSION,
            http_version: head.version.as_str(),
            scheme: "http",
            method: head.method.as_str().to_string(),
            root_path: root_path.to_string(),
            path,
            raw_path,
            query_string,
            headers: head.headers.clone(),
            client,
            server,
        }
    }

    /// `path?query`, as logged by the access log.
    pub fn path_with_query(&self) -> String {
        if self.query_string.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, String::from_utf8_lossy(&self.query_string))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub asgi: AsgiVersion,
}

#[derive(Debug, Clone)]
pub enum Scope {
    Http(HttpScope),
    Lifespan(LifespanScope),
}

/// What `receive()` hands to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    HttpRequest { body: Bytes, more_body: bool },
    HttpDisconnect,
    LifespanStartup,
    LifespanShutdown,
}

/// What the application passes to `send()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendMessage {
    HttpResponseStart { status: u16, headers: Vec<Header> },
    HttpResponseBody { body: Bytes, more_body: bool },
    LifespanStartupComplete,
    LifespanStartupFailed { message: String },
    LifespanShutdownComplete,
    LifespanShutdownFailed { message: String },
}

impl SendMessage {
    pub fn start(status: u16, headers: Vec<Header>) -> Self {
        SendMessage::HttpResponseStart { status, headers }
    }

    pub fn body(body: impl Into<Bytes>, more_body: bool) -> Self {
        SendMessage::HttpResponseBody {
            body: body.into(),
            more_body,
        }
    }

    /// The wire name of the message type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            SendMessage::HttpResponseStart { .. } => "http.response.start",
            SendMessage::HttpResponseBody { .. } => "http.response.body",
            SendMessage::LifespanStartupComplete => "lifespan.startup.complete",
            SendMessage::LifespanStartupFailed { .. } => "lifespan.startup.failed",
            SendMessage::LifespanShutdownComplete => "lifespan.shutdown.complete",
            SendMessage::LifespanShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }
}

/// A server-side application.
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        scope: Scope,
        receive: AppReceiver,
        send: AppSender,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Adapter turning an async closure into an [`Application`].
pub struct AppFn<F>(F);

/// Wraps a closure so it can be used as an [`Application`].
pub fn app_fn<F, Fut>(f: F) -> AppFn<F>
where
    F: Fn(Scope, AppReceiver, AppSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    AppFn(f)
}

impl<F, Fut> Application for AppFn<F>
where
    F: Fn(Scope, AppReceiver, AppSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(
        &self,
        scope: Scope,
        receive: AppReceiver,
        send: AppSender,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin((self.0)(scope, receive, send))
    }
}

/// A message plus the slot its outcome is reported on.
pub type Outgoing = (SendMessage, oneshot::Sender<Result<(), AppError>>);

/// Application-side `send`.
///
/// Every call waits until the server has processed the message, so errors
/// (a bad status, a second start, ...) surface at the offending call.
#[derive(Debug, Clone)]
pub struct AppSender {
    tx: mpsc::Sender<Outgoing>,
    flow: Option<Arc<FlowControl>>,
}

impl AppSender {
    pub fn new(tx: mpsc::Sender<Outgoing>, flow: Option<Arc<FlowControl>>) -> Self {
        Self { tx, flow }
    }

    pub async fn send(&self, message: SendMessage) -> Result<(), AppError> {
        if let Some(flow) = &self.flow {
            flow.drain().await;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((message, ack_tx))
            .await
            .map_err(|_| AppError::Closed)?;
        ack_rx.await.map_err(|_| AppError::Closed)?
    }
}

#[derive(Debug)]
enum ReceiverInner {
    Http(Arc<PendingBody>),
    Lifespan(mpsc::Receiver<ReceiveEvent>),
}

/// Application-side `receive`.
#[derive(Debug)]
pub struct AppReceiver {
    inner: ReceiverInner,
}

impl AppReceiver {
    pub fn http(body: Arc<PendingBody>) -> Self {
        Self {
            inner: ReceiverInner::Http(body),
        }
    }

    pub fn lifespan(rx: mpsc::Receiver<ReceiveEvent>) -> Self {
        Self {
            inner: ReceiverInner::Lifespan(rx),
        }
    }

    pub async fn receive(&mut self) -> ReceiveEvent {
        match &mut self.inner {
            ReceiverInner::Http(body) => match body.read().await {
                BodyRead::Chunk { body, more_body } => ReceiveEvent::HttpRequest { body, more_body },
                BodyRead::Disconnected => ReceiveEvent::HttpDisconnect,
            },
            // The server only drops its end once it is shutting down.
            ReceiverInner::Lifespan(rx) => rx.recv().await.unwrap_or(ReceiveEvent::LifespanShutdown),
        }
    }
}

/// Decodes `%XX` escapes; `+` is kept and invalid escapes pass through.
pub fn percent_decode_path(raw: &[u8]) -> Cow<'_, str> {
    if !raw.contains(&b'%') {
        return String::from_utf8_lossy(raw);
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'%' if i + 2 < raw.len() => match (hex_digit(raw[i + 1]), hex_digit(raw[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode_path(b"/plain"), "/plain");
        assert_eq!(percent_decode_path(b"/a%20b"), "/a b");
        assert_eq!(percent_decode_path(b"/caf%C3%A9"), "/café");
        assert_eq!(percent_decode_path(b"/a+b%zz"), "/a+b%zz");
        assert_eq!(percent_decode_path(b"/end%41"), "/endA");
    }
}
