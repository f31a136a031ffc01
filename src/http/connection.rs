use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinError;

use crate::asgi::cycle::{CycleOutcome, RequestResponseCycle};
use crate::asgi::{
    AppReceiver, AppSender, Application, BoxFuture, HttpScope, Outgoing, Scope, SendMessage,
};
use crate::config::{Config, WsMode};
use crate::error::{AppError, ProtocolError};
use crate::http::body::PendingBody;
use crate::http::event::{Event, OutboundEvent};
use crate::http::flow::FlowControl;
use crate::http::keepalive::KeepAlive;
use crate::http::parser::{self, HttpParser};
use crate::http::request::RequestHead;
use crate::http::response::{ResponseHead, SimpleResponse, StatusCode};
use crate::http::state::State;
use crate::server::state::{ConnectionGuard, ConnectionHandle, ServerState};

const MAX_RECV: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Anything a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// What an upgrade handler learns about the request it takes over.
#[derive(Debug, Clone)]
pub struct UpgradeInfo {
    pub conn_id: u64,
    /// Shutdown requests keep arriving here after the handoff. A force
    /// close drops the handler's future.
    pub handle: ConnectionHandle,
    pub head: RequestHead,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
}

/// Takes over a connection that asked for `Upgrade: websocket`.
///
/// `replay` holds the original request bytes followed by anything the
/// client already sent after them, ready to be fed into another engine.
pub trait UpgradeHandler: Send + Sync + 'static {
    fn upgrade(
        &self,
        transport: Box<dyn Transport>,
        replay: Bytes,
        info: UpgradeInfo,
    ) -> BoxFuture<'static, ()>;
}

/// Server-wide collaborators every connection needs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub state: Arc<ServerState>,
    pub app: Arc<dyn Application>,
    pub upgrade: Option<Arc<dyn UpgradeHandler>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerInfo {
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
}

#[derive(Debug)]
pub enum ConnectionState {
    Connected,
    Idle,
    RequestActive(Box<RequestHead>),
    Upgrading(Box<RequestHead>),
    ShuttingDown,
    Closed,
}

/// Outcome of one socket read.
enum Fill {
    Data,
    Eof,
    Failed,
    Cancelled,
}

/// Where reading stands while a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyRead {
    /// Request body still arriving.
    Body,
    /// Body complete; watching for EOF or the next pipelined request.
    Trailing,
    Stopped,
}

pub struct Connection<S> {
    id: u64,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    engine: Box<dyn HttpParser>,
    flow: Arc<FlowControl>,
    keep_alive: KeepAlive,
    handle: ConnectionHandle,
    /// Held from construction so a drain never misses a fresh connection.
    registration: ConnectionGuard,
    ctx: ConnectionContext,
    peer: PeerInfo,
    state: ConnectionState,
    read_buf: BytesMut,
    /// The socket failed; further writes are skipped.
    disconnected: bool,
    /// Something happened that rules out another cycle.
    must_close: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S, peer: PeerInfo, ctx: ConnectionContext) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle::new(id);
        let registration = ctx.state.register_connection(handle.clone());
        let (reader, writer) = tokio::io::split(stream);
        let engine = parser::build(ctx.config.http, ctx.config.max_incomplete_event_size);
        let flow = Arc::new(FlowControl::new(
            ctx.config.flow_high_water,
            ctx.config.flow_low_water,
        ));
        let keep_alive = KeepAlive::new(ctx.config.keep_alive_timeout(), handle.clone());

        Self {
            id,
            reader,
            writer,
            engine,
            flow,
            keep_alive,
            handle,
            registration,
            ctx,
            peer,
            state: ConnectionState::Connected,
            read_buf: BytesMut::with_capacity(MAX_RECV),
            disconnected: false,
            must_close: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Control handle; clone it before calling [`Connection::run`].
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub async fn run(mut self) {
        tracing::debug!(conn = self.id, client = ?self.peer.client, "Connection made");

        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Connected | ConnectionState::Idle => {
                    self.state = match self.read_request().await {
                        Some(head) if self.wants_upgrade(&head) => {
                            ConnectionState::Upgrading(Box::new(head))
                        }
                        Some(head) => ConnectionState::RequestActive(Box::new(head)),
                        None => ConnectionState::ShuttingDown,
                    };
                }

                ConnectionState::RequestActive(head) => {
                    self.keep_alive.reset();
                    self.run_cycle(*head).await;
                    self.state = self.after_cycle().await;
                }

                ConnectionState::Upgrading(head) => {
                    self.upgrade(*head).await;
                    return;
                }

                ConnectionState::ShuttingDown => {
                    self.shutdown().await;
                    self.state = ConnectionState::Closed;
                }

                ConnectionState::Closed => break,
            }
        }

        tracing::debug!(conn = self.id, "Connection closed");
    }

    fn wants_upgrade(&self, head: &RequestHead) -> bool {
        let Some(token) = &head.upgrade else {
            return false;
        };
        if head.is_websocket_upgrade()
            && self.ctx.upgrade.is_some()
            && self.ctx.config.ws == WsMode::Auto
        {
            return true;
        }
        tracing::warn!(
            conn = self.id,
            upgrade = %String::from_utf8_lossy(token),
            "Unsupported upgrade request."
        );
        false
    }

    /// Waits for the next request head. `None` means the connection should
    /// close: the peer left, the request was invalid, or we were asked to
    /// shut down while idle.
    async fn read_request(&mut self) -> Option<RequestHead> {
        loop {
            match self.engine.next_event() {
                Ok(Event::Request(head)) => return Some(head),
                Ok(Event::NeedData) => {}
                Ok(Event::ConnectionClosed) => {
                    tracing::debug!(conn = self.id, "Client closed the connection");
                    return None;
                }
                Ok(other) => {
                    tracing::debug!(conn = self.id, event = ?other, "Unexpected event while idle");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(conn = self.id, error = %e, "Invalid HTTP request received.");
                    self.send_simple(SimpleResponse::bad_request()).await;
                    return None;
                }
            }

            match self.fill().await {
                Fill::Data | Fill::Eof => {}
                Fill::Failed | Fill::Cancelled => return None,
            }
        }
    }

    /// Reads once from the socket into the engine, unless a shutdown
    /// request arrives first.
    async fn fill(&mut self) -> Fill {
        self.read_buf.reserve(MAX_RECV);
        tokio::select! {
            biased;
            _ = self.handle.shutdown_requested() => Fill::Cancelled,
            read = self.reader.read_buf(&mut self.read_buf) => self.on_read(read),
        }
    }

    fn on_read(&mut self, read: std::io::Result<usize>) -> Fill {
        match read {
            Ok(0) => {
                let _ = self.engine.receive_data(b"");
                Fill::Eof
            }
            Ok(n) => {
                tracing::trace!(conn = self.id, bytes = n, "read data");
                self.keep_alive.reset();
                let chunk = self.read_buf.split();
                match self.engine.receive_data(&chunk) {
                    Ok(()) => Fill::Data,
                    Err(e) => {
                        tracing::debug!(conn = self.id, error = %e, "Data after EOF");
                        Fill::Failed
                    }
                }
            }
            Err(e) => {
                tracing::debug!(conn = self.id, error = %e, "Read failed");
                self.disconnected = true;
                Fill::Failed
            }
        }
    }

    fn over_concurrency_limit(&self) -> bool {
        match self.ctx.config.limit_concurrency {
            // This connection is already counted.
            Some(limit) => {
                self.ctx.state.connection_count() > limit || self.ctx.state.task_count() >= limit
            }
            None => false,
        }
    }

    async fn run_cycle(&mut self, head: RequestHead) {
        if self.over_concurrency_limit() {
            tracing::warn!(conn = self.id, "Exceeded concurrency limit.");
            self.send_simple(SimpleResponse::service_unavailable()).await;
            self.must_close = true;
            return;
        }

        let config = Arc::clone(&self.ctx.config);
        let scope = HttpScope::from_request(&head, &config.root_path, self.peer.client, self.peer.server);
        let body = PendingBody::new(Arc::clone(&self.flow));
        let mut cycle = RequestResponseCycle::new(
            self.id,
            &scope,
            Arc::clone(&body),
            self.ctx.state.default_headers(),
            config.access_log,
        );
        if self.handle.is_shutdown_requested() {
            cycle.disable_keep_alive();
        }

        let (tx, mut rx) = mpsc::channel::<Outgoing>(1);
        let send = AppSender::new(tx, Some(Arc::clone(&self.flow)));
        let receive = AppReceiver::http(Arc::clone(&body));
        let task = self.ctx.state.register_task();
        let app_future = self.ctx.app.call(Scope::Http(scope), receive, send);
        let mut app_task = tokio::spawn(async move {
            let _task = task;
            app_future.await
        });

        let mut reading = BodyRead::Body;
        let mut sends_open = true;
        let mut shutdown_seen = false;
        let mut aborted = false;
        let mut app_error: Option<String> = None;

        loop {
            if reading != BodyRead::Stopped {
                match self.pump_body(&body, reading) {
                    Ok(next) => reading = next,
                    Err(e) => {
                        tracing::warn!(conn = self.id, error = %e, "Invalid HTTP request received.");
                        app_task.abort();
                        aborted = true;
                        body.disconnect();
                        if !cycle.response_started() {
                            self.send_simple(SimpleResponse::bad_request()).await;
                        }
                        self.must_close = true;
                        break;
                    }
                }
            }

            let can_read = reading != BodyRead::Stopped
                && !self.flow.is_read_paused()
                && !self.engine.they_are_waiting_for_100_continue();
            self.read_buf.reserve(MAX_RECV);

            tokio::select! {
                joined = &mut app_task => {
                    app_error = exit_error(joined);
                    while let Ok((message, ack)) = rx.try_recv() {
                        let result = self.handle_send(&mut cycle, &body, message).await;
                        let _ = ack.send(result);
                    }
                    break;
                }
                outgoing = rx.recv(), if sends_open => match outgoing {
                    Some((message, ack)) => {
                        let result = self.handle_send(&mut cycle, &body, message).await;
                        let _ = ack.send(result);
                    }
                    None => sends_open = false,
                },
                _ = body.wanted(), if reading == BodyRead::Body => {
                    if self.engine.they_are_waiting_for_100_continue() {
                        self.send_continue(&body).await;
                    }
                }
                _ = self.flow.readable(), if reading != BodyRead::Stopped && self.flow.is_read_paused() => {}
                read = self.reader.read_buf(&mut self.read_buf), if can_read => {
                    match self.on_read(read) {
                        Fill::Data | Fill::Cancelled => {}
                        Fill::Eof if reading == BodyRead::Trailing => {
                            let _ = self.engine.next_event();
                            body.disconnect();
                            reading = BodyRead::Stopped;
                        }
                        Fill::Eof | Fill::Failed => {
                            // The peer is gone before the body was complete.
                            body.disconnect();
                            self.must_close = true;
                            reading = BodyRead::Stopped;
                        }
                    }
                }
                _ = self.handle.shutdown_requested(), if !shutdown_seen => {
                    shutdown_seen = true;
                    cycle.disable_keep_alive();
                }
                _ = self.handle.force_closed() => {
                    app_task.abort();
                    aborted = true;
                    body.disconnect();
                    self.must_close = true;
                    break;
                }
            }
        }

        if cycle.response_complete() {
            self.ctx.state.record_request();
        }
        if aborted {
            return;
        }

        match cycle.finish(app_error.as_deref()) {
            CycleOutcome::Complete => {}
            CycleOutcome::SendInternalError => {
                self.send_simple(SimpleResponse::internal_error()).await;
            }
            CycleOutcome::CloseTransport => self.must_close = true,
        }
    }

    async fn send_continue(&mut self, body: &PendingBody) {
        tracing::trace!(conn = self.id, "Sending 100 Continue");
        let interim = ResponseHead::new(StatusCode::CONTINUE, Vec::new());
        match self.engine.send(OutboundEvent::InformationalResponse(interim)) {
            Ok(Some(bytes)) => self.write(&bytes, body).await,
            Ok(None) => {}
            Err(e) => tracing::debug!(conn = self.id, error = %e, "Cannot send 100 Continue"),
        }
    }

    /// Moves buffered request events into the application's body buffer.
    fn pump_body(&mut self, body: &PendingBody, reading: BodyRead) -> Result<BodyRead, ProtocolError> {
        loop {
            match self.engine.next_event()? {
                Event::Data(data) => body.push(data),
                Event::EndOfMessage => body.finish(),
                Event::NeedData if body.is_finished() => return Ok(BodyRead::Trailing),
                Event::NeedData => return Ok(reading),
                // The next request is already buffered; it waits its turn.
                Event::Paused => return Ok(BodyRead::Stopped),
                Event::ConnectionClosed => {
                    body.disconnect();
                    return Ok(BodyRead::Stopped);
                }
                Event::Request(_) => return Ok(BodyRead::Stopped),
            }
        }
    }

    async fn handle_send(
        &mut self,
        cycle: &mut RequestResponseCycle,
        body: &PendingBody,
        message: SendMessage,
    ) -> Result<(), AppError> {
        let events = cycle.on_send(message)?;
        if self.disconnected {
            return Ok(());
        }

        let mut out = BytesMut::new();
        for event in events {
            if let Some(bytes) = self.engine.send(event).map_err(AppError::from)? {
                out.extend_from_slice(&bytes);
            }
        }
        if !out.is_empty() {
            self.write(&out, body).await;
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8], body: &PendingBody) {
        if !self.write_raw(bytes).await {
            body.disconnect();
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> bool {
        if self.disconnected {
            return false;
        }
        self.flow.pause_writing();
        let result = self.writer.write_all(bytes).await;
        self.flow.resume_writing();
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(conn = self.id, error = %e, "Write failed");
                self.disconnected = true;
                false
            }
        }
    }

    /// Writes a server-generated response in one go.
    async fn send_simple(&mut self, response: SimpleResponse) {
        let (mut head, body) = response.into_parts();
        let mut headers: Vec<_> = self.ctx.state.default_headers().iter().cloned().collect();
        headers.append(&mut head.headers);
        head.headers = headers;

        let mut out = BytesMut::new();
        let events = [
            OutboundEvent::Response(head),
            OutboundEvent::Data(body),
            OutboundEvent::EndOfMessage,
        ];
        for event in events {
            match self.engine.send(event) {
                Ok(Some(bytes)) => out.extend_from_slice(&bytes),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(conn = self.id, error = %e, "Cannot send error response");
                    return;
                }
            }
        }
        self.write_raw(&out).await;
    }

    /// Decides between another cycle and closing.
    async fn after_cycle(&mut self) -> ConnectionState {
        if self.must_close || self.disconnected || self.handle.is_shutdown_requested() {
            return ConnectionState::ShuttingDown;
        }

        let (client, server) = self.engine.states();
        if server != State::Done {
            tracing::trace!(conn = self.id, state = %server, "Connection is not reusable, shutting down");
            return ConnectionState::ShuttingDown;
        }

        if client == State::SendBody && !self.discard_request_body().await {
            return ConnectionState::ShuttingDown;
        }

        if let Err(e) = self.engine.start_next_cycle() {
            tracing::trace!(conn = self.id, error = %e, "Connection is not reusable, bailing out");
            return ConnectionState::ShuttingDown;
        }

        self.flow.reset();
        self.keep_alive.schedule();
        tracing::debug!(conn = self.id, "Connection kept alive");
        ConnectionState::Idle
    }

    /// Reads and drops whatever request body the application left unread.
    async fn discard_request_body(&mut self) -> bool {
        loop {
            match self.engine.next_event() {
                Ok(Event::Data(_)) => {}
                Ok(Event::EndOfMessage) => return true,
                Ok(Event::NeedData) => match self.fill().await {
                    Fill::Data | Fill::Eof => {}
                    Fill::Failed | Fill::Cancelled => return false,
                },
                Ok(_) | Err(_) => return false,
            }
        }
    }

    async fn shutdown(&mut self) {
        self.keep_alive.close();
        if self.disconnected {
            return;
        }

        let _ = self.engine.send(OutboundEvent::ConnectionClosed);
        if let Err(e) = self.writer.shutdown().await {
            tracing::trace!(conn = self.id, error = %e, "failed to send EOF: client is already gone");
            return;
        }
        tracing::trace!(conn = self.id, "EOF sent");

        let linger = self.ctx.config.linger_timeout();
        if self.linger(linger).await {
            tracing::trace!(conn = self.id, "EOF acknowledged by peer");
        }
    }

    /// Reads until the peer closes too, the timeout elapses, or a force
    /// close arrives. True when the peer's EOF was seen.
    async fn linger(&mut self, timeout: Duration) -> bool {
        let mut scratch = BytesMut::with_capacity(MAX_RECV);
        let reader = &mut self.reader;
        let drain = async {
            loop {
                scratch.clear();
                match reader.read_buf(&mut scratch).await {
                    Ok(0) | Err(_) => return true,
                    Ok(_) => {}
                }
            }
        };
        tokio::select! {
            _ = self.handle.force_closed() => false,
            done = tokio::time::timeout(timeout, drain) => done.unwrap_or(false),
        }
    }

    async fn upgrade(self, head: RequestHead) {
        let Some(handler) = self.ctx.upgrade.clone() else {
            return;
        };
        let Connection {
            id,
            reader,
            writer,
            mut engine,
            mut keep_alive,
            handle,
            registration,
            peer,
            ..
        } = self;
        keep_alive.close();

        let (trailing, _) = engine.take_trailing_data();
        let mut replay = BytesMut::from(&head.to_bytes()[..]);
        replay.extend_from_slice(&trailing);

        tracing::debug!(conn = id, "Handing connection to upgrade handler");
        let transport = reader.unsplit(writer);
        let info = UpgradeInfo {
            conn_id: id,
            handle: handle.clone(),
            head,
            client: peer.client,
            server: peer.server,
        };
        tokio::select! {
            _ = handler.upgrade(Box::new(transport), replay.freeze(), info) => {}
            _ = handle.force_closed() => {
                tracing::debug!(conn = id, "Upgraded connection force closed");
            }
        }
        drop(registration);
    }
}

fn exit_error(joined: Result<anyhow::Result<()>, JoinError>) -> Option<String> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(e) if e.is_panic() => Some("application panicked".to_string()),
        Err(e) => Some(e.to_string()),
    }
}
