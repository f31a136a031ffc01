use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use portico::asgi::{
    AppReceiver, AppSender, Application, BoxFuture, ReceiveEvent, Scope, SendMessage, app_fn,
};
use portico::config::Config;
use portico::http::connection::{
    Connection, ConnectionContext, PeerInfo, Transport, UpgradeHandler, UpgradeInfo,
};
use portico::server::state::{ConnectionHandle, ServerState, build_default_headers};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

const SIMPLE_GET: &[u8] = b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n";
const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> Config {
    Config {
        timeout_linger: 0.2,
        access_log: false,
        ..Config::default()
    }
}

struct Harness {
    client: Client,
    handle: ConnectionHandle,
    task: JoinHandle<()>,
    state: Arc<ServerState>,
}

fn context(
    config: Config,
    app: impl Application,
    upgrade: Option<Arc<dyn UpgradeHandler>>,
) -> ConnectionContext {
    let state = Arc::new(ServerState::new(build_default_headers(&config, SystemTime::now())));
    ConnectionContext {
        config: Arc::new(config),
        state,
        app: Arc::new(app),
        upgrade,
    }
}

fn start(config: Config, app: impl Application) -> Harness {
    start_with(context(config, app, None))
}

fn start_with(ctx: ConnectionContext) -> Harness {
    let state = ctx.state.clone();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(server, PeerInfo::default(), ctx);
    let handle = conn.handle();
    let task = tokio::spawn(conn.run());
    Harness {
        client: Client {
            stream: client,
            buf: Vec::new(),
        },
        handle,
        task,
        state,
    }
}

struct Response {
    head: String,
    body: String,
}

impl Response {
    fn status(&self) -> u16 {
        self.head[9..12].parse().unwrap()
    }

    fn has_header(&self, line: &str) -> bool {
        self.head.lines().any(|l| l.eq_ignore_ascii_case(line))
    }
}

struct Client {
    stream: DuplexStream,
    buf: Vec<u8>,
}

impl Client {
    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(WAIT, self.stream.read(&mut chunk))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    async fn expect(&mut self, text: &str) {
        while self.buf.len() < text.len() {
            assert!(self.fill().await > 0, "connection closed before {text:?}");
        }
        assert_eq!(String::from_utf8_lossy(&self.buf[..text.len()]), text);
        self.buf.drain(..text.len());
    }

    async fn response(&mut self) -> Response {
        self.read_response(false).await
    }

    async fn head_response(&mut self) -> Response {
        self.read_response(true).await
    }

    async fn read_response(&mut self, head_only: bool) -> Response {
        loop {
            if let Some(response) = self.try_parse(head_only) {
                return response;
            }
            assert!(self.fill().await > 0, "connection closed mid-response");
        }
    }

    fn try_parse(&mut self, head_only: bool) -> Option<Response> {
        let end = self.buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
        let head = String::from_utf8(self.buf[..end].to_vec()).unwrap();
        let lower = head.to_ascii_lowercase();

        if head_only {
            self.buf.drain(..end);
            return Some(Response { head, body: String::new() });
        }

        if let Some(len) = lower
            .lines()
            .find_map(|l| l.strip_prefix("content-length: "))
            .map(|v| v.trim().parse::<usize>().unwrap())
        {
            if self.buf.len() < end + len {
                return None;
            }
            let body = String::from_utf8(self.buf[end..end + len].to_vec()).unwrap();
            self.buf.drain(..end + len);
            return Some(Response { head, body });
        }

        if lower.contains("transfer-encoding: chunked") {
            let mut pos = end;
            let mut body = Vec::new();
            loop {
                let line_end = self.buf[pos..].windows(2).position(|w| w == b"\r\n")? + pos;
                let size_text = std::str::from_utf8(&self.buf[pos..line_end]).unwrap();
                let size = usize::from_str_radix(size_text, 16).unwrap();
                let data_start = line_end + 2;
                if self.buf.len() < data_start + size + 2 {
                    return None;
                }
                if size == 0 {
                    self.buf.drain(..data_start + 2);
                    let body = String::from_utf8(body).unwrap();
                    return Some(Response { head, body });
                }
                body.extend_from_slice(&self.buf[data_start..data_start + size]);
                pos = data_start + size + 2;
            }
        }

        // No framing: the body runs to EOF; callers only use this for
        // bodiless responses.
        self.buf.drain(..end);
        Some(Response { head, body: String::new() })
    }

    /// True once the server closed its side with nothing else pending.
    async fn closed(&mut self) -> bool {
        loop {
            if self.fill().await == 0 {
                return self.buf.is_empty();
            }
        }
    }
}

fn hello_app() -> impl Application {
    app_fn(|scope, mut receive, send| async move {
        if let Scope::Http(_) = scope {
            while let ReceiveEvent::HttpRequest { more_body: true, .. } = receive.receive().await {}
            send.send(SendMessage::start(
                200,
                vec![(Bytes::from_static(b"content-type"), Bytes::from_static(b"text/plain"))],
            ))
            .await?;
            send.send(SendMessage::body("Hello, world", false)).await?;
        }
        Ok(())
    })
}

async fn read_body(receive: &mut AppReceiver) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        match receive.receive().await {
            ReceiveEvent::HttpRequest { body: chunk, more_body } => {
                body.extend_from_slice(&chunk);
                if !more_body {
                    return Some(body);
                }
            }
            _ => return None,
        }
    }
}

fn echo_app() -> impl Application {
    app_fn(|_scope, mut receive, send: AppSender| async move {
        let body = read_body(&mut receive).await.unwrap_or_default();
        send.send(SendMessage::start(200, vec![])).await?;
        send.send(SendMessage::body(body, false)).await?;
        Ok(())
    })
}

#[tokio::test]
async fn test_simple_get() {
    let mut h = start(test_config(), hello_app());
    h.client.send(SIMPLE_GET).await;

    let response = h.client.response().await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.body, "Hello, world");
    assert!(response.has_header("server: portico"));
    assert!(response.head.contains("\r\ndate: "));
    assert!(response.has_header("transfer-encoding: chunked"));
    assert!(!response.head.contains("connection: close"));
    assert_eq!(h.state.total_requests(), 1);
}

#[tokio::test]
async fn test_keep_alive_serves_sequential_requests() {
    let mut h = start(test_config(), hello_app());
    for _ in 0..3 {
        h.client.send(SIMPLE_GET).await;
        assert_eq!(h.client.response().await.body, "Hello, world");
    }
    assert_eq!(h.state.total_requests(), 3);
}

#[tokio::test]
async fn test_pipelined_requests_are_answered_in_order() {
    let app = app_fn(|scope, mut receive, send| async move {
        let Scope::Http(scope) = scope else {
            return Ok(());
        };
        read_body(&mut receive).await;
        send.send(SendMessage::start(200, vec![])).await?;
        send.send(SendMessage::body(scope.path, false)).await?;
        Ok(())
    });
    let mut h = start(test_config(), app);
    h.client
        .send(b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\nGET /three HTTP/1.1\r\n\r\n")
        .await;

    assert_eq!(h.client.response().await.body, "/one");
    assert_eq!(h.client.response().await.body, "/two");
    assert_eq!(h.client.response().await.body, "/three");
}

#[tokio::test]
async fn test_post_body_is_delivered() {
    let mut h = start(test_config(), echo_app());
    h.client
        .send(b"POST /echo HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world")
        .await;
    assert_eq!(h.client.response().await.body, "hello world");

    h.client
        .send(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nabcd\r\n2\r\nef\r\n0\r\n\r\n")
        .await;
    assert_eq!(h.client.response().await.body, "abcdef");
}

#[tokio::test]
async fn test_large_body_survives_backpressure() {
    let config = Config {
        flow_high_water: 1024,
        flow_low_water: 256,
        ..test_config()
    };
    let mut h = start(config, echo_app());

    let payload = "x".repeat(32 * 1024);
    let mut request = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", payload.len()).into_bytes();
    request.extend_from_slice(payload.as_bytes());
    h.client.send(&request).await;

    assert_eq!(h.client.response().await.body.len(), payload.len());
}

#[tokio::test]
async fn test_expect_continue() {
    let mut h = start(test_config(), echo_app());
    h.client
        .send(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n")
        .await;
    h.client.expect("HTTP/1.1 100 Continue\r\n\r\n").await;

    h.client.send(b"hello").await;
    let response = h.client.response().await;
    assert_eq!(response.body, "hello");
    assert!(!response.head.contains("connection: close"));
}

#[tokio::test]
async fn test_unread_body_is_discarded_before_next_request() {
    let mut h = start(test_config(), app_fn(|_scope, _receive, send| async move {
        send.send(SendMessage::start(200, vec![])).await?;
        send.send(SendMessage::body("ignored your body", false)).await?;
        Ok(())
    }));
    h.client
        .send(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET / HTTP/1.1\r\n\r\n")
        .await;
    assert_eq!(h.client.response().await.status(), 200);
    assert_eq!(h.client.response().await.status(), 200);
}

#[tokio::test]
async fn test_head_request_gets_headers_only() {
    let app = app_fn(|_scope, _receive, send| async move {
        send.send(SendMessage::start(
            200,
            vec![(Bytes::from_static(b"content-length"), Bytes::from_static(b"5"))],
        ))
        .await?;
        send.send(SendMessage::body("hello", false)).await?;
        Ok(())
    });
    let mut h = start(test_config(), app);
    h.client.send(b"HEAD / HTTP/1.1\r\n\r\n").await;
    let response = h.client.head_response().await;
    assert_eq!(response.status(), 200);
    assert!(response.has_header("content-length: 5"));

    // Nothing but the next response may follow.
    h.client.send(b"HEAD / HTTP/1.1\r\n\r\n").await;
    assert!(h.client.head_response().await.head.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn test_app_connection_close_closes() {
    let app = app_fn(|_scope, _receive, send| async move {
        send.send(SendMessage::start(
            200,
            vec![
                (Bytes::from_static(b"connection"), Bytes::from_static(b"close")),
                (Bytes::from_static(b"content-length"), Bytes::from_static(b"2")),
            ],
        ))
        .await?;
        send.send(SendMessage::body("ok", false)).await?;
        Ok(())
    });
    let mut h = start(test_config(), app);
    h.client.send(SIMPLE_GET).await;

    let response = h.client.response().await;
    assert_eq!(response.body, "ok");
    assert!(response.has_header("connection: close"));
    assert!(h.client.closed().await);
}

#[tokio::test]
async fn test_http10_request_closes_after_response() {
    let mut h = start(test_config(), echo_app());
    h.client.send(b"GET / HTTP/1.0\r\n\r\n").await;
    let head = h.client.head_response().await;
    assert!(head.has_header("connection: close"));
    assert!(!head.head.contains("transfer-encoding"));
    // The close-delimited body is empty and the server closes.
    assert!(h.client.closed().await);
}

#[tokio::test]
async fn test_keep_alive_timeout_closes_idle_connection() {
    let config = Config {
        timeout_keep_alive: 0.1,
        ..test_config()
    };
    let mut h = start(config, hello_app());
    h.client.send(SIMPLE_GET).await;
    assert_eq!(h.client.response().await.status(), 200);

    assert!(h.client.closed().await);
    tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrency_limit_answers_503() {
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let app = app_fn(move |_scope, _receive, _send| {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    });
    let config = Config {
        limit_concurrency: Some(0),
        ..test_config()
    };
    let mut h = start(config, app);
    h.client.send(SIMPLE_GET).await;

    let response = h.client.response().await;
    assert_eq!(response.status(), 503);
    assert_eq!(response.body, "Service Unavailable");
    assert!(response.has_header("connection: close"));
    assert!(h.client.closed().await);
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_invalid_request_answers_400() {
    let mut h = start(test_config(), hello_app());
    h.client.send(b"GET / NOT-HTTP\r\n\r\n").await;

    let response = h.client.response().await;
    assert_eq!(response.status(), 400);
    assert_eq!(response.body, "Invalid HTTP request received.");
    assert!(response.has_header("content-type: text/plain; charset=utf-8"));
    assert!(h.client.closed().await);
}

#[tokio::test]
async fn test_app_error_answers_500() {
    let app = app_fn(|_scope, _receive, _send| async move { anyhow::bail!("boom") });
    let mut h = start(test_config(), app);
    h.client.send(SIMPLE_GET).await;

    let response = h.client.response().await;
    assert_eq!(response.status(), 500);
    assert_eq!(response.body, "Internal Server Error");
    assert!(h.client.closed().await);
}

#[tokio::test]
async fn test_app_returning_without_response_answers_500() {
    let mut h = start(test_config(), app_fn(|_scope, _receive, _send| async move { Ok(()) }));
    h.client.send(SIMPLE_GET).await;
    assert_eq!(h.client.response().await.status(), 500);
}

#[tokio::test]
async fn test_app_failing_mid_response_closes() {
    let app = app_fn(|_scope, _receive, send| async move {
        send.send(SendMessage::start(200, vec![])).await?;
        send.send(SendMessage::body("partial", true)).await?;
        anyhow::bail!("gave up")
    });
    let mut h = start(test_config(), app);
    h.client.send(SIMPLE_GET).await;

    let response = h.client.head_response().await;
    assert_eq!(response.status(), 200);
    // The chunked body never terminates; the connection just ends.
    loop {
        if h.client.fill().await == 0 {
            break;
        }
    }
    let rest = String::from_utf8_lossy(&h.client.buf).into_owned();
    assert!(rest.contains("partial"));
    assert!(!rest.ends_with("0\r\n\r\n"));
}

#[tokio::test]
async fn test_protocol_violation_surfaces_to_app() {
    let (tx, rx) = oneshot::channel::<String>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    let app = app_fn(move |_scope, _receive, send| {
        let tx = tx.clone();
        async move {
            let err = send.send(SendMessage::body("no start", false)).await.unwrap_err();
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(err.to_string());
            }
            Err(err.into())
        }
    });
    let mut h = start(test_config(), app);
    h.client.send(SIMPLE_GET).await;

    let message = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(message.contains("http.response.start"));
    assert_eq!(h.client.response().await.status(), 500);
}

#[tokio::test]
async fn test_client_disconnect_reaches_app() {
    let (tx, rx) = oneshot::channel::<bool>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    let app = app_fn(move |_scope, mut receive, _send| {
        let tx = tx.clone();
        async move {
            let disconnected = read_body(&mut receive).await.is_none();
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(disconnected);
            }
            Ok(())
        }
    });
    let mut h = start(test_config(), app);
    h.client
        .send(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\nonly a little")
        .await;
    h.client.stream.shutdown().await.unwrap();

    assert!(tokio::time::timeout(WAIT, rx).await.unwrap().unwrap());
    tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_while_idle_closes() {
    let mut h = start(test_config(), hello_app());
    h.client.send(SIMPLE_GET).await;
    assert_eq!(h.client.response().await.status(), 200);

    h.handle.trigger_shutdown();
    assert!(h.client.closed().await);
    tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_mid_response_finishes_then_closes() {
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let app = app_fn(move |_scope, _receive, send| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            send.send(SendMessage::start(200, vec![])).await?;
            send.send(SendMessage::body("finished", false)).await?;
            Ok(())
        }
    });
    let mut h = start(test_config(), app);
    h.client.send(SIMPLE_GET).await;

    // Let the cycle start before asking the connection to stop.
    while h.state.task_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.handle.trigger_shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_one();

    let response = h.client.response().await;
    assert_eq!(response.body, "finished");
    assert!(response.has_header("connection: close"));
    assert!(h.client.closed().await);
}

#[tokio::test]
async fn test_force_close_abandons_the_cycle() {
    let app = app_fn(|_scope, _receive, _send| async move {
        std::future::pending::<()>().await;
        Ok(())
    });
    let mut h = start(test_config(), app);
    h.client.send(SIMPLE_GET).await;
    while h.state.task_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.handle.force_close();
    tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
    assert_eq!(h.state.connection_count(), 0);
    assert_eq!(h.state.total_requests(), 0);
    let _ = h.client.closed().await;
}

#[tokio::test]
async fn test_clean_eof_ends_connection() {
    let mut h = start(test_config(), hello_app());
    h.client.stream.shutdown().await.unwrap();
    tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
    assert_eq!(h.state.connection_count(), 0);
}

#[tokio::test]
async fn test_connection_is_registered_before_it_runs() {
    let ctx = context(test_config(), hello_app(), None);
    let state = ctx.state.clone();
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(server, PeerInfo::default(), ctx);
    assert_eq!(state.connection_count(), 1);

    // A drain that starts now sees the connection and asks it to stop.
    client.write_all(SIMPLE_GET).await.unwrap();
    for handle in state.connections() {
        handle.trigger_shutdown();
    }
    let task = tokio::spawn(conn.run());
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(state.connection_count(), 0);
    assert_eq!(state.total_requests(), 0);
}

#[tokio::test]
async fn test_dropping_an_unstarted_connection_unregisters_it() {
    let ctx = context(test_config(), hello_app(), None);
    let state = ctx.state.clone();
    let (_client, server) = tokio::io::duplex(1024);
    let conn = Connection::new(server, PeerInfo::default(), ctx);
    assert_eq!(state.connection_count(), 1);
    drop(conn);
    assert_eq!(state.connection_count(), 0);
}

const WS_REQUEST: &[u8] =
    b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\nFRAME";

/// Reports what it was handed, then waits for a graceful shutdown and says
/// goodbye. With `stubborn` set it ignores shutdown entirely.
struct GoodbyeHandler {
    seen: Mutex<Option<oneshot::Sender<(Bytes, String)>>>,
    stubborn: bool,
}

impl GoodbyeHandler {
    fn new(stubborn: bool) -> (Arc<Self>, oneshot::Receiver<(Bytes, String)>) {
        let (tx, rx) = oneshot::channel();
        let handler = Arc::new(Self {
            seen: Mutex::new(Some(tx)),
            stubborn,
        });
        (handler, rx)
    }
}

impl UpgradeHandler for GoodbyeHandler {
    fn upgrade(
        &self,
        mut transport: Box<dyn Transport>,
        replay: Bytes,
        info: UpgradeInfo,
    ) -> BoxFuture<'static, ()> {
        let seen = self.seen.lock().unwrap().take();
        let stubborn = self.stubborn;
        Box::pin(async move {
            if let Some(seen) = seen {
                let _ = seen.send((replay, info.head.method.as_str().to_string()));
            }
            if stubborn {
                std::future::pending::<()>().await;
            }
            info.handle.shutdown_requested().await;
            let _ = transport.write_all(b"BYE").await;
        })
    }
}

fn never_called() -> impl Application {
    app_fn(|_scope, _receive, _send| async move { anyhow::bail!("upgrade went to the app") })
}

#[tokio::test]
async fn test_websocket_upgrade_replays_request_and_follows_shutdown() {
    let (handler, seen) = GoodbyeHandler::new(false);
    let mut h = start_with(context(test_config(), never_called(), Some(handler)));
    h.client.send(WS_REQUEST).await;

    let (replay, method) = tokio::time::timeout(WAIT, seen).await.unwrap().unwrap();
    assert_eq!(method, "GET");
    assert_eq!(
        &replay[..],
        &b"GET /ws HTTP/1.1\r\nhost: a\r\nconnection: Upgrade\r\nupgrade: websocket\r\n\r\nFRAME"[..]
    );
    assert_eq!(h.state.connection_count(), 1);

    h.handle.trigger_shutdown();
    h.client.expect("BYE").await;
    tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
    assert_eq!(h.state.connection_count(), 0);
    assert!(h.client.closed().await);
}

#[tokio::test]
async fn test_force_close_ends_upgraded_connection() {
    let (handler, seen) = GoodbyeHandler::new(true);
    let mut h = start_with(context(test_config(), never_called(), Some(handler)));
    h.client.send(WS_REQUEST).await;
    tokio::time::timeout(WAIT, seen).await.unwrap().unwrap();

    h.handle.trigger_shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.task.is_finished());

    h.handle.force_close();
    tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
    assert_eq!(h.state.connection_count(), 0);
    assert!(h.client.closed().await);
}
