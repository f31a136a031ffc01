use std::sync::Arc;

use bytes::Bytes;
use portico::asgi::cycle::{CycleOutcome, RequestResponseCycle};
use portico::asgi::{HttpScope, SendMessage};
use portico::error::AppError;
use portico::http::body::{BodyRead, PendingBody};
use portico::http::event::OutboundEvent;
use portico::http::flow::FlowControl;
use portico::http::request::{Header, Method, RequestHead, Version};

fn h(name: &'static str, value: &'static str) -> Header {
    (Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes()))
}

fn cycle_for(method: Method, target: &'static str) -> (RequestResponseCycle, Arc<PendingBody>) {
    let head = RequestHead::new(
        method,
        Bytes::from_static(target.as_bytes()),
        Version::Http11,
        vec![h("host", "example.org")],
    );
    let scope = HttpScope::from_request(&head, "", None, None);
    let body = PendingBody::new(Arc::new(FlowControl::default()));
    let defaults = Arc::new(vec![h("server", "portico")]);
    let cycle = RequestResponseCycle::new(1, &scope, body.clone(), defaults, false);
    (cycle, body)
}

#[test]
fn test_scope_from_request() {
    let head = RequestHead::new(
        Method::GET,
        Bytes::from_static(b"/caf%C3%A9/x?q=1"),
        Version::Http11,
        vec![h("Host", "example.org")],
    );
    let scope = HttpScope::from_request(&head, "/api", None, None);
    assert_eq!(scope.method, "GET");
    assert_eq!(scope.http_version, "1.1");
    assert_eq!(scope.scheme, "http");
    assert_eq!(scope.root_path, "/api");
    assert_eq!(scope.path, "/api/café/x");
    assert_eq!(scope.raw_path, "/caf%C3%A9/x");
    assert_eq!(scope.query_string, "q=1");
    assert_eq!(scope.asgi.version, "3.0");
    assert_eq!(scope.headers, vec![h("host", "example.org")]);
    assert_eq!(scope.path_with_query(), "/api/café/x?q=1");
}

#[test]
fn test_response_start_prepends_default_headers() {
    let (mut cycle, _) = cycle_for(Method::GET, "/");
    let events = cycle
        .on_send(SendMessage::start(200, vec![h("content-type", "text/plain")]))
        .unwrap();

    let [OutboundEvent::Response(head)] = events.as_slice() else {
        panic!("expected a single response event, got {events:?}");
    };
    assert_eq!(head.status.as_u16(), 200);
    assert_eq!(head.headers, vec![h("server", "portico"), h("content-type", "text/plain")]);
    assert!(cycle.response_started());
    assert!(!cycle.response_complete());
}

#[test]
fn test_disabled_keep_alive_adds_connection_close() {
    let (mut cycle, _) = cycle_for(Method::GET, "/");
    cycle.disable_keep_alive();
    let events = cycle.on_send(SendMessage::start(200, vec![])).unwrap();
    let OutboundEvent::Response(head) = &events[0] else {
        panic!("expected a response");
    };
    assert!(head.headers.contains(&h("connection", "close")));
}

#[test]
fn test_body_before_start_is_rejected() {
    let (mut cycle, _) = cycle_for(Method::GET, "/");
    let err = cycle.on_send(SendMessage::body("early", false)).unwrap_err();
    assert!(matches!(
        err,
        AppError::UnexpectedMessage {
            expected: "http.response.start",
            got: "http.response.body"
        }
    ));
    assert!(!cycle.response_started());
}

#[test]
fn test_second_start_is_rejected() {
    let (mut cycle, _) = cycle_for(Method::GET, "/");
    cycle.on_send(SendMessage::start(200, vec![])).unwrap();
    let err = cycle.on_send(SendMessage::start(200, vec![])).unwrap_err();
    assert!(matches!(err, AppError::UnexpectedMessage { expected: "http.response.body", .. }));
}

#[test]
fn test_invalid_status_is_rejected() {
    for status in [99, 101, 600] {
        let (mut cycle, _) = cycle_for(Method::GET, "/");
        let err = cycle.on_send(SendMessage::start(status, vec![])).unwrap_err();
        assert!(matches!(err, AppError::InvalidStatus(s) if s == status));
    }
}

#[test]
fn test_streaming_body_then_completion() {
    let (mut cycle, body) = cycle_for(Method::GET, "/");
    cycle.on_send(SendMessage::start(200, vec![])).unwrap();

    let events = cycle.on_send(SendMessage::body("abc", true)).unwrap();
    assert_eq!(events, vec![OutboundEvent::Data(Bytes::from_static(b"abc"))]);

    let events = cycle.on_send(SendMessage::body("def", false)).unwrap();
    assert_eq!(
        events,
        vec![OutboundEvent::Data(Bytes::from_static(b"def")), OutboundEvent::EndOfMessage]
    );
    assert!(cycle.response_complete());
    assert!(!body.is_disconnected());
}

#[tokio::test]
async fn test_completion_wakes_pending_receive() {
    let (mut cycle, body) = cycle_for(Method::GET, "/");
    body.finish();
    assert!(matches!(body.read().await, BodyRead::Chunk { more_body: false, .. }));

    cycle.on_send(SendMessage::start(204, vec![])).unwrap();
    cycle.on_send(SendMessage::body(Bytes::new(), false)).unwrap();
    assert_eq!(body.read().await, BodyRead::Disconnected);
}

#[test]
fn test_send_after_completion_is_rejected() {
    let (mut cycle, _) = cycle_for(Method::GET, "/");
    cycle.on_send(SendMessage::start(200, vec![])).unwrap();
    cycle.on_send(SendMessage::body("done", false)).unwrap();
    let err = cycle.on_send(SendMessage::body("more", false)).unwrap_err();
    assert!(matches!(err, AppError::AfterComplete("http.response.body")));
}

#[test]
fn test_head_request_drops_body_bytes() {
    let (mut cycle, _) = cycle_for(Method::HEAD, "/");
    cycle.on_send(SendMessage::start(200, vec![h("content-length", "5")])).unwrap();
    let events = cycle.on_send(SendMessage::body("hello", false)).unwrap();
    assert_eq!(events, vec![OutboundEvent::EndOfMessage]);
}

#[test]
fn test_empty_chunks_are_not_forwarded() {
    let (mut cycle, _) = cycle_for(Method::GET, "/");
    cycle.on_send(SendMessage::start(200, vec![])).unwrap();
    let events = cycle.on_send(SendMessage::body(Bytes::new(), true)).unwrap();
    assert!(events.is_empty());
}

#[test]
fn test_finish_outcomes() {
    let (cycle, _) = cycle_for(Method::GET, "/");
    assert_eq!(cycle.finish(Some("boom")), CycleOutcome::SendInternalError);
    assert_eq!(cycle.finish(None), CycleOutcome::SendInternalError);

    let (mut cycle, _) = cycle_for(Method::GET, "/");
    cycle.on_send(SendMessage::start(200, vec![])).unwrap();
    assert_eq!(cycle.finish(None), CycleOutcome::CloseTransport);
    assert_eq!(cycle.finish(Some("boom")), CycleOutcome::CloseTransport);

    cycle.on_send(SendMessage::body("ok", false)).unwrap();
    assert_eq!(cycle.finish(None), CycleOutcome::Complete);
}
