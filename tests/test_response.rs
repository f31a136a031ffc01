use portico::http::response::{ResponseBuilder, ResponseHead, SimpleResponse, StatusCode};

fn header<'a>(headers: &'a [(bytes::Bytes, bytes::Bytes)], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(k, _)| k.as_ref() == name.as_bytes())
        .map(|(_, v)| v.as_ref())
}

#[test]
fn test_status_code_as_u16() {
    assert_eq!(StatusCode::OK.as_u16(), 200);
    assert_eq!(StatusCode::CREATED.as_u16(), 201);
    assert_eq!(StatusCode::NO_CONTENT.as_u16(), 204);
    assert_eq!(StatusCode::BAD_REQUEST.as_u16(), 400);
    assert_eq!(StatusCode::NOT_FOUND.as_u16(), 404);
    assert_eq!(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), 500);
    assert_eq!(StatusCode::SERVICE_UNAVAILABLE.as_u16(), 503);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    assert_eq!(StatusCode::CREATED.reason_phrase(), "Created");
    assert_eq!(StatusCode::NO_CONTENT.reason_phrase(), "No Content");
    assert_eq!(StatusCode::BAD_REQUEST.reason_phrase(), "Bad Request");
    assert_eq!(StatusCode::NOT_FOUND.reason_phrase(), "Not Found");
    assert_eq!(StatusCode::new(405).reason_phrase(), "Method Not Allowed");
    assert_eq!(StatusCode::INTERNAL_SERVER_ERROR.reason_phrase(), "Internal Server Error");
    assert_eq!(StatusCode::new(599).reason_phrase(), "");
}

#[test]
fn test_informational_range() {
    assert!(StatusCode::CONTINUE.is_informational());
    assert!(StatusCode::SWITCHING_PROTOCOLS.is_informational());
    assert!(!StatusCode::OK.is_informational());
}

#[test]
fn test_response_head_takes_reason_from_status() {
    let head = ResponseHead::new(StatusCode::NOT_MODIFIED, vec![]);
    assert_eq!(head.reason, "Not Modified");
}

#[test]
fn test_response_builder_basic() {
    let response = ResponseBuilder::new(StatusCode::OK)
        .body(&b"Hello, World!"[..])
        .build();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, "Hello, World!");
    assert_eq!(header(&response.headers, "content-length"), Some(&b"13"[..]));
    assert_eq!(header(&response.headers, "connection"), None);
}

#[test]
fn test_response_builder_lowercases_names() {
    let response = ResponseBuilder::new(StatusCode::CREATED)
        .header("Location", "/items/1")
        .build();
    assert_eq!(header(&response.headers, "location"), Some(&b"/items/1"[..]));
    assert_eq!(header(&response.headers, "content-length"), Some(&b"0"[..]));
}

#[test]
fn test_response_builder_respects_explicit_length() {
    let response = ResponseBuilder::new(StatusCode::OK)
        .header("content-length", "0")
        .body("ignored by HEAD")
        .build();
    let lengths = response
        .headers
        .iter()
        .filter(|(k, _)| k.as_ref() == b"content-length")
        .count();
    assert_eq!(lengths, 1);
}

#[test]
fn test_simple_responses_close_the_connection() {
    for (response, status, body) in [
        (SimpleResponse::bad_request(), 400, "Invalid HTTP request received."),
        (SimpleResponse::internal_error(), 500, "Internal Server Error"),
        (SimpleResponse::service_unavailable(), 503, "Service Unavailable"),
    ] {
        assert_eq!(response.status.as_u16(), status);
        assert_eq!(response.body, body);
        assert_eq!(
            header(&response.headers, "content-type"),
            Some(&b"text/plain; charset=utf-8"[..])
        );
        assert_eq!(header(&response.headers, "connection"), Some(&b"close"[..]));
    }
}

#[test]
fn test_into_parts() {
    let (head, body) = SimpleResponse::service_unavailable().into_parts();
    assert_eq!(head.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(head.reason, "Service Unavailable");
    assert_eq!(body, "Service Unavailable");
}
