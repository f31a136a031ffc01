//! One request/response exchange between the connection and the application.
//!
//! The cycle owns no I/O. The connection feeds it the application's send
//! messages and writes whatever engine events come back; when the
//! application task ends, [`RequestResponseCycle::finish`] says how to
//! clean up.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::asgi::{HttpScope, SendMessage};
use crate::error::AppError;
use crate::http::body::PendingBody;
use crate::http::event::OutboundEvent;
use crate::http::request::Header;
use crate::http::response::{ResponseHead, StatusCode};

/// How the connection should wrap up after the application returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A full response went out.
    Complete,
    /// Nothing was sent yet: answer with a 500.
    SendInternalError,
    /// A partial response went out and cannot be corrected.
    CloseTransport,
}

#[derive(Debug)]
pub struct RequestResponseCycle {
    conn_id: u64,
    method: String,
    target: String,
    http_version: &'static str,
    client: Option<SocketAddr>,
    body: Arc<PendingBody>,
    default_headers: Arc<Vec<Header>>,
    access_log: bool,
    keep_alive: bool,
    is_head: bool,
    response_started: bool,
    response_complete: bool,
}

impl RequestResponseCycle {
    pub fn new(
        conn_id: u64,
        scope: &HttpScope,
        body: Arc<PendingBody>,
        default_headers: Arc<Vec<Header>>,
        access_log: bool,
    ) -> Self {
        Self {
            conn_id,
            method: scope.method.clone(),
            target: scope.path_with_query(),
            http_version: scope.http_version,
            client: scope.client,
            body,
            default_headers,
            access_log,
            keep_alive: true,
            is_head: scope.method == "HEAD",
            response_started: false,
            response_complete: false,
        }
    }

    /// Any response not yet started will carry `connection: close`.
    pub fn disable_keep_alive(&mut self) {
        self.keep_alive = false;
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn response_complete(&self) -> bool {
        self.response_complete
    }

    /// Validates one application message and translates it into engine
    /// events.
    pub fn on_send(&mut self, message: SendMessage) -> Result<Vec<OutboundEvent>, AppError> {
        if !self.response_started {
            let SendMessage::HttpResponseStart { status, headers } = message else {
                return Err(AppError::UnexpectedMessage {
                    expected: "http.response.start",
                    got: message.type_name(),
                });
            };
            if !(200..=599).contains(&status) {
                return Err(AppError::InvalidStatus(status));
            }

            self.response_started = true;

            let mut all = Vec::with_capacity(self.default_headers.len() + headers.len() + 1);
            all.extend(self.default_headers.iter().cloned());
            all.extend(headers);
            if !self.keep_alive {
                all.push((Bytes::from_static(b"connection"), Bytes::from_static(b"close")));
            }

            if self.access_log {
                let client = self
                    .client
                    .map_or_else(|| "-".to_string(), |addr| addr.to_string());
                tracing::info!(
                    target: "portico::access",
                    "{} - \"{} {} HTTP/{}\" {}",
                    client,
                    self.method,
                    self.target,
                    self.http_version,
                    status
                );
            }

            let head = ResponseHead::new(StatusCode::new(status), all);
            return Ok(vec![OutboundEvent::Response(head)]);
        }

        if self.response_complete {
            return Err(AppError::AfterComplete(message.type_name()));
        }

        let SendMessage::HttpResponseBody { body, more_body } = message else {
            return Err(AppError::UnexpectedMessage {
                expected: "http.response.body",
                got: message.type_name(),
            });
        };

        let mut events = Vec::with_capacity(2);
        if !self.is_head && !body.is_empty() {
            events.push(OutboundEvent::Data(body));
        }
        if !more_body {
            self.response_complete = true;
            self.body.set_response_complete();
            events.push(OutboundEvent::EndOfMessage);
        }
        Ok(events)
    }

    /// Decides the cleanup once the application task is over. `error` is
    /// the failure it ended with, if any.
    pub fn finish(&self, error: Option<&str>) -> CycleOutcome {
        match error {
            Some(err) => {
                tracing::error!(conn = self.conn_id, error = %err, "Exception in ASGI application");
                if self.response_started {
                    CycleOutcome::CloseTransport
                } else {
                    CycleOutcome::SendInternalError
                }
            }
            None if !self.response_started => {
                tracing::error!(conn = self.conn_id, "ASGI callable returned without starting response.");
                CycleOutcome::SendInternalError
            }
            None if !self.response_complete => {
                tracing::error!(conn = self.conn_id, "ASGI callable returned without completing response.");
                CycleOutcome::CloseTransport
            }
            None => CycleOutcome::Complete,
        }
    }
}
