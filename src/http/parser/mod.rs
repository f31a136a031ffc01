//! The connection protocol engine.
//!
//! One [`HttpParser`] instance per connection turns received bytes into
//! [`Event`]s and outgoing [`OutboundEvent`]s into bytes, keeping the joint
//! client/server state in between. Two request-head strategies exist
//! ([`ParserKind::Portable`] and [`ParserKind::Httparse`]); everything else
//! (state machine, body decoding, response framing) is shared, so they are
//! indistinguishable at the event level.
//!
//! ```
//! use portico::http::event::Event;
//! use portico::http::parser::{self, HttpParser, ParserKind};
//!
//! let mut engine = parser::build(ParserKind::Portable, 16 * 1024);
//! engine.receive_data(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n").unwrap();
//! assert!(matches!(engine.next_event().unwrap(), Event::Request(_)));
//! assert_eq!(engine.next_event().unwrap(), Event::EndOfMessage);
//! ```

mod body;
mod fast;
mod portable;

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;

use crate::error::ProtocolError;
use crate::http::event::{Event, OutboundEvent};
use crate::http::request::{Method, RequestHead, Version, comma_tokens};
use crate::http::response::ResponseHead;
use crate::http::state::{ConnectionState, EventType, Role, State};
use crate::http::writer::{self, BodyWriter, Framing, set_comma_header};

use self::body::{BodyDecoder, Decoded};
use self::fast::HttparseHead;
use self::portable::PortableHead;

/// Upper bound on request header fields.
pub const MAX_HEADERS: usize = 100;

/// Selects the request-head parsing strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    /// Use the fastest strategy available (currently `httparse`).
    #[default]
    Auto,
    Portable,
    Httparse,
}

/// The narrow interface the connection handler drives.
pub trait HttpParser: Send {
    /// Feeds received bytes; an empty slice signals EOF from the peer.
    fn receive_data(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Returns the next event, [`Event::NeedData`] or [`Event::Paused`].
    fn next_event(&mut self) -> Result<Event, ProtocolError>;

    /// Serializes an outgoing event. `None` for [`OutboundEvent::ConnectionClosed`].
    fn send(&mut self, event: OutboundEvent) -> Result<Option<Bytes>, ProtocolError>;

    /// `(client, server)`.
    fn states(&self) -> (State, State);

    /// Resets `(Done, Done)` to `(Idle, Idle)`; anything else is an error.
    fn start_next_cycle(&mut self) -> Result<(), ProtocolError>;

    fn they_are_waiting_for_100_continue(&self) -> bool;

    /// Takes whatever bytes are buffered but unparsed, plus the EOF flag.
    fn take_trailing_data(&mut self) -> (Bytes, bool);
}

/// Request-head parsing, the only part the strategies disagree on.
pub(crate) trait HeadParser: Send {
    /// `Ok(None)` while the head is incomplete. On success returns the head
    /// and how many bytes of `buf` it occupied.
    fn parse_head(&self, buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProtocolError>;
}

/// Builds a fresh engine for one connection.
pub fn build(kind: ParserKind, max_incomplete_event_size: usize) -> Box<dyn HttpParser> {
    match kind {
        ParserKind::Portable => Box::new(Engine::new(PortableHead, max_incomplete_event_size)),
        ParserKind::Auto | ParserKind::Httparse => {
            Box::new(Engine::new(HttparseHead, max_incomplete_event_size))
        }
    }
}

struct Engine<H> {
    head: H,
    state: ConnectionState,
    recv: BytesMut,
    recv_closed: bool,
    decoder: Option<BodyDecoder>,
    writer: Option<BodyWriter>,
    request_method: Option<Method>,
    their_version: Option<Version>,
    waiting_for_100: bool,
    max_incomplete: usize,
}

impl<H: HeadParser> Engine<H> {
    fn new(head: H, max_incomplete: usize) -> Self {
        Self {
            head,
            state: ConnectionState::new(),
            recv: BytesMut::new(),
            recv_closed: false,
            decoder: None,
            writer: None,
            request_method: None,
            their_version: None,
            waiting_for_100: false,
            max_incomplete,
        }
    }

    fn extract_next_event(&mut self) -> Result<Event, ProtocolError> {
        match self.state.get(Role::Client) {
            State::Idle => {
                if let Some((head, used)) = self.head.parse_head(&self.recv)? {
                    self.recv.advance(used);
                    return Ok(Event::Request(head));
                }
                if self.recv.len() > self.max_incomplete {
                    return Err(ProtocolError::remote("Receive buffer too long"));
                }
                if self.recv_closed {
                    if self.recv.is_empty() {
                        return Ok(Event::ConnectionClosed);
                    }
                    return Err(ProtocolError::remote(
                        "peer unexpectedly closed connection in the middle of a request",
                    ));
                }
                Ok(Event::NeedData)
            }
            State::SendBody => {
                let decoder = self
                    .decoder
                    .as_mut()
                    .ok_or_else(|| ProtocolError::local("no body decoder"))?;
                match decoder.decode(&mut self.recv)? {
                    Decoded::Data(data) => Ok(Event::Data(data)),
                    Decoded::End => Ok(Event::EndOfMessage),
                    Decoded::NeedData if self.recv_closed => {
                        Err(ProtocolError::remote(decoder.eof_message()))
                    }
                    Decoded::NeedData => Ok(Event::NeedData),
                }
            }
            State::Done if !self.recv.is_empty() => Ok(Event::Paused),
            State::Done | State::MustClose | State::Closed => {
                if !self.recv.is_empty() {
                    return Err(ProtocolError::remote("Got data when expecting EOF"));
                }
                if self.recv_closed {
                    Ok(Event::ConnectionClosed)
                } else {
                    Ok(Event::NeedData)
                }
            }
            State::SendResponse | State::Error => Err(ProtocolError::remote(format!(
                "Can't receive data when peer state is {}",
                self.state.get(Role::Client)
            ))),
        }
    }

    fn process_received(&mut self, event: &Event) -> Result<(), ProtocolError> {
        match event {
            Event::Request(head) => {
                let decoder = self.request_body_decoder(head)?;
                self.state.process_event(Role::Client, EventType::Request)?;
                self.decoder = Some(decoder);
                self.request_method = Some(head.method.clone());
                self.their_version = Some(head.version);
                if !head.keep_alive() {
                    self.state.process_keep_alive_disabled();
                }
                self.waiting_for_100 = head.expects_continue();
            }
            Event::Data(_) => {
                self.state.process_event(Role::Client, EventType::Data)?;
                self.waiting_for_100 = false;
            }
            Event::EndOfMessage => {
                self.state
                    .process_event(Role::Client, EventType::EndOfMessage)?;
                self.decoder = None;
                self.waiting_for_100 = false;
            }
            Event::ConnectionClosed => {
                self.state
                    .process_event(Role::Client, EventType::ConnectionClosed)?;
            }
            Event::NeedData | Event::Paused => {}
        }
        Ok(())
    }

    fn request_body_decoder(&self, head: &RequestHead) -> Result<BodyDecoder, ProtocolError> {
        let te = head.header_tokens("transfer-encoding");
        let has_cl = head.header("content-length").is_some();

        if !te.is_empty() {
            if has_cl {
                return Err(ProtocolError::remote(
                    "Transfer-Encoding and Content-Length are mutually exclusive",
                ));
            }
            if te != [b"chunked".to_vec()] {
                return Err(ProtocolError::remote(
                    "Only Transfer-Encoding: chunked is supported",
                ));
            }
            return Ok(BodyDecoder::chunked(self.max_incomplete));
        }

        let length = writer::content_length(&head.headers)
            .map_err(|_| ProtocolError::remote("bad Content-Length"))?
            .unwrap_or(0);
        Ok(BodyDecoder::content_length(length))
    }

    fn send_inner(&mut self, event: OutboundEvent) -> Result<Option<Bytes>, ProtocolError> {
        let mut out = BytesMut::new();
        match event {
            OutboundEvent::InformationalResponse(head) => {
                if !head.status.is_informational() {
                    return Err(ProtocolError::local(
                        "informational responses need a 1xx status",
                    ));
                }
                self.state
                    .process_event(Role::Server, EventType::InformationalResponse)?;
                self.waiting_for_100 = false;
                writer::write_head(&head, &mut out)?;
            }
            OutboundEvent::Response(head) => {
                if head.status.as_u16() < 200 {
                    return Err(ProtocolError::local("final responses need status >= 200"));
                }
                let (head, framing) = self.prepare_response(head)?;
                self.state.process_event(Role::Server, EventType::Response)?;
                let closing = comma_tokens(&head.headers, "connection")
                    .iter()
                    .any(|t| t.as_slice() == b"close");
                if closing {
                    self.state.process_keep_alive_disabled();
                }
                self.waiting_for_100 = false;
                writer::write_head(&head, &mut out)?;
                self.writer = Some(BodyWriter::new(framing));
            }
            OutboundEvent::Data(data) => {
                self.state.process_event(Role::Server, EventType::Data)?;
                self.body_writer()?.write_data(&data, &mut out)?;
            }
            OutboundEvent::EndOfMessage => {
                self.state
                    .process_event(Role::Server, EventType::EndOfMessage)?;
                self.body_writer()?.write_end(&mut out)?;
                self.writer = None;
            }
            OutboundEvent::ConnectionClosed => {
                self.state
                    .process_event(Role::Server, EventType::ConnectionClosed)?;
                return Ok(None);
            }
        }
        Ok(Some(out.freeze()))
    }

    fn body_writer(&mut self) -> Result<&mut BodyWriter, ProtocolError> {
        self.writer
            .as_mut()
            .ok_or_else(|| ProtocolError::local("no response in progress"))
    }

    /// Normalizes framing and connection headers, and picks the body framing.
    fn prepare_response(
        &mut self,
        mut head: ResponseHead,
    ) -> Result<(ResponseHead, Framing), ProtocolError> {
        let method = self.request_method.clone().unwrap_or(Method::GET);

        // A client still holding its body back for `100 Continue` leaves the
        // stream position unknown.
        if self.waiting_for_100 && self.state.get(Role::Client) == State::SendBody {
            self.state.process_keep_alive_disabled();
        }

        // HEAD responses advertise the headers a GET would have had.
        let header_method = if method == Method::HEAD {
            Method::GET
        } else {
            method.clone()
        };
        let mut need_close = false;
        let declared = writer::declared_framing(&header_method, head.status, &head.headers)?;
        if matches!(declared, None | Some(Framing::Chunked)) {
            set_comma_header(&mut head.headers, "content-length", &[]);
            if self.their_version == Some(Version::Http11) {
                set_comma_header(&mut head.headers, "transfer-encoding", &[b"chunked"]);
            } else {
                set_comma_header(&mut head.headers, "transfer-encoding", &[]);
                if method != Method::HEAD {
                    need_close = true;
                }
            }
        }

        if !self.state.keep_alive() || need_close {
            let mut tokens: Vec<Vec<u8>> = comma_tokens(&head.headers, "connection")
                .into_iter()
                .filter(|t| t.as_slice() != b"keep-alive")
                .collect();
            if !tokens.iter().any(|t| t.as_slice() == b"close") {
                tokens.push(b"close".to_vec());
            }
            tokens.sort();
            let values: Vec<&[u8]> = tokens.iter().map(Vec::as_slice).collect();
            set_comma_header(&mut head.headers, "connection", &values);
        }

        let framing = writer::declared_framing(&method, head.status, &head.headers)?
            .unwrap_or(Framing::CloseDelimited);
        Ok((head, framing))
    }
}

impl<H: HeadParser> HttpParser for Engine<H> {
    fn receive_data(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if data.is_empty() {
            self.recv_closed = true;
            return Ok(());
        }
        if self.recv_closed {
            return Err(ProtocolError::local("received data after EOF"));
        }
        self.recv.extend_from_slice(data);
        Ok(())
    }

    fn next_event(&mut self) -> Result<Event, ProtocolError> {
        let event = self
            .extract_next_event()
            .and_then(|event| self.process_received(&event).map(|()| event));
        match event {
            Ok(event) => {
                tracing::trace!(?event, states = ?self.state.states(), "received event");
                Ok(event)
            }
            Err(e) => {
                self.state.process_error(Role::Client);
                Err(match e {
                    ProtocolError::Local(msg) => ProtocolError::Remote(msg),
                    remote => remote,
                })
            }
        }
    }

    fn send(&mut self, event: OutboundEvent) -> Result<Option<Bytes>, ProtocolError> {
        if self.state.get(Role::Server) == State::Error {
            return Err(ProtocolError::local("Can't send data when our state is ERROR"));
        }
        let name = event.name();
        match self.send_inner(event) {
            Ok(bytes) => {
                tracing::trace!(event = name, states = ?self.state.states(), "sent event");
                Ok(bytes)
            }
            Err(e) => {
                self.state.process_error(Role::Server);
                Err(e)
            }
        }
    }

    fn states(&self) -> (State, State) {
        self.state.states()
    }

    fn start_next_cycle(&mut self) -> Result<(), ProtocolError> {
        self.state.start_next_cycle()?;
        self.decoder = None;
        self.writer = None;
        self.request_method = None;
        self.waiting_for_100 = false;
        Ok(())
    }

    fn they_are_waiting_for_100_continue(&self) -> bool {
        self.waiting_for_100
    }

    fn take_trailing_data(&mut self) -> (Bytes, bool) {
        (self.recv.split().freeze(), self.recv_closed)
    }
}
