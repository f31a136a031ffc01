//! Events exchanged with the protocol engine.
//!
//! [`Event`] is what the engine hands back from `next_event`; [`OutboundEvent`]
//! is what the connection hands to `send`. Both are closed sets so every
//! caller has to match them exhaustively.

use bytes::Bytes;

use crate::http::request::RequestHead;
use crate::http::response::ResponseHead;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete request head was parsed.
    Request(RequestHead),
    /// A piece of request body.
    Data(Bytes),
    /// The request body is complete.
    EndOfMessage,
    /// The peer closed its side cleanly.
    ConnectionClosed,
    /// More bytes are required before the next event can be produced.
    NeedData,
    /// The current cycle is finished but bytes of a later request are
    /// already buffered. Nothing else happens until `start_next_cycle`.
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// A `1xx` interim response (e.g. `100 Continue`).
    InformationalResponse(ResponseHead),
    Response(ResponseHead),
    Data(Bytes),
    EndOfMessage,
    /// We are closing our side; produces no bytes.
    ConnectionClosed,
}

impl OutboundEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            OutboundEvent::InformationalResponse(_) => "InformationalResponse",
            OutboundEvent::Response(_) => "Response",
            OutboundEvent::Data(_) => "Data",
            OutboundEvent::EndOfMessage => "EndOfMessage",
            OutboundEvent::ConnectionClosed => "ConnectionClosed",
        }
    }
}
