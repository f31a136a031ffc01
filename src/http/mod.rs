//! HTTP/1.1 protocol implementation.
//!
//! # Architecture
//!
//! - **`connection`**: per-connection handler driving requests through the application
//! - **`parser`**: protocol engine (request parsing, framing, joint state machine)
//! - **`state`**: the client/server state machine shared by every parser strategy
//! - **`request`** / **`response`**: message heads and ready-made error responses
//! - **`event`**: what the engine emits and accepts
//! - **`writer`**: response serialization and body framing
//! - **`body`**: request body hand-off between connection and application
//! - **`flow`**: read/write backpressure
//! - **`keepalive`**: idle timer between requests
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │  Connected  │
//!        └──────┬──────┘
//!               ▼
//!        ┌─────────────┐  EOF / bad request / shutdown / keep-alive timeout
//!   ┌───►│    Idle     │──────────────────────────────────────────┐
//!   │    └──────┬──────┘                                          │
//!   │           │ request head                                    │
//!   │           ├──────────────────────┐ upgrade: websocket       │
//!   │           ▼                      ▼                          │
//!   │    ┌─────────────────┐   ┌─────────────┐                    │
//!   │    │  RequestActive  │   │  Upgrading  │──► handed off      │
//!   │    └──────┬──────────┘   └─────────────┘                    │
//!   │           │ response complete                               │
//!   └───────────┤ keep-alive                                      │
//!               │ close                                           │
//!               ▼                                                 │
//!        ┌──────────────┐                                         │
//!        │ ShuttingDown │◄────────────────────────────────────────┘
//!        └──────┬───────┘
//!               ▼
//!           Closed
//! ```

pub mod body;
pub mod connection;
pub mod event;
pub mod flow;
pub mod keepalive;
pub mod parser;
pub mod request;
pub mod response;
pub mod state;
pub mod writer;
