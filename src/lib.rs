//! Portico - HTTP/1.1 application server
//!
//! Terminates HTTP/1.1 connections and bridges every request to an
//! [`asgi::Application`] through the `(scope, receive, send)` interface.

pub mod asgi;
pub mod config;
pub mod error;
pub mod http;
pub mod lifespan;
pub mod server;
