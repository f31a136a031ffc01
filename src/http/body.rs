//! The request body as the application sees it.
//!
//! The connection task pushes decoded chunks into a [`PendingBody`]; the
//! application pulls them with [`PendingBody::read`]. Each read returns
//! everything buffered so far, so at most one read is ever outstanding
//! per request.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::http::flow::FlowControl;

/// Result of one application read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyRead {
    Chunk { body: Bytes, more_body: bool },
    /// The client went away, or the response already finished.
    Disconnected,
}

#[derive(Debug, Default)]
struct Inner {
    buf: BytesMut,
    end_of_body: bool,
    end_delivered: bool,
    disconnected: bool,
    response_complete: bool,
}

#[derive(Debug)]
pub struct PendingBody {
    inner: Mutex<Inner>,
    changed: Notify,
    wanted: Notify,
    flow: Arc<FlowControl>,
}

impl PendingBody {
    pub fn new(flow: Arc<FlowControl>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            changed: Notify::new(),
            wanted: Notify::new(),
            flow,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let len = data.len();
        self.lock().buf.extend_from_slice(&data);
        self.flow.on_buffered(len);
        self.changed.notify_one();
    }

    /// The whole body has been received.
    pub fn finish(&self) {
        self.lock().end_of_body = true;
        self.changed.notify_one();
    }

    pub fn disconnect(&self) {
        self.lock().disconnected = true;
        self.changed.notify_one();
    }

    pub fn set_response_complete(&self) {
        self.lock().response_complete = true;
        self.changed.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.lock().end_of_body
    }

    pub fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }

    /// Completes when the application is blocked on a read with nothing
    /// buffered. Used to send `100 Continue` lazily.
    pub async fn wanted(&self) {
        self.wanted.notified().await
    }

    pub async fn read(&self) -> BodyRead {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.disconnected || inner.response_complete {
                    return BodyRead::Disconnected;
                }
                if !inner.end_delivered && (!inner.buf.is_empty() || inner.end_of_body) {
                    let body = inner.buf.split().freeze();
                    let more_body = !inner.end_of_body;
                    inner.end_delivered = !more_body;
                    drop(inner);
                    self.flow.on_consumed(body.len());
                    return BodyRead::Chunk { body, more_body };
                }
                if !inner.end_delivered {
                    self.wanted.notify_one();
                }
            }

            notified.await;
        }
    }
}
