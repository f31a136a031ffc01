//! Idle timeout between requests on a persistent connection.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::server::state::ConnectionHandle;

/// One-shot idle timer. At most one is armed at any time.
///
/// On expiry it asks the connection to shut down gracefully; the connection
/// only acts on that while idle, so an expiring timer never cuts a request
/// short.
#[derive(Debug)]
pub struct KeepAlive {
    timeout: Duration,
    handle: ConnectionHandle,
    timer: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn new(timeout: Duration, handle: ConnectionHandle) -> Self {
        Self {
            timeout,
            handle,
            timer: None,
        }
    }

    /// Arms the timer, replacing any armed one.
    pub fn schedule(&mut self) {
        self.reset();
        let timeout = self.timeout;
        let handle = self.handle.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::debug!(conn = handle.id(), "Keep-alive timeout expired");
            handle.trigger_shutdown();
        }));
    }

    pub fn reset(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn close(&mut self) {
        self.reset();
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.reset();
    }
}
