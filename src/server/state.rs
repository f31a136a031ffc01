//! Process-wide state shared by every connection.
//!
//! Counters are atomics, the registries are short-held mutexes, and the
//! default-header snapshot is swapped as a whole `Arc` so readers never see
//! a half-updated list.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;

use bytes::Bytes;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::config::Config;
use crate::http::request::Header;

/// Control handle for one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    graceful: CancellationToken,
    force: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(id: u64) -> Self {
        let force = CancellationToken::new();
        // Forcing a close also counts as a shutdown request.
        let graceful = force.child_token();
        Self {
            id,
            graceful,
            force,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Close once the connection is idle; an in-flight cycle may finish.
    pub fn trigger_shutdown(&self) {
        self.graceful.cancel();
    }

    /// Abandon everything, including the linger read.
    pub fn force_close(&self) {
        self.force.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_force_closed(&self) -> bool {
        self.force.is_cancelled()
    }

    pub fn shutdown_requested(&self) -> WaitForCancellationFuture<'_> {
        self.graceful.cancelled()
    }

    pub fn force_closed(&self) -> WaitForCancellationFuture<'_> {
        self.force.cancelled()
    }
}

#[derive(Debug)]
pub struct ServerState {
    total_requests: AtomicU64,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    tasks: Mutex<HashSet<u64>>,
    next_task_id: AtomicU64,
    default_headers: RwLock<Arc<Vec<Header>>>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerState {
    pub fn new(default_headers: Vec<Header>) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashSet::new()),
            next_task_id: AtomicU64::new(1),
            default_headers: RwLock::new(Arc::new(default_headers)),
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Acquire)
    }

    /// Counts one completed cycle. Returns the new total.
    pub fn record_request(&self) -> u64 {
        self.total_requests.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Adds the connection to the registry until the guard drops.
    pub fn register_connection(self: &Arc<Self>, handle: ConnectionHandle) -> ConnectionGuard {
        let id = handle.id();
        lock(&self.connections).insert(id, handle);
        ConnectionGuard {
            state: Arc::clone(self),
            id,
        }
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        lock(&self.connections).values().cloned().collect()
    }

    /// Registers one in-flight application task.
    pub fn register_task(self: &Arc<Self>) -> TaskGuard {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.tasks).insert(id);
        TaskGuard {
            state: Arc::clone(self),
            id,
        }
    }

    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Current snapshot. Cheap to clone, never changes under the reader.
    pub fn default_headers(&self) -> Arc<Vec<Header>> {
        Arc::clone(&self.default_headers.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_default_headers(&self, headers: Vec<Header>) {
        *self
            .default_headers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(headers);
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    state: Arc<ServerState>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        lock(&self.state.connections).remove(&self.id);
    }
}

#[derive(Debug)]
pub struct TaskGuard {
    state: Arc<ServerState>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        lock(&self.state.tasks).remove(&self.id);
    }
}

/// `date`, `server` and operator headers, in that order.
pub fn build_default_headers(config: &Config, now: SystemTime) -> Vec<Header> {
    let mut headers = Vec::with_capacity(config.headers.len() + 2);
    if config.date_header {
        headers.push((
            Bytes::from_static(b"date"),
            Bytes::from(httpdate::fmt_http_date(now)),
        ));
    }
    if config.server_header {
        headers.push((Bytes::from_static(b"server"), Bytes::from_static(b"portico")));
    }
    for (name, value) in &config.headers {
        headers.push((
            Bytes::from(name.to_ascii_lowercase()),
            Bytes::from(value.clone()),
        ));
    }
    headers
}
