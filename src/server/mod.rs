//! Accept loop, periodic tick and coordinated shutdown.
//!
//! ```text
//! lifespan startup ─► bind ─► accept + tick ─┬─ shutdown requested
//!                                            └─ max requests reached
//!        ┌───────────────────────────────────┘
//!        ▼
//! stop accepting ─► trigger_shutdown(all) ─► wait for connections/tasks
//!                                            (force exit skips the wait)
//!        ─► lifespan shutdown
//! ```

pub mod listener;
pub mod state;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::asgi::{Application, BoxFuture};
use crate::config::Config;
use crate::error::ServerError;
use crate::http::connection::{Connection, ConnectionContext, PeerInfo, UpgradeHandler};
use crate::lifespan::Lifespan;
use listener::{Accepted, Listener};
use state::{ServerState, build_default_headers};

const TICK: Duration = Duration::from_millis(100);

/// Ticks between default-header refreshes.
const HEADER_REFRESH_TICKS: u64 = 10;

/// Operator heartbeat, awaited every `timeout_notify` seconds.
pub type NotifyCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Remote control for a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    force_exit: CancellationToken,
}

impl ServerHandle {
    /// Stop accepting and let in-flight requests finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop waiting on connections and skip lifespan shutdown.
    pub fn force_exit(&self) {
        self.force_exit.cancel();
    }
}

pub struct Server {
    config: Arc<Config>,
    app: Arc<dyn Application>,
    upgrade: Option<Arc<dyn UpgradeHandler>>,
    notify: Option<NotifyCallback>,
    signals: bool,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    force_exit: CancellationToken,
}

impl Server {
    pub fn new(config: Config, app: impl Application) -> Self {
        let force_exit = CancellationToken::new();
        let shutdown = force_exit.child_token();
        Self {
            config: Arc::new(config),
            app: Arc::new(app),
            upgrade: None,
            notify: None,
            signals: false,
            state: Arc::new(ServerState::default()),
            shutdown,
            force_exit,
        }
    }

    pub fn with_upgrade_handler(mut self, handler: impl UpgradeHandler) -> Self {
        self.upgrade = Some(Arc::new(handler));
        self
    }

    pub fn with_notify_callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notify = Some(Arc::new(move || Box::pin(callback()) as BoxFuture<'static, ()>));
        self
    }

    /// First SIGINT/SIGTERM shuts down gracefully, the second forces exit.
    pub fn with_signal_handlers(mut self) -> Self {
        self.signals = true;
        self
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            force_exit: self.force_exit.clone(),
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Runs lifespan startup, binds the configured target and serves until
    /// shut down.
    pub async fn serve(self) -> Result<(), ServerError> {
        self.run(None).await
    }

    /// Like [`Server::serve`] on an already bound listener.
    pub async fn serve_on(self, listener: Listener) -> Result<(), ServerError> {
        self.run(Some(listener)).await
    }

    async fn run(self, listener: Option<Listener>) -> Result<(), ServerError> {
        info!("Started server process [{}]", std::process::id());

        let signals = self.signals.then(|| tokio::spawn(watch_signals(self.handle())));

        let mut lifespan = Lifespan::new(self.app.clone(), &self.config);
        if let Err(e) = lifespan.startup().await {
            abort(signals);
            return Err(e.into());
        }
        if self.shutdown.is_cancelled() {
            abort(signals);
            return Ok(());
        }

        let listener = match listener {
            Some(listener) => listener,
            None => match Listener::bind(&self.config.bind).await {
                Ok(listener) => listener,
                Err(source) => {
                    error!(error = %source, "failed to bind {}", self.config.bind);
                    abort(signals);
                    return Err(ServerError::Bind {
                        target: self.config.bind.to_string(),
                        source,
                    });
                }
            },
        };

        self.refresh_headers();
        info!("Application startup finished; accepting connections on {}", listener.describe());

        self.main_loop(&listener).await;

        // Closing the socket is what stops new connections.
        drop(listener);
        self.drain().await;

        let result = if self.force_exit.is_cancelled() {
            Ok(())
        } else {
            lifespan.shutdown().await.map_err(ServerError::from)
        };

        abort(signals);
        info!("Finished server process [{}]", std::process::id());
        result
    }

    async fn main_loop(&self, listener: &Listener) {
        let ctx = ConnectionContext {
            config: self.config.clone(),
            state: self.state.clone(),
            app: self.app.clone(),
            upgrade: self.upgrade.clone(),
        };

        let mut tick = tokio::time::interval(TICK);
        let mut counter: u64 = 0;
        let mut last_notify = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                _ = tick.tick() => {
                    counter += 1;
                    if counter % HEADER_REFRESH_TICKS == 0 {
                        self.refresh_headers();
                        if last_notify.elapsed() >= self.config.notify_interval() {
                            last_notify = Instant::now();
                            self.notify();
                        }
                    }
                    if self.max_requests_reached() {
                        break;
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok(Accepted::Tcp(stream, peer)) => spawn_connection(stream, peer, &ctx),
                    Ok(Accepted::Unix(stream, peer)) => spawn_connection(stream, peer, &ctx),
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning.
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(TICK).await;
                    }
                },
            }
        }
    }

    fn refresh_headers(&self) {
        self.state
            .set_default_headers(build_default_headers(&self.config, SystemTime::now()));
    }

    fn notify(&self) {
        if let Some(callback) = &self.notify {
            tokio::spawn(callback());
        }
    }

    fn max_requests_reached(&self) -> bool {
        match self.config.limit_max_requests {
            Some(limit) if self.state.total_requests() >= limit => {
                warn!("Maximum request limit of {limit} exceeded. Terminating process.");
                true
            }
            _ => false,
        }
    }

    async fn drain(&self) {
        info!("Shutting down");
        self.shutdown_connections();

        let mut announced_connections = false;
        let mut announced_tasks = false;
        loop {
            let connections = self.state.connection_count();
            let tasks = self.state.task_count();
            if connections == 0 && tasks == 0 {
                return;
            }
            if connections > 0 && !announced_connections {
                info!("Waiting for connections to close. (CTRL+C to force quit)");
                announced_connections = true;
            } else if connections == 0 && !announced_tasks {
                info!("Waiting for background tasks to complete. (CTRL+C to force quit)");
                announced_tasks = true;
            }

            tokio::select! {
                _ = self.force_exit.cancelled() => {
                    for conn in self.state.connections() {
                        conn.force_close();
                    }
                    return;
                }
                _ = tokio::time::sleep(TICK) => {}
            }
            // Connections accepted just before the loop stopped register late.
            self.shutdown_connections();
        }
    }

    fn shutdown_connections(&self) {
        for conn in self.state.connections() {
            conn.trigger_shutdown();
        }
    }
}

fn spawn_connection<S>(stream: S, peer: PeerInfo, ctx: &ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let conn = Connection::new(stream, peer, ctx.clone());
    tokio::spawn(conn.run());
}

fn abort(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
    }
}

async fn watch_signals(handle: ServerHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers");
                return;
            }
        };

    let mut received = false;
    loop {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        if received {
            info!("Second shutdown signal received; forcing exit");
            handle.force_exit();
            return;
        }
        info!("Shutdown signal received");
        received = true;
        handle.shutdown();
    }
}
