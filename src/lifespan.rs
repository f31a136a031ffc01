//! Application startup/shutdown handshake.
//!
//! The application is called once with a lifespan scope and runs for as long
//! as the server does. Startup and shutdown are each one request/reply pair
//! over its receive/send channels, bounded by a timeout:
//!
//! ```text
//! Unstarted -> StartupPending -> Started -> ShutdownPending -> ShutdownComplete
//!                            \-> StartupFailed             \-> ShutdownFailed
//! ```
//!
//! An application that fails before acknowledging startup is taken not to
//! speak the protocol; in `auto` mode both phases then become no-ops.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::asgi::{
    ASGI_VERSION, AppReceiver, AppSender, Application, AsgiVersion, LifespanScope, Outgoing,
    ReceiveEvent, Scope, SendMessage,
};
use crate::config::Config;
use crate::error::{AppError, LifespanError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifespanMode {
    /// The application must support the handshake.
    On,
    Off,
    /// Run it, but tolerate applications that do not support it.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifespanState {
    Unstarted,
    StartupPending,
    Started,
    StartupFailed,
    ShutdownPending,
    ShutdownComplete,
    ShutdownFailed,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Startup,
    Shutdown,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Startup => "startup",
            Phase::Shutdown => "shutdown",
        }
    }
}

/// What ended a wait for the application's acknowledgement.
enum Reply {
    Complete,
    Failed(String),
    Invalid(&'static str),
    /// The application returned (with its error, if any) without replying.
    Exited(Option<String>),
}

pub struct Lifespan {
    app: Arc<dyn Application>,
    mode: LifespanMode,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    state: LifespanState,
    supported: bool,
    events: Option<mpsc::Sender<ReceiveEvent>>,
    replies: Option<mpsc::Receiver<Outgoing>>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Lifespan {
    pub fn new(app: Arc<dyn Application>, config: &Config) -> Self {
        Self {
            app,
            mode: config.lifespan,
            startup_timeout: config.lifespan_startup_timeout(),
            shutdown_timeout: config.lifespan_shutdown_timeout(),
            state: LifespanState::Unstarted,
            supported: config.lifespan != LifespanMode::Off,
            events: None,
            replies: None,
            task: None,
        }
    }

    pub fn state(&self) -> LifespanState {
        self.state
    }

    /// False once the application showed it does not speak the protocol.
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    pub async fn startup(&mut self) -> Result<(), LifespanError> {
        if !self.supported {
            tracing::trace!("lifespan startup skipped");
            return Ok(());
        }

        tracing::info!("Waiting for application startup.");
        let (event_tx, event_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let scope = Scope::Lifespan(LifespanScope {
            asgi: AsgiVersion {
                spec_version: "2.0",
                ..ASGI_VERSION
            },
        });
        let app_future = self.app.call(
            scope,
            AppReceiver::lifespan(event_rx),
            AppSender::new(reply_tx, None),
        );
        self.task = Some(tokio::spawn(app_future));
        self.replies = Some(reply_rx);
        self.state = LifespanState::StartupPending;

        // The receiver lives in the app task; if it is already gone the
        // wait below reports how the app ended.
        let _ = event_tx.send(ReceiveEvent::LifespanStartup).await;
        self.events = Some(event_tx);

        let reply = match tokio::time::timeout(self.startup_timeout, self.wait_reply(Phase::Startup)).await {
            Ok(reply) => reply,
            Err(_) => {
                self.state = LifespanState::StartupFailed;
                return Err(LifespanError::Timeout {
                    phase: "startup",
                    timeout: self.startup_timeout,
                });
            }
        };

        match reply {
            Reply::Complete => {
                self.state = LifespanState::Started;
                tracing::info!("Application startup complete.");
                Ok(())
            }
            Reply::Failed(message) => {
                self.state = LifespanState::StartupFailed;
                if !message.is_empty() {
                    tracing::error!("{message}");
                }
                tracing::error!("Application startup failed. Exiting.");
                Err(LifespanError::StartupFailed(message))
            }
            Reply::Invalid(name) => {
                self.state = LifespanState::StartupFailed;
                tracing::error!("Exception in 'lifespan' protocol");
                Err(LifespanError::InvalidTransition(name))
            }
            Reply::Exited(error) => self.on_exit_before_reply(error),
        }
    }

    fn on_exit_before_reply(&mut self, error: Option<String>) -> Result<(), LifespanError> {
        match error {
            Some(err) if self.mode == LifespanMode::On => {
                self.state = LifespanState::StartupFailed;
                tracing::error!(error = %err, "Exception in 'lifespan' protocol");
                Err(LifespanError::Crashed(err))
            }
            Some(err) => {
                tracing::info!("ASGI 'lifespan' protocol appears unsupported.");
                tracing::debug!(error = %err, "lifespan application error");
                self.supported = false;
                self.state = LifespanState::Started;
                Ok(())
            }
            None => {
                tracing::info!("ASGI 'lifespan' protocol appears unsupported.");
                self.supported = false;
                self.state = LifespanState::Started;
                Ok(())
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), LifespanError> {
        if !self.supported || self.state != LifespanState::Started {
            tracing::trace!("lifespan shutdown skipped");
            return Ok(());
        }

        tracing::info!("Waiting for application shutdown.");
        self.state = LifespanState::ShutdownPending;
        if let Some(events) = &self.events {
            let _ = events.send(ReceiveEvent::LifespanShutdown).await;
        }

        let reply = match tokio::time::timeout(self.shutdown_timeout, self.wait_reply(Phase::Shutdown)).await {
            Ok(reply) => reply,
            Err(_) => {
                self.state = LifespanState::ShutdownFailed;
                return Err(LifespanError::Timeout {
                    phase: "shutdown",
                    timeout: self.shutdown_timeout,
                });
            }
        };
        // Closing the channel lets a still-running app see the end.
        self.events = None;

        match reply {
            Reply::Complete | Reply::Exited(None) => {
                self.state = LifespanState::ShutdownComplete;
                tracing::info!("Application shutdown complete.");
                Ok(())
            }
            Reply::Failed(message) => {
                self.state = LifespanState::ShutdownFailed;
                if !message.is_empty() {
                    tracing::error!("{message}");
                }
                tracing::error!("Application shutdown failed. Exiting.");
                Err(LifespanError::ShutdownFailed(message))
            }
            Reply::Invalid(name) => {
                self.state = LifespanState::ShutdownFailed;
                tracing::error!("Exception in 'lifespan' protocol");
                Err(LifespanError::InvalidTransition(name))
            }
            Reply::Exited(Some(err)) => {
                self.state = LifespanState::ShutdownFailed;
                tracing::error!(error = %err, "Exception in 'lifespan' protocol");
                Err(LifespanError::Crashed(err))
            }
        }
    }

    /// Waits for the next message from the application, or for it to exit.
    async fn wait_reply(&mut self, phase: Phase) -> Reply {
        let Some(replies) = self.replies.as_mut() else {
            return Reply::Exited(None);
        };

        let next = match self.task.as_mut() {
            Some(task) => tokio::select! {
                message = replies.recv() => Ok(message),
                joined = task => Err(joined),
            },
            None => Ok(replies.recv().await),
        };

        let (message, ack) = match next {
            Ok(Some(outgoing)) => outgoing,
            Ok(None) => {
                // Every sender is gone, so the app has finished.
                return match self.task.take() {
                    Some(task) => Reply::Exited(exit_error(task.await)),
                    None => Reply::Exited(None),
                };
            }
            Err(joined) => {
                self.task = None;
                return Reply::Exited(exit_error(joined));
            }
        };

        let reply = match (phase, message) {
            (Phase::Startup, SendMessage::LifespanStartupComplete)
            | (Phase::Shutdown, SendMessage::LifespanShutdownComplete) => Reply::Complete,
            (Phase::Startup, SendMessage::LifespanStartupFailed { message })
            | (Phase::Shutdown, SendMessage::LifespanShutdownFailed { message }) => {
                Reply::Failed(message)
            }
            (phase, other) => {
                tracing::debug!(phase = phase.name(), message = other.type_name(), "unexpected lifespan message");
                let name = other.type_name();
                let _ = ack.send(Err(AppError::InvalidLifespanMessage(name)));
                return Reply::Invalid(name);
            }
        };
        let _ = ack.send(Ok(()));
        reply
    }
}

fn exit_error(joined: Result<anyhow::Result<()>, tokio::task::JoinError>) -> Option<String> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(e) => Some(e.to_string()),
    }
}

impl Drop for Lifespan {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
