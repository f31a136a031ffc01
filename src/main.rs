use bytes::Bytes;
use portico::asgi::{ReceiveEvent, Scope, SendMessage, app_fn};
use portico::config::Config;
use portico::server::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let app = app_fn(|scope, mut receive, send| async move {
        let Scope::Http(scope) = scope else {
            loop {
                match receive.receive().await {
                    ReceiveEvent::LifespanStartup => {
                        send.send(SendMessage::LifespanStartupComplete).await?
                    }
                    ReceiveEvent::LifespanShutdown => {
                        send.send(SendMessage::LifespanShutdownComplete).await?;
                        return Ok(());
                    }
                    _ => return Ok(()),
                }
            }
        };

        while let ReceiveEvent::HttpRequest { more_body: true, .. } = receive.receive().await {}

        let body = format!("Hello from {}\n", scope.path);
        send.send(SendMessage::start(
            200,
            vec![(
                Bytes::from_static(b"content-type"),
                Bytes::from_static(b"text/plain; charset=utf-8"),
            )],
        ))
        .await?;
        send.send(SendMessage::body(body, false)).await?;
        Ok(())
    });

    Server::new(cfg, app).with_signal_handlers().serve().await?;
    Ok(())
}
