use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::info;

use crate::config::BindTarget;
use crate::http::connection::PeerInfo;

/// A bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// One accepted connection.
#[derive(Debug)]
pub enum Accepted {
    Tcp(TcpStream, PeerInfo),
    Unix(UnixStream, PeerInfo),
}

impl Listener {
    pub async fn bind(target: &BindTarget) -> std::io::Result<Self> {
        let listener = match target {
            BindTarget::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Listener::Tcp(listener)
            }
            BindTarget::Unix(path) => {
                // A socket left behind by an earlier run blocks bind. Any
                // other kind of file is left alone and bind reports it.
                if let Ok(meta) = std::fs::symlink_metadata(path) {
                    if meta.file_type().is_socket() {
                        std::fs::remove_file(path)?;
                    }
                }
                Listener::Unix(UnixListener::bind(path)?, path.clone())
            }
            BindTarget::Fd(fd) => {
                use std::os::fd::FromRawFd;

                // SAFETY: the descriptor was handed to us by the parent
                // process and nothing else in this process owns it.
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(*fd) };
                std_listener.set_nonblocking(true)?;
                Listener::Tcp(TcpListener::from_std(std_listener)?)
            }
        };
        info!("Listening on {}", listener.describe());
        Ok(listener)
    }

    pub fn from_tcp(listener: TcpListener) -> Self {
        Listener::Tcp(listener)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix(..) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp(l) => match l.local_addr() {
                Ok(addr) => format!("http://{addr}"),
                Err(_) => "tcp socket".to_string(),
            },
            Listener::Unix(_, path) => format!("unix socket {}", path.display()),
        }
    }

    pub async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Listener::Tcp(l) => {
                let (socket, peer) = l.accept().await?;
                // Small responses go out without waiting on Nagle.
                let _ = socket.set_nodelay(true);
                let info = PeerInfo {
                    client: Some(peer),
                    server: socket.local_addr().ok(),
                };
                Ok(Accepted::Tcp(socket, info))
            }
            Listener::Unix(l, _) => {
                let (socket, _) = l.accept().await?;
                Ok(Accepted::Unix(socket, PeerInfo::default()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
