//! Server configuration.
//!
//! Loaded from the YAML file named by `PORTICO_CONFIG` (when set), with the
//! `LISTEN` environment variable overriding the bind target.
//!
//! ```yaml
//! bind: "0.0.0.0:8000"
//! http: httparse
//! timeout_keep_alive: 5
//! limit_concurrency: 1000
//! headers:
//!   - ["x-powered-by", "portico"]
//! lifespan: auto
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::http::parser::ParserKind;
use crate::lifespan::LifespanMode;

/// Where the server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum BindTarget {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
    /// A listening socket inherited from the parent process.
    Fd(i32),
}

impl BindTarget {
    /// Accepts `host:port`, `tcp://host:port`, `unix:/path` and `fd://N`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        let with_scheme = if s.contains("://") || s.starts_with("unix:") {
            s.to_string()
        } else {
            format!("tcp://{s}")
        };
        let url = url::Url::parse(&with_scheme)
            .with_context(|| format!("invalid bind target {s:?}"))?;

        match url.scheme() {
            "tcp" | "http" => {
                let host = match url.host() {
                    Some(url::Host::Domain(d)) => d.to_string(),
                    Some(url::Host::Ipv4(ip)) => ip.to_string(),
                    Some(url::Host::Ipv6(ip)) => ip.to_string(),
                    None => bail!("bind target {s:?} has no host"),
                };
                let port = url
                    .port()
                    .with_context(|| format!("bind target {s:?} has no port"))?;
                Ok(BindTarget::Tcp { host, port })
            }
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    bail!("bind target {s:?} has no socket path");
                }
                Ok(BindTarget::Unix(PathBuf::from(path)))
            }
            "fd" => {
                let fd = url
                    .host_str()
                    .and_then(|h| h.parse::<i32>().ok())
                    .with_context(|| format!("bind target {s:?} has no descriptor number"))?;
                Ok(BindTarget::Fd(fd))
            }
            other => bail!("unsupported bind scheme {other:?}"),
        }
    }
}

impl TryFrom<String> for BindTarget {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        BindTarget::parse(&s)
    }
}

impl Default for BindTarget {
    fn default() -> Self {
        BindTarget::Tcp {
            host: "127.0.0.1".into(),
            port: 8000,
        }
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            BindTarget::Tcp { host, port } => write!(f, "{host}:{port}"),
            BindTarget::Unix(path) => write!(f, "unix:{}", path.display()),
            BindTarget::Fd(fd) => write!(f, "fd://{fd}"),
        }
    }
}

/// Whether WebSocket upgrades are handed off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsMode {
    #[default]
    Auto,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: BindTarget,
    pub http: ParserKind,
    pub ws: WsMode,

    /// Seconds an idle persistent connection is kept open.
    pub timeout_keep_alive: f64,
    /// Seconds between heartbeat callback invocations.
    pub timeout_notify: f64,
    /// Upper bound in seconds on the post-close read.
    pub timeout_linger: f64,
    pub timeout_lifespan_startup: f64,
    pub timeout_lifespan_shutdown: f64,

    pub limit_max_requests: Option<u64>,
    pub limit_concurrency: Option<usize>,

    /// Extra default response headers, appended after `date`/`server`.
    pub headers: Vec<(String, String)>,
    pub server_header: bool,
    pub date_header: bool,

    pub lifespan: LifespanMode,
    pub access_log: bool,
    pub root_path: String,
    pub log_level: String,

    pub flow_high_water: usize,
    pub flow_low_water: usize,
    pub max_incomplete_event_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: BindTarget::default(),
            http: ParserKind::Auto,
            ws: WsMode::Auto,
            timeout_keep_alive: 5.0,
            timeout_notify: 30.0,
            timeout_linger: 5.0,
            timeout_lifespan_startup: 60.0,
            timeout_lifespan_shutdown: 60.0,
            limit_max_requests: None,
            limit_concurrency: None,
            headers: Vec::new(),
            server_header: true,
            date_header: true,
            lifespan: LifespanMode::Auto,
            access_log: true,
            root_path: String::new(),
            log_level: "info".into(),
            flow_high_water: 64 * 1024,
            flow_low_water: 16 * 1024,
            max_incomplete_event_size: 16 * 1024,
        }
    }
}

impl Config {
    /// Reads `PORTICO_CONFIG` (optional) and applies `LISTEN`.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("PORTICO_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                Self::from_yaml(&text).with_context(|| format!("invalid config file {path}"))?
            }
            Err(_) => Self::default(),
        };

        if let Ok(listen) = std::env::var("LISTEN") {
            cfg.bind = BindTarget::parse(&listen)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let timeouts = [
            ("timeout_keep_alive", self.timeout_keep_alive),
            ("timeout_notify", self.timeout_notify),
            ("timeout_linger", self.timeout_linger),
            ("timeout_lifespan_startup", self.timeout_lifespan_startup),
            ("timeout_lifespan_shutdown", self.timeout_lifespan_shutdown),
        ];
        for (name, secs) in timeouts {
            if Duration::try_from_secs_f64(secs).is_err() {
                bail!("{name} must be a non-negative number of seconds in range, got {secs}");
            }
        }
        if self.flow_low_water > self.flow_high_water {
            bail!(
                "flow_low_water ({}) exceeds flow_high_water ({})",
                self.flow_low_water,
                self.flow_high_water
            );
        }
        if self.max_incomplete_event_size == 0 {
            bail!("max_incomplete_event_size must be positive");
        }
        Ok(())
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        seconds(self.timeout_keep_alive)
    }

    pub fn notify_interval(&self) -> Duration {
        seconds(self.timeout_notify)
    }

    pub fn linger_timeout(&self) -> Duration {
        seconds(self.timeout_linger)
    }

    pub fn lifespan_startup_timeout(&self) -> Duration {
        seconds(self.timeout_lifespan_startup)
    }

    pub fn lifespan_shutdown_timeout(&self) -> Duration {
        seconds(self.timeout_lifespan_shutdown)
    }
}

/// Saturates instead of panicking on values `validate` would reject.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}
