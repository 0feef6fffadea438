//! Protocol probes.
//!
//! A [`Probe`] performs one round of protocol interaction against a
//! [`Target`] and always comes back with an [`Outcome`]. Transport and
//! protocol failures, including the timeout, are folded into a down outcome
//! here so nothing past this module ever sees a network error.

mod http;
mod imap;
mod ssh;
mod tcp;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::types::{Observation, Outcome};

pub use imap::parse_greeting as parse_imap_greeting;
pub use ssh::{SSH_CLIENT_SIGNATURE, parse_identification as parse_ssh_identification};

/// Probe-specific arguments as they appear in configuration
pub type ProbeArgs = BTreeMap<String, String>;

/// Configuration problems detected while building a probe
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeConfigError {
    #[error("Unknown probe kind: {0}")]
    UnknownKind(String),

    #[error("Probe '{kind}' is missing required arguments: {}", missing.join(", "))]
    MissingArguments { kind: ProbeKind, missing: Vec<String> },

    #[error("Invalid value for argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },
}

/// Failure inside a probe round; never leaves this module
#[derive(Debug, Error)]
enum ProbeError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("{0}")]
    Protocol(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Address of a monitored service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Host part suitable for a URL authority (IPv6 literals bracketed)
    fn url_host(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.url_host(), self.port)
    }
}

/// Kind of probe named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Tcp,
    Ssh,
    Imap,
    Http,
    Https,
}

impl ProbeKind {
    pub fn default_port(self) -> Option<u16> {
        match self {
            ProbeKind::Tcp => None,
            ProbeKind::Ssh => Some(22),
            ProbeKind::Imap => Some(143),
            ProbeKind::Http => Some(80),
            ProbeKind::Https => Some(443),
        }
    }

    /// Arguments that must be present for this kind given the rest of `args`.
    ///
    /// IMAP only demands credentials once `auth` checking is switched on.
    pub fn required_args(self, args: &ProbeArgs) -> &'static [&'static str] {
        match self {
            ProbeKind::Imap if is_enabled(args.get("auth")) => &["username", "password"],
            _ => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeKind::Tcp => "tcp",
            ProbeKind::Ssh => "ssh",
            ProbeKind::Imap => "imap",
            ProbeKind::Http => "http",
            ProbeKind::Https => "https",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = ProbeConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "port" => Ok(ProbeKind::Tcp),
            "ssh" => Ok(ProbeKind::Ssh),
            "imap" => Ok(ProbeKind::Imap),
            "http" => Ok(ProbeKind::Http),
            "https" => Ok(ProbeKind::Https),
            other => Err(ProbeConfigError::UnknownKind(other.to_string())),
        }
    }
}

fn is_enabled(value: Option<&String>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// IMAP login used to validate the authentication path
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One protocol check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Connect and read whatever the server volunteers
    TcpBanner,
    /// Exchange identification lines
    Ssh,
    /// Greeting, plus LOGIN/LOGOUT when credentials are set
    Imap { credentials: Option<Credentials> },
    /// GET `path`, reporting the `Server` header
    Http { path: String, tls: bool },
}

impl Probe {
    /// Build a probe from configuration, rejecting missing required arguments.
    pub fn from_args(kind: ProbeKind, args: &ProbeArgs) -> Result<Self, ProbeConfigError> {
        let missing: Vec<String> = kind
            .required_args(args)
            .iter()
            .filter(|name| args.get(**name).is_none_or(|v| v.is_empty()))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ProbeConfigError::MissingArguments { kind, missing });
        }

        let probe = match kind {
            ProbeKind::Tcp => Probe::TcpBanner,
            ProbeKind::Ssh => Probe::Ssh,
            ProbeKind::Imap => {
                let credentials = args
                    .get("username")
                    .filter(|u| !u.is_empty())
                    .map(|username| Credentials {
                        username: username.clone(),
                        password: args.get("password").cloned().unwrap_or_default(),
                    });
                Probe::Imap { credentials }
            }
            ProbeKind::Http | ProbeKind::Https => {
                let path = args.get("path").cloned().unwrap_or_else(|| "/".to_string());
                if !path.starts_with('/') {
                    return Err(ProbeConfigError::InvalidArgument {
                        name: "path".to_string(),
                        reason: format!("'{path}' must start with '/'"),
                    });
                }
                Probe::Http { path, tls: kind == ProbeKind::Https }
            }
        };
        Ok(probe)
    }

    pub fn kind(&self) -> ProbeKind {
        match self {
            Probe::TcpBanner => ProbeKind::Tcp,
            Probe::Ssh => ProbeKind::Ssh,
            Probe::Imap { .. } => ProbeKind::Imap,
            Probe::Http { tls: false, .. } => ProbeKind::Http,
            Probe::Http { tls: true, .. } => ProbeKind::Https,
        }
    }

    /// Run one probe round, bounded by `limit`.
    pub async fn execute(&self, target: &Target, limit: Duration) -> Outcome {
        let round = async {
            match self {
                Probe::TcpBanner => tcp::execute(target).await,
                Probe::Ssh => ssh::execute(target).await,
                Probe::Imap { credentials } => imap::execute(target, credentials.as_ref()).await,
                Probe::Http { path, tls } => http::execute(target, path, *tls, limit).await,
            }
        };

        match timeout(limit, round).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                debug!(target = %target, probe = %self.kind(), "Probe failed: {e}");
                Outcome::down(e.to_string())
            }
            Err(_) => {
                debug!(target = %target, probe = %self.kind(), "Probe timed out");
                Outcome::down(format!("timed out after {:.1}s", limit.as_secs_f64()))
            }
        }
    }

    /// Run one probe round and time it.
    pub async fn observe(&self, target: &Target, limit: Duration) -> Observation {
        let timestamp = SystemTime::now();
        let start = Instant::now();
        let outcome = self.execute(target, limit).await;
        Observation { outcome, elapsed: start.elapsed(), timestamp }
    }
}

async fn connect(target: &Target) -> Result<TcpStream, ProbeError> {
    TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|source| ProbeError::Connect { target: target.to_string(), source })
}
