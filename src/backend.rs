//! The interface for identifying and connecting to directory servers.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// The default LDAPS port, used when a server address omits one.
pub const DEFAULT_PORT: u16 = 636;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Directory returned result code {rc}: {message}")]
    Operation { rc: u32, message: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl Error {
    /// True for failures reaching or talking to the server at all.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Communication(_) | Error::Timeout | Error::Tls(_)
        )
    }

    /// Whether another replica might succeed where this server failed.
    ///
    /// A result code from the directory itself (wrong base DN, bad filter)
    /// would be returned by every replica alike.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Operation { .. })
    }

    /// A short, stable name for the kind of failure.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Io(_) => "IoError",
            Error::Communication(_) => "CommunicationError",
            Error::Bind(_) => "BindError",
            Error::Timeout => "TimeoutError",
            Error::Operation { .. } => "OperationError",
            Error::Tls(_) => "TlsError",
            Error::Other(_) => "OtherError",
        }
    }
}

/// Credentials for a simple bind.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub dn: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("dn", &self.dn)
            .finish_non_exhaustive()
    }
}

/// A single physical directory server, and the identity used to bind to it.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub bind: Option<Credentials>,
}

/// Identifies a [Server] for deduplication: two organizations pointing at
/// the same host with the same bind user share one pool.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct ServerKey {
    pub host: String,
    pub port: u16,
    pub bind_dn: Option<String>,
}

impl Server {
    /// Parses `host` or `host:port`. IPv6 literals must be bracketed.
    pub fn parse(address: &str, bind: Option<Credentials>) -> Result<Self, String> {
        let address = address.trim();
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in server address {address:?}"))?;
                (host, port)
            }
            _ => (address, DEFAULT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in server address {address:?}"));
        }
        if port == 0 {
            return Err(format!("invalid port in server address {address:?}"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            bind,
        })
    }

    pub fn key(&self) -> ServerKey {
        ServerKey {
            host: self.host.clone(),
            port: self.port,
            bind_dn: self.bind.as_ref().map(|bind| bind.dn.clone()),
        }
    }

    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("ldaps://[{}]:{}", self.host, self.port)
        } else {
            format!("ldaps://{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How far below the base DN a search reaches.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

/// A single search request against one server.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Query {
    pub base_dn: String,
    pub filter: String,
    pub scope: Scope,
    /// Attributes to return. Empty means all user attributes.
    pub attributes: Vec<String>,
    pub size_limit: Option<i32>,
}

impl Query {
    pub fn new(base_dn: impl Into<String>, filter: impl Into<String>, scope: Scope) -> Self {
        Self {
            base_dn: base_dn.into(),
            filter: filter.into(),
            scope,
            attributes: Vec::new(),
            size_limit: None,
        }
    }

    pub fn attributes<S: AsRef<str>>(mut self, attributes: &[S]) -> Self {
        self.attributes = attributes.iter().map(|a| a.as_ref().to_string()).collect();
        self
    }

    pub fn size_limit(mut self, size_limit: Option<i32>) -> Self {
        self.size_limit = size_limit;
        self
    }
}

/// One directory entry: attribute name to all of its values.
///
/// Flattening to single values is left to callers; see [crate::query::flatten].
pub type Record = BTreeMap<String, Vec<String>>;

/// Interface for raw connections.
pub trait Connection: Send + 'static {}

impl<T> Connection for T where T: Send + 'static {}

/// Describes how a connection to a [Server] is made and used.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Opens a connection to a server and binds with its credentials.
    async fn connect(&self, server: &Server) -> Result<Self::Connection, Error>;

    /// Runs one search on an established connection.
    async fn search(
        &self,
        conn: &mut Self::Connection,
        query: &Query,
    ) -> Result<Vec<Record>, Error>;

    /// Determines if a connection can go back into the idle queue.
    ///
    /// Called whenever a connection is released. Connections which report
    /// themselves closed or unbound are discarded.
    ///
    /// By default every connection is reusable.
    fn is_usable(&self, _conn: &mut Self::Connection) -> bool {
        true
    }
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;
