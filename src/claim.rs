//! Connections which are borrowed from a connection pool.

use crate::backend::{Connection, SharedConnector};

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{event, Level};

/// A live connection together with the creation slot it occupies.
///
/// Dropping it closes the connection and frees the slot.
#[derive_where(Debug)]
pub(crate) struct Pooled<Conn: Connection> {
    pub(crate) conn: DebugIgnore<Conn>,
    _permit: OwnedSemaphorePermit,
}

impl<Conn: Connection> Pooled<Conn> {
    pub(crate) fn new(conn: Conn, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: DebugIgnore(conn),
            _permit: permit,
        }
    }
}

/// Returns a connection to the idle queue, or discards it.
///
/// Connections which are closed or unbound are discarded, as are connections
/// released while the idle queue is already full.
pub(crate) fn release<Conn: Connection>(
    server: &str,
    connector: &SharedConnector<Conn>,
    idle_tx: &mpsc::Sender<Pooled<Conn>>,
    mut pooled: Pooled<Conn>,
) {
    if !connector.is_usable(&mut pooled.conn.0) {
        event!(Level::DEBUG, server, "Discarding unusable connection");
        return;
    }
    if idle_tx.try_send(pooled).is_err() {
        event!(Level::TRACE, server, "Idle queue full; discarding connection");
    }
}

/// A [Connection] which is released back to its pool when dropped.
///
/// Note that this type implements [std::ops::Deref] for the
/// generic `Conn` type, and generally, clients should transparently
/// use a handle as a connection.
#[derive_where(Debug)]
pub struct Handle<Conn: Connection> {
    server: Arc<str>,
    inner: Option<Pooled<Conn>>,
    #[derive_where(skip)]
    connector: SharedConnector<Conn>,
    #[derive_where(skip)]
    idle_tx: mpsc::Sender<Pooled<Conn>>,
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(
        server: Arc<str>,
        pooled: Pooled<Conn>,
        connector: SharedConnector<Conn>,
        idle_tx: mpsc::Sender<Pooled<Conn>>,
    ) -> Self {
        Self {
            server,
            inner: Some(pooled),
            connector,
            idle_tx,
        }
    }

    /// The server this connection is bound to, as `host:port`.
    pub fn server(&self) -> &str {
        &self.server
    }
}

impl<Conn: Connection> std::ops::Deref for Handle<Conn> {
    type Target = Conn;
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().map(|inner| &inner.conn.0).unwrap()
    }
}

impl<Conn: Connection> std::ops::DerefMut for Handle<Conn> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut().map(|inner| &mut inner.conn.0).unwrap()
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        if let Some(pooled) = self.inner.take() {
            release(&self.server, &self.connector, &self.idle_tx, pooled);
        }
    }
}
