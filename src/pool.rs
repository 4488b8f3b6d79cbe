//! A bounded pool of connections to one directory server.

use crate::backend::{self, Connection, Query, Record, Scope, Server, SharedConnector};
use crate::claim::{Handle, Pooled};
use crate::health::{HealthCheckResult, HealthState, Transition};
use crate::policy::Policy;
use crate::stats::{self, SharedStats};

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Too many connections to {server}")]
    TooManyConnections { server: String },

    #[error("No servers configured for {realm}")]
    NoServers { realm: String },

    #[error(transparent)]
    Backend(#[from] backend::Error),
}

impl Error {
    /// Whether another replica might succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TooManyConnections { .. } => true,
            Error::NoServers { .. } => false,
            Error::Backend(err) => err.is_retryable(),
        }
    }
}

// The probe issued by health checks: read the root DSE, ask for no attributes.
fn probe_query() -> Query {
    Query::new("", "(objectClass=*)", Scope::Base).attributes(&["1.1"])
}

/// Manages a set of connections to a single server.
///
/// Connections are created lazily, up to [Policy::max_total]. Released
/// connections wait in a bounded idle queue of [Policy::max_idle] entries.
pub struct ConnectionPool<Conn: Connection> {
    name: Arc<str>,
    server: Server,
    connector: SharedConnector<Conn>,
    policy: Policy,

    idle_tx: mpsc::Sender<Pooled<Conn>>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<Pooled<Conn>>>,
    create_semaphore: Arc<Semaphore>,

    // Written by the health check path, read when routing searches.
    health: Mutex<HealthState>,

    stats: SharedStats,
}

impl<Conn: Connection> ConnectionPool<Conn> {
    pub fn new(
        server: Server,
        connector: SharedConnector<Conn>,
        policy: Policy,
        stats: SharedStats,
    ) -> Self {
        let policy = policy.normalized();
        let (idle_tx, idle_rx) = mpsc::channel(policy.max_idle);
        Self {
            name: server.to_string().into(),
            create_semaphore: Arc::new(Semaphore::new(policy.max_total)),
            server,
            connector,
            policy,
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            health: Mutex::new(HealthState::default()),
            stats,
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// The number of connections created and not yet destroyed, whether
    /// idle or on loan.
    pub fn open_connections(&self) -> usize {
        self.policy.max_total - self.create_semaphore.available_permits()
    }

    /// Whether health checks currently consider this server alive.
    pub fn is_alive(&self) -> bool {
        self.health.lock().unwrap().alive()
    }

    /// Samples the health state at a single point-in-time.
    pub fn health(&self) -> HealthState {
        self.health.lock().unwrap().clone()
    }

    // Opens a new connection if a creation slot is free.
    //
    // Returns "None" if the pool is already at capacity. The slot is held by
    // the permit, so a failed connect or bind gives it straight back.
    async fn create(&self) -> Result<Option<Pooled<Conn>>, backend::Error> {
        let Ok(permit) = self.create_semaphore.clone().try_acquire_owned() else {
            return Ok(None);
        };

        event!(Level::DEBUG, server = %self.name, "Opening connection");
        let conn = tokio::time::timeout(
            self.policy.connect_timeout,
            self.connector.connect(&self.server),
        )
        .await
        .map_err(|_| backend::Error::Timeout)??;

        Ok(Some(Pooled::new(conn, permit)))
    }

    fn try_pop_idle(&self) -> Option<Pooled<Conn>> {
        // Someone holding the lock is already waiting on an empty queue.
        let mut idle_rx = self.idle_rx.try_lock().ok()?;
        idle_rx.try_recv().ok()
    }

    fn handle(&self, pooled: Pooled<Conn>) -> Handle<Conn> {
        Handle::new(
            self.name.clone(),
            pooled,
            self.connector.clone(),
            self.idle_tx.clone(),
        )
    }

    // Idle connection first, then a fresh one, then wait for a release.
    async fn get(&self) -> Result<Handle<Conn>, Error> {
        if let Some(pooled) = self.try_pop_idle() {
            return Ok(self.handle(pooled));
        }
        if let Some(pooled) = self.create().await? {
            return Ok(self.handle(pooled));
        }

        let wait = async {
            let mut idle_rx = self.idle_rx.lock().await;
            idle_rx.recv().await
        };
        match tokio::time::timeout(self.policy.connection_wait, wait).await {
            Ok(Some(pooled)) => Ok(self.handle(pooled)),
            Ok(None) | Err(_) => {
                event!(Level::WARN, server = %self.name, "Pool exhausted");
                self.stats
                    .incr(&stats::server_key(&self.server.host, "too_many_connections"));
                Err(Error::TooManyConnections {
                    server: self.name.to_string(),
                })
            }
        }
    }

    /// Hands a connection back to the pool.
    ///
    /// Equivalent to dropping the handle.
    pub fn release(&self, conn: Handle<Conn>) {
        drop(conn)
    }

    /// Borrows a connection, which is released when the returned handle drops.
    ///
    /// Fails with [Error::TooManyConnections] if the pool is at capacity and
    /// no connection is released within [Policy::connection_wait].
    #[instrument(level = "debug", skip(self), fields(server = %self.name), err)]
    pub async fn connection(&self) -> Result<Handle<Conn>, Error> {
        self.get().await
    }

    /// Runs one search on a pooled connection.
    pub async fn search(&self, query: &Query) -> Result<Vec<Record>, Error> {
        let mut conn = self.connection().await?;
        let records = self.connector.search(&mut *conn, query).await?;
        Ok(records)
    }

    async fn try_connection(&self) -> HealthCheckResult {
        match self.search(&probe_query()).await {
            Ok(_) => HealthCheckResult::Ok,
            // Busy is not unhealthy.
            Err(Error::TooManyConnections { .. }) => HealthCheckResult::Ok,
            Err(err) => {
                event!(Level::DEBUG, server = %self.name, err = %err, "Health probe failed");
                HealthCheckResult::Fail
            }
        }
    }

    /// Probes the server once and updates its alive/dead state.
    #[instrument(level = "trace", skip(self), fields(server = %self.name))]
    pub async fn check_connection(&self) -> HealthCheckResult {
        let result = self.try_connection().await;

        let (transition, alive) = {
            let mut health = self.health.lock().unwrap();
            (health.record(result), health.alive())
        };
        match transition {
            Some(Transition::Died) => {
                event!(Level::WARN, server = %self.name, "Server marked dead")
            }
            Some(Transition::Revived) => {
                event!(Level::INFO, server = %self.name, "Server alive again")
            }
            None => (),
        }
        self.stats.gauge(
            &stats::server_key(&self.server.host, "alive"),
            if alive { 1.0 } else { 0.0 },
        );
        result
    }
}
