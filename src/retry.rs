//! A logical pool over replicas of one organization's directory.

use crate::backend::{Connection, Query, Record};
use crate::pool::{ConnectionPool, Error};
use crate::stats::{self, SharedStats};

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// Spreads searches across the replicas which are believed alive, retrying
/// on the next replica when one fails.
pub struct RetryPool<Conn: Connection> {
    realm: String,
    members: Vec<Arc<ConnectionPool<Conn>>>,
    stats: SharedStats,
}

impl<Conn: Connection> RetryPool<Conn> {
    pub fn new(
        realm: impl Into<String>,
        members: Vec<Arc<ConnectionPool<Conn>>>,
        stats: SharedStats,
    ) -> Self {
        Self {
            realm: realm.into(),
            members,
            stats,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn members(&self) -> &[Arc<ConnectionPool<Conn>>] {
        &self.members
    }

    /// The members currently believed alive.
    pub fn alive_servers(&self) -> Vec<Arc<ConnectionPool<Conn>>> {
        self.members
            .iter()
            .filter(|member| member.is_alive())
            .cloned()
            .collect()
    }

    /// Probes every member once, concurrently.
    pub async fn do_health_checks(&self) {
        futures::future::join_all(self.members.iter().map(|member| member.check_connection()))
            .await;
    }

    /// Searches one replica, returning the first successful response.
    ///
    /// Replicas believed alive are tried in random order. If none are believed
    /// alive, all of them are tried. If every attempt fails, the last error is
    /// returned.
    #[instrument(level = "debug", skip(self), fields(realm = %self.realm))]
    pub async fn search(&self, query: &Query) -> Result<Vec<Record>, Error> {
        let mut candidates = self.alive_servers();
        if candidates.is_empty() {
            event!(Level::WARN, "No replicas believed alive; trying all of them");
            candidates = self.members.clone();
        }
        candidates.shuffle(&mut rand::rng());
        self.search_candidates(candidates, query).await
    }

    async fn search_candidates(
        &self,
        candidates: Vec<Arc<ConnectionPool<Conn>>>,
        query: &Query,
    ) -> Result<Vec<Record>, Error> {
        let mut last_err = None;
        for candidate in candidates {
            match candidate.search(query).await {
                Ok(records) => return Ok(records),
                Err(err) if err.is_retryable() => {
                    event!(
                        Level::DEBUG,
                        server = %candidate.server(),
                        err = %err,
                        "Search failed; trying next replica"
                    );
                    self.stats.incr(&stats::org_key(&self.realm, "failover"));
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::NoServers {
            realm: self.realm.clone(),
        }))
    }
}
