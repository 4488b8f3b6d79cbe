//! The entry point for directory lookups across all configured organizations.

use crate::backend::{Connection, Query, Record, Scope, ServerKey, SharedConnector};
use crate::config::{self, Config, PeopleSearch};
use crate::connectors::ldap::{LdapConnection, LdapConnector};
use crate::pool::{self, ConnectionPool};
use crate::policy::Policy;
use crate::query::validate_query;
use crate::retry::RetryPool;
use crate::stats::{self, SharedStats};

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid query: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No directory configured for {0}")]
    UnknownOrg(String),

    #[error(transparent)]
    Config(#[from] config::Error),

    #[error(transparent)]
    Pool(#[from] pool::Error),
}

impl From<crate::query::InvalidQuery> for Error {
    fn from(err: crate::query::InvalidQuery) -> Self {
        Error::Validation(err.to_string())
    }
}

/// Routes searches for each organization to a [RetryPool] over its replicas.
///
/// Each distinct server (host, port and bind user) gets exactly one
/// [ConnectionPool], shared by every organization which lists it.
pub struct LdapController<Conn: Connection> {
    config: Config,
    policy: Policy,
    pools: Vec<Arc<ConnectionPool<Conn>>>,
    retry_pools: HashMap<String, RetryPool<Conn>>,
    stats: SharedStats,
}

impl LdapController<LdapConnection> {
    /// Builds a controller which talks LDAPS, trusting the CA certificate at
    /// `ca_cert`.
    pub fn from_files(
        config: impl AsRef<Path>,
        ca_cert: impl AsRef<Path>,
        policy: Policy,
        stats: SharedStats,
    ) -> Result<Self, Error> {
        let config = Config::load(config)?;
        let connector = LdapConnector::new(Some(ca_cert.as_ref()), policy.connect_timeout)
            .map_err(pool::Error::from)?;
        Self::new(config, Arc::new(connector), policy, stats)
    }
}

impl<Conn: Connection> LdapController<Conn> {
    pub fn new(
        config: Config,
        connector: SharedConnector<Conn>,
        policy: Policy,
        stats: SharedStats,
    ) -> Result<Self, Error> {
        config.validate()?;

        let mut by_server: BTreeMap<ServerKey, Arc<ConnectionPool<Conn>>> = BTreeMap::new();
        let mut retry_pools = HashMap::new();
        for (realm, org) in config.orgs() {
            let servers = org.parsed_servers().map_err(|reason| {
                config::Error::Invalid(vec![config::Problem {
                    realm: realm.to_string(),
                    reason,
                }])
            })?;
            let members = servers
                .into_iter()
                .map(|server| {
                    by_server
                        .entry(server.key())
                        .or_insert_with(|| {
                            Arc::new(ConnectionPool::new(
                                server,
                                connector.clone(),
                                policy.clone(),
                                stats.clone(),
                            ))
                        })
                        .clone()
                })
                .collect();
            retry_pools.insert(
                realm.to_string(),
                RetryPool::new(realm, members, stats.clone()),
            );
        }
        event!(
            Level::INFO,
            orgs = retry_pools.len(),
            servers = by_server.len(),
            "Directory pools configured"
        );

        Ok(Self {
            config,
            policy,
            pools: by_server.into_values().collect(),
            retry_pools,
            stats,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The configured organizations, in sorted order.
    pub fn orgs(&self) -> impl Iterator<Item = &str> {
        self.config.orgs().map(|(realm, _)| realm)
    }

    /// Every distinct server pool, one per physical server and bind user.
    pub fn pools(&self) -> &[Arc<ConnectionPool<Conn>>] {
        &self.pools
    }

    pub fn retry_pool(&self, org: &str) -> Result<&RetryPool<Conn>, Error> {
        self.retry_pools
            .get(org)
            .ok_or_else(|| Error::UnknownOrg(org.to_string()))
    }

    pub fn get_base_dn(&self, org: &str) -> Result<&str, Error> {
        self.config
            .get(org)
            .map(|org| org.base_dn.as_str())
            .ok_or_else(|| Error::UnknownOrg(org.to_string()))
    }

    pub fn peoplesearch(&self, org: &str) -> Result<PeopleSearch, Error> {
        self.config
            .get(org)
            .map(|org| org.peoplesearch)
            .ok_or_else(|| Error::UnknownOrg(org.to_string()))
    }

    /// Excludes the organization's excluded entries from `filter`, if it
    /// configures an exclusion.
    pub fn handle_exclude(&self, org: &str, filter: &str) -> Result<String, Error> {
        let org_config = self
            .config
            .get(org)
            .ok_or_else(|| Error::UnknownOrg(org.to_string()))?;
        Ok(match &org_config.exclude {
            Some(exclude) => format!("(&{filter}(!{exclude}))"),
            None => filter.to_string(),
        })
    }

    /// The number of an organization's replicas currently believed alive.
    pub fn alive_servers(&self, org: &str) -> Result<usize, Error> {
        Ok(self.retry_pool(org)?.alive_servers().len())
    }

    /// Searches an organization's directory.
    ///
    /// An empty result is a success; only failure to reach any replica is
    /// an error.
    #[instrument(level = "debug", skip(self, attributes), err)]
    pub async fn search<S: AsRef<str>>(
        &self,
        org: &str,
        base_dn: &str,
        filter: &str,
        scope: Scope,
        attributes: &[S],
        size_limit: Option<i32>,
    ) -> Result<Vec<Record>, Error> {
        let retry_pool = self.retry_pool(org)?;
        let query = Query::new(base_dn, filter, scope)
            .attributes(attributes)
            .size_limit(size_limit);

        let start = Instant::now();
        let result = retry_pool.search(&query).await;
        self.stats.incr(&stats::org_key(org, "search"));
        self.stats
            .timing(&stats::org_key(org, "search_time"), start.elapsed());
        Ok(result?)
    }

    /// Searches under the organization's base DN, applying its exclusion.
    pub async fn ldap_search<S: AsRef<str>>(
        &self,
        org: &str,
        filter: &str,
        scope: Scope,
        attributes: &[S],
        size_limit: Option<i32>,
    ) -> Result<Vec<Record>, Error> {
        let base_dn = self.get_base_dn(org)?;
        let filter = self.handle_exclude(org, filter)?;
        self.search(org, base_dn, &filter, scope, attributes, size_limit)
            .await
    }

    /// Looks up the person with the given `user@realm` identity.
    pub async fn lookup_feideid<S: AsRef<str>>(
        &self,
        feideid: &str,
        attributes: &[S],
    ) -> Result<Record, Error> {
        let Some((_, org)) = feideid.split_once('@') else {
            return Err(Error::Validation("feide id must contain @".to_string()));
        };
        if org.contains('@') {
            return Err(Error::Validation(
                "feide id must contain exactly one @".to_string(),
            ));
        }
        validate_query(feideid)?;

        let filter = format!("(eduPersonPrincipalName={feideid})");
        let mut records = self
            .ldap_search(org, &filter, Scope::Subtree, attributes, Some(1))
            .await?;
        if records.len() > 1 {
            event!(
                Level::WARN,
                feideid,
                count = records.len(),
                "Multiple entries for feide id; using the first"
            );
        }
        if records.is_empty() {
            return Err(Error::NotFound(feideid.to_string()));
        }
        Ok(records.swap_remove(0))
    }

    /// Runs one round of health checks.
    ///
    /// The round takes [Policy::health_check_interval]: the interval is split
    /// evenly across all server pools, sleeping before each probe. Afterwards
    /// the per-organization count of alive replicas is published.
    pub async fn health_check_round(&self) {
        if self.pools.is_empty() {
            tokio::time::sleep(self.policy.health_check_interval).await;
            return;
        }
        let pool_count = u32::try_from(self.pools.len()).unwrap_or(u32::MAX);
        let delay = self.policy.health_check_interval / pool_count;
        for pool in &self.pools {
            tokio::time::sleep(delay).await;
            pool.check_connection().await;
        }
        for (org, retry_pool) in &self.retry_pools {
            self.stats.gauge(
                &stats::org_key(org, "alive_servers"),
                retry_pool.alive_servers().len() as f64,
            );
        }
    }

    /// Runs health checks forever.
    pub async fn health_check_loop(&self) {
        loop {
            self.health_check_round().await;
        }
    }

    /// Starts [Self::health_check_loop] in a background task.
    pub fn spawn_health_checks(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::task::spawn(async move { controller.health_check_loop().await })
    }
}
