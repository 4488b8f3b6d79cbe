//! Implementation of [Connector] for LDAPS, using [ldap3].

use crate::backend::{self, Error, Query, Record, Scope, Server};

use async_trait::async_trait;
use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, LdapError, ResultEntry, SearchEntry, SearchOptions,
};
use native_tls::{Certificate, TlsConnector};
use std::path::Path;
use std::time::Duration;
use tracing::{event, Level};

/// Result code for a search which hit its size limit.
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;

/// An open LDAP session.
pub struct LdapConnection {
    ldap: Ldap,
    bound: bool,
}

pub struct LdapConnector {
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl LdapConnector {
    /// Creates a connector which trusts the PEM-encoded CA certificate at
    /// `ca_cert`, in addition to the system roots.
    pub fn new(ca_cert: Option<&Path>, connect_timeout: Duration) -> Result<Self, Error> {
        let tls = match ca_cert {
            Some(path) => {
                let pem = std::fs::read(path)?;
                let cert = Certificate::from_pem(&pem).map_err(|e| Error::Tls(e.to_string()))?;
                let connector = TlsConnector::builder()
                    .add_root_certificate(cert)
                    .build()
                    .map_err(|e| Error::Tls(e.to_string()))?;
                Some(connector)
            }
            None => None,
        };
        Ok(Self {
            tls,
            connect_timeout,
        })
    }

    fn settings(&self) -> LdapConnSettings {
        let settings = LdapConnSettings::new().set_conn_timeout(self.connect_timeout);
        match &self.tls {
            Some(tls) => settings.set_connector(tls.clone()),
            None => settings,
        }
    }
}

fn scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

fn record(entry: ResultEntry) -> Record {
    SearchEntry::construct(entry).attrs.into_iter().collect()
}

impl From<LdapError> for Error {
    fn from(err: LdapError) -> Self {
        match err {
            LdapError::LdapResult { result } => Error::Operation {
                rc: result.rc,
                message: result.text,
            },
            LdapError::Timeout { .. } => Error::Timeout,
            LdapError::NativeTLS { source } => Error::Tls(source.to_string()),
            LdapError::Io { source } => Error::Io(source),
            other => Error::Communication(other.to_string()),
        }
    }
}

#[async_trait]
impl backend::Connector for LdapConnector {
    type Connection = LdapConnection;

    async fn connect(&self, server: &Server) -> Result<Self::Connection, Error> {
        let (conn, mut ldap) = LdapConnAsync::with_settings(self.settings(), &server.url()).await?;
        let address = server.to_string();
        tokio::task::spawn(async move {
            if let Err(err) = conn.drive().await {
                event!(Level::WARN, server = %address, err = %err, "LDAP connection ended");
            }
        });

        if let Some(bind) = &server.bind {
            ldap.simple_bind(&bind.dn, &bind.password)
                .await?
                .success()
                .map_err(|err| match err {
                    LdapError::LdapResult { result } => {
                        Error::Bind(format!("rc={}: {}", result.rc, result.text))
                    }
                    other => other.into(),
                })?;
        }
        Ok(LdapConnection { ldap, bound: true })
    }

    async fn search(
        &self,
        conn: &mut Self::Connection,
        query: &Query,
    ) -> Result<Vec<Record>, Error> {
        let mut options = SearchOptions::new();
        if let Some(size_limit) = query.size_limit {
            options = options.sizelimit(size_limit);
        }
        let result = conn
            .ldap
            .with_search_options(options)
            .search(
                &query.base_dn,
                scope(query.scope),
                &query.filter,
                query.attributes.clone(),
            )
            .await;
        let ldap3::SearchResult(entries, result) = match result {
            Ok(result) => result,
            Err(err) => {
                conn.bound = false;
                return Err(err.into());
            }
        };

        match result.rc {
            0 => {}
            RC_SIZE_LIMIT_EXCEEDED => {
                event!(
                    Level::DEBUG,
                    filter = %query.filter,
                    entries = entries.len(),
                    "Size limit exceeded; returning partial results"
                );
            }
            rc => {
                return Err(Error::Operation {
                    rc,
                    message: result.text,
                })
            }
        }
        Ok(entries.into_iter().map(record).collect())
    }

    fn is_usable(&self, conn: &mut Self::Connection) -> bool {
        conn.bound && !conn.ldap.is_closed()
    }
}
