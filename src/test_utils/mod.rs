//! Utilities to help with testing the pools

use crate::backend::{self, Connector, Query, Record, Scope, Server};
use crate::stats::StatsSink;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub struct TestConnection {
    pub id: usize,
    pub server: Server,
}

/// A test-only connector which serves canned records, and can be told to
/// make individual hosts unreachable.
pub struct ScriptedConnector {
    next_id: AtomicUsize,
    connects: AtomicUsize,
    unusable: AtomicBool,
    unreachable: Mutex<HashSet<String>>,
    bad_credentials: Mutex<HashSet<String>>,
    searched: Mutex<Vec<String>>,
    // Keyed by filter, or by base DN for base-scoped searches.
    records: Mutex<BTreeMap<String, Vec<Record>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            connects: AtomicUsize::new(0),
            unusable: AtomicBool::new(false),
            unreachable: Mutex::new(HashSet::new()),
            bad_credentials: Mutex::new(HashSet::new()),
            searched: Mutex::new(Vec::new()),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Every connect and search against `host` fails from now on.
    pub fn break_host(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }

    pub fn heal_host(&self, host: &str) {
        self.unreachable.lock().unwrap().remove(host);
    }

    /// Binds against `host` are refused.
    pub fn refuse_bind(&self, host: &str) {
        self.bad_credentials.lock().unwrap().insert(host.to_string());
    }

    /// Released connections report themselves closed.
    pub fn close_connections(&self) {
        self.unusable.store(true, Ordering::SeqCst);
    }

    pub fn set_records(&self, key: &str, records: Vec<Record>) {
        self.records
            .lock()
            .unwrap()
            .insert(key.to_string(), records);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Hosts which have been searched, in order.
    pub fn searched_hosts(&self) -> Vec<String> {
        self.searched.lock().unwrap().clone()
    }

    fn reachable(&self, host: &str) -> bool {
        !self.unreachable.lock().unwrap().contains(host)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Connection = TestConnection;

    async fn connect(&self, server: &Server) -> Result<Self::Connection, backend::Error> {
        if !self.reachable(&server.host) {
            return Err(backend::Error::Communication(format!(
                "{server} unreachable"
            )));
        }
        if self.bad_credentials.lock().unwrap().contains(&server.host) {
            return Err(backend::Error::Bind("invalidCredentials".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(TestConnection {
            id,
            server: server.clone(),
        })
    }

    async fn search(
        &self,
        conn: &mut Self::Connection,
        query: &Query,
    ) -> Result<Vec<Record>, backend::Error> {
        self.searched.lock().unwrap().push(conn.server.host.clone());
        if !self.reachable(&conn.server.host) {
            return Err(backend::Error::Communication(format!(
                "{} went away",
                conn.server
            )));
        }
        let key = match query.scope {
            Scope::Base => &query.base_dn,
            Scope::OneLevel | Scope::Subtree => &query.filter,
        };
        let mut records = self
            .records
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default();
        if let Some(limit) = query.size_limit {
            records.truncate(limit.max(0) as usize);
        }
        Ok(records)
    }

    fn is_usable(&self, _conn: &mut Self::Connection) -> bool {
        !self.unusable.load(Ordering::SeqCst)
    }
}

/// A stats sink which remembers what it was told.
#[derive(Default)]
pub struct RecordingStats {
    pub counters: Mutex<BTreeMap<String, usize>>,
    pub gauges: Mutex<BTreeMap<String, f64>>,
    pub timings: Mutex<Vec<(String, Duration)>>,
}

impl RecordingStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter(&self, key: &str) -> usize {
        self.counters.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, key: &str) -> Option<f64> {
        self.gauges.lock().unwrap().get(key).copied()
    }
}

impl StatsSink for RecordingStats {
    fn incr(&self, key: &str) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;
    }

    fn timing(&self, key: &str, elapsed: Duration) {
        self.timings
            .lock()
            .unwrap()
            .push((key.to_string(), elapsed));
    }

    fn gauge(&self, key: &str, value: f64) {
        self.gauges.lock().unwrap().insert(key.to_string(), value);
    }
}

pub fn record(attrs: &[(&str, &[&str])]) -> Record {
    attrs
        .iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
