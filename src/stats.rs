//! A sink for counters, timings and gauges.
//!
//! The pools only ever produce statistics; where they end up (statsd, a
//! metrics registry, the log) is up to the embedding service.

use std::sync::Arc;
use tokio::time::Duration;
use tracing::{event, Level};

pub trait StatsSink: Send + Sync {
    fn incr(&self, key: &str);
    fn timing(&self, key: &str, elapsed: Duration);
    fn gauge(&self, key: &str, value: f64);
}

pub type SharedStats = Arc<dyn StatsSink>;

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn incr(&self, _key: &str) {}
    fn timing(&self, _key: &str, _elapsed: Duration) {}
    fn gauge(&self, _key: &str, _value: f64) {}
}

/// Emits every statistic as a trace-level event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingStats;

impl StatsSink for TracingStats {
    fn incr(&self, key: &str) {
        event!(Level::TRACE, key, "incr");
    }

    fn timing(&self, key: &str, elapsed: Duration) {
        event!(Level::TRACE, key, ms = elapsed.as_millis() as u64, "timing");
    }

    fn gauge(&self, key: &str, value: f64) {
        event!(Level::TRACE, key, value, "gauge");
    }
}

// Dots separate path segments in a metric name, so they can't appear inside one.
fn segment(name: &str) -> String {
    name.replace('.', "_")
}

pub(crate) fn org_key(org: &str, metric: &str) -> String {
    format!("ldap.org.{}.{metric}", segment(org))
}

pub(crate) fn server_key(host: &str, metric: &str) -> String {
    format!("ldap.server.{}.{metric}", segment(host))
}
