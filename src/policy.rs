//! Configuration options which can alter the behavior of the pools.

use tokio::time::Duration;

/// Policy applied to every [crate::pool::ConnectionPool] a controller creates.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The number of released connections kept open for reuse.
    pub max_idle: usize,

    /// The maximum number of connections which can be open to one server,
    /// whether idle or on loan.
    pub max_total: usize,

    /// How long opening and binding a new connection may take.
    pub connect_timeout: Duration,

    /// How long a caller waits for an idle connection once the pool is
    /// at [Self::max_total].
    pub connection_wait: Duration,

    /// The time budget for one full round of health checks, divided evenly
    /// between all pools.
    pub health_check_interval: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_idle: 5,
            max_total: 10,
            connect_timeout: Duration::from_secs(1),
            connection_wait: Duration::from_millis(500),
            health_check_interval: Duration::from_secs(10),
        }
    }
}

impl Policy {
    // Both queues must hold at least one connection.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_total = self.max_total.max(1);
        self.max_idle = self.max_idle.clamp(1, self.max_total);
        self
    }
}
