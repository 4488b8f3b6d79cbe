//! Alive/dead tracking for a single server.
//!
//! A server is only declared dead after [FAILS_BEFORE_DEAD] consecutive
//! failed probes, and only comes back after [OKS_BEFORE_ALIVE] consecutive
//! successful ones.

/// Consecutive failed probes that take an alive server down.
pub const FAILS_BEFORE_DEAD: usize = 3;

/// Consecutive successful probes that bring a dead server back.
pub const OKS_BEFORE_ALIVE: usize = 2;

/// The outcome of one probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HealthCheckResult {
    Ok,
    Fail,
}

/// A change in a server's liveness.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Died,
    Revived,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthState {
    alive: bool,
    last_result: HealthCheckResult,
    result_count: usize,
}

impl Default for HealthState {
    // Servers start out presumed alive.
    fn default() -> Self {
        Self {
            alive: true,
            last_result: HealthCheckResult::Ok,
            result_count: 0,
        }
    }
}

impl HealthState {
    pub fn alive(&self) -> bool {
        self.alive
    }

    pub fn last_result(&self) -> HealthCheckResult {
        self.last_result
    }

    /// The length of the current streak of [Self::last_result].
    pub fn result_count(&self) -> usize {
        self.result_count
    }

    /// Folds one probe result into the state.
    ///
    /// Returns the transition, if this result caused one.
    pub fn record(&mut self, result: HealthCheckResult) -> Option<Transition> {
        if result == self.last_result {
            self.result_count += 1;
        } else {
            self.last_result = result;
            self.result_count = 1;
        }

        match (self.alive, result) {
            (true, HealthCheckResult::Fail) if self.result_count >= FAILS_BEFORE_DEAD => {
                self.alive = false;
                Some(Transition::Died)
            }
            (false, HealthCheckResult::Ok) if self.result_count >= OKS_BEFORE_ALIVE => {
                self.alive = true;
                Some(Transition::Revived)
            }
            _ => None,
        }
    }
}
