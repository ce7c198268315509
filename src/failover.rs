// Platform Sync Engine — bootstrap discovery and failover strategy.
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::channel_manager::AccessPoint;

/// A server's role, distinguishing the compiled-in bootstrap/directory
/// servers from the operations servers they hand out (§4.4).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
pub enum ServerKind {
    #[display("bootstrap")]
    Bootstrap,
    #[display("operations")]
    Operations,
}

/// The Failover Strategy's decision space (§4.4).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum FailoverDecision {
    /// Re-attempt the same server after `delay`.
    #[display("retry after {0:?}")]
    Retry(Duration),
    /// Rotate to the next server of the same kind.
    #[display("use next server")]
    UseNext,
    /// Fall back to the bootstrap server list.
    #[display("use next bootstrap server")]
    UseNextBootstrap,
    /// Terminal; surface fatal error to host.
    #[display("stop application")]
    StopApp,
}

/// Implementers may substitute their own policy for `DefaultFailoverStrategy`
/// (§4.4).
pub trait FailoverStrategy: Send {
    /// Invoked whenever a transport reports failure or a sync times out for
    /// the server identified by `access_point_id` of role `kind`.
    fn on_failure(&mut self, kind: ServerKind, access_point_id: u32) -> FailoverDecision;

    /// Resets the failure counter for a server that just succeeded.
    fn on_success(&mut self, kind: ServerKind, access_point_id: u32);
}

/// Failure-counter-driven default strategy (§4.4): escalates
/// `Retry -> UseNext -> UseNextBootstrap -> StopApp` across a full
/// round-robin cycle, with exponential backoff bounded by a ceiling.
pub struct DefaultFailoverStrategy {
    base_delay: Duration,
    max_delay: Duration,
    pool_size: HashMap<ServerKind, usize>,
    failures: Mutex<HashMap<(ServerKind, u32), u32>>,
}

impl DefaultFailoverStrategy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        DefaultFailoverStrategy {
            base_delay,
            max_delay,
            pool_size: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Tells the strategy how many servers of `kind` are currently known,
    /// so it can detect a full round-robin cycle.
    pub fn set_pool_size(&mut self, kind: ServerKind, size: usize) {
        self.pool_size.insert(kind, size);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        std::cmp::min(scaled, self.max_delay)
    }
}

impl Default for DefaultFailoverStrategy {
    fn default() -> Self {
        DefaultFailoverStrategy::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl FailoverStrategy for DefaultFailoverStrategy {
    fn on_failure(&mut self, kind: ServerKind, access_point_id: u32) -> FailoverDecision {
        let mut failures = self.failures.lock().expect("failover mutex poisoned");
        let count = failures.entry((kind, access_point_id)).or_insert(0);
        *count += 1;
        let pool_size = self.pool_size.get(&kind).copied().unwrap_or(1).max(1);

        match kind {
            ServerKind::Bootstrap if *count as usize >= pool_size => FailoverDecision::StopApp,
            ServerKind::Bootstrap => FailoverDecision::UseNext,
            ServerKind::Operations => {
                if *count == 1 {
                    FailoverDecision::Retry(self.backoff(0))
                } else if (*count as usize) <= pool_size {
                    FailoverDecision::UseNext
                } else if *count as usize <= pool_size * 2 {
                    FailoverDecision::UseNextBootstrap
                } else {
                    FailoverDecision::StopApp
                }
            }
        }
    }

    fn on_success(&mut self, kind: ServerKind, access_point_id: u32) {
        self.failures
            .lock()
            .expect("failover mutex poisoned")
            .remove(&(kind, access_point_id));
    }
}

/// Discovers operations servers via a compiled-in bootstrap list and keeps
/// the currently-offered server pool (§4.4).
pub struct BootstrapPool {
    bootstrap_servers: Vec<AccessPoint>,
    operations_servers: Mutex<Vec<AccessPoint>>,
}

impl BootstrapPool {
    pub fn new(bootstrap_servers: Vec<AccessPoint>) -> Self {
        BootstrapPool {
            bootstrap_servers,
            operations_servers: Mutex::new(Vec::new()),
        }
    }

    pub fn bootstrap_servers(&self) -> &[AccessPoint] {
        &self.bootstrap_servers
    }

    pub fn set_operations_servers(&self, servers: Vec<AccessPoint>) {
        *self.operations_servers.lock().expect("bootstrap pool mutex poisoned") = servers;
    }

    pub fn operations_servers(&self) -> Vec<AccessPoint> {
        self.operations_servers.lock().expect("bootstrap pool mutex poisoned").clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_operations_failure_retries() {
        let mut strategy = DefaultFailoverStrategy::default();
        strategy.set_pool_size(ServerKind::Operations, 3);
        let decision = strategy.on_failure(ServerKind::Operations, 1);
        assert!(matches!(decision, FailoverDecision::Retry(_)));
    }

    #[test]
    fn escalates_after_full_cycle() {
        let mut strategy = DefaultFailoverStrategy::default();
        strategy.set_pool_size(ServerKind::Operations, 2);
        assert!(matches!(
            strategy.on_failure(ServerKind::Operations, 1),
            FailoverDecision::Retry(_)
        ));
        assert!(matches!(
            strategy.on_failure(ServerKind::Operations, 1),
            FailoverDecision::UseNext
        ));
        assert!(matches!(
            strategy.on_failure(ServerKind::Operations, 1),
            FailoverDecision::UseNextBootstrap
        ));
        assert!(matches!(
            strategy.on_failure(ServerKind::Operations, 1),
            FailoverDecision::UseNextBootstrap
        ));
        assert!(matches!(
            strategy.on_failure(ServerKind::Operations, 1),
            FailoverDecision::StopApp
        ));
    }

    #[test]
    fn success_resets_failure_count() {
        let mut strategy = DefaultFailoverStrategy::default();
        strategy.set_pool_size(ServerKind::Operations, 3);
        strategy.on_failure(ServerKind::Operations, 1);
        strategy.on_success(ServerKind::Operations, 1);
        assert!(matches!(
            strategy.on_failure(ServerKind::Operations, 1),
            FailoverDecision::Retry(_)
        ));
    }

    #[test]
    fn bootstrap_failure_stops_after_pool_exhausted() {
        let mut strategy = DefaultFailoverStrategy::default();
        strategy.set_pool_size(ServerKind::Bootstrap, 1);
        assert!(matches!(
            strategy.on_failure(ServerKind::Bootstrap, 1),
            FailoverDecision::StopApp
        ));
    }
}
