/// Health checking for backend node roles
///
/// Every role of every node gets its own periodic task; ticks are skipped
/// while the role has no pool, so a role brought up later is checked too.
/// A successful ping refreshes the role's last-alive time; a failed ping
/// only takes the role down once nothing succeeded for longer than the
/// node's down-after-no-alive window.

use crate::backend::{BackendNode, ConnPool, NodePool, Role};
use crate::config::HealthConfig;
use crate::utils::format_duration;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

/// Health status of a backend role
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy backend
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// A role is stale once more than `window` passed since its last successful
/// ping. A zero window disables the check.
pub fn is_expired(last_alive: Instant, now: Instant, window: Duration) -> bool {
    !window.is_zero() && now.saturating_duration_since(last_alive) > window
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Check one pool
    async fn check_health(&self, pool: &ConnPool) -> HealthStatus;

    /// Get the check interval for this health checker
    fn check_interval(&self) -> Duration;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// COM_PING over a pooled connection
pub struct MysqlHealthChecker {
    check_interval: Duration,
    check_timeout: Duration,
}

impl MysqlHealthChecker {
    pub fn new(check_interval: Duration, check_timeout: Duration) -> Self {
        Self {
            check_interval,
            check_timeout,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(
            Duration::from_secs(config.interval_sec),
            Duration::from_secs(config.timeout_sec),
        )
    }
}

#[async_trait]
impl HealthChecker for MysqlHealthChecker {
    async fn check_health(&self, pool: &ConnPool) -> HealthStatus {
        match pool.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_interval(&self) -> Duration {
        self.check_interval
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}

/// Drives a checker against node roles and applies the liveness policy
pub struct HealthCheckManager {
    checker: Arc<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Arc<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Ping one role once. Roles that are down are left to the operator.
    pub async fn check_role(&self, node: &BackendNode, role: Role) -> HealthStatus {
        let pool = match node.pool(role) {
            Some(pool) => pool,
            None => return HealthStatus::Unknown,
        };

        let status = match timeout(self.checker.check_timeout(), self.checker.check_health(&pool)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };
        apply_status(node, role, &status, Instant::now()).await;
        status
    }

    /// Run continuous health checking for one role of a node
    pub async fn run_health_checks(&self, node: Arc<BackendNode>, role: Role) {
        let mut interval = tokio::time::interval(self.checker.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.check_role(&node, role).await;
        }
    }

    /// One task per role of every node, including roles that are down now
    pub fn spawn_all(self: &Arc<Self>, nodes: &NodePool) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for node in nodes.nodes() {
            for role in [Role::Master, Role::Slave] {
                let manager = Arc::clone(self);
                let node = Arc::clone(&node);
                tracing::debug!(node = node.name(), %role, "Starting health checks");
                handles.push(tokio::spawn(async move {
                    manager.run_health_checks(node, role).await
                }));
            }
        }
        handles
    }
}

async fn apply_status(node: &BackendNode, role: Role, status: &HealthStatus, now: Instant) {
    if status.is_healthy() {
        tracing::trace!(node = node.name(), %role, "Ping ok");
        node.record_alive(role, now);
        return;
    }

    let silent = now.saturating_duration_since(node.last_alive(role));
    tracing::warn!(
        node = node.name(),
        %role,
        "Ping failed ({}), last success {} ago",
        status,
        format_duration(silent)
    );
    node.down_if_stale(role, node.down_after_noalive(), now).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::error::ShardGateError;

    struct MockHealthChecker {
        should_pass: bool,
    }

    #[async_trait]
    impl HealthChecker for MockHealthChecker {
        async fn check_health(&self, _pool: &ConnPool) -> HealthStatus {
            if self.should_pass {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy {
                    reason: "Mock failure".to_string(),
                }
            }
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn check_interval(&self) -> Duration {
            Duration::from_secs(5)
        }
    }

    fn create_test_node(down_after_noalive: u64) -> BackendNode {
        let config = NodeConfig {
            name: "node1".to_string(),
            master: "127.0.0.1:1".to_string(),
            slave: None,
            idle_conns: 2,
            rw_split: false,
            down_after_noalive,
            user: "root".to_string(),
            password: String::new(),
            backend_type: Default::default(),
        };
        BackendNode::from_config(&config, Duration::from_millis(100))
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy { reason: "test".to_string() }.to_string(),
            "Unhealthy: test"
        );
        assert_eq!(HealthStatus::Timeout.to_string(), "Timeout");
        assert_eq!(HealthStatus::Unknown.to_string(), "Unknown");
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Timeout.is_healthy());
    }

    #[test]
    fn test_is_expired() {
        let start = Instant::now();
        let window = Duration::from_secs(3);
        assert!(!is_expired(start, start + Duration::from_secs(3), window));
        assert!(is_expired(start, start + Duration::from_secs(4), window));
        assert!(!is_expired(start, start + Duration::from_secs(3600), Duration::ZERO));
        // clock skew never expires
        assert!(!is_expired(start + Duration::from_secs(10), start, window));
    }

    #[tokio::test]
    async fn test_failures_within_window_keep_role_up() {
        let node = create_test_node(3);
        let start = node.last_alive(Role::Master);
        let failed = HealthStatus::Timeout;

        apply_status(&node, Role::Master, &failed, start + Duration::from_secs(1)).await;
        apply_status(&node, Role::Master, &failed, start + Duration::from_secs(2)).await;
        assert!(node.is_up(Role::Master));

        // one success resets the clock
        apply_status(&node, Role::Master, &HealthStatus::Healthy, start + Duration::from_secs(3)).await;
        apply_status(&node, Role::Master, &failed, start + Duration::from_secs(5)).await;
        assert!(node.is_up(Role::Master));

        apply_status(&node, Role::Master, &failed, start + Duration::from_secs(7)).await;
        assert!(!node.is_up(Role::Master));
        let err = node.get_master_conn().await.unwrap_err();
        assert!(matches!(err, ShardGateError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_zero_window_never_downs() {
        let node = create_test_node(0);
        let start = node.last_alive(Role::Master);
        apply_status(&node, Role::Master, &HealthStatus::Timeout, start + Duration::from_secs(86400)).await;
        assert!(node.is_up(Role::Master));
    }

    #[tokio::test]
    async fn test_check_role_with_mock() {
        let node = create_test_node(3);
        let manager = HealthCheckManager::new(Arc::new(MockHealthChecker { should_pass: true }));
        let before = node.last_alive(Role::Master);
        assert!(manager.check_role(&node, Role::Master).await.is_healthy());
        assert!(node.last_alive(Role::Master) >= before);

        // roles without a pool are not checked
        assert_eq!(manager.check_role(&node, Role::Slave).await, HealthStatus::Unknown);

        let manager = HealthCheckManager::new(Arc::new(MockHealthChecker { should_pass: false }));
        assert!(!manager.check_role(&node, Role::Master).await.is_healthy());
        assert!(node.is_up(Role::Master));
    }

    #[tokio::test]
    async fn test_spawn_all_covers_roles_without_pool() {
        let mut nodes = NodePool::default();
        nodes.add(create_test_node(3));
        let manager = Arc::new(HealthCheckManager::new(Arc::new(MockHealthChecker {
            should_pass: true,
        })));

        let handles = manager.spawn_all(&nodes);
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.abort();
        }
    }

    #[test]
    fn test_checker_from_config() {
        let checker = MysqlHealthChecker::from_config(&HealthConfig {
            interval_sec: 3,
            timeout_sec: 2,
        });
        assert_eq!(checker.check_interval(), Duration::from_secs(3));
        assert_eq!(checker.check_timeout(), Duration::from_secs(2));
    }
}
