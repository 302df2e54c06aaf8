/// Backend nodes: master/replica pools, liveness bookkeeping and operator control
///
/// Each node keeps its pools behind a short-lived `std::sync::Mutex` that is
/// never held across an await. Role transitions (up, down) are additionally
/// serialized per node by an async lock, so an operator bringing a master up
/// and the health checker bringing it down cannot interleave.

pub mod conn;
pub mod pool;

pub use conn::{BackendConn, Credentials};
pub use pool::{ConnPool, PooledConn};

use crate::config::{Config, NodeConfig};
use crate::error::{ShardGateError, ShardGateResult};
use fnv::FnvHashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

#[derive(Debug)]
struct RoleState {
    addr: Option<String>,
    pool: Option<ConnPool>,
    last_alive: Instant,
}

impl RoleState {
    fn new(addr: Option<&str>, pool: Option<ConnPool>) -> Self {
        Self {
            addr: addr.map(str::to_string),
            pool,
            last_alive: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct NodeState {
    master: RoleState,
    slave: RoleState,
}

impl NodeState {
    fn role(&mut self, role: Role) -> &mut RoleState {
        match role {
            Role::Master => &mut self.master,
            Role::Slave => &mut self.slave,
        }
    }
}

/// One physical backend
#[derive(Debug)]
pub struct BackendNode {
    name: String,
    idle_conns: usize,
    rw_split: bool,
    down_after_noalive: Duration,
    credentials: Credentials,
    connect_timeout: Duration,
    state: Mutex<NodeState>,
    transition: tokio::sync::Mutex<()>,
}

impl BackendNode {
    /// Both roles start up with lazily connecting pools
    pub fn from_config(config: &NodeConfig, connect_timeout: Duration) -> Self {
        let credentials = Credentials::new(config.user.clone(), config.password.clone());
        let open = |addr: &str| {
            ConnPool::new(addr, credentials.clone(), config.idle_conns, connect_timeout)
        };
        let master = RoleState::new(Some(&config.master), Some(open(&config.master)));
        let slave = RoleState::new(config.slave.as_deref(), config.slave.as_deref().map(open));

        Self {
            name: config.name.clone(),
            idle_conns: config.idle_conns,
            rw_split: config.rw_split,
            down_after_noalive: Duration::from_secs(config.down_after_noalive),
            credentials,
            connect_timeout,
            state: Mutex::new(NodeState { master, slave }),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rw_split(&self) -> bool {
        self.rw_split
    }

    pub fn down_after_noalive(&self) -> Duration {
        self.down_after_noalive
    }

    /// Live pool of `role`, `None` while the role is down
    pub fn pool(&self, role: Role) -> Option<ConnPool> {
        self.state().role(role).pool.clone()
    }

    pub fn is_up(&self, role: Role) -> bool {
        self.state().role(role).pool.is_some()
    }

    /// Address of the last pool opened for `role`
    pub fn addr(&self, role: Role) -> Option<String> {
        self.state().role(role).addr.clone()
    }

    pub fn last_alive(&self, role: Role) -> Instant {
        self.state().role(role).last_alive
    }

    pub fn record_alive(&self, role: Role, at: Instant) {
        let mut state = self.state();
        let role = state.role(role);
        if at > role.last_alive {
            role.last_alive = at;
        }
    }

    pub async fn get_master_conn(&self) -> ShardGateResult<PooledConn> {
        self.get_conn(Role::Master).await
    }

    /// Replica when read/write split is on and the replica is up, else master
    pub async fn get_select_conn(&self) -> ShardGateResult<PooledConn> {
        if self.rw_split && self.is_up(Role::Slave) {
            return self.get_conn(Role::Slave).await;
        }
        self.get_conn(Role::Master).await
    }

    async fn get_conn(&self, role: Role) -> ShardGateResult<PooledConn> {
        let pool = self
            .pool(role)
            .ok_or_else(|| ShardGateError::unavailable(self.name.as_str(), role.to_string()))?;
        pool.get_conn().await.map_err(|e| e.on_backend(&self.name))
    }

    /// Open and ping a pool at `addr`, then mark `role` up
    pub async fn up(&self, role: Role, addr: &str) -> ShardGateResult<()> {
        let _transition = self.transition.lock().await;
        if self.is_up(role) {
            return Err(ShardGateError::backend(format!(
                "node {} {} is already up",
                self.name, role
            )));
        }

        let pool = ConnPool::new(
            addr,
            self.credentials.clone(),
            self.idle_conns,
            self.connect_timeout,
        );
        if let Err(e) = pool.ping().await {
            pool.close();
            return Err(e.on_backend(&self.name));
        }

        let mut state = self.state();
        let slot = state.role(role);
        slot.addr = Some(addr.to_string());
        slot.pool = Some(pool);
        slot.last_alive = Instant::now();
        log::info!("Node {} {} is up at {}", self.name, role, addr);
        Ok(())
    }

    /// Close and clear the pool of `role`
    pub async fn down(&self, role: Role) {
        let _transition = self.transition.lock().await;
        let pool = self.state().role(role).pool.take();
        if let Some(pool) = pool {
            pool.close();
            log::error!("Node {} {} is down ({})", self.name, role, pool.addr());
        }
    }

    /// Take `role` down if it has not answered since `last_alive`; a
    /// concurrent success or operator action wins.
    pub async fn down_if_stale(&self, role: Role, window: Duration, now: Instant) -> bool {
        let _transition = self.transition.lock().await;
        let pool = {
            let mut state = self.state();
            let slot = state.role(role);
            if !crate::health::is_expired(slot.last_alive, now, window) {
                return false;
            }
            slot.pool.take()
        };
        match pool {
            Some(pool) => {
                pool.close();
                log::error!(
                    "Node {} {} is down: no successful ping for more than {}",
                    self.name,
                    role,
                    crate::utils::format_duration(window)
                );
                true
            }
            None => false,
        }
    }

    pub async fn up_master(&self, addr: &str) -> ShardGateResult<()> {
        self.up(Role::Master, addr).await
    }

    pub async fn up_slave(&self, addr: &str) -> ShardGateResult<()> {
        self.up(Role::Slave, addr).await
    }

    pub async fn down_master(&self) {
        self.down(Role::Master).await
    }

    pub async fn down_slave(&self) {
        self.down(Role::Slave).await
    }
}

/// All configured nodes by name; the set is fixed at startup
#[derive(Debug, Default)]
pub struct NodePool {
    nodes: FnvHashMap<String, Arc<BackendNode>>,
}

impl NodePool {
    pub fn from_config(config: &Config) -> Self {
        let connect_timeout = Duration::from_secs(config.server.connection_timeout_sec);
        let mut pool = NodePool::default();
        for node in &config.nodes {
            pool.add(BackendNode::from_config(node, connect_timeout));
        }
        pool
    }

    pub fn add(&mut self, node: BackendNode) {
        self.nodes.insert(node.name.to_lowercase(), Arc::new(node));
    }

    pub fn node(&self, name: &str) -> ShardGateResult<Arc<BackendNode>> {
        self.nodes
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| ShardGateError::routing(format!("invalid node {}", name)))
    }

    /// Nodes sorted by name
    pub fn nodes(&self) -> Vec<Arc<BackendNode>> {
        let mut nodes: Vec<Arc<BackendNode>> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub async fn up_master(&self, node: &str, addr: &str) -> ShardGateResult<()> {
        self.node(node)?.up_master(addr).await
    }

    pub async fn up_slave(&self, node: &str, addr: &str) -> ShardGateResult<()> {
        self.node(node)?.up_slave(addr).await
    }

    pub async fn down_master(&self, node: &str) -> ShardGateResult<()> {
        self.node(node)?.down_master().await;
        Ok(())
    }

    pub async fn down_slave(&self, node: &str) -> ShardGateResult<()> {
        self.node(node)?.down_slave().await;
        Ok(())
    }

    /// Close every pool
    pub async fn close(&self) {
        for node in self.nodes() {
            node.down_master().await;
            node.down_slave().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_config(slave: Option<&str>, rw_split: bool) -> NodeConfig {
        NodeConfig {
            name: "node1".to_string(),
            master: "127.0.0.1:1".to_string(),
            slave: slave.map(str::to_string),
            idle_conns: 4,
            rw_split,
            down_after_noalive: 10,
            user: "root".to_string(),
            password: String::new(),
            backend_type: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_roles_start_up() {
        let node = BackendNode::from_config(&node_config(Some("127.0.0.1:2"), true), Duration::from_millis(100));
        assert!(node.is_up(Role::Master));
        assert!(node.is_up(Role::Slave));
        assert_eq!(node.addr(Role::Slave).as_deref(), Some("127.0.0.1:2"));

        let node = BackendNode::from_config(&node_config(None, false), Duration::from_millis(100));
        assert!(!node.is_up(Role::Slave));
    }

    #[tokio::test]
    async fn test_down_master_makes_node_unavailable() {
        let node = BackendNode::from_config(&node_config(None, false), Duration::from_millis(100));
        node.down_master().await;
        assert!(!node.is_up(Role::Master));

        let err = node.get_master_conn().await.unwrap_err();
        assert!(matches!(err, ShardGateError::BackendUnavailable { .. }));
        assert!(err.to_string().contains("unavailable"));
        let err = node.get_select_conn().await.unwrap_err();
        assert!(matches!(err, ShardGateError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_up_fails_when_already_up() {
        let node = BackendNode::from_config(&node_config(None, false), Duration::from_millis(100));
        let err = node.up_master("127.0.0.1:3").await.unwrap_err();
        assert!(err.to_string().contains("already up"));
    }

    #[tokio::test]
    async fn test_up_requires_successful_ping() {
        let node = BackendNode::from_config(&node_config(None, false), Duration::from_millis(100));
        node.down_master().await;
        assert!(node.up_master("127.0.0.1:1").await.is_err());
        assert!(!node.is_up(Role::Master));
    }

    #[tokio::test]
    async fn test_down_if_stale() {
        let node = BackendNode::from_config(&node_config(None, false), Duration::from_millis(100));
        let start = node.last_alive(Role::Master);
        let window = Duration::from_secs(10);

        assert!(!node.down_if_stale(Role::Master, window, start + Duration::from_secs(5)).await);
        assert!(node.is_up(Role::Master));

        node.record_alive(Role::Master, start + Duration::from_secs(8));
        assert!(!node.down_if_stale(Role::Master, window, start + Duration::from_secs(15)).await);

        assert!(node.down_if_stale(Role::Master, window, start + Duration::from_secs(19)).await);
        assert!(!node.is_up(Role::Master));
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let pool = NodePool::default();
        let err = pool.down_master("nope").await.unwrap_err();
        assert!(err.to_string().contains("invalid node"));
    }
}
