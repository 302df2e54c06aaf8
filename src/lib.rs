/// ShardGate - MySQL wire-compatible sharding proxy
///
/// Clients see one logical schema. Tables are spread over backend nodes by
/// hash or range rules on a key column; statements that cannot be pinned to
/// one node fan out and their results are merged. Every node has a master and
/// an optional replica, kept up or taken down by health checks and by
/// explicit operator calls.
pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod merge;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod sql;
pub mod utils;

use crate::backend::{Credentials, NodePool};
use crate::config::Config;
use crate::error::ShardGateResult;
use crate::health::{HealthCheckManager, MysqlHealthChecker};
use crate::proxy::{Handler, Listener};
use crate::router::Router;
use std::future::Future;
use std::sync::Arc;

/// Main shardgate proxy
pub struct ShardGate {
    config: Config,
    router: Arc<Router>,
    nodes: Arc<NodePool>,
    handler: Handler,
    health: Arc<HealthCheckManager>,
}

impl ShardGate {
    /// Build routers, node pools and the handler from a validated configuration
    pub fn new(config: Config) -> ShardGateResult<Self> {
        config.validate()?;

        let router = Arc::new(Router::from_config(&config)?);
        let nodes = Arc::new(NodePool::from_config(&config));
        let handler = Handler::build(&config, Arc::clone(&router), Arc::clone(&nodes))?;
        let health = Arc::new(HealthCheckManager::new(Arc::new(
            MysqlHealthChecker::from_config(&config.health),
        )));

        Ok(Self {
            config,
            router,
            nodes,
            handler,
            health,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn nodes(&self) -> &Arc<NodePool> {
        &self.nodes
    }

    /// Bind the client listener on the configured address
    pub async fn bind(&self) -> ShardGateResult<Listener> {
        let server = &self.config.server;
        Listener::bind(
            &server.listen_addr,
            self.handler.clone(),
            Credentials::new(server.user.clone(), server.password.clone()),
            server.max_connections,
        )
        .await
    }

    /// Serve clients on `listener` with health checks running until
    /// `shutdown` resolves; pools are closed afterwards.
    pub async fn serve<F>(&self, listener: Listener, shutdown: F) -> ShardGateResult<()>
    where
        F: Future<Output = ()>,
    {
        let checks = self.health.spawn_all(&self.nodes);
        log::info!(
            "Serving {} schema(s) over {} node(s), {} health check task(s)",
            self.router.schema_names().len(),
            self.nodes.len(),
            checks.len()
        );

        let result = listener.serve(shutdown).await;

        for check in checks {
            check.abort();
        }
        self.nodes.close().await;
        result
    }

    /// Bind and serve until Ctrl-C
    pub async fn run(&self) -> ShardGateResult<()> {
        let listener = self.bind().await?;
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    pub async fn up_master(&self, node: &str, addr: &str) -> ShardGateResult<()> {
        self.nodes.up_master(node, addr).await
    }

    pub async fn up_slave(&self, node: &str, addr: &str) -> ShardGateResult<()> {
        self.nodes.up_slave(node, addr).await
    }

    pub async fn down_master(&self, node: &str) -> ShardGateResult<()> {
        self.nodes.down_master(node).await
    }

    pub async fn down_slave(&self, node: &str) -> ShardGateResult<()> {
        self.nodes.down_slave(node).await
    }
}
