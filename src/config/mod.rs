/// Configuration management for shardgate

use crate::router::parse_range_spec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub use crate::error::ConfigError;

/// Main shardgate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Backend node definitions
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Logical schemas exposed to clients
    #[serde(default)]
    pub schemas: Vec<SchemaConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// User name clients authenticate with
    pub user: String,
    /// Password clients authenticate with
    #[serde(default)]
    pub password: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Backend connect timeout in seconds
    pub connection_timeout_sec: u64,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Ping interval in seconds
    pub interval_sec: u64,
    /// Ping timeout in seconds
    pub timeout_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

/// One physical backend with a master and an optional replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Master address, host:port
    pub master: String,
    /// Replica address, host:port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave: Option<String>,
    /// Idle connections kept per pool
    #[serde(default = "default_idle_conns")]
    pub idle_conns: usize,
    /// Send reads to the replica when it is up
    #[serde(default)]
    pub rw_split: bool,
    /// Seconds without a successful ping before a role is marked down; 0 disables
    #[serde(default)]
    pub down_after_noalive: u64,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub backend_type: BackendType,
}

fn default_idle_conns() -> usize {
    16
}

/// Compiled-in backend kinds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Mysql,
}

/// Logical database and its sharding rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub db: String,
    #[serde(default)]
    pub backend_type: BackendType,
    /// Nodes participating in this schema
    pub nodes: Vec<String>,
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Node serving every table without a shard rule
    pub default: String,
    #[serde(default)]
    pub shard: Vec<ShardConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub table: String,
    /// Shard key column
    pub key: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub nodes: Vec<String>,
    /// Range boundaries, e.g. "-10000-20000-"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Hash,
    Range,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1:4000".to_string(),
                user: "root".to_string(),
                password: String::new(),
                max_connections: 1024,
                connection_timeout_sec: 5,
            },
            health: HealthConfig {
                interval_sec: 3,
                timeout_sec: 2,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
            nodes: vec![NodeConfig {
                name: "node1".to_string(),
                master: "127.0.0.1:3306".to_string(),
                slave: None,
                idle_conns: default_idle_conns(),
                rw_split: false,
                down_after_noalive: 300,
                user: "root".to_string(),
                password: String::new(),
                backend_type: BackendType::Mysql,
            }],
            schemas: vec![SchemaConfig {
                db: "shardgate".to_string(),
                backend_type: BackendType::Mysql,
                nodes: vec!["node1".to_string()],
                rules: RulesConfig {
                    default: "node1".to_string(),
                    shard: Vec::new(),
                },
            }],
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse, normalize and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Node and table names are matched case-insensitively
    pub fn normalize(&mut self) {
        for node in &mut self.nodes {
            node.name = node.name.trim().to_lowercase();
        }
        for schema in &mut self.schemas {
            schema.nodes = schema.nodes.iter().map(|n| n.trim().to_lowercase()).collect();
            schema.rules.default = schema.rules.default.trim().to_lowercase();
            for shard in &mut schema.rules.shard {
                shard.table = shard.table.trim().to_lowercase();
                shard.key = shard.key.trim().to_lowercase();
                shard.nodes = shard.nodes.iter().map(|n| n.trim().to_lowercase()).collect();
            }
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server config
        if self.server.listen_addr.trim().is_empty() {
            return Err(invalid("listen_addr cannot be empty"));
        }

        if self.server.max_connections == 0 {
            return Err(invalid("max_connections must be greater than 0"));
        }

        if self.server.connection_timeout_sec == 0 {
            return Err(invalid("connection_timeout_sec must be greater than 0"));
        }

        // Validate health config
        if self.health.interval_sec == 0 {
            return Err(invalid("health check interval_sec must be greater than 0"));
        }

        if self.health.timeout_sec == 0 {
            return Err(invalid("health check timeout_sec must be greater than 0"));
        }

        if self.health.timeout_sec >= self.health.interval_sec {
            return Err(invalid("health check timeout_sec must be less than interval_sec"));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid(format!("Invalid log level: {}", self.logging.level))),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(invalid(format!("Invalid log format: {}", self.logging.format))),
        }

        self.validate_nodes()?;
        self.validate_schemas()
    }

    fn validate_nodes(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(invalid("at least one node is required"));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(invalid("node name cannot be empty"));
            }
            if !names.insert(node.name.as_str()) {
                return Err(invalid(format!("duplicate node {}", node.name)));
            }
            if node.master.trim().is_empty() {
                return Err(invalid(format!("node {} must have a master address", node.name)));
            }
            if node.slave.as_deref().is_some_and(|s| s.trim().is_empty()) {
                return Err(invalid(format!("node {} has an empty slave address", node.name)));
            }
        }
        Ok(())
    }

    fn validate_schemas(&self) -> Result<(), ConfigError> {
        if self.schemas.is_empty() {
            return Err(invalid("at least one schema is required"));
        }

        let mut dbs = HashSet::new();
        for schema in &self.schemas {
            if schema.db.is_empty() {
                return Err(invalid("schema db cannot be empty"));
            }
            // schema names are matched case-insensitively
            if !dbs.insert(schema.db.to_lowercase()) {
                return Err(invalid(format!("duplicate schema {}", schema.db)));
            }
            if schema.nodes.is_empty() {
                return Err(invalid(format!("schema {} must have nodes", schema.db)));
            }

            let mut members = HashSet::new();
            for node in &schema.nodes {
                if self.node(node).is_none() {
                    return Err(invalid(format!(
                        "schema {} references unknown node {}",
                        schema.db, node
                    )));
                }
                if !members.insert(node.as_str()) {
                    return Err(invalid(format!(
                        "schema {} lists node {} twice",
                        schema.db, node
                    )));
                }
            }

            let member = |node: &str, what: &str| -> Result<(), ConfigError> {
                if members.contains(node) {
                    Ok(())
                } else {
                    Err(invalid(format!(
                        "{} node {} is not a member of schema {}",
                        what, node, schema.db
                    )))
                }
            };

            if schema.rules.default.is_empty() {
                return Err(invalid(format!("schema {} must have a default rule", schema.db)));
            }
            member(&schema.rules.default, "default")?;

            let mut tables = HashSet::new();
            for shard in &schema.rules.shard {
                if !tables.insert(shard.table.as_str()) {
                    return Err(invalid(format!(
                        "table {} has more than one shard rule",
                        shard.table
                    )));
                }
                if shard.key.is_empty() {
                    return Err(invalid(format!("table {} must have a shard key", shard.table)));
                }
                if shard.nodes.is_empty() {
                    return Err(invalid(format!("table {} must have nodes", shard.table)));
                }
                let mut shard_nodes = HashSet::new();
                for node in &shard.nodes {
                    member(node, "shard")?;
                    if !shard_nodes.insert(node.as_str()) {
                        return Err(invalid(format!(
                            "table {} lists node {} twice",
                            shard.table, node
                        )));
                    }
                }

                match shard.rule_type {
                    RuleType::Hash => {}
                    RuleType::Range => {
                        let spec = shard.range.as_deref().ok_or_else(|| {
                            invalid(format!("range rule for {} needs a range", shard.table))
                        })?;
                        let boundaries = parse_range_spec(spec)
                            .map_err(|e| invalid(format!("table {}: {}", shard.table, e)))?;
                        if boundaries.len() + 1 != shard.nodes.len() {
                            return Err(invalid(format!(
                                "table {}: {} boundaries cannot split {} nodes",
                                shard.table,
                                boundaries.len(),
                                shard.nodes.len()
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let node = |name: &str, master: &str, slave: Option<&str>| NodeConfig {
            name: name.to_string(),
            master: master.to_string(),
            slave: slave.map(str::to_string),
            idle_conns: default_idle_conns(),
            rw_split: slave.is_some(),
            down_after_noalive: 300,
            user: "root".to_string(),
            password: String::new(),
            backend_type: BackendType::Mysql,
        };

        let config = Config {
            nodes: vec![
                node("node1", "10.0.1.10:3306", None),
                node("node2", "10.0.1.11:3306", Some("10.0.1.21:3306")),
                node("node3", "10.0.1.12:3306", Some("10.0.1.22:3306")),
            ],
            schemas: vec![SchemaConfig {
                db: "shardeddb".to_string(),
                backend_type: BackendType::Mysql,
                nodes: vec!["node1".into(), "node2".into(), "node3".into()],
                rules: RulesConfig {
                    default: "node1".to_string(),
                    shard: vec![
                        ShardConfig {
                            table: "users".to_string(),
                            key: "id".to_string(),
                            rule_type: RuleType::Hash,
                            nodes: vec!["node2".into(), "node3".into()],
                            range: None,
                        },
                        ShardConfig {
                            table: "orders".to_string(),
                            key: "id".to_string(),
                            rule_type: RuleType::Range,
                            nodes: vec!["node2".into(), "node3".into()],
                            range: Some("-10000-".to_string()),
                        },
                    ],
                },
            }],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const SHARDED: &str = r#"
[server]
listen_addr = "127.0.0.1:4000"
user = "root"
password = "secret"
max_connections = 100
connection_timeout_sec = 3

[health]
interval_sec = 3
timeout_sec = 1

[logging]
level = "debug"
format = "text"

[[nodes]]
name = "Node1"
master = "127.0.0.1:3306"
user = "root"

[[nodes]]
name = "node2"
master = "127.0.0.1:3307"
slave = "127.0.0.1:3317"
rw_split = true
down_after_noalive = 30
user = "root"

[[nodes]]
name = "node3"
master = "127.0.0.1:3308"
user = "root"

[[schemas]]
db = "shardeddb"
backend_type = "mysql"
nodes = ["node1", "node2", "node3"]

[schemas.rules]
default = "node1"

[[schemas.rules.shard]]
table = "Users"
key = "id"
type = "hash"
nodes = ["node2", "node3"]

[[schemas.rules.shard]]
table = "orders"
key = "id"
type = "range"
nodes = ["node2", "node3"]
range = "-10000-"
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sharded_config() {
        let config = Config::from_toml_str(SHARDED).unwrap();
        assert_eq!(config.nodes[0].name, "node1");
        assert_eq!(config.nodes[0].idle_conns, 16);
        assert!(config.nodes[1].rw_split);
        assert_eq!(config.nodes[1].slave.as_deref(), Some("127.0.0.1:3317"));

        let schema = &config.schemas[0];
        assert_eq!(schema.backend_type, BackendType::Mysql);
        assert_eq!(schema.rules.shard[0].table, "users");
        assert_eq!(schema.rules.shard[1].rule_type, RuleType::Range);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.server.max_connections = 0;
        assert!(config.validate().is_err());

        config.server.max_connections = 1000;
        assert!(config.validate().is_ok());

        config.health.timeout_sec = config.health.interval_sec;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_node_rejected() {
        let text = SHARDED.replace(r#"nodes = ["node2", "node3"]"#, r#"nodes = ["node2", "node9"]"#);
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let text = SHARDED.replace(r#"name = "node3""#, r#"name = "node2""#);
        assert!(Config::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_duplicate_schema_differing_in_case_rejected() {
        let mut config = Config::from_toml_str(SHARDED).unwrap();
        let mut twin = config.schemas[0].clone();
        twin.db = twin.db.to_uppercase();
        config.schemas.push(twin);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate schema"));
    }

    #[test]
    fn test_range_boundary_count_checked() {
        let text = SHARDED.replace(r#"range = "-10000-""#, r#"range = "-100-200-""#);
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("boundaries"));
    }

    #[test]
    fn test_missing_default_rejected() {
        let text = SHARDED.replace(r#"default = "node1""#, r#"default = """#);
        assert!(Config::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_unknown_rule_type_is_parse_error() {
        let text = SHARDED.replace(r#"type = "hash""#, r#"type = "modulo""#);
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.nodes.len(), 3);
        assert_eq!(loaded.schemas[0].rules.shard.len(), 2);
        assert_eq!(loaded.schemas[0].rules.shard[1].range.as_deref(), Some("-10000-"));
    }
}
