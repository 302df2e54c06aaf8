/// Sharding router: table rules per schema and key-to-node resolution

use crate::config::{Config, RuleType, SchemaConfig};
use crate::error::{ShardGateError, ShardGateResult};
use crate::sql::{Literal, Statement, StatementKind};
use fnv::{FnvHashMap, FnvHasher};
use std::hash::Hasher;

/// Shard key value extracted from a statement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Int(i64),
    Str(String),
}

impl KeyValue {
    /// String literals holding an integer route like the integer
    pub fn from_literal(literal: &Literal) -> Option<Self> {
        match literal {
            Literal::Int(v) => Some(KeyValue::Int(*v)),
            Literal::Str(s) => Some(match s.trim().parse::<i64>() {
                Ok(v) => KeyValue::Int(v),
                Err(_) => KeyValue::Str(s.clone()),
            }),
            Literal::Other => None,
        }
    }

    /// Stable across calls and processes: integers hash to themselves,
    /// strings to their FNV-1a 64 digest
    pub fn stable_hash(&self) -> u64 {
        match self {
            KeyValue::Int(v) => *v as u64,
            KeyValue::Str(s) => {
                let mut hasher = FnvHasher::default();
                hasher.write(s.as_bytes());
                hasher.finish()
            }
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Str(value.to_string())
    }
}

/// Parse boundaries such as "-10000-20000-" into [10000, 20000].
///
/// One leading and one trailing '-' mark the open ends of the first and
/// last interval.
pub fn parse_range_spec(spec: &str) -> Result<Vec<i64>, String> {
    let trimmed = spec.trim();
    let trimmed = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix('-').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(format!("range '{}' has no boundaries", spec));
    }

    let boundaries = trimmed
        .split('-')
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| format!("invalid range boundary '{}' in '{}'", part, spec))
        })
        .collect::<Result<Vec<i64>, String>>()?;

    if boundaries.windows(2).any(|w| w[0] >= w[1]) {
        return Err(format!("range boundaries in '{}' must be strictly increasing", spec));
    }
    Ok(boundaries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingRule {
    Default {
        node: String,
    },
    Hash {
        table: String,
        key: String,
        nodes: Vec<String>,
    },
    /// `boundaries.len() == nodes.len() - 1`, strictly increasing
    Range {
        table: String,
        key: String,
        nodes: Vec<String>,
        boundaries: Vec<i64>,
    },
}

impl ShardingRule {
    pub fn range(
        table: &str,
        key: &str,
        nodes: Vec<String>,
        boundaries: Vec<i64>,
    ) -> ShardGateResult<Self> {
        if boundaries.len() + 1 != nodes.len() {
            return Err(ShardGateError::routing(format!(
                "table {}: {} boundaries cannot split {} nodes",
                table,
                boundaries.len(),
                nodes.len()
            )));
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ShardGateError::routing(format!(
                "table {}: range boundaries must be strictly increasing",
                table
            )));
        }
        Ok(ShardingRule::Range {
            table: table.to_string(),
            key: key.to_string(),
            nodes,
            boundaries,
        })
    }

    pub fn nodes(&self) -> &[String] {
        match self {
            ShardingRule::Default { node } => std::slice::from_ref(node),
            ShardingRule::Hash { nodes, .. } | ShardingRule::Range { nodes, .. } => nodes,
        }
    }

    /// Shard key column, `None` for the default rule
    pub fn key(&self) -> Option<&str> {
        match self {
            ShardingRule::Default { .. } => None,
            ShardingRule::Hash { key, .. } | ShardingRule::Range { key, .. } => Some(key),
        }
    }

    pub fn find_node(&self, key: &KeyValue) -> ShardGateResult<&str> {
        match self {
            ShardingRule::Default { node } => Ok(node),
            ShardingRule::Hash { table, nodes, .. } => {
                let count = nodes.len() as u64;
                let index = key.stable_hash().checked_rem(count).ok_or_else(|| {
                    ShardGateError::routing(format!("table {} has no nodes", table))
                })?;
                Ok(&nodes[index as usize])
            }
            ShardingRule::Range {
                table,
                nodes,
                boundaries,
                ..
            } => match key {
                KeyValue::Int(v) => Ok(&nodes[boundaries.partition_point(|b| *b <= *v)]),
                KeyValue::Str(s) => Err(ShardGateError::routing(format!(
                    "range-sharded table {} needs an integer key, got '{}'",
                    table, s
                ))),
            },
        }
    }

    /// Distinct nodes for a set of key values, in rule order. `None` when
    /// some value cannot be resolved, which calls for a full fan-out.
    fn nodes_for(&self, values: &[&Literal]) -> Option<Vec<String>> {
        let nodes = self.nodes();
        let mut hit = vec![false; nodes.len()];
        for literal in values {
            let key = KeyValue::from_literal(literal)?;
            let node = self.find_node(&key).ok()?;
            if let Some(index) = nodes.iter().position(|n| n == node) {
                hit[index] = true;
            }
        }
        Some(
            nodes
                .iter()
                .zip(hit)
                .filter(|(_, hit)| *hit)
                .map(|(node, _)| node.clone())
                .collect(),
        )
    }
}

/// Rules of one logical schema
#[derive(Debug, Clone)]
pub struct SchemaRouter {
    db: String,
    nodes: Vec<String>,
    default_rule: ShardingRule,
    rules: FnvHashMap<String, ShardingRule>,
}

impl SchemaRouter {
    pub fn new(db: &str, nodes: Vec<String>, default_node: &str) -> Self {
        Self {
            db: db.to_string(),
            nodes,
            default_rule: ShardingRule::Default {
                node: default_node.to_string(),
            },
            rules: FnvHashMap::default(),
        }
    }

    pub fn from_config(schema: &SchemaConfig) -> ShardGateResult<Self> {
        let mut router = Self::new(&schema.db, schema.nodes.clone(), &schema.rules.default);
        for shard in &schema.rules.shard {
            let rule = match shard.rule_type {
                RuleType::Hash => ShardingRule::Hash {
                    table: shard.table.clone(),
                    key: shard.key.clone(),
                    nodes: shard.nodes.clone(),
                },
                RuleType::Range => {
                    let spec = shard.range.as_deref().unwrap_or_default();
                    let boundaries = parse_range_spec(spec).map_err(ShardGateError::routing)?;
                    ShardingRule::range(&shard.table, &shard.key, shard.nodes.clone(), boundaries)?
                }
            };
            router.add_rule(rule)?;
        }
        Ok(router)
    }

    pub fn add_rule(&mut self, rule: ShardingRule) -> ShardGateResult<()> {
        let table = match &rule {
            ShardingRule::Default { .. } => {
                return Err(ShardGateError::routing("default rule cannot be bound to a table"))
            }
            ShardingRule::Hash { table, .. } | ShardingRule::Range { table, .. } => {
                table.to_lowercase()
            }
        };
        if rule.nodes().is_empty() {
            return Err(ShardGateError::routing(format!(
                "table {} has no nodes to shard across",
                table
            )));
        }
        if self.rules.contains_key(&table) {
            return Err(ShardGateError::routing(format!(
                "table {} already has a rule",
                table
            )));
        }
        self.rules.insert(table, rule);
        Ok(())
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn default_node(&self) -> &str {
        &self.default_rule.nodes()[0]
    }

    /// Rule for `table`, falling back to the default rule
    pub fn rule(&self, table: &str) -> &ShardingRule {
        self.rules
            .get(&table.to_lowercase())
            .unwrap_or(&self.default_rule)
    }

    pub fn find_node(&self, table: &str, key: &KeyValue) -> ShardGateResult<&str> {
        self.rule(table).find_node(key)
    }

    /// Target nodes for a statement, in rule order
    pub fn route(&self, statement: &Statement) -> ShardGateResult<Vec<String>> {
        let table = match &statement.table {
            Some(table) => table,
            None => return Ok(self.default_rule.nodes().to_vec()),
        };
        let rule = self.rule(table);
        let key = match rule.key() {
            Some(key) => key,
            None => return Ok(rule.nodes().to_vec()),
        };

        if statement.kind.is_insert() {
            return Self::route_insert(rule, table, key, statement).map(|node| vec![node]);
        }

        if statement.kind == StatementKind::Update
            && statement.assigned_columns.iter().any(|c| c == key)
        {
            return Err(ShardGateError::routing(format!(
                "cannot update shard key column {} of table {}",
                key, table
            )));
        }

        let nodes = statement
            .key_values(key)
            .and_then(|values| rule.nodes_for(&values))
            .filter(|nodes| !nodes.is_empty())
            .unwrap_or_else(|| rule.nodes().to_vec());
        Ok(nodes)
    }

    fn route_insert(
        rule: &ShardingRule,
        table: &str,
        key: &str,
        statement: &Statement,
    ) -> ShardGateResult<String> {
        let rows = match &statement.insert {
            Some(rows) if !rows.from_select => rows,
            _ => {
                return Err(ShardGateError::routing(format!(
                    "INSERT ... SELECT is not supported on sharded table {}",
                    table
                )))
            }
        };
        let values = rows.column_values(key).ok_or_else(|| {
            ShardGateError::routing(format!(
                "insert into sharded table {} must list shard key column {}",
                table, key
            ))
        })?;

        let mut target: Option<&str> = None;
        for literal in values {
            let value = KeyValue::from_literal(literal).ok_or_else(|| {
                ShardGateError::routing(format!(
                    "shard key column {} of table {} must be a literal value",
                    key, table
                ))
            })?;
            let node = rule.find_node(&value)?;
            match target {
                Some(previous) if previous != node => {
                    return Err(ShardGateError::routing(format!(
                        "insert into {} spans nodes {} and {}",
                        table, previous, node
                    )))
                }
                _ => target = Some(node),
            }
        }

        target
            .map(str::to_string)
            .ok_or_else(|| ShardGateError::routing(format!("insert into {} has no rows", table)))
    }
}

/// All schemas, immutable after startup
#[derive(Debug, Clone, Default)]
pub struct Router {
    schemas: FnvHashMap<String, SchemaRouter>,
}

impl Router {
    pub fn from_config(config: &Config) -> ShardGateResult<Self> {
        let mut router = Router::default();
        for schema in &config.schemas {
            router.add_schema(SchemaRouter::from_config(schema)?);
        }
        Ok(router)
    }

    pub fn add_schema(&mut self, schema: SchemaRouter) {
        self.schemas.insert(schema.db.to_lowercase(), schema);
    }

    pub fn schema(&self, db: &str) -> ShardGateResult<&SchemaRouter> {
        self.schemas
            .get(&db.to_lowercase())
            .ok_or_else(|| ShardGateError::routing(format!("unknown schema '{}'", db)))
    }

    pub fn has_schema(&self, db: &str) -> bool {
        self.schemas.contains_key(&db.to_lowercase())
    }

    /// Schema names in sorted order
    pub fn schema_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.values().map(|s| s.db.clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::analyze;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn schema() -> SchemaRouter {
        let mut router = SchemaRouter::new("shardeddb", nodes(&["node1", "node2", "node3"]), "node1");
        router
            .add_rule(ShardingRule::Hash {
                table: "users".to_string(),
                key: "id".to_string(),
                nodes: nodes(&["node2", "node3"]),
            })
            .unwrap();
        router
            .add_rule(ShardingRule::range("orders", "id", nodes(&["node2", "node3"]), vec![10000]).unwrap())
            .unwrap();
        router
    }

    fn route(router: &SchemaRouter, sql: &str) -> ShardGateResult<Vec<String>> {
        router.route(&analyze(sql).unwrap())
    }

    #[test]
    fn test_hash_rule_is_stable_and_covers_all_nodes() {
        let router = schema();
        assert_eq!(router.find_node("users", &KeyValue::Int(11)).unwrap(), "node3");
        assert_eq!(router.find_node("users", &KeyValue::Int(10)).unwrap(), "node2");

        let mut seen = std::collections::HashSet::new();
        for k in 0..100i64 {
            let first = router.find_node("users", &k.into()).unwrap().to_string();
            assert_eq!(router.find_node("users", &k.into()).unwrap(), first);
            seen.insert(first);
        }
        assert_eq!(seen.len(), 2);

        let a = router.find_node("users", &"alice".into()).unwrap().to_string();
        assert_eq!(router.find_node("users", &"alice".into()).unwrap(), a);
    }

    #[test]
    fn test_range_boundaries() {
        let router = schema();
        assert_eq!(router.find_node("orders", &KeyValue::Int(9999)).unwrap(), "node2");
        assert_eq!(router.find_node("orders", &KeyValue::Int(10000)).unwrap(), "node3");
        assert_eq!(router.find_node("orders", &KeyValue::Int(i64::MIN)).unwrap(), "node2");
        assert!(router.find_node("orders", &"abc".into()).is_err());
    }

    #[test]
    fn test_default_rule_ignores_key() {
        let router = schema();
        for key in [KeyValue::Int(1), KeyValue::Int(-5), KeyValue::from("zzz")] {
            assert_eq!(router.find_node("unsharded_table", &key).unwrap(), "node1");
        }
    }

    #[test]
    fn test_parse_range_spec() {
        assert_eq!(parse_range_spec("-10000-").unwrap(), vec![10000]);
        assert_eq!(parse_range_spec("-100-200-300-").unwrap(), vec![100, 200, 300]);
        assert_eq!(parse_range_spec("100-200").unwrap(), vec![100, 200]);
        assert!(parse_range_spec("--").is_err());
        assert!(parse_range_spec("-200-100-").is_err());
        assert!(parse_range_spec("-10-x-").is_err());
        assert!(ShardingRule::range("t", "id", nodes(&["a", "b"]), vec![1, 2]).is_err());
    }

    #[test]
    fn test_route_select() {
        let router = schema();
        assert_eq!(route(&router, "SELECT * FROM users WHERE id = 11").unwrap(), vec!["node3"]);
        assert_eq!(
            route(&router, "SELECT * FROM users").unwrap(),
            vec!["node2", "node3"]
        );
        assert_eq!(
            route(&router, "SELECT * FROM users WHERE id IN (3, 5, 7)").unwrap(),
            vec!["node3"]
        );
        assert_eq!(
            route(&router, "SELECT * FROM users WHERE id IN (4, 3)").unwrap(),
            vec!["node2", "node3"]
        );
        assert_eq!(
            route(&router, "SELECT * FROM orders WHERE id > 5").unwrap(),
            vec!["node2", "node3"]
        );
        assert_eq!(route(&router, "SELECT * FROM other").unwrap(), vec!["node1"]);
        assert_eq!(route(&router, "SELECT 1").unwrap(), vec!["node1"]);
    }

    #[test]
    fn test_route_insert() {
        let router = schema();
        assert_eq!(
            route(&router, "INSERT INTO users (id, name) VALUES (11, 'a'), (13, 'b')").unwrap(),
            vec!["node3"]
        );
        let err = route(&router, "INSERT INTO users (id) VALUES (1), (2)").unwrap_err();
        assert!(matches!(err, ShardGateError::Routing { .. }));
        assert!(route(&router, "INSERT INTO users (name) VALUES ('a')").is_err());
        assert!(route(&router, "INSERT INTO users SELECT * FROM t").is_err());
        assert_eq!(
            route(&router, "INSERT INTO other (id) VALUES (1), (2)").unwrap(),
            vec!["node1"]
        );
    }

    #[test]
    fn test_update_of_shard_key_rejected() {
        let router = schema();
        assert!(route(&router, "UPDATE users SET id = 5 WHERE id = 4").is_err());
        assert_eq!(
            route(&router, "UPDATE users SET name = 'x' WHERE id = 4").unwrap(),
            vec!["node2"]
        );
    }

    #[test]
    fn test_rule_without_nodes_is_rejected() {
        let mut router = schema();
        let empty = ShardingRule::Hash {
            table: "events".to_string(),
            key: "id".to_string(),
            nodes: Vec::new(),
        };
        assert!(matches!(
            empty.find_node(&KeyValue::Int(1)),
            Err(ShardGateError::Routing { .. })
        ));
        let err = router.add_rule(empty).unwrap_err();
        assert!(err.to_string().contains("no nodes"));
        assert_eq!(router.find_node("events", &KeyValue::Int(1)).unwrap(), "node1");
    }

    #[test]
    fn test_unknown_schema() {
        let router = Router::default();
        assert!(matches!(
            router.schema("nope"),
            Err(ShardGateError::Routing { .. })
        ));
    }
}
