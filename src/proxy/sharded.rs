/// Sharded query handler
///
/// Statements are analyzed, routed to one or more nodes of the current
/// schema, executed concurrently and merged. Transactions hold one master
/// connection per touched node until COMMIT or ROLLBACK; there is no
/// cross-node atomicity.

use super::stmt::{string_fields, StatementTable};
use super::{ConnContext, Response};
use crate::backend::{NodePool, PooledConn};
use crate::error::{ServerError, ShardGateError, ShardGateResult};
use crate::merge::merge_results;
use crate::protocol::codes::{ER_INVALID_CHARACTER_STRING, ER_UNKNOWN_COM_ERROR};
use crate::protocol::command::*;
use crate::protocol::status::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use crate::protocol::{OkPacket, QueryResult, ResultSet};
use crate::router::Router;
use crate::sql::{analyze, Statement, StatementKind};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

/// State shared by every sharded session
#[derive(Debug)]
pub struct ShardedHandler {
    router: Arc<Router>,
    nodes: Arc<NodePool>,
}

impl ShardedHandler {
    pub fn new(router: Arc<Router>, nodes: Arc<NodePool>) -> Self {
        Self { router, nodes }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn nodes(&self) -> &NodePool {
        &self.nodes
    }
}

pub struct ShardedSession {
    shared: Arc<ShardedHandler>,
    ctx: ConnContext,
    db: Option<String>,
    in_transaction: bool,
    /// Master connections held by the open transaction, by node name
    tx_conns: BTreeMap<String, PooledConn>,
    statements: StatementTable,
}

impl ShardedSession {
    pub fn new(shared: Arc<ShardedHandler>, ctx: ConnContext) -> Self {
        Self {
            shared,
            ctx,
            db: None,
            in_transaction: false,
            tx_conns: BTreeMap::new(),
            statements: StatementTable::new(),
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.db.as_deref()
    }

    pub fn use_database(&mut self, db: &str) -> ShardGateResult<()> {
        let db = db.trim();
        if !self.shared.router.has_schema(db) {
            return Err(ShardGateError::UnknownDatabase { db: db.to_string() });
        }
        if self.in_transaction && self.db.as_deref() != Some(db) {
            return Err(ShardGateError::unsupported(
                "changing the database inside a transaction",
            ));
        }
        self.db = Some(db.to_string());
        Ok(())
    }

    pub fn status(&self) -> u16 {
        if self.in_transaction {
            SERVER_STATUS_AUTOCOMMIT | SERVER_STATUS_IN_TRANS
        } else {
            SERVER_STATUS_AUTOCOMMIT
        }
    }

    fn ok(&self) -> OkPacket {
        OkPacket::with_status(self.status())
    }

    pub async fn handle(&mut self, payload: &[u8]) -> ShardGateResult<Response> {
        let (&command, body) = payload
            .split_first()
            .ok_or_else(|| ShardGateError::protocol("empty command packet"))?;

        match command {
            COM_QUIT => Ok(Response::Close),
            COM_PING => Ok(Response::Ok(self.ok())),
            COM_INIT_DB => {
                self.use_database(utf8_text(body)?)?;
                Ok(Response::Ok(self.ok()))
            }
            COM_QUERY => {
                let result = self.query(utf8_text(body)?).await?;
                Ok(self.text_response(result))
            }
            COM_FIELD_LIST => Ok(Response::Eof(self.status())),
            COM_STMT_PREPARE => {
                let prepared = self.statements.prepare(utf8_text(body)?)?;
                Ok(Response::Prepared {
                    statement_id: prepared.id,
                    params: prepared.params,
                })
            }
            COM_STMT_EXECUTE => {
                let sql = self.statements.bind(body)?;
                let result = self.query(&sql).await?;
                Ok(self.binary_response(result))
            }
            COM_STMT_SEND_LONG_DATA => {
                self.statements.send_long_data(body);
                Ok(Response::Nothing)
            }
            COM_STMT_CLOSE => {
                self.statements.close(body)?;
                Ok(Response::Nothing)
            }
            COM_STMT_RESET => {
                self.statements.reset(body)?;
                Ok(Response::Ok(self.ok()))
            }
            other => Err(ServerError::new(
                ER_UNKNOWN_COM_ERROR,
                "08S01",
                format!("Unknown command 0x{:02x}", other),
            )
            .into()),
        }
    }

    fn text_response(&self, result: QueryResult) -> Response {
        match result {
            QueryResult::Ok(mut ok) => {
                ok.status = self.status();
                Response::Ok(ok)
            }
            QueryResult::Rows(mut rows) => {
                rows.status = self.status();
                Response::Rows(rows)
            }
        }
    }

    fn binary_response(&self, result: QueryResult) -> Response {
        match self.text_response(result) {
            Response::Rows(mut rows) => {
                rows.fields = string_fields(&rows.fields);
                Response::BinaryRows(rows)
            }
            other => other,
        }
    }

    /// Run one statement of the text protocol
    pub async fn query(&mut self, sql: &str) -> ShardGateResult<QueryResult> {
        let statement = analyze(sql)?;
        log::debug!(
            "conn {}: {:?} statement on table {:?}",
            self.ctx.connection_id,
            statement.kind,
            statement.table
        );

        match statement.kind {
            StatementKind::Begin => {
                if self.in_transaction {
                    self.finish_transaction("COMMIT").await?;
                }
                self.in_transaction = true;
                Ok(QueryResult::Ok(self.ok()))
            }
            StatementKind::Commit => self.finish_transaction("COMMIT").await,
            StatementKind::Rollback => self.finish_transaction("ROLLBACK").await,
            StatementKind::Use => {
                let db = statement.database.as_deref().unwrap_or_default();
                self.use_database(db)?;
                Ok(QueryResult::Ok(self.ok()))
            }
            StatementKind::Set => Ok(QueryResult::Ok(self.ok())),
            StatementKind::ShowDatabases => Ok(QueryResult::Rows(ResultSet::from_strings(
                "Database",
                &self.shared.router.schema_names(),
            ))),
            _ => self.dispatch(&statement).await,
        }
    }

    async fn dispatch(&mut self, statement: &Statement) -> ShardGateResult<QueryResult> {
        let db = self.db.clone().ok_or(ShardGateError::NoDatabaseSelected)?;
        let router = Arc::clone(&self.shared.router);
        let nodes = router.schema(&db)?.route(statement)?;

        let sql = if nodes.len() > 1 {
            statement.shard_sql()?
        } else {
            statement.sql.clone()
        };
        let read = statement.kind.is_read();

        let mut conns = Vec::with_capacity(nodes.len());
        for name in &nodes {
            match self.checkout(name, read).await {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    for (name, conn) in nodes.iter().zip(conns) {
                        self.checkin(name, conn);
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            conn = self.ctx.connection_id,
            nodes = ?nodes,
            "Executing on {} node(s)",
            nodes.len()
        );
        let outcomes = join_all(nodes.iter().zip(conns).map(|(name, mut conn)| {
            let db = db.as_str();
            let sql = sql.as_str();
            async move {
                let result = run_on(&mut conn, db, sql).await.map_err(|e| e.on_backend(name));
                (conn, result)
            }
        }))
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failure = None;
        for (name, (conn, result)) in nodes.iter().zip(outcomes) {
            self.checkin(name, conn);
            match result {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!(conn = self.ctx.connection_id, node = %name, "Statement failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        if results.len() == 1 {
            if let Some(result) = results.pop() {
                return Ok(result);
            }
        }
        merge_results(results, statement)
    }

    /// Connection for `node`: the transaction's held master connection, or
    /// a pooled one chosen by statement kind
    async fn checkout(&mut self, node: &str, read: bool) -> ShardGateResult<PooledConn> {
        if self.in_transaction {
            if let Some(conn) = self.tx_conns.remove(node) {
                return Ok(conn);
            }
            let backend = self.shared.nodes.node(node)?;
            let mut conn = backend.get_master_conn().await?;
            if let Err(e) = conn.query("BEGIN").await {
                conn.mark_broken();
                return Err(e.on_backend(node));
            }
            return Ok(conn);
        }

        let backend = self.shared.nodes.node(node)?;
        if read {
            backend.get_select_conn().await
        } else {
            backend.get_master_conn().await
        }
    }

    fn checkin(&mut self, node: &str, conn: PooledConn) {
        if self.in_transaction && !conn.is_broken() {
            self.tx_conns.insert(node.to_string(), conn);
        }
    }

    /// Send COMMIT or ROLLBACK to every held connection in node-name order
    async fn finish_transaction(&mut self, verb: &str) -> ShardGateResult<QueryResult> {
        let conns = std::mem::take(&mut self.tx_conns);
        self.in_transaction = false;

        let mut failure = None;
        for (node, mut conn) in conns {
            if let Err(e) = conn.query(verb).await {
                log::warn!(
                    "conn {}: {} on node {} failed: {}",
                    self.ctx.connection_id,
                    verb,
                    node,
                    e
                );
                conn.mark_broken();
                failure.get_or_insert(e.on_backend(&node));
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(QueryResult::Ok(self.ok())),
        }
    }

    pub async fn close(&mut self) {
        if !self.tx_conns.is_empty() {
            log::info!(
                "conn {}: rolling back open transaction on {} node(s)",
                self.ctx.connection_id,
                self.tx_conns.len()
            );
        }
        let _ = self.finish_transaction("ROLLBACK").await;
        self.statements.clear();
    }
}

async fn run_on(conn: &mut PooledConn, db: &str, sql: &str) -> ShardGateResult<QueryResult> {
    conn.use_db(db).await?;
    conn.query(sql).await
}

/// Statement text and schema names must be valid UTF-8; binary values
/// belong in hex literals or statement parameters
fn utf8_text(body: &[u8]) -> ShardGateResult<&str> {
    std::str::from_utf8(body).map_err(|e| {
        ServerError::new(
            ER_INVALID_CHARACTER_STRING,
            "HY000",
            format!("Invalid utf8 character string at byte {}", e.valid_up_to()),
        )
        .into()
    })
}
