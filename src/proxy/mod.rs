/// Client-facing side of the proxy: listener, protocol session and the
/// compiled-in command handlers

pub mod listener;
pub mod session;
pub mod sharded;
pub mod stmt;

pub use listener::Listener;
pub use session::Session;
pub use sharded::{ShardedHandler, ShardedSession};

use crate::backend::NodePool;
use crate::config::{BackendType, Config};
use crate::error::{ShardGateError, ShardGateResult};
use crate::protocol::{OkPacket, ResultSet};
use crate::router::Router;
use std::net::SocketAddr;
use std::sync::Arc;

/// Facts about an accepted connection, handed to the handler factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnContext {
    pub connection_id: u32,
    pub peer_addr: SocketAddr,
}

/// What a handler asks the session to send back for one command
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(OkPacket),
    /// Text protocol result set
    Rows(ResultSet),
    /// Binary protocol result set (prepared statement execution)
    BinaryRows(ResultSet),
    /// Empty column list, answers COM_FIELD_LIST
    Eof(u16),
    /// COM_STMT_PREPARE reply
    Prepared { statement_id: u32, params: u16 },
    /// Commands that take no reply
    Nothing,
    /// COM_QUIT
    Close,
}

/// Handler kinds compiled into the proxy, one per backend type
#[derive(Debug, Clone)]
pub enum Handler {
    Sharded(Arc<ShardedHandler>),
}

impl Handler {
    /// Pick the handler for the configured backend type
    pub fn build(config: &Config, router: Arc<Router>, nodes: Arc<NodePool>) -> ShardGateResult<Self> {
        let backend_type = config
            .schemas
            .first()
            .map(|schema| schema.backend_type)
            .unwrap_or_default();
        if let Some(schema) = config
            .schemas
            .iter()
            .find(|schema| schema.backend_type != backend_type)
        {
            return Err(ShardGateError::internal(format!(
                "schema {} uses backend type {:?}, expected {:?}",
                schema.db, schema.backend_type, backend_type
            )));
        }

        match backend_type {
            BackendType::Mysql => Ok(Handler::Sharded(Arc::new(ShardedHandler::new(router, nodes)))),
        }
    }

    /// Per-connection handler; called for every accepted connection
    pub fn new_session(&self, ctx: ConnContext) -> SessionHandler {
        match self {
            Handler::Sharded(handler) => {
                SessionHandler::Sharded(ShardedSession::new(Arc::clone(handler), ctx))
            }
        }
    }
}

/// Per-connection state of a handler
pub enum SessionHandler {
    Sharded(ShardedSession),
}

impl SessionHandler {
    /// Bind the initial database named in the handshake
    pub fn use_database(&mut self, db: &str) -> ShardGateResult<()> {
        match self {
            SessionHandler::Sharded(session) => session.use_database(db),
        }
    }

    /// Status flags to report in OK and EOF packets
    pub fn status(&self) -> u16 {
        match self {
            SessionHandler::Sharded(session) => session.status(),
        }
    }

    /// Handle one command packet (command byte and arguments)
    pub async fn handle(&mut self, payload: &[u8]) -> ShardGateResult<Response> {
        match self {
            SessionHandler::Sharded(session) => session.handle(payload).await,
        }
    }

    /// Release backend resources when the client goes away
    pub async fn close(&mut self) {
        match self {
            SessionHandler::Sharded(session) => session.close().await,
        }
    }
}
