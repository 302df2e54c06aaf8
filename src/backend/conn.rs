/// Client side of the MySQL protocol, used to talk to backend nodes

use crate::error::{ServerError, ShardGateError, ShardGateResult};
use crate::protocol::auth::{
    scramble_for_plugin, scramble_native_password, CACHING_SHA2_PLUGIN, NATIVE_PASSWORD_PLUGIN,
};
use crate::protocol::capability::{
    CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, DEFAULT_CLIENT_CAPABILITY,
};
use crate::protocol::command::{COM_INIT_DB, COM_PING, COM_QUERY, COM_QUIT};
use crate::protocol::packets::{decode_text_row, is_eof_packet, is_err_packet, unexpected_packet};
use crate::protocol::status::{SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_IN_TRANS};
use crate::protocol::{
    header, EofPacket, ErrPacket, Field, Greeting, HandshakeResponse, OkPacket, PacketIo,
    PayloadReader, QueryResult, ResultSet, DEFAULT_CHARSET, MAX_PAYLOAD_LEN,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// caching_sha2_password fast-auth outcomes
const FAST_AUTH_SUCCESS: u8 = 0x03;
const PERFORM_FULL_AUTH: u8 = 0x04;

/// Login used for a backend node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(user: U, password: P) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// One authenticated connection to a backend server
pub struct BackendConn {
    io: PacketIo<TcpStream>,
    addr: String,
    connection_id: u32,
    capabilities: u32,
    status: u16,
    db: Option<String>,
    broken: bool,
}

impl std::fmt::Debug for BackendConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConn")
            .field("addr", &self.addr)
            .field("connection_id", &self.connection_id)
            .field("db", &self.db)
            .field("broken", &self.broken)
            .finish()
    }
}

impl BackendConn {
    /// Dial `addr` and log in; the whole exchange is bounded by `connect_timeout`
    pub async fn connect(
        addr: &str,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> ShardGateResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ShardGateError::timeout(format!("connect to {}", addr)))??;
        stream.set_nodelay(true)?;
        socket2::SockRef::from(&stream).set_keepalive(true)?;

        let mut conn = Self {
            io: PacketIo::new(stream),
            addr: addr.to_string(),
            connection_id: 0,
            capabilities: 0,
            status: 0,
            db: None,
            broken: false,
        };
        timeout(connect_timeout, conn.handshake(credentials))
            .await
            .map_err(|_| ShardGateError::timeout(format!("handshake with {}", addr)))??;

        log::debug!(
            "Connected to backend {} (connection id {})",
            addr,
            conn.connection_id
        );
        Ok(conn)
    }

    async fn handshake(&mut self, credentials: &Credentials) -> ShardGateResult<()> {
        let payload = self.io.read_packet().await?;
        if is_err_packet(&payload) {
            return Err(server_error(&payload));
        }
        let greeting = Greeting::decode(&payload)?;
        if greeting.capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(ShardGateError::protocol(format!(
                "backend {} does not support protocol 4.1",
                self.addr
            )));
        }
        self.connection_id = greeting.connection_id;
        self.capabilities = DEFAULT_CLIENT_CAPABILITY & greeting.capabilities;

        let password = credentials.password.as_bytes();
        let offered = greeting
            .auth_plugin
            .clone()
            .unwrap_or_else(|| NATIVE_PASSWORD_PLUGIN.to_string());
        let (plugin, auth_response) = match scramble_for_plugin(&offered, &greeting.salt, password) {
            Some(response) => (offered, response),
            // answer with native password and let the server switch us
            None => (
                NATIVE_PASSWORD_PLUGIN.to_string(),
                scramble_native_password(&greeting.salt, password),
            ),
        };

        let response = HandshakeResponse {
            capabilities: self.capabilities,
            max_packet_size: MAX_PAYLOAD_LEN as u32,
            charset: DEFAULT_CHARSET,
            user: credentials.user.clone(),
            auth_response,
            database: None,
            auth_plugin: (self.capabilities & CLIENT_PLUGIN_AUTH != 0).then(|| plugin.clone()),
        };
        self.io.write_packet(&response.encode()).await?;
        self.authenticate(plugin, credentials).await
    }

    async fn authenticate(&mut self, mut plugin: String, credentials: &Credentials) -> ShardGateResult<()> {
        loop {
            let payload = self.io.read_packet().await?;
            match payload.first().copied() {
                Some(header::OK) => {
                    self.status = OkPacket::decode(&payload)?.status;
                    return Ok(());
                }
                Some(header::ERR) => return Err(server_error(&payload)),
                Some(header::AUTH_SWITCH) => {
                    let mut reader = PayloadReader::new(&payload[1..]);
                    plugin = String::from_utf8_lossy(reader.read_null_terminated()?).into_owned();
                    let data = reader.read_rest();
                    let salt = data.strip_suffix(&[0]).unwrap_or(data);
                    let response =
                        scramble_for_plugin(&plugin, salt, credentials.password.as_bytes())
                            .ok_or_else(|| {
                                ShardGateError::unsupported(format!(
                                    "backend {} requested auth plugin {}",
                                    self.addr, plugin
                                ))
                            })?;
                    self.io.write_packet(&response).await?;
                }
                Some(header::AUTH_MORE_DATA) if plugin == CACHING_SHA2_PLUGIN => {
                    match payload.get(1).copied() {
                        Some(FAST_AUTH_SUCCESS) => continue,
                        Some(PERFORM_FULL_AUTH) => {
                            return Err(ShardGateError::unsupported(format!(
                                "backend {} requires caching_sha2_password full authentication over TLS",
                                self.addr
                            )))
                        }
                        _ => return Err(unexpected_packet("authenticating", &payload)),
                    }
                }
                _ => return Err(unexpected_packet("authenticating", &payload)),
            }
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn db(&self) -> Option<&str> {
        self.db.as_deref()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn in_transaction(&self) -> bool {
        self.status & SERVER_STATUS_IN_TRANS != 0
    }

    /// A broken connection is out of sync or closed and must not be reused
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Run one statement; only the first result of a multi-result reply is kept
    pub async fn query(&mut self, sql: &str) -> ShardGateResult<QueryResult> {
        self.send_command(COM_QUERY, sql.as_bytes()).await?;
        let first = self.read_result().await?;
        while self.status & SERVER_MORE_RESULTS_EXISTS != 0 {
            self.read_result().await?;
        }
        Ok(first)
    }

    pub async fn ping(&mut self) -> ShardGateResult<()> {
        self.send_command(COM_PING, &[]).await?;
        self.expect_ok("pinging").await
    }

    pub async fn use_db(&mut self, db: &str) -> ShardGateResult<()> {
        if self.db.as_deref() == Some(db) {
            return Ok(());
        }
        self.send_command(COM_INIT_DB, db.as_bytes()).await?;
        self.expect_ok("selecting database").await?;
        self.db = Some(db.to_string());
        Ok(())
    }

    /// Send COM_QUIT and shut the socket down
    pub async fn close(mut self) {
        if !self.broken {
            let _ = self.send_command(COM_QUIT, &[]).await;
        }
        let _ = self.io.shutdown().await;
    }

    async fn send_command(&mut self, command: u8, arg: &[u8]) -> ShardGateResult<()> {
        if self.broken {
            return Err(ShardGateError::backend(format!(
                "connection to {} is broken",
                self.addr
            )));
        }
        self.io.reset_seq();
        let mut payload = BytesMut::with_capacity(1 + arg.len());
        payload.put_u8(command);
        payload.put_slice(arg);
        let result = self.io.write_packet(&payload).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn expect_ok(&mut self, context: &str) -> ShardGateResult<()> {
        let payload = self.read_packet().await?;
        match payload.first().copied() {
            Some(header::OK) => {
                self.status = OkPacket::decode(&payload)?.status;
                Ok(())
            }
            Some(header::ERR) => Err(server_error(&payload)),
            _ => {
                self.broken = true;
                Err(unexpected_packet(context, &payload))
            }
        }
    }

    async fn read_packet(&mut self) -> ShardGateResult<Bytes> {
        let result = self.io.read_packet().await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn read_result(&mut self) -> ShardGateResult<QueryResult> {
        let payload = self.read_packet().await?;
        match payload.first().copied() {
            Some(header::OK) => {
                let ok = OkPacket::decode(&payload)?;
                self.status = ok.status;
                Ok(QueryResult::Ok(ok))
            }
            Some(header::ERR) => Err(server_error(&payload)),
            Some(header::LOCAL_INFILE) => {
                self.broken = true;
                Err(ShardGateError::unsupported("LOAD DATA LOCAL INFILE"))
            }
            Some(_) => self.read_result_set(&payload).await.map(QueryResult::Rows),
            None => {
                self.broken = true;
                Err(unexpected_packet("reading a result", &payload))
            }
        }
    }

    async fn read_result_set(&mut self, head: &[u8]) -> ShardGateResult<ResultSet> {
        let count = PayloadReader::new(head).read_lenenc_u64()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet().await?;
            fields.push(Field::decode(&payload)?);
        }
        let payload = self.read_packet().await?;
        if !is_eof_packet(&payload) {
            self.broken = true;
            return Err(unexpected_packet("reading column definitions", &payload));
        }

        let mut result = ResultSet::new(fields);
        loop {
            let payload = self.read_packet().await?;
            if is_eof_packet(&payload) {
                let eof = EofPacket::decode(&payload)?;
                self.status = eof.status;
                result.status = eof.status;
                return Ok(result);
            }
            if is_err_packet(&payload) {
                return Err(server_error(&payload));
            }
            result.rows.push(decode_text_row(&payload, count)?);
        }
    }
}

fn server_error(payload: &[u8]) -> ShardGateError {
    match ErrPacket::decode(payload) {
        Ok(packet) => ServerError::from(packet).into(),
        Err(e) => e,
    }
}
