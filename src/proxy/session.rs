/// Protocol session: handshake, authentication and the command loop of one
/// client connection

use super::{ConnContext, Response, SessionHandler};
use crate::backend::Credentials;
use crate::error::{ShardGateError, ShardGateResult};
use crate::protocol::auth::{generate_salt, verify_native_password, SCRAMBLE_LEN};
use crate::protocol::capability::{CLIENT_CONNECT_WITH_DB, DEFAULT_SERVER_CAPABILITY};
use crate::protocol::packets::{encode_binary_row, encode_prepare_ok, encode_text_row};
use crate::protocol::{
    EofPacket, Field, Greeting, HandshakeResponse, OkPacket, PacketIo, PayloadWriter, ResultSet,
};
use bytes::BytesMut;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub struct Session<S> {
    io: PacketIo<S>,
    ctx: ConnContext,
    salt: [u8; SCRAMBLE_LEN],
    capabilities: u32,
    user: Option<String>,
    auth: Arc<Credentials>,
    handler: SessionHandler,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, ctx: ConnContext, handler: SessionHandler, auth: Arc<Credentials>) -> Self {
        Self {
            io: PacketIo::new(stream),
            ctx,
            salt: generate_salt(),
            capabilities: DEFAULT_SERVER_CAPABILITY,
            user: None,
            auth,
            handler,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.ctx.connection_id
    }

    /// Serve the connection until the client quits or a fatal error occurs.
    /// Backend connections held by the session are released either way.
    pub async fn run(mut self) -> ShardGateResult<()> {
        let result = match self.handshake().await {
            Ok(()) => self.command_loop().await,
            Err(e) => Err(e),
        };
        self.handler.close().await;
        let _ = self.io.shutdown().await;
        result
    }

    async fn handshake(&mut self) -> ShardGateResult<()> {
        let greeting = Greeting::new(self.ctx.connection_id, &self.salt);
        self.io.write_packet(&greeting.encode()).await?;

        let payload = self.io.read_packet().await?;
        let response = match HandshakeResponse::decode(&payload) {
            Ok(response) => response,
            Err(e) => {
                self.write_error(&e).await?;
                return Err(e);
            }
        };
        self.capabilities = response.capabilities & DEFAULT_SERVER_CAPABILITY;

        let authenticated = response.user == self.auth.user
            && verify_native_password(
                &self.salt,
                self.auth.password.as_bytes(),
                &response.auth_response,
            );
        if !authenticated {
            let e = ShardGateError::AccessDenied {
                user: response.user.clone(),
            };
            log::warn!(
                "conn {}: access denied for user '{}' from {}",
                self.ctx.connection_id,
                response.user,
                self.ctx.peer_addr
            );
            self.write_error(&e).await?;
            return Err(e);
        }

        if response.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(db) = &response.database {
                if let Err(e) = self.handler.use_database(db) {
                    self.write_error(&e).await?;
                    return Err(e);
                }
            }
        }

        self.user = Some(response.user);
        let ok = OkPacket::with_status(self.handler.status());
        self.io.write_packet(&ok.encode(self.capabilities)).await?;
        log::debug!(
            "conn {}: user '{}' authenticated",
            self.ctx.connection_id,
            self.user.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    async fn command_loop(&mut self) -> ShardGateResult<()> {
        loop {
            self.io.reset_seq();
            let payload = match self.io.read_packet().await {
                Ok(payload) => payload,
                Err(ShardGateError::Network(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(())
                }
                Err(e) => return Err(e),
            };

            match self.handler.handle(&payload).await {
                Ok(Response::Close) => return Ok(()),
                Ok(response) => self.write_response(response).await?,
                Err(e @ ShardGateError::Network(_)) => return Err(e),
                Err(e) if e.is_fatal() => {
                    let _ = self.write_error(&e).await;
                    return Err(e);
                }
                Err(e) => {
                    log::log!(
                        e.severity().log_level(),
                        "conn {}: statement failed: {}",
                        self.ctx.connection_id,
                        e
                    );
                    self.write_error(&e).await?;
                }
            }
        }
    }

    async fn write_error(&mut self, e: &ShardGateError) -> ShardGateResult<()> {
        let packet = e.to_err_packet();
        self.io.write_packet(&packet.encode(self.capabilities)).await
    }

    async fn write_response(&mut self, response: Response) -> ShardGateResult<()> {
        match response {
            Response::Ok(ok) => self.io.queue_packet(&ok.encode(self.capabilities)),
            Response::Rows(rows) => self.queue_result_set(&rows, false),
            Response::BinaryRows(rows) => self.queue_result_set(&rows, true),
            Response::Eof(status) => {
                self.io.queue_packet(&EofPacket::new(status).encode(self.capabilities))
            }
            Response::Prepared {
                statement_id,
                params,
            } => {
                self.io.queue_packet(&encode_prepare_ok(statement_id, 0, params));
                if params > 0 {
                    for _ in 0..params {
                        self.io.queue_packet(&Field::text("?").encode());
                    }
                    let eof = EofPacket::new(self.handler.status());
                    self.io.queue_packet(&eof.encode(self.capabilities));
                }
            }
            Response::Nothing | Response::Close => return Ok(()),
        }
        self.io.flush().await
    }

    fn queue_result_set(&mut self, rows: &ResultSet, binary: bool) {
        let mut count = BytesMut::with_capacity(9);
        count.put_lenenc_int(rows.fields.len() as u64);
        self.io.queue_packet(&count);

        for field in &rows.fields {
            self.io.queue_packet(&field.encode());
        }
        let eof = EofPacket::new(rows.status);
        self.io.queue_packet(&eof.encode(self.capabilities));

        for row in &rows.rows {
            let packet = if binary {
                encode_binary_row(row)
            } else {
                encode_text_row(row)
            };
            self.io.queue_packet(&packet);
        }
        self.io.queue_packet(&eof.encode(self.capabilities));
    }
}
