/// TCP listener: accepts clients, enforces the connection limit and runs
/// every session behind its own fault boundary

use super::{ConnContext, Handler, Session};
use crate::backend::Credentials;
use crate::error::{ShardGateError, ShardGateResult};
use crate::protocol::capability::CLIENT_PROTOCOL_41;
use crate::protocol::codes::ER_CON_COUNT_ERROR;
use crate::protocol::{ErrPacket, PacketIo};
use crate::utils::next_connection_id;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct Listener {
    listener: TcpListener,
    handler: Handler,
    auth: Arc<Credentials>,
    limit: Arc<Semaphore>,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        handler: Handler,
        auth: Credentials,
        max_connections: usize,
    ) -> ShardGateResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            handler,
            auth: Arc::new(auth),
            limit: Arc::new(Semaphore::new(max_connections)),
        })
    }

    pub fn local_addr(&self) -> ShardGateResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> ShardGateResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => {
                        log::error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match Arc::clone(&self.limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log::warn!("Too many connections, rejecting {}", peer);
                tokio::spawn(reject(stream));
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let ctx = ConnContext {
            connection_id: next_connection_id(),
            peer_addr: peer,
        };
        log::info!("conn {}: accepted from {}", ctx.connection_id, peer);
        let handler = self.handler.new_session(ctx.clone());
        let session = Session::new(stream, ctx, handler, Arc::clone(&self.auth));
        tokio::spawn(supervise(session, permit));
    }
}

/// Run a session in its own task so a panic only drops that connection
async fn supervise(session: Session<TcpStream>, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    let id = session.connection_id();
    match tokio::spawn(session.run()).await {
        Ok(Ok(())) => log::info!("conn {}: closed", id),
        Ok(Err(ShardGateError::Network(e))) => log::info!("conn {}: closed: {}", id, e),
        Ok(Err(e)) => log::warn!("conn {}: closed after error: {}", id, e),
        Err(e) if e.is_panic() => log::error!("conn {}: session panicked, connection dropped", id),
        Err(e) => log::error!("conn {}: session task failed: {}", id, e),
    }
}

async fn reject(stream: TcpStream) {
    let mut io = PacketIo::new(stream);
    let err = ErrPacket::new(ER_CON_COUNT_ERROR, "08004", "Too many connections");
    let _ = io.write_packet(&err.encode(CLIENT_PROTOCOL_41)).await;
    let _ = io.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NodePool;
    use crate::config::Config;
    use crate::protocol::packets::is_err_packet;
    use crate::router::Router;

    async fn listener(max_connections: usize) -> Listener {
        let config = Config::default();
        let router = Arc::new(Router::from_config(&config).unwrap());
        let nodes = Arc::new(NodePool::from_config(&config));
        let handler = Handler::build(&config, router, nodes).unwrap();
        Listener::bind("127.0.0.1:0", handler, Credentials::new("root", ""), max_connections)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_excess_connections_are_rejected() {
        let listener = listener(1).await;
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.serve(std::future::pending()));

        let mut first = PacketIo::new(TcpStream::connect(addr).await.unwrap());
        let greeting = first.read_packet().await.unwrap();
        assert_eq!(greeting[0], 10);

        let mut second = PacketIo::new(TcpStream::connect(addr).await.unwrap());
        let reply = second.read_packet().await.unwrap();
        assert!(is_err_packet(&reply));
        assert_eq!(ErrPacket::decode(&reply).unwrap().code, 1040);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let listener = listener(4).await;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let serve = tokio::spawn(listener.serve(async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        assert!(serve.await.unwrap().is_ok());
    }
}
