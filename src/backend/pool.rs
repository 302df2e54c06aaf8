/// Bounded idle-connection pool for one backend address

use super::conn::{BackendConn, Credentials};
use crate::error::{ShardGateError, ShardGateResult};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct PoolInner {
    addr: String,
    credentials: Credentials,
    max_idle: usize,
    connect_timeout: Duration,
    idle: Mutex<VecDeque<BackendConn>>,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<BackendConn>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Lazily connecting pool; cloning shares the same idle list
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("addr", &self.inner.addr)
            .field("max_idle", &self.inner.max_idle)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl ConnPool {
    pub fn new(addr: &str, credentials: Credentials, max_idle: usize, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                addr: addr.to_string(),
                credentials,
                max_idle,
                connect_timeout,
                idle: Mutex::new(VecDeque::with_capacity(max_idle)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    /// Reuse an idle connection or dial a new one
    pub async fn get_conn(&self) -> ShardGateResult<PooledConn> {
        if self.is_closed() {
            return Err(ShardGateError::backend(format!(
                "pool for {} is closed",
                self.inner.addr
            )));
        }

        let reused = self.inner.idle().pop_front();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                BackendConn::connect(
                    &self.inner.addr,
                    &self.inner.credentials,
                    self.inner.connect_timeout,
                )
                .await?
            }
        };

        Ok(PooledConn {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        })
    }

    pub async fn ping(&self) -> ShardGateResult<()> {
        let mut conn = self.get_conn().await?;
        conn.ping().await
    }

    /// Refuse new checkouts and drop the idle connections
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<BackendConn> = self.inner.idle().drain(..).collect();
        log::debug!(
            "Closed pool for {} ({} idle connections dropped)",
            self.inner.addr,
            drained.len()
        );
    }
}

/// Connection checked out of a `ConnPool`, returned to it on drop
pub struct PooledConn {
    conn: Option<BackendConn>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("addr", &self.pool.addr)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl Deref for PooledConn {
    type Target = BackendConn;

    fn deref(&self) -> &BackendConn {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut BackendConn {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        if conn.is_broken() || conn.in_transaction() || self.pool.is_closed() {
            return;
        }
        let mut idle = self.pool.idle();
        if idle.len() < self.pool.max_idle {
            idle.push_back(conn);
        }
    }
}
