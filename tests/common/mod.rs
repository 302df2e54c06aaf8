//! In-process fake MySQL backends and proxy setup shared by the integration tests

#![allow(dead_code)]

use shardgate::backend::{BackendConn, Credentials};
use shardgate::config::{
    Config, NodeConfig, RuleType, RulesConfig, SchemaConfig, ShardConfig,
};
use shardgate::protocol::auth::{generate_salt, verify_native_password};
use shardgate::protocol::capability::DEFAULT_SERVER_CAPABILITY;
use shardgate::protocol::command::{COM_INIT_DB, COM_PING, COM_QUERY, COM_QUIT};
use shardgate::protocol::packets::encode_text_row;
use shardgate::protocol::{
    ColumnType, EofPacket, ErrPacket, Field, Greeting, HandshakeResponse, OkPacket, PacketIo,
    PayloadWriter,
};
use shardgate::ShardGate;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const SCHEMA: &str = "shardeddb";

/// A backend answering every SELECT with a fixed `(id, name)` table and
/// every other statement with an OK packet affecting one row
pub struct FakeBackend {
    pub name: String,
    pub addr: String,
    queries: Arc<Mutex<Vec<String>>>,
    stopped: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start(name: &str, ids: &[i64]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));

        let rows: Arc<Vec<(i64, String)>> =
            Arc::new(ids.iter().map(|id| (*id, name.to_string())).collect());
        let accept_task = {
            let queries = Arc::clone(&queries);
            let stopped = Arc::clone(&stopped);
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(_) => return,
                    };
                    tokio::spawn(serve_connection(
                        stream,
                        Arc::clone(&rows),
                        Arc::clone(&queries),
                        Arc::clone(&stopped),
                    ));
                }
            })
        };

        Self {
            name: name.to_string(),
            addr,
            queries,
            stopped,
            accept_task,
        }
    }

    /// Every COM_QUERY statement received so far, in arrival order
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.queries.lock().unwrap().clear();
    }

    /// Refuse new connections and drop existing ones on their next command
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.accept_task.abort();
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(
    stream: TcpStream,
    rows: Arc<Vec<(i64, String)>>,
    queries: Arc<Mutex<Vec<String>>>,
    stopped: Arc<AtomicBool>,
) {
    let caps = DEFAULT_SERVER_CAPABILITY;
    let mut io = PacketIo::new(stream);
    let salt = generate_salt();
    if io.write_packet(&Greeting::new(1, &salt).encode()).await.is_err() {
        return;
    }
    let login = match io.read_packet().await {
        Ok(payload) => HandshakeResponse::decode(&payload).unwrap(),
        Err(_) => return,
    };
    if !verify_native_password(&salt, b"", &login.auth_response) {
        let err = ErrPacket::new(1045, "28000", "Access denied");
        let _ = io.write_packet(&err.encode(caps)).await;
        return;
    }
    if io.write_packet(&OkPacket::default().encode(caps)).await.is_err() {
        return;
    }

    loop {
        io.reset_seq();
        let command = match io.read_packet().await {
            Ok(command) => command,
            Err(_) => return,
        };
        if stopped.load(Ordering::SeqCst) {
            return;
        }

        match command[0] {
            COM_QUIT => return,
            COM_PING | COM_INIT_DB => {
                io.queue_packet(&OkPacket::default().encode(caps));
            }
            COM_QUERY => {
                let sql = String::from_utf8_lossy(&command[1..]).into_owned();
                queries.lock().unwrap().push(sql.clone());
                if sql.to_uppercase().starts_with("SELECT") {
                    queue_rows(&mut io, &rows, caps);
                } else {
                    let ok = OkPacket {
                        affected_rows: 1,
                        ..Default::default()
                    };
                    io.queue_packet(&ok.encode(caps));
                }
            }
            _ => {
                let err = ErrPacket::new(1047, "08S01", "Unknown command");
                io.queue_packet(&err.encode(caps));
            }
        }
        if io.flush().await.is_err() {
            return;
        }
    }
}

fn queue_rows(io: &mut PacketIo<TcpStream>, rows: &[(i64, String)], caps: u32) {
    let mut id = Field::text("id");
    id.column_type = ColumnType::LongLong as u8;
    let fields = [id, Field::text("name")];

    let mut count = BytesMut::new();
    count.put_lenenc_int(fields.len() as u64);
    io.queue_packet(&count);
    for field in &fields {
        io.queue_packet(&field.encode());
    }
    io.queue_packet(&EofPacket::new(0).encode(caps));
    for (id, name) in rows {
        let row = vec![
            Some(Bytes::from(id.to_string())),
            Some(Bytes::from(name.clone())),
        ];
        io.queue_packet(&encode_text_row(&row));
    }
    io.queue_packet(&EofPacket::new(0).encode(caps));
}

fn node(name: &str, addr: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        master: addr.to_string(),
        slave: None,
        idle_conns: 4,
        rw_split: false,
        down_after_noalive: 1,
        user: "root".to_string(),
        password: String::new(),
        backend_type: Default::default(),
    }
}

/// Schema `shardeddb` over node1..node3: `users` hashed and `orders` ranged
/// on `id` across node2 and node3, everything else on node1
pub fn sharded_config(backends: &[&FakeBackend]) -> Config {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.password = "secret".to_string();
    config.server.connection_timeout_sec = 2;
    config.health.interval_sec = 2;
    config.health.timeout_sec = 1;
    config.nodes = backends.iter().map(|b| node(&b.name, &b.addr)).collect();

    let shard = |table: &str, rule_type: RuleType, range: Option<&str>| ShardConfig {
        table: table.to_string(),
        key: "id".to_string(),
        rule_type,
        nodes: vec!["node2".to_string(), "node3".to_string()],
        range: range.map(str::to_string),
    };
    config.schemas = vec![SchemaConfig {
        db: SCHEMA.to_string(),
        backend_type: Default::default(),
        nodes: backends.iter().map(|b| b.name.clone()).collect(),
        rules: RulesConfig {
            default: "node1".to_string(),
            shard: vec![
                shard("users", RuleType::Hash, None),
                shard("orders", RuleType::Range, Some("-10000-")),
            ],
        },
    }];
    config
}

/// Start a proxy serving `config` on an ephemeral port
pub async fn start_proxy(config: Config) -> (Arc<ShardGate>, String) {
    let gate = Arc::new(ShardGate::new(config).unwrap());
    let listener = gate.bind().await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let serving = Arc::clone(&gate);
    tokio::spawn(async move {
        let _ = serving.serve(listener, std::future::pending()).await;
    });
    (gate, addr)
}

/// Log into the proxy as a regular MySQL client
pub async fn connect_client(addr: &str, password: &str) -> shardgate::error::ShardGateResult<BackendConn> {
    BackendConn::connect(addr, &Credentials::new("root", password), Duration::from_secs(2)).await
}
