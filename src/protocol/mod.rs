/// MySQL client/server wire protocol
///
/// Framing, length-encoded primitives and the packet types the proxy speaks
/// on both sides: as a server towards clients and as a client towards the
/// backend nodes.
pub mod auth;
pub mod codec;
pub mod handshake;
pub mod packet;
pub mod packets;

pub use codec::{PayloadReader, PayloadWriter};
pub use handshake::{Greeting, HandshakeResponse};
pub use packet::PacketIo;
pub use packets::{
    ColumnType, EofPacket, ErrPacket, Field, OkPacket, QueryResult, ResultSet, Row,
};

/// Largest payload a single packet can carry
pub const MAX_PAYLOAD_LEN: usize = 0x00ff_ffff;

/// Protocol version byte of the initial handshake packet
pub const PROTOCOL_VERSION: u8 = 10;

/// Version string announced in the server greeting
pub const SERVER_VERSION: &str = "5.7.0-shardgate";

/// utf8_general_ci
pub const DEFAULT_CHARSET: u8 = 33;

/// Capability flags
pub mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_NO_SCHEMA: u32 = 0x0000_0010;
    pub const CLIENT_COMPRESS: u32 = 0x0000_0020;
    pub const CLIENT_ODBC: u32 = 0x0000_0040;
    pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
    pub const CLIENT_IGNORE_SPACE: u32 = 0x0000_0100;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_INTERACTIVE: u32 = 0x0000_0400;
    pub const CLIENT_SSL: u32 = 0x0000_0800;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 0x0000_1000;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_RESERVED: u32 = 0x0000_4000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
    pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

    /// Capabilities the proxy announces to its clients
    pub const DEFAULT_SERVER_CAPABILITY: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION;

    /// Capabilities the proxy requests when it logs into a backend
    pub const DEFAULT_CLIENT_CAPABILITY: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
}

/// Command bytes
pub mod command {
    pub const COM_SLEEP: u8 = 0x00;
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_FIELD_LIST: u8 = 0x04;
    pub const COM_PING: u8 = 0x0e;
    pub const COM_STMT_PREPARE: u8 = 0x16;
    pub const COM_STMT_EXECUTE: u8 = 0x17;
    pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
    pub const COM_STMT_CLOSE: u8 = 0x19;
    pub const COM_STMT_RESET: u8 = 0x1a;
}

/// Server error codes used by the proxy
pub mod codes {
    pub const ER_CON_COUNT_ERROR: u16 = 1040;
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_NO_DB_ERROR: u16 = 1046;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const ER_BAD_DB_ERROR: u16 = 1049;
    pub const ER_SYNTAX_ERROR: u16 = 1064;
    pub const ER_EMPTY_QUERY: u16 = 1065;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
    pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
    pub const ER_INVALID_CHARACTER_STRING: u16 = 1300;
    pub const ER_MALFORMED_PACKET: u16 = 1835;
}

/// Header bytes that open response packets
pub mod header {
    pub const OK: u8 = 0x00;
    pub const LOCAL_INFILE: u8 = 0xfb;
    pub const EOF: u8 = 0xfe;
    pub const ERR: u8 = 0xff;
    pub const AUTH_MORE_DATA: u8 = 0x01;
    pub const AUTH_SWITCH: u8 = 0xfe;
}
