/// Initial handshake (protocol version 10) and the 4.1 handshake response

use super::auth::{NATIVE_PASSWORD_PLUGIN, SCRAMBLE_LEN};
use super::capability::*;
use super::codec::{PayloadReader, PayloadWriter};
use super::status::SERVER_STATUS_AUTOCOMMIT;
use super::{DEFAULT_CHARSET, PROTOCOL_VERSION, SERVER_VERSION};
use crate::error::{ShardGateError, ShardGateResult};
use bytes::{BufMut, BytesMut};

/// Server greeting, the first packet on every connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub salt: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: Option<String>,
}

impl Greeting {
    /// Greeting the proxy sends to a newly accepted client
    pub fn new(connection_id: u32, salt: &[u8]) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_version: SERVER_VERSION.to_string(),
            connection_id,
            salt: salt.to_vec(),
            capabilities: DEFAULT_SERVER_CAPABILITY,
            charset: DEFAULT_CHARSET,
            status: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: None,
        }
    }

    /// Layout: version, server version, connection id, first 8 salt bytes,
    /// filler, capability low word, charset, status, capability high word,
    /// auth data length, 10 reserved bytes, remaining 12 salt bytes plus NUL.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128);
        let (head, tail) = self.salt.split_at(self.salt.len().min(8));

        buf.put_u8(self.protocol_version);
        buf.put_null_terminated(self.server_version.as_bytes());
        buf.put_u32_le(self.connection_id);
        buf.put_slice(head);
        buf.put_u8(0);
        buf.put_u16_le(self.capabilities as u16);
        buf.put_u8(self.charset);
        buf.put_u16_le(self.status);
        buf.put_u16_le((self.capabilities >> 16) as u16);
        buf.put_u8((self.salt.len() + 1) as u8);
        buf.put_bytes(0, 10);
        buf.put_null_terminated(tail);
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            let plugin = self.auth_plugin.as_deref().unwrap_or(NATIVE_PASSWORD_PLUGIN);
            buf.put_null_terminated(plugin.as_bytes());
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> ShardGateResult<Self> {
        let mut reader = PayloadReader::new(payload);

        let protocol_version = reader.read_u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(ShardGateError::protocol(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }
        let server_version = String::from_utf8_lossy(reader.read_null_terminated()?).into_owned();
        let connection_id = reader.read_u32_le()?;
        let mut salt = reader.read_bytes(8)?.to_vec();
        reader.skip(1)?;
        let mut capabilities = reader.read_u16_le()? as u32;

        let mut greeting = Greeting {
            protocol_version,
            server_version,
            connection_id,
            salt: Vec::new(),
            capabilities,
            charset: DEFAULT_CHARSET,
            status: 0,
            auth_plugin: None,
        };

        if !reader.is_empty() {
            greeting.charset = reader.read_u8()?;
            greeting.status = reader.read_u16_le()?;
            capabilities |= (reader.read_u16_le()? as u32) << 16;
            let auth_len = reader.read_u8()? as usize;
            reader.skip(10)?;

            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let part_len = auth_len.saturating_sub(8).max(13).min(reader.remaining());
                let part = reader.read_bytes(part_len)?;
                let part = match part.iter().position(|b| *b == 0) {
                    Some(end) => &part[..end],
                    None => part,
                };
                salt.extend_from_slice(part);
            }
            if capabilities & CLIENT_PLUGIN_AUTH != 0 && !reader.is_empty() {
                let plugin = reader.read_null_terminated_or_rest();
                greeting.auth_plugin = Some(String::from_utf8_lossy(plugin).into_owned());
            }
        }

        salt.truncate(SCRAMBLE_LEN);
        greeting.salt = salt;
        greeting.capabilities = capabilities;
        Ok(greeting)
    }
}

/// Client reply to the greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

impl HandshakeResponse {
    pub fn decode(payload: &[u8]) -> ShardGateResult<Self> {
        let mut reader = PayloadReader::new(payload);

        let capabilities = reader.read_u32_le()?;
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(ShardGateError::protocol(
                "client does not support protocol 4.1",
            ));
        }
        let max_packet_size = reader.read_u32_le()?;
        let charset = reader.read_u8()?;
        reader.skip(23)?;

        let user = String::from_utf8_lossy(reader.read_null_terminated()?).into_owned();

        let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            reader.read_lenenc_bytes()?.unwrap_or_default().to_vec()
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = reader.read_u8()? as usize;
            reader.read_bytes(len)?.to_vec()
        } else {
            reader.read_null_terminated_or_rest().to_vec()
        };

        // the database name is measured on its own terminator
        let mut database = None;
        if capabilities & CLIENT_CONNECT_WITH_DB != 0 && !reader.is_empty() {
            let db = reader.read_null_terminated_or_rest();
            if !db.is_empty() {
                database = Some(String::from_utf8_lossy(db).into_owned());
            }
        }

        let mut auth_plugin = None;
        if capabilities & CLIENT_PLUGIN_AUTH != 0 && !reader.is_empty() {
            let plugin = reader.read_null_terminated_or_rest();
            auth_plugin = Some(String::from_utf8_lossy(plugin).into_owned());
        }

        Ok(Self {
            capabilities,
            max_packet_size,
            charset,
            user,
            auth_response,
            database,
            auth_plugin,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut capabilities = self.capabilities;
        if self.database.is_some() {
            capabilities |= CLIENT_CONNECT_WITH_DB;
        } else {
            capabilities &= !CLIENT_CONNECT_WITH_DB;
        }

        let mut buf = BytesMut::with_capacity(64 + self.user.len() + self.auth_response.len());
        buf.put_u32_le(capabilities);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.charset);
        buf.put_bytes(0, 23);
        buf.put_null_terminated(self.user.as_bytes());

        if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            buf.put_lenenc_bytes(&self.auth_response);
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.put_slice(&self.auth_response);
        } else {
            buf.put_null_terminated(&self.auth_response);
        }

        if let Some(db) = &self.database {
            buf.put_null_terminated(db.as_bytes());
        }
        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            let plugin = self.auth_plugin.as_deref().unwrap_or(NATIVE_PASSWORD_PLUGIN);
            buf.put_null_terminated(plugin.as_bytes());
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_layout() {
        let salt: Vec<u8> = (b'a'..b'a' + 20).collect();
        let payload = Greeting::new(7, &salt).encode();

        assert_eq!(payload[0], PROTOCOL_VERSION);
        let version_end = 1 + SERVER_VERSION.len();
        assert_eq!(&payload[1..version_end], SERVER_VERSION.as_bytes());
        assert_eq!(payload[version_end], 0);

        let rest = &payload[version_end + 1..];
        assert_eq!(&rest[..4], &7u32.to_le_bytes());
        assert_eq!(&rest[4..12], &salt[..8]);
        assert_eq!(rest[12], 0);
        assert_eq!(&rest[13..15], &(DEFAULT_SERVER_CAPABILITY as u16).to_le_bytes());
        assert_eq!(rest[15], DEFAULT_CHARSET);
        assert_eq!(&rest[16..18], &SERVER_STATUS_AUTOCOMMIT.to_le_bytes());
        assert_eq!(rest[20], 21);
        assert_eq!(&rest[21..31], &[0u8; 10]);
        assert_eq!(&rest[31..43], &salt[8..]);
        assert_eq!(rest[43], 0);
        assert_eq!(rest.len(), 44);
    }

    #[test]
    fn test_greeting_decode_recovers_salt() {
        let salt: Vec<u8> = (b'A'..b'A' + 20).collect();
        let mut greeting = Greeting::new(99, &salt);
        greeting.capabilities |= CLIENT_PLUGIN_AUTH;

        let decoded = Greeting::decode(&greeting.encode()).unwrap();
        assert_eq!(decoded.connection_id, 99);
        assert_eq!(decoded.salt, salt);
        assert_eq!(decoded.auth_plugin.as_deref(), Some(NATIVE_PASSWORD_PLUGIN));
    }

    #[test]
    fn test_handshake_response_with_database() {
        let response = HandshakeResponse {
            capabilities: DEFAULT_CLIENT_CAPABILITY,
            max_packet_size: 1 << 24,
            charset: DEFAULT_CHARSET,
            user: "root".to_string(),
            auth_response: vec![1; 20],
            database: Some("shardeddb".to_string()),
            auth_plugin: None,
        };
        let decoded = HandshakeResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded.user, "root");
        assert_eq!(decoded.auth_response, vec![1; 20]);
        assert_eq!(decoded.database.as_deref(), Some("shardeddb"));
        assert_eq!(decoded.auth_plugin.as_deref(), Some(NATIVE_PASSWORD_PLUGIN));
    }

    #[test]
    fn test_database_name_longer_than_user() {
        // a short user name must not truncate a long database name
        let response = HandshakeResponse {
            capabilities: CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION,
            max_packet_size: 0,
            charset: DEFAULT_CHARSET,
            user: "u".to_string(),
            auth_response: Vec::new(),
            database: Some("a_rather_long_database_name".to_string()),
            auth_plugin: None,
        };
        let decoded = HandshakeResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded.database.as_deref(), Some("a_rather_long_database_name"));
    }

    #[test]
    fn test_pre_41_client_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u32_le(CLIENT_LONG_PASSWORD);
        payload.put_bytes(0, 28);
        assert!(HandshakeResponse::decode(&payload).is_err());
    }
}
