use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::lenenc::{put_lenenc_int, read_lenenc_int};
use super::packet::{capabilities::*, status, Packet};

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: [u8; 20],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Handshake offered by the proxy, with a fresh random scramble
    pub fn new(connection_id: u32, server_version: &str) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut scramble = [0u8; 20];
        // Scramble bytes must be printable and non-zero for some clients
        for byte in scramble.iter_mut() {
            *byte = rng.gen_range(0x21..0x7f);
        }

        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            scramble,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }

    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);
        buf.extend_from_slice(&self.scramble[..8]);
        buf.put_u8(0);
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le((self.capability_flags >> 16) as u16);
        buf.put_u8(self.scramble.len() as u8 + 1);
        buf.extend_from_slice(&[0u8; 10]);
        buf.extend_from_slice(&self.scramble[8..]);
        buf.put_u8(0);
        buf.extend_from_slice(self.auth_plugin_name.as_bytes());
        buf.put_u8(0);

        Packet::new(0, buf.freeze())
    }

    /// Parse a backend's handshake
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;
        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);
        if buf.len() < 31 {
            return None;
        }

        let connection_id = buf.get_u32_le();
        let mut scramble = [0u8; 20];
        scramble[..8].copy_from_slice(&buf[..8]);
        buf.advance(9);

        let caps_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let caps_upper = buf.get_u16_le() as u32;
        let capability_flags = caps_lower | (caps_upper << 16);
        let auth_data_len = buf.get_u8() as usize;
        buf.advance(10);

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_data_len.saturating_sub(8));
            let part2 = buf.len().min(12);
            scramble[8..8 + part2].copy_from_slice(&buf[..part2]);
            buf.advance(len.min(buf.len()));
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            scramble,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;
        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();
        buf.advance(23);

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_len = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            read_lenenc_int(&mut buf).ok()? as usize
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            if buf.is_empty() {
                return None;
            }
            buf.get_u8() as usize
        } else {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..len].to_vec();
            return Some(Self {
                capability_flags,
                max_packet_size,
                character_set,
                username,
                auth_response: data,
                database: None,
                auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
            });
        };
        if buf.len() < auth_len {
            return None;
        }
        let auth_response = buf[..auth_len].to_vec();
        buf.advance(auth_len);

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            Some(db).filter(|db| !db.is_empty())
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        buf.put_u8(self.auth_response.len() as u8);
        buf.extend_from_slice(&self.auth_response);

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Compute mysql_native_password auth response
pub fn compute_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let mask = hasher.finalize();

    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// Check a client's mysql_native_password response against the configured password
pub fn verify_auth_response(password: &str, scramble: &[u8], response: &[u8]) -> bool {
    compute_auth_response(password, scramble) == response
}

/// Auth switch request sent by a backend (0xFE header) during login
pub fn parse_auth_switch(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    if payload.first() != Some(&0xFE) || payload.len() < 2 {
        return None;
    }
    let body = &payload[1..];
    let null_pos = body.iter().position(|&b| b == 0)?;
    let plugin = String::from_utf8_lossy(&body[..null_pos]).to_string();
    let mut data = body[null_pos + 1..].to_vec();
    if data.last() == Some(&0) {
        data.pop();
    }
    Some((plugin, data))
}

/// Ask a client to redo its login with mysql_native_password
pub fn auth_switch_request(sequence_id: u8, scramble: &[u8]) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0xFE);
    buf.extend_from_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
    buf.put_u8(0);
    buf.extend_from_slice(scramble);
    buf.put_u8(0);
    Packet::new(sequence_id, buf.freeze())
}

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }
        Packet::new(sequence_id, buf.freeze())
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }
        buf.extend_from_slice(self.error_message.as_bytes());
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 3 || payload[0] != 0xFF {
            return None;
        }

        let mut buf = &payload[1..];
        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if buf.len() >= 6 && buf[0] == b'#' {
            (
                String::from_utf8_lossy(&buf[1..6]).to_string(),
                String::from_utf8_lossy(&buf[6..]).to_string(),
            )
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

pub fn is_ok_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0x00)
}

pub fn is_err_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_password_round_trip() {
        let scramble = b"abcdefghijklmnopqrst";
        let response = compute_auth_response("secret", scramble);
        assert_eq!(response.len(), 20);
        assert!(verify_auth_response("secret", scramble, &response));
        assert!(!verify_auth_response("other", scramble, &response));
    }

    #[test]
    fn test_empty_password_sends_empty_response() {
        assert!(compute_auth_response("", b"abcdefghijklmnopqrst").is_empty());
        assert!(verify_auth_response("", b"abcdefghijklmnopqrst", &[]));
    }

    #[test]
    fn test_proxy_handshake_parses_back() {
        let ours = InitialHandshake::new(42, "8.0.0-schemaproxy");
        let packet = ours.encode();
        let parsed = InitialHandshake::parse(&packet.payload).unwrap();
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.server_version, "8.0.0-schemaproxy");
        assert_eq!(parsed.scramble, ours.scramble);
        assert_eq!(parsed.auth_plugin_name, NATIVE_PASSWORD_PLUGIN);
    }

    #[test]
    fn test_handshake_response_with_database() {
        let response = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES | CLIENT_CONNECT_WITH_DB,
            max_packet_size: 1 << 24,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: vec![1; 20],
            database: Some("sales".to_string()),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();
        assert_eq!(parsed.username, "app");
        assert_eq!(parsed.auth_response, vec![1; 20]);
        assert_eq!(parsed.database.as_deref(), Some("sales"));
    }

    #[test]
    fn test_err_packet_parse() {
        let packet = ErrPacket::new(1049, "42000", "Unknown database 'x'").encode(1, DEFAULT_CAPABILITIES);
        let err = ErrPacket::parse(&packet.payload).unwrap();
        assert_eq!(err.error_code, 1049);
        assert_eq!(err.sql_state, "42000");
        assert_eq!(err.error_message, "Unknown database 'x'");
    }

    #[test]
    fn test_auth_switch_parse() {
        let mut payload = vec![0xFE];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(b"01234567890123456789\0");
        let (plugin, data) = parse_auth_switch(&payload).unwrap();
        assert_eq!(plugin, NATIVE_PASSWORD_PLUGIN);
        assert_eq!(data, b"01234567890123456789");

        let request = auth_switch_request(2, b"01234567890123456789");
        assert_eq!(request.sequence_id, 2);
        let (plugin, data) = parse_auth_switch(&request.payload).unwrap();
        assert_eq!(plugin, NATIVE_PASSWORD_PLUGIN);
        assert_eq!(data, b"01234567890123456789");
    }
}
