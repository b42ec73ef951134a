use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;

/// MySQL wire protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build a command packet (sequence 0) from a command byte and its body
    pub fn command(command: Command, body: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(body.len() + 1);
        buf.put_u8(command as u8);
        buf.extend_from_slice(body);
        Self::new(0, buf.freeze())
    }

    /// COM_QUERY carrying `sql`
    pub fn query(sql: &str) -> Self {
        Self::command(Command::Query, sql.as_bytes())
    }

    /// COM_INIT_DB selecting `database`
    pub fn init_db(database: &str) -> Self {
        Self::command(Command::InitDb, database.as_bytes())
    }

    /// First payload byte, which is the command byte for requests and the
    /// header byte (OK/ERR/EOF/column count) for responses.
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Copy with payload bytes 1..5 replaced by `id`. Both the COM_STMT_*
    /// requests and the COM_STMT_PREPARE OK response carry the statement id
    /// there.
    pub fn with_statement_id(&self, id: u32) -> Self {
        if self.payload.len() < 5 {
            return self.clone();
        }
        let mut buf = BytesMut::from(&self.payload[..]);
        buf[1..5].copy_from_slice(&id.to_le_bytes());
        Self::new(self.sequence_id, buf.freeze())
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.reserve(PACKET_HEADER_SIZE + len);
        dst.put_uint_le(len as u64, 3);
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        if src.len() < PACKET_HEADER_SIZE + len {
            src.reserve(PACKET_HEADER_SIZE + len - src.len());
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// MySQL capability flags
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities offered to clients and requested from backends.
    ///
    /// CLIENT_MULTI_STATEMENTS is left out: a statement is classified as a
    /// whole, and a second statement could need a different shard.
    ///
    /// CLIENT_DEPRECATE_EOF is left out so every leg of a session speaks the
    /// same result set framing regardless of what each backend supports.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried by OK and EOF packets
pub mod status {
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// MySQL command bytes understood by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    Ping = 0x0e,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    StmtFetch = 0x1c,
}

impl Command {
    pub fn from_byte(value: u8) -> Option<Self> {
        let cmd = match value {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x0e => Command::Ping,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1c => Command::StmtFetch,
            _ => return None,
        };
        Some(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_full_payload() {
        let mut buf = BytesMut::new();
        Packet::query("SELECT 1").encode(&mut buf);
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..6]);
        assert!(Packet::decode(&mut partial).is_none());

        let mut whole = full;
        let packet = Packet::decode(&mut whole).unwrap();
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(packet.first_byte(), Some(Command::Query as u8));
        assert_eq!(&packet.payload[1..], b"SELECT 1");
        assert!(whole.is_empty());
    }

    #[test]
    fn test_header_length_is_little_endian() {
        let mut buf = BytesMut::new();
        Packet::new(7, vec![0u8; 0x0102]).encode(&mut buf);
        assert_eq!(&buf[..4], &[0x02, 0x01, 0x00, 7]);
    }

    #[test]
    fn test_with_statement_id() {
        let packet = Packet::command(Command::StmtExecute, &[1, 0, 0, 0, 0, 1, 0, 0, 0]);
        let rewritten = packet.with_statement_id(0x0102);
        assert_eq!(&rewritten.payload[..5], &[0x17, 0x02, 0x01, 0, 0]);
        assert_eq!(&rewritten.payload[5..], &packet.payload[5..]);
        assert_eq!(rewritten.sequence_id, packet.sequence_id);
    }

    #[test]
    fn test_command_from_byte() {
        assert_eq!(Command::from_byte(0x02), Some(Command::InitDb));
        assert_eq!(Command::from_byte(0x19), Some(Command::StmtClose));
        assert_eq!(Command::from_byte(0x08), None);
    }
}
