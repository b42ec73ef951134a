//! Text protocol result sets built by the proxy itself

use bytes::{BufMut, BytesMut};

use super::lenenc::{put_lenenc_int, put_lenenc_str, read_lenenc_str, NULL_MARKER};
use super::packet::{status, Packet};
use super::PacketError;

const MYSQL_TYPE_VAR_STRING: u8 = 0xFD;
const UTF8_GENERAL_CI: u16 = 0x21;

#[derive(Debug, Clone, Default)]
pub struct TextResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl TextResultSet {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows
            .push(values.into_iter().map(|v| Some(v.into())).collect());
    }

    /// Encode as a complete response; the first packet gets sequence id 1
    pub fn encode(&self) -> Vec<Packet> {
        let mut seq: u8 = 1;
        let mut next = |payload: BytesMut| {
            let packet = Packet::new(seq, payload.freeze());
            seq = seq.wrapping_add(1);
            packet
        };

        let mut packets = Vec::with_capacity(self.columns.len() + self.rows.len() + 3);

        let mut count = BytesMut::new();
        put_lenenc_int(&mut count, self.columns.len() as u64);
        packets.push(next(count));

        for name in &self.columns {
            packets.push(next(column_definition(name)));
        }
        packets.push(next(eof_payload()));

        for row in &self.rows {
            let mut buf = BytesMut::new();
            for value in row {
                match value {
                    Some(v) => put_lenenc_str(&mut buf, v.as_bytes()),
                    None => buf.put_u8(NULL_MARKER),
                }
            }
            packets.push(next(buf));
        }
        packets.push(next(eof_payload()));

        packets
    }
}

fn column_definition(name: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    put_lenenc_str(&mut buf, b"def");
    put_lenenc_str(&mut buf, b"");
    put_lenenc_str(&mut buf, b"");
    put_lenenc_str(&mut buf, b"");
    put_lenenc_str(&mut buf, name.as_bytes());
    put_lenenc_str(&mut buf, name.as_bytes());
    buf.put_u8(0x0c);
    buf.put_u16_le(UTF8_GENERAL_CI);
    buf.put_u32_le(255);
    buf.put_u8(MYSQL_TYPE_VAR_STRING);
    buf.put_u16_le(0);
    buf.put_u8(0);
    buf.put_u16_le(0);
    buf
}

fn eof_payload() -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(0xFE);
    buf.put_u16_le(0);
    buf.put_u16_le(status::SERVER_STATUS_AUTOCOMMIT);
    buf
}

/// Decode one text protocol row
pub fn parse_text_row(payload: &[u8]) -> Result<Vec<Option<String>>, PacketError> {
    let mut buf = payload;
    let mut values = Vec::new();
    while !buf.is_empty() {
        let value = read_lenenc_str(&mut buf)?;
        values.push(value.map(|v| String::from_utf8_lossy(v).into_owned()));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::reply::{PacketKind, ReplyKind, ReplyTracker};

    #[test]
    fn test_encoded_result_set_is_well_framed() {
        let mut rs = TextResultSet::new(["Database", "Server"]);
        rs.push_row(["sales.orders", "shard1"]);
        rs.push_row(["hr", "shard2"]);
        let packets = rs.encode();

        // count + 2 defs + eof + 2 rows + eof
        assert_eq!(packets.len(), 7);
        let seqs: Vec<u8> = packets.iter().map(|p| p.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6, 7]);

        let mut tracker = ReplyTracker::new(ReplyKind::Result, false);
        let kinds: Vec<PacketKind> = packets.iter().map(|p| tracker.feed(&p.payload)).collect();
        assert_eq!(kinds[4], PacketKind::Row);
        assert!(tracker.is_complete());

        let row = parse_text_row(&packets[4].payload).unwrap();
        assert_eq!(row, vec![Some("sales.orders".into()), Some("shard1".into())]);
    }

    #[test]
    fn test_parse_row_with_empty_and_null() {
        let payload = [5, b's', b'a', b'l', b'e', b's', 0, NULL_MARKER];
        let row = parse_text_row(&payload).unwrap();
        assert_eq!(row, vec![Some("sales".into()), Some(String::new()), None]);
    }
}
