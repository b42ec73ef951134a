//! Length-encoded integers and strings

use bytes::{Buf, BufMut, BytesMut};

use super::PacketError;

/// Marker byte for a NULL column value in a text row
pub const NULL_MARKER: u8 = 0xFB;

pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 1 << 16 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 1 << 24 {
        buf.put_u8(0xFD);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

pub fn put_lenenc_str(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Read a length-encoded integer, advancing `buf`
pub fn read_lenenc_int(buf: &mut &[u8]) -> Result<u64, PacketError> {
    if buf.is_empty() {
        return Err(PacketError::Truncated);
    }
    let width = match buf[0] {
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        0xFB | 0xFF => return Err(PacketError::Malformed("not a length-encoded integer")),
        small => {
            buf.advance(1);
            return Ok(small as u64);
        }
    };
    if buf.len() < 1 + width {
        return Err(PacketError::Truncated);
    }
    buf.advance(1);
    Ok(buf.get_uint_le(width))
}

/// Read a length-encoded string; `Ok(None)` is a NULL column value
pub fn read_lenenc_str<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, PacketError> {
    if buf.first() == Some(&NULL_MARKER) {
        buf.advance(1);
        return Ok(None);
    }
    let len = read_lenenc_int(buf)? as usize;
    if buf.len() < len {
        return Err(PacketError::Truncated);
    }
    let value = &buf[..len];
    buf.advance(len);
    Ok(Some(value))
}
