pub mod codec;
pub mod command;
pub mod handshake;
pub mod lenenc;
pub mod packet;
pub mod reply;
pub mod resultset;

pub use codec::PacketCodec;
pub use command::ClientCommand;
pub use handshake::{
    auth_switch_request, compute_auth_response, is_err_packet, is_ok_packet, parse_auth_switch,
    verify_auth_response, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{capabilities, Command, Packet};
pub use reply::{PacketKind, ReplyKind, ReplyTracker};
pub use resultset::{parse_text_row, TextResultSet};

/// Malformed wire data
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}
