//! Response framing: decides which packet of a backend response is the last one.

use bytes::Buf;

use super::handshake::ErrPacket;
use super::lenenc::read_lenenc_int;
use super::packet::status::SERVER_MORE_RESULTS_EXISTS;

/// Shape of the response a request produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// OK, ERR, or one or more result sets (COM_QUERY, COM_STMT_EXECUTE, COM_INIT_DB, COM_PING)
    Result,
    /// Column definitions closed by a single EOF (COM_FIELD_LIST)
    FieldList,
    /// COM_STMT_PREPARE OK followed by parameter and column definitions
    Prepare,
    /// Rows closed by EOF (COM_STMT_FETCH)
    Fetch,
    /// No response at all (COM_QUIT, COM_STMT_CLOSE, COM_STMT_SEND_LONG_DATA)
    None,
}

/// Role of one response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Ok,
    Err,
    Eof,
    ColumnCount,
    ColumnDef,
    Row,
    PrepareOk,
    LocalInfileRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    ColumnDefs { remaining: u64 },
    ColumnsEof,
    Rows,
    PrepareDefs { remaining: u16, columns_after: u16 },
    PrepareEof { columns_after: u16 },
    FieldDefs,
    LocalInfile,
    Done,
}

/// Tracks one request's response packet by packet
#[derive(Debug, Clone)]
pub struct ReplyTracker {
    kind: ReplyKind,
    phase: Phase,
    deprecate_eof: bool,
    error: Option<ErrPacket>,
    statement_id: Option<u32>,
}

impl ReplyTracker {
    pub fn new(kind: ReplyKind, deprecate_eof: bool) -> Self {
        let phase = match kind {
            ReplyKind::None => Phase::Done,
            ReplyKind::FieldList => Phase::FieldDefs,
            ReplyKind::Fetch => Phase::Rows,
            _ => Phase::Start,
        };
        Self {
            kind,
            phase,
            deprecate_eof,
            error: None,
            statement_id: None,
        }
    }

    /// Classify the next response packet and advance
    pub fn feed(&mut self, payload: &[u8]) -> PacketKind {
        let header = payload.first().copied().unwrap_or(0);

        match self.phase {
            Phase::Start | Phase::LocalInfile => self.feed_first(payload, header),
            Phase::ColumnDefs { remaining } => {
                let remaining = remaining.saturating_sub(1);
                self.phase = match (remaining, self.deprecate_eof) {
                    (0, true) => Phase::Rows,
                    (0, false) => Phase::ColumnsEof,
                    (n, _) => Phase::ColumnDefs { remaining: n },
                };
                PacketKind::ColumnDef
            }
            Phase::ColumnsEof => {
                self.phase = Phase::Rows;
                PacketKind::Eof
            }
            Phase::Rows => {
                if header == 0xFF {
                    self.fail(payload);
                    return PacketKind::Err;
                }
                if self.is_rows_terminator(payload) {
                    let status = if self.deprecate_eof {
                        ok_status_flags(payload)
                    } else {
                        eof_status_flags(payload)
                    };
                    self.finish_result(status);
                    return PacketKind::Eof;
                }
                PacketKind::Row
            }
            Phase::PrepareDefs {
                remaining,
                columns_after,
            } => {
                let remaining = remaining - 1;
                self.phase = if remaining > 0 {
                    Phase::PrepareDefs {
                        remaining,
                        columns_after,
                    }
                } else if self.deprecate_eof {
                    self.next_prepare_block(columns_after)
                } else {
                    Phase::PrepareEof { columns_after }
                };
                PacketKind::ColumnDef
            }
            Phase::PrepareEof { columns_after } => {
                self.phase = self.next_prepare_block(columns_after);
                PacketKind::Eof
            }
            Phase::FieldDefs => {
                if header == 0xFF {
                    self.fail(payload);
                    PacketKind::Err
                } else if header == 0xFE && payload.len() < 9 {
                    self.phase = Phase::Done;
                    PacketKind::Eof
                } else {
                    PacketKind::ColumnDef
                }
            }
            // Anything after completion belongs to no request; report it as-is
            Phase::Done => match header {
                0xFF => PacketKind::Err,
                0x00 => PacketKind::Ok,
                _ => PacketKind::Row,
            },
        }
    }

    fn feed_first(&mut self, payload: &[u8], header: u8) -> PacketKind {
        match header {
            0xFF => {
                self.fail(payload);
                PacketKind::Err
            }
            0x00 if self.kind == ReplyKind::Prepare && self.phase == Phase::Start => {
                self.start_prepare(payload);
                PacketKind::PrepareOk
            }
            0x00 => {
                self.finish_result(ok_status_flags(payload));
                PacketKind::Ok
            }
            0xFB if self.phase == Phase::Start => {
                self.phase = Phase::LocalInfile;
                PacketKind::LocalInfileRequest
            }
            _ => {
                let mut buf = payload;
                let columns = read_lenenc_int(&mut buf).unwrap_or(0);
                self.phase = if columns == 0 {
                    Phase::Done
                } else {
                    Phase::ColumnDefs { remaining: columns }
                };
                PacketKind::ColumnCount
            }
        }
    }

    fn start_prepare(&mut self, payload: &[u8]) {
        if payload.len() < 9 {
            self.phase = Phase::Done;
            return;
        }
        let mut buf = &payload[1..];
        self.statement_id = Some(buf.get_u32_le());
        let columns = buf.get_u16_le();
        let params = buf.get_u16_le();
        self.phase = if params > 0 {
            Phase::PrepareDefs {
                remaining: params,
                columns_after: columns,
            }
        } else {
            self.next_prepare_block(columns)
        };
    }

    fn next_prepare_block(&self, columns: u16) -> Phase {
        if columns > 0 {
            Phase::PrepareDefs {
                remaining: columns,
                columns_after: 0,
            }
        } else {
            Phase::Done
        }
    }

    fn is_rows_terminator(&self, payload: &[u8]) -> bool {
        if payload.first() != Some(&0xFE) {
            return false;
        }
        if self.deprecate_eof {
            payload.len() < 0xFF_FF_FF
        } else {
            payload.len() < 9
        }
    }

    fn finish_result(&mut self, status: u16) {
        self.phase = if status & SERVER_MORE_RESULTS_EXISTS != 0 {
            Phase::Start
        } else {
            Phase::Done
        };
    }

    fn fail(&mut self, payload: &[u8]) {
        self.error = ErrPacket::parse(payload);
        self.phase = Phase::Done;
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }

    /// The backend asked for a local file and is waiting for client data
    pub fn awaiting_local_infile(&self) -> bool {
        self.phase == Phase::LocalInfile
    }

    pub fn error(&self) -> Option<&ErrPacket> {
        self.error.as_ref()
    }

    /// Statement id assigned by a successful COM_STMT_PREPARE
    pub fn statement_id(&self) -> Option<u32> {
        self.statement_id
    }
}

fn eof_status_flags(payload: &[u8]) -> u16 {
    if payload.len() >= 5 {
        u16::from_le_bytes([payload[3], payload[4]])
    } else {
        0
    }
}

fn ok_status_flags(payload: &[u8]) -> u16 {
    let mut buf = payload.get(1..).unwrap_or_default();
    if read_lenenc_int(&mut buf).is_err() || read_lenenc_int(&mut buf).is_err() || buf.len() < 2 {
        return 0;
    }
    buf.get_u16_le()
}
