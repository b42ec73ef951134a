use bytes::{Buf, Bytes};

use super::packet::{Command, Packet};
use super::reply::ReplyKind;

/// Parsed command from client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Quit,
    InitDb(String),
    Query(String),
    FieldList { table: String, wildcard: String },
    Ping,
    StmtPrepare(String),
    StmtExecute(u32),
    StmtSendLongData(u32),
    StmtClose(u32),
    StmtReset(u32),
    StmtFetch(u32),
    Other(u8, Bytes),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        let Some(&code) = payload.first() else {
            return ClientCommand::Other(0, Bytes::new());
        };
        let data = payload.slice(1..);

        let Some(cmd) = Command::from_byte(code) else {
            return ClientCommand::Other(code, data);
        };

        match cmd {
            Command::Quit => ClientCommand::Quit,
            Command::InitDb => ClientCommand::InitDb(lossy(&data)),
            Command::Query => ClientCommand::Query(lossy(&data)),
            Command::FieldList => {
                // Table name is null-terminated, followed by optional wildcard
                let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let table = lossy(&data[..null_pos]);
                let wildcard = if null_pos + 1 < data.len() {
                    lossy(&data[null_pos + 1..])
                } else {
                    String::new()
                };
                ClientCommand::FieldList { table, wildcard }
            }
            Command::Ping => ClientCommand::Ping,
            Command::StmtPrepare => ClientCommand::StmtPrepare(lossy(&data)),
            Command::StmtExecute
            | Command::StmtSendLongData
            | Command::StmtClose
            | Command::StmtReset
            | Command::StmtFetch => {
                if data.len() < 4 {
                    return ClientCommand::Other(code, data);
                }
                let id = (&data[..4]).get_u32_le();
                match cmd {
                    Command::StmtExecute => ClientCommand::StmtExecute(id),
                    Command::StmtSendLongData => ClientCommand::StmtSendLongData(id),
                    Command::StmtClose => ClientCommand::StmtClose(id),
                    Command::StmtReset => ClientCommand::StmtReset(id),
                    _ => ClientCommand::StmtFetch(id),
                }
            }
        }
    }

    /// Statement text for commands that carry SQL
    pub fn sql(&self) -> Option<&str> {
        match self {
            ClientCommand::Query(sql) | ClientCommand::StmtPrepare(sql) => Some(sql),
            _ => None,
        }
    }

    /// Whether the backend answers this command at all
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            ClientCommand::Quit | ClientCommand::StmtClose(_) | ClientCommand::StmtSendLongData(_)
        )
    }

    /// Response shape the backend produces for this command
    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            ClientCommand::FieldList { .. } => ReplyKind::FieldList,
            ClientCommand::StmtPrepare(_) => ReplyKind::Prepare,
            ClientCommand::StmtFetch(_) => ReplyKind::Fetch,
            cmd if !cmd.expects_reply() => ReplyKind::None,
            _ => ReplyKind::Result,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Quit => "COM_QUIT",
            ClientCommand::InitDb(_) => "COM_INIT_DB",
            ClientCommand::Query(_) => "COM_QUERY",
            ClientCommand::FieldList { .. } => "COM_FIELD_LIST",
            ClientCommand::Ping => "COM_PING",
            ClientCommand::StmtPrepare(_) => "COM_STMT_PREPARE",
            ClientCommand::StmtExecute(_) => "COM_STMT_EXECUTE",
            ClientCommand::StmtSendLongData(_) => "COM_STMT_SEND_LONG_DATA",
            ClientCommand::StmtClose(_) => "COM_STMT_CLOSE",
            ClientCommand::StmtReset(_) => "COM_STMT_RESET",
            ClientCommand::StmtFetch(_) => "COM_STMT_FETCH",
            ClientCommand::Other(..) => "COM_OTHER",
        }
    }
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

impl From<&Packet> for ClientCommand {
    fn from(packet: &Packet) -> Self {
        ClientCommand::parse(&packet.payload)
    }
}
