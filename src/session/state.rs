use crate::protocol::{capabilities, ErrPacket, Packet};
use crate::shard::TableKey;

/// Where a routing session is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No shard map yet; waiting for the cache or a discovery slot
    AwaitingShard,
    /// Our own discovery query is out on every backend
    MappingInProgress,
    /// The client's connect-time database is being set on its backends
    SelectingDefaultDatabase,
    Ready,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AwaitingShard => "awaiting_shard",
            Phase::MappingInProgress => "mapping_in_progress",
            Phase::SelectingDefaultDatabase => "selecting_default_database",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        }
    }
}

/// Fatal session error, sent to the client as an ERR packet before the
/// connection is closed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct SessionFailure {
    pub code: u16,
    pub state: String,
    pub message: String,
    /// Metric label
    pub reason: &'static str,
}

impl SessionFailure {
    fn new(code: u16, state: &str, message: String, reason: &'static str) -> Self {
        Self {
            code,
            state: state.to_string(),
            message,
            reason,
        }
    }

    pub fn duplicate_tables(tables: &[TableKey]) -> Self {
        let list: Vec<String> = tables.iter().map(ToString::to_string).collect();
        Self::new(
            5000,
            "DUPDB",
            format!(
                "Error: duplicate tables found on two different shards: {}",
                list.join(", ")
            ),
            "duplicate_tables",
        )
    }

    pub fn unknown_database(name: &str) -> Self {
        Self::new(
            1049,
            "42000",
            format!("Unknown database '{name}'"),
            "unknown_database",
        )
    }

    pub fn no_target() -> Self {
        Self::new(
            1146,
            "HY000",
            "Could not find a target for query".to_string(),
            "no_target",
        )
    }

    pub fn backend_lost(name: &str) -> Self {
        Self::new(
            2013,
            "HY000",
            format!("Lost connection to backend server '{name}'"),
            "backend_lost",
        )
    }

    pub fn history_exceeded(limit: usize) -> Self {
        Self::new(
            1184,
            "08S01",
            format!("Session command history limit of {limit} exceeded"),
            "history_exceeded",
        )
    }

    /// A backend refused the connect-time database
    pub fn from_backend(err: &ErrPacket) -> Self {
        Self::new(
            err.error_code,
            &err.sql_state,
            err.error_message.clone(),
            "default_database",
        )
    }

    pub fn with_session_id(mut self, id: u32) -> Self {
        self.message = format!("{} (session {id})", self.message);
        self
    }

    pub fn to_packet(&self, sequence_id: u8) -> Packet {
        ErrPacket::new(self.code, &self.state, &self.message)
            .encode(sequence_id, capabilities::DEFAULT_CAPABILITIES)
    }
}
