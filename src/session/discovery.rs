//! Shard discovery: one catalogue query per backend, merged into a fresh
//! shard map.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::backend::{ReplyChunk, Request, TargetRef};
use crate::protocol::{parse_text_row, Packet, PacketKind, ReplyKind, ReplyTracker};
use crate::shard::{IgnoreList, Shard, TableKey};

/// Every table plus every schema (the latter with an empty table name) a
/// backend knows, lower-cased
pub const DISCOVERY_SQL: &str = "SELECT LOWER(t.table_schema), LOWER(t.table_name) \
     FROM information_schema.tables AS t \
     UNION ALL \
     SELECT LOWER(s.schema_name), '' FROM information_schema.schemata AS s";

pub struct Discovery {
    shard: Shard,
    pending: BTreeSet<String>,
    trackers: HashMap<String, ReplyTracker>,
    excluded: Vec<String>,
    started: Instant,
    user: String,
}

impl Discovery {
    pub fn new<'a>(user: &str, targets: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            shard: Shard::new(),
            pending: targets.into_iter().cloned().collect(),
            trackers: HashMap::new(),
            excluded: Vec::new(),
            started: Instant::now(),
            user: user.to_string(),
        }
    }

    pub fn request() -> Request {
        Request::command(Packet::query(DISCOVERY_SQL), ReplyKind::Result)
    }

    /// Merge one chunk of `target`'s response. Returns true when this was
    /// the backend's last chunk.
    pub fn on_chunk(&mut self, target: &TargetRef, chunk: &ReplyChunk, ignore: &IgnoreList) -> bool {
        let name = target.name();
        let tracker = self
            .trackers
            .entry(name.to_string())
            .or_insert_with(|| ReplyTracker::new(ReplyKind::Result, false));

        for packet in &chunk.packets {
            if tracker.feed(&packet.payload) != PacketKind::Row {
                continue;
            }
            let row = match parse_text_row(&packet.payload) {
                Ok(row) => row,
                Err(e) => {
                    warn!(backend = %name, error = %e, "Malformed discovery row");
                    continue;
                }
            };
            let mut columns = row.into_iter();
            let schema = columns.next().flatten().unwrap_or_default();
            let table = columns.next().flatten().unwrap_or_default();
            if schema.is_empty() {
                continue;
            }

            if !self.shard.add_location(&schema, &table, target) {
                let key = TableKey::new(&schema, &table);
                if key.is_schema() || ignore.is_ignored(&key) {
                    continue;
                }
                let others: Vec<String> = self
                    .shard
                    .locations_of(&key)
                    .iter()
                    .filter(|t| t.name() != name)
                    .map(|t| t.name().to_string())
                    .collect();
                error!(
                    table = %key,
                    backend = %name,
                    also_on = %others.join(", "),
                    user = %self.user,
                    "Table found on more than one backend"
                );
            }
        }

        if !chunk.complete {
            return false;
        }
        self.trackers.remove(name);
        self.pending.remove(name);
        match &chunk.error {
            Some(err) => {
                warn!(
                    backend = %name,
                    code = err.error_code,
                    error = %err.error_message,
                    "Discovery query failed, backend excluded from shard map"
                );
                self.excluded.push(name.to_string());
            }
            None => debug!(backend = %name, "Discovery finished on backend"),
        }
        true
    }

    /// Stop waiting for a backend that went away
    pub fn exclude(&mut self, name: &str) {
        if self.pending.remove(name) {
            self.trackers.remove(name);
            self.excluded.push(name.to_string());
            warn!(backend = %name, "Backend lost during discovery, excluded from shard map");
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn into_shard(self) -> Shard {
        self.shard
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::discovery_reply;
    use super::*;
    use crate::protocol::ErrPacket;
    use crate::shard::test_support::target;

    fn names(set: BTreeSet<TargetRef>) -> Vec<String> {
        set.iter().map(|t| t.name().to_string()).collect()
    }

    #[test]
    fn test_merges_backends() {
        let (b1, b2) = (target("b1"), target("b2"));
        let backends = vec!["b1".to_string(), "b2".to_string()];
        let ignore = IgnoreList::default();
        let mut discovery = Discovery::new("app", &backends);

        assert!(discovery.on_chunk(&b1, &discovery_reply(&[("sales", ""), ("sales", "orders")]), &ignore));
        assert!(!discovery.is_complete());
        assert!(discovery.on_chunk(&b2, &discovery_reply(&[("HR", ""), ("hr", "People")]), &ignore));
        assert!(discovery.is_complete());

        let shard = discovery.into_shard();
        assert_eq!(names(shard.locations_of(&TableKey::new("sales", "orders"))), ["b1"]);
        assert_eq!(names(shard.locations_of(&TableKey::new("hr", "people"))), ["b2"]);
        assert_eq!(shard.schemas(), ["hr", "sales"]);
    }

    #[test]
    fn test_split_chunks() {
        let b1 = target("b1");
        let backends = vec!["b1".to_string()];
        let mut discovery = Discovery::new("app", &backends);
        let mut reply = discovery_reply(&[("sales", ""), ("sales", "orders")]);
        let tail = reply.packets.split_off(4);

        let head = ReplyChunk {
            packets: reply.packets,
            ..ReplyChunk::default()
        };
        assert!(!discovery.on_chunk(&b1, &head, &IgnoreList::default()));
        let tail = ReplyChunk {
            packets: tail,
            complete: true,
            ..ReplyChunk::default()
        };
        assert!(discovery.on_chunk(&b1, &tail, &IgnoreList::default()));
        assert!(discovery.shard().has_schema("sales"));
        assert_eq!(discovery.shard().entries().count(), 2);
    }

    #[test]
    fn test_failed_backend_is_excluded() {
        let b1 = target("b1");
        let backends = vec!["b1".to_string(), "b2".to_string()];
        let mut discovery = Discovery::new("app", &backends);
        let err = ErrPacket::new(1142, "42000", "SELECT command denied");
        let chunk = ReplyChunk {
            packets: vec![err.encode(1, crate::protocol::capabilities::DEFAULT_CAPABILITIES)],
            complete: true,
            error: Some(err),
            ..ReplyChunk::default()
        };
        assert!(discovery.on_chunk(&b1, &chunk, &IgnoreList::default()));
        discovery.exclude("b2");
        assert!(discovery.is_complete());
        assert!(discovery.shard().is_empty());
        assert_eq!(discovery.excluded(), ["b1", "b2"]);
    }
}
