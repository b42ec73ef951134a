//! The routing engine of one client session.
//!
//! [`RoutingSession`] does no I/O. The driver feeds it client packets,
//! backend reply chunks, backend failures and timer ticks, and writes
//! whatever [`take_output`](RoutingSession::take_output) returns to the
//! client. Requests leave through the [`BackendLink`]s the session owns.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, instrument, trace, warn};

use crate::backend::{BackendLink, ReplyChunk, Request, TargetRef};
use crate::metrics::metrics;
use crate::parser::SqlAnalyzer;
use crate::protocol::{capabilities, ClientCommand, ErrPacket, Packet, ReplyKind, TextResultSet};
use crate::router::{decide, PreparedOp, RouteDecision, RouterService};
use crate::shard::{Shard, TableKey};

use super::discovery::Discovery;
use super::history::SessionHistory;
use super::state::{Phase, SessionFailure};
use super::truncate_sql;

/// What the next response on a link belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Discovery,
    DefaultDb,
    /// A client request; only the replier's response reaches the client
    Client { forward: bool },
    /// History replayed on a joining backend, response dropped
    Replay,
}

struct LinkSlot {
    link: Box<dyn BackendLink>,
    expect: VecDeque<Expect>,
}

enum Effect {
    None,
    SetDatabase(String),
    /// COM_STMT_PREPARE; `assigned` is the id handed to the client
    BinaryPrepare { assigned: Option<u32> },
}

/// The client request in flight
struct PendingReply {
    waiting: BTreeSet<String>,
    replier: String,
    effect: Effect,
    failed: bool,
}

enum Dispatched {
    Done,
    /// Needs a fresh shard map; the packet is routed again afterwards
    Refresh(Packet),
}

pub struct RoutingSession {
    id: u32,
    user: String,
    service: Arc<RouterService>,
    analyzer: SqlAnalyzer,
    phase: Phase,
    shard: Shard,
    links: BTreeMap<String, LinkSlot>,
    queue: VecDeque<Packet>,
    outbox: Vec<Packet>,
    discovery: Option<Discovery>,
    /// Holds one of the cache's in-flight update slots
    owns_update: bool,
    force_refresh: bool,
    /// The one rediscovery an unknown database may trigger was used
    refreshed: bool,
    retry_at: Option<Instant>,
    connect_db: Option<String>,
    default_db_waiting: Option<BTreeSet<String>>,
    current_db: Option<String>,
    history: SessionHistory,
    last_target: Option<String>,
    pending: Option<PendingReply>,
    /// Backend receiving `LOAD DATA LOCAL INFILE` contents
    upload: Option<String>,
    /// Client-visible COM_STMT_PREPARE ids to the backend's ids
    binary_ids: HashMap<u32, u32>,
    next_statement_id: u32,
    failure: Option<SessionFailure>,
}

impl RoutingSession {
    pub fn new(
        id: u32,
        user: &str,
        connect_db: Option<String>,
        service: Arc<RouterService>,
        links: Vec<Box<dyn BackendLink>>,
    ) -> Self {
        let links = links
            .into_iter()
            .map(|link| {
                let name = link.target().name().to_string();
                (
                    name,
                    LinkSlot {
                        link,
                        expect: VecDeque::new(),
                    },
                )
            })
            .collect();
        let history =
            SessionHistory::new(service.max_sescmd_history, service.disable_sescmd_history);

        Self {
            id,
            user: user.to_string(),
            service,
            analyzer: SqlAnalyzer::new(),
            phase: Phase::AwaitingShard,
            shard: Shard::new(),
            links,
            queue: VecDeque::new(),
            outbox: Vec::new(),
            discovery: None,
            owns_update: false,
            force_refresh: false,
            refreshed: false,
            retry_at: None,
            connect_db: connect_db.filter(|db| !db.is_empty()),
            default_db_waiting: None,
            current_db: None,
            history,
            last_target: None,
            pending: None,
            upload: None,
            binary_ids: HashMap::new(),
            next_statement_id: 1,
            failure: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.step(now);
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        self.failure.as_ref()
    }

    pub fn current_database(&self) -> Option<&str> {
        self.current_db.as_deref()
    }

    #[cfg(test)]
    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    /// Client packets are file contents for `LOAD DATA LOCAL INFILE`
    pub fn is_uploading(&self) -> bool {
        self.upload.is_some()
    }

    /// When the session wants [`on_timer`](Self::on_timer) called
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Packets for the client, in order
    pub fn take_output(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    pub fn on_client_packet(&mut self, packet: Packet, now: Instant) {
        if self.phase == Phase::Failed {
            return;
        }
        if let Some(target) = self.upload.clone() {
            let last = packet.payload.is_empty();
            if !self.write(&target, Request::Data(packet), None) {
                self.fail(SessionFailure::backend_lost(&target));
                return;
            }
            if last {
                self.upload = None;
            }
            return;
        }
        self.queue.push_back(packet);
        self.step(now);
    }

    pub fn on_backend_reply(&mut self, target: &str, chunk: ReplyChunk, now: Instant) {
        if self.phase == Phase::Failed {
            return;
        }
        let Some(slot) = self.links.get_mut(target) else {
            trace!(session_id = self.id, backend = target, "Reply from a backend no longer in the session");
            return;
        };
        let Some(&expect) = slot.expect.front() else {
            warn!(session_id = self.id, backend = target, "Unexpected reply from backend");
            return;
        };
        if chunk.complete {
            slot.expect.pop_front();
        }
        let target_ref = slot.link.target().clone();

        match expect {
            Expect::Discovery => self.discovery_chunk(&target_ref, &chunk),
            Expect::DefaultDb => self.default_db_chunk(target, &chunk),
            Expect::Client { forward } => self.client_chunk(target, chunk, forward),
            Expect::Replay => {
                if let Some(err) = &chunk.error {
                    warn!(
                        session_id = self.id,
                        backend = target,
                        code = err.error_code,
                        error = %err.error_message,
                        "Replayed session command failed"
                    );
                }
            }
        }
        self.step(now);
    }

    pub fn on_backend_failed(&mut self, target: &str, error: &str, now: Instant) {
        let Some(slot) = self.links.remove(target) else {
            return;
        };
        if self.last_target.as_deref() == Some(target) {
            self.last_target = None;
        }
        if self.phase == Phase::Failed {
            return;
        }

        let owed = self.upload.as_deref() == Some(target)
            || slot
                .expect
                .iter()
                .any(|e| matches!(e, Expect::Client { forward: true } | Expect::DefaultDb));
        if owed {
            error!(session_id = self.id, backend = target, error, "Backend failed while its reply was awaited");
            self.fail(SessionFailure::backend_lost(target));
            return;
        }

        warn!(session_id = self.id, backend = target, error, "Backend left the session");
        if slot.expect.contains(&Expect::Discovery) {
            if let Some(discovery) = self.discovery.as_mut() {
                discovery.exclude(target);
            }
        }
        if slot.expect.contains(&Expect::Client { forward: false }) {
            self.complete_reply(target);
        }
        self.step(now);
    }

    pub fn on_timer(&mut self, now: Instant) {
        self.step(now);
    }

    /// Add a backend that became usable after the session started. The
    /// session command history is replayed on it before anything else.
    pub fn attach_backend(&mut self, link: Box<dyn BackendLink>) {
        let name = link.target().name().to_string();
        if self.phase == Phase::Failed || self.links.contains_key(&name) {
            return;
        }

        let mut slot = LinkSlot {
            link,
            expect: VecDeque::new(),
        };
        for packet in self.history.commands() {
            let reply = ClientCommand::parse(&packet.payload).reply_kind();
            if !slot.link.write(Request::command(packet.clone(), reply)) {
                warn!(session_id = self.id, backend = %name, "Backend link closed during replay");
                return;
            }
            if reply != ReplyKind::None {
                slot.expect.push_back(Expect::Replay);
            }
        }
        if let Some(db) = &self.current_db {
            let hosts_db = self
                .shard
                .locations_of(&TableKey::schema(db))
                .iter()
                .any(|t| t.name() == name);
            if hosts_db {
                if !slot
                    .link
                    .write(Request::command(Packet::init_db(db), ReplyKind::Result))
                {
                    return;
                }
                slot.expect.push_back(Expect::Replay);
            }
        }

        info!(
            session_id = self.id,
            backend = %name,
            replayed = self.history.len(),
            mapped = self.shard.contains_target(slot.link.target()),
            "Backend joined session"
        );
        self.links.insert(name, slot);
    }

    /// Drop idle links to backends that are no longer usable
    pub fn detach_unusable(&mut self) -> Vec<String> {
        let idle: Vec<String> = self
            .links
            .iter()
            .filter(|(name, slot)| {
                !slot.link.target().is_usable()
                    && slot.expect.is_empty()
                    && self.upload.as_deref() != Some(name.as_str())
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &idle {
            info!(session_id = self.id, backend = %name, "Detached unusable backend");
            self.drop_link(name);
        }
        idle
    }

    fn step(&mut self, now: Instant) {
        loop {
            let next = match self.phase {
                Phase::AwaitingShard => self.await_shard(now),
                Phase::MappingInProgress => self.finish_mapping(),
                Phase::SelectingDefaultDatabase => self.select_default_database(),
                Phase::Ready => self.route_queued(),
                Phase::Failed => None,
            };
            match next {
                Some(next) if next != self.phase => {
                    debug!(
                        session_id = self.id,
                        from = self.phase.as_str(),
                        to = next.as_str(),
                        "Session phase change"
                    );
                    self.phase = next;
                }
                _ => break,
            }
        }
    }

    fn await_shard(&mut self, now: Instant) -> Option<Phase> {
        if let Some(at) = self.retry_at {
            if now < at {
                return None;
            }
            self.retry_at = None;
        }

        let service = Arc::clone(&self.service);
        let cache = &service.cache;

        if !self.force_refresh {
            if let Some(shard) = cache.get(&self.user, service.refresh_interval) {
                return Some(self.use_shard(&shard, "cache"));
            }
        }

        if cache.start_update(&self.user) {
            self.owns_update = true;
            self.force_refresh = false;
            self.start_discovery();
            return Some(Phase::MappingInProgress);
        }

        let fallback = if self.force_refresh {
            cache
                .get(&self.user, Duration::MAX)
                .filter(|shard| shard.newer_than(&self.shard))
        } else {
            cache.get_stale(&self.user, service.refresh_interval, service.max_staleness)
        };
        if let Some(shard) = fallback {
            self.force_refresh = false;
            return Some(self.use_shard(&shard, "stale cache"));
        }

        debug!(
            session_id = self.id,
            user = %self.user,
            "Shard map is being discovered by another session, retrying later"
        );
        self.retry_at = Some(now + service.refresh_retry);
        None
    }

    fn use_shard(&mut self, shard: &Shard, source: &'static str) -> Phase {
        self.shard.adopt_locations(shard);
        debug!(session_id = self.id, source, "Using shared shard map");
        self.after_shard()
    }

    fn after_shard(&self) -> Phase {
        if self.connect_db.is_some() {
            Phase::SelectingDefaultDatabase
        } else {
            Phase::Ready
        }
    }

    fn start_discovery(&mut self) {
        let mut discovery = Discovery::new(&self.user, self.links.keys());
        let mut broken = Vec::new();
        for (name, slot) in self.links.iter_mut() {
            if slot.link.write(Discovery::request()) {
                slot.expect.push_back(Expect::Discovery);
            } else {
                broken.push(name.clone());
            }
        }
        for name in broken {
            discovery.exclude(&name);
            self.drop_link(&name);
        }

        info!(
            session_id = self.id,
            user = %self.user,
            backends = self.links.len(),
            "Starting shard discovery"
        );
        self.discovery = Some(discovery);
    }

    fn discovery_chunk(&mut self, target: &TargetRef, chunk: &ReplyChunk) {
        let Some(discovery) = self.discovery.as_mut() else {
            return;
        };
        if !discovery.on_chunk(target, chunk, &self.service.ignore) {
            return;
        }
        let duplicates = discovery.shard().duplicates(&self.service.ignore);
        if !duplicates.is_empty() {
            self.fail(SessionFailure::duplicate_tables(&duplicates));
        }
    }

    fn finish_mapping(&mut self) -> Option<Phase> {
        match &self.discovery {
            Some(discovery) if discovery.is_complete() => {}
            Some(_) => return None,
            None => return Some(Phase::AwaitingShard),
        }
        let discovery = self.discovery.take()?;

        metrics().record_discovery(discovery.elapsed());
        let excluded = discovery.excluded().len();
        let fresh = discovery.into_shard();
        self.service.cache.update(fresh.snapshot(), &self.user);
        self.owns_update = false;
        self.shard.adopt_locations(&fresh);

        info!(
            session_id = self.id,
            user = %self.user,
            entries = fresh.entries().count(),
            excluded,
            "Shard map discovered"
        );
        Some(self.after_shard())
    }

    fn select_default_database(&mut self) -> Option<Phase> {
        let Some(db) = self.connect_db.clone() else {
            return Some(Phase::Ready);
        };

        if let Some(waiting) = &self.default_db_waiting {
            if !waiting.is_empty() {
                return None;
            }
            info!(session_id = self.id, database = %db, "Default database selected");
            self.current_db = Some(db);
            self.connect_db = None;
            self.default_db_waiting = None;
            return Some(Phase::Ready);
        }

        let hosts = self.hosts_of(&db);
        if hosts.is_empty() {
            if self.try_refresh() {
                return Some(Phase::AwaitingShard);
            }
            return self.fail(SessionFailure::unknown_database(&db));
        }

        let mut waiting = BTreeSet::new();
        for name in hosts {
            let request = Request::command(Packet::init_db(&db), ReplyKind::Result);
            if !self.write(&name, request, Some(Expect::DefaultDb)) {
                return self.fail(SessionFailure::backend_lost(&name));
            }
            waiting.insert(name);
        }
        self.default_db_waiting = Some(waiting);
        None
    }

    fn default_db_chunk(&mut self, target: &str, chunk: &ReplyChunk) {
        if !chunk.complete {
            return;
        }
        if let Some(err) = &chunk.error {
            warn!(
                session_id = self.id,
                backend = target,
                code = err.error_code,
                error = %err.error_message,
                "Backend refused the default database"
            );
            self.fail(SessionFailure::from_backend(err));
            return;
        }
        if let Some(waiting) = self.default_db_waiting.as_mut() {
            waiting.remove(target);
        }
    }

    fn route_queued(&mut self) -> Option<Phase> {
        while self.pending.is_none() && self.upload.is_none() {
            let Some(packet) = self.queue.pop_front() else {
                break;
            };
            match self.dispatch(packet) {
                Ok(Dispatched::Done) => {}
                Ok(Dispatched::Refresh(packet)) => {
                    self.queue.push_front(packet);
                    return Some(Phase::AwaitingShard);
                }
                Err(failure) => return self.fail(failure),
            }
        }
        None
    }

    #[instrument(level = "debug", skip_all, fields(session_id = self.id))]
    fn dispatch(&mut self, packet: Packet) -> Result<Dispatched, SessionFailure> {
        let command = ClientCommand::parse(&packet.payload);
        if command == ClientCommand::Quit {
            return Ok(Dispatched::Done);
        }

        let analysis = command.sql().and_then(|sql| match self.analyzer.analyze(sql) {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                debug!(error = %e, "Statement not classified");
                None
            }
        });
        let decision = decide(&command, analysis.as_ref(), self.current_db.as_deref());
        debug!(
            command = command.name(),
            sql_preview = %command.sql().map(|s| truncate_sql(s, 100)).unwrap_or_default(),
            decision = ?decision,
            "Routing statement"
        );

        match decision {
            RouteDecision::ShowSchemas => {
                let mut rs = TextResultSet::new(["Database"]);
                for schema in self.shard.schemas() {
                    rs.push_row([schema]);
                }
                self.reply_synthetic(&rs);
            }
            RouteDecision::ShowShards => {
                let mut rs = TextResultSet::new(["Database", "Server"]);
                for (key, target) in self.shard.entries() {
                    rs.push_row([key.to_string(), target.name().to_string()]);
                }
                self.reply_synthetic(&rs);
            }
            RouteDecision::Broadcast { record } => self.broadcast(packet, &command, record)?,
            RouteDecision::DatabaseSwitch(db) => {
                return self.switch_database(packet, &command, &db);
            }
            RouteDecision::TableQuery(tables) => {
                let target = self.resolve(&tables)?;
                self.forward(&target, packet, &command, Effect::None)?;
                metrics().record_route("single");
            }
            RouteDecision::AnyTarget => {
                let target = self.any_target().ok_or_else(SessionFailure::no_target)?;
                self.forward(&target, packet, &command, Effect::None)?;
                metrics().record_route("single");
            }
            RouteDecision::PreparedStmtOp(op) => self.prepared(op, packet, &command)?,
        }
        Ok(Dispatched::Done)
    }

    fn reply_synthetic(&mut self, rs: &TextResultSet) {
        self.outbox.extend(rs.encode());
        metrics().record_route("synthetic");
    }

    /// Backend for a statement touching `tables`
    fn resolve(&self, tables: &[TableKey]) -> Result<String, SessionFailure> {
        let mut keys: Vec<TableKey> = tables
            .iter()
            .filter(|key| self.shard.has_schema(key.schema_name()))
            .cloned()
            .collect();
        if keys.is_empty() {
            match self.current_db.as_deref() {
                Some(db) if self.shard.has_schema(db) => keys.push(TableKey::schema(db)),
                _ => return self.any_target().ok_or_else(SessionFailure::no_target),
            }
        }

        let candidates: BTreeSet<TargetRef> = self
            .shard
            .locations_for(&keys)
            .into_iter()
            .filter(|t| self.links.contains_key(t.name()))
            .collect();
        if candidates.is_empty() {
            debug!(session_id = self.id, tables = ?keys, "No backend hosts every table");
            return Err(SessionFailure::no_target());
        }

        let mut preferred: Vec<&TargetRef> = candidates.iter().collect();
        let in_use: Vec<TargetRef> = self.links.values().map(|s| s.link.target().clone()).collect();
        if self.shard.all_on_same_node_set(&candidates, &in_use) {
            if let Some(db) = self.current_db.as_deref() {
                let db_hosts = self.shard.locations_of(&TableKey::schema(db));
                let hosting: Vec<&TargetRef> = preferred
                    .iter()
                    .copied()
                    .filter(|t| db_hosts.contains(*t))
                    .collect();
                if !hosting.is_empty() {
                    preferred = hosting;
                }
            }
        }

        let chosen = self
            .last_target
            .as_deref()
            .and_then(|last| preferred.iter().find(|t| t.name() == last))
            .unwrap_or(&preferred[0]);
        Ok(chosen.name().to_string())
    }

    /// The backend used last while it is still linked, else the first one
    fn any_target(&self) -> Option<String> {
        self.last_target
            .as_ref()
            .filter(|t| self.links.contains_key(*t))
            .or_else(|| self.links.keys().next())
            .cloned()
    }

    fn hosts_of(&self, db: &str) -> Vec<String> {
        self.shard
            .locations_of(&TableKey::schema(db))
            .iter()
            .map(|t| t.name().to_string())
            .filter(|name| self.links.contains_key(name))
            .collect()
    }

    fn try_refresh(&mut self) -> bool {
        if !self.service.refresh_databases || self.refreshed {
            return false;
        }
        let age = SystemTime::now()
            .duration_since(self.shard.last_updated())
            .unwrap_or_default();
        if age <= self.service.refresh_retry {
            return false;
        }
        info!(session_id = self.id, "Database missing from shard map, rediscovering");
        self.refreshed = true;
        self.force_refresh = true;
        true
    }

    fn write(&mut self, name: &str, request: Request, expect: Option<Expect>) -> bool {
        let Some(slot) = self.links.get_mut(name) else {
            return false;
        };
        if !slot.link.write(request) {
            return false;
        }
        if let Some(expect) = expect {
            slot.expect.push_back(expect);
        }
        true
    }

    fn forward(
        &mut self,
        target: &str,
        packet: Packet,
        command: &ClientCommand,
        effect: Effect,
    ) -> Result<(), SessionFailure> {
        let reply = command.reply_kind();
        let expect = (reply != ReplyKind::None).then_some(Expect::Client { forward: true });
        if !self.write(target, Request::command(packet, reply), expect) {
            return Err(SessionFailure::backend_lost(target));
        }
        trace!(session_id = self.id, backend = target, "Forwarded request");
        self.last_target = Some(target.to_string());
        if expect.is_some() {
            self.pending = Some(PendingReply {
                waiting: BTreeSet::from([target.to_string()]),
                replier: target.to_string(),
                effect,
                failed: false,
            });
        }
        Ok(())
    }

    fn broadcast(
        &mut self,
        packet: Packet,
        command: &ClientCommand,
        record: bool,
    ) -> Result<(), SessionFailure> {
        let replier = self.any_target().ok_or_else(SessionFailure::no_target)?;
        if record {
            if let Err(limit) = self.history.record(&packet) {
                metrics().record_history_exceeded();
                return Err(SessionFailure::history_exceeded(limit));
            }
            metrics().record_session_command(self.history.len());
        }

        let reply = command.reply_kind();
        let waiting = self.send_to_all(self.links.keys().cloned().collect(), &replier, &packet, reply)?;
        metrics().record_route("broadcast");
        self.last_target = Some(replier.clone());
        if reply != ReplyKind::None {
            self.pending = Some(PendingReply {
                waiting,
                replier,
                effect: Effect::None,
                failed: false,
            });
        }
        Ok(())
    }

    /// Send to several backends; only `replier`'s response is forwarded
    fn send_to_all(
        &mut self,
        names: Vec<String>,
        replier: &str,
        packet: &Packet,
        reply: ReplyKind,
    ) -> Result<BTreeSet<String>, SessionFailure> {
        let mut waiting = BTreeSet::new();
        for name in names {
            let forward = name == replier;
            let expect = (reply != ReplyKind::None).then_some(Expect::Client { forward });
            if self.write(&name, Request::command(packet.clone(), reply), expect) {
                waiting.insert(name);
            } else if forward {
                return Err(SessionFailure::backend_lost(&name));
            } else {
                warn!(session_id = self.id, backend = %name, "Backend link closed, dropping it");
                self.drop_link(&name);
            }
        }
        Ok(waiting)
    }

    fn switch_database(
        &mut self,
        packet: Packet,
        command: &ClientCommand,
        db: &str,
    ) -> Result<Dispatched, SessionFailure> {
        let hosts = self.hosts_of(db);
        let Some(first) = hosts.first().cloned() else {
            if self.try_refresh() {
                return Ok(Dispatched::Refresh(packet));
            }
            return Err(SessionFailure::unknown_database(db));
        };

        let replier = self
            .last_target
            .clone()
            .filter(|t| hosts.contains(t))
            .unwrap_or(first);
        let waiting = self.send_to_all(hosts, &replier, &packet, command.reply_kind())?;
        metrics().record_route("database");
        self.last_target = Some(replier.clone());
        self.pending = Some(PendingReply {
            waiting,
            replier,
            effect: Effect::SetDatabase(db.to_string()),
            failed: false,
        });
        Ok(Dispatched::Done)
    }

    fn prepared(
        &mut self,
        op: PreparedOp,
        packet: Packet,
        command: &ClientCommand,
    ) -> Result<(), SessionFailure> {
        match op {
            PreparedOp::Prepare {
                name: Some(name),
                tables,
            } => {
                let target = self.resolve(&tables)?;
                let target_ref = self.target_ref(&target)?;
                self.shard.set_named_statement(&name, target_ref);
                self.forward(&target, packet, command, Effect::None)?;
                metrics().record_route("single");
            }
            PreparedOp::Prepare { name: None, tables } => {
                let target = self.resolve(&tables)?;
                self.forward(
                    &target,
                    packet,
                    command,
                    Effect::BinaryPrepare { assigned: None },
                )?;
                metrics().record_route("single");
            }
            PreparedOp::Execute(name) => {
                let target = self.statement_target(self.shard.named_statement(&name).cloned())?;
                self.forward(&target, packet, command, Effect::None)?;
                metrics().record_route("affinity");
            }
            PreparedOp::Deallocate(name) => {
                let affinity = self.shard.remove_named_statement(&name);
                let target = self.statement_target(affinity)?;
                self.forward(&target, packet, command, Effect::None)?;
                metrics().record_route("affinity");
            }
            PreparedOp::Binary(id) => {
                let Some(target) = self
                    .shard
                    .numbered_statement(u64::from(id))
                    .map(|t| t.name().to_string())
                else {
                    if command.expects_reply() {
                        let err = ErrPacket::new(
                            1243,
                            "HY000",
                            &format!(
                                "Unknown prepared statement handler ({id}) given to {}",
                                command.name()
                            ),
                        );
                        self.outbox
                            .push(err.encode(1, capabilities::DEFAULT_CAPABILITIES));
                    }
                    return Ok(());
                };
                let backend_id = self.binary_ids.get(&id).copied().unwrap_or(id);
                if matches!(command, ClientCommand::StmtClose(_)) {
                    self.shard.remove_numbered_statement(u64::from(id));
                    self.binary_ids.remove(&id);
                }
                self.forward(&target, packet.with_statement_id(backend_id), command, Effect::None)?;
                metrics().record_route("affinity");
            }
        }
        Ok(())
    }

    fn target_ref(&self, name: &str) -> Result<TargetRef, SessionFailure> {
        self.links
            .get(name)
            .map(|slot| slot.link.target().clone())
            .ok_or_else(|| SessionFailure::backend_lost(name))
    }

    fn statement_target(&self, affinity: Option<TargetRef>) -> Result<String, SessionFailure> {
        match affinity {
            Some(target) if self.links.contains_key(target.name()) => Ok(target.name().to_string()),
            Some(target) => Err(SessionFailure::backend_lost(target.name())),
            None => self.any_target().ok_or_else(SessionFailure::no_target),
        }
    }

    fn client_chunk(&mut self, target: &str, chunk: ReplyChunk, forward: bool) {
        let complete = chunk.complete;
        if forward {
            let mut packets = chunk.packets;
            if let Some(pending) = self.pending.as_mut() {
                if let (Effect::BinaryPrepare { assigned }, Some(backend_id)) =
                    (&mut pending.effect, chunk.statement_id)
                {
                    if assigned.is_none() {
                        let client_id = self.next_statement_id;
                        self.next_statement_id = self.next_statement_id.wrapping_add(1).max(1);
                        *assigned = Some(client_id);
                        self.binary_ids.insert(client_id, backend_id);
                        if let Some(slot) = self.links.get(target) {
                            self.shard
                                .set_numbered_statement(u64::from(client_id), slot.link.target().clone());
                        }
                        if let Some(first) = packets.first_mut() {
                            if first.first_byte() == Some(0x00) {
                                *first = first.with_statement_id(client_id);
                            }
                        }
                        debug!(
                            session_id = self.id,
                            backend = target,
                            client_id,
                            backend_id,
                            "Prepared statement registered"
                        );
                    }
                }
                if complete && chunk.error.is_some() {
                    pending.failed = true;
                }
            }
            if chunk.local_infile {
                self.upload = Some(target.to_string());
            }
            self.outbox.extend(packets);
        }
        if complete {
            self.complete_reply(target);
        }
    }

    fn complete_reply(&mut self, target: &str) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        pending.waiting.remove(target);
        if !pending.waiting.is_empty() {
            return;
        }
        let Some(done) = self.pending.take() else {
            return;
        };
        if let Effect::SetDatabase(db) = done.effect {
            if done.failed {
                return;
            }
            info!(
                session_id = self.id,
                database = %db,
                replier = %done.replier,
                "Default database changed"
            );
            self.current_db = Some(db);
            self.refreshed = false;
        }
    }

    fn drop_link(&mut self, name: &str) {
        self.links.remove(name);
        if self.last_target.as_deref() == Some(name) {
            self.last_target = None;
        }
    }

    fn fail(&mut self, failure: SessionFailure) -> Option<Phase> {
        let failure = if self.service.debug {
            failure.with_session_id(self.id)
        } else {
            failure
        };
        error!(
            session_id = self.id,
            user = %self.user,
            code = failure.code,
            error = %failure.message,
            "Session failed"
        );
        metrics().record_session_failure(failure.reason);

        self.release_update();
        self.discovery = None;
        self.queue.clear();
        self.pending = None;
        self.upload = None;
        self.retry_at = None;
        self.outbox.push(failure.to_packet(1));
        self.failure = Some(failure);
        self.phase = Phase::Failed;
        Some(Phase::Failed)
    }

    fn release_update(&mut self) {
        if self.owns_update {
            self.service.cache.cancel_update(&self.user);
            self.owns_update = false;
        }
    }
}

impl Drop for RoutingSession {
    fn drop(&mut self) {
        self.release_update();
    }
}
