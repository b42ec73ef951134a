//! Client sessions.
//!
//! [`Session`] does the client handshake, opens one backend link per usable
//! target and then drives a [`RoutingSession`] from client packets, backend
//! events and timers.

mod discovery;
mod history;
mod routing;
mod state;

pub use routing::RoutingSession;
pub use state::{Phase, SessionFailure};

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendConnection, BackendEvent, BackendLink, SpawnedLink, TargetRef, TargetSet};
use crate::config::UserConfig;
use crate::metrics::metrics;
use crate::protocol::handshake::NATIVE_PASSWORD_PLUGIN;
use crate::protocol::{
    auth_switch_request, verify_auth_response, Command, ErrPacket, HandshakeResponse,
    InitialHandshake, OkPacket, PacketCodec,
};
use crate::router::RouterService;

/// Upper bound for one backend login
const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest interval between two checks for backends to join or drop
const MIN_REJOIN_INTERVAL: Duration = Duration::from_millis(100);

/// Pause before joining a backend again after a failed login
const JOIN_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// What every session of a listener shares
pub struct SessionContext {
    pub service: Arc<RouterService>,
    pub targets: Arc<TargetSet>,
    pub users: Vec<UserConfig>,
    pub server_version: String,
}

/// Handle a single client session
pub struct Session {
    pub id: u32,
    ctx: Arc<SessionContext>,
}

type ClientStream<C> = Framed<C, PacketCodec>;

impl Session {
    pub fn new(id: u32, ctx: Arc<SessionContext>) -> Self {
        Self { id, ctx }
    }

    /// Run the session until the client leaves or the session fails
    pub async fn run<S>(self, client_stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        metrics().record_session_started();
        let result = self.serve(client_stream).await;
        metrics().record_session_ended(started.elapsed());
        result
    }

    #[instrument(skip_all, fields(session_id = self.id))]
    async fn serve<S>(&self, client_stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, PacketCodec);

        let handshake = InitialHandshake::new(self.id, &self.ctx.server_version);
        client.send(handshake.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;
        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("Invalid handshake response".into()))?;
        let caps = response.capability_flags;

        debug!(
            username = %response.username,
            database = ?response.database,
            plugin = %response.auth_plugin_name,
            "Received handshake response"
        );

        // Clients defaulting to another plugin are switched to native password
        let mut seq = response_packet.sequence_id.wrapping_add(1);
        let mut auth_response = response.auth_response.clone();
        if response.auth_plugin_name != NATIVE_PASSWORD_PLUGIN {
            client
                .send(auth_switch_request(seq, &handshake.scramble))
                .await?;
            let switched = client
                .next()
                .await
                .ok_or(SessionError::ClientDisconnected)??;
            auth_response = switched.payload.to_vec();
            seq = switched.sequence_id.wrapping_add(1);
        }

        let Some(user) = self.authenticate(&response.username, &handshake.scramble, &auth_response)
        else {
            let message = format!("Access denied for user '{}'", response.username);
            warn!(username = %response.username, "Client authentication failed");
            let err = ErrPacket::new(1045, "28000", &message);
            client.send(err.encode(seq, caps)).await?;
            return Err(SessionError::Auth(message));
        };

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let links = self.connect_all(user, &events_tx).await;
        if links.is_empty() {
            let err = ErrPacket::new(2003, "HY000", "Can't connect to any backend server");
            client.send(err.encode(seq, caps)).await?;
            return Err(SessionError::BackendConnect(
                "no backend server reachable".into(),
            ));
        }

        client.send(OkPacket::new().encode(seq, caps)).await?;
        info!(
            username = %user.name,
            database = ?response.database,
            backends = links.len(),
            "Client authenticated"
        );

        let mut routing = RoutingSession::new(
            self.id,
            &user.name,
            response.database.clone(),
            Arc::clone(&self.ctx.service),
            links,
        );
        routing.start(Instant::now());

        self.command_loop(&mut client, &mut routing, &mut events, &events_tx, user)
            .await
    }

    fn authenticate(&self, username: &str, scramble: &[u8], response: &[u8]) -> Option<&UserConfig> {
        let user = self.ctx.users.iter().find(|u| u.name == username)?;
        verify_auth_response(&user.password, scramble, response).then_some(user)
    }

    /// Links to every usable target; targets that refuse the login are skipped
    async fn connect_all(
        &self,
        user: &UserConfig,
        events: &mpsc::UnboundedSender<BackendEvent>,
    ) -> Vec<Box<dyn BackendLink>> {
        let attempts = self
            .ctx
            .targets
            .usable()
            .map(|target| connect_link(target.clone(), user, events.clone()));
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn command_loop<C>(
        &self,
        client: &mut ClientStream<C>,
        routing: &mut RoutingSession,
        events: &mut mpsc::UnboundedReceiver<BackendEvent>,
        events_tx: &mpsc::UnboundedSender<BackendEvent>,
        user: &UserConfig,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut rejoin =
            tokio::time::interval(self.ctx.service.refresh_retry.max(MIN_REJOIN_INTERVAL));
        rejoin.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        rejoin.tick().await;

        let (joins_tx, mut joins) = mpsc::unbounded_channel();
        let mut attempts = JoinAttempts::default();

        loop {
            flush(client, routing).await?;
            if let Some(failure) = routing.failure() {
                return Err(SessionError::Routing(failure.clone()));
            }

            let deadline = routing.retry_deadline();
            tokio::select! {
                incoming = client.next() => {
                    let packet = match incoming {
                        Some(Ok(packet)) => packet,
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            info!(
                                session_id = routing.id(),
                                database = ?routing.current_database(),
                                "Client disconnected"
                            );
                            return Ok(());
                        }
                    };
                    if !routing.is_uploading() && packet.first_byte() == Some(Command::Quit as u8) {
                        info!(session_id = self.id, "Client sent QUIT");
                        return Ok(());
                    }
                    routing.on_client_packet(packet, Instant::now());
                }
                Some(event) = events.recv() => match event {
                    BackendEvent::Reply { target, chunk } => {
                        routing.on_backend_reply(&target, chunk, Instant::now());
                    }
                    BackendEvent::Failed { target, error } => {
                        routing.on_backend_failed(&target, &error, Instant::now());
                    }
                },
                _ = wait_until(deadline) => routing.on_timer(Instant::now()),
                Some(joined) = joins.recv() => {
                    let JoinOutcome { target, link } = joined;
                    attempts.finish(&target, link.is_some(), Instant::now());
                    if let Some(link) = link {
                        routing.attach_backend(link);
                    }
                }
                _ = rejoin.tick() => {
                    self.rejoin(routing, user, &mut attempts, events_tx, &joins_tx);
                }
            }
        }
    }

    /// Drop links to unusable targets and start joining the usable ones
    /// the session lacks. Logins run in their own tasks and come back as
    /// [`JoinOutcome`]s.
    fn rejoin(
        &self,
        routing: &mut RoutingSession,
        user: &UserConfig,
        attempts: &mut JoinAttempts,
        events: &mpsc::UnboundedSender<BackendEvent>,
        joins: &mpsc::UnboundedSender<JoinOutcome>,
    ) {
        routing.detach_unusable();
        if routing.phase() == Phase::Failed {
            return;
        }

        let now = Instant::now();
        for target in self.ctx.targets.usable() {
            if routing.has_link(target.name()) || !attempts.begin(target.name(), now) {
                continue;
            }
            debug!(session_id = self.id, backend = %target, "Joining backend");
            spawn_join(target.clone(), user.clone(), events.clone(), joins.clone());
        }
    }
}

/// Result of one background login to a backend the session lacked
struct JoinOutcome {
    target: String,
    link: Option<Box<dyn BackendLink>>,
}

fn spawn_join(
    target: TargetRef,
    user: UserConfig,
    events: mpsc::UnboundedSender<BackendEvent>,
    joins: mpsc::UnboundedSender<JoinOutcome>,
) {
    tokio::spawn(async move {
        let name = target.name().to_string();
        let link = connect_link(target, &user, events).await;
        // A closed channel means the session is gone; the link is dropped
        let _ = joins.send(JoinOutcome { target: name, link });
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Connecting,
    FailedAt(Instant),
}

/// Join attempts per target. At most one login runs per target, and a
/// target that refused one waits [`JOIN_RETRY_BACKOFF`] before the next.
#[derive(Debug, Default)]
struct JoinAttempts {
    attempts: HashMap<String, JoinState>,
}

impl JoinAttempts {
    /// Returns true when a login to `name` should start now
    fn begin(&mut self, name: &str, now: Instant) -> bool {
        match self.attempts.get(name) {
            Some(JoinState::Connecting) => false,
            Some(JoinState::FailedAt(at)) if now.duration_since(*at) < JOIN_RETRY_BACKOFF => false,
            _ => {
                self.attempts.insert(name.to_string(), JoinState::Connecting);
                true
            }
        }
    }

    fn finish(&mut self, name: &str, joined: bool, now: Instant) {
        if joined {
            self.attempts.remove(name);
        } else {
            self.attempts.insert(name.to_string(), JoinState::FailedAt(now));
        }
    }
}

async fn connect_link(
    target: TargetRef,
    user: &UserConfig,
    events: mpsc::UnboundedSender<BackendEvent>,
) -> Option<Box<dyn BackendLink>> {
    let login = BackendConnection::connect(&target, &user.name, &user.password, None);
    match tokio::time::timeout(BACKEND_CONNECT_TIMEOUT, login).await {
        Ok(Ok(conn)) => {
            debug!(backend = %target, connection_id = conn.connection_id(), "Backend link opened");
            let link: Box<dyn BackendLink> = Box::new(SpawnedLink::spawn(target, conn, events));
            Some(link)
        }
        Ok(Err(e)) => {
            warn!(backend = %target, error = %e, "Backend login failed, skipping backend");
            None
        }
        Err(_) => {
            warn!(backend = %target, "Backend login timed out, skipping backend");
            None
        }
    }
}

async fn flush<C>(client: &mut ClientStream<C>, routing: &mut RoutingSession) -> Result<(), SessionError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let output = routing.take_output();
    if output.is_empty() {
        return Ok(());
    }
    for packet in output {
        client.feed(packet).await?;
    }
    client.flush().await?;
    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Backend connection failed: {0}")]
    BackendConnect(String),

    #[error("Session closed: {0}")]
    Routing(SessionFailure),
}

/// Truncate SQL for logging (avoid huge log entries)
fn truncate_sql(sql: &str, max_len: usize) -> Cow<'_, str> {
    if sql.len() <= max_len {
        return Cow::Borrowed(sql);
    }
    let mut end = max_len;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}...", &sql[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_sql() {
        assert_eq!(truncate_sql("SELECT 1", 100), "SELECT 1");
        assert_eq!(truncate_sql("SELECT * FROM orders", 6), "SELECT...");
        // Never splits a multi-byte character
        assert_eq!(truncate_sql("SELECT 'héllo'", 10), "SELECT 'h...");
    }

    #[test]
    fn test_one_join_attempt_per_target() {
        let mut attempts = JoinAttempts::default();
        let now = Instant::now();
        assert!(attempts.begin("b1", now));
        assert!(!attempts.begin("b1", now));
        assert!(attempts.begin("b2", now));

        attempts.finish("b1", true, now);
        assert!(attempts.begin("b1", now));
    }

    #[test]
    fn test_refused_join_backs_off() {
        let mut attempts = JoinAttempts::default();
        let now = Instant::now();
        assert!(attempts.begin("b1", now));
        attempts.finish("b1", false, now);

        assert!(!attempts.begin("b1", now + Duration::from_secs(1)));
        assert!(attempts.begin("b1", now + JOIN_RETRY_BACKOFF));
    }

    #[tokio::test]
    async fn test_join_runs_in_background() {
        // Accepts the TCP connection but never sends a handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let target = Arc::new(crate::backend::Target::new("b1", addr.to_string()));
        let user = UserConfig {
            name: "app".to_string(),
            password: "secret".to_string(),
        };
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (joins, mut joins_rx) = mpsc::unbounded_channel();

        let start = Instant::now();
        spawn_join(target, user, events, joins);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(joins_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_until_deadline() {
        let start = Instant::now();
        wait_until(Some(start + Duration::from_millis(10))).await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
