//! One logical connection per backend, driven by its own task.
//!
//! The session writes [`Request`]s and gets every response back as a series
//! of [`ReplyChunk`]s on a shared event channel. The last chunk of a response
//! has `complete` set.

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::protocol::{
    capabilities, Command, ErrPacket, Packet, PacketCodec, ReplyKind, ReplyTracker,
};

use super::{BackendConnection, TargetRef};

/// Packets handed to the session in one chunk at most
const MAX_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A command and the shape of the response it produces
    Command { packet: Packet, reply: ReplyKind },
    /// Client file contents for a pending `LOAD DATA LOCAL INFILE`; an
    /// empty payload ends the upload
    Data(Packet),
}

impl Request {
    pub fn command(packet: Packet, reply: ReplyKind) -> Self {
        Request::Command { packet, reply }
    }
}

/// Part of one response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyChunk {
    pub packets: Vec<Packet>,
    pub complete: bool,
    pub error: Option<ErrPacket>,
    /// Set once a COM_STMT_PREPARE response carried its statement id
    pub statement_id: Option<u32>,
    /// The backend is waiting for `LOAD DATA LOCAL INFILE` contents
    pub local_infile: bool,
}

#[derive(Debug)]
pub enum BackendEvent {
    Reply { target: String, chunk: ReplyChunk },
    Failed { target: String, error: String },
}

/// Write side of a backend connection as seen by the routing engine
pub trait BackendLink: Send {
    fn target(&self) -> &TargetRef;

    /// Queue a request; false means the link is already broken
    fn write(&mut self, request: Request) -> bool;
}

/// [`BackendLink`] backed by a spawned tokio task
pub struct SpawnedLink {
    target: TargetRef,
    requests: mpsc::UnboundedSender<Request>,
}

impl SpawnedLink {
    /// Take over `conn`; responses and failures are reported on `events`.
    /// Dropping the link sends COM_QUIT once outstanding work is done.
    pub fn spawn(
        target: TargetRef,
        conn: BackendConnection,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task_target = target.clone();
        tokio::spawn(async move {
            let name = task_target.name().to_string();
            let deprecate_eof = conn.capabilities() & capabilities::CLIENT_DEPRECATE_EOF != 0;
            if let Err(error) = run_link(&name, conn.into_framed(), deprecate_eof, rx, &events).await {
                warn!(backend = %name, error = %error, "Backend link failed");
                let _ = events.send(BackendEvent::Failed {
                    target: name,
                    error,
                });
            }
        });
        Self {
            target,
            requests: tx,
        }
    }
}

impl BackendLink for SpawnedLink {
    fn target(&self) -> &TargetRef {
        &self.target
    }

    fn write(&mut self, request: Request) -> bool {
        self.requests.send(request).is_ok()
    }
}

type BackendStream = Framed<TcpStream, PacketCodec>;

async fn run_link(
    name: &str,
    mut framed: BackendStream,
    deprecate_eof: bool,
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: &mpsc::UnboundedSender<BackendEvent>,
) -> Result<(), String> {
    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => {
                    let _ = framed.send(Packet::command(Command::Quit, &[])).await;
                    debug!(backend = %name, "Backend link closed");
                    return Ok(());
                }
            },
            incoming = framed.next() => return Err(unexpected(incoming)),
            _ = events.closed() => return Ok(()),
        };

        match request {
            Request::Data(packet) => {
                framed.send(packet).await.map_err(|e| e.to_string())?;
            }
            Request::Command { packet, reply } => {
                trace!(backend = %name, command = ?packet.first_byte(), "Writing request");
                framed.send(packet).await.map_err(|e| e.to_string())?;
                if reply != ReplyKind::None {
                    let tracker = ReplyTracker::new(reply, deprecate_eof);
                    read_reply(name, &mut framed, tracker, &mut requests, events).await?;
                }
            }
        }
    }
}

async fn read_reply(
    name: &str,
    framed: &mut BackendStream,
    mut tracker: ReplyTracker,
    requests: &mut mpsc::UnboundedReceiver<Request>,
    events: &mpsc::UnboundedSender<BackendEvent>,
) -> Result<(), String> {
    loop {
        let first = tokio::select! {
            incoming = framed.next() => match incoming {
                Some(Ok(packet)) => packet,
                other => return Err(unexpected(other)),
            },
            _ = events.closed() => return Ok(()),
        };

        tracker.feed(&first.payload);
        let mut packets = vec![first];
        while !tracker.is_complete() && !tracker.awaiting_local_infile() && packets.len() < MAX_BATCH {
            match framed.next().now_or_never() {
                Some(Some(Ok(packet))) => {
                    tracker.feed(&packet.payload);
                    packets.push(packet);
                }
                Some(other) => return Err(unexpected(other)),
                None => break,
            }
        }

        let chunk = ReplyChunk {
            packets,
            complete: tracker.is_complete(),
            error: tracker.error().cloned(),
            statement_id: tracker.statement_id(),
            local_infile: tracker.awaiting_local_infile(),
        };
        let done = chunk.complete;
        let upload = chunk.local_infile;
        if events
            .send(BackendEvent::Reply {
                target: name.to_string(),
                chunk,
            })
            .is_err()
        {
            return Ok(());
        }
        if done {
            return Ok(());
        }
        if upload {
            forward_upload(framed, requests).await?;
        }
    }
}

/// Pass client file data through until the terminating empty packet
async fn forward_upload(
    framed: &mut BackendStream,
    requests: &mut mpsc::UnboundedReceiver<Request>,
) -> Result<(), String> {
    while let Some(request) = requests.recv().await {
        match request {
            Request::Data(packet) => {
                let last = packet.payload.is_empty();
                framed.send(packet).await.map_err(|e| e.to_string())?;
                if last {
                    return Ok(());
                }
            }
            Request::Command { .. } => {
                return Err("command received during LOCAL INFILE upload".to_string());
            }
        }
    }
    Err("link closed during LOCAL INFILE upload".to_string())
}

fn unexpected(incoming: Option<Result<Packet, std::io::Error>>) -> String {
    match incoming {
        None => "connection closed by server".to_string(),
        Some(Err(e)) => e.to_string(),
        Some(Ok(packet)) => match ErrPacket::parse(&packet.payload) {
            Some(err) => err.error_message,
            None => format!("unexpected packet from server: {:?}", packet.first_byte()),
        },
    }
}
