use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::protocol::handshake::NATIVE_PASSWORD_PLUGIN;
use crate::protocol::{
    capabilities, compute_auth_response, is_err_packet, is_ok_packet, parse_auth_switch, Command,
    ErrPacket, HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};

use super::Target;

/// A logged-in connection to one backend server
pub struct BackendConnection {
    framed: Framed<TcpStream, PacketCodec>,
    capabilities: u32,
    connection_id: u32,
}

impl BackendConnection {
    /// Connect to `target` and log in with the given credentials
    pub async fn connect(
        target: &Target,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Result<Self, ConnectionError> {
        debug!(backend = %target, addr = %target.addr(), "Connecting to backend");

        let stream = TcpStream::connect(target.addr()).await.map_err(|e| {
            error!(backend = %target, error = %e, "Failed to connect to backend");
            ConnectionError::Connect(e.to_string())
        })?;
        stream.set_nodelay(true).ok();

        let mut framed = Framed::new(stream, PacketCodec);

        let handshake_packet = recv_packet(&mut framed).await?;
        if is_err_packet(&handshake_packet.payload) {
            return Err(ConnectionError::Auth(err_message(&handshake_packet)));
        }
        let handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            backend = %target,
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            "Received backend handshake"
        );

        let mut caps = capabilities::DEFAULT_CAPABILITIES & handshake.capability_flags;
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        } else {
            caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21, // utf8_general_ci
            username: user.to_string(),
            auth_response: compute_auth_response(password, &handshake.scramble),
            database: database.map(str::to_string),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        framed
            .send(response.encode(handshake_packet.sequence_id.wrapping_add(1)))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let mut reply = recv_packet(&mut framed).await?;

        // Server asked for another round with a fresh scramble
        if reply.payload.first() == Some(&0xFE) {
            let (plugin, scramble) = parse_auth_switch(&reply.payload)
                .ok_or_else(|| ConnectionError::Protocol("Invalid auth switch request".into()))?;
            if plugin != NATIVE_PASSWORD_PLUGIN {
                return Err(ConnectionError::Auth(format!(
                    "Unsupported authentication plugin '{plugin}'"
                )));
            }
            let answer = Packet::new(
                reply.sequence_id.wrapping_add(1),
                compute_auth_response(password, &scramble),
            );
            framed
                .send(answer)
                .await
                .map_err(|e| ConnectionError::Io(e.to_string()))?;
            reply = recv_packet(&mut framed).await?;
        }

        if is_err_packet(&reply.payload) {
            let message = err_message(&reply);
            error!(backend = %target, user = user, error = %message, "Backend authentication failed");
            return Err(ConnectionError::Auth(message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(ConnectionError::Protocol("Expected OK packet from backend".into()));
        }

        debug!(backend = %target, "Backend authentication successful");

        Ok(Self {
            framed,
            capabilities: caps,
            connection_id: handshake.connection_id,
        })
    }

    /// Round-trip a COM_PING
    pub async fn ping(&mut self) -> bool {
        if self.send(Packet::command(Command::Ping, &[])).await.is_err() {
            return false;
        }
        matches!(self.recv().await, Ok(packet) if is_ok_packet(&packet.payload))
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.framed
            .send(packet)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }

    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        recv_packet(&mut self.framed).await
    }

    /// Hand the framed stream to a link task
    pub fn into_framed(self) -> Framed<TcpStream, PacketCodec> {
        self.framed
    }
}

async fn recv_packet(framed: &mut Framed<TcpStream, PacketCodec>) -> Result<Packet, ConnectionError> {
    match framed.next().await {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        None => Err(ConnectionError::Disconnected),
    }
}

fn err_message(packet: &Packet) -> String {
    ErrPacket::parse(&packet.payload)
        .map(|e| e.error_message)
        .unwrap_or_else(|| "Access denied".to_string())
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection disconnected")]
    Disconnected,
}
