//! Peer connection lifecycle: `Connecting`/`AwaitingHandshake` → `Established` → `Disconnected`.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slsk_core::wire::{CodeWidth, DecodeError, Frame};
use slsk_core::{ConnectionType, PeerInitMessage};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::codec::{CodecError, FrameCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Outbound dial in progress.
    Connecting,
    /// Inbound socket accepted; waiting for the opening message.
    AwaitingHandshake,
    Established,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Who is on the other end, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub username: String,
    pub conn_type: ConnectionType,
    pub token: u32,
}

impl PeerIdentity {
    pub fn new(username: impl Into<String>, conn_type: ConnectionType, token: u32) -> Self {
        Self {
            username: username.into(),
            conn_type,
            token,
        }
    }
}

/// How an inbound connection opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opening {
    PeerInit,
    /// Answer to a ConnectToPeer we asked the server to relay. The peer's name is not sent;
    /// whoever registered `token` knows it.
    PierceFirewall { token: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out connecting")]
    ConnectTimeout,
    #[error("no opening message within the handshake timeout")]
    HandshakeTimeout,
    #[error("bad opening message: {0}")]
    Handshake(#[source] DecodeError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("connection closed")]
    Closed,
    #[error("connection not established")]
    NotEstablished,
    #[error("could not resolve peer: {0}")]
    Resolve(#[from] crate::resolver::ResolveError),
}

/// Width of message codes after the opening message.
fn width_for(conn_type: ConnectionType) -> CodeWidth {
    match conn_type {
        ConnectionType::Distributed => CodeWidth::U8,
        ConnectionType::Peer | ConnectionType::File => CodeWidth::U32,
    }
}

pub struct PeerConnection {
    identity: PeerIdentity,
    addr: SocketAddr,
    direction: Direction,
    state: HandshakeState,
    framed: Option<Framed<TcpStream, FrameCodec>>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("identity", &self.identity)
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish()
    }
}

impl PeerConnection {
    async fn dial(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ConnectionError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn outgoing(stream: TcpStream, addr: SocketAddr, identity: PeerIdentity) -> Self {
        Self {
            identity,
            addr,
            direction: Direction::Outgoing,
            state: HandshakeState::Connecting,
            framed: Some(Framed::new(stream, FrameCodec::peer_init())),
        }
    }

    /// Dial `addr` and open with PeerInit carrying our own name.
    #[instrument(skip(own_username, timeout), fields(peer = %identity.username))]
    pub async fn connect_direct(
        addr: SocketAddr,
        own_username: &str,
        identity: PeerIdentity,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let stream = Self::dial(addr, timeout).await?;
        let mut conn = Self::outgoing(stream, addr, identity);
        let opening = PeerInitMessage::PeerInit {
            username: own_username.to_owned(),
            conn_type: conn.identity.conn_type,
            token: conn.identity.token,
        };
        conn.open(opening).await?;
        Ok(conn)
    }

    /// Dial `addr` after a server-relayed ConnectToPeer and open with PierceFirewall.
    #[instrument(skip(timeout), fields(peer = %identity.username))]
    pub async fn connect_indirect(
        addr: SocketAddr,
        identity: PeerIdentity,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let stream = Self::dial(addr, timeout).await?;
        let mut conn = Self::outgoing(stream, addr, identity);
        let opening = PeerInitMessage::PierceFirewall {
            token: conn.identity.token,
        };
        conn.open(opening).await?;
        Ok(conn)
    }

    async fn open(&mut self, opening: PeerInitMessage) -> Result<(), ConnectionError> {
        let frame = opening.to_frame().map_err(CodecError::from)?;
        let result = match self.framed.as_mut() {
            Some(framed) => framed.send(frame).await.map_err(ConnectionError::from),
            None => Err(ConnectionError::Closed),
        };
        match result {
            Ok(()) => {
                self.establish();
                Ok(())
            }
            Err(e) => {
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Classify an accepted socket by its opening message.
    /// No valid opening within `timeout` closes the socket.
    #[instrument(skip(stream, timeout))]
    pub async fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<(Self, Opening), ConnectionError> {
        stream.set_nodelay(true)?;
        let mut conn = Self {
            identity: PeerIdentity::new(String::new(), ConnectionType::Peer, 0),
            addr,
            direction: Direction::Incoming,
            state: HandshakeState::AwaitingHandshake,
            framed: Some(Framed::new(stream, FrameCodec::peer_init())),
        };
        let first = tokio::time::timeout(timeout, conn.next_frame()).await;
        let frame = match first {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                conn.disconnect();
                return Err(ConnectionError::Closed);
            }
            Ok(Err(e)) => {
                conn.disconnect();
                return Err(e);
            }
            Err(_) => {
                conn.disconnect();
                return Err(ConnectionError::HandshakeTimeout);
            }
        };
        let opening = match PeerInitMessage::parse(frame.code, &frame.payload) {
            Ok(PeerInitMessage::PeerInit {
                username,
                conn_type,
                token,
            }) => {
                conn.identity = PeerIdentity::new(username, conn_type, token);
                Opening::PeerInit
            }
            Ok(PeerInitMessage::PierceFirewall { token }) => {
                conn.identity.token = token;
                Opening::PierceFirewall { token }
            }
            Err(e) => {
                conn.disconnect();
                return Err(ConnectionError::Handshake(e));
            }
        };
        conn.establish();
        Ok((conn, opening))
    }

    fn establish(&mut self) {
        let width = width_for(self.identity.conn_type);
        if let Some(framed) = self.framed.as_mut() {
            framed.codec_mut().set_width(width);
        }
        self.state = HandshakeState::Established;
        debug!(peer = %self.identity.username, addr = %self.addr, conn_type = ?self.identity.conn_type, "peer connection established");
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        let Some(framed) = self.framed.as_mut() else {
            return Ok(None);
        };
        match framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Fill in who is behind a PierceFirewall connection once the token is matched.
    pub fn set_identity(&mut self, identity: PeerIdentity) {
        let width = width_for(identity.conn_type);
        self.identity = identity;
        if let Some(framed) = self.framed.as_mut() {
            framed.codec_mut().set_width(width);
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Send a frame built by a message catalog.
    pub async fn send(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.state != HandshakeState::Established {
            return Err(ConnectionError::NotEstablished);
        }
        let Some(framed) = self.framed.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        if let Err(e) = framed.send(frame).await {
            self.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    /// Next frame, or `None` once the peer closed. Errors close the connection.
    pub async fn recv(&mut self) -> Result<Option<Frame>, ConnectionError> {
        if self.state != HandshakeState::Established {
            return Err(ConnectionError::NotEstablished);
        }
        match self.next_frame().await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.disconnect();
                Ok(None)
            }
            Err(e) => {
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Close the socket. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if self.state == HandshakeState::Disconnected {
            return;
        }
        self.state = HandshakeState::Disconnected;
        if self.framed.take().is_some() {
            debug!(peer = %self.identity.username, addr = %self.addr, "peer connection closed");
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slsk_core::PeerMessage;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        (l, addr)
    }

    #[tokio::test]
    async fn direct_handshake_and_exchange() {
        let (l, addr) = listener().await;
        let accept = tokio::spawn(async move {
            let (stream, from) = l.accept().await.unwrap();
            PeerConnection::accept(stream, from, Duration::from_secs(5))
                .await
                .unwrap()
        });
        let mut out = PeerConnection::connect_direct(
            addr,
            "me",
            PeerIdentity::new("them", ConnectionType::Peer, 42),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.state(), HandshakeState::Established);
        assert_eq!(out.direction(), Direction::Outgoing);

        let (mut inc, opening) = accept.await.unwrap();
        assert_eq!(opening, Opening::PeerInit);
        assert_eq!(inc.identity(), &PeerIdentity::new("me", ConnectionType::Peer, 42));
        assert_eq!(inc.direction(), Direction::Incoming);

        out.send(PeerMessage::GetShareFileList.to_frame().unwrap())
            .await
            .unwrap();
        let frame = inc.recv().await.unwrap().unwrap();
        assert_eq!(frame.code, 4);

        out.disconnect();
        out.disconnect();
        assert_eq!(out.state(), HandshakeState::Disconnected);
        assert!(inc.recv().await.unwrap().is_none());
        assert_eq!(inc.state(), HandshakeState::Disconnected);
        assert!(matches!(
            inc.send(vec![]).await,
            Err(ConnectionError::NotEstablished)
        ));
    }

    #[tokio::test]
    async fn pierce_firewall_opening() {
        let (l, addr) = listener().await;
        let accept = tokio::spawn(async move {
            let (stream, from) = l.accept().await.unwrap();
            PeerConnection::accept(stream, from, Duration::from_secs(5))
                .await
                .unwrap()
        });
        let _out = PeerConnection::connect_indirect(
            addr,
            PeerIdentity::new("them", ConnectionType::Distributed, 7),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let (mut inc, opening) = accept.await.unwrap();
        assert_eq!(opening, Opening::PierceFirewall { token: 7 });
        assert_eq!(inc.username(), "");
        inc.set_identity(PeerIdentity::new("them", ConnectionType::Distributed, 7));
        assert_eq!(inc.username(), "them");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_handshake_timeout() {
        let (l, addr) = listener().await;
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, from) = l.accept().await.unwrap();
        let err = PeerConnection::accept(stream, from, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::HandshakeTimeout));
    }

    #[tokio::test]
    async fn garbage_opening_rejected() {
        let (l, addr) = listener().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, from) = l.accept().await.unwrap();
        // Length 2, code 9 (not an opening code).
        client.write_all(&[2, 0, 0, 0, 9, 0]).await.unwrap();
        let err = PeerConnection::accept(stream, from, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Handshake(DecodeError::UnknownCode(9))
        ));
    }

    #[tokio::test]
    async fn refused_dial_is_error() {
        let (l, addr) = listener().await;
        drop(l);
        let res = PeerConnection::connect_direct(
            addr,
            "me",
            PeerIdentity::new("them", ConnectionType::Peer, 1),
            Duration::from_secs(5),
        )
        .await;
        assert!(res.is_err());
    }
}
