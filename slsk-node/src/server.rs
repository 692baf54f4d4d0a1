//! Server session: connect, login, then a read loop plus a writer task that owns the write half.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slsk_core::protocol::ServerCode;
use slsk_core::server::LoginReply;
use slsk_core::wire::{CodeWidth, DecodeError, FrameEncodeError};
use slsk_core::{Dispatch, HandlerTable, ServerRequest, ServerResponse};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::codec::{CodecError, FrameCodec};

/// Server codes this client parses. Everything else is skipped by the handler table.
const INBOUND_CODES: &[ServerCode] = &[
    ServerCode::Login,
    ServerCode::GetPeerAddress,
    ServerCode::WatchUser,
    ServerCode::GetUserStatus,
    ServerCode::SayChatroom,
    ServerCode::JoinRoom,
    ServerCode::LeaveRoom,
    ServerCode::UserJoinedRoom,
    ServerCode::UserLeftRoom,
    ServerCode::ConnectToPeer,
    ServerCode::MessageUser,
    ServerCode::FileSearch,
    ServerCode::ServerPing,
    ServerCode::GetUserStats,
    ServerCode::Relogged,
    ServerCode::UserSearch,
    ServerCode::RoomList,
    ServerCode::PrivilegedUsers,
    ServerCode::ParentMinSpeed,
    ServerCode::ParentSpeedRatio,
    ServerCode::CheckPrivileges,
    ServerCode::EmbeddedMessage,
    ServerCode::PossibleParents,
    ServerCode::WishlistInterval,
    ServerCode::ResetDistributed,
    ServerCode::ExcludedSearchPhrases,
    ServerCode::CantConnectToPeer,
];

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out connecting to server")]
    ConnectTimeout,
    #[error("timed out waiting for login reply")]
    LoginTimeout,
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("bad login reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("server connection closed")]
    Closed,
}

/// Cheap, cloneable sink for outbound server messages.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerRequest>,
}

impl ServerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, request: ServerRequest) -> Result<(), ServerError> {
        self.tx.send(request).map_err(|_| ServerError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Table that turns server frames into typed responses, one handler per inbound code.
pub fn server_handlers() -> HandlerTable<Vec<ServerResponse>> {
    let mut table = HandlerTable::new();
    for &code in INBOUND_CODES {
        let code = code as u32;
        table.register(code, move |out: &mut Vec<ServerResponse>, payload: &[u8]| {
            out.push(ServerResponse::parse(code, payload)?);
            Ok(())
        });
    }
    table
}

pub struct ServerSession {
    framed: Framed<TcpStream, FrameCodec>,
}

impl ServerSession {
    #[instrument(skip(timeout))]
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ServerError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ServerError::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        info!(host, port, "connected to server");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new(CodeWidth::U32)),
        }
    }

    /// Send Login and wait for its reply. Frames that arrive first are skipped.
    #[instrument(skip(self, password, timeout))]
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<LoginReply, ServerError> {
        let frame = ServerRequest::Login {
            username: username.to_owned(),
            password: password.to_owned(),
        }
        .to_frame()?;
        self.framed.send(frame).await?;
        let wait = async {
            while let Some(frame) = self.framed.next().await {
                let frame = frame?;
                if frame.code != ServerCode::Login as u32 {
                    debug!(code = frame.code, "skipping frame before login reply");
                    continue;
                }
                if let ServerResponse::Login(reply) = ServerResponse::parse(frame.code, &frame.payload)? {
                    return Ok(reply);
                }
            }
            Err(ServerError::Closed)
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ServerError::LoginTimeout)?
    }

    /// Pump the session until the server or the client goes away.
    /// Outbound requests and the keepalive ping go through a writer task that owns the write half.
    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<ServerRequest>,
        responses: mpsc::Sender<ServerResponse>,
        ping_interval: Duration,
    ) -> Result<(), ServerError> {
        let (mut sink, mut stream) = self.framed.split();

        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_interval);
            // First tick is immediate; the server does not need a ping right after login.
            ping.tick().await;
            loop {
                let request = tokio::select! {
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                    _ = ping.tick() => ServerRequest::ServerPing,
                };
                let code = request.code();
                let frame = match request.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(?code, error = %e, "dropping unencodable server request");
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "server write failed");
                    break;
                }
                debug!(?code, "sent server message");
            }
        });

        let table = server_handlers();
        let mut parsed = Vec::new();
        let result = loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(ServerError::from(e)),
                None => break Err(ServerError::Closed),
            };
            match table.dispatch(&mut parsed, frame.code, &frame.payload) {
                Dispatch::Handled | Dispatch::Unknown(_) => {}
                Dispatch::Malformed(code, e) => {
                    warn!(code, error = %e, "dropping malformed server message");
                }
            }
            let mut client_gone = false;
            for response in parsed.drain(..) {
                if responses.send(response).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            if client_gone {
                break Ok(());
            }
        };
        writer.abort();
        info!("server session ended");
        result
    }
}
