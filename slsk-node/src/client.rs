//! The client: one server session plus the peer listener, connection queue, distributed network
//! and peer service, driven from a single select loop. Applications talk to it through
//! `ClientHandle` and read `Event`s.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use slsk_core::server::LoginReply;
use slsk_core::{
    ConnectionType, DistributedTree, Event, PeerMessage, ResultFilter, ServerRequest,
    ServerResponse, ShareIndex, UserStatus,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, ConfigError};
use crate::connection::PeerConnection;
use crate::distributed::DistributedNetwork;
use crate::listener::Listener;
use crate::peers::{PeerService, PeerServiceConfig};
use crate::pool::{ConnectQueue, ConnectRequest, ConnectionPool, PoolError};
use crate::race::{PeerDialer, PierceRegistry, SearchResponder};
use crate::resolver::ServerResolver;
use crate::search::LocalSearch;
use crate::server::{ServerError, ServerHandle, ServerSession};

const EVENT_CAPACITY: usize = 256;
const INCOMING_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("server: {0}")]
    Server(#[from] ServerError),
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("binding listen port: {0}")]
    Listen(#[source] std::io::Error),
    #[error("client is not running")]
    Closed,
}

/// What the application can ask the running client to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Search { token: u32, query: String },
    JoinRoom { room: String, private: bool },
    LeaveRoom { room: String },
    Say { room: String, message: String },
    MessageUser { username: String, message: String },
    WatchUser { username: String },
    GetUserInfo { username: String },
    /// Answer a TransferRequest surfaced as `Event::PeerRequest`. `deny` carries the reason.
    AnswerTransfer {
        username: String,
        token: u32,
        size: Option<u64>,
        deny: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.tx.send(command).map_err(|_| ClientError::Closed)
    }

    /// Start a network-wide search. Results arrive as `Event::SearchResults` with this token.
    pub fn search(&self, query: impl Into<String>) -> Result<u32, ClientError> {
        let token: u32 = rand::random();
        self.send(Command::Search {
            token,
            query: query.into(),
        })?;
        Ok(token)
    }

    pub fn join_room(&self, room: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::JoinRoom {
            room: room.into(),
            private: false,
        })
    }

    pub fn leave_room(&self, room: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::LeaveRoom { room: room.into() })
    }

    pub fn say(&self, room: impl Into<String>, message: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::Say {
            room: room.into(),
            message: message.into(),
        })
    }

    pub fn message_user(
        &self,
        username: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.send(Command::MessageUser {
            username: username.into(),
            message: message.into(),
        })
    }

    pub fn watch_user(&self, username: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::WatchUser {
            username: username.into(),
        })
    }

    /// Ask a peer for its user info. The answer arrives as `Event::UserInfo`.
    pub fn get_user_info(&self, username: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::GetUserInfo {
            username: username.into(),
        })
    }

    pub fn answer_transfer(
        &self,
        username: impl Into<String>,
        token: u32,
        size: Option<u64>,
        deny: Option<String>,
    ) -> Result<(), ClientError> {
        self.send(Command::AnswerTransfer {
            username: username.into(),
            token,
            size,
            deny,
        })
    }
}

pub struct Client {
    config: Config,
    shares: Arc<dyn ShareIndex>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<Event>,
}

impl Client {
    pub fn new(config: Config, shares: Arc<dyn ShareIndex>) -> (Self, ClientHandle, mpsc::Receiver<Event>) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        (
            Self {
                config,
                shares,
                commands,
                events,
            },
            ClientHandle { tx },
            events_rx,
        )
    }

    /// Log in and serve until the server drops us, another login replaces us, or every
    /// `ClientHandle` is gone.
    pub async fn run(self) -> Result<(), ClientError> {
        let Client {
            config,
            shares,
            mut commands,
            events,
        } = self;
        config.validate()?;

        let mut session =
            ServerSession::connect(&config.server_host, config.server_port, config.connect_timeout())
                .await?;
        match session
            .login(&config.username, &config.password, config.connect_timeout())
            .await?
        {
            LoginReply::Success {
                greeting, own_ip, ..
            } => {
                info!(username = %config.username, %own_ip, "logged in");
                emit(&events, Event::LoggedIn { greeting, own_ip });
            }
            LoginReply::Failure { reason } => {
                warn!(%reason, "login rejected");
                emit(
                    &events,
                    Event::LoginFailed {
                        reason: reason.clone(),
                    },
                );
                return Err(ClientError::LoginRejected(reason));
            }
        }

        let (server, server_rx) = ServerHandle::channel();
        let node = Node::build(&config, shares, server.clone(), events.clone());

        let (incoming_tx, mut incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let listener = Listener::bind(
            config.listen_port,
            config.handshake_timeout(),
            node.registry.clone(),
            incoming_tx,
        )
        .await
        .map_err(ClientError::Listen)?;
        let listen_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(config.listen_port);
        let listener_task = tokio::spawn(listener.run());

        let (dirs, files) = node.search.shares().counts();
        for request in [
            ServerRequest::SetWaitPort {
                port: u32::from(listen_port),
            },
            ServerRequest::SetStatus {
                status: UserStatus::Online,
            },
            ServerRequest::SharedFoldersFiles { dirs, files },
            ServerRequest::HaveNoParent(true),
            ServerRequest::AcceptChildren(true),
        ] {
            server.send(request)?;
        }

        let (responses_tx, mut responses_rx) = mpsc::channel(EVENT_CAPACITY);
        let mut session_task =
            tokio::spawn(session.run(server_rx, responses_tx, config.ping_interval()));

        let (queue, queue_task) = ConnectQueue::spawn(
            node.pool.clone(),
            config.connect_queue_capacity,
            config.connect_queue_interval(),
            {
                let node = node.clone();
                move |request| {
                    let node = node.clone();
                    async move { node.dial_relayed(request).await }
                }
            },
        );

        let result = loop {
            tokio::select! {
                response = responses_rx.recv() => match response {
                    Some(response) => {
                        if !node.on_server(&queue, response) {
                            break Ok(());
                        }
                    }
                    None => {
                        break match (&mut session_task).await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(ClientError::Server(e)),
                            Err(_) => Err(ClientError::Server(ServerError::Closed)),
                        };
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => node.on_command(command),
                    None => {
                        info!("all client handles dropped; shutting down");
                        break Ok(());
                    }
                },
                Some(conn) = incoming_rx.recv() => node.route(conn),
            }
        };

        session_task.abort();
        listener_task.abort();
        queue_task.abort();
        result
    }
}

fn emit(events: &mpsc::Sender<Event>, event: Event) {
    if events.try_send(event).is_err() {
        debug!("event channel full or closed; dropping event");
    }
}

/// Everything the select loop and the connect-queue worker share.
#[derive(Clone)]
struct Node {
    own_username: String,
    server: ServerHandle,
    resolver: Arc<ServerResolver>,
    registry: Arc<PierceRegistry>,
    pool: Arc<ConnectionPool>,
    search: Arc<LocalSearch>,
    peers: Arc<PeerService>,
    distributed: Arc<DistributedNetwork>,
    events: mpsc::Sender<Event>,
    connect_timeout: Duration,
}

impl Node {
    fn build(
        config: &Config,
        shares: Arc<dyn ShareIndex>,
        server: ServerHandle,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let own = config.username.clone();
        let resolver = Arc::new(ServerResolver::new(server.clone(), config.resolve_timeout()));
        let registry = PierceRegistry::new();
        let pool = Arc::new(ConnectionPool::new(own.clone()));
        let dialer = Arc::new(PeerDialer::new(
            own.clone(),
            pool.clone(),
            registry.clone(),
            resolver.clone(),
            server.clone(),
            config.connect_timeout(),
            config.search_response_timeout(),
        ));
        let filter = ResultFilter {
            min_query_length: config.min_query_length,
            max_results: config.max_search_results,
            excluded_phrases: Vec::new(),
        };
        let search = Arc::new(LocalSearch::new(
            own.clone(),
            shares.clone(),
            filter,
            Arc::new(SearchResponder::new(dialer.clone())),
        ));
        let peers = PeerService::new(
            shares,
            pool.clone(),
            dialer,
            events.clone(),
            PeerServiceConfig {
                description: config.description.clone(),
                transfer_reply_includes_size: config.transfer_reply_includes_size,
            },
        );
        let distributed = DistributedNetwork::new(
            DistributedTree::with_limits(own.clone(), config.max_children, config.max_parent_attempts),
            server.clone(),
            search.clone(),
            events.clone(),
            config.distributed_connect_timeout(),
        );
        Self {
            own_username: own,
            server,
            resolver,
            registry,
            pool,
            search,
            peers,
            distributed,
            events,
            connect_timeout: config.connect_timeout(),
        }
    }

    fn emit(&self, event: Event) {
        emit(&self.events, event);
    }

    fn to_server(&self, request: ServerRequest) {
        if let Err(e) = self.server.send(request) {
            debug!(error = %e, "server writer gone");
        }
    }

    /// Handle one server message. `false` means stop the client.
    fn on_server(&self, queue: &ConnectQueue, response: ServerResponse) -> bool {
        match response {
            ServerResponse::GetPeerAddress { username, ip, port } => {
                self.resolver.on_peer_address(&username, ip, port);
            }
            ServerResponse::WatchUser {
                username,
                status,
                stats,
                ..
            } => {
                if let Some(status) = status {
                    self.emit(Event::UserStatus {
                        username: username.clone(),
                        status,
                        privileged: false,
                    });
                }
                if let Some(stats) = stats {
                    self.emit(Event::UserStats { username, stats });
                }
            }
            ServerResponse::GetUserStatus {
                username,
                status,
                privileged,
            } => self.emit(Event::UserStatus {
                username,
                status,
                privileged,
            }),
            ServerResponse::GetUserStats { username, stats } => {
                self.emit(Event::UserStats { username, stats })
            }
            ServerResponse::SayChatroom {
                room,
                username,
                message,
            } => self.emit(Event::RoomMessage {
                room,
                username,
                message,
            }),
            ServerResponse::JoinRoom { room, users } => self.emit(Event::RoomJoined { room, users }),
            ServerResponse::LeaveRoom { room } => self.emit(Event::RoomLeft { room }),
            ServerResponse::UserJoinedRoom { room, user } => {
                self.emit(Event::UserJoinedRoom { room, user })
            }
            ServerResponse::UserLeftRoom { room, username } => {
                self.emit(Event::UserLeftRoom { room, username })
            }
            ServerResponse::ConnectToPeer {
                username,
                conn_type,
                ip,
                port,
                token,
                ..
            } => {
                let request = ConnectRequest {
                    username,
                    addr: SocketAddr::from((ip, port)),
                    token,
                    conn_type,
                    indirect: true,
                };
                if let Err(e) = queue.enqueue(request) {
                    debug!(error = %e, "relayed connect request dropped");
                }
            }
            ServerResponse::MessageUser {
                id,
                timestamp,
                username,
                message,
                ..
            } => {
                self.to_server(ServerRequest::MessageAcked { id });
                self.emit(Event::PrivateMessage {
                    id,
                    timestamp,
                    username,
                    message,
                });
            }
            ServerResponse::FileSearch {
                username,
                token,
                query,
            } => {
                if username != self.own_username {
                    self.search.answer(username, token, &query);
                }
            }
            ServerResponse::Relogged => {
                warn!("logged in from another client; stopping");
                self.emit(Event::Relogged);
                return false;
            }
            ServerResponse::EmbeddedMessage { code, payload } => {
                self.distributed.on_embedded_message(code, &payload);
            }
            ServerResponse::PossibleParents(candidates) => {
                self.distributed.on_possible_parents(&candidates);
            }
            ServerResponse::ResetDistributed => self.distributed.on_reset(),
            ServerResponse::ExcludedSearchPhrases(phrases) => {
                self.search.set_excluded_phrases(phrases);
            }
            ServerResponse::CantConnectToPeer { token } => {
                debug!(token, "server could not relay our connect request");
            }
            ServerResponse::ServerPing => trace!("server ping"),
            other => debug!(?other, "unhandled server message"),
        }
        true
    }

    fn on_command(&self, command: Command) {
        match command {
            Command::Search { token, query } => {
                info!(token, %query, "searching");
                self.to_server(ServerRequest::FileSearch { token, query });
            }
            Command::JoinRoom { room, private } => {
                self.to_server(ServerRequest::JoinRoom { room, private })
            }
            Command::LeaveRoom { room } => self.to_server(ServerRequest::LeaveRoom { room }),
            Command::Say { room, message } => {
                self.to_server(ServerRequest::SayChatroom { room, message })
            }
            Command::MessageUser { username, message } => {
                self.to_server(ServerRequest::MessageUser { username, message })
            }
            Command::WatchUser { username } => self.to_server(ServerRequest::WatchUser { username }),
            Command::GetUserInfo { username } => {
                self.peers.send_to(&username, PeerMessage::UserInfoRequest)
            }
            Command::AnswerTransfer {
                username,
                token,
                size,
                deny,
            } => self.peers.answer_transfer(&username, token, size, deny),
        }
    }

    /// Hand an established connection to whatever serves its type.
    fn route(&self, conn: PeerConnection) {
        match conn.identity().conn_type {
            ConnectionType::Peer => {
                tokio::spawn(self.peers.clone().serve(conn));
            }
            ConnectionType::Distributed => self.distributed.add_child(conn),
            ConnectionType::File => {
                debug!(peer = %conn.username(), "file connections are not served; closing");
            }
        }
    }

    /// Dial back a peer the server told us about. On failure the server is told so it can have
    /// the peer try the other direction.
    async fn dial_relayed(&self, request: ConnectRequest) {
        match self.pool.connect(&request, self.connect_timeout).await {
            Ok(conn) => self.route(conn),
            Err(PoolError::Duplicate(username, token)) => {
                trace!(%username, token, "relayed connect already in flight");
            }
            Err(e) => {
                debug!(username = %request.username, token = request.token, error = %e, "relayed connect failed");
                self.to_server(ServerRequest::CantConnectToPeer {
                    token: request.token,
                    username: request.username.clone(),
                });
                self.emit(Event::ConnectionFailed {
                    username: request.username,
                    token: request.token,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slsk_core::InMemoryShareIndex;

    #[test]
    fn handle_queues_commands() {
        let (client, handle, _events) = Client::new(Config::default(), Arc::new(InMemoryShareIndex::new()));
        let mut commands = client.commands;
        let token = handle.search("free jazz").unwrap();
        handle.join_room("nicotine").unwrap();
        handle.get_user_info("alice").unwrap();
        assert_eq!(
            commands.try_recv().unwrap(),
            Command::Search {
                token,
                query: "free jazz".into()
            }
        );
        assert_eq!(
            commands.try_recv().unwrap(),
            Command::JoinRoom {
                room: "nicotine".into(),
                private: false
            }
        );
        assert_eq!(
            commands.try_recv().unwrap(),
            Command::GetUserInfo {
                username: "alice".into()
            }
        );
    }

    #[test]
    fn handle_reports_stopped_client() {
        let (client, handle, _events) = Client::new(Config::default(), Arc::new(InMemoryShareIndex::new()));
        drop(client);
        assert!(matches!(handle.say("room", "hi"), Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_connecting() {
        let (client, _handle, _events) = Client::new(Config::default(), Arc::new(InMemoryShareIndex::new()));
        assert!(matches!(client.run().await, Err(ClientError::Config(_))));
    }
}
