//! Server protocol: requests this client sends and responses it parses.

use std::net::Ipv4Addr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::protocol::{
    ConnectionType, ServerCode, UserStats, UserStatus, CLIENT_MINOR_VERSION, CLIENT_VERSION,
};
use crate::wire::{CodeWidth, DecodeError, FrameEncodeError, MessageReader, MessageWriter, OrTruncated};

/// Messages this client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    Login { username: String, password: String },
    SetWaitPort { port: u32 },
    GetPeerAddress { username: String },
    WatchUser { username: String },
    UnwatchUser { username: String },
    GetUserStatus { username: String },
    SayChatroom { room: String, message: String },
    JoinRoom { room: String, private: bool },
    LeaveRoom { room: String },
    ConnectToPeer { token: u32, username: String, conn_type: ConnectionType },
    MessageUser { username: String, message: String },
    MessageAcked { id: u32 },
    FileSearch { token: u32, query: String },
    SetStatus { status: UserStatus },
    ServerPing,
    SharedFoldersFiles { dirs: u32, files: u32 },
    GetUserStats { username: String },
    UserSearch { username: String, token: u32, query: String },
    RoomList,
    HaveNoParent(bool),
    CheckPrivileges,
    AcceptChildren(bool),
    WishlistSearch { token: u32, query: String },
    BranchLevel(u32),
    BranchRoot(String),
    ChildDepth(u32),
    CantConnectToPeer { token: u32, username: String },
}

/// Hex MD5 of username followed by password, as the login message expects.
pub fn login_hash(username: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ServerRequest {
    pub fn code(&self) -> ServerCode {
        use ServerRequest::*;
        match self {
            Login { .. } => ServerCode::Login,
            SetWaitPort { .. } => ServerCode::SetWaitPort,
            GetPeerAddress { .. } => ServerCode::GetPeerAddress,
            WatchUser { .. } => ServerCode::WatchUser,
            UnwatchUser { .. } => ServerCode::UnwatchUser,
            GetUserStatus { .. } => ServerCode::GetUserStatus,
            SayChatroom { .. } => ServerCode::SayChatroom,
            JoinRoom { .. } => ServerCode::JoinRoom,
            LeaveRoom { .. } => ServerCode::LeaveRoom,
            ConnectToPeer { .. } => ServerCode::ConnectToPeer,
            MessageUser { .. } => ServerCode::MessageUser,
            MessageAcked { .. } => ServerCode::MessageAcked,
            FileSearch { .. } => ServerCode::FileSearch,
            SetStatus { .. } => ServerCode::SetStatus,
            ServerPing => ServerCode::ServerPing,
            SharedFoldersFiles { .. } => ServerCode::SharedFoldersFiles,
            GetUserStats { .. } => ServerCode::GetUserStats,
            UserSearch { .. } => ServerCode::UserSearch,
            RoomList => ServerCode::RoomList,
            HaveNoParent(_) => ServerCode::HaveNoParent,
            CheckPrivileges => ServerCode::CheckPrivileges,
            AcceptChildren(_) => ServerCode::AcceptChildren,
            WishlistSearch { .. } => ServerCode::WishlistSearch,
            BranchLevel(_) => ServerCode::BranchLevel,
            BranchRoot(_) => ServerCode::BranchRoot,
            ChildDepth(_) => ServerCode::ChildDepth,
            CantConnectToPeer { .. } => ServerCode::CantConnectToPeer,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        use ServerRequest::*;
        let mut w = MessageWriter::new();
        match self {
            Login { username, password } => {
                w.append_string(username)
                    .append_string(password)
                    .append_u32(CLIENT_VERSION)
                    .append_string(&login_hash(username, password))
                    .append_u32(CLIENT_MINOR_VERSION);
            }
            SetWaitPort { port } => {
                w.append_u32(*port);
            }
            GetPeerAddress { username }
            | WatchUser { username }
            | UnwatchUser { username }
            | GetUserStatus { username }
            | GetUserStats { username } => {
                w.append_string(username);
            }
            SayChatroom { room, message } => {
                w.append_string(room).append_string(message);
            }
            JoinRoom { room, private } => {
                w.append_string(room).append_u32(u32::from(*private));
            }
            LeaveRoom { room } => {
                w.append_string(room);
            }
            ConnectToPeer {
                token,
                username,
                conn_type,
            } => {
                w.append_u32(*token)
                    .append_string(username)
                    .append_string(conn_type.as_str());
            }
            MessageUser { username, message } => {
                w.append_string(username).append_string(message);
            }
            MessageAcked { id } => {
                w.append_u32(*id);
            }
            FileSearch { token, query } | WishlistSearch { token, query } => {
                w.append_u32(*token).append_string(query);
            }
            SetStatus { status } => {
                w.append_u32(status.as_u32());
            }
            ServerPing | RoomList | CheckPrivileges => {}
            SharedFoldersFiles { dirs, files } => {
                w.append_u32(*dirs).append_u32(*files);
            }
            UserSearch {
                username,
                token,
                query,
            } => {
                w.append_string(username)
                    .append_u32(*token)
                    .append_string(query);
            }
            HaveNoParent(v) | AcceptChildren(v) => {
                w.append_bool(*v);
            }
            BranchLevel(v) | ChildDepth(v) => {
                w.append_u32(*v);
            }
            BranchRoot(root) => {
                w.append_string(root);
            }
            CantConnectToPeer { token, username } => {
                w.append_u32(*token).append_string(username);
            }
        }
        w.into_payload()
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, FrameEncodeError> {
        crate::wire::encode_frame(CodeWidth::U32, self.code() as u32, &self.payload())
    }
}

/// Outcome of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginReply {
    Success {
        greeting: String,
        own_ip: Ipv4Addr,
        password_hash: Option<String>,
        supporter: Option<bool>,
    },
    Failure {
        reason: String,
    },
}

/// A user as listed in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUser {
    pub username: String,
    pub status: Option<UserStatus>,
    pub stats: Option<UserStats>,
    pub slots_free: Option<u32>,
    pub country: Option<String>,
}

impl RoomUser {
    fn named(username: String) -> Self {
        Self {
            username,
            status: None,
            stats: None,
            slots_free: None,
            country: None,
        }
    }
}

/// A distributed parent candidate offered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentCandidate {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Messages the server sends to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    Login(LoginReply),
    GetPeerAddress { username: String, ip: Ipv4Addr, port: u16 },
    WatchUser { username: String, exists: bool, status: Option<UserStatus>, stats: Option<UserStats>, country: Option<String> },
    GetUserStatus { username: String, status: UserStatus, privileged: bool },
    SayChatroom { room: String, username: String, message: String },
    JoinRoom { room: String, users: Vec<RoomUser> },
    LeaveRoom { room: String },
    UserJoinedRoom { room: String, user: RoomUser },
    UserLeftRoom { room: String, username: String },
    ConnectToPeer { username: String, conn_type: ConnectionType, ip: Ipv4Addr, port: u16, token: u32, privileged: bool },
    MessageUser { id: u32, timestamp: u32, username: String, message: String, is_new: bool },
    FileSearch { username: String, token: u32, query: String },
    ServerPing,
    GetUserStats { username: String, stats: UserStats },
    Relogged,
    RoomList { rooms: Vec<(String, u32)> },
    PrivilegedUsers(Vec<String>),
    ParentMinSpeed(u32),
    ParentSpeedRatio(u32),
    CheckPrivileges { time_left: u32 },
    EmbeddedMessage { code: u8, payload: Vec<u8> },
    PossibleParents(Vec<ParentCandidate>),
    WishlistInterval(u32),
    ResetDistributed,
    ExcludedSearchPhrases(Vec<String>),
    CantConnectToPeer { token: u32 },
}

fn read_port(r: &mut MessageReader<'_>) -> Result<u16, DecodeError> {
    let port = r.read_u32().or_truncated("port")?;
    u16::try_from(port).map_err(|_| DecodeError::Invalid("port"))
}

fn read_strings(r: &mut MessageReader<'_>, field: &'static str) -> Result<Vec<String>, DecodeError> {
    let n = r.read_count(4).or_truncated(field)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(r.read_string().or_truncated(field)?);
    }
    Ok(out)
}

impl ServerResponse {
    /// Parse a server payload for `code`. Unknown codes yield `DecodeError::UnknownCode`.
    pub fn parse(code: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let code = ServerCode::try_from(code)?;
        let mut r = MessageReader::new(payload);
        let r = &mut r;
        Ok(match code {
            ServerCode::Login => Self::Login(parse_login(r)?),
            ServerCode::GetPeerAddress => Self::GetPeerAddress {
                username: r.read_string().or_truncated("username")?,
                ip: r.read_ip().or_truncated("ip")?,
                port: read_port(r)?,
            },
            ServerCode::WatchUser => parse_watch_user(r)?,
            ServerCode::GetUserStatus => Self::GetUserStatus {
                username: r.read_string().or_truncated("username")?,
                status: UserStatus::read(r)?,
                privileged: r.read_bool().unwrap_or(false),
            },
            ServerCode::SayChatroom => Self::SayChatroom {
                room: r.read_string().or_truncated("room")?,
                username: r.read_string().or_truncated("username")?,
                message: r.read_string().or_truncated("message")?,
            },
            ServerCode::JoinRoom => parse_join_room(r)?,
            ServerCode::LeaveRoom => Self::LeaveRoom {
                room: r.read_string().or_truncated("room")?,
            },
            ServerCode::UserJoinedRoom => {
                let room = r.read_string().or_truncated("room")?;
                let username = r.read_string().or_truncated("username")?;
                let status = UserStatus::read(r)?;
                let stats = UserStats::read(r)?;
                let slots_free = r.read_u32().or_truncated("slots free")?;
                let country = r.read_string();
                Self::UserJoinedRoom {
                    room,
                    user: RoomUser {
                        username,
                        status: Some(status),
                        stats: Some(stats),
                        slots_free: Some(slots_free),
                        country,
                    },
                }
            }
            ServerCode::UserLeftRoom => Self::UserLeftRoom {
                room: r.read_string().or_truncated("room")?,
                username: r.read_string().or_truncated("username")?,
            },
            ServerCode::ConnectToPeer => Self::ConnectToPeer {
                username: r.read_string().or_truncated("username")?,
                conn_type: ConnectionType::read(r)?,
                ip: r.read_ip().or_truncated("ip")?,
                port: read_port(r)?,
                token: r.read_u32().or_truncated("token")?,
                privileged: r.read_bool().unwrap_or(false),
            },
            ServerCode::MessageUser => Self::MessageUser {
                id: r.read_u32().or_truncated("message id")?,
                timestamp: r.read_u32().or_truncated("timestamp")?,
                username: r.read_string().or_truncated("username")?,
                message: r.read_string().or_truncated("message")?,
                is_new: r.read_bool().unwrap_or(true),
            },
            ServerCode::FileSearch | ServerCode::UserSearch => Self::FileSearch {
                username: r.read_string().or_truncated("username")?,
                token: r.read_u32().or_truncated("token")?,
                query: r.read_string().or_truncated("query")?,
            },
            ServerCode::ServerPing => Self::ServerPing,
            ServerCode::GetUserStats => Self::GetUserStats {
                username: r.read_string().or_truncated("username")?,
                stats: UserStats::read(r)?,
            },
            ServerCode::Relogged => Self::Relogged,
            ServerCode::RoomList => {
                let names = read_strings(r, "room name")?;
                let n = r.read_count(4).or_truncated("room user counts")?;
                let mut rooms = Vec::with_capacity(names.len());
                for (i, name) in names.into_iter().enumerate() {
                    let count = if i < n {
                        r.read_u32().or_truncated("room user count")?
                    } else {
                        0
                    };
                    rooms.push((name, count));
                }
                Self::RoomList { rooms }
            }
            ServerCode::PrivilegedUsers => Self::PrivilegedUsers(read_strings(r, "username")?),
            ServerCode::ParentMinSpeed => {
                Self::ParentMinSpeed(r.read_u32().or_truncated("speed")?)
            }
            ServerCode::ParentSpeedRatio => {
                Self::ParentSpeedRatio(r.read_u32().or_truncated("ratio")?)
            }
            ServerCode::CheckPrivileges => Self::CheckPrivileges {
                time_left: r.read_u32().or_truncated("time left")?,
            },
            ServerCode::EmbeddedMessage => Self::EmbeddedMessage {
                code: r.read_u8().or_truncated("distributed code")?,
                payload: r.rest().to_vec(),
            },
            ServerCode::PossibleParents => {
                // username(4) + ip(4) + port(4)
                let n = r.read_count(12).or_truncated("parent count")?;
                let mut parents = Vec::with_capacity(n);
                for _ in 0..n {
                    parents.push(ParentCandidate {
                        username: r.read_string().or_truncated("parent username")?,
                        ip: r.read_ip().or_truncated("parent ip")?,
                        port: read_port(r)?,
                    });
                }
                Self::PossibleParents(parents)
            }
            ServerCode::WishlistInterval => {
                Self::WishlistInterval(r.read_u32().or_truncated("interval")?)
            }
            ServerCode::ResetDistributed => Self::ResetDistributed,
            ServerCode::ExcludedSearchPhrases => {
                Self::ExcludedSearchPhrases(read_strings(r, "phrase")?)
            }
            ServerCode::CantConnectToPeer => Self::CantConnectToPeer {
                token: r.read_u32().or_truncated("token")?,
            },
            // Codes we only ever send.
            ServerCode::SetWaitPort
            | ServerCode::UnwatchUser
            | ServerCode::MessageAcked
            | ServerCode::SetStatus
            | ServerCode::SharedFoldersFiles
            | ServerCode::HaveNoParent
            | ServerCode::AcceptChildren
            | ServerCode::WishlistSearch
            | ServerCode::BranchLevel
            | ServerCode::BranchRoot
            | ServerCode::ChildDepth => return Err(DecodeError::UnknownCode(code as u32)),
        })
    }
}

fn parse_login(r: &mut MessageReader<'_>) -> Result<LoginReply, DecodeError> {
    if r.read_bool().or_truncated("login success")? {
        Ok(LoginReply::Success {
            greeting: r.read_string().or_truncated("greeting")?,
            own_ip: r.read_ip().or_truncated("own ip")?,
            password_hash: r.read_string(),
            supporter: r.read_bool(),
        })
    } else {
        Ok(LoginReply::Failure {
            reason: r.read_string().or_truncated("login failure reason")?,
        })
    }
}

fn parse_watch_user(r: &mut MessageReader<'_>) -> Result<ServerResponse, DecodeError> {
    let username = r.read_string().or_truncated("username")?;
    let exists = r.read_bool().or_truncated("exists")?;
    if !exists {
        return Ok(ServerResponse::WatchUser {
            username,
            exists,
            status: None,
            stats: None,
            country: None,
        });
    }
    let status = UserStatus::read(r)?;
    let stats = UserStats::read(r)?;
    let country = if status == UserStatus::Offline {
        None
    } else {
        r.read_string()
    };
    Ok(ServerResponse::WatchUser {
        username,
        exists,
        status: Some(status),
        stats: Some(stats),
        country,
    })
}

/// Room join reply: parallel arrays of names, statuses, stats, free slots and countries.
/// Only the names are mandatory; later sections fill in what is present.
fn parse_join_room(r: &mut MessageReader<'_>) -> Result<ServerResponse, DecodeError> {
    let room = r.read_string().or_truncated("room")?;
    let mut users: Vec<RoomUser> = read_strings(r, "room user")?
        .into_iter()
        .map(RoomUser::named)
        .collect();

    if let Some(n) = r.read_count(4) {
        for user in users.iter_mut().take(n) {
            user.status = r.read_u32().and_then(UserStatus::from_u32);
        }
    }
    if let Some(n) = r.read_count(20) {
        for user in users.iter_mut().take(n) {
            let mut stats_reader = r.clone();
            match UserStats::read(&mut stats_reader) {
                Ok(stats) => {
                    user.stats = Some(stats);
                    *r = stats_reader;
                }
                Err(_) => break,
            }
        }
    }
    if let Some(n) = r.read_count(4) {
        for user in users.iter_mut().take(n) {
            user.slots_free = r.read_u32();
        }
    }
    if let Some(n) = r.read_count(4) {
        for user in users.iter_mut().take(n) {
            user.country = r.read_string();
        }
    }
    Ok(ServerResponse::JoinRoom { room, users })
}
